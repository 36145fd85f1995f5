extern crate serde;
#[macro_use]
extern crate serde_derive;

pub mod error;
pub mod linetable;
pub mod runtime;
pub mod sample;
pub mod vm;
pub mod walker;

pub mod greenlets;
pub mod native;
mod signals;
pub mod tasks;
pub mod threads;

mod sampler;
pub mod scheduler;
pub mod one_shot_scheduler;
pub mod timer_thread_scheduler;

pub mod memory;
pub mod serialization;
pub mod where_dump;

pub mod attach;
pub mod session;
mod util;

pub use error::{Error, Result};
pub use session::configuration::Configuration;
pub use session::Session;

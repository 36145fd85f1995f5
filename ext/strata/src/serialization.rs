pub mod format;
pub mod reader;
pub mod writer;

pub use format::{Header, Mode, Record};
pub use reader::StreamReader;
pub use writer::{RecordSender, StreamWriter};

use crate::error::Result;

/// Decides when captures happen.
pub trait Scheduler: Send {
    fn start(&mut self) -> Result<()>;
    /// Stops capturing and waits for in-flight work. Calling it twice is harmless.
    fn stop(&mut self) -> Result<()>;
}

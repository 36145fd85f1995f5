use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::sampler::Sampler;
use crate::scheduler::Scheduler;
use crate::where_dump;

/// How long the dump waits for the reading end of the channel.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_INTERVAL: Duration = Duration::from_millis(5);

/// Captures every thread exactly once and writes the rendered dump to a
/// delivery channel ("where" mode).
pub struct OneShotScheduler {
    sampler: Option<Sampler>,
    channel: PathBuf,
    delivered: Arc<AtomicBool>,
    stop_requested: Arc<AtomicBool>,
    handle: Option<JoinHandle<io::Result<()>>>,
}

impl OneShotScheduler {
    pub(crate) fn new(sampler: Sampler, channel: PathBuf) -> Self {
        Self {
            sampler: Some(sampler),
            channel,
            delivered: Arc::new(AtomicBool::new(false)),
            stop_requested: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    pub fn delivered(&self) -> bool {
        self.delivered.load(Ordering::Acquire)
    }

    fn deliver(
        mut sampler: Sampler,
        channel: PathBuf,
        delivered: Arc<AtomicBool>,
        stop_requested: Arc<AtomicBool>,
    ) -> io::Result<()> {
        let text = where_dump::render(std::process::id(), &sampler.capture_all());
        let deadline = Instant::now() + DELIVERY_TIMEOUT;
        let mut out = open_channel(&channel, deadline, &stop_requested)?;
        let mut remaining = text.as_bytes();
        while !remaining.is_empty() {
            match out.write(remaining) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => remaining = &remaining[n..],
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => wait_for_reader(deadline, &stop_requested)?,
                Err(e) => return Err(e),
            }
        }
        delivered.store(true, Ordering::Release);
        log::debug!("Delivered {} bytes to {}", text.len(), channel.display());
        Ok(())
    }
}

/// Opens the writing end without blocking. A fifo with no reader yet
/// reports ENXIO, so the open is retried until `deadline` or a stop.
fn open_channel(channel: &Path, deadline: Instant, stop_requested: &AtomicBool) -> io::Result<File> {
    loop {
        match OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(channel)
        {
            Ok(file) => return Ok(file),
            Err(e) if e.raw_os_error() == Some(libc::ENXIO) => wait_for_reader(deadline, stop_requested)?,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

fn wait_for_reader(deadline: Instant, stop_requested: &AtomicBool) -> io::Result<()> {
    if stop_requested.load(Ordering::Acquire) {
        return Err(io::Error::new(ErrorKind::Interrupted, "stopped before the dump was read"));
    }
    if Instant::now() >= deadline {
        return Err(io::Error::new(ErrorKind::TimedOut, "no reader on the where channel"));
    }
    thread::sleep(RETRY_INTERVAL);
    Ok(())
}

impl Scheduler for OneShotScheduler {
    fn start(&mut self) -> Result<()> {
        let Some(sampler) = self.sampler.take() else {
            return Err(Error::AlreadyRunning);
        };
        let channel = self.channel.clone();
        let delivered = Arc::clone(&self.delivered);
        let stop_requested = Arc::clone(&self.stop_requested);
        let handle = thread::Builder::new()
            .name("strata-where".to_string())
            .spawn(move || Self::deliver(sampler, channel, delivered, stop_requested))
            .map_err(|e| Error::resource("where thread", e))?;
        self.handle = Some(handle);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        self.stop_requested.store(true, Ordering::Release);
        match handle.join() {
            Ok(result) => result.map_err(|e| Error::resource("where channel", e)),
            Err(_) => {
                log::error!("Where thread panicked");
                Ok(())
            }
        }
    }
}

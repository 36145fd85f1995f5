use std::io::Write as _;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::error::{Error, Result};
use crate::sampler::Sampler;
use crate::scheduler::Scheduler;
use crate::serialization::RecordSender;
use crate::session::configuration::Configuration;
use crate::signals;
use crate::where_dump;

/// Samples every tracked thread from a dedicated thread, once per interval.
pub struct TimerThreadScheduler {
    configuration: Arc<Configuration>,
    stop_requested: Arc<AtomicBool>,
    sampler: Option<Sampler>,
    sink: RecordSender,
    handle: Option<JoinHandle<()>>,
}

impl TimerThreadScheduler {
    pub(crate) fn new(configuration: Arc<Configuration>, sampler: Sampler, sink: RecordSender) -> Self {
        Self {
            configuration,
            stop_requested: Arc::new(AtomicBool::new(false)),
            sampler: Some(sampler),
            sink,
            handle: None,
        }
    }

    /// True once the sampling thread has exited on its own (exposure budget
    /// spent or interpreter shutting down).
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| h.is_finished())
    }

    fn thread_main_loop(
        configuration: Arc<Configuration>,
        stop_requested: Arc<AtomicBool>,
        mut sampler: Sampler,
        sink: RecordSender,
    ) {
        let started = Instant::now();
        let deadline = configuration.exposure.map(|exposure| started + exposure);
        let mut cycles = 0u64;
        let mut samples = 0usize;

        loop {
            if stop_requested.load(Ordering::Acquire) {
                break;
            }
            if sampler.runtime_finalizing() {
                log::debug!("Runtime is finalizing, stopping");
                break;
            }
            if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
                log::debug!("Exposure time elapsed, stopping");
                break;
            }

            let cycle_start = Instant::now();
            samples += sampler.sample_all(cycle_start, &mut |record| {
                // the writer only goes away at shutdown
                let _ = sink.send(record);
            });
            cycles += 1;

            if signals::take_dump_request() {
                let text = where_dump::render(std::process::id(), &sampler.capture_all());
                let _ = std::io::stderr().write_all(text.as_bytes());
            }

            log::trace!("Cycle {} took {:?}", cycles, cycle_start.elapsed());
            thread::sleep(configuration.interval.saturating_sub(cycle_start.elapsed()));
        }
        log::debug!("Sampled {} stacks in {} cycles", samples, cycles);
    }
}

impl Scheduler for TimerThreadScheduler {
    fn start(&mut self) -> Result<()> {
        let Some(sampler) = self.sampler.take() else {
            return Err(Error::AlreadyRunning);
        };
        let configuration = Arc::clone(&self.configuration);
        let stop_requested = Arc::clone(&self.stop_requested);
        let sink = self.sink.clone();
        let handle = thread::Builder::new()
            .name("strata-sampler".to_string())
            .spawn(move || Self::thread_main_loop(configuration, stop_requested, sampler, sink))
            .map_err(|e| Error::resource("sampler thread", e))?;
        self.handle = Some(handle);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.stop_requested.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Sampler thread panicked");
            }
        }
        Ok(())
    }
}

impl Drop for TimerThreadScheduler {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use super::format::{write_preamble, Encoder, Header, Record};
use crate::error::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const MAX_BATCH: usize = 4096;

pub type RecordSender = Sender<Record>;

/// Owns the output file. Records arrive over a channel and are written by a
/// dedicated thread, so capture never blocks on disk.
pub struct StreamWriter {
    sender: RecordSender,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<io::Result<u64>>>,
}

impl StreamWriter {
    pub fn create(path: &Path, header: Header) -> Result<Self> {
        let file = File::create(path).map_err(|e| Error::resource("output file", e))?;
        log::debug!("Writing samples to {}", path.display());
        Self::spawn(file, header)
    }

    pub fn spawn<W: Write + Send + 'static>(out: W, header: Header) -> Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = {
            let shutdown = Arc::clone(&shutdown);
            thread::Builder::new()
                .name("strata-writer".to_string())
                .spawn(move || Self::thread_main_loop(out, header, receiver, shutdown))
                .map_err(|e| Error::resource("writer thread", e))?
        };
        Ok(Self {
            sender,
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn sender(&self) -> RecordSender {
        self.sender.clone()
    }

    /// Flushes everything sent so far and closes the stream. Returns the
    /// number of records written after the header.
    pub fn finish(mut self) -> Result<u64> {
        self.shutdown.store(true, Ordering::Release);
        let Some(handle) = self.handle.take() else {
            return Ok(0);
        };
        match handle.join() {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::Io(io::Error::new(io::ErrorKind::Other, "writer thread panicked"))),
        }
    }

    fn thread_main_loop<W: Write>(out: W, header: Header, receiver: Receiver<Record>, shutdown: Arc<AtomicBool>) -> io::Result<u64> {
        let mut out = BufWriter::new(out);
        let mut encoder = Encoder::new();
        write_preamble(&mut out)?;
        encoder.encode(&mut out, &Record::Header(header))?;
        out.flush()?;

        let mut written = 0u64;
        while !shutdown.load(Ordering::Acquire) {
            match receiver.recv_timeout(POLL_INTERVAL) {
                Ok(record) => {
                    encoder.encode(&mut out, &record)?;
                    written += 1;
                    for record in receiver.try_iter().take(MAX_BATCH) {
                        encoder.encode(&mut out, &record)?;
                        written += 1;
                    }
                    out.flush()?;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        // Only what was queued when shutdown was seen; live senders may keep going.
        let pending = receiver.len();
        for record in receiver.try_iter().take(pending) {
            encoder.encode(&mut out, &record)?;
            written += 1;
        }
        out.flush()?;
        log::debug!("Wrote {} records", written);
        Ok(written)
    }
}

impl Drop for StreamWriter {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{ErrorMarker, FailureReason};
    use crate::serialization::format::Mode;
    use crate::serialization::reader::StreamReader;

    fn header() -> Header {
        Header {
            mode: Mode::Wall,
            interval_us: 1000,
            pid: 1,
            start_time_ns: 0,
        }
    }

    #[test]
    fn writes_everything_sent_before_finish() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.strata");
        let writer = StreamWriter::create(&path, header()).unwrap();
        let sender = writer.sender();
        for thread_id in 0..100 {
            sender
                .send(Record::Error(ErrorMarker {
                    thread_id,
                    reason: FailureReason::Stale,
                }))
                .unwrap();
        }
        assert_eq!(writer.finish().unwrap(), 100);

        let records = StreamReader::new(File::open(&path).unwrap()).unwrap().read_all().unwrap();
        assert_eq!(records.len(), 101);
        assert_eq!(records[0], Record::Header(header()));
    }

    #[test]
    fn finish_does_not_wait_for_other_senders() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StreamWriter::create(&dir.path().join("out.strata"), header()).unwrap();
        let _lingering = writer.sender();
        assert_eq!(writer.finish().unwrap(), 0);
    }

    #[test]
    fn finish_returns_while_a_sender_keeps_pushing() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StreamWriter::create(&dir.path().join("out.strata"), header()).unwrap();
        let sender = writer.sender();
        let stop = Arc::new(AtomicBool::new(false));
        let producer = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut thread_id = 0;
                while !stop.load(Ordering::Relaxed) {
                    let _ = sender.send(Record::Error(ErrorMarker {
                        thread_id,
                        reason: FailureReason::Stale,
                    }));
                    thread_id += 1;
                }
            })
        };
        thread::sleep(Duration::from_millis(20));

        let (done_tx, done_rx) = crossbeam_channel::bounded(1);
        thread::spawn(move || {
            let _ = done_tx.send(writer.finish().is_ok());
        });
        let finished = done_rx.recv_timeout(Duration::from_secs(5));
        stop.store(true, Ordering::Relaxed);
        producer.join().unwrap();
        assert_eq!(finished, Ok(true));
    }

    #[test]
    fn missing_directory_is_a_resource_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("out.strata");
        assert!(matches!(
            StreamWriter::create(&path, header()),
            Err(Error::Resource { what: "output file", .. })
        ));
    }
}

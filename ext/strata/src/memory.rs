use std::cell::Cell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::runtime::{Runtime, ThreadId};
use crate::sample::{ErrorMarker, Frame, Metric, Sample};
use crate::serialization::{Record, RecordSender};
use crate::threads::ThreadRegistry;
use crate::walker::FrameWalker;

/// Allocations tracked at once; beyond this new allocations are not recorded.
pub const MAX_LIVE_ALLOCATIONS: usize = 1 << 20;

thread_local! {
    static IN_HOOK: Cell<bool> = const { Cell::new(false) };
}

struct LiveAllocation {
    thread_id: ThreadId,
    size: u64,
    frames: Vec<Frame>,
}

/// Records allocation and free events with the stack that made the allocation.
pub struct MemoryTracker {
    walker: Mutex<FrameWalker>,
    threads: Arc<ThreadRegistry>,
    live: Mutex<HashMap<u64, LiveAllocation>>,
    sink: RecordSender,
}

impl MemoryTracker {
    pub fn new(runtime: Arc<dyn Runtime>, max_depth: usize, threads: Arc<ThreadRegistry>, sink: RecordSender) -> Self {
        Self {
            walker: Mutex::new(FrameWalker::new(runtime, max_depth)),
            threads,
            live: Mutex::new(HashMap::new()),
            sink,
        }
    }

    /// Called by the allocator hook on the allocating thread.
    pub fn on_alloc(&self, thread_id: ThreadId, address: u64, size: u64) {
        // the walk itself may allocate
        if IN_HOOK.with(|flag| flag.replace(true)) {
            return;
        }
        self.record_alloc(thread_id, address, size);
        IN_HOOK.with(|flag| flag.set(false));
    }

    /// Called by the allocator hook when `address` is released. Addresses
    /// allocated before tracking started are ignored.
    pub fn on_free(&self, address: u64) {
        if IN_HOOK.with(|flag| flag.replace(true)) {
            return;
        }
        let entry = self.live.lock().unwrap_or_else(|e| e.into_inner()).remove(&address);
        if let Some(entry) = entry {
            self.emit(Record::Sample(Sample {
                thread_id: entry.thread_id,
                task_id: None,
                metric: Metric::Free {
                    address,
                    size: entry.size,
                },
                frames: entry.frames,
            }));
        }
        IN_HOOK.with(|flag| flag.set(false));
    }

    pub fn live_allocations(&self) -> usize {
        self.live.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn record_alloc(&self, thread_id: ThreadId, address: u64, size: u64) {
        let name = self
            .threads
            .with_record(thread_id, |record| record.take_name_report().then(|| record.name.clone()))
            .flatten();
        if let Some(name) = name {
            self.emit(Record::ThreadName { thread_id, name });
        }

        let walked = self.walker.lock().unwrap_or_else(|e| e.into_inner()).walk(thread_id);
        let frames: Vec<Frame> = match walked {
            Ok(walked) => walked.into_iter().map(|w| w.frame).collect(),
            Err(e) => {
                log::trace!("Allocation stack of thread {} unavailable: {}", thread_id, e);
                self.emit(Record::Error(ErrorMarker::new(thread_id, &e)));
                return;
            }
        };

        {
            let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
            if live.len() >= MAX_LIVE_ALLOCATIONS && !live.contains_key(&address) {
                log::trace!("Too many live allocations, dropping {:#x}", address);
                return;
            }
            live.insert(
                address,
                LiveAllocation {
                    thread_id,
                    size,
                    frames: frames.clone(),
                },
            );
        }
        self.emit(Record::Sample(Sample {
            thread_id,
            task_id: None,
            metric: Metric::Allocation { address, size },
            frames,
        }));
    }

    fn emit(&self, record: Record) {
        let _ = self.sink.send(record);
    }
}

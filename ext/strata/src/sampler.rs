use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::error::CaptureError;
use crate::greenlets::GreenletTable;
use crate::native::NativeUnwinder;
use crate::runtime::{Runtime, ThreadId};
use crate::sample::{ErrorMarker, Metric, Sample};
use crate::serialization::Record;
use crate::session::configuration::{Configuration, TimeMode};
use crate::tasks::{RenderedStack, TaskGraph};
use crate::threads::ThreadRegistry;
use crate::walker::FrameWalker;
use crate::where_dump::ThreadDump;

/// One pass over every interpreter thread.
pub(crate) struct Sampler {
    time_mode: TimeMode,
    walker: FrameWalker,
    native: Option<NativeUnwinder>,
    threads: Arc<ThreadRegistry>,
    tasks: Arc<Mutex<TaskGraph>>,
    greenlets: Arc<Mutex<GreenletTable>>,
    excluded: HashSet<i64>,
}

impl Sampler {
    pub fn new(
        configuration: &Configuration,
        runtime: Arc<dyn Runtime>,
        threads: Arc<ThreadRegistry>,
        tasks: Arc<Mutex<TaskGraph>>,
    ) -> Self {
        Self {
            time_mode: configuration.time_mode,
            walker: FrameWalker::new(runtime, configuration.max_depth),
            native: configuration
                .native
                .then(|| NativeUnwinder::new(configuration.eval_symbols.clone(), configuration.interval)),
            threads,
            tasks,
            greenlets: Arc::new(Mutex::new(GreenletTable::new())),
            excluded: HashSet::new(),
        }
    }

    pub fn with_greenlets(mut self, greenlets: Arc<Mutex<GreenletTable>>) -> Self {
        self.greenlets = greenlets;
        self
    }

    /// Leaves the thread with kernel id `native_id` out of every capture (stealth mode).
    pub fn exclude_native(&mut self, native_id: i64) {
        self.excluded.insert(native_id);
    }

    fn is_excluded(&self, thread_id: ThreadId) -> bool {
        !self.excluded.is_empty()
            && self
                .threads
                .with_record(thread_id, |record| self.excluded.contains(&record.native_id))
                .unwrap_or(false)
    }

    /// Threads to visit this pass: the interpreter's list, with the names the
    /// host gave them, plus host-tracked threads the list missed.
    fn thread_ids(&self) -> Vec<ThreadId> {
        match self.walker.runtime().thread_ids() {
            Ok(live) => self.threads.sync(&live),
            Err(e) => log::trace!("Cannot list interpreter threads: {}", e),
        }
        self.threads
            .thread_ids()
            .into_iter()
            .filter(|&thread_id| !self.is_excluded(thread_id))
            .collect()
    }

    fn discover_tasks(&self) {
        let runtime = self.walker.runtime();
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .discover(runtime.as_ref());
    }

    pub fn runtime_finalizing(&self) -> bool {
        self.walker.runtime().is_finalizing()
    }

    pub fn capture_thread(&mut self, thread_id: ThreadId) -> Result<Vec<RenderedStack>, CaptureError> {
        if let Some(native) = self.native.as_mut() {
            let walker = &mut self.walker;
            let (ips, walked) = native.capture(thread_id, || walker.walk(thread_id))?;
            let walked = walked?;
            let symbols = native.symbolize(&ips);
            return Ok(vec![RenderedStack {
                task_id: None,
                on_cpu: true,
                frames: native.splice(&symbols, &walked),
            }]);
        }

        let walked = self.walker.walk(thread_id)?;
        let greenlets = self.greenlets.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(stacks) = greenlets.render(thread_id, &walked, &mut self.walker) {
            return Ok(stacks);
        }
        drop(greenlets);
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tasks.render(thread_id, &walked, &mut self.walker))
    }

    /// Samples every tracked thread once and hands the records to `emit`.
    /// Returns the number of samples produced.
    pub fn sample_all(&mut self, now: Instant, emit: &mut dyn FnMut(Record)) -> usize {
        let mut samples = 0;
        if self.native.is_none() {
            self.discover_tasks();
        }
        for thread_id in self.thread_ids() {
            let time_mode = self.time_mode;
            let Some((metric, name)) = self.threads.with_record(thread_id, |record| {
                let metric = match time_mode {
                    TimeMode::CpuTime => record.advance_cpu().map(|d| Metric::CpuTime(d.as_micros() as u64)),
                    TimeMode::WallTime => Some(Metric::WallTime(record.advance_wall(now).as_micros() as u64)),
                };
                let name = record.take_name_report().then(|| record.name.clone());
                (metric, name)
            }) else {
                continue;
            };

            if let Some(name) = name {
                emit(Record::ThreadName { thread_id, name });
            }
            // in CPU mode an idle thread is not sampled at all
            let Some(metric) = metric else {
                continue;
            };

            match self.capture_thread(thread_id) {
                Ok(stacks) => {
                    for stack in stacks {
                        if time_mode == TimeMode::CpuTime && !stack.on_cpu {
                            continue;
                        }
                        samples += 1;
                        emit(Record::Sample(Sample {
                            thread_id,
                            task_id: stack.task_id,
                            metric,
                            frames: stack.frames,
                        }));
                    }
                }
                Err(e) => {
                    log::trace!("Capture of thread {} failed: {}", thread_id, e);
                    emit(Record::Error(ErrorMarker::new(thread_id, &e)));
                }
            }
        }
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).prune();
        samples
    }

    /// Captures every thread for a plain-text dump.
    pub fn capture_all(&mut self) -> Vec<ThreadDump> {
        let mut dumps = Vec::new();
        if self.native.is_none() {
            self.discover_tasks();
        }
        for thread_id in self.thread_ids() {
            let Some(name) = self.threads.with_record(thread_id, |record| record.name.clone()) else {
                continue;
            };
            dumps.push(ThreadDump {
                thread_id,
                name,
                stacks: self.capture_thread(thread_id),
            });
        }
        dumps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::fake::FakeRuntime;
    use crate::sample::FailureReason;
    use crate::tasks::TaskDescriptor;

    fn sampler(runtime: Arc<FakeRuntime>, threads: Arc<ThreadRegistry>) -> (Sampler, Arc<Mutex<TaskGraph>>) {
        let tasks = Arc::new(Mutex::new(TaskGraph::new()));
        let sampler = Sampler::new(&Configuration::default(), runtime, threads, Arc::clone(&tasks));
        (sampler, tasks)
    }

    fn collect(sampler: &mut Sampler) -> Vec<Record> {
        let mut records = Vec::new();
        sampler.sample_all(Instant::now(), &mut |r| records.push(r));
        records
    }

    #[test]
    fn emits_thread_names_once_then_samples() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_stack(1, &[("main", "main.py", 3)]);
        let threads = Arc::new(ThreadRegistry::new());
        threads.track_thread(1, "MainThread", 100);
        let (mut sampler, _) = sampler(runtime, threads);

        let first = collect(&mut sampler);
        assert_eq!(
            first[0],
            Record::ThreadName {
                thread_id: 1,
                name: "MainThread".to_string()
            }
        );
        assert!(matches!(&first[1], Record::Sample(s) if s.frames[0].name == "main"));

        let second = collect(&mut sampler);
        assert_eq!(second.len(), 1);
        assert!(matches!(&second[0], Record::Sample(s) if matches!(s.metric, Metric::WallTime(_))));
    }

    #[test]
    fn failed_capture_becomes_an_error_marker() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_stack(1, &[("main", "main.py", 3)]);
        runtime.churn(1);
        let threads = Arc::new(ThreadRegistry::new());
        threads.track_thread(1, "MainThread", 100);
        threads.track_thread(2, "ghost", 101);
        let (mut sampler, _) = sampler(runtime, threads);

        let errors: Vec<ErrorMarker> = collect(&mut sampler)
            .into_iter()
            .filter_map(|r| match r {
                Record::Error(marker) => Some(marker),
                _ => None,
            })
            .collect();
        assert_eq!(
            errors,
            vec![
                ErrorMarker {
                    thread_id: 1,
                    reason: FailureReason::Stale
                },
                ErrorMarker {
                    thread_id: 2,
                    reason: FailureReason::UnknownThread
                },
            ]
        );
    }

    #[test]
    fn excluded_threads_are_skipped() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_stack(1, &[("main", "main.py", 3)]);
        runtime.set_stack(2, &[("sampler", "strata.py", 1)]);
        let threads = Arc::new(ThreadRegistry::new());
        threads.track_thread(1, "MainThread", 100);
        threads.track_thread(2, "profiler", 101);
        let (mut sampler, _) = sampler(runtime, threads);
        sampler.exclude_native(101);

        let records = collect(&mut sampler);
        assert!(records.iter().all(|r| match r {
            Record::Sample(s) => s.thread_id == 1,
            Record::ThreadName { thread_id, .. } => *thread_id == 1,
            _ => false,
        }));
        assert_eq!(sampler.capture_all().len(), 1);
    }

    #[test]
    fn untracked_interpreter_threads_are_captured() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_stack(1, &[("main", "main.py", 3)]);
        runtime.set_stack(5, &[("worker", "pool.py", 40)]);
        let threads = Arc::new(ThreadRegistry::new());
        threads.track_thread(1, "MainThread", 100);
        let (mut sampler, _) = sampler(runtime, Arc::clone(&threads));

        let dumps = sampler.capture_all();
        let names: Vec<(ThreadId, &str)> = dumps.iter().map(|d| (d.thread_id, d.name.as_str())).collect();
        assert_eq!(names, vec![(1, "MainThread"), (5, "Thread-0x5")]);
        assert!(dumps[1].stacks.is_ok());

        threads.track_thread(5, "pool-worker", 105);
        let records = collect(&mut sampler);
        assert!(records.contains(&Record::ThreadName {
            thread_id: 5,
            name: "pool-worker".to_string()
        }));
    }

    #[test]
    fn greenlet_threads_get_one_stack_per_greenlet() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_stack(1, &[("run", "hub.py", 300)]);
        let saved = runtime.detached_stack(&[("handle", "server.py", 8)]);
        let threads = Arc::new(ThreadRegistry::new());
        threads.track_thread(1, "MainThread", 100);
        let greenlets = Arc::new(Mutex::new(GreenletTable::new()));
        {
            let mut greenlets = greenlets.lock().unwrap();
            greenlets.track(0x10, 1, "Hub", None);
            greenlets.track(0x20, 1, "Greenlet-1", saved);
            greenlets.link(0x20, 0x10);
            greenlets.switch(1, 0x10);
        }
        let (sampler, _) = sampler(runtime, threads);
        let mut sampler = sampler.with_greenlets(greenlets);

        let samples: Vec<Sample> = collect(&mut sampler)
            .into_iter()
            .filter_map(|r| match r {
                Record::Sample(sample) => Some(sample),
                _ => None,
            })
            .collect();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].task_id, Some(0x20));
        let names: Vec<&str> = samples[1].frames.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["handle", "Greenlet-1", "run", "Hub"]);
    }

    #[test]
    fn task_stacks_carry_their_task_id() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_stack(1, &[("run_forever", "base_events.py", 600)]);
        let coro = runtime.coroutine(&[("handler", "app.py", 8)]);
        runtime.set_task(0xa1, coro, None);
        let threads = Arc::new(ThreadRegistry::new());
        threads.track_thread(1, "MainThread", 100);
        let (mut sampler, tasks) = sampler(runtime, threads);
        {
            let mut tasks = tasks.lock().unwrap();
            tasks.register_loop(1, 0xe0);
            tasks.task_created(TaskDescriptor::new(0xa1, 0xe0, "Task-1"));
        }

        let records = collect(&mut sampler);
        let Some(Record::Sample(sample)) = records.last() else {
            panic!("expected a sample, got {:?}", records);
        };
        assert_eq!(sample.task_id, Some(0xa1));
        let names: Vec<&str> = sample.frames.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["handler", "Task-1", "run_forever"]);
    }
}

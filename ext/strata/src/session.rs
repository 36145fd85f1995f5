pub mod configuration;
pub mod ffi;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use self::configuration::{Configuration, Target};
use crate::attach::channel_path;
use crate::error::{Error, Result};
use crate::greenlets::{GreenletId, GreenletTable};
use crate::memory::MemoryTracker;
use crate::one_shot_scheduler::OneShotScheduler;
use crate::runtime::{FrameRef, LoopId, Runtime, TaskContainer, TaskId, ThreadId};
use crate::sampler::Sampler;
use crate::scheduler::Scheduler;
use crate::serialization::{Header, StreamWriter};
use crate::signals::SignalGuard;
use crate::tasks::{TaskDescriptor, TaskGraph};
use crate::threads::ThreadRegistry;
use crate::timer_thread_scheduler::TimerThreadScheduler;
use crate::util::{current_native_id, unix_time_ns};

/// One profiling run inside the profiled process.
///
/// The host's event source reports threads, loops and tasks through the
/// notification methods; they are cheap and may be called before `start`.
pub struct Session {
    configuration: Arc<Configuration>,
    runtime: Arc<dyn Runtime>,
    threads: Arc<ThreadRegistry>,
    tasks: Arc<Mutex<TaskGraph>>,
    greenlets: Arc<Mutex<GreenletTable>>,
    where_channel: Option<PathBuf>,
    writer: Option<StreamWriter>,
    scheduler: Option<Box<dyn Scheduler>>,
    memory: Option<Arc<MemoryTracker>>,
    signals: Option<SignalGuard>,
}

impl Session {
    pub fn new(configuration: Configuration, runtime: Arc<dyn Runtime>) -> Result<Self> {
        configuration.validate()?;
        log::debug!("New session: {:?}", configuration);
        Ok(Session {
            configuration: Arc::new(configuration),
            runtime,
            threads: Arc::new(ThreadRegistry::new()),
            tasks: Arc::new(Mutex::new(TaskGraph::new())),
            greenlets: Arc::new(Mutex::new(GreenletTable::new())),
            where_channel: None,
            writer: None,
            scheduler: None,
            memory: None,
            signals: None,
        })
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    /// Overrides where a "where" dump is delivered.
    pub fn set_where_channel(&mut self, channel: PathBuf) {
        self.where_channel = Some(channel);
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_some() || self.memory.is_some()
    }

    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(Error::AlreadyRunning);
        }
        if let Target::Where(pid) = self.configuration.target {
            let channel = self
                .where_channel
                .clone()
                .unwrap_or_else(|| channel_path(&std::env::temp_dir(), pid));
            let mut scheduler = OneShotScheduler::new(self.sampler(), channel);
            scheduler.start()?;
            self.scheduler = Some(Box::new(scheduler));
            return Ok(());
        }

        let pid = std::process::id();
        let header = Header {
            mode: self.configuration.mode(),
            interval_us: self.configuration.interval.as_micros() as u64,
            pid,
            start_time_ns: unix_time_ns(),
        };
        let writer = StreamWriter::create(&self.configuration.output_path(pid), header)?;
        let signals = SignalGuard::install(self.configuration.native, true)
            .map_err(|e| Error::resource("signal handlers", e))?;

        if self.configuration.memory {
            self.memory = Some(Arc::new(MemoryTracker::new(
                Arc::clone(&self.runtime),
                self.configuration.max_depth,
                Arc::clone(&self.threads),
                writer.sender(),
            )));
        } else {
            let mut scheduler = TimerThreadScheduler::new(Arc::clone(&self.configuration), self.sampler(), writer.sender());
            scheduler.start()?;
            self.scheduler = Some(Box::new(scheduler));
        }
        self.writer = Some(writer);
        self.signals = Some(signals);
        log::debug!("Session started ({})", self.configuration.mode());
        Ok(())
    }

    /// Stops capturing and closes the output. Safe to call on a stopped session.
    pub fn stop(&mut self) -> Result<()> {
        let stopped = match self.scheduler.take() {
            Some(mut scheduler) => scheduler.stop(),
            None => Ok(()),
        };
        self.memory = None;
        self.signals = None;
        if let Some(writer) = self.writer.take() {
            let written = writer.finish()?;
            log::debug!("Session stopped, {} records written", written);
        }
        stopped
    }

    /// Builds the sampler for a capture started from the calling thread. In
    /// stealth mode that thread, the one hosting the profiler, is left out.
    fn sampler(&self) -> Sampler {
        let mut sampler = Sampler::new(
            &self.configuration,
            Arc::clone(&self.runtime),
            Arc::clone(&self.threads),
            Arc::clone(&self.tasks),
        )
        .with_greenlets(Arc::clone(&self.greenlets));
        if self.configuration.stealth {
            sampler.exclude_native(current_native_id());
        }
        sampler
    }

    fn tasks(&self) -> MutexGuard<'_, TaskGraph> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn greenlets(&self) -> MutexGuard<'_, GreenletTable> {
        self.greenlets.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn track_thread(&self, thread_id: ThreadId, name: &str, native_id: i64) {
        self.threads.track_thread(thread_id, name, native_id);
    }

    pub fn untrack_thread(&self, thread_id: ThreadId) {
        self.threads.untrack_thread(thread_id);
    }

    pub fn register_loop(&self, thread_id: ThreadId, loop_id: LoopId) {
        self.tasks().register_loop(thread_id, loop_id);
    }

    pub fn task_created(&self, task: TaskDescriptor) {
        self.tasks().task_created(task);
    }

    pub fn link(&self, parent: TaskId, child: TaskId) {
        self.tasks().link(parent, child);
    }

    pub fn enter_task(&self, loop_id: LoopId, task: TaskId) {
        self.tasks().enter_task(loop_id, task);
    }

    pub fn leave_task(&self, loop_id: LoopId, task: TaskId) {
        self.tasks().leave_task(loop_id, task);
    }

    pub fn task_done(&self, task: TaskId) {
        self.tasks().task_done(task);
    }

    /// Imports tasks that existed before the session was created.
    pub fn bulk_import(&self, running: &[(LoopId, TaskId)], scheduled: Vec<TaskDescriptor>, eager: Vec<TaskDescriptor>) {
        self.tasks().bulk_import(running, scheduled, eager);
    }

    /// Registers a runtime task collection that is re-read every cycle, so
    /// tasks created after this call are found without creation events.
    pub fn watch_tasks(&self, container: TaskContainer) {
        self.tasks().watch(container);
    }

    pub fn track_greenlet(&self, greenlet: GreenletId, thread_id: ThreadId, name: &str, frame: Option<FrameRef>) {
        self.greenlets().track(greenlet, thread_id, name, frame);
    }

    pub fn update_greenlet_frame(&self, greenlet: GreenletId, frame: Option<FrameRef>) {
        self.greenlets().update_frame(greenlet, frame);
    }

    pub fn link_greenlets(&self, greenlet: GreenletId, parent: GreenletId) {
        self.greenlets().link(greenlet, parent);
    }

    pub fn switch_greenlet(&self, thread_id: ThreadId, greenlet: GreenletId) {
        self.greenlets().switch(thread_id, greenlet);
    }

    pub fn untrack_greenlet(&self, greenlet: GreenletId) {
        self.greenlets().untrack(greenlet);
    }

    pub fn on_alloc(&self, thread_id: ThreadId, address: u64, size: u64) {
        if let Some(memory) = &self.memory {
            memory.on_alloc(thread_id, address, size);
        }
    }

    pub fn on_free(&self, address: u64) {
        if let Some(memory) = &self.memory {
            memory.on_free(address);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("Stopping session failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs::{self, File};
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::error::ConfigError;
    use crate::runtime::fake::FakeRuntime;
    use crate::sample::{FrameKind, Metric, Sample};
    use crate::serialization::{Mode, Record, StreamReader};
    use crate::session::configuration::TimeMode;

    fn output_template(dir: &tempfile::TempDir) -> String {
        dir.path().join("%(pid).strata").to_string_lossy().into_owned()
    }

    fn read_records(dir: &tempfile::TempDir) -> Vec<Record> {
        let path = dir.path().join(format!("{}.strata", std::process::id()));
        StreamReader::new(File::open(path).unwrap()).unwrap().read_all().unwrap()
    }

    fn samples(records: &[Record]) -> Vec<&Sample> {
        records
            .iter()
            .filter_map(|r| match r {
                Record::Sample(sample) => Some(sample),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn default_session_writes_wall_samples() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_stack(1, &[("<module>", "main.py", 1), ("compute", "main.py", 7)]);
        let configuration = Configuration {
            output: output_template(&dir),
            ..Configuration::default()
        };
        let mut session = Session::new(configuration, runtime).unwrap();
        session.track_thread(1, "MainThread", 100);
        session.start().unwrap();
        assert!(matches!(session.start(), Err(Error::AlreadyRunning)));
        thread::sleep(Duration::from_millis(50));
        session.stop().unwrap();
        assert!(!session.is_running());

        let records = read_records(&dir);
        let Record::Header(header) = &records[0] else {
            panic!("stream starts with {:?}", records[0]);
        };
        assert_eq!(header.mode, Mode::Wall);
        assert_eq!(header.interval_us, 1000);
        assert_eq!(header.pid, std::process::id());

        let samples = samples(&records);
        assert!(samples.len() >= 5, "only {} samples", samples.len());
        assert!(samples.iter().all(|s| s.thread_id == 1 && matches!(s.metric, Metric::WallTime(_))));
        assert_eq!(samples[0].frames[0].name, "compute");
        assert!(!records.iter().any(|r| matches!(r, Record::Error(_))));
    }

    #[test]
    fn gathered_tasks_show_their_parent() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_stack(1, &[("run_forever", "base_events.py", 600)]);
        let parent = runtime.coroutine(&[("main", "app.py", 20)]);
        let first = runtime.coroutine(&[("fetch", "app.py", 5)]);
        let second = runtime.coroutine(&[("fetch", "app.py", 5)]);
        runtime.set_task(0xa1, parent, None);
        runtime.set_task(0xa2, first, None);
        runtime.set_task(0xa3, second, None);

        let configuration = Configuration {
            output: output_template(&dir),
            ..Configuration::default()
        };
        let mut session = Session::new(configuration, runtime).unwrap();
        session.track_thread(1, "MainThread", 100);
        session.register_loop(1, 0xe0);
        session.task_created(TaskDescriptor::new(0xa1, 0xe0, "Task-1"));
        session.task_created(TaskDescriptor::new(0xa2, 0xe0, "Task-2"));
        session.task_created(TaskDescriptor::new(0xa3, 0xe0, "Task-3"));
        session.link(0xa1, 0xa2);
        session.link(0xa1, 0xa3);
        session.start().unwrap();
        thread::sleep(Duration::from_millis(30));
        session.stop().unwrap();

        let records = read_records(&dir);
        for child in [0xa2, 0xa3] {
            let sample = samples(&records)
                .into_iter()
                .find(|s| s.task_id == Some(child))
                .unwrap_or_else(|| panic!("no sample for task {:#x}", child));
            let names: Vec<&str> = sample.frames.iter().map(|f| f.name.as_str()).collect();
            assert_eq!(names[0], "fetch");
            assert_eq!(sample.frames[1].kind, FrameKind::TaskBoundary);
            assert_eq!(&names[2..], &["main", "Task-1", "run_forever"]);
        }
    }

    #[test]
    fn cpu_time_with_memory_is_rejected_before_capture() {
        let dir = tempfile::tempdir().unwrap();
        let configuration = Configuration {
            output: output_template(&dir),
            time_mode: TimeMode::CpuTime,
            memory: true,
            ..Configuration::default()
        };
        let result = Session::new(configuration, Arc::new(FakeRuntime::new()));
        assert!(matches!(result, Err(Error::Config(ConfigError::CpuWithMemory))));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn memory_session_records_allocations() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_stack(1, &[("main", "main.py", 1)]);
        let configuration = Configuration {
            output: output_template(&dir),
            memory: true,
            ..Configuration::default()
        };
        let mut session = Session::new(configuration, runtime).unwrap();
        session.track_thread(1, "MainThread", 100);
        session.on_alloc(1, 0x100, 32);
        session.start().unwrap();
        session.on_alloc(1, 0x200, 48);
        session.on_free(0x200);
        session.stop().unwrap();
        session.on_alloc(1, 0x300, 16);

        let records = read_records(&dir);
        assert!(matches!(&records[0], Record::Header(h) if h.mode == Mode::Memory));
        let metrics: Vec<Metric> = samples(&records).iter().map(|s| s.metric).collect();
        assert_eq!(
            metrics,
            vec![
                Metric::Allocation { address: 0x200, size: 48 },
                Metric::Free { address: 0x200, size: 48 },
            ]
        );
    }

    #[test]
    fn where_session_delivers_a_dump() {
        let dir = tempfile::tempdir().unwrap();
        let channel = dir.path().join("channel");
        fs::write(&channel, b"").unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_stack(1, &[("main", "main.py", 1)]);
        let configuration = Configuration {
            target: Target::Where(std::process::id() as i32),
            ..Configuration::default()
        };
        let mut session = Session::new(configuration, runtime).unwrap();
        session.set_where_channel(channel.clone());
        session.track_thread(1, "MainThread", 100);
        session.start().unwrap();
        session.stop().unwrap();

        let text = fs::read_to_string(&channel).unwrap();
        assert!(text.starts_with(&format!("Process {}: 1 threads", std::process::id())));
        assert!(text.contains("File \"main.py\", line 1, in main"));
    }

    #[test]
    fn tasks_linked_after_start_are_sampled() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_stack(1, &[("run_forever", "base_events.py", 600)]);
        let parent = runtime.coroutine(&[("main", "app.py", 20)]);
        runtime.set_task(0xa1, parent, None);

        let configuration = Configuration {
            output: output_template(&dir),
            ..Configuration::default()
        };
        let mut session = Session::new(configuration, runtime.clone()).unwrap();
        session.track_thread(1, "MainThread", 100);
        session.register_loop(1, 0xe0);
        session.bulk_import(&[], vec![TaskDescriptor::new(0xa1, 0xe0, "Task-1")], Vec::new());
        session.start().unwrap();

        for child in [0xa2, 0xa3] {
            let coro = runtime.coroutine(&[("fetch", "app.py", 5)]);
            runtime.set_task(child, coro, None);
            session.link(0xa1, child);
        }
        thread::sleep(Duration::from_millis(30));
        session.stop().unwrap();

        let records = read_records(&dir);
        for child in [0xa2u64, 0xa3] {
            let sample = samples(&records)
                .into_iter()
                .find(|s| s.task_id == Some(child))
                .unwrap_or_else(|| panic!("no sample for task {:#x}", child));
            let names: Vec<&str> = sample.frames.iter().map(|f| f.name.as_str()).collect();
            assert_eq!(names[0], "fetch");
            assert_eq!(names[1], format!("Task-{:#x}", child));
            assert_eq!(&names[2..], &["main", "Task-1", "run_forever"]);
        }
    }

    #[test]
    fn where_dump_covers_threads_the_host_has_not_named() {
        let dir = tempfile::tempdir().unwrap();
        let channel = dir.path().join("channel");
        fs::write(&channel, b"").unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_stack(1, &[("main", "main.py", 1)]);
        let configuration = Configuration {
            target: Target::Where(std::process::id() as i32),
            ..Configuration::default()
        };
        let mut session = Session::new(configuration, runtime).unwrap();
        session.set_where_channel(channel.clone());
        session.start().unwrap();
        thread::sleep(Duration::from_millis(20));
        session.track_thread(1, "MainThread", 100);
        session.stop().unwrap();

        let text = fs::read_to_string(&channel).unwrap();
        assert!(text.starts_with(&format!("Process {}: 1 threads", std::process::id())), "{}", text);
        assert!(text.contains("File \"main.py\", line 1, in main"));
    }

    #[test]
    fn stealth_leaves_out_the_hosting_thread() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_stack(1, &[("main", "main.py", 1)]);
        runtime.set_stack(2, &[("bootstrap", "strata.py", 3)]);
        let configuration = Configuration {
            output: output_template(&dir),
            stealth: true,
            ..Configuration::default()
        };
        let mut session = Session::new(configuration, runtime).unwrap();
        session.track_thread(1, "MainThread", 100);
        session.track_thread(2, "strata", current_native_id());
        session.start().unwrap();
        thread::sleep(Duration::from_millis(30));
        session.stop().unwrap();

        let records = read_records(&dir);
        let samples = samples(&records);
        assert!(!samples.is_empty());
        assert!(samples.iter().all(|s| s.thread_id == 1));
        assert!(!records
            .iter()
            .any(|r| matches!(r, Record::ThreadName { thread_id: 2, .. })));
    }

    #[test]
    fn greenlet_events_reach_the_samples() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        runtime.set_stack(1, &[("run", "hub.py", 300)]);
        let saved = runtime.detached_stack(&[("handle", "server.py", 8)]);
        let configuration = Configuration {
            output: output_template(&dir),
            ..Configuration::default()
        };
        let mut session = Session::new(configuration, runtime).unwrap();
        session.track_thread(1, "MainThread", 100);
        session.track_greenlet(0x10, 1, "Hub", None);
        session.track_greenlet(0x20, 1, "Greenlet-1", None);
        session.link_greenlets(0x20, 0x10);
        session.switch_greenlet(1, 0x10);
        session.update_greenlet_frame(0x20, saved);
        session.start().unwrap();
        thread::sleep(Duration::from_millis(30));
        session.stop().unwrap();
        session.untrack_greenlet(0x20);

        let records = read_records(&dir);
        let sample = samples(&records)
            .into_iter()
            .find(|s| s.task_id == Some(0x20))
            .expect("no sample for the suspended greenlet");
        let names: Vec<&str> = sample.frames.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["handle", "Greenlet-1", "run", "Hub"]);
    }
}

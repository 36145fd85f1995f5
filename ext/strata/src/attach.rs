//! Out-of-process control: attaching to a running process, one-shot "where"
//! dumps, and launching a command under the profiler.

use std::ffi::CString;
use std::fs::{self, File, OpenOptions, Permissions};
use std::io::{self, Read};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{ConfigError, Error, Result};
use crate::session::configuration::{Configuration, Target};

/// Pause between liveness polls, after yielding.
const POLL_BACKOFF: Duration = Duration::from_millis(1);
const READ_CHUNK: usize = 64 * 1024;

/// Location of the "where" channel for `pid` under `dir`.
pub fn channel_path(dir: &Path, pid: i32) -> PathBuf {
    dir.join(format!("strata-{}", pid))
}

/// What the injected bootstrap should do in the target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Bootstrap {
    Attach,
    Where { channel: PathBuf },
    Detach,
}

impl Bootstrap {
    pub fn verb(&self) -> &'static str {
        match self {
            Bootstrap::Attach => "attach",
            Bootstrap::Where { .. } => "where",
            Bootstrap::Detach => "detach",
        }
    }
}

/// Runs a bootstrap inside another process.
pub trait CodeInjector {
    fn inject(&self, pid: i32, bootstrap: &Bootstrap, configuration: &Configuration) -> io::Result<()>;
}

/// Delegates injection to an external program, invoked as
/// `<program> <pid> attach|where|detach <settings-json> [channel]`.
#[derive(Clone, Debug)]
pub struct CommandInjector {
    program: PathBuf,
}

impl CommandInjector {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into() }
    }
}

impl CodeInjector for CommandInjector {
    fn inject(&self, pid: i32, bootstrap: &Bootstrap, configuration: &Configuration) -> io::Result<()> {
        let settings = configuration.to_json().map_err(io::Error::other)?;
        let mut command = Command::new(&self.program);
        command.arg(pid.to_string()).arg(bootstrap.verb()).arg(settings);
        if let Bootstrap::Where { channel } = bootstrap {
            command.arg(channel);
        }
        log::debug!("Running {:?}", command);
        let status = command.status()?;
        if !status.success() {
            return Err(io::Error::other(format!("{} exited with {}", self.program.display(), status)));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum Outcome {
    /// The target went away; the session ended with it.
    TargetExited,
    ExposureElapsed,
    Stopped,
    /// The text of a "where" dump.
    Delivered(String),
    Launched(ExitStatus),
}

pub struct AttachController<I> {
    configuration: Configuration,
    injector: I,
    channel_dir: PathBuf,
    stop_requested: Arc<AtomicBool>,
}

impl<I: CodeInjector> AttachController<I> {
    pub fn new(configuration: Configuration, injector: I) -> Self {
        Self {
            configuration,
            injector,
            channel_dir: std::env::temp_dir(),
            stop_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Directory the "where" channel is created in. Defaults to the system
    /// temporary directory.
    pub fn with_channel_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.channel_dir = dir.into();
        self
    }

    /// Setting the returned flag ends a running attach at its next poll.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_requested)
    }

    pub fn run(&self) -> Result<Outcome> {
        self.configuration.validate()?;
        match &self.configuration.target {
            Target::Current => Err(ConfigError::InvalidValue {
                option: "target",
                value: "current".to_string(),
            }
            .into()),
            Target::Launch(command) => self.launch(command),
            Target::Attach(pid) => self.attach(*pid),
            Target::Where(pid) => self.where_dump(*pid),
        }
    }

    fn launch(&self, command: &[String]) -> Result<Outcome> {
        let Some((program, args)) = command.split_first() else {
            return Err(ConfigError::EmptyCommand.into());
        };
        let status = Command::new(program)
            .args(args)
            .envs(self.configuration.to_env())
            .status()
            .map_err(|e| Error::resource("launched command", e))?;
        log::debug!("{} exited with {}", program, status);
        Ok(Outcome::Launched(status))
    }

    fn attach(&self, pid: i32) -> Result<Outcome> {
        if !is_alive(pid) {
            return Err(Error::TargetExited { pid });
        }
        self.inject(pid, &Bootstrap::Attach)?;
        log::debug!("Attached to {}", pid);

        let deadline = self.deadline();
        let outcome = loop {
            if let Some(outcome) = self.poll(pid, deadline) {
                break outcome;
            }
        };
        self.detach(pid);
        Ok(outcome)
    }

    fn where_dump(&self, pid: i32) -> Result<Outcome> {
        if !is_alive(pid) {
            return Err(Error::TargetExited { pid });
        }
        let channel = WhereChannel::create(channel_path(&self.channel_dir, pid))?;
        let mut reader = channel.open_reader()?;
        self.inject(
            pid,
            &Bootstrap::Where {
                channel: channel.path().to_path_buf(),
            },
        )?;

        let deadline = self.deadline();
        let mut received = Vec::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        let outcome = loop {
            match reader.read(&mut chunk) {
                // end of stream only counts once the writer has shown up
                Ok(0) if !received.is_empty() => {
                    break Outcome::Delivered(String::from_utf8_lossy(&received).into_owned());
                }
                Ok(0) => {}
                Ok(n) => {
                    received.extend_from_slice(&chunk[..n]);
                    continue;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::resource("where channel", e)),
            }
            if let Some(outcome) = self.poll(pid, deadline) {
                break outcome;
            }
        };
        drop(reader);
        self.detach(pid);
        Ok(outcome)
    }

    fn deadline(&self) -> Option<Instant> {
        self.configuration.exposure.map(|exposure| Instant::now() + exposure)
    }

    /// One liveness poll. Returns the outcome once the wait is over.
    fn poll(&self, pid: i32, deadline: Option<Instant>) -> Option<Outcome> {
        if !is_alive(pid) {
            log::debug!("Process {} exited", pid);
            return Some(Outcome::TargetExited);
        }
        if deadline.map_or(false, |deadline| Instant::now() >= deadline) {
            return Some(Outcome::ExposureElapsed);
        }
        if self.stop_requested.load(Ordering::Acquire) {
            return Some(Outcome::Stopped);
        }
        thread::yield_now();
        thread::sleep(POLL_BACKOFF);
        None
    }

    fn inject(&self, pid: i32, bootstrap: &Bootstrap) -> Result<()> {
        self.injector
            .inject(pid, bootstrap, &self.configuration)
            .map_err(|e| Error::Injection {
                pid,
                reason: e.to_string(),
            })
    }

    fn detach(&self, pid: i32) {
        if !is_alive(pid) {
            return;
        }
        if let Err(e) = self.inject(pid, &Bootstrap::Detach) {
            log::warn!("Detaching from {} failed: {}", pid, e);
        }
    }
}

/// Non-blocking existence check. A process we may not signal still exists.
pub fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// A named pipe that any user may write to, removed when dropped.
pub struct WhereChannel {
    path: PathBuf,
}

impl WhereChannel {
    pub fn create(path: PathBuf) -> Result<Self> {
        match fs::remove_file(&path) {
            Ok(()) => log::debug!("Removed stale channel {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::resource("where channel", e)),
        }
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| Error::resource("where channel", io::Error::new(io::ErrorKind::InvalidInput, e)))?;
        if unsafe { libc::mkfifo(c_path.as_ptr(), 0o666) } != 0 {
            return Err(Error::resource("where channel", io::Error::last_os_error()));
        }
        let channel = WhereChannel { path };
        // mkfifo is subject to the umask
        fs::set_permissions(&channel.path, Permissions::from_mode(0o666))
            .map_err(|e| Error::resource("where channel", e))?;
        Ok(channel)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens the read end without waiting for a writer.
    pub fn open_reader(&self) -> Result<File> {
        OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.path)
            .map_err(|e| Error::resource("where channel", e))
    }
}

impl Drop for WhereChannel {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            log::debug!("Cannot remove {}: {}", self.path.display(), e);
        }
    }
}

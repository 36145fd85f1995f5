use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::native::DEFAULT_EVAL_SYMBOLS;
use crate::sample::MAX_STACK_DEPTH;
use crate::serialization::Mode;

pub const DEFAULT_INTERVAL: Duration = Duration::from_micros(1000);
pub const DEFAULT_TIME_MODE: TimeMode = TimeMode::WallTime;
pub const DEFAULT_OUTPUT: &str = "%(pid).strata";
pub const PID_PLACEHOLDER: &str = "%(pid)";

pub const ENV_INTERVAL: &str = "STRATA_INTERVAL";
pub const ENV_CPU: &str = "STRATA_CPU";
pub const ENV_MEMORY: &str = "STRATA_MEMORY";
pub const ENV_NATIVE: &str = "STRATA_NATIVE";
pub const ENV_OUTPUT: &str = "STRATA_OUTPUT";
pub const ENV_STEALTH: &str = "STRATA_STEALTH";
pub const ENV_EXPOSURE: &str = "STRATA_EXPOSURE";
pub const ENV_WHERE: &str = "STRATA_WHERE";
pub const ENV_PID: &str = "STRATA_PID";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    #[serde(rename = "interval_us", with = "micros")]
    pub interval: Duration,
    pub time_mode: TimeMode,
    pub native: bool,
    pub memory: bool,
    /// Output path template; `%(pid)` is replaced by the profiled process id.
    pub output: String,
    pub stealth: bool,
    #[serde(rename = "exposure_s", with = "optional_seconds")]
    pub exposure: Option<Duration>,
    pub target: Target,
    pub max_depth: usize,
    /// Native symbols of the interpreter's frame-evaluation entry point.
    pub eval_symbols: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeMode {
    #[serde(rename = "cpu")]
    CpuTime,
    #[serde(rename = "wall")]
    WallTime,
}

impl FromStr for TimeMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpu" => Ok(Self::CpuTime),
            "wall" => Ok(Self::WallTime),
            _ => Err(ConfigError::InvalidValue {
                option: "time mode",
                value: s.to_string(),
            }),
        }
    }
}

/// What a profiler invocation points at.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Target {
    /// The process the engine is loaded in.
    #[default]
    Current,
    Launch(Vec<String>),
    Attach(i32),
    Where(i32),
}

impl Target {
    pub fn select(command: Vec<String>, pid: Option<i64>, where_pid: Option<i64>) -> Result<Self, ConfigError> {
        match (pid, where_pid) {
            (Some(_), Some(_)) => Err(ConfigError::ConflictingTargets),
            (Some(pid), None) => Ok(Target::Attach(checked_pid(pid)?)),
            (None, Some(pid)) => Ok(Target::Where(checked_pid(pid)?)),
            (None, None) if command.is_empty() => Ok(Target::Current),
            (None, None) => Ok(Target::Launch(command)),
        }
    }
}

fn checked_pid(pid: i64) -> Result<i32, ConfigError> {
    match i32::try_from(pid) {
        Ok(pid) if pid > 0 => Ok(pid),
        _ => Err(ConfigError::InvalidPid(pid)),
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            time_mode: DEFAULT_TIME_MODE,
            native: false,
            memory: false,
            output: DEFAULT_OUTPUT.to_string(),
            stealth: false,
            exposure: None,
            target: Target::Current,
            max_depth: MAX_STACK_DEPTH,
            eval_symbols: DEFAULT_EVAL_SYMBOLS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Configuration {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut configuration = Self::default();
        if let Some(value) = lookup(ENV_INTERVAL) {
            configuration.interval = parse_interval(&value)?;
        }
        if let Some(value) = lookup(ENV_CPU) {
            if parse_flag(ENV_CPU, &value)? {
                configuration.time_mode = TimeMode::CpuTime;
            }
        }
        if let Some(value) = lookup(ENV_MEMORY) {
            configuration.memory = parse_flag(ENV_MEMORY, &value)?;
        }
        if let Some(value) = lookup(ENV_NATIVE) {
            configuration.native = parse_flag(ENV_NATIVE, &value)?;
        }
        if let Some(value) = lookup(ENV_STEALTH) {
            configuration.stealth = parse_flag(ENV_STEALTH, &value)?;
        }
        if let Some(value) = lookup(ENV_OUTPUT) {
            configuration.output = value;
        }
        if let Some(value) = lookup(ENV_EXPOSURE) {
            configuration.exposure = Some(Duration::from_secs(parse_number(ENV_EXPOSURE, &value)?));
        }
        let pid = lookup(ENV_PID).map(|v| parse_pid(ENV_PID, &v)).transpose()?;
        let where_pid = lookup(ENV_WHERE).map(|v| parse_pid(ENV_WHERE, &v)).transpose()?;
        configuration.target = Target::select(Vec::new(), pid, where_pid)?;
        Ok(configuration)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Environment handed to a command launched under the profiler.
    pub fn to_env(&self) -> Vec<(String, String)> {
        let flag = |on: bool| if on { "1" } else { "0" }.to_string();
        let mut env = vec![
            (ENV_INTERVAL.to_string(), self.interval.as_micros().to_string()),
            (ENV_CPU.to_string(), flag(self.time_mode == TimeMode::CpuTime)),
            (ENV_MEMORY.to_string(), flag(self.memory)),
            (ENV_NATIVE.to_string(), flag(self.native)),
            (ENV_OUTPUT.to_string(), self.output.clone()),
            (ENV_STEALTH.to_string(), flag(self.stealth)),
        ];
        if let Some(exposure) = self.exposure {
            env.push((ENV_EXPOSURE.to_string(), exposure.as_secs().to_string()));
        }
        env
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::NonPositiveInterval);
        }
        if self.exposure.map_or(false, |e| e.is_zero()) {
            return Err(ConfigError::NonPositiveExposure);
        }
        if self.memory && self.time_mode == TimeMode::CpuTime {
            return Err(ConfigError::CpuWithMemory);
        }
        match &self.target {
            Target::Attach(pid) | Target::Where(pid) if *pid <= 0 => {
                return Err(ConfigError::InvalidPid(*pid as i64));
            }
            Target::Launch(command) if command.is_empty() => return Err(ConfigError::EmptyCommand),
            _ => {}
        }
        if !self.output.contains(PID_PLACEHOLDER) {
            log::warn!(
                "Output file {:?} has no {} placeholder; concurrent profiles will overwrite each other",
                self.output,
                PID_PLACEHOLDER
            );
        }
        Ok(())
    }

    pub fn mode(&self) -> Mode {
        if self.memory {
            Mode::Memory
        } else {
            match self.time_mode {
                TimeMode::CpuTime => Mode::Cpu,
                TimeMode::WallTime => Mode::Wall,
            }
        }
    }

    pub fn output_path(&self, pid: u32) -> PathBuf {
        PathBuf::from(self.output.replace(PID_PLACEHOLDER, &pid.to_string()))
    }
}

/// Parses a sampling interval: bare microseconds, or with a `us`, `ms` or `s` suffix.
pub fn parse_interval(value: &str) -> Result<Duration, ConfigError> {
    let value = value.trim();
    let (digits, scale) = if let Some(digits) = value.strip_suffix("us") {
        (digits, 1)
    } else if let Some(digits) = value.strip_suffix("ms") {
        (digits, 1_000)
    } else if let Some(digits) = value.strip_suffix('s') {
        (digits, 1_000_000)
    } else {
        (value, 1)
    };
    let amount = parse_number(ENV_INTERVAL, digits.trim())?;
    amount
        .checked_mul(scale)
        .map(Duration::from_micros)
        .ok_or_else(|| ConfigError::InvalidValue {
            option: ENV_INTERVAL,
            value: value.to_string(),
        })
}

fn parse_number(option: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        option,
        value: value.to_string(),
    })
}

fn parse_pid(option: &'static str, value: &str) -> Result<i64, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        option,
        value: value.to_string(),
    })
}

fn parse_flag(option: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "" | "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            option,
            value: value.to_string(),
        }),
    }
}

mod micros {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_micros() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_micros)
    }
}

mod optional_seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => serializer.serialize_some(&value.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|secs| secs.map(Duration::from_secs))
    }
}

use crate::batch::tick_minutes;
use crate::classify::{Mode, PROCESS_STATE_EXITED, PROCESS_STATE_FATAL};
use crate::report::ReportStyle;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from procsentry.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    pub sentry: SentryConfig,
    pub tail: TailConfig,
    pub batch: BatchConfig,
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SentryConfig {
    pub dsn: Option<String>,
    pub logger: String,
    pub string_max_length: usize,
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct TailConfig {
    pub stderr_lines: Option<usize>,
    pub stdout_lines: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub interval_mins: f64,
    pub tick_event: String,
    pub events: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub server_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Deadline for each log-tail RPC, over HTTP or the Unix socket.
    pub timeout_secs: u64,
}

// --- Default implementations ---

impl Default for SentryConfig {
    fn default() -> Self {
        Self {
            dsn: None,
            logger: "superlance".to_string(),
            string_max_length: 4096,
            timeout_secs: 10,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            username: None,
            password: None,
            timeout_secs: 30,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            interval_mins: 1.0,
            tick_event: "TICK_60".to_string(),
            events: vec![PROCESS_STATE_FATAL.to_string()],
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    MissingDsn,
    NotUnderSupervisor,
    InvalidTickEvent(String),
    InvalidInterval(f64),
    UnsupportedBatchEvent(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::MissingDsn => write!(
                f,
                "You must specify the --sentry-dsn option or export the SENTRY_DSN variable (neither of them were specified)."
            ),
            ConfigError::NotUnderSupervisor => {
                write!(f, "must be run as a supervisor event listener (SUPERVISOR_SERVER_URL is not set)")
            }
            ConfigError::InvalidTickEvent(name) => write!(f, "invalid TICK event name: {name}"),
            ConfigError::InvalidInterval(mins) => {
                write!(f, "batch interval must be positive, got {mins}")
            }
            ConfigError::UnsupportedBatchEvent(name) => write!(
                f,
                "cannot batch {name}: only {PROCESS_STATE_FATAL} and {PROCESS_STATE_EXITED} are supported"
            ),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Load the config file. A missing file at the default location yields
/// defaults; a missing file the user named explicitly is an error.
pub fn load_config(path: &Path, explicit: bool) -> Result<FileConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(FileConfig::default());
        }
        Err(e) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: e,
            })
        }
    };
    toml::from_str(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Which listener variant to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    /// Unexpected exits, combined body with banners.
    Crash,
    /// Unexpected exits or fatal starts, split fields.
    Report { fatal: bool },
    /// Fatal starts, batched until the interval elapses.
    FatalBatch,
}

/// Values given on the command line; `None` falls back to env/file/defaults.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub sentry_dsn: Option<String>,
    pub stderr_lines: Option<usize>,
    pub stdout_lines: Option<usize>,
    pub interval_mins: Option<f64>,
    pub tick_event: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentrySettings {
    pub dsn: String,
    pub logger: String,
    pub string_max_length: usize,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorSettings {
    pub server_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchSettings {
    pub interval_mins: f64,
    pub tick_mins: f64,
}

/// Fully resolved, immutable listener settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerConfig {
    pub mode: Mode,
    pub style: ReportStyle,
    pub stderr_lines: usize,
    pub stdout_lines: usize,
    pub batch: Option<BatchSettings>,
    pub sentry: SentrySettings,
    pub supervisor: SupervisorSettings,
}

impl ListenerConfig {
    /// Merge CLI overrides, environment and file config.
    ///
    /// `env` is injected so resolution can be tested without touching the
    /// process environment.
    pub fn resolve(
        variant: Variant,
        file: FileConfig,
        overrides: Overrides,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let dsn = overrides
            .sentry_dsn
            .filter(|d| !d.is_empty())
            .or_else(|| env("SENTRY_DSN").filter(|d| !d.is_empty()))
            .or(file.sentry.dsn)
            .filter(|d| !d.is_empty())
            .ok_or(ConfigError::MissingDsn)?;

        let default_lines = match variant {
            Variant::Crash => 50,
            Variant::Report { .. } | Variant::FatalBatch => 10,
        };
        let stderr_lines = overrides
            .stderr_lines
            .or(file.tail.stderr_lines)
            .unwrap_or(default_lines);
        let stdout_lines = overrides
            .stdout_lines
            .or(file.tail.stdout_lines)
            .unwrap_or(default_lines);

        let (mode, style, batch) = match variant {
            Variant::Crash => (Mode::Crash, ReportStyle::Combined, None),
            Variant::Report { fatal: false } => (Mode::Crash, ReportStyle::Split, None),
            Variant::Report { fatal: true } => (Mode::Fatal, ReportStyle::Split, None),
            Variant::FatalBatch => {
                let tick_event = overrides.tick_event.unwrap_or(file.batch.tick_event);
                let tick_mins = tick_minutes(&tick_event)
                    .ok_or_else(|| ConfigError::InvalidTickEvent(tick_event.clone()))?;
                let interval_mins = overrides.interval_mins.unwrap_or(file.batch.interval_mins);
                if interval_mins.is_nan() || interval_mins <= 0.0 {
                    return Err(ConfigError::InvalidInterval(interval_mins));
                }
                if let Some(other) = file
                    .batch
                    .events
                    .iter()
                    .find(|e| *e != PROCESS_STATE_FATAL && *e != PROCESS_STATE_EXITED)
                {
                    return Err(ConfigError::UnsupportedBatchEvent(other.clone()));
                }
                (
                    Mode::Batch {
                        tick_event,
                        events: file.batch.events,
                    },
                    ReportStyle::Combined,
                    Some(BatchSettings {
                        interval_mins,
                        tick_mins,
                    }),
                )
            }
        };

        Ok(Self {
            mode,
            style,
            stderr_lines,
            stdout_lines,
            batch,
            sentry: SentrySettings {
                dsn,
                logger: file.sentry.logger,
                string_max_length: file.sentry.string_max_length,
                timeout: Duration::from_secs(file.sentry.timeout_secs),
            },
            supervisor: SupervisorSettings {
                server_url: env("SUPERVISOR_SERVER_URL").or(file.supervisor.server_url),
                username: env("SUPERVISOR_USERNAME").or(file.supervisor.username),
                password: env("SUPERVISOR_PASSWORD").or(file.supervisor.password),
                timeout: Duration::from_secs(file.supervisor.timeout_secs),
            },
        })
    }

    /// The supervisor RPC URL, which only exists when running as a listener.
    pub fn require_supervisor(&self) -> Result<&str, ConfigError> {
        self.supervisor
            .server_url
            .as_deref()
            .ok_or(ConfigError::NotUnderSupervisor)
    }
}

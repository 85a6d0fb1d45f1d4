use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Deserializer};
use tracing_appender::rolling::Rotation;

use crate::worker::{ExecRuntime, SpawnHooks, WorkerSpec};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

fn default_concurrency() -> usize {
    1
}

fn default_queues() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_dequeue_interval() -> f64 {
    5.0
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Supervisor settings, usually read from a YAML file.
///
/// ```yaml
/// concurrency: 2
/// queues: [high, low]
/// dequeue_interval: 0.1
/// pid_file: /var/run/worker-supervisor.pid
/// status_file: /var/run/worker-supervisor.stat
/// log_file: /var/log/worker-supervisor.log
/// log_rotation: daily
/// log_max_files: 7
/// worker:
///   command: bundle
///   args: [exec, rake, resque:work]
/// ```
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Initial number of worker processes.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Queues in priority order. A comma separated string is accepted too.
    #[serde(default = "default_queues", deserialize_with = "queue_list")]
    pub queues: Vec<String>,
    /// Polling frequency of the workers, in seconds.
    #[serde(default = "default_dequeue_interval")]
    pub dequeue_interval: f64,
    pub pid_file: Option<PathBuf>,
    pub status_file: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    /// How often `log_file` is rolled over. Rolled files get a date suffix.
    #[serde(default)]
    pub log_rotation: LogRotation,
    /// Rolled log files kept around, oldest deleted first. Unbounded when
    /// unset.
    pub log_max_files: Option<usize>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub worker: Option<WorkerCommand>,
    /// Set programmatically, files cannot carry closures.
    #[serde(skip)]
    pub hooks: SpawnHooks,
}

/// External program run by each worker process.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerCommand {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Never,
    Minutely,
    Hourly,
    Daily,
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Never => Rotation::NEVER,
            LogRotation::Minutely => Rotation::MINUTELY,
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum QueueList {
    List(Vec<String>),
    Joined(String),
}

fn queue_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let queues = match QueueList::deserialize(deserializer)? {
        QueueList::List(queues) => queues,
        QueueList::Joined(joined) => joined.split(',').map(str::to_string).collect(),
    };
    Ok(queues
        .into_iter()
        .map(|queue| queue.trim().to_string())
        .filter(|queue| !queue.is_empty())
        .collect())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            queues: default_queues(),
            dequeue_interval: default_dequeue_interval(),
            pid_file: None,
            status_file: None,
            log_file: None,
            log_rotation: LogRotation::default(),
            log_max_files: None,
            log_level: default_log_level(),
            worker: None,
            hooks: SpawnHooks::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    /// Parses and validates a YAML document.
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.dequeue_interval.is_finite() || self.dequeue_interval <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "dequeue_interval must be a positive number of seconds, got {}",
                self.dequeue_interval
            )));
        }
        if self.queues.is_empty() {
            return Err(ConfigError::Invalid("queues must name at least one queue".into()));
        }
        if self.log_max_files == Some(0) {
            return Err(ConfigError::Invalid("log_max_files must be at least 1".into()));
        }
        if let Some(worker) = &self.worker {
            if worker.command.trim().is_empty() {
                return Err(ConfigError::Invalid("worker.command must not be empty".into()));
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.dequeue_interval)
    }

    pub fn worker_spec(&self) -> WorkerSpec {
        WorkerSpec::new(self.queues.iter().cloned(), self.poll_interval())
    }

    /// Runtime executing the configured worker command.
    pub fn exec_runtime(&self) -> Result<ExecRuntime, ConfigError> {
        let worker = self
            .worker
            .as_ref()
            .ok_or_else(|| ConfigError::Invalid("worker.command is required".into()))?;
        let runtime = worker
            .env
            .iter()
            .fold(ExecRuntime::new(&worker.command).with_args(&worker.args), |runtime, (k, v)| {
                runtime.with_env(k, v)
            });
        Ok(runtime)
    }
}

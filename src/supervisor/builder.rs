use std::path::PathBuf;

use nix::unistd::{getpid, Pid};

use crate::{
    config::Config,
    registry::WorkerRegistry,
    status::StatusFile,
    supervisor::{Supervisor, SupervisorState},
};

/// Builds a `Supervisor` instance with configurable parameters.
pub struct SupervisorBuilder {
    target_workers: usize,
    status_file: Option<PathBuf>,
    master_pid: Option<Pid>,
}

impl SupervisorBuilder {
    /// Creates a new builder with a single worker and no status file.
    pub fn new() -> Self {
        Self {
            target_workers: 1,
            status_file: None,
            master_pid: None,
        }
    }

    /// Starts from the pool settings of a loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        let mut builder = Self::new().with_target_workers(config.concurrency);
        if let Some(path) = &config.status_file {
            builder = builder.with_status_file(path);
        }
        builder
    }

    /// Sets the initial number of workers.
    pub fn with_target_workers(mut self, count: usize) -> Self {
        self.target_workers = count;
        self
    }

    /// Publishes a JSON snapshot of the pool to `path` after every change.
    pub fn with_status_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.status_file = Some(path.into());
        self
    }

    /// Overrides the pid reported as the master. Defaults to the current
    /// process.
    pub fn with_master_pid(mut self, pid: Pid) -> Self {
        self.master_pid = Some(pid);
        self
    }

    /// Constructs the `Supervisor` with the configured settings.
    pub fn build(self) -> Supervisor {
        Supervisor {
            state: SupervisorState {
                target_workers: self.target_workers,
                shutting_down: false,
            },
            registry: WorkerRegistry::new(),
            status_file: self.status_file.map(StatusFile::new),
            master_pid: self.master_pid.unwrap_or_else(getpid),
        }
    }
}

impl Default for SupervisorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

use std::{
    fs, io,
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};

use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::registry::{WorkerProcess, WorkerRegistry};

/// Point-in-time view of the pool, as written to the status file and
/// returned by [`SupervisorHandle::workers`](crate::SupervisorHandle::workers).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub master_pid: i32,
    pub target_workers: usize,
    pub shutting_down: bool,
    pub workers: Vec<WorkerStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub pid: i32,
    pub slot: usize,
    /// Seconds since the Unix epoch.
    pub spawned_at: u64,
    pub draining: bool,
}

impl PoolSnapshot {
    pub(crate) fn capture(
        master_pid: Pid,
        target_workers: usize,
        shutting_down: bool,
        registry: &WorkerRegistry,
    ) -> Self {
        let workers = registry
            .workers()
            .map(|worker| WorkerStatus::from_worker(worker, registry.is_draining(worker.pid)))
            .collect();
        Self {
            master_pid: master_pid.as_raw(),
            target_workers,
            shutting_down,
            workers,
        }
    }

    /// Occupied slots in ascending order.
    pub fn slots(&self) -> Vec<usize> {
        let mut slots: Vec<usize> = self.workers.iter().map(|worker| worker.slot).collect();
        slots.sort_unstable();
        slots
    }

    pub fn pid_for_slot(&self, slot: usize) -> Option<i32> {
        self.workers
            .iter()
            .find(|worker| worker.slot == slot)
            .map(|worker| worker.pid)
    }
}

impl WorkerStatus {
    fn from_worker(worker: &WorkerProcess, draining: bool) -> Self {
        let spawned_at = worker
            .spawned_at
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();
        Self {
            pid: worker.pid.as_raw(),
            slot: worker.slot,
            spawned_at,
            draining,
        }
    }
}

/// JSON status file rewritten after every registry change.
#[derive(Debug, Clone)]
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes to a sibling temp file, then renames over the target so readers
    /// never observe a partial document.
    pub fn write(&self, snapshot: &PoolSnapshot) -> io::Result<()> {
        let body = serde_json::to_vec_pretty(snapshot)?;
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), workers = snapshot.workers.len(), "status file updated");
        Ok(())
    }

    pub fn read(&self) -> io::Result<PoolSnapshot> {
        let body = fs::read(&self.path)?;
        Ok(serde_json::from_slice(&body)?)
    }

    pub fn remove(&self) {
        remove_quietly(&self.path);
    }
}

/// Holds the master's pid on disk for as long as the value lives.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        fs::write(&path, format!("{}\n", std::process::id()))?;
        debug!(path = %path.display(), "pid file written");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        remove_quietly(&self.path);
    }
}

fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove file"),
    }
}

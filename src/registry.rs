use std::{
    collections::{BTreeMap, BTreeSet},
    time::SystemTime,
};

use nix::unistd::Pid;

/// A worker process occupying one pool slot.
///
/// Records are never updated in place. A respawn produces a new record with a
/// new pid for the same slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerProcess {
    pub pid: Pid,
    pub slot: usize,
    pub spawned_at: SystemTime,
}

/// In-memory record of the running workers, keyed by pid.
///
/// Only the supervisor loop touches the registry, so it carries no locking.
/// Iteration is always in ascending pid order.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: BTreeMap<Pid, WorkerProcess>,
    draining: BTreeSet<Pid>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a freshly spawned worker for `slot`.
    pub fn register(&mut self, pid: Pid, slot: usize) -> &WorkerProcess {
        self.draining.remove(&pid);
        let worker = WorkerProcess {
            pid,
            slot,
            spawned_at: SystemTime::now(),
        };
        self.workers.insert(pid, worker);
        &self.workers[&pid]
    }

    /// Forgets `pid` and returns the slot it occupied.
    ///
    /// Unknown pids return `None`: an exit may be reported twice.
    pub fn unregister(&mut self, pid: Pid) -> Option<usize> {
        self.draining.remove(&pid);
        self.workers.remove(&pid).map(|worker| worker.slot)
    }

    /// Flags a worker as told to finish up and exit. It keeps its slot until
    /// its exit is reported but no longer counts as active.
    pub fn mark_draining(&mut self, pid: Pid) -> bool {
        self.workers.contains_key(&pid) && self.draining.insert(pid)
    }

    pub fn is_draining(&self, pid: Pid) -> bool {
        self.draining.contains(&pid)
    }

    pub fn get(&self, pid: Pid) -> Option<&WorkerProcess> {
        self.workers.get(&pid)
    }

    pub fn occupied_slots(&self) -> BTreeSet<usize> {
        self.workers.values().map(|worker| worker.slot).collect()
    }

    pub fn count(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// `(pid, slot)` pairs sorted by pid.
    pub fn all(&self) -> Vec<(Pid, usize)> {
        self.workers
            .values()
            .map(|worker| (worker.pid, worker.slot))
            .collect()
    }

    /// Snapshot of every registered pid, sorted. Broadcasts go to this copy
    /// rather than a live view of the registry.
    pub fn pids(&self) -> Vec<Pid> {
        self.workers.keys().copied().collect()
    }

    pub fn workers(&self) -> impl Iterator<Item = &WorkerProcess> {
        self.workers.values()
    }

    /// Workers that have not been asked to drain.
    pub fn active(&self) -> impl Iterator<Item = &WorkerProcess> {
        self.workers
            .values()
            .filter(|worker| !self.draining.contains(&worker.pid))
    }

    pub fn active_count(&self) -> usize {
        self.workers.len() - self.draining.len()
    }
}

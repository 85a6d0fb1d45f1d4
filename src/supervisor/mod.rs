pub(crate) mod builder;
pub(crate) mod handle;
pub(crate) mod reconcile;

use std::{io, path::PathBuf};

use nix::{errno::Errno, sys::signal::Signal, unistd::Pid};
use tracing::{debug, error, info, warn};

use crate::{
    relay::{Event, ExitStatus, SignalRelay},
    registry::WorkerRegistry,
    status::{PoolSnapshot, StatusFile},
    supervisor::{
        handle::SupervisorHandle,
        reconcile::{plan, Action},
    },
    worker::{lifecycle::Lifecycle, PoolContext},
};

/// Fatal conditions. Any of them stops the loop: the pool state can no
/// longer be trusted.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to spawn worker for slot {slot}: {source}")]
    Spawn {
        slot: usize,
        #[source]
        source: Errno,
    },
    #[error("before-spawn hook failed for slot {slot}: {source:#}")]
    Hook {
        slot: usize,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to send {} to worker {pid}: {source}", .signal.as_str())]
    Signal {
        pid: Pid,
        signal: Signal,
        #[source]
        source: Errno,
    },
    #[error("failed to write status file {}: {source}", .path.display())]
    Status {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("event relay closed while workers were still supervised")]
    RelayClosed,
    #[error("supervisor task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Where the supervisor loop stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Running,
    /// Shutdown requested: nothing is spawned, waiting for workers to exit.
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SupervisorState {
    pub(crate) target_workers: usize,
    /// One-way latch.
    pub(crate) shutting_down: bool,
}

/// Keeps a pool of worker processes at its target size and turns signals
/// into pool-wide actions.
///
/// All inputs arrive through a [`SignalRelay`] and are handled one at a time,
/// so the registry needs no locking.
///
/// | Signal         | Running                                   | Draining            |
/// | -------------- | ----------------------------------------- | ------------------- |
/// | `TERM`, `INT`  | forward to all workers, start draining    | forward again       |
/// | `QUIT`         | forward to all workers, start draining    | forward again       |
/// | `USR1`, `USR2`, `CONT` | forward to all workers            | forward             |
/// | `TTIN`         | one more worker                           | ignored             |
/// | `TTOU`         | one less worker (drained with `QUIT`)     | ignored             |
pub struct Supervisor {
    pub(crate) state: SupervisorState,
    pub(crate) registry: WorkerRegistry,
    pub(crate) status_file: Option<StatusFile>,
    pub(crate) master_pid: Pid,
}

impl Supervisor {
    /// Runs the supervisor on the current tokio runtime, consuming it and
    /// returning a handle for external control.
    pub fn run<L>(self, relay: SignalRelay, lifecycle: L) -> SupervisorHandle
    where
        L: Lifecycle + Send + 'static,
    {
        let tx = relay.sender();
        let join_handle = tokio::spawn(self.run_and_supervise(relay, lifecycle));
        SupervisorHandle::new(join_handle, tx)
    }

    /// Fills the pool, then handles events until the last worker is gone
    /// after a shutdown signal.
    pub async fn run_and_supervise<L: Lifecycle>(
        mut self,
        mut relay: SignalRelay,
        mut lifecycle: L,
    ) -> Result<(), SupervisorError> {
        info!(
            master_pid = %self.master_pid,
            target = self.state.target_workers,
            "starting supervisor"
        );
        if let Err(err) = self.start(&mut lifecycle) {
            error!(error = %err, "failed to start worker pool");
            return Err(err);
        }

        loop {
            let Some(event) = relay.next_event().await else {
                error!("event relay closed");
                return Err(SupervisorError::RelayClosed);
            };
            let described = event.to_string();
            match self.handle_event(event, &mut lifecycle) {
                Ok(Phase::Stopped) => break,
                Ok(_) => {}
                Err(err) => {
                    error!(event = %described, error = %err, "fatal error while handling event");
                    return Err(err);
                }
            }
        }

        relay.close();
        if let Some(status_file) = &self.status_file {
            status_file.remove();
        }
        info!(master_pid = %self.master_pid, "shutting down supervisor");
        Ok(())
    }

    /// Publishes the initial status, so an unwritable status file fails
    /// before anything is forked, then fills the pool.
    pub fn start<L: Lifecycle>(&mut self, lifecycle: &mut L) -> Result<(), SupervisorError> {
        self.publish()?;
        self.reconcile(lifecycle)
    }

    pub fn phase(&self) -> Phase {
        match (self.state.shutting_down, self.registry.is_empty()) {
            (false, _) => Phase::Running,
            (true, false) => Phase::Draining,
            (true, true) => Phase::Stopped,
        }
    }

    pub fn target_workers(&self) -> usize {
        self.state.target_workers
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot::capture(
            self.master_pid,
            self.state.target_workers,
            self.state.shutting_down,
            &self.registry,
        )
    }

    /// Applies one event and returns the phase it leaves the loop in.
    pub fn handle_event<L: Lifecycle>(
        &mut self,
        event: Event,
        lifecycle: &mut L,
    ) -> Result<Phase, SupervisorError> {
        match event {
            Event::Signal(sig) => self.handle_signal(sig, lifecycle)?,
            Event::WorkerExited(pid, status) => self.handle_exit(pid, status, lifecycle)?,
            Event::Inspect(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
        Ok(self.phase())
    }

    fn handle_signal<L: Lifecycle>(
        &mut self,
        sig: Signal,
        lifecycle: &mut L,
    ) -> Result<(), SupervisorError> {
        let pids = self.registry.pids();
        let workers = pids.len();
        match sig {
            Signal::SIGTERM | Signal::SIGINT => {
                info!(signal = sig.as_str(), workers, "immediately kill all workers then exit");
                self.state.shutting_down = true;
                lifecycle.signal_all(sig, &pids)?;
                self.publish()?;
            }
            Signal::SIGQUIT => {
                info!(
                    signal = sig.as_str(),
                    workers,
                    "wait for all workers to finish processing then exit"
                );
                self.state.shutting_down = true;
                lifecycle.signal_all(sig, &pids)?;
                self.publish()?;
            }
            Signal::SIGUSR1 => {
                info!(signal = sig.as_str(), workers, "abort the current job of all workers");
                lifecycle.signal_all(sig, &pids)?;
            }
            Signal::SIGUSR2 => {
                info!(signal = sig.as_str(), workers, "stop processing new jobs");
                lifecycle.signal_all(sig, &pids)?;
            }
            Signal::SIGCONT => {
                info!(signal = sig.as_str(), workers, "resume processing new jobs");
                lifecycle.signal_all(sig, &pids)?;
            }
            Signal::SIGTTIN | Signal::SIGTTOU if self.state.shutting_down => {
                debug!(signal = sig.as_str(), "shutting down, ignoring scale request");
            }
            Signal::SIGTTIN => {
                self.state.target_workers += 1;
                info!(
                    signal = sig.as_str(),
                    target = self.state.target_workers,
                    "increment the number of workers"
                );
                self.reconcile(lifecycle)?;
            }
            Signal::SIGTTOU => {
                self.state.target_workers = self.state.target_workers.saturating_sub(1);
                info!(
                    signal = sig.as_str(),
                    target = self.state.target_workers,
                    "decrement the number of workers"
                );
                self.reconcile(lifecycle)?;
            }
            other => {
                warn!(signal = other.as_str(), "ignoring unsupported signal");
            }
        }
        Ok(())
    }

    fn handle_exit<L: Lifecycle>(
        &mut self,
        pid: Pid,
        status: ExitStatus,
        lifecycle: &mut L,
    ) -> Result<(), SupervisorError> {
        match self.registry.unregister(pid) {
            Some(slot) => info!(%pid, slot, %status, "worker died"),
            None => debug!(%pid, %status, "exit of untracked process"),
        }
        if !self.state.shutting_down {
            return self.reconcile(lifecycle);
        }
        if self.registry.is_empty() {
            info!("all workers exited");
        }
        self.publish()
    }

    /// Spawns or drains workers until the pool matches its target, then
    /// publishes the result.
    fn reconcile<L: Lifecycle>(&mut self, lifecycle: &mut L) -> Result<(), SupervisorError> {
        for action in plan(self.state.target_workers, &self.registry) {
            match action {
                Action::Spawn { slot } => {
                    let ctx = self.context();
                    let pid = lifecycle.spawn(&ctx, slot)?;
                    self.registry.register(pid, slot);
                }
                Action::Drain { pid, slot } => {
                    info!(%pid, slot, "draining worker");
                    lifecycle.signal(pid, Signal::SIGQUIT)?;
                    self.registry.mark_draining(pid);
                }
            }
        }
        self.publish()
    }

    fn context(&self) -> PoolContext {
        PoolContext {
            master_pid: self.master_pid,
            target_workers: self.state.target_workers,
            running_workers: self.registry.count(),
        }
    }

    fn publish(&self) -> Result<(), SupervisorError> {
        let Some(status_file) = &self.status_file else {
            return Ok(());
        };
        status_file
            .write(&self.snapshot())
            .map_err(|source| SupervisorError::Status {
                path: status_file.path().to_path_buf(),
                source,
            })
    }
}

use std::sync::Arc;

use nix::{
    errno::Errno,
    sys::signal::{self, SigHandler, Signal},
    unistd::{fork, getpid, ForkResult, Pid},
};
use tracing::{debug, info};

use crate::{
    relay::ACCEPTED_SIGNALS,
    supervisor::SupervisorError,
    worker::{PoolContext, SpawnHooks, WorkerRuntime, WorkerSpec},
};

/// OS-level effects the supervisor loop needs: start a worker for a slot and
/// deliver signals to workers.
pub trait Lifecycle {
    /// Starts a worker for `slot` and returns its pid.
    fn spawn(&mut self, ctx: &PoolContext, slot: usize) -> Result<Pid, SupervisorError>;

    /// Sends `sig` to `pid`. A process that is already gone counts as
    /// delivered.
    fn signal(&mut self, pid: Pid, sig: Signal) -> Result<(), SupervisorError>;

    /// Pid never targeted by [`signal_all`](Self::signal_all).
    fn master_pid(&self) -> Pid {
        getpid()
    }

    /// Sends `sig` to each pid of a snapshot, in the given order, skipping
    /// the master itself.
    fn signal_all(&mut self, sig: Signal, pids: &[Pid]) -> Result<(), SupervisorError> {
        let master = self.master_pid();
        for &pid in pids.iter().filter(|&&pid| pid != master) {
            self.signal(pid, sig)?;
        }
        Ok(())
    }
}

/// Forks real worker processes.
pub struct ProcessLifecycle {
    spec: WorkerSpec,
    runtime: Arc<dyn WorkerRuntime>,
    hooks: SpawnHooks,
}

impl ProcessLifecycle {
    pub fn new(spec: WorkerSpec, runtime: impl WorkerRuntime) -> Self {
        Self {
            spec,
            runtime: Arc::new(runtime),
            hooks: SpawnHooks::default(),
        }
    }

    pub fn with_hooks(mut self, hooks: SpawnHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn spec(&self) -> &WorkerSpec {
        &self.spec
    }

    /// Body of the forked child. Never returns into supervisor code.
    ///
    /// The child reports on stderr only: the master's log writer may have
    /// been mid-write in another thread at fork time.
    fn run_child(&self, ctx: &PoolContext, slot: usize) -> ! {
        reset_signal_dispositions();

        let outcome = match &self.hooks.after_spawn {
            Some(hook) => hook(ctx, &self.spec, slot),
            None => Ok(()),
        }
        .and_then(|()| self.runtime.run(&self.spec, slot));

        let code = match outcome {
            Ok(()) => 0,
            Err(err) => {
                eprintln!("worker {} (slot {slot}) failed: {err:#}", getpid());
                1
            }
        };
        std::process::exit(code)
    }
}

impl Lifecycle for ProcessLifecycle {
    fn spawn(&mut self, ctx: &PoolContext, slot: usize) -> Result<Pid, SupervisorError> {
        if let Some(hook) = &self.hooks.before_spawn {
            hook(ctx, &self.spec, slot).map_err(|source| SupervisorError::Hook { slot, source })?;
        }

        // SAFETY: the child only resets signal handlers, runs the after-spawn
        // hook and the worker runtime, then exits. It never returns into the
        // async runtime that owns the other threads of the master.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                info!(pid = %child, slot, "starting new worker");
                Ok(child)
            }
            Ok(ForkResult::Child) => self.run_child(ctx, slot),
            Err(source) => Err(SupervisorError::Spawn { slot, source }),
        }
    }

    fn signal(&mut self, pid: Pid, sig: Signal) -> Result<(), SupervisorError> {
        match signal::kill(pid, sig) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => {
                debug!(%pid, signal = sig.as_str(), "worker already gone");
                Ok(())
            }
            Err(source) => Err(SupervisorError::Signal {
                pid,
                signal: sig,
                source,
            }),
        }
    }
}

/// The master routes the accepted signals into its event queue. A forked
/// worker has to see them with their default meaning again.
fn reset_signal_dispositions() {
    for sig in ACCEPTED_SIGNALS {
        // SAFETY: restoring SIG_DFL installs no handler code.
        if let Err(err) = unsafe { signal::signal(sig, SigHandler::SigDfl) } {
            eprintln!("failed to reset {} handler: {err}", sig.as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn lifecycle() -> ProcessLifecycle {
        ProcessLifecycle::new(
            WorkerSpec::default(),
            |_: &WorkerSpec, _: usize| -> anyhow::Result<()> { Ok(()) },
        )
    }

    #[test]
    fn test_signal_exited_process_is_not_an_error() {
        let mut child = Command::new("/bin/sh").arg("-c").arg("exit 0").spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);
        child.wait().unwrap();

        assert!(lifecycle().signal(pid, Signal::SIGTERM).is_ok());
    }

    #[test]
    fn test_signal_live_process() {
        let mut child = Command::new("/bin/sleep").arg("60").spawn().unwrap();
        let pid = Pid::from_raw(child.id() as i32);

        lifecycle().signal(pid, Signal::SIGTERM).unwrap();
        let status = child.wait().unwrap();
        assert!(!status.success());
    }

    #[test]
    fn test_signal_all_skips_master() {
        struct Recorder(Vec<Pid>);
        impl Lifecycle for Recorder {
            fn spawn(&mut self, _: &PoolContext, _: usize) -> Result<Pid, SupervisorError> {
                unreachable!()
            }
            fn signal(&mut self, pid: Pid, _: Signal) -> Result<(), SupervisorError> {
                self.0.push(pid);
                Ok(())
            }
            fn master_pid(&self) -> Pid {
                Pid::from_raw(1)
            }
        }

        let mut recorder = Recorder(Vec::new());
        let pids = [Pid::from_raw(3), Pid::from_raw(1), Pid::from_raw(5)];
        recorder.signal_all(Signal::SIGUSR2, &pids).unwrap();
        assert_eq!(recorder.0, vec![Pid::from_raw(3), Pid::from_raw(5)]);
    }

    #[test]
    fn test_failing_before_spawn_hook_aborts_spawn() {
        let mut lifecycle = lifecycle().with_hooks(
            SpawnHooks::default()
                .with_before_spawn(|_, _, slot| anyhow::bail!("no connection for slot {slot}")),
        );
        let ctx = PoolContext {
            master_pid: getpid(),
            target_workers: 1,
            running_workers: 0,
        };

        let err = lifecycle.spawn(&ctx, 0).unwrap_err();
        assert!(matches!(err, SupervisorError::Hook { slot: 0, .. }));
    }
}

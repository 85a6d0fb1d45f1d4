use std::sync::{Arc, Mutex};

use nix::errno::Errno;
use worker_supervisor::{
    ExitStatus, Lifecycle, Pid, PoolContext, PoolSnapshot, RelaySender, Signal, SignalRelay,
    SupervisorBuilder, SupervisorError, SupervisorHandle,
};

pub const MASTER_PID: i32 = 1;
pub const FIRST_WORKER_PID: i32 = 1000;

/// Something the supervisor asked the lifecycle to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Spawn { slot: usize, pid: Pid },
    Signal { pid: Pid, signal: Signal },
}

#[derive(Debug)]
struct FakeState {
    next_pid: i32,
    calls: Vec<Call>,
    spawns_left: Option<usize>,
    fail_signals: bool,
}

/// Records spawns and signals instead of touching real processes. Pids are
/// handed out sequentially from `FIRST_WORKER_PID`.
#[derive(Debug, Clone)]
pub struct FakeLifecycle {
    state: Arc<Mutex<FakeState>>,
}

#[allow(unused)]
impl FakeLifecycle {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                next_pid: FIRST_WORKER_PID,
                calls: Vec::new(),
                spawns_left: None,
                fail_signals: false,
            })),
        }
    }

    /// Spawns beyond the first `count` fail with `EAGAIN`.
    pub fn failing_spawns_after(self, count: usize) -> Self {
        self.state.lock().unwrap().spawns_left = Some(count);
        self
    }

    /// Every signal delivery fails with `EPERM`.
    pub fn failing_signals(self) -> Self {
        self.state.lock().unwrap().fail_signals = true;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn spawned_slots(&self) -> Vec<usize> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Spawn { slot, .. } => Some(slot),
                Call::Signal { .. } => None,
            })
            .collect()
    }

    pub fn signals(&self) -> Vec<(Pid, Signal)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Signal { pid, signal } => Some((pid, signal)),
                Call::Spawn { .. } => None,
            })
            .collect()
    }
}

impl Lifecycle for FakeLifecycle {
    fn spawn(&mut self, _ctx: &PoolContext, slot: usize) -> Result<Pid, SupervisorError> {
        let mut state = self.state.lock().unwrap();
        if let Some(left) = state.spawns_left.as_mut() {
            if *left == 0 {
                return Err(SupervisorError::Spawn {
                    slot,
                    source: Errno::EAGAIN,
                });
            }
            *left -= 1;
        }
        let pid = Pid::from_raw(state.next_pid);
        state.next_pid += 1;
        state.calls.push(Call::Spawn { slot, pid });
        Ok(pid)
    }

    fn signal(&mut self, pid: Pid, signal: Signal) -> Result<(), SupervisorError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_signals {
            return Err(SupervisorError::Signal {
                pid,
                signal,
                source: Errno::EPERM,
            });
        }
        state.calls.push(Call::Signal { pid, signal });
        Ok(())
    }

    fn master_pid(&self) -> Pid {
        Pid::from_raw(MASTER_PID)
    }
}

pub fn pid(raw: i32) -> Pid {
    Pid::from_raw(raw)
}

/// A supervisor running on a fake lifecycle, fed through a bare relay.
#[allow(unused)]
pub struct Harness {
    pub handle: SupervisorHandle,
    pub tx: RelaySender,
    pub lifecycle: FakeLifecycle,
}

#[allow(unused)]
impl Harness {
    pub fn start(target: usize) -> Self {
        Self::start_with(SupervisorBuilder::new().with_target_workers(target), FakeLifecycle::new())
    }

    pub fn start_with(builder: SupervisorBuilder, lifecycle: FakeLifecycle) -> Self {
        let relay = SignalRelay::new();
        let tx = relay.sender();
        let handle = builder
            .with_master_pid(pid(MASTER_PID))
            .build()
            .run(relay, lifecycle.clone());
        Self {
            handle,
            tx,
            lifecycle,
        }
    }

    /// Snapshot taken after every event queued so far has been handled.
    pub async fn snapshot(&self) -> PoolSnapshot {
        self.handle.workers().await.unwrap()
    }

    pub fn signal(&self, signal: Signal) {
        assert!(self.tx.signal(signal), "supervisor is gone");
    }

    pub fn exit(&self, raw_pid: i32) {
        assert!(
            self.tx.worker_exited(pid(raw_pid), ExitStatus::Exited(0)),
            "supervisor is gone"
        );
    }

    /// Reports the exit of whichever worker holds `slot`.
    pub async fn exit_slot(&self, slot: usize) -> i32 {
        let raw_pid = self
            .snapshot()
            .await
            .pid_for_slot(slot)
            .unwrap_or_else(|| panic!("no worker in slot {slot}"));
        self.exit(raw_pid);
        raw_pid
    }
}

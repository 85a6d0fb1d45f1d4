//! # worker-supervisor
//!
//! `worker-supervisor` is a master process for queue workers.
//! It forks a fixed number of worker processes, replaces the ones that die,
//! resizes the pool on `TTIN`/`TTOU`, and relays shutdown and pause signals to
//! every worker.
//!
//! ## Quick example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use worker_supervisor::{
//!     ProcessLifecycle, SignalRelay, SupervisorBuilder, WorkerSpec,
//! };
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut relay = SignalRelay::new();
//!     relay.install_signal_handlers()?;
//!     relay.spawn_reaper()?;
//!
//!     let spec = WorkerSpec::new(["high", "low"], Duration::from_secs(5));
//!     let lifecycle = ProcessLifecycle::new(spec, |spec: &WorkerSpec, slot: usize| -> anyhow::Result<()> {
//!         println!("worker {slot} polling {:?}", spec.queues);
//!         std::thread::sleep(spec.poll_interval);
//!         Ok(())
//!     });
//!
//!     let handle = SupervisorBuilder::new()
//!         .with_target_workers(2)
//!         .build()
//!         .run(relay, lifecycle);
//!
//!     handle.wait().await?; // until TERM/INT/QUIT and every worker is gone
//!     Ok(())
//! }
//! ```
//!
//! ## Signals
//!
//! | Master receives | Effect                                                      |
//! | --------------- | ----------------------------------------------------------- |
//! | `TERM` / `INT`  | forward to every worker, exit once they are all gone        |
//! | `QUIT`          | forward to every worker (finish job, then exit), then exit  |
//! | `USR1`          | forward: workers abort their current job                    |
//! | `USR2`          | forward: workers stop picking up new jobs                   |
//! | `CONT`          | forward: workers resume after `USR2`                        |
//! | `TTIN`          | one more worker                                             |
//! | `TTOU`          | one less worker, the highest slot is sent `QUIT`            |
//!
//! ## Handle
//!
//! | SupervisorHandle method | Purpose                                       |
//! | ----------------------- | --------------------------------------------- |
//! | `send_signal(sig)`      | Queue a signal as if the OS delivered it      |
//! | `scale_up()`            | Same as `TTIN`                                |
//! | `scale_down()`          | Same as `TTOU`                                |
//! | `shutdown()`            | Same as `TERM`                                |
//! | `graceful_shutdown()`   | Same as `QUIT`                                |
//! | `workers().await`       | `PoolSnapshot` of the tracked workers         |
//! | `wait().await`          | Wait for the supervisor to stop               |

pub use config::{Config, ConfigError, LogRotation, WorkerCommand};
pub use registry::{WorkerProcess, WorkerRegistry};
pub use relay::{Event, ExitStatus, RelaySender, SignalRelay, ACCEPTED_SIGNALS};
pub use status::{PidFile, PoolSnapshot, StatusFile, WorkerStatus};
pub use supervisor::{
    builder::SupervisorBuilder,
    handle::{SupervisorHandle, SupervisorHandleError},
    reconcile::{plan, Action},
    Phase, Supervisor, SupervisorError,
};
pub use worker::{
    lifecycle::{Lifecycle, ProcessLifecycle},
    ExecRuntime, PoolContext, SpawnHook, SpawnHooks, WorkerRuntime, WorkerSpec,
};

pub use nix::{sys::signal::Signal, unistd::Pid};

mod config;
mod registry;
mod relay;
mod status;
mod supervisor;
mod worker;

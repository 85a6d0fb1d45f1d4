pub(crate) mod lifecycle;

use std::{
    collections::BTreeMap, fmt, os::unix::process::CommandExt, process::Command, sync::Arc,
    time::Duration,
};

use anyhow::Context;
use nix::unistd::Pid;

/// What a worker process is asked to do: poll these queues, in priority
/// order, every `poll_interval`.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSpec {
    pub queues: Vec<String>,
    pub poll_interval: Duration,
}

impl WorkerSpec {
    pub fn new<I, S>(queues: I, poll_interval: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queues: queues.into_iter().map(Into::into).collect(),
            poll_interval,
        }
    }
}

impl Default for WorkerSpec {
    fn default() -> Self {
        Self::new(["*"], Duration::from_secs(5))
    }
}

/// The supervisor's side of a spawn, as seen by hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolContext {
    pub master_pid: Pid,
    pub target_workers: usize,
    pub running_workers: usize,
}

/// Callback run around a spawn with the pool context, the worker spec and the
/// slot being filled.
pub type SpawnHook = Arc<dyn Fn(&PoolContext, &WorkerSpec, usize) -> anyhow::Result<()> + Send + Sync>;

/// `before_spawn` runs in the master right before forking. `after_spawn` runs
/// in the new child before the worker runtime takes over. Typical use is
/// closing shared connections in the master and reopening them in the child.
#[derive(Clone, Default)]
pub struct SpawnHooks {
    pub before_spawn: Option<SpawnHook>,
    pub after_spawn: Option<SpawnHook>,
}

impl SpawnHooks {
    pub fn with_before_spawn<F>(mut self, hook: F) -> Self
    where
        F: Fn(&PoolContext, &WorkerSpec, usize) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.before_spawn = Some(Arc::new(hook));
        self
    }

    pub fn with_after_spawn<F>(mut self, hook: F) -> Self
    where
        F: Fn(&PoolContext, &WorkerSpec, usize) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.after_spawn = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for SpawnHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnHooks")
            .field("before_spawn", &self.before_spawn.is_some())
            .field("after_spawn", &self.after_spawn.is_some())
            .finish()
    }
}

/// The job-processing loop executed inside a worker process.
///
/// `run` executes in the forked child and should only return when the worker
/// is done. The child exits right after: status 0 for `Ok`, 1 for `Err`.
///
/// Workers are expected to honor these signals:
///
/// | Signal        | Meaning                                  |
/// | ------------- | ---------------------------------------- |
/// | `TERM`, `INT` | stop immediately and exit                |
/// | `QUIT`        | finish the current job, then exit        |
/// | `USR1`        | abort the current job but keep running   |
/// | `USR2`        | stop picking up new jobs                 |
/// | `CONT`        | resume picking up jobs after `USR2`      |
pub trait WorkerRuntime: Send + Sync + 'static {
    fn run(&self, spec: &WorkerSpec, slot: usize) -> anyhow::Result<()>;
}

impl<F> WorkerRuntime for F
where
    F: Fn(&WorkerSpec, usize) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn run(&self, spec: &WorkerSpec, slot: usize) -> anyhow::Result<()> {
        self(spec, slot)
    }
}

/// Replaces the child with an external worker command.
///
/// The queue list and poll interval travel in `QUEUES` and `INTERVAL`, the
/// same variables `rake resque:work` reads, plus `WORKER_SLOT`.
#[derive(Debug, Clone)]
pub struct ExecRuntime {
    command: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
}

impl ExecRuntime {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    fn command(&self, spec: &WorkerSpec, slot: usize) -> Command {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .envs(&self.env)
            .env("QUEUES", spec.queues.join(","))
            .env("INTERVAL", spec.poll_interval.as_secs_f64().to_string())
            .env("WORKER_SLOT", slot.to_string());
        cmd
    }
}

impl WorkerRuntime for ExecRuntime {
    fn run(&self, spec: &WorkerSpec, slot: usize) -> anyhow::Result<()> {
        // exec only returns on failure.
        let err = self.command(spec, slot).exec();
        Err(err).with_context(|| format!("failed to exec worker command {}", self.command))
    }
}

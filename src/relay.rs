//! Turns OS signals and child exits into one ordered event stream.
//!
//! Detection and handling are kept apart. A signal handler only writes the
//! signal number to a self-pipe, one byte per delivery, and a dedicated
//! thread turns those bytes into events. Child exits are collected by another
//! thread blocked in `waitpid`. Both push onto the same unbounded channel,
//! which the supervisor loop drains one event at a time.

use std::{
    fmt,
    io::{self, Read, Write},
    os::unix::net::UnixStream,
    sync::Arc,
    thread,
    time::Duration,
};

use nix::{
    errno::Errno,
    sys::{
        signal::Signal,
        wait::{waitpid, WaitStatus},
    },
    unistd::Pid,
};
use signal_hook::{low_level, SigId};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::status::PoolSnapshot;

/// Signals the master reacts to.
pub const ACCEPTED_SIGNALS: [Signal; 8] = [
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGCONT,
    Signal::SIGTTIN,
    Signal::SIGTTOU,
];

/// Written by [`SignalRelay::close`] to stop the pipe reader. Never a signal
/// number.
const PIPE_CLOSED: u8 = 0;

/// Pause before asking the kernel again when there is no child to wait for.
pub const NO_CHILDREN_BACKOFF: Duration = Duration::from_millis(100);

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(Signal),
}

impl ExitStatus {
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            Self::Signaled(_) => None,
        }
    }

    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit {code}"),
            Self::Signaled(sig) => write!(f, "signal {}", sig.as_str()),
        }
    }
}

/// A discrete input to the supervisor loop.
#[derive(Debug)]
pub enum Event {
    /// A signal delivered to the master, or injected through a handle.
    Signal(Signal),
    /// A child was reaped.
    WorkerExited(Pid, ExitStatus),
    /// Request for a snapshot of the pool, answered in queue order.
    Inspect(oneshot::Sender<PoolSnapshot>),
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Signal(sig) => write!(f, "signal {}", sig.as_str()),
            Self::WorkerExited(pid, status) => write!(f, "worker {pid} exited ({status})"),
            Self::Inspect(_) => f.write_str("inspect"),
        }
    }
}

/// Producer side of the relay. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RelaySender {
    tx: mpsc::UnboundedSender<Event>,
}

impl RelaySender {
    /// Queues a signal event. Returns `false` once the loop has gone away.
    pub fn signal(&self, sig: Signal) -> bool {
        self.send(Event::Signal(sig)).is_ok()
    }

    /// Queues a worker exit. Returns `false` once the loop has gone away.
    pub fn worker_exited(&self, pid: Pid, status: ExitStatus) -> bool {
        self.send(Event::WorkerExited(pid, status)).is_ok()
    }

    pub(crate) fn send(&self, event: Event) -> Result<(), mpsc::error::SendError<Event>> {
        self.tx.send(event)
    }
}

/// Consumer side of the relay, owned by one supervisor instance.
///
/// A bare relay only carries what is pushed through its [`RelaySender`]s,
/// which is how tests drive the supervisor without touching real signal
/// dispositions. [`install_signal_handlers`](Self::install_signal_handlers)
/// and [`spawn_reaper`](Self::spawn_reaper) attach the OS sources.
#[derive(Debug)]
pub struct SignalRelay {
    tx: RelaySender,
    rx: mpsc::UnboundedReceiver<Event>,
    token: CancellationToken,
    pipe: Option<SignalPipe>,
}

/// Write end of the self-pipe and the handlers feeding it.
#[derive(Debug)]
struct SignalPipe {
    writer: Arc<UnixStream>,
    handlers: Vec<SigId>,
}

impl SignalRelay {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: RelaySender { tx },
            rx,
            token: CancellationToken::new(),
            pipe: None,
        }
    }

    pub fn sender(&self) -> RelaySender {
        self.tx.clone()
    }

    /// Next event in arrival order.
    pub async fn next_event(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Registers handlers for the accepted signals. Every delivery becomes
    /// one event, in delivery order, repeated signals included.
    pub fn install_signal_handlers(&mut self) -> io::Result<()> {
        if self.pipe.is_some() {
            return Ok(());
        }
        let (reader, writer) = UnixStream::pair()?;
        // A full pipe must never block inside a signal handler.
        writer.set_nonblocking(true)?;
        let writer = Arc::new(writer);

        let tx = self.sender();
        let token = self.token.clone();
        thread::Builder::new()
            .name("signal-relay".into())
            .spawn(move || forward_signals(reader, &tx, &token))?;

        let mut handlers = Vec::with_capacity(ACCEPTED_SIGNALS.len());
        for sig in ACCEPTED_SIGNALS {
            let pipe = Arc::clone(&writer);
            let byte = sig as u8;
            // SAFETY: the action is a single write(2) on a non-blocking
            // socket, which is async-signal-safe. It neither allocates nor
            // locks.
            let registered = unsafe {
                low_level::register(sig as i32, move || {
                    let _ = (&*pipe).write(&[byte]);
                })
            };
            match registered {
                Ok(id) => handlers.push(id),
                Err(err) => {
                    for id in handlers {
                        low_level::unregister(id);
                    }
                    let _ = (&*writer).write(&[PIPE_CLOSED]);
                    return Err(err);
                }
            }
        }
        self.pipe = Some(SignalPipe { writer, handlers });
        Ok(())
    }

    /// Starts the thread that reaps children and reports their exits.
    pub fn spawn_reaper(&self) -> io::Result<()> {
        let tx = self.sender();
        let token = self.token.clone();
        thread::Builder::new()
            .name("worker-reaper".into())
            .spawn(move || reap_children(&tx, &token))?;
        Ok(())
    }

    /// Detaches the OS sources. Events already queued stay readable.
    pub fn close(&mut self) {
        self.token.cancel();
        if let Some(pipe) = self.pipe.take() {
            for id in pipe.handlers {
                low_level::unregister(id);
            }
            let _ = (&*pipe.writer).write(&[PIPE_CLOSED]);
        }
    }
}

impl Default for SignalRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SignalRelay {
    fn drop(&mut self) {
        self.close();
    }
}

fn forward_signals(mut reader: UnixStream, tx: &RelaySender, token: &CancellationToken) {
    let mut buf = [0u8; 64];
    loop {
        let read = match reader.read(&mut buf) {
            Ok(0) => return,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!(error = %err, "signal pipe read failed");
                return;
            }
        };
        for &byte in &buf[..read] {
            if byte == PIPE_CLOSED || token.is_cancelled() {
                return;
            }
            match Signal::try_from(i32::from(byte)) {
                Ok(sig) => {
                    debug!(signal = sig.as_str(), "signal received");
                    if !tx.signal(sig) {
                        return;
                    }
                }
                Err(_) => warn!(byte, "unexpected byte on signal pipe"),
            }
        }
    }
}

fn reap_children(tx: &RelaySender, token: &CancellationToken) {
    let any_child = Pid::from_raw(-1);
    while !token.is_cancelled() {
        let (pid, status) = match waitpid(any_child, None) {
            Ok(WaitStatus::Exited(pid, code)) => (pid, ExitStatus::Exited(code)),
            Ok(WaitStatus::Signaled(pid, sig, _)) => (pid, ExitStatus::Signaled(sig)),
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => {
                thread::sleep(NO_CHILDREN_BACKOFF);
                continue;
            }
            Err(err) => {
                warn!(error = %err, "waitpid failed");
                thread::sleep(NO_CHILDREN_BACKOFF);
                continue;
            }
        };
        debug!(%pid, %status, "child reaped");
        if !tx.worker_exited(pid, status) {
            break;
        }
    }
}

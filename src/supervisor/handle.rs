use nix::sys::signal::Signal;
use tokio::{sync::oneshot, task::JoinHandle};

use crate::{
    relay::{Event, RelaySender},
    status::PoolSnapshot,
    supervisor::SupervisorError,
};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorHandleError {
    #[error("failed to send message to supervisor: {0}")]
    SendError(String),
    #[error("supervisor stopped before replying")]
    RecvError(#[from] oneshot::error::RecvError),
}

/// Control surface of a running [`Supervisor`](crate::Supervisor).
///
/// Everything sent through the handle joins the same ordered queue as OS
/// signals and worker exits.
#[derive(Debug)]
pub struct SupervisorHandle {
    join_handle: JoinHandle<Result<(), SupervisorError>>,
    tx: RelaySender,
}

impl SupervisorHandle {
    pub(crate) fn new(
        join_handle: JoinHandle<Result<(), SupervisorError>>,
        tx: RelaySender,
    ) -> Self {
        Self { join_handle, tx }
    }

    /// Delivers `sig` to the supervisor as if the OS had.
    pub fn send_signal(&self, sig: Signal) -> Result<(), SupervisorHandleError> {
        if self.tx.signal(sig) {
            Ok(())
        } else {
            Err(SupervisorHandleError::SendError(format!(
                "supervisor is gone, {} not delivered",
                sig.as_str()
            )))
        }
    }

    /// Kills all workers immediately (`TERM`) and stops once they are gone.
    pub fn shutdown(&self) -> Result<(), SupervisorHandleError> {
        self.send_signal(Signal::SIGTERM)
    }

    /// Lets workers finish their current job (`QUIT`) and stops once they
    /// are gone.
    pub fn graceful_shutdown(&self) -> Result<(), SupervisorHandleError> {
        self.send_signal(Signal::SIGQUIT)
    }

    /// Adds one worker to the pool (`TTIN`).
    pub fn scale_up(&self) -> Result<(), SupervisorHandleError> {
        self.send_signal(Signal::SIGTTIN)
    }

    /// Removes one worker from the pool (`TTOU`).
    pub fn scale_down(&self) -> Result<(), SupervisorHandleError> {
        self.send_signal(Signal::SIGTTOU)
    }

    /// Snapshot of the pool, taken after every event queued before this call
    /// has been handled.
    pub async fn workers(&self) -> Result<PoolSnapshot, SupervisorHandleError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Event::Inspect(reply_tx))
            .map_err(|e| SupervisorHandleError::SendError(e.to_string()))?;
        Ok(reply_rx.await?)
    }

    /// Sender feeding the supervisor queue, e.g. for an exit watcher.
    pub fn sender(&self) -> RelaySender {
        self.tx.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }

    /// Waits for the supervisor to stop.
    pub async fn wait(self) -> Result<(), SupervisorError> {
        self.join_handle.await?
    }
}

//! Mailbox of the fetch loop.
//!
//! The broker client is single-threaded: everything that changes what it
//! fetches is sent here and executed by the loop, in submission order.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::error::BrokerError;
use crate::multiplexer::Delivery;
use crate::partition::PartitionState;

pub(crate) type Reply = oneshot::Sender<Result<(), BrokerError>>;

/// Commands executed on the fetch-loop thread.
pub(crate) enum Command {
    /// Pause the partition unless its demand came back before the loop got here.
    PauseIfIdle { state: Arc<PartitionState> },

    Resume {
        state: Arc<PartitionState>,
        reply: Reply,
    },

    /// Position the partition so that `offset` is the next record read.
    Seek {
        state: Arc<PartitionState>,
        offset: i64,
        reply: Reply,
    },

    /// Start routing the partition's records into `tx`.
    Attach {
        state: Arc<PartitionState>,
        tx: mpsc::UnboundedSender<Delivery>,
    },

    /// Stop routing and pause the partition for good. `rewind` is the first
    /// fetched record the stream never handed out.
    Detach {
        state: Arc<PartitionState>,
        rewind: Option<i64>,
    },
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::PauseIfIdle { state } => write!(f, "PauseIfIdle({})", state.partition()),
            Command::Resume { state, .. } => write!(f, "Resume({})", state.partition()),
            Command::Seek { state, offset, .. } => write!(f, "Seek({}, {offset})", state.partition()),
            Command::Attach { state, .. } => write!(f, "Attach({})", state.partition()),
            Command::Detach { state, rewind: None } => write!(f, "Detach({})", state.partition()),
            Command::Detach { state, rewind: Some(offset) } => {
                write!(f, "Detach({}, rewind {offset})", state.partition())
            }
        }
    }
}

/// Cloneable submit side of the mailbox. Partition sources hold one; it
/// can steer a partition but cannot close the session.
#[derive(Clone)]
pub(crate) struct CommandSender {
    tx: mpsc::UnboundedSender<Command>,
}

impl CommandSender {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn submit(&self, command: Command) {
        if let Err(mpsc::error::SendError(command)) = self.tx.send(command) {
            tracing::debug!(?command, "fetch loop gone, command dropped");
        }
    }

    async fn call(&self, build: impl FnOnce(Reply) -> Command) -> Result<(), BrokerError> {
        let (reply, done) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| BrokerError::SessionClosed)?;
        done.await.map_err(|_| BrokerError::SessionClosed)?
    }

    /// Fire-and-forget: pause is a flow-control optimisation, not a correctness need.
    pub(crate) fn pause_if_idle(&self, state: &Arc<PartitionState>) {
        self.submit(Command::PauseIfIdle { state: state.clone() });
    }

    pub(crate) async fn resume(&self, state: &Arc<PartitionState>) -> Result<(), BrokerError> {
        let state = state.clone();
        self.call(|reply| Command::Resume { state, reply }).await
    }

    pub(crate) async fn seek(&self, state: &Arc<PartitionState>, offset: i64) -> Result<(), BrokerError> {
        let state = state.clone();
        self.call(|reply| Command::Seek { state, offset, reply }).await
    }

    pub(crate) fn attach(&self, state: &Arc<PartitionState>, tx: mpsc::UnboundedSender<Delivery>) {
        self.submit(Command::Attach { state: state.clone(), tx });
    }

    pub(crate) fn detach(&self, state: &Arc<PartitionState>, rewind: Option<i64>) {
        self.submit(Command::Detach { state: state.clone(), rewind });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn calls_resolve_with_loop_reply() {
        let (sender, mut rx) = CommandSender::channel();
        let state = Arc::new(PartitionState::new(1));

        let executor = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(command) = rx.recv().await {
                seen.push(format!("{command:?}"));
                match command {
                    Command::Resume { reply, .. } => {
                        let _ = reply.send(Ok(()));
                    }
                    Command::Seek { reply, .. } => {
                        let _ = reply.send(Err(BrokerError::NotAssigned(1)));
                    }
                    _ => {}
                }
            }
            seen
        });

        sender.pause_if_idle(&state);
        sender.resume(&state).await.unwrap();
        let err = sender.seek(&state, 6).await.unwrap_err();
        assert!(matches!(err, BrokerError::NotAssigned(1)));
        drop(sender);

        let seen = executor.await.unwrap();
        assert_eq!(seen, vec!["PauseIfIdle(1)", "Resume(1)", "Seek(1, 6)"]);
    }

    #[tokio::test]
    async fn calls_fail_once_loop_is_gone() {
        let (sender, rx) = CommandSender::channel();
        drop(rx);
        let state = Arc::new(PartitionState::new(0));
        assert!(matches!(sender.resume(&state).await, Err(BrokerError::SessionClosed)));
        sender.detach(&state, Some(3));
    }
}

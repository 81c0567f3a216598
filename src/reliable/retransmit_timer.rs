use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error};
use crate::error::{ProtocolViolation, TransportError, TransportResult};

/// Why a connection is closed by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    ResendLimitExceeded,
    ProtocolViolation(ProtocolViolation),
    Other(String),
}

impl From<&TransportError> for CloseReason {
    fn from(value: &TransportError) -> Self {
        match value {
            TransportError::ResendLimitExceeded => CloseReason::ResendLimitExceeded,
            TransportError::ProtocolViolation(v) => CloseReason::ProtocolViolation(v.clone()),
            other => CloseReason::Other(other.to_string()),
        }
    }
}

/// Whatever is driven by the retransmission timer, typically a
///  [ReliableChannel](crate::channel::ReliableChannel)
#[cfg_attr(test, automock)]
pub trait RetransmitTarget: Send + Sync + 'static {
    fn on_retransmit_tick(&self) -> TransportResult<()>;
}

/// Implemented by the session layer which owns the socket
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConnectionCloser: Send + Sync + 'static {
    async fn close(&self, reason: CloseReason);
}

/// A background task running the retransmission scan of one connection at a fixed interval.
///  The first error stops the timer and closes the connection. Dropping the timer stops it.
pub struct RetransmitTimer {
    handle: JoinHandle<()>,
}

impl RetransmitTimer {
    pub fn spawn(target: Arc<dyn RetransmitTarget>, closer: Arc<dyn ConnectionCloser>, due: Duration, interval: Duration) -> RetransmitTimer {
        let handle = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + due, interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticks.tick().await;
                if let Err(e) = target.on_retransmit_tick() {
                    error!("closing connection: {}", e);
                    closer.close(CloseReason::from(&e)).await;
                    break;
                }
            }
            debug!("retransmit timer stopped");
        });

        RetransmitTimer { handle }
    }

    pub fn stop(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for RetransmitTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

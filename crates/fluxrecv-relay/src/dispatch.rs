//! The single consumer behind the handoff channel.
//!
//! Messages are handled strictly one at a time: parse, expand into changes,
//! forward each change in turn and stop at the first failure. A message is
//! acked only when every change went through; otherwise it is nacked and the
//! transport redelivers it. Nothing is retried here.

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fluxrecv_core::Notification;
use fluxrecv_flux::Forwarder;
use fluxrecv_pubsub::{HandoffReceiver, Message};

use crate::DispatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Processing,
    Draining,
    Stopped,
}

/// What happened to one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    Rejected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub acked: usize,
    pub rejected: usize,
    /// Handed off but never processed because the loop was shutting down.
    pub drained: usize,
}

pub struct DispatchLoop {
    forwarder: Forwarder,
    state: watch::Sender<DispatchState>,
    stats: DispatchStats,
}

impl DispatchLoop {
    pub fn new(forwarder: Forwarder) -> Self {
        let (state, _) = watch::channel(DispatchState::Idle);
        Self {
            forwarder,
            state,
            stats: DispatchStats::default(),
        }
    }

    pub fn state(&self) -> DispatchState {
        *self.state.borrow()
    }

    /// Follow state transitions from another task.
    pub fn subscribe_state(&self) -> watch::Receiver<DispatchState> {
        self.state.subscribe()
    }

    fn transition(&self, next: DispatchState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(from = ?prev, to = ?next, "Dispatch state changed");
        }
    }

    /// Run until cancelled or until every sender is gone, then close the
    /// channel and nack whatever was already handed off.
    ///
    /// A message being processed when cancellation arrives is finished
    /// first; its forward is bounded by the forwarder's own deadline.
    pub async fn run(
        mut self,
        mut handoff: HandoffReceiver,
        cancel: CancellationToken,
    ) -> DispatchStats {
        loop {
            self.transition(DispatchState::Idle);
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                message = handoff.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            self.transition(DispatchState::Processing);
            match self.process(message).await {
                Disposition::Acked => self.stats.acked += 1,
                Disposition::Rejected => self.stats.rejected += 1,
            }
        }

        self.transition(DispatchState::Draining);
        handoff.close();
        while let Some(message) = handoff.recv().await {
            debug!(message_id = %message.id(), "Returning message received during shutdown");
            if let Err(e) = message.nack().await {
                warn!(error = %e, "Failed to nack message during shutdown");
            }
            self.stats.drained += 1;
        }

        self.transition(DispatchState::Stopped);
        info!(
            acked = self.stats.acked,
            rejected = self.stats.rejected,
            drained = self.stats.drained,
            "Dispatch loop stopped"
        );
        self.stats
    }

    /// Handle one message and settle it with the transport.
    pub async fn process(&self, message: Message) -> Disposition {
        let message_id = message.id().to_string();
        let delivery_attempt = message.delivery_attempt();
        match self.handle(message.data()).await {
            Ok(forwarded) => {
                debug!(%message_id, forwarded, "Acking message");
                if let Err(e) = message.ack().await {
                    warn!(%message_id, error = %e, "Failed to ack message");
                }
                Disposition::Acked
            }
            Err(e) => {
                warn!(%message_id, ?delivery_attempt, error = %e, "Rejecting message");
                if let Err(e) = message.nack().await {
                    warn!(%message_id, error = %e, "Failed to nack message");
                }
                Disposition::Rejected
            }
        }
    }

    /// Parse and forward; returns how many changes went downstream.
    pub async fn handle(&self, payload: &[u8]) -> Result<usize, DispatchError> {
        let notification = Notification::parse(payload)?;
        let mut forwarded = 0;
        for change in notification.changes() {
            self.forwarder.forward(&change).await?;
            forwarded += 1;
        }
        Ok(forwarded)
    }
}

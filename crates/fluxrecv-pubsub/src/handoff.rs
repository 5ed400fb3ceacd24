//! The queue between the receive loop and the dispatch loop.
//!
//! With capacity 0 the channel is a rendezvous: a send completes only once
//! the receiver has taken the message, so the receive side can never run
//! ahead of a busy consumer. A positive capacity lets that many messages
//! wait in the queue.

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::message::Message;

struct Slot {
    message: Message,
    taken: Option<oneshot::Sender<()>>,
}

/// Why a send did not go through. The message is handed back so the caller
/// can settle it.
#[derive(Debug)]
pub enum Rejected {
    Cancelled(Message),
    Closed(Message),
}

impl Rejected {
    pub fn into_message(self) -> Message {
        match self {
            Rejected::Cancelled(m) | Rejected::Closed(m) => m,
        }
    }
}

#[derive(Clone)]
pub struct HandoffSender {
    tx: mpsc::Sender<Slot>,
    rendezvous: bool,
}

pub struct HandoffReceiver {
    rx: mpsc::Receiver<Slot>,
}

pub fn handoff(capacity: usize) -> (HandoffSender, HandoffReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        HandoffSender {
            tx,
            rendezvous: capacity == 0,
        },
        HandoffReceiver { rx },
    )
}

impl HandoffSender {
    /// Wait for room, then enqueue. In rendezvous mode also wait until the
    /// receiver has picked the message up. Cancellation while still waiting
    /// for room returns the message; once enqueued it belongs to the
    /// receiver.
    pub async fn send(
        &self,
        message: Message,
        cancel: &CancellationToken,
    ) -> Result<(), Rejected> {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Rejected::Cancelled(message)),
            permit = self.tx.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => return Err(Rejected::Closed(message)),
            },
        };

        if !self.rendezvous {
            permit.send(Slot {
                message,
                taken: None,
            });
            return Ok(());
        }

        let (taken_tx, taken_rx) = oneshot::channel();
        permit.send(Slot {
            message,
            taken: Some(taken_tx),
        });
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = taken_rx => {}
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl HandoffReceiver {
    /// `None` once the channel is closed and drained.
    pub async fn recv(&mut self) -> Option<Message> {
        let slot = self.rx.recv().await?;
        if let Some(taken) = slot.taken {
            let _ = taken.send(());
        }
        Some(slot.message)
    }

    /// Refuse further sends. Messages already queued can still be received.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::OwnedSemaphorePermit;

use crate::lease::Lease;
use crate::names::SubscriptionName;
use crate::transport::{PullTransport, ReceivedMessage};
use crate::PubsubError;

/// Knows how to settle one message with the transport. Holding it also
/// holds one outstanding-message slot and, when pulled by the receive loop,
/// a lease the keep-alive extends.
struct AckHandle {
    transport: Arc<dyn PullTransport>,
    subscription: SubscriptionName,
    ack_id: String,
    lease: Option<Lease>,
    slot: Option<OwnedSemaphorePermit>,
}

impl AckHandle {
    async fn settle(self, deadline: Option<Duration>) -> Result<(), PubsubError> {
        let AckHandle {
            transport,
            subscription,
            ack_id,
            lease,
            slot,
        } = self;
        // Stop extending before the verdict goes out.
        drop(lease);
        let ack_ids = [ack_id];
        let result = match deadline {
            None => transport.acknowledge(&subscription, &ack_ids).await,
            Some(deadline) => {
                transport
                    .modify_ack_deadline(&subscription, &ack_ids, deadline)
                    .await
            }
        };
        drop(slot);
        result
    }
}

/// A pulled message awaiting a verdict. Dropping it without `ack`/`nack`
/// frees its slot and leaves redelivery to the ack deadline.
pub struct Message {
    id: String,
    data: Bytes,
    delivery_attempt: Option<u32>,
    handle: AckHandle,
}

impl Message {
    pub fn new(
        received: ReceivedMessage,
        transport: Arc<dyn PullTransport>,
        subscription: SubscriptionName,
        slot: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            id: received.message_id,
            data: received.data,
            delivery_attempt: received.delivery_attempt,
            handle: AckHandle {
                transport,
                subscription,
                ack_id: received.ack_id,
                lease: None,
                slot,
            },
        }
    }

    pub(crate) fn with_lease(mut self, lease: Lease) -> Self {
        self.handle.lease = Some(lease);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// 1 on first delivery, when the transport reports it.
    pub fn delivery_attempt(&self) -> Option<u32> {
        self.delivery_attempt
    }

    pub fn ack_id(&self) -> &str {
        &self.handle.ack_id
    }

    pub async fn ack(self) -> Result<(), PubsubError> {
        self.handle.settle(None).await
    }

    /// Hand the message back for immediate redelivery.
    pub async fn nack(self) -> Result<(), PubsubError> {
        self.handle.settle(Some(Duration::ZERO)).await
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("ack_id", &self.handle.ack_id)
            .field("subscription", &self.handle.subscription)
            .field("len", &self.data.len())
            .field("delivery_attempt", &self.delivery_attempt)
            .finish()
    }
}

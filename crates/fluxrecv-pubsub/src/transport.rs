use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::names::{SubscriptionName, TopicName};
use crate::PubsubError;

/// Pub/Sub accepts ack deadlines between 10 seconds and 10 minutes.
pub const MIN_ACK_DEADLINE: Duration = Duration::from_secs(10);
pub const MAX_ACK_DEADLINE: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    pub topic: TopicName,
    pub ack_deadline: Duration,
}

impl SubscriptionConfig {
    pub fn new(topic: TopicName, ack_deadline: Duration) -> Self {
        Self {
            topic,
            ack_deadline: ack_deadline.clamp(MIN_ACK_DEADLINE, MAX_ACK_DEADLINE),
        }
    }
}

/// One message as returned by a pull, before it is bound to an ack handle.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub ack_id: String,
    pub message_id: String,
    pub data: Bytes,
    pub attributes: HashMap<String, String>,
    pub publish_time: Option<String>,
    pub delivery_attempt: Option<u32>,
}

/// The subset of the Pub/Sub subscriber API the relay relies on.
#[async_trait]
pub trait PullTransport: Send + Sync {
    async fn create_subscription(
        &self,
        name: &SubscriptionName,
        config: &SubscriptionConfig,
    ) -> Result<(), PubsubError>;

    /// Fails with `NotFound` when the subscription does not exist.
    async fn get_subscription(&self, name: &SubscriptionName) -> Result<(), PubsubError>;

    /// May return fewer than `max_messages`, including none.
    async fn pull(
        &self,
        name: &SubscriptionName,
        max_messages: usize,
    ) -> Result<Vec<ReceivedMessage>, PubsubError>;

    async fn acknowledge(
        &self,
        name: &SubscriptionName,
        ack_ids: &[String],
    ) -> Result<(), PubsubError>;

    /// A zero deadline makes the messages eligible for redelivery right away.
    async fn modify_ack_deadline(
        &self,
        name: &SubscriptionName,
        ack_ids: &[String],
        deadline: Duration,
    ) -> Result<(), PubsubError>;
}

//! In-process Pub/Sub.
//!
//! Behaves like the service for everything the relay touches: topics fan out
//! to their subscriptions, pulls lease messages, acks retire them and a zero
//! ack deadline puts them back at the head of the queue. By default leases
//! never expire on their own; [`MemoryTransport::with_lease_expiry`] makes
//! them lapse unless extended. A lapsed lease is reclaimed on the next call
//! that touches its subscription: its ack id goes stale and the message is
//! redelivered under a new one. The inspection helpers let tests assert on what was settled
//! and how many messages were leased at once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::Code;
use crate::names::{SubscriptionName, TopicName};
use crate::transport::{PullTransport, ReceivedMessage, SubscriptionConfig};
use crate::PubsubError;

#[derive(Debug, Clone)]
struct Stored {
    message_id: String,
    data: Bytes,
    attributes: HashMap<String, String>,
    attempts: u32,
}

#[derive(Debug)]
struct Lease {
    stored: Stored,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct SubscriptionState {
    topic: String,
    ack_deadline: Duration,
    pending: VecDeque<Stored>,
    leased: HashMap<String, Lease>,
}

impl SubscriptionState {
    /// Put lapsed leases back at the head of the queue.
    fn reclaim_expired(&mut self, now: Instant) -> usize {
        let mut lapsed: Vec<String> = self
            .leased
            .iter()
            .filter(|(_, lease)| lease.expires_at.is_some_and(|at| at <= now))
            .map(|(ack_id, _)| ack_id.clone())
            .collect();
        lapsed.sort();
        for ack_id in lapsed.iter().rev() {
            if let Some(lease) = self.leased.remove(ack_id) {
                self.pending.push_front(lease.stored);
            }
        }
        lapsed.len()
    }
}

#[derive(Debug, Default)]
struct State {
    topics: HashSet<String>,
    subscriptions: HashMap<String, SubscriptionState>,
    next_message_id: u64,
    acked: Vec<String>,
    nacked: Vec<String>,
    pulls: usize,
    peak_leased: usize,
    expired: usize,
    extensions: usize,
    lease_expiry: Option<Duration>,
    injected_pull_errors: VecDeque<PubsubError>,
}

#[derive(Debug, Default)]
pub struct MemoryTransport {
    state: Mutex<State>,
}

fn not_found(resource: &str) -> PubsubError {
    PubsubError::status(
        Code::NotFound,
        format!("Resource not found (resource={resource})."),
    )
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Leases lapse `expiry` after a pull or after the last deadline
    /// extension, whatever deadline the subscription was created with.
    pub fn with_lease_expiry(expiry: Duration) -> Self {
        let mut transport = Self::default();
        transport.state.get_mut().lease_expiry = Some(expiry);
        transport
    }

    pub async fn create_topic(&self, topic: &TopicName) -> Result<(), PubsubError> {
        let mut state = self.state.lock().await;
        if !state.topics.insert(topic.as_str().to_string()) {
            return Err(PubsubError::status(
                Code::AlreadyExists,
                format!("Topic already exists: {topic}"),
            ));
        }
        Ok(())
    }

    /// Publish to every subscription bound to `topic`; returns the message id.
    pub async fn publish(
        &self,
        topic: &TopicName,
        data: impl Into<Bytes>,
    ) -> Result<String, PubsubError> {
        let mut state = self.state.lock().await;
        if !state.topics.contains(topic.as_str()) {
            return Err(not_found(topic.id()));
        }
        state.next_message_id += 1;
        let stored = Stored {
            message_id: state.next_message_id.to_string(),
            data: data.into(),
            attributes: HashMap::new(),
            attempts: 0,
        };
        for sub in state.subscriptions.values_mut() {
            if sub.topic == topic.as_str() {
                sub.pending.push_back(stored.clone());
            }
        }
        Ok(stored.message_id)
    }

    /// Make the next pull fail with `code`.
    pub async fn inject_pull_error(&self, code: Code) {
        self.inject_pull_failure(PubsubError::status(code, "injected failure"))
            .await;
    }

    /// Make the next pull fail with `error`.
    pub async fn inject_pull_failure(&self, error: PubsubError) {
        self.state.lock().await.injected_pull_errors.push_back(error);
    }

    /// Message ids acknowledged so far, in order.
    pub async fn acked(&self) -> Vec<String> {
        self.state.lock().await.acked.clone()
    }

    /// Message ids handed back with a zero deadline, in order.
    pub async fn nacked(&self) -> Vec<String> {
        self.state.lock().await.nacked.clone()
    }

    pub async fn pull_count(&self) -> usize {
        self.state.lock().await.pulls
    }

    /// Highest number of leased, unsettled messages seen on any subscription.
    pub async fn peak_leased(&self) -> usize {
        self.state.lock().await.peak_leased
    }

    /// Leases that lapsed and were put back for redelivery.
    pub async fn expired(&self) -> usize {
        self.state.lock().await.expired
    }

    /// Ack ids whose deadline was pushed back by a non-zero modify call.
    pub async fn extensions(&self) -> usize {
        self.state.lock().await.extensions
    }

    pub async fn leased(&self, name: &SubscriptionName) -> usize {
        let state = self.state.lock().await;
        state
            .subscriptions
            .get(name.as_str())
            .map_or(0, |s| s.leased.len())
    }

    pub async fn pending(&self, name: &SubscriptionName) -> usize {
        let state = self.state.lock().await;
        state
            .subscriptions
            .get(name.as_str())
            .map_or(0, |s| s.pending.len())
    }

    pub async fn ack_deadline(&self, name: &SubscriptionName) -> Option<Duration> {
        let state = self.state.lock().await;
        state.subscriptions.get(name.as_str()).map(|s| s.ack_deadline)
    }
}

#[async_trait]
impl PullTransport for MemoryTransport {
    async fn create_subscription(
        &self,
        name: &SubscriptionName,
        config: &SubscriptionConfig,
    ) -> Result<(), PubsubError> {
        let mut state = self.state.lock().await;
        if !state.topics.contains(config.topic.as_str()) {
            return Err(not_found(config.topic.id()));
        }
        if state.subscriptions.contains_key(name.as_str()) {
            return Err(PubsubError::status(
                Code::AlreadyExists,
                format!("Subscription already exists: {name}"),
            ));
        }
        state.subscriptions.insert(
            name.as_str().to_string(),
            SubscriptionState {
                topic: config.topic.as_str().to_string(),
                ack_deadline: config.ack_deadline,
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn get_subscription(&self, name: &SubscriptionName) -> Result<(), PubsubError> {
        let state = self.state.lock().await;
        if state.subscriptions.contains_key(name.as_str()) {
            Ok(())
        } else {
            Err(not_found(name.id()))
        }
    }

    async fn pull(
        &self,
        name: &SubscriptionName,
        max_messages: usize,
    ) -> Result<Vec<ReceivedMessage>, PubsubError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.pulls += 1;
        if let Some(error) = state.injected_pull_errors.pop_front() {
            return Err(error);
        }

        let now = Instant::now();
        let expires_at = state.lease_expiry.map(|expiry| now + expiry);
        let sub = state
            .subscriptions
            .get_mut(name.as_str())
            .ok_or_else(|| not_found(name.id()))?;
        state.expired += sub.reclaim_expired(now);

        let mut out = Vec::new();
        while out.len() < max_messages {
            let Some(mut stored) = sub.pending.pop_front() else {
                break;
            };
            stored.attempts += 1;
            let ack_id = format!("{}-{}", stored.message_id, stored.attempts);
            out.push(ReceivedMessage {
                ack_id: ack_id.clone(),
                message_id: stored.message_id.clone(),
                data: stored.data.clone(),
                attributes: stored.attributes.clone(),
                publish_time: None,
                delivery_attempt: Some(stored.attempts),
            });
            sub.leased.insert(ack_id, Lease { stored, expires_at });
        }

        state.peak_leased = state.peak_leased.max(sub.leased.len());
        Ok(out)
    }

    async fn acknowledge(
        &self,
        name: &SubscriptionName,
        ack_ids: &[String],
    ) -> Result<(), PubsubError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let sub = state
            .subscriptions
            .get_mut(name.as_str())
            .ok_or_else(|| not_found(name.id()))?;
        state.expired += sub.reclaim_expired(Instant::now());

        let mut retired = Vec::new();
        for ack_id in ack_ids {
            // Unknown or stale ack ids are ignored, as the service does.
            if let Some(lease) = sub.leased.remove(ack_id) {
                retired.push(lease.stored.message_id);
            }
        }
        state.acked.extend(retired);
        Ok(())
    }

    async fn modify_ack_deadline(
        &self,
        name: &SubscriptionName,
        ack_ids: &[String],
        deadline: Duration,
    ) -> Result<(), PubsubError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let sub = state
            .subscriptions
            .get_mut(name.as_str())
            .ok_or_else(|| not_found(name.id()))?;
        let now = Instant::now();
        state.expired += sub.reclaim_expired(now);

        if !deadline.is_zero() {
            let expires_at = state.lease_expiry.map(|expiry| now + expiry);
            for ack_id in ack_ids {
                if let Some(lease) = sub.leased.get_mut(ack_id) {
                    lease.expires_at = expires_at;
                    state.extensions += 1;
                }
            }
            return Ok(());
        }

        let mut returned = Vec::new();
        for ack_id in ack_ids {
            if let Some(lease) = sub.leased.remove(ack_id) {
                returned.push(lease.stored.message_id.clone());
                sub.pending.push_front(lease.stored);
            }
        }
        state.nacked.extend(returned);
        Ok(())
    }
}

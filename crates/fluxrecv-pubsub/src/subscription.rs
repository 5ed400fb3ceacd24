use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Code;
use crate::handoff::HandoffSender;
use crate::lease::{self, Lease, LeaseSet};
use crate::message::Message;
use crate::names::{SubscriptionName, TopicName};
use crate::transport::{
    PullTransport, ReceivedMessage, SubscriptionConfig, MAX_ACK_DEADLINE, MIN_ACK_DEADLINE,
};
use crate::PubsubError;

pub const DEFAULT_MAX_OUTSTANDING_MESSAGES: usize = 10;

/// Flow control for [`Subscription::receive`].
#[derive(Debug, Clone)]
pub struct ReceiveSettings {
    /// Only request as many messages as there are free outstanding slots.
    /// When off, every pull asks for a full batch and surplus messages wait
    /// in memory for a slot.
    pub synchronous: bool,
    /// Cap on messages pulled but not yet acked, nacked or dropped.
    pub max_outstanding_messages: usize,
    /// Pause after a pull that returned nothing.
    pub idle_backoff: Duration,
    /// Ceiling for the exponential backoff after retryable pull errors.
    pub max_backoff: Duration,
    /// How often held messages get their ack deadline pushed back. Defaults
    /// to half the subscription's ack deadline.
    pub lease_refresh: Option<Duration>,
}

impl Default for ReceiveSettings {
    fn default() -> Self {
        Self {
            synchronous: true,
            max_outstanding_messages: DEFAULT_MAX_OUTSTANDING_MESSAGES,
            idle_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            lease_refresh: None,
        }
    }
}

/// Creates or looks up the subscription the relay consumes from.
pub struct SubscriptionManager {
    transport: Arc<dyn PullTransport>,
    project: String,
    settings: ReceiveSettings,
}

impl SubscriptionManager {
    pub fn new(transport: Arc<dyn PullTransport>, project: impl Into<String>) -> Self {
        Self {
            transport,
            project: project.into(),
            settings: ReceiveSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: ReceiveSettings) -> Self {
        self.settings = settings;
        self
    }

    /// With a topic, try to create the subscription first; "already exists"
    /// counts as success, a missing topic or any other failure is fatal.
    /// Without one, the subscription must already exist. A caller that may
    /// pull but not read subscription metadata gets the benefit of the doubt.
    pub async fn prepare(
        &self,
        topic_id: Option<&str>,
        sub_id: &str,
        ack_timeout: Duration,
    ) -> Result<Subscription, PubsubError> {
        let name = SubscriptionName::new(&self.project, sub_id);
        info!(subscription = %name, "Preparing consumer loop");

        let mut created = false;
        if let Some(topic_id) = topic_id.filter(|t| !t.is_empty()) {
            let topic = TopicName::new(&self.project, topic_id);
            info!(subscription = %name, topic = %topic, "Attempting to create subscription");

            let config = SubscriptionConfig::new(topic.clone(), ack_timeout);
            match self.transport.create_subscription(&name, &config).await {
                Ok(()) => created = true,
                Err(e) if e.is_already_exists() => {
                    info!(subscription = %name, "Subscription already exists");
                }
                Err(e) if e.is_not_found() => {
                    error!(topic = %topic, error = %e, "Topic not found");
                    return Err(e);
                }
                Err(e) => {
                    error!(subscription = %name, error = %e, "Failed to create subscription");
                    return Err(e);
                }
            }
        }

        if !created {
            match self.transport.get_subscription(&name).await {
                Ok(()) => {}
                Err(e) if e.code() == Some(Code::PermissionDenied) => {
                    warn!(subscription = %name, error = %e, "Cannot check subscription, assuming it exists");
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            subscription = %name,
            synchronous = self.settings.synchronous,
            max_outstanding = self.settings.max_outstanding_messages,
            "Got subscription"
        );
        Ok(Subscription {
            name,
            transport: self.transport.clone(),
            settings: self.settings.clone(),
            ack_deadline: ack_timeout.clamp(MIN_ACK_DEADLINE, MAX_ACK_DEADLINE),
        })
    }
}

/// A resolved subscription, ready to receive.
pub struct Subscription {
    name: SubscriptionName,
    transport: Arc<dyn PullTransport>,
    settings: ReceiveSettings,
    ack_deadline: Duration,
}

struct Backoff {
    base: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            current: base,
        }
    }

    /// The next delay with up to 50% jitter added.
    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        let jitter_ms = (delay.as_millis() as u64) / 2;
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    fn reset(&mut self) {
        self.current = self.base;
    }
}

/// Sleep unless cancelled first. Returns false on cancellation.
async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

impl Subscription {
    pub fn name(&self) -> &SubscriptionName {
        &self.name
    }

    /// The deadline held messages are extended to.
    pub fn ack_deadline(&self) -> Duration {
        self.ack_deadline
    }

    fn lease_refresh(&self) -> Duration {
        self.settings
            .lease_refresh
            .unwrap_or(self.ack_deadline / 2)
            .max(Duration::from_millis(1))
    }

    /// Pull until cancelled, handing every message to `handoff`.
    ///
    /// At most `max_outstanding_messages` messages are alive (pulled and not
    /// yet settled or dropped) at any time. Sending blocks while the consumer
    /// is busy, which in turn stops further pulls. Retryable pull errors are
    /// retried with backoff; anything else ends the loop with the error.
    ///
    /// Until a message is settled or dropped its ack deadline is extended in
    /// the background, also after this returns.
    pub async fn receive(
        &self,
        handoff: &HandoffSender,
        cancel: &CancellationToken,
    ) -> Result<(), PubsubError> {
        let cap = self.settings.max_outstanding_messages.max(1);
        let slots = Arc::new(Semaphore::new(cap));
        let mut backoff = Backoff::new(self.settings.idle_backoff.max(Duration::from_millis(1)), self.settings.max_backoff);

        let leases = LeaseSet::new();
        tokio::spawn(lease::keep_alive(
            self.transport.clone(),
            self.name.clone(),
            Arc::downgrade(&leases),
            self.ack_deadline,
            self.lease_refresh(),
        ));

        info!(subscription = %self.name, max_outstanding = cap, "Receiving messages");

        loop {
            // Wait for at least one free slot, then take whatever else is free.
            let first = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let mut free = vec![first];
            while free.len() < cap {
                match slots.clone().try_acquire_owned() {
                    Ok(permit) => free.push(permit),
                    Err(_) => break,
                }
            }

            let batch = if self.settings.synchronous { free.len() } else { cap };
            let pulled = tokio::select! {
                _ = cancel.cancelled() => break,
                pulled = self.transport.pull(&self.name, batch) => pulled,
            };

            let received = match pulled {
                Ok(received) => received,
                Err(e) if e.is_retryable() => {
                    drop(free);
                    let delay = backoff.next_delay();
                    warn!(subscription = %self.name, error = %e, delay_ms = delay.as_millis() as u64, "Pull failed, retrying");
                    if !pause(delay, cancel).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    error!(subscription = %self.name, error = %e, "Pull failed");
                    return Err(e);
                }
            };

            if received.is_empty() {
                drop(free);
                if !pause(self.settings.idle_backoff, cancel).await {
                    break;
                }
                continue;
            }
            backoff.reset();
            debug!(subscription = %self.name, count = received.len(), "Pulled messages");

            let received = received
                .into_iter()
                .map(|m| {
                    let lease = leases.hold(&m.ack_id);
                    (m, lease)
                })
                .collect();
            if !self.deliver(received, free, &slots, handoff, cancel).await {
                break;
            }
        }

        info!(subscription = %self.name, "Receive loop stopped");
        Ok(())
    }

    /// Hand a pulled batch over one message at a time. Returns false when the
    /// loop should stop; anything not handed over by then is nacked.
    async fn deliver(
        &self,
        received: Vec<(ReceivedMessage, Lease)>,
        mut free: Vec<OwnedSemaphorePermit>,
        slots: &Arc<Semaphore>,
        handoff: &HandoffSender,
        cancel: &CancellationToken,
    ) -> bool {
        let mut batch = received.into_iter();
        while let Some((next, lease)) = batch.next() {
            let slot = match free.pop() {
                Some(slot) => slot,
                None => {
                    let acquired = tokio::select! {
                        _ = cancel.cancelled() => None,
                        permit = slots.clone().acquire_owned() => permit.ok(),
                    };
                    match acquired {
                        Some(slot) => slot,
                        None => {
                            self.nack_unsent(std::iter::once((next, lease)).chain(batch))
                                .await;
                            return false;
                        }
                    }
                }
            };

            let message = Message::new(next, self.transport.clone(), self.name.clone(), Some(slot))
                .with_lease(lease);
            info!(message_id = %message.id(), "Message received");

            if let Err(rejected) = handoff.send(message, cancel).await {
                let message = rejected.into_message();
                let ack_id = message.ack_id().to_string();
                drop(message);
                self.nack_ids(vec![ack_id]).await;
                self.nack_unsent(batch).await;
                return false;
            }
        }
        true
    }

    async fn nack_unsent(&self, rest: impl Iterator<Item = (ReceivedMessage, Lease)>) {
        let ack_ids: Vec<String> = rest.map(|(m, _)| m.ack_id).collect();
        self.nack_ids(ack_ids).await;
    }

    async fn nack_ids(&self, ack_ids: Vec<String>) {
        if ack_ids.is_empty() {
            return;
        }
        debug!(subscription = %self.name, count = ack_ids.len(), "Returning undelivered messages");
        if let Err(e) = self
            .transport
            .modify_ack_deadline(&self.name, &ack_ids, Duration::ZERO)
            .await
        {
            warn!(subscription = %self.name, error = %e, "Failed to return undelivered messages");
        }
    }
}

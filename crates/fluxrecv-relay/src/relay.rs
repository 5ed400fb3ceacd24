use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use fluxrecv_flux::Forwarder;
use fluxrecv_pubsub::{handoff, Subscription};

use crate::dispatch::{DispatchLoop, DispatchStats};
use crate::RelayError;

/// Rendezvous: the receive loop never gets ahead of the dispatcher.
pub const DEFAULT_HANDOFF_CAPACITY: usize = 0;

/// Wires a subscription to the dispatch loop and runs both until shutdown.
pub struct Relay {
    subscription: Subscription,
    forwarder: Forwarder,
    handoff_capacity: usize,
}

impl Relay {
    pub fn new(subscription: Subscription, forwarder: Forwarder) -> Self {
        Self {
            subscription,
            forwarder,
            handoff_capacity: DEFAULT_HANDOFF_CAPACITY,
        }
    }

    pub fn with_handoff_capacity(mut self, capacity: usize) -> Self {
        self.handoff_capacity = capacity;
        self
    }

    /// The receive loop runs on the calling task and the dispatcher on its
    /// own. When receiving stops, for cancellation or a fatal pull error,
    /// the dispatcher is stopped too and drains what it was handed.
    pub async fn run(self, cancel: CancellationToken) -> Result<DispatchStats, RelayError> {
        let (tx, rx) = handoff(self.handoff_capacity);
        let dispatch_cancel = cancel.child_token();
        let dispatcher = tokio::spawn(
            DispatchLoop::new(self.forwarder).run(rx, dispatch_cancel.clone()),
        );

        info!(
            subscription = %self.subscription.name(),
            handoff_capacity = self.handoff_capacity,
            "Relay started"
        );
        let received = self.subscription.receive(&tx, &cancel).await;

        dispatch_cancel.cancel();
        drop(tx);
        let stats = dispatcher.await?;

        if let Err(e) = received {
            error!(error = %e, "Relay stopped on receive failure");
            return Err(RelayError::Receive(e));
        }
        info!("Relay stopped");
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use fluxrecv_core::Change;
    use fluxrecv_flux::{ChangeNotifier, FluxError};
    use fluxrecv_pubsub::memory::MemoryTransport;
    use fluxrecv_pubsub::{Code, PubsubError, ReceiveSettings, SubscriptionManager, TopicName};

    use super::*;

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChangeNotifier for Counting {
        async fn notify_change(&self, _change: &Change) -> Result<(), FluxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    const PAYLOAD: &str = r#"{"url":"https://example/repo","refUpdateEvent":{"refUpdates":{"refs/heads/master":{"refName":"refs/heads/master","updateType":"UPDATE_FAST_FORWARD","oldId":"c7a2","newId":"f007"}}}}"#;

    async fn subscription(transport: &Arc<MemoryTransport>) -> Subscription {
        transport.create_topic(&TopicName::new("p", "t")).await.unwrap();
        SubscriptionManager::new(transport.clone(), "p")
            .with_settings(ReceiveSettings {
                idle_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(20),
                ..Default::default()
            })
            .prepare(Some("t"), "s", Duration::from_secs(10))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn relays_until_cancelled() {
        let transport = Arc::new(MemoryTransport::new());
        let sub = subscription(&transport).await;
        let notifier = Arc::new(Counting::default());
        let relay = Relay::new(sub, Forwarder::new(notifier.clone(), Duration::from_secs(1)));

        for _ in 0..5 {
            transport.publish(&TopicName::new("p", "t"), PAYLOAD).await.unwrap();
        }

        let cancel = CancellationToken::new();
        let running = tokio::spawn(relay.run(cancel.clone()));
        while transport.acked().await.len() < 5 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();

        let stats = running.await.unwrap().unwrap();
        assert_eq!(stats.acked, 5);
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn keeps_running_when_a_token_refresh_fails() {
        let transport = Arc::new(MemoryTransport::new());
        let sub = subscription(&transport).await;
        transport
            .inject_pull_failure(PubsubError::Credentials(
                "metadata server unreachable: timed out".into(),
            ))
            .await;
        transport.publish(&TopicName::new("p", "t"), PAYLOAD).await.unwrap();

        let relay = Relay::new(
            sub,
            Forwarder::new(Arc::new(Counting::default()), Duration::from_secs(1)),
        );
        let cancel = CancellationToken::new();
        let running = tokio::spawn(relay.run(cancel.clone()));
        while transport.acked().await.is_empty() {
            assert!(!running.is_finished(), "relay exited on a credentials failure");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();

        let stats = running.await.unwrap().unwrap();
        assert_eq!(stats.acked, 1);
        assert!(transport.pull_count().await >= 2);
    }

    #[tokio::test]
    async fn fatal_receive_error_stops_the_relay() {
        let transport = Arc::new(MemoryTransport::new());
        let sub = subscription(&transport).await;
        transport.inject_pull_error(Code::PermissionDenied).await;

        let relay = Relay::new(
            sub,
            Forwarder::new(Arc::new(Counting::default()), Duration::from_secs(1)),
        )
        .with_handoff_capacity(2);
        let err = relay.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RelayError::Receive(e) if e.code() == Some(Code::PermissionDenied)));
    }
}

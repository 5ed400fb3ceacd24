use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use fluxrecv_core::Change;
use fluxrecv_flux::{ChangeNotifier, FluxError, Forwarder};
use fluxrecv_pubsub::memory::MemoryTransport;
use fluxrecv_pubsub::{ReceiveSettings, Subscription, SubscriptionManager, TopicName};
use fluxrecv_relay::{DispatchStats, Relay};

const PROJECT: &str = "test-project";
const TOPIC: &str = "csr-events";
const SUB: &str = "flux-relay";

const FAST_FORWARD_MASTER: &str = r#"{"url":"https://example/repo","refUpdateEvent":{"refUpdates":{"refs/heads/master":{"refName":"refs/heads/master","updateType":"UPDATE_FAST_FORWARD","oldId":"c7a2","newId":"f007"}}}}"#;

/// Stands in for the Flux daemon.
#[derive(Default)]
struct StubFlux {
    delay: Option<Duration>,
    /// 1-based call numbers that fail.
    fail_calls: Vec<usize>,
    calls: AtomicUsize,
    seen: Mutex<Vec<Change>>,
}

#[async_trait]
impl ChangeNotifier for StubFlux {
    async fn notify_change(&self, change: &Change) -> Result<(), FluxError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_calls.contains(&n) {
            return Err(FluxError::Api {
                status: 500,
                message: "stub failure".into(),
            });
        }
        self.seen.lock().unwrap().push(change.clone());
        Ok(())
    }
}

fn topic() -> TopicName {
    TopicName::new(PROJECT, TOPIC)
}

fn fast_settings(max_outstanding: usize) -> ReceiveSettings {
    ReceiveSettings {
        max_outstanding_messages: max_outstanding,
        idle_backoff: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        ..Default::default()
    }
}

async fn setup(max_outstanding: usize) -> (Arc<MemoryTransport>, Subscription) {
    let transport = Arc::new(MemoryTransport::new());
    transport.create_topic(&topic()).await.unwrap();
    let sub = SubscriptionManager::new(transport.clone(), PROJECT)
        .with_settings(fast_settings(max_outstanding))
        .prepare(Some(TOPIC), SUB, Duration::from_secs(30))
        .await
        .unwrap();
    (transport, sub)
}

struct Running {
    cancel: CancellationToken,
    handle: tokio::task::JoinHandle<Result<DispatchStats, fluxrecv_relay::RelayError>>,
}

impl Running {
    async fn stop(self) -> DispatchStats {
        self.cancel.cancel();
        self.handle.await.unwrap().unwrap()
    }
}

fn start(sub: Subscription, flux: Arc<StubFlux>, timeout: Duration) -> Running {
    let cancel = CancellationToken::new();
    let relay = Relay::new(sub, Forwarder::new(flux, timeout));
    let handle = tokio::spawn(relay.run(cancel.clone()));
    Running { cancel, handle }
}

/// Poll until `check` holds; panics after five seconds.
async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// === Test 1: Fast-forward on master is forwarded and acked ===
#[tokio::test]
async fn test_end_to_end_success() {
    let (transport, sub) = setup(10).await;
    let flux = Arc::new(StubFlux::default());
    let id = transport.publish(&topic(), FAST_FORWARD_MASTER).await.unwrap();

    let running = start(sub, flux.clone(), Duration::from_secs(1));
    eventually(|| {
        let transport = transport.clone();
        async move { !transport.acked().await.is_empty() }
    })
    .await;
    let stats = running.stop().await;

    assert_eq!(transport.acked().await, vec![id]);
    assert!(transport.nacked().await.is_empty());
    assert_eq!(
        *flux.seen.lock().unwrap(),
        vec![Change::git_update("https://example/repo", "master")]
    );
    assert_eq!(stats.acked, 1);
}

// === Test 2: A Flux call that outlives the deadline gets the message nacked ===
#[tokio::test]
async fn test_end_to_end_timeout() {
    let (transport, sub) = setup(10).await;
    let flux = Arc::new(StubFlux {
        delay: Some(Duration::from_millis(500)),
        ..Default::default()
    });
    let id = transport.publish(&topic(), FAST_FORWARD_MASTER).await.unwrap();

    let running = start(sub, flux.clone(), Duration::from_millis(30));
    eventually(|| {
        let transport = transport.clone();
        async move { !transport.nacked().await.is_empty() }
    })
    .await;
    running.stop().await;

    assert!(transport.acked().await.is_empty());
    assert_eq!(transport.nacked().await[0], id);
    assert!(flux.seen.lock().unwrap().is_empty());
}

// === Test 3: Preparing the same subscription twice ===
#[tokio::test]
async fn test_prepare_twice_yields_usable_handles() {
    let transport = Arc::new(MemoryTransport::new());
    transport.create_topic(&topic()).await.unwrap();
    let manager = SubscriptionManager::new(transport.clone(), PROJECT).with_settings(fast_settings(10));

    let first = manager
        .prepare(Some(TOPIC), SUB, Duration::from_secs(30))
        .await
        .unwrap();
    let second = manager
        .prepare(Some(TOPIC), SUB, Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(first.name(), second.name());
    drop(first);

    let flux = Arc::new(StubFlux::default());
    transport.publish(&topic(), FAST_FORWARD_MASTER).await.unwrap();
    let running = start(second, flux.clone(), Duration::from_secs(1));
    eventually(|| {
        let transport = transport.clone();
        async move { transport.acked().await.len() == 1 }
    })
    .await;
    running.stop().await;
    assert_eq!(flux.calls.load(Ordering::SeqCst), 1);
}

// === Test 4: Outstanding messages never exceed the configured cap ===
#[tokio::test]
async fn test_outstanding_cap_is_respected() {
    let (transport, sub) = setup(3).await;
    let flux = Arc::new(StubFlux {
        delay: Some(Duration::from_millis(5)),
        ..Default::default()
    });
    for _ in 0..20 {
        transport.publish(&topic(), FAST_FORWARD_MASTER).await.unwrap();
    }

    let running = start(sub, flux.clone(), Duration::from_secs(1));
    eventually(|| {
        let transport = transport.clone();
        async move { transport.acked().await.len() == 20 }
    })
    .await;
    let stats = running.stop().await;

    assert_eq!(stats.acked, 20);
    assert!(transport.peak_leased().await <= 3);
    assert_eq!(flux.calls.load(Ordering::SeqCst), 20);
}

// === Test 5: One failed change stops the notification and it is redelivered ===
#[tokio::test]
async fn test_multi_update_fails_fast_then_redelivers() {
    let (transport, sub) = setup(10).await;
    let payload = r#"{"url":"https://example/repo","refUpdateEvent":{"refUpdates":{
        "refs/heads/a":{"refName":"refs/heads/a","updateType":"UPDATE_FAST_FORWARD"},
        "refs/heads/b":{"refName":"refs/heads/b","updateType":"CREATE"},
        "refs/heads/c":{"refName":"refs/heads/c","updateType":"DELETE"}}}}"#;
    let flux = Arc::new(StubFlux {
        fail_calls: vec![2],
        ..Default::default()
    });
    transport.publish(&topic(), payload).await.unwrap();

    let running = start(sub, flux.clone(), Duration::from_secs(1));
    eventually(|| {
        let transport = transport.clone();
        async move { transport.acked().await.len() == 1 }
    })
    .await;
    running.stop().await;

    // First delivery: one success, one failure, third never tried.
    // Second delivery: all three.
    assert_eq!(transport.nacked().await.len(), 1);
    assert_eq!(flux.calls.load(Ordering::SeqCst), 5);
    let mut branches: Vec<String> = flux
        .seen
        .lock()
        .unwrap()
        .iter()
        .map(|c| c.source.branch.clone())
        .collect();
    assert_eq!(branches.len(), 4);
    branches.sort();
    branches.dedup();
    assert_eq!(branches, vec!["a", "b", "c"]);
}

// === Test 6: Malformed payloads are nacked without stopping the relay ===
#[tokio::test]
async fn test_malformed_payload_does_not_stop_relay() {
    let (transport, sub) = setup(10).await;
    let flux = Arc::new(StubFlux::default());
    let bad = transport.publish(&topic(), "{not json").await.unwrap();
    let good = transport.publish(&topic(), FAST_FORWARD_MASTER).await.unwrap();

    let running = start(sub, flux.clone(), Duration::from_secs(1));
    eventually(|| {
        let transport = transport.clone();
        async move { transport.acked().await.len() == 1 }
    })
    .await;
    let stats = running.stop().await;

    assert_eq!(transport.acked().await, vec![good]);
    assert!(transport.nacked().await.contains(&bad));
    assert!(stats.rejected >= 1);
    assert_eq!(flux.calls.load(Ordering::SeqCst), 1);
}

// === Test 7: Notifications without ref updates are acked with no Flux call ===
#[tokio::test]
async fn test_empty_notification_is_acked() {
    let (transport, sub) = setup(10).await;
    let flux = Arc::new(StubFlux::default());
    transport
        .publish(&topic(), r#"{"url":"https://example/repo","refUpdateEvent":{"refUpdates":{}}}"#)
        .await
        .unwrap();

    let running = start(sub, flux.clone(), Duration::from_secs(1));
    eventually(|| {
        let transport = transport.clone();
        async move { transport.acked().await.len() == 1 }
    })
    .await;
    running.stop().await;
    assert_eq!(flux.calls.load(Ordering::SeqCst), 0);
}

// === Test 8: Shutdown with nothing to do is clean ===
#[tokio::test]
async fn test_idle_shutdown_is_clean() {
    let (transport, sub) = setup(10).await;
    let running = start(sub, Arc::new(StubFlux::default()), Duration::from_secs(1));
    eventually(|| {
        let transport = transport.clone();
        async move { transport.pull_count().await > 1 }
    })
    .await;
    assert_eq!(running.stop().await, DispatchStats::default());
}

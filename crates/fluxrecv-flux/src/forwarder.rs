use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use fluxrecv_core::Change;

use crate::notifier::ChangeNotifier;
use crate::ForwardError;

pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Sends one change downstream under its own deadline.
#[derive(Clone)]
pub struct Forwarder {
    notifier: Arc<dyn ChangeNotifier>,
    timeout: Duration,
}

impl Forwarder {
    pub fn new(notifier: Arc<dyn ChangeNotifier>, timeout: Duration) -> Self {
        Self { notifier, timeout }
    }

    /// The deadline starts when this is called, so every change of a
    /// notification gets the full timeout.
    pub async fn forward(&self, change: &Change) -> Result<(), ForwardError> {
        let url = &change.source.url;
        let branch = &change.source.branch;

        match tokio::time::timeout(self.timeout, self.notifier.notify_change(change)).await {
            Ok(Ok(())) => {
                debug!(%url, %branch, "Notified flux of change");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(%url, %branch, error = %e, "Error while calling downstream API");
                Err(ForwardError::Call(e))
            }
            Err(_) => {
                warn!(
                    %url,
                    %branch,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Timed out waiting for response from downstream API"
                );
                Err(ForwardError::Timeout {
                    after: self.timeout,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::{Layer, Registry};

    use super::*;
    use crate::FluxError;

    /// Records the level of every event emitted while installed.
    #[derive(Clone, Default)]
    struct Levels(Arc<Mutex<Vec<Level>>>);

    impl<S: Subscriber> Layer<S> for Levels {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            self.0.lock().unwrap().push(*event.metadata().level());
        }
    }

    impl Levels {
        async fn during<F: std::future::Future>(&self, fut: F) -> F::Output {
            let _guard = tracing::subscriber::set_default(Registry::default().with(self.clone()));
            fut.await
        }

        fn take(&self) -> Vec<Level> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }
    }

    struct Slow {
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ChangeNotifier for Slow {
        async fn notify_change(&self, _change: &Change) -> Result<(), FluxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl ChangeNotifier for Failing {
        async fn notify_change(&self, _change: &Change) -> Result<(), FluxError> {
            Err(FluxError::Api {
                status: 503,
                message: "unavailable".into(),
            })
        }
    }

    fn change() -> Change {
        Change::git_update("https://example/repo", "master")
    }

    #[tokio::test]
    async fn completes_within_deadline() {
        let notifier = Arc::new(Slow {
            delay: Duration::from_millis(5),
            calls: AtomicUsize::new(0),
        });
        let forwarder = Forwarder::new(notifier.clone(), Duration::from_secs(1));
        forwarder.forward(&change()).await.unwrap();
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn slow_call_is_a_timeout() {
        let notifier = Arc::new(Slow {
            delay: Duration::from_secs(5),
            calls: AtomicUsize::new(0),
        });
        let forwarder = Forwarder::new(notifier, Duration::from_millis(20));
        let err = forwarder.forward(&change()).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(matches!(err, ForwardError::Timeout { after } if after == Duration::from_millis(20)));
    }

    #[tokio::test]
    async fn downstream_error_is_a_call_failure() {
        let forwarder = Forwarder::new(Arc::new(Failing), Duration::from_secs(1));
        let err = forwarder.forward(&change()).await.unwrap_err();
        assert!(!err.is_timeout());
        assert!(matches!(err, ForwardError::Call(FluxError::Api { status: 503, .. })));
    }

    #[tokio::test]
    async fn each_forward_gets_a_fresh_deadline() {
        // Two 30ms calls under a 50ms timeout: a shared deadline would expire
        // during the second one.
        let notifier = Arc::new(Slow {
            delay: Duration::from_millis(30),
            calls: AtomicUsize::new(0),
        });
        let forwarder = Forwarder::new(notifier.clone(), Duration::from_millis(50));
        forwarder.forward(&change()).await.unwrap();
        forwarder.forward(&change()).await.unwrap();
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn timeouts_warn_and_call_failures_error() {
        let levels = Levels::default();

        let slow = Forwarder::new(
            Arc::new(Slow {
                delay: Duration::from_secs(5),
                calls: AtomicUsize::new(0),
            }),
            Duration::from_millis(20),
        );
        levels.during(slow.forward(&change())).await.unwrap_err();
        assert_eq!(levels.take(), vec![Level::WARN]);

        let failing = Forwarder::new(Arc::new(Failing), Duration::from_secs(1));
        levels.during(failing.forward(&change())).await.unwrap_err();
        assert_eq!(levels.take(), vec![Level::ERROR]);
    }
}

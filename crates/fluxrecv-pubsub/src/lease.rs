//! Ack deadline keep-alive for held messages.
//!
//! Every message pulled by the receive loop holds a [`Lease`] until it is
//! acked, nacked or dropped. While any lease is held, [`keep_alive`] pushes
//! the deadline of all held ack ids back on a fixed period, so a message
//! queued behind a slow dispatcher is not redelivered under our feet.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::names::SubscriptionName;
use crate::transport::PullTransport;

#[derive(Debug, Default)]
pub(crate) struct LeaseSet {
    ack_ids: Mutex<HashSet<String>>,
}

impl LeaseSet {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn hold(self: &Arc<Self>, ack_id: &str) -> Lease {
        self.locked().insert(ack_id.to_string());
        Lease {
            ack_id: ack_id.to_string(),
            set: Arc::clone(self),
        }
    }

    pub(crate) fn held(&self) -> Vec<String> {
        self.locked().iter().cloned().collect()
    }

    fn locked(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.ack_ids.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases its ack id from the keep-alive set on drop.
#[derive(Debug)]
pub(crate) struct Lease {
    ack_id: String,
    set: Arc<LeaseSet>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.set.locked().remove(&self.ack_id);
    }
}

/// Extend every held ack id to `deadline` each `every`. Returns once the
/// set itself is gone, that is when the receive loop has stopped and every
/// message it produced has been settled or dropped.
pub(crate) async fn keep_alive(
    transport: Arc<dyn PullTransport>,
    subscription: SubscriptionName,
    leases: Weak<LeaseSet>,
    deadline: Duration,
    every: Duration,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(set) = leases.upgrade() else {
            break;
        };
        let ack_ids = set.held();
        drop(set);
        if ack_ids.is_empty() {
            continue;
        }

        debug!(%subscription, count = ack_ids.len(), "Extending ack deadlines");
        if let Err(e) = transport
            .modify_ack_deadline(&subscription, &ack_ids, deadline)
            .await
        {
            warn!(%subscription, error = %e, "Failed to extend ack deadlines");
        }
    }
    debug!(%subscription, "Lease keep-alive stopped");
}

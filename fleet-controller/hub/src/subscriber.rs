use crate::{watch, HubMetrics, Inner, Message, Status};
use ahash::AHashSet as HashSet;
use fleet_controller_core::{ClusterId, Error, Identity, ResourceRef, WatchSubscription};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

/// One watch channel connection.
///
/// Dropping a subscriber releases every subscription it holds.
pub struct Subscriber {
    hub: Arc<Inner>,
    shared: Arc<Shared>,
    subscriptions: Mutex<HashSet<WatchSubscription>>,
}

/// The part of a subscriber that watches publish to.
pub(crate) struct Shared {
    pub(crate) id: u64,
    cluster: ClusterId,
    identity: Identity,
    tx: mpsc::Sender<Message>,
    overflowed: CancellationToken,
    metrics: HubMetrics,
}

// === impl Subscriber ===

impl Subscriber {
    pub(crate) fn new(
        hub: Arc<Inner>,
        id: u64,
        cluster: ClusterId,
        identity: Identity,
        tx: mpsc::Sender<Message>,
    ) -> Self {
        hub.metrics.subscribers.inc();
        let shared = Arc::new(Shared {
            id,
            cluster,
            identity,
            tx,
            overflowed: CancellationToken::new(),
            metrics: hub.metrics.clone(),
        });
        Self {
            hub,
            shared,
            subscriptions: Default::default(),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn cluster(&self) -> &ClusterId {
        &self.shared.cluster
    }

    pub fn identity(&self) -> &Identity {
        &self.shared.identity
    }

    /// Subscribes to a resource on this subscriber's cluster.
    ///
    /// The subscriber is sent an acknowledgement followed by the resource's current state and
    /// then every subsequent change its scope permits. Subscribing again is a no-op apart from
    /// the acknowledgement.
    pub fn subscribe(&self, resource: ResourceRef) -> Result<(), Error> {
        resource.validate().map_err(Error::Protocol)?;
        let subscription = WatchSubscription::new(self.shared.cluster.clone(), resource);
        if !self.shared.identity.permissions.may_watch(&subscription) {
            return Err(Error::Unauthorized);
        }
        if self.shared.overflowed.is_cancelled() {
            return Err(Error::Backpressure);
        }

        let mut subscriptions = self.subscriptions.lock();
        if subscriptions.contains(&subscription) {
            self.shared.push(Status::Subscribed {
                resource: subscription.resource,
            });
            return Ok(());
        }
        watch::attach(&self.hub, &subscription, self.shared.clone());
        subscriptions.insert(subscription);
        Ok(())
    }

    /// Releases a subscription. Returns false if the resource was not subscribed.
    pub fn unsubscribe(&self, resource: &ResourceRef) -> bool {
        let subscription = WatchSubscription::new(self.shared.cluster.clone(), resource.clone());
        if !self.subscriptions.lock().remove(&subscription) {
            return false;
        }
        watch::detach(&self.hub, &subscription, self.shared.id);
        self.shared.push(Status::Unsubscribed {
            resource: resource.clone(),
        });
        true
    }

    pub fn subscriptions(&self) -> Vec<ResourceRef> {
        let mut resources = self
            .subscriptions
            .lock()
            .iter()
            .map(|s| s.resource.clone())
            .collect::<Vec<_>>();
        resources.sort();
        resources
    }

    /// Completes if the hub disconnects this subscriber for letting its queue fill.
    pub async fn disconnected(&self) -> Error {
        self.shared.overflowed.cancelled().await;
        Error::Backpressure
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        for subscription in self.subscriptions.get_mut().drain() {
            watch::detach(&self.hub, &subscription, self.shared.id);
        }
        self.hub.metrics.subscribers.dec();
        tracing::debug!(subscriber = self.shared.id, "Subscriber released");
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.shared.id)
            .field("cluster", &self.shared.cluster)
            .field("user", &self.shared.identity.user_id)
            .finish_non_exhaustive()
    }
}

// === impl Shared ===

impl Shared {
    /// Queues a message without waiting. Returns false if the subscriber can no longer receive
    /// messages, either because its connection is gone or because it fell behind.
    pub(crate) fn push(&self, msg: impl Into<Message>) -> bool {
        if self.overflowed.is_cancelled() {
            return false;
        }
        match self.tx.try_send(msg.into()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    subscriber = self.id,
                    user = %self.identity.user_id,
                    "Subscriber is not keeping up with events; disconnecting",
                );
                self.metrics.backpressure_disconnects.inc();
                self.overflowed.cancel();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    pub(crate) fn permits(
        &self,
        subscription: &WatchSubscription,
        namespace: Option<&str>,
    ) -> bool {
        self.identity
            .permissions
            .permits_event(subscription, namespace)
    }
}

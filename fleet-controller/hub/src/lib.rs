#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Shares upstream Kubernetes watches among watch channel subscribers.
//!
//! The hub holds one upstream watch per [`WatchSubscription`] that has at least one subscriber.
//! Each upstream event is filtered against every subscriber's scope and queued on that
//! subscriber's bounded outbound queue. A subscriber that lets its queue fill is disconnected
//! rather than allowed to stall the watch.

mod message;
mod metrics;
mod subscriber;
mod watch;


pub use self::{
    message::{Message, ObjectEvent, Status},
    metrics::HubMetrics,
    subscriber::Subscriber,
    watch::Phase,
};
use ahash::AHashMap as HashMap;
use fleet_controller_core::{Backoff, ClusterId, Error, Identity, WatchSubscription};
use futures::stream::BoxStream;
use kube::core::DynamicObject;
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::mpsc;

/// Opens upstream watches.
///
/// When `resume` is `None`, the stream must begin with a [`UpstreamEvent::Listed`] snapshot of the
/// resource's current state; the hub diffs each snapshot against what it has already published,
/// so that a watch that restarts never silently drops a deletion. Otherwise the stream continues
/// from the given resource version, failing with [`WatchError::Gone`] if it has expired.
#[async_trait::async_trait]
pub trait Upstream: Send + Sync + 'static {
    async fn open(
        &self,
        subscription: &WatchSubscription,
        resume: Option<&str>,
    ) -> Result<UpstreamStream, WatchError>;
}

pub type UpstreamStream = BoxStream<'static, Result<UpstreamEvent, WatchError>>;

#[derive(Clone, Debug, PartialEq)]
pub enum UpstreamEvent {
    /// The complete current state of the watched resource.
    Listed(Vec<DynamicObject>),
    Applied(DynamicObject),
    Deleted(DynamicObject),
    /// The resource version the stream has reached, without any change to publish.
    Bookmark(String),
}

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum WatchError {
    /// The watch's resource version has expired, so the resource must be listed again.
    #[error("resource version is too old")]
    Gone,

    #[error(transparent)]
    Upstream(#[from] Error),
}

#[derive(Clone, Debug)]
pub struct Config {
    /// The number of messages that may be queued for a subscriber.
    pub queue_depth: usize,
    pub backoff: Backoff,
    /// Subscribers are told a watch is degraded after this many consecutive failures.
    pub degraded_after: u32,
}

#[derive(Clone)]
pub struct Hub {
    inner: Arc<Inner>,
}

struct Inner {
    upstream: Arc<dyn Upstream>,
    config: Config,
    metrics: HubMetrics,
    watches: Mutex<HashMap<WatchSubscription, Arc<watch::Watch>>>,
    next_subscriber: AtomicU64,
}

// === impl Config ===

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_depth: 256,
            backoff: Backoff::default(),
            degraded_after: 5,
        }
    }
}

// === impl Hub ===

impl Hub {
    pub fn new(upstream: Arc<dyn Upstream>, config: Config, metrics: HubMetrics) -> Self {
        Self {
            inner: Arc::new(Inner {
                upstream,
                config,
                metrics,
                watches: Default::default(),
                next_subscriber: AtomicU64::new(0),
            }),
        }
    }

    /// Creates a subscriber for a watch channel on `cluster`, returning it with the receiving end
    /// of its outbound queue.
    pub fn subscriber(
        &self,
        cluster: ClusterId,
        identity: Identity,
    ) -> (Subscriber, mpsc::Receiver<Message>) {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(self.inner.config.queue_depth.max(1));
        let subscriber = Subscriber::new(self.inner.clone(), id, cluster, identity, tx);
        (subscriber, rx)
    }

    /// The phase of the upstream watch for `subscription`, if one is running.
    pub fn phase(&self, subscription: &WatchSubscription) -> Option<Phase> {
        let watch = self.inner.watches.lock().get(subscription).cloned()?;
        Some(watch.phase())
    }

    /// The number of upstream watches.
    pub fn watches(&self) -> usize {
        self.inner.watches.lock().len()
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("watches", &self.watches())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

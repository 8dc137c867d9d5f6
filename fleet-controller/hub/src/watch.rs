use crate::{
    subscriber::Shared as Subscriber, Config, HubMetrics, Inner, ObjectEvent, Status, Upstream,
    UpstreamEvent, WatchError,
};
use ahash::AHashMap as HashMap;
use fleet_controller_core::{Error, EventType, WatchSubscription};
use futures::prelude::*;
use kube::core::DynamicObject;
use parking_lot::Mutex;
use std::{collections::BTreeMap, sync::Arc};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument};

/// The lifecycle of a shared upstream watch.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// Opening the upstream watch.
    Starting,
    Streaming,
    /// Waiting to reopen after the upstream watch failed.
    Retrying,
    /// The last subscriber left; the upstream watch is torn down.
    Stopped,
}

pub(crate) struct Watch {
    subscription: WatchSubscription,
    state: Mutex<State>,
    stop: CancellationToken,
}

struct State {
    phase: Phase,
    subscribers: HashMap<u64, Arc<Subscriber>>,
    objects: BTreeMap<ObjectKey, Arc<DynamicObject>>,
    degraded: bool,
}

/// Namespace and name.
type ObjectKey = (Option<String>, String);

/// Carried across restarts of the upstream watch.
#[derive(Default)]
struct Progress {
    /// Consecutive failures to open or read the upstream watch.
    failures: u32,
    /// Consecutive restarts of watches that ended soon after opening.
    restarts: u32,
    resource_version: Option<String>,
}

/// Adds a subscriber to the watch for `subscription`, starting the watch if it has no other
/// subscribers.
pub(crate) fn attach(hub: &Inner, subscription: &WatchSubscription, subscriber: Arc<Subscriber>) {
    let mut watches = hub.watches.lock();
    let watch = match watches.get(subscription) {
        Some(watch) => watch.clone(),
        None => {
            let watch = Arc::new(Watch::new(subscription.clone()));
            watches.insert(subscription.clone(), watch.clone());
            hub.metrics.watches.inc();
            watch.set_phase(Phase::Starting);
            let span = info_span!(
                "watch",
                cluster = %subscription.cluster,
                resource = %subscription.resource,
            );
            tokio::spawn(
                watch
                    .clone()
                    .run(
                        hub.upstream.clone(),
                        hub.config.clone(),
                        hub.metrics.clone(),
                    )
                    .instrument(span),
            );
            watch
        }
    };

    // The acknowledgement and the current state are queued under the watch's lock so that they
    // precede any event published afterwards.
    let mut state = watch.state.lock();
    let resource = &subscription.resource;
    let mut live = subscriber.push(Status::Subscribed {
        resource: resource.clone(),
    });
    for object in state.objects.values() {
        if !live {
            break;
        }
        if subscriber.permits(subscription, object.metadata.namespace.as_deref()) {
            live = subscriber.push(ObjectEvent {
                event_type: EventType::Added,
                resource: resource.clone(),
                object: object.clone(),
            });
        }
    }
    if live && state.degraded {
        subscriber.push(Status::Degraded {
            resource: resource.clone(),
            message: None,
        });
    }
    state.subscribers.insert(subscriber.id, subscriber);
    debug!(
        cluster = %subscription.cluster,
        resource = %subscription.resource,
        subscribers = state.subscribers.len(),
        "Subscribed",
    );
}

/// Removes a subscriber from the watch for `subscription`, stopping the watch if no
/// subscribers remain.
pub(crate) fn detach(hub: &Inner, subscription: &WatchSubscription, subscriber: u64) {
    let mut watches = hub.watches.lock();
    let Some(watch) = watches.get(subscription).cloned() else {
        return;
    };
    let mut state = watch.state.lock();
    state.subscribers.remove(&subscriber);
    if state.subscribers.is_empty() {
        state.phase = Phase::Stopped;
        watch.stop.cancel();
        drop(state);
        watches.remove(subscription);
        hub.metrics.watches.dec();
        debug!(
            cluster = %subscription.cluster,
            resource = %subscription.resource,
            "Stopped watch",
        );
    }
}

// === impl Watch ===

impl Watch {
    fn new(subscription: WatchSubscription) -> Self {
        Self {
            subscription,
            state: Mutex::new(State {
                phase: Phase::Idle,
                subscribers: HashMap::default(),
                objects: BTreeMap::new(),
                degraded: false,
            }),
            stop: CancellationToken::new(),
        }
    }

    pub(crate) fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    fn set_phase(&self, phase: Phase) {
        let mut state = self.state.lock();
        if state.phase != Phase::Stopped && state.phase != phase {
            trace!(from = ?state.phase, to = ?phase, "Phase changed");
            state.phase = phase;
        }
    }

    async fn run(
        self: Arc<Self>,
        upstream: Arc<dyn Upstream>,
        config: Config,
        metrics: HubMetrics,
    ) {
        let mut progress = Progress::default();
        loop {
            let opened_at = time::Instant::now();
            let ended = tokio::select! {
                biased;
                _ = self.stop.cancelled() => return,
                ended = self.stream(&*upstream, &mut progress, &metrics) => ended,
            };
            metrics.restarts.inc();
            self.set_phase(Phase::Retrying);

            let delay = match ended {
                Err(WatchError::Upstream(error)) => {
                    progress.failures = progress.failures.saturating_add(1);
                    let failures = progress.failures;
                    let delay = config.backoff.delay(failures);
                    info!(%error, failures, ?delay, "Watch failed");
                    if failures >= config.degraded_after {
                        self.degrade(&error);
                    }
                    delay
                }
                ended => {
                    if let Err(WatchError::Gone) = ended {
                        debug!("Resource version expired; listing again");
                        progress.resource_version = None;
                    }
                    // Upstream watches end periodically. Only those that end quickly back off
                    // further.
                    if opened_at.elapsed() >= config.backoff.max {
                        progress.restarts = 0;
                    }
                    progress.restarts = progress.restarts.saturating_add(1);
                    let delay = config.backoff.delay(progress.restarts);
                    debug!(restarts = progress.restarts, ?delay, "Watch ended");
                    delay
                }
            };
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => return,
                _ = time::sleep(delay) => {}
            }
        }
    }

    /// Opens the upstream watch and publishes its events until it ends.
    async fn stream(
        &self,
        upstream: &dyn Upstream,
        progress: &mut Progress,
        metrics: &HubMetrics,
    ) -> Result<(), WatchError> {
        self.set_phase(Phase::Starting);
        let mut events = upstream
            .open(&self.subscription, progress.resource_version.as_deref())
            .await?;
        self.set_phase(Phase::Streaming);
        while let Some(event) = events.next().await {
            let event = event?;
            if progress.failures > 0 {
                progress.failures = 0;
                self.recover();
            }
            match &event {
                UpstreamEvent::Applied(o) | UpstreamEvent::Deleted(o) => {
                    if let Some(rv) = &o.metadata.resource_version {
                        progress.resource_version = Some(rv.clone());
                    }
                }
                UpstreamEvent::Bookmark(rv) => progress.resource_version = Some(rv.clone()),
                UpstreamEvent::Listed(_) => {}
            }
            self.apply(event, metrics);
        }
        Ok(())
    }

    fn apply(&self, event: UpstreamEvent, metrics: &HubMetrics) {
        let mut state = self.state.lock();
        let State {
            objects,
            subscribers,
            ..
        } = &mut *state;

        match event {
            UpstreamEvent::Applied(object) => {
                let object = Arc::new(object);
                let event_type = match objects.insert(key(&object), object.clone()) {
                    // A resumed watch may replay changes that were already published.
                    Some(prior) if !changed(&prior, &object) => return,
                    Some(_) => EventType::Modified,
                    None => EventType::Added,
                };
                self.publish(subscribers, event_type, object, metrics);
            }

            UpstreamEvent::Deleted(object) => {
                objects.remove(&key(&object));
                self.publish(subscribers, EventType::Deleted, Arc::new(object), metrics);
            }

            UpstreamEvent::Listed(listed) => {
                // Diff the listing against the published state. Whatever is left in `objects`
                // afterwards was deleted while the watch was not looking.
                let mut changes = Vec::new();
                let mut current = BTreeMap::new();
                for object in listed {
                    let key = key(&object);
                    let object = Arc::new(object);
                    match objects.remove(&key) {
                        None => changes.push((EventType::Added, object.clone())),
                        Some(prior) if changed(&prior, &object) => {
                            changes.push((EventType::Modified, object.clone()))
                        }
                        Some(_) => {}
                    }
                    current.insert(key, object);
                }
                for (_, deleted) in std::mem::replace(objects, current) {
                    changes.push((EventType::Deleted, deleted));
                }
                trace!(changes = changes.len(), "Listed");
                for (event_type, object) in changes {
                    self.publish(subscribers, event_type, object, metrics);
                }
            }

            UpstreamEvent::Bookmark(_) => {}
        }
    }

    fn publish(
        &self,
        subscribers: &mut HashMap<u64, Arc<Subscriber>>,
        event_type: EventType,
        object: Arc<DynamicObject>,
        metrics: &HubMetrics,
    ) {
        metrics.events.inc();
        let namespace = object.metadata.namespace.as_deref();
        subscribers.retain(|_, subscriber| {
            // Subscribers outside the event's scope are skipped entirely.
            if !subscriber.permits(&self.subscription, namespace) {
                return true;
            }
            subscriber.push(ObjectEvent {
                event_type,
                resource: self.subscription.resource.clone(),
                object: object.clone(),
            })
        });
    }

    fn degrade(&self, error: &Error) {
        let mut state = self.state.lock();
        if state.degraded {
            return;
        }
        state.degraded = true;
        warn!(%error, "Watch is degraded");
        let status = Status::Degraded {
            resource: self.subscription.resource.clone(),
            message: Some(error.to_string()),
        };
        state
            .subscribers
            .retain(|_, subscriber| subscriber.push(status.clone()));
    }

    fn recover(&self) {
        let mut state = self.state.lock();
        if !state.degraded {
            return;
        }
        state.degraded = false;
        info!("Watch recovered");
        let status = Status::Recovered {
            resource: self.subscription.resource.clone(),
        };
        state
            .subscribers
            .retain(|_, subscriber| subscriber.push(status.clone()));
    }
}

fn key(object: &DynamicObject) -> ObjectKey {
    (
        object.metadata.namespace.clone(),
        object.metadata.name.clone().unwrap_or_default(),
    )
}

fn changed(prior: &DynamicObject, object: &DynamicObject) -> bool {
    match (
        &prior.metadata.resource_version,
        &object.metadata.resource_version,
    ) {
        (Some(a), Some(b)) => a != b,
        _ => prior != object,
    }
}

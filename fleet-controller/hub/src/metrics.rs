use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct HubMetrics {
    pub(crate) watches: Gauge,
    pub(crate) subscribers: Gauge,
    pub(crate) events: Counter,
    pub(crate) restarts: Counter,
    pub(crate) backpressure_disconnects: Counter,
}

impl HubMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let watches = Gauge::default();
        prom.register(
            "watches",
            "The number of shared upstream watches",
            watches.clone(),
        );

        let subscribers = Gauge::default();
        prom.register(
            "subscribers",
            "The number of connected watch subscribers",
            subscribers.clone(),
        );

        let events = Counter::default();
        prom.register(
            "events",
            "Count of upstream events published to subscribers",
            events.clone(),
        );

        let restarts = Counter::default();
        prom.register(
            "restarts",
            "Count of upstream watch restarts",
            restarts.clone(),
        );

        let backpressure_disconnects = Counter::default();
        prom.register(
            "backpressure_disconnects",
            "Count of subscribers disconnected for falling behind",
            backpressure_disconnects.clone(),
        );

        Self {
            watches,
            subscribers,
            events,
            restarts,
            backpressure_disconnects,
        }
    }
}

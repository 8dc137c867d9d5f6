use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct TunnelMetrics {
    sessions: Gauge,
    rejections: Family<RejectionLabels, Counter>,
    requests: Family<RequestLabels, Counter>,
    stale_responses: Counter,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RejectionLabels {
    reason: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct RequestLabels {
    cluster: String,
    outcome: String,
}

impl TunnelMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let sessions = Gauge::default();
        prom.register(
            "sessions",
            "The number of open agent sessions",
            sessions.clone(),
        );

        let rejections = Family::default();
        prom.register(
            "handshake_rejections",
            "Count of agent handshakes that were refused",
            rejections.clone(),
        );

        let requests = Family::default();
        prom.register(
            "requests",
            "Count of requests sent to agents by outcome",
            requests.clone(),
        );

        let stale_responses = Counter::default();
        prom.register(
            "stale_responses",
            "Count of agent responses that matched no pending request",
            stale_responses.clone(),
        );

        Self {
            sessions,
            rejections,
            requests,
            stale_responses,
        }
    }

    pub(crate) fn session_opened(&self) {
        self.sessions.inc();
    }

    pub(crate) fn session_closed(&self) {
        self.sessions.dec();
    }

    pub(crate) fn rejected(&self, reason: &str) {
        self.rejections
            .get_or_create(&RejectionLabels {
                reason: reason.to_string(),
            })
            .inc();
    }

    pub(crate) fn request(&self, cluster: &str, outcome: &str) {
        self.requests
            .get_or_create(&RequestLabels {
                cluster: cluster.to_string(),
                outcome: outcome.to_string(),
            })
            .inc();
    }

    pub(crate) fn stale_response(&self) {
        self.stale_responses.inc();
    }

    #[cfg(test)]
    pub(crate) fn stale_responses(&self) -> u64 {
        self.stale_responses.get()
    }
}

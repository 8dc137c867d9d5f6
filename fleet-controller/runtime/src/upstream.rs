use crate::{
    core::{tunnel::ProxyRequest, ClusterId, ConnectionType, Error, WatchSubscription},
    hub::{Upstream, UpstreamEvent, UpstreamStream, WatchError},
    registry::Registry,
    tunnel::TunnelServer,
};
use bytes::Bytes;
use futures::prelude::*;
use kube::{
    api::{Api, ListParams, WatchEvent, WatchParams},
    core::{DynamicObject, ObjectList},
};
use std::sync::Arc;
use tokio::time::{self, Duration};
use tracing::trace;

/// Upstream watches end after this long and are resumed by the hub.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// Opens hub watches against managed clusters.
///
/// Directly connected clusters are listed and then watched. Agent clusters are listed through
/// their tunnel at a fixed interval, and the hub diffs each listing into change events.
#[derive(Clone, Debug)]
pub struct ClusterUpstream {
    registry: Registry,
    tunnel: TunnelServer,
    poll_interval: Duration,
    request_timeout: Duration,
}

struct Poll {
    tunnel: TunnelServer,
    cluster: ClusterId,
    path: String,
    interval: Duration,
    timeout: Duration,
}

#[async_trait::async_trait]
impl Upstream for ClusterUpstream {
    async fn open(
        &self,
        subscription: &WatchSubscription,
        resume: Option<&str>,
    ) -> Result<UpstreamStream, WatchError> {
        let descriptor = self.registry.get(&subscription.cluster)?;
        match descriptor.connection_type() {
            ConnectionType::Direct => self.watch(subscription, resume).await,
            ConnectionType::Agent => Ok(self.poll(subscription)),
        }
    }
}

impl ClusterUpstream {
    pub fn new(
        registry: Registry,
        tunnel: TunnelServer,
        poll_interval: Duration,
        request_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            tunnel,
            poll_interval,
            request_timeout,
        }
    }

    async fn watch(
        &self,
        subscription: &WatchSubscription,
        resume: Option<&str>,
    ) -> Result<UpstreamStream, WatchError> {
        let client = self.registry.client(&subscription.cluster).await?;
        let resource = subscription.resource.api_resource();
        let api = match subscription.resource.namespace.as_deref() {
            Some(ns) => Api::<DynamicObject>::namespaced_with(client, ns, &resource),
            None => Api::<DynamicObject>::all_with(client, &resource),
        };

        let (listed, version) = match resume {
            Some(version) => (None, version.to_string()),
            None => {
                let list = api
                    .list(&ListParams::default())
                    .await
                    .map_err(api_error)?;
                let version = list.metadata.resource_version.unwrap_or_default();
                trace!(items = list.items.len(), %version, "Listed");
                (Some(list.items), version)
            }
        };

        let params = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        let watch_from = if version.is_empty() { "0" } else { version.as_str() };
        let events = api
            .watch(&params, watch_from)
            .await
            .map_err(api_error)?
            .map(watch_event);

        let head = listed
            .map(|items| Ok::<_, WatchError>(UpstreamEvent::Listed(items)))
            .into_iter()
            .chain((!version.is_empty()).then(|| Ok(UpstreamEvent::Bookmark(version))));
        Ok(stream::iter(head).chain(events).boxed())
    }

    fn poll(&self, subscription: &WatchSubscription) -> UpstreamStream {
        let poll = Arc::new(Poll {
            tunnel: self.tunnel.clone(),
            cluster: subscription.cluster.clone(),
            path: subscription.resource.list_path(),
            interval: self.poll_interval,
            timeout: self.request_timeout,
        });
        stream::unfold(true, move |first| {
            let poll = poll.clone();
            async move {
                if !first {
                    time::sleep(poll.interval).await;
                }
                Some((poll.list().await.map(UpstreamEvent::Listed), false))
            }
        })
        .boxed()
    }
}

impl Poll {
    /// Lists the resource through the tunnel as the agent's own service account.
    async fn list(&self) -> Result<Vec<DynamicObject>, WatchError> {
        let request = ProxyRequest {
            method: "GET".to_string(),
            path: self.path.clone(),
            query: None,
            headers: vec![("accept".to_string(), "application/json".to_string())],
            body: Bytes::new(),
            identity: None,
        };
        let rsp = self
            .tunnel
            .send(&self.cluster, request, self.timeout)
            .await?;
        match rsp.status_code {
            200..=299 => {}
            410 => return Err(WatchError::Gone),
            status => {
                return Err(Error::UpstreamUnreachable(format!(
                    "listing {} failed with status {status}",
                    self.path
                ))
                .into())
            }
        }
        let list = serde_json::from_slice::<ObjectList<DynamicObject>>(&rsp.body)
            .map_err(Error::protocol)?;
        Ok(list.items)
    }
}

fn watch_event(
    event: Result<WatchEvent<DynamicObject>, kube::Error>,
) -> Result<UpstreamEvent, WatchError> {
    match event.map_err(api_error)? {
        WatchEvent::Added(obj) | WatchEvent::Modified(obj) => Ok(UpstreamEvent::Applied(obj)),
        WatchEvent::Deleted(obj) => Ok(UpstreamEvent::Deleted(obj)),
        WatchEvent::Bookmark(bookmark) => Ok(UpstreamEvent::Bookmark(
            bookmark.metadata.resource_version,
        )),
        WatchEvent::Error(status) if status.code == 410 => Err(WatchError::Gone),
        WatchEvent::Error(status) => Err(Error::UpstreamUnreachable(status.message).into()),
    }
}

fn api_error(error: kube::Error) -> WatchError {
    match error {
        kube::Error::Api(status) if status.code == 410 => WatchError::Gone,
        error => Error::UpstreamUnreachable(error.to_string()).into(),
    }
}

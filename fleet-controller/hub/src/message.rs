use fleet_controller_core::{EventType, ResourceRef};
use kube::core::DynamicObject;
use serde::Serialize;
use std::sync::Arc;

/// A message queued for a watch channel subscriber.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Message {
    Event(ObjectEvent),
    Status(Status),
}

/// A change to a watched object.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ObjectEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub resource: ResourceRef,
    pub object: Arc<DynamicObject>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum Status {
    Subscribed {
        resource: ResourceRef,
    },
    Unsubscribed {
        resource: ResourceRef,
    },
    /// The upstream watch keeps failing; events may be delayed until it recovers.
    Degraded {
        resource: ResourceRef,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Recovered {
        resource: ResourceRef,
    },
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        resource: Option<ResourceRef>,
    },
}

impl From<ObjectEvent> for Message {
    fn from(event: ObjectEvent) -> Self {
        Self::Event(event)
    }
}

impl From<Status> for Message {
    fn from(status: Status) -> Self {
        Self::Status(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_shape() {
        let pods = ResourceRef::new("", "v1", "pods", Some("ns1".to_string()));
        let mut object = DynamicObject::new("web", &pods.api_resource()).within("ns1");
        object.types = None;
        let event = Message::from(ObjectEvent {
            event_type: EventType::Deleted,
            resource: pods.clone(),
            object: Arc::new(object),
        });
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "type": "DELETED",
                "resource": {"group": "", "version": "v1", "resource": "pods", "namespace": "ns1"},
                "object": {"metadata": {"name": "web", "namespace": "ns1"}},
            })
        );

        let status = Message::from(Status::Degraded {
            resource: pods,
            message: None,
        });
        assert_eq!(
            serde_json::to_value(&status).unwrap(),
            json!({
                "type": "DEGRADED",
                "resource": {"group": "", "version": "v1", "resource": "pods", "namespace": "ns1"},
            })
        );
    }
}

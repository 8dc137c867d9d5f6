use crate::ClusterId;
use kube::core::ApiResource;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one upstream watch: a resource type, optionally narrowed to a namespace, on one
/// cluster.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchSubscription {
    pub cluster: ClusterId,
    pub resource: ResourceRef,
}

/// The cluster-relative part of a subscription, as named by watch channel clients.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

// === impl WatchSubscription ===

impl WatchSubscription {
    pub fn new(cluster: ClusterId, resource: ResourceRef) -> Self {
        Self { cluster, resource }
    }
}

impl fmt::Display for WatchSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster, self.resource)
    }
}

// === impl ResourceRef ===

impl ResourceRef {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        resource: impl Into<String>,
        namespace: Option<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            resource: resource.into(),
            namespace,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let segment = |name: &str, value: &str| {
            if value.contains('/') || value.contains('?') {
                return Err(format!("{name} must be a single path segment"));
            }
            Ok(())
        };
        if self.version.is_empty() {
            return Err("version must be set".to_string());
        }
        if self.resource.is_empty() {
            return Err("resource must be set".to_string());
        }
        segment("group", &self.group)?;
        segment("version", &self.version)?;
        segment("resource", &self.resource)?;
        if let Some(ns) = &self.namespace {
            if ns.is_empty() {
                return Err("namespace must not be empty".to_string());
            }
            segment("namespace", ns)?;
        }
        Ok(())
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Describes the resource for dynamic API access. The kind is not known from a
    /// subscription, so only the plural is meaningful.
    pub fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.group.clone(),
            version: self.version.clone(),
            api_version: self.api_version(),
            kind: String::new(),
            plural: self.resource.clone(),
        }
    }

    /// The API server path that lists this resource.
    pub fn list_path(&self) -> String {
        let mut path = if self.group.is_empty() {
            format!("/api/{}", self.version)
        } else {
            format!("/apis/{}/{}", self.group, self.version)
        };
        if let Some(ns) = &self.namespace {
            path.push_str("/namespaces/");
            path.push_str(ns);
        }
        path.push('/');
        path.push_str(&self.resource);
        path
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.resource)?;
        if let Some(ns) = &self.namespace {
            write!(f, "@{ns}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_paths() {
        let pods = ResourceRef::new("", "v1", "pods", Some("ns1".into()));
        assert_eq!(pods.list_path(), "/api/v1/namespaces/ns1/pods");
        assert_eq!(pods.api_version(), "v1");

        let deploys = ResourceRef::new("apps", "v1", "deployments", None);
        assert_eq!(deploys.list_path(), "/apis/apps/v1/deployments");
        assert_eq!(deploys.api_resource().api_version, "apps/v1");
    }

    #[test]
    fn validation() {
        assert!(ResourceRef::new("", "v1", "pods", None).validate().is_ok());
        assert!(ResourceRef::new("", "", "pods", None).validate().is_err());
        assert!(ResourceRef::new("", "v1", "pods/log", None).validate().is_err());
        assert!(ResourceRef::new("", "v1", "pods", Some("".into()))
            .validate()
            .is_err());
    }

    #[test]
    fn wire_shape() {
        let r: ResourceRef =
            serde_json::from_str(r#"{"version":"v1","resource":"pods","namespace":"ns1"}"#)
                .unwrap();
        assert_eq!(r, ResourceRef::new("", "v1", "pods", Some("ns1".into())));
        assert_eq!(
            serde_json::to_value(EventType::Deleted).unwrap(),
            serde_json::json!("DELETED")
        );
    }
}

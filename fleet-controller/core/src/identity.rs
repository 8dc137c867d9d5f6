//! Verified caller identities and the RBAC scope attached to them.
//!
//! Identities are produced by an external authentication step; this crate only consumes them. A
//! [`Scope`] is a list of allow rules. Every rule field defaults to `*` when omitted, and an
//! explicitly empty list matches nothing.

use crate::{ClusterId, WatchSubscription};
use serde::{Deserialize, Serialize};

pub const WILDCARD: &str = "*";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub permissions: Scope,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scope(Vec<Rule>);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default = "wildcard")]
    pub clusters: Vec<String>,
    #[serde(default = "wildcard")]
    pub namespaces: Vec<String>,
    /// Resource plurals, optionally qualified by API group (`apps/deployments`).
    #[serde(default = "wildcard")]
    pub resources: Vec<String>,
    #[serde(default = "wildcard")]
    pub verbs: Vec<String>,
}

fn wildcard() -> Vec<String> {
    vec![WILDCARD.to_string()]
}

// === impl Identity ===

impl Identity {
    /// The user name presented to upstream API servers.
    pub fn impersonation_name(&self) -> &str {
        if self.email.is_empty() {
            &self.user_id
        } else {
            &self.email
        }
    }
}

// === impl Scope ===

impl Scope {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self(rules)
    }

    /// A scope that permits everything.
    pub fn all() -> Self {
        Self(vec![Rule::all()])
    }

    pub fn rules(&self) -> &[Rule] {
        &self.0
    }

    /// Tests whether `verb` is allowed on `group/resource` in `namespace` of `cluster`.
    ///
    /// A `None` namespace denotes a cluster-scoped object (or a cluster-wide request) and is only
    /// permitted by rules granting all namespaces.
    pub fn permits(
        &self,
        cluster: &ClusterId,
        namespace: Option<&str>,
        group: &str,
        resource: &str,
        verb: &str,
    ) -> bool {
        self.0.iter().any(|r| {
            r.matches_cluster(cluster)
                && r.matches_resource(group, resource)
                && r.matches_verb(verb)
                && match namespace {
                    Some(ns) => r.matches_namespace(ns),
                    None => r.namespaces.iter().any(|n| n == WILDCARD),
                }
        })
    }

    /// Tests whether any rule applies to `cluster`.
    pub fn sees_cluster(&self, cluster: &ClusterId) -> bool {
        self.0.iter().any(|r| r.matches_cluster(cluster))
    }

    /// Tests whether a subscriber may open a watch at all.
    ///
    /// A cluster-wide watch is allowed when any namespace is visible; its events are then
    /// filtered per object by [`Scope::permits_event`].
    pub fn may_watch(&self, sub: &WatchSubscription) -> bool {
        let res = &sub.resource;
        self.0.iter().any(|r| {
            r.matches_cluster(&sub.cluster)
                && r.matches_resource(&res.group, &res.resource)
                && r.matches_verb("watch")
                && match res.namespace.as_deref() {
                    Some(ns) => r.matches_namespace(ns),
                    None => !r.namespaces.is_empty(),
                }
        })
    }

    /// Tests whether an event for an object in `namespace` may be delivered.
    pub fn permits_event(&self, sub: &WatchSubscription, namespace: Option<&str>) -> bool {
        let res = &sub.resource;
        self.permits(&sub.cluster, namespace, &res.group, &res.resource, "watch")
    }
}

// === impl Rule ===

impl Rule {
    pub fn all() -> Self {
        Self {
            clusters: wildcard(),
            namespaces: wildcard(),
            resources: wildcard(),
            verbs: wildcard(),
        }
    }

    fn matches_cluster(&self, cluster: &ClusterId) -> bool {
        self.clusters
            .iter()
            .any(|c| c == WILDCARD || c == cluster.as_str())
    }

    fn matches_namespace(&self, ns: &str) -> bool {
        self.namespaces.iter().any(|n| n == WILDCARD || n == ns)
    }

    fn matches_verb(&self, verb: &str) -> bool {
        self.verbs.iter().any(|v| v == WILDCARD || v == verb)
    }

    fn matches_resource(&self, group: &str, resource: &str) -> bool {
        self.resources.iter().any(|r| {
            if r == WILDCARD {
                return true;
            }
            match r.split_once('/') {
                Some((g, res)) => g == group && (res == WILDCARD || res == resource),
                None => r == resource,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ResourceRef;

    fn pods(cluster: &str, namespace: Option<&str>) -> WatchSubscription {
        WatchSubscription::new(
            ClusterId::new(cluster),
            ResourceRef::new("", "v1", "pods", namespace.map(Into::into)),
        )
    }

    #[test]
    fn omitted_fields_are_wildcards() {
        let scope: Scope = serde_json::from_str(r#"[{"namespaces": ["ns1"]}]"#).unwrap();
        let c1 = ClusterId::new("c1");
        assert!(scope.permits(&c1, Some("ns1"), "", "pods", "get"));
        assert!(scope.permits(&c1, Some("ns1"), "apps", "deployments", "delete"));
        assert!(!scope.permits(&c1, Some("ns2"), "", "pods", "get"));
        assert!(!scope.permits(&c1, None, "", "nodes", "get"));
    }

    #[test]
    fn empty_scope_denies() {
        let scope = Scope::default();
        assert!(!scope.may_watch(&pods("c1", None)));
        assert!(!scope.permits(&ClusterId::new("c1"), Some("ns1"), "", "pods", "get"));
    }

    #[test]
    fn group_qualified_resources() {
        let scope = Scope::new(vec![Rule {
            resources: vec!["apps/deployments".into(), "batch/*".into()],
            ..Rule::all()
        }]);
        let c1 = ClusterId::new("c1");
        assert!(scope.permits(&c1, Some("a"), "apps", "deployments", "list"));
        assert!(!scope.permits(&c1, Some("a"), "", "deployments", "list"));
        assert!(scope.permits(&c1, Some("a"), "batch", "jobs", "list"));
    }

    #[test]
    fn cluster_wide_watch_with_namespaced_grant() {
        let scope = Scope::new(vec![Rule {
            clusters: vec!["c1".into()],
            namespaces: vec!["ns1".into()],
            resources: vec!["pods".into()],
            verbs: vec!["watch".into()],
        }]);
        let all = pods("c1", None);
        assert!(scope.may_watch(&all));
        assert!(scope.may_watch(&pods("c1", Some("ns1"))));
        assert!(!scope.may_watch(&pods("c1", Some("ns2"))));
        assert!(!scope.may_watch(&pods("c2", None)));

        assert!(scope.permits_event(&all, Some("ns1")));
        assert!(!scope.permits_event(&all, Some("kube-system")));
    }

    #[test]
    fn impersonation_prefers_email() {
        let mut id = Identity {
            user_id: "u-1".into(),
            email: "alice@example.com".into(),
            permissions: Scope::all(),
        };
        assert_eq!(id.impersonation_name(), "alice@example.com");
        id.email.clear();
        assert_eq!(id.impersonation_name(), "u-1");
    }
}

//! Namespace access filtering by live RBAC review
//!
//! A namespace is usable by a user when the user's effective rules in it,
//! obtained with a `SelfSubjectRulesReview`, cover every required
//! `(apiGroup, resource, verb)` combination. Required rules are ANDed: one
//! missing verb on one required resource disqualifies the namespace.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use futures::future::try_join_all;
use k8s_openapi::api::authorization::v1::ResourceRule;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::PolicyRule;
use tracing::debug;

use crate::error::{Error, Result};
use crate::kube_client::ClusterClient;

/// Standard verbs a `*` verb grant expands to
pub const ALL_K8S_VERBS: [&str; 7] = [
    "create",
    "get",
    "list",
    "watch",
    "patch",
    "delete",
    "deletecollection",
];

const WILDCARD: &str = "*";

/// `(apiGroups, resources, verbs)` the server needs to render a namespace
const REQUIRED_RULES: &[(&[&str], &[&str], &[&str])] = &[
    (&[""], &["secrets", "pods", "events"], &["get", "list"]),
    (&["apps"], &["deployments", "replicasets"], &["get", "list"]),
    (&["kustomize.toolkit.fluxcd.io"], &["kustomizations"], &["get", "list"]),
    (&["helm.toolkit.fluxcd.io"], &["helmreleases"], &["get", "list"]),
    (
        &["source.toolkit.fluxcd.io"],
        &["buckets", "helmcharts", "gitrepositories", "helmrepositories"],
        &["get", "list"],
    ),
    (&[""], &["events"], &["get", "list", "watch"]),
];

/// Minimum rules a namespace must grant to be considered usable
pub fn default_required_rules() -> Vec<PolicyRule> {
    let owned = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    REQUIRED_RULES
        .iter()
        .map(|(groups, resources, verbs)| PolicyRule {
            api_groups: Some(owned(groups)),
            resources: Some(owned(resources)),
            verbs: owned(verbs),
            ..Default::default()
        })
        .collect()
}

/// Filters namespaces down to the ones a user may work in
#[async_trait]
pub trait NamespaceChecker: Send + Sync {
    /// Return the subset of `namespaces` accessible through `client`,
    /// preserving input order.
    ///
    /// `client` must act as the user being checked. Any review failure fails
    /// the whole call.
    async fn filter_accessible_namespaces(
        &self,
        client: &dyn ClusterClient,
        namespaces: &[Namespace],
    ) -> Result<Vec<Namespace>>;
}

/// [`NamespaceChecker`] requiring a fixed set of policy rules
#[derive(Debug, Clone)]
pub struct PolicyRulesChecker {
    rules: Vec<PolicyRule>,
}

impl PolicyRulesChecker {
    /// Checker requiring `rules`
    pub fn new(rules: Vec<PolicyRule>) -> Self {
        Self { rules }
    }

    /// Required rules
    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    async fn namespace_allowed(
        &self,
        client: &dyn ClusterClient,
        namespace: &Namespace,
    ) -> Result<bool> {
        let Some(name) = namespace.metadata.name.as_deref() else {
            return Ok(false);
        };
        let status = client
            .rules_review(name)
            .await
            .map_err(|source| Error::NamespaceAccess {
                namespace: name.to_string(),
                source,
            })?;
        let index = AccessIndex::from_rules(&status.resource_rules);
        Ok(index.allows_all(&self.rules))
    }
}

impl Default for PolicyRulesChecker {
    fn default() -> Self {
        Self::new(default_required_rules())
    }
}

#[async_trait]
impl NamespaceChecker for PolicyRulesChecker {
    async fn filter_accessible_namespaces(
        &self,
        client: &dyn ClusterClient,
        namespaces: &[Namespace],
    ) -> Result<Vec<Namespace>> {
        let verdicts =
            try_join_all(namespaces.iter().map(|ns| self.namespace_allowed(client, ns))).await?;

        let accessible: Vec<Namespace> = namespaces
            .iter()
            .zip(verdicts)
            .filter(|(_, allowed)| *allowed)
            .map(|(ns, _)| ns.clone())
            .collect();

        debug!(
            checked = namespaces.len(),
            accessible = accessible.len(),
            "Filtered namespaces by RBAC review"
        );
        Ok(accessible)
    }
}

/// Derived access: apiGroup -> resource -> verbs
#[derive(Debug, Default)]
struct AccessIndex {
    groups: HashMap<String, HashMap<String, HashSet<String>>>,
}

impl AccessIndex {
    fn from_rules(rules: &[ResourceRule]) -> Self {
        let mut index = Self::default();
        for rule in rules {
            let verbs: Vec<&str> = if rule.verbs.iter().any(|v| v == WILDCARD) {
                ALL_K8S_VERBS.to_vec()
            } else {
                rule.verbs.iter().map(String::as_str).collect()
            };
            for group in rule.api_groups.iter().flatten() {
                let resources = index.groups.entry(group.clone()).or_default();
                for resource in rule.resources.iter().flatten() {
                    resources
                        .entry(resource.clone())
                        .or_default()
                        .extend(verbs.iter().map(|v| v.to_string()));
                }
            }
        }
        index
    }

    fn allows(&self, group: &str, resource: &str, verb: &str) -> bool {
        [group, WILDCARD].iter().any(|g| {
            self.groups.get(*g).is_some_and(|resources| {
                [resource, WILDCARD]
                    .iter()
                    .any(|r| resources.get(*r).is_some_and(|verbs| verbs.contains(verb)))
            })
        })
    }

    fn allows_rule(&self, rule: &PolicyRule) -> bool {
        let groups = rule.api_groups.as_deref().unwrap_or_default();
        let resources = rule.resources.as_deref().unwrap_or_default();
        groups.iter().all(|g| {
            resources
                .iter()
                .all(|r| rule.verbs.iter().all(|v| self.allows(g, r, v)))
        })
    }

    fn allows_all(&self, required: &[PolicyRule]) -> bool {
        required.iter().all(|rule| self.allows_rule(rule))
    }
}

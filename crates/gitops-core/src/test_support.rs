//! In-memory cluster fakes shared by unit tests

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::authorization::v1::{ResourceRule, SubjectRulesReviewStatus};
use kube::api::{DynamicObject, ListParams, ObjectList};
use kube::core::ErrorResponse;
use kube::discovery::ApiResource;
use kube::Resource;
use parking_lot::Mutex;

use crate::config::ClusterConfig;
use crate::error::{Error, Result};
use crate::kube_client::{ClientBuilder, ClusterClient};

pub(crate) fn api_error(code: u16, message: &str) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: "Fake".to_string(),
        code,
    })
}

/// Typed object turned into a dynamic one, as the API would return it
pub(crate) fn object<K>(namespace: Option<&str>, name: &str) -> DynamicObject
where
    K: Resource<DynamicType = ()>,
{
    let mut obj = DynamicObject::new(name, &ApiResource::erase::<K>(&()));
    obj.metadata.namespace = namespace.map(str::to_string);
    obj
}

pub(crate) fn namespace_object(name: &str) -> DynamicObject {
    object::<k8s_openapi::api::core::v1::Namespace>(None, name)
}

pub(crate) fn rule(groups: &[&str], resources: &[&str], verbs: &[&str]) -> ResourceRule {
    let owned = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    ResourceRule {
        api_groups: Some(owned(groups)),
        resources: Some(owned(resources)),
        verbs: owned(verbs),
        resource_names: None,
    }
}

/// Scriptable [`ClusterClient`]
#[derive(Default)]
pub(crate) struct FakeClient {
    objects: Vec<DynamicObject>,
    fail_lists: Option<u16>,
    rules: HashMap<String, Vec<ResourceRule>>,
    failing_reviews: HashSet<String>,
    pub(crate) reviews: Mutex<Vec<String>>,
}

impl FakeClient {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_object(mut self, obj: DynamicObject) -> Self {
        self.objects.push(obj);
        self
    }

    pub(crate) fn with_namespaces(mut self, names: &[&str]) -> Self {
        self.objects
            .extend(names.iter().map(|n| namespace_object(n)));
        self
    }

    pub(crate) fn failing(mut self, code: u16) -> Self {
        self.fail_lists = Some(code);
        self
    }

    pub(crate) fn with_rules(mut self, namespace: &str, rules: Vec<ResourceRule>) -> Self {
        self.rules.insert(namespace.to_string(), rules);
        self
    }

    pub(crate) fn failing_review(mut self, namespace: &str) -> Self {
        self.failing_reviews.insert(namespace.to_string());
        self
    }

    fn matches(obj: &DynamicObject, resource: &ApiResource, namespace: Option<&str>) -> bool {
        let kind = obj.types.as_ref().map(|t| t.kind.as_str());
        kind == Some(resource.kind.as_str())
            && namespace.map_or(true, |ns| obj.metadata.namespace.as_deref() == Some(ns))
    }
}

#[async_trait]
impl ClusterClient for FakeClient {
    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        _params: &ListParams,
    ) -> std::result::Result<ObjectList<DynamicObject>, kube::Error> {
        if let Some(code) = self.fail_lists {
            return Err(api_error(code, "list failed"));
        }
        let items: Vec<DynamicObject> = self
            .objects
            .iter()
            .filter(|o| Self::matches(o, resource, namespace))
            .cloned()
            .collect();
        let list = serde_json::json!({
            "apiVersion": "v1",
            "kind": "List",
            "metadata": {"resourceVersion": "1"},
            "items": items,
        });
        serde_json::from_value(list).map_err(kube::Error::SerdeError)
    }

    async fn get(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        name: &str,
    ) -> std::result::Result<DynamicObject, kube::Error> {
        if let Some(code) = self.fail_lists {
            return Err(api_error(code, "get failed"));
        }
        self.objects
            .iter()
            .find(|o| {
                Self::matches(o, resource, namespace) && o.metadata.name.as_deref() == Some(name)
            })
            .cloned()
            .ok_or_else(|| api_error(404, "not found"))
    }

    async fn rules_review(
        &self,
        namespace: &str,
    ) -> std::result::Result<SubjectRulesReviewStatus, kube::Error> {
        self.reviews.lock().push(namespace.to_string());
        if self.failing_reviews.contains(namespace) {
            return Err(api_error(500, "review failed"));
        }
        Ok(SubjectRulesReviewStatus {
            resource_rules: self.rules.get(namespace).cloned().unwrap_or_default(),
            ..Default::default()
        })
    }
}

/// [`ClientBuilder`] handing out pre-registered fakes by cluster name
#[derive(Default)]
pub(crate) struct FakeBuilder {
    clients: Mutex<HashMap<String, Arc<FakeClient>>>,
    pub(crate) built: Mutex<Vec<ClusterConfig>>,
}

impl FakeBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with(self, cluster: &str, client: FakeClient) -> Self {
        self.set(cluster, client);
        self
    }

    pub(crate) fn set(&self, cluster: &str, client: FakeClient) {
        self.clients
            .lock()
            .insert(cluster.to_string(), Arc::new(client));
    }

    pub(crate) fn client(&self, cluster: &str) -> Option<Arc<FakeClient>> {
        self.clients.lock().get(cluster).cloned()
    }
}

#[async_trait]
impl ClientBuilder for FakeBuilder {
    async fn build(&self, config: ClusterConfig) -> Result<Arc<dyn ClusterClient>> {
        let client = self.client(&config.cluster_name).ok_or_else(|| {
            Error::config_for(&config.cluster_name, "failed to create client: unreachable")
        })?;
        self.built.lock().push(config);
        Ok(client)
    }
}

//! Fan-out operations across every cluster of a [`ClientsPool`]
//!
//! Every per-cluster (or per-namespace) call runs concurrently and is joined
//! before returning. Failures never abort siblings: they are collected into the
//! [`AggregateError`] of the returned [`FanOut`] next to whatever succeeded.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ListMeta;
use kube::api::{DynamicObject, ListParams, ObjectList};
use kube::core::TypeMeta;
use kube::discovery::ApiResource;
use kube::Resource;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{AggregateError, ClientError, Error, Result};
use crate::kube_client::ClusterClient;
use crate::pool::ClientsPool;

/// Result of a fan-out: the merged successes plus every per-cluster failure
#[derive(Debug)]
pub struct FanOut<T> {
    /// Whatever succeeded
    pub value: T,
    /// Per-cluster failures, empty on full success
    pub errors: AggregateError,
}

impl<T> FanOut<T> {
    /// Full success
    pub fn ok(value: T) -> Self {
        Self {
            value,
            errors: AggregateError::new(),
        }
    }

    /// True when no cluster failed
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }

    /// Strict view: any failure turns the whole result into an error
    pub fn into_result(self) -> std::result::Result<T, AggregateError> {
        self.errors.into_result().map(|()| self.value)
    }

    /// Split into value and errors
    pub fn into_parts(self) -> (T, AggregateError) {
        (self.value, self.errors)
    }

    /// Transform the successful part, keeping the errors
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> FanOut<U> {
        FanOut {
            value: f(self.value),
            errors: self.errors,
        }
    }
}

/// One list response from one cluster, optionally scoped to one namespace
#[derive(Debug, Clone)]
pub struct ListPage<K> {
    /// Namespace the list was scoped to, `None` for an unscoped list
    pub namespace: Option<String>,
    /// Listed objects
    pub items: Vec<K>,
    /// List metadata (resource version, continue token)
    pub metadata: ListMeta,
}

/// Lists grouped by cluster name
pub type ClusteredLists<K> = HashMap<String, Vec<ListPage<K>>>;

/// Client over a pool of per-cluster clients and the namespace view it may see
#[derive(Debug, Clone)]
pub struct AggregatedClient {
    pool: Arc<ClientsPool>,
    namespaces: HashMap<String, Vec<Namespace>>,
}

impl AggregatedClient {
    /// Wrap a pool; `namespaces` is the per-cluster view used by
    /// namespace-filtered lists
    pub fn new(pool: Arc<ClientsPool>, namespaces: HashMap<String, Vec<Namespace>>) -> Self {
        Self { pool, namespaces }
    }

    /// The underlying pool
    pub fn pool(&self) -> &ClientsPool {
        &self.pool
    }

    /// Namespaces this client filters by, per cluster
    pub fn namespaces(&self) -> &HashMap<String, Vec<Namespace>> {
        &self.namespaces
    }

    /// Client of a single cluster
    pub fn scoped(&self, cluster: &str) -> Result<Arc<dyn ClusterClient>> {
        Ok(self.pool.client(cluster)?)
    }

    /// List `K` on every cluster.
    ///
    /// With `namespaced`, one list runs per namespace of the client's view on
    /// each cluster, so objects outside the visible namespaces never leak.
    pub async fn clustered_list<K>(
        &self,
        namespaced: bool,
        params: &ListParams,
    ) -> FanOut<ClusteredLists<K>>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned + Clone,
    {
        let resource = ApiResource::erase::<K>(&());
        let lists = self
            .clustered_list_dynamic(&resource, namespaced, params)
            .await;

        let (dynamic, mut errors) = lists.into_parts();
        let mut typed = ClusteredLists::with_capacity(dynamic.len());
        for (cluster, pages) in dynamic {
            let mut converted = Vec::with_capacity(pages.len());
            for page in pages {
                match typed_page::<K>(&resource, page) {
                    Ok(page) => converted.push(page),
                    Err((namespace, e)) => errors.push(client_error(&cluster, namespace, e)),
                }
            }
            typed.insert(cluster, converted);
        }

        FanOut {
            value: typed,
            errors,
        }
    }

    /// List objects of an arbitrary resource on every cluster
    pub async fn clustered_list_dynamic(
        &self,
        resource: &ApiResource,
        namespaced: bool,
        params: &ListParams,
    ) -> FanOut<ClusteredLists<DynamicObject>> {
        let mut lists = ClusteredLists::new();
        let mut calls = Vec::new();

        for (cluster, client) in self.pool.clients() {
            if !namespaced {
                calls.push((cluster, client, None));
                continue;
            }
            let namespaces: Vec<String> = self
                .namespaces
                .get(&cluster)
                .map(|nss| nss.iter().filter_map(|ns| ns.metadata.name.clone()).collect())
                .unwrap_or_default();
            if namespaces.is_empty() {
                lists.insert(cluster, Vec::new());
                continue;
            }
            for ns in namespaces {
                calls.push((cluster.clone(), client.clone(), Some(ns)));
            }
        }

        debug!(kind = %resource.kind, calls = calls.len(), "Fanning out list");

        let results = join_all(calls.into_iter().map(|(cluster, client, namespace)| async move {
            let result = client.list(resource, namespace.as_deref(), params).await;
            (cluster, namespace, result)
        }))
        .await;

        let mut errors = AggregateError::new();
        for (cluster, namespace, result) in results {
            match result {
                Ok(list) => lists.entry(cluster).or_default().push(dynamic_page(namespace, list)),
                Err(e) => errors.push(client_error(&cluster, namespace, e.into())),
            }
        }

        FanOut {
            value: lists,
            errors,
        }
    }

    /// List `K` on a single cluster
    pub async fn list<K>(
        &self,
        cluster: &str,
        namespace: Option<&str>,
        params: &ListParams,
    ) -> Result<ListPage<K>>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned + Clone,
    {
        let resource = ApiResource::erase::<K>(&());
        let client = self.scoped(cluster)?;
        let list = client.list(&resource, namespace, params).await?;
        typed_page(&resource, dynamic_page(namespace.map(str::to_string), list))
            .map_err(|(_, e)| e)
    }

    /// Get one `K` by name from a single cluster
    pub async fn clustered_get<K>(
        &self,
        cluster: &str,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<K>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned,
    {
        let resource = ApiResource::erase::<K>(&());
        let client = self.scoped(cluster)?;
        let obj = client.get(&resource, namespace, name).await?;
        decode(&resource, obj)
    }
}

fn client_error(cluster: &str, namespace: Option<String>, err: Error) -> ClientError {
    match namespace {
        Some(ns) => ClientError::in_namespace(cluster, ns, err),
        None => ClientError::new(cluster, err),
    }
}

fn dynamic_page(
    namespace: Option<String>,
    list: ObjectList<DynamicObject>,
) -> ListPage<DynamicObject> {
    ListPage {
        namespace,
        metadata: list.metadata,
        items: list.items,
    }
}

fn typed_page<K>(
    resource: &ApiResource,
    page: ListPage<DynamicObject>,
) -> std::result::Result<ListPage<K>, (Option<String>, Error)>
where
    K: DeserializeOwned,
{
    let items = page
        .items
        .into_iter()
        .map(|obj| decode(resource, obj))
        .collect::<Result<Vec<K>>>();
    match items {
        Ok(items) => Ok(ListPage {
            namespace: page.namespace,
            items,
            metadata: page.metadata,
        }),
        Err(e) => Err((page.namespace, e)),
    }
}

/// Convert a dynamic object into `K`.
///
/// List items usually come back without `apiVersion`/`kind`, which typed
/// k8s-openapi objects require, so the type meta is filled in first.
fn decode<K: DeserializeOwned>(resource: &ApiResource, mut obj: DynamicObject) -> Result<K> {
    obj.types = Some(TypeMeta {
        api_version: resource.api_version.clone(),
        kind: resource.kind.clone(),
    });
    let value =
        serde_json::to_value(obj).map_err(|e| Error::decode(&resource.kind, e.to_string()))?;
    serde_json::from_value(value).map_err(|e| Error::decode(&resource.kind, e.to_string()))
}

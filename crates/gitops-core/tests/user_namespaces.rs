//! End-to-end: cluster registry -> namespace inventory -> per-user RBAC view

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::authorization::v1::{ResourceRule, SubjectRulesReviewStatus};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use kube::api::{DynamicObject, ListParams, ObjectList};
use kube::core::ErrorResponse;
use kube::discovery::ApiResource;

use gitops_core::{
    ClientBuilder, ClientsFactory, Cluster, ClusterClient, ClusterConfig, Error, FactoryConfig,
    PolicyRulesChecker, StaticClusterFetcher, UserPrincipal,
};

/// One cluster: its objects and, per user and namespace, the RBAC verbs on secrets
#[derive(Default)]
struct FakeCluster {
    objects: Vec<DynamicObject>,
    secret_verbs: HashMap<(String, String), Vec<String>>,
}

struct FakeClusterClient {
    cluster: Arc<FakeCluster>,
    user: String,
}

fn not_found() -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: "not found".to_string(),
        reason: "NotFound".to_string(),
        code: 404,
    })
}

#[async_trait]
impl ClusterClient for FakeClusterClient {
    async fn list(
        &self,
        resource: &ApiResource,
        namespace: Option<&str>,
        _params: &ListParams,
    ) -> Result<ObjectList<DynamicObject>, kube::Error> {
        let items: Vec<&DynamicObject> = self
            .cluster
            .objects
            .iter()
            .filter(|o| o.types.as_ref().map(|t| t.kind.as_str()) == Some(resource.kind.as_str()))
            .filter(|o| namespace.map_or(true, |ns| o.metadata.namespace.as_deref() == Some(ns)))
            .collect();
        serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "List",
            "metadata": {},
            "items": items,
        }))
        .map_err(kube::Error::SerdeError)
    }

    async fn get(
        &self,
        _resource: &ApiResource,
        _namespace: Option<&str>,
        _name: &str,
    ) -> Result<DynamicObject, kube::Error> {
        Err(not_found())
    }

    async fn rules_review(&self, namespace: &str) -> Result<SubjectRulesReviewStatus, kube::Error> {
        let verbs = self
            .cluster
            .secret_verbs
            .get(&(self.user.clone(), namespace.to_string()))
            .cloned()
            .unwrap_or_default();
        Ok(SubjectRulesReviewStatus {
            resource_rules: vec![ResourceRule {
                api_groups: Some(vec!["".to_string()]),
                resources: Some(vec!["secrets".to_string()]),
                verbs,
                resource_names: None,
            }],
            ..Default::default()
        })
    }
}

/// Hands out clients acting as whoever the config impersonates
struct FakeClusters(HashMap<String, Arc<FakeCluster>>);

#[async_trait]
impl ClientBuilder for FakeClusters {
    async fn build(&self, config: ClusterConfig) -> gitops_core::Result<Arc<dyn ClusterClient>> {
        let cluster = self
            .0
            .get(&config.cluster_name)
            .cloned()
            .ok_or_else(|| Error::config_for(&config.cluster_name, "unreachable"))?;
        let user = config
            .impersonate
            .as_ref()
            .map(|i| i.user.clone())
            .unwrap_or_else(|| "gitops-server".to_string());
        Ok(Arc::new(FakeClusterClient { cluster, user }))
    }
}

fn dynamic<K>(namespace: Option<&str>, name: &str) -> DynamicObject
where
    K: kube::Resource<DynamicType = ()>,
{
    let mut obj = DynamicObject::new(name, &ApiResource::erase::<K>(&()));
    obj.metadata.namespace = namespace.map(str::to_string);
    obj
}

fn cluster_with(namespaces: &[&str], alice_can_read: &[&str]) -> FakeCluster {
    let mut cluster = FakeCluster::default();
    for ns in namespaces {
        cluster.objects.push(dynamic::<Namespace>(None, ns));
        cluster
            .objects
            .push(dynamic::<ConfigMap>(Some(ns), &format!("{}-config", ns)));
    }
    for ns in alice_can_read {
        cluster.secret_verbs.insert(
            ("alice".to_string(), ns.to_string()),
            vec!["get".to_string(), "list".to_string()],
        );
    }
    cluster
}

fn secrets_rule() -> k8s_openapi::api::rbac::v1::PolicyRule {
    k8s_openapi::api::rbac::v1::PolicyRule {
        api_groups: Some(vec!["".to_string()]),
        resources: Some(vec!["secrets".to_string()]),
        verbs: vec!["get".to_string(), "list".to_string()],
        ..Default::default()
    }
}

fn names(namespaces: &[Namespace]) -> Vec<&str> {
    namespaces
        .iter()
        .filter_map(|n| n.metadata.name.as_deref())
        .collect()
}

fn factory() -> ClientsFactory {
    let clusters = FakeClusters(HashMap::from([
        (
            "a".to_string(),
            Arc::new(cluster_with(&["default", "team-a", "team-b"], &["team-a"])),
        ),
        (
            "b".to_string(),
            Arc::new(cluster_with(&["default", "flux-system"], &["default", "flux-system"])),
        ),
    ]));
    let fetcher = StaticClusterFetcher::new(vec![
        Cluster::new("a", "https://a.example.com").with_bearer_token("svc-a"),
        Cluster::new("b", "https://b.example.com").with_bearer_token("svc-b"),
    ]);

    ClientsFactory::new(
        Arc::new(fetcher),
        Arc::new(PolicyRulesChecker::new(vec![secrets_rule()])),
        Arc::new(clusters),
        FactoryConfig::default(),
    )
}

#[tokio::test]
async fn user_namespaces_follow_each_clusters_rbac() {
    let factory = factory();
    let alice = UserPrincipal::new("alice", vec!["dev".to_string()]);

    factory.update_clusters().await.unwrap();
    factory.update_namespaces().await.unwrap();
    assert_eq!(factory.get_clusters_namespaces()["a"].len(), 3);

    assert!(factory.get_user_namespaces(&alice).is_empty());

    factory.update_user_namespaces(&alice).await;
    let view = factory.get_user_namespaces(&alice);

    assert_eq!(view.len(), 2);
    assert_eq!(names(&view["a"]), vec!["team-a"]);
    assert_eq!(names(&view["b"]), vec!["default", "flux-system"]);
}

#[tokio::test]
async fn impersonated_lists_stay_inside_visible_namespaces() {
    let factory = factory();
    let alice = UserPrincipal::new("alice", vec![]);
    factory.update_clusters().await.unwrap();
    factory.update_namespaces().await.unwrap();

    let client = factory.get_impersonated_client(&alice).await;
    assert!(client.is_complete());

    let lists = client
        .value
        .clustered_list::<ConfigMap>(true, &ListParams::default())
        .await
        .into_result()
        .unwrap();

    let mut seen: Vec<String> = lists
        .iter()
        .flat_map(|(cluster, pages)| {
            pages.iter().flat_map(move |p| {
                p.items.iter().filter_map(move |cm| {
                    cm.metadata.name.as_ref().map(|n| format!("{}/{}", cluster, n))
                })
            })
        })
        .collect();
    seen.sort();

    assert_eq!(
        seen,
        vec!["a/team-a-config", "b/default-config", "b/flux-system-config"]
    );
}

#[tokio::test]
async fn unknown_user_sees_nothing() {
    let factory = factory();
    let mallory = UserPrincipal::new("mallory", vec![]);
    factory.update_clusters().await.unwrap();
    factory.update_namespaces().await.unwrap();

    let client = factory.get_impersonated_client(&mallory).await;

    assert!(client.is_complete());
    assert!(client.value.namespaces().values().all(|nss| nss.is_empty()));
}

//! Namespace caches
//!
//! [`ClustersNamespaces`] holds the unfiltered inventory per cluster.
//! [`UsersNamespaces`] holds per-user, per-cluster filtered views that expire
//! after a fixed TTL. Expired entries are dropped lazily on read and swept by
//! [`UsersNamespaces::purge_expired`].

use std::collections::HashMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::Namespace;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;

use crate::principal::{UserKey, UserPrincipal};

/// Unfiltered namespace inventory, cluster name -> namespaces
#[derive(Debug, Default)]
pub struct ClustersNamespaces {
    namespaces: RwLock<HashMap<String, Vec<Namespace>>>,
}

impl ClustersNamespaces {
    /// Create an empty inventory
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entry of one cluster
    pub fn set(&self, cluster: &str, namespaces: Vec<Namespace>) {
        self.namespaces.write().insert(cluster.to_string(), namespaces);
    }

    /// Namespaces of one cluster
    pub fn get(&self, cluster: &str) -> Option<Vec<Namespace>> {
        self.namespaces.read().get(cluster).cloned()
    }

    /// Copy of the whole inventory
    pub fn snapshot(&self) -> HashMap<String, Vec<Namespace>> {
        self.namespaces.read().clone()
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.namespaces.write().clear();
    }
}

type Entry = (Vec<Namespace>, Instant);

/// TTL cache of accessible namespaces keyed by `(user, cluster)`
#[derive(Debug)]
pub struct UsersNamespaces {
    ttl: Duration,
    entries: Mutex<HashMap<(UserKey, String), Entry>>,
}

impl UsersNamespaces {
    /// Create an empty cache whose entries live for `ttl`
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Entry lifetime
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store the accessible namespaces of `user` on `cluster`
    pub fn set(&self, user: &UserPrincipal, cluster: &str, namespaces: Vec<Namespace>) {
        let expires = Instant::now() + self.ttl;
        self.entries
            .lock()
            .insert((user.cache_key(), cluster.to_string()), (namespaces, expires));
    }

    /// Accessible namespaces of `user` on `cluster`, if cached and fresh
    pub fn get(&self, user: &UserPrincipal, cluster: &str) -> Option<Vec<Namespace>> {
        let key = (user.cache_key(), cluster.to_string());
        let mut entries = self.entries.lock();
        match entries.get(&key) {
            Some((namespaces, expires)) if *expires > Instant::now() => Some(namespaces.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Fresh entries of `user` for each of `clusters`; missing ones are omitted
    pub fn get_all<'a, I>(
        &self,
        user: &UserPrincipal,
        clusters: I,
    ) -> HashMap<String, Vec<Namespace>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        clusters
            .into_iter()
            .filter_map(|cluster| {
                self.get(user, cluster)
                    .map(|namespaces| (cluster.to_string(), namespaces))
            })
            .collect()
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Drop expired entries, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, (_, expires)| *expires > now);
        before - entries.len()
    }

    /// Number of entries, fresh or not
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True if nothing is cached
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    const TTL: Duration = Duration::from_secs(30);

    fn ns(name: &str) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn alice() -> UserPrincipal {
        UserPrincipal::new("alice", vec!["dev".to_string()])
    }

    #[test]
    fn clusters_namespaces_replace_per_cluster() {
        let cache = ClustersNamespaces::new();
        cache.set("a", vec![ns("one")]);
        cache.set("b", vec![ns("two")]);
        cache.set("a", vec![ns("three"), ns("four")]);

        assert_eq!(cache.get("a").map(|v| v.len()), Some(2));
        assert_eq!(cache.snapshot().len(), 2);

        cache.clear();
        assert!(cache.get("b").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = UsersNamespaces::new(TTL);
        cache.set(&alice(), "a", vec![ns("team-a")]);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(cache.get(&alice(), "a").map(|v| v.len()), Some(1));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get(&alice(), "a").is_none());
        assert!(cache.is_empty(), "expired entry is dropped on read");
    }

    #[tokio::test(start_paused = true)]
    async fn purge_only_drops_expired_entries() {
        let cache = UsersNamespaces::new(TTL);
        cache.set(&alice(), "a", vec![ns("team-a")]);

        tokio::time::advance(Duration::from_secs(20)).await;
        cache.set(&alice(), "b", vec![ns("team-b")]);

        tokio::time::advance(Duration::from_secs(15)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&alice(), "b").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn entries_are_scoped_to_user_and_cluster() {
        let cache = UsersNamespaces::new(TTL);
        let bob = UserPrincipal::new("bob", vec![]);
        cache.set(&alice(), "a", vec![ns("team-a")]);
        cache.set(&bob, "a", vec![ns("team-b"), ns("team-c")]);

        let view = cache.get_all(&alice(), ["a", "b"]);
        assert_eq!(view.len(), 1);
        assert_eq!(view["a"].len(), 1);
        assert_eq!(cache.get(&bob, "a").map(|v| v.len()), Some(2));

        let other_groups = UserPrincipal::new("alice", vec!["ops".to_string()]);
        assert!(cache.get(&other_groups, "a").is_none());

        cache.clear();
        assert!(cache.get_all(&bob, ["a"]).is_empty());
    }
}

//! In-process cluster membership.
//!
//! Members of the same named cluster living in one process share their
//! cache instances and observe each other's joins and departures through
//! membership events. Clusters are looked up through a process-wide registry
//! holding weak references, so a cluster disappears once its last member
//! has left.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, Weak};

use tokio::sync::mpsc;

use crate::config::CacheSettings;
use crate::{CacheError, CacheResult, MemCache};

pub type NodeId = u64;

/// Whether an event fires before or after the membership view changes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangePhase {
    Pre,
    Post,
}

/// Which member joined or left.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MembershipChange {
    Joined(NodeId),
    Left(NodeId),
}

/// Topology notification delivered to subscribers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MembershipEvent {
    pub phase: ChangePhase,
    /// Member count of the view the change produces.
    pub members: usize,
    pub change: MembershipChange,
}

impl MembershipEvent {
    pub fn is_pre(&self) -> bool {
        self.phase == ChangePhase::Pre
    }
}

/// Identity of a member and the seeds it joined with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberInfo {
    pub id: NodeId,
    pub seeds: Vec<String>,
}

#[derive(Default)]
struct Membership {
    members: BTreeMap<NodeId, MemberInfo>,
    listeners: Vec<(NodeId, mpsc::UnboundedSender<MembershipEvent>)>,
}

impl Membership {
    fn publish(&mut self, phase: ChangePhase, change: MembershipChange) {
        let event = MembershipEvent {
            phase,
            members: self.members.len(),
            change,
        };
        self.listeners
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }
}

/// Shared state of one named cluster.
pub struct Cluster {
    name: String,
    next_node: AtomicU64,
    membership: Mutex<Membership>,
    caches: RwLock<HashMap<String, Arc<MemCache>>>,
}

type ClusterRegistry = HashMap<String, Weak<Cluster>>;
static CLUSTER_REGISTRY: OnceLock<Mutex<ClusterRegistry>> = OnceLock::new();

fn cluster_registry() -> &'static Mutex<ClusterRegistry> {
    CLUSTER_REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Join (creating if needed) the named cluster in this process.
pub fn join_cluster(name: &str, seeds: Vec<String>) -> CacheResult<ClusterMember> {
    let cluster = {
        let mut registry = cluster_registry()
            .lock()
            .map_err(|_| CacheError::Poisoned)?;
        // Clean up clusters whose members have all left.
        registry.retain(|_, weak| weak.strong_count() > 0);
        match registry.get(name).and_then(Weak::upgrade) {
            Some(cluster) => cluster,
            None => {
                let cluster = Arc::new(Cluster {
                    name: name.to_string(),
                    next_node: AtomicU64::new(1),
                    membership: Mutex::new(Membership::default()),
                    caches: RwLock::new(HashMap::new()),
                });
                registry.insert(name.to_string(), Arc::downgrade(&cluster));
                cluster
            }
        }
    };

    let id = cluster.next_node.fetch_add(1, Ordering::Relaxed);
    {
        let mut membership = cluster
            .membership
            .lock()
            .map_err(|_| CacheError::Poisoned)?;
        membership.members.insert(id, MemberInfo { id, seeds });
        // Both phases carry the post-change view size.
        membership.publish(ChangePhase::Pre, MembershipChange::Joined(id));
        membership.publish(ChangePhase::Post, MembershipChange::Joined(id));
    }
    tracing::debug!(cluster = %cluster.name, node_id = id, "member joined");
    Ok(ClusterMember {
        cluster,
        id,
        left: false,
    })
}

/// A live membership in a cluster. Dropping it leaves the cluster.
pub struct ClusterMember {
    cluster: Arc<Cluster>,
    id: NodeId,
    left: bool,
}

impl ClusterMember {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster.name
    }

    pub fn size(&self) -> usize {
        self.cluster
            .membership
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .members
            .len()
    }

    pub fn members(&self) -> Vec<MemberInfo> {
        self.cluster
            .membership
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .members
            .values()
            .cloned()
            .collect()
    }

    /// Register for topology events. The channel closes when this member
    /// leaves.
    pub fn subscribe(&self) -> CacheResult<mpsc::UnboundedReceiver<MembershipEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut membership = self
            .cluster
            .membership
            .lock()
            .map_err(|_| CacheError::Poisoned)?;
        membership.listeners.push((self.id, tx));
        Ok(rx)
    }

    /// Define a cache cluster-wide. An existing definition with the same
    /// name wins, so every member sees the same instance.
    pub fn define_cache(&self, settings: CacheSettings) -> CacheResult<Arc<MemCache>> {
        let mut caches = self
            .cluster
            .caches
            .write()
            .map_err(|_| CacheError::Poisoned)?;
        let cache = caches
            .entry(settings.name.clone())
            .or_insert_with(|| Arc::new(MemCache::new(settings)));
        Ok(Arc::clone(cache))
    }

    pub fn cache(&self, name: &str) -> CacheResult<Arc<MemCache>> {
        let caches = self
            .cluster
            .caches
            .read()
            .map_err(|_| CacheError::Poisoned)?;
        caches
            .get(name)
            .cloned()
            .ok_or_else(|| CacheError::UnknownCache(name.to_string()))
    }

    /// Leave the cluster. Safe to call more than once.
    pub fn leave(&mut self) {
        if self.left {
            return;
        }
        self.left = true;
        let mut membership = self
            .cluster
            .membership
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let id = self.id;
        membership.listeners.retain(|(owner, _)| *owner != id);
        membership.members.remove(&id);
        membership.publish(ChangePhase::Pre, MembershipChange::Left(id));
        membership.publish(ChangePhase::Post, MembershipChange::Left(id));
        drop(membership);
        tracing::debug!(cluster = %self.cluster.name, node_id = id, "member left");
    }
}

impl Drop for ClusterMember {
    fn drop(&mut self) {
        self.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(prefix: &str) -> String {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        format!("{prefix}-{}", SEQ.fetch_add(1, Ordering::Relaxed))
    }

    #[test]
    fn join_notifies_existing_subscribers() {
        let name = unique("join");
        let first = join_cluster(&name, Vec::new()).unwrap();
        let mut events = first.subscribe().unwrap();
        let second = join_cluster(&name, Vec::new()).unwrap();

        let pre = events.try_recv().unwrap();
        let post = events.try_recv().unwrap();
        assert!(pre.is_pre());
        assert!(!post.is_pre());
        assert_eq!(post.members, 2);
        assert_eq!(post.change, MembershipChange::Joined(second.id()));
        assert_eq!(first.size(), 2);
    }

    #[test]
    fn leave_closes_own_channel_and_notifies_others() {
        let name = unique("leave");
        let first = join_cluster(&name, Vec::new()).unwrap();
        let mut second = join_cluster(&name, Vec::new()).unwrap();
        let mut first_events = first.subscribe().unwrap();
        let mut second_events = second.subscribe().unwrap();

        second.leave();
        second.leave();

        assert!(second_events.try_recv().is_err());
        let post = loop {
            let event = first_events.try_recv().unwrap();
            if !event.is_pre() {
                break event;
            }
        };
        assert_eq!(post.members, 1);
        assert_eq!(post.change, MembershipChange::Left(second.id()));
        assert_eq!(first.size(), 1);
    }

    #[test]
    fn clusters_are_isolated_by_name_and_share_caches() {
        let a = join_cluster(&unique("iso"), Vec::new()).unwrap();
        let b = join_cluster(&unique("iso"), Vec::new()).unwrap();
        assert_eq!(a.size(), 1);
        assert_eq!(b.size(), 1);

        let name = unique("shared");
        let m1 = join_cluster(&name, vec!["10.0.0.1[7800]".into()]).unwrap();
        let m2 = join_cluster(&name, Vec::new()).unwrap();
        let defined = m1
            .define_cache(CacheSettings::local("cache", false, false))
            .unwrap();
        let seen = m2.cache("cache").unwrap();
        assert!(Arc::ptr_eq(&defined, &seen));
        assert!(matches!(
            m2.cache("missing"),
            Err(CacheError::UnknownCache(_))
        ));
        assert_eq!(m2.members()[0].seeds, vec!["10.0.0.1[7800]".to_string()]);
    }
}

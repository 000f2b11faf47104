//! The access-key graph.
//!
//! Nodes are keys; an edge `a -> b` stores `b` wrapped for `a`. Holding a
//! key grants every key reachable from it. Each key also has an implicit
//! edge to its log key, derived with HKDF instead of being stored.
//!
//! Path search is breadth-first with neighbours visited in ascending id
//! order, so every endorser finds the same path.

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use tracing::{debug, trace};

use consent_kernel_core::KeyId;

use crate::error::{PermsError, Result};
use crate::key::{unwrap_edge, EdgeSource, Key, KeyInfo, WrappedKey};

/// Default bound on the number of nodes one search may visit.
pub const DEFAULT_SEARCH_LIMIT: usize = 100_000;

/// Storage for edges and key metadata.
///
/// Implemented by the transaction context so graph writes land in the
/// same atomic batch as the asset writes they accompany.
#[async_trait]
pub trait EdgeStore: Send {
    async fn get_edge(&mut self, src: &KeyId, dst: &KeyId) -> Result<Option<WrappedKey>>;

    async fn put_edge(&mut self, src: &KeyId, dst: &KeyId, wrapped: &WrappedKey) -> Result<()>;

    async fn delete_edge(&mut self, src: &KeyId, dst: &KeyId) -> Result<()>;

    /// Stored out-neighbours of `src`, ascending.
    async fn out_edges(&mut self, src: &KeyId) -> Result<Vec<KeyId>>;

    async fn get_key_info(&mut self, id: &KeyId) -> Result<Option<KeyInfo>>;

    async fn put_key_info(&mut self, info: &KeyInfo) -> Result<()>;
}

/// A path through the key graph, from the root key to the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPath(Vec<KeyId>);

impl KeyPath {
    pub fn nodes(&self) -> &[KeyId] {
        &self.0
    }

    pub fn root(&self) -> Option<&KeyId> {
        self.0.first()
    }

    pub fn target(&self) -> Option<&KeyId> {
        self.0.last()
    }

    /// Number of edges walked.
    pub fn hops(&self) -> usize {
        self.0.len().saturating_sub(1)
    }
}

/// Operations over an [`EdgeStore`].
#[derive(Debug, Clone, Copy)]
pub struct KeyGraph {
    search_limit: usize,
}

impl Default for KeyGraph {
    fn default() -> Self {
        Self {
            search_limit: DEFAULT_SEARCH_LIMIT,
        }
    }
}

impl KeyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_search_limit(search_limit: usize) -> Self {
        Self { search_limit }
    }

    /// Store `dst` wrapped for `src`, recording key info for both ends.
    ///
    /// Idempotent. Returns `false` when the edge already existed.
    pub async fn add_edge<E>(&self, store: &mut E, src: EdgeSource<'_>, dst: &Key) -> Result<bool>
    where
        E: EdgeStore + ?Sized,
    {
        let src_id = src.id();
        if store.get_edge(src_id, dst.id()).await?.is_some() {
            trace!(src = %src_id, dst = %dst.id(), "edge already present");
            return Ok(false);
        }

        let wrapped = src.wrap(dst)?;
        store.put_edge(src_id, dst.id(), &wrapped).await?;

        if store.get_key_info(dst.id()).await?.is_none() {
            store.put_key_info(&dst.info()).await?;
        }
        let src_info = match src {
            EdgeSource::Key(key) => key.info(),
            EdgeSource::Info(info) => info.clone(),
        };
        if store.get_key_info(src_id).await?.is_none() {
            store.put_key_info(&src_info).await?;
        }

        debug!(src = %src_id, dst = %dst.id(), "edge added");
        Ok(true)
    }

    /// Delete edge `src -> dst`. Returns `false` if it did not exist.
    pub async fn remove_edge<E>(&self, store: &mut E, src: &KeyId, dst: &KeyId) -> Result<bool>
    where
        E: EdgeStore + ?Sized,
    {
        if store.get_edge(src, dst).await?.is_none() {
            return Ok(false);
        }
        store.delete_edge(src, dst).await?;
        debug!(src = %src, dst = %dst, "edge removed");
        Ok(true)
    }

    /// Shortest path from `from` to `to`, if any.
    pub async fn resolve_path<E>(&self, store: &mut E, from: &KeyId, to: &KeyId) -> Result<Option<KeyPath>>
    where
        E: EdgeStore + ?Sized,
    {
        if from == to {
            return Ok(Some(KeyPath(vec![from.clone()])));
        }

        let mut parent: HashMap<KeyId, KeyId> = HashMap::new();
        let mut seen: HashSet<KeyId> = HashSet::new();
        let mut queue = VecDeque::new();
        seen.insert(from.clone());
        queue.push_back(from.clone());

        while let Some(node) = queue.pop_front() {
            for next in self.neighbours(store, &node).await? {
                if !seen.insert(next.clone()) {
                    continue;
                }
                if seen.len() > self.search_limit {
                    return Err(PermsError::SearchLimit(self.search_limit));
                }
                parent.insert(next.clone(), node.clone());
                if &next == to {
                    let path = rebuild_path(&parent, from, to);
                    trace!(from = %from, to = %to, hops = path.hops(), "key path resolved");
                    return Ok(Some(path));
                }
                queue.push_back(next);
            }
        }

        Ok(None)
    }

    /// Walk `path` from `root`, unwrapping each edge in turn.
    pub async fn derive_key<E>(&self, store: &mut E, root: &Key, path: &KeyPath) -> Result<Key>
    where
        E: EdgeStore + ?Sized,
    {
        let mut nodes = path.nodes().iter();
        match nodes.next() {
            Some(first) if first == root.id() => {}
            Some(first) => {
                return Err(PermsError::PathRootMismatch {
                    expected: root.id().clone(),
                    got: first.clone(),
                })
            }
            None => return Err(PermsError::InvalidKey("empty key path".into())),
        }

        let mut current = root.clone();
        for next in nodes {
            current = self.step(store, &current, next).await?;
        }
        Ok(current)
    }

    /// Resolve and derive in one go. `None` when `to` is unreachable.
    pub async fn derive<E>(&self, store: &mut E, root: &Key, to: &KeyId) -> Result<Option<Key>>
    where
        E: EdgeStore + ?Sized,
    {
        match self.resolve_path(store, root.id(), to).await? {
            Some(path) => Ok(Some(self.derive_key(store, root, &path).await?)),
            None => Ok(None),
        }
    }

    /// Whether `to` is reachable from `from`.
    pub async fn reachable<E>(&self, store: &mut E, from: &KeyId, to: &KeyId) -> Result<bool>
    where
        E: EdgeStore + ?Sized,
    {
        Ok(self.resolve_path(store, from, to).await?.is_some())
    }

    async fn step<E>(&self, store: &mut E, current: &Key, next: &KeyId) -> Result<Key>
    where
        E: EdgeStore + ?Sized,
    {
        if !current.id().is_log() && &current.id().log_of() == next {
            return current.log_key();
        }
        let wrapped = store
            .get_edge(current.id(), next)
            .await?
            .ok_or_else(|| PermsError::MissingEdge {
                src: current.id().clone(),
                dst: next.clone(),
            })?;
        unwrap_edge(current, next, &wrapped)
    }

    async fn neighbours<E>(&self, store: &mut E, node: &KeyId) -> Result<Vec<KeyId>>
    where
        E: EdgeStore + ?Sized,
    {
        let mut out = store.out_edges(node).await?;
        if !node.is_log() {
            out.push(node.log_of());
        }
        out.sort();
        out.dedup();
        Ok(out)
    }
}

fn rebuild_path(parent: &HashMap<KeyId, KeyId>, from: &KeyId, to: &KeyId) -> KeyPath {
    let mut nodes = vec![to.clone()];
    let mut cursor = to;
    while cursor != from {
        match parent.get(cursor) {
            Some(prev) => {
                nodes.push(prev.clone());
                cursor = prev;
            }
            None => break,
        }
    }
    nodes.reverse();
    KeyPath(nodes)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeMap;

    /// Edge store over plain maps.
    #[derive(Default)]
    pub struct MapEdgeStore {
        pub edges: BTreeMap<(KeyId, KeyId), WrappedKey>,
        pub infos: BTreeMap<KeyId, KeyInfo>,
    }

    #[async_trait]
    impl EdgeStore for MapEdgeStore {
        async fn get_edge(&mut self, src: &KeyId, dst: &KeyId) -> Result<Option<WrappedKey>> {
            Ok(self.edges.get(&(src.clone(), dst.clone())).cloned())
        }

        async fn put_edge(&mut self, src: &KeyId, dst: &KeyId, wrapped: &WrappedKey) -> Result<()> {
            self.edges.insert((src.clone(), dst.clone()), wrapped.clone());
            Ok(())
        }

        async fn delete_edge(&mut self, src: &KeyId, dst: &KeyId) -> Result<()> {
            self.edges.remove(&(src.clone(), dst.clone()));
            Ok(())
        }

        async fn out_edges(&mut self, src: &KeyId) -> Result<Vec<KeyId>> {
            Ok(self
                .edges
                .keys()
                .filter(|(s, _)| s == src)
                .map(|(_, d)| d.clone())
                .collect())
        }

        async fn get_key_info(&mut self, id: &KeyId) -> Result<Option<KeyInfo>> {
            Ok(self.infos.get(id).cloned())
        }

        async fn put_key_info(&mut self, info: &KeyInfo) -> Result<()> {
            self.infos.insert(info.id.clone(), info.clone());
            Ok(())
        }
    }

    fn id(s: &str) -> KeyId {
        KeyId::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_add_edge_is_idempotent() {
        let graph = KeyGraph::new();
        let mut store = MapEdgeStore::default();
        let a = Key::generate_sym(id("a"));
        let b = Key::generate_sym(id("b"));

        assert!(graph.add_edge(&mut store, (&a).into(), &b).await.unwrap());
        assert!(!graph.add_edge(&mut store, (&a).into(), &b).await.unwrap());
        assert_eq!(store.edges.len(), 1);
        assert!(store.infos.contains_key(a.id()));
        assert!(store.infos.contains_key(b.id()));
    }

    #[tokio::test]
    async fn test_derive_through_chain() {
        let graph = KeyGraph::new();
        let mut store = MapEdgeStore::default();
        let owner = Key::generate_private(id("p1-priv"));
        let consent = Key::generate_sym(id("c1"));
        let datatype = Key::generate_sym(id("dt"));

        let owner_info = owner.info();
        graph
            .add_edge(&mut store, (&owner_info).into(), &consent)
            .await
            .unwrap();
        graph
            .add_edge(&mut store, (&consent).into(), &datatype)
            .await
            .unwrap();

        let derived = graph
            .derive(&mut store, &owner, datatype.id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(derived.to_bytes(), datatype.to_bytes());
    }

    #[tokio::test]
    async fn test_unreachable_returns_none() {
        let graph = KeyGraph::new();
        let mut store = MapEdgeStore::default();
        let a = Key::generate_sym(id("a"));
        let b = Key::generate_sym(id("b"));
        graph.add_edge(&mut store, (&a).into(), &b).await.unwrap();

        assert!(graph
            .resolve_path(&mut store, b.id(), a.id())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_implicit_log_edges() {
        let graph = KeyGraph::new();
        let mut store = MapEdgeStore::default();
        let svc = Key::generate_sym(id("svc"));
        let consent = Key::generate_sym(id("c1"));

        let svc_log = svc.log_key().unwrap();
        let consent_log = consent.log_key().unwrap();
        graph
            .add_edge(&mut store, (&svc_log).into(), &consent_log)
            .await
            .unwrap();

        let derived = graph
            .derive(&mut store, &svc, consent_log.id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(derived.to_bytes(), consent_log.to_bytes());

        let path = graph
            .resolve_path(&mut store, svc.id(), consent_log.id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(path.hops(), 2);
    }

    #[tokio::test]
    async fn test_remove_edge_cuts_access() {
        let graph = KeyGraph::new();
        let mut store = MapEdgeStore::default();
        let a = Key::generate_sym(id("a"));
        let b = Key::generate_sym(id("b"));
        graph.add_edge(&mut store, (&a).into(), &b).await.unwrap();

        assert!(graph.remove_edge(&mut store, a.id(), b.id()).await.unwrap());
        assert!(!graph.remove_edge(&mut store, a.id(), b.id()).await.unwrap());
        assert!(!graph.reachable(&mut store, a.id(), b.id()).await.unwrap());
    }

    #[tokio::test]
    async fn test_bfs_prefers_shortest_then_lowest_id() {
        let graph = KeyGraph::new();
        let mut store = MapEdgeStore::default();
        let root = Key::generate_sym(id("root"));
        let x = Key::generate_sym(id("x"));
        let y = Key::generate_sym(id("y"));
        let target = Key::generate_sym(id("t"));

        for mid in [&y, &x] {
            graph.add_edge(&mut store, (&root).into(), mid).await.unwrap();
            graph.add_edge(&mut store, mid.into(), &target).await.unwrap();
        }

        let path = graph
            .resolve_path(&mut store, root.id(), target.id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(path.nodes(), &[id("root"), id("x"), id("t")]);
    }

    #[tokio::test]
    async fn test_cycles_terminate() {
        let graph = KeyGraph::new();
        let mut store = MapEdgeStore::default();
        let a = Key::generate_sym(id("a"));
        let b = Key::generate_sym(id("b"));
        graph.add_edge(&mut store, (&a).into(), &b).await.unwrap();
        graph.add_edge(&mut store, (&b).into(), &a).await.unwrap();

        let missing = id("zzz");
        assert!(graph
            .resolve_path(&mut store, a.id(), &missing)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_search_limit() {
        let graph = KeyGraph::with_search_limit(2);
        let mut store = MapEdgeStore::default();
        let root = Key::generate_sym(id("root"));
        for name in ["a", "b", "c"] {
            let k = Key::generate_sym(id(name));
            graph.add_edge(&mut store, (&root).into(), &k).await.unwrap();
        }
        let missing = id("zzz");
        assert!(matches!(
            graph.resolve_path(&mut store, root.id(), &missing).await,
            Err(PermsError::SearchLimit(2))
        ));
    }

    #[tokio::test]
    async fn test_derive_key_rejects_foreign_root() {
        let graph = KeyGraph::new();
        let mut store = MapEdgeStore::default();
        let a = Key::generate_sym(id("a"));
        let b = Key::generate_sym(id("b"));
        graph.add_edge(&mut store, (&a).into(), &b).await.unwrap();
        let path = graph
            .resolve_path(&mut store, a.id(), b.id())
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(
            graph.derive_key(&mut store, &b, &path).await,
            Err(PermsError::PathRootMismatch { .. })
        ));
    }
}

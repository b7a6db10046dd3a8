//! In-process implementation of [`CoordStore`].
//!
//! Backs tests and single-node deployments. All operations run under one
//! mutex and complete synchronously, which makes the semantics (atomic
//! create/set/delete, watch ordering) easy to reason about.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::oneshot;

use super::{
    split_path, CoordStore, CreateFlags, SessionId, StoreError, StoreResult, Version, WatchEvent,
    WatchKind, ANY_VERSION,
};

#[derive(Debug)]
struct Node {
    data: Vec<u8>,
    version: Version,
    ephemeral_owner: Option<SessionId>,
    /// Counter handed to sequential children of this node.
    next_seq: u64,
}

impl Node {
    fn new(data: Vec<u8>, owner: Option<SessionId>) -> Self {
        Self {
            data,
            version: 0,
            ephemeral_owner: owner,
            next_seq: 1,
        }
    }
}

struct PendingWatch {
    session: SessionId,
    tx: oneshot::Sender<WatchEvent>,
}

#[derive(Default)]
struct Core {
    nodes: BTreeMap<String, Node>,
    watches: HashMap<(String, WatchKind), Vec<PendingWatch>>,
    next_session: u64,
}

impl Core {
    fn fire(&mut self, path: &str, kind: WatchKind) {
        if let Some(pending) = self.watches.remove(&(path.to_string(), kind)) {
            let event = WatchEvent {
                path: path.to_string(),
                kind,
            };
            for watch in pending {
                let _ = watch.tx.send(event.clone());
            }
        }
    }

    fn fire_node_changed(&mut self, path: &str) {
        self.fire(path, WatchKind::Data);
    }

    fn fire_node_created(&mut self, path: &str) {
        self.fire(path, WatchKind::Exists);
        if let Some((parent, _)) = split_path(path) {
            self.fire(parent, WatchKind::Children);
        }
    }

    fn fire_node_deleted(&mut self, path: &str) {
        self.fire(path, WatchKind::Data);
        self.fire(path, WatchKind::Exists);
        if let Some((parent, _)) = split_path(path) {
            self.fire(parent, WatchKind::Children);
        }
    }

    fn has_children(&self, path: &str) -> bool {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .next()
            .is_some()
    }

    fn close_session(&mut self, session: SessionId) {
        let ephemerals: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.ephemeral_owner == Some(session))
            .map(|(p, _)| p.clone())
            .collect();
        for path in ephemerals {
            self.nodes.remove(&path);
            self.fire_node_deleted(&path);
        }
        // Pending watches armed by the closing session resolve with a
        // RecvError on the caller side once their senders drop.
        for pending in self.watches.values_mut() {
            pending.retain(|w| w.session != session);
        }
        self.watches.retain(|_, v| !v.is_empty());
    }
}

/// Shared in-memory store. Cheap to clone; every clone sees the same tree.
#[derive(Clone, Default)]
pub struct MemoryStore {
    core: Arc<Mutex<Core>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let store = Self::default();
        store
            .core
            .lock()
            .expect("store mutex poisoned")
            .nodes
            .insert("/".to_string(), Node::new(Vec::new(), None));
        store
    }

    /// Open a new session against this store.
    pub fn session(&self) -> MemorySession {
        let id = {
            let mut core = self.core.lock().expect("store mutex poisoned");
            core.next_session += 1;
            SessionId(core.next_session)
        };
        MemorySession {
            core: self.core.clone(),
            id,
            open: Arc::new(Mutex::new(true)),
        }
    }

    /// Dump every node path and its raw payload. Test-only inspection hook
    /// used to verify secrets never reach the store.
    pub fn dump(&self) -> Vec<(String, Vec<u8>)> {
        let core = self.core.lock().expect("store mutex poisoned");
        core.nodes
            .iter()
            .map(|(p, n)| (p.clone(), n.data.clone()))
            .collect()
    }
}

/// One session against a [`MemoryStore`]. Closing (or dropping) the session
/// removes its ephemeral nodes and cancels its pending watches.
pub struct MemorySession {
    core: Arc<Mutex<Core>>,
    id: SessionId,
    open: Arc<Mutex<bool>>,
}

impl MemorySession {
    /// Simulate session loss: ephemerals evaporate, watches cancel, and all
    /// further operations on this handle fail with `SessionExpired`.
    pub fn expire(&self) {
        let mut open = self.open.lock().expect("session mutex poisoned");
        if *open {
            *open = false;
            self.core
                .lock()
                .expect("store mutex poisoned")
                .close_session(self.id);
        }
    }

    fn check_open(&self) -> StoreResult<()> {
        if *self.open.lock().expect("session mutex poisoned") {
            Ok(())
        } else {
            Err(StoreError::SessionExpired)
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.expire();
    }
}

#[async_trait]
impl CoordStore for MemorySession {
    async fn create(&self, path: &str, data: Vec<u8>, flags: CreateFlags) -> StoreResult<String> {
        self.check_open()?;
        let mut core = self.core.lock().expect("store mutex poisoned");

        // split_path only fails for the root (pre-seeded) or a trailing slash.
        let (parent, _name) =
            split_path(path).ok_or_else(|| StoreError::AlreadyExists(path.to_string()))?;
        if !core.nodes.contains_key(parent) {
            return Err(StoreError::NoParent(path.to_string()));
        }

        let actual = if flags.sequential {
            let seq = {
                let parent_node = core
                    .nodes
                    .get_mut(parent)
                    .ok_or_else(|| StoreError::NoParent(path.to_string()))?;
                let seq = parent_node.next_seq;
                parent_node.next_seq += 1;
                seq
            };
            format!("{}{:010}", path, seq)
        } else {
            path.to_string()
        };

        if core.nodes.contains_key(&actual) {
            return Err(StoreError::AlreadyExists(actual));
        }

        let owner = flags.ephemeral.then_some(self.id);
        core.nodes.insert(actual.clone(), Node::new(data, owner));
        core.fire_node_created(&actual);
        Ok(actual)
    }

    async fn get(&self, path: &str) -> StoreResult<(Vec<u8>, Version)> {
        self.check_open()?;
        let core = self.core.lock().expect("store mutex poisoned");
        let node = core
            .nodes
            .get(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        Ok((node.data.clone(), node.version))
    }

    async fn set(&self, path: &str, data: Vec<u8>, expected: Version) -> StoreResult<Version> {
        self.check_open()?;
        let mut core = self.core.lock().expect("store mutex poisoned");
        let node = core
            .nodes
            .get_mut(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        if expected != ANY_VERSION && node.version != expected {
            return Err(StoreError::VersionConflict {
                path: path.to_string(),
                expected,
                actual: node.version,
            });
        }
        node.data = data;
        node.version += 1;
        let version = node.version;
        core.fire_node_changed(path);
        Ok(version)
    }

    async fn delete(&self, path: &str, expected: Version) -> StoreResult<()> {
        self.check_open()?;
        let mut core = self.core.lock().expect("store mutex poisoned");
        let node = core
            .nodes
            .get(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        if expected != ANY_VERSION && node.version != expected {
            return Err(StoreError::VersionConflict {
                path: path.to_string(),
                expected,
                actual: node.version,
            });
        }
        if core.has_children(path) {
            return Err(StoreError::NotEmpty(path.to_string()));
        }
        core.nodes.remove(path);
        core.fire_node_deleted(path);
        Ok(())
    }

    async fn children(&self, path: &str) -> StoreResult<Vec<String>> {
        self.check_open()?;
        let core = self.core.lock().expect("store mutex poisoned");
        if !core.nodes.contains_key(path) {
            return Err(StoreError::NotFound(path.to_string()));
        }
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        let names = core
            .nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter_map(|(p, _)| {
                let rest = &p[prefix.len()..];
                (!rest.contains('/')).then(|| rest.to_string())
            })
            .collect();
        Ok(names)
    }

    async fn watch(
        &self,
        path: &str,
        kind: WatchKind,
    ) -> StoreResult<oneshot::Receiver<WatchEvent>> {
        self.check_open()?;
        let (tx, rx) = oneshot::channel();
        let mut core = self.core.lock().expect("store mutex poisoned");
        core.watches
            .entry((path.to_string(), kind))
            .or_default()
            .push(PendingWatch {
                session: self.id,
                tx,
            });
        Ok(rx)
    }

    fn session_id(&self) -> SessionId {
        self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_session() -> (MemoryStore, MemorySession) {
        let store = MemoryStore::new();
        let session = store.session();
        (store, session)
    }

    #[tokio::test]
    async fn create_get_set_delete_roundtrip() {
        let (_store, s) = store_with_session();
        s.create("/a", b"1".to_vec(), CreateFlags::NONE).await.unwrap();
        let (data, version) = s.get("/a").await.unwrap();
        assert_eq!(data, b"1");
        assert_eq!(version, 0);

        let v2 = s.set("/a", b"2".to_vec(), 0).await.unwrap();
        assert_eq!(v2, 1);

        let conflict = s.set("/a", b"3".to_vec(), 0).await;
        assert!(matches!(conflict, Err(StoreError::VersionConflict { .. })));

        s.delete("/a", v2).await.unwrap();
        assert!(matches!(s.get("/a").await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn create_requires_parent() {
        let (_store, s) = store_with_session();
        let err = s.create("/a/b", Vec::new(), CreateFlags::NONE).await;
        assert!(matches!(err, Err(StoreError::NoParent(_))));
    }

    #[tokio::test]
    async fn sequential_counter_scoped_to_parent() {
        let (_store, s) = store_with_session();
        s.create("/jobs", Vec::new(), CreateFlags::NONE).await.unwrap();
        s.create("/other", Vec::new(), CreateFlags::NONE).await.unwrap();

        let first = s
            .create("/jobs/p", Vec::new(), CreateFlags::SEQUENTIAL)
            .await
            .unwrap();
        assert_eq!(first, "/jobs/p0000000001");
        let second = s
            .create("/jobs/p", Vec::new(), CreateFlags::SEQUENTIAL)
            .await
            .unwrap();
        assert_eq!(second, "/jobs/p0000000002");

        // Different parent, independent counter.
        let elsewhere = s
            .create("/other/p", Vec::new(), CreateFlags::SEQUENTIAL)
            .await
            .unwrap();
        assert_eq!(elsewhere, "/other/p0000000001");
    }

    #[tokio::test]
    async fn ephemerals_vanish_on_session_close() {
        let (store, s1) = store_with_session();
        let s2 = store.session();
        s1.create("/locks", Vec::new(), CreateFlags::NONE).await.unwrap();
        s1.create("/locks/a", Vec::new(), CreateFlags::EPHEMERAL)
            .await
            .unwrap();

        assert!(s2.get("/locks/a").await.is_ok());
        s1.expire();
        assert!(matches!(
            s2.get("/locks/a").await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(s1.get("/locks").await, Err(StoreError::SessionExpired)));
    }

    #[tokio::test]
    async fn children_lists_direct_level_only() {
        let (_store, s) = store_with_session();
        s.create("/a", Vec::new(), CreateFlags::NONE).await.unwrap();
        s.create("/a/x", Vec::new(), CreateFlags::NONE).await.unwrap();
        s.create("/a/y", Vec::new(), CreateFlags::NONE).await.unwrap();
        s.create("/a/x/deep", Vec::new(), CreateFlags::NONE).await.unwrap();

        let kids = s.children("/a").await.unwrap();
        assert_eq!(kids, vec!["x".to_string(), "y".to_string()]);
    }

    #[tokio::test]
    async fn watches_fire_once() {
        let (_store, s) = store_with_session();
        s.create("/a", Vec::new(), CreateFlags::NONE).await.unwrap();

        let data_watch = s.watch("/a", WatchKind::Data).await.unwrap();
        let child_watch = s.watch("/a", WatchKind::Children).await.unwrap();

        s.set("/a", b"x".to_vec(), ANY_VERSION).await.unwrap();
        let event = data_watch.await.unwrap();
        assert_eq!(event.kind, WatchKind::Data);

        s.create("/a/kid", Vec::new(), CreateFlags::NONE).await.unwrap();
        let event = child_watch.await.unwrap();
        assert_eq!(event.kind, WatchKind::Children);

        // One-shot: a second mutation needs a rearmed watch.
        let rearmed = s.watch("/a", WatchKind::Data).await.unwrap();
        s.set("/a", b"y".to_vec(), ANY_VERSION).await.unwrap();
        assert!(rearmed.await.is_ok());
    }

    #[tokio::test]
    async fn delete_refuses_non_leaf() {
        let (_store, s) = store_with_session();
        s.create("/a", Vec::new(), CreateFlags::NONE).await.unwrap();
        s.create("/a/b", Vec::new(), CreateFlags::NONE).await.unwrap();
        assert!(matches!(
            s.delete("/a", ANY_VERSION).await,
            Err(StoreError::NotEmpty(_))
        ));
    }
}

//! Coordination store abstraction.
//!
//! The dispatcher keeps all durable job and namespace state in an external
//! hierarchical KV service with atomic create/set/delete, ephemeral nodes
//! tied to a session, sequential nodes, and one-shot change notifications.
//! [`CoordStore`] states that contract; [`memory::MemoryStore`] is the
//! in-process implementation used by tests and single-node deployments, and
//! [`adapter::StoreAdapter`] layers retries, CAS helpers, and typed views on
//! top of any implementation.

pub mod adapter;
pub mod memory;

use async_trait::async_trait;
use tokio::sync::oneshot;

pub use adapter::StoreAdapter;
pub use memory::MemoryStore;

/// Node version used for compare-and-set operations.
///
/// Versions start at 0 on create and increment on every `set`. The wildcard
/// [`ANY_VERSION`] matches any current version.
pub type Version = i64;

/// Matches any version in `set`/`delete`.
pub const ANY_VERSION: Version = -1;

/// Identifies a store session. Ephemeral nodes are deleted when the session
/// that created them closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s{:08x}", self.0)
    }
}

/// Node creation flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CreateFlags {
    /// Append a per-parent monotonic counter, zero-padded to 10 digits,
    /// to the node name. The first sequential child of a parent gets 1.
    pub sequential: bool,
    /// Tie the node's lifetime to the creating session.
    pub ephemeral: bool,
}

impl CreateFlags {
    pub const NONE: CreateFlags = CreateFlags {
        sequential: false,
        ephemeral: false,
    };
    pub const SEQUENTIAL: CreateFlags = CreateFlags {
        sequential: true,
        ephemeral: false,
    };
    pub const EPHEMERAL: CreateFlags = CreateFlags {
        sequential: false,
        ephemeral: true,
    };
    pub const SEQUENTIAL_EPHEMERAL: CreateFlags = CreateFlags {
        sequential: true,
        ephemeral: true,
    };
}

/// What kind of change a watch fires on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchKind {
    /// Node data changed or node deleted.
    Data,
    /// Direct children added or removed.
    Children,
    /// Node created or deleted.
    Exists,
}

/// A single delivered watch notification. Watches are one-shot: after the
/// event fires the watch must be rearmed explicitly.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub path: String,
    pub kind: WatchKind,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("No node at {0}")]
    NotFound(String),

    #[error("Node already exists at {0}")]
    AlreadyExists(String),

    #[error("No parent node for {0}")]
    NoParent(String),

    #[error("Version conflict at {path}: expected {expected}, actual {actual}")]
    VersionConflict {
        path: String,
        expected: Version,
        actual: Version,
    },

    #[error("Node {0} has children")]
    NotEmpty(String),

    #[error("Session expired")]
    SessionExpired,

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Transient errors are worth retrying with backoff; the rest are
    /// decisions the caller has to handle.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Contract required of the external coordination service.
///
/// A `CoordStore` handle represents one session. Dropping or closing the
/// handle ends the session and removes every ephemeral node it created.
#[async_trait]
pub trait CoordStore: Send + Sync {
    /// Create a node. Returns the actual path, which differs from the
    /// requested one when `flags.sequential` is set.
    async fn create(&self, path: &str, data: Vec<u8>, flags: CreateFlags) -> StoreResult<String>;

    /// Read a node's data and current version.
    async fn get(&self, path: &str) -> StoreResult<(Vec<u8>, Version)>;

    /// Replace a node's data if its version matches `expected`
    /// ([`ANY_VERSION`] matches anything). Returns the new version.
    async fn set(&self, path: &str, data: Vec<u8>, expected: Version) -> StoreResult<Version>;

    /// Delete a leaf node if its version matches `expected`.
    async fn delete(&self, path: &str, expected: Version) -> StoreResult<()>;

    /// List the names (not full paths) of a node's direct children, sorted.
    async fn children(&self, path: &str) -> StoreResult<Vec<String>>;

    /// Arm a one-shot watch. The receiver resolves with the triggering
    /// event; it yields `RecvError` if the session closes first.
    async fn watch(&self, path: &str, kind: WatchKind)
        -> StoreResult<oneshot::Receiver<WatchEvent>>;

    /// This session's id, as exposed by the service.
    fn session_id(&self) -> SessionId;
}

/// Split a path into (parent, leaf name). Root has no parent.
pub(crate) fn split_path(path: &str) -> Option<(&str, &str)> {
    let idx = path.rfind('/')?;
    let parent = if idx == 0 { "/" } else { &path[..idx] };
    let name = &path[idx + 1..];
    if name.is_empty() {
        return None;
    }
    Some((parent, name))
}

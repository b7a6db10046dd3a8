//! Store adapter: retries, CAS helpers, path layout, and typed views.
//!
//! Every durable read/write in the dispatcher goes through [`StoreAdapter`].
//! Transient store errors are retried with jittered exponential backoff
//! (base 100 ms, cap 5 s) for up to the replay budget; version conflicts are
//! recovered by refetch-and-redecide, capped at 10 attempts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;

use super::{CoordStore, CreateFlags, SessionId, StoreError, Version, WatchEvent, WatchKind};
use crate::error::{PogoError, Result};
use crate::job::{HostRecord, JobId, JobRecord, JobStateRecord};
use crate::namespace::Namespace;

const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(5);
const DEFAULT_RETRY_BUDGET: Duration = Duration::from_secs(300);
const CAS_ATTEMPTS: usize = 10;

/// Path layout under the coordination store.
pub mod paths {
    use crate::job::JobId;

    pub const ROOT: &str = "/pogo";
    pub const JOBS: &str = "/pogo/jobs";
    pub const NAMESPACES: &str = "/pogo/ns";
    pub const DISPATCHERS: &str = "/pogo/dispatchers";

    /// Prefix handed to sequential create for jobid allocation.
    pub fn job_seq() -> String {
        format!("{}/p", JOBS)
    }

    pub fn job(jobid: &JobId) -> String {
        format!("{}/{}", JOBS, jobid)
    }

    pub fn job_state(jobid: &JobId) -> String {
        format!("{}/{}/state", JOBS, jobid)
    }

    pub fn job_hosts(jobid: &JobId) -> String {
        format!("{}/{}/hosts", JOBS, jobid)
    }

    pub fn job_host(jobid: &JobId, hostname: &str) -> String {
        format!("{}/{}/hosts/{}", JOBS, jobid, hostname)
    }

    pub fn job_owner(jobid: &JobId) -> String {
        format!("{}/{}/owner", JOBS, jobid)
    }

    pub fn ns(namespace: &str) -> String {
        format!("{}/{}", NAMESPACES, namespace)
    }

    pub fn ns_config(namespace: &str) -> String {
        format!("{}/{}/config", NAMESPACES, namespace)
    }

    pub fn ns_locks(namespace: &str) -> String {
        format!("{}/{}/locks", NAMESPACES, namespace)
    }

    pub fn ns_lock_tag(namespace: &str, tag: &str) -> String {
        format!("{}/{}/locks/{}", NAMESPACES, namespace, tag)
    }

    pub fn dispatcher(id: &str) -> String {
        format!("{}/{}", DISPATCHERS, id)
    }
}

fn store_err(e: StoreError) -> PogoError {
    match e {
        StoreError::VersionConflict { path, .. } => PogoError::CasConflict { path },
        StoreError::Unavailable(msg) => PogoError::CoordinationStoreUnavailable(msg),
        StoreError::SessionExpired => {
            PogoError::CoordinationStoreUnavailable("session expired".to_string())
        }
        other => PogoError::Internal(other.to_string()),
    }
}

type WatchKey = (String, WatchKind);

/// Session-scoped handle to the coordination store.
#[derive(Clone)]
pub struct StoreAdapter {
    store: Arc<dyn CoordStore>,
    retry_budget: Duration,
    /// Pending one-shot watches, keyed so duplicate rearms collapse onto the
    /// same underlying store watch.
    pending_watches: Arc<Mutex<HashMap<WatchKey, broadcast::Sender<WatchEvent>>>>,
}

impl StoreAdapter {
    pub fn new(store: Arc<dyn CoordStore>) -> Self {
        Self {
            store,
            retry_budget: DEFAULT_RETRY_BUDGET,
            pending_watches: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Shrink the transient-error replay budget (tests).
    pub fn with_retry_budget(mut self, budget: Duration) -> Self {
        self.retry_budget = budget;
        self
    }

    pub fn session_id(&self) -> SessionId {
        self.store.session_id()
    }

    /// Retry a store operation on transient errors with jittered
    /// exponential backoff until the replay budget runs out.
    async fn retrying<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = super::StoreResult<T>>,
    {
        let deadline = Instant::now() + self.retry_budget;
        let mut delay = BACKOFF_BASE;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    if Instant::now() >= deadline {
                        tracing::error!(what, error = %e, "Store retry budget exhausted");
                        return Err(store_err(e));
                    }
                    let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 2);
                    let sleep_for = delay + Duration::from_millis(jitter);
                    tracing::warn!(what, error = %e, delay_ms = sleep_for.as_millis() as u64, "Transient store error, backing off");
                    tokio::time::sleep(sleep_for).await;
                    delay = (delay * 2).min(BACKOFF_CAP);
                }
                Err(e) => return Err(store_err(e)),
            }
        }
    }

    pub async fn create(&self, path: &str, data: Vec<u8>, flags: CreateFlags) -> Result<String> {
        self.retrying("create", || self.store.create(path, data.clone(), flags))
            .await
    }

    pub async fn get(&self, path: &str) -> Result<(Vec<u8>, Version)> {
        self.retrying("get", || self.store.get(path)).await
    }

    pub async fn set(&self, path: &str, data: Vec<u8>, expected: Version) -> Result<Version> {
        self.retrying("set", || self.store.set(path, data.clone(), expected))
            .await
    }

    pub async fn delete(&self, path: &str, expected: Version) -> Result<()> {
        self.retrying("delete", || self.store.delete(path, expected))
            .await
    }

    pub async fn delete_if_present(&self, path: &str) -> Result<()> {
        match self.store.delete(path, super::ANY_VERSION).await {
            Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) if e.is_transient() => self.delete(path, super::ANY_VERSION).await,
            Err(e) => Err(store_err(e)),
        }
    }

    pub async fn children(&self, path: &str) -> Result<Vec<String>> {
        self.retrying("children", || self.store.children(path)).await
    }

    /// Like [`children`](Self::children), but a missing parent is an empty list.
    pub async fn children_or_empty(&self, path: &str) -> Result<Vec<String>> {
        match self.store.children(path).await {
            Ok(kids) => Ok(kids),
            Err(StoreError::NotFound(_)) => Ok(Vec::new()),
            Err(e) if e.is_transient() => self.children(path).await,
            Err(e) => Err(store_err(e)),
        }
    }

    /// Read a node that may legitimately be absent.
    pub async fn get_opt(&self, path: &str) -> Result<Option<(Vec<u8>, Version)>> {
        match self.store.get(path).await {
            Ok(pair) => Ok(Some(pair)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) if e.is_transient() => self.get(path).await.map(Some),
            Err(e) => Err(store_err(e)),
        }
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        match self.store.get(path).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(store_err(e)),
        }
    }

    /// Arm a one-shot watch, collapsing duplicate rearms for the same
    /// (path, kind) onto a single underlying store watch.
    pub async fn watch(&self, path: &str, kind: WatchKind) -> Result<broadcast::Receiver<WatchEvent>> {
        let key = (path.to_string(), kind);
        {
            let pending = self.pending_watches.lock().expect("watch mutex poisoned");
            if let Some(tx) = pending.get(&key) {
                return Ok(tx.subscribe());
            }
        }

        let rx = self
            .retrying("watch", || self.store.watch(path, kind))
            .await?;
        let (tx, out) = broadcast::channel(1);
        self.pending_watches
            .lock()
            .expect("watch mutex poisoned")
            .insert(key.clone(), tx.clone());

        let pending = self.pending_watches.clone();
        tokio::spawn(async move {
            if let Ok(event) = rx.await {
                let _ = tx.send(event);
            }
            pending.lock().expect("watch mutex poisoned").remove(&key);
        });
        Ok(out)
    }

    /// Create `path` and any missing ancestors with empty data.
    pub async fn ensure_path(&self, path: &str) -> Result<()> {
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            let result = self
                .retrying("create", || {
                    let p = current.clone();
                    let store = &self.store;
                    async move {
                        match store.create(&p, Vec::new(), CreateFlags::NONE).await {
                            Ok(_) | Err(StoreError::AlreadyExists(_)) => Ok(()),
                            Err(e) => Err(e),
                        }
                    }
                })
                .await;
            result?;
        }
        Ok(())
    }

    /// Create the standing `/pogo` tree.
    pub async fn bootstrap(&self) -> Result<()> {
        self.ensure_path(paths::JOBS).await?;
        self.ensure_path(paths::NAMESPACES).await?;
        self.ensure_path(paths::DISPATCHERS).await?;
        Ok(())
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<(T, Version)> {
        let (data, version) = self.get(path).await?;
        Ok((serde_json::from_slice(&data)?, version))
    }

    pub async fn create_json<T: Serialize>(
        &self,
        path: &str,
        value: &T,
        flags: CreateFlags,
    ) -> Result<String> {
        let data = serde_json::to_vec(value)?;
        self.create(path, data, flags).await
    }

    pub async fn set_json<T: Serialize>(
        &self,
        path: &str,
        value: &T,
        expected: Version,
    ) -> Result<Version> {
        let data = serde_json::to_vec(value)?;
        self.set(path, data, expected).await
    }

    /// Write raw bytes regardless of what is there: create if missing,
    /// otherwise CAS against the observed version, refetching on conflict.
    pub async fn put_bytes(&self, path: &str, data: Vec<u8>) -> Result<Version> {
        for _ in 0..CAS_ATTEMPTS {
            match self.get_opt(path).await? {
                Some((_, version)) => match self.set(path, data.clone(), version).await {
                    Ok(v) => return Ok(v),
                    Err(PogoError::CasConflict { .. }) => continue,
                    Err(e) => return Err(e),
                },
                None => match self.store.create(path, data.clone(), CreateFlags::NONE).await {
                    Ok(_) => return Ok(0),
                    // Raced with a concurrent creator; CAS on the next pass.
                    Err(StoreError::AlreadyExists(_)) => continue,
                    Err(e) if e.is_transient() => continue,
                    Err(e) => return Err(store_err(e)),
                },
            }
        }
        Err(PogoError::Internal(format!(
            "put exceeded {} CAS attempts at {}",
            CAS_ATTEMPTS, path
        )))
    }

    pub async fn put_json<T: Serialize>(&self, path: &str, value: &T) -> Result<Version> {
        self.put_bytes(path, serde_json::to_vec(value)?).await
    }

    /// Read-modify-write with CAS: refetch and re-decide on conflict, up to
    /// 10 attempts, then surface `Internal`.
    pub async fn update_json<T, F>(&self, path: &str, mut apply: F) -> Result<T>
    where
        T: DeserializeOwned + Serialize,
        F: FnMut(&mut T) -> Result<()>,
    {
        for _ in 0..CAS_ATTEMPTS {
            let (mut value, version): (T, Version) = self.get_json(path).await?;
            apply(&mut value)?;
            match self.set_json(path, &value, version).await {
                Ok(_) => return Ok(value),
                Err(PogoError::CasConflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(PogoError::Internal(format!(
            "update exceeded {} CAS attempts at {}",
            CAS_ATTEMPTS, path
        )))
    }

    pub fn job(&self, jobid: JobId) -> JobView<'_> {
        JobView {
            adapter: self,
            jobid,
        }
    }

    pub fn namespace(&self, name: &str) -> NamespaceView<'_> {
        NamespaceView {
            adapter: self,
            name: name.to_string(),
        }
    }
}

/// Typed access to one job's durable state.
pub struct JobView<'a> {
    adapter: &'a StoreAdapter,
    jobid: JobId,
}

impl JobView<'_> {
    pub fn jobid(&self) -> &JobId {
        &self.jobid
    }

    pub async fn record(&self) -> Result<JobRecord> {
        match self.adapter.get_opt(&paths::job(&self.jobid)).await? {
            Some((data, _)) => Ok(serde_json::from_slice(&data)?),
            None => Err(PogoError::JobNotFound(self.jobid.to_string())),
        }
    }

    pub async fn state(&self) -> Result<(JobStateRecord, Version)> {
        self.adapter.get_json(&paths::job_state(&self.jobid)).await
    }

    pub async fn init_state(&self, state: &JobStateRecord) -> Result<()> {
        self.adapter
            .create_json(&paths::job_state(&self.jobid), state, CreateFlags::NONE)
            .await?;
        Ok(())
    }

    pub async fn write_state(&self, state: &JobStateRecord) -> Result<Version> {
        self.adapter.put_json(&paths::job_state(&self.jobid), state).await
    }

    pub async fn host(&self, hostname: &str) -> Result<HostRecord> {
        let (record, _) = self
            .adapter
            .get_json(&paths::job_host(&self.jobid, hostname))
            .await?;
        Ok(record)
    }

    pub async fn init_host(&self, record: &HostRecord) -> Result<()> {
        self.adapter
            .create_json(
                &paths::job_host(&self.jobid, &record.hostname),
                record,
                CreateFlags::NONE,
            )
            .await?;
        Ok(())
    }

    pub async fn write_host(&self, record: &HostRecord) -> Result<Version> {
        self.adapter
            .put_json(&paths::job_host(&self.jobid, &record.hostname), record)
            .await
    }

    pub async fn hostnames(&self) -> Result<Vec<String>> {
        self.adapter.children(&paths::job_hosts(&self.jobid)).await
    }

    pub async fn hosts(&self) -> Result<Vec<HostRecord>> {
        let mut records = Vec::new();
        for name in self.hostnames().await? {
            records.push(self.host(&name).await?);
        }
        Ok(records)
    }

    /// Claim exclusive ownership of this job for the calling dispatcher.
    /// The claim is an ephemeral node, so it evaporates with the session.
    pub async fn claim(&self, dispatcher_id: &str) -> Result<bool> {
        let path = paths::job_owner(&self.jobid);
        match self
            .adapter
            .store
            .create(&path, dispatcher_id.as_bytes().to_vec(), CreateFlags::EPHEMERAL)
            .await
        {
            Ok(_) => Ok(true),
            Err(StoreError::AlreadyExists(_)) => Ok(false),
            Err(e) => Err(store_err(e)),
        }
    }
}

/// Typed access to one namespace's durable state and lock registry.
pub struct NamespaceView<'a> {
    adapter: &'a StoreAdapter,
    name: String,
}

impl NamespaceView<'_> {
    /// Load and parse the namespace document.
    pub async fn load(&self) -> Result<Namespace> {
        let Some((data, _)) = self.adapter.get_opt(&paths::ns_config(&self.name)).await? else {
            return Err(PogoError::UnknownNamespace(self.name.clone()));
        };
        let doc = String::from_utf8(data)
            .map_err(|_| PogoError::Internal("namespace config is not UTF-8".to_string()))?;
        Namespace::from_yaml(&self.name, &doc)
    }

    /// Validate and persist a namespace document.
    pub async fn save_yaml(&self, doc: &str) -> Result<()> {
        Namespace::from_yaml(&self.name, doc)?;
        self.adapter.ensure_path(&paths::ns(&self.name)).await?;
        self.adapter
            .put_bytes(&paths::ns_config(&self.name), doc.as_bytes().to_vec())
            .await?;
        Ok(())
    }

    /// Currently held lock slots for a tag, across every dispatcher.
    pub async fn lock_count(&self, tag: &str) -> Result<usize> {
        Ok(self
            .adapter
            .children_or_empty(&paths::ns_lock_tag(&self.name, tag))
            .await?
            .len())
    }

    /// Register an ephemeral lock slot against a tag. Returns the lock path
    /// for later release.
    pub async fn acquire_lock(&self, tag: &str) -> Result<String> {
        self.adapter
            .ensure_path(&paths::ns_lock_tag(&self.name, tag))
            .await?;
        let prefix = format!("{}/lock-", paths::ns_lock_tag(&self.name, tag));
        self.adapter
            .create(&prefix, Vec::new(), CreateFlags::SEQUENTIAL_EPHEMERAL)
            .await
    }

    pub async fn release_lock(&self, lock_path: &str) -> Result<()> {
        self.adapter.delete_if_present(lock_path).await
    }
}

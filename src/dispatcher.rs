//! Dispatcher process: binds the store session, job controllers, worker
//! pool, and the front-end surface.
//!
//! One dispatcher owns the jobs it created (plus any orphans it adopts via
//! the store's ownership claims) and routes worker results back to the
//! owning controller's event queue. All cross-dispatcher coordination goes
//! through the store: sequential jobids, ephemeral locks, ephemeral
//! liveness and ownership records.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::DispatcherConfig;
use crate::error::{PogoError, Result};
use crate::job::controller::{JobController, JobHandle};
use crate::job::{HaltCause, HostRecord, JobId, JobRecord, JobSpec, JobStateRecord};
use crate::store::adapter::paths;
use crate::store::{CoordStore, CreateFlags, StoreAdapter};
use crate::target;
use crate::tls::TlsIdentity;
use crate::worker::pool::{PoolRunner, TaskResult};
use crate::worker::session;
use crate::worker::{Secret, WorkerPool};

const RESULTS_QUEUE_DEPTH: usize = 256;

/// Static record plus a state summary, as returned by `jobinfo`.
#[derive(Debug, Serialize)]
pub struct JobInfo {
    #[serde(flatten)]
    pub record: JobRecord,
    #[serde(flatten)]
    pub state: JobStateRecord,
    pub host_counts: HashMap<String, usize>,
}

/// One row of a `listjobs` response.
#[derive(Debug, Serialize)]
pub struct JobSummary {
    pub jobid: JobId,
    pub user: String,
    pub command: String,
    pub target: String,
    pub namespace: String,
    pub state: String,
    pub exit_status: Option<i32>,
}

/// ANDed filters for `listjobs`.
#[derive(Debug, Default, serde::Deserialize)]
pub struct JobFilters {
    pub user: Option<String>,
    pub state: Option<String>,
    pub target: Option<String>,
    #[serde(default)]
    pub offset: usize,
    pub limit: Option<usize>,
    #[serde(default)]
    pub page: usize,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub hostname: String,
    pub workers_idle: usize,
    pub workers_busy: usize,
    pub per_job_counts: HashMap<String, HashMap<String, usize>>,
}

struct DispatcherInner {
    id: String,
    config: DispatcherConfig,
    store: StoreAdapter,
    pool: WorkerPool,
    jobs: RwLock<HashMap<JobId, JobHandle>>,
    ns_serial: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    shutdown: CancellationToken,
}

/// Handle to a running dispatcher. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// Bring up a dispatcher on an open store session: bootstrap the tree,
    /// register liveness, start the worker pool, connect the worker fleet,
    /// and adopt any unowned non-terminal jobs.
    pub async fn start(
        config: DispatcherConfig,
        store: Arc<dyn CoordStore>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let adapter = StoreAdapter::new(store);
        adapter.bootstrap().await?;
        adapter
            .create(
                &paths::dispatcher(&config.dispatcher_id),
                config.bind.to_string().into_bytes(),
                CreateFlags::EPHEMERAL,
            )
            .await?;

        let (pool, runner) = WorkerPool::new(config.grace_window());
        let (results_tx, results_rx) = mpsc::channel(RESULTS_QUEUE_DEPTH);
        tokio::spawn(PoolRunner::run(runner, results_tx));

        let dispatcher = Self {
            inner: Arc::new(DispatcherInner {
                id: config.dispatcher_id.clone(),
                store: adapter,
                pool,
                jobs: RwLock::new(HashMap::new()),
                ns_serial: Mutex::new(HashMap::new()),
                shutdown,
                config,
            }),
        };

        dispatcher.spawn_result_router(results_rx);
        dispatcher.connect_workers().await?;
        dispatcher.adopt_orphans().await;
        Ok(dispatcher)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    pub fn store(&self) -> &StoreAdapter {
        &self.inner.store
    }

    fn spawn_result_router(&self, mut results_rx: mpsc::Receiver<TaskResult>) {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(result) = results_rx.recv().await {
                let handle = this.inner.jobs.read().await.get(&result.jobid).cloned();
                match handle {
                    Some(handle) => {
                        if let Err(e) = handle.host_result(result).await {
                            tracing::warn!(error = %e, "Controller refused a result");
                        }
                    }
                    None => {
                        tracing::warn!(jobid = %result.jobid, "Result for job not driven here");
                    }
                }
            }
        });
    }

    async fn connect_workers(&self) -> Result<()> {
        let config = &self.inner.config;
        let tls_client = if config.tls.is_complete() {
            let identity = TlsIdentity::load(&config.tls)
                .await
                .map_err(|e| PogoError::Internal(format!("TLS setup: {}", e)))?;
            Some(
                identity
                    .client(
                        &config.tls_server_name,
                        config.tls.pinned_fingerprints.clone(),
                    )
                    .map_err(|e| PogoError::Internal(format!("TLS setup: {}", e)))?,
            )
        } else {
            None
        };

        for addr in &config.workers {
            session::spawn_dialer(
                addr.clone(),
                tls_client.clone(),
                self.inner.pool.clone(),
                self.inner.shutdown.clone(),
            );
        }

        if let Some(addr) = config.worker_bind {
            let acceptor = if config.tls.is_complete() {
                let identity = TlsIdentity::load(&config.tls)
                    .await
                    .map_err(|e| PogoError::Internal(format!("TLS setup: {}", e)))?;
                Some(
                    identity
                        .acceptor()
                        .map_err(|e| PogoError::Internal(format!("TLS setup: {}", e)))?,
                )
            } else {
                None
            };
            let pool = self.inner.pool.clone();
            let shutdown = self.inner.shutdown.clone();
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .map_err(|e| PogoError::Internal(format!("worker bind {}: {}", addr, e)))?;
            tracing::info!(addr = %addr, "Listening for worker sessions");
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        accepted = listener.accept() => {
                            let Ok((tcp, peer)) = accepted else { continue };
                            tracing::debug!(peer = %peer, "Inbound worker connection");
                            match &acceptor {
                                Some(acceptor) => {
                                    let acceptor = acceptor.clone();
                                    let pool = pool.clone();
                                    tokio::spawn(async move {
                                        match acceptor.accept(tcp).await {
                                            Ok(stream) => session::run_session(stream, &pool).await,
                                            Err(e) => {
                                                tracing::warn!(peer = %peer, error = %e, "TLS accept failed")
                                            }
                                        }
                                    });
                                }
                                None => {
                                    session::spawn_session(tcp, pool.clone());
                                }
                            }
                        }
                    }
                }
            });
        }
        Ok(())
    }

    fn ns_serial_for(&self, namespace: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.inner
            .ns_serial
            .lock()
            .expect("ns serial mutex poisoned")
            .entry(namespace.to_string())
            .or_default()
            .clone()
    }

    /// `run`: create and start a job.
    pub async fn run_job(&self, spec: JobSpec) -> Result<JobId> {
        spec.validate()?;
        let namespace = self.inner.store.namespace(&spec.namespace).load().await?;
        let order = target::expand(&spec.target, &namespace)?;

        // Sequential create under /pogo/jobs allocates the jobid.
        let node = self
            .inner
            .store
            .create(&paths::job_seq(), Vec::new(), CreateFlags::SEQUENTIAL)
            .await?;
        let leaf = node.rsplit('/').next().unwrap_or(&node);
        let jobid = JobId::parse(leaf)?;

        let record = JobRecord::from_spec(jobid.clone(), &spec);
        let view = self.inner.store.job(jobid.clone());
        self.inner.store.put_json(&node, &record).await?;
        view.init_state(&JobStateRecord::gathering()).await?;
        self.inner
            .store
            .ensure_path(&paths::job_hosts(&jobid))
            .await?;

        let mut hosts = HashMap::new();
        for hostname in &order {
            let host = HostRecord::new(jobid.clone(), hostname.clone());
            view.init_host(&host).await?;
            hosts.insert(hostname.clone(), host);
        }
        view.claim(&self.inner.id).await?;

        let secret = spec.password.as_deref().map(Secret::new);
        let handle = self
            .spawn_controller(record, namespace, order, hosts, JobStateRecord::gathering(), secret)
            .await;
        handle.start().await?;

        tracing::info!(jobid = %jobid, user = %spec.user, target = %spec.target, "Job created");
        Ok(jobid)
    }

    async fn spawn_controller(
        &self,
        record: JobRecord,
        namespace: crate::namespace::Namespace,
        order: Vec<String>,
        hosts: HashMap<String, HostRecord>,
        state: JobStateRecord,
        secret: Option<Secret>,
    ) -> JobHandle {
        let serial = self.ns_serial_for(&record.namespace);
        let jobid = record.jobid.clone();
        let (handle, controller, rx) = JobController::new(
            record,
            namespace,
            order,
            hosts,
            state,
            secret,
            self.inner.store.clone(),
            self.inner.pool.clone(),
            serial,
        );
        tokio::spawn(controller.run(rx));
        self.inner.jobs.write().await.insert(jobid, handle.clone());
        handle
    }

    /// Scan the store for non-terminal jobs nobody owns and take them over.
    async fn adopt_orphans(&self) {
        let names = match self.inner.store.children_or_empty(paths::JOBS).await {
            Ok(names) => names,
            Err(e) => {
                tracing::warn!(error = %e, "Orphan scan failed");
                return;
            }
        };
        for name in names {
            let Ok(jobid) = JobId::parse(&name) else {
                continue;
            };
            if let Err(e) = self.try_adopt(jobid.clone()).await {
                tracing::debug!(jobid = %jobid, error = %e, "Not adopting job");
            }
        }
    }

    async fn try_adopt(&self, jobid: JobId) -> Result<()> {
        if self.inner.jobs.read().await.contains_key(&jobid) {
            return Ok(());
        }
        let view = self.inner.store.job(jobid.clone());
        let (state, _) = view.state().await?;
        if state.state.is_terminal() {
            return Ok(());
        }
        if !view.claim(&self.inner.id).await? {
            // A live dispatcher still owns it.
            return Ok(());
        }
        let record = view.record().await?;
        let namespace = self.inner.store.namespace(&record.namespace).load().await?;
        let host_records = view.hosts().await?;
        let mut hosts = HashMap::new();
        for host in host_records {
            hosts.insert(host.hostname.clone(), host);
        }
        // Recover the fairness order; fall back to lexicographic if the
        // namespace changed under the job.
        let order = match target::expand(&record.target, &namespace) {
            Ok(order) if order.iter().all(|h| hosts.contains_key(h)) => order,
            _ => {
                let mut names: Vec<String> = hosts.keys().cloned().collect();
                names.sort();
                names
            }
        };
        tracing::info!(jobid = %jobid, "Adopting orphaned job");
        let handle = self
            .spawn_controller(record, namespace, order, hosts, state, None)
            .await;
        handle.start().await?;
        Ok(())
    }

    async fn handle_for(&self, jobid: &JobId) -> Result<JobHandle> {
        if let Some(handle) = self.inner.jobs.read().await.get(jobid) {
            return Ok(handle.clone());
        }
        // Distinguish "no such job" from "driven elsewhere".
        let view = self.inner.store.job(jobid.clone());
        view.record().await?;
        Err(PogoError::DispatchRejected(format!(
            "job {} is driven by another dispatcher",
            jobid
        )))
    }

    pub async fn halt(&self, jobid: &JobId, cause: HaltCause) -> Result<()> {
        self.handle_for(jobid).await?.halt(cause).await
    }

    pub async fn retry(&self, jobid: &JobId, hosts: Vec<String>) -> Result<()> {
        self.handle_for(jobid).await?.retry(hosts).await
    }

    pub async fn jobinfo(&self, jobid: &JobId) -> Result<JobInfo> {
        let view = self.inner.store.job(jobid.clone());
        let record = view.record().await?;
        let (state, _) = view.state().await?;
        let mut host_counts: HashMap<String, usize> = HashMap::new();
        for host in view.hosts().await? {
            *host_counts.entry(host.state.to_string()).or_insert(0) += 1;
        }
        Ok(JobInfo {
            record,
            state,
            host_counts,
        })
    }

    /// `jobstatus`: current state plus a page of host records.
    pub async fn jobstatus(
        &self,
        jobid: &JobId,
        offset: usize,
        limit: usize,
    ) -> Result<(JobStateRecord, Vec<HostRecord>, usize)> {
        let view = self.inner.store.job(jobid.clone());
        view.record().await?;
        let (state, _) = view.state().await?;
        let all = view.hosts().await?;
        let total = all.len();
        let page = all.into_iter().skip(offset).take(limit).collect();
        Ok((state, page, total))
    }

    /// `listjobs`: ANDed filters, newest first by jobid.
    pub async fn listjobs(&self, filters: &JobFilters) -> Result<Vec<JobSummary>> {
        let mut names = self.inner.store.children_or_empty(paths::JOBS).await?;
        names.sort_by_key(|n| std::cmp::Reverse(JobId::parse(n).map(|j| j.seq()).unwrap_or(0)));

        let limit = filters.limit.unwrap_or(50);
        let skip = filters.offset + filters.page * limit;
        let mut rows = Vec::new();
        for name in names {
            let Ok(jobid) = JobId::parse(&name) else {
                continue;
            };
            let view = self.inner.store.job(jobid.clone());
            let Ok(record) = view.record().await else {
                continue;
            };
            let Ok((state, _)) = view.state().await else {
                continue;
            };
            let state_label = state.state.to_string();
            if let Some(user) = &filters.user {
                if record.user != *user {
                    continue;
                }
            }
            if let Some(state_filter) = &filters.state {
                if !state_label.starts_with(state_filter.as_str()) {
                    continue;
                }
            }
            if let Some(target_filter) = &filters.target {
                if record.target != *target_filter {
                    continue;
                }
            }
            rows.push(JobSummary {
                jobid: record.jobid.clone(),
                user: record.user,
                command: record.command,
                target: record.target,
                namespace: record.namespace,
                state: state_label,
                exit_status: state.exit_status,
            });
            if rows.len() >= skip + limit {
                break;
            }
        }
        Ok(rows.into_iter().skip(skip).take(limit).collect())
    }

    /// `loadconf`: validate and persist a namespace document.
    pub async fn loadconf(&self, namespace: &str, yaml_doc: &str) -> Result<()> {
        self.inner.store.namespace(namespace).save_yaml(yaml_doc).await?;
        tracing::info!(namespace, "Namespace configuration loaded");
        Ok(())
    }

    pub async fn stats(&self) -> Result<StatsResponse> {
        let pool_stats = self.inner.pool.stats().await?;
        let jobids: Vec<JobId> = self.inner.jobs.read().await.keys().cloned().collect();
        let mut per_job_counts = HashMap::new();
        for jobid in jobids {
            let view = self.inner.store.job(jobid.clone());
            let Ok(hosts) = view.hosts().await else {
                continue;
            };
            let mut counts: HashMap<String, usize> = HashMap::new();
            for host in hosts {
                *counts.entry(host.state.to_string()).or_insert(0) += 1;
            }
            per_job_counts.insert(jobid.to_string(), counts);
        }
        Ok(StatsResponse {
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            workers_idle: pool_stats.workers_idle,
            workers_busy: pool_stats.workers_busy,
            per_job_counts,
        })
    }

    /// Resolve a user-supplied job reference.
    pub fn to_jobid(&self, raw: &str) -> Result<JobId> {
        if raw == "last" {
            // Needs a notion of "the calling user's most recent job".
            return Err(PogoError::NotImplemented("to_jobid(\"last\")"));
        }
        JobId::parse(raw)
    }
}

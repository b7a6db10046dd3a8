//! Worker pool: session registry, dispatch selection, and result routing.
//!
//! The pool runs as a single event loop fed by session tasks and by the
//! dispatcher. Selection picks the worker with the lowest
//! `in_flight/capacity` ratio, breaking ties by least recent use; workers in
//! the reconnect grace window are excluded. Task results leave the loop on
//! the results channel in the order the owning session delivered them.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

use super::proto::{ReqId, WireMessage};
use super::secrets::{Secret, SecretStore};
use crate::error::{PogoError, Result};
use crate::job::JobId;

const POOL_QUEUE_DEPTH: usize = 256;
const PING_INTERVAL: Duration = Duration::from_secs(10);

/// Default reconnect grace window after a session drop.
pub const DEFAULT_GRACE_WINDOW: Duration = Duration::from_secs(30);

/// A task handed to the pool for execution on some worker.
#[derive(Debug)]
pub struct DispatchTask {
    pub jobid: JobId,
    pub hostname: String,
    pub command: String,
    pub run_as: Option<String>,
    pub timeout: u64,
    pub secret: Option<Secret>,
}

/// Final outcome of a dispatched task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Exited {
        exit_code: i32,
        message: Option<String>,
        duration_ms: u64,
        cancelled: bool,
    },
    /// Session lost and not resumed within the grace window.
    WorkerLost,
}

/// Routed back to the owning job controller via the results channel.
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub jobid: JobId,
    pub hostname: String,
    pub worker: String,
    pub req_id: ReqId,
    pub outcome: TaskOutcome,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct PoolStats {
    pub workers_idle: usize,
    pub workers_busy: usize,
    pub tasks_in_flight: usize,
}

/// Messages into the pool loop.
#[derive(Debug)]
pub enum PoolMessage {
    SessionOpened {
        worker_id: String,
        conn: Uuid,
        capacity: u32,
        version: String,
        resume: bool,
        outbound: mpsc::Sender<WireMessage>,
    },
    SessionClosed {
        worker_id: String,
        conn: Uuid,
    },
    FromWorker {
        worker_id: String,
        msg: WireMessage,
    },
    Dispatch {
        task: DispatchTask,
        reply: oneshot::Sender<Result<(ReqId, String)>>,
    },
    Cancel {
        req_id: ReqId,
    },
    /// Stop tracking a request whose host was already finalized
    /// (abandoned); a late RESULT for it is dropped as unknown.
    Forget {
        req_id: ReqId,
    },
    Stats {
        reply: oneshot::Sender<PoolStats>,
    },
    GraceExpired {
        worker_id: String,
        conn: Uuid,
    },
}

/// Handle to the pool loop. Cheap to clone.
#[derive(Clone)]
pub struct WorkerPool {
    tx: mpsc::Sender<PoolMessage>,
}

impl WorkerPool {
    /// Build a pool handle and its runner. The runner must be spawned.
    pub fn new(grace_window: Duration) -> (Self, PoolRunner) {
        let (tx, rx) = mpsc::channel(POOL_QUEUE_DEPTH);
        let pool = Self { tx };
        let runner = PoolRunner {
            rx,
            self_tx: pool.tx.clone(),
            grace_window,
            workers: HashMap::new(),
            pending: HashMap::new(),
            secrets: SecretStore::new(),
            next_req_id: 1,
        };
        (pool, runner)
    }

    pub(crate) fn sender(&self) -> mpsc::Sender<PoolMessage> {
        self.tx.clone()
    }

    /// Dispatch a task. Resolves with the request id and the chosen
    /// worker's id once the task is on its way; the final outcome arrives
    /// on the results channel.
    pub async fn dispatch(&self, task: DispatchTask) -> Result<(ReqId, String)> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PoolMessage::Dispatch { task, reply })
            .await
            .map_err(|_| PogoError::Internal("worker pool is gone".to_string()))?;
        rx.await
            .map_err(|_| PogoError::Internal("worker pool dropped the dispatch".to_string()))?
    }

    /// Best-effort cancel of an in-flight request.
    pub async fn cancel(&self, req_id: ReqId) -> Result<()> {
        self.tx
            .send(PoolMessage::Cancel { req_id })
            .await
            .map_err(|_| PogoError::Internal("worker pool is gone".to_string()))
    }

    /// Stop tracking a request; its secret is discarded and any late result
    /// is dropped.
    pub async fn forget(&self, req_id: ReqId) -> Result<()> {
        self.tx
            .send(PoolMessage::Forget { req_id })
            .await
            .map_err(|_| PogoError::Internal("worker pool is gone".to_string()))
    }

    pub async fn stats(&self) -> Result<PoolStats> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PoolMessage::Stats { reply })
            .await
            .map_err(|_| PogoError::Internal("worker pool is gone".to_string()))?;
        rx.await
            .map_err(|_| PogoError::Internal("worker pool is gone".to_string()))
    }
}

struct WorkerEntry {
    conn: Uuid,
    capacity: u32,
    in_flight: HashSet<ReqId>,
    outbound: mpsc::Sender<WireMessage>,
    last_seen: Instant,
    last_used: Instant,
    /// False while the worker is in the reconnect grace window.
    connected: bool,
}

struct PendingTask {
    jobid: JobId,
    hostname: String,
    worker_id: String,
}

/// Owns all pool state; consumed by [`run`](PoolRunner::run).
pub struct PoolRunner {
    rx: mpsc::Receiver<PoolMessage>,
    self_tx: mpsc::Sender<PoolMessage>,
    grace_window: Duration,
    workers: HashMap<String, WorkerEntry>,
    pending: HashMap<ReqId, PendingTask>,
    secrets: SecretStore,
    next_req_id: ReqId,
}

impl PoolRunner {
    /// Pool event loop. Runs until every pool handle is dropped.
    pub async fn run(mut self, results: mpsc::Sender<TaskResult>) {
        let mut ping_interval = tokio::time::interval(PING_INTERVAL);
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = self.rx.recv() => {
                    let Some(msg) = msg else { break };
                    self.handle(msg, &results).await;
                }
                _ = ping_interval.tick() => {
                    self.ping_workers();
                }
            }
        }
    }

    async fn handle(&mut self, msg: PoolMessage, results: &mpsc::Sender<TaskResult>) {
        match msg {
            PoolMessage::SessionOpened {
                worker_id,
                conn,
                capacity,
                version,
                resume,
                outbound,
            } => {
                self.session_opened(worker_id, conn, capacity, version, resume, outbound, results)
                    .await;
            }
            PoolMessage::SessionClosed { worker_id, conn } => {
                self.session_closed(worker_id, conn);
            }
            PoolMessage::FromWorker { worker_id, msg } => {
                self.from_worker(worker_id, msg, results).await;
            }
            PoolMessage::Dispatch { task, reply } => {
                let _ = reply.send(self.dispatch(task));
            }
            PoolMessage::Cancel { req_id } => {
                self.cancel(req_id);
            }
            PoolMessage::Forget { req_id } => {
                self.secrets.discard(req_id);
                if let Some(task) = self.pending.remove(&req_id) {
                    if let Some(entry) = self.workers.get_mut(&task.worker_id) {
                        entry.in_flight.remove(&req_id);
                    }
                }
            }
            PoolMessage::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            PoolMessage::GraceExpired { worker_id, conn } => {
                self.grace_expired(worker_id, conn, results).await;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn session_opened(
        &mut self,
        worker_id: String,
        conn: Uuid,
        capacity: u32,
        version: String,
        resume: bool,
        outbound: mpsc::Sender<WireMessage>,
        results: &mpsc::Sender<TaskResult>,
    ) {
        let now = Instant::now();
        match self.workers.get_mut(&worker_id) {
            Some(entry) if !entry.connected => {
                // Reconnect within the grace window.
                entry.conn = conn;
                entry.capacity = capacity;
                entry.outbound = outbound;
                entry.last_seen = now;
                entry.connected = true;
                tracing::info!(worker_id, capacity, resume, "Worker reconnected");
                if !resume {
                    // The worker cannot replay results for the old session's
                    // requests; fail them now.
                    let orphaned: Vec<ReqId> = entry.in_flight.drain().collect();
                    self.fail_requests(&worker_id, orphaned, results).await;
                }
            }
            Some(entry) => {
                // Duplicate session for a live worker: the newest wins.
                tracing::warn!(worker_id, "Replacing live session for worker");
                entry.conn = conn;
                entry.capacity = capacity;
                entry.outbound = outbound;
                entry.last_seen = now;
            }
            None => {
                tracing::info!(worker_id, capacity, version, "Worker registered");
                self.workers.insert(
                    worker_id,
                    WorkerEntry {
                        conn,
                        capacity,
                        in_flight: HashSet::new(),
                        outbound,
                        last_seen: now,
                        last_used: now,
                        connected: true,
                    },
                );
            }
        }
    }

    fn session_closed(&mut self, worker_id: String, conn: Uuid) {
        let Some(entry) = self.workers.get_mut(&worker_id) else {
            return;
        };
        if entry.conn != conn {
            // A newer session already took over.
            return;
        }
        entry.connected = false;
        tracing::warn!(
            worker_id,
            in_flight = entry.in_flight.len(),
            grace_s = self.grace_window.as_secs(),
            "Worker session lost, entering grace window"
        );
        let tx = self.self_tx.clone();
        let grace = self.grace_window;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = tx.send(PoolMessage::GraceExpired { worker_id, conn }).await;
        });
    }

    async fn grace_expired(
        &mut self,
        worker_id: String,
        conn: Uuid,
        results: &mpsc::Sender<TaskResult>,
    ) {
        let Some(entry) = self.workers.get_mut(&worker_id) else {
            return;
        };
        if entry.connected || entry.conn != conn {
            return;
        }
        let orphaned: Vec<ReqId> = entry.in_flight.drain().collect();
        self.workers.remove(&worker_id);
        tracing::warn!(worker_id, lost = orphaned.len(), "Worker grace window expired");
        self.fail_requests(&worker_id, orphaned, results).await;
    }

    async fn fail_requests(
        &mut self,
        worker_id: &str,
        req_ids: Vec<ReqId>,
        results: &mpsc::Sender<TaskResult>,
    ) {
        for req_id in req_ids {
            self.secrets.discard(req_id);
            if let Some(task) = self.pending.remove(&req_id) {
                let _ = results
                    .send(TaskResult {
                        jobid: task.jobid,
                        hostname: task.hostname,
                        worker: worker_id.to_string(),
                        req_id,
                        outcome: TaskOutcome::WorkerLost,
                    })
                    .await;
            }
        }
    }

    async fn from_worker(
        &mut self,
        worker_id: String,
        msg: WireMessage,
        results: &mpsc::Sender<TaskResult>,
    ) {
        if let Some(entry) = self.workers.get_mut(&worker_id) {
            entry.last_seen = Instant::now();
        }
        match msg {
            WireMessage::Ack { req_id } => {
                tracing::debug!(worker_id, req_id, "Task acknowledged");
            }
            WireMessage::Update {
                req_id, message, ..
            } => {
                tracing::debug!(worker_id, req_id, message = ?message, "Task progress");
            }
            WireMessage::Result {
                req_id,
                exit_code,
                message,
                duration_ms,
                cancelled,
            } => {
                self.secrets.discard(req_id);
                if let Some(entry) = self.workers.get_mut(&worker_id) {
                    entry.in_flight.remove(&req_id);
                }
                let Some(task) = self.pending.remove(&req_id) else {
                    // Replayed or duplicate result; the first one won.
                    tracing::debug!(worker_id, req_id, "Result for unknown request");
                    return;
                };
                let _ = results
                    .send(TaskResult {
                        jobid: task.jobid,
                        hostname: task.hostname,
                        worker: worker_id,
                        req_id,
                        outcome: TaskOutcome::Exited {
                            exit_code,
                            message,
                            duration_ms,
                            cancelled,
                        },
                    })
                    .await;
            }
            WireMessage::FetchSecret { req_id } => {
                // Honored exactly once; a second fetch sees None.
                let value = self.secrets.fetch(req_id);
                self.send_to(&worker_id, WireMessage::Secret { req_id, value });
            }
            WireMessage::Ping => {
                self.send_to(&worker_id, WireMessage::Pong);
            }
            WireMessage::Pong => {}
            other => {
                tracing::warn!(worker_id, message = ?other, "Unexpected message from worker");
            }
        }
    }

    fn dispatch(&mut self, task: DispatchTask) -> Result<(ReqId, String)> {
        let Some(worker_id) = self.select_worker() else {
            return Err(PogoError::DispatchRejected(
                "no worker available".to_string(),
            ));
        };

        let req_id = self.next_req_id;
        self.next_req_id += 1;

        let password_ref = task.secret.map(|secret| {
            self.secrets.register(req_id, secret);
            SecretStore::reference(req_id)
        });

        let message = WireMessage::Dispatch {
            req_id,
            jobid: task.jobid.clone(),
            hostname: task.hostname.clone(),
            command: task.command,
            run_as: task.run_as,
            timeout: task.timeout,
            password_ref,
        };

        let entry = self
            .workers
            .get_mut(&worker_id)
            .expect("selected worker exists");
        if entry.outbound.try_send(message).is_err() {
            self.secrets.discard(req_id);
            return Err(PogoError::DispatchRejected(format!(
                "worker {} is not accepting tasks",
                worker_id
            )));
        }

        entry.in_flight.insert(req_id);
        entry.last_used = Instant::now();
        self.pending.insert(
            req_id,
            PendingTask {
                jobid: task.jobid.clone(),
                hostname: task.hostname.clone(),
                worker_id: worker_id.clone(),
            },
        );
        tracing::info!(
            jobid = %task.jobid,
            hostname = %task.hostname,
            worker_id,
            req_id,
            "Task dispatched"
        );
        Ok((req_id, worker_id))
    }

    /// Lowest in_flight/capacity ratio wins; ties go to the least recently
    /// used worker. Grace-window and saturated workers are excluded.
    fn select_worker(&self) -> Option<String> {
        self.workers
            .iter()
            .filter(|(_, w)| w.connected && (w.in_flight.len() as u32) < w.capacity)
            .min_by(|(_, a), (_, b)| {
                let a_ratio = a.in_flight.len() as u64 * b.capacity as u64;
                let b_ratio = b.in_flight.len() as u64 * a.capacity as u64;
                a_ratio.cmp(&b_ratio).then(a.last_used.cmp(&b.last_used))
            })
            .map(|(id, _)| id.clone())
    }

    fn cancel(&mut self, req_id: ReqId) {
        let Some(task) = self.pending.get(&req_id) else {
            return;
        };
        let worker_id = task.worker_id.clone();
        tracing::info!(worker_id, req_id, "Cancelling task");
        self.send_to(&worker_id, WireMessage::Cancel { req_id });
    }

    fn send_to(&mut self, worker_id: &str, msg: WireMessage) {
        if let Some(entry) = self.workers.get(worker_id) {
            if entry.outbound.try_send(msg).is_err() {
                tracing::warn!(worker_id, "Worker outbound queue unavailable");
            }
        }
    }

    fn ping_workers(&mut self) {
        let targets: Vec<String> = self
            .workers
            .iter()
            .filter(|(_, w)| w.connected)
            .map(|(id, _)| id.clone())
            .collect();
        for worker_id in targets {
            self.send_to(&worker_id, WireMessage::Ping);
        }
    }

    fn stats(&self) -> PoolStats {
        let mut stats = PoolStats::default();
        for entry in self.workers.values() {
            if !entry.connected {
                continue;
            }
            if entry.in_flight.is_empty() {
                stats.workers_idle += 1;
            } else {
                stats.workers_busy += 1;
                stats.tasks_in_flight += entry.in_flight.len();
            }
        }
        stats
    }
}

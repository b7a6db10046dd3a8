//! Job controller: one event loop per job.
//!
//! Every operation on a job (start, halt, retry, worker results, timer
//! expiries) arrives as a [`JobEvent`] on a single queue, so events for one
//! job are processed in strict FIFO order and each handler observes a
//! consistent snapshot of the job's hosts. State changes are persisted to
//! the coordination store as they happen; the in-memory tables are a cache
//! reconstructable from the store on dispatcher failover.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::error::{PogoError, Result};
use crate::job::{FailReason, HaltCause, HostRecord, HostState, JobId, JobRecord, JobState, JobStateRecord};
use crate::namespace::Namespace;
use crate::scheduler::{self, HostSnapshot, TickInput};
use crate::store::adapter::paths;
use crate::store::{StoreAdapter, WatchKind};
use crate::worker::pool::{DispatchTask, TaskOutcome, TaskResult};
use crate::worker::proto::ReqId;
use crate::worker::{Secret, WorkerPool};

const EVENT_QUEUE_DEPTH: usize = 256;

/// Events consumed by the controller loop.
#[derive(Debug)]
pub enum JobEvent {
    Start,
    Halt {
        cause: HaltCause,
    },
    Retry {
        hosts: Vec<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    HostResult {
        result: TaskResult,
    },
    HostTimeout {
        hostname: String,
    },
    /// Safety timer after a cancellation went unanswered.
    Abandon {
        hostname: String,
    },
    JobTimeout,
    Tick,
}

/// Handle for feeding events to a running controller.
#[derive(Clone)]
pub struct JobHandle {
    pub jobid: JobId,
    tx: mpsc::Sender<JobEvent>,
}

impl JobHandle {
    async fn send(&self, event: JobEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| PogoError::JobNotFound(self.jobid.to_string()))
    }

    pub async fn start(&self) -> Result<()> {
        self.send(JobEvent::Start).await
    }

    pub async fn halt(&self, cause: HaltCause) -> Result<()> {
        self.send(JobEvent::Halt { cause }).await
    }

    pub async fn retry(&self, hosts: Vec<String>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(JobEvent::Retry { hosts, reply }).await?;
        rx.await
            .map_err(|_| PogoError::JobNotFound(self.jobid.to_string()))?
    }

    pub async fn host_result(&self, result: TaskResult) -> Result<()> {
        self.send(JobEvent::HostResult { result }).await
    }

    pub async fn tick(&self) -> Result<()> {
        self.send(JobEvent::Tick).await
    }
}

struct ActiveDispatch {
    req_id: ReqId,
    /// Reason a pending cancellation should record, once the worker answers
    /// or the safety timer fires.
    cancel_reason: Option<FailReason>,
    timer: JoinHandle<()>,
}

impl Drop for ActiveDispatch {
    fn drop(&mut self) {
        self.timer.abort();
    }
}

/// Owns one job's lifecycle from `pending` to a terminal state.
pub struct JobController {
    record: JobRecord,
    namespace: Namespace,
    /// Expansion order; drives fairness.
    order: Vec<String>,
    hosts: HashMap<String, HostRecord>,
    state: JobStateRecord,
    store: StoreAdapter,
    pool: WorkerPool,
    /// Master copy of the job password; dropped once no host can be
    /// dispatched anymore.
    secret: Option<Secret>,
    active: HashMap<String, ActiveDispatch>,
    /// Lock paths held per running host.
    held_locks: HashMap<String, Vec<String>>,
    caps: Vec<(String, usize)>,
    resolved_concurrent: usize,
    /// Serializes scheduler ticks across jobs sharing the namespace.
    ns_serial: Arc<Mutex<()>>,
    job_timer: Option<JoinHandle<()>>,
    /// A wakeup (lock watch or retry timer) is already pending.
    wakeup_armed: bool,
    tx: mpsc::Sender<JobEvent>,
}

impl JobController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        record: JobRecord,
        namespace: Namespace,
        order: Vec<String>,
        hosts: HashMap<String, HostRecord>,
        state: JobStateRecord,
        secret: Option<Secret>,
        store: StoreAdapter,
        pool: WorkerPool,
        ns_serial: Arc<Mutex<()>>,
    ) -> (JobHandle, Self, mpsc::Receiver<JobEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let caps = scheduler::resolved_caps(&namespace);
        let resolved_concurrent = record.concurrent.resolve(order.len()).max(1);
        let handle = JobHandle {
            jobid: record.jobid.clone(),
            tx: tx.clone(),
        };
        let controller = Self {
            record,
            namespace,
            order,
            hosts,
            state,
            store,
            pool,
            secret,
            active: HashMap::new(),
            held_locks: HashMap::new(),
            caps,
            resolved_concurrent,
            ns_serial,
            job_timer: None,
            wakeup_armed: false,
            tx,
        };
        (handle, controller, rx)
    }

    fn jobid(&self) -> &JobId {
        &self.record.jobid
    }

    /// Controller loop. Ends when every handle is dropped.
    pub async fn run(mut self, mut rx: mpsc::Receiver<JobEvent>) {
        self.recover().await;
        while let Some(event) = rx.recv().await {
            self.handle(event).await;
        }
        if let Some(timer) = self.job_timer.take() {
            timer.abort();
        }
    }

    /// Reconcile in-memory state against what the store recorded before a
    /// failover. Hosts stuck `running` had their dispatch die with the old
    /// dispatcher's worker sessions.
    async fn recover(&mut self) {
        if self.state.state.is_terminal() {
            return;
        }
        let stuck: Vec<String> = self
            .order
            .iter()
            .filter(|h| {
                self.hosts.get(*h).map(|r| r.state) == Some(HostState::Running)
                    && !self.active.contains_key(*h)
            })
            .cloned()
            .collect();
        for hostname in stuck {
            tracing::warn!(jobid = %self.jobid(), hostname, "Adopted host with no live dispatch");
            self.finalize_host(
                &hostname,
                HostState::Failed {
                    reason: FailReason::WorkerLost,
                },
                None,
                Some("dispatcher failover".to_string()),
            )
            .await;
        }
        match self.state.state {
            JobState::Pending | JobState::Running => {
                self.rearm_job_timer();
                self.tick().await;
            }
            _ => {}
        }
    }

    async fn handle(&mut self, event: JobEvent) {
        match event {
            JobEvent::Start => self.on_start().await,
            JobEvent::Halt { cause } => self.halt(cause, FailReason::Cancelled, false).await,
            JobEvent::Retry { hosts, reply } => {
                let result = self.retry(hosts).await;
                let _ = reply.send(result);
            }
            JobEvent::HostResult { result } => self.on_host_result(result).await,
            JobEvent::HostTimeout { hostname } => self.on_host_timeout(hostname).await,
            JobEvent::Abandon { hostname } => self.on_abandon(hostname).await,
            JobEvent::JobTimeout => {
                self.halt(HaltCause::Timeout, FailReason::JobTimeout, true).await
            }
            JobEvent::Tick => self.tick().await,
        }
    }

    async fn on_start(&mut self) {
        if self.state.state != JobState::Gathering {
            // Idempotent: already past pending.
            self.tick().await;
            return;
        }
        self.state.state = JobState::Pending;
        self.state.start_ts = Some(Utc::now());
        self.persist_state().await;
        tracing::info!(jobid = %self.jobid(), hosts = self.order.len(), "Job started");
        self.rearm_job_timer();
        self.tick().await;
    }

    fn rearm_job_timer(&mut self) {
        let Some(job_timeout) = self.record.job_timeout else {
            return;
        };
        if let Some(old) = self.job_timer.take() {
            old.abort();
        }
        // On recovery, honor the wall clock from the recorded start.
        let elapsed = self
            .state
            .start_ts
            .map(|ts| (Utc::now() - ts).num_seconds().max(0) as u64)
            .unwrap_or(0);
        let remaining = Duration::from_secs(job_timeout.saturating_sub(elapsed));
        let tx = self.tx.clone();
        self.job_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            let _ = tx.send(JobEvent::JobTimeout).await;
        }));
    }

    /// One scheduling pass: promote, skip, deadlock, and admit hosts, then
    /// dispatch the admitted ones. Ticks for jobs in one namespace are
    /// serialized so constraint evaluation never sees a torn lock view.
    async fn tick(&mut self) {
        self.wakeup_armed = false;
        if self.state.state.is_terminal() || self.state.state == JobState::Gathering {
            return;
        }
        if self.state.state == JobState::Pending {
            self.state.state = JobState::Running;
            self.persist_state().await;
        }

        let serial = self.ns_serial.clone();
        let _guard = serial.lock().await;

        let mut lock_counts = HashMap::new();
        for (tag, _) in &self.caps {
            match self.store.namespace(&self.record.namespace).lock_count(tag).await {
                Ok(count) => {
                    lock_counts.insert(tag.clone(), count);
                }
                Err(e) => {
                    tracing::warn!(jobid = %self.jobid(), error = %e, "Lock census failed, skipping tick");
                    return;
                }
            }
        }

        let snapshot: Vec<HostSnapshot> = self
            .order
            .iter()
            .filter_map(|h| self.hosts.get(h))
            .map(|r| HostSnapshot {
                hostname: r.hostname.clone(),
                state: r.state,
            })
            .collect();
        let plan = scheduler::plan_tick(&TickInput {
            namespace: &self.namespace,
            hosts: &snapshot,
            concurrent: self.resolved_concurrent,
            lock_counts,
        });

        for hostname in &plan.skip {
            self.transition_host(hostname, HostState::Skipped).await;
        }
        for hostname in &plan.deadlock {
            tracing::warn!(jobid = %self.jobid(), hostname, "Host wait is unsatisfiable");
            self.transition_host(hostname, HostState::Deadlocked).await;
        }
        for hostname in &plan.promote {
            self.transition_host(hostname, HostState::Ready).await;
        }

        for admission in plan.admit {
            self.admit(&admission.hostname, &admission.lock_tags).await;
        }

        if !self
            .hosts
            .values()
            .any(|r| matches!(r.state, HostState::Waiting | HostState::Ready))
        {
            // Every dispatch that will ever happen has consumed it.
            self.secret = None;
        }

        if self.hosts.values().any(|r| r.state == HostState::Ready) {
            self.arm_wakeups().await;
        }
        self.check_complete().await;
    }

    /// Hosts are ready but nothing was admitted: somebody else holds the
    /// slots, or no worker would take the task. Wake up when the namespace
    /// lock registry changes, with a timer as the fallback.
    async fn arm_wakeups(&mut self) {
        if self.wakeup_armed || self.state.state.is_terminal() {
            return;
        }
        self.wakeup_armed = true;

        for (tag, _) in &self.caps {
            let path = paths::ns_lock_tag(&self.record.namespace, tag);
            match self.store.watch(&path, WatchKind::Children).await {
                Ok(mut rx) => {
                    let tx = self.tx.clone();
                    tokio::spawn(async move {
                        if rx.recv().await.is_ok() {
                            let _ = tx.send(JobEvent::Tick).await;
                        }
                    });
                }
                Err(e) => {
                    tracing::debug!(jobid = %self.jobid(), error = %e, "Lock watch failed to arm");
                }
            }
        }

        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let _ = tx.send(JobEvent::Tick).await;
        });
    }

    /// Admit one host: register lock slots, reconfirm the caps, dispatch.
    /// An overshoot observed after the lock write rolls back and leaves the
    /// host ready for a later tick.
    async fn admit(&mut self, hostname: &str, lock_tags: &[String]) {
        let ns_name = self.record.namespace.clone();
        let mut acquired: Vec<String> = Vec::new();
        let mut rollback = false;
        for tag in lock_tags {
            let view = self.store.namespace(&ns_name);
            match view.acquire_lock(tag).await {
                Ok(path) => acquired.push(path),
                Err(e) => {
                    tracing::warn!(jobid = %self.jobid(), hostname, error = %e, "Lock write failed");
                    rollback = true;
                    break;
                }
            }
            let cap = self
                .caps
                .iter()
                .find(|(t, _)| t == tag)
                .map(|(_, c)| *c)
                .unwrap_or(usize::MAX);
            match view.lock_count(tag).await {
                Ok(count) if count <= cap => {}
                Ok(_) => {
                    // Raced another dispatcher past the cap; retreat.
                    rollback = true;
                    break;
                }
                Err(e) => {
                    tracing::warn!(jobid = %self.jobid(), hostname, error = %e, "Lock reconfirm failed");
                    rollback = true;
                    break;
                }
            }
        }
        if rollback {
            self.release_paths(&ns_name, acquired).await;
            return;
        }

        let task = DispatchTask {
            jobid: self.jobid().clone(),
            hostname: hostname.to_string(),
            command: self.record.command.clone(),
            run_as: self.record.run_as.clone(),
            timeout: self.record.timeout,
            secret: self.secret.clone(),
        };
        match self.pool.dispatch(task).await {
            Ok((req_id, worker)) => {
                let recorded = match self.hosts.get_mut(hostname) {
                    Some(record) => match record.transition(HostState::Running) {
                        Ok(()) => {
                            record.worker = Some(worker);
                            true
                        }
                        Err(_) => false,
                    },
                    None => false,
                };
                if !recorded {
                    let _ = self.pool.cancel(req_id).await;
                    let _ = self.pool.forget(req_id).await;
                    self.release_paths(&ns_name, acquired).await;
                    return;
                }
                self.persist_host(hostname).await;
                self.held_locks.insert(hostname.to_string(), acquired);

                let timeout = self.record.timeout;
                let tx = self.tx.clone();
                let timer_host = hostname.to_string();
                let timer = tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(timeout)).await;
                    let _ = tx.send(JobEvent::HostTimeout { hostname: timer_host }).await;
                });
                self.active.insert(
                    hostname.to_string(),
                    ActiveDispatch {
                        req_id,
                        cancel_reason: None,
                        timer,
                    },
                );
            }
            Err(e) => {
                tracing::debug!(jobid = %self.jobid(), hostname, error = %e, "Dispatch rejected");
                self.release_paths(&ns_name, acquired).await;
            }
        }
    }

    async fn on_host_result(&mut self, result: TaskResult) {
        let hostname = result.hostname.clone();
        let Some(dispatch) = self.active.get(&hostname) else {
            tracing::debug!(jobid = %self.jobid(), hostname, "Result for host with no live dispatch");
            return;
        };
        if dispatch.req_id != result.req_id {
            // A stale attempt (pre-retry) answered late.
            tracing::debug!(jobid = %self.jobid(), hostname, req_id = result.req_id, "Stale result ignored");
            return;
        }
        let cancel_reason = dispatch.cancel_reason;

        let (next, exit_code, message) = match result.outcome {
            TaskOutcome::Exited {
                exit_code,
                message,
                cancelled,
                ..
            } => {
                if exit_code == 0 && !cancelled {
                    (HostState::Finished, Some(0), message)
                } else {
                    let reason = cancel_reason.unwrap_or(if cancelled {
                        FailReason::Cancelled
                    } else {
                        FailReason::CommandFailed
                    });
                    (HostState::Failed { reason }, Some(exit_code), message)
                }
            }
            TaskOutcome::WorkerLost => (
                HostState::Failed {
                    reason: FailReason::WorkerLost,
                },
                None,
                Some("worker lost".to_string()),
            ),
        };

        self.finalize_host(&hostname, next, exit_code, message).await;
        self.tick().await;
    }

    /// Per-host timeout: the host fails `timeout` right away; the CANCEL to
    /// the worker is a courtesy and any late RESULT is dropped.
    async fn on_host_timeout(&mut self, hostname: String) {
        let Some(dispatch) = self.active.get(&hostname) else {
            return;
        };
        if dispatch.cancel_reason.is_some() {
            return;
        }
        let req_id = dispatch.req_id;
        tracing::info!(jobid = %self.jobid(), hostname, "Per-host timeout");
        let _ = self.pool.cancel(req_id).await;
        let _ = self.pool.forget(req_id).await;
        self.finalize_host(
            &hostname,
            HostState::Failed {
                reason: FailReason::Timeout,
            },
            None,
            Some(format!("no result within {}s", self.record.timeout)),
        )
        .await;
        self.tick().await;
    }

    /// The 2x-timeout safety net: the worker never answered a cancellation.
    async fn on_abandon(&mut self, hostname: String) {
        let Some(dispatch) = self.active.get(&hostname) else {
            return;
        };
        let req_id = dispatch.req_id;
        tracing::warn!(jobid = %self.jobid(), hostname, "Cancelled dispatch never answered, abandoning");
        let _ = self.pool.forget(req_id).await;
        self.finalize_host(
            &hostname,
            HostState::Failed {
                reason: FailReason::Abandoned,
            },
            None,
            Some("no response to cancellation".to_string()),
        )
        .await;
        self.tick().await;
    }

    fn arm_abandon_timer(&mut self, hostname: &str) {
        let Some(dispatch) = self.active.get_mut(hostname) else {
            return;
        };
        dispatch.timer.abort();
        let tx = self.tx.clone();
        let timer_host = hostname.to_string();
        let window = Duration::from_secs(self.record.timeout * 2);
        dispatch.timer = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let _ = tx.send(JobEvent::Abandon { hostname: timer_host }).await;
        });
    }

    /// Halt the job and fail every host that has not reached a terminal
    /// state. Terminal hosts are never reverted. With `immediate` (job
    /// timeout) running hosts are recorded failed at once; otherwise (user
    /// halt) they are cancelled and finalize on the worker's RESULT or the
    /// 2x-timeout safety net.
    async fn halt(&mut self, cause: HaltCause, fail_reason: FailReason, immediate: bool) {
        if self.state.state.is_terminal() {
            return;
        }
        tracing::info!(jobid = %self.jobid(), cause = ?cause, "Halting job");
        self.state.state = JobState::Halted(cause);
        self.state.exit_status = Some(1);
        self.persist_state().await;
        if let Some(timer) = self.job_timer.take() {
            timer.abort();
        }

        let running: Vec<String> = self.active.keys().cloned().collect();
        for hostname in running {
            let Some(dispatch) = self.active.get_mut(&hostname) else {
                continue;
            };
            let req_id = dispatch.req_id;
            if immediate {
                let _ = self.pool.cancel(req_id).await;
                let _ = self.pool.forget(req_id).await;
                self.finalize_host(
                    &hostname,
                    HostState::Failed {
                        reason: fail_reason,
                    },
                    None,
                    None,
                )
                .await;
            } else {
                dispatch.cancel_reason = Some(fail_reason);
                self.arm_abandon_timer(&hostname);
                let _ = self.pool.cancel(req_id).await;
            }
        }

        // Hosts that never ran fail immediately.
        let idle: Vec<String> = self
            .order
            .iter()
            .filter(|h| {
                self.hosts
                    .get(*h)
                    .map(|r| matches!(r.state, HostState::Waiting | HostState::Ready))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        for hostname in idle {
            self.finalize_host(
                &hostname,
                HostState::Failed {
                    reason: fail_reason,
                },
                None,
                None,
            )
            .await;
        }

        self.secret = None;
    }

    /// Reset failed/skipped/deadlocked hosts back to waiting. Refused once
    /// the job is finished; a halted job accepts the reset but will not
    /// dispatch again.
    async fn retry(&mut self, hostnames: Vec<String>) -> Result<()> {
        if self.state.state == JobState::Finished {
            return Err(PogoError::DispatchRejected(format!(
                "job {} is finished",
                self.jobid()
            )));
        }
        // Validate the whole batch before touching anything.
        for hostname in &hostnames {
            let record = self
                .hosts
                .get(hostname)
                .ok_or_else(|| PogoError::InvalidSpec(format!("unknown host: {hostname}")))?;
            if !record.state.is_terminal_failure() {
                return Err(PogoError::DispatchRejected(format!(
                    "host {} is {} and cannot be retried",
                    hostname, record.state
                )));
            }
        }
        for hostname in &hostnames {
            if let Some(record) = self.hosts.get_mut(hostname) {
                let _ = record.reset_for_retry();
            }
            self.persist_host(hostname).await;
            tracing::info!(jobid = %self.jobid(), hostname = %hostname, "Host requeued");
        }
        self.tick().await;
        Ok(())
    }

    /// Apply a scheduler-planned transition and persist it.
    async fn transition_host(&mut self, hostname: &str, next: HostState) {
        let Some(record) = self.hosts.get_mut(hostname) else {
            return;
        };
        if let Err(e) = record.transition(next) {
            tracing::error!(jobid = %self.jobid(), hostname, error = %e, "Dropped transition");
            return;
        }
        self.persist_host(hostname).await;
    }

    /// Drive a host to a terminal state and release everything it held.
    async fn finalize_host(
        &mut self,
        hostname: &str,
        next: HostState,
        exit_code: Option<i32>,
        message: Option<String>,
    ) {
        {
            let Some(record) = self.hosts.get_mut(hostname) else {
                return;
            };
            if record.state.is_terminal() {
                return;
            }
            if let Err(e) = record.transition(next) {
                tracing::error!(jobid = %self.jobid(), hostname, error = %e, "Dropped terminal transition");
                return;
            }
            record.exit_code = exit_code;
            if message.is_some() {
                record.message = message;
            }
        }
        self.active.remove(hostname);
        self.persist_host(hostname).await;

        if let Some(paths) = self.held_locks.remove(hostname) {
            let ns_name = self.record.namespace.clone();
            self.release_paths(&ns_name, paths).await;
        }
        tracing::info!(
            jobid = %self.jobid(),
            hostname,
            state = %self.hosts.get(hostname).map(|r| r.state).unwrap_or(next),
            "Host finalized"
        );
    }

    async fn release_paths(&self, ns_name: &str, paths: Vec<String>) {
        let view = self.store.namespace(ns_name);
        for path in paths {
            if let Err(e) = view.release_lock(&path).await {
                tracing::warn!(jobid = %self.jobid(), error = %e, "Lock release failed");
            }
        }
    }

    /// Finish the job once every host is terminal (unless it halted).
    async fn check_complete(&mut self) {
        if self.state.state.is_terminal() {
            return;
        }
        if !self.hosts.values().all(|r| r.state.is_terminal()) {
            return;
        }
        let all_ok = self
            .hosts
            .values()
            .all(|r| r.state == HostState::Finished);
        self.state.state = JobState::Finished;
        self.state.exit_status = Some(if all_ok { 0 } else { 1 });
        self.persist_state().await;
        if let Some(timer) = self.job_timer.take() {
            timer.abort();
        }
        self.secret = None;
        tracing::info!(jobid = %self.jobid(), exit_status = ?self.state.exit_status, "Job finished");
    }

    /// Store write failures must not kill the job; the store adapter already
    /// burned its replay budget, so log and carry on with the cached state.
    async fn persist_state(&self) {
        let view = self.store.job(self.jobid().clone());
        if let Err(e) = view.write_state(&self.state).await {
            tracing::error!(jobid = %self.jobid(), error = %e, "Failed to persist job state");
        }
    }

    async fn persist_host(&self, hostname: &str) {
        let Some(record) = self.hosts.get(hostname) else {
            return;
        };
        let view = self.store.job(self.jobid().clone());
        if let Err(e) = view.write_host(record).await {
            tracing::error!(jobid = %self.jobid(), hostname, error = %e, "Failed to persist host");
        }
    }
}

//! Job and host records and their state machines.
//!
//! A job moves `gathering -> pending -> running -> {halted, finished}`; each
//! of its hosts moves `waiting -> ready -> running -> {finished, failed,
//! skipped, deadlocked}`. Transitions are validated here so a terminal state
//! is never left again; the one sanctioned exception is an explicit retry,
//! which resets failed/skipped/deadlocked hosts back to `waiting`.

pub mod controller;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{PogoError, Result};
use crate::namespace::Capacity;

/// Opaque job identifier: `p` followed by a 10-digit zero-padded sequence
/// number allocated by the coordination store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn from_seq(seq: u64) -> Self {
        JobId(format!("p{:010}", seq))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let well_formed = raw
            .strip_prefix('p')
            .map(|d| d.len() == 10 && d.bytes().all(|b| b.is_ascii_digit()))
            .unwrap_or(false);
        if !well_formed {
            return Err(PogoError::InvalidSpec(format!("invalid jobid: {raw}")));
        }
        Ok(JobId(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Numeric sequence component, for ordering.
    pub fn seq(&self) -> u64 {
        self.0[1..].parse().unwrap_or(0)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why a job halted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltCause {
    UserHalt,
    Timeout,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "cause", rename_all = "snake_case")]
pub enum JobState {
    Gathering,
    Pending,
    Running,
    Halted(HaltCause),
    Finished,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Halted(_) | JobState::Finished)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Gathering => write!(f, "gathering"),
            JobState::Pending => write!(f, "pending"),
            JobState::Running => write!(f, "running"),
            JobState::Halted(HaltCause::UserHalt) => write!(f, "halted(user_halt)"),
            JobState::Halted(HaltCause::Timeout) => write!(f, "halted(timeout)"),
            JobState::Halted(HaltCause::Failed) => write!(f, "halted(failed)"),
            JobState::Finished => write!(f, "finished"),
        }
    }
}

/// Why a host attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailReason {
    /// Worker reported a non-zero exit.
    CommandFailed,
    /// Per-host timeout elapsed.
    Timeout,
    /// Whole-job timeout elapsed while the host ran.
    JobTimeout,
    /// Worker session lost beyond the reconnect grace window.
    WorkerLost,
    /// Cancelled and no worker response within the safety window.
    Abandoned,
    /// Cancelled by a user halt.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum HostState {
    Waiting,
    Ready,
    Running,
    Finished,
    Failed { reason: FailReason },
    Skipped,
    Deadlocked,
}

impl HostState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            HostState::Finished | HostState::Failed { .. } | HostState::Skipped | HostState::Deadlocked
        )
    }

    pub fn is_terminal_failure(&self) -> bool {
        matches!(
            self,
            HostState::Failed { .. } | HostState::Skipped | HostState::Deadlocked
        )
    }

    /// Whether the state machine permits `self -> next`. Retry resets are
    /// handled separately by [`HostRecord::reset_for_retry`].
    ///
    /// `waiting`/`ready` hosts may fail directly: a job halt marks every
    /// not-yet-run host failed so the job reaches a fully terminal roster.
    pub fn can_transition_to(&self, next: HostState) -> bool {
        use HostState::*;
        match (self, next) {
            (Waiting, Ready) | (Waiting, Skipped) | (Waiting, Deadlocked) => true,
            (Waiting, Failed { .. }) | (Ready, Failed { .. }) => true,
            (Ready, Running) | (Ready, Skipped) => true,
            (Running, Finished) | (Running, Failed { .. }) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for HostState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostState::Waiting => write!(f, "waiting"),
            HostState::Ready => write!(f, "ready"),
            HostState::Running => write!(f, "running"),
            HostState::Finished => write!(f, "finished"),
            HostState::Failed { reason } => match reason {
                FailReason::CommandFailed => write!(f, "failed"),
                FailReason::Timeout => write!(f, "failed(timeout)"),
                FailReason::JobTimeout => write!(f, "failed(job_timeout)"),
                FailReason::WorkerLost => write!(f, "failed(worker_lost)"),
                FailReason::Abandoned => write!(f, "failed(abandoned)"),
                FailReason::Cancelled => write!(f, "failed(cancelled)"),
            },
            HostState::Skipped => write!(f, "skipped"),
            HostState::Deadlocked => write!(f, "deadlocked"),
        }
    }
}

fn default_timeout() -> u64 {
    600
}

fn default_concurrent() -> Capacity {
    Capacity::Count(1)
}

/// User-supplied job description, as accepted by `run`.
///
/// The password is accepted on input but never serialized back out; the
/// durable record written to the coordination store is [`JobRecord`].
#[derive(Clone, Deserialize)]
pub struct JobSpec {
    pub user: String,
    #[serde(default)]
    pub run_as: Option<String>,
    pub command: String,
    pub target: String,
    pub namespace: String,
    /// Per-host timeout, seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Whole-job wall-clock timeout, seconds.
    #[serde(default)]
    pub job_timeout: Option<u64>,
    #[serde(default = "default_concurrent")]
    pub concurrent: Capacity,
    #[serde(default)]
    pub password: Option<String>,
}

impl std::fmt::Debug for JobSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobSpec")
            .field("user", &self.user)
            .field("run_as", &self.run_as)
            .field("command", &self.command)
            .field("target", &self.target)
            .field("namespace", &self.namespace)
            .field("timeout", &self.timeout)
            .field("job_timeout", &self.job_timeout)
            .field("concurrent", &self.concurrent)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .finish()
    }
}

impl JobSpec {
    /// Basic field validation; target/namespace resolution happens later.
    pub fn validate(&self) -> Result<()> {
        if self.user.trim().is_empty() {
            return Err(PogoError::InvalidSpec("user is required".into()));
        }
        if self.command.trim().is_empty() {
            return Err(PogoError::InvalidSpec("command is required".into()));
        }
        if self.target.trim().is_empty() {
            return Err(PogoError::InvalidSpec("target is required".into()));
        }
        if self.timeout == 0 {
            return Err(PogoError::InvalidSpec("timeout must be positive".into()));
        }
        if let Capacity::Count(0) = self.concurrent {
            return Err(PogoError::InvalidSpec("concurrent must be at least 1".into()));
        }
        Ok(())
    }
}

/// Durable job description stored at `/pogo/jobs/<jobid>`. Carries no
/// password, by construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub jobid: JobId,
    pub user: String,
    pub run_as: Option<String>,
    pub command: String,
    pub target: String,
    pub namespace: String,
    pub timeout: u64,
    pub job_timeout: Option<u64>,
    pub concurrent: Capacity,
    pub created_ts: DateTime<Utc>,
}

impl JobRecord {
    pub fn from_spec(jobid: JobId, spec: &JobSpec) -> Self {
        Self {
            jobid,
            user: spec.user.clone(),
            run_as: spec.run_as.clone(),
            command: spec.command.clone(),
            target: spec.target.clone(),
            namespace: spec.namespace.clone(),
            timeout: spec.timeout,
            job_timeout: spec.job_timeout,
            concurrent: spec.concurrent,
            created_ts: Utc::now(),
        }
    }
}

/// Mutable job state stored at `/pogo/jobs/<jobid>/state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStateRecord {
    #[serde(flatten)]
    pub state: JobState,
    pub start_ts: Option<DateTime<Utc>>,
    /// 0 when every host finished; 1 otherwise. Set on terminal states.
    pub exit_status: Option<i32>,
}

impl JobStateRecord {
    pub fn gathering() -> Self {
        Self {
            state: JobState::Gathering,
            start_ts: None,
            exit_status: None,
        }
    }
}

/// Per-host record stored at `/pogo/jobs/<jobid>/hosts/<hostname>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRecord {
    pub jobid: JobId,
    pub hostname: String,
    #[serde(flatten)]
    pub state: HostState,
    /// Worker that handled the most recent attempt.
    pub worker: Option<String>,
    pub exit_code: Option<i32>,
    pub message: Option<String>,
    pub start_ts: Option<DateTime<Utc>>,
    pub end_ts: Option<DateTime<Utc>>,
}

impl HostRecord {
    pub fn new(jobid: JobId, hostname: impl Into<String>) -> Self {
        Self {
            jobid,
            hostname: hostname.into(),
            state: HostState::Waiting,
            worker: None,
            exit_code: None,
            message: None,
            start_ts: None,
            end_ts: None,
        }
    }

    /// Apply a state-machine transition, stamping timestamps.
    pub fn transition(&mut self, next: HostState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(PogoError::Internal(format!(
                "illegal host transition {} -> {} on {}",
                self.state, next, self.hostname
            )));
        }
        match next {
            HostState::Running => self.start_ts = Some(Utc::now()),
            s if s.is_terminal() => self.end_ts = Some(Utc::now()),
            _ => {}
        }
        self.state = next;
        Ok(())
    }

    /// Reset a failed/skipped/deadlocked host back to `waiting` for a retry.
    pub fn reset_for_retry(&mut self) -> Result<()> {
        if !self.state.is_terminal_failure() {
            return Err(PogoError::DispatchRejected(format!(
                "host {} is {} and cannot be retried",
                self.hostname, self.state
            )));
        }
        self.state = HostState::Waiting;
        self.worker = None;
        self.exit_code = None;
        self.message = None;
        self.start_ts = None;
        self.end_ts = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jobid_format_and_parse() {
        let id = JobId::from_seq(1);
        assert_eq!(id.as_str(), "p0000000001");
        assert_eq!(id.seq(), 1);
        assert_eq!(JobId::parse("p0000000042").unwrap().seq(), 42);
        assert!(JobId::parse("q0000000001").is_err());
        assert!(JobId::parse("p123").is_err());
        assert!(JobId::parse("p00000000ab").is_err());
    }

    #[test]
    fn host_transitions_follow_diagram() {
        let mut host = HostRecord::new(JobId::from_seq(1), "h1");
        host.transition(HostState::Ready).unwrap();
        host.transition(HostState::Running).unwrap();
        assert!(host.start_ts.is_some());
        host.transition(HostState::Finished).unwrap();
        assert!(host.end_ts.is_some());
        assert!(host.end_ts >= host.start_ts);

        // Terminal states are never left by a transition.
        assert!(host.transition(HostState::Running).is_err());
        assert!(host
            .transition(HostState::Failed {
                reason: FailReason::Timeout
            })
            .is_err());
    }

    #[test]
    fn waiting_can_deadlock_or_skip() {
        let mut host = HostRecord::new(JobId::from_seq(1), "h1");
        assert!(host.state.can_transition_to(HostState::Deadlocked));
        assert!(host.state.can_transition_to(HostState::Skipped));
        host.transition(HostState::Deadlocked).unwrap();
        assert!(host.state.is_terminal_failure());
    }

    #[test]
    fn retry_resets_failures_only() {
        let mut host = HostRecord::new(JobId::from_seq(1), "h1");
        host.transition(HostState::Ready).unwrap();
        host.transition(HostState::Running).unwrap();
        host.transition(HostState::Failed {
            reason: FailReason::Timeout,
        })
        .unwrap();

        host.reset_for_retry().unwrap();
        assert_eq!(host.state, HostState::Waiting);
        assert!(host.start_ts.is_none() && host.end_ts.is_none());

        let mut finished = HostRecord::new(JobId::from_seq(1), "h2");
        finished.transition(HostState::Ready).unwrap();
        finished.transition(HostState::Running).unwrap();
        finished.transition(HostState::Finished).unwrap();
        assert!(finished.reset_for_retry().is_err());
    }

    #[test]
    fn job_state_serde_shape() {
        let halted = JobState::Halted(HaltCause::Timeout);
        let json = serde_json::to_string(&halted).unwrap();
        assert_eq!(json, r#"{"state":"halted","cause":"timeout"}"#);
        let back: JobState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, halted);
    }

    #[test]
    fn spec_validation() {
        let spec = JobSpec {
            user: "test".into(),
            run_as: None,
            command: "echo hi".into(),
            target: "foo[1-2]".into(),
            namespace: "example".into(),
            timeout: 30,
            job_timeout: None,
            concurrent: Capacity::Count(1),
            password: None,
        };
        assert!(spec.validate().is_ok());

        let mut bad = spec.clone();
        bad.command = " ".into();
        assert!(bad.validate().is_err());

        let mut bad = spec;
        bad.concurrent = Capacity::Count(0);
        assert!(bad.validate().is_err());
    }
}

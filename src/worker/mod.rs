//! Worker connectivity: persistent mTLS sessions to the execution fleet.
//!
//! The dispatcher initiates one long-lived TLS session per worker and
//! multiplexes tasks over it as length-prefixed JSON frames:
//!
//! 1. [`session`] owns the framed stream and the HELLO handshake
//! 2. [`pool`] selects workers, tracks health and in-flight tasks, and
//!    routes results back to job controllers
//! 3. [`secrets`] holds job passwords for exactly-once delivery
//!
//! Execution mechanics on the worker side (process spawning, PTY handling)
//! are out of scope here; the worker is a protocol peer.

pub mod pool;
pub mod proto;
pub mod secrets;
pub mod session;

pub use pool::{DispatchTask, PoolStats, TaskOutcome, TaskResult, WorkerPool};
pub use proto::{ReqId, WireMessage};
pub use secrets::{Secret, SecretStore};

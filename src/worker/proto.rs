//! Dispatcher/worker wire protocol.
//!
//! JSON messages in length-prefixed frames (4-byte big-endian length) over
//! the mutually-authenticated TLS session. Request ids are allocated by the
//! dispatcher and increase monotonically per process.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::Result;
use crate::job::JobId;

/// Dispatcher-allocated request id, unique per dispatcher process.
pub type ReqId = u64;

/// Frames larger than this are a protocol violation.
const MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireMessage {
    /// Worker -> dispatcher, first message on a session.
    Hello {
        id: String,
        #[serde(default = "default_capacity")]
        capacity: u32,
        version: String,
        /// Set when reconnecting with intent to replay results for
        /// requests that were in flight when the previous session dropped.
        #[serde(default)]
        resume: bool,
    },
    /// Dispatcher -> worker: run a command on a host.
    Dispatch {
        req_id: ReqId,
        jobid: JobId,
        hostname: String,
        command: String,
        run_as: Option<String>,
        /// Per-host timeout, seconds.
        timeout: u64,
        /// Opaque one-shot reference redeemable via `FETCH_SECRET`.
        password_ref: Option<String>,
    },
    /// Worker -> dispatcher: task accepted.
    Ack { req_id: ReqId },
    /// Worker -> dispatcher: progress report.
    Update {
        req_id: ReqId,
        #[serde(default)]
        message: Option<String>,
        /// Where the worker is streaming output, if anywhere.
        #[serde(default)]
        output_url: Option<String>,
    },
    /// Worker -> dispatcher: final task outcome.
    Result {
        req_id: ReqId,
        exit_code: i32,
        #[serde(default)]
        message: Option<String>,
        duration_ms: u64,
        #[serde(default)]
        cancelled: bool,
    },
    /// Dispatcher -> worker: best-effort cancellation.
    Cancel { req_id: ReqId },
    Ping,
    Pong,
    /// Worker -> dispatcher: redeem a `password_ref`. Honored once.
    FetchSecret { req_id: ReqId },
    /// Dispatcher -> worker: the secret, or `None` if already consumed.
    Secret {
        req_id: ReqId,
        value: Option<String>,
    },
}

fn default_capacity() -> u32 {
    1
}

/// Wrap a stream in the length-prefixed framing used on worker sessions.
pub fn framed<S>(stream: S) -> Framed<S, LengthDelimitedCodec>
where
    S: AsyncRead + AsyncWrite,
{
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_BYTES)
        .length_field_type::<u32>()
        .new_framed(stream)
}

pub fn encode(msg: &WireMessage) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(msg)?))
}

pub fn decode(frame: &[u8]) -> Result<WireMessage> {
    Ok(serde_json::from_slice(frame)?)
}

//! Per-worker session tasks.
//!
//! A session task owns one framed stream to a worker: it performs the HELLO
//! handshake, pumps outbound messages from the pool, and forwards inbound
//! messages to the pool loop in arrival order, which preserves the
//! per-worker FIFO the result-routing relies on.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::pool::{PoolMessage, WorkerPool};
use super::proto::{decode, encode, framed, WireMessage};

/// How long to wait for the worker's HELLO before giving up on a session.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const DIAL_BACKOFF_MIN: Duration = Duration::from_secs(1);
const DIAL_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Drive one established worker session to completion.
///
/// Returns when the peer closes, a protocol violation occurs, or the pool
/// drops the worker's outbound channel.
pub async fn run_session<S>(stream: S, pool: &WorkerPool)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut frames = framed(stream);

    // Handshake: first frame must be HELLO.
    let hello = match tokio::time::timeout(HANDSHAKE_TIMEOUT, frames.next()).await {
        Ok(Some(Ok(frame))) => match decode(&frame) {
            Ok(WireMessage::Hello {
                id,
                capacity,
                version,
                resume,
            }) => (id, capacity, version, resume),
            Ok(other) => {
                tracing::warn!(message = ?other, "Expected HELLO as first frame");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Undecodable handshake frame");
                return;
            }
        },
        _ => {
            tracing::debug!("Worker session closed before HELLO");
            return;
        }
    };
    let (worker_id, capacity, version, resume) = hello;
    let conn = Uuid::new_v4();

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<WireMessage>(64);
    if pool
        .sender()
        .send(PoolMessage::SessionOpened {
            worker_id: worker_id.clone(),
            conn,
            capacity,
            version,
            resume,
            outbound: outbound_tx,
        })
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            outgoing = outbound_rx.recv() => {
                let Some(msg) = outgoing else {
                    // Pool dropped this worker.
                    break;
                };
                let frame = match encode(&msg) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::error!(worker_id, error = %e, "Failed to encode frame");
                        continue;
                    }
                };
                if let Err(e) = frames.send(frame).await {
                    tracing::warn!(worker_id, error = %e, "Worker session write failed");
                    break;
                }
            }
            incoming = frames.next() => {
                match incoming {
                    Some(Ok(frame)) => match decode(&frame) {
                        Ok(msg) => {
                            if pool
                                .sender()
                                .send(PoolMessage::FromWorker {
                                    worker_id: worker_id.clone(),
                                    msg,
                                })
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(worker_id, error = %e, "Undecodable frame, dropping session");
                            break;
                        }
                    },
                    Some(Err(e)) => {
                        tracing::warn!(worker_id, error = %e, "Worker session read failed");
                        break;
                    }
                    None => {
                        tracing::info!(worker_id, "Worker session closed");
                        break;
                    }
                }
            }
        }
    }

    let _ = pool
        .sender()
        .send(PoolMessage::SessionClosed {
            worker_id: worker_id.clone(),
            conn,
        })
        .await;
}

/// Spawn a session task for an already-established stream (tests, inbound
/// connections).
pub fn spawn_session<S>(stream: S, pool: WorkerPool) -> JoinHandle<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        run_session(stream, &pool).await;
    })
}

/// Maintain a dispatcher-initiated connection to one worker address:
/// dial, run the session, and redial with capped backoff until shutdown.
pub fn spawn_dialer(
    addr: String,
    tls: Option<crate::tls::TlsClient>,
    pool: WorkerPool,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = DIAL_BACKOFF_MIN;
        loop {
            if shutdown.is_cancelled() {
                return;
            }
            match tokio::net::TcpStream::connect(&addr).await {
                Ok(tcp) => {
                    backoff = DIAL_BACKOFF_MIN;
                    match &tls {
                        Some(client) => match client.connect(tcp).await {
                            Ok(stream) => {
                                tokio::select! {
                                    _ = run_session(stream, &pool) => {}
                                    _ = shutdown.cancelled() => return,
                                }
                            }
                            Err(e) => {
                                tracing::warn!(addr, error = %e, "TLS handshake with worker failed");
                            }
                        },
                        None => {
                            tokio::select! {
                                _ = run_session(tcp, &pool) => {}
                                _ = shutdown.cancelled() => return,
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(addr, error = %e, "Worker dial failed");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.cancelled() => return,
            }
            backoff = (backoff * 2).min(DIAL_BACKOFF_MAX);
        }
    })
}

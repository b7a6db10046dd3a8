//! Test harness: in-process dispatcher plus scripted fake workers speaking
//! the wire protocol over duplex streams.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use pogo::config::DispatcherConfig;
use pogo::dispatcher::Dispatcher;
use pogo::job::{JobId, JobSpec};
use pogo::namespace::Capacity;
use pogo::store::MemoryStore;
use pogo::worker::proto::{self, ReqId, WireMessage};
use pogo::worker::{session, WorkerPool};

pub struct TestContext {
    pub store: MemoryStore,
    pub dispatcher: Dispatcher,
    pub shutdown: CancellationToken,
}

/// Start a dispatcher on a fresh in-memory store.
pub async fn start_dispatcher(grace_secs: u64) -> TestContext {
    let store = MemoryStore::new();
    let session = Arc::new(store.session());
    let config = DispatcherConfig {
        grace_window_secs: grace_secs,
        ..DispatcherConfig::default()
    };
    let shutdown = CancellationToken::new();
    let dispatcher = Dispatcher::start(config, session, shutdown.clone())
        .await
        .expect("dispatcher start");
    TestContext {
        store,
        dispatcher,
        shutdown,
    }
}

/// A job spec with test defaults.
pub fn spec(command: &str, target: &str, namespace: &str) -> JobSpec {
    JobSpec {
        user: "test".to_string(),
        run_as: None,
        command: command.to_string(),
        target: target.to_string(),
        namespace: namespace.to_string(),
        timeout: 5,
        job_timeout: None,
        concurrent: Capacity::Count(1),
        password: None,
    }
}

pub const PLAIN_NS: &str = "hosts: {}\n";

/// Poll until `check` passes or the deadline hits.
pub async fn wait_until<F, Fut>(what: &str, timeout: Duration, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

pub async fn job_state(dispatcher: &Dispatcher, jobid: &JobId) -> String {
    dispatcher
        .jobinfo(jobid)
        .await
        .expect("jobinfo")
        .state
        .state
        .to_string()
}

pub async fn host_states(dispatcher: &Dispatcher, jobid: &JobId) -> HashMap<String, String> {
    let (_, hosts, _) = dispatcher
        .jobstatus(jobid, 0, 1000)
        .await
        .expect("jobstatus");
    hosts
        .into_iter()
        .map(|h| (h.hostname, h.state.to_string()))
        .collect()
}

/// What a fake worker does with a dispatch.
#[derive(Clone, Copy)]
pub enum Behavior {
    /// ACK, then report the exit code after the delay. A CANCEL that wins
    /// the race answers with a cancelled RESULT instead.
    Succeed { exit_code: i32, delay_ms: u64 },
    /// ACK and then never answer, not even cancellations.
    Silent,
}

pub struct FakeWorker {
    pub id: String,
    pub capacity: u32,
    pub behavior: Behavior,
    pub fetch_secrets: bool,
}

impl FakeWorker {
    pub fn quick(id: &str) -> Self {
        Self {
            id: id.to_string(),
            capacity: 1,
            behavior: Behavior::Succeed {
                exit_code: 0,
                delay_ms: 20,
            },
            fetch_secrets: false,
        }
    }
}

pub struct FakeWorkerHandle {
    /// Cancelling drops the session abruptly, as a crash would.
    pub stop: CancellationToken,
    /// Secrets received in response to FETCH_SECRET, in order.
    pub secrets: Arc<Mutex<Vec<Option<String>>>>,
    pub dispatches: Arc<AtomicUsize>,
}

/// Connect a scripted worker to the pool over an in-memory duplex stream.
pub fn spawn_fake_worker(pool: &WorkerPool, worker: FakeWorker) -> FakeWorkerHandle {
    let (dispatcher_side, worker_side) = tokio::io::duplex(64 * 1024);
    session::spawn_session(dispatcher_side, pool.clone());

    let stop = CancellationToken::new();
    let handle = FakeWorkerHandle {
        stop: stop.clone(),
        secrets: Arc::new(Mutex::new(Vec::new())),
        dispatches: Arc::new(AtomicUsize::new(0)),
    };
    let secrets = handle.secrets.clone();
    let dispatches = handle.dispatches.clone();

    tokio::spawn(async move {
        let mut frames = proto::framed(worker_side);
        let hello = WireMessage::Hello {
            id: worker.id.clone(),
            capacity: worker.capacity,
            version: "test".to_string(),
            resume: false,
        };
        if frames.send(proto::encode(&hello).unwrap()).await.is_err() {
            return;
        }

        let (out_tx, mut out_rx) = mpsc::channel::<WireMessage>(32);
        let mut cancels: HashMap<ReqId, CancellationToken> = HashMap::new();

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                Some(msg) = out_rx.recv() => {
                    if frames.send(proto::encode(&msg).unwrap()).await.is_err() {
                        break;
                    }
                }
                frame = frames.next() => {
                    let Some(Ok(frame)) = frame else { break };
                    match proto::decode(&frame).unwrap() {
                        WireMessage::Dispatch { req_id, password_ref, .. } => {
                            dispatches.fetch_add(1, Ordering::SeqCst);
                            let _ = frames
                                .send(proto::encode(&WireMessage::Ack { req_id }).unwrap())
                                .await;
                            if worker.fetch_secrets && password_ref.is_some() {
                                let _ = frames
                                    .send(proto::encode(&WireMessage::FetchSecret { req_id }).unwrap())
                                    .await;
                            }
                            if let Behavior::Succeed { exit_code, delay_ms } = worker.behavior {
                                let token = CancellationToken::new();
                                cancels.insert(req_id, token.clone());
                                let tx = out_tx.clone();
                                tokio::spawn(async move {
                                    tokio::select! {
                                        _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {
                                            let _ = tx.send(WireMessage::Result {
                                                req_id,
                                                exit_code,
                                                message: None,
                                                duration_ms: delay_ms,
                                                cancelled: false,
                                            }).await;
                                        }
                                        _ = token.cancelled() => {
                                            let _ = tx.send(WireMessage::Result {
                                                req_id,
                                                exit_code: -1,
                                                message: Some("killed".to_string()),
                                                duration_ms: 0,
                                                cancelled: true,
                                            }).await;
                                        }
                                    }
                                });
                            }
                        }
                        WireMessage::Cancel { req_id } => {
                            if let Some(token) = cancels.remove(&req_id) {
                                token.cancel();
                            }
                        }
                        WireMessage::Secret { value, .. } => {
                            secrets.lock().unwrap().push(value);
                        }
                        WireMessage::Ping => {
                            let _ = frames
                                .send(proto::encode(&WireMessage::Pong).unwrap())
                                .await;
                        }
                        _ => {}
                    }
                }
            }
        }
    });
    handle
}

/// Minimal HTTP/1.1 POST for exercising the real API server.
pub async fn http_post(addr: SocketAddr, path: &str, body: &str) -> (u16, String) {
    let mut stream = tokio::net::TcpStream::connect(addr).await.expect("connect");
    let request = format!(
        "POST {} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        path,
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).await.expect("write");
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await.expect("read");
    let text = String::from_utf8_lossy(&raw).to_string();
    let status: u16 = text
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .expect("status line");
    let body = text
        .split_once("\r\n\r\n")
        .map(|(_, b)| b.to_string())
        .unwrap_or_default();
    (status, body)
}

/// Grab an ephemeral port for a test server.
pub async fn free_addr() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    listener.local_addr().expect("local addr")
}

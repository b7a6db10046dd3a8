//! Job lifecycle tests: dispatch, timeouts, halts, retries, constraints,
//! and password handling, driven through a real dispatcher with scripted
//! workers.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::*;
use pogo::job::HaltCause;
use pogo::namespace::Capacity;

const SEQUENCED_NS: &str = r#"
hosts:
  db1: [db]
  web1: [web]
constraints:
  - applies_to: "%web"
    sequence_before: ["%db"]
"#;

#[tokio::test]
async fn sequential_job_runs_to_completion() {
    let ctx = start_dispatcher(30).await;
    ctx.dispatcher.loadconf("plain", PLAIN_NS).await.unwrap();
    let worker = spawn_fake_worker(ctx.dispatcher.pool(), {
        let mut w = FakeWorker::quick("w1");
        w.capacity = 4;
        w
    });

    let jobid = ctx
        .dispatcher
        .run_job(spec("echo hi", "node[1-3]", "plain"))
        .await
        .unwrap();

    wait_until("job to finish", Duration::from_secs(5), || async {
        job_state(&ctx.dispatcher, &jobid).await == "finished"
    })
    .await;

    let hosts = host_states(&ctx.dispatcher, &jobid).await;
    assert_eq!(hosts.len(), 3);
    assert!(hosts.values().all(|s| s == "finished"));
    assert_eq!(worker.dispatches.load(Ordering::SeqCst), 3);

    let info = ctx.dispatcher.jobinfo(&jobid).await.unwrap();
    assert_eq!(info.state.exit_status, Some(0));
    assert_eq!(info.host_counts.get("finished"), Some(&3));
}

#[tokio::test]
async fn failing_command_finishes_job_with_failure_status() {
    let ctx = start_dispatcher(30).await;
    ctx.dispatcher.loadconf("plain", PLAIN_NS).await.unwrap();
    spawn_fake_worker(
        ctx.dispatcher.pool(),
        FakeWorker {
            id: "w1".to_string(),
            capacity: 1,
            behavior: Behavior::Succeed {
                exit_code: 2,
                delay_ms: 10,
            },
            fetch_secrets: false,
        },
    );

    let jobid = ctx
        .dispatcher
        .run_job(spec("false", "solo1", "plain"))
        .await
        .unwrap();

    wait_until("job to finish", Duration::from_secs(5), || async {
        job_state(&ctx.dispatcher, &jobid).await == "finished"
    })
    .await;

    let hosts = host_states(&ctx.dispatcher, &jobid).await;
    assert_eq!(hosts.get("solo1").map(String::as_str), Some("failed"));
    let info = ctx.dispatcher.jobinfo(&jobid).await.unwrap();
    assert_eq!(info.state.exit_status, Some(1));
}

#[tokio::test]
async fn user_halt_cancels_running_and_fails_idle_hosts() {
    let ctx = start_dispatcher(30).await;
    ctx.dispatcher.loadconf("plain", PLAIN_NS).await.unwrap();
    spawn_fake_worker(
        ctx.dispatcher.pool(),
        FakeWorker {
            id: "w1".to_string(),
            capacity: 1,
            behavior: Behavior::Succeed {
                exit_code: 0,
                delay_ms: 30_000,
            },
            fetch_secrets: false,
        },
    );

    let jobid = ctx
        .dispatcher
        .run_job(spec("sleep 30", "node[1-3]", "plain"))
        .await
        .unwrap();

    wait_until("a host to run", Duration::from_secs(5), || async {
        host_states(&ctx.dispatcher, &jobid)
            .await
            .values()
            .any(|s| s == "running")
    })
    .await;

    ctx.dispatcher.halt(&jobid, HaltCause::UserHalt).await.unwrap();

    wait_until("all hosts terminal", Duration::from_secs(5), || async {
        let hosts = host_states(&ctx.dispatcher, &jobid).await;
        hosts.values().all(|s| s == "failed(cancelled)")
    })
    .await;
    assert_eq!(job_state(&ctx.dispatcher, &jobid).await, "halted(user_halt)");

    // A halted job never goes back to running.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(job_state(&ctx.dispatcher, &jobid).await, "halted(user_halt)");
}

#[tokio::test]
async fn per_host_timeout_fails_the_host() {
    let ctx = start_dispatcher(30).await;
    ctx.dispatcher.loadconf("plain", PLAIN_NS).await.unwrap();
    spawn_fake_worker(
        ctx.dispatcher.pool(),
        FakeWorker {
            id: "w1".to_string(),
            capacity: 1,
            behavior: Behavior::Silent,
            fetch_secrets: false,
        },
    );

    let mut job = spec("hang", "solo1", "plain");
    job.timeout = 1;
    let jobid = ctx.dispatcher.run_job(job).await.unwrap();

    wait_until("host to time out", Duration::from_secs(4), || async {
        host_states(&ctx.dispatcher, &jobid)
            .await
            .get("solo1")
            .map(String::as_str)
            == Some("failed(timeout)")
    })
    .await;
    assert_eq!(job_state(&ctx.dispatcher, &jobid).await, "finished");
}

#[tokio::test]
async fn worker_loss_fails_in_flight_after_grace() {
    let ctx = start_dispatcher(1).await;
    ctx.dispatcher.loadconf("plain", PLAIN_NS).await.unwrap();
    let worker = spawn_fake_worker(
        ctx.dispatcher.pool(),
        FakeWorker {
            id: "w1".to_string(),
            capacity: 1,
            behavior: Behavior::Succeed {
                exit_code: 0,
                delay_ms: 30_000,
            },
            fetch_secrets: false,
        },
    );

    let jobid = ctx
        .dispatcher
        .run_job(spec("sleep 30", "solo1", "plain"))
        .await
        .unwrap();

    wait_until("host to run", Duration::from_secs(5), || async {
        host_states(&ctx.dispatcher, &jobid)
            .await
            .get("solo1")
            .map(String::as_str)
            == Some("running")
    })
    .await;

    // Kill the session; the grace window is 1s.
    worker.stop.cancel();

    wait_until("worker loss", Duration::from_secs(5), || async {
        host_states(&ctx.dispatcher, &jobid)
            .await
            .get("solo1")
            .map(String::as_str)
            == Some("failed(worker_lost)")
    })
    .await;
    assert_eq!(job_state(&ctx.dispatcher, &jobid).await, "finished");
}

#[tokio::test]
async fn retry_reruns_failed_host_to_completion() {
    let ctx = start_dispatcher(30).await;
    ctx.dispatcher.loadconf("plain", PLAIN_NS).await.unwrap();
    // The only worker never answers, so the first host fails on its
    // per-host timeout while the second keeps the job running.
    spawn_fake_worker(
        ctx.dispatcher.pool(),
        FakeWorker {
            id: "w1".to_string(),
            capacity: 1,
            behavior: Behavior::Silent,
            fetch_secrets: false,
        },
    );

    let mut job = spec("flaky", "node[1-2]", "plain");
    job.timeout = 1;
    job.concurrent = Capacity::Count(2);
    let jobid = ctx.dispatcher.run_job(job).await.unwrap();

    wait_until("first attempt to fail", Duration::from_secs(4), || async {
        host_states(&ctx.dispatcher, &jobid)
            .await
            .get("node1")
            .map(String::as_str)
            == Some("failed(timeout)")
    })
    .await;
    assert_eq!(job_state(&ctx.dispatcher, &jobid).await, "running");

    // A healthy worker joins; the broken one is saturated with node2.
    spawn_fake_worker(ctx.dispatcher.pool(), FakeWorker::quick("w2"));
    tokio::time::sleep(Duration::from_millis(100)).await;

    ctx.dispatcher
        .retry(&jobid, vec!["node1".to_string()])
        .await
        .unwrap();

    wait_until("retry to finish", Duration::from_secs(5), || async {
        host_states(&ctx.dispatcher, &jobid)
            .await
            .get("node1")
            .map(String::as_str)
            == Some("finished")
    })
    .await;

    wait_until("job to finish", Duration::from_secs(5), || async {
        job_state(&ctx.dispatcher, &jobid).await == "finished"
    })
    .await;

    // A finished job refuses further retries.
    let err = ctx
        .dispatcher
        .retry(&jobid, vec!["node2".to_string()])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "DispatchRejected");
}

#[tokio::test]
async fn failed_predecessor_deadlocks_dependent_host() {
    let ctx = start_dispatcher(30).await;
    ctx.dispatcher.loadconf("seq", SEQUENCED_NS).await.unwrap();
    spawn_fake_worker(
        ctx.dispatcher.pool(),
        FakeWorker {
            id: "w1".to_string(),
            capacity: 2,
            behavior: Behavior::Succeed {
                exit_code: 1,
                delay_ms: 10,
            },
            fetch_secrets: false,
        },
    );

    let mut job = spec("deploy", "%db,%web", "seq");
    job.concurrent = Capacity::Count(2);
    let jobid = ctx.dispatcher.run_job(job).await.unwrap();

    wait_until("job to finish", Duration::from_secs(5), || async {
        job_state(&ctx.dispatcher, &jobid).await == "finished"
    })
    .await;

    let hosts = host_states(&ctx.dispatcher, &jobid).await;
    assert_eq!(hosts.get("db1").map(String::as_str), Some("failed"));
    assert_eq!(hosts.get("web1").map(String::as_str), Some("deadlocked"));
}

#[tokio::test]
async fn skip_policy_skips_dependent_host() {
    let ctx = start_dispatcher(30).await;
    let ns = format!("{}on_predecessor_failure: skip\n", SEQUENCED_NS);
    ctx.dispatcher.loadconf("seqskip", &ns).await.unwrap();
    spawn_fake_worker(
        ctx.dispatcher.pool(),
        FakeWorker {
            id: "w1".to_string(),
            capacity: 2,
            behavior: Behavior::Succeed {
                exit_code: 1,
                delay_ms: 10,
            },
            fetch_secrets: false,
        },
    );

    let mut job = spec("deploy", "%db,%web", "seqskip");
    job.concurrent = Capacity::Count(2);
    let jobid = ctx.dispatcher.run_job(job).await.unwrap();

    wait_until("job to finish", Duration::from_secs(5), || async {
        job_state(&ctx.dispatcher, &jobid).await == "finished"
    })
    .await;

    let hosts = host_states(&ctx.dispatcher, &jobid).await;
    assert_eq!(hosts.get("web1").map(String::as_str), Some("skipped"));
}

#[tokio::test]
async fn sequence_orders_dependent_after_predecessor() {
    let ctx = start_dispatcher(30).await;
    ctx.dispatcher.loadconf("seq", SEQUENCED_NS).await.unwrap();
    spawn_fake_worker(ctx.dispatcher.pool(), {
        let mut w = FakeWorker::quick("w1");
        w.capacity = 2;
        w
    });

    let mut job = spec("deploy", "%db,%web", "seq");
    job.concurrent = Capacity::Count(2);
    let jobid = ctx.dispatcher.run_job(job).await.unwrap();

    wait_until("job to finish", Duration::from_secs(5), || async {
        job_state(&ctx.dispatcher, &jobid).await == "finished"
    })
    .await;

    let (_, hosts, _) = ctx.dispatcher.jobstatus(&jobid, 0, 10).await.unwrap();
    let db = hosts.iter().find(|h| h.hostname == "db1").unwrap();
    let web = hosts.iter().find(|h| h.hostname == "web1").unwrap();
    assert!(db.end_ts.unwrap() <= web.start_ts.unwrap());
}

#[tokio::test]
async fn password_is_delivered_once_and_never_persisted() {
    let ctx = start_dispatcher(30).await;
    ctx.dispatcher.loadconf("plain", PLAIN_NS).await.unwrap();
    let worker = spawn_fake_worker(
        ctx.dispatcher.pool(),
        FakeWorker {
            id: "w1".to_string(),
            capacity: 2,
            behavior: Behavior::Succeed {
                exit_code: 0,
                delay_ms: 10,
            },
            fetch_secrets: true,
        },
    );

    let mut job = spec("sudo reboot", "node[1-2]", "plain");
    job.password = Some("hunter2".to_string());
    let jobid = ctx.dispatcher.run_job(job).await.unwrap();

    wait_until("job to finish", Duration::from_secs(5), || async {
        job_state(&ctx.dispatcher, &jobid).await == "finished"
    })
    .await;

    let secrets = worker.secrets.lock().unwrap().clone();
    assert_eq!(secrets.len(), 2);
    assert!(secrets.iter().all(|s| s.as_deref() == Some("hunter2")));

    // Nothing in the store ever contains the password bytes.
    for (path, data) in ctx.store.dump() {
        assert!(
            !data
                .windows("hunter2".len())
                .any(|w| w == "hunter2".as_bytes()),
            "password bytes leaked into {}",
            path
        );
    }
}

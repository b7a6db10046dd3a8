//! Coordination-store integration: sessions, watches, and the adapter's
//! typed views working together across dispatcher boundaries.

use std::sync::Arc;
use std::time::Duration;

use pogo::store::adapter::paths;
use pogo::store::{CreateFlags, MemoryStore, StoreAdapter, WatchKind};

fn adapter_for(store: &MemoryStore) -> StoreAdapter {
    StoreAdapter::new(Arc::new(store.session()))
}

#[tokio::test]
async fn jobid_allocation_is_monotonic_across_sessions() {
    let store = MemoryStore::new();
    let a = adapter_for(&store);
    let b = adapter_for(&store);
    a.bootstrap().await.unwrap();

    let mut last = 0u64;
    for i in 0..6 {
        let adapter = if i % 2 == 0 { &a } else { &b };
        let path = adapter
            .create(&paths::job_seq(), Vec::new(), CreateFlags::SEQUENTIAL)
            .await
            .unwrap();
        let seq: u64 = path.rsplit('/').next().unwrap()[1..].parse().unwrap();
        assert!(seq > last, "{} not after {}", seq, last);
        last = seq;
    }
}

#[tokio::test]
async fn duplicate_watch_rearms_collapse_onto_one_event() {
    let store = MemoryStore::new();
    let adapter = adapter_for(&store);
    adapter.bootstrap().await.unwrap();
    adapter.ensure_path("/pogo/ns/x/locks/db").await.unwrap();

    // Two interested parties, one underlying watch.
    let mut rx1 = adapter
        .watch("/pogo/ns/x/locks/db", WatchKind::Children)
        .await
        .unwrap();
    let mut rx2 = adapter
        .watch("/pogo/ns/x/locks/db", WatchKind::Children)
        .await
        .unwrap();

    adapter
        .create("/pogo/ns/x/locks/db/lock-", Vec::new(), CreateFlags::SEQUENTIAL)
        .await
        .unwrap();

    let e1 = tokio::time::timeout(Duration::from_secs(1), rx1.recv())
        .await
        .expect("first receiver")
        .unwrap();
    let e2 = tokio::time::timeout(Duration::from_secs(1), rx2.recv())
        .await
        .expect("second receiver")
        .unwrap();
    assert_eq!(e1.path, e2.path);

    // The watch was one-shot; rearming works after it fired.
    let mut rx3 = adapter
        .watch("/pogo/ns/x/locks/db", WatchKind::Children)
        .await
        .unwrap();
    adapter
        .create("/pogo/ns/x/locks/db/lock-", Vec::new(), CreateFlags::SEQUENTIAL)
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(1), rx3.recv())
        .await
        .expect("rearmed receiver")
        .unwrap();
}

#[tokio::test]
async fn ownership_and_locks_evaporate_with_the_owner_session() {
    let store = MemoryStore::new();

    let session_a = store.session();
    let adapter_a = StoreAdapter::new(Arc::new(session_a));
    adapter_a.bootstrap().await.unwrap();
    adapter_a.ensure_path("/pogo/jobs/p0000000001").await.unwrap();

    let jobid = pogo::job::JobId::from_seq(1);
    assert!(adapter_a.job(jobid.clone()).claim("d1").await.unwrap());
    adapter_a
        .namespace("x")
        .acquire_lock("db")
        .await
        .unwrap();

    let adapter_b = adapter_for(&store);
    assert!(!adapter_b.job(jobid.clone()).claim("d2").await.unwrap());
    assert_eq!(adapter_b.namespace("x").lock_count("db").await.unwrap(), 1);

    // Simulated crash of dispatcher A.
    drop(adapter_a);

    assert!(adapter_b.job(jobid.clone()).claim("d2").await.unwrap());
    assert_eq!(adapter_b.namespace("x").lock_count("db").await.unwrap(), 0);
}

#[tokio::test]
async fn cas_conflicts_are_recovered_by_rereading() {
    let store = MemoryStore::new();
    let a = adapter_for(&store);
    let b = adapter_for(&store);
    a.bootstrap().await.unwrap();
    a.create_json("/pogo/counter", &0u64, CreateFlags::NONE)
        .await
        .unwrap();

    // Interleaved updates from two sessions all land.
    for _ in 0..5 {
        a.update_json::<u64, _>("/pogo/counter", |v| {
            *v += 1;
            Ok(())
        })
        .await
        .unwrap();
        b.update_json::<u64, _>("/pogo/counter", |v| {
            *v += 1;
            Ok(())
        })
        .await
        .unwrap();
    }
    let (value, _) = a.get_json::<u64>("/pogo/counter").await.unwrap();
    assert_eq!(value, 10);
}

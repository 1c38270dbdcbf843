use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use await_election::record::{LeaseRecord, LockId};
use await_election::store::{CoordinationStore, MemoryStore, StoreError};

const CANDIDATES: usize = 8;

fn lock() -> LockId {
    LockId::new("default", "cas")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_admit_one_winner() {
    let store = Arc::new(MemoryStore::new());
    let mut tasks = Vec::new();
    for i in 0..CANDIDATES {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            let record = LeaseRecord::claimed(&format!("c{i}"), Duration::from_secs(15), Utc::now());
            store.create(&lock(), &record).await
        }));
    }

    let mut won = 0;
    for task in tasks {
        match task.await.expect("join") {
            Ok(_) => won += 1,
            Err(e) => assert_eq!(e, StoreError::Conflict),
        }
    }
    assert_eq!(won, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_updates_of_one_version_admit_one_winner() {
    let store = Arc::new(MemoryStore::new());
    let now = Utc::now();
    let initial = LeaseRecord::claimed("old", Duration::from_secs(15), now);
    store.create(&lock(), &initial).await.expect("create");
    let read = store.get(&lock()).await.expect("get").expect("present");

    let mut tasks = Vec::new();
    for i in 0..CANDIDATES {
        let store = store.clone();
        let read = read.clone();
        tasks.push(tokio::spawn(async move {
            let claim = read
                .value
                .taken_over_by(&format!("c{i}"), Duration::from_secs(15), Utc::now());
            store
                .update(&lock(), &claim, &read.version)
                .await
                .map(|version| (format!("c{i}"), version))
        }));
    }

    let mut winners = Vec::new();
    for task in tasks {
        match task.await.expect("join") {
            Ok(winner) => winners.push(winner),
            Err(e) => assert_eq!(e, StoreError::Conflict),
        }
    }
    assert_eq!(winners.len(), 1);

    let (identity, version) = &winners[0];
    let stored = store.snapshot(&lock()).expect("present");
    assert_eq!(&stored.value.holder_identity, identity);
    assert_eq!(&stored.version, version);
    assert_ne!(stored.version, read.version);
    assert_eq!(stored.value.leader_transitions, 1);
}

#[tokio::test]
async fn update_of_missing_record_is_not_found() {
    let store = MemoryStore::new();
    let record = LeaseRecord::claimed("a", Duration::from_secs(15), Utc::now());
    let version = store.create(&LockId::new("default", "other"), &record).await.expect("create");
    assert_eq!(
        store.update(&lock(), &record, &version).await,
        Err(StoreError::NotFound)
    );
}

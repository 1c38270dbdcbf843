use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Barrier};
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use await_election::clock::AnchoredClock;
use await_election::election::{ElectionState, LostReason};
use await_election::record::{LeaseRecord, LockId, Version};
use await_election::store::{CoordinationStore, MemoryStore, StoreError, Versioned};
use await_election::{ElectionConfig, ElectionEngine, LeadershipEvent};

fn lock() -> LockId {
    LockId::new("default", "handover")
}

fn engine(identity: &str, store: &Arc<MemoryStore>, clock: &AnchoredClock) -> ElectionEngine {
    ElectionEngine::new(identity, lock(), ElectionConfig::default(), store.clone())
        .expect("engine")
        .with_clock(clock.clone())
}

/// Everything received before `until`.
async fn drain(rx: &mut mpsc::Receiver<LeadershipEvent>, until: Instant) -> Vec<LeadershipEvent> {
    let mut events = Vec::new();
    while let Ok(Some(event)) = timeout_at(until, rx.recv()).await {
        events.push(event);
    }
    events
}

fn gained(events: &[LeadershipEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, LeadershipEvent::Gained(_)))
        .count()
}

fn observed(events: &[LeadershipEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            LeadershipEvent::NewLeaderObserved(id) => Some(id.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn racing_candidates_elect_exactly_one_leader() {
    let origin = Instant::now();
    let clock = AnchoredClock::new();
    let store = Arc::new(MemoryStore::new());
    let shutdown = CancellationToken::new();

    let (a_tx, mut a_rx) = mpsc::channel(16);
    let (b_tx, mut b_rx) = mpsc::channel(16);
    let a = tokio::spawn(engine("a", &store, &clock).run(a_tx, shutdown.clone()));
    let b = tokio::spawn(engine("b", &store, &clock).run(b_tx, shutdown.clone()));

    let until = origin + Duration::from_secs(30);
    let a_events = drain(&mut a_rx, until).await;
    let b_events = drain(&mut b_rx, until).await;

    assert_eq!(gained(&a_events) + gained(&b_events), 1);
    let (winner, loser_events) = if gained(&a_events) == 1 {
        ("a", &b_events)
    } else {
        ("b", &a_events)
    };
    assert_eq!(observed(loser_events), vec![winner.to_string()]);

    let held = store.snapshot(&lock()).expect("lease exists");
    assert_eq!(held.value.holder_identity, winner);
    assert_eq!(held.value.leader_transitions, 0);

    shutdown.cancel();
    a.await.expect("join a").expect("engine a");
    b.await.expect("join b").expect("engine b");
}

/// Holds each candidate after its first read of an absent lease until every
/// candidate has read it, so that all of them go on to create it.
struct CreateRace {
    store: Arc<MemoryStore>,
    barrier: Arc<Barrier>,
    armed: AtomicBool,
    conflicts: Arc<AtomicUsize>,
}

impl CreateRace {
    fn new(store: &Arc<MemoryStore>, barrier: &Arc<Barrier>, conflicts: &Arc<AtomicUsize>) -> Self {
        Self {
            store: store.clone(),
            barrier: barrier.clone(),
            armed: AtomicBool::new(true),
            conflicts: conflicts.clone(),
        }
    }
}

#[async_trait]
impl CoordinationStore for CreateRace {
    async fn get(&self, lock: &LockId) -> Result<Option<Versioned<LeaseRecord>>, StoreError> {
        let current = self.store.get(lock).await?;
        if current.is_none() && self.armed.swap(false, Ordering::SeqCst) {
            self.barrier.wait().await;
        }
        Ok(current)
    }

    async fn create(&self, lock: &LockId, record: &LeaseRecord) -> Result<Version, StoreError> {
        let created = self.store.create(lock, record).await;
        if created == Err(StoreError::Conflict) {
            self.conflicts.fetch_add(1, Ordering::SeqCst);
        }
        created
    }

    async fn update(
        &self,
        lock: &LockId,
        record: &LeaseRecord,
        expected: &Version,
    ) -> Result<Version, StoreError> {
        self.store.update(lock, record, expected).await
    }
}

#[tokio::test(start_paused = true)]
async fn simultaneous_create_leaves_loser_following() {
    let origin = Instant::now();
    let clock = AnchoredClock::new();
    let store = Arc::new(MemoryStore::new());
    let barrier = Arc::new(Barrier::new(2));
    let conflicts = Arc::new(AtomicUsize::new(0));
    let shutdown = CancellationToken::new();

    let candidate = |identity: &str| {
        let racing = Arc::new(CreateRace::new(&store, &barrier, &conflicts));
        ElectionEngine::new(identity, lock(), ElectionConfig::default(), racing)
            .expect("engine")
            .with_clock(clock.clone())
    };
    let a_engine = candidate("a");
    let b_engine = candidate("b");
    let a_status = a_engine.subscribe();
    let b_status = b_engine.subscribe();

    let (a_tx, mut a_rx) = mpsc::channel(16);
    let (b_tx, mut b_rx) = mpsc::channel(16);
    let a = tokio::spawn(a_engine.run(a_tx, shutdown.clone()));
    let b = tokio::spawn(b_engine.run(b_tx, shutdown.clone()));

    let until = origin + Duration::from_secs(30);
    let a_events = drain(&mut a_rx, until).await;
    let b_events = drain(&mut b_rx, until).await;

    // Both reached create; the store let exactly one through.
    assert_eq!(conflicts.load(Ordering::SeqCst), 1);
    assert_eq!(gained(&a_events) + gained(&b_events), 1);

    let (winner, loser_events, loser_status) = if gained(&a_events) == 1 {
        ("a", &b_events, &b_status)
    } else {
        ("b", &a_events, &a_status)
    };
    assert_eq!(loser_events.len(), 1);
    assert_eq!(observed(loser_events), vec![winner.to_string()]);
    assert_eq!(loser_status.borrow().state, ElectionState::Follower);
    assert_eq!(loser_status.borrow().observed_leader.as_deref(), Some(winner));

    let held = store.snapshot(&lock()).expect("lease exists");
    assert_eq!(held.value.holder_identity, winner);
    assert_eq!(held.value.leader_transitions, 0);

    shutdown.cancel();
    a.await.expect("join a").expect("engine a");
    b.await.expect("join b").expect("engine b");
}

#[tokio::test(start_paused = true)]
async fn released_lease_is_taken_without_waiting_for_expiry() {
    let clock = AnchoredClock::new();
    let store = Arc::new(MemoryStore::new());

    let a_shutdown = CancellationToken::new();
    let (a_tx, mut a_rx) = mpsc::channel(16);
    let a = engine("a", &store, &clock);
    let a_status = a.subscribe();
    let a_task = tokio::spawn(a.run(a_tx, a_shutdown.clone()));

    let leadership = match a_rx.recv().await {
        Some(LeadershipEvent::Gained(leadership)) => leadership,
        other => panic!("expected Gained, got {other:?}"),
    };
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!leadership.is_lost());

    a_shutdown.cancel();
    a_task.await.expect("join a").expect("engine a");
    assert!(leadership.is_lost());
    assert!(matches!(
        a_rx.recv().await,
        Some(LeadershipEvent::Lost(LostReason::Released))
    ));
    assert_eq!(a_status.borrow().state, ElectionState::ShuttingDown);

    let released = store.snapshot(&lock()).expect("lease exists");
    assert!(released.value.is_released());
    assert_eq!(released.value.lease_duration_seconds, 1);

    let b_start = Instant::now();
    let b_shutdown = CancellationToken::new();
    let (b_tx, mut b_rx) = mpsc::channel(16);
    let b_task = tokio::spawn(engine("b", &store, &clock).run(b_tx, b_shutdown.clone()));

    assert!(matches!(b_rx.recv().await, Some(LeadershipEvent::Gained(_))));
    assert!(b_start.elapsed() < ElectionConfig::default().retry_period);

    let held = store.snapshot(&lock()).expect("lease exists");
    assert_eq!(held.value.holder_identity, "b");
    assert_eq!(held.value.leader_transitions, 1);

    b_shutdown.cancel();
    b_task.await.expect("join b").expect("engine b");
}

#[tokio::test(start_paused = true)]
async fn shutdown_without_release_keeps_the_holder() {
    let store = Arc::new(MemoryStore::new());
    let config = ElectionConfig {
        release_on_cancel: false,
        ..ElectionConfig::default()
    };
    let shutdown = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(16);
    let a = ElectionEngine::new("a", lock(), config, store.clone())
        .expect("engine")
        .with_clock(AnchoredClock::new());
    let task = tokio::spawn(a.run(tx, shutdown.clone()));

    assert!(matches!(rx.recv().await, Some(LeadershipEvent::Gained(_))));
    shutdown.cancel();
    task.await.expect("join").expect("engine");
    assert!(matches!(
        rx.recv().await,
        Some(LeadershipEvent::Lost(LostReason::Released))
    ));

    let held = store.snapshot(&lock()).expect("lease exists");
    assert_eq!(held.value.holder_identity, "a");
}

#[tokio::test(start_paused = true)]
async fn leader_without_store_demotes_itself_once() {
    let origin = Instant::now();
    let store = Arc::new(MemoryStore::new());
    let shutdown = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(16);
    let a = ElectionEngine::new("a", lock(), ElectionConfig::default(), store.clone())
        .expect("engine")
        .with_clock(AnchoredClock::new());
    let status = a.subscribe();
    let task = tokio::spawn(a.run(tx, shutdown.clone()));

    let leadership = match rx.recv().await {
        Some(LeadershipEvent::Gained(leadership)) => leadership,
        other => panic!("expected Gained, got {other:?}"),
    };
    store.set_available(false);

    let events = drain(&mut rx, origin + Duration::from_secs(60)).await;
    assert_eq!(events.len(), 1);
    assert!(matches!(
        events[0],
        LeadershipEvent::Lost(LostReason::RenewDeadlineExceeded)
    ));
    assert!(leadership.is_lost());
    assert_eq!(status.borrow().state, ElectionState::Follower);
    assert!(status.borrow().last_renewal.is_none());

    shutdown.cancel();
    task.await.expect("join").expect("engine");
}

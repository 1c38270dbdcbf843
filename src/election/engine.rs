use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, timeout_at, Instant};
use tokio_util::sync::CancellationToken;

use super::{ElectionConfig, ElectionState, ElectionStatus, Leadership, LeadershipEvent, LostReason};
use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, ElectionError, StoreError};
use crate::record::{LeaseRecord, LockId};
use crate::store::{CoordinationStore, Versioned};

/// Result of one successful store round.
#[derive(Debug, PartialEq, Eq)]
enum Attempt {
    Acquired,
    Renewed,
    HeldByOther,
}

/// Acquires, renews and releases one lease on behalf of one identity.
pub struct ElectionEngine {
    identity: String,
    lock: LockId,
    config: ElectionConfig,
    store: Arc<dyn CoordinationStore>,
    clock: Arc<dyn Clock>,
    status: watch::Sender<ElectionStatus>,
    /// What we last wrote while leading, with the version the store returned.
    held: Option<Versioned<LeaseRecord>>,
    observed_leader: Option<String>,
    reported_leader: Option<String>,
    leadership: Option<CancellationToken>,
}

impl ElectionEngine {
    pub fn new(
        identity: impl Into<String>,
        lock: LockId,
        config: ElectionConfig,
        store: Arc<dyn CoordinationStore>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let identity = identity.into();
        if identity.is_empty() {
            return Err(ConfigError::Invalid {
                key: "identity",
                reason: "must not be empty".into(),
            });
        }
        let (status, _) = watch::channel(ElectionStatus::default());
        Ok(Self {
            identity,
            lock,
            config,
            store,
            clock: Arc::new(SystemClock),
            status,
            held: None,
            observed_leader: None,
            reported_leader: None,
            leadership: None,
        })
    }

    /// Replace the wall clock used for lease timestamps.
    pub fn with_clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn config(&self) -> &ElectionConfig {
        &self.config
    }

    /// Watch the engine's status. Stays readable after the engine exits.
    pub fn subscribe(&self) -> watch::Receiver<ElectionStatus> {
        self.status.subscribe()
    }

    /// Run until `shutdown` is cancelled or the store fails permanently.
    ///
    /// On shutdown while leading, the leadership scope is cancelled, the lease
    /// is released (unless disabled) and a final `Lost(Released)` is sent.
    pub async fn run(
        mut self,
        events: mpsc::Sender<LeadershipEvent>,
        shutdown: CancellationToken,
    ) -> Result<(), ElectionError> {
        info!(
            "starting leader election for lock '{}' as '{}'",
            self.lock, self.identity
        );
        let result = self.run_loop(&events, &shutdown).await;

        match &result {
            Ok(()) => {
                let was_leading = self.is_leading();
                self.end_term();
                self.set_state(ElectionState::ShuttingDown);
                if was_leading {
                    if self.config.release_on_cancel {
                        self.release().await;
                    }
                    // The consumer may already be gone during shutdown.
                    let _ = events.send(LeadershipEvent::Lost(LostReason::Released)).await;
                }
            }
            Err(e) => {
                error!("leader election for '{}' failed: {}", self.lock, e);
                if self.is_leading() {
                    self.end_term();
                    self.set_state(ElectionState::Follower);
                    let _ = events
                        .send(LeadershipEvent::Lost(LostReason::StoreFailure))
                        .await;
                }
            }
        }
        result
    }

    async fn run_loop(
        &mut self,
        events: &mpsc::Sender<LeadershipEvent>,
        shutdown: &CancellationToken,
    ) -> Result<(), ElectionError> {
        loop {
            let cycle_start = Instant::now();
            let attempt_deadline = self.attempt_deadline(cycle_start);

            let outcome = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                res = timeout_at(attempt_deadline, self.try_acquire_or_renew()) => match res {
                    Ok(outcome) => outcome,
                    Err(_) => Err(StoreError::Unavailable("store round-trip timed out".into())),
                },
            };

            if self.state() == ElectionState::Campaigning {
                self.set_state(ElectionState::Follower);
            }

            match outcome {
                Ok(Attempt::Acquired) => self.begin_term(events, shutdown).await?,
                Ok(Attempt::Renewed) => {
                    debug!("renewed lease '{}'", self.lock);
                    self.mark_renewed();
                }
                Ok(Attempt::HeldByOther) => {}
                Err(StoreError::Conflict) => {
                    debug!("lost a write race on lease '{}'", self.lock);
                }
                Err(e) if e.is_transient() => {
                    if self.is_leading() {
                        warn!("failed to renew lease '{}': {}", self.lock, e);
                    } else {
                        debug!("failed to read or claim lease '{}': {}", self.lock, e);
                    }
                }
                Err(e) => return Err(e.into()),
            }

            self.report_leader(events).await?;

            if self.is_leading() && Instant::now() >= self.renew_deadline_at() {
                self.demote(events).await?;
            }

            let mut next = cycle_start + self.config.retry_period;
            if self.is_leading() {
                next = next.min(self.renew_deadline_at());
            }
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = sleep_until(next) => {}
            }
        }
    }

    /// One observe/decide/write round.
    async fn try_acquire_or_renew(&mut self) -> Result<Attempt, StoreError> {
        let now = self.clock.now();
        let leading = self.is_leading();

        let Some(current) = self.store.get(&self.lock).await? else {
            if !leading {
                self.set_state(ElectionState::Campaigning);
            }
            let record = LeaseRecord::claimed(&self.identity, self.config.lease_duration, now);
            let version = self.store.create(&self.lock, &record).await?;
            self.observed_leader = Some(self.identity.clone());
            self.held = Some(Versioned { value: record, version });
            return Ok(if leading { Attempt::Renewed } else { Attempt::Acquired });
        };

        let holder = current.value.holder_identity.clone();
        self.observed_leader = (!holder.is_empty()).then_some(holder);

        if !current
            .value
            .can_be_claimed_by(&self.identity, now, self.config.lease_duration)
        {
            return Ok(Attempt::HeldByOther);
        }

        let record = if leading && current.value.is_held_by(&self.identity) {
            current.value.renewed(self.config.lease_duration, now)
        } else {
            if !leading {
                self.set_state(ElectionState::Campaigning);
            }
            current
                .value
                .taken_over_by(&self.identity, self.config.lease_duration, now)
        };
        let version = self.store.update(&self.lock, &record, &current.version).await?;
        self.observed_leader = Some(self.identity.clone());
        self.held = Some(Versioned { value: record, version });
        Ok(if leading { Attempt::Renewed } else { Attempt::Acquired })
    }

    async fn begin_term(
        &mut self,
        events: &mpsc::Sender<LeadershipEvent>,
        shutdown: &CancellationToken,
    ) -> Result<(), ElectionError> {
        let token = shutdown.child_token();
        self.leadership = Some(token.clone());
        self.status.send_modify(|status| {
            status.state = ElectionState::Leading;
            status.last_renewal = Some(Instant::now());
        });
        info!("successfully acquired lease '{}'", self.lock);
        self.send(events, LeadershipEvent::Gained(Leadership::new(token)))
            .await
    }

    /// Give up leadership without confirming anyone else holds it.
    async fn demote(&mut self, events: &mpsc::Sender<LeadershipEvent>) -> Result<(), ElectionError> {
        warn!(
            "failed to renew lease '{}' within {:?}, stepping down",
            self.lock, self.config.renew_deadline
        );
        self.end_term();
        self.set_state(ElectionState::Follower);
        self.send(events, LeadershipEvent::Lost(LostReason::RenewDeadlineExceeded))
            .await
    }

    /// Cancel the current leadership scope, if any.
    fn end_term(&mut self) {
        if let Some(token) = self.leadership.take() {
            token.cancel();
        }
        self.status.send_modify(|status| status.last_renewal = None);
    }

    async fn release(&mut self) {
        let Some(held) = self.held.take() else {
            return;
        };
        if !held.value.is_held_by(&self.identity) {
            return;
        }
        let record = held.value.released(self.clock.now());
        let deadline = Instant::now() + self.config.renew_deadline;
        match timeout_at(deadline, self.store.update(&self.lock, &record, &held.version)).await {
            Ok(Ok(_)) => info!("released lease '{}'", self.lock),
            Ok(Err(e)) => warn!("failed to release lease '{}': {}", self.lock, e),
            Err(_) => warn!("timed out releasing lease '{}'", self.lock),
        }
    }

    async fn report_leader(&mut self, events: &mpsc::Sender<LeadershipEvent>) -> Result<(), ElectionError> {
        if self.observed_leader == self.reported_leader {
            return Ok(());
        }
        self.reported_leader = self.observed_leader.clone();
        let observed = self.observed_leader.clone();
        self.status
            .send_modify(|status| status.observed_leader = observed.clone());
        match observed {
            Some(leader) if leader != self.identity => {
                info!("long live our new leader: '{}'!", leader);
                self.send(events, LeadershipEvent::NewLeaderObserved(leader))
                    .await
            }
            _ => Ok(()),
        }
    }

    async fn send(
        &self,
        events: &mpsc::Sender<LeadershipEvent>,
        event: LeadershipEvent,
    ) -> Result<(), ElectionError> {
        events
            .send(event)
            .await
            .map_err(|_| ElectionError::EventsClosed)
    }

    fn attempt_deadline(&self, cycle_start: Instant) -> Instant {
        if self.is_leading() {
            self.renew_deadline_at()
        } else {
            cycle_start + self.config.renew_deadline
        }
    }

    fn renew_deadline_at(&self) -> Instant {
        let last = self.status.borrow().last_renewal.unwrap_or_else(Instant::now);
        last + self.config.renew_deadline
    }

    fn mark_renewed(&self) {
        self.status
            .send_modify(|status| status.last_renewal = Some(Instant::now()));
    }

    fn state(&self) -> ElectionState {
        self.status.borrow().state
    }

    fn is_leading(&self) -> bool {
        self.state() == ElectionState::Leading
    }

    fn set_state(&self, state: ElectionState) {
        self.status.send_if_modified(|status| {
            if status.state == state {
                return false;
            }
            status.state = state;
            true
        });
    }
}

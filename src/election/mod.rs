//! Lease-based leader election.
//!
//! [`ElectionEngine`] runs the observe/decide/renew loop against a
//! [`CoordinationStore`](crate::store::CoordinationStore) and reports
//! leadership changes as a stream of [`LeadershipEvent`]s. Its current
//! [`ElectionStatus`] is published through a `watch` channel so that other
//! tasks (the health server) can take snapshots without touching the loop.

pub mod engine;

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ConfigError;
pub use engine::ElectionEngine;

pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(15);
pub const DEFAULT_RENEW_DEADLINE: Duration = Duration::from_secs(10);
pub const DEFAULT_RETRY_PERIOD: Duration = Duration::from_secs(2);

/// Timing of the election loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionConfig {
    /// How long a lease stays valid without renewal.
    pub lease_duration: Duration,
    /// How long a leader keeps trying to renew before it demotes itself.
    pub renew_deadline: Duration,
    /// Pause between loop iterations.
    pub retry_period: Duration,
    /// Clear the holder on shutdown so the next candidate need not wait out the lease.
    pub release_on_cancel: bool,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            lease_duration: DEFAULT_LEASE_DURATION,
            renew_deadline: DEFAULT_RENEW_DEADLINE,
            retry_period: DEFAULT_RETRY_PERIOD,
            release_on_cancel: true,
        }
    }
}

impl ElectionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lease_duration.as_secs() == 0 {
            return Err(invalid("lease_duration", "must be at least one second"));
        }
        if self.retry_period.is_zero() {
            return Err(invalid("retry_period", "must be positive"));
        }
        if self.renew_deadline >= self.lease_duration {
            return Err(invalid(
                "renew_deadline",
                "must be shorter than the lease duration",
            ));
        }
        if self.retry_period >= self.renew_deadline {
            return Err(invalid(
                "retry_period",
                "must be shorter than the renew deadline",
            ));
        }
        Ok(())
    }
}

fn invalid(key: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.to_string(),
    }
}

/// Local view of this candidate. Not persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    Follower,
    /// A claim write is in flight.
    Campaigning,
    Leading,
    ShuttingDown,
}

impl fmt::Display for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElectionState::Follower => "follower",
            ElectionState::Campaigning => "campaigning",
            ElectionState::Leading => "leading",
            ElectionState::ShuttingDown => "shutting down",
        };
        f.write_str(name)
    }
}

/// Snapshot shared with readers outside the engine loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionStatus {
    pub state: ElectionState,
    /// Monotonic time of the last successful acquire or renew while leading.
    pub last_renewal: Option<Instant>,
    /// Last holder seen in the store.
    pub observed_leader: Option<String>,
}

impl Default for ElectionStatus {
    fn default() -> Self {
        Self {
            state: ElectionState::Follower,
            last_renewal: None,
            observed_leader: None,
        }
    }
}

/// Answer of the status surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthReport {
    Ok,
    Stale,
}

impl ElectionStatus {
    pub fn is_leading(&self) -> bool {
        self.state == ElectionState::Leading
    }

    /// A leader is healthy while its last renewal is within `renew_deadline`.
    /// Candidates that do not lead have nothing to go stale.
    pub fn health(&self, renew_deadline: Duration, now: Instant) -> HealthReport {
        if !self.is_leading() {
            return HealthReport::Ok;
        }
        match self.last_renewal {
            Some(renewed) if now.saturating_duration_since(renewed) <= renew_deadline => {
                HealthReport::Ok
            }
            _ => HealthReport::Stale,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LostReason {
    /// No successful renewal within the renew deadline.
    RenewDeadlineExceeded,
    /// Leadership was given up on shutdown.
    Released,
    /// The store refused to serve us any longer.
    StoreFailure,
}

impl fmt::Display for LostReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            LostReason::RenewDeadlineExceeded => "renew deadline exceeded",
            LostReason::Released => "released on shutdown",
            LostReason::StoreFailure => "coordination store failure",
        };
        f.write_str(reason)
    }
}

/// One leadership term. The token is cancelled by the engine before it
/// reports the term as lost.
#[derive(Debug, Clone)]
pub struct Leadership {
    token: CancellationToken,
}

impl Leadership {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// A scope that ends with this leadership term.
    pub fn scope(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn is_lost(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Debug, Clone)]
pub enum LeadershipEvent {
    Gained(Leadership),
    Lost(LostReason),
    NewLeaderObserved(String),
}

use chrono::{DateTime, Utc};

/// A source of wall-clock timestamps for lease records.
///
/// Lease records carry absolute timestamps that other replicas compare against
/// their own clocks, so the engine never reads the time directly.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// A clock that uses the system wall clock.
///
/// This is the default implementation. It follows NTP adjustments, including
/// backward steps.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock anchored to the wall clock once and advanced by the tokio
/// monotonic clock afterwards.
///
/// It never jumps backwards, and under a paused tokio runtime it advances
/// together with `tokio::time`, which keeps lease expiry consistent with
/// local deadlines.
#[derive(Debug, Clone)]
pub struct AnchoredClock {
    start_wall: DateTime<Utc>,
    start_instant: tokio::time::Instant,
}

impl Default for AnchoredClock {
    fn default() -> Self {
        Self {
            start_wall: Utc::now(),
            start_instant: tokio::time::Instant::now(),
        }
    }
}

impl AnchoredClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for AnchoredClock {
    fn now(&self) -> DateTime<Utc> {
        let delta = self.start_instant.elapsed();
        let delta = chrono::Duration::from_std(delta).unwrap_or(chrono::Duration::MAX);
        self.start_wall
            .checked_add_signed(delta)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

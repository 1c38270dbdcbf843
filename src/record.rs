//! The lease record shared by all candidates.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Identifies one lease object in the coordination store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockId {
    pub namespace: String,
    pub name: String,
}

impl LockId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Opaque version token handed out by the store. Writes must present the
/// version they were based on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version(pub String);

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Contents of the coordination lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    /// Current or last holder. Empty when released.
    pub holder_identity: String,
    pub lease_duration_seconds: u32,
    pub acquire_time: DateTime<Utc>,
    pub renew_time: DateTime<Utc>,
    pub leader_transitions: u32,
}

impl LeaseRecord {
    /// A fresh record claimed by `identity` at `now`.
    pub fn claimed(identity: &str, lease_duration: Duration, now: DateTime<Utc>) -> Self {
        Self {
            holder_identity: identity.to_string(),
            lease_duration_seconds: whole_seconds(lease_duration),
            acquire_time: now,
            renew_time: now,
            leader_transitions: 0,
        }
    }

    pub fn is_released(&self) -> bool {
        self.holder_identity.is_empty()
    }

    pub fn is_held_by(&self, identity: &str) -> bool {
        !self.is_released() && self.holder_identity == identity
    }

    /// Whether the holder failed to renew within its lease duration.
    ///
    /// `fallback` is used when the record carries no duration.
    pub fn is_expired(&self, now: DateTime<Utc>, fallback: Duration) -> bool {
        let seconds = if self.lease_duration_seconds > 0 {
            i64::from(self.lease_duration_seconds)
        } else {
            i64::from(whole_seconds(fallback))
        };
        now - self.renew_time > chrono::Duration::seconds(seconds)
    }

    /// Whether `identity` may write this record: it is released, already ours,
    /// or its holder let it expire.
    pub fn can_be_claimed_by(&self, identity: &str, now: DateTime<Utc>, fallback: Duration) -> bool {
        self.is_released() || self.is_held_by(identity) || self.is_expired(now, fallback)
    }

    /// The record `identity` writes to take over from the current contents.
    pub fn taken_over_by(&self, identity: &str, lease_duration: Duration, now: DateTime<Utc>) -> Self {
        let mut next = Self::claimed(identity, lease_duration, now);
        if self.holder_identity == identity {
            next.acquire_time = self.acquire_time;
            next.leader_transitions = self.leader_transitions;
        } else {
            next.leader_transitions = self.leader_transitions.saturating_add(1);
        }
        next
    }

    /// The record the holder writes to renew its claim.
    pub fn renewed(&self, lease_duration: Duration, now: DateTime<Utc>) -> Self {
        Self {
            lease_duration_seconds: whole_seconds(lease_duration),
            renew_time: now,
            ..self.clone()
        }
    }

    /// The record the holder writes when stepping down voluntarily. The short
    /// duration lets the next candidate take over immediately.
    pub fn released(&self, now: DateTime<Utc>) -> Self {
        Self {
            holder_identity: String::new(),
            lease_duration_seconds: 1,
            acquire_time: now,
            renew_time: now,
            leader_transitions: self.leader_transitions,
        }
    }
}

fn whole_seconds(duration: Duration) -> u32 {
    u32::try_from(duration.as_secs()).unwrap_or(u32::MAX).max(1)
}

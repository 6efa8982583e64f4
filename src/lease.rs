//! Time-bounded claims over a resource.
//!
//! A lease is optimistic: nothing prevents a second worker from reading a
//! leased resource, but anyone can tell whether the claim is still live by
//! comparing its age against its TTL. Crashed holders are reclaimed through
//! expiry, never through a heartbeat.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub renewed_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl Lease {
    /// Take a fresh lease at `now`.
    pub fn acquire(holder: impl Into<String>, ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            holder: holder.into(),
            acquired_at: now,
            renewed_at: now,
            ttl_secs: ttl.as_secs(),
        }
    }

    /// Extend the lease from `now`.
    pub fn renew(&mut self, now: DateTime<Utc>) {
        self.renewed_at = now;
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Time since the last acquisition or renewal.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now.signed_duration_since(self.renewed_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.age(now) > self.ttl()
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        self.ttl().saturating_sub(self.age(now))
    }

    /// Whether `holder` may take this resource at `now`.
    pub fn can_be_taken_by(&self, holder: &str, now: DateTime<Utc>) -> bool {
        self.holder == holder || self.is_expired(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_lease_is_live() {
        let now = Utc::now();
        let lease = Lease::acquire("worker-1", Duration::from_secs(900), now);
        assert!(!lease.is_expired(now));
        assert!(!lease.can_be_taken_by("worker-2", now));
        assert!(lease.can_be_taken_by("worker-1", now));
    }

    #[test]
    fn lease_expires_after_ttl() {
        let start = Utc::now();
        let lease = Lease::acquire("worker-1", Duration::from_secs(900), start);
        let later = start + chrono::Duration::minutes(16);
        assert!(lease.is_expired(later));
        assert!(lease.can_be_taken_by("worker-2", later));
        assert_eq!(lease.remaining(later), Duration::ZERO);
    }

    #[test]
    fn renew_resets_age() {
        let start = Utc::now();
        let mut lease = Lease::acquire("w", Duration::from_secs(60), start);
        let later = start + chrono::Duration::seconds(50);
        lease.renew(later);
        assert!(!lease.is_expired(later + chrono::Duration::seconds(30)));
        assert_eq!(lease.acquired_at, start);
    }

    #[test]
    fn clock_skew_counts_as_zero_age() {
        let now = Utc::now();
        let lease = Lease::acquire("w", Duration::from_secs(60), now + chrono::Duration::seconds(30));
        assert_eq!(lease.age(now), Duration::ZERO);
    }
}

//! Per-client rate limiting for the admin surface.
//!
//! Two independent trackers keyed by client IP: an auth-failure counter
//! that escalates to a timed lockout, and a sliding-window request budget.
//! Both are consulted before credentials are even looked at, so a locked-out
//! client cannot keep guessing. Decisions land on the `audit` log target.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::config::Config;

/// Auth failure tracking for one client.
#[derive(Debug)]
struct AuthState {
    attempts: u32,
    last_attempt: Instant,
    locked_until: Option<Instant>,
}

/// Sliding window of admin request timestamps for one client.
#[derive(Debug)]
struct RequestWindow {
    timestamps: Vec<Instant>,
    last_seen: Instant,
}

pub struct RateLimiter {
    max_auth_attempts: u32,
    auth_window: Duration,
    lockout: Duration,
    max_requests: u32,
    request_window: Duration,
    auth: DashMap<IpAddr, AuthState>,
    requests: DashMap<IpAddr, RequestWindow>,
}

impl RateLimiter {
    pub fn new(config: &Config) -> Self {
        Self {
            max_auth_attempts: config.max_auth_attempts,
            auth_window: config.auth_window(),
            lockout: config.lockout(),
            max_requests: config.max_requests_per_window,
            request_window: config.request_window(),
            auth: DashMap::new(),
            requests: DashMap::new(),
        }
    }

    /// Remaining lockout for this client, if one is active.
    pub fn check_lockout(&self, client: IpAddr) -> Option<Duration> {
        let entry = self.auth.get(&client)?;
        let locked_until = entry.locked_until?;
        let now = Instant::now();
        if locked_until > now {
            let remaining = locked_until - now;
            warn!(
                target: "audit",
                client = %client,
                remaining_secs = remaining.as_secs(),
                "Rejected request from locked-out client"
            );
            Some(remaining)
        } else {
            None
        }
    }

    /// Record a failed authentication attempt. Returns the lockout duration
    /// if this failure triggered one.
    pub fn record_auth_failure(&self, client: IpAddr) -> Option<Duration> {
        let now = Instant::now();
        let cutoff = now.checked_sub(self.auth_window).unwrap_or(now);

        let mut entry = self.auth.entry(client).or_insert_with(|| AuthState {
            attempts: 0,
            last_attempt: now,
            locked_until: None,
        });

        // A stale counter restarts from scratch
        if entry.attempts > 0 && entry.last_attempt <= cutoff {
            entry.attempts = 0;
            entry.locked_until = None;
        }

        entry.attempts += 1;
        entry.last_attempt = now;

        if entry.attempts >= self.max_auth_attempts {
            entry.locked_until = Some(now + self.lockout);
            warn!(
                target: "audit",
                client = %client,
                attempts = entry.attempts,
                lockout_secs = self.lockout.as_secs(),
                "Client locked out after repeated authentication failures"
            );
            Some(self.lockout)
        } else {
            debug!(
                target: "audit",
                client = %client,
                attempts = entry.attempts,
                "Failed authentication attempt"
            );
            None
        }
    }

    /// Clear failure tracking after a successful authentication.
    pub fn record_auth_success(&self, client: IpAddr) {
        if self.auth.remove(&client).is_some() {
            debug!(target: "audit", client = %client, "Authentication failure count cleared");
        }
    }

    /// Admit or reject one admin request. Returns the retry delay if the
    /// client's window is full.
    pub fn check_request(&self, client: IpAddr) -> Option<Duration> {
        let now = Instant::now();
        let cutoff = now.checked_sub(self.request_window).unwrap_or(now);

        let mut entry = self.requests.entry(client).or_insert_with(|| RequestWindow {
            timestamps: Vec::new(),
            last_seen: now,
        });
        entry.last_seen = now;
        entry.timestamps.retain(|&t| t > cutoff);

        if (entry.timestamps.len() as u32) < self.max_requests {
            entry.timestamps.push(now);
            debug!(
                target: "audit",
                client = %client,
                in_window = entry.timestamps.len(),
                "Admin request admitted"
            );
            None
        } else {
            let oldest = entry.timestamps.first().copied().unwrap_or(now);
            let retry_after = (oldest + self.request_window).saturating_duration_since(now);
            warn!(
                target: "audit",
                client = %client,
                in_window = entry.timestamps.len(),
                "Admin request rate exceeded"
            );
            Some(retry_after)
        }
    }

    /// Drop stale entries from both maps. Active lockouts are always kept,
    /// whatever their age.
    ///
    /// Removals are counted inside the retain passes; comparing map sizes
    /// around them would misread concurrent inserts as negative removals.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut removed = 0usize;

        let auth_cutoff = now.checked_sub(self.auth_window).unwrap_or(now);
        self.auth.retain(|_, state| {
            if state.locked_until.is_some_and(|t| t > now) {
                return true;
            }
            let keep = state.last_attempt > auth_cutoff;
            if !keep {
                removed += 1;
            }
            keep
        });

        let request_cutoff = now.checked_sub(self.request_window * 2).unwrap_or(now);
        self.requests.retain(|_, window| {
            let keep = window.last_seen > request_cutoff;
            if !keep {
                removed += 1;
            }
            keep
        });

        if removed > 0 {
            debug!(removed, "Swept stale rate limiter entries");
        }
    }

    #[cfg(test)]
    fn tracked_clients(&self) -> (usize, usize) {
        (self.auth.len(), self.requests.len())
    }
}

//! Per-client fixed-window rate limiting
//!
//! Each client IP gets a window of `window_size` during which at most
//! `max_requests` requests are let through. The limits are read from the
//! live configuration on every check, so a reload takes effect immediately.

use crate::routes::ProxyConfig;
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Outcome of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    /// Over the limit until the current window ends
    Limited { retry_after: Duration },
}

struct Window {
    started: Instant,
    count: u32,
}

pub struct RateLimiter {
    config: Arc<ProxyConfig>,
    windows: DashMap<IpAddr, Window>,
    rejected: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: Arc<ProxyConfig>) -> Self {
        Self {
            config,
            windows: DashMap::new(),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn check(&self, client: IpAddr) -> Decision {
        self.check_at(client, Instant::now())
    }

    pub fn check_at(&self, client: IpAddr, now: Instant) -> Decision {
        let (max_requests, window_size) = self.config.rate_limit();

        let mut window = self.windows.entry(client).or_insert_with(|| Window {
            started: now,
            count: 0,
        });

        let elapsed = now.saturating_duration_since(window.started);
        if elapsed >= window_size {
            window.started = now;
            window.count = 0;
        }

        if window.count >= max_requests {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            let retry_after = window_size.saturating_sub(now.saturating_duration_since(window.started));
            warn!(client = %client, limit = max_requests, "Rate limit exceeded");
            return Decision::Limited { retry_after };
        }

        window.count += 1;
        Decision::Allowed
    }

    /// Drop windows that ended before `now`. Returns how many were removed.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let (_, window_size) = self.config.rate_limit();
        let before = self.windows.len();
        self.windows
            .retain(|_, window| now.saturating_duration_since(window.started) < window_size);
        before.saturating_sub(self.windows.len())
    }

    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }

    /// Requests rejected since start
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

/// `Retry-After` value in whole seconds, at least 1
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}

/// Periodically purge expired windows until shutdown
pub async fn purge_loop(limiter: Arc<RateLimiter>, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let removed = limiter.purge_expired(Instant::now());
                if removed > 0 {
                    debug!(removed, remaining = limiter.tracked_clients(), "Purged rate limit windows");
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use serde::Serialize;
use tracing::debug;

use crate::config::RateLimitConfig;

/// Limited flag of one session; it clears itself at `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitState {
    pub is_limited: bool,
    pub reason: String,
    pub retry_after: u64,
    pub expires_at: DateTime<Utc>,
}

/// Per-session request quota: `max_requests` per `window_secs`.
pub struct SessionRateLimiter {
    limiter: Option<DefaultKeyedRateLimiter<String>>,
    clock: DefaultClock,
    limited: Mutex<HashMap<String, RateLimitState>>,
}

impl std::fmt::Debug for SessionRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRateLimiter")
            .field("enabled", &self.limiter.is_some())
            .finish_non_exhaustive()
    }
}

impl SessionRateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let limiter = config.enabled.then(|| {
            let burst = NonZeroU32::new(config.max_requests).unwrap_or(nonzero!(1u32));
            let window = Duration::from_secs(config.window_secs.max(1));
            let quota = Quota::with_period(window / burst.get())
                .map_or_else(|| Quota::per_second(burst), |q| q.allow_burst(burst));
            RateLimiter::keyed(quota)
        });
        Self {
            limiter,
            clock: DefaultClock::default(),
            limited: Mutex::new(HashMap::new()),
        }
    }

    /// Admit one request for `session_id`, or return its limited state.
    pub fn check(&self, session_id: &str) -> Result<(), RateLimitState> {
        let Some(limiter) = &self.limiter else {
            return Ok(());
        };

        let now = Utc::now();
        let mut limited = self.limited.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(state) = limited.get(session_id) {
            if state.expires_at > now {
                let remaining = (state.expires_at - now).num_milliseconds().max(0);
                let mut state = state.clone();
                state.retry_after = ceil_secs(Duration::from_millis(remaining.unsigned_abs()));
                return Err(state);
            }
            limited.remove(session_id);
            debug!(session_id, "Rate limit cleared");
        }

        match limiter.check_key(&session_id.to_string()) {
            Ok(()) => Ok(()),
            Err(not_until) => {
                let wait = not_until.wait_time_from(self.clock.now());
                let retry_after = ceil_secs(wait);
                let expires_at = now
                    + chrono::Duration::seconds(i64::try_from(retry_after).unwrap_or(3600));
                let state = RateLimitState {
                    is_limited: true,
                    reason: "too many requests".to_string(),
                    retry_after,
                    expires_at,
                };
                limited.insert(session_id.to_string(), state.clone());
                debug!(session_id, retry_after, "Session rate limited");
                Err(state)
            }
        }
    }

    /// Current limited state, if still in force.
    pub fn state(&self, session_id: &str) -> Option<RateLimitState> {
        let limited = self.limited.lock().unwrap_or_else(PoisonError::into_inner);
        limited
            .get(session_id)
            .filter(|s| s.expires_at > Utc::now())
            .cloned()
    }

    /// Forget expired flags and idle limiter keys.
    pub fn purge(&self) {
        let now = Utc::now();
        self.limited
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, s| s.expires_at > now);
        if let Some(limiter) = &self.limiter {
            limiter.retain_recent();
        }
    }
}

fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    secs.max(1)
}

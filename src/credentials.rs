//! Round-robin API key rotation with best-effort usage statistics.

use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use crate::cache::KvStore;

/// Per-key usage counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageStat {
    pub usage: u64,
    pub success: u64,
    pub failure: u64,
    pub total_latency_ms: u64,
    pub latency_samples: u64,
}

impl UsageStat {
    pub fn average_latency_ms(&self) -> Option<u64> {
        (self.latency_samples > 0).then(|| self.total_latency_ms / self.latency_samples)
    }
}

/// A credential handed out by [`CredentialRotator::next`].
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub key: String,
    pub index: usize,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("key", &"<redacted>")
            .field("index", &self.index)
            .finish()
    }
}

const STAT_FIELDS: [&str; 5] = ["usage", "success", "failure", "latency_total", "latency_count"];

/// Rotates among a pool of API keys for one external service.
///
/// The rotation counter lives in the shared [`KvStore`] so several service
/// instances spread load over the same pool.
#[derive(Clone)]
pub struct CredentialRotator {
    service: String,
    keys: Arc<[String]>,
    store: Arc<dyn KvStore>,
}

impl std::fmt::Debug for CredentialRotator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialRotator")
            .field("service", &self.service)
            .field("pool_size", &self.keys.len())
            .finish()
    }
}

impl CredentialRotator {
    pub fn new(service: impl Into<String>, keys: Vec<String>, store: Arc<dyn KvStore>) -> Self {
        let keys: Vec<String> = keys
            .into_iter()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        Self {
            service: service.into(),
            keys: keys.into(),
            store,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn pool_size(&self) -> usize {
        self.keys.len()
    }

    fn counter_key(&self) -> String {
        format!("credentials:{}:cursor", self.service)
    }

    fn stat_key(&self, index: usize, field: &str) -> String {
        format!("credentials:{}:{index}:{field}", self.service)
    }

    /// Next key in round-robin order, or `None` when the pool is empty.
    pub async fn next(&self) -> Option<Credential> {
        let size = self.keys.len();
        let index = match size {
            0 => return None,
            1 => 0,
            _ => match self.store.incr_by(&self.counter_key(), 1, None).await {
                // incr returns 1 for the first caller; start the cycle at 0.
                Ok(n) => usize::try_from((n - 1).rem_euclid(size as i64)).unwrap_or(0),
                Err(e) => {
                    warn!(service = %self.service, error = %e, "Rotation counter unavailable, using key 0");
                    0
                }
            },
        };
        Some(Credential {
            key: self.keys[index].clone(),
            index,
        })
    }

    /// Record the outcome of a call. Failures are logged and swallowed.
    pub async fn record_usage(&self, index: usize, success: bool, latency_ms: u64) {
        let outcome = if success { "success" } else { "failure" };
        let latency = i64::try_from(latency_ms).unwrap_or(i64::MAX);
        let updates = [
            ("usage", 1),
            (outcome, 1),
            ("latency_total", latency),
            ("latency_count", 1),
        ];
        for (field, delta) in updates {
            if let Err(e) = self
                .store
                .incr_by(&self.stat_key(index, field), delta, None)
                .await
            {
                warn!(
                    service = %self.service,
                    index,
                    field,
                    error = %e,
                    "Failed to record credential usage"
                );
                return;
            }
        }
    }

    pub async fn stats(&self, index: usize) -> UsageStat {
        let mut values = [0u64; 5];
        for (slot, field) in values.iter_mut().zip(STAT_FIELDS) {
            *slot = match self.store.get(&self.stat_key(index, field)).await {
                Ok(Some(raw)) => raw.parse().unwrap_or(0),
                Ok(None) => 0,
                Err(e) => {
                    warn!(service = %self.service, index, error = %e, "Failed to read credential stats");
                    0
                }
            };
        }
        let [usage, success, failure, total_latency_ms, latency_samples] = values;
        UsageStat {
            usage,
            success,
            failure,
            total_latency_ms,
            latency_samples,
        }
    }

    /// Clear the statistics of one key.
    pub async fn reset(&self, index: usize) {
        for field in STAT_FIELDS {
            if let Err(e) = self.store.delete(&self.stat_key(index, field)).await {
                warn!(service = %self.service, index, error = %e, "Failed to reset credential stats");
            }
        }
    }
}

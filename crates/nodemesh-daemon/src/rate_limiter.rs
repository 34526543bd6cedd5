//! Rate limiter for registration attempts
//!
//! Limits how often a node id may fail registration. Failures are counted
//! in a sliding window; crossing the threshold blocks the id, and each
//! repeated block doubles in length up to a cap.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, warn};

/// Maximum failed attempts before blocking a node id
const DEFAULT_MAX_FAILURES: u32 = 5;

/// Time window for counting failures (in seconds)
const DEFAULT_WINDOW_SECS: u64 = 60;

/// Initial block duration (in seconds)
const DEFAULT_BLOCK_DURATION_SECS: u64 = 60;

/// Maximum block duration with exponential backoff (in seconds)
const MAX_BLOCK_DURATION_SECS: u64 = 3600; // 1 hour

/// Rate limiter configuration
#[derive(Clone, Debug)]
pub struct RateLimiterConfig {
    /// Maximum failed attempts before blocking
    pub max_failures: u32,
    /// Time window for counting failures
    pub window: Duration,
    /// Initial block duration
    pub block_duration: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_failures: DEFAULT_MAX_FAILURES,
            window: Duration::from_secs(DEFAULT_WINDOW_SECS),
            block_duration: Duration::from_secs(DEFAULT_BLOCK_DURATION_SECS),
        }
    }
}

#[derive(Debug, Default)]
struct Entry {
    failures: Vec<Instant>,
    blocked_until: Option<Instant>,
    /// Blocks so far, drives the backoff multiplier
    block_count: u32,
}

impl Entry {
    fn cleanup(&mut self, window: Duration) {
        let now = Instant::now();
        self.failures.retain(|t| now.duration_since(*t) < window);
    }

    fn block_remaining(&self) -> Option<Duration> {
        self.blocked_until
            .and_then(|until| until.checked_duration_since(Instant::now()))
            .filter(|d| !d.is_zero())
    }

    fn is_blocked(&self) -> bool {
        self.block_remaining().is_some()
    }
}

/// Failed-registration limiter keyed by node id
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_config(RateLimiterConfig::default())
    }

    pub fn with_config(config: RateLimiterConfig) -> Self {
        Self {
            config,
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Returns `true` if the key may attempt registration
    pub fn check(&self, key: &str) -> bool {
        self.entries
            .read()
            .get(key)
            .map_or(true, |entry| !entry.is_blocked())
    }

    /// Record a successful registration (resets failure count, keeps block history)
    pub fn record_success(&self, key: &str) {
        if let Some(entry) = self.entries.write().get_mut(key) {
            entry.failures.clear();
            debug!("Rate limiter: cleared failures for {}", key);
        }
    }

    /// Record a failed attempt
    ///
    /// Returns `true` if the key is now blocked.
    pub fn record_failure(&self, key: &str) -> bool {
        let mut entries = self.entries.write();
        let entry = entries.entry(key.to_string()).or_default();

        entry.cleanup(self.config.window);
        if entry.is_blocked() {
            return true;
        }

        entry.failures.push(Instant::now());

        if entry.failures.len() as u32 >= self.config.max_failures {
            let multiplier = 1u32 << entry.block_count.min(6); // Cap at 64x
            let block = (self.config.block_duration * multiplier)
                .min(Duration::from_secs(MAX_BLOCK_DURATION_SECS));

            entry.blocked_until = Some(Instant::now() + block);
            entry.block_count = entry.block_count.saturating_add(1);
            entry.failures.clear();

            warn!(
                "Rate limiter: blocked {} for {} seconds (block #{})",
                key,
                block.as_secs(),
                entry.block_count
            );
            true
        } else {
            debug!(
                "Rate limiter: recorded failure for {} ({}/{})",
                key,
                entry.failures.len(),
                self.config.max_failures
            );
            false
        }
    }

    pub fn block_remaining(&self, key: &str) -> Option<Duration> {
        self.entries.read().get(key).and_then(Entry::block_remaining)
    }

    /// Drop entries with no recent failures and no active block
    pub fn cleanup_expired(&self) {
        let window = self.config.window;
        self.entries.write().retain(|key, entry| {
            entry.cleanup(window);
            let keep = entry.is_blocked() || !entry.failures.is_empty();
            if !keep {
                debug!("Rate limiter: cleaned up entry for {}", key);
            }
            keep
        });
    }

    /// Number of keys currently tracked
    pub fn tracked(&self) -> usize {
        self.entries.read().len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

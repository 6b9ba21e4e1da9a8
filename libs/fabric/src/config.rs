//! Configuration for the fabric controller.

use std::time::Duration;

use crate::channel::RetryPolicy;

/// Default age beyond which a cached topology observation must be re-read
/// before a mutating operation trusts it.
pub const DEFAULT_STALENESS_WINDOW: Duration = Duration::from_secs(2);

/// Default name prefix for fake-ethernet interfaces.
pub const DEFAULT_FAKE_PREFIX: &str = "feth";

/// Default number of candidate fake-interface names to scan.
pub const DEFAULT_FAKE_SEARCH_LIMIT: u32 = 128;

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct FabricConfig {
    /// Maximum age of a topology observation before re-validation.
    pub staleness_window: Duration,

    /// Retry policy for transient get-path failures.
    pub retry: RetryPolicy,

    /// Name prefix used when allocating fake-ethernet interfaces.
    pub fake_prefix: String,

    /// Candidate names scanned when allocating (`<prefix>0..<prefix>N`).
    pub fake_search_limit: u32,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            staleness_window: DEFAULT_STALENESS_WINDOW,
            retry: RetryPolicy::default(),
            fake_prefix: DEFAULT_FAKE_PREFIX.to_string(),
            fake_search_limit: DEFAULT_FAKE_SEARCH_LIMIT,
        }
    }
}

impl FabricConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let staleness_window = std::env::var("VIF_STALENESS_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.staleness_window);

        let mut retry = defaults.retry;
        if let Some(attempts) = std::env::var("VIF_RETRY_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            retry.max_attempts = attempts;
        }
        if let Some(base_ms) = std::env::var("VIF_RETRY_BASE_DELAY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            retry.base_delay = Duration::from_millis(base_ms);
        }

        let fake_prefix =
            std::env::var("VIF_FAKE_PREFIX").unwrap_or_else(|_| defaults.fake_prefix.clone());

        let fake_search_limit = std::env::var("VIF_FAKE_SEARCH_LIMIT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.fake_search_limit);

        Self {
            staleness_window,
            retry,
            fake_prefix,
            fake_search_limit,
        }
    }
}

//! Unified feed & analysis pipeline: the feed state manager, the analysis
//! cache and queue, and the refresh scheduler.

mod cache;
mod feed;
mod queue;
mod scheduler;

use serde::{Deserialize, Serialize};

pub use cache::{AnalysisCache, CacheEntry, CACHE_PERSIST_CAP, CACHE_TTL_HOURS};
pub use feed::{FeedService, FeedSnapshot, PushEvent, RefreshSummary, SEEN_IDS_CAP};
pub use queue::{AnalysisEvent, AnalysisProgress, AnalysisQueue, ANALYSIS_BATCH_SIZE};
pub use scheduler::{RefreshScheduler, RefreshTrigger, SchedulerStatus};

pub const CRATE_NAME: &str = "jobfeed-pipeline";

/// Periodic refresh settings. Round-trips through the state store and can be
/// seeded from the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshConfig {
    pub interval_minutes: u64,
    pub enabled: bool,
    pub max_jobs_per_source: usize,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval_minutes: 15,
            enabled: true,
            max_jobs_per_source: 50,
        }
    }
}

impl RefreshConfig {
    /// Persisted config wins over the environment; the environment seeds the
    /// first session.
    pub async fn load(store: &dyn jobfeed_store::StateStore) -> Self {
        match jobfeed_store::load_optional(store, jobfeed_store::keys::REFRESH_CONFIG).await {
            Some(config) => config,
            None => Self::from_env(),
        }
    }

    pub async fn save(&self, store: &dyn jobfeed_store::StateStore) {
        jobfeed_store::persist(store, jobfeed_store::keys::REFRESH_CONFIG, self).await;
    }

    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            interval_minutes: std::env::var("JOBFEED_REFRESH_INTERVAL_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.interval_minutes),
            enabled: std::env::var("JOBFEED_REFRESH_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.enabled),
            max_jobs_per_source: std::env::var("JOBFEED_MAX_JOBS_PER_SOURCE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_jobs_per_source),
        }
    }
}

/// What the candidate is looking for; fanned out to every search API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchPreferences {
    pub query: String,
    pub location: String,
    pub work_type: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobfeed_store::MemoryStore;

    #[tokio::test]
    async fn refresh_config_round_trips_through_store() {
        let store = MemoryStore::new();
        let config = RefreshConfig {
            interval_minutes: 5,
            enabled: false,
            max_jobs_per_source: 10,
        };
        config.save(&store).await;
        assert_eq!(RefreshConfig::load(&store).await, config);
    }

    #[tokio::test]
    async fn missing_persisted_config_falls_back_to_defaults() {
        let store = MemoryStore::new();
        let config = RefreshConfig::load(&store).await;
        assert_eq!(config.interval_minutes, RefreshConfig::default().interval_minutes);
    }
}

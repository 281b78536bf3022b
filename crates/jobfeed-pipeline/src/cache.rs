//! Time-boxed (job, résumé) scoring cache with a bounded persisted size.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use jobfeed_core::AnalysisResult;
use jobfeed_store::{self as store, keys, StateStore};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

pub const CACHE_TTL_HOURS: i64 = 24;
pub const CACHE_PERSIST_CAP: usize = 500;

/// Whole-entry cache record; never partially updated. The résumé id is kept
/// as its own field so invalidation never has to parse it back out of the
/// composite key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub resume_id: String,
    pub result: AnalysisResult,
    pub timestamp: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

pub struct AnalysisCache {
    store: Arc<dyn StateStore>,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

fn cache_key(resume_id: &str, job_id: &str) -> String {
    format!("{resume_id}:{job_id}")
}

impl AnalysisCache {
    /// Restore persisted entries, dropping anything already expired.
    pub async fn restore(store: Arc<dyn StateStore>) -> Arc<Self> {
        Self::restore_at(store, Utc::now()).await
    }

    pub async fn restore_at(store: Arc<dyn StateStore>, now: DateTime<Utc>) -> Arc<Self> {
        let persisted: Vec<CacheEntry> =
            store::load_or_default(store.as_ref(), keys::ANALYSIS_CACHE).await;
        let entries: HashMap<String, CacheEntry> = persisted
            .into_iter()
            .filter(|entry| entry.is_valid(now))
            .map(|entry| (entry.key.clone(), entry))
            .collect();
        Arc::new(Self {
            store,
            entries: Mutex::new(entries),
        })
    }

    pub async fn get(&self, job_id: &str, resume_id: &str) -> Option<AnalysisResult> {
        self.get_at(job_id, resume_id, Utc::now()).await
    }

    /// Return the cached result if present and unexpired; an expired entry
    /// is purged on read and never served.
    pub async fn get_at(
        &self,
        job_id: &str,
        resume_id: &str,
        now: DateTime<Utc>,
    ) -> Option<AnalysisResult> {
        let key = cache_key(resume_id, job_id);
        let mut entries = self.entries.lock().await;
        match entries.get(&key) {
            Some(entry) if entry.is_valid(now) => Some(entry.result.clone()),
            Some(_) => {
                debug!(key, "purging expired cache entry");
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    pub async fn contains_valid(&self, job_id: &str, resume_id: &str, now: DateTime<Utc>) -> bool {
        self.get_at(job_id, resume_id, now).await.is_some()
    }

    pub async fn put(&self, job_id: &str, resume_id: &str, result: AnalysisResult) {
        self.put_at(job_id, resume_id, result, Utc::now()).await;
    }

    /// Store/overwrite a whole entry with a fresh TTL, then persist capped
    /// to the most recently written entries.
    pub async fn put_at(
        &self,
        job_id: &str,
        resume_id: &str,
        result: AnalysisResult,
        now: DateTime<Utc>,
    ) {
        let key = cache_key(resume_id, job_id);
        let entry = CacheEntry {
            key: key.clone(),
            resume_id: resume_id.to_string(),
            result,
            timestamp: now,
            expires_at: now + Duration::hours(CACHE_TTL_HOURS),
        };

        let mut entries = self.entries.lock().await;
        entries.insert(key, entry);

        // Evict oldest-written entries beyond the cap so memory and the
        // persisted set stay in step.
        while entries.len() > CACHE_PERSIST_CAP {
            let oldest = entries
                .values()
                .min_by_key(|entry| entry.timestamp)
                .map(|entry| entry.key.clone());
            match oldest {
                Some(key) => {
                    entries.remove(&key);
                }
                None => break,
            }
        }

        self.persist_locked(&entries).await;
    }

    /// Drop every entry for a résumé; prior scores are meaningless once the
    /// candidate switches résumé.
    pub async fn invalidate_for_resume(&self, resume_id: &str) {
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| entry.resume_id != resume_id);
        self.persist_locked(&entries).await;
    }

    async fn persist_locked(&self, entries: &HashMap<String, CacheEntry>) {
        let mut all: Vec<&CacheEntry> = entries.values().collect();
        all.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        all.truncate(CACHE_PERSIST_CAP);
        store::persist(self.store.as_ref(), keys::ANALYSIS_CACHE, &all).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use jobfeed_store::MemoryStore;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 0, 0, 0).single().unwrap()
    }

    fn result(score: u8) -> AnalysisResult {
        AnalysisResult {
            match_score: score,
            matching_skills: vec!["Rust".to_string()],
            missing_skills: vec![],
            recommendations: vec![],
        }
    }

    async fn cache() -> Arc<AnalysisCache> {
        AnalysisCache::restore_at(Arc::new(MemoryStore::new()), t0()).await
    }

    #[tokio::test]
    async fn entry_valid_until_24h_then_purged() {
        let cache = cache().await;
        cache.put_at("job-1", "resume-1", result(80), t0()).await;

        let almost = t0() + Duration::hours(23) + Duration::minutes(59);
        assert_eq!(
            cache.get_at("job-1", "resume-1", almost).await,
            Some(result(80))
        );

        let past = t0() + Duration::hours(24) + Duration::minutes(1);
        assert!(cache.get_at("job-1", "resume-1", past).await.is_none());
        // Purged on read, not merely hidden.
        assert!(cache.get_at("job-1", "resume-1", t0()).await.is_none());
    }

    #[tokio::test]
    async fn writes_are_whole_entry_replacements() {
        let cache = cache().await;
        cache.put_at("job-1", "resume-1", result(40), t0()).await;
        let later = t0() + Duration::hours(23);
        cache.put_at("job-1", "resume-1", result(90), later).await;

        // Fresh TTL from the overwrite.
        let probe = later + Duration::hours(23);
        assert_eq!(
            cache.get_at("job-1", "resume-1", probe).await,
            Some(result(90))
        );
    }

    #[tokio::test]
    async fn writing_501st_entry_evicts_single_oldest() {
        let store = Arc::new(MemoryStore::new());
        let cache = AnalysisCache::restore_at(store.clone(), t0()).await;

        for i in 0..=CACHE_PERSIST_CAP {
            let at = t0() + Duration::seconds(i as i64);
            cache.put_at(&format!("job-{i}"), "resume-1", result(50), at).await;
        }

        let persisted: Vec<CacheEntry> =
            store::load_or_default(store.as_ref(), keys::ANALYSIS_CACHE).await;
        assert_eq!(persisted.len(), CACHE_PERSIST_CAP);
        assert!(!persisted.iter().any(|e| e.key == "resume-1:job-0"));
        assert!(persisted.iter().any(|e| e.key == "resume-1:job-1"));
        assert!(persisted
            .iter()
            .any(|e| e.key == format!("resume-1:job-{CACHE_PERSIST_CAP}")));
    }

    #[tokio::test]
    async fn resume_switch_invalidates_only_that_resume() {
        let cache = cache().await;
        cache.put_at("job-1", "resume-old", result(70), t0()).await;
        cache.put_at("job-1", "resume-new", result(60), t0()).await;

        cache.invalidate_for_resume("resume-old").await;

        let probe = t0() + Duration::hours(1);
        assert!(cache.get_at("job-1", "resume-old", probe).await.is_none());
        assert_eq!(
            cache.get_at("job-1", "resume-new", probe).await,
            Some(result(60))
        );
    }

    #[tokio::test]
    async fn invalidation_does_not_match_colon_extended_resume_ids() {
        let cache = cache().await;
        cache.put_at("job-1", "a", result(70), t0()).await;
        cache.put_at("job-1", "a:b", result(60), t0()).await;

        cache.invalidate_for_resume("a").await;

        let probe = t0() + Duration::hours(1);
        assert!(cache.get_at("job-1", "a", probe).await.is_none());
        assert_eq!(cache.get_at("job-1", "a:b", probe).await, Some(result(60)));
    }

    #[tokio::test]
    async fn restore_drops_expired_entries() {
        let store = Arc::new(MemoryStore::new());
        let cache = AnalysisCache::restore_at(store.clone(), t0()).await;
        cache.put_at("job-1", "resume-1", result(80), t0()).await;
        cache
            .put_at("job-2", "resume-1", result(75), t0() + Duration::hours(20))
            .await;

        let reloaded =
            AnalysisCache::restore_at(store, t0() + Duration::hours(25)).await;
        let probe = t0() + Duration::hours(25);
        assert!(reloaded.get_at("job-1", "resume-1", probe).await.is_none());
        assert_eq!(
            reloaded.get_at("job-2", "resume-1", probe).await,
            Some(result(75))
        );
    }
}

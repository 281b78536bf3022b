//! Feed state manager: the single source of truth for a candidate's visible
//! feed. Every mutation publishes a fresh copy-on-write snapshot; concurrent
//! readers never observe a partially updated list.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use jobfeed_core::{
    merge_jobs, normalize_api_job, normalize_vendor_job, sort_jobs, Job, JobStatus, SortBy,
    SourceFilter,
};
use jobfeed_sources::{JobSearchApi, VendorJobSource};
use jobfeed_store::{self as store, keys, PersistedSnapshot, StateStore};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{RefreshConfig, SearchPreferences};

/// Persisted seen-set cap; only the most recently seen ids are kept.
pub const SEEN_IDS_CAP: usize = 1000;

/// Immutable published view of the feed. `new_jobs_count` is a cached
/// projection of the `is_new` flags, always recomputable from `jobs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedSnapshot {
    pub jobs: Vec<Job>,
    pub last_refresh_time: Option<DateTime<Utc>>,
    pub new_jobs_count: usize,
    pub source_filter: SourceFilter,
    pub sort_by: SortBy,
}

impl FeedSnapshot {
    fn empty() -> Self {
        Self {
            jobs: Vec::new(),
            last_refresh_time: None,
            new_jobs_count: 0,
            source_filter: SourceFilter::default(),
            sort_by: SortBy::default(),
        }
    }

    /// Filtered and sorted view; the stored order is arrival order and the
    /// displayed order is always recomputed from the sort key.
    pub fn view(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|job| self.source_filter.admits(job))
            .cloned()
            .collect();
        sort_jobs(&mut jobs, self.sort_by);
        jobs
    }

    fn recount(&mut self) {
        self.new_jobs_count = self.jobs.iter().filter(|job| job.is_new).count();
    }
}

/// Outcome of one refresh round. Partial results are a success: a failed
/// source contributes zero jobs and is listed in `failed_sources`.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub api_jobs: usize,
    pub email_jobs: usize,
    pub new_jobs: usize,
    pub total_jobs: usize,
    pub failed_sources: Vec<String>,
}

/// Insert/update notifications pushed by the realtime channel for backing
/// job records. Merging them is idempotent.
#[derive(Debug, Clone)]
pub enum PushEvent {
    Inserted(Job),
    Updated(Job),
}

struct FeedInner {
    snapshot: Arc<FeedSnapshot>,
    /// Seen ids in recency order, newest at the back.
    seen: VecDeque<String>,
}

pub struct FeedService {
    store: Arc<dyn StateStore>,
    inner: Mutex<FeedInner>,
    snapshot_tx: watch::Sender<Arc<FeedSnapshot>>,
    refreshing: Arc<AtomicBool>,
}

impl FeedService {
    /// Restore the feed from the store: the persisted snapshot (unless
    /// stale) and the seen-id set. Missing or corrupt state starts empty.
    pub async fn restore(store: Arc<dyn StateStore>) -> Arc<Self> {
        let now = Utc::now();
        let seen: Vec<String> = store::load_or_default(store.as_ref(), keys::SEEN_JOBS).await;
        let snapshot = match store::load_snapshot(store.as_ref(), now).await {
            Some(persisted) => {
                info!(jobs = persisted.jobs.len(), "restored feed snapshot");
                let mut snapshot = FeedSnapshot {
                    jobs: persisted.jobs,
                    last_refresh_time: persisted.last_refresh_time,
                    new_jobs_count: 0,
                    source_filter: SourceFilter::default(),
                    sort_by: SortBy::default(),
                };
                // Seen mutations persist only the seen-id set, so the stored
                // snapshot may carry flags from before the last mark-seen.
                // The seen set is authoritative.
                let seen_ids: HashSet<&String> = seen.iter().collect();
                for job in &mut snapshot.jobs {
                    if seen_ids.contains(&job.id) {
                        job.is_new = false;
                        job.is_seen = true;
                    }
                }
                snapshot.recount();
                snapshot
            }
            None => FeedSnapshot::empty(),
        };

        let snapshot = Arc::new(snapshot);
        let (snapshot_tx, _) = watch::channel(snapshot.clone());

        Arc::new(Self {
            store,
            inner: Mutex::new(FeedInner {
                snapshot,
                seen: seen.into_iter().collect(),
            }),
            snapshot_tx,
            refreshing: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<FeedSnapshot>> {
        self.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> Arc<FeedSnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::SeqCst)
    }

    /// The in-flight guard, shared with the scheduler so periodic triggers
    /// are suppressed while a refresh runs.
    pub fn refresh_guard(&self) -> Arc<AtomicBool> {
        self.refreshing.clone()
    }

    fn publish(&self, inner: &mut FeedInner, snapshot: FeedSnapshot) {
        let snapshot = Arc::new(snapshot);
        inner.snapshot = snapshot.clone();
        self.snapshot_tx.send_replace(snapshot);
    }

    async fn persist_snapshot(&self, snapshot: &FeedSnapshot, saved_at: DateTime<Utc>) {
        let persisted = PersistedSnapshot {
            saved_at,
            last_refresh_time: snapshot.last_refresh_time,
            jobs: snapshot.jobs.clone(),
        };
        store::persist(self.store.as_ref(), keys::FEED_SNAPSHOT, &persisted).await;
    }

    async fn persist_seen(&self, inner: &FeedInner) {
        let ids: Vec<&String> = inner.seen.iter().collect();
        store::persist(self.store.as_ref(), keys::SEEN_JOBS, &ids).await;
    }

    /// Run one refresh round. Returns `Ok(None)` when another refresh is
    /// already in flight. Source failures never abort the round; the guard
    /// is cleared on every exit path.
    pub async fn refresh(
        &self,
        prefs: &SearchPreferences,
        config: &RefreshConfig,
        apis: &[Arc<dyn JobSearchApi>],
        vendor: Option<Arc<dyn VendorJobSource>>,
    ) -> Result<Option<RefreshSummary>> {
        if self
            .refreshing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("refresh already in flight, skipping");
            return Ok(None);
        }

        let result = self.refresh_inner(prefs, config, apis, vendor).await;
        self.refreshing.store(false, Ordering::SeqCst);
        result.map(Some)
    }

    async fn refresh_inner(
        &self,
        prefs: &SearchPreferences,
        config: &RefreshConfig,
        apis: &[Arc<dyn JobSearchApi>],
        vendor: Option<Arc<dyn VendorJobSource>>,
    ) -> Result<RefreshSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, query = %prefs.query, "starting feed refresh");

        // Fetches run concurrently; results land in per-source slots so the
        // merge order stays fixed regardless of completion order.
        let mut api_slots: Vec<Option<Vec<jobfeed_core::RawApiJob>>> = vec![None; apis.len()];
        let mut failed_sources: Vec<String> = Vec::new();

        let mut fan_out = JoinSet::new();
        for (slot, api) in apis.iter().enumerate() {
            let api = api.clone();
            let prefs = prefs.clone();
            let max = config.max_jobs_per_source;
            fan_out.spawn(async move {
                let platform = api.platform().to_string();
                let result = api
                    .search_jobs(
                        &prefs.query,
                        &prefs.location,
                        prefs.work_type.as_deref(),
                        max,
                    )
                    .await;
                (slot, platform, result)
            });
        }

        let vendor_task = vendor.map(|source| {
            let max = config.max_jobs_per_source;
            tokio::spawn(async move {
                if let Err(err) = source.sync_incoming(max).await {
                    warn!(error = %err, "vendor inbox sync failed, using previously parsed jobs");
                }
                source.vendor_jobs(max).await
            })
        });

        while let Some(joined) = fan_out.join_next().await {
            match joined {
                Ok((slot, _, Ok(raws))) => api_slots[slot] = Some(raws),
                Ok((_, platform, Err(err))) => {
                    warn!(platform, error = %err, "source fetch failed, contributing zero jobs");
                    failed_sources.push(platform);
                }
                Err(err) => warn!(error = %err, "source fetch task aborted"),
            }
        }

        let vendor_raws = match vendor_task {
            Some(handle) => match handle.await {
                Ok(Ok(raws)) => raws,
                Ok(Err(err)) => {
                    warn!(error = %err, "vendor fetch failed, contributing zero jobs");
                    failed_sources.push("email".to_string());
                    Vec::new()
                }
                Err(err) => {
                    warn!(error = %err, "vendor fetch task aborted");
                    failed_sources.push("email".to_string());
                    Vec::new()
                }
            },
            None => Vec::new(),
        };

        let now = Utc::now();
        let mut inner = self.inner.lock().await;

        // Fixed merge order: existing feed, then each API in declared order,
        // then the vendor channel.
        let mut incoming: Vec<Job> = inner.snapshot.jobs.clone();
        let previous_keys: HashMap<String, (bool, bool)> = incoming
            .iter()
            .map(|job| (jobfeed_core::dedup_key(job), (job.is_new, job.is_seen)))
            .collect();

        let mut api_jobs = 0usize;
        for (slot, api) in apis.iter().enumerate() {
            if let Some(raws) = api_slots[slot].take() {
                api_jobs += raws.len();
                incoming.extend(
                    raws.into_iter()
                        .map(|raw| normalize_api_job(raw, api.platform(), now)),
                );
            }
        }
        let email_jobs = vendor_raws.len();
        incoming.extend(
            vendor_raws
                .into_iter()
                .map(|raw| normalize_vendor_job(raw, now)),
        );

        let mut jobs = merge_jobs(incoming);

        let seen: HashSet<&String> = inner.seen.iter().collect();
        let mut new_jobs = 0usize;
        for job in &mut jobs {
            match previous_keys.get(&jobfeed_core::dedup_key(job)) {
                // A collision winner inherits the feed flags of the posting
                // it replaced.
                Some(&(was_new, was_seen)) => {
                    job.is_new = was_new;
                    job.is_seen = was_seen;
                }
                None => {
                    new_jobs += 1;
                    if seen.contains(&job.id) {
                        job.is_seen = true;
                        job.is_new = false;
                    } else {
                        job.is_new = true;
                    }
                }
            }
        }

        let mut snapshot = FeedSnapshot {
            jobs,
            last_refresh_time: Some(now),
            new_jobs_count: 0,
            source_filter: inner.snapshot.source_filter,
            sort_by: inner.snapshot.sort_by,
        };
        snapshot.recount();
        let total_jobs = snapshot.jobs.len();
        self.publish(&mut inner, snapshot);
        let snapshot = inner.snapshot.clone();
        drop(inner);

        self.persist_snapshot(&snapshot, now).await;

        let finished_at = Utc::now();
        let summary = RefreshSummary {
            run_id,
            started_at,
            finished_at,
            api_jobs,
            email_jobs,
            new_jobs,
            total_jobs,
            failed_sources,
        };
        info!(
            %run_id,
            api_jobs = summary.api_jobs,
            email_jobs = summary.email_jobs,
            new_jobs = summary.new_jobs,
            total = summary.total_jobs,
            "feed refresh complete"
        );
        Ok(summary)
    }

    fn touch_seen(inner: &mut FeedInner, job_id: &str) {
        inner.seen.retain(|id| id != job_id);
        inner.seen.push_back(job_id.to_string());
        while inner.seen.len() > SEEN_IDS_CAP {
            inner.seen.pop_front();
        }
    }

    pub async fn mark_as_seen(&self, job_id: &str) {
        let mut inner = self.inner.lock().await;
        let mut snapshot = (*inner.snapshot).clone();
        let mut changed = false;
        for job in &mut snapshot.jobs {
            if job.id == job_id && (!job.is_seen || job.is_new) {
                *job = job.with_seen();
                changed = true;
            }
        }
        Self::touch_seen(&mut inner, job_id);
        if changed {
            snapshot.recount();
            self.publish(&mut inner, snapshot);
        }
        self.persist_seen(&inner).await;
    }

    pub async fn mark_all_seen(&self) {
        let mut inner = self.inner.lock().await;
        let mut snapshot = (*inner.snapshot).clone();
        let ids: Vec<String> = snapshot.jobs.iter().map(|job| job.id.clone()).collect();
        for job in &mut snapshot.jobs {
            if !job.is_seen || job.is_new {
                *job = job.with_seen();
            }
        }
        for id in &ids {
            Self::touch_seen(&mut inner, id);
        }
        snapshot.recount();
        self.publish(&mut inner, snapshot);
        self.persist_seen(&inner).await;
    }

    /// Pure view mutation; no re-fetch.
    pub async fn set_source_filter(&self, filter: SourceFilter) {
        let mut inner = self.inner.lock().await;
        let mut snapshot = (*inner.snapshot).clone();
        snapshot.source_filter = filter;
        self.publish(&mut inner, snapshot);
    }

    /// Pure view mutation; no re-fetch.
    pub async fn set_sort_by(&self, sort_by: SortBy) {
        let mut inner = self.inner.lock().await;
        let mut snapshot = (*inner.snapshot).clone();
        snapshot.sort_by = sort_by;
        self.publish(&mut inner, snapshot);
    }

    /// Patch one job's analysis fields by immutable replacement.
    pub async fn update_job_analysis(&self, job_id: &str, result: &jobfeed_core::AnalysisResult) {
        let at = Utc::now();
        let mut inner = self.inner.lock().await;
        let mut snapshot = (*inner.snapshot).clone();
        let mut changed = false;
        for job in &mut snapshot.jobs {
            if job.id == job_id {
                *job = job.with_analysis(result, at);
                changed = true;
            }
        }
        if changed {
            self.publish(&mut inner, snapshot);
            let snapshot = inner.snapshot.clone();
            drop(inner);
            self.persist_snapshot(&snapshot, at).await;
        }
    }

    pub async fn set_job_analyzing(&self, job_id: &str, analyzing: bool) {
        let mut inner = self.inner.lock().await;
        let mut snapshot = (*inner.snapshot).clone();
        let mut changed = false;
        for job in &mut snapshot.jobs {
            if job.id == job_id && job.analyzing != analyzing {
                *job = job.with_analyzing(analyzing);
                changed = true;
            }
        }
        if changed {
            self.publish(&mut inner, snapshot);
        }
    }

    /// Merge a realtime push notification without a full reload. Inserts
    /// prepend when absent; updates replace by primary id; a record whose
    /// status became `Expired` leaves the feed.
    pub async fn apply_push(&self, event: PushEvent) {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let mut snapshot = (*inner.snapshot).clone();

        match event {
            PushEvent::Inserted(job) => {
                if snapshot.jobs.iter().any(|existing| existing.id == job.id) {
                    return;
                }
                let mut job = job;
                if inner.seen.iter().any(|id| id == &job.id) {
                    job.is_seen = true;
                } else {
                    job.is_new = true;
                }
                snapshot.jobs.insert(0, job);
            }
            PushEvent::Updated(job) => {
                if job.status == JobStatus::Expired {
                    let before = snapshot.jobs.len();
                    snapshot.jobs.retain(|existing| existing.id != job.id);
                    if snapshot.jobs.len() == before {
                        return;
                    }
                    debug!(job_id = %job.id, "removed expired job from feed");
                } else {
                    match snapshot
                        .jobs
                        .iter_mut()
                        .find(|existing| existing.id == job.id)
                    {
                        Some(slot) => {
                            // Keep the candidate-facing feed flags across the
                            // backing-record replacement.
                            let mut job = job;
                            job.is_new = slot.is_new;
                            job.is_seen = slot.is_seen;
                            *slot = job;
                        }
                        None => {
                            let mut job = job;
                            job.is_new = true;
                            snapshot.jobs.insert(0, job);
                        }
                    }
                }
            }
        }

        snapshot.recount();
        self.publish(&mut inner, snapshot);
        let snapshot = inner.snapshot.clone();
        drop(inner);
        self.persist_snapshot(&snapshot, now).await;
    }

    /// Drop every job and the persisted snapshot. The seen set survives.
    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        let mut snapshot = (*inner.snapshot).clone();
        snapshot.jobs.clear();
        snapshot.recount();
        self.publish(&mut inner, snapshot);
        drop(inner);
        if let Err(err) = self.store.remove_blob(keys::FEED_SNAPSHOT).await {
            warn!(error = %err, "failed removing persisted snapshot");
        }
    }
}

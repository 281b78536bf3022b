//! Bounded-concurrency analysis queue: scores queued jobs against a résumé
//! in batches, read-through/write-through against the analysis cache.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use jobfeed_core::{score_payload, Resume};
use jobfeed_sources::MatchScorer;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::cache::AnalysisCache;
use crate::feed::FeedService;

/// Jobs scored concurrently within one batch; batches are strictly
/// sequential, so this bounds peak concurrent scoring calls.
pub const ANALYSIS_BATCH_SIZE: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnalysisProgress {
    pub is_processing: bool,
    pub total_jobs: usize,
    pub analyzed_count: usize,
    pub current_job_id: Option<String>,
    /// 0–100; defined as 0 while `total_jobs` is 0, and 100 once a run
    /// completes regardless of totals.
    pub progress: u8,
}

impl AnalysisProgress {
    fn idle() -> Self {
        Self {
            is_processing: false,
            total_jobs: 0,
            analyzed_count: 0,
            current_job_id: None,
            progress: 0,
        }
    }

    fn percent(analyzed: usize, total: usize) -> u8 {
        if total == 0 {
            0
        } else {
            ((analyzed as f64 / total as f64) * 100.0).round() as u8
        }
    }
}

/// Terminal per-job notifications; every id dequeued during a run produces
/// exactly one of the first two, and every run ends with `RunCompleted`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnalysisEvent {
    JobScored { job_id: String, match_score: u8 },
    JobFailed { job_id: String, error: String },
    RunCompleted { scored: usize, failed: usize },
}

pub struct AnalysisQueue {
    feed: Arc<FeedService>,
    cache: Arc<AnalysisCache>,
    scorer: Arc<dyn MatchScorer>,
    queued: Mutex<VecDeque<String>>,
    processing: AtomicBool,
    progress_tx: watch::Sender<AnalysisProgress>,
    events_tx: mpsc::UnboundedSender<AnalysisEvent>,
}

impl AnalysisQueue {
    pub fn new(
        feed: Arc<FeedService>,
        cache: Arc<AnalysisCache>,
        scorer: Arc<dyn MatchScorer>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<AnalysisEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (progress_tx, _) = watch::channel(AnalysisProgress::idle());
        let queue = Arc::new(Self {
            feed,
            cache,
            scorer,
            queued: Mutex::new(VecDeque::new()),
            processing: AtomicBool::new(false),
            progress_tx,
            events_tx,
        });
        (queue, events_rx)
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    pub fn progress(&self) -> AnalysisProgress {
        self.progress_tx.borrow().clone()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<AnalysisProgress> {
        self.progress_tx.subscribe()
    }

    /// Append ids not already queued and not already cache-valid for the
    /// active résumé. Returns how many were added.
    pub async fn enqueue(&self, job_ids: Vec<String>, resume: &Resume) -> usize {
        let now = Utc::now();
        let mut queued = self.queued.lock().await;
        let mut added = 0;
        for job_id in job_ids {
            if queued.contains(&job_id) {
                continue;
            }
            if self.cache.contains_valid(&job_id, &resume.id, now).await {
                continue;
            }
            queued.push_back(job_id);
            added += 1;
        }
        added
    }

    /// Drop ids not yet dequeued. Jobs already dispatched for scoring run
    /// to completion or failure.
    pub async fn clear_queue(&self) {
        self.queued.lock().await.clear();
    }

    fn send_progress(
        &self,
        is_processing: bool,
        total: usize,
        analyzed: usize,
        current_job_id: Option<String>,
    ) {
        self.progress_tx.send_replace(AnalysisProgress {
            is_processing,
            total_jobs: total,
            analyzed_count: analyzed,
            current_job_id,
            progress: AnalysisProgress::percent(analyzed, total),
        });
    }

    /// Process the queue until empty. Re-entrant calls while a run is in
    /// flight are no-ops; the processing flag clears on every exit path.
    pub async fn run(self: &Arc<Self>, resume: &Resume) {
        if self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("analysis run already in flight, skipping");
            return;
        }

        let mut analyzed = 0usize;
        let mut failed = 0usize;
        let mut total = self.queued.lock().await.len();
        self.send_progress(true, total, analyzed, None);

        loop {
            let batch: Vec<String> = {
                let mut queued = self.queued.lock().await;
                let take = queued.len().min(ANALYSIS_BATCH_SIZE);
                queued.drain(..take).collect()
            };
            if batch.is_empty() {
                break;
            }
            self.send_progress(true, total, analyzed, batch.first().cloned());

            let batch_len = batch.len();
            let mut pending: HashSet<String> = batch.iter().cloned().collect();
            let mut scorings = JoinSet::new();
            for job_id in batch {
                let this = Arc::clone(self);
                let resume = resume.clone();
                scorings.spawn(async move {
                    let outcome = this.score_one(&resume, &job_id).await;
                    (job_id, outcome)
                });
            }

            // Batch N+1 does not start until every scoring in batch N has
            // settled.
            while let Some(joined) = scorings.join_next().await {
                match joined {
                    Ok((job_id, Ok(match_score))) => {
                        pending.remove(&job_id);
                        let _ = self
                            .events_tx
                            .send(AnalysisEvent::JobScored { job_id, match_score });
                    }
                    Ok((job_id, Err(error))) => {
                        pending.remove(&job_id);
                        failed += 1;
                        let _ = self
                            .events_tx
                            .send(AnalysisEvent::JobFailed { job_id, error });
                    }
                    Err(err) => {
                        warn!(error = %err, "scoring task aborted");
                    }
                }
            }

            // A panicked scoring never reports its own result; the job still
            // gets exactly one terminal notification.
            for job_id in pending {
                self.feed.set_job_analyzing(&job_id, false).await;
                failed += 1;
                let _ = self.events_tx.send(AnalysisEvent::JobFailed {
                    job_id,
                    error: "scoring task aborted".to_string(),
                });
            }

            analyzed += batch_len;
            total = analyzed + self.queued.lock().await.len();
            self.send_progress(true, total, analyzed, None);
        }

        self.processing.store(false, Ordering::SeqCst);
        self.progress_tx.send_replace(AnalysisProgress {
            is_processing: false,
            total_jobs: total,
            analyzed_count: analyzed,
            current_job_id: None,
            progress: 100,
        });
        let _ = self.events_tx.send(AnalysisEvent::RunCompleted {
            scored: analyzed - failed,
            failed,
        });
    }

    async fn score_one(&self, resume: &Resume, job_id: &str) -> Result<u8, String> {
        let now = Utc::now();
        if let Some(result) = self.cache.get_at(job_id, &resume.id, now).await {
            self.feed.update_job_analysis(job_id, &result).await;
            return Ok(result.match_score);
        }

        let snapshot = self.feed.snapshot();
        let Some(job) = snapshot.jobs.iter().find(|job| job.id == job_id) else {
            return Err("job no longer present in feed".to_string());
        };

        self.feed.set_job_analyzing(job_id, true).await;
        let payload = score_payload(job);
        match self.scorer.score(resume, &payload).await {
            Ok(result) => {
                self.cache.put(job_id, &resume.id, result.clone()).await;
                self.feed.update_job_analysis(job_id, &result).await;
                Ok(result.match_score)
            }
            Err(err) => {
                // Clear the in-flight marker; the job stays unanalyzed and
                // eligible for a future manual enqueue.
                self.feed.set_job_analyzing(job_id, false).await;
                Err(err.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RefreshConfig, SearchPreferences};
    use async_trait::async_trait;
    use jobfeed_core::{AnalysisResult, RawApiJob, ScorePayload};
    use jobfeed_sources::{FailingScorer, JobSearchApi, ScoreError, StaticApiSource};
    use jobfeed_store::MemoryStore;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    fn result(score: u8) -> AnalysisResult {
        AnalysisResult {
            match_score: score,
            matching_skills: vec!["Rust".to_string()],
            missing_skills: vec![],
            recommendations: vec![],
        }
    }

    fn resume() -> Resume {
        Resume {
            id: "resume-1".to_string(),
            text: "Rust, Postgres, Kafka".to_string(),
        }
    }

    struct CountingScorer {
        calls: Arc<AtomicUsize>,
        score: u8,
    }

    #[async_trait]
    impl MatchScorer for CountingScorer {
        async fn score(
            &self,
            _resume: &Resume,
            _payload: &ScorePayload,
        ) -> Result<AnalysisResult, ScoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(result(self.score))
        }
    }

    struct PanickingScorer;

    #[async_trait]
    impl MatchScorer for PanickingScorer {
        async fn score(
            &self,
            _resume: &Resume,
            _payload: &ScorePayload,
        ) -> Result<AnalysisResult, ScoreError> {
            panic!("scorer crashed");
        }
    }

    struct GatedScorer {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl MatchScorer for GatedScorer {
        async fn score(
            &self,
            _resume: &Resume,
            _payload: &ScorePayload,
        ) -> Result<AnalysisResult, ScoreError> {
            self.gate.notified().await;
            Ok(result(10))
        }
    }

    async fn feed_with_jobs(count: usize) -> Arc<FeedService> {
        let feed = FeedService::restore(Arc::new(MemoryStore::new())).await;
        let jobs: Vec<RawApiJob> = (0..count)
            .map(|i| RawApiJob {
                external_id: i.to_string(),
                title: format!("Role {i}"),
                company: "Initech".to_string(),
                location: "Austin, TX".to_string(),
                ..Default::default()
            })
            .collect();
        let apis: Vec<Arc<dyn JobSearchApi>> =
            vec![Arc::new(StaticApiSource::new("boardlink", jobs))];
        feed.refresh(
            &SearchPreferences::default(),
            &RefreshConfig::default(),
            &apis,
            None,
        )
        .await
        .expect("refresh")
        .expect("not skipped");
        feed
    }

    fn job_ids(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("api-boardlink-{i}")).collect()
    }

    #[tokio::test]
    async fn every_dequeued_id_gets_exactly_one_terminal_event() {
        let feed = feed_with_jobs(5).await;
        let cache = AnalysisCache::restore(Arc::new(MemoryStore::new())).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let scorer = Arc::new(CountingScorer {
            calls: calls.clone(),
            score: 70,
        });
        let (queue, mut events) = AnalysisQueue::new(feed.clone(), cache, scorer);

        assert_eq!(queue.enqueue(job_ids(5), &resume()).await, 5);
        // Duplicate enqueue is a no-op.
        assert_eq!(queue.enqueue(job_ids(5), &resume()).await, 0);
        queue.run(&resume()).await;

        let mut terminal = 0;
        loop {
            match events.try_recv().expect("event stream intact") {
                AnalysisEvent::JobScored { .. } | AnalysisEvent::JobFailed { .. } => terminal += 1,
                AnalysisEvent::RunCompleted { scored, failed } => {
                    assert_eq!(scored, 5);
                    assert_eq!(failed, 0);
                    break;
                }
            }
        }
        assert_eq!(terminal, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(feed.snapshot().jobs.iter().all(|j| j.analyzed));
    }

    #[tokio::test]
    async fn progress_reaches_100_and_counts_match() {
        let feed = feed_with_jobs(5).await;
        let cache = AnalysisCache::restore(Arc::new(MemoryStore::new())).await;
        let scorer = Arc::new(CountingScorer {
            calls: Arc::new(AtomicUsize::new(0)),
            score: 70,
        });
        let (queue, _events) = AnalysisQueue::new(feed, cache, scorer);

        queue.enqueue(job_ids(5), &resume()).await;
        queue.run(&resume()).await;

        let progress = queue.progress();
        assert!(!progress.is_processing);
        assert_eq!(progress.total_jobs, 5);
        assert_eq!(progress.analyzed_count, 5);
        assert_eq!(progress.progress, 100);
    }

    #[tokio::test]
    async fn empty_run_still_completes_at_100() {
        let feed = feed_with_jobs(0).await;
        let cache = AnalysisCache::restore(Arc::new(MemoryStore::new())).await;
        let scorer = Arc::new(CountingScorer {
            calls: Arc::new(AtomicUsize::new(0)),
            score: 70,
        });
        let (queue, _events) = AnalysisQueue::new(feed, cache, scorer);

        queue.run(&resume()).await;

        let progress = queue.progress();
        assert_eq!(progress.total_jobs, 0);
        assert_eq!(progress.progress, 100);
        assert!(!progress.is_processing);
    }

    #[tokio::test]
    async fn cache_hit_patches_feed_without_calling_scorer() {
        let feed = feed_with_jobs(1).await;
        let cache = AnalysisCache::restore(Arc::new(MemoryStore::new())).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let scorer = Arc::new(CountingScorer {
            calls: calls.clone(),
            score: 70,
        });
        let (queue, mut events) = AnalysisQueue::new(feed.clone(), cache.clone(), scorer);

        queue.enqueue(job_ids(1), &resume()).await;
        // Cached after enqueue but before the run; the run must hit it.
        cache.put("api-boardlink-0", "resume-1", result(88)).await;
        queue.run(&resume()).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(matches!(
            events.try_recv().expect("scored event"),
            AnalysisEvent::JobScored { match_score: 88, .. }
        ));
        let snapshot = feed.snapshot();
        assert_eq!(snapshot.jobs[0].match_score, Some(88));
        assert!(snapshot.jobs[0].analyzed);
    }

    #[tokio::test]
    async fn cached_ids_are_not_enqueued() {
        let feed = feed_with_jobs(2).await;
        let cache = AnalysisCache::restore(Arc::new(MemoryStore::new())).await;
        cache.put("api-boardlink-0", "resume-1", result(88)).await;
        let scorer = Arc::new(CountingScorer {
            calls: Arc::new(AtomicUsize::new(0)),
            score: 70,
        });
        let (queue, _events) = AnalysisQueue::new(feed, cache, scorer);

        assert_eq!(queue.enqueue(job_ids(2), &resume()).await, 1);
    }

    #[tokio::test]
    async fn scoring_failure_clears_analyzing_and_allows_reenqueue() {
        let feed = feed_with_jobs(1).await;
        let cache = AnalysisCache::restore(Arc::new(MemoryStore::new())).await;
        let (queue, mut events) =
            AnalysisQueue::new(feed.clone(), cache, Arc::new(FailingScorer));

        queue.enqueue(job_ids(1), &resume()).await;
        queue.run(&resume()).await;

        let job = feed.snapshot().jobs[0].clone();
        assert!(!job.analyzing);
        assert!(!job.analyzed);
        assert!(job.match_score.is_none());

        assert!(matches!(
            events.try_recv().expect("failed event"),
            AnalysisEvent::JobFailed { .. }
        ));
        assert!(matches!(
            events.try_recv().expect("completion event"),
            AnalysisEvent::RunCompleted { scored: 0, failed: 1 }
        ));

        // No automatic retry; a manual enqueue is still possible.
        assert_eq!(queue.enqueue(job_ids(1), &resume()).await, 1);
    }

    #[tokio::test]
    async fn panicked_scoring_still_gets_a_terminal_event() {
        let feed = feed_with_jobs(1).await;
        let cache = AnalysisCache::restore(Arc::new(MemoryStore::new())).await;
        let (queue, mut events) =
            AnalysisQueue::new(feed.clone(), cache, Arc::new(PanickingScorer));

        queue.enqueue(job_ids(1), &resume()).await;
        queue.run(&resume()).await;

        match events.try_recv().expect("failure event") {
            AnalysisEvent::JobFailed { job_id, .. } => assert_eq!(job_id, "api-boardlink-0"),
            other => panic!("expected JobFailed, got {other:?}"),
        }
        assert!(matches!(
            events.try_recv().expect("completion event"),
            AnalysisEvent::RunCompleted { scored: 0, failed: 1 }
        ));
        assert!(!feed.snapshot().jobs[0].analyzing);
        assert_eq!(queue.progress().progress, 100);
    }

    #[tokio::test]
    async fn run_is_single_flight() {
        let feed = feed_with_jobs(1).await;
        let cache = AnalysisCache::restore(Arc::new(MemoryStore::new())).await;
        let gate = Arc::new(Notify::new());
        let scorer = Arc::new(GatedScorer { gate: gate.clone() });
        let (queue, _events) = AnalysisQueue::new(feed, cache, scorer);

        queue.enqueue(job_ids(1), &resume()).await;
        let runner = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.run(&resume()).await })
        };

        // Let the run reach the gated scorer.
        while !queue.is_processing() {
            tokio::task::yield_now().await;
        }

        // Re-entrant run returns immediately as a no-op.
        queue.run(&resume()).await;
        assert!(queue.is_processing());

        gate.notify_one();
        runner.await.expect("runner joins");
        assert!(!queue.is_processing());
        assert_eq!(queue.progress().progress, 100);
    }

    #[tokio::test]
    async fn clear_queue_drops_only_pending_ids() {
        let feed = feed_with_jobs(3).await;
        let cache = AnalysisCache::restore(Arc::new(MemoryStore::new())).await;
        let scorer = Arc::new(CountingScorer {
            calls: Arc::new(AtomicUsize::new(0)),
            score: 70,
        });
        let (queue, _events) = AnalysisQueue::new(feed, cache, scorer);

        queue.enqueue(job_ids(3), &resume()).await;
        queue.clear_queue().await;
        queue.run(&resume()).await;

        let progress = queue.progress();
        assert_eq!(progress.total_jobs, 0);
        assert_eq!(progress.progress, 100);
    }
}

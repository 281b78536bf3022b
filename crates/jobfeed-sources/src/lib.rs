//! Boundary contracts for job sources and the match scorer, plus the YAML
//! source registry and fixture-file-backed implementations used by tests and
//! the CLI.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use jobfeed_core::{AnalysisResult, RawApiJob, RawVendorJob, Resume, ScorePayload};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "jobfeed-sources";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum ScoreError {
    #[error("scoring failed: {0}")]
    Failed(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One job-search API. Implementations own their network client; the
/// pipeline only sees raw records.
#[async_trait]
pub trait JobSearchApi: Send + Sync {
    fn platform(&self) -> &str;

    async fn search_jobs(
        &self,
        query: &str,
        location: &str,
        work_type: Option<&str>,
        max_results: usize,
    ) -> Result<Vec<RawApiJob>, SourceError>;
}

/// The parsed vendor/recruiter email channel.
#[async_trait]
pub trait VendorJobSource: Send + Sync {
    /// Best-effort ingest of newly arrived emails. A failure here must not
    /// prevent retrieval of previously parsed jobs.
    async fn sync_incoming(&self, max_items: usize) -> Result<usize, SourceError>;

    async fn vendor_jobs(&self, limit: usize) -> Result<Vec<RawVendorJob>, SourceError>;
}

/// External résumé-vs-job scoring capability. Invoked at most once per
/// (job, résumé) pair per cache miss; failures are per-job events.
#[async_trait]
pub trait MatchScorer: Send + Sync {
    async fn score(
        &self,
        resume: &Resume,
        payload: &ScorePayload,
    ) -> Result<AnalysisResult, ScoreError>;
}

// ---------------------------------------------------------------------------
// Source registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Api,
    Email,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub platform: String,
    pub display_name: String,
    pub enabled: bool,
    pub kind: SourceKind,
    #[serde(default)]
    pub fixture_path: Option<PathBuf>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

impl SourceRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

// ---------------------------------------------------------------------------
// Fixture-backed sources
// ---------------------------------------------------------------------------

/// Search API backed by a JSON fixture file of raw records.
#[derive(Debug, Clone)]
pub struct FixtureApiSource {
    platform: String,
    path: PathBuf,
}

impl FixtureApiSource {
    pub fn new(platform: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            platform: platform.into(),
            path: path.into(),
        }
    }
}

#[async_trait]
impl JobSearchApi for FixtureApiSource {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn search_jobs(
        &self,
        query: &str,
        _location: &str,
        _work_type: Option<&str>,
        max_results: usize,
    ) -> Result<Vec<RawApiJob>, SourceError> {
        let mut jobs: Vec<RawApiJob> = read_json_file(&self.path)?;
        if !query.is_empty() {
            let needle = query.to_ascii_lowercase();
            jobs.retain(|job| {
                job.title.to_ascii_lowercase().contains(&needle)
                    || job
                        .description
                        .as_deref()
                        .unwrap_or_default()
                        .to_ascii_lowercase()
                        .contains(&needle)
            });
        }
        jobs.truncate(max_results);
        Ok(jobs)
    }
}

/// Vendor email channel backed by a JSON fixture of already-parsed jobs.
#[derive(Debug, Clone)]
pub struct FixtureVendorSource {
    path: PathBuf,
}

impl FixtureVendorSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl VendorJobSource for FixtureVendorSource {
    async fn sync_incoming(&self, _max_items: usize) -> Result<usize, SourceError> {
        // Fixtures have no inbox to drain.
        Ok(0)
    }

    async fn vendor_jobs(&self, limit: usize) -> Result<Vec<RawVendorJob>, SourceError> {
        let mut jobs: Vec<RawVendorJob> = read_json_file(&self.path)?;
        jobs.truncate(limit);
        Ok(jobs)
    }
}

// ---------------------------------------------------------------------------
// In-memory sources (tests and composition roots)
// ---------------------------------------------------------------------------

/// Search API returning a fixed record set.
#[derive(Debug, Clone)]
pub struct StaticApiSource {
    platform: String,
    jobs: Vec<RawApiJob>,
}

impl StaticApiSource {
    pub fn new(platform: impl Into<String>, jobs: Vec<RawApiJob>) -> Self {
        Self {
            platform: platform.into(),
            jobs,
        }
    }
}

#[async_trait]
impl JobSearchApi for StaticApiSource {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn search_jobs(
        &self,
        _query: &str,
        _location: &str,
        _work_type: Option<&str>,
        max_results: usize,
    ) -> Result<Vec<RawApiJob>, SourceError> {
        let mut jobs = self.jobs.clone();
        jobs.truncate(max_results);
        Ok(jobs)
    }
}

/// Vendor source returning a fixed record set.
#[derive(Debug, Clone, Default)]
pub struct StaticVendorSource {
    jobs: Vec<RawVendorJob>,
}

impl StaticVendorSource {
    pub fn new(jobs: Vec<RawVendorJob>) -> Self {
        Self { jobs }
    }
}

#[async_trait]
impl VendorJobSource for StaticVendorSource {
    async fn sync_incoming(&self, _max_items: usize) -> Result<usize, SourceError> {
        Ok(0)
    }

    async fn vendor_jobs(&self, limit: usize) -> Result<Vec<RawVendorJob>, SourceError> {
        let mut jobs = self.jobs.clone();
        jobs.truncate(limit);
        Ok(jobs)
    }
}

/// Source that always errors, for exercising per-source failure isolation.
#[derive(Debug, Clone, Default)]
pub struct FailingSource {
    platform: String,
}

impl FailingSource {
    pub fn new(platform: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
        }
    }
}

#[async_trait]
impl JobSearchApi for FailingSource {
    fn platform(&self) -> &str {
        &self.platform
    }

    async fn search_jobs(
        &self,
        _query: &str,
        _location: &str,
        _work_type: Option<&str>,
        _max_results: usize,
    ) -> Result<Vec<RawApiJob>, SourceError> {
        Err(SourceError::Message(format!(
            "{} is unreachable",
            self.platform
        )))
    }
}

#[async_trait]
impl VendorJobSource for FailingSource {
    async fn sync_incoming(&self, _max_items: usize) -> Result<usize, SourceError> {
        Err(SourceError::Message("inbox sync unavailable".to_string()))
    }

    async fn vendor_jobs(&self, _limit: usize) -> Result<Vec<RawVendorJob>, SourceError> {
        Err(SourceError::Message("vendor store unavailable".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Keyword scorer
// ---------------------------------------------------------------------------

/// Deterministic scorer: the match score is the share of payload skills that
/// appear verbatim (case-insensitively) in the résumé text.
#[derive(Debug, Clone, Default)]
pub struct KeywordScorer;

#[async_trait]
impl MatchScorer for KeywordScorer {
    async fn score(
        &self,
        resume: &Resume,
        payload: &ScorePayload,
    ) -> Result<AnalysisResult, ScoreError> {
        let haystack = resume.text.to_ascii_lowercase();
        let mut matching = Vec::new();
        let mut missing = Vec::new();
        for skill in &payload.skills {
            if haystack.contains(&skill.to_ascii_lowercase()) {
                matching.push(skill.clone());
            } else {
                missing.push(skill.clone());
            }
        }

        let match_score = if payload.skills.is_empty() {
            0
        } else {
            ((matching.len() as f64 / payload.skills.len() as f64) * 100.0).round() as u8
        };

        let recommendations = missing
            .iter()
            .take(3)
            .map(|skill| format!("Highlight any experience with {skill}"))
            .collect();

        Ok(AnalysisResult {
            match_score,
            matching_skills: matching,
            missing_skills: missing,
            recommendations,
        })
    }
}

/// Scorer that always fails, for exercising per-job failure events.
#[derive(Debug, Clone, Default)]
pub struct FailingScorer;

#[async_trait]
impl MatchScorer for FailingScorer {
    async fn score(
        &self,
        _resume: &Resume,
        _payload: &ScorePayload,
    ) -> Result<AnalysisResult, ScoreError> {
        Err(ScoreError::Failed("scorer offline".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_fixture(dir: &Path, name: &str, json: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, json).expect("write fixture");
        path
    }

    #[tokio::test]
    async fn fixture_api_source_filters_and_truncates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_fixture(
            dir.path(),
            "boardlink.json",
            r#"[
              {"external_id": "1", "title": "Rust Engineer"},
              {"external_id": "2", "title": "Rust Platform Lead"},
              {"external_id": "3", "title": "Accountant"}
            ]"#,
        );

        let source = FixtureApiSource::new("boardlink", path);
        let hits = source
            .search_jobs("rust", "Austin, TX", None, 1)
            .await
            .expect("search");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].external_id, "1");
    }

    #[tokio::test]
    async fn fixture_vendor_source_returns_parsed_jobs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_fixture(
            dir.path(),
            "vendor.json",
            r#"[
              {"internal_id": "7", "title": "Data Analyst", "recruiter_name": "Sam Ortiz"}
            ]"#,
        );

        let source = FixtureVendorSource::new(path);
        assert_eq!(source.sync_incoming(10).await.expect("sync"), 0);
        let jobs = source.vendor_jobs(50).await.expect("vendor jobs");
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].recruiter_name.as_deref(), Some("Sam Ortiz"));
    }

    #[tokio::test]
    async fn missing_fixture_surfaces_as_source_error() {
        let source = FixtureApiSource::new("boardlink", "/nonexistent/boardlink.json");
        let err = source.search_jobs("", "", None, 10).await.unwrap_err();
        assert!(matches!(err, SourceError::Other(_)));
    }

    #[test]
    fn registry_parses_and_filters_enabled() {
        let yaml = r#"
sources:
  - platform: boardlink
    display_name: BoardLink Search
    enabled: true
    kind: api
    fixture_path: fixtures/boardlink.json
  - platform: reachout
    display_name: ReachOut Search
    enabled: false
    kind: api
  - platform: email
    display_name: Vendor Inbox
    enabled: true
    kind: email
"#;
        let registry: SourceRegistry = serde_yaml::from_str(yaml).expect("parse registry");
        let enabled: Vec<_> = registry.enabled().map(|s| s.platform.as_str()).collect();
        assert_eq!(enabled, vec!["boardlink", "email"]);
    }

    #[tokio::test]
    async fn keyword_scorer_is_deterministic_and_bounded() {
        let resume = Resume {
            id: "resume-1".to_string(),
            text: "Ten years of Rust and Postgres, some Kafka.".to_string(),
        };
        let payload = ScorePayload {
            job_id: "api-boardlink-1".to_string(),
            title: "Rust Engineer".to_string(),
            company: "Initech".to_string(),
            skills: vec![
                "Rust".to_string(),
                "Postgres".to_string(),
                "Kubernetes".to_string(),
                "Terraform".to_string(),
            ],
        };

        let scorer = KeywordScorer;
        let first = scorer.score(&resume, &payload).await.expect("score");
        let second = scorer.score(&resume, &payload).await.expect("score");
        assert_eq!(first, second);
        assert_eq!(first.match_score, 50);
        assert_eq!(first.matching_skills, vec!["Rust", "Postgres"]);
        assert_eq!(first.missing_skills.len(), 2);
        assert!(!first.recommendations.is_empty());
    }

    #[tokio::test]
    async fn empty_payload_scores_zero() {
        let resume = Resume {
            id: "resume-1".to_string(),
            text: "anything".to_string(),
        };
        let payload = ScorePayload {
            job_id: "email-1".to_string(),
            title: "Mystery Role".to_string(),
            company: "".to_string(),
            skills: Vec::new(),
        };
        let result = KeywordScorer.score(&resume, &payload).await.expect("score");
        assert_eq!(result.match_score, 0);
    }
}

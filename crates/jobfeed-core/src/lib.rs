//! Core domain model for the unified job feed: the canonical [`Job`] entity,
//! raw source handoff records, the normalizer, and the dedup/merge engine.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "jobfeed-core";

/// Coarse origin category of a job record, distinct from the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Api,
    Email,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkArrangement {
    Remote,
    Hybrid,
    Onsite,
    #[default]
    Unknown,
}

/// Lifecycle status of the backing record, pushed by the realtime channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Active,
    Filled,
    Expired,
    #[default]
    Unknown,
}

/// Recruiter/vendor metadata carried only by email-sourced jobs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VendorDetails {
    pub recruiter_name: Option<String>,
    pub recruiter_email: Option<String>,
    pub recruiter_phone: Option<String>,
    pub vendor_company: Option<String>,
    pub client_company: Option<String>,
    pub email_subject: Option<String>,
    pub email_received_at: Option<DateTime<Utc>>,
}

/// Canonical job posting, merged across sources. Exactly one instance per
/// dedup key may exist within a feed snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub source_type: SourceType,
    pub source_platform: String,
    pub title: String,
    pub company: String,
    pub location: String,
    #[serde(default)]
    pub description: String,
    pub url: Option<String>,
    pub posted_date: Option<DateTime<Utc>>,
    pub discovered_at: DateTime<Utc>,
    pub salary_min: Option<f64>,
    pub salary_max: Option<f64>,
    pub salary_text: Option<String>,
    pub pay_rate_type: Option<String>,
    pub employment_type: Option<String>,
    #[serde(default)]
    pub work_arrangement: WorkArrangement,
    pub duration: Option<String>,
    #[serde(default)]
    pub required_skills: Vec<String>,
    /// Tech stack entries keyed by category (e.g. "languages", "cloud").
    #[serde(default)]
    pub tech_stack: BTreeMap<String, Vec<String>>,
    pub years_experience: Option<String>,
    #[serde(default)]
    pub certifications: Vec<String>,
    pub match_score: Option<u8>,
    #[serde(default)]
    pub matching_skills: Vec<String>,
    #[serde(default)]
    pub missing_skills: Vec<String>,
    #[serde(default)]
    pub analyzed: bool,
    #[serde(default)]
    pub analyzing: bool,
    pub analysis_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_new: bool,
    #[serde(default)]
    pub is_seen: bool,
    #[serde(default)]
    pub status: JobStatus,
    pub vendor: Option<VendorDetails>,
}

impl Job {
    /// Copy-on-write replacement applying a scoring result. Only the
    /// analysis fields change.
    pub fn with_analysis(&self, result: &AnalysisResult, at: DateTime<Utc>) -> Job {
        let mut job = self.clone();
        job.match_score = Some(result.match_score);
        job.matching_skills = result.matching_skills.clone();
        job.missing_skills = result.missing_skills.clone();
        job.analyzed = true;
        job.analyzing = false;
        job.analysis_timestamp = Some(at);
        job
    }

    pub fn with_analyzing(&self, analyzing: bool) -> Job {
        let mut job = self.clone();
        job.analyzing = analyzing;
        job
    }

    pub fn with_seen(&self) -> Job {
        let mut job = self.clone();
        job.is_new = false;
        job.is_seen = true;
        job
    }

    /// `posted_date` with missing/unparseable dates pinned to the oldest
    /// representable instant, so recency comparisons stay total.
    pub fn posted_or_epoch(&self) -> DateTime<Utc> {
        self.posted_date.unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Best available compensation figure for the salary sort.
    pub fn salary_ceiling(&self) -> f64 {
        self.salary_max
            .unwrap_or(0.0)
            .max(self.salary_min.unwrap_or(0.0))
            .max(0.0)
    }
}

/// Scoring result returned by the external match scorer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub match_score: u8,
    pub matching_skills: Vec<String>,
    pub missing_skills: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

/// Candidate résumé handed to the scorer. The text is already extracted;
/// extraction itself is an external concern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resume {
    pub id: String,
    pub text: String,
}

// ---------------------------------------------------------------------------
// Raw source records (adapter handoff contracts)
// ---------------------------------------------------------------------------

/// Search-API hit before normalization.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawApiJob {
    pub external_id: String,
    pub title: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub location: String,
    pub description: Option<String>,
    pub url: Option<String>,
    pub posted_date: Option<DateTime<Utc>>,
    pub salary_min: Option<f64>,
    pub salary_max: Option<f64>,
    pub salary_text: Option<String>,
    pub employment_type: Option<String>,
    pub work_type: Option<String>,
    #[serde(default)]
    pub required_skills: Vec<String>,
}

/// Parsed vendor/recruiter email job before normalization.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawVendorJob {
    pub internal_id: String,
    pub title: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub location: String,
    pub description: Option<String>,
    pub url: Option<String>,
    pub posted_date: Option<DateTime<Utc>>,
    pub rate_min: Option<f64>,
    pub rate_max: Option<f64>,
    pub rate_text: Option<String>,
    pub pay_rate_type: Option<String>,
    pub employment_type: Option<String>,
    pub work_arrangement_text: Option<String>,
    pub duration: Option<String>,
    #[serde(default)]
    pub required_skills: Vec<String>,
    #[serde(default)]
    pub tech_stack: BTreeMap<String, Vec<String>>,
    pub years_experience: Option<String>,
    #[serde(default)]
    pub certifications: Vec<String>,
    pub recruiter_name: Option<String>,
    pub recruiter_email: Option<String>,
    pub recruiter_phone: Option<String>,
    pub vendor_company: Option<String>,
    pub client_company: Option<String>,
    pub email_subject: Option<String>,
    pub email_received_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: JobStatus,
}

// ---------------------------------------------------------------------------
// Normalizer
// ---------------------------------------------------------------------------

/// Infer the work arrangement from free text by case-insensitive substring
/// match, defaulting to [`WorkArrangement::Unknown`].
pub fn infer_work_arrangement(text: &str) -> WorkArrangement {
    let haystack = text.to_ascii_lowercase();
    if haystack.contains("remote") {
        WorkArrangement::Remote
    } else if haystack.contains("hybrid") {
        WorkArrangement::Hybrid
    } else if haystack.contains("onsite")
        || haystack.contains("on-site")
        || haystack.contains("office")
    {
        WorkArrangement::Onsite
    } else {
        WorkArrangement::Unknown
    }
}

/// Normalize an API search hit into a canonical [`Job`]. Pure; the id is
/// namespaced as `api-{platform}-{external_id}`.
pub fn normalize_api_job(raw: RawApiJob, platform: &str, discovered_at: DateTime<Utc>) -> Job {
    let arrangement_hint = format!(
        "{} {} {}",
        raw.work_type.as_deref().unwrap_or_default(),
        raw.location,
        raw.description.as_deref().unwrap_or_default()
    );
    Job {
        id: format!("api-{}-{}", platform, raw.external_id),
        source_type: SourceType::Api,
        source_platform: platform.to_string(),
        title: raw.title,
        company: raw.company,
        location: raw.location,
        description: raw.description.unwrap_or_default(),
        url: raw.url,
        posted_date: raw.posted_date,
        discovered_at,
        salary_min: raw.salary_min,
        salary_max: raw.salary_max,
        salary_text: raw.salary_text,
        pay_rate_type: None,
        employment_type: raw.employment_type,
        work_arrangement: infer_work_arrangement(&arrangement_hint),
        duration: None,
        required_skills: raw.required_skills,
        tech_stack: BTreeMap::new(),
        years_experience: None,
        certifications: Vec::new(),
        match_score: None,
        matching_skills: Vec::new(),
        missing_skills: Vec::new(),
        analyzed: false,
        analyzing: false,
        analysis_timestamp: None,
        is_new: false,
        is_seen: false,
        status: JobStatus::Active,
        vendor: None,
    }
}

/// Normalize a parsed vendor-email job into a canonical [`Job`] with id
/// `email-{internal_id}`.
pub fn normalize_vendor_job(raw: RawVendorJob, discovered_at: DateTime<Utc>) -> Job {
    let arrangement_hint = format!(
        "{} {} {}",
        raw.work_arrangement_text.as_deref().unwrap_or_default(),
        raw.location,
        raw.description.as_deref().unwrap_or_default()
    );
    Job {
        id: format!("email-{}", raw.internal_id),
        source_type: SourceType::Email,
        source_platform: "email".to_string(),
        title: raw.title,
        company: raw.company,
        location: raw.location,
        description: raw.description.unwrap_or_default(),
        url: raw.url,
        posted_date: raw.posted_date.or(raw.email_received_at),
        discovered_at,
        salary_min: raw.rate_min,
        salary_max: raw.rate_max,
        salary_text: raw.rate_text,
        pay_rate_type: raw.pay_rate_type,
        employment_type: raw.employment_type,
        work_arrangement: infer_work_arrangement(&arrangement_hint),
        duration: raw.duration,
        required_skills: raw.required_skills,
        tech_stack: raw.tech_stack,
        years_experience: raw.years_experience,
        certifications: raw.certifications,
        match_score: None,
        matching_skills: Vec::new(),
        missing_skills: Vec::new(),
        analyzed: false,
        analyzing: false,
        analysis_timestamp: None,
        is_new: false,
        is_seen: false,
        status: raw.status,
        vendor: Some(VendorDetails {
            recruiter_name: raw.recruiter_name,
            recruiter_email: raw.recruiter_email,
            recruiter_phone: raw.recruiter_phone,
            vendor_company: raw.vendor_company,
            client_company: raw.client_company,
            email_subject: raw.email_subject,
            email_received_at: raw.email_received_at,
        }),
    }
}

// ---------------------------------------------------------------------------
// Dedup/Merge engine
// ---------------------------------------------------------------------------

/// Lowercase, strip non-alphanumerics, collapse whitespace.
pub fn normalize_key_fragment(input: &str) -> String {
    input
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Composite `title|company|location` key identifying "the same posting"
/// across sources.
pub fn dedup_key(job: &Job) -> String {
    format!(
        "{}|{}|{}",
        normalize_key_fragment(&job.title),
        normalize_key_fragment(&job.company),
        normalize_key_fragment(&job.location)
    )
}

fn incoming_wins(existing: &Job, incoming: &Job) -> bool {
    match (existing.source_type, incoming.source_type) {
        // Vendor email data is the more authoritative record.
        (SourceType::Api, SourceType::Email) => true,
        (SourceType::Email, SourceType::Api) => false,
        _ => incoming.posted_or_epoch() > existing.posted_or_epoch(),
    }
}

/// Collapse a job list to at most one [`Job`] per dedup key.
///
/// Collisions resolve pairwise in arrival order: an incoming email job beats
/// an existing API job outright, same-source collisions keep the newer
/// `posted_date`, and an API job never displaces an email job. The policy is
/// deterministic and idempotent over any multiset, and the winner keeps the
/// first-arrival slot for its key.
pub fn merge_jobs(jobs: Vec<Job>) -> Vec<Job> {
    let mut merged: Vec<Job> = Vec::with_capacity(jobs.len());
    let mut slots: HashMap<String, usize> = HashMap::with_capacity(jobs.len());

    for job in jobs {
        let key = dedup_key(&job);
        match slots.get(&key) {
            None => {
                slots.insert(key, merged.len());
                merged.push(job);
            }
            Some(&slot) => {
                if incoming_wins(&merged[slot], &job) {
                    merged[slot] = job;
                }
            }
        }
    }

    merged
}

// ---------------------------------------------------------------------------
// Feed view: filter + sort
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFilter {
    #[default]
    All,
    Api,
    Email,
}

impl SourceFilter {
    pub fn admits(&self, job: &Job) -> bool {
        match self {
            SourceFilter::All => true,
            SourceFilter::Api => job.source_type == SourceType::Api,
            SourceFilter::Email => job.source_type == SourceType::Email,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortBy {
    #[default]
    Date,
    Match,
    Salary,
}

/// Sort jobs in place by the requested total order. Every order breaks ties
/// by descending `posted_date`, with missing dates oldest and missing match
/// scores below any real score.
pub fn sort_jobs(jobs: &mut [Job], sort_by: SortBy) {
    match sort_by {
        SortBy::Date => jobs.sort_by(|a, b| b.posted_or_epoch().cmp(&a.posted_or_epoch())),
        SortBy::Match => jobs.sort_by(|a, b| {
            let score_a = a.match_score.map(i32::from).unwrap_or(-1);
            let score_b = b.match_score.map(i32::from).unwrap_or(-1);
            score_b
                .cmp(&score_a)
                .then_with(|| b.posted_or_epoch().cmp(&a.posted_or_epoch()))
        }),
        SortBy::Salary => jobs.sort_by(|a, b| {
            b.salary_ceiling()
                .total_cmp(&a.salary_ceiling())
                .then_with(|| b.posted_or_epoch().cmp(&a.posted_or_epoch()))
        }),
    }
}

// ---------------------------------------------------------------------------
// Scoring payload
// ---------------------------------------------------------------------------

/// Cap on distinguishing skill tokens sent to the scorer.
pub const MAX_PAYLOAD_SKILLS: usize = 10;

/// Free-text terms worth surfacing to the scorer when a description
/// mentions them but no structured skill field does.
const DESCRIPTION_KEYWORDS: &[&str] = &[
    "rust",
    "python",
    "java",
    "javascript",
    "typescript",
    "react",
    "node",
    "go",
    "kubernetes",
    "docker",
    "aws",
    "azure",
    "gcp",
    "terraform",
    "sql",
    "postgres",
    "kafka",
    "graphql",
    "machine learning",
    "devops",
];

/// Request payload handed to the external match scorer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScorePayload {
    pub job_id: String,
    pub title: String,
    pub company: String,
    pub skills: Vec<String>,
}

/// Extract the distinguishing skill tokens for a job: explicit required
/// skills, then tech-stack entries, then keyword hits from the description,
/// deduplicated case-insensitively and capped at [`MAX_PAYLOAD_SKILLS`].
pub fn score_payload(job: &Job) -> ScorePayload {
    let mut skills: Vec<String> = Vec::new();
    let mut seen: Vec<String> = Vec::new();

    let mut push = |candidate: &str| {
        let trimmed = candidate.trim();
        if trimmed.is_empty() || skills.len() >= MAX_PAYLOAD_SKILLS {
            return;
        }
        let folded = trimmed.to_ascii_lowercase();
        if seen.contains(&folded) {
            return;
        }
        seen.push(folded);
        skills.push(trimmed.to_string());
    };

    for skill in &job.required_skills {
        push(skill);
    }
    for entries in job.tech_stack.values() {
        for entry in entries {
            push(entry);
        }
    }
    let description = job.description.to_ascii_lowercase();
    for keyword in DESCRIPTION_KEYWORDS {
        if description.contains(keyword) {
            push(keyword);
        }
    }

    ScorePayload {
        job_id: job.id.clone(),
        title: job.title.clone(),
        company: job.company.clone(),
        skills,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, 12, 0, 0).single().unwrap()
    }

    fn api_job(id: &str, title: &str, posted: Option<DateTime<Utc>>) -> Job {
        normalize_api_job(
            RawApiJob {
                external_id: id.to_string(),
                title: title.to_string(),
                company: "Initech".to_string(),
                location: "Austin, TX".to_string(),
                posted_date: posted,
                ..Default::default()
            },
            "boardlink",
            ts(1),
        )
    }

    fn email_job(id: &str, title: &str, posted: Option<DateTime<Utc>>) -> Job {
        normalize_vendor_job(
            RawVendorJob {
                internal_id: id.to_string(),
                title: title.to_string(),
                company: "Initech".to_string(),
                location: "Austin, TX".to_string(),
                posted_date: posted,
                ..Default::default()
            },
            ts(1),
        )
    }

    #[test]
    fn key_fragments_fold_case_punctuation_and_whitespace() {
        assert_eq!(
            normalize_key_fragment("  Sr. Rust/Backend  Engineer!! "),
            "sr rust backend engineer"
        );
        let a = api_job("1", "Rust Engineer", None);
        let b = email_job("2", "rust engineer!", None);
        assert_eq!(dedup_key(&a), dedup_key(&b));
    }

    #[test]
    fn normalizer_namespaces_ids() {
        let api = api_job("abc123", "Rust Engineer", None);
        assert_eq!(api.id, "api-boardlink-abc123");
        let email = email_job("42", "Rust Engineer", None);
        assert_eq!(email.id, "email-42");
        assert!(email.vendor.is_some());
    }

    #[test]
    fn work_arrangement_inference() {
        assert_eq!(infer_work_arrangement("100% Remote"), WorkArrangement::Remote);
        assert_eq!(infer_work_arrangement("Hybrid 3 days"), WorkArrangement::Hybrid);
        assert_eq!(infer_work_arrangement("On-site in Dallas"), WorkArrangement::Onsite);
        assert_eq!(infer_work_arrangement("in office daily"), WorkArrangement::Onsite);
        assert_eq!(infer_work_arrangement("flexible"), WorkArrangement::Unknown);
    }

    #[test]
    fn merge_is_idempotent() {
        let jobs = vec![
            api_job("1", "Rust Engineer", Some(ts(2))),
            email_job("9", "Data Analyst", Some(ts(3))),
        ];
        let mut doubled = jobs.clone();
        doubled.extend(jobs.clone());
        let once = merge_jobs(jobs);
        let twice = merge_jobs(doubled);
        assert_eq!(once, twice);
        assert_eq!(once.len(), 2);
    }

    #[test]
    fn email_beats_api_regardless_of_order() {
        let api = api_job("1", "Rust Engineer", Some(ts(5)));
        let email = email_job("9", "Rust Engineer", Some(ts(2)));

        let forward = merge_jobs(vec![api.clone(), email.clone()]);
        assert_eq!(forward.len(), 1);
        assert_eq!(forward[0].source_type, SourceType::Email);

        let backward = merge_jobs(vec![email, api]);
        assert_eq!(backward.len(), 1);
        assert_eq!(backward[0].source_type, SourceType::Email);
    }

    #[test]
    fn same_source_collision_keeps_newer_posted_date() {
        let older = api_job("1", "Rust Engineer", Some(ts(2)));
        let newer = api_job("2", "Rust Engineer", Some(ts(7)));
        let merged = merge_jobs(vec![older.clone(), newer.clone()]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].id, newer.id);

        // Missing date compares as oldest.
        let undated = api_job("3", "Rust Engineer", None);
        let merged = merge_jobs(vec![undated, older.clone()]);
        assert_eq!(merged[0].id, older.id);
    }

    #[test]
    fn three_way_collision_resolves_to_email_in_any_order() {
        let api_old = api_job("1", "Rust Engineer", Some(ts(2)));
        let api_new = api_job("2", "Rust Engineer", Some(ts(8)));
        let email = email_job("9", "Rust Engineer", Some(ts(1)));

        for input in [
            vec![api_old.clone(), api_new.clone(), email.clone()],
            vec![email.clone(), api_old.clone(), api_new.clone()],
            vec![api_new.clone(), email.clone(), api_old.clone()],
        ] {
            let merged = merge_jobs(input);
            assert_eq!(merged.len(), 1);
            assert_eq!(merged[0].id, email.id);
        }
    }

    #[test]
    fn winner_keeps_first_arrival_slot() {
        let first = api_job("1", "Rust Engineer", Some(ts(2)));
        let other = api_job("5", "Data Analyst", Some(ts(3)));
        let winner = email_job("9", "Rust Engineer", Some(ts(1)));
        let merged = merge_jobs(vec![first, other, winner.clone()]);
        assert_eq!(merged[0].id, winner.id);
    }

    #[test]
    fn match_sort_treats_missing_score_as_lowest() {
        let mut unscored = api_job("1", "A", Some(ts(1)));
        unscored.match_score = None;
        let mut scored = api_job("2", "B", Some(ts(2)));
        scored.match_score = Some(80);

        let mut jobs = vec![unscored, scored];
        sort_jobs(&mut jobs, SortBy::Match);
        assert_eq!(jobs[0].id, "api-boardlink-2");
    }

    #[test]
    fn salary_sort_uses_best_figure_with_date_tiebreak() {
        let mut high_old = api_job("1", "A", Some(ts(1)));
        high_old.salary_max = Some(120.0);
        let mut low = api_job("2", "B", Some(ts(9)));
        low.salary_min = Some(50.0);
        let mut high_new = api_job("3", "C", Some(ts(9)));
        high_new.salary_min = Some(120.0);

        let mut jobs = vec![low.clone(), high_old.clone(), high_new.clone()];
        sort_jobs(&mut jobs, SortBy::Salary);
        assert_eq!(jobs[0].id, high_new.id);
        assert_eq!(jobs[1].id, high_old.id);
        assert_eq!(jobs[2].id, low.id);
    }

    #[test]
    fn payload_skills_are_deduped_and_capped() {
        let mut job = api_job("1", "Rust Engineer", None);
        job.required_skills = vec![
            "Rust".into(),
            "rust".into(),
            "Tokio".into(),
            "Postgres".into(),
        ];
        job.tech_stack
            .insert("cloud".into(), vec!["AWS".into(), "Terraform".into()]);
        job.description =
            "We use rust, kubernetes, docker, kafka, graphql, sql and python daily".into();

        let payload = score_payload(&job);
        assert_eq!(payload.skills.len(), MAX_PAYLOAD_SKILLS);
        let folded: Vec<String> = payload
            .skills
            .iter()
            .map(|s| s.to_ascii_lowercase())
            .collect();
        let mut unique = folded.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(folded.len(), unique.len());
        assert_eq!(payload.skills[0], "Rust");
    }
}

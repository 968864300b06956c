use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Forward-only lifecycle. `Processing -> Processing` is the reclaim of a
    /// redelivered job; terminal states accept nothing.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("Invalid job status: {}", other)),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The four analysis stages, declared in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    FinancialAnalysis,
    InvestmentAnalysis,
    RiskAssessment,
    Verification,
}

impl StageName {
    pub const ALL: [StageName; 4] = [
        StageName::FinancialAnalysis,
        StageName::InvestmentAnalysis,
        StageName::RiskAssessment,
        StageName::Verification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::FinancialAnalysis => "financial_analysis",
            StageName::InvestmentAnalysis => "investment_analysis",
            StageName::RiskAssessment => "risk_assessment",
            StageName::Verification => "verification",
        }
    }

    pub fn index(&self) -> usize {
        match self {
            StageName::FinancialAnalysis => 0,
            StageName::InvestmentAnalysis => 1,
            StageName::RiskAssessment => 2,
            StageName::Verification => 3,
        }
    }
}

impl FromStr for StageName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StageName::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s.trim())
            .ok_or_else(|| {
                format!(
                    "Unknown stage '{}'. Known stages: {}",
                    s,
                    StageName::ALL.map(|stage| stage.as_str()).join(", ")
                )
            })
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSection {
    pub stage: StageName,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub analysis: String,
    pub sections: Vec<StageSection>,
}

impl AnalysisResult {
    pub const SEPARATOR: &'static str = "\n\n";

    pub fn from_sections(sections: Vec<StageSection>) -> Self {
        let analysis = sections
            .iter()
            .map(|section| section.output.as_str())
            .collect::<Vec<_>>()
            .join(Self::SEPARATOR);
        Self { analysis, sections }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub input_ref: String,
    pub query: String,
    pub status: JobStatus,
    pub result: Option<AnalysisResult>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub delivery_ref: Option<String>,
}

impl Job {
    pub fn new(input_ref: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            input_ref: input_ref.into(),
            query: query.into(),
            status: JobStatus::Pending,
            result: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_seconds: None,
            delivery_ref: None,
        }
    }

    /// Applies `update` as a single step: either every field lands or the
    /// record is left untouched.
    pub fn apply(&mut self, update: &JobUpdate) -> Result<(), UpdateRejection> {
        if let Some(expected) = update.expect_status
            && self.status != expected
        {
            return Err(UpdateRejection::Conflict {
                expected,
                actual: self.status,
            });
        }
        if let Some(expected) = &update.expect_delivery_ref
            && self.delivery_ref.as_deref() != Some(expected.as_str())
        {
            return Err(UpdateRejection::OwnerMismatch {
                expected: expected.clone(),
                actual: self.delivery_ref.clone(),
            });
        }

        let mut next = self.clone();
        if let Some(status) = update.status {
            if !self.status.can_transition_to(status) {
                return Err(UpdateRejection::InvalidTransition {
                    from: self.status,
                    to: status,
                });
            }
            next.status = status;
        }
        if let Some(result) = &update.result {
            next.result = Some(result.clone());
        }
        if let Some(message) = &update.error_message {
            next.error_message = Some(message.clone());
        }
        if let Some(started_at) = update.started_at {
            next.started_at = Some(started_at);
        }
        if let Some(completed_at) = update.completed_at {
            next.completed_at = Some(completed_at);
        }
        if let Some(delivery_ref) = &update.delivery_ref {
            next.delivery_ref = Some(delivery_ref.clone());
        }
        next.duration_seconds = match (next.started_at, next.completed_at) {
            (Some(started), Some(completed)) => {
                Some((completed - started).num_milliseconds().max(0) as f64 / 1_000.0)
            }
            _ => None,
        };

        next.check_consistency()
            .map_err(UpdateRejection::InvalidState)?;
        *self = next;
        Ok(())
    }

    fn check_consistency(&self) -> Result<(), String> {
        match self.status {
            JobStatus::Completed => {
                if self.result.is_none() {
                    return Err("completed job must carry a result".into());
                }
                if self.completed_at.is_none() {
                    return Err("completed job must carry completed_at".into());
                }
            }
            JobStatus::Failed => {
                if self
                    .error_message
                    .as_deref()
                    .is_none_or(|message| message.trim().is_empty())
                {
                    return Err("failed job must carry a non-empty error message".into());
                }
                if self.completed_at.is_none() {
                    return Err("failed job must carry completed_at".into());
                }
            }
            JobStatus::Pending | JobStatus::Processing => {
                if self.completed_at.is_some() {
                    return Err(format!(
                        "{} job cannot carry completed_at",
                        self.status.as_str()
                    ));
                }
                if self.result.is_some() {
                    return Err(format!("{} job cannot carry a result", self.status.as_str()));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateRejection {
    Conflict { expected: JobStatus, actual: JobStatus },
    OwnerMismatch { expected: String, actual: Option<String> },
    InvalidTransition { from: JobStatus, to: JobStatus },
    InvalidState(String),
}

/// `delivery_ref` of a processing job whose owner is gone; the next
/// delivery for it may take over.
pub const RELEASED_DELIVERY_REF: &str = "released";

/// Partial update of a job record. Unset fields are left as they are.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub expect_status: Option<JobStatus>,
    pub expect_delivery_ref: Option<String>,
    pub status: Option<JobStatus>,
    pub result: Option<AnalysisResult>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub delivery_ref: Option<String>,
}

impl JobUpdate {
    pub fn expecting(mut self, status: JobStatus) -> Self {
        self.expect_status = Some(status);
        self
    }

    pub fn owned_by(mut self, delivery_ref: impl Into<String>) -> Self {
        self.expect_delivery_ref = Some(delivery_ref.into());
        self
    }

    /// Takes over a processing job without touching `started_at`.
    pub fn reclaim(delivery_ref: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Processing),
            delivery_ref: Some(delivery_ref.into()),
            ..Self::default()
        }
    }

    pub fn release() -> Self {
        Self {
            delivery_ref: Some(RELEASED_DELIVERY_REF.to_string()),
            ..Self::default()
        }
        .expecting(JobStatus::Processing)
    }

    pub fn claim(started_at: DateTime<Utc>, delivery_ref: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Processing),
            started_at: Some(started_at),
            delivery_ref: Some(delivery_ref.into()),
            ..Self::default()
        }
    }

    pub fn complete(result: AnalysisResult, completed_at: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            result: Some(result),
            completed_at: Some(completed_at),
            ..Self::default()
        }
    }

    pub fn fail(error_message: impl Into<String>, completed_at: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error_message: Some(error_message.into()),
            completed_at: Some(completed_at),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub job_id: JobId,
    pub index: usize,
    pub stage: StageName,
    pub output: String,
    pub error: Option<String>,
    pub attempts: u32,
    pub tokens_used: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

impl StageResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMetrics {
    pub job_id: JobId,
    pub processing_time_ms: f64,
    pub stages_run: usize,
    pub total_attempts: u32,
    pub tokens_used: u64,
    pub model_used: String,
    pub estimated_cost_usd: f64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
}

impl JobFilter {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|status| job.status == status)
    }
}

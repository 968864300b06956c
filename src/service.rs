use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::broker::Broker;
use crate::error::{QueryError, StoreError, SubmitError, ValidationError};
use crate::job::{
    AnalysisResult, Job, JobFilter, JobId, JobMetrics, JobStatus, JobUpdate, StageResult,
};
use crate::store::JobStore;

pub const DEFAULT_QUERY: &str = "Analyze this financial document for investment insights";
pub const MAX_QUERY_CHARS: usize = 4_000;

/// What a caller sees when asking for a job's result.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ResultView {
    Pending,
    Processing,
    Completed {
        result: AnalysisResult,
        duration_seconds: Option<f64>,
    },
    Failed {
        error: String,
    },
}

impl From<&Job> for ResultView {
    fn from(job: &Job) -> Self {
        match (job.status, &job.result) {
            (JobStatus::Pending, _) => ResultView::Pending,
            (JobStatus::Processing, _) => ResultView::Processing,
            (JobStatus::Completed, Some(result)) => ResultView::Completed {
                result: result.clone(),
                duration_seconds: job.duration_seconds,
            },
            // The store never lets a completed job lose its result.
            (JobStatus::Completed, None) => ResultView::Processing,
            (JobStatus::Failed, _) => ResultView::Failed {
                error: job.error_message.clone().unwrap_or_default(),
            },
        }
    }
}

/// Store-wide summary of job counts and recorded metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobStats {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    /// Mean duration of completed jobs, `None` when none completed.
    pub average_duration_seconds: Option<f64>,
    pub metrics_entries: usize,
    pub total_tokens: u64,
    pub total_cost_usd: f64,
}

/// Ingress surface: submission plus read-only queries against the store.
#[derive(Clone)]
pub struct AnalysisService {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn Broker>,
}

impl AnalysisService {
    pub fn new(store: Arc<dyn JobStore>, broker: Arc<dyn Broker>) -> Self {
        Self { store, broker }
    }

    /// Creates the job record, then enqueues it. The record exists before any
    /// worker can see the message.
    #[instrument(skip(self, query), fields(input_ref = %input_ref))]
    pub async fn submit(&self, input_ref: &str, query: &str) -> Result<JobId, SubmitError> {
        let input_ref = input_ref.trim();
        if input_ref.is_empty() {
            return Err(ValidationError::EmptyInputRef.into());
        }
        let query = match query.trim() {
            "" => DEFAULT_QUERY,
            trimmed => trimmed,
        };
        let len = query.chars().count();
        if len > MAX_QUERY_CHARS {
            return Err(ValidationError::QueryTooLong {
                len,
                max: MAX_QUERY_CHARS,
            }
            .into());
        }

        let job = Job::new(input_ref, query);
        self.store.create(&job).await?;
        let message_id = self.broker.enqueue(job.id).await?;
        info!(job_id = %job.id, message_id = %message_id, "Job submitted");
        Ok(job.id)
    }

    pub async fn get_status(&self, id: JobId) -> Result<Job, QueryError> {
        Ok(self.store.get(id).await?)
    }

    pub async fn get_result(&self, id: JobId) -> Result<ResultView, QueryError> {
        let job = self.store.get(id).await?;
        Ok(ResultView::from(&job))
    }

    pub async fn list_jobs(&self, filter: JobFilter, limit: usize) -> Result<Vec<Job>, QueryError> {
        Ok(self.store.list(filter, limit).await?)
    }

    pub async fn stage_results(&self, id: JobId) -> Result<Vec<StageResult>, QueryError> {
        // Distinguish an unknown job from one with no stages yet.
        self.store.get(id).await?;
        Ok(self.store.stage_results(id).await?)
    }

    pub async fn metrics(&self, id: JobId) -> Result<Option<JobMetrics>, QueryError> {
        self.store.get(id).await?;
        Ok(self.store.metrics(id).await?)
    }

    pub async fn stats(&self) -> Result<JobStats, QueryError> {
        let jobs = self.store.list(JobFilter::default(), usize::MAX).await?;
        let mut stats = JobStats {
            total: jobs.len(),
            ..JobStats::default()
        };
        let mut durations = Vec::new();
        for job in &jobs {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => {
                    stats.completed += 1;
                    durations.extend(job.duration_seconds);
                }
                JobStatus::Failed => stats.failed += 1,
            }
            if let Some(metrics) = self.store.metrics(job.id).await? {
                stats.metrics_entries += 1;
                stats.total_tokens += metrics.tokens_used;
                stats.total_cost_usd += metrics.estimated_cost_usd;
            }
        }
        if !durations.is_empty() {
            stats.average_duration_seconds =
                Some(durations.iter().sum::<f64>() / durations.len() as f64);
        }
        Ok(stats)
    }

    /// Re-enqueues every pending or processing job, e.g. after a restart
    /// over a persistent store. Returns the re-enqueued ids.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<Vec<JobId>, QueryError> {
        let mut recovered = Vec::new();
        for job in self.store.list(JobFilter::status(JobStatus::Pending), usize::MAX).await? {
            self.broker.enqueue(job.id).await?;
            recovered.push(job.id);
        }
        for job in self
            .store
            .list(JobFilter::status(JobStatus::Processing), usize::MAX)
            .await?
        {
            // The old delivery is gone; let whichever delivery comes next take over.
            match self.store.update(job.id, JobUpdate::release()).await {
                Ok(_) => {}
                Err(StoreError::Conflict { actual, .. }) => {
                    debug!(job_id = %job.id, status = %actual, "Job finished before recovery");
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
            warn!(job_id = %job.id, "Job was mid-pipeline at shutdown; re-enqueueing");
            self.broker.enqueue(job.id).await?;
            recovered.push(job.id);
        }
        if !recovered.is_empty() {
            info!(recovered = recovered.len(), "Re-enqueued unfinished jobs");
        }
        Ok(recovered)
    }

    /// Polls until every job in `ids` is terminal.
    pub async fn wait_for_terminal(
        &self,
        ids: &[JobId],
        poll: Duration,
    ) -> Result<Vec<Job>, QueryError> {
        loop {
            let mut jobs = Vec::with_capacity(ids.len());
            for id in ids {
                jobs.push(self.store.get(*id).await?);
            }
            if jobs.iter().all(|job| job.status.is_terminal()) {
                return Ok(jobs);
            }
            tokio::time::sleep(poll).await;
        }
    }
}

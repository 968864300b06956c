use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::job::{Job, JobMetrics, StageResult};
use crate::observability::{JobOutcomeKind, MetricsCollector};
use crate::settings::MetricsSettings;
use crate::store::JobStore;

#[derive(Debug, Clone, Default)]
pub struct CostModel {
    pub model: Option<String>,
    pub usd_per_1k_tokens: f64,
}

impl From<&MetricsSettings> for CostModel {
    fn from(settings: &MetricsSettings) -> Self {
        Self {
            model: settings.model.clone(),
            usd_per_1k_tokens: settings.usd_per_1k_tokens,
        }
    }
}

impl CostModel {
    pub fn estimate(&self, tokens: u64) -> f64 {
        tokens as f64 / 1_000.0 * self.usd_per_1k_tokens
    }
}

/// Best-effort recording of run statistics. Nothing here can change a
/// job's outcome: every failure is logged and dropped.
#[derive(Clone)]
pub struct MetricsRecorder {
    store: Arc<dyn JobStore>,
    collector: MetricsCollector,
    cost: CostModel,
}

impl MetricsRecorder {
    pub fn new(store: Arc<dyn JobStore>, collector: MetricsCollector, cost: CostModel) -> Self {
        Self {
            store,
            collector,
            cost,
        }
    }

    pub fn collector(&self) -> &MetricsCollector {
        &self.collector
    }

    pub fn build(
        &self,
        job: &Job,
        stages: &[StageResult],
        variant_label: &str,
    ) -> JobMetrics {
        let tokens_used: u64 = stages
            .iter()
            .map(|stage| {
                stage
                    .tokens_used
                    .unwrap_or_else(|| (stage.output.chars().count() as u64).div_ceil(4))
            })
            .sum();
        let processing_time_ms = match (job.started_at, job.completed_at) {
            (Some(started), Some(completed)) => {
                (completed - started).num_milliseconds().max(0) as f64
            }
            _ => 0.0,
        };

        JobMetrics {
            job_id: job.id,
            processing_time_ms,
            stages_run: stages.len(),
            total_attempts: stages.iter().map(|stage| stage.attempts).sum(),
            tokens_used,
            model_used: self
                .cost
                .model
                .clone()
                .unwrap_or_else(|| variant_label.to_string()),
            estimated_cost_usd: self.cost.estimate(tokens_used),
            recorded_at: Utc::now(),
        }
    }

    pub async fn record(
        &self,
        job: &Job,
        stages: &[StageResult],
        variant_label: &str,
    ) {
        let outcome = if job.result.is_some() {
            JobOutcomeKind::Completed
        } else {
            JobOutcomeKind::Failed
        };
        self.collector.record_job(outcome, job.duration_seconds);

        let metrics = self.build(job, stages, variant_label);
        match self.store.put_metrics(&metrics).await {
            Ok(()) => debug!(
                job_id = %job.id,
                tokens = metrics.tokens_used,
                cost_usd = metrics.estimated_cost_usd,
                "Job metrics recorded"
            ),
            Err(err) => warn!(
                job_id = %job.id,
                error = %err,
                "Failed to record job metrics; job outcome unaffected"
            ),
        }
    }

    pub fn record_skip(&self) {
        self.collector.record_job(JobOutcomeKind::Skipped, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobUpdate, StageName};
    use crate::store::MemoryJobStore;

    #[test]
    fn metrics_fall_back_to_estimated_tokens() {
        let recorder = MetricsRecorder::new(
            Arc::new(MemoryJobStore::new()),
            MetricsCollector::new(),
            CostModel {
                model: None,
                usd_per_1k_tokens: 2.0,
            },
        );
        let mut job = Job::new("a.pdf", "q");
        let started = Utc::now();
        job.apply(&JobUpdate::claim(started, "m")).unwrap();
        job.apply(&JobUpdate::fail(
            "boom",
            started + chrono::Duration::milliseconds(250),
        ))
        .unwrap();

        let stage = |output: &str, tokens: Option<u64>| StageResult {
            job_id: job.id,
            index: 0,
            stage: StageName::FinancialAnalysis,
            output: output.to_string(),
            error: None,
            attempts: 2,
            tokens_used: tokens,
            started_at: started,
            ended_at: started,
        };
        let stages = vec![stage("12345678", None), stage("", Some(492))];

        let metrics = recorder.build(&job, &stages, "live");
        assert_eq!(metrics.tokens_used, 494);
        assert_eq!(metrics.total_attempts, 4);
        assert_eq!(metrics.processing_time_ms, 250.0);
        assert_eq!(metrics.model_used, "live");
        assert!((metrics.estimated_cost_usd - 0.988).abs() < 1e-9);
    }
}

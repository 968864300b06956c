use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

use crate::job::StageName;

#[cfg(feature = "metrics-server")]
pub mod server;

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_skipped: u64,
    pub total_job_duration_ms: f64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StageMetrics {
    pub calls: u64,
    pub failures: u64,
    pub retries: u64,
    pub soft_timeouts: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcomeKind {
    Completed,
    Failed,
    Skipped,
}

/// Process-local counters shared by cloned handles.
#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_stage(&self, stage: StageName) -> StageTimer {
        StageTimer {
            stage,
            started_at: Instant::now(),
            collector: self.inner.clone(),
            recorded: false,
        }
    }

    pub fn record_retry(&self, stage: StageName) {
        if let Ok(mut guard) = self.inner.lock() {
            guard
                .stages
                .entry(stage.as_str().to_string())
                .or_default()
                .retries += 1;
        }
    }

    pub fn record_soft_timeout(&self, stage: StageName) {
        if let Ok(mut guard) = self.inner.lock() {
            guard
                .stages
                .entry(stage.as_str().to_string())
                .or_default()
                .soft_timeouts += 1;
        }
    }

    pub fn record_stage_failure(&self, stage: StageName) {
        if let Ok(mut guard) = self.inner.lock() {
            guard
                .stages
                .entry(stage.as_str().to_string())
                .or_default()
                .failures += 1;
        }
    }

    pub fn record_job(&self, outcome: JobOutcomeKind, duration_seconds: Option<f64>) {
        if let Ok(mut guard) = self.inner.lock() {
            match outcome {
                JobOutcomeKind::Completed => guard.jobs_completed += 1,
                JobOutcomeKind::Failed => guard.jobs_failed += 1,
                JobOutcomeKind::Skipped => guard.jobs_skipped += 1,
            }
            if let Some(seconds) = duration_seconds {
                guard.total_job_duration_ms += seconds * 1_000.0;
            }
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn reset(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = MetricsSnapshot::default();
        }
    }
}

/// Records one stage attempt's duration when dropped.
pub struct StageTimer {
    stage: StageName,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    recorded: bool,
}

impl StageTimer {
    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration_ms = self.started_at.elapsed().as_secs_f64() * 1_000.0;
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard
                .stages
                .entry(self.stage.as_str().to_string())
                .or_default();
            metrics.calls += 1;
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(
            stage = self.stage.as_str(),
            duration_ms, "Stage duration recorded"
        );
        self.recorded = true;
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        jobs_completed = snapshot.jobs_completed,
        jobs_failed = snapshot.jobs_failed,
        jobs_skipped = snapshot.jobs_skipped,
        total_job_duration_ms = snapshot.total_job_duration_ms,
        "Pipeline metrics summary"
    );
    for (stage, metrics) in &snapshot.stages {
        info!(
            stage = stage.as_str(),
            calls = metrics.calls,
            failures = metrics.failures,
            retries = metrics.retries,
            soft_timeouts = metrics.soft_timeouts,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Stage metrics"
        );
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        output.push_str("# HELP docpipe_jobs_total Jobs that reached an outcome, by outcome\n");
        output.push_str("# TYPE docpipe_jobs_total counter\n");
        for (outcome, value) in [
            ("completed", self.jobs_completed),
            ("failed", self.jobs_failed),
            ("skipped", self.jobs_skipped),
        ] {
            output.push_str(&format!(
                "docpipe_jobs_total{{outcome=\"{}\"}} {}\n",
                outcome, value
            ));
        }
        output.push_str(
            "# HELP docpipe_job_duration_seconds_total Accumulated duration of terminal jobs\n",
        );
        output.push_str("# TYPE docpipe_job_duration_seconds_total counter\n");
        output.push_str(&format!(
            "docpipe_job_duration_seconds_total {:.6}\n",
            self.total_job_duration_ms / 1_000.0
        ));
        output.push_str("# HELP docpipe_stage_calls_total Stage attempt count\n");
        output.push_str("# TYPE docpipe_stage_calls_total counter\n");
        output.push_str("# HELP docpipe_stage_failures_total Stages that ended the pipeline\n");
        output.push_str("# TYPE docpipe_stage_failures_total counter\n");
        output.push_str("# HELP docpipe_stage_retries_total Transient stage errors retried\n");
        output.push_str("# TYPE docpipe_stage_retries_total counter\n");
        output.push_str(
            "# HELP docpipe_stage_soft_timeouts_total Attempts that outlived the soft timeout\n",
        );
        output.push_str("# TYPE docpipe_stage_soft_timeouts_total counter\n");
        output.push_str(
            "# HELP docpipe_stage_duration_seconds_total Accumulated stage duration in seconds\n",
        );
        output.push_str("# TYPE docpipe_stage_duration_seconds_total counter\n");
        output.push_str(
            "# HELP docpipe_stage_duration_seconds_max Maximum stage duration in seconds\n",
        );
        output.push_str("# TYPE docpipe_stage_duration_seconds_max gauge\n");
        for (stage, metrics) in &self.stages {
            output.push_str(&format!(
                "docpipe_stage_calls_total{{stage=\"{}\"}} {}\n",
                stage, metrics.calls
            ));
            output.push_str(&format!(
                "docpipe_stage_failures_total{{stage=\"{}\"}} {}\n",
                stage, metrics.failures
            ));
            output.push_str(&format!(
                "docpipe_stage_retries_total{{stage=\"{}\"}} {}\n",
                stage, metrics.retries
            ));
            output.push_str(&format!(
                "docpipe_stage_soft_timeouts_total{{stage=\"{}\"}} {}\n",
                stage, metrics.soft_timeouts
            ));
            output.push_str(&format!(
                "docpipe_stage_duration_seconds_total{{stage=\"{}\"}} {:.6}\n",
                stage,
                metrics.total_duration_ms / 1_000.0
            ));
            output.push_str(&format!(
                "docpipe_stage_duration_seconds_max{{stage=\"{}\"}} {:.6}\n",
                stage,
                metrics.max_duration_ms / 1_000.0
            ));
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timers_and_outcomes_feed_the_snapshot() {
        let collector = MetricsCollector::new();
        drop(collector.start_stage(StageName::RiskAssessment));
        drop(collector.start_stage(StageName::RiskAssessment));
        collector.record_retry(StageName::RiskAssessment);
        collector.record_soft_timeout(StageName::RiskAssessment);
        collector.record_job(JobOutcomeKind::Completed, Some(1.5));
        collector.record_job(JobOutcomeKind::Skipped, None);

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.stages["risk_assessment"].calls, 2);
        assert_eq!(snapshot.stages["risk_assessment"].retries, 1);
        assert_eq!(snapshot.jobs_completed, 1);
        assert_eq!(snapshot.jobs_skipped, 1);
        assert_eq!(snapshot.total_job_duration_ms, 1_500.0);

        let text = snapshot.to_prometheus();
        assert!(text.contains("docpipe_jobs_total{outcome=\"completed\"} 1"));
        assert!(text.contains("docpipe_stage_calls_total{stage=\"risk_assessment\"} 2"));
        assert!(text.contains("docpipe_job_duration_seconds_total 1.500000"));
        assert!(text.contains("docpipe_stage_soft_timeouts_total{stage=\"risk_assessment\"} 1"));

        collector.reset();
        assert!(collector.snapshot().stages.is_empty());
    }
}

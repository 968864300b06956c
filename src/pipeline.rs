use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{Instrument, debug, error, info, instrument, warn};

use crate::broker::{Broker, Delivery};
use crate::capability::{PriorOutput, StageContext, StageOutput};
use crate::error::{BrokerError, InfrastructureError, StageError, StoreError};
use crate::job::{
    AnalysisResult, Job, JobStatus, JobUpdate, RELEASED_DELIVERY_REF, StageName, StageResult,
    StageSection,
};
use crate::metrics::MetricsRecorder;
use crate::registry::{CapabilityRegistry, StageBinding};
use crate::settings::Settings;
use crate::store::JobStore;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per stage, first try included.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `failed_attempt`-th attempt (1-based).
    pub fn backoff(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1).min(32) as i32;
        let scaled_ms = (self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exponent))
            .round();
        let capped_ms = scaled_ms.min(self.max_backoff.as_millis() as f64).max(0.0);
        Duration::from_millis(capped_ms as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimeouts {
    pub soft: Duration,
    pub hard: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            soft: Duration::from_secs(25 * 60),
            hard: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutorSettings {
    pub retry: RetryPolicy,
    pub timeouts: StageTimeouts,
    pub nack_delay: Duration,
    /// How often a running job extends its delivery's visibility timeout.
    /// `None` leaves the lease to expire on its own.
    pub lease_renewal: Option<Duration>,
}

impl From<&Settings> for ExecutorSettings {
    fn from(settings: &Settings) -> Self {
        let retry = &settings.pipeline.retry;
        Self {
            retry: RetryPolicy {
                max_attempts: retry.max_attempts.max(1),
                initial_backoff: Duration::from_millis(retry.initial_backoff_ms),
                max_backoff: Duration::from_millis(retry.max_backoff_ms),
                multiplier: retry.multiplier,
            },
            timeouts: StageTimeouts {
                soft: Duration::from_millis(settings.pipeline.soft_timeout_ms),
                hard: Duration::from_millis(settings.pipeline.hard_timeout_ms),
            },
            nack_delay: Duration::from_millis(settings.broker.nack_delay_ms),
            lease_renewal: Some(Duration::from_millis(settings.broker.visibility_timeout_ms / 3))
                .filter(|every| !every.is_zero()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyTerminal(JobStatus),
    OwnedByOtherDelivery,
    LostClaim,
    UnknownJob,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed { stage: StageName, error: String },
    Skipped(SkipReason),
}

struct StageRun {
    attempts: u32,
    outcome: Result<StageOutput, String>,
}

/// Drives one job through the fixed stage sequence and owns the broker
/// acknowledgement for the delivery that carried it.
pub struct PipelineExecutor {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn Broker>,
    registry: CapabilityRegistry,
    recorder: MetricsRecorder,
    settings: ExecutorSettings,
}

impl PipelineExecutor {
    pub fn new(
        store: Arc<dyn JobStore>,
        broker: Arc<dyn Broker>,
        registry: CapabilityRegistry,
        recorder: MetricsRecorder,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            store,
            broker,
            registry,
            recorder,
            settings,
        }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    /// Processes the delivery, then acks it. Infrastructure faults nack the
    /// delivery instead so the whole run is retried later.
    #[instrument(
        name = "job",
        skip(self, delivery),
        fields(
            job_id = %delivery.job_id,
            message_id = %delivery.message_id,
            attempt = delivery.attempt
        )
    )]
    pub async fn handle(&self, delivery: &Delivery) -> Result<RunOutcome, InfrastructureError> {
        let outcome = match self.process_leased(delivery).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(error = %err, "Infrastructure fault; returning delivery to the queue");
                if let Err(nack_err) = self.broker.nack(delivery, self.settings.nack_delay).await {
                    warn!(error = %nack_err, "Nack failed; relying on visibility timeout");
                }
                return Err(err);
            }
        };

        match self.broker.ack(delivery).await {
            Ok(()) => {}
            Err(BrokerError::UnknownDelivery(_)) => {
                warn!("Delivery no longer tracked by the broker; nothing to acknowledge")
            }
            Err(err) => return Err(err.into()),
        }
        debug!(outcome = ?outcome, "Delivery acknowledged");
        Ok(outcome)
    }

    /// Runs `process` while renewing the delivery's lease, so a slow but live
    /// run is not handed to a second worker.
    async fn process_leased(&self, delivery: &Delivery) -> Result<RunOutcome, InfrastructureError> {
        let Some(every) = self.settings.lease_renewal.filter(|every| !every.is_zero()) else {
            return self.process(delivery).await;
        };
        let run = self.process(delivery);
        tokio::pin!(run);
        let mut renewals = tokio::time::interval_at(tokio::time::Instant::now() + every, every);

        loop {
            tokio::select! {
                biased;
                outcome = &mut run => return outcome,
                _ = renewals.tick() => {
                    match self.broker.extend(delivery).await {
                        Ok(()) => debug!("Delivery lease renewed"),
                        Err(err) => warn!(
                            error = %err,
                            "Lease renewal failed; the job may be taken over by a redelivery"
                        ),
                    }
                }
            }
        }
    }

    /// Runs the job without touching the broker.
    pub async fn process(&self, delivery: &Delivery) -> Result<RunOutcome, InfrastructureError> {
        let job = match self.store.get(delivery.job_id).await {
            Ok(job) => job,
            Err(StoreError::NotFound(_)) => {
                warn!("Delivery references an unknown job; discarding");
                self.recorder.record_skip();
                return Ok(RunOutcome::Skipped(SkipReason::UnknownJob));
            }
            Err(err) => return Err(err.into()),
        };

        if job.status.is_terminal() {
            info!(status = %job.status, "Job already terminal; discarding duplicate delivery");
            self.recorder.record_skip();
            return Ok(RunOutcome::Skipped(SkipReason::AlreadyTerminal(job.status)));
        }

        let owner = delivery.owner_token();
        let job = match self.claim(job, delivery, &owner).await? {
            Ok(job) => job,
            Err(reason) => {
                self.recorder.record_skip();
                return Ok(RunOutcome::Skipped(reason));
            }
        };

        match self.run_stages(job, &owner).await? {
            Ok(outcome) => Ok(outcome),
            Err(reason) => {
                self.recorder.record_skip();
                Ok(RunOutcome::Skipped(reason))
            }
        }
    }

    /// Pending jobs are claimed outright. A processing job is taken over only
    /// from a released owner or from an earlier hand-out of the same message,
    /// whose lease the broker has already given up on.
    async fn claim(
        &self,
        job: Job,
        delivery: &Delivery,
        token: &str,
    ) -> Result<Result<Job, SkipReason>, InfrastructureError> {
        let (update, reclaim) = match job.status {
            JobStatus::Pending => (
                JobUpdate::claim(Utc::now(), token).expecting(JobStatus::Pending),
                false,
            ),
            JobStatus::Processing => {
                let owner = job.delivery_ref.clone().unwrap_or_default();
                if owner != RELEASED_DELIVERY_REF && !delivery.supersedes(&owner) {
                    info!(owner = %owner, "Job is owned by another delivery; discarding duplicate");
                    return Ok(Err(SkipReason::OwnedByOtherDelivery));
                }
                warn!(previous_owner = %owner, "Reclaiming job left unfinished by an earlier delivery");
                let update = JobUpdate::reclaim(token)
                    .expecting(JobStatus::Processing)
                    .owned_by(owner);
                (update, true)
            }
            JobStatus::Completed | JobStatus::Failed => {
                return Ok(Err(SkipReason::AlreadyTerminal(job.status)));
            }
        };

        match self.store.update(job.id, update).await {
            Ok(claimed) => {
                if reclaim && let Err(err) = self.store.clear_stage_results(claimed.id, token).await
                {
                    return superseded(err).map(Err);
                }
                debug!(status = %claimed.status, "Job claimed");
                Ok(Ok(claimed))
            }
            Err(StoreError::Conflict { actual, .. }) => {
                info!(actual = %actual, "Lost the claim race; discarding delivery");
                Ok(Err(SkipReason::LostClaim))
            }
            Err(StoreError::OwnerConflict { actual, .. }) => {
                info!(
                    owner = actual.as_deref().unwrap_or("unknown"),
                    "Another delivery took over the job; discarding"
                );
                Ok(Err(SkipReason::LostClaim))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn run_stages(
        &self,
        job: Job,
        owner: &str,
    ) -> Result<Result<RunOutcome, SkipReason>, InfrastructureError> {
        let mut prior: Vec<PriorOutput> = Vec::with_capacity(StageName::ALL.len());
        let mut recorded: Vec<StageResult> = Vec::with_capacity(StageName::ALL.len());

        for (stage, binding) in self.registry.stages() {
            let span = tracing::info_span!("stage", stage = %stage, index = stage.index());
            let started_at = Utc::now();
            let run = self
                .run_stage(&job, stage, binding, &prior)
                .instrument(span)
                .await;
            let ended_at = Utc::now();

            let (output, error, tokens_used) = match &run.outcome {
                Ok(output) => (output.content.clone(), None, output.tokens_used),
                Err(message) => (String::new(), Some(message.clone()), None),
            };
            let result = StageResult {
                job_id: job.id,
                index: stage.index(),
                stage,
                output,
                error,
                attempts: run.attempts,
                tokens_used,
                started_at,
                ended_at,
            };
            if let Err(err) = self.store.record_stage(&result, owner).await {
                return superseded(err).map(Err);
            }
            recorded.push(result);

            match run.outcome {
                Ok(output) => prior.push(PriorOutput {
                    stage,
                    output: output.content,
                }),
                Err(message) => {
                    self.recorder.collector().record_stage_failure(stage);
                    return self
                        .finish_failed(&job, owner, stage, message, &recorded)
                        .await
                        .map(Ok);
                }
            }
        }

        self.finish_completed(&job, owner, prior, &recorded)
            .await
            .map(Ok)
    }

    async fn run_stage(
        &self,
        job: &Job,
        stage: StageName,
        binding: &StageBinding,
        prior: &[PriorOutput],
    ) -> StageRun {
        let policy = &self.settings.retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let ctx = StageContext {
                job_id: job.id,
                input_ref: job.input_ref.clone(),
                query: job.query.clone(),
                prior: prior.to_vec(),
                attempt,
            };
            let result = {
                let _timer = self.recorder.collector().start_stage(stage);
                self.invoke(stage, binding, &ctx).await
            };

            let error = match result {
                Ok(output) if output.content.trim().is_empty() && !binding.empty_output_valid => {
                    StageError::fatal(format!("stage {stage} produced empty output"))
                }
                Ok(output) => {
                    debug!(attempt, chars = output.content.len(), "Stage succeeded");
                    return StageRun {
                        attempts: attempt,
                        outcome: Ok(output),
                    };
                }
                Err(err) => err,
            };

            match error {
                StageError::Transient(message) if attempt < policy.max_attempts => {
                    let delay = policy.backoff(attempt);
                    self.recorder.collector().record_retry(stage);
                    warn!(
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Transient stage error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                StageError::Transient(message) => {
                    warn!(attempt, error = %message, "Retry budget exhausted");
                    return StageRun {
                        attempts: attempt,
                        outcome: Err(format!(
                            "{message} (gave up after {attempt} attempt(s))"
                        )),
                    };
                }
                StageError::Fatal(message) => {
                    warn!(attempt, error = %message, "Fatal stage error");
                    return StageRun {
                        attempts: attempt,
                        outcome: Err(message),
                    };
                }
            }
        }
    }

    async fn invoke(
        &self,
        stage: StageName,
        binding: &StageBinding,
        ctx: &StageContext,
    ) -> Result<StageOutput, StageError> {
        let timeouts = self.settings.timeouts;
        let run = binding.capability.run(stage, ctx);
        tokio::pin!(run);
        let hard = tokio::time::sleep(timeouts.hard);
        tokio::pin!(hard);
        let soft = tokio::time::sleep(timeouts.soft);
        tokio::pin!(soft);
        let mut soft_elapsed = false;

        loop {
            tokio::select! {
                biased;
                output = &mut run => return output,
                _ = &mut hard => {
                    return Err(StageError::fatal(format!(
                        "stage {stage} exceeded hard timeout of {}ms",
                        timeouts.hard.as_millis()
                    )));
                }
                _ = &mut soft, if !soft_elapsed => {
                    soft_elapsed = true;
                    self.recorder.collector().record_soft_timeout(stage);
                    warn!(
                        soft_timeout_ms = timeouts.soft.as_millis() as u64,
                        "Stage exceeded soft timeout; still waiting"
                    );
                }
            }
        }
    }

    async fn finish_completed(
        &self,
        job: &Job,
        owner: &str,
        prior: Vec<PriorOutput>,
        recorded: &[StageResult],
    ) -> Result<RunOutcome, InfrastructureError> {
        let sections = prior
            .into_iter()
            .map(|prior| StageSection {
                stage: prior.stage,
                output: prior.output,
            })
            .collect();
        let update = JobUpdate::complete(AnalysisResult::from_sections(sections), Utc::now())
            .expecting(JobStatus::Processing);
        self.finish(job, owner, update, recorded, RunOutcome::Completed)
            .await
    }

    async fn finish_failed(
        &self,
        job: &Job,
        owner: &str,
        stage: StageName,
        message: String,
        recorded: &[StageResult],
    ) -> Result<RunOutcome, InfrastructureError> {
        let update = JobUpdate::fail(message.clone(), Utc::now()).expecting(JobStatus::Processing);
        self.finish(
            job,
            owner,
            update,
            recorded,
            RunOutcome::Failed {
                stage,
                error: message,
            },
        )
        .await
    }

    async fn finish(
        &self,
        job: &Job,
        owner: &str,
        update: JobUpdate,
        recorded: &[StageResult],
        outcome: RunOutcome,
    ) -> Result<RunOutcome, InfrastructureError> {
        match self.store.update(job.id, update.owned_by(owner)).await {
            Ok(terminal) => {
                info!(
                    status = %terminal.status,
                    duration_seconds = terminal.duration_seconds.unwrap_or_default(),
                    stages = recorded.len(),
                    "Job reached terminal status"
                );
                self.recorder
                    .record(&terminal, recorded, self.registry.variant_label())
                    .await;
                Ok(outcome)
            }
            Err(StoreError::Conflict { actual, .. }) => {
                warn!(
                    actual = %actual,
                    "Terminal status already recorded by another delivery; keeping it"
                );
                self.recorder.record_skip();
                Ok(RunOutcome::Skipped(SkipReason::AlreadyTerminal(actual)))
            }
            Err(StoreError::OwnerConflict { actual, .. }) => {
                warn!(
                    owner = actual.as_deref().unwrap_or("unknown"),
                    "Job was taken over by another delivery; dropping this run's outcome"
                );
                self.recorder.record_skip();
                Ok(RunOutcome::Skipped(SkipReason::LostClaim))
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Maps a rejected owner-fenced write to the reason this run stops.
fn superseded(err: StoreError) -> Result<SkipReason, InfrastructureError> {
    match err {
        StoreError::Conflict { actual, .. } if actual.is_terminal() => {
            warn!(actual = %actual, "Job finished under another delivery; dropping this run");
            Ok(SkipReason::AlreadyTerminal(actual))
        }
        StoreError::Conflict { .. } => Ok(SkipReason::LostClaim),
        StoreError::OwnerConflict { actual, .. } => {
            warn!(
                owner = actual.as_deref().unwrap_or("unknown"),
                "Job was taken over by another delivery; dropping this run"
            );
            Ok(SkipReason::LostClaim)
        }
        err => Err(err.into()),
    }
}

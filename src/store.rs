use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::error::StoreError;
use crate::job::{
    Job, JobFilter, JobId, JobMetrics, JobStatus, JobUpdate, StageResult, UpdateRejection,
};

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, job: &Job) -> Result<(), StoreError>;

    async fn get(&self, id: JobId) -> Result<Job, StoreError>;

    /// Atomic partial update. Returns the record as written.
    async fn update(&self, id: JobId, update: JobUpdate) -> Result<Job, StoreError>;

    /// Jobs in insertion order, optionally filtered by status.
    async fn list(&self, filter: JobFilter, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Upserts the result keyed by `(job_id, index)`. Only the delivery that
    /// currently owns the processing job may write.
    async fn record_stage(&self, result: &StageResult, owner: &str) -> Result<(), StoreError>;

    async fn stage_results(&self, id: JobId) -> Result<Vec<StageResult>, StoreError>;

    /// Drops every stage result of a processing job owned by `owner`.
    async fn clear_stage_results(&self, id: JobId, owner: &str) -> Result<(), StoreError>;

    async fn put_metrics(&self, metrics: &JobMetrics) -> Result<(), StoreError>;

    async fn metrics(&self, id: JobId) -> Result<Option<JobMetrics>, StoreError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    jobs: Vec<Job>,
    #[serde(skip)]
    positions: HashMap<JobId, usize>,
    stage_results: BTreeMap<JobId, BTreeMap<usize, StageResult>>,
    metrics: BTreeMap<JobId, JobMetrics>,
}

impl StoreState {
    fn reindex(&mut self) {
        self.positions = self
            .jobs
            .iter()
            .enumerate()
            .map(|(idx, job)| (job.id, idx))
            .collect();
    }

    fn job_mut(&mut self, id: JobId) -> Result<&mut Job, StoreError> {
        let idx = *self.positions.get(&id).ok_or(StoreError::NotFound(id))?;
        Ok(&mut self.jobs[idx])
    }

    fn ensure_owner(&self, id: JobId, owner: &str) -> Result<(), StoreError> {
        let idx = *self.positions.get(&id).ok_or(StoreError::NotFound(id))?;
        let job = &self.jobs[idx];
        if job.status != JobStatus::Processing {
            return Err(StoreError::Conflict {
                id,
                expected: JobStatus::Processing,
                actual: job.status,
            });
        }
        if job.delivery_ref.as_deref() != Some(owner) {
            return Err(StoreError::OwnerConflict {
                id,
                expected: owner.to_string(),
                actual: job.delivery_ref.clone(),
            });
        }
        Ok(())
    }

    fn ensure_known(&self, id: JobId) -> Result<(), StoreError> {
        if self.positions.contains_key(&id) {
            Ok(())
        } else {
            Err(StoreError::NotFound(id))
        }
    }
}

/// Mutex-guarded job store. When opened over a snapshot path every mutation
/// rewrites the snapshot (temp file + rename) before the lock is released.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    state: Mutex<StoreState>,
    snapshot: Option<PathBuf>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let mut state = if path.exists() {
            let content = fs::read_to_string(path).map_err(|err| {
                StoreError::Unavailable(format!(
                    "failed to read store snapshot {}: {err}",
                    path.display()
                ))
            })?;
            serde_json::from_str::<StoreState>(&content).map_err(|err| {
                StoreError::Unavailable(format!(
                    "failed to parse store snapshot {}: {err}",
                    path.display()
                ))
            })?
        } else {
            StoreState::default()
        };
        state.reindex();
        info!(jobs = state.jobs.len(), "Job store snapshot loaded");

        Ok(Self {
            state: Mutex::new(state),
            snapshot: Some(path.to_path_buf()),
        })
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot.as_deref()
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".into()))
    }

    fn persist(&self, state: &StoreState) -> Result<(), StoreError> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|err| {
                StoreError::Unavailable(format!(
                    "failed to create store directory {}: {err}",
                    parent.display()
                ))
            })?;
        }
        let body = serde_json::to_vec_pretty(state)
            .map_err(|err| StoreError::Unavailable(format!("failed to encode snapshot: {err}")))?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, body).map_err(|err| {
            StoreError::Unavailable(format!("failed to write {}: {err}", tmp.display()))
        })?;
        fs::rename(&tmp, path).map_err(|err| {
            StoreError::Unavailable(format!("failed to replace {}: {err}", path.display()))
        })?;
        debug!(path = %path.display(), "Store snapshot written");
        Ok(())
    }

    /// Runs `mutate` on a scratch copy and commits it only if the snapshot
    /// write succeeds, so a failed persist never leaves memory ahead of disk.
    fn mutate<T>(
        &self,
        mutate: impl FnOnce(&mut StoreState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut guard = self.lock()?;
        if self.snapshot.is_none() {
            return mutate(&mut guard);
        }
        let mut scratch = StoreState {
            jobs: guard.jobs.clone(),
            positions: guard.positions.clone(),
            stage_results: guard.stage_results.clone(),
            metrics: guard.metrics.clone(),
        };
        let value = mutate(&mut scratch)?;
        self.persist(&scratch)?;
        *guard = scratch;
        Ok(value)
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn create(&self, job: &Job) -> Result<(), StoreError> {
        self.mutate(|state| {
            if state.positions.contains_key(&job.id) {
                return Err(StoreError::DuplicateId(job.id));
            }
            state.positions.insert(job.id, state.jobs.len());
            state.jobs.push(job.clone());
            Ok(())
        })
    }

    async fn get(&self, id: JobId) -> Result<Job, StoreError> {
        let guard = self.lock()?;
        let idx = *guard.positions.get(&id).ok_or(StoreError::NotFound(id))?;
        Ok(guard.jobs[idx].clone())
    }

    #[instrument(skip(self, update), fields(job_id = %id, status = ?update.status))]
    async fn update(&self, id: JobId, update: JobUpdate) -> Result<Job, StoreError> {
        self.mutate(|state| {
            let job = state.job_mut(id)?;
            job.apply(&update).map_err(|rejection| match rejection {
                UpdateRejection::Conflict { expected, actual } => StoreError::Conflict {
                    id,
                    expected,
                    actual,
                },
                UpdateRejection::OwnerMismatch { expected, actual } => StoreError::OwnerConflict {
                    id,
                    expected,
                    actual,
                },
                UpdateRejection::InvalidTransition { from, to } => {
                    StoreError::InvalidTransition { id, from, to }
                }
                UpdateRejection::InvalidState(reason) => StoreError::InvalidState { id, reason },
            })?;
            Ok(job.clone())
        })
    }

    async fn list(&self, filter: JobFilter, limit: usize) -> Result<Vec<Job>, StoreError> {
        let guard = self.lock()?;
        Ok(guard
            .jobs
            .iter()
            .filter(|job| filter.matches(job))
            .take(limit)
            .cloned()
            .collect())
    }

    #[instrument(skip(self, result), fields(job_id = %result.job_id, stage = %result.stage))]
    async fn record_stage(&self, result: &StageResult, owner: &str) -> Result<(), StoreError> {
        self.mutate(|state| {
            state.ensure_owner(result.job_id, owner)?;
            state
                .stage_results
                .entry(result.job_id)
                .or_default()
                .insert(result.index, result.clone());
            Ok(())
        })
    }

    async fn stage_results(&self, id: JobId) -> Result<Vec<StageResult>, StoreError> {
        let guard = self.lock()?;
        guard.ensure_known(id)?;
        Ok(guard
            .stage_results
            .get(&id)
            .map(|results| results.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn clear_stage_results(&self, id: JobId, owner: &str) -> Result<(), StoreError> {
        self.mutate(|state| {
            state.ensure_owner(id, owner)?;
            state.stage_results.remove(&id);
            Ok(())
        })
    }

    async fn put_metrics(&self, metrics: &JobMetrics) -> Result<(), StoreError> {
        self.mutate(|state| {
            state.ensure_known(metrics.job_id)?;
            state.metrics.insert(metrics.job_id, metrics.clone());
            Ok(())
        })
    }

    async fn metrics(&self, id: JobId) -> Result<Option<JobMetrics>, StoreError> {
        let guard = self.lock()?;
        guard.ensure_known(id)?;
        Ok(guard.metrics.get(&id).cloned())
    }
}

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};

use crate::broker::Broker;
use crate::pipeline::{PipelineExecutor, RunOutcome};

/// Pause after a failed dequeue before asking the broker again.
const DEQUEUE_RETRY_DELAY: Duration = Duration::from_millis(250);

/// N identical consumers pulling from one broker. Each worker handles one
/// delivery at a time; a job is never split across workers.
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(workers: usize, executor: Arc<PipelineExecutor>, broker: Arc<dyn Broker>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = (0..workers.max(1))
            .map(|worker_id| {
                let executor = executor.clone();
                let broker = broker.clone();
                let shutdown = shutdown_rx.clone();
                let span = tracing::info_span!("worker", worker_id);
                tokio::spawn(run_worker(executor, broker, shutdown).instrument(span))
            })
            .collect::<Vec<_>>();
        info!(workers = handles.len(), "Worker pool started");
        Self {
            shutdown_tx,
            handles,
        }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Stops taking new deliveries and waits for in-flight jobs to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        self.join().await;
    }

    /// Waits for every worker to exit on its own, e.g. after the broker closes.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(err) = handle.await {
                error!(error = %err, "Worker task ended abnormally");
            }
        }
        info!("Worker pool stopped");
    }
}

async fn run_worker(
    executor: Arc<PipelineExecutor>,
    broker: Arc<dyn Broker>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("Worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        let next = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            next = broker.dequeue() => next,
        };

        let delivery = match next {
            Ok(Some(delivery)) => delivery,
            Ok(None) => {
                debug!("Broker closed");
                break;
            }
            Err(err) => {
                warn!(error = %err, "Dequeue failed");
                tokio::time::sleep(DEQUEUE_RETRY_DELAY).await;
                continue;
            }
        };

        match executor.handle(&delivery).await {
            Ok(RunOutcome::Completed) => {}
            Ok(RunOutcome::Failed { stage, error }) => {
                debug!(job_id = %delivery.job_id, stage = %stage, error = %error, "Job failed")
            }
            Ok(RunOutcome::Skipped(reason)) => {
                debug!(job_id = %delivery.job_id, reason = ?reason, "Delivery skipped")
            }
            Err(err) => {
                error!(job_id = %delivery.job_id, error = %err, "Delivery left for redelivery")
            }
        }
    }
    debug!("Worker stopped");
}

//! Durable job executor
//!
//! Submission persists a `queued` row before anything else happens, then
//! nudges the worker pool over a flume channel. Workers claim jobs with a
//! compare-and-swap on the row, so delivery is at-least-once and every task
//! implementation is idempotent on its arguments. A polling sweep recovers
//! jobs submitted while no worker was listening and requeues abandoned
//! `running` rows.

pub mod maintenance;
pub mod process_document;

use crate::blob::BlobStore;
use crate::chunker::Chunker;
use crate::classifier::Classifier;
use crate::config::CoreConfig;
use crate::embedder::Embedder;
use crate::error::{CoreError, Result};
use crate::extract::Extractor;
use crate::store::jobs::JobRow;
use crate::store::Store;
use crate::vector::VectorIndex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Task types drained by the worker pool
pub const PROCESS_DOCUMENT: &str = "process_document";
pub const RECLASSIFY_DOCUMENT: &str = "reclassify_document";
pub const GENERATE_EMPLOYEE_EMBEDDING: &str = "generate_employee_embedding";
pub const SYNC_EXTERNAL_SOURCE: &str = "sync_external_source";
pub const CONSOLIDATE_MEMORIES: &str = "consolidate_memories";
pub const DELETE_DOCUMENT: &str = "delete_document";

/// Everything a worker needs; immutable after startup and cheap to clone
#[derive(Clone)]
pub struct JobContext {
    pub store: Store,
    pub blob: Arc<dyn BlobStore>,
    pub embedder: Arc<Embedder>,
    pub index: Arc<dyn VectorIndex>,
    pub classifier: Arc<Classifier>,
    pub extractor: Arc<Extractor>,
    pub chunker: Arc<Chunker>,
    pub config: Arc<CoreConfig>,
}

/// Durable task queue with a fixed-concurrency worker pool
pub struct JobExecutor {
    ctx: JobContext,
    wake_tx: flume::Sender<()>,
    wake_rx: flume::Receiver<()>,
}

impl JobExecutor {
    pub fn new(ctx: JobContext) -> Arc<Self> {
        let (wake_tx, wake_rx) = flume::unbounded();
        Arc::new(Self {
            ctx,
            wake_tx,
            wake_rx,
        })
    }

    /// Persist a job and wake a worker; the row exists before the nudge so a
    /// lost wakeup only delays execution until the next poll tick
    pub async fn submit(&self, tenant: &str, job_type: &str, args: Value) -> Result<Uuid> {
        let job_id = self.ctx.store.insert_job(tenant, job_type, &args).await?;
        let _ = self.wake_tx.try_send(());
        Ok(job_id)
    }

    /// Spawn the worker pool; returns handles the caller aborts on shutdown
    pub fn spawn_workers(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let concurrency = self.ctx.config.queue.worker_concurrency;
        info!(concurrency, "starting job workers");

        (0..concurrency)
            .map(|worker| {
                let executor = Arc::clone(self);
                tokio::spawn(async move {
                    executor.worker_loop(worker).await;
                })
            })
            .collect()
    }

    async fn worker_loop(&self, worker: usize) {
        let poll = Duration::from_secs(self.ctx.config.queue.poll_interval_secs.max(1));
        let visibility = Duration::from_secs(self.ctx.config.queue.visibility_timeout_secs);

        loop {
            match self.ctx.store.claim_next_job().await {
                Ok(Some(job)) => {
                    self.run_job(job).await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    error!(worker, "failed to poll queue: {}", e);
                }
            }

            if let Err(e) = self.ctx.store.requeue_stale_jobs(visibility).await {
                warn!(worker, "stale-job sweep failed: {}", e);
            }

            // idle: wait for a submit nudge or the next poll tick
            let _ = tokio::time::timeout(poll, self.wake_rx.recv_async()).await;
        }
    }

    /// Run one claimed job and apply the retry policy
    pub async fn run_job(&self, job: JobRow) {
        info!(job = %job.job_id, job_type = %job.job_type, attempt = job.attempts, "job started");

        let outcome = self.dispatch(&job).await;
        match outcome {
            Ok(result) => {
                if let Err(e) = self.ctx.store.complete_job(job.job_id, &result).await {
                    error!(job = %job.job_id, "failed to record completion: {}", e);
                }
            }
            Err(e) if e.is_transient() && job.attempts < self.ctx.config.queue.max_attempts as i64 => {
                let delay = retry_delay(job.attempts as u32);
                warn!(
                    job = %job.job_id,
                    attempt = job.attempts,
                    delay_secs = delay.as_secs(),
                    "transient failure, requeueing: {}",
                    e
                );
                if let Err(e) = self.ctx.store.requeue_job(job.job_id, delay).await {
                    error!(job = %job.job_id, "failed to requeue: {}", e);
                }
            }
            Err(e) => {
                let permanent = e.into_permanent();
                self.on_permanent_failure(&job, &permanent).await;
                if let Err(e) = self
                    .ctx
                    .store
                    .fail_job(job.job_id, &permanent.to_string())
                    .await
                {
                    error!(job = %job.job_id, "failed to record failure: {}", e);
                }
            }
        }
    }

    async fn dispatch(&self, job: &JobRow) -> Result<Value> {
        match job.job_type.as_str() {
            PROCESS_DOCUMENT => process_document::run(&self.ctx, job).await,
            RECLASSIFY_DOCUMENT => maintenance::reclassify_document(&self.ctx, job).await,
            GENERATE_EMPLOYEE_EMBEDDING => {
                maintenance::generate_employee_embedding(&self.ctx, job).await
            }
            SYNC_EXTERNAL_SOURCE => maintenance::sync_external_source(self, job).await,
            CONSOLIDATE_MEMORIES => maintenance::consolidate_memories(&self.ctx, job).await,
            DELETE_DOCUMENT => maintenance::delete_document_artifacts(&self.ctx, job).await,
            other => Err(CoreError::PermanentFailure(format!(
                "unknown job type: {}",
                other
            ))),
        }
    }

    /// Keep dependent rows consistent when a job gives up for good
    async fn on_permanent_failure(&self, job: &JobRow, error: &CoreError) {
        if job.job_type == PROCESS_DOCUMENT {
            if let Some(doc_id) = process_document::doc_id_from_args(&job.args) {
                if let Err(e) = self
                    .ctx
                    .store
                    .set_document_status(doc_id, crate::store::documents::DocumentStatus::Failed)
                    .await
                {
                    error!(document = %doc_id, "failed to mark document failed: {}", e);
                }
            }
        }
        error!(job = %job.job_id, kind = error.kind(), "job permanently failed: {}", error);
    }

    pub fn context(&self) -> &JobContext {
        &self.ctx
    }
}

fn retry_delay(attempt: u32) -> Duration {
    // 5s, 10s, 20s... capped at two minutes
    let secs = 5u64.saturating_mul(2u64.pow(attempt.saturating_sub(1).min(5)));
    Duration::from_secs(secs.min(120))
}

//! Run executor
//!
//! Bounds how many assembly runs execute at once with a tokio `Semaphore`
//! sized from the [`ConcurrencyPlan`]. Each run's stages are blocking engine
//! calls, so a run executes on the blocking pool and reports progress into the
//! shared metrics from there.

use crate::concurrency::ConcurrencyPlan;
use crate::error::{AssemblyError, Stage};
use crate::metrics::{RunMetrics, SharedMetrics, MAX_FINISHED_RUNS};
use crate::pipeline::{Assembler, AssemblyRequest, CancelFlag, Progress};
use serde::Serialize;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Terminal outcome of one run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub output: Option<PathBuf>,
    pub duration_secs: Option<f64>,
    pub error: Option<String>,
    pub failed_stage: Option<Stage>,
    pub failed_input: Option<PathBuf>,
    pub cancelled: bool,
}

impl RunReport {
    fn from_result(run_id: &str, result: &Result<crate::clip::AssemblyResult, AssemblyError>) -> Self {
        match result {
            Ok(done) => Self {
                run_id: run_id.to_string(),
                output: Some(done.path.clone()),
                duration_secs: Some(done.duration_secs),
                error: None,
                failed_stage: None,
                failed_input: None,
                cancelled: false,
            },
            Err(e) => Self {
                run_id: run_id.to_string(),
                output: None,
                duration_secs: None,
                error: Some(e.to_string()),
                failed_stage: e.stage(),
                failed_input: e.input().map(|p| p.to_path_buf()),
                cancelled: e.is_cancelled(),
            },
        }
    }

    fn aborted(run_id: &str, reason: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            output: None,
            duration_secs: None,
            error: Some(reason.to_string()),
            failed_stage: None,
            failed_input: None,
            cancelled: false,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Executes assembly runs with bounded concurrency
pub struct RunExecutor {
    assembler: Arc<Assembler>,
    semaphore: Arc<Semaphore>,
    concurrency_plan: ConcurrencyPlan,
    metrics: SharedMetrics,
    /// Cancellation flags of queued and running runs
    active: Mutex<HashMap<String, CancelFlag>>,
}

impl RunExecutor {
    pub fn new(assembler: Arc<Assembler>, plan: ConcurrencyPlan, metrics: SharedMetrics) -> Self {
        let permits = plan.max_concurrent_runs.max(1) as usize;
        Self {
            assembler,
            semaphore: Arc::new(Semaphore::new(permits)),
            concurrency_plan: plan,
            metrics,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn concurrency_plan(&self) -> &ConcurrencyPlan {
        &self.concurrency_plan
    }

    pub fn metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    /// Try to acquire a run slot without waiting
    pub fn try_acquire_permit(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    /// Request cancellation of one run; false if it is not queued or running
    pub fn cancel(&self, run_id: &str) -> bool {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        match active.get(run_id) {
            Some(flag) => {
                flag.cancel();
                tracing::info!(run_id, "cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Request cancellation of every queued and running run
    pub fn cancel_all(&self) -> usize {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        for flag in active.values() {
            flag.cancel();
        }
        if !active.is_empty() {
            tracing::info!(runs = active.len(), "cancelling all runs");
        }
        active.len()
    }

    /// Queue, run and report one assembly
    ///
    /// Never fails: every outcome, including cancellation while queued, ends
    /// in a [`RunReport`]. A run id that is already queued or running is
    /// rejected without touching the active run.
    pub async fn execute(&self, request: AssemblyRequest) -> RunReport {
        let run_id = request.run_id.clone();
        let cancel = CancelFlag::new();
        let registered = {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            match active.entry(run_id.clone()) {
                Entry::Occupied(_) => false,
                Entry::Vacant(slot) => {
                    slot.insert(cancel.clone());
                    true
                }
            }
        };
        if !registered {
            tracing::warn!(run_id = %run_id, "run id already active, rejecting");
            return RunReport::aborted(&run_id, "run id already active");
        }

        {
            let mut m = self.metrics.write().await;
            m.runs.push(RunMetrics {
                id: run_id.clone(),
                stage: "queued".to_string(),
                clips: request.clips.len(),
                clips_normalized: 0,
                cache_hits: 0,
                output_path: request.output.to_string_lossy().to_string(),
                error: None,
            });
            m.queue_len += 1;
            m.touch();
        }
        tracing::info!(run_id = %run_id, clips = request.clips.len(), "run queued");

        let permit = self.semaphore.clone().acquire_owned().await;

        {
            let mut m = self.metrics.write().await;
            m.queue_len = m.queue_len.saturating_sub(1);
            m.running_runs += 1;
        }

        let report = match permit {
            Ok(permit) => {
                let assembler = self.assembler.clone();
                let metrics = self.metrics.clone();
                let id = run_id.clone();
                let joined = tokio::task::spawn_blocking(move || {
                    let observer = |progress: Progress| {
                        let mut m = metrics.blocking_write();
                        if let Some(run) = m.run_mut(&id) {
                            match progress {
                                Progress::StageStarted(stage) => run.stage = stage.to_string(),
                                Progress::ClipNormalized { from_cache } => {
                                    run.clips_normalized += 1;
                                    if from_cache {
                                        run.cache_hits += 1;
                                    }
                                }
                            }
                        }
                        m.touch();
                    };
                    let result = assembler.assemble_with(&request, &cancel, &observer);
                    drop(permit);
                    RunReport::from_result(&request.run_id, &result)
                })
                .await;

                joined.unwrap_or_else(|e| {
                    tracing::error!(run_id = %run_id, error = %e, "run task panicked");
                    RunReport::aborted(&run_id, "run task panicked")
                })
            }
            Err(_) => RunReport::aborted(&run_id, "executor shut down"),
        };

        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&run_id);
        self.record_outcome(&report).await;
        report
    }

    async fn record_outcome(&self, report: &RunReport) {
        let cache = self.assembler.cache().stats();
        let mut m = self.metrics.write().await;
        m.running_runs = m.running_runs.saturating_sub(1);
        m.cache_hits = cache.hits;
        m.cache_misses = cache.misses;

        let stage = if report.succeeded() {
            m.completed_runs += 1;
            tracing::info!(
                run_id = %report.run_id,
                duration_secs = report.duration_secs.unwrap_or_default(),
                "run completed"
            );
            "completed"
        } else if report.cancelled {
            m.cancelled_runs += 1;
            tracing::info!(run_id = %report.run_id, "run cancelled");
            "cancelled"
        } else {
            m.failed_runs += 1;
            tracing::error!(
                run_id = %report.run_id,
                stage = ?report.failed_stage,
                input = ?report.failed_input,
                error = report.error.as_deref().unwrap_or_default(),
                "run failed"
            );
            "failed"
        };

        if let Some(run) = m.run_mut(&report.run_id) {
            run.stage = stage.to_string();
            run.error = report.error.clone();
        }
        m.prune_finished(MAX_FINISHED_RUNS);
        m.touch();
    }
}

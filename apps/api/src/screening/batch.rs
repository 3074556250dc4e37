//! One background batch run: scores every pending item of a task through
//! the bounded executor, then ranks, finalizes and records metrics.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::profile::JobProfile;
use crate::models::screening::{
    ResumeCounts, RunMetric, ScreeningResult, ScreeningStatus, ScreeningTask, ScreeningTaskResume,
};
use crate::screening::collector::{AggregateStats, ProcessResult, ResultCollector};
use crate::screening::executor::{run_bounded, ItemError};
use crate::screening::matching::{MatchRequest, MatchResult};
use crate::screening::service::ScreeningService;
use crate::screening::store::TaskResumeUpdate;

/// Why a worker produced no successful outcome.
#[derive(Debug)]
pub enum ItemFailure {
    /// The item left `pending` before the worker got to it (task cancelled).
    Skipped,
    /// Recorded on the item as `failed` with this message.
    Failed(String),
}

pub struct BatchRun {
    service: ScreeningService,
    task: ScreeningTask,
    job: Arc<JobProfile>,
    collector: ResultCollector,
}

impl BatchRun {
    pub fn new(service: ScreeningService, task: ScreeningTask, job: Arc<JobProfile>) -> Self {
        Self {
            service,
            task,
            job,
            collector: ResultCollector::new(),
        }
    }

    pub async fn execute(
        self,
        items: Vec<ScreeningTaskResume>,
        cancel: CancellationToken,
    ) -> Result<(), AppError> {
        let started = Instant::now();
        let task_id = self.task.id;
        let max_parallel = self.service.max_concurrency;
        let pending: Vec<ScreeningTaskResume> = items
            .into_iter()
            .filter(|item| item.status == ScreeningStatus::Pending)
            .collect();

        let run = Arc::new(self);
        let (worker_run, callback_run) = (Arc::clone(&run), Arc::clone(&run));

        let summary = run_bounded(
            pending,
            max_parallel,
            &cancel,
            move |item| {
                let run = Arc::clone(&worker_run);
                async move { run.process_item(item).await }
            },
            move |item, outcome| {
                let run = Arc::clone(&callback_run);
                async move { run.record_outcome(item, outcome).await }
            },
        )
        .await;

        debug!(
            task_id = %task_id,
            dispatched = summary.dispatched,
            skipped = summary.skipped,
            "Executor drained"
        );

        let stopped_early = summary.was_cancelled();
        run.finalize(stopped_early || cancel.is_cancelled(), stopped_early, started)
            .await
    }

    // ────────────────────────────────────────────────────────────────────────
    // Per item
    // ────────────────────────────────────────────────────────────────────────

    async fn process_item(&self, item: ScreeningTaskResume) -> Result<ProcessResult, ItemFailure> {
        let store = &self.service.store;

        match store
            .transition_task_resume(item.id, &[ScreeningStatus::Pending], TaskResumeUpdate::running())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(task_id = %self.task.id, resume_id = %item.resume_id, "Item no longer pending; skipping");
                return Err(ItemFailure::Skipped);
            }
            Err(e) => {
                let message = format!("could not mark resume running: {e}");
                self.mark_item(&item, &[ScreeningStatus::Pending], TaskResumeUpdate::failed(&message))
                    .await;
                return Err(ItemFailure::Failed(message));
            }
        }

        match self.score(&item).await {
            Ok(matched) => {
                self.mark_item(
                    &item,
                    &[ScreeningStatus::Running],
                    TaskResumeUpdate::completed(matched.overall_score),
                )
                .await;
                Ok(ProcessResult::succeeded(
                    matched.overall_score,
                    matched.match_level,
                    matched.total_usage.input_tokens,
                    matched.total_usage.output_tokens,
                ))
            }
            Err(message) => {
                warn!(
                    task_id = %self.task.id,
                    resume_id = %item.resume_id,
                    "Screening item failed: {message}"
                );
                self.mark_item(&item, &[ScreeningStatus::Running], TaskResumeUpdate::failed(&message))
                    .await;
                Err(ItemFailure::Failed(message))
            }
        }
    }

    /// Looks up the resume, runs the match through the audit tracker and
    /// persists the result row.
    async fn score(&self, item: &ScreeningTaskResume) -> Result<MatchResult, String> {
        let resume = match self.service.profiles.get_resume(item.resume_id).await {
            Ok(Some(resume)) => Arc::new(resume),
            Ok(None) => return Err(format!("resume {} not found", item.resume_id)),
            Err(e) => return Err(format!("resume lookup failed: {e}")),
        };

        let tracker = self
            .service
            .audit
            .tracker(self.task.id, item.resume_id, &self.task.scorer_version);
        let request = MatchRequest {
            job: Some(Arc::clone(&self.job)),
            resume: Some(resume),
            weight_overrides: self.task.weights,
            model_config: self.task.model_config.clone(),
        };

        let matched = self
            .service
            .matcher
            .match_resume(request, Arc::new(tracker))
            .await
            .map_err(|e| e.to_string())?;
        if matched.dimension_scores.is_empty() {
            return Err("matching returned an empty result".to_string());
        }

        let dimension_scores = serde_json::to_value(&matched.dimension_scores)
            .map_err(|e| format!("failed to serialize dimension scores: {e}"))?;
        let result = ScreeningResult {
            id: Uuid::new_v4(),
            task_id: self.task.id,
            resume_id: item.resume_id,
            job_id: self.task.job_id,
            overall_score: matched.overall_score,
            match_level: matched.match_level.clone(),
            dimension_scores,
            recommendations: matched.recommendations.clone(),
            weights: matched.weights,
            input_tokens: matched.total_usage.input_tokens,
            output_tokens: matched.total_usage.output_tokens,
            scorer_version: self.task.scorer_version.clone(),
            rank: None,
            created_at: Utc::now(),
        };
        self.service
            .store
            .insert_result(&result)
            .await
            .map_err(|e| format!("failed to persist result: {e}"))?;

        Ok(matched)
    }

    async fn record_outcome(
        &self,
        item: ScreeningTaskResume,
        outcome: Result<ProcessResult, ItemError<ItemFailure>>,
    ) {
        let result = match outcome {
            Ok(result) => result,
            Err(ItemError::Failed(ItemFailure::Skipped)) => return,
            Err(ItemError::Failed(ItemFailure::Failed(message))) => ProcessResult::failed(message),
            Err(ItemError::Panicked(message)) => {
                let message = format!("worker panicked: {message}");
                error!(task_id = %self.task.id, resume_id = %item.resume_id, "{message}");
                self.mark_item(
                    &item,
                    &[ScreeningStatus::Pending, ScreeningStatus::Running],
                    TaskResumeUpdate::failed(&message),
                )
                .await;
                ProcessResult::failed(message)
            }
        };

        self.collector.collect(&result);

        // Best effort; the final write below is authoritative.
        let counts = self.counts(&self.collector.snapshot());
        if let Err(e) = self.service.store.update_task_counts(self.task.id, counts).await {
            debug!(task_id = %self.task.id, "Progress write failed: {e}");
        }
    }

    async fn mark_item(
        &self,
        item: &ScreeningTaskResume,
        from: &[ScreeningStatus],
        update: TaskResumeUpdate,
    ) {
        let status = update.status;
        match self
            .service
            .store
            .transition_task_resume(item.id, from, update)
            .await
        {
            Ok(true) => {}
            Ok(false) => debug!(resume_id = %item.resume_id, "Item already left {from:?}; not marking {status}"),
            Err(e) => warn!(resume_id = %item.resume_id, "Failed to mark item {status}: {e}"),
        }
    }

    // ────────────────────────────────────────────────────────────────────────
    // Completion
    // ────────────────────────────────────────────────────────────────────────

    async fn finalize(
        &self,
        cancelled: bool,
        stopped_early: bool,
        started: Instant,
    ) -> Result<(), AppError> {
        let store = &self.service.store;
        let task_id = self.task.id;
        let stats = self.collector.snapshot();

        if stats.succeeded > 0 {
            if let Err(e) = self.rank_results().await {
                warn!(task_id = %task_id, "Ranking failed: {e}");
            }
        }

        if cancelled {
            store
                .cancel_task_resumes(
                    task_id,
                    &[ScreeningStatus::Pending, ScreeningStatus::Running],
                    "task cancelled before this resume was processed",
                )
                .await?;
        }
        if stopped_early {
            store
                .transition_task(
                    task_id,
                    &[ScreeningStatus::Running],
                    ScreeningStatus::Cancelled,
                    Utc::now(),
                )
                .await?;
        }

        let outcome = if stats.failed == 0 {
            ScreeningStatus::Completed
        } else {
            ScreeningStatus::Failed
        };
        let counts = self.counts(&stats);
        let final_status = store
            .finish_task(task_id, outcome, counts, Utc::now())
            .await?;

        let duration_ms = started.elapsed().as_millis() as u64;
        store
            .upsert_metric(&RunMetric {
                task_id,
                total: counts.total,
                succeeded: stats.succeeded,
                failed: stats.failed,
                average_score: stats.average_score(),
                match_level_histogram: stats.match_levels.clone(),
                input_tokens: stats.input_tokens,
                output_tokens: stats.output_tokens,
                duration_ms,
                scorer_version: self.task.scorer_version.clone(),
                created_at: Utc::now(),
            })
            .await?;

        self.service.registry.remove(task_id);

        info!(
            task_id = %task_id,
            status = %final_status,
            processed = stats.processed,
            succeeded = stats.succeeded,
            failed = stats.failed,
            duration_ms,
            "Screening task finished"
        );
        Ok(())
    }

    /// Ranks successful results by score, highest first; ties go to the
    /// lower resume id so reruns order identically.
    async fn rank_results(&self) -> Result<(), AppError> {
        let mut results = self.service.store.list_results(self.task.id).await?;
        results.sort_by(|a, b| {
            b.overall_score
                .total_cmp(&a.overall_score)
                .then(a.resume_id.cmp(&b.resume_id))
        });
        let ranks: Vec<(Uuid, u32)> = results
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id, i as u32 + 1))
            .collect();
        self.service.store.set_result_ranks(&ranks).await?;
        Ok(())
    }

    fn counts(&self, stats: &AggregateStats) -> ResumeCounts {
        ResumeCounts {
            total: self.task.counts.total,
            processed: stats.processed,
            succeeded: stats.succeeded,
            failed: stats.failed,
        }
    }
}

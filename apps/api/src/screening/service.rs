//! Screening orchestrator: task lifecycle, background batch runs and the
//! read-side projections over persisted state.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::screening::{
    ModelConfig, NodeKind, NodeRun, NodeRunStatus, ResumeCounts, RunMetric, ScreeningResult,
    ScreeningStatus, ScreeningTask, ScreeningTaskResume,
};
use crate::screening::audit::AuditRecorder;
use crate::screening::batch::BatchRun;
use crate::screening::matching::{BackendConfig, MatchingService};
use crate::screening::registry::CancelRegistry;
use crate::screening::store::{ProfileRepository, ScreeningStore, TaskFilter};
use crate::screening::weights::DimensionWeights;

pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTaskRequest {
    pub job_id: Uuid,
    pub creator: String,
    pub resume_ids: Vec<Uuid>,
    #[serde(default)]
    pub weights: Option<DimensionWeights>,
    #[serde(default)]
    pub model_config: Option<ModelConfig>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskProgress {
    pub task_id: Uuid,
    pub status: ScreeningStatus,
    pub counts: ResumeCounts,
    /// processed / total, 0 – 100.
    pub percent: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResumeProgress {
    pub task_resume_id: Uuid,
    pub resume_id: Uuid,
    pub status: ScreeningStatus,
    pub score: Option<f64>,
    pub error_message: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub nodes: BTreeMap<NodeKind, Option<NodeRunStatus>>,
}

#[derive(Clone)]
pub struct ScreeningService {
    pub(super) store: Arc<dyn ScreeningStore>,
    pub(super) profiles: Arc<dyn ProfileRepository>,
    pub(super) matcher: Arc<MatchingService>,
    pub(super) audit: AuditRecorder,
    pub(super) registry: CancelRegistry,
    pub(super) max_concurrency: usize,
    /// One supervisor per live batch run.
    supervisors: TaskTracker,
}

impl ScreeningService {
    pub fn new(
        store: Arc<dyn ScreeningStore>,
        profiles: Arc<dyn ProfileRepository>,
        matcher: Arc<MatchingService>,
        audit: AuditRecorder,
        max_concurrency: usize,
    ) -> Self {
        Self {
            store,
            profiles,
            matcher,
            audit,
            registry: CancelRegistry::new(),
            max_concurrency: max_concurrency.max(1),
            supervisors: TaskTracker::new(),
        }
    }

    // ────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ────────────────────────────────────────────────────────────────────────

    /// Persists a pending task and one pending item per distinct resume id.
    pub async fn create(&self, request: CreateTaskRequest) -> Result<Uuid, AppError> {
        let creator = request.creator.trim();
        if creator.is_empty() {
            return Err(AppError::Validation("creator is required".to_string()));
        }
        if request.job_id.is_nil() {
            return Err(AppError::Validation("job_id is required".to_string()));
        }
        if request.resume_ids.is_empty() {
            return Err(AppError::Validation(
                "at least one resume id is required".to_string(),
            ));
        }
        if request.resume_ids.iter().any(Uuid::is_nil) {
            return Err(AppError::Validation(
                "resume ids must not be nil".to_string(),
            ));
        }
        if let Some(weights) = &request.weights {
            weights.validate()?;
        }
        if let Some(model_config) = &request.model_config {
            BackendConfig::resolve(Some(model_config), self.matcher.default_backend())
                .map_err(|e| AppError::Validation(e.to_string()))?;
        }

        let mut seen = HashSet::new();
        let resume_ids: Vec<Uuid> = request
            .resume_ids
            .into_iter()
            .filter(|id| seen.insert(*id))
            .collect();

        let task = ScreeningTask {
            id: Uuid::new_v4(),
            job_id: request.job_id,
            creator: creator.to_string(),
            status: ScreeningStatus::Pending,
            counts: ResumeCounts {
                total: resume_ids.len() as u32,
                ..Default::default()
            },
            weights: request.weights,
            model_config: request.model_config,
            scorer_version: self.matcher.version().to_string(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        let items: Vec<ScreeningTaskResume> = resume_ids
            .into_iter()
            .map(|resume_id| ScreeningTaskResume {
                id: Uuid::new_v4(),
                task_id: task.id,
                resume_id,
                status: ScreeningStatus::Pending,
                score: None,
                error_message: None,
                processed_at: None,
            })
            .collect();

        self.store.create_task(&task, &items).await?;

        info!(
            task_id = %task.id,
            job_id = %task.job_id,
            creator = %task.creator,
            resumes = items.len(),
            "Created screening task"
        );
        Ok(task.id)
    }

    pub async fn start(&self, task_id: Uuid) -> Result<(), AppError> {
        self.start_with_token(task_id, &CancellationToken::new())
            .await
    }

    /// Like `start`, but the run's cancellation handle is a child of
    /// `parent`, so cancelling `parent` (e.g. on a deadline) stops the run
    /// the same way `cancel` does.
    pub async fn start_with_token(
        &self,
        task_id: Uuid,
        parent: &CancellationToken,
    ) -> Result<(), AppError> {
        let task = self.require_task(task_id).await?;
        match task.status {
            ScreeningStatus::Pending => {}
            ScreeningStatus::Running | ScreeningStatus::Completed => {
                info!(task_id = %task_id, status = %task.status, "Start ignored; task already {}", task.status);
                return Ok(());
            }
            ScreeningStatus::Failed | ScreeningStatus::Cancelled => {
                return Err(AppError::InvalidState(format!(
                    "task {task_id} is {} and cannot be restarted",
                    task.status
                )));
            }
        }

        let job = self
            .profiles
            .get_job(task.job_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("job profile {} not found", task.job_id)))?;
        let items = self.store.list_task_resumes(task_id).await?;

        let started_at = Utc::now();
        let won = self
            .store
            .transition_task(
                task_id,
                &[ScreeningStatus::Pending],
                ScreeningStatus::Running,
                started_at,
            )
            .await?;
        if !won {
            // Another caller started (or deleted) it in between.
            return match self.store.get_task(task_id).await? {
                Some(_) => Ok(()),
                None => Err(AppError::NotFound(format!("task {task_id} not found"))),
            };
        }

        let token = parent.child_token();
        self.registry.insert(task_id, token.clone());

        let task = ScreeningTask {
            status: ScreeningStatus::Running,
            started_at: Some(started_at),
            ..task
        };
        let run = BatchRun::new(self.clone(), task, Arc::new(job));
        let handle = tokio::spawn(run.execute(items, token));
        self.supervise(task_id, handle);

        info!(task_id = %task_id, max_concurrency = self.max_concurrency, "Started screening task");
        Ok(())
    }

    /// Stops dispatching new items. Items already being scored finish and
    /// keep their own outcome; items not yet started end cancelled.
    pub async fn cancel(&self, task_id: Uuid) -> Result<(), AppError> {
        let task = self.require_task(task_id).await?;
        if task.status != ScreeningStatus::Running {
            return Err(AppError::InvalidState(format!(
                "task {task_id} is {}; only running tasks can be cancelled",
                task.status
            )));
        }

        match self.registry.remove(task_id) {
            Some(token) => token.cancel(),
            None => warn!(task_id = %task_id, "No live run registered for running task"),
        }

        let cancelled = self
            .store
            .transition_task(
                task_id,
                &[ScreeningStatus::Running],
                ScreeningStatus::Cancelled,
                Utc::now(),
            )
            .await?;
        if !cancelled {
            return Err(AppError::InvalidState(format!(
                "task {task_id} finished before it could be cancelled"
            )));
        }

        let skipped = self
            .store
            .cancel_task_resumes(
                task_id,
                &[ScreeningStatus::Pending],
                "task cancelled before this resume was processed",
            )
            .await?;

        info!(task_id = %task_id, skipped, "Cancelled screening task");
        Ok(())
    }

    /// Removes a task that is not running, with everything recorded under it.
    pub async fn delete(&self, task_id: Uuid) -> Result<(), AppError> {
        let task = self.require_task(task_id).await?;
        if task.status == ScreeningStatus::Running {
            return Err(AppError::InvalidState(format!(
                "task {task_id} is running; cancel it before deleting"
            )));
        }
        if !self.store.delete_task(task_id).await? {
            return Err(AppError::NotFound(format!("task {task_id} not found")));
        }
        info!(task_id = %task_id, "Deleted screening task");
        Ok(())
    }

    // ────────────────────────────────────────────────────────────────────────
    // Reads
    // ────────────────────────────────────────────────────────────────────────

    pub async fn get_task(&self, task_id: Uuid) -> Result<ScreeningTask, AppError> {
        self.require_task(task_id).await
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<ScreeningTask>, AppError> {
        Ok(self.store.list_tasks(filter).await?)
    }

    pub async fn list_results(&self, task_id: Uuid) -> Result<Vec<ScreeningResult>, AppError> {
        self.require_task(task_id).await?;
        Ok(self.store.list_results(task_id).await?)
    }

    pub async fn get_result(&self, result_id: Uuid) -> Result<ScreeningResult, AppError> {
        self.store
            .get_result(result_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("result {result_id} not found")))
    }

    pub async fn get_metrics(&self, task_id: Uuid) -> Result<RunMetric, AppError> {
        self.require_task(task_id).await?;
        self.store.get_metric(task_id).await?.ok_or_else(|| {
            AppError::NotFound(format!(
                "metrics for task {task_id} are not available until it finishes"
            ))
        })
    }

    pub async fn task_progress(&self, task_id: Uuid) -> Result<TaskProgress, AppError> {
        let task = self.require_task(task_id).await?;
        let percent = if task.counts.total == 0 {
            0.0
        } else {
            task.counts.processed as f64 * 100.0 / task.counts.total as f64
        };
        Ok(TaskProgress {
            task_id,
            status: task.status,
            counts: task.counts,
            percent,
            started_at: task.started_at,
            finished_at: task.finished_at,
        })
    }

    pub async fn resume_progress(&self, task_id: Uuid) -> Result<Vec<ResumeProgress>, AppError> {
        self.require_task(task_id).await?;
        let items = self.store.list_task_resumes(task_id).await?;

        let mut progress = Vec::with_capacity(items.len());
        for item in items {
            let runs = self.store.list_node_runs(item.id).await?;
            progress.push(ResumeProgress {
                task_resume_id: item.id,
                resume_id: item.resume_id,
                status: item.status,
                score: item.score,
                error_message: item.error_message,
                processed_at: item.processed_at,
                nodes: node_status_map(&runs),
            });
        }
        Ok(progress)
    }

    /// One entry per pipeline step; `None` until that step has run at least
    /// once for this resume.
    pub async fn node_run_status(
        &self,
        task_id: Uuid,
        resume_id: Uuid,
    ) -> Result<BTreeMap<NodeKind, Option<NodeRunStatus>>, AppError> {
        let item = self
            .store
            .find_task_resume(task_id, resume_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("resume {resume_id} is not part of task {task_id}"))
            })?;
        let runs = self.store.list_node_runs(item.id).await?;
        Ok(node_status_map(&runs))
    }

    async fn require_task(&self, task_id: Uuid) -> Result<ScreeningTask, AppError> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("task {task_id} not found")))
    }

    // ────────────────────────────────────────────────────────────────────────
    // Supervision
    // ────────────────────────────────────────────────────────────────────────

    /// Watches a detached batch run so a panic or error is logged and the
    /// task does not stay running forever.
    fn supervise(&self, task_id: Uuid, handle: JoinHandle<Result<(), AppError>>) {
        let service = self.clone();
        self.supervisors.spawn(async move {
            let reason = match handle.await {
                Ok(Ok(())) => return,
                Ok(Err(e)) => format!("batch run failed: {e}"),
                Err(e) if e.is_panic() => format!("batch run panicked: {e}"),
                Err(e) => format!("batch run aborted: {e}"),
            };
            error!(task_id = %task_id, "{reason}");
            service.abandon_run(task_id, &reason).await;
        });
    }

    async fn abandon_run(&self, task_id: Uuid, reason: &str) {
        self.registry.remove(task_id);

        if let Err(e) = self
            .store
            .cancel_task_resumes(
                task_id,
                &[ScreeningStatus::Pending, ScreeningStatus::Running],
                reason,
            )
            .await
        {
            error!(task_id = %task_id, "Failed to close items of abandoned run: {e}");
        }
        if let Err(e) = self
            .store
            .transition_task(
                task_id,
                &[ScreeningStatus::Running],
                ScreeningStatus::Failed,
                Utc::now(),
            )
            .await
        {
            error!(task_id = %task_id, "Failed to mark abandoned run failed: {e}");
        }
    }

    /// Cancels every live run and waits until each has finalized or been
    /// abandoned, so no task is left `running` when the process exits.
    pub async fn shutdown(&self) {
        let live = self.registry.cancel_all();
        if live > 0 {
            info!(live, "Cancelling live screening runs");
        }
        self.supervisors.close();
        self.supervisors.wait().await;
    }

    #[cfg(test)]
    pub(crate) fn has_live_run(&self, task_id: Uuid) -> bool {
        self.registry.contains(task_id)
    }
}

/// Latest attempt wins for each node.
pub fn node_status_map(runs: &[NodeRun]) -> BTreeMap<NodeKind, Option<NodeRunStatus>> {
    let mut latest: BTreeMap<NodeKind, (u32, NodeRunStatus)> = BTreeMap::new();
    for run in runs {
        let entry = latest.entry(run.node).or_insert((run.attempt, run.status));
        if run.attempt >= entry.0 {
            *entry = (run.attempt, run.status);
        }
    }

    NodeKind::ALL
        .into_iter()
        .map(|node| (node, latest.get(&node).map(|(_, status)| *status)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::models::profile::{JobProfile, ResumeDetail};
    use crate::models::screening::Dimension;
    use crate::screening::matching::{DefaultPipelineFactory, PipelineFactory};
    use crate::screening::pipeline::EvaluationPipeline;
    use crate::screening::scorer::{
        DimensionOutcome, DimensionScorer, ScoreDetail, ScoringError, WeightedAggregator,
    };
    use crate::screening::store::{
        MemoryProfileRepository, MemoryScreeningStore, NodeRunFinish, StoreError, TaskResumeUpdate,
    };

    /// Sleeps before answering so a test can cancel mid-run.
    struct SlowScorer(Duration);

    #[async_trait]
    impl DimensionScorer for SlowScorer {
        async fn evaluate(
            &self,
            dimension: Dimension,
            _job: &JobProfile,
            _resume: &ResumeDetail,
        ) -> Result<DimensionOutcome, ScoringError> {
            tokio::time::sleep(self.0).await;
            Ok(DimensionOutcome {
                detail: ScoreDetail {
                    dimension,
                    score: 75.0,
                    evidence: vec![],
                    gaps: vec![],
                    summary: String::new(),
                },
                usage: None,
            })
        }
    }

    struct SlowFactory(Duration);

    impl PipelineFactory for SlowFactory {
        fn build(&self, backend: &BackendConfig) -> Result<EvaluationPipeline, ScoringError> {
            Ok(EvaluationPipeline::new(
                backend.cache_key(),
                Arc::new(SlowScorer(self.0)),
                Arc::new(WeightedAggregator),
            ))
        }
    }

    struct Harness {
        service: ScreeningService,
        store: Arc<MemoryScreeningStore>,
        profiles: Arc<MemoryProfileRepository>,
        audit: AuditRecorder,
        job_id: Uuid,
    }

    async fn harness(factory: Arc<dyn PipelineFactory>, max_concurrency: usize) -> Harness {
        harness_with_store(factory, max_concurrency, |store| store as Arc<dyn ScreeningStore>).await
    }

    /// `wrap` decides which store the service talks to; `Harness::store`
    /// is always the in-memory one underneath.
    async fn harness_with_store(
        factory: Arc<dyn PipelineFactory>,
        max_concurrency: usize,
        wrap: impl FnOnce(Arc<MemoryScreeningStore>) -> Arc<dyn ScreeningStore>,
    ) -> Harness {
        let store = Arc::new(MemoryScreeningStore::new());
        let profiles = Arc::new(MemoryProfileRepository::new());
        let (audit, _writer) = AuditRecorder::spawn(store.clone());
        let matcher = Arc::new(MatchingService::new(
            factory,
            BackendConfig::Keyword,
            "screener-test",
        ));

        let job_id = Uuid::new_v4();
        profiles
            .insert_job(JobProfile {
                id: job_id,
                title: "Backend Engineer".to_string(),
                required_skills: vec!["Rust".to_string(), "Postgres".to_string()],
                min_years_experience: Some(3.0),
                ..Default::default()
            })
            .await;

        let service = ScreeningService::new(
            wrap(store.clone()),
            profiles.clone(),
            matcher,
            audit.clone(),
            max_concurrency,
        );
        Harness {
            service,
            store,
            profiles,
            audit,
            job_id,
        }
    }

    /// Answers every dimension by panicking.
    struct PanickingScorer;

    #[async_trait]
    impl DimensionScorer for PanickingScorer {
        async fn evaluate(
            &self,
            dimension: Dimension,
            _job: &JobProfile,
            _resume: &ResumeDetail,
        ) -> Result<DimensionOutcome, ScoringError> {
            panic!("scorer blew up on {dimension}");
        }
    }

    struct PanickingFactory;

    impl PipelineFactory for PanickingFactory {
        fn build(&self, backend: &BackendConfig) -> Result<EvaluationPipeline, ScoringError> {
            Ok(EvaluationPipeline::new(
                backend.cache_key(),
                Arc::new(PanickingScorer),
                Arc::new(WeightedAggregator),
            ))
        }
    }

    /// Delegates to the in-memory store but cannot write the final task
    /// status, so the batch run itself ends in an error.
    struct BrokenFinishStore(Arc<MemoryScreeningStore>);

    #[async_trait]
    impl ScreeningStore for BrokenFinishStore {
        async fn create_task(
            &self,
            task: &ScreeningTask,
            items: &[ScreeningTaskResume],
        ) -> Result<(), StoreError> {
            self.0.create_task(task, items).await
        }
        async fn get_task(&self, id: Uuid) -> Result<Option<ScreeningTask>, StoreError> {
            self.0.get_task(id).await
        }
        async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<ScreeningTask>, StoreError> {
            self.0.list_tasks(filter).await
        }
        async fn transition_task(
            &self,
            id: Uuid,
            from: &[ScreeningStatus],
            to: ScreeningStatus,
            at: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            self.0.transition_task(id, from, to, at).await
        }
        async fn update_task_counts(&self, id: Uuid, counts: ResumeCounts) -> Result<(), StoreError> {
            self.0.update_task_counts(id, counts).await
        }
        async fn finish_task(
            &self,
            _id: Uuid,
            _status: ScreeningStatus,
            _counts: ResumeCounts,
            _at: DateTime<Utc>,
        ) -> Result<ScreeningStatus, StoreError> {
            Err(StoreError::Unavailable("connection reset".to_string()))
        }
        async fn delete_task(&self, id: Uuid) -> Result<bool, StoreError> {
            self.0.delete_task(id).await
        }
        async fn list_task_resumes(
            &self,
            task_id: Uuid,
        ) -> Result<Vec<ScreeningTaskResume>, StoreError> {
            self.0.list_task_resumes(task_id).await
        }
        async fn find_task_resume(
            &self,
            task_id: Uuid,
            resume_id: Uuid,
        ) -> Result<Option<ScreeningTaskResume>, StoreError> {
            self.0.find_task_resume(task_id, resume_id).await
        }
        async fn transition_task_resume(
            &self,
            id: Uuid,
            from: &[ScreeningStatus],
            update: TaskResumeUpdate,
        ) -> Result<bool, StoreError> {
            self.0.transition_task_resume(id, from, update).await
        }
        async fn cancel_task_resumes(
            &self,
            task_id: Uuid,
            from: &[ScreeningStatus],
            message: &str,
        ) -> Result<u64, StoreError> {
            self.0.cancel_task_resumes(task_id, from, message).await
        }
        async fn insert_result(&self, result: &ScreeningResult) -> Result<(), StoreError> {
            self.0.insert_result(result).await
        }
        async fn list_results(&self, task_id: Uuid) -> Result<Vec<ScreeningResult>, StoreError> {
            self.0.list_results(task_id).await
        }
        async fn get_result(&self, id: Uuid) -> Result<Option<ScreeningResult>, StoreError> {
            self.0.get_result(id).await
        }
        async fn set_result_ranks(&self, ranks: &[(Uuid, u32)]) -> Result<(), StoreError> {
            self.0.set_result_ranks(ranks).await
        }
        async fn upsert_metric(&self, metric: &RunMetric) -> Result<(), StoreError> {
            self.0.upsert_metric(metric).await
        }
        async fn get_metric(&self, task_id: Uuid) -> Result<Option<RunMetric>, StoreError> {
            self.0.get_metric(task_id).await
        }
        async fn insert_node_run(&self, run: &NodeRun) -> Result<(), StoreError> {
            self.0.insert_node_run(run).await
        }
        async fn finish_node_run(&self, id: Uuid, finish: NodeRunFinish) -> Result<(), StoreError> {
            self.0.finish_node_run(id, finish).await
        }
        async fn count_node_runs(
            &self,
            task_resume_id: Uuid,
            node: NodeKind,
        ) -> Result<u32, StoreError> {
            self.0.count_node_runs(task_resume_id, node).await
        }
        async fn list_node_runs(&self, task_resume_id: Uuid) -> Result<Vec<NodeRun>, StoreError> {
            self.0.list_node_runs(task_resume_id).await
        }
    }

    async fn keyword_harness() -> Harness {
        harness(Arc::new(DefaultPipelineFactory::new(None)), 4).await
    }

    impl Harness {
        /// Registers `n` resumes in the profile repository.
        async fn resumes(&self, n: usize) -> Vec<Uuid> {
            let mut ids = Vec::new();
            for i in 0..n {
                let id = Uuid::new_v4();
                self.profiles
                    .insert_resume(ResumeDetail {
                        id,
                        candidate_name: format!("Candidate {i}"),
                        email: Some(format!("c{i}@example.com")),
                        skills: vec!["Rust".to_string()],
                        total_years_experience: Some(i as f64 + 1.0),
                        ..Default::default()
                    })
                    .await;
                ids.push(id);
            }
            ids
        }

        async fn create(&self, resume_ids: Vec<Uuid>) -> Uuid {
            self.service
                .create(CreateTaskRequest {
                    job_id: self.job_id,
                    creator: "recruiter@example.com".to_string(),
                    resume_ids,
                    weights: None,
                    model_config: None,
                })
                .await
                .unwrap()
        }

        /// Waits until the task leaves `running`; used where no metrics
        /// will ever be written.
        async fn settled(&self, task_id: Uuid) -> ScreeningTask {
            for _ in 0..500 {
                let task = self.store.get_task(task_id).await.unwrap().unwrap();
                if task.status != ScreeningStatus::Running {
                    return task;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("task {task_id} stayed running");
        }

        /// Waits until the run has written its metrics.
        async fn finished(&self, task_id: Uuid) -> ScreeningTask {
            for _ in 0..500 {
                if self.service.get_metrics(task_id).await.is_ok() {
                    self.audit.flush().await;
                    return self.service.get_task(task_id).await.unwrap();
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("task {task_id} did not finish");
        }
    }

    #[tokio::test]
    async fn test_create_persists_pending_items() {
        let h = keyword_harness().await;
        let ids = h.resumes(5).await;
        let task_id = h.create(ids).await;

        let task = h.service.get_task(task_id).await.unwrap();
        assert_eq!(task.status, ScreeningStatus::Pending);
        assert_eq!(task.counts.total, 5);
        assert_eq!(task.scorer_version, "screener-test");

        let items = h.store.list_task_resumes(task_id).await.unwrap();
        assert_eq!(items.len(), 5);
        assert!(items.iter().all(|i| i.status == ScreeningStatus::Pending));
    }

    #[tokio::test]
    async fn test_create_rejects_bad_input() {
        let h = keyword_harness().await;
        let base = CreateTaskRequest {
            job_id: h.job_id,
            creator: "ana".to_string(),
            resume_ids: vec![Uuid::new_v4()],
            weights: None,
            model_config: None,
        };

        let cases = [
            CreateTaskRequest {
                resume_ids: vec![],
                ..base.clone()
            },
            CreateTaskRequest {
                creator: "  ".to_string(),
                ..base.clone()
            },
            CreateTaskRequest {
                job_id: Uuid::nil(),
                ..base.clone()
            },
            CreateTaskRequest {
                weights: Some(DimensionWeights {
                    skill: f64::NAN,
                    ..Default::default()
                }),
                ..base.clone()
            },
            CreateTaskRequest {
                model_config: Some(ModelConfig {
                    backend: Some("quantum".to_string()),
                    ..Default::default()
                }),
                ..base.clone()
            },
        ];
        for request in cases {
            let err = h.service.create(request).await.unwrap_err();
            assert!(matches!(err, AppError::Validation(_)), "{err}");
        }
        assert!(h.store.list_tasks(&TaskFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_dedupes_resume_ids() {
        let h = keyword_harness().await;
        let id = Uuid::new_v4();
        let task_id = h.create(vec![id, id, Uuid::new_v4()]).await;
        assert_eq!(h.service.get_task(task_id).await.unwrap().counts.total, 2);
    }

    #[tokio::test]
    async fn test_two_failures_mark_task_failed() {
        let h = keyword_harness().await;
        let mut ids = h.resumes(3).await;
        // Not in the profile repository: lookup fails for these two.
        ids.push(Uuid::new_v4());
        ids.push(Uuid::new_v4());
        let task_id = h.create(ids.clone()).await;

        h.service.start(task_id).await.unwrap();
        let task = h.finished(task_id).await;

        assert_eq!(task.status, ScreeningStatus::Failed);
        assert_eq!(
            task.counts,
            ResumeCounts {
                total: 5,
                processed: 5,
                succeeded: 3,
                failed: 2
            }
        );
        assert!(task.finished_at.is_some());
        assert!(!h.service.has_live_run(task_id));

        let items = h.store.list_task_resumes(task_id).await.unwrap();
        let failed: Vec<_> = items
            .iter()
            .filter(|i| i.status == ScreeningStatus::Failed)
            .collect();
        assert_eq!(failed.len(), 2);
        assert!(failed
            .iter()
            .all(|i| i.error_message.as_deref().unwrap().contains("not found")));

        let metrics = h.service.get_metrics(task_id).await.unwrap();
        assert_eq!(metrics.succeeded, 3);
        assert_eq!(metrics.failed, 2);
        assert_eq!(metrics.match_level_histogram.values().sum::<u32>(), 3);

        // Lookup failed before the pipeline ran, so no node has a status.
        let nodes = h.service.node_run_status(task_id, ids[4]).await.unwrap();
        assert_eq!(nodes.len(), NodeKind::ALL.len());
        assert!(nodes.values().all(Option::is_none));
    }

    #[tokio::test]
    async fn test_all_success_completes_with_ranking_and_audit() {
        let h = keyword_harness().await;
        let ids = h.resumes(5).await;
        let task_id = h.create(ids.clone()).await;

        h.service.start(task_id).await.unwrap();
        let task = h.finished(task_id).await;

        assert_eq!(task.status, ScreeningStatus::Completed);
        assert_eq!(task.counts.succeeded, 5);

        let results = h.service.list_results(task_id).await.unwrap();
        assert_eq!(results.len(), 5);
        let ranks: Vec<u32> = results.iter().map(|r| r.rank.unwrap()).collect();
        assert_eq!(ranks, vec![1, 2, 3, 4, 5]);
        assert!(results
            .windows(2)
            .all(|w| w[0].overall_score >= w[1].overall_score));

        let nodes = h.service.node_run_status(task_id, ids[0]).await.unwrap();
        assert!(nodes
            .values()
            .all(|s| *s == Some(NodeRunStatus::Completed)));

        let progress = h.service.task_progress(task_id).await.unwrap();
        assert!((progress.percent - 100.0).abs() < 1e-9);

        let fetched = h.service.get_result(results[0].id).await.unwrap();
        assert_eq!(fetched.resume_id, results[0].resume_id);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let h = keyword_harness().await;
        let ids = h.resumes(2).await;
        let task_id = h.create(ids).await;

        h.service.start(task_id).await.unwrap();
        h.service.start(task_id).await.unwrap();
        h.finished(task_id).await;
        h.service.start(task_id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(h.service.list_results(task_id).await.unwrap().len(), 2);
        assert_eq!(
            h.service.get_task(task_id).await.unwrap().status,
            ScreeningStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_cancel_mid_run_leaves_no_pending_or_running_items() {
        let h = harness(Arc::new(SlowFactory(Duration::from_millis(40))), 2).await;
        let ids = h.resumes(8).await;
        let task_id = h.create(ids).await;

        h.service.start(task_id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(15)).await;
        h.service.cancel(task_id).await.unwrap();

        let task = h.finished(task_id).await;
        assert_eq!(task.status, ScreeningStatus::Cancelled);

        let items = h.store.list_task_resumes(task_id).await.unwrap();
        assert!(items.iter().all(|i| i.status.is_terminal()));

        let admitted = items
            .iter()
            .filter(|i| i.status != ScreeningStatus::Cancelled)
            .count() as u32;
        assert!(admitted >= 1 && admitted < 8);
        assert!(items
            .iter()
            .filter(|i| i.status != ScreeningStatus::Cancelled)
            .all(|i| i.status == ScreeningStatus::Completed));
        assert_eq!(task.counts.processed, admitted);
        assert_eq!(task.counts.succeeded + task.counts.failed, admitted);
    }

    #[tokio::test]
    async fn test_cancelled_parent_token_skips_everything() {
        let h = keyword_harness().await;
        let ids = h.resumes(3).await;
        let task_id = h.create(ids).await;

        let parent = CancellationToken::new();
        parent.cancel();
        h.service.start_with_token(task_id, &parent).await.unwrap();

        let task = h.finished(task_id).await;
        assert_eq!(task.status, ScreeningStatus::Cancelled);
        assert_eq!(task.counts.processed, 0);
        let items = h.store.list_task_resumes(task_id).await.unwrap();
        assert!(items.iter().all(|i| i.status == ScreeningStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_state_errors_are_distinct_from_not_found() {
        let h = keyword_harness().await;
        let ids = h.resumes(1).await;
        let task_id = h.create(ids).await;

        assert!(matches!(
            h.service.cancel(task_id).await,
            Err(AppError::InvalidState(_))
        ));
        assert!(matches!(
            h.service.cancel(Uuid::new_v4()).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            h.service.start(Uuid::new_v4()).await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            h.service.get_metrics(task_id).await,
            Err(AppError::NotFound(_))
        ));

        h.service.start(task_id).await.unwrap();
        h.finished(task_id).await;
        assert!(matches!(
            h.service.cancel(task_id).await,
            Err(AppError::InvalidState(_))
        ));

        h.service.delete(task_id).await.unwrap();
        assert!(matches!(
            h.service.get_task(task_id).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_running_task_rejected() {
        let h = harness(Arc::new(SlowFactory(Duration::from_millis(50))), 1).await;
        let ids = h.resumes(2).await;
        let task_id = h.create(ids).await;

        h.service.start(task_id).await.unwrap();
        assert!(matches!(
            h.service.delete(task_id).await,
            Err(AppError::InvalidState(_))
        ));
        h.finished(task_id).await;
    }

    #[tokio::test]
    async fn test_missing_job_keeps_task_pending() {
        let h = keyword_harness().await;
        let task_id = h
            .service
            .create(CreateTaskRequest {
                job_id: Uuid::new_v4(),
                creator: "ana".to_string(),
                resume_ids: vec![Uuid::new_v4()],
                weights: None,
                model_config: None,
            })
            .await
            .unwrap();

        assert!(matches!(
            h.service.start(task_id).await,
            Err(AppError::NotFound(_))
        ));
        assert_eq!(
            h.service.get_task(task_id).await.unwrap().status,
            ScreeningStatus::Pending
        );
    }

    #[test]
    fn test_node_status_map_latest_attempt_wins() {
        let run = |node, attempt, status| NodeRun {
            id: Uuid::new_v4(),
            task_resume_id: Uuid::nil(),
            node,
            status,
            input: None,
            output: None,
            token_usage: None,
            error: None,
            attempt,
            trace_id: Uuid::new_v4(),
            scorer_version: "v".to_string(),
            started_at: Utc::now(),
            finished_at: None,
        };
        let map = node_status_map(&[
            run(NodeKind::Skill, 2, NodeRunStatus::Completed),
            run(NodeKind::Skill, 1, NodeRunStatus::Failed),
            run(NodeKind::Dispatch, 1, NodeRunStatus::Running),
        ]);
        assert_eq!(map[&NodeKind::Skill], Some(NodeRunStatus::Completed));
        assert_eq!(map[&NodeKind::Dispatch], Some(NodeRunStatus::Running));
        assert_eq!(map[&NodeKind::Aggregate], None);
        assert_eq!(map.len(), 8);
    }

    #[tokio::test]
    async fn test_failed_run_is_abandoned_as_failed() {
        let h = harness_with_store(Arc::new(DefaultPipelineFactory::new(None)), 2, |store| {
            Arc::new(BrokenFinishStore(store)) as Arc<dyn ScreeningStore>
        })
        .await;
        let ids = h.resumes(3).await;
        let task_id = h.create(ids).await;

        h.service.start(task_id).await.unwrap();
        let task = h.settled(task_id).await;

        assert_eq!(task.status, ScreeningStatus::Failed);
        assert!(task.finished_at.is_some());
        // The supervisor writes the status after the registry entry is gone.
        assert!(!h.service.has_live_run(task_id));
        let items = h.store.list_task_resumes(task_id).await.unwrap();
        assert!(items.iter().all(|i| i.status.is_terminal()), "{items:?}");
        assert!(h.service.get_metrics(task_id).await.is_err());
    }

    #[tokio::test]
    async fn test_panicking_scorer_fails_items_not_the_service() {
        let h = harness(Arc::new(PanickingFactory), 2).await;
        let ids = h.resumes(3).await;
        let task_id = h.create(ids).await;

        h.service.start(task_id).await.unwrap();
        let task = h.finished(task_id).await;

        assert_eq!(task.status, ScreeningStatus::Failed);
        assert_eq!(task.counts.processed, 3);
        assert_eq!(task.counts.failed, 3);
        assert!(!h.service.has_live_run(task_id));
        let items = h.store.list_task_resumes(task_id).await.unwrap();
        assert!(items.iter().all(|i| i.status == ScreeningStatus::Failed));
        assert!(items
            .iter()
            .all(|i| i.error_message.as_deref().unwrap_or_default().contains("panicked")));

        // The service still takes new work afterwards.
        let again = h.create(h.resumes(1).await).await;
        h.service.start(again).await.unwrap();
        assert_eq!(h.finished(again).await.status, ScreeningStatus::Failed);
    }

    #[tokio::test]
    async fn test_shutdown_settles_live_runs() {
        let h = harness(Arc::new(SlowFactory(Duration::from_millis(40))), 2).await;
        let ids = h.resumes(8).await;
        let task_id = h.create(ids).await;

        h.service.start(task_id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(15)).await;
        h.service.shutdown().await;

        let task = h.service.get_task(task_id).await.unwrap();
        assert_eq!(task.status, ScreeningStatus::Cancelled);
        assert!(!h.service.has_live_run(task_id));
        let items = h.store.list_task_resumes(task_id).await.unwrap();
        assert!(items.iter().all(|i| i.status.is_terminal()));
        assert!(h.service.get_metrics(task_id).await.is_ok());
    }
}

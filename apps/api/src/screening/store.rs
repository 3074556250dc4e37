//! Persistence seams for screening. `pg_store` is the production backend;
//! the in-memory stores here back tests and local runs without Postgres.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::profile::{JobProfile, ResumeDetail};
use crate::models::screening::{
    NodeKind, NodeRun, NodeRunStatus, ResumeCounts, RunMetric, ScreeningResult, ScreeningStatus,
    ScreeningTask, ScreeningTaskResume, TokenUsage,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

// ────────────────────────────────────────────────────────────────────────────
// Write payloads
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskFilter {
    pub creator: Option<String>,
    pub job_id: Option<Uuid>,
    pub status: Option<ScreeningStatus>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl TaskFilter {
    pub const DEFAULT_LIMIT: u32 = 50;
    pub const MAX_LIMIT: u32 = 200;

    pub fn limit(&self) -> u32 {
        self.limit
            .unwrap_or(Self::DEFAULT_LIMIT)
            .clamp(1, Self::MAX_LIMIT)
    }

    pub fn offset(&self) -> u32 {
        self.offset.unwrap_or(0)
    }

    fn matches(&self, task: &ScreeningTask) -> bool {
        self.creator.as_deref().map_or(true, |c| task.creator == c)
            && self.job_id.map_or(true, |j| task.job_id == j)
            && self.status.map_or(true, |s| task.status == s)
    }
}

/// New state for one (task, resume) item.
#[derive(Debug, Clone)]
pub struct TaskResumeUpdate {
    pub status: ScreeningStatus,
    pub score: Option<f64>,
    pub error_message: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl TaskResumeUpdate {
    pub fn running() -> Self {
        Self {
            status: ScreeningStatus::Running,
            score: None,
            error_message: None,
            processed_at: None,
        }
    }

    pub fn completed(score: f64) -> Self {
        Self {
            status: ScreeningStatus::Completed,
            score: Some(score),
            error_message: None,
            processed_at: Some(Utc::now()),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: ScreeningStatus::Failed,
            score: None,
            error_message: Some(message.into()),
            processed_at: Some(Utc::now()),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            status: ScreeningStatus::Cancelled,
            score: None,
            error_message: Some(message.into()),
            processed_at: Some(Utc::now()),
        }
    }
}

/// Terminal state for a node run opened earlier.
#[derive(Debug, Clone)]
pub struct NodeRunFinish {
    pub status: NodeRunStatus,
    pub output: Option<serde_json::Value>,
    pub token_usage: Option<TokenUsage>,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

// ────────────────────────────────────────────────────────────────────────────
// Traits
// ────────────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait ScreeningStore: Send + Sync {
    /// Task and its items land together or not at all.
    async fn create_task(
        &self,
        task: &ScreeningTask,
        items: &[ScreeningTaskResume],
    ) -> Result<(), StoreError>;
    async fn get_task(&self, id: Uuid) -> Result<Option<ScreeningTask>, StoreError>;
    /// Newest first.
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<ScreeningTask>, StoreError>;
    /// Compare-and-set on status. Returns false when the current status is
    /// not one of `from`. Members of `from` that cannot legally move to `to`
    /// are ignored. Moving to running stamps `started_at`.
    async fn transition_task(
        &self,
        id: Uuid,
        from: &[ScreeningStatus],
        to: ScreeningStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
    async fn update_task_counts(&self, id: Uuid, counts: ResumeCounts) -> Result<(), StoreError>;
    /// Writes final counters and `finished_at`. The status moves to `status`
    /// only if the task is still running; returns the status left in place.
    async fn finish_task(
        &self,
        id: Uuid,
        status: ScreeningStatus,
        counts: ResumeCounts,
        at: DateTime<Utc>,
    ) -> Result<ScreeningStatus, StoreError>;
    /// Removes the task with its items, results, metrics and node runs.
    async fn delete_task(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn list_task_resumes(&self, task_id: Uuid)
        -> Result<Vec<ScreeningTaskResume>, StoreError>;
    async fn find_task_resume(
        &self,
        task_id: Uuid,
        resume_id: Uuid,
    ) -> Result<Option<ScreeningTaskResume>, StoreError>;
    /// Compare-and-set on the item status.
    async fn transition_task_resume(
        &self,
        id: Uuid,
        from: &[ScreeningStatus],
        update: TaskResumeUpdate,
    ) -> Result<bool, StoreError>;
    /// Moves every item of the task still in one of `from` to cancelled.
    async fn cancel_task_resumes(
        &self,
        task_id: Uuid,
        from: &[ScreeningStatus],
        message: &str,
    ) -> Result<u64, StoreError>;

    async fn insert_result(&self, result: &ScreeningResult) -> Result<(), StoreError>;
    /// Ranked first, then by score descending.
    async fn list_results(&self, task_id: Uuid) -> Result<Vec<ScreeningResult>, StoreError>;
    async fn get_result(&self, id: Uuid) -> Result<Option<ScreeningResult>, StoreError>;
    async fn set_result_ranks(&self, ranks: &[(Uuid, u32)]) -> Result<(), StoreError>;

    async fn upsert_metric(&self, metric: &RunMetric) -> Result<(), StoreError>;
    async fn get_metric(&self, task_id: Uuid) -> Result<Option<RunMetric>, StoreError>;

    async fn insert_node_run(&self, run: &NodeRun) -> Result<(), StoreError>;
    async fn finish_node_run(&self, id: Uuid, finish: NodeRunFinish) -> Result<(), StoreError>;
    async fn count_node_runs(&self, task_resume_id: Uuid, node: NodeKind)
        -> Result<u32, StoreError>;
    /// Oldest first.
    async fn list_node_runs(&self, task_resume_id: Uuid) -> Result<Vec<NodeRun>, StoreError>;
}

/// Read access to the job and resume records owned by other services.
#[async_trait]
pub trait ProfileRepository: Send + Sync {
    async fn get_job(&self, id: Uuid) -> Result<Option<JobProfile>, StoreError>;
    async fn get_resume(&self, id: Uuid) -> Result<Option<ResumeDetail>, StoreError>;
}

// ────────────────────────────────────────────────────────────────────────────
// In-memory implementations
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryState {
    tasks: HashMap<Uuid, ScreeningTask>,
    /// Insertion order per task.
    task_items: HashMap<Uuid, Vec<Uuid>>,
    items: HashMap<Uuid, ScreeningTaskResume>,
    results: BTreeMap<Uuid, ScreeningResult>,
    metrics: HashMap<Uuid, RunMetric>,
    node_runs: Vec<NodeRun>,
}

#[derive(Default)]
pub struct MemoryScreeningStore {
    state: RwLock<MemoryState>,
}

impl MemoryScreeningStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScreeningStore for MemoryScreeningStore {
    async fn create_task(
        &self,
        task: &ScreeningTask,
        items: &[ScreeningTaskResume],
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.tasks.insert(task.id, task.clone());
        state
            .task_items
            .insert(task.id, items.iter().map(|i| i.id).collect());
        for item in items {
            state.items.insert(item.id, item.clone());
        }
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<ScreeningTask>, StoreError> {
        Ok(self.state.read().await.tasks.get(&id).cloned())
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<ScreeningTask>, StoreError> {
        let state = self.state.read().await;
        let mut tasks: Vec<_> = state
            .tasks
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(tasks
            .into_iter()
            .skip(filter.offset() as usize)
            .take(filter.limit() as usize)
            .collect())
    }

    async fn transition_task(
        &self,
        id: Uuid,
        from: &[ScreeningStatus],
        to: ScreeningStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let Some(task) = state.tasks.get_mut(&id) else {
            return Ok(false);
        };
        if !ScreeningStatus::legal_sources(from, to).contains(&task.status) {
            return Ok(false);
        }
        task.status = to;
        match to {
            ScreeningStatus::Running => task.started_at = Some(at),
            s if s.is_terminal() => task.finished_at = Some(at),
            _ => {}
        }
        Ok(true)
    }

    async fn update_task_counts(&self, id: Uuid, counts: ResumeCounts) -> Result<(), StoreError> {
        if let Some(task) = self.state.write().await.tasks.get_mut(&id) {
            task.counts = counts;
        }
        Ok(())
    }

    async fn finish_task(
        &self,
        id: Uuid,
        status: ScreeningStatus,
        counts: ResumeCounts,
        at: DateTime<Utc>,
    ) -> Result<ScreeningStatus, StoreError> {
        let mut state = self.state.write().await;
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| StoreError::Unavailable(format!("task {id} disappeared")))?;
        if task.status == ScreeningStatus::Running {
            task.status = status;
        }
        task.counts = counts;
        task.finished_at = Some(at);
        Ok(task.status)
    }

    async fn delete_task(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        if state.tasks.remove(&id).is_none() {
            return Ok(false);
        }
        let item_ids = state.task_items.remove(&id).unwrap_or_default();
        for item_id in &item_ids {
            state.items.remove(item_id);
        }
        state.node_runs.retain(|r| !item_ids.contains(&r.task_resume_id));
        state.results.retain(|_, r| r.task_id != id);
        state.metrics.remove(&id);
        Ok(true)
    }

    async fn list_task_resumes(
        &self,
        task_id: Uuid,
    ) -> Result<Vec<ScreeningTaskResume>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .task_items
            .get(&task_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.items.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn find_task_resume(
        &self,
        task_id: Uuid,
        resume_id: Uuid,
    ) -> Result<Option<ScreeningTaskResume>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .items
            .values()
            .find(|i| i.task_id == task_id && i.resume_id == resume_id)
            .cloned())
    }

    async fn transition_task_resume(
        &self,
        id: Uuid,
        from: &[ScreeningStatus],
        update: TaskResumeUpdate,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.write().await;
        let Some(item) = state.items.get_mut(&id) else {
            return Ok(false);
        };
        if !from.contains(&item.status) {
            return Ok(false);
        }
        item.status = update.status;
        item.score = update.score;
        item.error_message = update.error_message;
        item.processed_at = update.processed_at;
        Ok(true)
    }

    async fn cancel_task_resumes(
        &self,
        task_id: Uuid,
        from: &[ScreeningStatus],
        message: &str,
    ) -> Result<u64, StoreError> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let mut cancelled = 0;
        for item in state.items.values_mut() {
            if item.task_id == task_id && from.contains(&item.status) {
                item.status = ScreeningStatus::Cancelled;
                item.error_message = Some(message.to_string());
                item.processed_at = Some(now);
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn insert_result(&self, result: &ScreeningResult) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .results
            .insert(result.id, result.clone());
        Ok(())
    }

    async fn list_results(&self, task_id: Uuid) -> Result<Vec<ScreeningResult>, StoreError> {
        let state = self.state.read().await;
        let mut results: Vec<_> = state
            .results
            .values()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect();
        results.sort_by(|a, b| {
            a.rank
                .unwrap_or(u32::MAX)
                .cmp(&b.rank.unwrap_or(u32::MAX))
                .then(b.overall_score.total_cmp(&a.overall_score))
        });
        Ok(results)
    }

    async fn get_result(&self, id: Uuid) -> Result<Option<ScreeningResult>, StoreError> {
        Ok(self.state.read().await.results.get(&id).cloned())
    }

    async fn set_result_ranks(&self, ranks: &[(Uuid, u32)]) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        for (id, rank) in ranks {
            if let Some(result) = state.results.get_mut(id) {
                result.rank = Some(*rank);
            }
        }
        Ok(())
    }

    async fn upsert_metric(&self, metric: &RunMetric) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .metrics
            .insert(metric.task_id, metric.clone());
        Ok(())
    }

    async fn get_metric(&self, task_id: Uuid) -> Result<Option<RunMetric>, StoreError> {
        Ok(self.state.read().await.metrics.get(&task_id).cloned())
    }

    async fn insert_node_run(&self, run: &NodeRun) -> Result<(), StoreError> {
        self.state.write().await.node_runs.push(run.clone());
        Ok(())
    }

    async fn finish_node_run(&self, id: Uuid, finish: NodeRunFinish) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if let Some(run) = state.node_runs.iter_mut().find(|r| r.id == id) {
            run.status = finish.status;
            run.output = finish.output;
            run.token_usage = finish.token_usage;
            run.error = finish.error;
            run.finished_at = Some(finish.finished_at);
        }
        Ok(())
    }

    async fn count_node_runs(
        &self,
        task_resume_id: Uuid,
        node: NodeKind,
    ) -> Result<u32, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .node_runs
            .iter()
            .filter(|r| r.task_resume_id == task_resume_id && r.node == node)
            .count() as u32)
    }

    async fn list_node_runs(&self, task_resume_id: Uuid) -> Result<Vec<NodeRun>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .node_runs
            .iter()
            .filter(|r| r.task_resume_id == task_resume_id)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct MemoryProfileRepository {
    jobs: RwLock<HashMap<Uuid, JobProfile>>,
    resumes: RwLock<HashMap<Uuid, ResumeDetail>>,
}

impl MemoryProfileRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_job(&self, job: JobProfile) {
        self.jobs.write().await.insert(job.id, job);
    }

    pub async fn insert_resume(&self, resume: ResumeDetail) {
        self.resumes.write().await.insert(resume.id, resume);
    }
}

#[async_trait]
impl ProfileRepository for MemoryProfileRepository {
    async fn get_job(&self, id: Uuid) -> Result<Option<JobProfile>, StoreError> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn get_resume(&self, id: Uuid) -> Result<Option<ResumeDetail>, StoreError> {
        Ok(self.resumes.read().await.get(&id).cloned())
    }
}

//! PostgreSQL implementations of the screening store traits.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::models::profile::{JobProfile, ResumeDetail};
use crate::models::screening::{
    ModelConfig, NodeKind, NodeRun, NodeRunStatus, ResumeCounts, RunMetric, ScreeningResult,
    ScreeningStatus, ScreeningTask, ScreeningTaskResume, TokenUsage,
};
use crate::screening::store::{
    NodeRunFinish, ProfileRepository, ScreeningStore, StoreError, TaskFilter, TaskResumeUpdate,
};
use crate::screening::weights::DimensionWeights;

// ────────────────────────────────────────────────────────────────────────────
// Row types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, FromRow)]
struct TaskRow {
    id: Uuid,
    job_id: Uuid,
    creator: String,
    status: String,
    total: i32,
    processed: i32,
    succeeded: i32,
    failed: i32,
    weights: Option<Json<DimensionWeights>>,
    model_config: Option<Json<ModelConfig>>,
    scorer_version: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<TaskRow> for ScreeningTask {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(ScreeningTask {
            id: row.id,
            job_id: row.job_id,
            creator: row.creator,
            status: parse_status(&row.status)?,
            counts: ResumeCounts {
                total: row.total as u32,
                processed: row.processed as u32,
                succeeded: row.succeeded as u32,
                failed: row.failed as u32,
            },
            weights: row.weights.map(|w| w.0),
            model_config: row.model_config.map(|m| m.0),
            scorer_version: row.scorer_version,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct TaskResumeRow {
    id: Uuid,
    task_id: Uuid,
    resume_id: Uuid,
    status: String,
    score: Option<f64>,
    error_message: Option<String>,
    processed_at: Option<DateTime<Utc>>,
}

impl TryFrom<TaskResumeRow> for ScreeningTaskResume {
    type Error = StoreError;

    fn try_from(row: TaskResumeRow) -> Result<Self, Self::Error> {
        Ok(ScreeningTaskResume {
            id: row.id,
            task_id: row.task_id,
            resume_id: row.resume_id,
            status: parse_status(&row.status)?,
            score: row.score,
            error_message: row.error_message,
            processed_at: row.processed_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct ResultRow {
    id: Uuid,
    task_id: Uuid,
    resume_id: Uuid,
    job_id: Uuid,
    overall_score: f64,
    match_level: String,
    dimension_scores: Value,
    recommendations: Vec<String>,
    weights: Json<DimensionWeights>,
    input_tokens: i64,
    output_tokens: i64,
    scorer_version: String,
    rank: Option<i32>,
    created_at: DateTime<Utc>,
}

impl From<ResultRow> for ScreeningResult {
    fn from(row: ResultRow) -> Self {
        ScreeningResult {
            id: row.id,
            task_id: row.task_id,
            resume_id: row.resume_id,
            job_id: row.job_id,
            overall_score: row.overall_score,
            match_level: row.match_level,
            dimension_scores: row.dimension_scores,
            recommendations: row.recommendations,
            weights: row.weights.0,
            input_tokens: row.input_tokens as u64,
            output_tokens: row.output_tokens as u64,
            scorer_version: row.scorer_version,
            rank: row.rank.map(|r| r as u32),
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct MetricRow {
    task_id: Uuid,
    total: i32,
    succeeded: i32,
    failed: i32,
    average_score: f64,
    match_level_histogram: Json<BTreeMap<String, u32>>,
    input_tokens: i64,
    output_tokens: i64,
    duration_ms: i64,
    scorer_version: String,
    created_at: DateTime<Utc>,
}

impl From<MetricRow> for RunMetric {
    fn from(row: MetricRow) -> Self {
        RunMetric {
            task_id: row.task_id,
            total: row.total as u32,
            succeeded: row.succeeded as u32,
            failed: row.failed as u32,
            average_score: row.average_score,
            match_level_histogram: row.match_level_histogram.0,
            input_tokens: row.input_tokens as u64,
            output_tokens: row.output_tokens as u64,
            duration_ms: row.duration_ms as u64,
            scorer_version: row.scorer_version,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct NodeRunRow {
    id: Uuid,
    task_resume_id: Uuid,
    node: String,
    status: String,
    input: Option<Value>,
    output: Option<Value>,
    input_tokens: Option<i64>,
    output_tokens: Option<i64>,
    error: Option<String>,
    attempt: i32,
    trace_id: Uuid,
    scorer_version: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<NodeRunRow> for NodeRun {
    type Error = StoreError;

    fn try_from(row: NodeRunRow) -> Result<Self, Self::Error> {
        let token_usage = match (row.input_tokens, row.output_tokens) {
            (None, None) => None,
            (input, output) => Some(TokenUsage::new(
                input.unwrap_or(0) as u64,
                output.unwrap_or(0) as u64,
            )),
        };
        Ok(NodeRun {
            id: row.id,
            task_resume_id: row.task_resume_id,
            node: row.node.parse::<NodeKind>().map_err(StoreError::Corrupt)?,
            status: row.status.parse::<NodeRunStatus>().map_err(StoreError::Corrupt)?,
            input: row.input,
            output: row.output,
            token_usage,
            error: row.error,
            attempt: row.attempt as u32,
            trace_id: row.trace_id,
            scorer_version: row.scorer_version,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

fn parse_status(value: &str) -> Result<ScreeningStatus, StoreError> {
    value.parse().map_err(StoreError::Corrupt)
}

fn status_list(statuses: &[ScreeningStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

// ────────────────────────────────────────────────────────────────────────────
// Screening store
// ────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct PgScreeningStore {
    pool: PgPool,
}

impl PgScreeningStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScreeningStore for PgScreeningStore {
    async fn create_task(
        &self,
        task: &ScreeningTask,
        items: &[ScreeningTaskResume],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO screening_tasks
                (id, job_id, creator, status, total, processed, succeeded, failed,
                 weights, model_config, scorer_version, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(task.id)
        .bind(task.job_id)
        .bind(&task.creator)
        .bind(task.status.as_str())
        .bind(task.counts.total as i32)
        .bind(task.counts.processed as i32)
        .bind(task.counts.succeeded as i32)
        .bind(task.counts.failed as i32)
        .bind(task.weights.map(Json))
        .bind(task.model_config.clone().map(Json))
        .bind(&task.scorer_version)
        .bind(task.created_at)
        .execute(&mut *tx)
        .await?;

        for (position, item) in items.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO screening_task_resumes (id, task_id, resume_id, status, position)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(item.id)
            .bind(item.task_id)
            .bind(item.resume_id)
            .bind(item.status.as_str())
            .bind(position as i32)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<ScreeningTask>, StoreError> {
        sqlx::query_as::<_, TaskRow>("SELECT * FROM screening_tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(ScreeningTask::try_from)
            .transpose()
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<ScreeningTask>, StoreError> {
        sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT * FROM screening_tasks
            WHERE ($1::TEXT IS NULL OR creator = $1)
              AND ($2::UUID IS NULL OR job_id = $2)
              AND ($3::TEXT IS NULL OR status = $3)
            ORDER BY created_at DESC, id
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(filter.creator.as_deref())
        .bind(filter.job_id)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.limit() as i64)
        .bind(filter.offset() as i64)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(ScreeningTask::try_from)
        .collect()
    }

    async fn transition_task(
        &self,
        id: Uuid,
        from: &[ScreeningStatus],
        to: ScreeningStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let sources = ScreeningStatus::legal_sources(from, to);
        if sources.is_empty() {
            return Ok(false);
        }
        let result = sqlx::query(
            r#"
            UPDATE screening_tasks
            SET status = $2,
                started_at = CASE WHEN $2 = 'running' THEN $4 ELSE started_at END,
                finished_at = CASE WHEN $2 IN ('completed', 'failed', 'cancelled')
                                   THEN $4 ELSE finished_at END
            WHERE id = $1 AND status = ANY($3)
            "#,
        )
        .bind(id)
        .bind(to.as_str())
        .bind(status_list(&sources))
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_task_counts(&self, id: Uuid, counts: ResumeCounts) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE screening_tasks
            SET processed = $2, succeeded = $3, failed = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(counts.processed as i32)
        .bind(counts.succeeded as i32)
        .bind(counts.failed as i32)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish_task(
        &self,
        id: Uuid,
        status: ScreeningStatus,
        counts: ResumeCounts,
        at: DateTime<Utc>,
    ) -> Result<ScreeningStatus, StoreError> {
        let final_status: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE screening_tasks
            SET status = CASE WHEN status = 'running' THEN $2 ELSE status END,
                processed = $3, succeeded = $4, failed = $5, finished_at = $6
            WHERE id = $1
            RETURNING status
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(counts.processed as i32)
        .bind(counts.succeeded as i32)
        .bind(counts.failed as i32)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;

        match final_status {
            Some(s) => parse_status(&s),
            None => Err(StoreError::Unavailable(format!("task {id} disappeared"))),
        }
    }

    async fn delete_task(&self, id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM screening_tasks WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_task_resumes(
        &self,
        task_id: Uuid,
    ) -> Result<Vec<ScreeningTaskResume>, StoreError> {
        sqlx::query_as::<_, TaskResumeRow>(
            r#"
            SELECT id, task_id, resume_id, status, score, error_message, processed_at
            FROM screening_task_resumes
            WHERE task_id = $1
            ORDER BY position
            "#,
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(ScreeningTaskResume::try_from)
        .collect()
    }

    async fn find_task_resume(
        &self,
        task_id: Uuid,
        resume_id: Uuid,
    ) -> Result<Option<ScreeningTaskResume>, StoreError> {
        sqlx::query_as::<_, TaskResumeRow>(
            r#"
            SELECT id, task_id, resume_id, status, score, error_message, processed_at
            FROM screening_task_resumes
            WHERE task_id = $1 AND resume_id = $2
            "#,
        )
        .bind(task_id)
        .bind(resume_id)
        .fetch_optional(&self.pool)
        .await?
        .map(ScreeningTaskResume::try_from)
        .transpose()
    }

    async fn transition_task_resume(
        &self,
        id: Uuid,
        from: &[ScreeningStatus],
        update: TaskResumeUpdate,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE screening_task_resumes
            SET status = $3, score = $4, error_message = $5, processed_at = $6
            WHERE id = $1 AND status = ANY($2)
            "#,
        )
        .bind(id)
        .bind(status_list(from))
        .bind(update.status.as_str())
        .bind(update.score)
        .bind(update.error_message)
        .bind(update.processed_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn cancel_task_resumes(
        &self,
        task_id: Uuid,
        from: &[ScreeningStatus],
        message: &str,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE screening_task_resumes
            SET status = 'cancelled', error_message = $3, processed_at = now()
            WHERE task_id = $1 AND status = ANY($2)
            "#,
        )
        .bind(task_id)
        .bind(status_list(from))
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn insert_result(&self, result: &ScreeningResult) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO screening_results
                (id, task_id, resume_id, job_id, overall_score, match_level,
                 dimension_scores, recommendations, weights, input_tokens,
                 output_tokens, scorer_version, rank, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(result.id)
        .bind(result.task_id)
        .bind(result.resume_id)
        .bind(result.job_id)
        .bind(result.overall_score)
        .bind(&result.match_level)
        .bind(&result.dimension_scores)
        .bind(&result.recommendations)
        .bind(Json(result.weights))
        .bind(result.input_tokens as i64)
        .bind(result.output_tokens as i64)
        .bind(&result.scorer_version)
        .bind(result.rank.map(|r| r as i32))
        .bind(result.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_results(&self, task_id: Uuid) -> Result<Vec<ScreeningResult>, StoreError> {
        Ok(sqlx::query_as::<_, ResultRow>(
            r#"
            SELECT * FROM screening_results
            WHERE task_id = $1
            ORDER BY rank ASC NULLS LAST, overall_score DESC
            "#,
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(ScreeningResult::from)
        .collect())
    }

    async fn get_result(&self, id: Uuid) -> Result<Option<ScreeningResult>, StoreError> {
        Ok(
            sqlx::query_as::<_, ResultRow>("SELECT * FROM screening_results WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
                .map(ScreeningResult::from),
        )
    }

    async fn set_result_ranks(&self, ranks: &[(Uuid, u32)]) -> Result<(), StoreError> {
        let ids: Vec<Uuid> = ranks.iter().map(|(id, _)| *id).collect();
        let values: Vec<i32> = ranks.iter().map(|(_, rank)| *rank as i32).collect();
        sqlx::query(
            r#"
            UPDATE screening_results AS r
            SET rank = v.rank
            FROM UNNEST($1::UUID[], $2::INT[]) AS v(id, rank)
            WHERE r.id = v.id
            "#,
        )
        .bind(ids)
        .bind(values)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_metric(&self, metric: &RunMetric) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO screening_run_metrics
                (task_id, total, succeeded, failed, average_score, match_level_histogram,
                 input_tokens, output_tokens, duration_ms, scorer_version, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (task_id) DO UPDATE SET
                total = EXCLUDED.total,
                succeeded = EXCLUDED.succeeded,
                failed = EXCLUDED.failed,
                average_score = EXCLUDED.average_score,
                match_level_histogram = EXCLUDED.match_level_histogram,
                input_tokens = EXCLUDED.input_tokens,
                output_tokens = EXCLUDED.output_tokens,
                duration_ms = EXCLUDED.duration_ms,
                scorer_version = EXCLUDED.scorer_version,
                created_at = EXCLUDED.created_at
            "#,
        )
        .bind(metric.task_id)
        .bind(metric.total as i32)
        .bind(metric.succeeded as i32)
        .bind(metric.failed as i32)
        .bind(metric.average_score)
        .bind(Json(&metric.match_level_histogram))
        .bind(metric.input_tokens as i64)
        .bind(metric.output_tokens as i64)
        .bind(metric.duration_ms as i64)
        .bind(&metric.scorer_version)
        .bind(metric.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_metric(&self, task_id: Uuid) -> Result<Option<RunMetric>, StoreError> {
        Ok(sqlx::query_as::<_, MetricRow>(
            "SELECT * FROM screening_run_metrics WHERE task_id = $1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?
        .map(RunMetric::from))
    }

    async fn insert_node_run(&self, run: &NodeRun) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO screening_node_runs
                (id, task_resume_id, node, status, input, output, input_tokens,
                 output_tokens, error, attempt, trace_id, scorer_version,
                 started_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(run.id)
        .bind(run.task_resume_id)
        .bind(run.node.as_str())
        .bind(run.status.as_str())
        .bind(&run.input)
        .bind(&run.output)
        .bind(run.token_usage.map(|u| u.input_tokens as i64))
        .bind(run.token_usage.map(|u| u.output_tokens as i64))
        .bind(&run.error)
        .bind(run.attempt as i32)
        .bind(run.trace_id)
        .bind(&run.scorer_version)
        .bind(run.started_at)
        .bind(run.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish_node_run(&self, id: Uuid, finish: NodeRunFinish) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE screening_node_runs
            SET status = $2, output = $3, input_tokens = $4, output_tokens = $5,
                error = $6, finished_at = $7
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(finish.status.as_str())
        .bind(finish.output)
        .bind(finish.token_usage.map(|u| u.input_tokens as i64))
        .bind(finish.token_usage.map(|u| u.output_tokens as i64))
        .bind(finish.error)
        .bind(finish.finished_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_node_runs(
        &self,
        task_resume_id: Uuid,
        node: NodeKind,
    ) -> Result<u32, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM screening_node_runs WHERE task_resume_id = $1 AND node = $2",
        )
        .bind(task_resume_id)
        .bind(node.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u32)
    }

    async fn list_node_runs(&self, task_resume_id: Uuid) -> Result<Vec<NodeRun>, StoreError> {
        sqlx::query_as::<_, NodeRunRow>(
            r#"
            SELECT * FROM screening_node_runs
            WHERE task_resume_id = $1
            ORDER BY started_at, attempt
            "#,
        )
        .bind(task_resume_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(NodeRun::try_from)
        .collect()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Profile repository
// ────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct PgProfileRepository {
    pool: PgPool,
}

impl PgProfileRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProfileRepository for PgProfileRepository {
    async fn get_job(&self, id: Uuid) -> Result<Option<JobProfile>, StoreError> {
        let row: Option<Json<JobProfile>> =
            sqlx::query_scalar("SELECT profile FROM job_profiles WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|Json(mut job)| {
            job.id = id;
            job
        }))
    }

    async fn get_resume(&self, id: Uuid) -> Result<Option<ResumeDetail>, StoreError> {
        let row: Option<Json<ResumeDetail>> =
            sqlx::query_scalar("SELECT detail FROM resume_details WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|Json(mut resume)| {
            resume.id = id;
            resume
        }))
    }
}

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::screening::weights::DimensionWeights;

// ────────────────────────────────────────────────────────────────────────────
// Status state machine
// ────────────────────────────────────────────────────────────────────────────

/// Lifecycle of a screening task and of each (task, resume) item.
///
/// `pending → running → {completed | failed | cancelled}`; never backwards.
/// A pending item may also go straight to cancelled when the batch is
/// cancelled before the item was dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScreeningStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ScreeningStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(self, next: ScreeningStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running) => true,
            (Self::Pending, Self::Cancelled) => true,
            (Self::Running, next) => next.is_terminal(),
            _ => false,
        }
    }

    /// The members of `from` that may legally move to `next`.
    pub fn legal_sources(from: &[ScreeningStatus], next: ScreeningStatus) -> Vec<ScreeningStatus> {
        from.iter()
            .copied()
            .filter(|status| status.can_transition_to(next))
            .collect()
    }
}

impl fmt::Display for ScreeningStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScreeningStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown screening status '{other}'")),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Dimensions and pipeline nodes
// ────────────────────────────────────────────────────────────────────────────

/// One independent scoring axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Skill,
    Responsibility,
    Experience,
    Education,
    Industry,
    Basic,
}

impl Dimension {
    pub const ALL: [Dimension; 6] = [
        Dimension::Skill,
        Dimension::Responsibility,
        Dimension::Experience,
        Dimension::Education,
        Dimension::Industry,
        Dimension::Basic,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Dimension::Skill => "skill",
            Dimension::Responsibility => "responsibility",
            Dimension::Experience => "experience",
            Dimension::Education => "education",
            Dimension::Industry => "industry",
            Dimension::Basic => "basic",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every step of the evaluation graph that leaves an audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Dispatch,
    Skill,
    Responsibility,
    Experience,
    Education,
    Industry,
    Basic,
    Aggregate,
}

impl NodeKind {
    pub const ALL: [NodeKind; 8] = [
        NodeKind::Dispatch,
        NodeKind::Skill,
        NodeKind::Responsibility,
        NodeKind::Experience,
        NodeKind::Education,
        NodeKind::Industry,
        NodeKind::Basic,
        NodeKind::Aggregate,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            NodeKind::Dispatch => "dispatch",
            NodeKind::Skill => "skill",
            NodeKind::Responsibility => "responsibility",
            NodeKind::Experience => "experience",
            NodeKind::Education => "education",
            NodeKind::Industry => "industry",
            NodeKind::Basic => "basic",
            NodeKind::Aggregate => "aggregate",
        }
    }
}

impl From<Dimension> for NodeKind {
    fn from(dimension: Dimension) -> Self {
        match dimension {
            Dimension::Skill => NodeKind::Skill,
            Dimension::Responsibility => NodeKind::Responsibility,
            Dimension::Experience => NodeKind::Experience,
            Dimension::Education => NodeKind::Education,
            Dimension::Industry => NodeKind::Industry,
            Dimension::Basic => NodeKind::Basic,
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        NodeKind::ALL
            .into_iter()
            .find(|n| n.as_str() == value)
            .ok_or_else(|| format!("unknown node kind '{value}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRunStatus {
    Running,
    Completed,
    Failed,
}

impl NodeRunStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for NodeRunStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown node run status '{other}'")),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Token usage and model selection
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }

    pub fn is_empty(&self) -> bool {
        self.input_tokens == 0 && self.output_tokens == 0
    }
}

/// Caller-supplied model selection; every field falls back to the service default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// "keyword" or "llm".
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

// ────────────────────────────────────────────────────────────────────────────
// Persisted entities
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeCounts {
    pub total: u32,
    pub processed: u32,
    pub succeeded: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreeningTask {
    pub id: Uuid,
    pub job_id: Uuid,
    pub creator: String,
    pub status: ScreeningStatus,
    pub counts: ResumeCounts,
    /// Caller override; `None` means infer from the job profile at match time.
    pub weights: Option<DimensionWeights>,
    pub model_config: Option<ModelConfig>,
    pub scorer_version: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreeningTaskResume {
    pub id: Uuid,
    pub task_id: Uuid,
    pub resume_id: Uuid,
    pub status: ScreeningStatus,
    pub score: Option<f64>,
    pub error_message: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreeningResult {
    pub id: Uuid,
    pub task_id: Uuid,
    pub resume_id: Uuid,
    pub job_id: Uuid,
    pub overall_score: f64,
    pub match_level: String,
    pub dimension_scores: Value,
    pub recommendations: Vec<String>,
    pub weights: DimensionWeights,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub scorer_version: String,
    pub rank: Option<u32>,
    pub created_at: DateTime<Utc>,
}

/// Final aggregate numbers for one finished batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetric {
    pub task_id: Uuid,
    pub total: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub average_score: f64,
    pub match_level_histogram: BTreeMap<String, u32>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration_ms: u64,
    pub scorer_version: String,
    pub created_at: DateTime<Utc>,
}

/// Audit record of one pipeline step for one (task, resume) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRun {
    pub id: Uuid,
    pub task_resume_id: Uuid,
    pub node: NodeKind,
    pub status: NodeRunStatus,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub token_usage: Option<TokenUsage>,
    pub error: Option<String>,
    pub attempt: u32,
    pub trace_id: Uuid,
    pub scorer_version: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

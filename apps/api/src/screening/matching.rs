//! Matching façade: scores one (job, resume) pair through a pipeline that
//! is compiled once per backend configuration and then shared.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::llm_client::{CallOptions, LlmClient, DEFAULT_MODEL};
use crate::models::profile::{JobProfile, ResumeDetail};
use crate::models::screening::{ModelConfig, NodeKind, TokenUsage};
use crate::screening::llm_scorer::LlmDimensionScorer;
use crate::screening::pipeline::{EvaluationPipeline, StepListener};
use crate::screening::scorer::{KeywordDimensionScorer, ScoreDetail, ScoringError, WeightedAggregator};
use crate::screening::weights::{resolve_weights, DimensionWeights};

// ────────────────────────────────────────────────────────────────────────────
// Backend selection
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum BackendConfig {
    Keyword,
    Llm {
        model: String,
        temperature: Option<f32>,
    },
}

impl BackendConfig {
    /// Two configurations with the same key share one compiled pipeline.
    pub fn cache_key(&self) -> String {
        match self {
            BackendConfig::Keyword => "keyword".to_string(),
            BackendConfig::Llm { model, temperature } => match temperature {
                Some(t) => format!("llm:{model}:{t}"),
                None => format!("llm:{model}"),
            },
        }
    }

    /// Parses the `SCORER_BACKEND` / `SCORER_MODEL` pair from configuration.
    pub fn from_settings(backend: &str, model: Option<&str>) -> Result<Self, ScoringError> {
        match backend {
            "keyword" => Ok(BackendConfig::Keyword),
            "llm" => Ok(BackendConfig::Llm {
                model: model.unwrap_or(DEFAULT_MODEL).to_string(),
                temperature: None,
            }),
            other => Err(ScoringError::Backend(format!(
                "unknown scorer backend '{other}' (expected 'keyword' or 'llm')"
            ))),
        }
    }

    /// Applies a per-task override on top of the service default.
    pub fn resolve(
        overrides: Option<&ModelConfig>,
        default: &BackendConfig,
    ) -> Result<Self, ScoringError> {
        let Some(overrides) = overrides else {
            return Ok(default.clone());
        };

        let default_model = match default {
            BackendConfig::Llm { model, .. } => model.as_str(),
            BackendConfig::Keyword => DEFAULT_MODEL,
        };
        let backend = match (overrides.backend.as_deref(), default) {
            (Some(name), _) => name,
            // A model name alone implies the LLM backend.
            (None, _) if overrides.model.is_some() => "llm",
            (None, BackendConfig::Keyword) => "keyword",
            (None, BackendConfig::Llm { .. }) => "llm",
        };

        if let Some(t) = overrides.temperature {
            if !t.is_finite() || !(0.0..=1.0).contains(&t) {
                return Err(ScoringError::Backend(format!(
                    "temperature must be between 0 and 1, got {t}"
                )));
            }
        }

        match BackendConfig::from_settings(backend, Some(default_model))? {
            BackendConfig::Keyword => Ok(BackendConfig::Keyword),
            BackendConfig::Llm { model, .. } => Ok(BackendConfig::Llm {
                model: overrides.model.clone().unwrap_or(model),
                temperature: overrides.temperature.or(match default {
                    BackendConfig::Llm { temperature, .. } => *temperature,
                    BackendConfig::Keyword => None,
                }),
            }),
        }
    }
}

/// Compiles pipelines. Separate from `MatchingService` so tests can count
/// and fake constructions.
pub trait PipelineFactory: Send + Sync {
    fn build(&self, backend: &BackendConfig) -> Result<EvaluationPipeline, ScoringError>;
}

/// Keyword pipelines always; LLM pipelines when an API key was configured.
pub struct DefaultPipelineFactory {
    llm: Option<LlmClient>,
}

impl DefaultPipelineFactory {
    pub fn new(llm: Option<LlmClient>) -> Self {
        Self { llm }
    }
}

impl PipelineFactory for DefaultPipelineFactory {
    fn build(&self, backend: &BackendConfig) -> Result<EvaluationPipeline, ScoringError> {
        let key = backend.cache_key();
        match backend {
            BackendConfig::Keyword => Ok(EvaluationPipeline::new(
                key,
                Arc::new(KeywordDimensionScorer),
                Arc::new(WeightedAggregator),
            )),
            BackendConfig::Llm { model, temperature } => {
                let llm = self.llm.clone().ok_or_else(|| {
                    ScoringError::Backend("ANTHROPIC_API_KEY is not configured".to_string())
                })?;
                let scorer = LlmDimensionScorer::new(
                    llm,
                    CallOptions {
                        model: model.clone(),
                        temperature: *temperature,
                    },
                );
                info!(model = scorer.model(), "Compiled LLM evaluation pipeline");
                Ok(EvaluationPipeline::new(
                    key,
                    Arc::new(scorer),
                    Arc::new(WeightedAggregator),
                ))
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Request / response
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct MatchRequest {
    pub job: Option<Arc<JobProfile>>,
    pub resume: Option<Arc<ResumeDetail>>,
    pub weight_overrides: Option<DimensionWeights>,
    pub model_config: Option<ModelConfig>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchResult {
    pub overall_score: f64,
    pub match_level: String,
    pub dimension_scores: Vec<ScoreDetail>,
    pub recommendations: Vec<String>,
    /// The sanitized weights actually applied.
    pub weights: DimensionWeights,
    pub token_usage: BTreeMap<NodeKind, TokenUsage>,
    pub total_usage: TokenUsage,
    pub backend: String,
    pub version: String,
    pub duration_ms: u64,
}

// ────────────────────────────────────────────────────────────────────────────
// Service
// ────────────────────────────────────────────────────────────────────────────

type PipelineSlot = Arc<OnceCell<Arc<EvaluationPipeline>>>;

pub struct MatchingService {
    factory: Arc<dyn PipelineFactory>,
    default_backend: BackendConfig,
    version: String,
    pipelines: DashMap<String, PipelineSlot>,
}

impl MatchingService {
    pub fn new(
        factory: Arc<dyn PipelineFactory>,
        default_backend: BackendConfig,
        version: impl Into<String>,
    ) -> Self {
        Self {
            factory,
            default_backend,
            version: version.into(),
            pipelines: DashMap::new(),
        }
    }

    pub fn default_backend(&self) -> &BackendConfig {
        &self.default_backend
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub async fn match_resume(
        &self,
        request: MatchRequest,
        listener: Arc<dyn StepListener>,
    ) -> Result<MatchResult, ScoringError> {
        let started = Instant::now();

        let job = request
            .job
            .ok_or_else(|| ScoringError::MissingInput("job profile is required".to_string()))?;
        let resume = request
            .resume
            .ok_or_else(|| ScoringError::MissingInput("resume detail is required".to_string()))?;

        let backend = BackendConfig::resolve(request.model_config.as_ref(), &self.default_backend)?;
        let pipeline = self.pipeline_for(&backend).await?;
        let weights = resolve_weights(request.weight_overrides.as_ref(), &job);

        let output = pipeline.run(job, resume, weights, listener).await?;

        let total_usage = output
            .usage_by_node
            .values()
            .fold(TokenUsage::default(), |mut total, usage| {
                total.add(*usage);
                total
            });

        Ok(MatchResult {
            overall_score: output.aggregate.overall_score,
            match_level: output.aggregate.match_level,
            dimension_scores: output.details,
            recommendations: output.aggregate.recommendations,
            weights,
            token_usage: output.usage_by_node,
            total_usage,
            backend: pipeline.backend().to_string(),
            version: self.version.clone(),
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Returns the shared pipeline for `backend`, compiling it on first use.
    /// Concurrent first callers wait on the same cell; a failed build is not
    /// cached.
    async fn pipeline_for(
        &self,
        backend: &BackendConfig,
    ) -> Result<Arc<EvaluationPipeline>, ScoringError> {
        let key = backend.cache_key();
        let slot = self.pipelines.entry(key.clone()).or_default().clone();

        let pipeline = slot
            .get_or_try_init(|| async {
                debug!(backend = %key, "Compiling evaluation pipeline");
                self.factory.build(backend).map(Arc::new)
            })
            .await?;

        Ok(Arc::clone(pipeline))
    }

    #[cfg(test)]
    fn cached_pipelines(&self) -> usize {
        self.pipelines
            .iter()
            .filter(|entry| entry.value().initialized())
            .count()
    }
}

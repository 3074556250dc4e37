//! Evaluation pipeline: dispatch → six parallel dimension evaluations →
//! aggregate. Every step reports start/end/error to a `StepListener`.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use crate::models::profile::{JobProfile, ResumeDetail};
use crate::models::screening::{Dimension, NodeKind, TokenUsage};
use crate::screening::scorer::{
    AggregateOutcome, Aggregator, DimensionOutcome, DimensionScorer, ScoreDetail, ScoringError,
};
use crate::screening::weights::DimensionWeights;

/// Observes pipeline steps. Implementations must not block: they are called
/// inline on the scoring path.
pub trait StepListener: Send + Sync {
    fn on_step_start(&self, node: NodeKind, input: &Value);
    fn on_step_end(&self, node: NodeKind, output: &Value, usage: Option<TokenUsage>);
    fn on_step_error(&self, node: NodeKind, error: &ScoringError);
}

/// Listener that ignores everything.
pub struct NoopListener;

impl StepListener for NoopListener {
    fn on_step_start(&self, _node: NodeKind, _input: &Value) {}
    fn on_step_end(&self, _node: NodeKind, _output: &Value, _usage: Option<TokenUsage>) {}
    fn on_step_error(&self, _node: NodeKind, _error: &ScoringError) {}
}

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub aggregate: AggregateOutcome,
    /// In `Dimension::ALL` order.
    pub details: Vec<ScoreDetail>,
    /// Only steps that reported non-empty usage appear here.
    pub usage_by_node: BTreeMap<NodeKind, TokenUsage>,
}

/// A compiled pipeline for one backend configuration.
pub struct EvaluationPipeline {
    backend: String,
    scorers: BTreeMap<Dimension, Arc<dyn DimensionScorer>>,
    aggregator: Arc<dyn Aggregator>,
}

impl EvaluationPipeline {
    /// Uses `scorer` for every dimension.
    pub fn new(
        backend: impl Into<String>,
        scorer: Arc<dyn DimensionScorer>,
        aggregator: Arc<dyn Aggregator>,
    ) -> Self {
        let scorers = Dimension::ALL
            .into_iter()
            .map(|d| (d, Arc::clone(&scorer)))
            .collect();
        Self {
            backend: backend.into(),
            scorers,
            aggregator,
        }
    }

    /// Replaces the scorer for one dimension.
    #[cfg(test)]
    pub fn with_scorer(mut self, dimension: Dimension, scorer: Arc<dyn DimensionScorer>) -> Self {
        self.scorers.insert(dimension, scorer);
        self
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub async fn run(
        &self,
        job: Arc<JobProfile>,
        resume: Arc<ResumeDetail>,
        weights: DimensionWeights,
        listener: Arc<dyn StepListener>,
    ) -> Result<PipelineOutput, ScoringError> {
        // Dispatch
        let dispatch_input = json!({
            "job_id": job.id,
            "resume_id": resume.id,
            "backend": self.backend,
            "weights": weights,
        });
        listener.on_step_start(NodeKind::Dispatch, &dispatch_input);

        let mut handles = Vec::with_capacity(Dimension::ALL.len());
        for dimension in Dimension::ALL {
            let Some(scorer) = self.scorers.get(&dimension).cloned() else {
                let err = ScoringError::Backend(format!("no scorer for {dimension}"));
                listener.on_step_error(NodeKind::Dispatch, &err);
                return Err(err);
            };
            let (job, resume, listener) =
                (Arc::clone(&job), Arc::clone(&resume), Arc::clone(&listener));

            handles.push((
                dimension,
                tokio::spawn(async move {
                    evaluate_dimension(dimension, scorer, job, resume, listener).await
                }),
            ));
        }

        listener.on_step_end(
            NodeKind::Dispatch,
            &json!({ "dispatched": Dimension::ALL }),
            None,
        );

        // Fan-in
        let mut details = Vec::with_capacity(handles.len());
        let mut usage_by_node = BTreeMap::new();
        let mut first_error = None;

        for (dimension, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(join_err) => {
                    let err = ScoringError::Panicked {
                        node: dimension.into(),
                        message: join_err.to_string(),
                    };
                    listener.on_step_error(dimension.into(), &err);
                    Err(err)
                }
            };

            match outcome {
                Ok(DimensionOutcome { detail, usage }) => {
                    if let Some(usage) = usage.filter(|u| !u.is_empty()) {
                        usage_by_node.insert(NodeKind::from(dimension), usage);
                    }
                    details.push(detail);
                }
                Err(err) => {
                    if let Some(usage) = err.usage().filter(|u| !u.is_empty()) {
                        usage_by_node.insert(NodeKind::from(dimension), usage);
                    }
                    first_error.get_or_insert(err);
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }

        // Aggregate
        let aggregate_input = json!({ "scores": details, "weights": weights });
        listener.on_step_start(NodeKind::Aggregate, &aggregate_input);

        let aggregate = match self.aggregator.combine(&details, &weights).await {
            Ok(aggregate) => aggregate,
            Err(err) => {
                listener.on_step_error(NodeKind::Aggregate, &err);
                return Err(err);
            }
        };

        if let Some(usage) = aggregate.usage.filter(|u| !u.is_empty()) {
            usage_by_node.insert(NodeKind::Aggregate, usage);
        }
        listener.on_step_end(
            NodeKind::Aggregate,
            &serde_json::to_value(&aggregate).unwrap_or(Value::Null),
            aggregate.usage,
        );

        debug!(
            backend = %self.backend,
            overall = aggregate.overall_score,
            "Pipeline finished"
        );

        Ok(PipelineOutput {
            aggregate,
            details,
            usage_by_node,
        })
    }
}

async fn evaluate_dimension(
    dimension: Dimension,
    scorer: Arc<dyn DimensionScorer>,
    job: Arc<JobProfile>,
    resume: Arc<ResumeDetail>,
    listener: Arc<dyn StepListener>,
) -> Result<DimensionOutcome, ScoringError> {
    let node = NodeKind::from(dimension);
    listener.on_step_start(
        node,
        &json!({
            "dimension": dimension,
            "job_id": job.id,
            "resume_id": resume.id,
        }),
    );

    match scorer.evaluate(dimension, &job, &resume).await {
        Ok(outcome) => {
            listener.on_step_end(
                node,
                &serde_json::to_value(&outcome.detail).unwrap_or(Value::Null),
                outcome.usage,
            );
            Ok(outcome)
        }
        Err(err) => {
            listener.on_step_error(node, &err);
            Err(err)
        }
    }
}

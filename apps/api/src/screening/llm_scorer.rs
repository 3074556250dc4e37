//! Semantic dimension scorer backed by the Anthropic Messages API.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::llm_client::prompts::{EVIDENCE_INSTRUCTION, JSON_ONLY_SYSTEM};
use crate::llm_client::{CallOptions, LlmClient, LlmError, Usage};
use crate::models::profile::{JobProfile, ResumeDetail};
use crate::models::screening::{Dimension, TokenUsage};
use crate::screening::prompts::{dimension_focus, DIMENSION_PROMPT_TEMPLATE, DIMENSION_SYSTEM};
use crate::screening::scorer::{DimensionOutcome, DimensionScorer, ScoreDetail, ScoringError};

/// Asks the model for one dimension's verdict and reports the tokens spent.
pub struct LlmDimensionScorer {
    llm: LlmClient,
    options: CallOptions,
}

#[derive(Debug, Deserialize)]
struct DimensionVerdict {
    score: f64,
    #[serde(default)]
    evidence: Vec<String>,
    #[serde(default)]
    gaps: Vec<String>,
    #[serde(default)]
    summary: String,
}

impl LlmDimensionScorer {
    pub fn new(llm: LlmClient, options: CallOptions) -> Self {
        Self { llm, options }
    }

    pub fn model(&self) -> &str {
        &self.options.model
    }
}

#[async_trait]
impl DimensionScorer for LlmDimensionScorer {
    async fn evaluate(
        &self,
        dimension: Dimension,
        job: &JobProfile,
        resume: &ResumeDetail,
    ) -> Result<DimensionOutcome, ScoringError> {
        let prompt = build_dimension_prompt(dimension, job, resume)?;
        let system = format!("{DIMENSION_SYSTEM} {JSON_ONLY_SYSTEM}");

        let (verdict, usage) = self
            .llm
            .call_json::<DimensionVerdict>(&self.options, &prompt, &system)
            .await
            .map_err(|e| scorer_error(dimension, e))?;

        if !verdict.score.is_finite() {
            return Err(ScoringError::Scorer {
                dimension,
                message: format!("model returned non-numeric score {}", verdict.score),
                usage: Some(token_usage(usage)),
            });
        }

        Ok(DimensionOutcome {
            detail: ScoreDetail {
                dimension,
                score: verdict.score.clamp(0.0, 100.0),
                evidence: verdict.evidence,
                gaps: verdict.gaps,
                summary: verdict.summary,
            },
            usage: Some(token_usage(usage)),
        })
    }
}

fn token_usage(usage: Usage) -> TokenUsage {
    TokenUsage::new(usage.input_tokens as u64, usage.output_tokens as u64)
}

fn scorer_error(dimension: Dimension, err: LlmError) -> ScoringError {
    ScoringError::Scorer {
        dimension,
        usage: err.usage().map(token_usage),
        message: err.to_string(),
    }
}

/// Only the slice of the job and resume relevant to `dimension` goes into the
/// prompt, which keeps token spend proportional to what is judged.
fn dimension_facts(
    dimension: Dimension,
    job: &JobProfile,
    resume: &ResumeDetail,
) -> (serde_json::Value, serde_json::Value) {
    match dimension {
        Dimension::Skill => (
            json!({
                "required_skills": job.required_skills,
                "preferred_skills": job.preferred_skills,
            }),
            json!({
                "skills": resume.skills,
                "experiences": resume.experiences,
            }),
        ),
        Dimension::Responsibility => (
            json!({ "title": job.title, "responsibilities": job.responsibilities }),
            json!({ "summary": resume.summary, "experiences": resume.experiences }),
        ),
        Dimension::Experience => (
            json!({
                "title": job.title,
                "seniority": job.seniority,
                "min_years_experience": job.min_years_experience,
            }),
            json!({
                "total_years_experience": resume.years_of_experience(),
                "experiences": resume.experiences,
            }),
        ),
        Dimension::Education => (
            json!({ "education_level": job.education_level }),
            json!({ "education": resume.education }),
        ),
        Dimension::Industry => (
            json!({ "industries": job.industries, "description": job.description }),
            json!({ "experiences": resume.experiences }),
        ),
        Dimension::Basic => (
            json!({ "location": job.location }),
            json!({
                "candidate_name": resume.candidate_name,
                "email": resume.email,
                "location": resume.location,
            }),
        ),
    }
}

fn build_dimension_prompt(
    dimension: Dimension,
    job: &JobProfile,
    resume: &ResumeDetail,
) -> Result<String, ScoringError> {
    let (job_fact, resume_fact) = dimension_facts(dimension, job, resume);
    let serialize = |value: &serde_json::Value| {
        serde_json::to_string_pretty(value).map_err(|e| ScoringError::Scorer {
            dimension,
            message: format!("failed to serialize facts: {e}"),
            usage: None,
        })
    };

    Ok(DIMENSION_PROMPT_TEMPLATE
        .replace("{evidence_instruction}", EVIDENCE_INSTRUCTION)
        .replace("{focus}", dimension_focus(dimension))
        .replace("{job_json}", &serialize(&job_fact)?)
        .replace("{resume_json}", &serialize(&resume_fact)?)
        .replace("{dimension}", dimension.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> JobProfile {
        JobProfile {
            title: "Data Engineer".to_string(),
            required_skills: vec!["Spark".to_string()],
            industries: vec!["logistics".to_string()],
            ..Default::default()
        }
    }

    fn resume() -> ResumeDetail {
        ResumeDetail {
            candidate_name: "Sam".to_string(),
            skills: vec!["Spark".to_string(), "Scala".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn test_prompt_fills_every_placeholder() {
        for dimension in Dimension::ALL {
            let prompt = build_dimension_prompt(dimension, &job(), &resume()).unwrap();
            assert!(!prompt.contains("{dimension}"));
            assert!(!prompt.contains("{job_json}"));
            assert!(!prompt.contains("{resume_json}"));
            assert!(!prompt.contains("{focus}"));
            assert!(prompt.contains(dimension.as_str()));
        }
    }

    #[test]
    fn test_skill_facts_exclude_unrelated_fields() {
        let (job_fact, resume_fact) = dimension_facts(Dimension::Skill, &job(), &resume());
        assert_eq!(job_fact["required_skills"][0], "Spark");
        assert!(job_fact.get("industries").is_none());
        assert!(resume_fact.get("email").is_none());
    }

    #[test]
    fn test_verdict_tolerates_missing_optional_fields() {
        let verdict: DimensionVerdict = serde_json::from_str(r#"{"score": 64}"#).unwrap();
        assert_eq!(verdict.score, 64.0);
        assert!(verdict.evidence.is_empty());
        assert!(verdict.summary.is_empty());
    }

    #[test]
    fn test_llm_error_maps_to_scorer_error_with_usage() {
        let source = serde_json::from_str::<serde_json::Value>("nope").unwrap_err();
        let err = scorer_error(
            Dimension::Industry,
            LlmError::Malformed {
                source,
                usage: Usage {
                    input_tokens: 40,
                    output_tokens: 2,
                },
            },
        );
        assert_eq!(err.usage(), Some(TokenUsage::new(40, 2)));
        assert!(err.to_string().contains("industry"));
    }
}

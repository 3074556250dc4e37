//! Dimension scoring: trait-based scorers for one (job, resume)
//! pair plus the aggregator that folds six dimension scores into one.
//!
//! Default: `KeywordDimensionScorer` (pure-Rust, deterministic, no tokens).
//! Semantic: `LlmDimensionScorer` in `llm_scorer.rs`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::profile::{JobProfile, ResumeDetail};
use crate::models::screening::{Dimension, NodeKind, TokenUsage};
use crate::screening::weights::DimensionWeights;

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Error)]
pub enum ScoringError {
    #[error("Missing input: {0}")]
    MissingInput(String),

    #[error("{dimension} scorer failed: {message}")]
    Scorer {
        dimension: Dimension,
        message: String,
        usage: Option<TokenUsage>,
    },

    #[error("Aggregation failed: {message}")]
    Aggregator {
        message: String,
        usage: Option<TokenUsage>,
    },

    #[error("Scoring backend unavailable: {0}")]
    Backend(String),

    #[error("{node} step panicked: {message}")]
    Panicked { node: NodeKind, message: String },
}

impl ScoringError {
    /// Tokens already spent before the failure, if the backend reported any.
    pub fn usage(&self) -> Option<TokenUsage> {
        match self {
            ScoringError::Scorer { usage, .. } | ScoringError::Aggregator { usage, .. } => *usage,
            _ => None,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Output data models (shared across all scorer backends)
// ────────────────────────────────────────────────────────────────────────────

/// One dimension's verdict. `score` is 0 – 100.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreDetail {
    pub dimension: Dimension,
    pub score: f64,
    #[serde(default)]
    pub evidence: Vec<String>,
    #[serde(default)]
    pub gaps: Vec<String>,
    #[serde(default)]
    pub summary: String,
}

#[derive(Debug, Clone)]
pub struct DimensionOutcome {
    pub detail: ScoreDetail,
    /// `None` when the backend spends no tokens.
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateOutcome {
    pub overall_score: f64,
    pub match_level: String,
    pub recommendations: Vec<String>,
    #[serde(skip)]
    pub usage: Option<TokenUsage>,
}

/// Label bucket for an overall 0 – 100 score.
pub fn match_level(score: f64) -> &'static str {
    if score >= 85.0 {
        "excellent"
    } else if score >= 70.0 {
        "good"
    } else if score >= 55.0 {
        "fair"
    } else {
        "poor"
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Trait definitions
// ────────────────────────────────────────────────────────────────────────────

/// Scores one dimension for a (job, resume) pair. Implement this to swap
/// backends without touching the pipeline, matcher, or orchestrator.
#[async_trait]
pub trait DimensionScorer: Send + Sync {
    async fn evaluate(
        &self,
        dimension: Dimension,
        job: &JobProfile,
        resume: &ResumeDetail,
    ) -> Result<DimensionOutcome, ScoringError>;
}

/// Folds the six dimension details into one overall score.
#[async_trait]
pub trait Aggregator: Send + Sync {
    async fn combine(
        &self,
        details: &[ScoreDetail],
        weights: &DimensionWeights,
    ) -> Result<AggregateOutcome, ScoringError>;
}

// ────────────────────────────────────────────────────────────────────────────
// KeywordDimensionScorer (default backend)
// ────────────────────────────────────────────────────────────────────────────

/// Pure-Rust keyword scorer. Fast, deterministic, no LLM call.
///
/// Skill coverage uses the same strengths as a keyword fit report:
/// exact skill match → 1.0, substring in resume text → 0.6, none → 0.0,
/// with preferred skills weighted at half a required one.
pub struct KeywordDimensionScorer;

#[async_trait]
impl DimensionScorer for KeywordDimensionScorer {
    async fn evaluate(
        &self,
        dimension: Dimension,
        job: &JobProfile,
        resume: &ResumeDetail,
    ) -> Result<DimensionOutcome, ScoringError> {
        let detail = match dimension {
            Dimension::Skill => score_skills(job, resume),
            Dimension::Responsibility => score_responsibilities(job, resume),
            Dimension::Experience => score_experience(job, resume),
            Dimension::Education => score_education(job, resume),
            Dimension::Industry => score_industry(job, resume),
            Dimension::Basic => score_basic(job, resume),
        };
        Ok(DimensionOutcome {
            detail,
            usage: None,
        })
    }
}

const STRONG_MATCH: f64 = 1.0;
const TEXT_MATCH: f64 = 0.6;
const PREFERRED_WEIGHT: f64 = 0.5;
/// Score given when the job says nothing about a dimension.
const NEUTRAL_SCORE: f64 = 70.0;

fn score_skills(job: &JobProfile, resume: &ResumeDetail) -> ScoreDetail {
    let skills: Vec<String> = resume.skills.iter().map(|s| s.to_lowercase()).collect();
    let text = resume.searchable_text();

    let mut evidence = Vec::new();
    let mut gaps = Vec::new();
    let mut total_weight = 0.0;
    let mut total_score = 0.0;

    let required = job.required_skills.iter().map(|s| (s, 1.0));
    let preferred = job.preferred_skills.iter().map(|s| (s, PREFERRED_WEIGHT));

    for (skill, weight) in required.chain(preferred) {
        let needle = skill.to_lowercase();
        total_weight += weight;

        let strength = if skills.iter().any(|s| *s == needle) {
            evidence.push(format!("lists {skill}"));
            STRONG_MATCH
        } else if text.contains(&needle) {
            evidence.push(format!("mentions {skill} in experience"));
            TEXT_MATCH
        } else {
            if weight >= 1.0 {
                gaps.push(skill.clone());
            }
            0.0
        };
        total_score += strength * weight;
    }

    let score = if total_weight > 0.0 {
        round2(total_score / total_weight * 100.0)
    } else {
        NEUTRAL_SCORE
    };

    ScoreDetail {
        dimension: Dimension::Skill,
        score,
        summary: format!(
            "{} of {} required skills covered",
            job.required_skills.len() - gaps.len(),
            job.required_skills.len()
        ),
        evidence,
        gaps,
    }
}

fn score_responsibilities(job: &JobProfile, resume: &ResumeDetail) -> ScoreDetail {
    if job.responsibilities.is_empty() {
        return neutral(Dimension::Responsibility, "no responsibilities listed");
    }

    let text = resume.searchable_text();
    let mut evidence = Vec::new();
    let mut gaps = Vec::new();
    let mut total = 0.0;

    for responsibility in &job.responsibilities {
        let terms = significant_terms(responsibility);
        if terms.is_empty() {
            continue;
        }
        let hits = terms.iter().filter(|t| text.contains(t.as_str())).count();
        let coverage = hits as f64 / terms.len() as f64;
        if coverage >= 0.5 {
            evidence.push(responsibility.clone());
        } else {
            gaps.push(responsibility.clone());
        }
        total += coverage;
    }

    let considered = evidence.len() + gaps.len();
    let score = if considered == 0 {
        NEUTRAL_SCORE
    } else {
        round2(total / considered as f64 * 100.0)
    };

    ScoreDetail {
        dimension: Dimension::Responsibility,
        score,
        summary: format!("{} of {considered} responsibilities evidenced", evidence.len()),
        evidence,
        gaps,
    }
}

fn score_experience(job: &JobProfile, resume: &ResumeDetail) -> ScoreDetail {
    let years = resume.years_of_experience();
    let Some(min_years) = job.min_years_experience.filter(|m| *m > 0.0) else {
        return ScoreDetail {
            summary: format!("{years:.1} years, no minimum set"),
            ..neutral(Dimension::Experience, "")
        };
    };

    let score = if years >= min_years {
        100.0
    } else {
        round2((years / min_years).clamp(0.0, 1.0) * 100.0)
    };
    let gaps = if years < min_years {
        vec![format!("{min_years:.1}+ years experience")]
    } else {
        vec![]
    };

    ScoreDetail {
        dimension: Dimension::Experience,
        score,
        evidence: vec![format!("{years:.1} years total")],
        gaps,
        summary: format!("{years:.1} of {min_years:.1} required years"),
    }
}

fn score_education(job: &JobProfile, resume: &ResumeDetail) -> ScoreDetail {
    let Some(required) = job.education_level else {
        return neutral(Dimension::Education, "no education requirement");
    };
    let held = resume.highest_education();

    let (score, gaps) = if held >= required {
        (100.0, vec![])
    } else {
        // Each level short costs 25 points.
        let short = (required as i32 - held as i32).max(0) as f64;
        (
            (100.0 - short * 25.0).max(0.0),
            vec![format!("{} degree", required.as_str())],
        )
    };

    ScoreDetail {
        dimension: Dimension::Education,
        score,
        evidence: vec![format!("highest: {}", held.as_str())],
        gaps,
        summary: format!("holds {}, requires {}", held.as_str(), required.as_str()),
    }
}

fn score_industry(job: &JobProfile, resume: &ResumeDetail) -> ScoreDetail {
    if job.industries.is_empty() {
        return neutral(Dimension::Industry, "no industry preference");
    }

    let wanted: Vec<String> = job.industries.iter().map(|i| i.to_lowercase()).collect();
    let evidence: Vec<String> = resume
        .experiences
        .iter()
        .filter_map(|e| e.industry.as_ref())
        .filter(|i| wanted.iter().any(|w| i.to_lowercase().contains(w.as_str())))
        .cloned()
        .collect();

    let (score, gaps) = if evidence.is_empty() {
        (40.0, job.industries.clone())
    } else {
        (100.0, vec![])
    };

    ScoreDetail {
        dimension: Dimension::Industry,
        score,
        summary: format!("{} matching industry positions", evidence.len()),
        evidence,
        gaps,
    }
}

fn score_basic(job: &JobProfile, resume: &ResumeDetail) -> ScoreDetail {
    let mut score: f64 = 100.0;
    let mut evidence = Vec::new();
    let mut gaps = Vec::new();

    if resume.candidate_name.trim().is_empty() {
        score -= 20.0;
        gaps.push("candidate name".to_string());
    }
    match resume.email.as_deref() {
        Some(email) if email.contains('@') => evidence.push("contact email".to_string()),
        _ => {
            score -= 20.0;
            gaps.push("contact email".to_string());
        }
    }

    if let Some(wanted) = job.location.as_deref() {
        let wanted = wanted.to_lowercase();
        let remote = wanted.contains("remote");
        match resume.location.as_deref().map(str::to_lowercase) {
            Some(loc) if remote || loc.contains(&wanted) || wanted.contains(&loc) => {
                evidence.push(format!("location {loc}"));
            }
            _ => {
                score -= 30.0;
                gaps.push(format!("location {wanted}"));
            }
        }
    }

    ScoreDetail {
        dimension: Dimension::Basic,
        score: score.max(0.0),
        summary: format!("{} basic checks passed", evidence.len()),
        evidence,
        gaps,
    }
}

fn neutral(dimension: Dimension, summary: &str) -> ScoreDetail {
    ScoreDetail {
        dimension,
        score: NEUTRAL_SCORE,
        evidence: vec![],
        gaps: vec![],
        summary: summary.to_string(),
    }
}

/// Lowercased words of four or more letters, minus a few fillers.
fn significant_terms(text: &str) -> Vec<String> {
    const STOP: [&str; 8] = ["with", "from", "that", "this", "your", "will", "their", "into"];
    let mut terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 4)
        .map(str::to_lowercase)
        .filter(|w| !STOP.contains(&w.as_str()))
        .collect();
    terms.sort();
    terms.dedup();
    terms
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ────────────────────────────────────────────────────────────────────────────
// WeightedAggregator
// ────────────────────────────────────────────────────────────────────────────

/// overall = Σ weightᵢ × scoreᵢ, clamped to 0 – 100.
pub struct WeightedAggregator;

#[async_trait]
impl Aggregator for WeightedAggregator {
    async fn combine(
        &self,
        details: &[ScoreDetail],
        weights: &DimensionWeights,
    ) -> Result<AggregateOutcome, ScoringError> {
        for dimension in Dimension::ALL {
            if !details.iter().any(|d| d.dimension == dimension) {
                return Err(ScoringError::Aggregator {
                    message: format!("missing {dimension} score"),
                    usage: None,
                });
            }
        }

        let overall: f64 = details
            .iter()
            .map(|d| weights.get(d.dimension) * d.score.clamp(0.0, 100.0))
            .sum();
        let overall_score = round2(overall.clamp(0.0, 100.0));

        Ok(AggregateOutcome {
            overall_score,
            match_level: match_level(overall_score).to_string(),
            recommendations: build_recommendations(overall_score, details, weights),
            usage: None,
        })
    }
}

/// Human-readable follow-ups, weakest weighted dimensions first.
fn build_recommendations(
    score: f64,
    details: &[ScoreDetail],
    weights: &DimensionWeights,
) -> Vec<String> {
    let mut weak: Vec<&ScoreDetail> = details.iter().filter(|d| d.score < 60.0).collect();
    weak.sort_by(|a, b| {
        let loss_a = weights.get(a.dimension) * (100.0 - a.score);
        let loss_b = weights.get(b.dimension) * (100.0 - b.score);
        loss_b.total_cmp(&loss_a)
    });

    let mut recommendations = vec![match match_level(score) {
        "excellent" => "Strong match. Advance to interview.".to_string(),
        "good" => format!("Good match ({score:.0}/100). Worth a screening call."),
        "fair" => format!("Partial match ({score:.0}/100). Review gaps before advancing."),
        _ => format!("Weak match ({score:.0}/100). Not recommended for this role."),
    }];

    for detail in weak.into_iter().take(3) {
        let gaps: Vec<&str> = detail.gaps.iter().take(3).map(String::as_str).collect();
        if gaps.is_empty() {
            recommendations.push(format!("Probe {} in interview.", detail.dimension));
        } else {
            recommendations.push(format!(
                "Probe {} in interview: missing {}.",
                detail.dimension,
                gaps.join(", ")
            ));
        }
    }

    recommendations
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

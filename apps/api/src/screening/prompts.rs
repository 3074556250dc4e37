// LLM prompt constants for dimension scoring.
// Reuses cross-cutting fragments from llm_client::prompts.

/// Role half of the system prompt; the JSON-only fragment is appended at call time.
pub const DIMENSION_SYSTEM: &str = "You are an experienced technical recruiter \
    screening a candidate against a single hiring criterion.";

/// Dimension prompt template. Replace `{dimension}`, `{focus}`,
/// `{evidence_instruction}`, `{job_json}` and `{resume_json}` before sending.
pub const DIMENSION_PROMPT_TEMPLATE: &str = r#"Evaluate the candidate on the "{dimension}" dimension only.

Focus: {focus}

{evidence_instruction}

Job requirements:
{job_json}

Candidate:
{resume_json}

Return a JSON object with this EXACT schema (no extra fields):
{
  "score": 72.5,
  "evidence": ["Led payments platform migration for 3 years"],
  "gaps": ["No Kubernetes experience stated"],
  "summary": "One sentence verdict."
}

Rules:
- score is a number from 0 (no fit) to 100 (complete fit).
- Judge ONLY the {dimension} dimension; ignore everything else.
"#;

/// What each dimension looks at, phrased for the prompt.
pub fn dimension_focus(dimension: crate::models::screening::Dimension) -> &'static str {
    use crate::models::screening::Dimension;
    match dimension {
        Dimension::Skill => {
            "coverage of required and preferred skills, explicit or clearly demonstrated"
        }
        Dimension::Responsibility => {
            "whether past duties match the responsibilities of this role in scope and kind"
        }
        Dimension::Experience => "years and seniority of relevant professional experience",
        Dimension::Education => "degree level and field relative to the stated requirement",
        Dimension::Industry => "exposure to the industries or domains the job names",
        Dimension::Basic => "contact details, location fit, and completeness of the profile",
    }
}

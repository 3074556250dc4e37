// Shared prompt fragments. Each service that needs LLM calls defines its own
// prompts.rs alongside it; cross-cutting pieces live here.

/// System prompt fragment that enforces JSON-only output.
pub const JSON_ONLY_SYSTEM: &str = "You are a precise, structured assistant. \
    You MUST respond with valid JSON only. \
    Do NOT include any text outside the JSON object. \
    Do NOT use markdown code fences. \
    Do NOT include explanations or apologies.";

/// Keeps the model's verdict traceable to the resume it was given.
pub const EVIDENCE_INSTRUCTION: &str = "\
    CRITICAL: Every piece of evidence you cite must quote or closely paraphrase \
    a fact present in the candidate data provided. Do NOT infer skills, years, \
    degrees, or employers that are not stated. If the data is silent, list the \
    requirement as a gap instead of guessing.";

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Highest completed education, ordered so comparisons read naturally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EducationLevel {
    #[default]
    None,
    HighSchool,
    Associate,
    Bachelor,
    Master,
    Doctorate,
}

impl EducationLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            EducationLevel::None => "none",
            EducationLevel::HighSchool => "high_school",
            EducationLevel::Associate => "associate",
            EducationLevel::Bachelor => "bachelor",
            EducationLevel::Master => "master",
            EducationLevel::Doctorate => "doctorate",
        }
    }
}

/// The job a batch of resumes is screened against.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobProfile {
    /// Documents stored without an id get the row id on load.
    #[serde(default)]
    pub id: Uuid,
    pub title: String,
    /// Free-form level such as "junior", "senior", "staff".
    #[serde(default)]
    pub seniority: Option<String>,
    #[serde(default)]
    pub required_skills: Vec<String>,
    #[serde(default)]
    pub preferred_skills: Vec<String>,
    #[serde(default)]
    pub responsibilities: Vec<String>,
    #[serde(default)]
    pub min_years_experience: Option<f64>,
    #[serde(default)]
    pub education_level: Option<EducationLevel>,
    #[serde(default)]
    pub industries: Vec<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkExperience {
    pub title: String,
    pub company: String,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub years: f64,
    #[serde(default)]
    pub highlights: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EducationEntry {
    pub level: EducationLevel,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub institution: Option<String>,
}

/// Parsed facts about one candidate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResumeDetail {
    #[serde(default)]
    pub id: Uuid,
    pub candidate_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub total_years_experience: Option<f64>,
    #[serde(default)]
    pub experiences: Vec<WorkExperience>,
    #[serde(default)]
    pub education: Vec<EducationEntry>,
}

impl ResumeDetail {
    /// Total years, falling back to the sum over listed positions.
    pub fn years_of_experience(&self) -> f64 {
        self.total_years_experience
            .unwrap_or_else(|| self.experiences.iter().map(|e| e.years.max(0.0)).sum())
    }

    pub fn highest_education(&self) -> EducationLevel {
        self.education
            .iter()
            .map(|e| e.level)
            .max()
            .unwrap_or_default()
    }

    /// Summary plus every experience highlight, lowercased, for substring matching.
    pub fn searchable_text(&self) -> String {
        let mut text = self.summary.clone().unwrap_or_default();
        for exp in &self.experiences {
            text.push('\n');
            text.push_str(&exp.title);
            for highlight in &exp.highlights {
                text.push('\n');
                text.push_str(highlight);
            }
        }
        text.to_lowercase()
    }
}

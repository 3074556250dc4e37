//! Dimension weights: the default table, inference from a job profile, and
//! the sanitizer every weight vector passes through before scoring.

use serde::{Deserialize, Serialize};

use crate::errors::AppError;
use crate::models::profile::JobProfile;
use crate::models::screening::Dimension;

/// Any dimension strictly between 0 and this is raised to it.
pub const WEIGHT_FLOOR: f64 = 0.03;
/// Sums below this are treated as an all-zero vector.
pub const DEGENERATE_SUM: f64 = 0.01;
/// Sums within this of 1.0 are left as-is.
pub const SUM_TOLERANCE: f64 = 0.01;

/// Relative importance of the six dimensions. Should sum to 1 after sanitizing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DimensionWeights {
    pub skill: f64,
    pub responsibility: f64,
    pub experience: f64,
    pub education: f64,
    pub industry: f64,
    pub basic: f64,
}

impl Default for DimensionWeights {
    fn default() -> Self {
        Self {
            skill: 0.35,
            responsibility: 0.20,
            experience: 0.20,
            education: 0.10,
            industry: 0.10,
            basic: 0.05,
        }
    }
}

impl DimensionWeights {
    pub fn get(&self, dimension: Dimension) -> f64 {
        match dimension {
            Dimension::Skill => self.skill,
            Dimension::Responsibility => self.responsibility,
            Dimension::Experience => self.experience,
            Dimension::Education => self.education,
            Dimension::Industry => self.industry,
            Dimension::Basic => self.basic,
        }
    }

    fn get_mut(&mut self, dimension: Dimension) -> &mut f64 {
        match dimension {
            Dimension::Skill => &mut self.skill,
            Dimension::Responsibility => &mut self.responsibility,
            Dimension::Experience => &mut self.experience,
            Dimension::Education => &mut self.education,
            Dimension::Industry => &mut self.industry,
            Dimension::Basic => &mut self.basic,
        }
    }

    pub fn sum(&self) -> f64 {
        Dimension::ALL.iter().map(|d| self.get(*d)).sum()
    }

    /// Format check applied to caller overrides before anything is persisted.
    pub fn validate(&self) -> Result<(), AppError> {
        for dimension in Dimension::ALL {
            let value = self.get(dimension);
            if !value.is_finite() {
                return Err(AppError::Validation(format!(
                    "weight for '{dimension}' must be a finite number, got {value}"
                )));
            }
        }
        Ok(())
    }
}

/// Returns a valid, normalized weight vector or the default table.
///
/// 1. negatives clamp to 0
/// 2. values in (0, WEIGHT_FLOOR) are raised to the floor
/// 3. a sum below DEGENERATE_SUM returns the default vector
/// 4. a sum further than SUM_TOLERANCE from 1 is divided out, and any
///    weight that falls back under the floor is pinned there
///
/// The result is a fixed point: sanitizing it again changes nothing.
pub fn sanitize(weights: &DimensionWeights) -> DimensionWeights {
    let mut out = *weights;

    for dimension in Dimension::ALL {
        let value = out.get_mut(dimension);
        if value.is_nan() || *value < 0.0 {
            *value = 0.0;
        }
        if *value > 0.0 && *value < WEIGHT_FLOOR {
            *value = WEIGHT_FLOOR;
        }
    }

    let sum = out.sum();
    if !sum.is_finite() || sum < DEGENERATE_SUM {
        return DimensionWeights::default();
    }

    if (sum - 1.0).abs() > SUM_TOLERANCE {
        for dimension in Dimension::ALL {
            *out.get_mut(dimension) /= sum;
        }
        pin_to_floor(&mut out);
    }

    out
}

/// Pins weights that normalization pushed under the floor at exactly
/// `WEIGHT_FLOOR` and rescales the rest to `1 - WEIGHT_FLOOR * pinned`.
/// Rescaling can push another weight under, so repeat until stable.
fn pin_to_floor(weights: &mut DimensionWeights) {
    let mut pinned = [false; Dimension::ALL.len()];
    loop {
        let mut changed = false;
        for (i, dimension) in Dimension::ALL.iter().enumerate() {
            let value = weights.get_mut(*dimension);
            if !pinned[i] && *value > 0.0 && *value < WEIGHT_FLOOR {
                *value = WEIGHT_FLOOR;
                pinned[i] = true;
                changed = true;
            }
        }
        if !changed {
            return;
        }

        let pinned_count = pinned.iter().filter(|p| **p).count();
        let budget = 1.0 - WEIGHT_FLOOR * pinned_count as f64;
        let free: f64 = Dimension::ALL
            .iter()
            .enumerate()
            .filter(|(i, _)| !pinned[*i])
            .map(|(_, d)| weights.get(*d))
            .sum();
        if free <= 0.0 {
            return;
        }
        for (i, dimension) in Dimension::ALL.iter().enumerate() {
            if !pinned[i] {
                *weights.get_mut(*dimension) *= budget / free;
            }
        }
    }
}

/// Picks a weight vector for a job when the caller gave no override.
///
/// Entry-level roles lean on education, senior roles on experience and
/// responsibility scope. Anything else gets the default table.
pub fn infer_weights(job: &JobProfile) -> DimensionWeights {
    let seniority = job
        .seniority
        .as_deref()
        .unwrap_or_default()
        .to_lowercase();
    let title = job.title.to_lowercase();
    let mentions = |needles: &[&str]| {
        needles
            .iter()
            .any(|n| seniority.contains(n) || title.contains(n))
    };

    if mentions(&["intern", "junior", "entry", "graduate", "trainee"]) {
        DimensionWeights {
            skill: 0.35,
            responsibility: 0.10,
            experience: 0.10,
            education: 0.25,
            industry: 0.05,
            basic: 0.15,
        }
    } else if mentions(&["senior", "lead", "principal", "staff", "head", "director"]) {
        DimensionWeights {
            skill: 0.30,
            responsibility: 0.25,
            experience: 0.25,
            education: 0.05,
            industry: 0.10,
            basic: 0.05,
        }
    } else {
        DimensionWeights::default()
    }
}

/// Override if given, otherwise inferred; always sanitized.
pub fn resolve_weights(overrides: Option<&DimensionWeights>, job: &JobProfile) -> DimensionWeights {
    match overrides {
        Some(w) => sanitize(w),
        None => sanitize(&infer_weights(job)),
    }
}

//! Running statistics for one batch run, fed by workers finishing in any order.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::Serialize;

/// What one worker produced for one resume. Never persisted directly.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessResult {
    pub success: bool,
    pub score: f64,
    pub match_level: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub error: Option<String>,
}

impl ProcessResult {
    pub fn succeeded(score: f64, match_level: impl Into<String>, input: u64, output: u64) -> Self {
        Self {
            success: true,
            score,
            match_level: match_level.into(),
            input_tokens: input,
            output_tokens: output,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Point-in-time copy of the collector. `processed == succeeded + failed`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateStats {
    pub processed: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub score_sum: f64,
    pub score_count: u32,
    pub match_levels: BTreeMap<String, u32>,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl AggregateStats {
    pub fn average_score(&self) -> f64 {
        if self.score_count == 0 {
            0.0
        } else {
            self.score_sum / self.score_count as f64
        }
    }
}

/// Thread-safe accumulator. Every update is one critical section, so a
/// snapshot never observes a half-applied outcome.
#[derive(Debug, Default)]
pub struct ResultCollector {
    stats: Mutex<AggregateStats>,
}

impl ResultCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collect(&self, outcome: &ProcessResult) {
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());

        if outcome.success {
            stats.succeeded += 1;
            stats.score_sum += outcome.score;
            stats.score_count += 1;
            *stats
                .match_levels
                .entry(outcome.match_level.clone())
                .or_insert(0) += 1;
            stats.input_tokens += outcome.input_tokens;
            stats.output_tokens += outcome.output_tokens;
        } else {
            stats.failed += 1;
        }

        // Derived, never incremented on its own.
        stats.processed = stats.succeeded + stats.failed;
    }

    pub fn snapshot(&self) -> AggregateStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_success_updates_scores_histogram_and_tokens() {
        let collector = ResultCollector::new();
        collector.collect(&ProcessResult::succeeded(80.0, "good", 100, 10));
        collector.collect(&ProcessResult::succeeded(90.0, "excellent", 50, 5));
        collector.collect(&ProcessResult::succeeded(70.0, "good", 0, 0));

        let stats = collector.snapshot();
        assert_eq!(stats.processed, 3);
        assert_eq!(stats.succeeded, 3);
        assert_eq!(stats.failed, 0);
        assert_eq!(stats.match_levels.get("good"), Some(&2));
        assert_eq!(stats.match_levels.get("excellent"), Some(&1));
        assert_eq!(stats.input_tokens, 150);
        assert_eq!(stats.output_tokens, 15);
        assert!((stats.average_score() - 80.0).abs() < 1e-9);
    }

    #[test]
    fn test_failure_only_counts() {
        let collector = ResultCollector::new();
        let mut failed = ProcessResult::failed("resume not found");
        // Token counts on a failed outcome are ignored.
        failed.input_tokens = 999;
        collector.collect(&failed);

        let stats = collector.snapshot();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.score_count, 0);
        assert_eq!(stats.input_tokens, 0);
        assert!(stats.match_levels.is_empty());
        assert_eq!(stats.average_score(), 0.0);
    }

    #[test]
    fn test_snapshot_is_independent_copy() {
        let collector = ResultCollector::new();
        collector.collect(&ProcessResult::succeeded(60.0, "fair", 1, 1));
        let mut snapshot = collector.snapshot();
        snapshot.match_levels.insert("poor".to_string(), 42);
        snapshot.succeeded = 100;

        let fresh = collector.snapshot();
        assert_eq!(fresh.succeeded, 1);
        assert!(!fresh.match_levels.contains_key("poor"));
    }

    #[test]
    fn test_invariant_holds_under_concurrent_collection() {
        let collector = Arc::new(ResultCollector::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let collector = Arc::clone(&collector);
                std::thread::spawn(move || {
                    for i in 0..250 {
                        let outcome = if (t + i) % 3 == 0 {
                            ProcessResult::failed("boom")
                        } else {
                            ProcessResult::succeeded(50.0, if i % 2 == 0 { "fair" } else { "poor" }, 2, 1)
                        };
                        collector.collect(&outcome);
                        let stats = collector.snapshot();
                        assert_eq!(stats.processed, stats.succeeded + stats.failed);
                        assert_eq!(stats.match_levels.values().sum::<u32>(), stats.succeeded);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let stats = collector.snapshot();
        assert_eq!(stats.processed, 2000);
        assert_eq!(stats.processed, stats.succeeded + stats.failed);
        assert_eq!(stats.match_levels.values().sum::<u32>(), stats.succeeded);
        assert_eq!(stats.input_tokens, 2 * stats.succeeded as u64);
    }
}

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::classifier::Outcome;
use crate::orchestrator::AttemptResult;
use crate::variant::Technique;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TechniqueStats {
    pub attempts: usize,
    pub successes: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointStats {
    pub attempts: usize,
    pub successes: usize,
    pub errors: usize,
    pub timeouts: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_attempts: usize,
    pub successes: usize,
    pub failures: usize,
    pub errors: usize,
    pub timeouts: usize,
    /// Percentage, 0-100.
    pub success_rate: f64,
    pub by_technique: BTreeMap<Technique, TechniqueStats>,
    pub by_endpoint: BTreeMap<String, EndpointStats>,
    /// Seconds.
    pub avg_response_time: f64,
    pub min_response_time: f64,
    pub max_response_time: f64,
    pub unique_variants: usize,
    pub peak_in_flight: usize,
}

/// Folds attempt results into a `RunSummary` as they arrive, keeping the
/// results themselves for the report.
#[derive(Debug, Default)]
pub struct StatsAggregator {
    results: Vec<AttemptResult>,
    summary: RunSummary,
    variants_seen: HashSet<String>,
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accumulate(&mut self, result: AttemptResult) {
        let summary = &mut self.summary;
        summary.total_attempts += 1;

        let success = result.outcome == Outcome::Success;
        match result.outcome {
            Outcome::Success => summary.successes += 1,
            Outcome::Failure => summary.failures += 1,
            Outcome::Error => summary.errors += 1,
            Outcome::Timeout => summary.timeouts += 1,
        }

        let technique = summary.by_technique.entry(result.variant.technique).or_default();
        technique.attempts += 1;
        technique.successes += usize::from(success);

        let endpoint = summary.by_endpoint.entry(result.endpoint.url.clone()).or_default();
        endpoint.attempts += 1;
        endpoint.successes += usize::from(success);
        endpoint.errors += usize::from(result.outcome == Outcome::Error);
        endpoint.timeouts += usize::from(result.outcome == Outcome::Timeout);

        let n = summary.total_attempts as f64;
        let t = result.response_time;
        summary.avg_response_time += (t - summary.avg_response_time) / n;
        if summary.total_attempts == 1 {
            summary.min_response_time = t;
            summary.max_response_time = t;
        } else {
            summary.min_response_time = summary.min_response_time.min(t);
            summary.max_response_time = summary.max_response_time.max(t);
        }

        summary.success_rate = summary.successes as f64 / n * 100.0;

        if self.variants_seen.insert(result.variant.transformed.clone()) {
            summary.unique_variants += 1;
        }

        self.results.push(result);
    }

    pub fn record_peak_in_flight(&mut self, peak: usize) {
        self.summary.peak_in_flight = self.summary.peak_in_flight.max(peak);
    }

    pub fn summary(&self) -> RunSummary {
        self.summary.clone()
    }

    pub fn results(&self) -> &[AttemptResult] {
        &self.results
    }

    pub fn finalize(self) -> (RunSummary, Vec<AttemptResult>) {
        (self.summary, self.results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::Endpoint;
    use crate::variant::VariantGenerator;
    use chrono::Utc;
    use url::Url;

    fn result(technique: Technique, outcome: Outcome, response_time: f64, path: &str) -> AttemptResult {
        let variant = VariantGenerator::with_seed(0)
            .generate("admin@example.com", 1, &[technique])
            .remove(0);
        let target = Url::parse("https://example.com").unwrap();
        AttemptResult {
            variant,
            endpoint: Endpoint::declared(&target, path),
            timestamp: Utc::now(),
            status_code: Some(200),
            response_time,
            outcome,
            evidence: String::new(),
            indicators: Vec::new(),
        }
    }

    #[test]
    fn empty_run_has_zeroed_summary() {
        let (summary, results) = StatsAggregator::new().finalize();
        assert_eq!(summary.total_attempts, 0);
        assert_eq!(summary.success_rate, 0.0);
        assert!(results.is_empty());
    }

    #[test]
    fn outcome_counts_always_add_up() {
        let mut stats = StatsAggregator::new();
        let outcomes = [
            Outcome::Success,
            Outcome::Failure,
            Outcome::Failure,
            Outcome::Error,
            Outcome::Timeout,
        ];
        for (i, outcome) in outcomes.into_iter().enumerate() {
            stats.accumulate(result(Technique::Homograph, outcome, 0.1, "/reset"));
            let s = stats.summary();
            assert_eq!(s.successes + s.failures + s.errors + s.timeouts, s.total_attempts);
            assert_eq!(s.total_attempts, i + 1);
        }

        let summary = stats.summary();
        assert_eq!(summary.success_rate, 20.0);
        assert_eq!(summary.by_endpoint["https://example.com/reset"].errors, 1);
        assert_eq!(summary.by_endpoint["https://example.com/reset"].timeouts, 1);
    }

    #[test]
    fn techniques_are_counted_separately() {
        let mut stats = StatsAggregator::new();
        stats.accumulate(result(Technique::Homograph, Outcome::Success, 0.2, "/a"));
        stats.accumulate(result(Technique::ZeroWidth, Outcome::Failure, 0.2, "/a"));
        stats.accumulate(result(Technique::ZeroWidth, Outcome::Success, 0.2, "/b"));

        let summary = stats.summary();
        assert_eq!(
            summary.by_technique[&Technique::ZeroWidth],
            TechniqueStats { attempts: 2, successes: 1 }
        );
        assert_eq!(
            summary.by_technique[&Technique::Homograph],
            TechniqueStats { attempts: 1, successes: 1 }
        );
        assert_eq!(summary.by_endpoint.len(), 2);
        assert_eq!(summary.unique_variants, 2);
    }

    #[test]
    fn response_time_mean_is_incremental() {
        let mut stats = StatsAggregator::new();
        for t in [1.0, 2.0, 6.0] {
            stats.accumulate(result(Technique::Punycode, Outcome::Failure, t, "/a"));
        }
        let summary = stats.summary();
        assert!((summary.avg_response_time - 3.0).abs() < 1e-9);
        assert_eq!(summary.min_response_time, 1.0);
        assert_eq!(summary.max_response_time, 6.0);
    }

    #[test]
    fn all_errors_still_summarise() {
        let mut stats = StatsAggregator::new();
        for _ in 0..3 {
            stats.accumulate(result(Technique::Mixed, Outcome::Error, 0.0, "/a"));
        }
        stats.record_peak_in_flight(2);
        let (summary, results) = stats.finalize();
        assert_eq!(summary.errors, 3);
        assert_eq!(summary.success_rate, 0.0);
        assert_eq!(summary.peak_in_flight, 2);
        assert_eq!(results.len(), 3);
    }
}

use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::discovery::EndpointKind;
use crate::transport::{RawResponse, TransportError};

/// Bytes of the body kept for marker matching.
pub const MARKER_SCAN_BYTES: usize = 16 * 1024;
/// Characters of the body kept as evidence on each result.
pub const EVIDENCE_CHARS: usize = 200;

lazy_static! {
    static ref SUCCESS_PATTERNS: Vec<(&'static str, Regex)> = compile(&[
        r"email.*sent",
        r"check.*email",
        r"reset.*link",
        r"password.*reset",
        r"verification.*email",
        r"recovery.*email",
    ]);
    static ref FAILURE_PATTERNS: Vec<(&'static str, Regex)> = compile(&[
        r"user.*not.*found",
        r"email.*not.*found",
        r"invalid.*email",
        r"account.*not.*exist",
    ]);
    static ref RATE_LIMIT_PATTERNS: Vec<(&'static str, Regex)> = compile(&[
        r"too.*many.*requests",
        r"rate.*limit",
        r"try.*again.*later",
    ]);
}

fn compile(patterns: &[&'static str]) -> Vec<(&'static str, Regex)> {
    patterns
        .iter()
        .map(|p| (*p, Regex::new(p).expect("valid marker pattern")))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Outcome {
    Success,
    Failure,
    Error,
    Timeout,
}

/// How far a response must drift from the baseline to count as a
/// behavioural difference. These are starting points meant to be tuned
/// per target.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassifierThresholds {
    pub length_bucket: usize,
    pub timing_multiplier: f64,
    pub min_timing_delta: Duration,
}

impl Default for ClassifierThresholds {
    fn default() -> Self {
        ClassifierThresholds {
            length_bucket: 64,
            timing_multiplier: 3.0,
            min_timing_delta: Duration::from_millis(250),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFeatures {
    pub status: u16,
    pub length: usize,
    pub elapsed: Duration,
    /// Lower-cased head of the body.
    pub body_excerpt: String,
}

impl ResponseFeatures {
    pub fn from_response(response: &RawResponse) -> Self {
        let mut excerpt = response.body.to_lowercase();
        crate::transport::truncate_at_char_boundary(&mut excerpt, MARKER_SCAN_BYTES);
        ResponseFeatures {
            status: response.status,
            length: response.body.len(),
            elapsed: response.elapsed,
            body_excerpt: excerpt,
        }
    }

    fn length_bucket(&self, bucket: usize) -> usize {
        self.length / bucket.max(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub outcome: Outcome,
    pub indicators: Vec<String>,
}

impl Verdict {
    fn new(outcome: Outcome, indicators: Vec<String>) -> Self {
        Verdict { outcome, indicators }
    }
}

pub fn accepted_statuses(kind: EndpointKind) -> &'static [u16] {
    match kind {
        EndpointKind::PasswordReset => &[200, 201, 202, 204, 302, 303],
        EndpointKind::OAuth => &[200, 302, 303, 307],
        EndpointKind::GenericForm => &[200, 201, 202, 302, 303],
    }
}

/// Decides one attempt. First matching rule wins; anything ambiguous is a
/// `Failure`.
pub fn classify(
    observed: Result<&ResponseFeatures, &TransportError>,
    baseline: Option<&ResponseFeatures>,
    kind: EndpointKind,
    thresholds: &ClassifierThresholds,
) -> Verdict {
    let response = match observed {
        Ok(response) => response,
        Err(e) if e.is_timeout() => return Verdict::new(Outcome::Timeout, vec!["timeout".into()]),
        Err(_) => return Verdict::new(Outcome::Error, vec!["transport".into()]),
    };

    let mut indicators = matches("success", &SUCCESS_PATTERNS, &response.body_excerpt);

    if !accepted_statuses(kind).contains(&response.status) {
        indicators.push(format!("status:{}", response.status));
        return Verdict::new(Outcome::Failure, indicators);
    }

    let mut failures = matches("failure", &FAILURE_PATTERNS, &response.body_excerpt);
    failures.extend(matches("rate_limit", &RATE_LIMIT_PATTERNS, &response.body_excerpt));
    if !failures.is_empty() {
        indicators.extend(failures);
        return Verdict::new(Outcome::Failure, indicators);
    }

    let Some(baseline) = baseline else {
        indicators.push("no_baseline".into());
        return Verdict::new(Outcome::Failure, indicators);
    };

    let differences = behavioural_differences(response, baseline, thresholds);
    let outcome = if differences.is_empty() {
        Outcome::Failure
    } else {
        Outcome::Success
    };
    indicators.extend(differences);
    Verdict::new(outcome, indicators)
}

fn behavioural_differences(
    response: &ResponseFeatures,
    baseline: &ResponseFeatures,
    thresholds: &ClassifierThresholds,
) -> Vec<String> {
    let mut differences = Vec::new();

    if response.status != baseline.status {
        differences.push(format!("diff:status:{}->{}", baseline.status, response.status));
    }

    let bucket = thresholds.length_bucket;
    if response.length_bucket(bucket) != baseline.length_bucket(bucket) {
        differences.push(format!("diff:length:{}->{}", baseline.length, response.length));
    }

    let limit = baseline.elapsed.as_secs_f64() * thresholds.timing_multiplier;
    let slower = response.elapsed.as_secs_f64() > limit;
    let delta = response.elapsed.saturating_sub(baseline.elapsed);
    if slower && delta >= thresholds.min_timing_delta {
        differences.push(format!(
            "diff:timing:{}ms->{}ms",
            baseline.elapsed.as_millis(),
            response.elapsed.as_millis()
        ));
    }

    differences
}

fn matches(label: &str, patterns: &[(&'static str, Regex)], body: &str) -> Vec<String> {
    patterns
        .iter()
        .filter(|(_, re)| re.is_match(body))
        .map(|(pattern, _)| format!("{}:{}", label, pattern))
        .collect()
}

/// Short, single-line excerpt stored on each result.
pub fn evidence(observed: Result<&RawResponse, &TransportError>) -> String {
    match observed {
        Ok(response) => response
            .body
            .chars()
            .take(EVIDENCE_CHARS)
            .map(|c| if c.is_control() { ' ' } else { c })
            .collect(),
        Err(e) => e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(status: u16, body: &str, elapsed_ms: u64) -> ResponseFeatures {
        ResponseFeatures {
            status,
            length: body.len(),
            elapsed: Duration::from_millis(elapsed_ms),
            body_excerpt: body.to_lowercase(),
        }
    }

    fn run(response: &ResponseFeatures, baseline: Option<&ResponseFeatures>) -> Verdict {
        classify(
            Ok(response),
            baseline,
            EndpointKind::PasswordReset,
            &ClassifierThresholds::default(),
        )
    }

    #[test]
    fn transport_failures_short_circuit() {
        let thresholds = ClassifierThresholds::default();
        let timeout = TransportError::Timeout(Duration::from_secs(1));
        let refused = TransportError::Connect("refused".into());

        let verdict = classify(Err(&timeout), None, EndpointKind::OAuth, &thresholds);
        assert_eq!(verdict.outcome, Outcome::Timeout);

        let verdict = classify(Err(&refused), None, EndpointKind::OAuth, &thresholds);
        assert_eq!(verdict.outcome, Outcome::Error);
    }

    #[test]
    fn unaccepted_status_is_failure_even_when_different() {
        let baseline = features(200, "ok", 10);
        let verdict = run(&features(500, "boom", 10), Some(&baseline));
        assert_eq!(verdict.outcome, Outcome::Failure);
        assert!(verdict.indicators.contains(&"status:500".to_string()));
    }

    #[test]
    fn failure_markers_beat_behavioural_differences() {
        let baseline = features(200, "We sent you a link", 10);
        let response = features(202, "Sorry, user was not found", 10);
        let verdict = run(&response, Some(&baseline));
        assert_eq!(verdict.outcome, Outcome::Failure);
        assert!(verdict.indicators.iter().any(|i| i.starts_with("failure:")));
    }

    #[test]
    fn rate_limit_pages_are_failures() {
        let baseline = features(200, "", 10);
        let verdict = run(&features(200, "Too many requests, try again later", 10), Some(&baseline));
        assert_eq!(verdict.outcome, Outcome::Failure);
        assert!(verdict.indicators.iter().any(|i| i.starts_with("rate_limit:")));
    }

    #[test]
    fn distinct_status_against_baseline_is_success() {
        let baseline = features(200, "If the account exists we emailed it", 40);
        let response = features(302, "If the account exists we emailed it", 40);
        let verdict = run(&response, Some(&baseline));
        assert_eq!(verdict.outcome, Outcome::Success);
        assert!(verdict.indicators.contains(&"diff:status:200->302".to_string()));
    }

    #[test]
    fn length_bucket_change_is_success_but_small_drift_is_not() {
        let baseline = features(200, &"x".repeat(100), 40);

        let same_bucket = features(200, &"y".repeat(110), 40);
        assert_eq!(run(&same_bucket, Some(&baseline)).outcome, Outcome::Failure);

        let other_bucket = features(200, &"y".repeat(400), 40);
        assert_eq!(run(&other_bucket, Some(&baseline)).outcome, Outcome::Success);
    }

    #[test]
    fn timing_needs_both_multiplier_and_absolute_delta() {
        let baseline = features(200, "same", 20);

        // 5x slower but only 80ms apart
        assert_eq!(run(&features(200, "same", 100), Some(&baseline)).outcome, Outcome::Failure);

        let baseline = features(200, "same", 200);
        assert_eq!(run(&features(200, "same", 900), Some(&baseline)).outcome, Outcome::Success);
    }

    #[test]
    fn identical_to_baseline_is_failure() {
        let baseline = features(200, "Check your email", 30);
        let verdict = run(&baseline.clone(), Some(&baseline));
        assert_eq!(verdict.outcome, Outcome::Failure);
        // success wording alone never decides
        assert!(verdict.indicators.iter().any(|i| i.starts_with("success:")));
    }

    #[test]
    fn missing_baseline_is_failure() {
        let verdict = run(&features(202, "ok", 30), None);
        assert_eq!(verdict.outcome, Outcome::Failure);
    }

    #[test]
    fn classification_is_deterministic() {
        let baseline = features(200, "a", 30);
        let response = features(202, &"b".repeat(300), 900);
        let first = run(&response, Some(&baseline));
        for _ in 0..10 {
            assert_eq!(run(&response, Some(&baseline)), first);
        }
    }

    #[test]
    fn evidence_is_truncated_and_single_line() {
        let response = RawResponse {
            status: 200,
            headers: Default::default(),
            body: format!("line one\nline two{}", "z".repeat(500)),
            elapsed: Duration::ZERO,
        };
        let excerpt = evidence(Ok(&response));
        assert_eq!(excerpt.chars().count(), EVIDENCE_CHARS);
        assert!(!excerpt.contains('\n'));
    }
}

//! Randomized checks of severity aggregation over generated candidate sets.

use std::collections::BTreeSet;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::json;

use signalsift::detect::aggregate::{fingerprint, Anomaly, SeverityAggregator, SeverityPolicy};
use signalsift::detect::{AnomalyCandidate, DetectorKind};

const KINDS: [DetectorKind; 4] = [
    DetectorKind::Outlier,
    DetectorKind::Burst,
    DetectorKind::Pattern,
    DetectorKind::Semantic,
];

fn candidate(record: &str, category: &str, kind: DetectorKind, raw: f64) -> AnomalyCandidate {
    AnomalyCandidate {
        record_id: record.to_string(),
        related_records: Vec::new(),
        detector_kind: kind,
        category: category.to_string(),
        raw_score: raw,
        evidence: json!({ "score": raw }),
        rationale: None,
    }
}

fn random_candidates(rng: &mut StdRng, n: usize) -> Vec<AnomalyCandidate> {
    (0..n)
        .map(|_| {
            let kind = KINDS[rng.gen_range(0..KINDS.len())];
            let raw = match kind {
                DetectorKind::Burst => rng.gen_range(2.5..12.0),
                _ => rng.gen_range(0.3..1.0),
            };
            let record = format!("r{}", rng.gen_range(0..40));
            let category = ["api/a", "api/b", "db/c"][rng.gen_range(0..3)];
            candidate(&record, category, kind, raw)
        })
        .collect()
}

fn aggregate(candidates: Vec<AnomalyCandidate>) -> Vec<Anomaly> {
    SeverityAggregator::new(&SeverityPolicy::default())
        .aggregate(candidates)
        .unwrap()
}

#[test]
fn test_output_independent_of_candidate_order() {
    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..20 {
        let candidates = random_candidates(&mut rng, 60);
        let expected = serde_json::to_string(&aggregate(candidates.clone())).unwrap();

        let mut shuffled = candidates;
        shuffled.shuffle(&mut rng);
        assert_eq!(serde_json::to_string(&aggregate(shuffled)).unwrap(), expected);
    }
}

#[test]
fn test_fingerprints_unique_and_match_record_category() {
    let mut rng = StdRng::seed_from_u64(12);
    let candidates = random_candidates(&mut rng, 200);
    let keys: BTreeSet<(String, String)> = candidates
        .iter()
        .map(|c| (c.record_id.clone(), c.category.clone()))
        .collect();

    let anomalies = aggregate(candidates);
    assert_eq!(anomalies.len(), keys.len());

    let seen: BTreeSet<&str> = anomalies.iter().map(|a| a.fingerprint.as_str()).collect();
    assert_eq!(seen.len(), anomalies.len());
    for a in &anomalies {
        assert_eq!(a.fingerprint, fingerprint(&a.record_ids[0], &a.category));
        assert!(a.combined_score > 0.0 && a.combined_score <= 1.0);
    }
}

#[test]
fn test_severity_monotonic_in_raw_score() {
    let mut previous = None;
    for step in 0..=100 {
        let raw = step as f64 / 100.0;
        let out = aggregate(vec![candidate("r1", "api/a", DetectorKind::Outlier, raw)]);
        let severity = out[0].severity;
        if let Some(prev) = previous {
            assert!(severity >= prev, "severity dropped at raw score {}", raw);
        }
        previous = Some(severity);
    }
}

#[test]
fn test_corroboration_never_lowers_score() {
    let mut rng = StdRng::seed_from_u64(13);
    for _ in 0..50 {
        let a = rng.gen_range(0.0..1.0);
        let b = rng.gen_range(0.0..1.0);
        let alone = aggregate(vec![candidate("r1", "api/a", DetectorKind::Outlier, a)]);
        let both = aggregate(vec![
            candidate("r1", "api/a", DetectorKind::Outlier, a),
            candidate("r1", "api/a", DetectorKind::Pattern, b),
        ]);
        assert_eq!(both.len(), 1);
        assert!(both[0].combined_score >= alone[0].combined_score);
        assert!(both[0].severity >= alone[0].severity);
        assert!(both[0].rationale.contains("corroborated by"));
    }
}

#[test]
fn test_aggregating_again_is_stable() {
    let mut rng = StdRng::seed_from_u64(14);
    let candidates = random_candidates(&mut rng, 80);
    let first = aggregate(candidates.clone());
    let second = aggregate(candidates);
    assert_eq!(first, second);
}

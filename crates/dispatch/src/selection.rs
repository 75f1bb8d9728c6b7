//! Collaborator selection.
//!
//! Candidates for a capability are ranked by
//! `success_rate * success_weight + (speed_scale_ms / (avg_latency_ms + 1)) * speed_weight`.
//! Collaborators with no history for the capability rank above every scored
//! one so each gets tried at least once. Ties go to the least recently used,
//! then to registration order.

use crate::collaborator::{Capability, CapabilityRegistry, CollaboratorId};
use crate::ledger::{PerformanceLedger, PerformanceRecord};
use crate::reliability::{BreakerPermit, BreakerRegistry};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use tracing::debug;

/// Scoring weights
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionWeights {
    pub success_weight: f64,
    pub speed_weight: f64,
    pub speed_scale_ms: f64,
}

impl Default for SelectionWeights {
    fn default() -> Self {
        Self {
            success_weight: 0.7,
            speed_weight: 0.3,
            speed_scale_ms: 1000.0,
        }
    }
}

impl SelectionWeights {
    /// Score of one record; `None` (no history) scores infinity
    pub fn score(&self, record: Option<&PerformanceRecord>) -> f64 {
        match record.and_then(|r| r.success_rate().map(|rate| (rate, r.avg_latency_ms))) {
            None => f64::INFINITY,
            Some((success_rate, avg_latency_ms)) => {
                let speed = self.speed_scale_ms / (avg_latency_ms + 1.0);
                success_rate * self.success_weight + speed * self.speed_weight
            }
        }
    }
}

/// A ranked candidate
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub collaborator: CollaboratorId,
    pub score: f64,
    pub record: Option<PerformanceRecord>,
    position: usize,
}

impl ScoredCandidate {
    fn rank(&self, other: &Self) -> Ordering {
        // Higher score first
        other
            .score
            .total_cmp(&self.score)
            // Least recently used first; never used sorts oldest
            .then_with(|| self.last_used_seq().cmp(&other.last_used_seq()))
            .then_with(|| self.position.cmp(&other.position))
    }

    fn last_used_seq(&self) -> u64 {
        self.record.as_ref().map(|r| r.last_used_seq).unwrap_or(0)
    }
}

/// Result of walking the ranking against the breakers
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub chosen: Option<CollaboratorId>,
    /// Admission for `chosen`; report the attempt's outcome with it
    pub permit: Option<BreakerPermit>,
    /// Candidates ranked above `chosen` whose breaker refused the attempt
    pub denied: Vec<CollaboratorId>,
}

/// Borrowing view over the registry, ledger and breakers used to pick a collaborator.
#[derive(Debug, Clone, Copy)]
pub struct Selector<'a> {
    registry: &'a CapabilityRegistry,
    ledger: &'a PerformanceLedger,
    breakers: &'a BreakerRegistry,
    weights: SelectionWeights,
}

impl<'a> Selector<'a> {
    pub fn new(
        registry: &'a CapabilityRegistry,
        ledger: &'a PerformanceLedger,
        breakers: &'a BreakerRegistry,
        weights: SelectionWeights,
    ) -> Self {
        Self {
            registry,
            ledger,
            breakers,
            weights,
        }
    }

    pub fn score(&self, collaborator: &CollaboratorId, capability: &Capability) -> f64 {
        self.weights
            .score(self.ledger.record(collaborator, capability).as_ref())
    }

    /// Capable collaborators not in `exclude`, best first. Touches no breaker.
    pub fn ranked(
        &self,
        capability: &Capability,
        exclude: &HashSet<CollaboratorId>,
    ) -> Vec<ScoredCandidate> {
        let mut candidates: Vec<ScoredCandidate> = self
            .registry
            .capable_of(capability)
            .into_iter()
            .filter(|id| !exclude.contains(id))
            .map(|collaborator| {
                let record = self.ledger.record(&collaborator, capability);
                ScoredCandidate {
                    score: self.weights.score(record.as_ref()),
                    position: self.registry.position(&collaborator).unwrap_or(usize::MAX),
                    collaborator,
                    record,
                }
            })
            .collect();
        candidates.sort_by(|a, b| a.rank(b));
        candidates
    }

    /// Best capable collaborator whose breaker admits an attempt.
    pub fn select_best(&self, capability: &Capability) -> Option<CollaboratorId> {
        self.select_excluding(capability, &HashSet::new()).chosen
    }

    /// Walk the ranking, asking each breaker in turn, and stop at the first
    /// that allows. Breakers below the chosen one are never consulted, so no
    /// half-open probe slot is taken without being used.
    pub fn select_excluding(
        &self,
        capability: &Capability,
        exclude: &HashSet<CollaboratorId>,
    ) -> Selection {
        let mut selection = Selection::default();
        for candidate in self.ranked(capability, exclude) {
            if let Some(permit) = self.breakers.acquire(&candidate.collaborator) {
                debug!(
                    capability = %capability,
                    collaborator = %candidate.collaborator,
                    score = candidate.score,
                    probe = permit.is_probe(),
                    "Selected collaborator"
                );
                selection.chosen = Some(candidate.collaborator);
                selection.permit = Some(permit);
                break;
            }
            selection.denied.push(candidate.collaborator);
        }
        selection
    }

    /// Best-scoring capable collaborator, ignoring breakers entirely.
    pub fn recommend(&self, capability: &Capability) -> Option<ScoredCandidate> {
        self.ranked(capability, &HashSet::new()).into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliability::{BreakerConfig, BreakerState};
    use rstest::rstest;
    use std::time::Duration;

    struct Fixture {
        registry: CapabilityRegistry,
        ledger: PerformanceLedger,
        breakers: BreakerRegistry,
    }

    impl Fixture {
        fn new(ids: &[&str]) -> Self {
            let mut registry = CapabilityRegistry::new();
            for id in ids {
                registry.register((*id).into(), vec![Capability::from("x")]);
            }
            Self {
                registry,
                ledger: PerformanceLedger::new(),
                breakers: BreakerRegistry::new(BreakerConfig::default()),
            }
        }

        fn selector(&self) -> Selector<'_> {
            Selector::new(
                &self.registry,
                &self.ledger,
                &self.breakers,
                SelectionWeights::default(),
            )
        }

        fn record(&self, id: &str, success: bool, latency_ms: u64) {
            self.ledger.record_outcome(
                &id.into(),
                &"x".into(),
                success,
                Duration::from_millis(latency_ms),
            );
        }
    }

    #[rstest]
    #[case(1.0, 0.0, 0.7 + 300.0)]
    #[case(0.5, 999.0, 0.35 + 0.3)]
    #[case(0.0, 1999.0, 0.15)]
    fn test_score_formula(#[case] rate: f64, #[case] latency: f64, #[case] expected: f64) {
        let record = PerformanceRecord {
            successes: (rate * 10.0) as u64,
            failures: 10 - (rate * 10.0) as u64,
            avg_latency_ms: latency,
            ..Default::default()
        };
        let score = SelectionWeights::default().score(Some(&record));
        assert!((score - expected).abs() < 1e-9, "score {} != {}", score, expected);
    }

    #[test]
    fn test_unscored_collaborator_is_explored_first() {
        let fx = Fixture::new(&["veteran", "newcomer"]);
        fx.record("veteran", true, 1);
        assert_eq!(fx.selector().select_best(&"x".into()), Some("newcomer".into()));
    }

    #[test]
    fn test_higher_score_wins() {
        let fx = Fixture::new(&["slow", "fast"]);
        fx.record("slow", true, 900);
        fx.record("fast", true, 50);
        assert_eq!(fx.selector().select_best(&"x".into()), Some("fast".into()));
    }

    #[test]
    fn test_tie_prefers_least_recently_used() {
        let fx = Fixture::new(&["a", "b"]);
        fx.record("a", true, 100);
        fx.record("b", true, 100);
        // Equal scores, "a" used longer ago
        assert_eq!(fx.selector().select_best(&"x".into()), Some("a".into()));
        fx.record("a", true, 100);
        assert_eq!(fx.selector().select_best(&"x".into()), Some("b".into()));
    }

    #[test]
    fn test_tie_without_history_uses_registration_order() {
        let fx = Fixture::new(&["first", "second"]);
        assert_eq!(fx.selector().select_best(&"x".into()), Some("first".into()));
    }

    #[test]
    fn test_denied_breaker_is_skipped() {
        let fx = Fixture::new(&["best", "backup"]);
        fx.record("best", true, 1);
        fx.record("backup", false, 1000);
        fx.breakers.force_open(&"best".into(), "maintenance");

        let selection = fx.selector().select_excluding(&"x".into(), &HashSet::new());
        assert_eq!(selection.chosen, Some("backup".into()));
        assert!(selection.permit.is_some_and(|p| !p.is_probe()));
        assert_eq!(selection.denied, vec![CollaboratorId::from("best")]);
    }

    #[test]
    fn test_tie_break_uses_registration_position_not_filtered_index() {
        let fx = Fixture::new(&["a", "b", "c"]);
        let exclude: HashSet<_> = [CollaboratorId::from("a")].into_iter().collect();
        let ranked: Vec<_> = fx
            .selector()
            .ranked(&"x".into(), &exclude)
            .into_iter()
            .map(|c| (c.collaborator, c.position))
            .collect();
        assert_eq!(ranked, vec![("b".into(), 1), ("c".into(), 2)]);
    }

    #[test]
    fn test_no_candidate_when_all_denied_or_excluded() {
        let fx = Fixture::new(&["a", "b"]);
        fx.breakers.force_open(&"a".into(), "test");
        let exclude: HashSet<_> = [CollaboratorId::from("b")].into_iter().collect();

        let selection = fx.selector().select_excluding(&"x".into(), &exclude);
        assert!(selection.chosen.is_none());
        assert!(fx.selector().select_best(&"unknown".into()).is_none());
    }

    #[test]
    fn test_recommend_does_not_touch_breakers() {
        let fx = Fixture::new(&["a"]);
        fx.breakers.force_open(&"a".into(), "test");
        let recommended = fx.selector().recommend(&"x".into()).expect("candidate");
        assert_eq!(recommended.collaborator, CollaboratorId::from("a"));
        assert_eq!(fx.breakers.state(&"a".into()), BreakerState::Open);
        assert_eq!(fx.breakers.all_metrics()[0].rejected_calls, 0);
    }
}

//! Performance ledger: per (collaborator, capability) outcome statistics.

use crate::collaborator::{Capability, CollaboratorId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::trace;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub successes: u64,
    pub failures: u64,
    /// Cumulative mean over every recorded attempt
    pub avg_latency_ms: f64,
    pub last_used: Option<DateTime<Utc>>,
    /// Ledger-wide monotonic stamp of the last use; orders ties without
    /// depending on wall-clock resolution
    #[serde(default)]
    pub last_used_seq: u64,
}

impl PerformanceRecord {
    pub fn attempts(&self) -> u64 {
        self.successes + self.failures
    }

    /// `None` until the first attempt is recorded
    pub fn success_rate(&self) -> Option<f64> {
        match self.attempts() {
            0 => None,
            n => Some(self.successes as f64 / n as f64),
        }
    }

    fn apply(&mut self, success: bool, latency: Duration, seq: u64) {
        let n = self.attempts() as f64;
        let latency_ms = latency.as_secs_f64() * 1000.0;
        self.avg_latency_ms = (self.avg_latency_ms * n + latency_ms) / (n + 1.0);
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.last_used = Some(Utc::now());
        self.last_used_seq = seq;
    }
}

/// Per-collaborator aggregate across capabilities
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaboratorPerformance {
    pub collaborator: CollaboratorId,
    pub total_attempts: u64,
    pub successes: u64,
    pub failures: u64,
    /// Weighted by attempts
    pub success_rate: f64,
    /// Weighted by attempts
    pub avg_latency_ms: f64,
    pub capabilities: Vec<Capability>,
    pub last_used: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub collaborators: usize,
    pub records: usize,
    pub total_attempts: u64,
    pub total_successes: u64,
    pub success_rate: f64,
}

/// Concurrent ledger. Each update holds only its key's shard lock, so
/// different keys never contend and no update is lost.
#[derive(Debug, Default)]
pub struct PerformanceLedger {
    records: DashMap<(CollaboratorId, Capability), PerformanceRecord>,
    sequence: AtomicU64,
}

impl PerformanceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_outcome(
        &self,
        collaborator: &CollaboratorId,
        capability: &Capability,
        success: bool,
        latency: Duration,
    ) {
        let mut record = self
            .records
            .entry((collaborator.clone(), capability.clone()))
            .or_default();
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        record.apply(success, latency, seq);

        trace!(
            collaborator = %collaborator,
            capability = %capability,
            success,
            latency_ms = latency.as_millis() as u64,
            avg_latency_ms = record.avg_latency_ms,
            "Recorded dispatch outcome"
        );
    }

    pub fn record(
        &self,
        collaborator: &CollaboratorId,
        capability: &Capability,
    ) -> Option<PerformanceRecord> {
        self.records
            .get(&(collaborator.clone(), capability.clone()))
            .map(|entry| entry.value().clone())
    }

    /// Every record of one collaborator, sorted by capability
    pub fn records_for(
        &self,
        collaborator: &CollaboratorId,
    ) -> Vec<(Capability, PerformanceRecord)> {
        let mut records: Vec<_> = self
            .records
            .iter()
            .filter(|entry| &entry.key().0 == collaborator)
            .map(|entry| (entry.key().1.clone(), entry.value().clone()))
            .collect();
        records.sort_by(|a, b| a.0.cmp(&b.0));
        records
    }

    pub fn by_collaborator(&self) -> Vec<CollaboratorPerformance> {
        let mut grouped: BTreeMap<CollaboratorId, Vec<(Capability, PerformanceRecord)>> =
            BTreeMap::new();
        for entry in self.records.iter() {
            grouped
                .entry(entry.key().0.clone())
                .or_default()
                .push((entry.key().1.clone(), entry.value().clone()));
        }

        grouped
            .into_iter()
            .map(|(collaborator, mut records)| {
                records.sort_by(|a, b| a.0.cmp(&b.0));
                let successes: u64 = records.iter().map(|(_, r)| r.successes).sum();
                let failures: u64 = records.iter().map(|(_, r)| r.failures).sum();
                let total_attempts = successes + failures;
                let latency_sum: f64 = records
                    .iter()
                    .map(|(_, r)| r.avg_latency_ms * r.attempts() as f64)
                    .sum();
                let (success_rate, avg_latency_ms) = if total_attempts == 0 {
                    (0.0, 0.0)
                } else {
                    (
                        successes as f64 / total_attempts as f64,
                        latency_sum / total_attempts as f64,
                    )
                };

                CollaboratorPerformance {
                    collaborator,
                    total_attempts,
                    successes,
                    failures,
                    success_rate,
                    avg_latency_ms,
                    last_used: records.iter().filter_map(|(_, r)| r.last_used).max(),
                    capabilities: records.into_iter().map(|(c, _)| c).collect(),
                }
            })
            .collect()
    }

    pub fn summary(&self) -> LedgerSummary {
        let per_collaborator = self.by_collaborator();
        let total_attempts: u64 = per_collaborator.iter().map(|c| c.total_attempts).sum();
        let total_successes: u64 = per_collaborator.iter().map(|c| c.successes).sum();

        LedgerSummary {
            collaborators: per_collaborator.len(),
            records: self.records.len(),
            total_attempts,
            total_successes,
            success_rate: if total_attempts == 0 {
                0.0
            } else {
                total_successes as f64 / total_attempts as f64
            },
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ids() -> (CollaboratorId, Capability) {
        (CollaboratorId::from("claude"), Capability::from("coding"))
    }

    #[test]
    fn test_cumulative_mean_latency() {
        let ledger = PerformanceLedger::new();
        let (id, cap) = ids();

        ledger.record_outcome(&id, &cap, true, Duration::from_millis(100));
        ledger.record_outcome(&id, &cap, false, Duration::from_millis(200));
        ledger.record_outcome(&id, &cap, true, Duration::from_millis(300));

        let record = ledger.record(&id, &cap).expect("record exists");
        assert_eq!(record.successes, 2);
        assert_eq!(record.failures, 1);
        assert!((record.avg_latency_ms - 200.0).abs() < 1e-9);
        assert!(record.last_used.is_some());
        assert_eq!(record.last_used_seq, 3);
    }

    #[test]
    fn test_unknown_key_has_no_record() {
        let ledger = PerformanceLedger::new();
        let (id, cap) = ids();
        assert!(ledger.record(&id, &cap).is_none());
        assert_eq!(PerformanceRecord::default().success_rate(), None);
    }

    #[test]
    fn test_by_collaborator_weights_by_attempts() {
        let ledger = PerformanceLedger::new();
        let id = CollaboratorId::from("gemini");
        let vision = Capability::from("vision");
        let analysis = Capability::from("analysis");

        ledger.record_outcome(&id, &vision, true, Duration::from_millis(100));
        for _ in 0..3 {
            ledger.record_outcome(&id, &analysis, false, Duration::from_millis(500));
        }

        let aggregate = ledger.by_collaborator();
        assert_eq!(aggregate.len(), 1);
        let gemini = &aggregate[0];
        assert_eq!(gemini.total_attempts, 4);
        assert!((gemini.success_rate - 0.25).abs() < 1e-9);
        assert!((gemini.avg_latency_ms - 400.0).abs() < 1e-9);
        assert_eq!(gemini.capabilities, vec![analysis, vision]);

        let summary = ledger.summary();
        assert_eq!(summary.collaborators, 1);
        assert_eq!(summary.records, 2);
        assert_eq!(summary.total_successes, 1);
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let ledger = Arc::new(PerformanceLedger::new());
        let (id, cap) = ids();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                let (id, cap) = (id.clone(), cap.clone());
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        ledger.record_outcome(&id, &cap, true, Duration::from_millis(10));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("worker thread");
        }

        let record = ledger.record(&id, &cap).expect("record exists");
        assert_eq!(record.attempts(), 2000);
        assert!((record.avg_latency_ms - 10.0).abs() < 1e-6);
    }
}

//! Process-wide breaker registry keyed by collaborator.
//!
//! Breakers are created lazily on first reference and live until removed.
//! Read-only queries (`get`, `all_metrics`, `health_summary`, ...) never
//! create breakers or move them between states.

use super::circuit_breaker::{
    BreakerConfig, BreakerMetrics, BreakerPermit, BreakerState, BreakerTransition, CircuitBreaker,
};
use crate::collaborator::CollaboratorId;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Aggregate view over every breaker
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub open: usize,
    pub half_open: usize,
    pub closed: usize,
    /// How long each open breaker has been open
    pub open_for: Vec<(CollaboratorId, Duration)>,
}

#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: DashMap<CollaboratorId, Arc<CircuitBreaker>>,
    defaults: BreakerConfig,
    overrides: HashMap<CollaboratorId, BreakerConfig>,
}

impl BreakerRegistry {
    pub fn new(defaults: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            defaults,
            overrides: HashMap::new(),
        }
    }

    pub fn with_overrides(
        defaults: BreakerConfig,
        overrides: HashMap<CollaboratorId, BreakerConfig>,
    ) -> Self {
        Self {
            breakers: DashMap::new(),
            defaults,
            overrides,
        }
    }

    /// Configuration a new breaker for `id` would get
    pub fn config_for(&self, id: &CollaboratorId) -> &BreakerConfig {
        self.overrides.get(id).unwrap_or(&self.defaults)
    }

    pub fn get_or_create(&self, id: &CollaboratorId) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(id) {
            return Arc::clone(existing.value());
        }
        let breaker = self
            .breakers
            .entry(id.clone())
            .or_insert_with(|| {
                debug!(collaborator = %id, "Creating circuit breaker");
                Arc::new(CircuitBreaker::new(id.clone(), self.config_for(id).clone()))
            });
        Arc::clone(breaker.value())
    }

    /// Existing breaker, without creating one
    pub fn get(&self, id: &CollaboratorId) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Drop a breaker. The next reference recreates it `Closed`.
    pub fn remove(&self, id: &CollaboratorId) -> bool {
        let removed = self.breakers.remove(id).is_some();
        if removed {
            debug!(collaborator = %id, "Removed circuit breaker");
        }
        removed
    }

    pub fn acquire(&self, id: &CollaboratorId) -> Option<BreakerPermit> {
        self.get_or_create(id).acquire()
    }

    pub fn allow(&self, id: &CollaboratorId) -> bool {
        self.get_or_create(id).allow()
    }

    pub fn record_success_for(&self, id: &CollaboratorId, permit: BreakerPermit) {
        self.get_or_create(id).record_success_for(permit);
    }

    pub fn record_failure_for(&self, id: &CollaboratorId, permit: BreakerPermit, reason: &str) {
        self.get_or_create(id).record_failure_for(permit, reason);
    }

    pub fn record_success(&self, id: &CollaboratorId) {
        self.get_or_create(id).record_success();
    }

    pub fn record_failure(&self, id: &CollaboratorId) {
        self.get_or_create(id).record_failure();
    }

    pub fn force_open(&self, id: &CollaboratorId, reason: &str) {
        self.get_or_create(id).force_open(reason);
    }

    pub fn force_close(&self, id: &CollaboratorId, reason: &str) {
        self.get_or_create(id).force_close(reason);
    }

    pub fn reset(&self, id: &CollaboratorId, reason: &str) {
        self.get_or_create(id).reset(reason);
    }

    /// Current state; collaborators without a breaker are `Closed`
    pub fn state(&self, id: &CollaboratorId) -> BreakerState {
        self.get(id)
            .map(|breaker| breaker.state())
            .unwrap_or_default()
    }

    pub fn history(&self, id: &CollaboratorId) -> Vec<BreakerTransition> {
        self.get(id)
            .map(|breaker| breaker.history())
            .unwrap_or_default()
    }

    /// Snapshot of every breaker, sorted by collaborator
    pub fn all_metrics(&self) -> Vec<BreakerMetrics> {
        // Clone the Arcs first so no shard lock is held while locking breakers
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut metrics: Vec<BreakerMetrics> = breakers.iter().map(|b| b.metrics()).collect();
        metrics.sort_by(|a, b| a.collaborator.cmp(&b.collaborator));
        metrics
    }

    pub fn open_breakers(&self) -> Vec<BreakerMetrics> {
        self.all_metrics()
            .into_iter()
            .filter(|m| m.state == BreakerState::Open)
            .collect()
    }

    pub fn unhealthy(&self) -> Vec<BreakerMetrics> {
        self.all_metrics()
            .into_iter()
            .filter(|m| !m.is_healthy)
            .collect()
    }

    pub fn health_summary(&self) -> HealthSummary {
        let mut summary = HealthSummary::default();
        for metrics in self.all_metrics() {
            summary.total += 1;
            if metrics.is_healthy {
                summary.healthy += 1;
            } else {
                summary.unhealthy += 1;
            }
            match metrics.state {
                BreakerState::Closed => summary.closed += 1,
                BreakerState::HalfOpen => summary.half_open += 1,
                BreakerState::Open => {
                    summary.open += 1;
                    summary
                        .open_for
                        .push((metrics.collaborator.clone(), metrics.time_in_state));
                }
            }
        }
        summary
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

//! Dispatch orchestrator: bounded retry-with-fallback across collaborators.
//!
//! Each `execute` call walks the selection ranking one collaborator at a
//! time. Attempts within a call are strictly sequential and every attempt,
//! including a timed-out one, is recorded on the breaker and the ledger
//! before the next selection. Outcomes go back to the breaker with the
//! permit that admitted them, so an attempt that outlives a state change
//! only updates totals. Answers served from a cache touch neither store.

use crate::collaborator::{Capability, CapabilityRegistry, Collaborator, CollaboratorId};
use crate::config::{DispatchConfig, OrchestratorSettings};
use crate::error::{AttemptRecord, ConfigError, DispatchError};
use crate::ledger::PerformanceLedger;
use crate::reliability::BreakerRegistry;
use crate::selection::{Selection, SelectionWeights, Selector};
use common::OperationTimer;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Per-call overrides for [`DispatchOrchestrator::execute_with`]
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub max_attempts: Option<usize>,
    pub attempt_timeout: Option<Duration>,
    /// Overall deadline; each attempt gets at most the time remaining
    pub deadline: Option<Instant>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline `budget` from now
    pub fn within(self, budget: Duration) -> Self {
        self.deadline(Instant::now() + budget)
    }
}

/// Successful result of `execute`
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub collaborator: CollaboratorId,
    pub result: Value,
    /// Latency of the successful attempt
    pub latency: Duration,
    /// Answered from a cache; breaker and ledger were left untouched
    pub cached: bool,
    /// Failed attempts that preceded the success
    pub failed_attempts: Vec<AttemptRecord>,
}

impl DispatchOutcome {
    pub fn attempts(&self) -> usize {
        self.failed_attempts.len() + 1
    }
}

pub struct DispatchOrchestrator {
    registry: CapabilityRegistry,
    declared: CapabilityRegistry,
    collaborators: HashMap<CollaboratorId, Arc<dyn Collaborator>>,
    breakers: Arc<BreakerRegistry>,
    ledger: Arc<PerformanceLedger>,
    weights: SelectionWeights,
    settings: OrchestratorSettings,
}

impl std::fmt::Debug for DispatchOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchOrchestrator")
            .field("registry", &self.registry)
            .field("weights", &self.weights)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl DispatchOrchestrator {
    pub fn new(
        breakers: Arc<BreakerRegistry>,
        ledger: Arc<PerformanceLedger>,
        weights: SelectionWeights,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            registry: CapabilityRegistry::new(),
            declared: CapabilityRegistry::new(),
            collaborators: HashMap::new(),
            breakers,
            ledger,
            weights,
            settings,
        }
    }

    /// Orchestrator with fresh breaker and ledger stores built from `config`.
    /// Collaborators declared in `[collaborators]` still need an
    /// implementation via [`register_declared`](Self::register_declared).
    pub fn from_config(config: &DispatchConfig) -> Self {
        let breakers = BreakerRegistry::with_overrides(
            config.breaker.to_breaker_config(),
            config.breaker.override_configs(),
        );
        let mut orchestrator = Self::new(
            Arc::new(breakers),
            Arc::new(PerformanceLedger::new()),
            config.selection,
            config.orchestrator.clone(),
        );
        orchestrator.declared = CapabilityRegistry::from_config(config);
        orchestrator
    }

    /// Register an implementation with the capabilities it serves
    pub fn register<I>(&mut self, collaborator: Arc<dyn Collaborator>, capabilities: I)
    where
        I: IntoIterator<Item = Capability>,
    {
        let id = collaborator.id().clone();
        self.registry.register(id.clone(), capabilities);
        info!(
            collaborator = %id,
            capabilities = ?self.registry.capabilities_of(&id),
            "Registered collaborator"
        );
        self.collaborators.insert(id, collaborator);
    }

    /// Register an implementation for a collaborator declared in configuration
    pub fn register_declared(
        &mut self,
        collaborator: Arc<dyn Collaborator>,
    ) -> Result<(), ConfigError> {
        let capabilities: Vec<Capability> = self
            .declared
            .capabilities_of(collaborator.id())
            .ok_or_else(|| ConfigError::UnknownCollaborator(collaborator.id().clone()))?
            .iter()
            .cloned()
            .collect();
        self.register(collaborator, capabilities);
        Ok(())
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn ledger(&self) -> &Arc<PerformanceLedger> {
        &self.ledger
    }

    pub fn selector(&self) -> Selector<'_> {
        Selector::new(&self.registry, &self.ledger, &self.breakers, self.weights)
    }

    /// Run `capability` with the configured attempt budget and timeout
    pub async fn execute(
        &self,
        capability: &Capability,
        payload: Value,
    ) -> Result<DispatchOutcome, DispatchError> {
        self.execute_with(capability, payload, ExecuteOptions::default())
            .await
    }

    pub async fn execute_with(
        &self,
        capability: &Capability,
        payload: Value,
        options: ExecuteOptions,
    ) -> Result<DispatchOutcome, DispatchError> {
        let mut timer = OperationTimer::new("dispatch_execute");
        timer.add_field("capability", capability.as_str());

        let result = self.run_attempts(capability, payload, &options).await;
        match &result {
            Ok(outcome) => {
                timer.add_field("collaborator", outcome.collaborator.as_str());
                timer.add_field("attempts", outcome.attempts());
            }
            Err(e) => timer.add_field("attempts", e.attempts().len()),
        }
        timer.finish_with_result(&result);
        result
    }

    async fn run_attempts(
        &self,
        capability: &Capability,
        payload: Value,
        options: &ExecuteOptions,
    ) -> Result<DispatchOutcome, DispatchError> {
        let max_attempts = options
            .max_attempts
            .unwrap_or(self.settings.max_attempts)
            .max(1);
        let attempt_timeout = options
            .attempt_timeout
            .unwrap_or_else(|| self.settings.attempt_timeout());

        let call_started = Instant::now();
        let selector = self.selector();
        let mut tried: HashSet<CollaboratorId> = HashSet::new();
        let mut attempts: Vec<AttemptRecord> = Vec::new();

        while attempts.len() < max_attempts {
            let timeout = match options.deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        warn!(
                            capability = %capability,
                            attempts = attempts.len(),
                            "Dispatch deadline elapsed"
                        );
                        return Err(DispatchError::DeadlineExceeded {
                            capability: capability.clone(),
                            after: call_started.elapsed(),
                            attempts,
                        });
                    }
                    remaining.min(attempt_timeout)
                }
                None => attempt_timeout,
            };

            let Selection {
                chosen,
                permit,
                denied,
            } = selector.select_excluding(capability, &tried);
            let (Some(id), Some(permit)) = (chosen, permit) else {
                attempts.extend(denied.into_iter().map(AttemptRecord::unavailable));
                warn!(
                    capability = %capability,
                    attempts = attempts.len(),
                    "No eligible collaborator"
                );
                return Err(DispatchError::NoEligibleCollaborator {
                    capability: capability.clone(),
                    attempts,
                });
            };

            let Some(collaborator) = self.collaborators.get(&id) else {
                // Registry and implementations are filled together; reaching this
                // means the breaker admitted an attempt that will never run
                warn!(collaborator = %id, "Selected collaborator has no implementation");
                self.breakers
                    .record_failure_for(&id, permit, "no implementation registered");
                tried.insert(id);
                continue;
            };

            debug!(
                capability = %capability,
                collaborator = %id,
                attempt = attempts.len() + 1,
                max_attempts,
                probe = permit.is_probe(),
                "Dispatching attempt"
            );

            // A recovery probe must reach the collaborator itself
            let invocation =
                collaborator.invoke_tracked(capability, payload.clone(), permit.is_probe());
            let started = Instant::now();
            let outcome = tokio::time::timeout(timeout, invocation)
                .await
                .unwrap_or_else(|_| Err(DispatchError::Timeout { after: timeout }));
            let latency = started.elapsed();

            match outcome {
                Ok(invocation) => {
                    if !invocation.cached {
                        self.breakers.record_success_for(&id, permit);
                        self.ledger.record_outcome(&id, capability, true, latency);
                    }
                    info!(
                        capability = %capability,
                        collaborator = %id,
                        latency_ms = latency.as_millis() as u64,
                        attempt = attempts.len() + 1,
                        cached = invocation.cached,
                        "Dispatch succeeded"
                    );
                    return Ok(DispatchOutcome {
                        collaborator: id,
                        result: invocation.value,
                        latency,
                        cached: invocation.cached,
                        failed_attempts: attempts,
                    });
                }
                Err(error) => {
                    self.breakers
                        .record_failure_for(&id, permit, &error.to_string());
                    self.ledger.record_outcome(&id, capability, false, latency);
                    warn!(
                        capability = %capability,
                        collaborator = %id,
                        latency_ms = latency.as_millis() as u64,
                        error = %error,
                        "Dispatch attempt failed"
                    );
                    attempts.push(AttemptRecord::from_error(id.clone(), &error, latency));
                    tried.insert(id);
                }
            }
        }

        let last_error = attempts
            .last()
            .map(|last| last.reason.clone())
            .unwrap_or_default();
        Err(DispatchError::AllAttemptsExhausted {
            capability: capability.clone(),
            last_error,
            attempts,
        })
    }
}

//! Circuit Breaker Implementation
//!
//! One breaker per collaborator. The breaker never fails; it only answers
//! whether an attempt may proceed and records what happened.
//!
//! ```text
//! Closed --failures >= threshold--> Open --open duration elapsed--> HalfOpen
//! HalfOpen --successes >= threshold--> Closed
//! HalfOpen --any failure--> Open
//! ```
//!
//! Admission hands out a [`BreakerPermit`]. Outcomes reported with a permit
//! from an earlier state, or from a probe whose lease was taken over, only
//! update the totals.

use crate::collaborator::CollaboratorId;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Requests flow through normally
    #[default]
    Closed,

    /// Requests are blocked until the open duration elapses
    Open,

    /// Serialized probes test whether the collaborator recovered
    HalfOpen,
}

impl BreakerState {
    fn as_u8(self) -> u8 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::Open => 1,
            BreakerState::HalfOpen => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => BreakerState::Open,
            2 => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for one circuit breaker
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    /// Consecutive failures in `Closed` before the circuit opens
    pub failure_threshold: u32,

    /// Consecutive successes in `HalfOpen` before the circuit closes
    pub success_threshold: u32,

    /// Time spent `Open` before a probe is admitted
    pub open_duration: Duration,

    /// How long an unreported probe holds the half-open slot.
    /// `None` means the open duration.
    pub probe_timeout: Option<Duration>,

    /// Minimum calls recorded while `Closed` before the error rate can trip
    /// the circuit. `None` disables the rate check.
    pub volume_threshold: Option<u32>,

    /// Failure percentage (0-100) that trips the circuit once the volume is reached
    pub error_threshold_percentage: f64,

    /// Transitions kept in the audit trail
    pub history_limit: usize,

    /// Failure percentage at or above which a closed breaker counts as unhealthy
    pub unhealthy_failure_rate: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration: Duration::from_secs(60),
            probe_timeout: None,
            volume_threshold: None,
            error_threshold_percentage: 50.0,
            history_limit: 100,
            unhealthy_failure_rate: 10.0,
        }
    }
}

impl BreakerConfig {
    fn effective_probe_timeout(&self) -> Duration {
        self.probe_timeout.unwrap_or(self.open_duration)
    }
}

/// One entry of the transition audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerTransition {
    pub from: BreakerState,
    pub to: BreakerState,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// Read-only snapshot of a breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerMetrics {
    pub collaborator: CollaboratorId,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    /// Attempts denied by `allow()`
    pub rejected_calls: u64,
    /// Percentage 0-100
    pub failure_rate: f64,
    /// Percentage 0-100
    pub success_rate: f64,
    pub time_in_state: Duration,
    pub last_transition: DateTime<Utc>,
    pub last_reason: Option<String>,
    pub is_healthy: bool,
}

/// Admission granted by [`CircuitBreaker::acquire`].
///
/// Hand it back with the outcome so the breaker can tell the current probe
/// from an attempt admitted before the last transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerPermit {
    generation: u64,
    probe: Option<u64>,
}

impl BreakerPermit {
    /// Whether this attempt is a half-open recovery probe
    pub fn is_probe(&self) -> bool {
        self.probe.is_some()
    }
}

#[derive(Debug, Clone, Copy)]
struct ProbeLease {
    ticket: u64,
    started: Instant,
}

#[derive(Debug)]
struct BreakerCore {
    state: BreakerState,
    // Bumped on every transition
    generation: u64,
    consecutive_failures: u32,
    consecutive_successes: u32,
    // Calls recorded since the breaker last entered Closed
    closed_calls: u32,
    closed_failures: u32,
    total_successes: u64,
    total_failures: u64,
    rejected_calls: u64,
    last_transition: Instant,
    last_transition_at: DateTime<Utc>,
    probe: Option<ProbeLease>,
    next_ticket: u64,
}

impl BreakerCore {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            generation: 0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            closed_calls: 0,
            closed_failures: 0,
            total_successes: 0,
            total_failures: 0,
            rejected_calls: 0,
            last_transition: Instant::now(),
            last_transition_at: Utc::now(),
            probe: None,
            next_ticket: 0,
        }
    }

    fn reset_counters(&mut self) {
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.closed_calls = 0;
        self.closed_failures = 0;
        self.probe = None;
    }

    /// Whether an outcome reported with `permit` may move the state machine.
    ///
    /// Without a permit only `Closed` outcomes count: in `HalfOpen` nothing
    /// proves the caller is the probe.
    fn owns(&self, permit: Option<BreakerPermit>) -> bool {
        match (self.state, permit) {
            (BreakerState::Closed, None) => true,
            (BreakerState::Closed, Some(permit)) => permit.generation == self.generation,
            (BreakerState::HalfOpen, Some(permit)) => {
                permit.probe.is_some() && permit.probe == self.probe.map(|lease| lease.ticket)
            }
            _ => false,
        }
    }
}

/// Lock-free mirror of the counters, read by `metrics()`
#[derive(Debug, Default)]
struct Gauges {
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
    total_successes: AtomicU64,
    total_failures: AtomicU64,
    rejected_calls: AtomicU64,
    // Offset of the last transition from breaker creation
    transition_offset_ms: AtomicU64,
    transition_at_ms: AtomicI64,
}

/// Per-collaborator circuit breaker.
///
/// Every mutation happens under one lock, so `acquire` and the `record_*`
/// calls are atomic units. Each mutation then publishes its counters to
/// atomics: `state()` and `metrics()` never take that lock.
#[derive(Debug)]
pub struct CircuitBreaker {
    collaborator: CollaboratorId,
    config: BreakerConfig,
    created: Instant,
    core: Mutex<BreakerCore>,
    state: AtomicU8,
    gauges: Gauges,
    history: RwLock<VecDeque<BreakerTransition>>,
}

impl CircuitBreaker {
    pub fn new(collaborator: CollaboratorId, config: BreakerConfig) -> Self {
        let core = BreakerCore::new();
        let gauges = Gauges::default();
        gauges
            .transition_at_ms
            .store(core.last_transition_at.timestamp_millis(), Ordering::Relaxed);

        Self {
            collaborator,
            config,
            created: core.last_transition,
            core: Mutex::new(core),
            state: AtomicU8::new(BreakerState::Closed.as_u8()),
            gauges,
            history: RwLock::new(VecDeque::new()),
        }
    }

    pub fn with_defaults(collaborator: CollaboratorId) -> Self {
        Self::new(collaborator, BreakerConfig::default())
    }

    pub fn collaborator(&self) -> &CollaboratorId {
        &self.collaborator
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Admit a new attempt, or `None` when the breaker denies it.
    ///
    /// An `Open` breaker whose open duration has elapsed moves to `HalfOpen`
    /// here and admits the caller as its probe. A `HalfOpen` breaker admits
    /// one probe at a time; an unreported probe loses its lease after
    /// `probe_timeout`.
    pub fn acquire(&self) -> Option<BreakerPermit> {
        let mut core = self.core.lock();
        let now = Instant::now();

        let state = core.state;
        let permit = match state {
            BreakerState::Closed => Some(BreakerPermit {
                generation: core.generation,
                probe: None,
            }),
            BreakerState::Open => {
                if now.duration_since(core.last_transition) >= self.config.open_duration {
                    self.transition(
                        &mut core,
                        BreakerState::HalfOpen,
                        "open duration elapsed".into(),
                    );
                    Some(Self::start_probe(&mut core, now))
                } else {
                    None
                }
            }
            BreakerState::HalfOpen => {
                let lease_free = match core.probe {
                    None => true,
                    Some(lease) => {
                        now.duration_since(lease.started) >= self.config.effective_probe_timeout()
                    }
                };
                if lease_free {
                    if core.probe.is_some() {
                        debug!(
                            collaborator = %self.collaborator,
                            "Probe lease expired, admitting new probe"
                        );
                    }
                    Some(Self::start_probe(&mut core, now))
                } else {
                    None
                }
            }
        };

        if permit.is_none() {
            core.rejected_calls += 1;
            debug!(
                collaborator = %self.collaborator,
                state = %core.state,
                "Circuit breaker denied attempt"
            );
        }
        self.publish(&core);
        permit
    }

    /// Whether a new attempt may proceed. Same admission as [`acquire`],
    /// for callers that report outcomes without a permit.
    ///
    /// [`acquire`]: CircuitBreaker::acquire
    pub fn allow(&self) -> bool {
        self.acquire().is_some()
    }

    fn start_probe(core: &mut BreakerCore, now: Instant) -> BreakerPermit {
        core.next_ticket += 1;
        let ticket = core.next_ticket;
        core.probe = Some(ProbeLease {
            ticket,
            started: now,
        });
        BreakerPermit {
            generation: core.generation,
            probe: Some(ticket),
        }
    }

    /// Record a success without a permit. Only counted toward the state
    /// machine while `Closed`.
    pub fn record_success(&self) {
        self.record(None, true, None);
    }

    /// Record a failure without a permit. Only counted toward the state
    /// machine while `Closed`.
    pub fn record_failure(&self) {
        self.record(None, false, None);
    }

    /// Record the success of the attempt admitted with `permit`
    pub fn record_success_for(&self, permit: BreakerPermit) {
        self.record(Some(permit), true, None);
    }

    /// Record the failure of the attempt admitted with `permit`. `reason`
    /// ends up in the audit trail when the failure trips the breaker.
    pub fn record_failure_for(&self, permit: BreakerPermit, reason: &str) {
        self.record(Some(permit), false, Some(reason));
    }

    fn record(&self, permit: Option<BreakerPermit>, success: bool, reason: Option<&str>) {
        let mut core = self.core.lock();
        if success {
            core.total_successes += 1;
        } else {
            core.total_failures += 1;
        }

        if !core.owns(permit) {
            debug!(
                collaborator = %self.collaborator,
                state = %core.state,
                success,
                "Outcome is not from the current admission; counted in totals only"
            );
            self.publish(&core);
            return;
        }

        let state = core.state;
        match (state, success) {
            (BreakerState::Closed, true) => {
                core.consecutive_failures = 0;
                core.closed_calls = core.closed_calls.saturating_add(1);
            }
            (BreakerState::Closed, false) => {
                core.consecutive_failures += 1;
                core.closed_calls = core.closed_calls.saturating_add(1);
                core.closed_failures = core.closed_failures.saturating_add(1);

                if let Some(trip) = self.trip_reason(&core) {
                    let trip = match reason {
                        Some(error) => format!("{}; last error: {}", trip, error),
                        None => trip,
                    };
                    self.transition(&mut core, BreakerState::Open, trip);
                }
            }
            (BreakerState::HalfOpen, true) => {
                core.probe = None;
                core.consecutive_successes += 1;
                debug!(
                    collaborator = %self.collaborator,
                    successes = core.consecutive_successes,
                    threshold = self.config.success_threshold,
                    "Half-open probe succeeded"
                );
                if core.consecutive_successes >= self.config.success_threshold {
                    let reason = format!(
                        "{} consecutive successful probes",
                        core.consecutive_successes
                    );
                    self.transition(&mut core, BreakerState::Closed, reason);
                }
            }
            (BreakerState::HalfOpen, false) => {
                let reason = match reason {
                    Some(error) => format!("probe failed: {}", error),
                    None => "probe failed".to_string(),
                };
                self.transition(&mut core, BreakerState::Open, reason);
            }
            // `owns` never accepts an outcome while Open
            (BreakerState::Open, _) => {}
        }
        self.publish(&core);
    }

    fn trip_reason(&self, core: &BreakerCore) -> Option<String> {
        if core.consecutive_failures >= self.config.failure_threshold {
            return Some(format!(
                "{} consecutive failures (threshold {})",
                core.consecutive_failures, self.config.failure_threshold
            ));
        }

        let volume = self.config.volume_threshold?;
        if core.closed_calls >= volume {
            let rate = core.closed_failures as f64 * 100.0 / core.closed_calls as f64;
            if rate >= self.config.error_threshold_percentage {
                return Some(format!(
                    "error rate {:.1}% over {} calls (threshold {:.1}%)",
                    rate, core.closed_calls, self.config.error_threshold_percentage
                ));
            }
        }
        None
    }

    /// Administrative override: open the circuit now
    pub fn force_open(&self, reason: &str) {
        let mut core = self.core.lock();
        info!(collaborator = %self.collaborator, reason, "Forcing circuit breaker open");
        self.transition(&mut core, BreakerState::Open, format!("forced: {}", reason));
        self.publish(&core);
    }

    /// Administrative override: close the circuit now
    pub fn force_close(&self, reason: &str) {
        let mut core = self.core.lock();
        info!(collaborator = %self.collaborator, reason, "Forcing circuit breaker closed");
        self.transition(&mut core, BreakerState::Closed, format!("forced: {}", reason));
        self.publish(&core);
    }

    /// Administrative override: close the circuit and clear all statistics.
    /// The audit trail is kept.
    pub fn reset(&self, reason: &str) {
        let mut core = self.core.lock();
        info!(collaborator = %self.collaborator, reason, "Resetting circuit breaker");
        self.transition(&mut core, BreakerState::Closed, format!("reset: {}", reason));
        core.total_successes = 0;
        core.total_failures = 0;
        core.rejected_calls = 0;
        self.publish(&core);
    }

    /// Current state without side effects
    pub fn state(&self) -> BreakerState {
        BreakerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Snapshot built from the published counters. Each field is current;
    /// fields may straddle a concurrent update.
    pub fn metrics(&self) -> BreakerMetrics {
        let gauges = &self.gauges;
        let state = self.state();
        let total_successes = gauges.total_successes.load(Ordering::Acquire);
        let total_failures = gauges.total_failures.load(Ordering::Acquire);
        let total_calls = total_successes + total_failures;
        let (failure_rate, success_rate) = if total_calls == 0 {
            (0.0, 0.0)
        } else {
            (
                total_failures as f64 * 100.0 / total_calls as f64,
                total_successes as f64 * 100.0 / total_calls as f64,
            )
        };

        let offset = Duration::from_millis(gauges.transition_offset_ms.load(Ordering::Acquire));
        let last_transition = Utc
            .timestamp_millis_opt(gauges.transition_at_ms.load(Ordering::Acquire))
            .single()
            .unwrap_or_else(Utc::now);

        BreakerMetrics {
            collaborator: self.collaborator.clone(),
            state,
            consecutive_failures: gauges.consecutive_failures.load(Ordering::Acquire),
            consecutive_successes: gauges.consecutive_successes.load(Ordering::Acquire),
            total_calls,
            total_successes,
            total_failures,
            rejected_calls: gauges.rejected_calls.load(Ordering::Acquire),
            failure_rate,
            success_rate,
            time_in_state: self.created.elapsed().saturating_sub(offset),
            last_transition,
            last_reason: self.history.read().back().map(|t| t.reason.clone()),
            is_healthy: state == BreakerState::Closed
                && failure_rate < self.config.unhealthy_failure_rate,
        }
    }

    /// Transition audit trail, oldest first
    pub fn history(&self) -> Vec<BreakerTransition> {
        self.history.read().iter().cloned().collect()
    }

    fn publish(&self, core: &BreakerCore) {
        let gauges = &self.gauges;
        gauges
            .consecutive_failures
            .store(core.consecutive_failures, Ordering::Release);
        gauges
            .consecutive_successes
            .store(core.consecutive_successes, Ordering::Release);
        gauges
            .total_successes
            .store(core.total_successes, Ordering::Release);
        gauges
            .total_failures
            .store(core.total_failures, Ordering::Release);
        gauges
            .rejected_calls
            .store(core.rejected_calls, Ordering::Release);
    }

    fn transition(&self, core: &mut BreakerCore, to: BreakerState, reason: String) {
        let from = core.state;
        match to {
            BreakerState::Open => warn!(
                collaborator = %self.collaborator,
                from = %from,
                reason = %reason,
                "Circuit breaker opening - blocking attempts"
            ),
            BreakerState::HalfOpen => info!(
                collaborator = %self.collaborator,
                "Circuit breaker transitioning to half-open - probing recovery"
            ),
            BreakerState::Closed => info!(
                collaborator = %self.collaborator,
                from = %from,
                reason = %reason,
                "Circuit breaker closing"
            ),
        }

        core.state = to;
        core.generation += 1;
        core.last_transition = Instant::now();
        core.last_transition_at = Utc::now();
        core.reset_counters();
        self.state.store(to.as_u8(), Ordering::Release);

        let offset = core.last_transition.duration_since(self.created);
        self.gauges
            .transition_offset_ms
            .store(offset.as_millis() as u64, Ordering::Release);
        self.gauges
            .transition_at_ms
            .store(core.last_transition_at.timestamp_millis(), Ordering::Release);

        let mut history = self.history.write();
        history.push_back(BreakerTransition {
            from,
            to,
            at: core.last_transition_at,
            reason,
        });
        while history.len() > self.config.history_limit {
            history.pop_front();
        }
    }
}

//! Error taxonomy for dispatch, channel and configuration failures.

use crate::collaborator::{Capability, CollaboratorId};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by collaborators, the orchestrator and correlated channels
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Collaborator {collaborator} is unavailable (circuit open)")]
    CollaboratorUnavailable { collaborator: CollaboratorId },

    #[error(
        "No eligible collaborator for capability '{capability}' ({} attempts recorded)",
        attempts.len()
    )]
    NoEligibleCollaborator {
        capability: Capability,
        attempts: Vec<AttemptRecord>,
    },

    #[error("Attempt on {collaborator} failed: {reason}")]
    AttemptFailed {
        collaborator: CollaboratorId,
        reason: String,
    },

    #[error("Timed out after {}ms", after.as_millis())]
    Timeout { after: Duration },

    /// The call's overall deadline ran out with attempt budget left
    #[error(
        "Deadline for capability '{capability}' elapsed after {}ms ({} attempts recorded)",
        after.as_millis(),
        attempts.len()
    )]
    DeadlineExceeded {
        capability: Capability,
        after: Duration,
        attempts: Vec<AttemptRecord>,
    },

    #[error("Peer {peer} disconnected")]
    PeerDisconnected { peer: CollaboratorId },

    #[error(
        "All {} attempts for capability '{capability}' exhausted; last error: {last_error}",
        attempts.len()
    )]
    AllAttemptsExhausted {
        capability: Capability,
        attempts: Vec<AttemptRecord>,
        last_error: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport error: {reason}")]
    Transport { reason: String },
}

/// Copyable discriminant of [`DispatchError`], used in attempt records and metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CollaboratorUnavailable,
    NoEligibleCollaborator,
    AttemptFailed,
    Timeout,
    PeerDisconnected,
    AllAttemptsExhausted,
    Serialization,
    Transport,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::CollaboratorUnavailable => "collaborator_unavailable",
            ErrorKind::NoEligibleCollaborator => "no_eligible_collaborator",
            ErrorKind::AttemptFailed => "attempt_failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::PeerDisconnected => "peer_disconnected",
            ErrorKind::AllAttemptsExhausted => "all_attempts_exhausted",
            ErrorKind::Serialization => "serialization",
            ErrorKind::Transport => "transport",
        };
        f.write_str(name)
    }
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::CollaboratorUnavailable { .. } => ErrorKind::CollaboratorUnavailable,
            DispatchError::NoEligibleCollaborator { .. } => ErrorKind::NoEligibleCollaborator,
            DispatchError::AttemptFailed { .. } => ErrorKind::AttemptFailed,
            DispatchError::Timeout { .. } | DispatchError::DeadlineExceeded { .. } => {
                ErrorKind::Timeout
            }
            DispatchError::PeerDisconnected { .. } => ErrorKind::PeerDisconnected,
            DispatchError::AllAttemptsExhausted { .. } => ErrorKind::AllAttemptsExhausted,
            DispatchError::Serialization(_) => ErrorKind::Serialization,
            DispatchError::Transport { .. } => ErrorKind::Transport,
        }
    }

    pub fn attempt_failed(collaborator: &CollaboratorId, reason: impl Into<String>) -> Self {
        DispatchError::AttemptFailed {
            collaborator: collaborator.clone(),
            reason: reason.into(),
        }
    }

    /// Attempts carried by the caller-facing outcomes, empty otherwise
    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            DispatchError::NoEligibleCollaborator { attempts, .. }
            | DispatchError::DeadlineExceeded { attempts, .. }
            | DispatchError::AllAttemptsExhausted { attempts, .. } => attempts,
            _ => &[],
        }
    }
}

/// One failed or skipped dispatch try, reported back to the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub collaborator: CollaboratorId,
    pub kind: ErrorKind,
    pub reason: String,
    pub latency: Duration,
}

impl AttemptRecord {
    pub fn from_error(
        collaborator: CollaboratorId,
        error: &DispatchError,
        latency: Duration,
    ) -> Self {
        Self {
            collaborator,
            kind: error.kind(),
            reason: error.to_string(),
            latency,
        }
    }

    /// Skipped try for a collaborator whose breaker denied admission
    pub fn unavailable(collaborator: CollaboratorId) -> Self {
        let error = DispatchError::CollaboratorUnavailable {
            collaborator: collaborator.clone(),
        };
        Self::from_error(collaborator, &error, Duration::ZERO)
    }
}

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error("Collaborator {0} is not declared in [collaborators]")]
    UnknownCollaborator(CollaboratorId),
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_variant() {
        let id = CollaboratorId::from("gemini");
        assert_eq!(
            DispatchError::attempt_failed(&id, "500").kind(),
            ErrorKind::AttemptFailed
        );
        assert_eq!(
            DispatchError::Timeout {
                after: Duration::from_millis(10)
            }
            .kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            DispatchError::PeerDisconnected { peer: id }.kind(),
            ErrorKind::PeerDisconnected
        );
    }

    #[test]
    fn test_attempt_record_keeps_reason() {
        let id = CollaboratorId::from("claude");
        let err = DispatchError::attempt_failed(&id, "rate limited");
        let record = AttemptRecord::from_error(id.clone(), &err, Duration::from_millis(12));

        assert_eq!(record.kind, ErrorKind::AttemptFailed);
        assert!(record.reason.contains("rate limited"));
        assert_eq!(record.collaborator, id);
    }

    #[test]
    fn test_exhausted_exposes_attempts() {
        let id = CollaboratorId::from("a");
        let err = DispatchError::AllAttemptsExhausted {
            capability: Capability::from("x"),
            attempts: vec![AttemptRecord::unavailable(id)],
            last_error: "boom".into(),
        };
        assert_eq!(err.attempts().len(), 1);
        assert!(err.to_string().contains("last error: boom"));
        assert_eq!(ErrorKind::Timeout.to_string(), "timeout");
    }

    #[test]
    fn test_unavailable_record_mirrors_error_variant() {
        let id = CollaboratorId::from("gemini");
        let record = AttemptRecord::unavailable(id.clone());
        let error = DispatchError::CollaboratorUnavailable {
            collaborator: id.clone(),
        };

        assert_eq!(record.kind, error.kind());
        assert_eq!(record.kind, ErrorKind::CollaboratorUnavailable);
        assert_eq!(record.reason, error.to_string());
        assert_eq!(record.latency, Duration::ZERO);
        assert_eq!(record.collaborator, id);
    }

    #[test]
    fn test_deadline_exceeded_is_a_timeout_with_attempts() {
        let id = CollaboratorId::from("a");
        let err = DispatchError::DeadlineExceeded {
            capability: Capability::from("x"),
            after: Duration::from_millis(300),
            attempts: vec![AttemptRecord::unavailable(id)],
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.attempts().len(), 1);
        assert!(err.to_string().contains("elapsed after 300ms"));
    }
}

//! Resilient Task Dispatch
//!
//! Routes a task to the best collaborator able to perform it, falls back to
//! the next-best one when an attempt fails, and keeps failing collaborators
//! out of rotation until they recover.
//!
//! # Architecture
//!
//! - **CircuitBreaker / BreakerRegistry**: per-collaborator health gate (closed, open, half-open)
//! - **PerformanceLedger**: success rate and mean latency per (collaborator, capability)
//! - **Selector**: ranks capable collaborators and asks their breakers for admission
//! - **DispatchOrchestrator**: bounded retry-with-fallback loop over the ranking
//! - **CorrelatedChannel / RemoteAgent**: request/response correlation over one
//!   persistent connection
//! - **CachedInvoker**: LRU + TTL cache around any collaborator
//! - **HttpProvider**: OpenAI-compatible chat completions (feature `http`)
//!
//! # Usage
//!
//! ```no_run
//! use dispatch::{Capability, DispatchConfig, DispatchOrchestrator, RemoteAgent};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = DispatchConfig::load_with_env(None)?;
//!     let mut orchestrator = DispatchOrchestrator::from_config(&config);
//!
//!     let agent = Arc::new(RemoteAgent::new("desktop".into()));
//!     orchestrator.register(agent.clone(), vec![Capability::from("screenshot")]);
//!
//!     let (channel, _outbound) = agent.connect(config.channel.default_timeout());
//!     // The transport writes `_outbound` frames to the socket and feeds
//!     // inbound frames to `channel.serve(...)`.
//!     # let _ = channel;
//!
//!     let outcome = orchestrator
//!         .execute(&Capability::from("screenshot"), json!({"monitor": 1}))
//!         .await?;
//!     println!("{} answered: {}", outcome.collaborator, outcome.result);
//!     Ok(())
//! }
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod cache;
pub mod channel;
pub mod collaborator;
pub mod config;
pub mod error;
pub mod ledger;
pub mod orchestrator;
pub mod providers;
pub mod reliability;
pub mod selection;

pub use cache::{CacheStats, CachedInvoker};
pub use channel::{ChannelFrame, ChannelStats, CorrelatedChannel, InboundDisposition, RemoteAgent};
pub use collaborator::{
    Capability, CapabilityRegistry, Collaborator, CollaboratorId, Invocation,
};
pub use config::{CollaboratorKind, CollaboratorSettings, DispatchConfig};
pub use error::{AttemptRecord, ConfigError, DispatchError, ErrorKind};
pub use ledger::{CollaboratorPerformance, LedgerSummary, PerformanceLedger, PerformanceRecord};
pub use orchestrator::{DispatchOrchestrator, DispatchOutcome, ExecuteOptions};
#[cfg(feature = "http")]
pub use providers::HttpProvider;
pub use reliability::{
    BreakerConfig, BreakerMetrics, BreakerPermit, BreakerRegistry, BreakerState,
    BreakerTransition, CircuitBreaker, HealthSummary,
};
pub use selection::{ScoredCandidate, Selection, SelectionWeights, Selector};

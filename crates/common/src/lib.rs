//! Shared utilities for the dispatch workspace.

pub mod structured_logging;

pub use structured_logging::{
    init_structured_logging, JsonFormatter, LoggingConfig, OperationTimer, ServiceContext,
    StructuredLogEntry,
};

//! Collaborator implementations for external providers.

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "http")]
pub use http::HttpProvider;

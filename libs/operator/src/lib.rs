//! Core pipeline that turns a cluster mutation into an attributed,
//! batched Git commit: admission ingestion, sanitization, rule
//! matching, correlation, and per-destination commit workers.

pub mod admission;
pub mod correlation;
pub mod crd;
pub mod destination;
pub mod dispatcher;
pub mod encryption;
pub mod error;
pub mod event;
pub mod id;
pub mod leader;
pub mod metrics;
pub mod queue;
pub mod reconcilers;
pub mod rules;
pub mod sanitize;
pub mod telemetry;
pub mod watch;
pub mod worker;

pub use error::Error;

//! Core runtime for the query-analytics back-end.
//!
//! Agents attached to monitored database instances connect over persistent
//! TCP sessions, ship per-interval query reports, and accept live commands.
//! This crate holds the agent directory and command routing, the ingestion
//! pipeline, the metrics store (writer and aggregation reader), the instance
//! registry, and the deferred-purge task queue.

pub mod agent;
pub mod config;
pub mod database;
pub mod errors;
pub mod metrics;
pub mod proto;
pub mod qan;
pub mod tasker;

pub use config::Config;
pub use errors::{QanError, QanResult};

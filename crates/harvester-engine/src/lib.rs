//! Crawl orchestration for Harvester.
//!
//! Owns the worker threads, seeding, job lifecycle, deletion, and output
//! notification, plus the connector pools, throttles, and fairness bins
//! they share. All persistent state goes through a
//! [`StateBackend`](harvester_state::StateBackend).

#![warn(clippy::pedantic)]

pub mod activity;
pub mod bins;
pub mod cancel;
pub mod channel;
pub mod config;
pub mod context;
pub mod deletion;
pub mod engine;
pub mod errors;
pub mod janitor;
pub mod jobs;
pub mod notification;
pub mod pipeline;
pub mod pool;
pub mod registry;
pub mod seeding;
pub mod throttle;
pub mod worker;

// Re-export public API for convenience
pub use cancel::CancellationToken;
pub use config::{parse_config, validate_config, EngineConfig, EngineSettings};
pub use engine::{open_store, ConnectionCheck, Engine, EngineHandle};
pub use errors::ProcessError;
pub use jobs::{JobManager, JobReport};
pub use registry::ConnectorRegistry;

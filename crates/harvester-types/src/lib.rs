//! Shared Harvester model types.
//!
//! Everything here is plain data: identifiers and statuses for jobs and
//! documents, connection and job descriptions, the structured connector
//! error model, and the specification tree. Both the state backends and
//! connector implementations depend on this crate, so it carries no
//! runtime behavior beyond validation and (de)serialization.

pub mod connection;
pub mod error;
pub mod job;
pub mod spec;
pub mod state;

//! Connector capability interface.
//!
//! Connector authors implement [`Connector`](connector::Connector) plus one
//! of the repository, transformation, or output traits. The engine hands
//! each call an activity callback for accounting and indexability checks;
//! connectors never touch persisted state directly.

pub mod acl;
pub mod activity;
pub mod connector;
pub mod document;
pub mod prelude;
pub mod process;

pub use harvester_types as types;

//! Convenience re-exports for connector authors.
//!
//! ```ignore
//! use harvester_sdk::prelude::*;
//! ```

// Connector traits
pub use crate::connector::{
    Connector, FetchOutcome, IngestResult, OutputConnector, RepositoryConnector,
    TransformationConnector,
};

// Activity callbacks
pub use crate::activity::{ActivityCallback, NoopActivity, SeedingActivity};

// Documents and security
pub use crate::acl::AccessTokens;
pub use crate::document::RepositoryDocument;

// Shared model types
pub use harvester_types::connection::ConfigParams;
pub use harvester_types::error::{ConnectorError, ValidationResult, ValidationStatus};
pub use harvester_types::spec::{Specification, SpecificationNode};

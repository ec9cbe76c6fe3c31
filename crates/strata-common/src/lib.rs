//! Common types for Strata: CRDs, errors, the state store and shared utilities

#![deny(missing_docs)]

pub mod config;
pub mod crd;
pub mod error;
pub mod hash;
pub mod labels;
pub mod leader_election;
pub mod retry;
pub mod store;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for every write the operator makes
pub const FIELD_MANAGER: &str = "strata-operator";

/// API group of the Strata CRDs
pub const API_GROUP: &str = "strata.dev";

/// Namespace the operator runs in by default (leases, CRD install)
pub const STRATA_SYSTEM_NAMESPACE: &str = "strata-system";

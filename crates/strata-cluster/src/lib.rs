//! StrataCluster reconciliation engine
//!
//! - `planner`: spec to target topology, validation and template hashes
//! - `observed`: ownership index rebuilt from labels each pass
//! - `upgrade`: active/pending generation state machine and cutover decision
//! - `status`: Ready / Upgrading / Failed conditions
//! - `reconciler`: the pass that ties them together over a `StateStore`

pub mod apply;
pub mod controller;
pub mod error;
pub mod observed;
pub mod planner;
pub mod reconciler;
pub mod resources;
pub mod routing;
pub mod status;
pub mod upgrade;

pub use controller::ClusterReconciler;
pub use error::ReconcileError;
pub use reconciler::{reconcile, Context};

//! # Flow execution engine
//!
//! Compiles a resolved flow specification into a DAG of runtime nodes and
//! executes it concurrently per request. Every node activation runs on its
//! own task; edges derive from explicit `depends_on` declarations unioned
//! with the edges implied by property references.
//!
//! Execution guarantees:
//! - for any edge `u -> v`, every store write performed by `u` happens
//!   before the first read in `v`,
//! - each node's call runs at most once per request regardless of indegree,
//! - the first node error wins, cancels in-flight work and triggers a
//!   best-effort rollback pass over the nodes that completed forward.

pub mod call;
pub mod manager;
mod node;
pub mod processes;
pub mod tracker;

pub use call::{Call, ServiceCall};
pub use manager::{Manager, NodeCalls};
pub use processes::Processes;
pub use tracker::Tracker;

use thiserror::Error;

/// Per-request flow execution failures.
#[derive(Debug, Error)]
pub enum FlowError {
    /// Wraps any error originating inside a node, carrying the causing kind.
    #[error("node '{node}' failed: {cause}")]
    NodeFailed {
        node: String,
        cause: Box<crate::Error>,
    },

    /// Aggregated rollback failures. The original forward error is carried
    /// alongside and never masked.
    #[error("rollback incomplete, nodes {nodes:?} failed to revert: {cause}")]
    RollbackFailed {
        cause: Box<crate::Error>,
        nodes: Vec<String>,
    },

    #[error("flow execution canceled")]
    Canceled,
}

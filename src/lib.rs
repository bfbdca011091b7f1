//! # Crossflow
//!
//! A declarative data-transformation and service-orchestration engine.
//! Crossflow executes named **flows** (directed acyclic graphs of service
//! calls with per-node input/output shaping) against pluggable transports
//! and codecs:
//!
//! - **Reference Store**: per-request symbolic dataflow space keyed by
//!   `(resource, path)`, threading values between nodes
//! - **Flow**: a DAG of nodes scheduled concurrently, with compensating
//!   rollback subflows on partial failure
//! - **Codec / Transport**: strategy plugins isolating wire formats and
//!   protocols from the engine
//!
//! ## 🏗️ Feature Architecture
//!
//! Crossflow is organized into a small set of always-available core modules
//! plus feature-gated reference plugins:
//!
//! ### Core
//! - `refs`: the per-request reference store
//! - `specs`: the immutable specification model and dependency resolver
//! - `flow`: flow compilation and concurrent node scheduling
//! - `codec` / `transport`: the plugin surfaces
//! - `endpoint` / `engine`: endpoint dispatch and the engine facade
//!
//! ### Built-in Plugins
//! - `codec-json`: JSON reference codec
//! - `transport-http`: HTTP caller (client) and listener (server)
//!
//! ## 🚀 Quick Start
//!
//! ```rust,no_run
//! use crossflow::prelude::*;
//! use std::sync::Arc;
//!
//! # fn manifest() -> Manifest { Manifest::default() }
//! # async fn example() -> Result<()> {
//! let listener = Arc::new(HttpListener::new("127.0.0.1:8080")?);
//!
//! let engine = EngineBuilder::new()
//!     .with_manifest(manifest())
//!     .with_listener(listener)
//!     .build()?;
//!
//! engine.serve().await
//! # }
//! ```
//!
//! Flows can also be executed programmatically without a listener:
//!
//! ```rust,ignore
//! let store = Arc::new(Store::new(8));
//! store.store("input", "message", serde_json::json!("hello"));
//! engine.run(&CancellationToken::new(), "greet", store.clone()).await?;
//! ```

// ============================================================================
// CORE MODULES (always available)
// ============================================================================

pub mod codec;
pub mod endpoint;
pub mod engine;
pub mod flow;
pub mod refs;
pub mod specs;
pub mod transport;

// ============================================================================
// CORE RE-EXPORTS
// ============================================================================

// Engine facade - always available
pub use engine::{DefinitionResolver, Engine, EngineBuilder, SchemaResolver};

// Reference store - always available
pub use refs::{Cell, Store};

// Specification model - always available
pub use specs::{
    Endpoint, EnumSchema, Flow, FlowManager, Label, Manifest, Method, Node, Options,
    ParameterMap, Property, PropertyReference, Proxy, ResolveError, Service, ServiceStore, Type,
};

// Plugin surfaces - always available
pub use codec::{Codec, CodecError, HeaderManager};
pub use flow::FlowError;
pub use transport::{Caller, Listener, TransportError};

// ============================================================================
// BUILT-IN PLUGIN RE-EXPORTS (feature-gated)
// ============================================================================

/// JSON reference codec
#[cfg(feature = "codec-json")]
pub use codec::JsonCodec;

/// HTTP caller and listener
#[cfg(feature = "transport-http")]
pub use transport::{HttpCaller, HttpListener};

// ============================================================================
// CONVENIENCE RE-EXPORTS
// ============================================================================

/// Commonly used external types
pub use serde_json::Value as JsonValue;
pub use tokio_util::sync::CancellationToken;

/// Convenient re-exports for common types and traits
pub mod prelude {
    // Core types - always available
    pub use crate::{
        CancellationToken, DefinitionResolver, Engine, EngineBuilder, Error, Flow, FlowManager,
        Label, Manifest, Method, Node, Options, ParameterMap, Property, PropertyReference, Proxy,
        Result, SchemaResolver, Service, ServiceStore, Store, Type,
    };

    // Plugin surfaces - always available
    pub use crate::codec::Codec;
    pub use crate::transport::{Caller, Listener};

    // Built-in plugins - feature-gated
    #[cfg(feature = "codec-json")]
    pub use crate::codec::JsonCodec;

    #[cfg(feature = "transport-http")]
    pub use crate::transport::{HttpCaller, HttpListener};

    // Commonly used external types
    pub use serde_json::Value as JsonValue;
}

// ============================================================================
// ERROR HANDLING
// ============================================================================

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type spanning every engine subsystem
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Manifest-time resolution failure, fatal at load
    #[error(transparent)]
    Resolve(#[from] specs::ResolveError),

    /// Per-request encoding or decoding failure
    #[error(transparent)]
    Codec(#[from] codec::CodecError),

    /// Transport-level failure while calling or serving
    #[error(transparent)]
    Transport(#[from] transport::TransportError),

    /// Flow execution failure
    #[error(transparent)]
    Flow(#[from] flow::FlowError),
}

// ============================================================================
// INTEGRATION TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_basic_integration() {
        let store = Store::new(1);
        store.store("input", "message", json!("hello"));

        let cell = store.load("input", "message").unwrap();
        assert_eq!(cell.as_value(), Some(&json!("hello")));
    }

    #[test]
    fn test_error_conversion() {
        let resolve = specs::ResolveError::DuplicateDefinition {
            name: "echo".to_string(),
        };

        let err: Error = resolve.into();
        assert!(matches!(err, Error::Resolve(_)));
        assert_eq!(err.to_string(), "duplicate definition: echo");
    }

    #[test]
    fn test_flow_error_display() {
        let err: Error = flow::FlowError::NodeFailed {
            node: "first".to_string(),
            cause: Box::new(transport::TransportError::Timeout.into()),
        }
        .into();

        assert_eq!(
            err.to_string(),
            "node 'first' failed: call deadline exceeded"
        );
    }
}

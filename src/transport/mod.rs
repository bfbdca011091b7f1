//! # Transport plugins
//!
//! Transports move opaque byte streams plus headers between the engine and
//! remote services. They never interpret payload bytes; only codecs do.
//!
//! The surface is split in two independent halves: a [`Caller`] dials a
//! service schema and produces a [`Call`] used to invoke its methods, while
//! a [`Listener`] exposes an endpoint and hands inbound requests to flow
//! managers. Both halves are strategy plugins registered by name.

#[cfg(feature = "transport-http")]
pub mod http;

#[cfg(feature = "transport-http")]
pub use http::{HttpCaller, HttpListener};

use crate::endpoint::Endpoint;
use crate::refs::Store;
use crate::specs::{Options, Service};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Transport-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("call deadline exceeded")]
    Timeout,

    #[error("call canceled")]
    Canceled,

    #[error("remote fault {status}: {message}")]
    RemoteFault { status: u16, message: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unknown service method '{0}'")]
    UnknownMethod(String),

    #[error("no transport registered under '{0}'")]
    Unknown(String),
}

/// A callable method exposed by a dialed service.
#[derive(Debug, Clone)]
pub struct Method {
    pub name: String,
    pub options: Options,
}

/// Flat header map carried alongside request and response bodies.
pub type Header = HashMap<String, String>;

/// An outbound request handed to a transport call. The body is an opaque,
/// already codec-marshaled byte stream.
pub struct Request {
    pub method: Option<Arc<Method>>,
    pub header: Header,
    pub body: Vec<u8>,
}

/// Receives the response of a transport call.
pub trait ResponseWriter: Send {
    fn header_mut(&mut self) -> &mut Header;
    fn write(&mut self, chunk: &[u8]);
}

/// In-memory [`ResponseWriter`] used by the flow runtime.
#[derive(Debug, Default)]
pub struct ResponseBuffer {
    header: Header,
    body: Vec<u8>,
}

impl ResponseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

impl ResponseWriter for ResponseBuffer {
    fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    fn write(&mut self, chunk: &[u8]) {
        self.body.extend_from_slice(chunk);
    }
}

/// A dialed service ready to be invoked.
#[async_trait]
pub trait Call: Send + Sync {
    /// Looks up a method by name.
    fn method(&self, name: &str) -> Option<Arc<Method>>;

    /// Invokes the remote service. Response bytes are written to `writer`
    /// and response headers into its header map. The store is available for
    /// transports that carry per-call metadata; the payload itself stays
    /// opaque.
    async fn send(
        &self,
        ctx: &CancellationToken,
        writer: &mut dyn ResponseWriter,
        request: Request,
        store: &Store,
    ) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Dials services for one transport protocol.
pub trait Caller: Send + Sync {
    /// Registry name of this caller, e.g. `http`.
    fn name(&self) -> &'static str;

    fn dial(&self, service: &Service) -> Result<Arc<dyn Call>, TransportError>;
}

impl std::fmt::Debug for dyn Caller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Caller({})", self.name())
    }
}

/// Accepts inbound requests and routes them to registered endpoints.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Registry name of this listener, e.g. `http`.
    fn name(&self) -> &'static str;

    /// Registers endpoints before serving. The listener matches inbound
    /// requests against each endpoint's options.
    fn handle(&self, endpoints: Vec<Endpoint>) -> Result<(), crate::Error>;

    /// Serves until closed.
    async fn serve(&self) -> Result<(), crate::Error>;

    /// Stops accepting requests and drains in-flight work.
    async fn close(&self);
}

/// Name-keyed caller registry.
#[derive(Default)]
pub struct CallerRegistry {
    callers: HashMap<&'static str, Arc<dyn Caller>>,
}

impl CallerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, caller: Arc<dyn Caller>) {
        self.callers.insert(caller.name(), caller);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Caller>, TransportError> {
        self.callers
            .get(name)
            .cloned()
            .ok_or_else(|| TransportError::Unknown(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_buffer_accumulates() {
        let mut writer = ResponseBuffer::new();
        writer.write(b"hello ");
        writer.write(b"world");
        writer
            .header_mut()
            .insert("Content-Type".to_string(), "text/plain".to_string());

        assert_eq!(writer.body(), b"hello world");
        assert_eq!(writer.header().get("Content-Type").unwrap(), "text/plain");
    }

    #[test]
    fn test_caller_registry_unknown() {
        let registry = CallerRegistry::new();
        assert!(matches!(
            registry.get("grpc").unwrap_err(),
            TransportError::Unknown(name) if name == "grpc"
        ));
    }
}

//! Units of work executed by runtime nodes.

use crate::Error;
use crate::codec::{self, HeaderManager};
use crate::refs::Store;
use crate::transport::{self, Request, ResponseBuffer};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A unit of work invoked by a node during forward execution or rollback.
/// Implementations must be safe to share across requests.
#[async_trait]
pub trait Call: Send + Sync {
    async fn execute(&self, ctx: &CancellationToken, store: &Store) -> Result<(), Error>;
}

/// The standard call implementation: marshals the request parameter map out
/// of the store, invokes the remote service through its transport, and
/// decodes the response back into the store under the node's resource.
pub struct ServiceCall {
    node: String,
    transport: Arc<dyn transport::Call>,
    method: Option<Arc<transport::Method>>,
    request: Option<Arc<dyn codec::Manager>>,
    request_header: Option<HeaderManager>,
    response: Option<Arc<dyn codec::Manager>>,
    response_header: Option<HeaderManager>,
}

impl ServiceCall {
    pub fn new(
        node: impl Into<String>,
        transport: Arc<dyn transport::Call>,
        method: Option<Arc<transport::Method>>,
    ) -> Self {
        Self {
            node: node.into(),
            transport,
            method,
            request: None,
            request_header: None,
            response: None,
            response_header: None,
        }
    }

    pub fn with_request(
        mut self,
        body: Option<Arc<dyn codec::Manager>>,
        header: Option<HeaderManager>,
    ) -> Self {
        self.request = body;
        self.request_header = header;
        self
    }

    pub fn with_response(
        mut self,
        body: Option<Arc<dyn codec::Manager>>,
        header: Option<HeaderManager>,
    ) -> Self {
        self.response = body;
        self.response_header = header;
        self
    }
}

#[async_trait]
impl Call for ServiceCall {
    async fn execute(&self, ctx: &CancellationToken, store: &Store) -> Result<(), Error> {
        let body = match &self.request {
            Some(manager) => manager.marshal(store)?,
            None => Vec::new(),
        };

        let header = self
            .request_header
            .as_ref()
            .map(|manager| manager.marshal(store))
            .unwrap_or_default();

        tracing::debug!(node = %self.node, bytes = body.len(), "dispatching service call");

        let mut writer = ResponseBuffer::new();
        self.transport
            .send(
                ctx,
                &mut writer,
                Request {
                    method: self.method.clone(),
                    header,
                    body,
                },
                store,
            )
            .await?;

        if let Some(manager) = &self.response {
            manager.unmarshal(writer.body(), store)?;
        }

        if let Some(manager) = &self.response_header {
            manager.unmarshal(writer.header(), store);
        }

        Ok(())
    }
}

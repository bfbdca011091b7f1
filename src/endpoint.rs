//! Endpoint runtime.
//!
//! An [`Endpoint`] binds a compiled flow to a listener together with the
//! codec plumbing derived from the flow's input and output parameter maps.
//! Listeners stay protocol-specific: they match inbound requests against
//! endpoint options and delegate the rest of the request lifecycle (store
//! construction, input decoding, flow execution, output encoding, proxy
//! forwarding) to [`Endpoint::process`].

use crate::Error;
use crate::codec::{self, HeaderManager};
use crate::flow;
use crate::refs::Store;
use crate::specs::Options;
use crate::transport::{self, Header, Request, ResponseBuffer};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// The shaped response of a processed request.
#[derive(Debug, Default)]
pub struct Reply {
    pub header: Header,
    pub body: Vec<u8>,
}

/// A flow bound to a listener, with per-endpoint codec managers built once
/// at dispatch time.
pub struct Endpoint {
    pub flow: Arc<flow::Manager>,
    pub options: Options,
    request: Option<Arc<dyn codec::Manager>>,
    request_header: Option<HeaderManager>,
    response: Option<Arc<dyn codec::Manager>>,
    response_header: Option<HeaderManager>,
    forward: Option<Arc<dyn transport::Call>>,
    capacity: usize,
}

impl Endpoint {
    pub fn new(flow: Arc<flow::Manager>, options: Options) -> Self {
        Self {
            flow,
            options,
            request: None,
            request_header: None,
            response: None,
            response_header: None,
            forward: None,
            capacity: 8,
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

    pub fn with_forward(mut self, forward: Arc<dyn transport::Call>) -> Self {
        self.forward = Some(forward);
        self
    }

    /// Sizes the per-request store for roughly `capacity` values.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Handles one inbound request: constructs the reference store,
    /// populates the input resource from headers and the decoded body, runs
    /// the flow and shapes the response. Proxies forward the raw inbound
    /// body once their node DAG has completed.
    pub async fn process(
        &self,
        ctx: &CancellationToken,
        header: &Header,
        body: &[u8],
    ) -> Result<Reply, Error> {
        let request_id = Uuid::new_v4();
        tracing::debug!(%request_id, flow = %self.flow.name(), "processing inbound request");

        let store = Arc::new(Store::new(self.capacity));

        if let Some(manager) = &self.request_header {
            manager.unmarshal(header, &store);
        }

        if let Some(manager) = &self.request {
            manager.unmarshal(body, &store)?;
        }

        self.flow.run(ctx, store.clone()).await?;

        if let Some(forward) = &self.forward {
            let mut writer = ResponseBuffer::new();
            forward
                .send(
                    ctx,
                    &mut writer,
                    Request {
                        method: None,
                        header: header.clone(),
                        body: body.to_vec(),
                    },
                    &store,
                )
                .await?;

            return Ok(Reply {
                header: writer.header().clone(),
                body: writer.body().to_vec(),
            });
        }

        let mut reply = Reply::default();

        if let Some(manager) = &self.response {
            reply.body = manager.marshal(&store)?;
        }

        if let Some(manager) = &self.response_header {
            reply.header = manager.marshal(&store);
        }

        tracing::debug!(%request_id, flow = %self.flow.name(), "request completed");
        Ok(reply)
    }
}

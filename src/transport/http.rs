//! HTTP reference transport.
//!
//! The caller targets `host + method.options.endpoint` with the configured
//! request method; the listener routes inbound requests by literal path and
//! method. Headers map one-to-one onto HTTP headers and upstream status
//! codes are preserved inside [`TransportError::RemoteFault`] so listeners
//! can pass them through.

use super::{Call, Caller, Header, Listener, Method, Request, ResponseWriter, TransportError};
use crate::Error;
use crate::endpoint::Endpoint;
use crate::flow::FlowError;
use crate::refs::Store;
use crate::specs::{ENDPOINT_OPTION, METHOD_OPTION, Service, TIMEOUT_OPTION};
use async_trait::async_trait;
use axum::Router;
use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{MethodFilter, on};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Constructs HTTP service calls backed by a shared client.
#[derive(Debug, Default, Clone)]
pub struct HttpCaller {
    client: reqwest::Client,
}

impl HttpCaller {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Caller for HttpCaller {
    fn name(&self) -> &'static str {
        "http"
    }

    fn dial(&self, service: &Service) -> Result<Arc<dyn Call>, TransportError> {
        let methods = service
            .methods
            .iter()
            .map(|method| {
                (
                    method.name.clone(),
                    Arc::new(Method {
                        name: method.name.clone(),
                        options: method.options.clone(),
                    }),
                )
            })
            .collect();

        Ok(Arc::new(HttpCall {
            client: self.client.clone(),
            host: service.host.trim_end_matches('/').to_string(),
            methods,
        }))
    }
}

struct HttpCall {
    client: reqwest::Client,
    host: String,
    methods: HashMap<String, Arc<Method>>,
}

#[async_trait]
impl Call for HttpCall {
    fn method(&self, name: &str) -> Option<Arc<Method>> {
        self.methods.get(name).cloned()
    }

    async fn send(
        &self,
        ctx: &CancellationToken,
        writer: &mut dyn ResponseWriter,
        request: Request,
        _store: &Store,
    ) -> Result<(), TransportError> {
        let (endpoint, verb, timeout) = match &request.method {
            Some(method) => (
                method.options.get_or(ENDPOINT_OPTION, "/"),
                method.options.get_or(METHOD_OPTION, "GET"),
                method.options.get(TIMEOUT_OPTION),
            ),
            // proxy forward carries no method description
            None => ("/", "POST", None),
        };

        let url = format!("{}/{}", self.host, endpoint.trim_start_matches('/'));
        let verb = reqwest::Method::from_bytes(verb.to_uppercase().as_bytes())
            .map_err(|_| TransportError::InvalidArgument(format!("invalid method '{verb}'")))?;

        tracing::debug!(url = %url, method = %verb, "dispatching http request");

        let mut builder = self.client.request(verb, &url).body(request.body);
        for (name, value) in &request.header {
            // connection-scoped headers are owned by the client
            if matches!(
                name.to_ascii_lowercase().as_str(),
                "host" | "content-length" | "connection" | "transfer-encoding"
            ) {
                continue;
            }

            builder = builder.header(name, value);
        }

        if let Some(timeout) = timeout.and_then(|value| value.parse::<u64>().ok()) {
            builder = builder.timeout(Duration::from_millis(timeout));
        }

        let response = tokio::select! {
            _ = ctx.cancelled() => return Err(TransportError::Canceled),
            response = builder.send() => response.map_err(map_client_error)?,
        };

        let status = response.status();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                writer
                    .header_mut()
                    .insert(name.as_str().to_string(), value.to_string());
            }
        }

        let body = tokio::select! {
            _ = ctx.cancelled() => return Err(TransportError::Canceled),
            body = response.bytes() => body.map_err(map_client_error)?,
        };

        if !status.is_success() {
            return Err(TransportError::RemoteFault {
                status: status.as_u16(),
                message: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        writer.write(&body);
        Ok(())
    }
}

fn map_client_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        return TransportError::Timeout;
    }

    if err.is_builder() || err.is_request() {
        return TransportError::InvalidArgument(err.to_string());
    }

    TransportError::Unavailable(err.to_string())
}

/// Serves registered endpoints over HTTP, routing by literal path and
/// request method.
pub struct HttpListener {
    addr: SocketAddr,
    router: Mutex<Option<Router>>,
    shutdown: CancellationToken,
}

impl HttpListener {
    pub fn new(addr: &str) -> Result<Self, Error> {
        let addr = addr
            .parse()
            .map_err(|_| TransportError::InvalidArgument(format!("invalid address '{addr}'")))?;

        Ok(Self {
            addr,
            router: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl Listener for HttpListener {
    fn name(&self) -> &'static str {
        "http"
    }

    fn handle(&self, endpoints: Vec<Endpoint>) -> Result<(), Error> {
        let mut router = Router::new();

        for endpoint in endpoints {
            let path = endpoint.options.get_or(ENDPOINT_OPTION, "/");
            let path = if path.starts_with('/') {
                path.to_string()
            } else {
                format!("/{path}")
            };
            let verb = endpoint.options.get_or(METHOD_OPTION, "GET").to_uppercase();
            let filter = method_filter(&verb)?;

            tracing::info!(
                path = %path,
                method = %verb,
                flow = %endpoint.flow.name(),
                "registered http endpoint"
            );

            let shared = Arc::new(endpoint);
            let handler = move |headers: HeaderMap, body: Bytes| {
                let endpoint = shared.clone();
                async move { respond(endpoint, headers, body).await }
            };

            router = router.route(&path, on(filter, handler));
        }

        *lock_router(&self.router) = Some(router);
        Ok(())
    }

    async fn serve(&self) -> Result<(), Error> {
        let router = lock_router(&self.router).take().unwrap_or_else(Router::new);

        let listener = tokio::net::TcpListener::bind(self.addr)
            .await
            .map_err(|err| TransportError::Unavailable(err.to_string()))?;

        tracing::info!(addr = %self.addr, "http listener serving");

        let shutdown = self.shutdown.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|err| TransportError::Unavailable(err.to_string()))?;

        Ok(())
    }

    async fn close(&self) {
        tracing::info!(addr = %self.addr, "closing http listener");
        self.shutdown.cancel();
    }
}

async fn respond(endpoint: Arc<Endpoint>, headers: HeaderMap, body: Bytes) -> Response {
    let header = flatten_headers(&headers);
    let ctx = CancellationToken::new();

    match endpoint.process(&ctx, &header, &body).await {
        Ok(reply) => {
            let mut headers = HeaderMap::new();
            for (name, value) in reply.header {
                // connection-scoped headers are owned by the server
                if matches!(
                    name.to_ascii_lowercase().as_str(),
                    "content-length" | "connection" | "transfer-encoding"
                ) {
                    continue;
                }

                let name = HeaderName::try_from(name.as_str()).ok();
                let value = HeaderValue::from_str(&value).ok();

                if let (Some(name), Some(value)) = (name, value) {
                    headers.insert(name, value);
                }
            }

            (StatusCode::OK, headers, reply.body).into_response()
        }
        Err(err) => {
            let status = status_for(&err);
            tracing::error!(flow = %endpoint.flow.name(), error = %err, status = %status, "request failed");
            (status, err.to_string()).into_response()
        }
    }
}

/// Maps an error kind onto the protocol-appropriate response status.
pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::Flow(FlowError::NodeFailed { cause, .. }) => status_for(cause),
        Error::Flow(FlowError::RollbackFailed { cause, .. }) => status_for(cause),
        Error::Codec(_) => StatusCode::BAD_REQUEST,
        Error::Transport(TransportError::Unavailable(_)) => StatusCode::BAD_GATEWAY,
        Error::Transport(TransportError::Timeout) => StatusCode::GATEWAY_TIMEOUT,
        Error::Transport(TransportError::InvalidArgument(_)) => StatusCode::BAD_REQUEST,
        Error::Transport(TransportError::RemoteFault { status, .. }) => {
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn method_filter(verb: &str) -> Result<MethodFilter, Error> {
    let filter = match verb {
        "GET" => MethodFilter::GET,
        "POST" => MethodFilter::POST,
        "PUT" => MethodFilter::PUT,
        "PATCH" => MethodFilter::PATCH,
        "DELETE" => MethodFilter::DELETE,
        "HEAD" => MethodFilter::HEAD,
        "OPTIONS" => MethodFilter::OPTIONS,
        other => {
            return Err(
                TransportError::InvalidArgument(format!("invalid method '{other}'")).into(),
            );
        }
    };

    Ok(filter)
}

fn flatten_headers(headers: &HeaderMap) -> Header {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

fn lock_router(router: &Mutex<Option<Router>>) -> std::sync::MutexGuard<'_, Option<Router>> {
    router.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecError;

    #[test]
    fn test_status_mapping() {
        let codec: Error = CodecError::MissingDefinition("input".to_string()).into();
        assert_eq!(status_for(&codec), StatusCode::BAD_REQUEST);

        let unavailable: Error =
            TransportError::Unavailable("connection refused".to_string()).into();
        assert_eq!(status_for(&unavailable), StatusCode::BAD_GATEWAY);

        let timeout: Error = TransportError::Timeout.into();
        assert_eq!(status_for(&timeout), StatusCode::GATEWAY_TIMEOUT);

        let fault: Error = TransportError::RemoteFault {
            status: 409,
            message: "conflict".to_string(),
        }
        .into();
        assert_eq!(status_for(&fault), StatusCode::CONFLICT);

        let canceled: Error = FlowError::Canceled.into();
        assert_eq!(status_for(&canceled), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_node_failures_unwrap_to_their_cause() {
        let err: Error = FlowError::NodeFailed {
            node: "first".to_string(),
            cause: Box::new(TransportError::Timeout.into()),
        }
        .into();

        assert_eq!(status_for(&err), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn test_method_filter_rejects_unknown() {
        assert!(method_filter("GET").is_ok());
        assert!(method_filter("TRACE").is_err());
    }
}

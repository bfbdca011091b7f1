//! Engine facade.
//!
//! [`EngineBuilder`] collects definition and schema resolvers together with
//! the codec, caller and listener plugins, then compiles the merged manifest
//! into executable flows and binds them to listeners. The resulting
//! [`Engine`] serves every listener until closed; shutdown closes listeners
//! in reverse registration order.

use crate::Error;
use crate::codec::{self, HeaderManager};
use crate::endpoint::Endpoint;
use crate::flow::{Manager, NodeCalls, ServiceCall};
use crate::refs;
use crate::specs::{
    self, CODEC_OPTION, FlowManager, Manifest, ServiceStore, dependencies,
};
use crate::transport::{self, CallerRegistry, Listener, TransportError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Produces a manifest to be merged into the active manifest. Multiple
/// resolvers are merged by union on unique names.
pub trait DefinitionResolver: Send + Sync {
    fn resolve(&self) -> Result<Manifest, Error>;
}

impl<F> DefinitionResolver for F
where
    F: Fn() -> Result<Manifest, Error> + Send + Sync,
{
    fn resolve(&self) -> Result<Manifest, Error> {
        self()
    }
}


/// Adds service schemas by name. Resolvers run once at build time.
pub trait SchemaResolver: Send + Sync {
    fn resolve(&self, services: &mut ServiceStore) -> Result<(), Error>;
}

impl<F> SchemaResolver for F
where
    F: Fn(&mut ServiceStore) -> Result<(), Error> + Send + Sync,
{
    fn resolve(&self, services: &mut ServiceStore) -> Result<(), Error> {
        self(services)
    }
}

/// Fluent builder wiring definitions, schemas and plugins into an [`Engine`].
pub struct EngineBuilder {
    definitions: Vec<Box<dyn DefinitionResolver>>,
    schemas: Vec<Box<dyn SchemaResolver>>,
    codecs: codec::Registry,
    callers: CallerRegistry,
    listeners: Vec<Arc<dyn Listener>>,
}

impl EngineBuilder {
    /// Creates a builder with the built-in plugins registered.
    pub fn new() -> Self {
        #[allow(unused_mut)]
        let mut codecs = codec::Registry::new();
        #[allow(unused_mut)]
        let mut callers = CallerRegistry::new();

        #[cfg(feature = "codec-json")]
        codecs.register(Arc::new(codec::JsonCodec));

        #[cfg(feature = "transport-http")]
        callers.register(Arc::new(transport::HttpCaller::new()));

        Self {
            definitions: Vec::new(),
            schemas: Vec::new(),
            codecs,
            callers,
            listeners: Vec::new(),
        }
    }

    pub fn with_definitions(mut self, resolver: impl DefinitionResolver + 'static) -> Self {
        self.definitions.push(Box::new(resolver));
        self
    }

    /// Registers a literal manifest as a definition source.
    pub fn with_manifest(self, manifest: Manifest) -> Self {
        let resolver = move || -> Result<Manifest, Error> { Ok(manifest.clone()) };
        self.with_definitions(resolver)
    }

    pub fn with_schema(mut self, resolver: impl SchemaResolver + 'static) -> Self {
        self.schemas.push(Box::new(resolver));
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn codec::Codec>) -> Self {
        self.codecs.register(codec);
        self
    }

    pub fn with_caller(mut self, caller: Arc<dyn transport::Caller>) -> Self {
        self.callers.register(caller);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn Listener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Resolves definitions and schemas, validates the manifest, compiles
    /// every flow and proxy and registers the endpoints on their listeners.
    pub fn build(self) -> Result<Engine, Error> {
        let mut manifest = Manifest::default();
        for resolver in &self.definitions {
            manifest.merge(resolver.resolve()?)?;
        }

        let mut services = ServiceStore::new();
        for service in std::mem::take(&mut manifest.services) {
            services.add(service)?;
        }
        for resolver in &self.schemas {
            resolver.resolve(&mut services)?;
        }
        manifest.services = services.into_services();

        dependencies::resolve_manifest(&manifest)?;

        let managers = manifest
            .flows
            .iter()
            .map(|flow| flow as &dyn FlowManager)
            .chain(manifest.proxy.iter().map(|proxy| proxy as &dyn FlowManager));

        let mut flows: HashMap<String, Arc<Manager>> = HashMap::new();
        for spec in managers {
            let calls = self.compile_calls(&manifest, spec)?;
            flows.insert(
                spec.name().to_string(),
                Arc::new(Manager::new(spec, calls)?),
            );
        }

        let mut grouped: HashMap<String, Vec<Endpoint>> = HashMap::new();
        for spec in &manifest.endpoints {
            let endpoint = self.build_endpoint(&manifest, &flows, spec)?;
            grouped.entry(spec.listener.clone()).or_default().push(endpoint);
        }

        for listener in &self.listeners {
            let endpoints = grouped.remove(listener.name()).unwrap_or_default();
            listener.handle(endpoints)?;
        }

        if let Some(listener) = grouped.keys().next() {
            return Err(TransportError::Unknown(listener.clone()).into());
        }

        Ok(Engine {
            listeners: self.listeners,
            flows,
        })
    }

    fn compile_calls(
        &self,
        manifest: &Manifest,
        spec: &dyn FlowManager,
    ) -> Result<HashMap<String, NodeCalls>, Error> {
        let mut result = HashMap::with_capacity(spec.nodes().len());

        for node in spec.nodes() {
            let mut calls = NodeCalls::default();

            if let Some(call) = &node.call {
                calls.call = Some(self.build_service_call(manifest, &node.name, call)?);
            }

            if let Some(rollback) = &node.rollback {
                calls.rollback = Some(self.build_service_call(manifest, &node.name, rollback)?);
            }

            result.insert(node.name.clone(), calls);
        }

        Ok(result)
    }

    fn build_service_call(
        &self,
        manifest: &Manifest,
        node: &str,
        call: &specs::Call,
    ) -> Result<Arc<ServiceCall>, Error> {
        let service = manifest.service(&call.service).ok_or_else(|| {
            specs::ResolveError::UnknownReference {
                from: node.to_string(),
                to: call.service.clone(),
            }
        })?;

        let caller = self.callers.get(&service.transport)?;
        let transport = caller.dial(service)?;

        let method = match call.method.is_empty() {
            true => None,
            false => Some(
                transport
                    .method(&call.method)
                    .ok_or_else(|| TransportError::UnknownMethod(call.method.clone()))?,
            ),
        };

        let codec = self.codecs.get(&service.codec)?;
        let mut service_call = ServiceCall::new(node, transport, method);

        if let Some(request) = &call.request {
            let resource = format!("{node}.request");
            service_call = service_call.with_request(
                request
                    .property
                    .as_ref()
                    .map(|_| codec.manager(&resource, request))
                    .transpose()?,
                build_header(format!("{node}.request"), request),
            );
        }

        if let Some(response) = &call.response {
            let resource = format!("{node}.response");
            service_call = service_call.with_response(
                response
                    .property
                    .as_ref()
                    .map(|_| codec.manager(&resource, response))
                    .transpose()?,
                build_header(format!("{node}.header"), response),
            );
        }

        Ok(Arc::new(service_call))
    }

    fn build_endpoint(
        &self,
        manifest: &Manifest,
        flows: &HashMap<String, Arc<Manager>>,
        spec: &specs::Endpoint,
    ) -> Result<Endpoint, Error> {
        let manager = manifest.flow_manager(&spec.flow).ok_or_else(|| {
            specs::ResolveError::UnknownReference {
                from: "endpoints".to_string(),
                to: spec.flow.clone(),
            }
        })?;

        // compiled alongside the manifest's flow managers above
        let Some(flow) = flows.get(manager.name()).cloned() else {
            return Err(specs::ResolveError::UnknownReference {
                from: "endpoints".to_string(),
                to: spec.flow.clone(),
            }
            .into());
        };

        let codec = self.codecs.get(spec.options.get_or(CODEC_OPTION, "json"))?;
        let mut endpoint = Endpoint::new(flow, spec.options.clone());

        if let Some(input) = manager.input() {
            endpoint = endpoint
                .with_request(
                    input
                        .property
                        .as_ref()
                        .map(|_| codec.manager(specs::INPUT_RESOURCE, input))
                        .transpose()?,
                    build_header(specs::INPUT_RESOURCE.to_string(), input),
                )
                .with_capacity(input.size());
        }

        if let Some(output) = manager.output() {
            endpoint = endpoint.with_response(
                output
                    .property
                    .as_ref()
                    .map(|_| codec.manager("output", output))
                    .transpose()?,
                build_header("output".to_string(), output),
            );
        }

        if let Some(forward) = manager.forward() {
            let service = manifest.service(&forward.service).ok_or_else(|| {
                specs::ResolveError::UnknownReference {
                    from: manager.name().to_string(),
                    to: forward.service.clone(),
                }
            })?;

            let caller = self.callers.get(&service.transport)?;
            endpoint = endpoint.with_forward(caller.dial(service)?);
        }

        Ok(endpoint)
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn build_header(resource: String, params: &specs::ParameterMap) -> Option<HeaderManager> {
    let manager = HeaderManager::new(resource, params);
    if manager.is_empty() {
        return None;
    }

    Some(manager)
}

/// A built engine: compiled flows bound to their listeners.
pub struct Engine {
    listeners: Vec<Arc<dyn Listener>>,
    flows: HashMap<String, Arc<Manager>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field(
                "listeners",
                &self.listeners.iter().map(|l| l.name()).collect::<Vec<_>>(),
            )
            .field("flows", &self.flows.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Engine {
    /// Looks up a compiled flow for programmatic execution.
    pub fn flow(&self, name: &str) -> Option<Arc<Manager>> {
        self.flows.get(name).cloned()
    }

    /// Serves every registered listener until the engine is closed.
    pub async fn serve(&self) -> Result<(), Error> {
        tracing::info!(listeners = self.listeners.len(), "engine serving");

        futures::future::try_join_all(
            self.listeners.iter().map(|listener| listener.serve()),
        )
        .await?;

        Ok(())
    }

    /// Closes listeners in reverse registration order.
    pub async fn close(&self) {
        for listener in self.listeners.iter().rev() {
            listener.close().await;
        }
    }

    /// Executes a flow by name outside any listener, returning the store
    /// populated with its outputs.
    pub async fn run(
        &self,
        ctx: &CancellationToken,
        name: &str,
        store: Arc<refs::Store>,
    ) -> Result<(), Error> {
        let Some(flow) = self.flow(name) else {
            return Err(specs::ResolveError::UnknownReference {
                from: "run".to_string(),
                to: name.to_string(),
            }
            .into());
        };

        flow.run(ctx, store).await
    }
}

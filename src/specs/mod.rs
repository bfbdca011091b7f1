//! # Specification Model
//!
//! Immutable, request-independent description of manifests, flows, proxies,
//! nodes, service calls and their typed properties. The engine only ever
//! interacts with this model through the small capability surface exposed by
//! [`FlowManager`] and the lookup helpers on [`Manifest`]; the concrete
//! definition sources (definition resolvers, schema resolvers) produce it
//! once at load time and it is shared read-only afterwards.
//!
//! Properties may carry a [`PropertyReference`] pointing at a
//! `(resource, path)` pair inside the per-request reference store. These
//! references are what thread data between nodes: the codec layer resolves
//! them at marshal time, and the dependency resolver derives implicit
//! scheduling edges from them.

pub mod dependencies;
pub mod types;

pub use dependencies::ResolveError;
pub use types::{Label, Type};

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Option key holding the endpoint path of a method or endpoint.
pub const ENDPOINT_OPTION: &str = "endpoint";
/// Option key holding the request method of a method or endpoint.
pub const METHOD_OPTION: &str = "method";
/// Option key selecting the codec of an endpoint.
pub const CODEC_OPTION: &str = "codec";
/// Option key holding a per-call timeout in milliseconds.
pub const TIMEOUT_OPTION: &str = "timeout_ms";

/// Reserved resource names which never resolve to a node.
pub const INPUT_RESOURCE: &str = "input";
pub const ERROR_RESOURCE: &str = "error";

/// Joins a path prefix and a key into a dotted, root-relative path.
pub fn join_path(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        return key.to_string();
    }

    if key.is_empty() {
        return prefix.to_string();
    }

    format!("{prefix}.{key}")
}

/// Returns `path` relative to `base`, used when descending into the
/// sub-stores of a repeated cell.
pub fn relative_path(base: &str, path: &str) -> String {
    if base.is_empty() {
        return path.to_string();
    }

    if base == path {
        return String::new();
    }

    match path.strip_prefix(base) {
        Some(rest) if rest.starts_with('.') => rest[1..].to_string(),
        _ => path.to_string(),
    }
}

/// A reference to a value stored inside the per-request reference store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PropertyReference {
    pub resource: String,
    pub path: String,
}

impl PropertyReference {
    pub fn new(resource: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            path: path.into(),
        }
    }

    /// Parses a `resource:path` string, the syntax used inside definitions.
    pub fn parse(raw: &str) -> Option<Self> {
        let (resource, path) = raw.split_once(':')?;
        if resource.is_empty() {
            return None;
        }

        Some(Self::new(resource, path))
    }
}

impl fmt::Display for PropertyReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource, self.path)
    }
}

/// Symbolic names and ordinals of an enum type.
#[derive(Debug, Clone, Default)]
pub struct EnumSchema {
    pub name: String,
    positions: HashMap<String, i32>,
    names: HashMap<i32, String>,
}

impl EnumSchema {
    pub fn new(name: impl Into<String>, variants: &[(&str, i32)]) -> Self {
        let mut positions = HashMap::with_capacity(variants.len());
        let mut names = HashMap::with_capacity(variants.len());

        for (variant, position) in variants {
            positions.insert((*variant).to_string(), *position);
            names.insert(*position, (*variant).to_string());
        }

        Self {
            name: name.into(),
            positions,
            names,
        }
    }

    pub fn position(&self, name: &str) -> Option<i32> {
        self.positions.get(name).copied()
    }

    pub fn name_of(&self, position: i32) -> Option<&str> {
        self.names.get(&position).map(String::as_str)
    }
}

/// A typed tree node representing one field of a message.
#[derive(Debug, Clone, Default)]
pub struct Property {
    pub name: String,
    /// Dotted, root-relative path, e.g. `nested.value`.
    pub path: String,
    pub typ: Type,
    pub label: Label,
    pub default: Option<Value>,
    pub reference: Option<PropertyReference>,
    /// Child properties, only meaningful when `typ` is [`Type::Message`].
    pub nested: HashMap<String, Property>,
    /// Enum variants, only meaningful when `typ` is [`Type::Enum`].
    pub variants: Option<Arc<EnumSchema>>,
}

impl Property {
    /// Constructs a scalar property rooted at its own name.
    pub fn scalar(name: impl Into<String>, typ: Type) -> Self {
        let name = name.into();

        Self {
            path: name.clone(),
            name,
            typ,
            ..Self::default()
        }
    }

    /// Constructs a message property and re-roots the children below it.
    pub fn message(name: impl Into<String>, children: Vec<Property>) -> Self {
        let name = name.into();
        let mut property = Self {
            path: name.clone(),
            name,
            typ: Type::Message,
            ..Self::default()
        };

        for mut child in children {
            child.reroot(&property.path);
            property.nested.insert(child.name.clone(), child);
        }

        property
    }

    /// Constructs the anonymous message property used as a parameter map root.
    pub fn root(children: Vec<Property>) -> Self {
        let mut property = Self {
            typ: Type::Message,
            ..Self::default()
        };

        for mut child in children {
            child.reroot("");
            property.nested.insert(child.name.clone(), child);
        }

        property
    }

    pub fn with_label(mut self, label: Label) -> Self {
        self.label = label;
        self
    }

    /// Attaches a default value, inferring the wire type when possible.
    pub fn with_default(mut self, value: Value) -> Self {
        if let Some(typ) = Type::infer(&value) {
            self.typ = typ;
        }

        self.default = Some(value);
        self
    }

    pub fn with_reference(mut self, resource: impl Into<String>, path: impl Into<String>) -> Self {
        self.reference = Some(PropertyReference::new(resource, path));
        self
    }

    pub fn with_variants(mut self, variants: Arc<EnumSchema>) -> Self {
        self.typ = Type::Enum;
        self.variants = Some(variants);
        self
    }

    /// Rewrites the paths of this property and its children below `prefix`.
    pub fn reroot(&mut self, prefix: &str) {
        self.path = join_path(prefix, &self.name);
        for child in self.nested.values_mut() {
            child.reroot(&self.path);
        }
    }

    /// Collects every property reference in this tree.
    pub fn references(&self, into: &mut Vec<PropertyReference>) {
        if let Some(reference) = &self.reference {
            into.push(reference.clone());
        }

        for child in self.nested.values() {
            child.references(into);
        }
    }

    /// Number of properties in this tree, used as a store capacity hint.
    pub fn size(&self) -> usize {
        1 + self.nested.values().map(Property::size).sum::<usize>()
    }
}

/// A named set of properties associated with one direction of a call.
#[derive(Debug, Clone, Default)]
pub struct ParameterMap {
    pub header: HashMap<String, Property>,
    pub property: Option<Property>,
}

impl ParameterMap {
    pub fn new(property: Property) -> Self {
        Self {
            header: HashMap::new(),
            property: Some(property),
        }
    }

    pub fn with_header(mut self, property: Property) -> Self {
        self.header.insert(property.name.clone(), property);
        self
    }

    /// Collects every property reference inside the body and header trees.
    pub fn references(&self) -> Vec<PropertyReference> {
        let mut result = Vec::new();

        for property in self.header.values() {
            property.references(&mut result);
        }

        if let Some(property) = &self.property {
            property.references(&mut result);
        }

        result
    }

    /// Number of properties described, used as a store capacity hint.
    pub fn size(&self) -> usize {
        self.header.len() + self.property.as_ref().map_or(0, Property::size)
    }
}

/// A downstream service invocation attached to a node.
#[derive(Debug, Clone, Default)]
pub struct Call {
    pub service: String,
    pub method: String,
    pub request: Option<ParameterMap>,
    pub response: Option<ParameterMap>,
}

impl Call {
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            request: None,
            response: None,
        }
    }

    pub fn with_request(mut self, request: ParameterMap) -> Self {
        self.request = Some(request);
        self
    }

    pub fn with_response(mut self, response: ParameterMap) -> Self {
        self.response = Some(response);
        self
    }
}

/// A unit of work inside a flow.
#[derive(Debug, Clone, Default)]
pub struct Node {
    pub name: String,
    pub call: Option<Call>,
    pub rollback: Option<Call>,
    /// Explicit edges beyond the ones implied by property references.
    pub depends_on: Vec<String>,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_call(mut self, call: Call) -> Self {
        self.call = Some(call);
        self
    }

    pub fn with_rollback(mut self, rollback: Call) -> Self {
        self.rollback = Some(rollback);
        self
    }

    pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
        self.depends_on.push(name.into());
        self
    }

    /// Union of the property references of the call and rollback requests.
    pub fn references(&self) -> Vec<PropertyReference> {
        let mut result = Vec::new();

        for call in [&self.call, &self.rollback].into_iter().flatten() {
            if let Some(request) = &call.request {
                result.extend(request.references());
            }
        }

        result
    }
}

/// Pass-through target of a proxy.
#[derive(Debug, Clone)]
pub struct Forward {
    pub service: String,
}

/// Capability surface shared by flows and proxies. The scheduler and the
/// endpoint dispatcher only ever see this trait.
pub trait FlowManager: Send + Sync {
    fn name(&self) -> &str;
    fn nodes(&self) -> &[Node];
    /// Declared inter-flow dependencies.
    fn dependencies(&self) -> &[String];
    fn input(&self) -> Option<&ParameterMap>;
    fn output(&self) -> Option<&ParameterMap>;
    fn forward(&self) -> Option<&Forward> {
        None
    }
}

/// A named DAG of nodes with input/output shaping.
#[derive(Debug, Clone, Default)]
pub struct Flow {
    pub name: String,
    pub input: Option<ParameterMap>,
    pub output: Option<ParameterMap>,
    pub nodes: Vec<Node>,
    pub depends_on: Vec<String>,
}

impl Flow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_input(mut self, input: ParameterMap) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_output(mut self, output: ParameterMap) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn with_dependency(mut self, name: impl Into<String>) -> Self {
        self.depends_on.push(name.into());
        self
    }
}

impl FlowManager for Flow {
    fn name(&self) -> &str {
        &self.name
    }

    fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    fn dependencies(&self) -> &[String] {
        &self.depends_on
    }

    fn input(&self) -> Option<&ParameterMap> {
        self.input.as_ref()
    }

    fn output(&self) -> Option<&ParameterMap> {
        self.output.as_ref()
    }
}

/// A flow variant forwarding the inbound body unchanged to a downstream
/// service once its node DAG has completed.
#[derive(Debug, Clone)]
pub struct Proxy {
    pub name: String,
    pub forward: Forward,
    pub nodes: Vec<Node>,
    pub depends_on: Vec<String>,
}

impl Proxy {
    pub fn new(name: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            forward: Forward {
                service: service.into(),
            },
            nodes: Vec::new(),
            depends_on: Vec::new(),
        }
    }

    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }
}

impl FlowManager for Proxy {
    fn name(&self) -> &str {
        &self.name
    }

    fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    fn dependencies(&self) -> &[String] {
        &self.depends_on
    }

    fn input(&self) -> Option<&ParameterMap> {
        None
    }

    fn output(&self) -> Option<&ParameterMap> {
        None
    }

    fn forward(&self) -> Option<&Forward> {
        Some(&self.forward)
    }
}

/// Free-form key/value options attached to services, methods and endpoints.
#[derive(Debug, Clone, Default)]
pub struct Options(HashMap<String, String>);

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }
}

/// A callable method of a service.
#[derive(Debug, Clone)]
pub struct Method {
    pub name: String,
    pub options: Options,
}

impl Method {
    pub fn new(name: impl Into<String>, options: Options) -> Self {
        Self {
            name: name.into(),
            options,
        }
    }
}

/// A downstream service description.
#[derive(Debug, Clone, Default)]
pub struct Service {
    pub name: String,
    pub package: String,
    pub host: String,
    /// Transport plugin name, e.g. `http`.
    pub transport: String,
    /// Codec plugin name, e.g. `json`.
    pub codec: String,
    pub methods: Vec<Method>,
    pub options: Options,
}

impl Service {
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            transport: "http".to_string(),
            codec: "json".to_string(),
            ..Self::default()
        }
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.methods.push(method);
        self
    }

    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.iter().find(|method| method.name == name)
    }
}

/// Binds a flow to a listener under the given options.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub flow: String,
    pub listener: String,
    pub options: Options,
}

impl Endpoint {
    pub fn new(
        flow: impl Into<String>,
        listener: impl Into<String>,
        options: Options,
    ) -> Self {
        Self {
            flow: flow.into(),
            listener: listener.into(),
            options,
        }
    }
}

/// Collection of services filled by schema resolvers at load time.
#[derive(Debug, Clone, Default)]
pub struct ServiceStore {
    services: HashMap<String, Service>,
}

impl ServiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, service: Service) -> Result<(), ResolveError> {
        if self.services.contains_key(&service.name) {
            return Err(ResolveError::DuplicateDefinition {
                name: service.name,
            });
        }

        self.services.insert(service.name.clone(), service);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    pub fn into_services(self) -> Vec<Service> {
        self.services.into_values().collect()
    }
}

/// The immutable collection of flows, proxies, services and endpoints that
/// defines the engine's behavior for a deployment.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    pub flows: Vec<Flow>,
    pub proxy: Vec<Proxy>,
    pub services: Vec<Service>,
    pub endpoints: Vec<Endpoint>,
}

impl Manifest {
    /// Merges another manifest into this one. Flow, proxy and service names
    /// must stay unique across the union.
    pub fn merge(&mut self, other: Manifest) -> Result<(), ResolveError> {
        for flow in other.flows {
            if self.flow_manager(&flow.name).is_some() {
                return Err(ResolveError::DuplicateDefinition { name: flow.name });
            }

            self.flows.push(flow);
        }

        for proxy in other.proxy {
            if self.flow_manager(&proxy.name).is_some() {
                return Err(ResolveError::DuplicateDefinition { name: proxy.name });
            }

            self.proxy.push(proxy);
        }

        for service in other.services {
            if self.service(&service.name).is_some() {
                return Err(ResolveError::DuplicateDefinition {
                    name: service.name,
                });
            }

            self.services.push(service);
        }

        self.endpoints.extend(other.endpoints);
        Ok(())
    }

    /// Looks up a flow or proxy by name.
    pub fn flow_manager(&self, name: &str) -> Option<&dyn FlowManager> {
        if let Some(flow) = self.flows.iter().find(|flow| flow.name == name) {
            return Some(flow);
        }

        self.proxy
            .iter()
            .find(|proxy| proxy.name == name)
            .map(|proxy| proxy as &dyn FlowManager)
    }

    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.iter().find(|service| service.name == name)
    }
}

//! # Codec plugins
//!
//! A codec converts between an opaque wire byte stream and the per-request
//! reference store, guided by a property schema. Codecs are strategy plugins
//! held in a name-keyed [`Registry`]; the engine never interprets payload
//! bytes itself and transports never look inside them.
//!
//! Implementations provide a [`Codec`] constructor producing one
//! [`Manager`] per `(resource, parameter map)` pair. Managers are built once
//! at load time and reused across requests.

#[cfg(feature = "codec-json")]
pub mod json;

#[cfg(feature = "codec-json")]
pub use json::JsonCodec;

use crate::refs::{Cell, Store};
use crate::specs::{ParameterMap, Property, Type};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Per-request codec failures, surfaced to listeners as client errors.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("type mismatch at '{path}': expected {expected}, found {found}")]
    TypeMismatch {
        path: String,
        expected: Type,
        found: String,
    },

    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("no message definition for resource '{0}'")]
    MissingDefinition(String),

    #[error("no codec registered under '{0}'")]
    Unknown(String),
}

/// Constructs codec managers for a given resource and parameter map.
pub trait Codec: Send + Sync {
    /// Registry name of this codec, e.g. `json`.
    fn name(&self) -> &'static str;

    fn manager(
        &self,
        resource: &str,
        params: &ParameterMap,
    ) -> Result<Arc<dyn Manager>, CodecError>;
}

impl std::fmt::Debug for dyn Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Codec({})", self.name())
    }
}

/// Encodes and decodes messages for one resource.
pub trait Manager: Send + Sync {
    /// Walks the parameter map and emits the wire form of the values held by
    /// the given store; properties resolve their reference first and fall
    /// back to their default.
    fn marshal(&self, store: &Store) -> Result<Vec<u8>, CodecError>;

    /// Decodes the wire form into the store under the manager's resource.
    /// Unknown fields are ignored.
    fn unmarshal(&self, payload: &[u8], store: &Store) -> Result<(), CodecError>;
}

/// Name-keyed codec registry.
#[derive(Default)]
pub struct Registry {
    codecs: HashMap<&'static str, Arc<dyn Codec>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, codec: Arc<dyn Codec>) {
        self.codecs.insert(codec.name(), codec);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Codec>, CodecError> {
        self.codecs
            .get(name)
            .cloned()
            .ok_or_else(|| CodecError::Unknown(name.to_string()))
    }
}

/// Resolves header parameter maps to and from flat string maps. Headers
/// follow the same reference-then-default rule as body properties but are
/// always carried as strings on the wire.
#[derive(Debug, Clone)]
pub struct HeaderManager {
    resource: String,
    params: HashMap<String, Property>,
}

impl HeaderManager {
    pub fn new(resource: impl Into<String>, params: &ParameterMap) -> Self {
        Self {
            resource: resource.into(),
            params: params.header.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Resolves every header property into its wire string.
    pub fn marshal(&self, store: &Store) -> HashMap<String, String> {
        let mut result = HashMap::with_capacity(self.params.len());

        for (name, property) in &self.params {
            let value = match &property.reference {
                Some(reference) => store
                    .load(&reference.resource, &reference.path)
                    .and_then(|cell| match &*cell {
                        Cell::Scalar(value) => Some(stringify(value)),
                        Cell::Ordinal(position) => property
                            .variants
                            .as_ref()
                            .and_then(|variants| variants.name_of(*position))
                            .map(str::to_string),
                        Cell::Repeated(_) => None,
                    }),
                None => property.default.as_ref().map(stringify),
            };

            if let Some(value) = value {
                result.insert(name.clone(), value);
            }
        }

        result
    }

    /// Writes every matched inbound header into the store under the
    /// manager's resource. Header names compare case-insensitively.
    pub fn unmarshal(&self, headers: &HashMap<String, String>, store: &Store) {
        for (name, property) in &self.params {
            let value = headers
                .iter()
                .find(|(header, _)| header.eq_ignore_ascii_case(name))
                .map(|(_, value)| value);

            if let Some(value) = value {
                store.store(
                    &self.resource,
                    &property.path,
                    serde_json::Value::String(value.clone()),
                );
            }
        }
    }
}

fn stringify(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(value) => value.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::specs::ParameterMap;
    use serde_json::json;

    fn header_params() -> ParameterMap {
        ParameterMap::default()
            .with_header(
                Property::scalar("Authorization", Type::String)
                    .with_reference("input", "token"),
            )
            .with_header(
                Property::scalar("X-Origin", Type::String).with_default(json!("engine")),
            )
    }

    #[test]
    fn test_header_marshal_reference_and_default() {
        let store = Store::new(1);
        store.store("input", "token", json!("Bearer abc"));

        let manager = HeaderManager::new("input", &header_params());
        let headers = manager.marshal(&store);

        assert_eq!(headers.get("Authorization").unwrap(), "Bearer abc");
        assert_eq!(headers.get("X-Origin").unwrap(), "engine");
    }

    #[test]
    fn test_header_marshal_skips_unresolved() {
        let manager = HeaderManager::new("input", &header_params());
        let headers = manager.marshal(&Store::new(0));

        assert!(!headers.contains_key("Authorization"));
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn test_header_unmarshal_case_insensitive() {
        let params = ParameterMap::default().with_header(Property::scalar(
            "Content-Signature",
            Type::String,
        ));

        let manager = HeaderManager::new("first.header", &params);
        let store = Store::new(1);
        let mut headers = HashMap::new();
        headers.insert("content-signature".to_string(), "sig".to_string());

        manager.unmarshal(&headers, &store);

        let cell = store.load("first.header", "Content-Signature").unwrap();
        assert_eq!(cell.as_value(), Some(&json!("sig")));
    }

    #[test]
    fn test_registry_lookup() {
        let registry = Registry::new();
        assert!(matches!(
            registry.get("missing").unwrap_err(),
            CodecError::Unknown(name) if name == "missing"
        ));
    }
}

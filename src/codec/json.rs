//! JSON reference codec.
//!
//! Emits objects whose keys match property names. Marshaling resolves each
//! property through its reference first and falls back to its default;
//! properties that resolve to nothing are omitted. Unmarshaling validates
//! decoded kinds against the property types and ignores unknown fields.
//!
//! 64-bit integers are emitted as native JSON numbers: the underlying
//! serializer preserves the full `i64`/`u64` range losslessly, so no quoting
//! is applied.
//!
//! Repeated cells own sub-stores keyed relative to their element root. While
//! walking into a repeated property the codec therefore translates the
//! root-relative paths of the schema into element-relative paths, both for
//! the reference space (stripping the repeated property's reference path)
//! and for the schema space (stripping the repeated property's own path).

use super::{Codec, CodecError, Manager};
use crate::refs::{Cell, Store};
use crate::specs::{
    self, Label, ParameterMap, Property, PropertyReference, Type, relative_path,
};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Constructor for JSON codec managers.
#[derive(Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn manager(
        &self,
        resource: &str,
        params: &ParameterMap,
    ) -> Result<Arc<dyn Manager>, CodecError> {
        let Some(root) = params.property.clone() else {
            return Err(CodecError::MissingDefinition(resource.to_string()));
        };

        Ok(Arc::new(JsonManager {
            resource: resource.to_string(),
            root,
        }))
    }
}

struct JsonManager {
    resource: String,
    root: Property,
}

impl Manager for JsonManager {
    fn marshal(&self, store: &Store) -> Result<Vec<u8>, CodecError> {
        let scope = Scope::root(store);
        let object = encode_message(&self.root, &scope)?;

        serde_json::to_vec(&Value::Object(object)).map_err(CodecError::from)
    }

    fn unmarshal(&self, payload: &[u8], store: &Store) -> Result<(), CodecError> {
        let value: Value = serde_json::from_slice(payload)?;
        let object = match value {
            Value::Object(object) => object,
            other => return Err(mismatch(&self.root.path, Type::Message, &other)),
        };

        decode_message(&self.root, object, store, &self.resource, "")
    }
}

/// Resolution context while encoding. At the root, lookups require explicit
/// references; inside a repeated element, lookups hit the element sub-store
/// with translated paths.
struct Scope<'a> {
    store: &'a Store,
    resource: &'a str,
    ref_base: &'a str,
    prop_base: &'a str,
    element: bool,
}

impl<'a> Scope<'a> {
    fn root(store: &'a Store) -> Self {
        Self {
            store,
            resource: "",
            ref_base: "",
            prop_base: "",
            element: false,
        }
    }

    fn lookup(&self, property: &Property) -> Option<Arc<Cell>> {
        match (&property.reference, self.element) {
            (Some(reference), false) => self.store.load(&reference.resource, &reference.path),
            (Some(reference), true) => self.store.load(
                &reference.resource,
                &relative_path(self.ref_base, &reference.path),
            ),
            (None, true) => self.store.load(
                self.resource,
                &relative_path(self.prop_base, &property.path),
            ),
            // no reference outside a repeated element: defaults only
            (None, false) => None,
        }
    }
}

fn encode_message(property: &Property, scope: &Scope<'_>) -> Result<Map<String, Value>, CodecError> {
    let mut object = Map::new();

    for child in property.nested.values() {
        if let Some(value) = encode_property(child, scope)? {
            object.insert(child.name.clone(), value);
        }
    }

    Ok(object)
}

fn encode_property(property: &Property, scope: &Scope<'_>) -> Result<Option<Value>, CodecError> {
    if property.label == Label::Repeated {
        return encode_repeated(property, scope);
    }

    match property.typ {
        Type::Message => {
            let object = encode_message(property, scope)?;
            if object.is_empty() {
                return Ok(None);
            }

            Ok(Some(Value::Object(object)))
        }
        _ => encode_scalar(property, scope),
    }
}

fn encode_scalar(property: &Property, scope: &Scope<'_>) -> Result<Option<Value>, CodecError> {
    let Some(cell) = scope.lookup(property) else {
        return Ok(property.default.clone());
    };

    match &*cell {
        Cell::Scalar(value) => Ok(Some(value.clone())),
        Cell::Ordinal(position) => Ok(property
            .variants
            .as_ref()
            .and_then(|variants| variants.name_of(*position))
            .map(|name| Value::String(name.to_string()))),
        Cell::Repeated(_) => Ok(None),
    }
}

fn encode_repeated(property: &Property, scope: &Scope<'_>) -> Result<Option<Value>, CodecError> {
    let Some(cell) = scope.lookup(property) else {
        return Ok(None);
    };

    let Some(stores) = cell.as_repeated() else {
        return Ok(None);
    };

    // Element sub-stores are keyed relative to these bases.
    let resource = match &property.reference {
        Some(PropertyReference { resource, .. }) => resource.clone(),
        None => scope.resource.to_string(),
    };
    let ref_base = match &property.reference {
        Some(reference) => reference.path.clone(),
        None => specs::join_path(
            scope.ref_base,
            &relative_path(scope.prop_base, &property.path),
        ),
    };

    let mut items = Vec::with_capacity(stores.len());
    for store in stores {
        let element = Scope {
            store: store.as_ref(),
            resource: &resource,
            ref_base: &ref_base,
            prop_base: &property.path,
            element: true,
        };

        match property.typ {
            Type::Message => items.push(Value::Object(encode_message(property, &element)?)),
            _ => {
                let value = store
                    .load(&resource, "")
                    .and_then(|cell| cell.as_value().cloned());

                if let Some(value) = value {
                    items.push(value);
                }
            }
        }
    }

    Ok(Some(Value::Array(items)))
}

fn decode_message(
    property: &Property,
    object: Map<String, Value>,
    store: &Store,
    resource: &str,
    base: &str,
) -> Result<(), CodecError> {
    for (key, value) in object {
        // unknown fields are ignored on ingress
        let Some(child) = property.nested.get(&key) else {
            continue;
        };

        decode_property(child, value, store, resource, base)?;
    }

    Ok(())
}

fn decode_property(
    property: &Property,
    value: Value,
    store: &Store,
    resource: &str,
    base: &str,
) -> Result<(), CodecError> {
    if value.is_null() {
        return Ok(());
    }

    if property.label == Label::Repeated {
        return decode_repeated(property, value, store, resource, base);
    }

    match property.typ {
        Type::Message => {
            let object = match value {
                Value::Object(object) => object,
                other => return Err(mismatch(&property.path, Type::Message, &other)),
            };

            decode_message(property, object, store, resource, base)
        }
        Type::Enum => {
            let position = value
                .as_str()
                .and_then(|name| property.variants.as_ref()?.position(name))
                .ok_or_else(|| mismatch(&property.path, Type::Enum, &value))?;

            store.store_cell(
                resource,
                &relative_path(base, &property.path),
                Cell::Ordinal(position),
            );
            Ok(())
        }
        typ => {
            if !typ.accepts(&value) {
                return Err(mismatch(&property.path, typ, &value));
            }

            store.store(resource, &relative_path(base, &property.path), value);
            Ok(())
        }
    }
}

fn decode_repeated(
    property: &Property,
    value: Value,
    store: &Store,
    resource: &str,
    base: &str,
) -> Result<(), CodecError> {
    let items = match value {
        Value::Array(items) => items,
        other => return Err(mismatch(&property.path, property.typ, &other)),
    };

    let mut stores = Vec::with_capacity(items.len());
    for item in items {
        let element = Store::new(property.nested.len().max(1));

        match property.typ {
            Type::Message => {
                let object = match item {
                    Value::Object(object) => object,
                    other => return Err(mismatch(&property.path, Type::Message, &other)),
                };

                decode_message(property, object, &element, resource, &property.path)?;
            }
            typ => {
                if !typ.accepts(&item) {
                    return Err(mismatch(&property.path, typ, &item));
                }

                element.store(resource, "", item);
            }
        }

        stores.push(Arc::new(element));
    }

    store.store_cell(
        resource,
        &relative_path(base, &property.path),
        Cell::Repeated(stores),
    );
    Ok(())
}

fn mismatch(path: &str, expected: Type, found: &Value) -> CodecError {
    CodecError::TypeMismatch {
        path: path.to_string(),
        expected,
        found: specs::types::kind_of(found).to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::specs::EnumSchema;
    use serde_json::json;

    /// Parameter map whose properties mirror the input resource, the shape
    /// used by round-trip assertions.
    fn mirrored(children: Vec<Property>) -> ParameterMap {
        fn mirror(property: &mut Property) {
            property.reference = Some(PropertyReference::new("input", property.path.clone()));
            if property.typ == Type::Message && property.label != Label::Repeated {
                // non-repeated messages resolve through their children
                property.reference = None;
            }

            for child in property.nested.values_mut() {
                mirror(child);
            }
        }

        let mut root = Property::root(children);
        for child in root.nested.values_mut() {
            mirror(child);
        }

        ParameterMap::new(root)
    }

    fn manager(params: &ParameterMap) -> Arc<dyn Manager> {
        JsonCodec.manager("input", params).unwrap()
    }

    #[test]
    fn test_marshal_resolves_reference() {
        let params = mirrored(vec![Property::scalar("message", Type::String)]);
        let store = Store::new(1);
        store.store("input", "message", json!("hello"));

        let payload = manager(&params).marshal(&store).unwrap();
        let value: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value, json!({"message": "hello"}));
    }

    #[test]
    fn test_marshal_falls_back_to_default_and_omits_unset() {
        let params = ParameterMap::new(Property::root(vec![
            Property::scalar("origin", Type::String).with_default(json!("engine")),
            Property::scalar("absent", Type::String).with_reference("input", "absent"),
        ]));

        let payload = manager(&params).marshal(&Store::new(0)).unwrap();
        let value: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value, json!({"origin": "engine"}));
    }

    #[test]
    fn test_unmarshal_simple() {
        let params = mirrored(vec![Property::scalar("message", Type::String)]);
        let store = Store::new(1);

        manager(&params)
            .unmarshal(br#"{"message":"hello"}"#, &store)
            .unwrap();

        let cell = store.load("input", "message").unwrap();
        assert_eq!(cell.as_value(), Some(&json!("hello")));
    }

    #[test]
    fn test_unmarshal_ignores_unknown_fields() {
        let params = mirrored(vec![Property::scalar("message", Type::String)]);
        let store = Store::new(1);

        manager(&params)
            .unmarshal(br#"{"message":"hello","extra":1}"#, &store)
            .unwrap();

        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_nested_round_trip() {
        let params = mirrored(vec![Property::message(
            "nested",
            vec![Property::scalar("value", Type::String)],
        )]);

        let manager = manager(&params);
        let store = Store::new(2);
        manager
            .unmarshal(br#"{"nested":{"value":"v"}}"#, &store)
            .unwrap();

        assert_eq!(
            store.load("input", "nested.value").unwrap().as_value(),
            Some(&json!("v"))
        );

        let payload = manager.marshal(&store).unwrap();
        let value: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value, json!({"nested": {"value": "v"}}));
    }

    #[test]
    fn test_repeated_round_trip() {
        let params = mirrored(vec![
            Property::message(
                "repeating",
                vec![Property::scalar("value", Type::String)],
            )
            .with_label(Label::Repeated),
        ]);

        let manager = manager(&params);
        let store = Store::new(1);
        manager
            .unmarshal(br#"{"repeating":[{"value":"a"},{"value":"b"}]}"#, &store)
            .unwrap();

        let cell = store.load("input", "repeating").unwrap();
        let repeated = cell.as_repeated().unwrap();
        assert_eq!(repeated.len(), 2);
        assert_eq!(
            repeated[0].load("input", "value").unwrap().as_value(),
            Some(&json!("a"))
        );
        assert_eq!(
            repeated[1].load("input", "value").unwrap().as_value(),
            Some(&json!("b"))
        );

        let payload = manager.marshal(&store).unwrap();
        let value: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(
            value,
            json!({"repeating": [{"value": "a"}, {"value": "b"}]})
        );
    }

    #[test]
    fn test_repeated_scalars_round_trip() {
        let params = mirrored(vec![
            Property::scalar("tags", Type::String).with_label(Label::Repeated),
        ]);

        let manager = manager(&params);
        let store = Store::new(1);
        manager
            .unmarshal(br#"{"tags":["x","y"]}"#, &store)
            .unwrap();

        let payload = manager.marshal(&store).unwrap();
        let value: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value, json!({"tags": ["x", "y"]}));
    }

    #[test]
    fn test_type_mismatch() {
        let params = mirrored(vec![Property::scalar("message", Type::String)]);

        let err = manager(&params)
            .unmarshal(br#"{"message":42}"#, &Store::new(1))
            .unwrap_err();

        assert!(matches!(
            err,
            CodecError::TypeMismatch { path, expected: Type::String, found }
                if path == "message" && found == "number"
        ));
    }

    #[test]
    fn test_malformed_payload() {
        let params = mirrored(vec![Property::scalar("message", Type::String)]);

        assert!(matches!(
            manager(&params)
                .unmarshal(b"not json", &Store::new(0))
                .unwrap_err(),
            CodecError::Malformed(_)
        ));
    }

    #[test]
    fn test_enum_round_trip() {
        let variants = Arc::new(EnumSchema::new(
            "status",
            &[("PENDING", 0), ("ACTIVE", 1)],
        ));
        let params = mirrored(vec![
            Property::scalar("status", Type::String).with_variants(variants),
        ]);

        let manager = manager(&params);
        let store = Store::new(1);
        manager
            .unmarshal(br#"{"status":"ACTIVE"}"#, &store)
            .unwrap();

        assert_eq!(
            store.load("input", "status").unwrap().as_ordinal(),
            Some(1)
        );

        let payload = manager.marshal(&store).unwrap();
        let value: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value, json!({"status": "ACTIVE"}));

        assert!(matches!(
            manager.unmarshal(br#"{"status":"UNKNOWN"}"#, &store),
            Err(CodecError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_large_integers_survive() {
        let params = mirrored(vec![Property::scalar("count", Type::Int64)]);

        let manager = manager(&params);
        let store = Store::new(1);
        manager
            .unmarshal(br#"{"count":9007199254740993}"#, &store)
            .unwrap();

        let payload = manager.marshal(&store).unwrap();
        let value: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["count"].as_i64(), Some(9_007_199_254_740_993));
    }
}

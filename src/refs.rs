//! # Reference Store
//!
//! Per-request symbolic dataflow space indexed by `(resource, path)`. Nodes
//! write their decoded responses into the store and codecs resolve property
//! references out of it while shaping outgoing messages.
//!
//! The store is shared across every node of a request and must accept
//! concurrent readers and writers; writes at distinct keys never block each
//! other and writes at the same key are last-writer-wins. Ordering between
//! nodes is not the store's concern: values only flow along happens-before
//! edges enforced by the scheduler.
//!
//! Repeated values own an ordered sequence of child stores. Child stores are
//! keyed relative to their element root (the path prefix is reset when
//! descending into an element), leaving path translation to the codecs.

use crate::specs::join_path;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::sync::Arc;

/// A single stored value.
#[derive(Debug)]
pub enum Cell {
    /// A scalar value such as a string, number, boolean or null.
    Scalar(Value),
    /// An ordered sequence of sub-stores, one per repeated element.
    Repeated(Vec<Arc<Store>>),
    /// An enum ordinal.
    Ordinal(i32),
}

impl Cell {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Cell::Scalar(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_repeated(&self) -> Option<&[Arc<Store>]> {
        match self {
            Cell::Repeated(stores) => Some(stores),
            _ => None,
        }
    }

    pub fn as_ordinal(&self) -> Option<i32> {
        match self {
            Cell::Ordinal(position) => Some(*position),
            _ => None,
        }
    }
}

/// Per-request reference store. Created by the endpoint dispatcher for every
/// inbound request and dropped once the response has been written.
#[derive(Debug, Default)]
pub struct Store {
    cells: DashMap<String, Arc<Cell>>,
}

impl Store {
    /// Creates a store sized for roughly `hint` values.
    pub fn new(hint: usize) -> Self {
        Self {
            cells: DashMap::with_capacity(hint),
        }
    }

    fn key(resource: &str, path: &str) -> String {
        format!("{resource}:{path}")
    }

    /// Stores a scalar value, overwriting any prior cell at the key.
    pub fn store(&self, resource: &str, path: &str, value: Value) {
        self.store_cell(resource, path, Cell::Scalar(value));
    }

    /// Stores an arbitrary cell, overwriting any prior cell at the key.
    pub fn store_cell(&self, resource: &str, path: &str, cell: Cell) {
        self.cells
            .insert(Self::key(resource, path), Arc::new(cell));
    }

    /// Recursively flattens a value tree into the store below `prefix`.
    ///
    /// Nested objects extend the path with their key; arrays become repeated
    /// cells owning one sub-store per element, populated with the prefix
    /// reset to the element root.
    pub fn store_values(&self, resource: &str, prefix: &str, values: Map<String, Value>) {
        for (key, value) in values {
            let path = join_path(prefix, &key);

            match value {
                Value::Object(nested) => self.store_values(resource, &path, nested),
                Value::Array(items) => {
                    let stores = items
                        .into_iter()
                        .map(|item| {
                            let store = Store::new(1);
                            match item {
                                Value::Object(element) => {
                                    store.store_values(resource, "", element)
                                }
                                scalar => store.store(resource, "", scalar),
                            }
                            Arc::new(store)
                        })
                        .collect();

                    self.store_cell(resource, &path, Cell::Repeated(stores));
                }
                scalar => self.store(resource, &path, scalar),
            }
        }
    }

    /// Loads the cell at `(resource, path)`, or `None` when unset. Missing
    /// keys are not an error: absent references fall back to defaults during
    /// marshaling.
    pub fn load(&self, resource: &str, path: &str) -> Option<Arc<Cell>> {
        self.cells
            .get(&Self::key(resource, path))
            .map(|cell| cell.value().clone())
    }

    /// Number of cells currently held.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn as_object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[test]
    fn test_store_and_load() {
        let store = Store::new(1);
        store.store("input", "message", json!("hello"));

        let cell = store.load("input", "message").unwrap();
        assert_eq!(cell.as_value(), Some(&json!("hello")));
        assert!(store.load("input", "missing").is_none());
        assert!(store.load("output", "message").is_none());
    }

    #[test]
    fn test_store_overwrites() {
        let store = Store::new(1);
        store.store("input", "message", json!("first"));
        store.store("input", "message", json!("second"));

        let cell = store.load("input", "message").unwrap();
        assert_eq!(cell.as_value(), Some(&json!("second")));
    }

    #[test]
    fn test_load_preserves_cell_identity() {
        let store = Store::new(1);
        store.store("input", "message", json!("hello"));

        let first = store.load("input", "message").unwrap();
        let second = store.load("input", "message").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_store_values_flattens_nested() {
        let store = Store::new(2);
        store.store_values(
            "input",
            "",
            as_object(json!({"nested": {"value": "v"}})),
        );

        let cell = store.load("input", "nested.value").unwrap();
        assert_eq!(cell.as_value(), Some(&json!("v")));
    }

    #[test]
    fn test_store_values_repeated_messages() {
        let store = Store::new(2);
        store.store_values(
            "input",
            "",
            as_object(json!({"repeating": [{"value": "a"}, {"value": "b"}]})),
        );

        let cell = store.load("input", "repeating").unwrap();
        let repeated = cell.as_repeated().unwrap();
        assert_eq!(repeated.len(), 2);

        let first = repeated[0].load("input", "value").unwrap();
        assert_eq!(first.as_value(), Some(&json!("a")));
        let second = repeated[1].load("input", "value").unwrap();
        assert_eq!(second.as_value(), Some(&json!("b")));
    }

    #[test]
    fn test_store_values_repeated_scalars() {
        let store = Store::new(1);
        store.store_values("input", "", as_object(json!({"tags": ["x", "y"]})));

        let cell = store.load("input", "tags").unwrap();
        let repeated = cell.as_repeated().unwrap();
        assert_eq!(repeated.len(), 2);
        assert_eq!(
            repeated[1].load("input", "").unwrap().as_value(),
            Some(&json!("y"))
        );
    }

    #[test]
    fn test_concurrent_writers_at_distinct_keys() {
        let store = Arc::new(Store::new(64));
        let mut handles = Vec::new();

        for worker in 0..8 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                for index in 0..64 {
                    store.store(
                        "input",
                        &format!("{worker}.{index}"),
                        json!(index),
                    );
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.len(), 8 * 64);
    }
}

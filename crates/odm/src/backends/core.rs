//! Core Document Backend Traits
//!
//! These traits are the seam between the model registry and a concrete
//! document database driver. The registry only ever opens connections through
//! a [`DocumentBackend`] handed to it at construction time, so tests and
//! alternative drivers plug in without global state.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::OdmResult;
use crate::schema::{Fields, Schema};

/// Driver options attached to a connection descriptor
pub type ConnectionOptions = BTreeMap<String, Value>;

/// Query filter: field name to expected value, or `{"$in": [...]}`
pub type Filter = Fields;

/// Connection factory
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// Open a connection to the database at `uri`
    async fn open(&self, uri: &str, options: &ConnectionOptions) -> OdmResult<Arc<dyn DocumentConnection>>;

    /// Backend name for logging
    fn name(&self) -> &'static str {
        "DocumentBackend"
    }
}

/// An established connection that models are compiled against
#[async_trait]
pub trait DocumentConnection: Send + Sync + fmt::Debug {
    fn uri(&self) -> &str;

    /// Compile `schema` into a collection named `name` on this connection.
    ///
    /// Registering a name twice on the same connection is an error
    /// (`OdmError::ModelConflict`); the registry never overwrites a model.
    async fn register_model(&self, name: &str, schema: Arc<Schema>) -> OdmResult<Arc<dyn Collection>>;

    /// Collection previously registered under `name`
    fn collection(&self, name: &str) -> Option<Arc<dyn Collection>>;

    /// Names of every model registered on this connection
    fn model_names(&self) -> Vec<String>;
}

/// Storage operations of one compiled model
#[async_trait]
pub trait Collection: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn schema(&self) -> &Arc<Schema>;

    /// Insert a new document and return it as stored
    async fn insert_one(&self, doc: Fields) -> OdmResult<Fields>;

    /// Replace the first document matching `filter`, returning the number replaced
    async fn replace_one(&self, filter: &Filter, doc: Fields) -> OdmResult<u64>;

    /// Documents matching `filter`, in insertion order
    async fn find(&self, filter: &Filter, limit: Option<usize>) -> OdmResult<Vec<Fields>>;

    async fn delete_many(&self, filter: &Filter) -> OdmResult<u64>;

    async fn count(&self, filter: &Filter) -> OdmResult<u64> {
        Ok(self.find(filter, None).await?.len() as u64)
    }
}

/// Check a document against a filter.
///
/// Array-valued fields match when any element matches, as in most document
/// stores; `$in` matches against any of the listed values.
pub fn matches_filter(doc: &Fields, filter: &Filter) -> bool {
    filter.iter().all(|(field, condition)| {
        let actual = doc.get(field).unwrap_or(&Value::Null);
        match condition {
            Value::Object(op) if op.len() == 1 && op.contains_key("$in") => match &op["$in"] {
                Value::Array(candidates) => candidates.iter().any(|c| value_matches(actual, c)),
                _ => false,
            },
            expected => value_matches(actual, expected),
        }
    })
}

fn value_matches(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    match actual {
        Value::Array(items) if !expected.is_array() => items.iter().any(|item| item == expected),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_equality_and_array_containment() {
        let doc = obj(json!({ "username": "testuser", "groupNames": ["a", "b"] }));

        assert!(matches_filter(&doc, &obj(json!({ "username": "testuser" }))));
        assert!(matches_filter(&doc, &obj(json!({ "groupNames": "b" }))));
        assert!(matches_filter(&doc, &obj(json!({ "groupNames": ["a", "b"] }))));
        assert!(!matches_filter(&doc, &obj(json!({ "groupNames": ["a"] }))));
        assert!(!matches_filter(&doc, &obj(json!({ "username": "other" }))));
        assert!(matches_filter(&doc, &Filter::new()));
    }

    #[test]
    fn test_in_operator_and_missing_fields() {
        let doc = obj(json!({ "groupname": "testgroup" }));

        assert!(matches_filter(&doc, &obj(json!({ "groupname": { "$in": ["x", "testgroup"] } }))));
        assert!(!matches_filter(&doc, &obj(json!({ "groupname": { "$in": [] } }))));
        assert!(matches_filter(&doc, &obj(json!({ "missing": null }))));
    }
}

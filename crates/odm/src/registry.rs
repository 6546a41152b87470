//! Model registry
//!
//! Built once from the connection descriptors and the schemas discovered for
//! each of them. The set of qualified names is fixed at construction; only the
//! lazily materialized model inside each entry changes afterwards, and only
//! through its single-flight cell.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use serde_json::Value;

use crate::connection::{ConnectionDescriptor, ConnectionManager};
use crate::error::{ConfigurationError, OdmError, OdmResult};
use crate::flight::SingleFlight;
use crate::id::IdGenerator;
use crate::model::{Document, Model, ModelParts};
use crate::schema::{Schema, SchemaSet};

/// Registration of one model on one connection
pub struct ModelEntry {
    base_name: String,
    qualified_name: String,
    descriptor: Arc<ConnectionDescriptor>,
    schema: Arc<Schema>,
    model: SingleFlight<Model>,
}

impl ModelEntry {
    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    pub fn descriptor(&self) -> &Arc<ConnectionDescriptor> {
        &self.descriptor
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn is_materialized(&self) -> bool {
        self.model.get().is_some()
    }

    /// Number of materialization attempts started, failed ones included
    pub fn materialization_attempts(&self) -> u64 {
        self.model.attempts()
    }
}

impl fmt::Debug for ModelEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelEntry")
            .field("qualified_name", &self.qualified_name)
            .field("connection", &self.descriptor.index())
            .field("model", &self.model)
            .finish()
    }
}

struct RegistryInner {
    manager: Arc<ConnectionManager>,
    entries: BTreeMap<String, ModelEntry>,
}

/// Immutable mapping from qualified model name to lazily materialized model
#[derive(Clone)]
pub struct ModelRegistry {
    inner: Arc<RegistryInner>,
}

impl ModelRegistry {
    /// Create one entry per (descriptor, schema) pair.
    ///
    /// `schemas[i]` holds the definitions discovered for the manager's i-th
    /// descriptor. Every schema is normalized here, so malformed definitions
    /// fail construction rather than first use.
    pub fn build(
        manager: Arc<ConnectionManager>,
        schemas: &[SchemaSet],
        ids: &IdGenerator,
    ) -> Result<Self, ConfigurationError> {
        let mut entries: BTreeMap<String, ModelEntry> = BTreeMap::new();

        for (descriptor, set) in manager.descriptors().iter().zip(schemas) {
            for (base_name, definition) in set.iter() {
                let qualified_name = descriptor.qualify(base_name);
                if let Some(existing) = entries.get(&qualified_name) {
                    return Err(ConfigurationError::DuplicateModelName {
                        name: qualified_name,
                        first: format!("connection #{}", existing.descriptor.index()),
                        second: format!("connection #{}", descriptor.index()),
                    });
                }

                let entry = ModelEntry {
                    base_name: base_name.to_string(),
                    qualified_name: qualified_name.clone(),
                    descriptor: Arc::clone(descriptor),
                    schema: Arc::new(definition.to_schema(ids)),
                    model: SingleFlight::new(),
                };
                entries.insert(qualified_name, entry);
            }
        }

        tracing::debug!(models = ?entries.keys().collect::<Vec<_>>(), "Model registry built");

        Ok(Self {
            inner: Arc::new(RegistryInner { manager, entries }),
        })
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.inner.manager
    }

    pub fn entry(&self, qualified_name: &str) -> Option<&ModelEntry> {
        self.inner.entries.get(qualified_name)
    }

    pub fn contains(&self, qualified_name: &str) -> bool {
        self.inner.entries.contains_key(qualified_name)
    }

    /// Every qualified model name, sorted
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.inner.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Resolve a model, connecting and compiling it on first use.
    ///
    /// Concurrent first calls for the same name share one materialization;
    /// a failed one is reported to all of them and retried by the next call.
    pub async fn get_model(&self, qualified_name: &str) -> OdmResult<Model> {
        let entry = self
            .inner
            .entries
            .get(qualified_name)
            .ok_or_else(|| OdmError::NotFound(qualified_name.to_string()))?;

        let manager = Arc::clone(&self.inner.manager);
        let descriptor = Arc::clone(&entry.descriptor);
        let schema = Arc::clone(&entry.schema);
        let name = entry.base_name.clone();
        let qualified = entry.qualified_name.clone();
        let registry = self.downgrade();

        entry
            .model
            .get_or_init(move || async move {
                let connection = manager.get_connection(&descriptor).await?;
                tracing::debug!(model = %qualified, "Materializing model");
                let collection = connection.register_model(&name, Arc::clone(&schema)).await?;
                Ok(Model::new(ModelParts {
                    name,
                    qualified_name: qualified,
                    namespace: descriptor.namespace().map(str::to_string),
                    schema,
                    collection,
                    registry,
                }))
            })
            .await
    }

    /// Resolve a model and build an unsaved document from `attributes`
    pub async fn document(&self, qualified_name: &str, attributes: Value) -> OdmResult<Document> {
        self.get_model(qualified_name).await?.new_document(attributes)
    }

    pub(crate) fn downgrade(&self) -> WeakRegistry {
        WeakRegistry(Arc::downgrade(&self.inner))
    }
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("entries", &self.inner.entries)
            .finish()
    }
}

/// Non-owning registry handle kept by materialized models
#[derive(Clone)]
pub(crate) struct WeakRegistry(Weak<RegistryInner>);

impl WeakRegistry {
    pub(crate) fn upgrade(&self) -> Option<ModelRegistry> {
        self.0.upgrade().map(|inner| ModelRegistry { inner })
    }
}

impl fmt::Debug for WeakRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WeakRegistry")
    }
}

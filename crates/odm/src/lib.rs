//! # elif-odm
//!
//! Document models for elif.rs applications, bound to one or more lazily
//! established database connections.
//!
//! ## Features
//!
//! - **Deferred connections**: nothing is opened until a model is first used
//! - **Single-flight materialization**: concurrent first uses share one connect
//! - **Namespaces**: several databases behind `namespace/Model` names
//! - **Declarative schemas**: JSON or YAML field maps, or schemas built in code
//! - **Middleware injection**: model and document accessors on any request context
//!
//! ## Runtime
//!
//! Connections and models are initialized on spawned Tokio tasks, so
//! [`Odm::model`], [`Odm::document`] and the injected accessors must be polled
//! inside a Tokio runtime. Outside one they fail with [`OdmError::Driver`]
//! instead of connecting. The middleware types themselves do not depend on
//! the host framework, only on that runtime.
//!
//! ## Quick Start
//!
//! ```rust
//! use elif_odm::{ConnectionConfig, FieldDef, FieldMap, MemoryBackend, Odm, SchemaSet};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let schemas = SchemaSet::new()
//!     .define("Group", FieldMap::new().field("groupname", FieldDef::string().required().unique()))
//!     .unwrap();
//!
//! let odm = Odm::new(
//!     ConnectionConfig::new("memory://localhost/app").schema_set(schemas),
//!     Arc::new(MemoryBackend::new()),
//! )
//! .unwrap();
//!
//! // First use connects and compiles the model
//! let groups = odm.model("Group").await.unwrap();
//! let group = groups.create(json!({ "groupname": "admins" })).await.unwrap();
//! assert!(!group.id().unwrap().is_empty());
//! # });
//! ```

use std::sync::Arc;

use serde_json::Value;

pub mod backends;
pub mod config;
pub mod connection;
pub mod error;
pub mod flight;
pub mod id;
pub mod middleware;
pub mod model;
pub mod registry;
pub mod schema;

pub use backends::{
    matches_filter, Collection, ConnectionOptions, DocumentBackend, DocumentConnection, Filter,
    MemoryBackend, MemoryCollection, MemoryConnection, UNIQUE_INDEXES_OPTION,
};
pub use config::{ConnectionConfig, OdmConfig};
pub use connection::{ConnectionDescriptor, ConnectionManager};
pub use error::{ConfigurationError, OdmError, OdmResult};
pub use id::IdGenerator;
pub use middleware::{
    Middleware, MiddlewarePipeline, ModelAccessors, ModelContext, Next, NextFuture, OdmMiddleware,
};
pub use model::{Document, Find, FindOne, Model};
pub use registry::{ModelEntry, ModelRegistry};
pub use schema::*;

/// Entry point: configuration, schemas and backend bound into one registry
#[derive(Clone, Debug)]
pub struct Odm {
    registry: ModelRegistry,
    accessors: ModelAccessors,
}

impl Odm {
    /// Validate `config`, discover schemas for every connection and build the
    /// registry. No connection is opened.
    pub fn new(
        config: impl Into<OdmConfig>,
        backend: Arc<dyn DocumentBackend>,
    ) -> Result<Self, ConfigurationError> {
        Self::builder(config).backend(backend).build()
    }

    pub fn builder(config: impl Into<OdmConfig>) -> OdmBuilder {
        OdmBuilder {
            config: config.into(),
            backend: None,
            ids: None,
        }
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Resolve a model by qualified name, connecting on first use
    pub async fn model(&self, name: &str) -> OdmResult<Model> {
        self.registry.get_model(name).await
    }

    /// Build an unsaved document of the named model
    pub async fn document(&self, name: &str, attributes: Value) -> OdmResult<Document> {
        self.registry.document(name, attributes).await
    }

    /// Accessors bound to this instance, for attaching to contexts by hand
    pub fn accessors(&self) -> ModelAccessors {
        self.accessors.clone()
    }

    /// Middleware value for a [`MiddlewarePipeline`]
    pub fn middleware_layer(&self) -> OdmMiddleware {
        OdmMiddleware::new(self.accessors())
    }

    /// Attach the accessors to `context`, run `next` and return its output as is
    pub async fn middleware<C, R>(&self, mut context: C, next: Next<C, R>) -> R
    where
        C: ModelContext,
    {
        tracing::trace!("Attaching model accessors to context");
        context.attach_models(self.accessors());
        next.run(context).await
    }
}

pub struct OdmBuilder {
    config: OdmConfig,
    backend: Option<Arc<dyn DocumentBackend>>,
    ids: Option<IdGenerator>,
}

impl OdmBuilder {
    pub fn backend(mut self, backend: Arc<dyn DocumentBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Source of generated identifiers; defaults to the operating system RNG
    pub fn id_generator(mut self, ids: IdGenerator) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn build(self) -> Result<Odm, ConfigurationError> {
        let backend = self
            .backend
            .unwrap_or_else(|| Arc::new(MemoryBackend::new()) as Arc<dyn DocumentBackend>);
        let ids = self.ids.unwrap_or_default();

        let manager = ConnectionManager::new(&self.config, backend)?;

        let mut sets = Vec::with_capacity(manager.len());
        for connection in self.config.connections() {
            let mut set = match &connection.schemas {
                Some(dir) => SchemaLoader::load(dir)?,
                None => SchemaSet::new(),
            };
            if let Some(registered) = &connection.registered {
                set = set.merge(registered.clone())?;
            }
            sets.push(set);
        }

        let registry = ModelRegistry::build(Arc::new(manager), &sets, &ids)?;
        tracing::info!(models = registry.len(), "ODM registry ready");

        Ok(Odm {
            accessors: ModelAccessors::from_registry(registry.clone()),
            registry,
        })
    }
}

impl std::fmt::Debug for OdmBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OdmBuilder")
            .field("config", &self.config)
            .field("has_backend", &self.backend.is_some())
            .finish()
    }
}

//! In-process document backend
//!
//! Databases are keyed by the connection URL (scheme, host, port and path), so
//! two connections opened against the same uri see the same data while
//! different uris stay isolated. Open counters, artificial latency and
//! injected open failures make the lazy-initialization paths observable.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use url::Url;

use super::core::{matches_filter, Collection, ConnectionOptions, DocumentBackend, DocumentConnection, Filter};
use crate::error::{OdmError, OdmResult};
use crate::schema::{Fields, Schema};

/// Option enabling uniqueness enforcement for `unique` fields
pub const UNIQUE_INDEXES_OPTION: &str = "unique_indexes";

type Documents = Arc<RwLock<Vec<Fields>>>;

#[derive(Debug, Default)]
struct MemoryDatabase {
    collections: DashMap<String, Documents>,
}

impl MemoryDatabase {
    fn documents(&self, name: &str) -> Documents {
        self.collections
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(Vec::new())))
            .clone()
    }
}

#[derive(Debug, Default)]
struct Counters {
    opens: AtomicUsize,
    registrations: AtomicUsize,
    pending_failures: AtomicUsize,
}

/// In-memory [`DocumentBackend`]
#[derive(Debug, Default)]
pub struct MemoryBackend {
    databases: DashMap<String, Arc<MemoryDatabase>>,
    counters: Arc<Counters>,
    latency: Option<Duration>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every connection open and model registration by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make the next `count` connection attempts fail
    pub fn fail_next_opens(&self, count: usize) {
        self.counters.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Number of connection attempts, failed ones included
    pub fn open_count(&self) -> usize {
        self.counters.opens.load(Ordering::SeqCst)
    }

    /// Number of model registrations across every connection
    pub fn registration_count(&self) -> usize {
        self.counters.registrations.load(Ordering::SeqCst)
    }

    fn database_key(uri: &str) -> OdmResult<String> {
        let url = Url::parse(uri).map_err(|e| OdmError::Connection(format!("invalid uri '{}': {}", uri, e)))?;
        let port = url.port().map(|p| format!(":{}", p)).unwrap_or_default();
        Ok(format!(
            "{}://{}{}{}",
            url.scheme(),
            url.host_str().unwrap_or_default(),
            port,
            url.path()
        ))
    }

    fn take_failure(&self) -> bool {
        self.counters
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DocumentBackend for MemoryBackend {
    async fn open(&self, uri: &str, options: &ConnectionOptions) -> OdmResult<Arc<dyn DocumentConnection>> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        if self.take_failure() {
            return Err(OdmError::Connection(format!("connect ECONNREFUSED {}", uri)));
        }

        let key = Self::database_key(uri)?;
        let database = self.databases.entry(key).or_default().clone();
        let unique_indexes = options
            .get(UNIQUE_INDEXES_OPTION)
            .and_then(Value::as_bool)
            .unwrap_or(true);

        Ok(Arc::new(MemoryConnection {
            uri: uri.to_string(),
            database,
            models: DashMap::new(),
            counters: Arc::clone(&self.counters),
            latency: self.latency,
            unique_indexes,
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Connection produced by [`MemoryBackend`]
#[derive(Debug)]
pub struct MemoryConnection {
    uri: String,
    database: Arc<MemoryDatabase>,
    models: DashMap<String, Arc<MemoryCollection>>,
    counters: Arc<Counters>,
    latency: Option<Duration>,
    unique_indexes: bool,
}

#[async_trait]
impl DocumentConnection for MemoryConnection {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn register_model(&self, name: &str, schema: Arc<Schema>) -> OdmResult<Arc<dyn Collection>> {
        self.counters.registrations.fetch_add(1, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        match self.models.entry(name.to_string()) {
            Entry::Occupied(_) => Err(OdmError::ModelConflict(format!(
                "cannot overwrite model '{}' once compiled on {}",
                name, self.uri
            ))),
            Entry::Vacant(slot) => {
                let collection = Arc::new(MemoryCollection {
                    name: name.to_string(),
                    schema,
                    documents: self.database.documents(name),
                    unique_indexes: self.unique_indexes,
                });
                slot.insert(Arc::clone(&collection));
                Ok(collection as Arc<dyn Collection>)
            }
        }
    }

    fn collection(&self, name: &str) -> Option<Arc<dyn Collection>> {
        self.models
            .get(name)
            .map(|c| Arc::clone(c.value()) as Arc<dyn Collection>)
    }

    fn model_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.models.iter().map(|m| m.key().clone()).collect();
        names.sort();
        names
    }
}

/// Collection produced by [`MemoryConnection::register_model`]
#[derive(Debug)]
pub struct MemoryCollection {
    name: String,
    schema: Arc<Schema>,
    documents: Documents,
    unique_indexes: bool,
}

impl MemoryCollection {
    fn check_unique(&self, docs: &[Fields], doc: &Fields, skip: Option<usize>) -> OdmResult<()> {
        if !self.unique_indexes {
            return Ok(());
        }
        for field in self.schema.unique_fields() {
            let value = match doc.get(field) {
                None | Some(Value::Null) => continue,
                Some(value) => value,
            };
            let clash = docs
                .iter()
                .enumerate()
                .any(|(i, existing)| Some(i) != skip && existing.get(field) == Some(value));
            if clash {
                return Err(OdmError::DuplicateKey {
                    collection: self.name.clone(),
                    field: field.to_string(),
                    value: value.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Collection for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    async fn insert_one(&self, doc: Fields) -> OdmResult<Fields> {
        self.schema.validate(&doc)?;
        let mut docs = self.documents.write();
        self.check_unique(&docs, &doc, None)?;
        docs.push(doc.clone());
        Ok(doc)
    }

    async fn replace_one(&self, filter: &Filter, doc: Fields) -> OdmResult<u64> {
        self.schema.validate(&doc)?;
        let mut docs = self.documents.write();
        let Some(index) = docs.iter().position(|d| matches_filter(d, filter)) else {
            return Ok(0);
        };
        self.check_unique(&docs, &doc, Some(index))?;
        docs[index] = doc;
        Ok(1)
    }

    async fn find(&self, filter: &Filter, limit: Option<usize>) -> OdmResult<Vec<Fields>> {
        let docs = self.documents.read();
        Ok(docs
            .iter()
            .filter(|d| matches_filter(d, filter))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn delete_many(&self, filter: &Filter) -> OdmResult<u64> {
        let mut docs = self.documents.write();
        let before = docs.len();
        docs.retain(|d| !matches_filter(d, filter));
        Ok((before - docs.len()) as u64)
    }
}

//! Materialized models, documents and queries

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::backends::{matches_filter, Collection, Filter};
use crate::error::{OdmError, OdmResult};
use crate::registry::WeakRegistry;
use crate::schema::{Fields, Schema, Virtual, IDENTIFIER_FIELD};

pub(crate) struct ModelParts {
    pub name: String,
    pub qualified_name: String,
    pub namespace: Option<String>,
    pub schema: Arc<Schema>,
    pub collection: Arc<dyn Collection>,
    pub registry: WeakRegistry,
}

/// Handle to a model compiled on its connection. Cloning is cheap and every
/// clone refers to the same materialized model.
#[derive(Clone)]
pub struct Model {
    inner: Arc<ModelParts>,
}

impl Model {
    pub(crate) fn new(parts: ModelParts) -> Self {
        Self {
            inner: Arc::new(parts),
        }
    }

    /// Base name, as registered on the connection
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Registry key, namespace-prefixed for multi-connection setups
    pub fn qualified_name(&self) -> &str {
        &self.inner.qualified_name
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.inner.schema
    }

    pub fn collection(&self) -> &Arc<dyn Collection> {
        &self.inner.collection
    }

    /// True when both handles refer to the same materialized model
    pub fn same_model(&self, other: &Model) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Unsaved document populated with `attributes` and schema defaults
    pub fn new_document(&self, attributes: Value) -> OdmResult<Document> {
        let mut fields = into_fields(attributes)?;
        self.inner.schema.apply_defaults(&mut fields);
        Ok(Document {
            model: self.clone(),
            fields,
            populated: BTreeMap::new(),
            persisted: false,
        })
    }

    /// Build and save a document in one step
    pub async fn create(&self, attributes: Value) -> OdmResult<Document> {
        let mut doc = self.new_document(attributes)?;
        doc.save().await?;
        Ok(doc)
    }

    pub fn find(&self, filter: Filter) -> Find {
        Find {
            model: self.clone(),
            filter,
            limit: None,
            populate: Vec::new(),
        }
    }

    pub fn find_one(&self, filter: Filter) -> FindOne {
        FindOne {
            find: self.find(filter).limit(1),
        }
    }

    pub async fn find_by_id(&self, id: &str) -> OdmResult<Option<Document>> {
        let mut filter = Filter::new();
        filter.insert(IDENTIFIER_FIELD.to_string(), Value::String(id.to_string()));
        self.find_one(filter).exec().await
    }

    pub async fn count(&self, filter: Filter) -> OdmResult<u64> {
        self.inner.collection.count(&filter).await
    }

    pub async fn delete_many(&self, filter: Filter) -> OdmResult<u64> {
        let deleted = self.inner.collection.delete_many(&filter).await?;
        tracing::debug!(model = %self.inner.qualified_name, deleted, "Documents deleted");
        Ok(deleted)
    }

    async fn fetch(&self, filter: &Filter, limit: Option<usize>) -> OdmResult<Vec<Document>> {
        let rows = self.inner.collection.find(filter, limit).await?;
        Ok(rows
            .into_iter()
            .map(|fields| Document {
                model: self.clone(),
                fields,
                populated: BTreeMap::new(),
                persisted: true,
            })
            .collect())
    }

    /// Resolve `relation.ref_model` under this model's namespace and attach
    /// the matching documents to each of `docs`
    async fn populate(&self, docs: &mut [Document], name: &str) -> OdmResult<()> {
        let relation = self.inner.schema.get_virtual(name).cloned().ok_or_else(|| {
            OdmError::Validation(format!(
                "Cannot populate '{}': no such virtual on model '{}'",
                name, self.inner.qualified_name
            ))
        })?;
        let registry = self
            .inner
            .registry
            .upgrade()
            .ok_or_else(|| OdmError::Driver("model registry has been dropped".to_string()))?;

        let target_name = match &self.inner.namespace {
            Some(namespace) => format!("{}/{}", namespace, relation.ref_model),
            None => relation.ref_model.clone(),
        };
        let target = registry.get_model(&target_name).await?;

        let mut keys = Vec::new();
        let mut seen = HashSet::new();
        for doc in docs.iter() {
            for key in local_keys(doc, &relation) {
                if seen.insert(key.to_string()) {
                    keys.push(key);
                }
            }
        }

        let related = if keys.is_empty() {
            Vec::new()
        } else {
            target.fetch(&in_filter(&relation.foreign_field, keys), None).await?
        };

        for doc in docs.iter_mut() {
            let filter = in_filter(&relation.foreign_field, local_keys(doc, &relation));
            let mut matched: Vec<Document> = related
                .iter()
                .filter(|r| matches_filter(&r.fields, &filter))
                .cloned()
                .collect();
            if relation.just_one {
                matched.truncate(1);
            }
            doc.populated.insert(
                relation.name.clone(),
                Populated {
                    documents: matched,
                    just_one: relation.just_one,
                },
            );
        }
        Ok(())
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("qualified_name", &self.inner.qualified_name)
            .field("collection", &self.inner.collection.name())
            .finish()
    }
}

fn into_fields(attributes: Value) -> OdmResult<Fields> {
    match attributes {
        Value::Object(fields) => Ok(fields),
        Value::Null => Ok(Fields::new()),
        other => Err(OdmError::Validation(format!(
            "document attributes must be an object, got {}",
            other
        ))),
    }
}

fn local_keys(doc: &Document, relation: &Virtual) -> Vec<Value> {
    match doc.fields.get(&relation.local_field) {
        Some(Value::Array(items)) => items.iter().filter(|v| !v.is_null()).cloned().collect(),
        Some(Value::Null) | None => Vec::new(),
        Some(value) => vec![value.clone()],
    }
}

fn in_filter(field: &str, keys: Vec<Value>) -> Filter {
    let mut filter = Filter::new();
    filter.insert(field.to_string(), json!({ "$in": keys }));
    filter
}

#[derive(Debug, Clone)]
struct Populated {
    documents: Vec<Document>,
    just_one: bool,
}

/// A model instance: unsaved until [`Document::save`] succeeds
#[derive(Debug, Clone)]
pub struct Document {
    model: Model,
    fields: Fields,
    populated: BTreeMap<String, Populated>,
    persisted: bool,
}

impl Document {
    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Deserialize one field into `T`
    pub fn get_as<T: DeserializeOwned>(&self, field: &str) -> OdmResult<T> {
        let value = self.fields.get(field).cloned().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| {
            OdmError::Serialization(format!("Failed to deserialize field '{}': {}", field, e))
        })
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    /// Identifier value, when the schema has a string identifier
    pub fn id(&self) -> Option<&str> {
        self.fields.get(IDENTIFIER_FIELD).and_then(Value::as_str)
    }

    pub fn is_new(&self) -> bool {
        !self.persisted
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn into_fields(self) -> Fields {
        self.fields
    }

    /// Documents attached by `populate(name)`
    pub fn populated(&self, name: &str) -> Option<&[Document]> {
        self.populated.get(name).map(|p| p.documents.as_slice())
    }

    /// Fields plus populated relations (a single object or null for `just_one`)
    pub fn to_json(&self) -> Value {
        let mut out = self.fields.clone();
        for (name, populated) in &self.populated {
            let value = if populated.just_one {
                populated
                    .documents
                    .first()
                    .map(Document::to_json)
                    .unwrap_or(Value::Null)
            } else {
                Value::Array(populated.documents.iter().map(Document::to_json).collect())
            };
            out.insert(name.clone(), value);
        }
        Value::Object(out)
    }

    /// Insert on first save, replace by identifier afterwards
    pub async fn save(&mut self) -> OdmResult<()> {
        let schema = Arc::clone(self.model.schema());
        schema.apply_defaults(&mut self.fields);
        let collection = Arc::clone(self.model.collection());

        if self.persisted {
            let id = self.fields.get(IDENTIFIER_FIELD).cloned().ok_or_else(|| {
                OdmError::Validation(format!(
                    "cannot update a '{}' document without an '{}' field",
                    self.model.qualified_name(),
                    IDENTIFIER_FIELD
                ))
            })?;
            let mut filter = Filter::new();
            filter.insert(IDENTIFIER_FIELD.to_string(), id.clone());

            if collection.replace_one(&filter, self.fields.clone()).await? == 0 {
                return Err(OdmError::Driver(format!(
                    "no '{}' document found with {} {}",
                    self.model.qualified_name(),
                    IDENTIFIER_FIELD,
                    id
                )));
            }
        } else {
            self.fields = collection.insert_one(self.fields.clone()).await?;
            self.persisted = true;
        }

        tracing::debug!(model = %self.model.qualified_name(), id = ?self.id(), "Document saved");
        Ok(())
    }
}

/// Query returning every matching document
#[derive(Debug)]
pub struct Find {
    model: Model,
    filter: Filter,
    limit: Option<usize>,
    populate: Vec<String>,
}

impl Find {
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Attach the documents of virtual relation `name` to each result
    pub fn populate(mut self, name: impl Into<String>) -> Self {
        self.populate.push(name.into());
        self
    }

    pub async fn exec(self) -> OdmResult<Vec<Document>> {
        let mut docs = self.model.fetch(&self.filter, self.limit).await?;
        for name in &self.populate {
            self.model.populate(&mut docs, name).await?;
        }
        Ok(docs)
    }
}

/// Query returning the first matching document
#[derive(Debug)]
pub struct FindOne {
    find: Find,
}

impl FindOne {
    pub fn populate(mut self, name: impl Into<String>) -> Self {
        self.find = self.find.populate(name);
        self
    }

    pub async fn exec(self) -> OdmResult<Option<Document>> {
        Ok(self.find.exec().await?.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryBackend;
    use crate::config::ConnectionConfig;
    use crate::connection::ConnectionManager;
    use crate::id::IdGenerator;
    use crate::registry::ModelRegistry;
    use crate::schema::{FieldDef, FieldMap, FieldType, SchemaSet};

    fn filter(value: Value) -> Filter {
        value.as_object().cloned().unwrap()
    }

    fn registry() -> ModelRegistry {
        let set = SchemaSet::new()
            .define(
                "Group",
                FieldMap::new().field("groupname", FieldDef::string().required().unique()),
            )
            .unwrap()
            .define_fn("User", || {
                Schema::new()
                    .field("id", FieldDef::string().unique().default_value(json!("fixed")))
                    .field("username", FieldDef::string().required().unique())
                    .field("groupNames", FieldDef::array_of(FieldType::String))
                    .virtual_field(Virtual::new("groups", "Group", "groupNames", "groupname"))
                    .virtual_field(Virtual::new("primary", "Group", "groupNames", "groupname").just_one())
            })
            .unwrap();
        let config = ConnectionConfig::new("db://host/test").schema_set(set.clone()).into();
        let manager = Arc::new(ConnectionManager::new(&config, Arc::new(MemoryBackend::new())).unwrap());
        ModelRegistry::build(manager, &[set], &IdGenerator::default()).unwrap()
    }

    #[tokio::test]
    async fn test_save_inserts_then_updates() {
        let registry = registry();
        let groups = registry.get_model("Group").await.unwrap();

        let mut group = groups.new_document(json!({ "groupname": "testgroup" })).unwrap();
        assert!(group.is_new());
        let id = group.id().unwrap().to_string();

        group.save().await.unwrap();
        assert!(!group.is_new());

        group.set("groupname", "renamed");
        group.save().await.unwrap();

        let found = groups.find_by_id(&id).await.unwrap().unwrap();
        assert_eq!(found.get_as::<String>("groupname").unwrap(), "renamed");
        assert_eq!(groups.count(Filter::new()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_non_object_attributes_are_rejected() {
        let registry = registry();
        let groups = registry.get_model("Group").await.unwrap();

        assert!(matches!(
            groups.new_document(json!(["nope"])),
            Err(OdmError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_populate_resolves_referenced_model_lazily() {
        let registry = registry();
        let users = registry.get_model("User").await.unwrap();
        assert!(!registry.entry("Group").unwrap().is_materialized());

        users
            .create(json!({ "username": "testuser", "groupNames": ["testgroup", "other"] }))
            .await
            .unwrap();
        let groups = registry.get_model("Group").await.unwrap();
        groups.create(json!({ "groupname": "testgroup" })).await.unwrap();
        groups.create(json!({ "groupname": "unrelated" })).await.unwrap();

        let user = users
            .find_one(filter(json!({ "username": "testuser" })))
            .populate("groups")
            .populate("primary")
            .exec()
            .await
            .unwrap()
            .unwrap();

        let populated = user.populated("groups").unwrap();
        assert_eq!(populated.len(), 1);
        assert_eq!(populated[0].get("groupname"), Some(&json!("testgroup")));

        let rendered = user.to_json();
        assert_eq!(rendered["primary"]["groupname"], json!("testgroup"));
        assert_eq!(rendered["groups"][0]["groupname"], json!("testgroup"));
    }

    #[tokio::test]
    async fn test_populate_unknown_virtual_fails() {
        let registry = registry();
        let groups = registry.get_model("Group").await.unwrap();

        let result = groups.find(Filter::new()).populate("members").exec().await;
        assert!(matches!(result, Err(OdmError::Validation(_))));
    }

    #[tokio::test]
    async fn test_delete_many_and_find() {
        let registry = registry();
        let groups = registry.get_model("Group").await.unwrap();
        for name in ["a", "b", "c"] {
            groups.create(json!({ "groupname": name })).await.unwrap();
        }

        assert_eq!(groups.find(Filter::new()).limit(2).exec().await.unwrap().len(), 2);
        assert_eq!(groups.delete_many(filter(json!({ "groupname": "b" }))).await.unwrap(), 1);
        assert_eq!(groups.find(Filter::new()).exec().await.unwrap().len(), 2);
    }
}

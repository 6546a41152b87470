//! Schema discovery
//!
//! Schemas are either registered explicitly in a [`SchemaSet`] or read from
//! declarative files under a directory. Files are data, never code: `*.json`,
//! `*.yaml` and `*.yml` holding a field map. The file stem is the model name.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;

use super::definition::{FieldMap, SchemaDefinition, SchemaFn, Schema};
use crate::error::ConfigurationError;

/// Extensions recognized as schema files
pub const SCHEMA_EXTENSIONS: &[&str] = &["json", "yaml", "yml"];

#[derive(Clone)]
struct Registered {
    origin: String,
    definition: Arc<dyn SchemaDefinition>,
}

/// Explicit mapping from model base name to definition
#[derive(Clone, Default)]
pub struct SchemaSet {
    entries: BTreeMap<String, Registered>,
}

impl SchemaSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition under `name`, rejecting a second definition of the same name
    pub fn define<D>(mut self, name: impl Into<String>, definition: D) -> Result<Self, ConfigurationError>
    where
        D: SchemaDefinition + 'static,
    {
        let name = name.into();
        let origin = format!("registered '{}'", name);
        self.register(name, origin, Arc::new(definition))?;
        Ok(self)
    }

    /// Register a builder closure under `name`
    pub fn define_fn<F>(self, name: impl Into<String>, build: F) -> Result<Self, ConfigurationError>
    where
        F: Fn() -> Schema + Send + Sync + 'static,
    {
        self.define(name, SchemaFn::new(build))
    }

    /// Combine two sets; a name defined in both is a duplicate
    pub fn merge(mut self, other: SchemaSet) -> Result<Self, ConfigurationError> {
        for (name, entry) in other.entries {
            self.register(name, entry.origin, entry.definition)?;
        }
        Ok(self)
    }

    fn register(
        &mut self,
        name: String,
        origin: String,
        definition: Arc<dyn SchemaDefinition>,
    ) -> Result<(), ConfigurationError> {
        if let Some(existing) = self.entries.get(&name) {
            return Err(ConfigurationError::DuplicateModelName {
                name,
                first: existing.origin.clone(),
                second: origin,
            });
        }
        self.entries.insert(name, Registered { origin, definition });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SchemaDefinition>> {
        self.entries.get(name).map(|entry| Arc::clone(&entry.definition))
    }

    /// Model base names, sorted
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn SchemaDefinition>)> {
        self.entries
            .iter()
            .map(|(name, entry)| (name.as_str(), &entry.definition))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for SchemaSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.entries.iter().map(|(name, entry)| (name, &entry.origin)))
            .finish()
    }
}

/// Reads declarative schema files from a directory tree
pub struct SchemaLoader;

impl SchemaLoader {
    /// Load every schema file under `dir`, recursively
    pub fn load(dir: impl AsRef<Path>) -> Result<SchemaSet, ConfigurationError> {
        let dir = dir.as_ref();
        let mut files = Vec::new();
        collect_schema_files(dir, &mut files)?;
        // Sorted so duplicate reports do not depend on directory order
        files.sort();

        let mut set = SchemaSet::new();
        for path in files {
            let name = model_name(&path)?;
            let map = read_field_map(&path)?;
            tracing::debug!(model = %name, path = %path.display(), "Loaded schema definition");
            set.register(name, path.display().to_string(), Arc::new(map))?;
        }

        tracing::debug!(dir = %dir.display(), models = set.len(), "Schema directory scanned");
        Ok(set)
    }
}

fn collect_schema_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), ConfigurationError> {
    let unreadable = |err: std::io::Error| ConfigurationError::UnreadableSchemas {
        path: dir.display().to_string(),
        reason: err.to_string(),
    };

    for entry in fs::read_dir(dir).map_err(unreadable)? {
        let path = entry.map_err(unreadable)?.path();
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(true, |n| n.starts_with('.'));
        if hidden {
            continue;
        }

        if path.is_dir() {
            collect_schema_files(&path, files)?;
        } else if is_schema_file(&path) {
            files.push(path);
        }
    }
    Ok(())
}

fn is_schema_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| SCHEMA_EXTENSIONS.contains(&ext))
}

fn model_name(path: &Path) -> Result<String, ConfigurationError> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ConfigurationError::invalid_export(path.display().to_string(), "file name is not a valid model name"))
}

fn read_field_map(path: &Path) -> Result<FieldMap, ConfigurationError> {
    let origin = path.display().to_string();
    let raw = fs::read_to_string(path).map_err(|err| ConfigurationError::UnreadableSchemas {
        path: origin.clone(),
        reason: err.to_string(),
    })?;

    let value: Value = match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => serde_json::from_str(&raw)
            .map_err(|err| ConfigurationError::invalid_export(&origin, err.to_string()))?,
        _ => serde_yaml::from_str(&raw)
            .map_err(|err| ConfigurationError::invalid_export(&origin, err.to_string()))?,
    };

    FieldMap::from_value(&value).map_err(|reason| ConfigurationError::invalid_export(origin, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::IdGenerator;
    use crate::schema::FieldDef;
    use tempfile::TempDir;

    fn write(dir: &Path, relative: &str, contents: &str) {
        let path = dir.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_load_recurses_and_uses_file_stem() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "Group.json", r#"{"groupname": {"type": "string", "required": true}}"#);
        write(tmp.path(), "nested/User.yaml", "username: string\ngroupNames: [string]\n");
        write(tmp.path(), "README.md", "not a schema");
        write(tmp.path(), ".Hidden.json", "{}");

        let set = SchemaLoader::load(tmp.path()).unwrap();
        assert_eq!(set.names().collect::<Vec<_>>(), vec!["Group", "User"]);

        let user = set.get("User").unwrap().to_schema(&IdGenerator::default());
        assert!(user.has_field("groupNames"));
        assert!(user.identifier().is_some());
    }

    #[test]
    fn test_duplicate_base_names_are_rejected() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a/User.json", r#"{"username": "string"}"#);
        write(tmp.path(), "b/User.yml", "username: string\n");

        let err = SchemaLoader::load(tmp.path()).unwrap_err();
        match err {
            ConfigurationError::DuplicateModelName { name, first, second } => {
                assert_eq!(name, "User");
                assert!(first.contains("User.json"));
                assert!(second.contains("User.yml"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_non_field_map_export_is_invalid() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "Broken.json", r#"["username"]"#);

        assert!(matches!(
            SchemaLoader::load(tmp.path()),
            Err(ConfigurationError::InvalidSchemaExport { .. })
        ));
    }

    #[test]
    fn test_unparseable_file_is_invalid() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "Broken.yaml", "username: [string\n");

        assert!(matches!(
            SchemaLoader::load(tmp.path()),
            Err(ConfigurationError::InvalidSchemaExport { .. })
        ));
    }

    #[test]
    fn test_missing_directory_is_unreadable() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("nope");

        assert!(matches!(
            SchemaLoader::load(&missing),
            Err(ConfigurationError::UnreadableSchemas { .. })
        ));
    }

    #[test]
    fn test_schema_set_rejects_redefinition() {
        let set = SchemaSet::new()
            .define("Group", FieldMap::new().field("groupname", FieldDef::string()))
            .unwrap();

        let err = set
            .define_fn("Group", || Schema::new())
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::DuplicateModelName { .. }));
    }
}

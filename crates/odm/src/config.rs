//! Connection configuration
//!
//! One connection spec or an ordered list of them, built in code, read from a
//! YAML/JSON file, or taken from `ELIF_ODM_*` environment variables. All
//! checks run synchronously before any schema is scanned or any connection is
//! attempted.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::backends::{ConnectionOptions, UNIQUE_INDEXES_OPTION};
use crate::error::ConfigurationError;
use crate::schema::SchemaSet;

pub const ENV_URI: &str = "ELIF_ODM_URI";
pub const ENV_SCHEMAS: &str = "ELIF_ODM_SCHEMAS";
pub const ENV_NAMESPACE: &str = "ELIF_ODM_NAMESPACE";
pub const ENV_OPTIONS: &str = "ELIF_ODM_OPTIONS";

/// Options every connection starts from; user options override them
pub fn default_options() -> ConnectionOptions {
    let mut options = ConnectionOptions::new();
    options.insert(UNIQUE_INDEXES_OPTION.to_string(), Value::Bool(true));
    options
}

/// Settings for one database connection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Required, and unique, when more than one connection is configured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(default)]
    pub uri: String,

    /// Directory holding declarative schema files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schemas: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "ConnectionOptions::is_empty")]
    pub options: ConnectionOptions,

    /// Schemas registered in code, merged with the directory scan
    #[serde(skip)]
    pub registered: Option<SchemaSet>,
}

impl ConnectionConfig {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Self::default()
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn schemas(mut self, dir: impl Into<PathBuf>) -> Self {
        self.schemas = Some(dir.into());
        self
    }

    pub fn schema_set(mut self, set: SchemaSet) -> Self {
        self.registered = Some(set);
        self
    }

    pub fn option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }

    /// Defaults merged with the user's options
    pub fn effective_options(&self) -> ConnectionOptions {
        let mut options = default_options();
        options.extend(self.options.clone());
        options
    }

    fn validate(&self, index: usize) -> Result<(), ConfigurationError> {
        if self.uri.trim().is_empty() {
            return Err(ConfigurationError::MissingUri { index });
        }
        Url::parse(&self.uri).map_err(|e| ConfigurationError::InvalidUri {
            index,
            uri: self.uri.clone(),
            reason: e.to_string(),
        })?;
        if self.schemas.is_none() && self.registered.is_none() {
            return Err(ConfigurationError::MissingSchemasDirectory { index });
        }
        Ok(())
    }
}

/// Whole ODM configuration: one connection or an ordered list
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OdmConfig {
    Single(ConnectionConfig),
    Multi(Vec<ConnectionConfig>),
}

impl OdmConfig {
    pub fn connections(&self) -> &[ConnectionConfig] {
        match self {
            OdmConfig::Single(config) => std::slice::from_ref(config),
            OdmConfig::Multi(configs) => configs,
        }
    }

    pub fn into_connections(self) -> Vec<ConnectionConfig> {
        match self {
            OdmConfig::Single(config) => vec![config],
            OdmConfig::Multi(configs) => configs,
        }
    }

    pub fn is_multi(&self) -> bool {
        self.connections().len() > 1
    }

    /// Check uri, schemas and namespace rules for every connection
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let connections = self.connections();
        if connections.is_empty() {
            return Err(ConfigurationError::invalid_value(
                "connections",
                "[]",
                "at least one connection",
            ));
        }

        for (index, config) in connections.iter().enumerate() {
            config.validate(index)?;
        }

        if connections.len() > 1 {
            let mut seen = HashSet::new();
            for (index, config) in connections.iter().enumerate() {
                let namespace = config
                    .namespace
                    .as_deref()
                    .map(str::trim)
                    .filter(|ns| !ns.is_empty())
                    .ok_or(ConfigurationError::MissingNamespace { index })?;
                if namespace.contains('/') {
                    return Err(ConfigurationError::invalid_value(
                        "namespace",
                        namespace,
                        "a label without '/'",
                    ));
                }
                if !seen.insert(namespace) {
                    return Err(ConfigurationError::DuplicateNamespace {
                        namespace: namespace.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Read a YAML (`.yaml`/`.yml`) or JSON (`.json`) configuration file.
    ///
    /// Relative `schemas` directories are resolved against the file's directory.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|e| {
            ConfigurationError::invalid_value("config file", path.display().to_string(), e.to_string())
        })?;

        let parse_error = |e: String| {
            ConfigurationError::invalid_value("config file", path.display().to_string(), e)
        };
        let mut config: OdmConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&raw).map_err(|e| parse_error(e.to_string()))?,
            Some("yaml") | Some("yml") => {
                serde_yaml::from_str(&raw).map_err(|e| parse_error(e.to_string()))?
            }
            _ => return Err(parse_error("a .json, .yaml or .yml file".to_string())),
        };

        if let Some(base) = path.parent() {
            config.resolve_schema_dirs(base);
        }
        Ok(config)
    }

    /// Single-connection configuration from `ELIF_ODM_*` variables
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Like [`OdmConfig::from_env`] with a custom variable lookup
    pub fn from_env_with<F>(lookup: F) -> Result<Self, ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = ConnectionConfig::new(lookup(ENV_URI).unwrap_or_default());
        config.schemas = lookup(ENV_SCHEMAS).map(PathBuf::from);
        config.namespace = lookup(ENV_NAMESPACE).filter(|ns| !ns.is_empty());

        if let Some(raw) = lookup(ENV_OPTIONS) {
            config.options = serde_json::from_str(&raw).map_err(|_| {
                ConfigurationError::invalid_value(ENV_OPTIONS, raw.clone(), "a JSON object")
            })?;
        }
        Ok(OdmConfig::Single(config))
    }

    fn resolve_schema_dirs(&mut self, base: &Path) {
        let connections: &mut [ConnectionConfig] = match self {
            OdmConfig::Single(config) => std::slice::from_mut(config),
            OdmConfig::Multi(configs) => configs,
        };
        for config in connections {
            if let Some(dir) = &config.schemas {
                if dir.is_relative() {
                    config.schemas = Some(base.join(dir));
                }
            }
        }
    }
}

impl From<ConnectionConfig> for OdmConfig {
    fn from(config: ConnectionConfig) -> Self {
        OdmConfig::Single(config)
    }
}

impl From<Vec<ConnectionConfig>> for OdmConfig {
    fn from(configs: Vec<ConnectionConfig>) -> Self {
        OdmConfig::Multi(configs)
    }
}

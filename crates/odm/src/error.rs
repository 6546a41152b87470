//! Error types for the ODM
//!
//! Configuration problems are reported synchronously while an [`crate::Odm`]
//! is being built. Everything else surfaces as a failed future from model
//! resolution or document operations.

use thiserror::Error;

/// Result type alias for ODM operations
pub type OdmResult<T> = Result<T, OdmError>;

/// Setup-time failures. Construction either fully succeeds or returns one of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("connection #{index}: uri is needed to connect to the database server")]
    MissingUri { index: usize },

    #[error("connection #{index}: uri '{uri}' is invalid: {reason}")]
    InvalidUri {
        index: usize,
        uri: String,
        reason: String,
    },

    #[error("connection #{index}: a schemas directory or registered schema set is needed for defining models")]
    MissingSchemasDirectory { index: usize },

    #[error("connection #{index}: a non-empty namespace is required when more than one connection is configured")]
    MissingNamespace { index: usize },

    #[error("namespace '{namespace}' is used by more than one connection")]
    DuplicateNamespace { namespace: String },

    #[error("multiple definitions of model '{name}' ({first} and {second})")]
    DuplicateModelName {
        name: String,
        first: String,
        second: String,
    },

    #[error("schema '{path}' does not export a valid definition: {reason}")]
    InvalidSchemaExport { path: String, reason: String },

    #[error("cannot read schemas from '{path}': {reason}")]
    UnreadableSchemas { path: String, reason: String },

    #[error("invalid value for '{field}': '{value}'. Expected: {expected}")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },
}

impl ConfigurationError {
    /// Create an invalid schema export error
    pub fn invalid_export(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSchemaExport {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid value error
    pub fn invalid_value(
        field: impl Into<String>,
        value: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.into(),
            expected: expected.into(),
        }
    }
}

/// Error type for every ODM operation.
///
/// `Clone` because one failed connection open or materialization is handed to
/// every caller that was waiting on it.
#[derive(Debug, Clone, Error)]
pub enum OdmError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Model '{0}' is not registered")]
    NotFound(String),

    #[error("Model conflict: {0}")]
    ModelConflict(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Duplicate key in '{collection}': {field} = {value}")]
    DuplicateKey {
        collection: String,
        field: String,
        value: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Driver error: {0}")]
    Driver(String),
}

impl OdmError {
    /// True for [`OdmError::NotFound`]
    pub fn is_not_found(&self) -> bool {
        matches!(self, OdmError::NotFound(_))
    }

    /// True for [`OdmError::Connection`]
    pub fn is_connection(&self) -> bool {
        matches!(self, OdmError::Connection(_))
    }
}

impl From<serde_json::Error> for OdmError {
    fn from(err: serde_json::Error) -> Self {
        OdmError::Serialization(err.to_string())
    }
}

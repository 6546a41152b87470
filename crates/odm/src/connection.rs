//! Connection descriptors and lazy connection establishment

use std::fmt;
use std::sync::Arc;

use url::Url;

use crate::backends::{ConnectionOptions, DocumentBackend, DocumentConnection};
use crate::config::OdmConfig;
use crate::error::{ConfigurationError, OdmError, OdmResult};
use crate::flight::SingleFlight;

/// One configured connection. The underlying handle is opened on first use
/// and owned by the descriptor for its whole lifetime.
pub struct ConnectionDescriptor {
    index: usize,
    namespace: Option<String>,
    uri: String,
    options: ConnectionOptions,
    handle: SingleFlight<Arc<dyn DocumentConnection>>,
}

impl ConnectionDescriptor {
    /// Position in the configuration list
    pub fn index(&self) -> usize {
        self.index
    }

    /// Namespace used to qualify model names; `None` for a single connection
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Handle, if the connection has been established
    pub fn connection(&self) -> Option<Arc<dyn DocumentConnection>> {
        self.handle.get()
    }

    pub fn is_connected(&self) -> bool {
        self.handle.get().is_some()
    }

    /// Model name as seen by callers: `namespace/name` or plain `name`
    pub fn qualify(&self, base_name: &str) -> String {
        match &self.namespace {
            Some(namespace) => format!("{}/{}", namespace, base_name),
            None => base_name.to_string(),
        }
    }

    fn label(&self) -> String {
        self.namespace
            .clone()
            .unwrap_or_else(|| format!("#{}", self.index))
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("index", &self.index)
            .field("namespace", &self.namespace)
            .field("uri", &redact_uri(&self.uri))
            .field("handle", &self.handle)
            .finish()
    }
}

/// Owns every connection descriptor and the backend that opens them
pub struct ConnectionManager {
    backend: Arc<dyn DocumentBackend>,
    descriptors: Vec<Arc<ConnectionDescriptor>>,
}

impl ConnectionManager {
    /// Validate `config` and build descriptors. Nothing is opened here.
    pub fn new(config: &OdmConfig, backend: Arc<dyn DocumentBackend>) -> Result<Self, ConfigurationError> {
        config.validate()?;

        let multi = config.is_multi();
        let descriptors = config
            .connections()
            .iter()
            .enumerate()
            .map(|(index, connection)| {
                if !multi && connection.namespace.is_some() {
                    tracing::warn!(
                        namespace = ?connection.namespace,
                        "Ignoring namespace on a single-connection configuration"
                    );
                }
                let namespace = if multi {
                    connection.namespace.as_deref().map(|ns| ns.trim().to_string())
                } else {
                    None
                };
                Arc::new(ConnectionDescriptor {
                    index,
                    namespace,
                    uri: connection.uri.clone(),
                    options: connection.effective_options(),
                    handle: SingleFlight::new(),
                })
            })
            .collect::<Vec<_>>();

        tracing::debug!(
            backend = backend.name(),
            connections = descriptors.len(),
            "Connection descriptors configured"
        );

        Ok(Self {
            backend,
            descriptors,
        })
    }

    pub fn descriptors(&self) -> &[Arc<ConnectionDescriptor>] {
        &self.descriptors
    }

    /// Descriptor configured under `namespace`
    pub fn descriptor(&self, namespace: &str) -> Option<&Arc<ConnectionDescriptor>> {
        self.descriptors
            .iter()
            .find(|d| d.namespace.as_deref() == Some(namespace))
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn is_multi(&self) -> bool {
        self.descriptors.len() > 1
    }

    /// Establish the descriptor's connection, or return the one already
    /// established or being established.
    ///
    /// A failed attempt is reported as [`OdmError::Connection`] to every
    /// caller waiting on it, and the next call tries again.
    pub async fn get_connection(&self, descriptor: &ConnectionDescriptor) -> OdmResult<Arc<dyn DocumentConnection>> {
        let backend = Arc::clone(&self.backend);
        let uri = descriptor.uri.clone();
        let options = descriptor.options.clone();
        let label = descriptor.label();

        descriptor
            .handle
            .get_or_init(move || async move {
                tracing::info!(connection = %label, uri = %redact_uri(&uri), "Opening database connection");
                match backend.open(&uri, &options).await {
                    Ok(connection) => {
                        tracing::info!(connection = %label, "Database connection established");
                        Ok(connection)
                    }
                    Err(err) => {
                        tracing::error!(connection = %label, error = %err, "Failed to open database connection");
                        Err(match err {
                            OdmError::Connection(_) => err,
                            other => OdmError::Connection(other.to_string()),
                        })
                    }
                }
            })
            .await
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("backend", &self.backend.name())
            .field("descriptors", &self.descriptors)
            .finish()
    }
}

/// Hide the password component of a connection uri
pub fn redact_uri(uri: &str) -> String {
    match Url::parse(uri) {
        Ok(mut url) if url.password().is_some() => {
            let _ = url.set_password(Some("***"));
            url.to_string()
        }
        _ => uri.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryBackend;
    use crate::config::ConnectionConfig;
    use std::time::Duration;

    fn single() -> OdmConfig {
        ConnectionConfig::new("db://host/test").schemas("./models").into()
    }

    #[test]
    fn test_missing_namespace_fails_before_any_connection() {
        let backend = Arc::new(MemoryBackend::new());
        let config = OdmConfig::from(vec![
            ConnectionConfig::new("db://host/a").schemas("./models").namespace("a"),
            ConnectionConfig::new("db://host/b").schemas("./models"),
        ]);

        let err = ConnectionManager::new(&config, backend.clone()).unwrap_err();
        assert_eq!(err, ConfigurationError::MissingNamespace { index: 1 });
        assert_eq!(backend.open_count(), 0);
    }

    #[test]
    fn test_single_connection_ignores_namespace() {
        let config = OdmConfig::from(
            ConnectionConfig::new("db://host/test")
                .schemas("./models")
                .namespace("ignored"),
        );
        let manager = ConnectionManager::new(&config, Arc::new(MemoryBackend::new())).unwrap();

        let descriptor = &manager.descriptors()[0];
        assert_eq!(descriptor.namespace(), None);
        assert_eq!(descriptor.qualify("User"), "User");
    }

    #[test]
    fn test_multi_connection_qualifies_names() {
        let config = OdmConfig::from(vec![
            ConnectionConfig::new("db://host/a").schemas("./models").namespace("a"),
            ConnectionConfig::new("db://host/b").schemas("./models").namespace("b"),
        ]);
        let manager = ConnectionManager::new(&config, Arc::new(MemoryBackend::new())).unwrap();

        assert!(manager.is_multi());
        assert_eq!(manager.descriptor("b").unwrap().qualify("Group"), "b/Group");
        assert!(manager.descriptor("c").is_none());
    }

    #[tokio::test]
    async fn test_get_connection_is_idempotent() {
        let backend = Arc::new(MemoryBackend::new().with_latency(Duration::from_millis(10)));
        let manager = ConnectionManager::new(&single(), backend.clone()).unwrap();
        let descriptor = Arc::clone(&manager.descriptors()[0]);

        let (a, b) = tokio::join!(
            manager.get_connection(&descriptor),
            manager.get_connection(&descriptor)
        );
        let c = manager.get_connection(&descriptor).await.unwrap();

        assert!(Arc::ptr_eq(&a.unwrap(), &c));
        assert!(Arc::ptr_eq(&b.unwrap(), &c));
        assert_eq!(backend.open_count(), 1);
        assert!(descriptor.is_connected());
    }

    #[tokio::test]
    async fn test_failed_open_can_be_retried() {
        let backend = Arc::new(MemoryBackend::new());
        backend.fail_next_opens(1);
        let manager = ConnectionManager::new(&single(), backend.clone()).unwrap();
        let descriptor = Arc::clone(&manager.descriptors()[0]);

        let first = manager.get_connection(&descriptor).await;
        assert!(matches!(first, Err(OdmError::Connection(_))));
        assert!(!descriptor.is_connected());

        manager.get_connection(&descriptor).await.unwrap();
        assert_eq!(backend.open_count(), 2);
    }

    #[test]
    fn test_redact_uri_hides_password() {
        assert_eq!(
            redact_uri("db://user:secret@host/test"),
            "db://user:***@host/test"
        );
        assert_eq!(redact_uri("db://host/test"), "db://host/test");
    }
}

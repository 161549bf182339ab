use crate::broker::BoxError;
use crate::error::{Error, Result};

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

/// Environment variable holding the newline-separated server list.
pub const SERVERS_ENV: &str = "NATS_SERVERS";

/// Environment variable holding the user name.
pub const USER_ENV: &str = "NATS_USER";

/// Environment variable holding the password.
pub const PASSWORD_ENV: &str = "NATS_PASSWORD";

/// Environment variable holding the pod identifier used as connection name.
pub const POD_NAME_ENV: &str = "POD_NAME";

/// Fallback for the connection name when no pod identifier is set.
pub const HOSTNAME_ENV: &str = "HOSTNAME";

type Accessor = Arc<dyn Fn() -> std::result::Result<ConnectionConfig, BoxError> + Send + Sync>;
type AsyncAccessor = Arc<
    dyn Fn() -> BoxFuture<'static, std::result::Result<ConnectionConfig, BoxError>> + Send + Sync,
>;

/// Everything needed to open a broker connection.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Logical client name reported to the broker.
    pub name: String,

    /// Optional password. Must be given together with `user`.
    pub password: Option<String>,

    /// Server addresses.
    pub servers: Vec<String>,

    /// Optional user. Must be given together with `password`.
    pub user: Option<String>,
}

impl ConnectionConfig {
    /// Reads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the result fails validation.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through a variable lookup function.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the result fails validation.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let servers = lookup(SERVERS_ENV)
            .unwrap_or_default()
            .lines()
            .map(str::trim)
            .filter(|server| !server.is_empty())
            .map(ToString::to_string)
            .collect();

        let name = lookup(POD_NAME_ENV)
            .filter(|name| !name.trim().is_empty())
            .or_else(|| lookup(HOSTNAME_ENV).filter(|name| !name.trim().is_empty()))
            .unwrap_or_else(|| format!("pid-{}", std::process::id()));

        let config = Self {
            name,
            password: lookup(PASSWORD_ENV).filter(|password| !password.is_empty()),
            servers,
            user: lookup(USER_ENV).filter(|user| !user.is_empty()),
        };

        config.validate()?;

        Ok(config)
    }

    /// Checks the configuration has a usable shape.
    ///
    /// # Errors
    ///
    /// Returns a configuration error describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Configuration(
                "connection name must not be empty".to_string(),
            ));
        }

        if self.servers.is_empty() {
            return Err(Error::Configuration(
                "at least one server is required".to_string(),
            ));
        }

        if self.servers.iter().any(|server| server.trim().is_empty()) {
            return Err(Error::Configuration(
                "server addresses must not be blank".to_string(),
            ));
        }

        if self.user.is_some() != self.password.is_some() {
            return Err(Error::Configuration(
                "user and password must be supplied together".to_string(),
            ));
        }

        Ok(())
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("name", &self.name)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("servers", &self.servers)
            .field("user", &self.user)
            .finish()
    }
}

/// Where a [`Connection`](crate::Connection) gets its configuration from.
#[derive(Clone, Default)]
pub enum ConfigSource {
    /// A fixed configuration.
    Value(ConnectionConfig),

    /// A synchronous accessor called on every connect.
    Accessor(Accessor),

    /// An asynchronous accessor awaited on every connect.
    AsyncAccessor(AsyncAccessor),

    /// Read from the process environment on every connect.
    #[default]
    Environment,
}

impl ConfigSource {
    /// Wraps a synchronous accessor.
    pub fn from_fn<F>(accessor: F) -> Self
    where
        F: Fn() -> std::result::Result<ConnectionConfig, BoxError> + Send + Sync + 'static,
    {
        Self::Accessor(Arc::new(accessor))
    }

    /// Wraps an asynchronous accessor.
    pub fn from_async_fn<F, Fut>(accessor: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<ConnectionConfig, BoxError>> + Send + 'static,
    {
        Self::AsyncAccessor(Arc::new(move || Box::pin(accessor())))
    }

    /// Resolves and validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the accessor fails or the resolved
    /// configuration fails validation.
    pub async fn resolve(&self) -> Result<ConnectionConfig> {
        let config = match self {
            Self::Value(config) => config.clone(),
            Self::Accessor(accessor) => accessor().map_err(|e| {
                Error::Configuration(format!("configuration accessor failed: {e}"))
            })?,
            Self::AsyncAccessor(accessor) => accessor().await.map_err(|e| {
                Error::Configuration(format!("configuration accessor failed: {e}"))
            })?,
            Self::Environment => return ConnectionConfig::from_env(),
        };

        config.validate()?;

        Ok(config)
    }
}

impl fmt::Debug for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(config) => f.debug_tuple("Value").field(config).finish(),
            Self::Accessor(_) => f.write_str("Accessor"),
            Self::AsyncAccessor(_) => f.write_str("AsyncAccessor"),
            Self::Environment => f.write_str("Environment"),
        }
    }
}

impl From<ConnectionConfig> for ConfigSource {
    fn from(config: ConnectionConfig) -> Self {
        Self::Value(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    use std::collections::HashMap;

    use assert_matches::assert_matches;

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            name: "orders-service".to_string(),
            password: None,
            servers: vec!["nats://localhost:4222".to_string()],
            user: None,
        }
    }

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_from_lookup_reads_newline_separated_servers() {
        let config = ConnectionConfig::from_lookup(lookup(&[
            (SERVERS_ENV, "nats://a:4222\n  nats://b:4222 \n\n"),
            (USER_ENV, "svc"),
            (PASSWORD_ENV, "secret"),
            (POD_NAME_ENV, "orders-7f9c"),
        ]))
        .expect("config should be valid");

        assert_eq!(config.servers, vec!["nats://a:4222", "nats://b:4222"]);
        assert_eq!(config.user.as_deref(), Some("svc"));
        assert_eq!(config.password.as_deref(), Some("secret"));
        assert_eq!(config.name, "orders-7f9c");
    }

    #[test]
    fn test_from_lookup_name_fallbacks() {
        let config = ConnectionConfig::from_lookup(lookup(&[
            (SERVERS_ENV, "nats://a:4222"),
            (HOSTNAME_ENV, "worker-1"),
        ]))
        .expect("config should be valid");
        assert_eq!(config.name, "worker-1");

        let config = ConnectionConfig::from_lookup(lookup(&[(SERVERS_ENV, "nats://a:4222")]))
            .expect("config should be valid");
        assert_eq!(config.name, format!("pid-{}", std::process::id()));
    }

    #[test]
    fn test_from_lookup_without_servers_fails() {
        let result = ConnectionConfig::from_lookup(lookup(&[(POD_NAME_ENV, "orders")]));

        assert_matches!(result, Err(Error::Configuration(_)));
    }

    #[test]
    fn test_validate_rejects_partial_credentials() {
        let mut config = config();
        config.user = Some("svc".to_string());

        let error = config.validate().expect_err("user without password");
        assert_eq!(error.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_debug_redacts_password() {
        let mut config = config();
        config.user = Some("svc".to_string());
        config.password = Some("hunter2".to_string());

        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }

    #[tokio::test]
    async fn test_resolve_value() {
        let resolved = ConfigSource::from(config())
            .resolve()
            .await
            .expect("value should resolve");

        assert_eq!(resolved, config());
    }

    #[tokio::test]
    async fn test_resolve_accessors() {
        let sync_source = ConfigSource::from_fn(|| Ok(config()));
        assert_eq!(sync_source.resolve().await.expect("sync accessor"), config());

        let async_source = ConfigSource::from_async_fn(|| async { Ok(config()) });
        assert_eq!(
            async_source.resolve().await.expect("async accessor"),
            config()
        );
    }

    #[tokio::test]
    async fn test_resolve_rejects_invalid_shape() {
        let source = ConfigSource::from_fn(|| {
            Ok(ConnectionConfig {
                servers: Vec::new(),
                ..config()
            })
        });
        assert_matches!(source.resolve().await, Err(Error::Configuration(_)));

        let source = ConfigSource::from_async_fn(|| async { Err("vault unavailable".into()) });
        assert_matches!(source.resolve().await, Err(Error::Configuration(message)) => {
            assert!(message.contains("vault unavailable"));
        });
    }
}

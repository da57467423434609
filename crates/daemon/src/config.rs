// Daemon configuration.
//
// Centralizes environment variable parsing. Variable names match the
// deployment manifests of the sync controller; missing or malformed values
// are fatal at startup.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgSslMode};
use thiserror::Error;
use url::Url;

pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_AUTHORIZATION_URL: &str = "AUTHORIZATION_URL";
pub const ENV_AUTHORIZATION_CA_BUNDLE_PATH: &str = "AUTHORIZATION_CA_BUNDLE_PATH";
pub const ENV_CERTIFICATE_PATH: &str = "CERTIFICATE_PATH";
pub const ENV_KEY_PATH: &str = "KEY_PATH";
pub const ENV_GIT_STORAGE_DIR_PATH: &str = "SUBSCRIPTION_GIT_STORAGE_DIR_PATH";
pub const ENV_SYNC_INTERVAL: &str = "SYNC_INTERVAL";
pub const ENV_FULL_RECONCILIATION_INTERVAL: &str = "FULL_RECONCILIATION_INTERVAL";
pub const ENV_SUBSCRIPTIONS_NAMESPACE: &str = "SUBSCRIPTIONS_NAMESPACE";
pub const ENV_LOG_FILTER: &str = "HUBSYNC_LOG_FILTER";
pub const ENV_LOG_FORMAT: &str = "HUBSYNC_LOG_FORMAT";
pub const ENV_DB_MIN_CONNECTIONS: &str = "HUBSYNC_DB_MIN_CONNECTIONS";
pub const ENV_DB_MAX_CONNECTIONS: &str = "HUBSYNC_DB_MAX_CONNECTIONS";
pub const ENV_DB_ACQUIRE_TIMEOUT_SECS: &str = "HUBSYNC_DB_ACQUIRE_TIMEOUT_SECS";

const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_FULL_RECONCILIATION_INTERVAL: Duration = Duration::from_secs(60 * 60);
const DEFAULT_SUBSCRIPTIONS_NAMESPACE: &str = "hoh-subscriptions";
const DEFAULT_DB_MIN_CONNECTIONS: u32 = 2;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 20;
const DEFAULT_DB_ACQUIRE_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable {0} is not set")]
    Missing(&'static str),

    #[error("invalid DATABASE_URL: {0}")]
    InvalidDatabaseUrl(#[source] sqlx::Error),

    #[error("DATABASE_URL must require TLS; got sslmode={0}. Set sslmode=require or stricter")]
    InsecureDatabase(String),

    #[error("environment variable {var} is not a non-negative integer (`{value}`)")]
    InvalidNumber { var: &'static str, value: String },

    #[error("environment variable {var} is not a valid duration (`{value}`): {source}")]
    InvalidDuration {
        var: &'static str,
        value: String,
        #[source]
        source: humantime::DurationError,
    },

    #[error("environment variable {var} must be a positive duration")]
    ZeroDuration { var: &'static str },

    #[error("invalid authorization url `{value}`: {source}")]
    InvalidUrl {
        value: String,
        #[source]
        source: url::ParseError,
    },

    #[error("authorization url must use https (http is allowed only for localhost testing)")]
    InsecureUrl,

    #[error("CERTIFICATE_PATH and KEY_PATH must be set together")]
    IncompleteClientIdentity,

    #[error("git storage root {0} is not a directory")]
    NotADirectory(PathBuf),

    #[error("unknown log format `{0}` (expected `plain` or `json`)")]
    InvalidLogFormat(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

/// Client certificate presented to the policy engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentityPaths {
    pub certificate_path: PathBuf,
    pub key_path: PathBuf,
}

/// Policy engine endpoint and TLS material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationConfig {
    pub url: Url,
    pub ca_bundle_path: Option<PathBuf>,
    pub client_identity: Option<ClientIdentityPaths>,
}

/// PostgreSQL connection and pool sizing.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub connect_options: PgConnectOptions,
    pub min_connections: u32,
    /// Never below `min_connections`.
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

/// Core daemon configuration.
///
/// Constructed via [`SyncConfig::from_env`].
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Spec and status schemas.
    pub database: DatabaseConfig,
    pub authorization: AuthorizationConfig,
    /// Directory holding one git checkout per subscription.
    pub git_storage_root: PathBuf,
    /// Base polling interval.
    pub sync_interval: Duration,
    /// Period of forced full reconciliation.
    pub full_reconciliation_interval: Duration,
    /// Namespace of the subscription resources.
    pub subscriptions_namespace: String,
    /// Log filter directive (e.g. `info`, `hubsync_daemon=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
}

impl SyncConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `DATABASE_URL` | *(required, sslmode=require or stricter)* |
    /// | `HUBSYNC_DB_MIN_CONNECTIONS` | `2` |
    /// | `HUBSYNC_DB_MAX_CONNECTIONS` | `20` |
    /// | `HUBSYNC_DB_ACQUIRE_TIMEOUT_SECS` | `10` |
    /// | `AUTHORIZATION_URL` | *(required)* |
    /// | `AUTHORIZATION_CA_BUNDLE_PATH` | *(none: endpoint certificate is not verified)* |
    /// | `CERTIFICATE_PATH` / `KEY_PATH` | *(none)* |
    /// | `SUBSCRIPTION_GIT_STORAGE_DIR_PATH` | *(required)* |
    /// | `SYNC_INTERVAL` | `10s` |
    /// | `FULL_RECONCILIATION_INTERVAL` | `1h` |
    /// | `SUBSCRIPTIONS_NAMESPACE` | `hoh-subscriptions` |
    /// | `HUBSYNC_LOG_FILTER` | `info` |
    /// | `HUBSYNC_LOG_FORMAT` | `plain` |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    pub(crate) fn from_env_fn<F>(env: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let required = |var: &'static str| {
            env(var).ok().filter(|value| !value.trim().is_empty()).ok_or(ConfigError::Missing(var))
        };
        let optional = |var: &str| env(var).ok().filter(|value| !value.trim().is_empty());

        let min_connections = parse_number(
            ENV_DB_MIN_CONNECTIONS,
            optional(ENV_DB_MIN_CONNECTIONS),
            DEFAULT_DB_MIN_CONNECTIONS,
        )?;
        let max_connections = parse_number(
            ENV_DB_MAX_CONNECTIONS,
            optional(ENV_DB_MAX_CONNECTIONS),
            DEFAULT_DB_MAX_CONNECTIONS,
        )?;
        let acquire_timeout_secs = parse_number(
            ENV_DB_ACQUIRE_TIMEOUT_SECS,
            optional(ENV_DB_ACQUIRE_TIMEOUT_SECS),
            DEFAULT_DB_ACQUIRE_TIMEOUT_SECS,
        )?;
        let database = DatabaseConfig {
            connect_options: parse_database_url(&required(ENV_DATABASE_URL)?)?,
            min_connections,
            max_connections: max_connections.max(min_connections),
            acquire_timeout: Duration::from_secs(acquire_timeout_secs),
        };

        let raw_url = required(ENV_AUTHORIZATION_URL)?;
        let url = Url::parse(&raw_url)
            .map_err(|source| ConfigError::InvalidUrl { value: raw_url.clone(), source })?;
        validate_authorization_url(&url)?;

        let client_identity = match (optional(ENV_CERTIFICATE_PATH), optional(ENV_KEY_PATH)) {
            (Some(certificate_path), Some(key_path)) => Some(ClientIdentityPaths {
                certificate_path: certificate_path.into(),
                key_path: key_path.into(),
            }),
            (None, None) => None,
            _ => return Err(ConfigError::IncompleteClientIdentity),
        };

        let authorization = AuthorizationConfig {
            url,
            ca_bundle_path: optional(ENV_AUTHORIZATION_CA_BUNDLE_PATH).map(PathBuf::from),
            client_identity,
        };

        let git_storage_root = PathBuf::from(required(ENV_GIT_STORAGE_DIR_PATH)?);
        if !git_storage_root.is_dir() {
            return Err(ConfigError::NotADirectory(git_storage_root));
        }

        let sync_interval =
            parse_duration(ENV_SYNC_INTERVAL, optional(ENV_SYNC_INTERVAL), DEFAULT_SYNC_INTERVAL)?;
        let full_reconciliation_interval = parse_duration(
            ENV_FULL_RECONCILIATION_INTERVAL,
            optional(ENV_FULL_RECONCILIATION_INTERVAL),
            DEFAULT_FULL_RECONCILIATION_INTERVAL,
        )?;

        let subscriptions_namespace = optional(ENV_SUBSCRIPTIONS_NAMESPACE)
            .unwrap_or_else(|| DEFAULT_SUBSCRIPTIONS_NAMESPACE.into());

        let log_filter = optional(ENV_LOG_FILTER).unwrap_or_else(|| "info".into());
        let log_format = match optional(ENV_LOG_FORMAT).as_deref() {
            None | Some("plain") => LogFormat::Plain,
            Some("json") => LogFormat::Json,
            Some(other) => return Err(ConfigError::InvalidLogFormat(other.to_owned())),
        };

        Ok(Self {
            database,
            authorization,
            git_storage_root,
            sync_interval,
            full_reconciliation_interval,
            subscriptions_namespace,
            log_filter,
            log_format,
        })
    }
}

fn parse_database_url(value: &str) -> Result<PgConnectOptions, ConfigError> {
    let options = value.parse::<PgConnectOptions>().map_err(ConfigError::InvalidDatabaseUrl)?;
    match options.get_ssl_mode() {
        PgSslMode::Require | PgSslMode::VerifyCa | PgSslMode::VerifyFull => Ok(options),
        mode => Err(ConfigError::InsecureDatabase(format!("{mode:?}").to_lowercase())),
    }
}

fn parse_number<T: std::str::FromStr>(
    var: &'static str,
    value: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { var, value: value.clone() }),
    }
}

fn parse_duration(
    var: &'static str,
    value: Option<String>,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let Some(value) = value else {
        return Ok(default);
    };
    let parsed = humantime::parse_duration(value.trim())
        .map_err(|source| ConfigError::InvalidDuration { var, value: value.clone(), source })?;
    if parsed.is_zero() {
        return Err(ConfigError::ZeroDuration { var });
    }
    Ok(parsed)
}

fn validate_authorization_url(url: &Url) -> Result<(), ConfigError> {
    match url.scheme() {
        "https" => Ok(()),
        "http" if is_loopback_host(url.host_str()) => Ok(()),
        _ => Err(ConfigError::InsecureUrl),
    }
}

fn is_loopback_host(host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .is_ok_and(|addr| addr.is_loopback())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from_map(
        map: HashMap<&'static str, String>,
    ) -> impl Fn(&str) -> Result<String, std::env::VarError> {
        move |key: &str| map.get(key).cloned().ok_or(std::env::VarError::NotPresent)
    }

    fn base_env(root: &tempfile::TempDir) -> HashMap<&'static str, String> {
        let mut m = HashMap::new();
        m.insert(ENV_DATABASE_URL, "postgres://u:p@db/hoh?sslmode=require".to_string());
        m.insert(ENV_AUTHORIZATION_URL, "https://opa.example.svc:8181".to_string());
        m.insert(ENV_GIT_STORAGE_DIR_PATH, root.path().display().to_string());
        m
    }

    #[test]
    fn defaults_when_only_required_vars_are_set() {
        let root = tempfile::tempdir().expect("tempdir");
        let cfg = SyncConfig::from_env_fn(env_from_map(base_env(&root))).expect("valid config");

        assert_eq!(cfg.sync_interval, Duration::from_secs(10));
        assert_eq!(cfg.full_reconciliation_interval, Duration::from_secs(3600));
        assert_eq!(cfg.subscriptions_namespace, "hoh-subscriptions");
        assert_eq!(cfg.log_filter, "info");
        assert_eq!(cfg.log_format, LogFormat::Plain);
        assert!(cfg.authorization.ca_bundle_path.is_none());
        assert!(cfg.authorization.client_identity.is_none());
        assert_eq!(cfg.git_storage_root, root.path());
    }

    #[test]
    fn database_defaults_and_pool_overrides() {
        let root = tempfile::tempdir().expect("tempdir");
        let cfg = SyncConfig::from_env_fn(env_from_map(base_env(&root))).expect("valid config");
        assert_eq!(cfg.database.min_connections, 2);
        assert_eq!(cfg.database.max_connections, 20);
        assert_eq!(cfg.database.acquire_timeout, Duration::from_secs(10));
        assert_eq!(cfg.database.connect_options.get_database(), Some("hoh"));

        let mut m = base_env(&root);
        m.insert(ENV_DB_MIN_CONNECTIONS, "8".to_string());
        m.insert(ENV_DB_MAX_CONNECTIONS, "3".to_string());
        m.insert(ENV_DB_ACQUIRE_TIMEOUT_SECS, "30".to_string());
        let cfg = SyncConfig::from_env_fn(env_from_map(m)).expect("valid config");
        assert_eq!(cfg.database.min_connections, 8);
        assert_eq!(cfg.database.max_connections, 8);
        assert_eq!(cfg.database.acquire_timeout, Duration::from_secs(30));
    }

    #[test]
    fn malformed_pool_size_is_rejected() {
        let root = tempfile::tempdir().expect("tempdir");
        let mut m = base_env(&root);
        m.insert(ENV_DB_MAX_CONNECTIONS, "many".to_string());
        let error = SyncConfig::from_env_fn(env_from_map(m)).expect_err("bad pool size");
        assert!(matches!(
            error,
            ConfigError::InvalidNumber { var: ENV_DB_MAX_CONNECTIONS, ref value } if value == "many"
        ));
    }

    #[test]
    fn database_url_must_require_tls() {
        let root = tempfile::tempdir().expect("tempdir");
        let mut m = base_env(&root);
        m.insert(ENV_DATABASE_URL, "postgres://u:p@db/hoh?sslmode=verify-full".to_string());
        assert!(SyncConfig::from_env_fn(env_from_map(m.clone())).is_ok());

        m.insert(ENV_DATABASE_URL, "postgres://u:p@db/hoh?sslmode=prefer".to_string());
        let error = SyncConfig::from_env_fn(env_from_map(m)).expect_err("plaintext allowed");
        assert!(matches!(&error, ConfigError::InsecureDatabase(mode) if mode == "prefer"));
        assert!(error.to_string().contains("must require TLS"));
    }

    #[test]
    fn missing_database_url_is_fatal() {
        let root = tempfile::tempdir().expect("tempdir");
        let mut m = base_env(&root);
        m.remove(ENV_DATABASE_URL);
        let error = SyncConfig::from_env_fn(env_from_map(m)).expect_err("missing db url");
        assert!(matches!(error, ConfigError::Missing(ENV_DATABASE_URL)));
    }

    #[test]
    fn sync_interval_uses_humantime_syntax() {
        let root = tempfile::tempdir().expect("tempdir");
        let mut m = base_env(&root);
        m.insert(ENV_SYNC_INTERVAL, "1m 30s".to_string());
        let cfg = SyncConfig::from_env_fn(env_from_map(m)).expect("valid config");
        assert_eq!(cfg.sync_interval, Duration::from_secs(90));
    }

    #[test]
    fn invalid_sync_interval_is_rejected() {
        let root = tempfile::tempdir().expect("tempdir");
        let mut m = base_env(&root);
        m.insert(ENV_SYNC_INTERVAL, "soon".to_string());
        let error = SyncConfig::from_env_fn(env_from_map(m)).expect_err("bad duration");
        assert!(matches!(error, ConfigError::InvalidDuration { var: ENV_SYNC_INTERVAL, .. }));
    }

    #[test]
    fn zero_sync_interval_is_rejected() {
        let root = tempfile::tempdir().expect("tempdir");
        let mut m = base_env(&root);
        m.insert(ENV_SYNC_INTERVAL, "0s".to_string());
        let error = SyncConfig::from_env_fn(env_from_map(m)).expect_err("zero duration");
        assert!(matches!(error, ConfigError::ZeroDuration { .. }));
    }

    #[test]
    fn plain_http_is_allowed_only_for_loopback() {
        let root = tempfile::tempdir().expect("tempdir");
        let mut m = base_env(&root);
        m.insert(ENV_AUTHORIZATION_URL, "http://127.0.0.1:8181".to_string());
        assert!(SyncConfig::from_env_fn(env_from_map(m.clone())).is_ok());

        m.insert(ENV_AUTHORIZATION_URL, "http://opa.example.svc:8181".to_string());
        let error = SyncConfig::from_env_fn(env_from_map(m)).expect_err("insecure url");
        assert!(matches!(error, ConfigError::InsecureUrl));
    }

    #[test]
    fn client_identity_requires_both_paths() {
        let root = tempfile::tempdir().expect("tempdir");
        let mut m = base_env(&root);
        m.insert(ENV_CERTIFICATE_PATH, "/certs/tls.crt".to_string());
        let error = SyncConfig::from_env_fn(env_from_map(m.clone())).expect_err("half identity");
        assert!(matches!(error, ConfigError::IncompleteClientIdentity));

        m.insert(ENV_KEY_PATH, "/certs/tls.key".to_string());
        let cfg = SyncConfig::from_env_fn(env_from_map(m)).expect("valid config");
        let identity = cfg.authorization.client_identity.expect("identity configured");
        assert_eq!(identity.certificate_path, PathBuf::from("/certs/tls.crt"));
        assert_eq!(identity.key_path, PathBuf::from("/certs/tls.key"));
    }

    #[test]
    fn storage_root_must_exist() {
        let root = tempfile::tempdir().expect("tempdir");
        let mut m = base_env(&root);
        m.insert(ENV_GIT_STORAGE_DIR_PATH, root.path().join("missing").display().to_string());
        let error = SyncConfig::from_env_fn(env_from_map(m)).expect_err("missing root");
        assert!(matches!(error, ConfigError::NotADirectory(_)));
    }

    #[test]
    fn log_format_override() {
        let root = tempfile::tempdir().expect("tempdir");
        let mut m = base_env(&root);
        m.insert(ENV_LOG_FORMAT, "json".to_string());
        m.insert(ENV_LOG_FILTER, "hubsync_daemon=debug".to_string());
        let cfg = SyncConfig::from_env_fn(env_from_map(m.clone())).expect("valid config");
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(cfg.log_filter, "hubsync_daemon=debug");

        m.insert(ENV_LOG_FORMAT, "xml".to_string());
        let error = SyncConfig::from_env_fn(env_from_map(m)).expect_err("bad format");
        assert!(matches!(error, ConfigError::InvalidLogFormat(_)));
    }
}

// Policy engine client: partial evaluation over HTTPS.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;
use url::Url;

use super::residual::{CompileResponse, CLUSTER_VARIABLE, INPUT_VARIABLE};
use crate::config::AuthorizationConfig;

/// Policy rule deciding whether a user may place labels on a cluster.
pub const CLUSTER_ACCESS_QUERY: &str = "data.rbac.clusters.allow == true";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("failed to read {what} from {path}: {source}")]
    ReadPem {
        what: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid {what}: {source}")]
    Tls {
        what: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("invalid policy engine url: {0}")]
    Url(#[from] url::ParseError),

    #[error("policy engine request failed: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("policy engine returned status {0}")]
    Status(u16),

    #[error("failed to decode policy engine response: {0}")]
    Decode(#[source] reqwest::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyInput {
    pub user: String,
}

/// Body of a `POST /v1/compile` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompileRequest {
    pub input: PolicyInput,
    pub query: String,
    pub unknowns: Vec<String>,
}

impl CompileRequest {
    /// Partially evaluate cluster access for `user`, leaving the cluster unknown.
    pub fn cluster_access(user: &str) -> Self {
        Self {
            input: PolicyInput { user: user.to_owned() },
            query: CLUSTER_ACCESS_QUERY.to_owned(),
            unknowns: vec![format!("{INPUT_VARIABLE}.{CLUSTER_VARIABLE}")],
        }
    }
}

#[async_trait]
pub trait PolicyEngine: Send + Sync {
    async fn compile(&self, request: &CompileRequest) -> Result<CompileResponse, PolicyError>;
}

/// `reqwest` client for the policy engine's compile API.
#[derive(Debug, Clone)]
pub struct PolicyClient {
    http: reqwest::Client,
    compile_url: Url,
}

impl PolicyClient {
    /// Build a client from configuration, loading PEM material from disk.
    ///
    /// Without a CA bundle the endpoint certificate is not verified.
    pub fn new(config: &AuthorizationConfig) -> Result<Self, PolicyError> {
        let mut builder = reqwest::Client::builder().use_rustls_tls().timeout(REQUEST_TIMEOUT);

        match &config.ca_bundle_path {
            Some(path) => {
                let pem = read_pem("CA bundle", path)?;
                let certificates = reqwest::Certificate::from_pem_bundle(&pem)
                    .map_err(|source| PolicyError::Tls { what: "CA bundle", source })?;
                builder = builder.tls_built_in_root_certs(false);
                for certificate in certificates {
                    builder = builder.add_root_certificate(certificate);
                }
            }
            None => {
                warn!(
                    url = %config.url,
                    "no authorization CA bundle configured; policy engine certificate will not be verified"
                );
                builder = builder.danger_accept_invalid_certs(true);
            }
        }

        if let Some(identity) = &config.client_identity {
            let mut pem = read_pem("client certificate", &identity.certificate_path)?;
            pem.push(b'\n');
            pem.extend(read_pem("client key", &identity.key_path)?);
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|source| PolicyError::Tls { what: "client identity", source })?;
            builder = builder.identity(identity);
        }

        let http =
            builder.build().map_err(|source| PolicyError::Tls { what: "tls setup", source })?;
        Self::with_http_client(http, &config.url)
    }

    pub fn with_http_client(http: reqwest::Client, base_url: &Url) -> Result<Self, PolicyError> {
        Ok(Self { http, compile_url: compile_url(base_url)? })
    }

    pub fn compile_url(&self) -> &Url {
        &self.compile_url
    }
}

#[async_trait]
impl PolicyEngine for PolicyClient {
    async fn compile(&self, request: &CompileRequest) -> Result<CompileResponse, PolicyError> {
        let response = self
            .http
            .post(self.compile_url.clone())
            .json(request)
            .send()
            .await
            .map_err(PolicyError::Transport)?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(PolicyError::Status(status.as_u16()));
        }

        response.json::<CompileResponse>().await.map_err(PolicyError::Decode)
    }
}

fn compile_url(base: &Url) -> Result<Url, PolicyError> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    Ok(base.join("v1/compile")?)
}

fn read_pem(what: &'static str, path: &Path) -> Result<Vec<u8>, PolicyError> {
    std::fs::read(path).map_err(|source| PolicyError::ReadPem {
        what,
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn compile_request_declares_cluster_unknown() {
        let request = CompileRequest::cluster_access("alice");
        let body = serde_json::to_value(&request).expect("request serializes");
        assert_eq!(
            body,
            json!({
                "input": {"user": "alice"},
                "query": "data.rbac.clusters.allow == true",
                "unknowns": ["input.cluster"]
            })
        );
    }

    #[test]
    fn compile_url_appends_to_base_path() {
        let url = Url::parse("https://opa.example:8181").expect("url");
        assert_eq!(compile_url(&url).expect("join").as_str(), "https://opa.example:8181/v1/compile");

        let url = Url::parse("https://gateway.example/opa").expect("url");
        assert_eq!(compile_url(&url).expect("join").as_str(), "https://gateway.example/opa/v1/compile");

        let url = Url::parse("https://gateway.example/opa/").expect("url");
        assert_eq!(compile_url(&url).expect("join").as_str(), "https://gateway.example/opa/v1/compile");
    }

    #[test]
    fn missing_ca_bundle_file_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = AuthorizationConfig {
            url: Url::parse("https://opa.example").expect("url"),
            ca_bundle_path: Some(dir.path().join("absent.pem")),
            client_identity: None,
        };

        let error = PolicyClient::new(&config).expect_err("missing bundle");
        assert!(matches!(error, PolicyError::ReadPem { what: "CA bundle", .. }));
    }

    #[test]
    fn client_without_ca_bundle_builds() {
        let config = AuthorizationConfig {
            url: Url::parse("https://opa.example/base").expect("url"),
            ca_bundle_path: None,
            client_identity: None,
        };

        let client = PolicyClient::new(&config).expect("client builds");
        assert_eq!(client.compile_url().as_str(), "https://opa.example/base/v1/compile");
    }
}

//! Endpoint and credential configuration

use crate::error::{ProxmoxError, Result};
use pveflow_core::{EndpointConfig, Profile};
use std::time::Duration;

pub const TOKEN_ID_ENV: &str = "PVE_TOKEN_ID";
pub const TOKEN_SECRET_ENV: &str = "PVE_TOKEN_SECRET";

/// Connection settings for one Proxmox VE endpoint
#[derive(Clone)]
pub struct ProxmoxConfig {
    /// Base URL, e.g. `https://pve.lab:8006`
    pub base_url: String,

    /// Node that guests are created on
    pub node: String,

    /// API token id (`user@realm!name`)
    pub token_id: String,

    pub token_secret: String,

    /// Accept self-signed certificates
    pub insecure_tls: bool,

    /// Per-request timeout
    pub request_timeout: Duration,
}

impl std::fmt::Debug for ProxmoxConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxmoxConfig")
            .field("base_url", &self.base_url)
            .field("node", &self.node)
            .field("token_id", &self.token_id)
            .field("token_secret", &"<redacted>")
            .field("insecure_tls", &self.insecure_tls)
            .finish()
    }
}

impl ProxmoxConfig {
    pub fn new(
        base_url: impl Into<String>,
        node: impl Into<String>,
        token_id: impl Into<String>,
        token_secret: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            node: node.into(),
            token_id: token_id.into(),
            token_secret: token_secret.into(),
            insecure_tls: false,
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Build from the endpoint block, reading the token from the environment
    pub fn from_env(endpoint: &EndpointConfig, node: &str) -> Result<Self> {
        if endpoint.url.trim().is_empty() {
            return Err(ProxmoxError::InvalidConfig(
                "endpoint url is empty".to_string(),
            ));
        }
        let token_id = std::env::var(TOKEN_ID_ENV)
            .map_err(|_| ProxmoxError::MissingEnvVar(TOKEN_ID_ENV.to_string()))?;
        let token_secret = std::env::var(TOKEN_SECRET_ENV)
            .map_err(|_| ProxmoxError::MissingEnvVar(TOKEN_SECRET_ENV.to_string()))?;

        let node = endpoint.node.clone().unwrap_or_else(|| node.to_string());
        Ok(Self::new(&endpoint.url, node, token_id, token_secret)
            .with_insecure_tls(endpoint.insecure_tls))
    }

    pub fn with_insecure_tls(mut self, insecure: bool) -> Self {
        self.insecure_tls = insecure;
        self
    }

    /// Disabling certificate validation is never allowed for production
    pub fn check_profile(&self, environment: &str, profile: Profile) -> Result<()> {
        if self.insecure_tls && profile == Profile::Production {
            return Err(ProxmoxError::InsecureTlsRefused(environment.to_string()));
        }
        Ok(())
    }

    /// `Authorization` header value
    pub(crate) fn auth_header(&self) -> String {
        format!("PVEAPIToken={}={}", self.token_id, self.token_secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn endpoint(insecure: bool) -> EndpointConfig {
        EndpointConfig {
            url: "https://pve.lab:8006/".to_string(),
            node: None,
            insecure_tls: insecure,
        }
    }

    #[test]
    #[serial]
    fn test_from_env() {
        temp_env::with_vars(
            [
                (TOKEN_ID_ENV, Some("automation@pve!pveflow")),
                (TOKEN_SECRET_ENV, Some("s3cr3t")),
            ],
            || {
                let config = ProxmoxConfig::from_env(&endpoint(true), "pve").unwrap();
                assert_eq!(config.base_url, "https://pve.lab:8006");
                assert_eq!(config.node, "pve");
                assert!(config.insecure_tls);
                assert_eq!(
                    config.auth_header(),
                    "PVEAPIToken=automation@pve!pveflow=s3cr3t"
                );
                assert!(!format!("{:?}", config).contains("s3cr3t"));
            },
        );
    }

    #[test]
    #[serial]
    fn test_from_env_missing_secret() {
        temp_env::with_vars(
            [
                (TOKEN_ID_ENV, Some("automation@pve!pveflow")),
                (TOKEN_SECRET_ENV, None),
            ],
            || {
                let err = ProxmoxConfig::from_env(&endpoint(false), "pve").unwrap_err();
                assert!(matches!(err, ProxmoxError::MissingEnvVar(ref v) if v == TOKEN_SECRET_ENV));
            },
        );
    }

    #[test]
    fn test_insecure_tls_refused_for_production() {
        let config = ProxmoxConfig::new("https://pve:8006", "pve", "id", "secret")
            .with_insecure_tls(true);
        assert!(matches!(
            config.check_profile("prod", Profile::Production),
            Err(ProxmoxError::InsecureTlsRefused(_))
        ));
        assert!(config.check_profile("dev", Profile::Lab).is_ok());

        let secure = config.with_insecure_tls(false);
        assert!(secure.check_profile("prod", Profile::Production).is_ok());
    }
}

use std::fmt::Debug;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_IDENTITY_ENDPOINT: &str =
    "https://identitytoolkit.googleapis.com/v1/accounts:lookup";

const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Checks identity tokens presented on write requests.
pub trait IdentityVerifier: Send + Sync + Debug {
    /// Returns `true` only when the token belongs to a signed-in user.
    fn verify(&self, token: &str) -> bool;
}

/// Credentials for the hosted identity token service, loaded from a JSON file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityConfig {
    pub api_key: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_endpoint() -> String {
    DEFAULT_IDENTITY_ENDPOINT.to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl IdentityConfig {
    /// Read identity service credentials from `path`.
    ///
    /// # Errors
    /// Returns an error when the file is unreadable, not JSON, or has an empty `api_key`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read identity config {}", path.display()))?;
        let config: Self = serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse identity config {}", path.display()))?;
        if config.api_key.trim().is_empty() {
            return Err(anyhow!("identity config {} has an empty api_key", path.display()));
        }
        Ok(config)
    }
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    users: Vec<serde_json::Value>,
}

/// Verifies tokens by looking up the account they were issued for.
#[derive(Debug, Clone)]
pub struct IdentityToolkitVerifier {
    config: IdentityConfig,
    agent: ureq::Agent,
}

impl IdentityToolkitVerifier {
    #[must_use]
    pub fn new(config: IdentityConfig) -> Self {
        let agent =
            ureq::AgentBuilder::new().timeout(Duration::from_secs(config.timeout_secs)).build();
        Self { config, agent }
    }
}

impl IdentityVerifier for IdentityToolkitVerifier {
    fn verify(&self, token: &str) -> bool {
        let response = self
            .agent
            .post(&self.config.endpoint)
            .query("key", &self.config.api_key)
            .send_json(serde_json::json!({ "idToken": token }));

        match response {
            Ok(response) => match response.into_json::<LookupResponse>() {
                Ok(lookup) => !lookup.users.is_empty(),
                Err(err) => {
                    tracing::error!(error = %err, "failed to decode identity lookup response");
                    false
                }
            },
            Err(ureq::Error::Status(status, _)) => {
                tracing::warn!(status, "identity token rejected");
                false
            }
            Err(err) => {
                tracing::error!(error = %err, "identity lookup failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(body: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("classbook-identity-{}.json", ulid::Ulid::new()));
        std::fs::write(&path, body)
            .unwrap_or_else(|err| panic!("failed to write identity fixture: {err}"));
        path
    }

    // Test IDs: TID-001
    #[test]
    fn identity_config_applies_defaults() -> Result<()> {
        let path = write_config(r#"{"api_key":"k-123"}"#);
        let config = IdentityConfig::from_file(&path)?;

        assert_eq!(config.api_key, "k-123");
        assert_eq!(config.endpoint, DEFAULT_IDENTITY_ENDPOINT);
        assert_eq!(config.timeout_secs, DEFAULT_TIMEOUT_SECS);

        let _ = std::fs::remove_file(&path);
        Ok(())
    }

    // Test IDs: TID-002
    #[test]
    fn identity_config_rejects_blank_key_and_missing_file() {
        let path = write_config(r#"{"api_key":"  "}"#);
        assert!(IdentityConfig::from_file(&path).is_err());
        let _ = std::fs::remove_file(&path);

        let missing = std::env::temp_dir().join(format!("classbook-missing-{}.json", ulid::Ulid::new()));
        assert!(IdentityConfig::from_file(&missing).is_err());
    }

    // Test IDs: TID-003
    #[test]
    fn unreachable_identity_service_counts_as_invalid() {
        let verifier = IdentityToolkitVerifier::new(IdentityConfig {
            api_key: "k-123".to_string(),
            endpoint: "http://127.0.0.1:9/v1/accounts:lookup".to_string(),
            timeout_secs: 1,
        });

        assert!(!verifier.verify("token"));
    }
}

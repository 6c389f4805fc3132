//! Configuration loader for Waypoint.
//!
//! Reads `waypoint.toml` from the data directory and deserializes it into
//! [`WaypointConfig`]: the engine settings (`[engine]`), the authorisation
//! policy (`[security]`) and the event signing key ring (`[signing]`).
//!
//! [`load_engine_config`] is lenient and falls back to defaults when the
//! file is missing or malformed. [`load_engine_config_strict`] surfaces
//! read and parse errors instead.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::Deserialize;
use waypoint_types::config::{EngineConfig, SecurityConfig};

use crate::security::signer::HmacEventSigner;

/// File name looked up inside the data directory.
pub const CONFIG_FILE_NAME: &str = "waypoint.toml";

/// Errors surfaced by the strict loader.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("signing.active_key_id '{0}' has no matching entry in signing.keys")]
    UnknownActiveKey(String),
}

/// Event signing key ring. Secrets never leave `SecretString`.
#[derive(Debug, Default)]
pub struct SigningConfig {
    pub active_key_id: Option<String>,
    pub keys: BTreeMap<String, SecretString>,
}

impl SigningConfig {
    /// Turn the key ring into a signer.
    pub fn into_signer(self) -> HmacEventSigner {
        HmacEventSigner::with_keys(self.keys, self.active_key_id)
    }
}

/// Everything read from `waypoint.toml`.
#[derive(Debug, Default)]
pub struct WaypointConfig {
    /// Engine settings, with `[security]` folded into `engine.security`.
    pub engine: EngineConfig,
    pub signing: SigningConfig,
}

// On-disk shape. Key material is read as plain strings and wrapped right
// after parsing.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    engine: EngineConfig,
    #[serde(default)]
    security: Option<SecurityConfig>,
    #[serde(default)]
    signing: SigningFile,
}

#[derive(Debug, Default, Deserialize)]
struct SigningFile {
    #[serde(default)]
    active_key_id: Option<String>,
    #[serde(default)]
    keys: BTreeMap<String, String>,
}

impl ConfigFile {
    fn into_config(self) -> Result<WaypointConfig, ConfigError> {
        let mut engine = self.engine;
        if let Some(security) = self.security {
            engine.security = security;
        }

        if let Some(active) = &self.signing.active_key_id {
            if !self.signing.keys.contains_key(active) {
                return Err(ConfigError::UnknownActiveKey(active.clone()));
            }
        }
        let keys = self
            .signing
            .keys
            .into_iter()
            .map(|(id, secret)| (id, SecretString::from(secret)))
            .collect();

        Ok(WaypointConfig {
            engine,
            signing: SigningConfig {
                active_key_id: self.signing.active_key_id,
                keys,
            },
        })
    }
}

/// Load configuration from `{data_dir}/waypoint.toml`.
///
/// - If the file does not exist, returns the defaults.
/// - If the file cannot be read or parsed, logs a warning and returns the defaults.
/// - Otherwise returns the parsed config.
pub async fn load_engine_config(data_dir: &Path) -> WaypointConfig {
    let config_path = data_dir.join(CONFIG_FILE_NAME);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No {CONFIG_FILE_NAME} found at {}, using defaults", config_path.display());
            return WaypointConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return WaypointConfig::default();
        }
    };

    match parse(&config_path, &content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("{err}, using defaults");
            WaypointConfig::default()
        }
    }
}

/// Like [`load_engine_config`], but a missing file is the only case that
/// yields defaults; read, parse and key-ring errors are returned.
pub async fn load_engine_config_strict(data_dir: &Path) -> Result<WaypointConfig, ConfigError> {
    let config_path = data_dir.join(CONFIG_FILE_NAME);

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(WaypointConfig::default());
        }
        Err(source) => {
            return Err(ConfigError::Io {
                path: config_path,
                source,
            });
        }
    };

    parse(&config_path, &content)
}

fn parse(path: &Path, content: &str) -> Result<WaypointConfig, ConfigError> {
    let file: ConfigFile = toml::from_str(content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    file.into_config()
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use serde_json::json;
    use tempfile::TempDir;

    const FULL: &str = r#"
[engine]
max_jumps = 7
auto_resume_interval_secs = 5
strict_branching = true

[security]
admin_users = ["root"]
trusted_publishers = ["billing"]

[security.flow_type_grants]
payout = ["finance"]

[signing]
active_key_id = "k2"

[signing.keys]
k1 = "old-secret"
k2 = "new-secret"
"#;

    #[tokio::test]
    async fn load_engine_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.engine, EngineConfig::default());
        assert!(config.signing.keys.is_empty());
    }

    #[tokio::test]
    async fn load_engine_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join(CONFIG_FILE_NAME), FULL)
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.engine.max_jumps, 7);
        assert_eq!(config.engine.auto_resume_interval_secs, 5);
        assert!(config.engine.strict_branching);
        assert_eq!(config.engine.event_ttl_secs, 300);
        assert!(config.engine.security.is_admin("root"));
        assert_eq!(
            config.engine.security.flow_type_grants["payout"],
            vec!["finance".to_string()]
        );
        assert_eq!(config.signing.active_key_id.as_deref(), Some("k2"));
        assert_eq!(config.signing.keys["k1"].expose_secret(), "old-secret");
    }

    #[tokio::test]
    async fn load_engine_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join(CONFIG_FILE_NAME), "this is not { valid toml !!!")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.engine, EngineConfig::default());
    }

    #[tokio::test]
    async fn strict_loader_surfaces_parse_errors() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join(CONFIG_FILE_NAME), "[engine]\nmax_jumps = \"lots\"")
            .await
            .unwrap();

        let err = load_engine_config_strict(tmp.path()).await.unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[tokio::test]
    async fn strict_loader_rejects_dangling_active_key() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join(CONFIG_FILE_NAME),
            "[signing]\nactive_key_id = \"k9\"\n[signing.keys]\nk1 = \"x\"\n",
        )
        .await
        .unwrap();

        let err = load_engine_config_strict(tmp.path()).await.unwrap_err();
        assert!(matches!(err, ConfigError::UnknownActiveKey(ref id) if id == "k9"));
    }

    #[tokio::test]
    async fn strict_loader_missing_file_is_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config_strict(tmp.path()).await.unwrap();
        assert_eq!(config.engine.max_jumps, 100);
    }

    #[tokio::test]
    async fn signing_config_builds_a_working_signer() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join(CONFIG_FILE_NAME), FULL)
            .await
            .unwrap();
        let config = load_engine_config_strict(tmp.path()).await.unwrap();

        let signer = config.signing.into_signer();
        let event = signer.sign("ping", json!({}), "billing", None).unwrap();
        assert_eq!(event.key_id, "k2");
        assert!(signer.verify(&event).is_ok());
    }
}

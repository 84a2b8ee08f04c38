use serde::{Deserialize, Serialize};

use crate::error::{CourierError, CourierResult};

/// Minimum PBKDF2 work factor accepted for key backups
pub const MIN_BACKUP_ITERATIONS: u32 = 100_000;

/// Upper bound on the PBKDF2 work factor, for backups created and restored
pub const MAX_BACKUP_ITERATIONS: u32 = 10_000_000;

/// Top-level client configuration (loaded from courier.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    pub logging: LoggingConfig,
    pub backend: BackendConfig,
    pub keys: KeysConfig,
    pub upload: UploadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the messaging backend REST API
    pub base_url: String,
    /// This device's user id on the backend
    pub user_id: String,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
    /// Reject plaintext HTTP base URLs instead of warning
    pub enforce_tls: bool,
    /// Environment variable holding the bearer token
    pub access_token_env: String,
}

/// Secure key storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// Platform keychain service name
    pub keychain_service: String,
    /// Keychain entry holding the base64 master key
    pub master_key_entry: String,
    /// How long crypto operations wait for key initialization
    pub readiness_timeout_ms: u64,
    /// PBKDF2-HMAC-SHA256 iterations for password backups
    pub backup_pbkdf2_iterations: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Files at or above this size use the chunked path (default: 8 MiB)
    pub small_file_threshold: u64,
    /// Chunk uploads allowed in flight at once
    pub max_in_flight_chunks: usize,
    /// Longest edge of generated thumbnails, in pixels
    pub thumbnail_max_dimension: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".into(),
            user_id: String::new(),
            request_timeout_secs: 30,
            enforce_tls: false,
            access_token_env: "COURIER_TOKEN".into(),
        }
    }
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            keychain_service: "courier".into(),
            master_key_entry: "e2ee-master-key".into(),
            readiness_timeout_ms: 5000,
            backup_pbkdf2_iterations: MIN_BACKUP_ITERATIONS,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            small_file_threshold: 8 * 1024 * 1024,
            max_in_flight_chunks: 4,
            thumbnail_max_dimension: 200,
        }
    }
}

impl CourierConfig {
    /// Parse a TOML document; missing sections fall back to defaults.
    pub fn from_toml_str(s: &str) -> CourierResult<Self> {
        let config: CourierConfig =
            toml::from_str(s).map_err(|e| CourierError::Config(format!("parsing config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> CourierResult<()> {
        if self.upload.max_in_flight_chunks == 0 {
            return Err(CourierError::Config(
                "upload.max_in_flight_chunks must be at least 1".into(),
            ));
        }
        if !(MIN_BACKUP_ITERATIONS..=MAX_BACKUP_ITERATIONS)
            .contains(&self.keys.backup_pbkdf2_iterations)
        {
            return Err(CourierError::Config(format!(
                "keys.backup_pbkdf2_iterations must be between {MIN_BACKUP_ITERATIONS} and {MAX_BACKUP_ITERATIONS}"
            )));
        }
        if self.keys.master_key_entry.is_empty() {
            return Err(CourierError::Config("keys.master_key_entry is empty".into()));
        }
        if self.backend.base_url.starts_with("http://") && self.backend.enforce_tls {
            return Err(CourierError::Config(format!(
                "backend base_url uses plaintext HTTP ({}), but enforce_tls is enabled",
                self.backend.base_url
            )));
        }
        Ok(())
    }

    /// Settings that are accepted but unsafe in production.
    ///
    /// Returned rather than logged: config is loaded before logging starts.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.backend.base_url.starts_with("http://") {
            warnings.push(format!(
                "backend uses plaintext HTTP ({}); set backend.enforce_tls = true in production",
                self.backend.base_url
            ));
        }
        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[logging]
level = "debug"
format = "json"

[backend]
base_url = "https://chat.example.com/api"
user_id = "alice"
request_timeout_secs = 10
enforce_tls = true

[keys]
keychain_service = "courier-test"
master_key_entry = "mk"
readiness_timeout_ms = 250
backup_pbkdf2_iterations = 200000

[upload]
small_file_threshold = 1048576
max_in_flight_chunks = 8
thumbnail_max_dimension = 128
"#;
        let config = CourierConfig::from_toml_str(toml_str).unwrap();

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.backend.base_url, "https://chat.example.com/api");
        assert_eq!(config.backend.user_id, "alice");
        assert!(config.backend.enforce_tls);
        assert_eq!(config.keys.keychain_service, "courier-test");
        assert_eq!(config.keys.readiness_timeout_ms, 250);
        assert_eq!(config.keys.backup_pbkdf2_iterations, 200_000);
        assert_eq!(config.upload.small_file_threshold, 1_048_576);
        assert_eq!(config.upload.max_in_flight_chunks, 8);
    }

    #[test]
    fn test_parse_defaults() {
        let config = CourierConfig::from_toml_str("").unwrap();

        assert_eq!(config.logging.level, "info");
        assert_eq!(config.backend.base_url, "http://localhost:8080");
        assert_eq!(config.backend.request_timeout_secs, 30);
        assert!(!config.backend.enforce_tls);
        assert_eq!(config.keys.master_key_entry, "e2ee-master-key");
        assert_eq!(config.keys.readiness_timeout_ms, 5000);
        assert_eq!(config.upload.small_file_threshold, 8 * 1024 * 1024);
        assert_eq!(config.upload.max_in_flight_chunks, 4);
    }

    #[test]
    fn test_http_with_enforce_tls_rejected() {
        let toml_str = r#"
[backend]
base_url = "http://insecure:8080"
enforce_tls = true
"#;
        let err = CourierConfig::from_toml_str(toml_str).unwrap_err();
        assert!(err.to_string().contains("enforce_tls"));
    }

    #[test]
    fn test_low_iterations_rejected() {
        let toml_str = r#"
[keys]
backup_pbkdf2_iterations = 1000
"#;
        assert!(matches!(
            CourierConfig::from_toml_str(toml_str),
            Err(CourierError::Config(_))
        ));
    }

    #[test]
    fn test_excessive_iterations_rejected() {
        let mut config = CourierConfig::default();
        config.keys.backup_pbkdf2_iterations = MAX_BACKUP_ITERATIONS + 1;
        assert!(matches!(config.validate(), Err(CourierError::Config(_))));
    }

    #[test]
    fn test_plaintext_http_is_a_warning() {
        let config = CourierConfig::default();
        config.validate().unwrap();
        let warnings = config.warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("http://localhost:8080"));

        let mut config = CourierConfig::default();
        config.backend.base_url = "https://chat.example.com".into();
        assert!(config.warnings().is_empty());
    }

    #[test]
    fn test_zero_in_flight_rejected() {
        let mut config = CourierConfig::default();
        config.upload.max_in_flight_chunks = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = CourierConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: CourierConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.backend.base_url, parsed.backend.base_url);
        assert_eq!(config.keys.master_key_entry, parsed.keys.master_key_entry);
        assert_eq!(
            config.upload.small_file_threshold,
            parsed.upload.small_file_threshold
        );
    }
}

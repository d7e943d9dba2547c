//! Application configuration management.
//!
//! Configuration is layered with the `config` crate:
//!
//! 1. built-in defaults (every field has one)
//! 2. an optional TOML file (`HYDROSNAP_CONFIG`, or the platform config path)
//! 3. `HYDROSNAP__<SECTION>__<KEY>` environment variables
//!
//! ```toml
//! [qr]
//! secret = "..."
//! verify_integrity = true
//!
//! [location]
//! freshness_window_secs = 300
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::CacheSettings;
use crate::codec::{PayloadCodec, SiteKey};
use crate::descriptor::{DescriptorValidator, DEFAULT_GEOFENCE_RADIUS_METERS};
use crate::issuer::{TokenIssuer, DEFAULT_TOKEN_VALIDITY_DAYS};
use crate::storage::default_data_dir;

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "HYDROSNAP_CONFIG";

/// Prefix of configuration override variables (`HYDROSNAP__QR__SECRET`).
pub const ENV_PREFIX: &str = "HYDROSNAP";

/// Errors that can occur when loading, saving, or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file does not exist.
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    /// Failed to write the configuration file.
    #[error("Failed to write configuration file {path}: {source}")]
    WriteError {
        /// Path to the file.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The layered sources could not be merged or deserialized.
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] ::config::ConfigError),

    /// Failed to serialize configuration to TOML.
    #[error("Failed to serialize configuration: {0}")]
    SerializeError(#[from] toml::ser::Error),

    /// A configuration value is invalid.
    #[error("Invalid configuration for '{field}': {message}")]
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// Description of the validation failure.
        message: String,
    },

    /// Multiple validation errors occurred.
    #[error("Configuration has {} validation errors", .0.len())]
    MultipleValidationErrors(Vec<ConfigError>),

    /// No configuration directory could be determined.
    #[error("Cannot determine configuration directory")]
    NoConfigDir,
}

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Main application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// QR decoding and validation.
    pub qr: QrSettings,
    /// Geofence defaults.
    pub geofence: GeofenceSettings,
    /// Location fetching and caching.
    pub location: LocationSettings,
    /// Persistent storage.
    pub storage: StorageSettings,
    /// HTTP server.
    pub server: ServerSettings,
}

/// QR decoding and validation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QrSettings {
    /// Shared secret the site keys are derived from. Never written back to disk.
    #[serde(skip_serializing)]
    pub secret: Option<String>,
    /// Check the embedded `validationHash`.
    pub verify_integrity: bool,
    /// Reject codes past their `expiresAt`.
    pub enforce_expiry: bool,
    /// Validity of issued tokens, in days.
    pub token_validity_days: i64,
}

impl Default for QrSettings {
    fn default() -> Self {
        Self {
            secret: None,
            verify_integrity: true,
            enforce_expiry: true,
            token_validity_days: DEFAULT_TOKEN_VALIDITY_DAYS,
        }
    }
}

/// Geofence settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeofenceSettings {
    /// Radius applied to sites whose payload carries none.
    pub default_radius_meters: f64,
}

impl Default for GeofenceSettings {
    fn default() -> Self {
        Self {
            default_radius_meters: DEFAULT_GEOFENCE_RADIUS_METERS,
        }
    }
}

/// Location fetching and caching settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationSettings {
    /// Maximum cached-entry age served without fetching.
    pub freshness_window_secs: u64,
    /// Maximum age accepted for a last-known fix.
    pub last_known_max_age_secs: u64,
    /// Timeout for a single provider fetch.
    pub fetch_timeout_secs: u64,
    /// Device reports younger than this count as current fixes.
    pub report_fresh_within_secs: u64,
}

impl Default for LocationSettings {
    fn default() -> Self {
        Self {
            freshness_window_secs: 300,
            last_known_max_age_secs: 900,
            fetch_timeout_secs: 15,
            report_fresh_within_secs: 10,
        }
    }
}

/// Persistent storage settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Data directory; the platform default when unset.
    pub data_dir: Option<PathBuf>,
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Socket address to listen on.
    pub bind_address: String,
    /// Production mode (JSON file logging).
    pub production: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".to_string(),
            production: false,
        }
    }
}

impl Config {
    /// Load configuration from `path`, overridden by environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotFound`] if `path` does not exist, or
    /// [`ConfigError::ParseError`] if the sources cannot be merged.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        Self::load_layered(Some(path), None)
    }

    /// Load configuration from `HYDROSNAP_CONFIG` or the platform default
    /// path, falling back to defaults when no file exists.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ParseError`] if the sources cannot be merged.
    pub fn load_default() -> ConfigResult<Self> {
        let path = match std::env::var_os(CONFIG_PATH_ENV) {
            Some(path) => PathBuf::from(path),
            None => Self::default_path()?,
        };
        if path.exists() {
            Self::load_layered(Some(&path), None)
        } else {
            Self::load_layered(None, None)
        }
    }

    /// Default configuration file path.
    ///
    /// On Linux devices: `/etc/hydrosnap/config.toml`
    /// Elsewhere: the platform config directory
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoConfigDir`] if the platform directory is unknown.
    pub fn default_path() -> ConfigResult<PathBuf> {
        #[cfg(target_os = "linux")]
        {
            Ok(PathBuf::from("/etc/hydrosnap/config.toml"))
        }
        #[cfg(not(target_os = "linux"))]
        {
            directories::ProjectDirs::from("", "", "hydrosnap")
                .map(|dirs| dirs.config_dir().join("config.toml"))
                .ok_or(ConfigError::NoConfigDir)
        }
    }

    fn load_layered(path: Option<&Path>, env: Option<::config::Map<String, String>>) -> ConfigResult<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Toml)
                    .required(true),
            );
        }
        let config = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// Save configuration as TOML. The QR secret is never written.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::WriteError {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::WriteError {
            path: path.display().to_string(),
            source,
        })
    }

    /// Check every value, reporting all problems at once.
    ///
    /// # Errors
    ///
    /// Returns a single [`ConfigError::ValidationError`], or
    /// [`ConfigError::MultipleValidationErrors`] when several fields fail.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();
        let mut fail = |field: &str, message: &str| {
            errors.push(ConfigError::ValidationError {
                field: field.to_string(),
                message: message.to_string(),
            });
        };

        if self.qr.secret.as_deref().is_some_and(|s| s.trim().is_empty()) {
            fail("qr.secret", "must not be empty when set");
        }
        if self.qr.token_validity_days <= 0 {
            fail("qr.token_validity_days", "must be positive");
        }
        let radius = self.geofence.default_radius_meters;
        if !radius.is_finite() || radius < 0.0 {
            fail("geofence.default_radius_meters", "must be a non-negative number");
        }
        for (field, value) in [
            ("location.freshness_window_secs", self.location.freshness_window_secs),
            ("location.last_known_max_age_secs", self.location.last_known_max_age_secs),
            ("location.fetch_timeout_secs", self.location.fetch_timeout_secs),
            ("location.report_fresh_within_secs", self.location.report_fresh_within_secs),
        ] {
            if value == 0 {
                fail(field, "must be greater than zero");
            }
        }
        if self.server.bind_address.parse::<SocketAddr>().is_err() {
            fail("server.bind_address", "must be a socket address like 0.0.0.0:3000");
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::MultipleValidationErrors(errors)),
        }
    }

    /// Key derived from `qr.secret`, if one is configured.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the secret cannot produce a key.
    pub fn site_key(&self) -> ConfigResult<Option<SiteKey>> {
        self.qr
            .secret
            .as_deref()
            .map(|secret| {
                SiteKey::derive(secret).map_err(|e| ConfigError::ValidationError {
                    field: "qr.secret".to_string(),
                    message: e.to_string(),
                })
            })
            .transpose()
    }

    /// Payload codec for the configured key.
    ///
    /// # Errors
    ///
    /// See [`Config::site_key`].
    pub fn codec(&self) -> ConfigResult<PayloadCodec> {
        Ok(PayloadCodec::new(self.site_key()?))
    }

    /// Token issuer for the configured key, if one is configured.
    ///
    /// # Errors
    ///
    /// See [`Config::site_key`].
    pub fn issuer(&self) -> ConfigResult<Option<TokenIssuer>> {
        let validity = chrono::Duration::days(self.qr.token_validity_days);
        Ok(self
            .site_key()?
            .map(|key| TokenIssuer::new(key).with_validity(validity)))
    }

    /// Descriptor validator with the configured checks.
    #[must_use]
    pub const fn validator(&self) -> DescriptorValidator {
        DescriptorValidator::new()
            .with_integrity_check(self.qr.verify_integrity)
            .with_expiry_check(self.qr.enforce_expiry)
            .with_default_radius(self.geofence.default_radius_meters)
    }

    /// Location cache tuning.
    #[must_use]
    pub const fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            freshness_window: Duration::from_secs(self.location.freshness_window_secs),
            last_known_max_age: Duration::from_secs(self.location.last_known_max_age_secs),
            fetch_timeout: self.fetch_timeout(),
        }
    }

    /// Timeout for a single provider fetch.
    #[must_use]
    pub const fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.location.fetch_timeout_secs)
    }

    /// Age under which a device report counts as a current fix.
    #[must_use]
    pub const fn report_fresh_within(&self) -> Duration {
        Duration::from_secs(self.location.report_fresh_within_secs)
    }

    /// Data directory: the configured one, or the platform default.
    ///
    /// # Errors
    ///
    /// Returns an error if no directory is configured and the platform
    /// default cannot be determined.
    pub fn data_dir(&self) -> ConfigResult<PathBuf> {
        match &self.storage.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_data_dir().map_err(|e| ConfigError::ValidationError {
                field: "storage.data_dir".to_string(),
                message: e.to_string(),
            }),
        }
    }
}

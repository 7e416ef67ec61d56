//! Konfiguration
//!
//! Reihenfolge (später gewinnt): Standardwerte, optionale TOML-Datei,
//! Umgebungsvariablen. Alle Felder haben Standardwerte, ohne Datei ist die
//! App lauffähig.

use crate::call::ControllerTimings;
use crate::ice::IceSettings;
use crate::peer::ManagerTimings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: &'static str, value: String },

    #[error("{key} must be greater than zero")]
    ZeroTiming { key: &'static str },
}

// ============================================================================
// RELAY POLICY
// ============================================================================

/// Wann nur TURN-Relay Kandidaten verwendet werden
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayPolicy {
    /// Nur in bekannten In-App-Browsern (Kandidatenverlust)
    #[default]
    Auto,
    Always,
    Never,
}

/// User-Agent Kennungen von In-App-Browsern
const IN_APP_BROWSER_MARKERS: &[&str] = &["FBAN", "FBAV", "Instagram", "Line/", "Snapchat"];

impl RelayPolicy {
    /// Entscheidet ob Relay erzwungen wird
    pub fn resolve(&self, user_agent: Option<&str>) -> bool {
        match self {
            Self::Always => true,
            Self::Never => false,
            Self::Auto => user_agent.is_some_and(|ua| {
                IN_APP_BROWSER_MARKERS
                    .iter()
                    .any(|marker| ua.contains(marker))
            }),
        }
    }
}

impl std::str::FromStr for RelayPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "always" => Ok(Self::Always),
            "never" => Ok(Self::Never),
            _ => Err(()),
        }
    }
}

// ============================================================================
// CONFIG
// ============================================================================

/// Zeitwerte (Millisekunden bzw. Sekunden)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    /// Polling-Intervall des Datenbank-Fallbacks
    pub poll_interval_ms: u64,
    pub stale_after_secs: u64,
    pub ring_timeout_secs: u64,
    pub ice_gathering_timeout_ms: u64,
    pub connect_timeout_secs: u64,
    pub failed_grace_ms: u64,
    pub prewarm_window_ms: u64,
    pub ended_display_ms: u64,
    /// Aufbewahrung beendeter Calls
    pub history_retention_secs: u64,
    /// Gültigkeit angeforderter TURN-Credentials
    pub credential_ttl_secs: u64,
    pub dynamic_cache_ttl_secs: u64,
    pub fallback_cache_ttl_secs: u64,
    pub credential_fetch_timeout_ms: u64,
}

impl Timings {
    /// Diese Werte dürfen nicht 0 sein (Intervalle und Zeitfenster)
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("poll_interval_ms", self.poll_interval_ms),
            ("stale_after_secs", self.stale_after_secs),
            ("ring_timeout_secs", self.ring_timeout_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
        ];
        match required.into_iter().find(|(_, value)| *value == 0) {
            Some((key, _)) => Err(ConfigError::ZeroTiming { key }),
            None => Ok(()),
        }
    }
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1500,
            stale_after_secs: 60,
            ring_timeout_secs: 60,
            ice_gathering_timeout_ms: 3000,
            connect_timeout_secs: 30,
            failed_grace_ms: 3000,
            prewarm_window_ms: 5000,
            ended_display_ms: 500,
            history_retention_secs: 7 * 24 * 60 * 60,
            credential_ttl_secs: 86_400,
            dynamic_cache_ttl_secs: 72_000,
            fallback_cache_ttl_secs: 300,
            credential_fetch_timeout_ms: 5000,
        }
    }
}

/// Vollständige Konfiguration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// WebSocket-Relay für den Broadcast-Pfad (optional)
    pub signaling_url: Option<String>,
    /// Endpoint für TURN-Credentials (optional)
    pub turn_endpoint: Option<String>,
    pub turn_api_key: Option<String>,
    /// Datenbankdatei, sonst App-Datenverzeichnis
    pub database_path: Option<PathBuf>,
    pub relay_policy: RelayPolicy,
    /// Für die Relay-Heuristik
    pub user_agent: Option<String>,
    pub timings: Timings,
}

impl CallConfig {
    /// Lädt die TOML-Datei; fehlt sie, gelten die Standardwerte
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let config: Self =
                    toml::from_str(&content).map_err(|source| ConfigError::Parse {
                        path: path.to_path_buf(),
                        source,
                    })?;
                config.timings.validate()?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("Config file {:?} not found, using defaults", path);
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Standardwerte plus Umgebungsvariablen
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Überschreibt Felder aus `CALL_*` Umgebungsvariablen
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_vars(|key| std::env::var(key).ok())
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(url) = var("CALL_SIGNALING_URL") {
            self.signaling_url = Some(url);
        }
        if let Some(endpoint) = var("CALL_TURN_ENDPOINT") {
            self.turn_endpoint = Some(endpoint);
        }
        if let Some(key) = var("CALL_TURN_API_KEY") {
            self.turn_api_key = Some(key);
        }
        if let Some(path) = var("CALL_DATABASE_PATH") {
            self.database_path = Some(PathBuf::from(path));
        }
        if let Some(policy) = var("CALL_RELAY_POLICY") {
            self.relay_policy = policy.parse().map_err(|_| ConfigError::InvalidEnv {
                key: "CALL_RELAY_POLICY",
                value: policy,
            })?;
        }
        if let Some(value) = var("CALL_POLL_INTERVAL_MS") {
            self.timings.poll_interval_ms =
                value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                    key: "CALL_POLL_INTERVAL_MS",
                    value,
                })?;
        }
        self.timings.validate()
    }

    pub fn force_relay(&self) -> bool {
        self.relay_policy.resolve(self.user_agent.as_deref())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.timings.poll_interval_ms)
    }

    pub fn prewarm_window(&self) -> Duration {
        Duration::from_millis(self.timings.prewarm_window_ms)
    }

    pub fn ice_settings(&self) -> IceSettings {
        let t = &self.timings;
        IceSettings {
            credential_ttl: Duration::from_secs(t.credential_ttl_secs),
            dynamic_cache_ttl: Duration::from_secs(t.dynamic_cache_ttl_secs),
            fallback_cache_ttl: Duration::from_secs(t.fallback_cache_ttl_secs),
            fetch_timeout: Duration::from_millis(t.credential_fetch_timeout_ms),
            ..IceSettings::default()
        }
    }

    pub fn controller_timings(&self) -> ControllerTimings {
        let t = &self.timings;
        ControllerTimings {
            stale_after: Duration::from_secs(t.stale_after_secs),
            ring_timeout: Duration::from_secs(t.ring_timeout_secs),
            ended_display: Duration::from_millis(t.ended_display_ms),
            history_retention: Duration::from_secs(t.history_retention_secs),
        }
    }

    pub fn manager_timings(&self) -> ManagerTimings {
        let t = &self.timings;
        ManagerTimings {
            ice_gathering_timeout: Duration::from_millis(t.ice_gathering_timeout_ms),
            connect_timeout: Duration::from_secs(t.connect_timeout_secs),
            failed_grace: Duration::from_millis(t.failed_grace_ms),
        }
    }
}

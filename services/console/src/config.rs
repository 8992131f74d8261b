//! Console configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/metrowatch/console.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `server.base_url`
//!
//! Everything else defaults.  Credentials are NOT configured here — they
//! live in the persisted profile (see `profile.rs`).
//!
//! Per-feed staleness thresholds are explicit named fields: slow feeds
//! (weather) tolerate hours, fast feeds (incidents) only seconds.

use mw_protocol::GeoPoint;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config types (validated)
// ---------------------------------------------------------------------------

/// Top-level console configuration.
#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    pub schema_version: u32,
    pub server: ServerConfig,
    pub backoff: BackoffConfig,
    /// Keep-alive resync cadence while connected.
    pub keepalive: Duration,
    /// Health monitor sampling cadence.
    pub health_sample: Duration,
    pub alerts: AlertConfig,
    pub staleness: StalenessConfig,
    /// Fixed client position, reported upstream once per session when set.
    pub client_position: Option<GeoPoint>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP(S) base, e.g. `https://ops.example.com`.
    pub base_url: String,
    pub stream_path: String,
    pub api_path: String,
}

impl ServerConfig {
    /// WebSocket URL for the push stream (`ws://` / `wss://`).
    pub fn stream_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_owned()
        };
        format!("{ws_base}{}", self.stream_path)
    }

    /// HTTP base for the snapshot endpoints.
    pub fn api_base(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.api_path)
    }
}

#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Cap for the exponential reconnect delay.
    pub max_interval: Duration,
    /// A connection must stay open this long before the retry streak resets.
    pub stability_window: Duration,
}

#[derive(Debug, Clone)]
pub struct AlertConfig {
    /// Most-recent alerts retained before eviction kicks in.
    pub capacity: usize,
    /// Alerts older than this are expired on sweep even below capacity.
    pub retention: Duration,
    /// Notifications self-destruct after this, acknowledged or not.
    pub notification_ttl: Duration,
}

/// Fresh/critical staleness bounds for one feed.
#[derive(Debug, Clone, Copy)]
pub struct FeedThresholds {
    pub fresh: Duration,
    pub critical: Duration,
}

#[derive(Debug, Clone)]
pub struct StalenessConfig {
    pub incidents: FeedThresholds,
    pub traffic: FeedThresholds,
    pub weather: FeedThresholds,
    pub presence: FeedThresholds,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    server: Option<RawServerConfig>,
    backoff: Option<RawBackoffConfig>,
    keepalive_secs: Option<u64>,
    health_sample_secs: Option<u64>,
    alerts: Option<RawAlertConfig>,
    staleness: Option<RawStalenessConfig>,
    client: Option<RawClientConfig>,
}

#[derive(Debug, Deserialize)]
struct RawServerConfig {
    base_url: Option<String>,
    stream_path: Option<String>,
    api_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawBackoffConfig {
    max_interval_secs: Option<u64>,
    stability_window_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawAlertConfig {
    capacity: Option<usize>,
    retention_hours: Option<u64>,
    notification_ttl_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawFeedThresholds {
    fresh_secs: Option<u64>,
    critical_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawStalenessConfig {
    incidents: Option<RawFeedThresholds>,
    traffic: Option<RawFeedThresholds>,
    weather: Option<RawFeedThresholds>,
    presence: Option<RawFeedThresholds>,
}

#[derive(Debug, Deserialize)]
struct RawClientConfig {
    lat: Option<f64>,
    lon: Option<f64>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load console config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<ConsoleConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load console config from the default path `/etc/metrowatch/console.toml`.
pub fn load_config() -> Result<ConsoleConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/metrowatch/console.toml"))
}

/// Load console config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<ConsoleConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {schema_version}"
        )));
    }

    let raw_server = raw
        .server
        .ok_or_else(|| ConfigError::MissingField("server".to_owned()))?;
    let base_url = raw_server
        .base_url
        .ok_or_else(|| ConfigError::MissingField("server.base_url".to_owned()))?;
    let server = ServerConfig {
        base_url,
        stream_path: raw_server
            .stream_path
            .unwrap_or_else(|| "/ws/v1/dashboard".to_owned()),
        api_path: raw_server.api_path.unwrap_or_else(|| "/api/v1".to_owned()),
    };

    let backoff = match raw.backoff {
        Some(b) => BackoffConfig {
            max_interval: Duration::from_secs(b.max_interval_secs.unwrap_or(30)),
            stability_window: Duration::from_secs(b.stability_window_secs.unwrap_or(60)),
        },
        None => BackoffConfig {
            max_interval: Duration::from_secs(30),
            stability_window: Duration::from_secs(60),
        },
    };

    let alerts = match raw.alerts {
        Some(a) => AlertConfig {
            capacity: a.capacity.unwrap_or(50),
            retention: Duration::from_secs(a.retention_hours.unwrap_or(24) * 3600),
            notification_ttl: Duration::from_secs(a.notification_ttl_secs.unwrap_or(5)),
        },
        None => AlertConfig {
            capacity: 50,
            retention: Duration::from_secs(24 * 3600),
            notification_ttl: Duration::from_secs(5),
        },
    };
    if alerts.capacity == 0 {
        return Err(ConfigError::InvalidValue(
            "alerts.capacity must be at least 1".to_owned(),
        ));
    }

    let staleness = resolve_staleness(raw.staleness);

    let client_position = match raw.client {
        Some(RawClientConfig {
            lat: Some(lat),
            lon: Some(lon),
        }) => Some(GeoPoint { lat, lon }),
        Some(RawClientConfig { lat: None, lon: None }) | None => None,
        Some(_) => {
            return Err(ConfigError::InvalidValue(
                "client.lat and client.lon must be set together".to_owned(),
            ));
        }
    };

    Ok(ConsoleConfig {
        schema_version,
        server,
        backoff,
        keepalive: Duration::from_secs(raw.keepalive_secs.unwrap_or(30)),
        health_sample: Duration::from_secs(raw.health_sample_secs.unwrap_or(30)),
        alerts,
        staleness,
        client_position,
    })
}

fn resolve_thresholds(raw: Option<RawFeedThresholds>, fresh: u64, critical: u64) -> FeedThresholds {
    let raw = raw.unwrap_or(RawFeedThresholds {
        fresh_secs: None,
        critical_secs: None,
    });
    FeedThresholds {
        fresh: Duration::from_secs(raw.fresh_secs.unwrap_or(fresh)),
        critical: Duration::from_secs(raw.critical_secs.unwrap_or(critical)),
    }
}

fn resolve_staleness(raw: Option<RawStalenessConfig>) -> StalenessConfig {
    let raw = raw.unwrap_or(RawStalenessConfig {
        incidents: None,
        traffic: None,
        weather: None,
        presence: None,
    });
    StalenessConfig {
        incidents: resolve_thresholds(raw.incidents, 60, 600),
        traffic: resolve_thresholds(raw.traffic, 120, 600),
        weather: resolve_thresholds(raw.weather, 3600, 6 * 3600),
        presence: resolve_thresholds(raw.presence, 300, 1800),
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        schema_version = 1
        [server]
        base_url = "https://ops.example.com"
    "#;

    #[test]
    fn minimal_config_applies_defaults() {
        let cfg = load_config_from_str(MINIMAL).expect("load");
        assert_eq!(cfg.server.stream_path, "/ws/v1/dashboard");
        assert_eq!(cfg.keepalive, Duration::from_secs(30));
        assert_eq!(cfg.health_sample, Duration::from_secs(30));
        assert_eq!(cfg.alerts.capacity, 50);
        assert_eq!(cfg.alerts.notification_ttl, Duration::from_secs(5));
        assert_eq!(cfg.backoff.max_interval, Duration::from_secs(30));
        assert_eq!(cfg.staleness.weather.fresh, Duration::from_secs(3600));
        assert_eq!(cfg.staleness.incidents.fresh, Duration::from_secs(60));
        assert!(cfg.client_position.is_none());
    }

    #[test]
    fn stream_url_switches_scheme() {
        let cfg = load_config_from_str(MINIMAL).expect("load");
        assert_eq!(
            cfg.server.stream_url(),
            "wss://ops.example.com/ws/v1/dashboard"
        );

        let cfg = load_config_from_str(
            r#"
            schema_version = 1
            [server]
            base_url = "http://127.0.0.1:8080/"
            "#,
        )
        .expect("load");
        assert_eq!(cfg.server.stream_url(), "ws://127.0.0.1:8080/ws/v1/dashboard");
        assert_eq!(cfg.server.api_base(), "http://127.0.0.1:8080/api/v1");
    }

    #[test]
    fn missing_schema_version_is_rejected() {
        let err = load_config_from_str(
            r#"
            [server]
            base_url = "https://ops.example.com"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(f) if f == "schema_version"));
    }

    #[test]
    fn wrong_schema_version_is_rejected() {
        let err = load_config_from_str(
            r#"
            schema_version = 2
            [server]
            base_url = "https://ops.example.com"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn missing_base_url_is_rejected() {
        let err = load_config_from_str(
            r#"
            schema_version = 1
            [server]
            stream_path = "/ws"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(f) if f == "server.base_url"));
    }

    #[test]
    fn per_feed_thresholds_override_independently() {
        let cfg = load_config_from_str(
            r#"
            schema_version = 1
            [server]
            base_url = "https://ops.example.com"
            [staleness.incidents]
            fresh_secs = 10
            critical_secs = 120
            "#,
        )
        .expect("load");
        assert_eq!(cfg.staleness.incidents.fresh, Duration::from_secs(10));
        assert_eq!(cfg.staleness.incidents.critical, Duration::from_secs(120));
        // Untouched feeds keep their own defaults.
        assert_eq!(cfg.staleness.traffic.fresh, Duration::from_secs(120));
    }

    #[test]
    fn client_position_requires_both_coordinates() {
        let err = load_config_from_str(
            r#"
            schema_version = 1
            [server]
            base_url = "https://ops.example.com"
            [client]
            lat = 51.5
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));

        let cfg = load_config_from_str(
            r#"
            schema_version = 1
            [server]
            base_url = "https://ops.example.com"
            [client]
            lat = 51.5
            lon = -0.12
            "#,
        )
        .expect("load");
        let pos = cfg.client_position.expect("position");
        assert!((pos.lat - 51.5).abs() < f64::EPSILON);
    }

    #[test]
    fn zero_alert_capacity_is_rejected() {
        let err = load_config_from_str(
            r#"
            schema_version = 1
            [server]
            base_url = "https://ops.example.com"
            [alerts]
            capacity = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }
}

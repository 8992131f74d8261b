// mw-protocol: dashboard wire contract types and serialization.
//
// All stream messages use a top-level `kind` field for discriminated
// deserialization.  The enum variants map 1:1 to the topic names the
// backend emits; a handful of legacy topics keep their kebab-case names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Shared record types
// ---------------------------------------------------------------------------

/// Incident severity bucket.
///
/// Anything the backend sends that is not a known bucket (or an absent
/// field) lands in `Unknown` rather than failing the whole document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
    #[default]
    Unknown,
}

impl<'de> Deserialize<'de> for Severity {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "low" => Severity::Low,
            "medium" => Severity::Medium,
            "high" => Severity::High,
            "critical" => Severity::Critical,
            _ => Severity::Unknown,
        })
    }
}

/// A geographic point (WGS84 degrees).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

/// A single incident record.
///
/// `updated_at` is the ordering metadata for merges; the backend does not
/// always populate it, so consumers must tolerate its absence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    #[serde(default)]
    pub title: String,
    /// Free-form category, e.g. "fire", "collision".  Named `category` on
    /// the wire because `kind` is the message tag.
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default)]
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<GeoPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Current conditions for one location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherReport {
    pub location: String,
    #[serde(default)]
    pub conditions: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Traffic incidents grouped by location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficArea {
    pub location: String,
    #[serde(default)]
    pub incidents: Vec<Incident>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionCount {
    pub region: String,
    pub count: u64,
}

/// One connect/disconnect observation in the presence timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceSample {
    pub user: String,
    pub connected: bool,
    pub at: DateTime<Utc>,
}

/// Aggregate user/session statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserStats {
    #[serde(default)]
    pub online: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_region: Option<String>,
    #[serde(default)]
    pub timeline: Vec<PresenceSample>,
    #[serde(default)]
    pub per_region: Vec<RegionCount>,
}

// ---------------------------------------------------------------------------
// Server -> client stream messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherUpdate {
    pub reports: Vec<WeatherReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodaysIncidentsUpdate {
    pub count: u64,
    #[serde(default)]
    pub date: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficUpdate {
    pub areas: Vec<TrafficArea>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticalIncidents {
    pub amount: u64,
    #[serde(default)]
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncidentLocations {
    pub points: Vec<GeoPoint>,
}

/// Free-form diagnostic log line (`new-incident` / `new-traffic` topics).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub entry: String,
}

/// Scalar gauge update (`amt-*` topics).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterUpdate {
    pub amount: u64,
}

/// Presence diagnostic (`user-connected` / `user-disconnected`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceNote {
    pub user: String,
}

/// Frozen error codes the backend sends on the stream.
pub mod error_codes {
    pub const INVALID_TOKEN: &str = "INVALID_TOKEN";
    pub const SESSION_EXPIRED: &str = "SESSION_EXPIRED";
    pub const PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// Protocol error message (server -> client).
///
/// | Code            | Retryable |
/// |-----------------|-----------|
/// | INVALID_TOKEN   | false     |
/// | SESSION_EXPIRED | true      |
/// | PROTOCOL_ERROR  | false     |
/// | INTERNAL_ERROR  | true      |
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

/// All stream message kinds the backend pushes.
///
/// Serializes/deserializes using the `kind` field as a tag.
///
/// ```json
/// { "kind": "weatherUpdate", "reports": [...] }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ServerMessage {
    #[serde(rename = "weatherUpdate")]
    WeatherUpdate(WeatherUpdate),
    #[serde(rename = "userStatsUpdate")]
    UserStatsUpdate(UserStats),
    #[serde(rename = "todaysIncidentsUpdate")]
    TodaysIncidentsUpdate(TodaysIncidentsUpdate),
    #[serde(rename = "trafficUpdate")]
    TrafficUpdate(TrafficUpdate),
    #[serde(rename = "criticalIncidents")]
    CriticalIncidents(CriticalIncidents),
    #[serde(rename = "incidentLocations")]
    IncidentLocations(IncidentLocations),
    /// A single incident that qualifies for the alert queue.
    #[serde(rename = "newAlert")]
    NewAlert(Incident),
    #[serde(rename = "new-incident")]
    NewIncidentLog(LogEntry),
    #[serde(rename = "new-traffic")]
    NewTrafficLog(LogEntry),
    #[serde(rename = "amt-users-online")]
    UsersOnline(CounterUpdate),
    #[serde(rename = "amt-active-incidents")]
    ActiveIncidents(CounterUpdate),
    #[serde(rename = "amt-critical-incidents")]
    CriticalIncidentCount(CounterUpdate),
    #[serde(rename = "user-connected")]
    UserConnected(PresenceNote),
    #[serde(rename = "user-disconnected")]
    UserDisconnected(PresenceNote),
    #[serde(rename = "error")]
    Error(ErrorMessage),
}

// ---------------------------------------------------------------------------
// Client -> server control messages
// ---------------------------------------------------------------------------

/// Session authentication payload, sent once per successful connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authenticate {
    pub token: String,
    pub user: String,
}

/// Optional geolocation report, sent at most once per session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationReport {
    pub point: GeoPoint,
}

/// Control messages this client sends upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ClientMessage {
    #[serde(rename = "authenticate")]
    Authenticate(Authenticate),
    /// Explicit full-resync request: on connect and from the keep-alive timer.
    #[serde(rename = "request-stats")]
    RequestStats,
    #[serde(rename = "new-location")]
    NewLocation(LocationReport),
}

// ---------------------------------------------------------------------------
// Snapshot (REST) response documents
// ---------------------------------------------------------------------------

/// `GET /api/v1/incidents/stats` — the incident baseline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IncidentStatsDoc {
    #[serde(default)]
    pub incidents: Vec<Incident>,
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub active: u64,
}

/// `GET /api/v1/incidents/today`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TodayCountDoc {
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub date: String,
}

/// `GET /api/v1/traffic` — traffic incidents grouped by location.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrafficDoc {
    #[serde(default)]
    pub areas: Vec<TrafficArea>,
}

/// `GET /api/v1/incidents/critical`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CriticalCountDoc {
    #[serde(default)]
    pub amount: u64,
    #[serde(default)]
    pub label: String,
}

/// `GET /api/v1/incidents/locations`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocationsDoc {
    #[serde(default)]
    pub points: Vec<GeoPoint>,
}

/// `GET /api/v1/users/stats` — shares the stream's [`UserStats`] shape.
pub type UserStatsDoc = UserStats;

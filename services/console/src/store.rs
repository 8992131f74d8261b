//! Reconciliation store: the authoritative in-memory operational picture.
//!
//! Two writers feed it — snapshot seeds and stream events — and both go
//! through the same merge rules:
//!
//! - items are keyed by stable domain ID; a later write for the same key
//!   replaces, never duplicates;
//! - snapshot writes carry a generation and are rejected when older than
//!   the domain's current generation;
//! - stream writes with `updated_at` metadata lose against a newer stored
//!   value, otherwise last write wins;
//! - full-domain replacement builds the new map off to the side and swaps
//!   it in as one assignment, so readers never observe a half-replaced
//!   domain;
//! - `last_updated` never regresses.
//!
//! Client-position enrichment is a separate field that no server-sourced
//! write touches.

use chrono::{DateTime, Utc};
use mw_protocol::{
    GeoPoint, Incident, PresenceSample, ServerMessage, TrafficArea, UserStats, WeatherReport,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::debug;

const EVENT_LOG_CAP: usize = 100;

// ---------------------------------------------------------------------------
// Feed items
// ---------------------------------------------------------------------------

/// A record that can live in a feed: stable key plus optional ordering
/// metadata.
pub trait FeedItem {
    fn key(&self) -> &str;
    fn updated_at(&self) -> Option<DateTime<Utc>>;
}

impl FeedItem for Incident {
    fn key(&self) -> &str {
        &self.id
    }
    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }
}

impl FeedItem for TrafficArea {
    fn key(&self) -> &str {
        &self.location
    }
    fn updated_at(&self) -> Option<DateTime<Utc>> {
        None
    }
}

impl FeedItem for WeatherReport {
    fn key(&self) -> &str {
        &self.location
    }
    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }
}

impl FeedItem for PresenceSample {
    fn key(&self) -> &str {
        &self.user
    }
    fn updated_at(&self) -> Option<DateTime<Utc>> {
        Some(self.at)
    }
}

// ---------------------------------------------------------------------------
// FeedState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Incidents,
    Traffic,
    Weather,
    Presence,
}

impl Domain {
    pub const ALL: [Domain; 4] = [
        Domain::Incidents,
        Domain::Traffic,
        Domain::Weather,
        Domain::Presence,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedSource {
    Snapshot,
    Stream,
}

/// One synchronized domain: keyed items plus merge metadata.
#[derive(Debug, Clone)]
pub struct FeedState<T> {
    pub items: HashMap<String, T>,
    pub last_updated: Option<DateTime<Utc>>,
    pub source: Option<FeedSource>,
    pub generation: u64,
}

impl<T: FeedItem> FeedState<T> {
    fn new() -> Self {
        Self {
            items: HashMap::new(),
            last_updated: None,
            source: None,
            generation: 0,
        }
    }

    /// Full replace from a snapshot.  Returns false (leaving the feed
    /// untouched) when `generation` is older than what is already applied.
    fn apply_snapshot(&mut self, generation: u64, items: Vec<T>, now: DateTime<Utc>) -> bool {
        if generation < self.generation {
            debug!(generation, current = self.generation, "stale snapshot rejected");
            return false;
        }
        // Build the replacement map completely before publishing it.
        let mut next = HashMap::with_capacity(items.len());
        for item in items {
            next.insert(item.key().to_owned(), item);
        }
        self.items = next;
        self.generation = generation;
        self.source = Some(FeedSource::Snapshot);
        self.touch(now);
        true
    }

    /// Full replace from a bulk stream push (no generation involved).
    fn replace_from_stream(&mut self, items: Vec<T>, now: DateTime<Utc>) {
        let mut next = HashMap::with_capacity(items.len());
        for item in items {
            next.insert(item.key().to_owned(), item);
        }
        self.items = next;
        self.source = Some(FeedSource::Stream);
        self.touch(now);
    }

    /// Partial upsert from a stream event.  When both sides carry
    /// `updated_at`, the older write loses; otherwise last write wins.
    fn apply_event(&mut self, item: T, now: DateTime<Utc>) {
        let key = item.key().to_owned();
        if let (Some(existing), Some(incoming)) = (
            self.items.get(&key).and_then(FeedItem::updated_at),
            item.updated_at(),
        ) && incoming < existing
        {
            debug!(key = %key, "out-of-order event ignored");
            return;
        }
        let event_time = item.updated_at().unwrap_or(now);
        self.items.insert(key, item);
        self.source = Some(FeedSource::Stream);
        self.touch(event_time);
    }

    fn touch(&mut self, at: DateTime<Utc>) {
        self.last_updated = Some(match self.last_updated {
            Some(prev) => prev.max(at),
            None => at,
        });
    }
}

// ---------------------------------------------------------------------------
// Scalar gauges
// ---------------------------------------------------------------------------

/// Headline counters pushed by the backend alongside the feeds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Gauges {
    pub online_users: u64,
    pub active_incidents: u64,
    pub critical_incidents: u64,
    pub critical_label: String,
    pub todays_incidents: u64,
    pub todays_date: String,
}

// ---------------------------------------------------------------------------
// ReconciliationStore
// ---------------------------------------------------------------------------

struct StoreInner {
    incidents: FeedState<Incident>,
    traffic: FeedState<TrafficArea>,
    weather: FeedState<WeatherReport>,
    presence: FeedState<PresenceSample>,
    gauges: Gauges,
    incident_locations: Vec<GeoPoint>,
    client_position: Option<GeoPoint>,
    event_log: VecDeque<String>,
    next_generation: u64,
    started_at: DateTime<Utc>,
}

/// Thread-safe handle to the store.  All mutation goes through these
/// methods; no lock is ever held across an await point.
#[derive(Clone)]
pub struct ReconciliationStore {
    inner: Arc<RwLock<StoreInner>>,
}

impl ReconciliationStore {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(StoreInner {
                incidents: FeedState::new(),
                traffic: FeedState::new(),
                weather: FeedState::new(),
                presence: FeedState::new(),
                gauges: Gauges::default(),
                incident_locations: Vec::new(),
                client_position: None,
                event_log: VecDeque::new(),
                next_generation: 0,
                started_at: now,
            })),
        }
    }

    /// Allocate the generation for a new snapshot pass.  Later generations
    /// always beat earlier ones, whatever order their responses land in.
    pub fn begin_snapshot(&self) -> u64 {
        let mut inner = self.inner.write().unwrap();
        inner.next_generation += 1;
        inner.next_generation
    }

    pub fn apply_incident_snapshot(
        &self,
        generation: u64,
        items: Vec<Incident>,
        now: DateTime<Utc>,
    ) -> bool {
        self.inner
            .write()
            .unwrap()
            .incidents
            .apply_snapshot(generation, items, now)
    }

    pub fn apply_traffic_snapshot(
        &self,
        generation: u64,
        items: Vec<TrafficArea>,
        now: DateTime<Utc>,
    ) -> bool {
        self.inner
            .write()
            .unwrap()
            .traffic
            .apply_snapshot(generation, items, now)
    }

    pub fn apply_weather_snapshot(
        &self,
        generation: u64,
        items: Vec<WeatherReport>,
        now: DateTime<Utc>,
    ) -> bool {
        self.inner
            .write()
            .unwrap()
            .weather
            .apply_snapshot(generation, items, now)
    }

    pub fn apply_presence_snapshot(
        &self,
        generation: u64,
        items: Vec<PresenceSample>,
        now: DateTime<Utc>,
    ) -> bool {
        self.inner
            .write()
            .unwrap()
            .presence
            .apply_snapshot(generation, items, now)
    }

    /// Seed the gauges from snapshot documents (no generation gate — the
    /// gauges are scalars, last write wins like any stream counter).
    pub fn set_gauges(&self, update: impl FnOnce(&mut Gauges)) {
        update(&mut self.inner.write().unwrap().gauges);
    }

    /// Route one parsed stream message into the picture.  Unroutable kinds
    /// (errors are handled at the session boundary) are ignored here.
    pub fn apply_stream_message(&self, msg: &ServerMessage, now: DateTime<Utc>) {
        let mut inner = self.inner.write().unwrap();
        match msg {
            ServerMessage::WeatherUpdate(update) => {
                inner.weather.replace_from_stream(update.reports.clone(), now);
            }
            ServerMessage::TrafficUpdate(update) => {
                inner.traffic.replace_from_stream(update.areas.clone(), now);
            }
            ServerMessage::UserStatsUpdate(stats) => {
                inner.apply_user_stats(stats, now);
            }
            ServerMessage::NewAlert(incident) => {
                inner.incidents.apply_event(incident.clone(), now);
            }
            ServerMessage::TodaysIncidentsUpdate(update) => {
                inner.gauges.todays_incidents = update.count;
                inner.gauges.todays_date = update.date.clone();
            }
            ServerMessage::CriticalIncidents(update) => {
                inner.gauges.critical_incidents = update.amount;
                inner.gauges.critical_label = update.label.clone();
            }
            ServerMessage::IncidentLocations(update) => {
                inner.incident_locations = update.points.clone();
            }
            ServerMessage::UsersOnline(c) => inner.gauges.online_users = c.amount,
            ServerMessage::ActiveIncidents(c) => inner.gauges.active_incidents = c.amount,
            ServerMessage::CriticalIncidentCount(c) => inner.gauges.critical_incidents = c.amount,
            ServerMessage::NewIncidentLog(log) | ServerMessage::NewTrafficLog(log) => {
                inner.push_log(log.entry.clone());
            }
            ServerMessage::UserConnected(note) => {
                inner.presence.apply_event(
                    PresenceSample {
                        user: note.user.clone(),
                        connected: true,
                        at: now,
                    },
                    now,
                );
            }
            ServerMessage::UserDisconnected(note) => {
                inner.presence.apply_event(
                    PresenceSample {
                        user: note.user.clone(),
                        connected: false,
                        at: now,
                    },
                    now,
                );
            }
            ServerMessage::Error(_) => {}
        }
    }

    /// Replace the incident geolocation overlay (snapshot or stream).
    pub fn set_incident_locations(&self, points: Vec<GeoPoint>) {
        self.inner.write().unwrap().incident_locations = points;
    }

    /// Client-position enrichment: a write path of its own, never touched
    /// by snapshots or stream events.
    pub fn set_client_position(&self, point: GeoPoint) {
        self.inner.write().unwrap().client_position = Some(point);
    }

    // -----------------------------------------------------------------------
    // Read side (clones; the lock is never exposed)
    // -----------------------------------------------------------------------

    pub fn incidents(&self) -> FeedState<Incident> {
        self.inner.read().unwrap().incidents.clone()
    }

    pub fn traffic(&self) -> FeedState<TrafficArea> {
        self.inner.read().unwrap().traffic.clone()
    }

    pub fn weather(&self) -> FeedState<WeatherReport> {
        self.inner.read().unwrap().weather.clone()
    }

    pub fn presence(&self) -> FeedState<PresenceSample> {
        self.inner.read().unwrap().presence.clone()
    }

    pub fn gauges(&self) -> Gauges {
        self.inner.read().unwrap().gauges.clone()
    }

    pub fn incident_locations(&self) -> Vec<GeoPoint> {
        self.inner.read().unwrap().incident_locations.clone()
    }

    pub fn client_position(&self) -> Option<GeoPoint> {
        self.inner.read().unwrap().client_position
    }

    pub fn event_log(&self) -> Vec<String> {
        self.inner.read().unwrap().event_log.iter().cloned().collect()
    }

    /// Elapsed time since the feed last changed.  A feed that has never
    /// been written counts from session start.
    pub fn staleness(&self, domain: Domain, now: DateTime<Utc>) -> Duration {
        let inner = self.inner.read().unwrap();
        let last = match domain {
            Domain::Incidents => inner.incidents.last_updated,
            Domain::Traffic => inner.traffic.last_updated,
            Domain::Weather => inner.weather.last_updated,
            Domain::Presence => inner.presence.last_updated,
        };
        let reference = last.unwrap_or(inner.started_at);
        (now - reference).to_std().unwrap_or(Duration::ZERO)
    }
}

impl StoreInner {
    fn apply_user_stats(&mut self, stats: &UserStats, now: DateTime<Utc>) {
        self.gauges.online_users = stats.online;
        for sample in &stats.timeline {
            self.presence.apply_event(sample.clone(), now);
        }
    }

    fn push_log(&mut self, entry: String) {
        self.event_log.push_back(entry);
        while self.event_log.len() > EVENT_LOG_CAP {
            self.event_log.pop_front();
        }
    }
}

//! Snapshot loader: one-shot REST fetches that seed the baseline picture
//! for each domain before (and alongside) the push stream.
//!
//! Reads are side-effect free on the server.  One failing endpoint never
//! blocks the others — the dashboard renders whatever seeded.

use crate::store::ReconciliationStore;
use chrono::Utc;
use mw_protocol::{
    CriticalCountDoc, IncidentStatsDoc, LocationsDoc, TodayCountDoc, TrafficDoc, UserStatsDoc,
};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),
}

/// What a `seed_all` pass accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SeedOutcome {
    pub seeded: usize,
    pub failed: usize,
    /// Teardown raced the fetches; nothing was applied.
    pub aborted: bool,
}

pub struct SnapshotLoader {
    client: reqwest::Client,
    api_base: String,
    token: String,
}

impl SnapshotLoader {
    pub fn new(api_base: String, token: String) -> Result<Self, SnapshotError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .build()?;
        Ok(Self {
            client,
            api_base,
            token,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, SnapshotError> {
        let url = format!("{}{}", self.api_base, path);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }

    pub async fn fetch_incident_stats(&self) -> Result<IncidentStatsDoc, SnapshotError> {
        self.get_json("/incidents/stats").await
    }

    pub async fn fetch_today_count(&self) -> Result<TodayCountDoc, SnapshotError> {
        self.get_json("/incidents/today").await
    }

    pub async fn fetch_traffic(&self) -> Result<TrafficDoc, SnapshotError> {
        self.get_json("/traffic").await
    }

    pub async fn fetch_critical_count(&self) -> Result<CriticalCountDoc, SnapshotError> {
        self.get_json("/incidents/critical").await
    }

    pub async fn fetch_locations(&self) -> Result<LocationsDoc, SnapshotError> {
        self.get_json("/incidents/locations").await
    }

    pub async fn fetch_user_stats(&self) -> Result<UserStatsDoc, SnapshotError> {
        self.get_json("/users/stats").await
    }

    /// Seed every domain under one snapshot generation.
    ///
    /// Endpoints are fetched concurrently; a failing endpoint is logged and
    /// skipped.  When the shutdown signal wins the race, in-flight requests
    /// are dropped and the store is left untouched.
    pub async fn seed_all(
        &self,
        store: &ReconciliationStore,
        mut shutdown: watch::Receiver<bool>,
    ) -> SeedOutcome {
        let generation = store.begin_snapshot();
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                info!("snapshot seed aborted");
                SeedOutcome { aborted: true, ..SeedOutcome::default() }
            }
            outcome = self.seed_inner(store, generation) => outcome
        }
    }

    async fn seed_inner(&self, store: &ReconciliationStore, generation: u64) -> SeedOutcome {
        let (stats, today, traffic, critical, locations, users) = tokio::join!(
            self.fetch_incident_stats(),
            self.fetch_today_count(),
            self.fetch_traffic(),
            self.fetch_critical_count(),
            self.fetch_locations(),
            self.fetch_user_stats(),
        );
        // Everything fetched; apply in one sweep so a torn pass can't happen.
        let now = Utc::now();
        let mut outcome = SeedOutcome::default();

        match stats {
            Ok(doc) => {
                store.apply_incident_snapshot(generation, doc.incidents, now);
                store.set_gauges(|g| g.active_incidents = doc.active);
                outcome.seeded += 1;
            }
            Err(e) => outcome.skip("incidents/stats", &e),
        }
        match today {
            Ok(doc) => {
                store.set_gauges(|g| {
                    g.todays_incidents = doc.count;
                    g.todays_date = doc.date;
                });
                outcome.seeded += 1;
            }
            Err(e) => outcome.skip("incidents/today", &e),
        }
        match traffic {
            Ok(doc) => {
                store.apply_traffic_snapshot(generation, doc.areas, now);
                outcome.seeded += 1;
            }
            Err(e) => outcome.skip("traffic", &e),
        }
        match critical {
            Ok(doc) => {
                store.set_gauges(|g| {
                    g.critical_incidents = doc.amount;
                    g.critical_label = doc.label;
                });
                outcome.seeded += 1;
            }
            Err(e) => outcome.skip("incidents/critical", &e),
        }
        match locations {
            Ok(doc) => {
                store.set_incident_locations(doc.points);
                outcome.seeded += 1;
            }
            Err(e) => outcome.skip("incidents/locations", &e),
        }
        match users {
            Ok(doc) => {
                store.apply_presence_snapshot(generation, doc.timeline.clone(), now);
                store.set_gauges(|g| g.online_users = doc.online);
                outcome.seeded += 1;
            }
            Err(e) => outcome.skip("users/stats", &e),
        }

        info!(seeded = outcome.seeded, failed = outcome.failed, "snapshot pass finished");
        outcome
    }
}

impl SeedOutcome {
    fn skip(&mut self, endpoint: &str, error: &SnapshotError) {
        warn!(endpoint, error = %error, "snapshot endpoint failed; skipping");
        self.failed += 1;
    }
}

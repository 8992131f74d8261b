//! Health monitor: derives the overall system-health classification from
//! the connection state and per-feed staleness.
//!
//! The classification is recomputed from scratch on every sample — nothing
//! is cached between samples.

use crate::config::{FeedThresholds, StalenessConfig};
use crate::connection::ConnectionState;
use crate::store::{Domain, ReconciliationStore};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Warning,
    Error,
}

pub struct HealthMonitor {
    thresholds: StalenessConfig,
}

impl HealthMonitor {
    pub fn new(thresholds: StalenessConfig) -> Self {
        Self { thresholds }
    }

    fn thresholds_for(&self, domain: Domain) -> FeedThresholds {
        match domain {
            Domain::Incidents => self.thresholds.incidents,
            Domain::Traffic => self.thresholds.traffic,
            Domain::Weather => self.thresholds.weather,
            Domain::Presence => self.thresholds.presence,
        }
    }

    /// Classify the current picture.
    ///
    /// - `Error`: not connected (disconnected or auth-failed), or any feed
    ///   past its critical staleness threshold;
    /// - `Warning`: connected but at least one feed past its fresh
    ///   threshold, or a dial currently in progress;
    /// - `Healthy`: connected and every feed within its fresh threshold.
    pub fn sample(
        &self,
        state: ConnectionState,
        store: &ReconciliationStore,
        now: DateTime<Utc>,
    ) -> HealthStatus {
        let mut any_stale = false;
        for domain in Domain::ALL {
            let staleness = store.staleness(domain, now);
            let bounds = self.thresholds_for(domain);
            if staleness >= bounds.critical {
                return HealthStatus::Error;
            }
            if staleness >= bounds.fresh {
                any_stale = true;
            }
        }

        match state {
            ConnectionState::Disconnected | ConnectionState::AuthFailed => HealthStatus::Error,
            ConnectionState::Connecting => HealthStatus::Warning,
            ConnectionState::Connected => {
                if any_stale {
                    HealthStatus::Warning
                } else {
                    HealthStatus::Healthy
                }
            }
        }
    }
}

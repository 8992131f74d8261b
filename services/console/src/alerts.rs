//! Alert queue and notification center.
//!
//! Alerts are persistent, acknowledgeable records derived from qualifying
//! incident events; they live until acknowledged-and-evicted or until the
//! retention window passes.  Notifications are ephemeral UI toasts with a
//! fixed TTL — acknowledgment neither extends nor shortens it.

use chrono::{DateTime, Utc};
use mw_protocol::{Incident, Severity};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

// ---------------------------------------------------------------------------
// Alert
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    /// Derived from the incident identifier, stable across redelivery.
    pub id: String,
    pub incident_ref: String,
    pub severity: Severity,
    pub received_at: DateTime<Utc>,
    pub acknowledged: bool,
}

fn alert_id(incident_ref: &str) -> String {
    format!("alert-{incident_ref}")
}

// ---------------------------------------------------------------------------
// AlertQueue
// ---------------------------------------------------------------------------

struct QueueInner {
    /// Insertion order doubles as age order.
    alerts: Vec<Alert>,
}

/// Bounded, time-decaying alert collection.
#[derive(Clone)]
pub struct AlertQueue {
    inner: Arc<Mutex<QueueInner>>,
    capacity: usize,
    retention: Duration,
}

impl AlertQueue {
    pub fn new(capacity: usize, retention: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(QueueInner { alerts: Vec::new() })),
            capacity,
            retention,
        }
    }

    /// Derive an alert from a qualifying incident event.
    ///
    /// Redelivery of an incident that already has an unacknowledged alert
    /// is a no-op.  An acknowledged alert for the same incident is
    /// re-raised (the acknowledged entry is replaced by a fresh one).
    pub fn ingest(&self, incident: &Incident, now: DateTime<Utc>) -> Option<Alert> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(existing) = inner
            .alerts
            .iter()
            .find(|a| a.incident_ref == incident.id)
        {
            if !existing.acknowledged {
                debug!(incident = %incident.id, "duplicate alert delivery ignored");
                return None;
            }
            inner.alerts.retain(|a| a.incident_ref != incident.id);
        }

        let alert = Alert {
            id: alert_id(&incident.id),
            incident_ref: incident.id.clone(),
            severity: incident.severity,
            received_at: now,
            acknowledged: false,
        };
        inner.alerts.push(alert.clone());
        inner.enforce_capacity(self.capacity);
        Some(alert)
    }

    /// Idempotent: unknown or already-acknowledged ids are a harmless no-op.
    pub fn acknowledge(&self, alert_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(alert) = inner.alerts.iter_mut().find(|a| a.id == alert_id) {
            alert.acknowledged = true;
        }
    }

    pub fn clear_all(&self) {
        self.inner.lock().unwrap().alerts.clear();
    }

    pub fn unread_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .alerts
            .iter()
            .filter(|a| !a.acknowledged)
            .count()
    }

    /// Drop alerts older than the retention window.
    pub fn sweep(&self, now: DateTime<Utc>) {
        let retention = chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::MAX);
        self.inner
            .lock()
            .unwrap()
            .alerts
            .retain(|a| now - a.received_at < retention);
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.inner.lock().unwrap().alerts.clone()
    }
}

impl QueueInner {
    /// Evict down to `capacity`: oldest acknowledged first, then oldest
    /// unacknowledged.  The newest entry is never the victim.
    fn enforce_capacity(&mut self, capacity: usize) {
        while self.alerts.len() > capacity {
            let victim = self
                .alerts
                .iter()
                .position(|a| a.acknowledged)
                .unwrap_or(0);
            let evicted = self.alerts.remove(victim);
            debug!(alert = %evicted.id, acknowledged = evicted.acknowledged, "alert evicted");
        }
    }
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: u64,
    pub message: String,
    pub severity: Severity,
    pub created_at: DateTime<Utc>,
}

struct CenterInner {
    notifications: Vec<Notification>,
    next_id: u64,
}

/// Ephemeral, TTL-bound, user-facing messages — distinct from alerts.
#[derive(Clone)]
pub struct NotificationCenter {
    inner: Arc<Mutex<CenterInner>>,
    ttl: Duration,
}

impl NotificationCenter {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CenterInner {
                notifications: Vec::new(),
                next_id: 0,
            })),
            ttl,
        }
    }

    pub fn push(&self, message: impl Into<String>, severity: Severity, now: DateTime<Utc>) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.notifications.push(Notification {
            id,
            message: message.into(),
            severity,
            created_at: now,
        });
        id
    }

    /// Early dismissal; expiry happens regardless.
    pub fn dismiss(&self, id: u64) {
        self.inner
            .lock()
            .unwrap()
            .notifications
            .retain(|n| n.id != id);
    }

    /// The currently visible set: everything younger than the TTL.
    pub fn active(&self, now: DateTime<Utc>) -> Vec<Notification> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        self.inner
            .lock()
            .unwrap()
            .notifications
            .iter()
            .filter(|n| now - n.created_at < ttl)
            .cloned()
            .collect()
    }

    /// Drop expired notifications for good.
    pub fn sweep(&self, now: DateTime<Utc>) {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        self.inner
            .lock()
            .unwrap()
            .notifications
            .retain(|n| now - n.created_at < ttl);
    }
}

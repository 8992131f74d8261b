//! Connection manager: owns the lifecycle of the one persistent stream
//! connection per dashboard session.
//!
//! The manager itself does no I/O — `main` dials and runs the session
//! (`session.rs`) and reports outcomes back here.  The manager decides
//! what happens next: retry with capped exponential backoff, park in
//! `AuthFailed` until credentials change, or stay down after an explicit
//! disconnect.  Every transition is published on a `watch` channel and
//! fanned out as a lifecycle signal through the event dispatcher.

use crate::config::BackoffConfig;
use crate::dispatch::{EventDispatcher, LifecycleSignal};
use chrono::{DateTime, Utc};
use mw_protocol::ClientMessage;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal until credentials change; automatic retry never leaves it.
    AuthFailed,
}

pub struct ConnectionManager {
    state_tx: watch::Sender<ConnectionState>,
    attempt: AtomicU64,
    retry_streak: AtomicU64,
    connected_since: Mutex<Option<DateTime<Utc>>>,
    backoff: BackoffConfig,
    dispatcher: EventDispatcher,
}

impl ConnectionManager {
    pub fn new(backoff: BackoffConfig, dispatcher: EventDispatcher) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state_tx,
            attempt: AtomicU64::new(0),
            retry_streak: AtomicU64::new(0),
            connected_since: Mutex::new(None),
            backoff,
            dispatcher,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Observe state transitions (health monitor, main loop).
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Request a connection.  A no-op when already connected or mid-dial;
    /// from `AuthFailed` this is the explicit credentials-changed path.
    /// Manual requests reset the retry streak, so the dial is immediate.
    pub fn request_connect(&self) -> Option<u64> {
        match self.state() {
            ConnectionState::Connected | ConnectionState::Connecting => {
                info!(state = ?self.state(), "connect request ignored");
                None
            }
            ConnectionState::Disconnected | ConnectionState::AuthFailed => {
                self.retry_streak.store(0, Ordering::SeqCst);
                Some(self.begin_attempt())
            }
        }
    }

    pub fn current_attempt(&self) -> u64 {
        self.attempt.load(Ordering::SeqCst)
    }

    /// The attempt counter guards against stale dial results: a result is
    /// only applied when its attempt is still the current one.
    pub fn is_attempt_current(&self, attempt: u64) -> bool {
        self.attempt.load(Ordering::SeqCst) == attempt
            && self.state() == ConnectionState::Connecting
    }

    pub fn current_retry_streak(&self) -> u64 {
        self.retry_streak.load(Ordering::SeqCst)
    }

    /// Delay before the current attempt dials: 0 on the first try, then
    /// 1 s doubling up to the configured cap.
    pub fn reconnect_delay(&self) -> Duration {
        compute_reconnect_delay(self.current_retry_streak(), self.backoff.max_interval)
    }

    /// A dial + handshake completed.
    pub fn mark_connected(&self, now: DateTime<Utc>) {
        *self.connected_since.lock().unwrap() = Some(now);
        self.state_tx.send_replace(ConnectionState::Connected);
        info!("stream connected");
        self.dispatcher.dispatch_lifecycle(LifecycleSignal::Connected);
    }

    /// The session ended or a dial failed.  Schedules the next attempt and
    /// returns its number.
    pub fn mark_disconnected(&self, now: DateTime<Utc>, error: Option<&str>) -> u64 {
        // The streak resets only if the connection survived the stability
        // window; a connection that dies right away keeps backing off.
        let was_stable = self
            .connected_since
            .lock()
            .unwrap()
            .take()
            .is_some_and(|since| {
                (now - since).to_std().unwrap_or(Duration::ZERO) >= self.backoff.stability_window
            });
        if was_stable {
            self.retry_streak.store(0, Ordering::SeqCst);
        }
        self.retry_streak.fetch_add(1, Ordering::SeqCst);

        if let Some(e) = error {
            warn!(error = %e, "stream connection lost");
            self.dispatcher
                .dispatch_lifecycle(LifecycleSignal::Error(e.to_owned()));
        }
        self.dispatcher
            .dispatch_lifecycle(LifecycleSignal::Disconnected);
        self.begin_attempt()
    }

    /// Credential rejection: park until an explicit reconnect request.
    pub fn mark_auth_failed(&self, message: &str) {
        *self.connected_since.lock().unwrap() = None;
        self.state_tx.send_replace(ConnectionState::AuthFailed);
        warn!(message, "authentication rejected; not retrying");
        self.dispatcher
            .dispatch_lifecycle(LifecycleSignal::Error(message.to_owned()));
        self.dispatcher
            .dispatch_lifecycle(LifecycleSignal::Disconnected);
    }

    /// Explicit teardown: no retry follows.
    pub fn mark_closed(&self) {
        *self.connected_since.lock().unwrap() = None;
        self.state_tx.send_replace(ConnectionState::Disconnected);
        self.dispatcher
            .dispatch_lifecycle(LifecycleSignal::Disconnected);
    }

    fn begin_attempt(&self) -> u64 {
        let attempt = self.attempt.fetch_add(1, Ordering::SeqCst) + 1;
        self.state_tx.send_replace(ConnectionState::Connecting);
        attempt
    }
}

fn compute_reconnect_delay(streak: u64, cap: Duration) -> Duration {
    if streak == 0 {
        Duration::ZERO
    } else {
        let exp = Duration::from_secs(1u64 << (streak - 1).min(5));
        exp.min(cap)
    }
}

/// Keep-alive fallback: while connected, periodically queue a
/// `request-stats` resync in case push delivery silently stalls without
/// the transport noticing.  Runs until the shutdown signal flips.
pub async fn run_keepalive(
    period: Duration,
    mut state_rx: watch::Receiver<ConnectionState>,
    command_tx: mpsc::UnboundedSender<ClientMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick of a tokio interval fires immediately; skip it so the
    // connect-time resync isn't doubled.
    tick.tick().await;
    loop {
        tokio::select! {
            biased;
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            result = state_rx.changed() => {
                if result.is_err() {
                    return;
                }
            }
            _ = tick.tick() => {
                if *state_rx.borrow() == ConnectionState::Connected
                    && command_tx.send(ClientMessage::RequestStats).is_err()
                {
                    // Session writer gone; the next connect re-creates it.
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 6, 12, 0, 0).unwrap()
    }

    fn backoff() -> BackoffConfig {
        BackoffConfig {
            max_interval: Duration::from_secs(30),
            stability_window: Duration::from_secs(60),
        }
    }

    fn manager() -> ConnectionManager {
        ConnectionManager::new(backoff(), EventDispatcher::new())
    }

    #[test]
    fn backoff_doubles_and_caps_at_the_configured_interval() {
        let cap = Duration::from_secs(30);
        assert_eq!(compute_reconnect_delay(0, cap), Duration::ZERO);
        assert_eq!(compute_reconnect_delay(1, cap), Duration::from_secs(1));
        assert_eq!(compute_reconnect_delay(2, cap), Duration::from_secs(2));
        assert_eq!(compute_reconnect_delay(3, cap), Duration::from_secs(4));
        assert_eq!(compute_reconnect_delay(4, cap), Duration::from_secs(8));
        assert_eq!(compute_reconnect_delay(5, cap), Duration::from_secs(16));
        assert_eq!(compute_reconnect_delay(6, cap), Duration::from_secs(30));
        assert_eq!(compute_reconnect_delay(12, cap), Duration::from_secs(30));
    }

    #[test]
    fn connect_on_live_handle_is_a_no_op() {
        let m = manager();
        let attempt = m.request_connect().expect("first connect");
        assert!(m.is_attempt_current(attempt));

        // Mid-dial and connected requests are both ignored.
        assert!(m.request_connect().is_none());
        m.mark_connected(t0());
        assert!(m.request_connect().is_none());
        assert_eq!(m.state(), ConnectionState::Connected);
    }

    #[test]
    fn unstable_session_keeps_backing_off() {
        let m = manager();
        m.request_connect();
        m.mark_connected(t0());
        // Dies 5 s in — under the 60 s stability window.
        m.mark_disconnected(t0() + chrono::Duration::seconds(5), Some("reset"));
        assert_eq!(m.current_retry_streak(), 1);
        assert_eq!(m.reconnect_delay(), Duration::from_secs(1));

        m.mark_connected(t0() + chrono::Duration::seconds(10));
        m.mark_disconnected(t0() + chrono::Duration::seconds(15), Some("reset"));
        assert_eq!(m.current_retry_streak(), 2);
        assert_eq!(m.reconnect_delay(), Duration::from_secs(2));
    }

    #[test]
    fn stable_session_resets_the_streak() {
        let m = manager();
        m.request_connect();
        m.mark_connected(t0());
        m.mark_disconnected(t0() + chrono::Duration::seconds(5), Some("reset"));
        m.mark_connected(t0() + chrono::Duration::seconds(10));
        // Survives well past the stability window before dropping.
        m.mark_disconnected(t0() + chrono::Duration::seconds(600), Some("reset"));
        assert_eq!(m.current_retry_streak(), 1);
    }

    #[test]
    fn dial_failure_without_a_session_still_backs_off() {
        let m = manager();
        m.request_connect();
        m.mark_disconnected(t0(), Some("connection refused"));
        m.mark_disconnected(t0(), Some("connection refused"));
        m.mark_disconnected(t0(), Some("connection refused"));
        assert_eq!(m.current_retry_streak(), 3);
        assert_eq!(m.reconnect_delay(), Duration::from_secs(4));
    }

    #[test]
    fn auth_failure_is_terminal_until_explicit_reconnect() {
        let m = manager();
        m.request_connect();
        m.mark_auth_failed("INVALID_TOKEN");
        assert_eq!(m.state(), ConnectionState::AuthFailed);

        // The credentials-changed path is an explicit request, which also
        // resets the streak for an immediate dial.
        let attempt = m.request_connect().expect("explicit reconnect allowed");
        assert!(m.is_attempt_current(attempt));
        assert_eq!(m.reconnect_delay(), Duration::ZERO);
    }

    #[test]
    fn stale_attempts_are_not_current() {
        let m = manager();
        let stale = m.request_connect().expect("connect");
        m.mark_disconnected(t0(), Some("refused"));
        assert!(!m.is_attempt_current(stale));
    }

    #[test]
    fn transitions_emit_lifecycle_signals() {
        use crate::dispatch::{DispatchEvent, Topic};
        use std::sync::{Arc, Mutex};

        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            dispatcher.subscribe(Topic::Lifecycle, move |event| {
                if let DispatchEvent::Lifecycle(signal) = event {
                    seen.lock().unwrap().push(signal.clone());
                }
            });
        }

        let m = ConnectionManager::new(backoff(), dispatcher);
        m.request_connect();
        m.mark_connected(t0());
        m.mark_disconnected(t0() + chrono::Duration::seconds(1), Some("reset"));

        let signals = seen.lock().unwrap().clone();
        assert_eq!(
            signals,
            vec![
                LifecycleSignal::Connected,
                LifecycleSignal::Error("reset".to_owned()),
                LifecycleSignal::Disconnected,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_requests_resync_only_while_connected() {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (command_tx, mut command_rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(run_keepalive(
            Duration::from_secs(30),
            state_rx,
            command_tx,
            shutdown_rx,
        ));

        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;
        assert!(command_rx.try_recv().is_err(), "disconnected: no resync");

        state_tx.send_replace(ConnectionState::Connected);
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;
        assert!(matches!(
            command_rx.try_recv(),
            Ok(ClientMessage::RequestStats)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_stops_on_shutdown() {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        let (command_tx, mut command_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run_keepalive(
            Duration::from_secs(30),
            state_rx,
            command_tx,
            shutdown_rx,
        ));

        shutdown_tx.send_replace(true);
        task.await.expect("keepalive exits");

        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(command_rx.try_recv().is_err());
        drop(state_tx);
    }
}

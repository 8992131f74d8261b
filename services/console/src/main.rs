use chrono::Utc;
use clap::Parser;
use console::alerts::{AlertQueue, NotificationCenter};
use console::config::{self, ConsoleConfig};
use console::connection::{ConnectionManager, ConnectionState, run_keepalive};
use console::dispatch::{
    DispatchEvent, EventDispatcher, LifecycleSignal, SubscriptionGuard, Topic,
};
use console::health::{HealthMonitor, HealthStatus};
use console::profile::{Profile, default_profile_path, load_profile};
use console::session::{self, SessionError};
use console::snapshot::SnapshotLoader;
use console::store::ReconciliationStore;
use mw_protocol::{Authenticate, ClientMessage, ServerMessage, Severity};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(about = "Live-state sync client for the metrowatch dashboard")]
struct Args {
    /// Path to the console config TOML (default /etc/metrowatch/console.toml).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Path to the profile JSON (default: platform data dir).
    #[arg(long)]
    profile: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let cfg = match &args.config {
        Some(path) => config::load_config_from_path(path),
        None => config::load_config(),
    }
    .unwrap_or_else(|e| {
        eprintln!("FATAL: config: {e}");
        std::process::exit(1);
    });

    let profile_path = args.profile.unwrap_or_else(default_profile_path);
    let profile = load_profile(&profile_path)
        .unwrap_or_else(|e| {
            eprintln!("FATAL: profile: {e}");
            std::process::exit(1);
        })
        .filter(Profile::has_credentials)
        .unwrap_or_else(|| {
            eprintln!(
                "FATAL: no usable profile at {}; write {{\"token\": ..., \"user\": ...}}",
                profile_path.display()
            );
            std::process::exit(1);
        });

    run(cfg, profile).await;
}

async fn run(cfg: ConsoleConfig, profile: Profile) {
    // -------------------------------------------------------------------------
    // Session-scoped state — constructed fresh, never inherited from a
    // previous session.
    // -------------------------------------------------------------------------
    let store = ReconciliationStore::new(Utc::now());
    let dispatcher = EventDispatcher::new();
    let alerts = AlertQueue::new(cfg.alerts.capacity, cfg.alerts.retention);
    let notifications = NotificationCenter::new(cfg.alerts.notification_ttl);
    let health = HealthMonitor::new(cfg.staleness.clone());
    let manager = Arc::new(ConnectionManager::new(
        cfg.backoff.clone(),
        dispatcher.clone(),
    ));
    let loader = Arc::new(
        SnapshotLoader::new(cfg.server.api_base(), profile.token.clone()).unwrap_or_else(|e| {
            eprintln!("FATAL: http client: {e}");
            std::process::exit(1);
        }),
    );

    if let Some(point) = cfg.client_position {
        store.set_client_position(point);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // -------------------------------------------------------------------------
    // Wire the dispatcher into the store, alert queue and notifications.
    // Guards keep the registrations alive until teardown.
    // -------------------------------------------------------------------------
    let subscriptions = wire_subscriptions(
        &dispatcher,
        &store,
        &alerts,
        &notifications,
        &loader,
        &shutdown_rx,
    );

    // -------------------------------------------------------------------------
    // Baseline seed before the stream connects.
    // -------------------------------------------------------------------------
    loader.seed_all(&store, shutdown_rx.clone()).await;

    let credentials = Authenticate {
        token: profile.token.clone(),
        user: profile.user.clone(),
    };

    // Subscribe before the first connect request so its transition is seen.
    let mut state_rx = manager.subscribe_state();
    manager.request_connect();
    let mut health_tick = tokio::time::interval(cfg.health_sample);
    health_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut sweep_tick = tokio::time::interval(Duration::from_secs(1));
    sweep_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut session_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut session_cancel: Option<watch::Sender<bool>> = None;
    let mut last_health: Option<HealthStatus> = None;

    loop {
        tokio::select! {
            biased;

            _ = tokio::signal::ctrl_c() => {
                info!("received ctrl-c, shutting down");
                break;
            }

            result = state_rx.changed() => {
                if result.is_err() {
                    break;
                }
                // Every lifecycle transition triggers a health resample.
                observe_health(&health, &manager, &store, &mut last_health);

                if *state_rx.borrow() == ConnectionState::Connecting {
                    dial(
                        &cfg,
                        &credentials,
                        &manager,
                        &dispatcher,
                        &mut session_task,
                        &mut session_cancel,
                        &shutdown_rx,
                    )
                    .await;
                }
            }

            _ = health_tick.tick() => {
                observe_health(&health, &manager, &store, &mut last_health);
            }

            _ = sweep_tick.tick() => {
                let now = Utc::now();
                alerts.sweep(now);
                notifications.sweep(now);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Teardown: close the stream, cancel timers and in-flight fetches, drop
    // every subscription this session registered.
    // -------------------------------------------------------------------------
    let _ = shutdown_tx.send(true);
    cancel_session(&mut session_task, &mut session_cancel).await;
    manager.mark_closed();
    drop(subscriptions);
    info!("console stopped");
}

// ---------------------------------------------------------------------------
// Dispatcher wiring
// ---------------------------------------------------------------------------

fn wire_subscriptions(
    dispatcher: &EventDispatcher,
    store: &ReconciliationStore,
    alerts: &AlertQueue,
    notifications: &NotificationCenter,
    loader: &Arc<SnapshotLoader>,
    shutdown_rx: &watch::Receiver<bool>,
) -> Vec<SubscriptionGuard> {
    let mut guards = Vec::new();

    // Every data topic funnels into the same store merge contract.
    const DATA_TOPICS: [Topic; 10] = [
        Topic::Weather,
        Topic::UserStats,
        Topic::TodaysIncidents,
        Topic::Traffic,
        Topic::CriticalIncidents,
        Topic::IncidentLocations,
        Topic::NewAlert,
        Topic::EventLog,
        Topic::Counter,
        Topic::Presence,
    ];
    for topic in DATA_TOPICS {
        let store = store.clone();
        guards.push(dispatcher.subscribe_scoped(topic, move |event| {
            if let DispatchEvent::Stream(msg) = event {
                store.apply_stream_message(msg, Utc::now());
            }
        }));
    }

    // Qualifying incident events additionally derive alerts + a toast.
    {
        let alerts = alerts.clone();
        let notifications = notifications.clone();
        guards.push(dispatcher.subscribe_scoped(Topic::NewAlert, move |event| {
            if let DispatchEvent::Stream(msg) = event
                && let ServerMessage::NewAlert(incident) = msg.as_ref()
            {
                let now = Utc::now();
                if let Some(alert) = alerts.ingest(incident, now) {
                    notifications.push(
                        format!("New incident at {}", incident.location),
                        alert.severity,
                        now,
                    );
                }
            }
        }));
    }

    // Connectivity toasts: transient problems are dismissible, not fatal.
    {
        let notifications = notifications.clone();
        guards.push(dispatcher.subscribe_scoped(Topic::Lifecycle, move |event| {
            if let DispatchEvent::Lifecycle(signal) = event {
                let now = Utc::now();
                match signal {
                    LifecycleSignal::Disconnected => {
                        notifications.push("Connection lost — reconnecting", Severity::Medium, now);
                    }
                    LifecycleSignal::Connected => {
                        notifications.push("Connection established", Severity::Low, now);
                    }
                    LifecycleSignal::Error(_) => {}
                }
            }
        }));
    }

    // The stream is not trusted to replay history: every (re)connect kicks
    // off a fresh authoritative snapshot pass.
    {
        let loader = Arc::clone(loader);
        let store = store.clone();
        let shutdown_rx = shutdown_rx.clone();
        guards.push(dispatcher.subscribe_scoped(Topic::Lifecycle, move |event| {
            if matches!(event, DispatchEvent::Lifecycle(LifecycleSignal::Connected)) {
                let loader = Arc::clone(&loader);
                let store = store.clone();
                let shutdown = shutdown_rx.clone();
                tokio::spawn(async move {
                    loader.seed_all(&store, shutdown).await;
                });
            }
        }));
    }

    guards
}

// ---------------------------------------------------------------------------
// Dialing
// ---------------------------------------------------------------------------

async fn dial(
    cfg: &ConsoleConfig,
    credentials: &Authenticate,
    manager: &Arc<ConnectionManager>,
    dispatcher: &EventDispatcher,
    session_task: &mut Option<tokio::task::JoinHandle<()>>,
    session_cancel: &mut Option<watch::Sender<bool>>,
    shutdown_rx: &watch::Receiver<bool>,
) {
    let attempt = manager.current_attempt();

    let delay = manager.reconnect_delay();
    if !delay.is_zero() {
        info!(delay_secs = delay.as_secs(), "reconnecting after backoff");
        tokio::time::sleep(delay).await;
    }
    if !manager.is_attempt_current(attempt) {
        info!("discarding stale connect attempt");
        return;
    }

    // Replace any previous session first.
    cancel_session(session_task, session_cancel).await;

    let url = cfg.server.stream_url();
    let request = match session::build_authenticated_request(&url, &credentials.token) {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, "failed to build stream request");
            manager.mark_disconnected(Utc::now(), Some(&e.to_string()));
            return;
        }
    };

    let connect = tokio::time::timeout(
        Duration::from_secs(10),
        tokio_tungstenite::connect_async(request),
    )
    .await;
    let mut ws = match connect {
        Err(_) => {
            warn!(url = %url, "connect timed out");
            manager.mark_disconnected(Utc::now(), Some("connect timeout"));
            return;
        }
        Ok(Err(e)) => {
            warn!(url = %url, error = %e, "connect failed");
            manager.mark_disconnected(Utc::now(), Some(&e.to_string()));
            return;
        }
        Ok(Ok((ws, _response))) => ws,
    };

    if let Err(e) = session::open_session(&mut ws, credentials.clone(), cfg.client_position).await {
        warn!(error = %e, "session open failed");
        manager.mark_disconnected(Utc::now(), Some(&e.to_string()));
        return;
    }

    if !manager.is_attempt_current(attempt) {
        info!("discarding stale connect attempt");
        return;
    }
    manager.mark_connected(Utc::now());

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let (command_tx, command_rx) = mpsc::unbounded_channel::<ClientMessage>();

    // Keep-alive fallback: dies with the session when its sender errors.
    tokio::spawn(run_keepalive(
        cfg.keepalive,
        manager.subscribe_state(),
        command_tx,
        shutdown_rx.clone(),
    ));

    let deps = session::SessionDeps {
        dispatcher: dispatcher.clone(),
        commands: command_rx,
        shutdown: cancel_rx,
    };
    let session_manager = Arc::clone(manager);
    let handle = tokio::spawn(async move {
        match session::run_session_loop(ws, deps).await {
            Ok(()) => {
                info!("stream session ended");
            }
            Err(SessionError::AuthRejected(message)) => {
                session_manager.mark_auth_failed(&message);
                return;
            }
            Err(e) => {
                session_manager.mark_disconnected(Utc::now(), Some(&e.to_string()));
                return;
            }
        }
        // Clean shutdown: no retry.
    });

    *session_task = Some(handle);
    *session_cancel = Some(cancel_tx);
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn observe_health(
    health: &HealthMonitor,
    manager: &Arc<ConnectionManager>,
    store: &ReconciliationStore,
    last: &mut Option<HealthStatus>,
) {
    let status = health.sample(manager.state(), store, Utc::now());
    if *last != Some(status) {
        info!(?status, "health changed");
        *last = Some(status);
    }
}

async fn cancel_session(
    task: &mut Option<tokio::task::JoinHandle<()>>,
    cancel_tx: &mut Option<watch::Sender<bool>>,
) {
    if let Some(tx) = cancel_tx.take() {
        let _ = tx.send(true);
    }
    if let Some(handle) = task.take() {
        // Give the session a moment to exit cleanly.
        match tokio::time::timeout(Duration::from_secs(5), handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "session task panicked"),
            Err(_) => warn!("session task did not exit in 5s; continuing"),
        }
    }
}

//! OpenDesk server wiring: state construction, background timers, HTTP
//! layers, and graceful shutdown.

use crate::config::OpenDeskConfig;
use crate::routes;
use anyhow::Result;
use axum::Extension;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use od_channels::{ChannelBackend, ChannelKind, LoopbackBackend};
use od_queue::{DeliveryJob, DeliveryWorkerPool, JobTarget, QueueBroker, SqliteBroker};
use od_session::{
    ChannelStore, ConnectionSupervisor, EventSink, HealthMonitor, MemoryEventSink,
    OperationLockManager, SessionRegistry, SqliteStore, StateSynchronizer, WebhookEventSink,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub started_at: Instant,
    pub store: Arc<SqliteStore>,
    pub broker: Arc<SqliteBroker>,
    pub supervisor: Arc<ConnectionSupervisor>,
}

pub async fn build_state(
    cfg: &OpenDeskConfig,
    shutdown: CancellationToken,
) -> Result<Arc<AppState>> {
    let data_dir = ensure_data_dir(cfg).await?;
    let store = Arc::new(SqliteStore::open(data_dir.join("desk.db")).await?);
    let broker = Arc::new(SqliteBroker::open(data_dir.join("queue.db")).await?);

    let events: Arc<dyn EventSink> = match cfg.events.webhook_url.as_deref() {
        Some(url) => Arc::new(
            WebhookEventSink::new(url)?.with_secret(cfg.events.webhook_secret.clone()),
        ),
        None => Arc::new(MemoryEventSink::new()),
    };

    // Real wire protocols live outside this process; every kind is served
    // by the loopback backend here.
    let mut backends: HashMap<ChannelKind, Arc<dyn ChannelBackend>> = HashMap::new();
    for kind in [
        ChannelKind::Whatsapp,
        ChannelKind::Telegram,
        ChannelKind::Instagram,
    ] {
        backends.insert(kind, Arc::new(LoopbackBackend::new(kind)));
    }

    let supervisor = ConnectionSupervisor::new(
        SessionRegistry::new(),
        OperationLockManager::new(),
        store.clone(),
        events,
        backends,
        cfg.supervisor.supervisor_config(),
        shutdown,
    );

    Ok(Arc::new(AppState {
        started_at: Instant::now(),
        store,
        broker,
        supervisor,
    }))
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = OpenDeskConfig::load(config_path).await?;
    let addr = cfg.bind_addr()?;
    tracing::info!(
        bind_addr = %addr,
        data_dir = %cfg.storage.data_dir_path()?.display(),
        connect_timeout_seconds = cfg.supervisor.connect_timeout_seconds,
        health_probe_interval_seconds = cfg.health.probe_interval_seconds,
        sync_interval_seconds = cfg.sync.interval_seconds,
        queue_workers = cfg.queue.workers,
        event_webhook_configured = cfg.events.webhook_url.is_some(),
        "server configuration loaded"
    );
    let listener = preflight_bind_listener(addr).await?;

    let shutdown = CancellationToken::new();
    let state = build_state(&cfg, shutdown.child_token()).await?;

    let started = state.supervisor.start_active_sessions().await?;
    tracing::info!(started, "active sessions brought up");

    let health = HealthMonitor::new(
        state.supervisor.clone(),
        state.store.clone() as Arc<dyn ChannelStore>,
        state.supervisor.events(),
        cfg.health.health_config(),
    );
    tokio::spawn(health.run(shutdown.child_token()));

    let sync = StateSynchronizer::new(
        state.supervisor.clone(),
        state.store.clone() as Arc<dyn ChannelStore>,
        cfg.sync.sync_config(),
    );
    tokio::spawn(sync.run(shutdown.child_token()));

    let pool = DeliveryWorkerPool::new(
        state.broker.clone() as Arc<dyn QueueBroker>,
        state.supervisor.registry(),
        state.store.clone() as Arc<dyn ChannelStore>,
        state.supervisor.events(),
        cfg.queue.worker_config(),
    );
    pool.spawn(shutdown.child_token());

    spawn_lock_sweep(
        &state,
        Duration::from_secs(cfg.supervisor.connect_timeout_seconds),
        shutdown.child_token(),
    );

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    let app = routes::router()
        .layer(Extension(state.clone()))
        .layer(GlobalConcurrencyLimitLayer::new(cfg.server.http_max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.server.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!(%addr, "opendesk serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    shutdown.cancel();
    state.supervisor.shutdown_sessions().await;
    tracing::info!("sessions closed; shutdown complete");
    Ok(())
}

/// Safety net for locks leaked by panicked operations: expire entries older
/// than twice the connect timeout, the longest legitimate hold.
fn spawn_lock_sweep(state: &Arc<AppState>, connect_timeout: Duration, shutdown: CancellationToken) {
    let locks = state.supervisor.locks();
    let ttl = connect_timeout * 2;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(connect_timeout);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let expired = locks.expire_stale(ttl);
            if expired > 0 {
                tracing::warn!(expired, "expired stale operation locks");
            }
        }
    });
}

async fn ensure_data_dir(cfg: &OpenDeskConfig) -> Result<PathBuf> {
    let data_dir = cfg.storage.data_dir_path()?;
    tokio::fs::create_dir_all(&data_dir)
        .await
        .map_err(|e| anyhow::anyhow!("creating data dir {}: {e}", data_dir.display()))?;
    Ok(data_dir)
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = OpenDeskConfig::load(config_path).await?;
    let addr = cfg.bind_addr()?;
    let data_dir = ensure_data_dir(&cfg).await?;

    let store = SqliteStore::open(data_dir.join("desk.db")).await?;
    let channels = store.list_active_channels().await?;
    let broker = SqliteBroker::open(data_dir.join("queue.db")).await?;
    let counts = broker.counts().await?;

    tracing::info!(
        bind_addr = %addr,
        data_dir = %data_dir.display(),
        active_channels = channels.len(),
        queue_pending = counts.pending,
        queue_leased = counts.leased,
        queue_dead = counts.dead,
        "config ok"
    );
    Ok(())
}

pub async fn status(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = OpenDeskConfig::load(config_path).await?;
    let data_dir = ensure_data_dir(&cfg).await?;

    let store = SqliteStore::open(data_dir.join("desk.db")).await?;
    let channels = store.list_active_channels().await?;
    for channel in &channels {
        tracing::info!(
            channel_id = %channel.id,
            tenant_id = %channel.tenant_id,
            kind = %channel.kind,
            status = %channel.status,
            retries = channel.retries,
            "channel status"
        );
    }

    let broker = SqliteBroker::open(data_dir.join("queue.db")).await?;
    let counts = broker.counts().await?;
    tracing::info!(
        active_channels = channels.len(),
        queue_pending = counts.pending,
        queue_leased = counts.leased,
        queue_dead = counts.dead,
        "status ok"
    );
    Ok(())
}

/// Drop a one-shot text job on the durable queue; a running server's
/// workers pick it up.
pub async fn send_one_shot(
    config_path: Option<PathBuf>,
    channel: &str,
    recipient: &str,
    message: &str,
) -> Result<()> {
    let cfg = OpenDeskConfig::load(config_path).await?;
    let data_dir = ensure_data_dir(&cfg).await?;
    let broker = SqliteBroker::open(data_dir.join("queue.db")).await?;

    let job = DeliveryJob::new(
        channel.into(),
        JobTarget::Ticket {
            ticket_id: format!("oneshot-{}", ulid::Ulid::new()).into(),
        },
        recipient,
        od_channels::OutboundContent::Text {
            body: message.to_string(),
        },
    );
    let job_id = job.id.clone();
    broker.enqueue(job).await?;
    tracing::info!(%job_id, channel_id = channel, "delivery job enqueued");
    Ok(())
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}

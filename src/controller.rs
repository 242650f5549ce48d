//! Controller (spec.md C9, §4.9).
//!
//! Wires C1-C8 from configuration and owns the process lifecycle: opens
//! the Store, starts the Broker's subscriber connections and periodic
//! commit task, wires either the Emulator or the Transport Factory +
//! Ingestion Pipeline, and starts the Query Server. Owns graceful
//! shutdown (stop accepting, drain Broker flushes once, `commit` the
//! Store, close transports) per spec.md §4.9 and the exit codes in §6.
//!
//! Grounded in `services/server/src/main.rs`'s init-then-serve shape and
//! its `shutdown_signal` (`ctrl_c` + SIGTERM) `tokio::select!`.

use crate::broker::{Broker, SubscriberKey};
use crate::config::{ClientConfig, Config};
use crate::emulator::Emulator;
use crate::ingestion;
use crate::push::WsSubscriber;
use crate::query::{self, query_ws_handler, QueryState};
use crate::schema::Schema;
use crate::store::Store;
use crate::transport::{tcp_client, tcp_server, xbee, Endpoint};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

pub const EXIT_OK: i32 = 0;
pub const EXIT_CONFIG_INVALID: i32 = 1;
pub const EXIT_TRANSPORT_FATAL: i32 = 2;

/// Load configuration, wire every component, and run until shutdown.
/// Returns the process exit code (spec.md §6).
pub async fn run(config_path: PathBuf) -> i32 {
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "configuration invalid");
            return EXIT_CONFIG_INVALID;
        }
    };

    let schema = Arc::new(config.schema.clone());
    let store = match Store::open(Path::new(&config.server.database)) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!(error = %err, "failed to open store");
            return EXIT_CONFIG_INVALID;
        }
    };
    for (name, _) in schema.iter_sensors() {
        if let Err(err) = store.ensure_series(name) {
            error!(sensor = name, error = %err, "failed to create series table");
            return EXIT_CONFIG_INVALID;
        }
    }

    let broker = Arc::new(Broker::new());
    connect_subscribers(&config, &broker, &schema).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let commit_handle = tokio::spawn(run_commit_task(
        store.clone(),
        Duration::from_millis(config.server.commit_interval_ms),
        shutdown_rx.clone(),
    ));

    let source_handle = if config.emulation.enable {
        match Emulator::new(
            &config.emulation.expressions,
            &schema,
            Duration::from_millis(config.emulation.interval_ms),
        ) {
            Ok(emulator) => crate::emulator::spawn(
                Arc::new(emulator),
                schema.clone(),
                store.clone(),
                broker.clone(),
                shutdown_rx.clone(),
            ),
            Err(err) => {
                error!(error = %err, "emulator expression rejected");
                return EXIT_CONFIG_INVALID;
            }
        }
    } else {
        match spawn_transport(&config.client, schema.clone(), store.clone(), broker.clone()).await {
            Ok(handle) => handle,
            Err(err) => {
                error!(error = %err, "unrecoverable transport init failure");
                return EXIT_TRANSPORT_FATAL;
            }
        }
    };

    let health_handle = match spawn_health_server(&config, broker.clone()).await {
        Ok(handle) => handle,
        Err(err) => {
            error!(error = %err, "failed to bind health endpoint");
            return EXIT_TRANSPORT_FATAL;
        }
    };

    let query_state = QueryState {
        schema: schema.clone(),
        store: store.clone(),
        keep_alive: config.restful.keep_alive,
    };
    let router = Router::new()
        .route("/", get(query_ws_handler))
        .with_state(query_state);
    let bind_addr = format!("{}:{}", config.restful.url, config.restful.port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%bind_addr, error = %err, "failed to bind query server");
            return EXIT_TRANSPORT_FATAL;
        }
    };
    info!(%bind_addr, "query server listening");

    let query_shutdown_rx = shutdown_rx.clone();
    let query_handle = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(wait_for_shutdown(query_shutdown_rx))
            .await;
        if let Err(err) = result {
            warn!(error = %err, "query server exited with error");
        }
    });

    wait_for_signal().await;
    info!("shutdown requested, draining");
    let _ = shutdown_tx.send(true);

    let _ = query_handle.await;
    let _ = health_handle.await;
    source_handle.abort();
    let _ = commit_handle.await;

    broker.reap().await;
    if let Err(err) = store.commit() {
        error!(error = %err, "final commit failed");
    }

    info!("shutdown complete");
    EXIT_OK
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    let _ = rx.changed().await;
}

/// Waits for SIGTERM or Ctrl-C (SIGINT).
async fn wait_for_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("received Ctrl+C"); },
        () = terminate => { info!("received SIGTERM"); },
    }
}

async fn run_commit_task(store: Arc<Store>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = store.commit() {
                    error!(error = %err, "periodic commit failed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

/// Connect every configured `sockets_io.<srv>` Subscriber to the Broker
/// (spec.md §6 config surface; SPEC_FULL.md header-passing contract).
///
/// Each subscriber's initial connect attempt is retried up to
/// `retries` times, `retry_interval_ms` apart (spec.md §5's configurable
/// retry schedule), before the subscriber is skipped for this run.
async fn connect_subscribers(config: &Config, broker: &Broker, schema: &Schema) {
    let meta = query::sensor_meta_json(schema);
    for sub in &config.sockets_io {
        let key = SubscriberKey {
            server_key: sub.name.clone(),
            namespace: sub.namespace.clone(),
        };
        match connect_with_retry(sub).await {
            Ok(emitter) => {
                // "config" is the full schema snapshot, sent on connect to
                // car/emulation namespaces only (spec.md §6 push channel).
                if matches!(sub.namespace.as_str(), "car" | "emulation") {
                    if emitter.emit_config(schema_snapshot(schema)).await.is_err() {
                        warn!(subscriber = %sub.name, "config snapshot send failed");
                    }
                }
                broker
                    .connect(
                        key,
                        Arc::new(emitter),
                        meta.clone(),
                        Duration::from_millis(sub.interval_ms),
                        sub.retries,
                    )
                    .await;
                info!(subscriber = %sub.name, url = %sub.url, "subscriber connected");
            }
            Err(err) => {
                warn!(subscriber = %sub.name, error = %err, "subscriber connect failed after retries, continuing without it");
            }
        }
    }
}

async fn connect_with_retry(sub: &crate::config::SocketIoConfig) -> Result<WsSubscriber, String> {
    let mut attempt = 0u32;
    loop {
        match WsSubscriber::connect(&sub.url, sub.auth_header.as_deref()).await {
            Ok(emitter) => return Ok(emitter),
            Err(err) => {
                if attempt >= sub.retries {
                    return Err(err);
                }
                attempt += 1;
                warn!(subscriber = %sub.name, attempt, error = %err, "subscriber connect failed, retrying");
                tokio::time::sleep(Duration::from_millis(sub.retry_interval_ms)).await;
            }
        }
    }
}

/// Full schema snapshot for the `config` push event (spec.md §6).
fn schema_snapshot(schema: &Schema) -> serde_json::Value {
    let pdus: Vec<_> = schema
        .iter_pdus()
        .map(|pdu| {
            json!({
                "name": pdu.name,
                "pdu_id": pdu.pdu_id,
                "fields": pdu.fields.iter().map(|f| f.name.clone()).collect::<Vec<_>>(),
            })
        })
        .collect();
    json!({
        "start_byte": schema.start_byte(),
        "pdus": pdus,
        "sensors": query::sensor_meta_json(schema),
    })
}

/// Start the Transport Factory variant selected by configuration and
/// spawn an Ingestion Pipeline task per Endpoint it yields.
async fn spawn_transport(
    client: &ClientConfig,
    schema: Arc<Schema>,
    store: Arc<Store>,
    broker: Arc<Broker>,
) -> Result<tokio::task::JoinHandle<()>, crate::error::TransportError> {
    match client {
        ClientConfig::Socket { host, port } => {
            let bind_addr = format!("{host}:{port}");
            let (endpoints_tx, mut endpoints_rx) = mpsc::channel::<Endpoint>(16);
            // Bind eagerly so a misconfigured address fails fast (EXIT_TRANSPORT_FATAL)
            // instead of surfacing only once the first connection attempt happens.
            let _probe = tokio::net::TcpListener::bind(&bind_addr).await?;
            drop(_probe);

            let bind_addr_for_serve = bind_addr.clone();
            tokio::spawn(async move {
                if let Err(err) = tcp_server::serve(&bind_addr_for_serve, endpoints_tx).await {
                    error!(error = %err, "tcp server transport exited");
                }
            });

            Ok(tokio::spawn(async move {
                while let Some(endpoint) = endpoints_rx.recv().await {
                    tokio::spawn(ingestion::run(
                        endpoint,
                        schema.clone(),
                        store.clone(),
                        broker.clone(),
                    ));
                }
            }))
        }
        ClientConfig::Tcp { host, port } => {
            let addr = format!("{host}:{port}");
            let endpoint = tcp_client::connect(&addr).await?;
            Ok(tokio::spawn(ingestion::run(endpoint, schema, store, broker)))
        }
        ClientConfig::Xbee { com, baud, mac } => {
            let endpoint = xbee::open(com, *baud, mac)?;
            Ok(tokio::spawn(ingestion::run(endpoint, schema, store, broker)))
        }
    }
}

#[derive(Clone)]
struct HealthState {
    broker: Arc<Broker>,
}

async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    axum::Json(json!({ "healthy": state.broker.healthy().await }))
}

/// Ambient liveness endpoint (SPEC_FULL.md "Health/liveness signal"):
/// reports whether at least one Subscriber is currently connected.
async fn spawn_health_server(
    config: &Config,
    broker: Arc<Broker>,
) -> std::io::Result<tokio::task::JoinHandle<()>> {
    let bind_addr = format!("{}:{}", config.server.ip, config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(%bind_addr, "health endpoint listening");
    let router = Router::new()
        .route("/healthz", get(health_handler))
        .with_state(HealthState { broker });
    Ok(tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router).await {
            warn!(error = %err, "health endpoint exited with error");
        }
    }))
}

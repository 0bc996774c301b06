//! # LoRaWAN Gateway Server
//!
//! Starts the gateway frontends configured in the environment:
//!
//! - gRPC `LinkGateway`, plain and TLS
//! - MQTT with the Protobuf and the legacy v2 format, plain and TLS
//! - Basic Station LNS WebSocket, optionally TLS
//! - Industries WebSocket, always mutual TLS
//! - An HTTP endpoint with metrics, health and connection stats
//!
//! Traffic is logged upstream. Configuration is read from `GS_CONFIG` and `GS_`
//! environment variables, see [`lorawan_gs::config::ServerConfig`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use lorawan_gs::cluster::Cluster;
use lorawan_gs::config::ServerConfig;
use lorawan_gs::gateway::{GatewayServer, LogUpstream, Server, StaticRegistry};
use lorawan_gs::model::FrequencyPlanStore;
use lorawan_gs::server::mqtt::{Format, LegacyFormat, ProtobufFormat};
use lorawan_gs::server::{basicstation, grpc, health, industries, mqtt, GrpcService, HealthMetrics, RateLimiter};
use lorawan_gs::utils::GsError;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Entry point for the Gateway Server.
///
/// Initializes logging, loads configuration from the environment,
/// and starts every configured listener.
///
/// # Errors
/// Returns an error if configuration validation fails or if a listener fails to bind.
#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let _ = dotenv::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::from_env()?;
    config.validate()?;

    let cluster = Cluster::new(
        &config.cluster.name,
        &config.cluster.peers,
        &config.cluster.keys,
        config.cluster.tls,
    )?;

    let mut plans = FrequencyPlanStore::builtin();
    if let Some(dir) = &config.frequency_plans_dir {
        let loaded = plans.load_directory(dir)?;
        info!(?dir, loaded, "Loaded frequency plans");
    }

    let profiles = config.rate_limiting.load_profiles()?;
    let rate_limiter = RateLimiter::new(&profiles)?;
    let metrics = HealthMetrics::new()?;
    let registry = StaticRegistry::from_config(&config.gateways)?;
    info!(gateways = config.gateways.len(), profiles = profiles.len(), "Registry ready");

    let gs = GatewayServer::new(
        Arc::new(registry),
        Arc::new(plans),
        rate_limiter.clone(),
        Arc::new(LogUpstream),
        metrics.clone(),
        config.gateway_server_options(),
    );
    let server: Arc<dyn Server> = Arc::new(gs.clone());

    let shutdown = CancellationToken::new();
    gs.spawn_update_watcher(shutdown.clone());
    rate_limiter.spawn_compaction(Duration::from_secs(60), shutdown.clone());

    let mut tasks = JoinSet::new();
    let listeners = &config.listeners;

    if let Some(address) = listeners.http {
        let listener = bind(address).await?;
        spawn(&mut tasks, "http", health::serve_http(listener, gs.clone(), metrics.clone(), shutdown.clone()));
    }

    let grpc_service = Arc::new(GrpcService::new(
        Arc::clone(&server),
        config.grpc_options(cluster.keys().clone()),
    ));
    if let Some(address) = listeners.grpc {
        let listener = bind(address).await?;
        spawn(&mut tasks, "grpc", grpc::serve(listener, None, Arc::clone(&grpc_service), shutdown.clone()));
    }
    if let Some(address) = listeners.grpc_tls {
        let listener = bind(address).await?;
        let identity = config.grpc_identity()?;
        spawn(
            &mut tasks,
            "grpc_tls",
            grpc::serve(listener, Some(identity), Arc::clone(&grpc_service), shutdown.clone()),
        );
    }

    let mqtt_listeners: [(Option<SocketAddr>, bool, Arc<dyn Format>, &str); 4] = [
        (listeners.mqtt, false, Arc::new(ProtobufFormat), "mqtt"),
        (listeners.mqtts, true, Arc::new(ProtobufFormat), "mqtts"),
        (listeners.mqtt_v2, false, Arc::new(LegacyFormat), "mqtt_v2"),
        (listeners.mqtt_v2_tls, true, Arc::new(LegacyFormat), "mqtt_v2_tls"),
    ];
    for (address, tls, format, name) in mqtt_listeners {
        let Some(address) = address else { continue };
        let listener = bind(address).await?;
        let acceptor = if tls { Some(config.create_tls_acceptor()?) } else { None };
        spawn(
            &mut tasks,
            name,
            mqtt::serve(
                listener,
                acceptor,
                Arc::clone(&server),
                format,
                config.mqtt_options(),
                shutdown.clone(),
            ),
        );
    }

    if let Some(address) = listeners.basic_station {
        let listener = bind(address).await?.into_std()?;
        let tls = if config.basic_station.tls {
            Some(RustlsConfig::from_config(config.rustls_config()?))
        } else {
            None
        };
        spawn(
            &mut tasks,
            "basic_station",
            basicstation::serve(
                listener,
                tls,
                Arc::clone(&server),
                config.basic_station_options(),
                shutdown.clone(),
            ),
        );
    }

    if let Some(address) = listeners.industries {
        let listener = bind(address).await?;
        let acceptor = config.create_industries_acceptor()?;
        spawn(
            &mut tasks,
            "industries",
            industries::serve(
                listener,
                acceptor,
                Arc::clone(&server),
                config.industries_options(),
                shutdown.clone(),
            ),
        );
    }

    // Handle listener failures or shutdown signals
    tokio::select! {
        Some(joined) = tasks.join_next() => {
            if let Err(err) = joined {
                error!(error = %err, "Listener task failed");
            }
        }
        _ = shutdown_signal() => info!("Shutting down gracefully"),
    }
    shutdown.cancel();
    for uid in gs.connections().uids() {
        if let Some(conn) = gs.connections().get(&uid) {
            conn.disconnect(GsError::Canceled);
        }
    }
    while tasks.join_next().await.is_some() {}

    Ok(())
}

async fn bind(address: SocketAddr) -> Result<TcpListener, GsError> {
    TcpListener::bind(address)
        .await
        .map_err(|e| GsError::Configuration(format!("bind {}: {}", address, e)))
}

fn spawn<F>(tasks: &mut JoinSet<()>, name: &'static str, listener: F)
where
    F: Future<Output = Result<(), GsError>> + Send + 'static,
{
    tasks.spawn(async move {
        match listener.await {
            Ok(()) => info!(listener = name, "Listener stopped"),
            Err(err) => error!(listener = name, error = %err, "Listener failed"),
        }
    });
}

/// Listens for a shutdown signal (Ctrl+C) and initiates a graceful shutdown.
async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!(error = %err, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

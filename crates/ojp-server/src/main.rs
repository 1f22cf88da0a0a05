//! OJP proxy server binary
//!
//! Boots the request plane from configuration, exposes the statement and
//! health services over gRPC, and runs the maintenance loop (idle-session
//! reaping, coordinator target application) until shutdown.

use anyhow::{Context, Result};
use clap::Parser;
use ojp_proto::health_service_server::HealthServiceServer;
use ojp_proto::statement_service_server::StatementServiceServer;
use ojp_server::backend::memory::MemoryConnector;
use ojp_server::config::ServerConfig;
use ojp_server::dispatcher::Dispatcher;
use ojp_server::health::{
    HealthRegistry, HealthServiceImpl, ServingStatus, OJP_SERVER, OPENTELEMETRY_SERVICE,
};
use ojp_server::service::OjpStatementService;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tonic::transport::Server;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// OJP proxy server - remote database access over gRPC.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "OJP_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (default: all interfaces)
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let mut config = ServerConfig::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let filter = if args.debug {
        "debug,ojp_server=trace".to_string()
    } else {
        config.log_level.to_lowercase()
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.thread_pool_size.clamp(2, 512))
        .enable_all()
        .build()
        .context("failed to build runtime")?;
    runtime.block_on(serve(config, args.bind))
}

async fn serve(config: ServerConfig, bind: String) -> Result<()> {
    let addr = format!("{}:{}", bind, config.server.port)
        .parse()
        .context("failed to parse bind address")?;

    let health = Arc::new(HealthRegistry::new());
    health.set(OJP_SERVER, ServingStatus::Serving);
    health.set(
        OPENTELEMETRY_SERVICE,
        if config.opentelemetry.enabled {
            ServingStatus::Serving
        } else {
            ServingStatus::NotServing
        },
    );

    info!(
        prometheus_port = config.prometheus.port,
        otel_enabled = config.opentelemetry.enabled,
        "telemetry export is wired by the deployment"
    );

    // No native driver is linked into this build; the in-memory backend
    // serves development and integration testing.
    let connector = Arc::new(MemoryConnector::new());
    let max_request_size = config.max_request_size;

    // An invalid whitelist is the one non-recoverable startup error.
    let dispatcher = Dispatcher::new(config, connector).context("invalid IP whitelist")?;

    let maintenance_dispatcher = dispatcher.clone();
    let maintenance = tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(5));
        loop {
            tick.tick().await;
            maintenance_dispatcher.run_maintenance().await;
        }
    });

    info!("starting OJP gRPC server on {}", addr);
    Server::builder()
        .add_service(
            StatementServiceServer::new(OjpStatementService::new(dispatcher.clone()))
                .max_decoding_message_size(max_request_size),
        )
        .add_service(HealthServiceServer::new(HealthServiceImpl::new(
            health.clone(),
        )))
        .serve_with_shutdown(addr, shutdown_signal())
        .await
        .context("gRPC server failed")?;

    info!("shutting down");
    health.set(OJP_SERVER, ServingStatus::NotServing);
    maintenance.abort();
    dispatcher.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

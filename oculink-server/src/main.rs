//! # Oculink Server
//!
//! Device-integration service for the clinic EMR: ingests measurement
//! files and images from ophthalmology devices over SMB, extracts patient
//! identity, and emits normalized records plus a real-time event stream.
//!
//! ## Architecture
//!
//! The server is built on Axum and uses:
//! - Redis for the durable priority job queue (with an in-process fallback)
//! - `smbclient` subprocesses for the SMB wire
//! - The EMR backend's internal REST API as the document store
//! - An OCR microservice for image/DICOM identity extraction

pub mod errors;
pub mod handlers;
pub mod routes;
pub mod state;
pub mod store;
pub mod websocket;

use clap::Parser;
use oculink_core::{ExternalPorts, IntegrationContext};
use state::AppState;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use store::EmrApiClient;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use websocket::ConnectionManager;

/// Command line arguments for the Oculink integration server
#[derive(Parser, Debug)]
#[command(name = "oculink-server")]
#[command(about = "EMR device-integration service: SMB ingestion, job queue, and event stream")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(long, env = "OCULINK_CONFIG")]
    config: Option<PathBuf>,

    /// Server port (overrides config)
    #[arg(short, long, env = "SERVER_PORT")]
    port: Option<u16>,

    /// Server host (overrides config)
    #[arg(long, env = "SERVER_HOST")]
    host: Option<String>,

    /// EMR backend base URL
    #[arg(long, env = "EMR_API_URL", default_value = "http://localhost:4000")]
    emr_api_url: String,

    /// Service token for the EMR backend
    #[arg(long, env = "EMR_API_TOKEN", default_value = "")]
    emr_api_token: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "oculink_server=info,oculink_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .ok();

    let args = Args::parse();
    let mut config = oculink_config::load_config(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }

    if args.emr_api_token.is_empty() {
        warn!("EMR_API_TOKEN is empty; the EMR backend will reject writes");
    }
    let emr = Arc::new(EmrApiClient::new(&args.emr_api_url, &args.emr_api_token)?);
    let ports = ExternalPorts {
        devices: emr.clone(),
        measurements: emr.clone(),
        logs: emr.clone(),
        directory: emr.clone(),
        unmatched: emr.clone(),
        record_patches: emr,
    };

    let core = IntegrationContext::initialize(&config, ports).await?;
    core.start(config.sync.auto_start);

    let websocket_manager = Arc::new(ConnectionManager::new(core.broadcaster.clone()));
    let state = AppState {
        core: core.clone(),
        websocket_manager,
        config: Arc::new(config.clone()),
    };
    let app = routes::create_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!(%addr, "oculink server listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    core.shutdown().await;
    info!("oculink server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        warn!("failed to install ctrl-c handler");
        std::future::pending::<()>().await;
    }
}

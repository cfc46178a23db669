//! PromptCache gRPC Server
//!
//! Main entry point for the prompt-cache service.
//!
//! ## Overview
//! The server answers Lookup / Read / Write / StreamingRead RPCs against
//! tenant blob storage accounts. Tenants are resolved through per-account
//! configuration documents in a meta storage container; the region this
//! instance serves and the location of that container come from a JSON
//! service configuration file.
//!
//! ## Example
//! ```bash
//! promptcache-server --config service-config.json --port 50051 \
//!     --log-level info --metrics-endpoint 0.0.0.0:9464
//! ```
//!
//! ## Configuration file
//! ```json
//! {
//!   "currentLocation": "westus2",
//!   "configurationStore": "promptmetastore",
//!   "configurationContainer": "accounts"
//! }
//! ```
//!
//! ## Shutdown
//! SIGINT/SIGTERM drain outstanding RPCs and then exit. Exit code 0 is a
//! clean shutdown; startup failures exit 1 with a descriptive message.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tonic::transport::Server;

use promptcache_proto::kvstore::kv_store_service_server::KvStoreServiceServer;
use promptcache_resolver::{DatabaseResolver, ServiceConfig};
use promptcache_server::{metrics, PromptCacheService};
use promptcache_store::{AzureCredentials, AzureStoreOpener, TransportConfig};

const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;
// HTTP/2 protocol ceiling for SETTINGS_MAX_FRAME_SIZE.
const MAX_FRAME_SIZE: u32 = (1 << 24) - 1;
const STREAM_WINDOW_SIZE: u32 = 64 * 1024 * 1024;
const MAX_CONCURRENT_STREAMS: u32 = 200;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Error,
    Info,
    Verbose,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Info => "info",
            LogLevel::Verbose => "debug",
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "promptcache-server", about = "PromptCache gRPC service")]
struct Args {
    /// Path to the service configuration JSON file.
    #[arg(long, default_value = "service-config.json")]
    config: String,

    /// Host to bind to.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on.
    #[arg(long, default_value_t = 50051)]
    port: u16,

    /// Number of runtime worker threads (0 = CPU count).
    #[arg(long, default_value_t = 0)]
    threads: usize,

    /// Log level.
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// Log every storage HTTP request at debug level.
    #[arg(long)]
    enable_sdk_logging: bool,

    /// Disable source-interface round-robin for storage traffic.
    #[arg(long)]
    disable_multi_nic: bool,

    /// Source addresses to round-robin storage traffic across.
    #[arg(long = "source-address")]
    source_addresses: Vec<IpAddr>,

    /// Disable per-RPC metric events.
    #[arg(long)]
    disable_metrics: bool,

    /// Bind address for the Prometheus /metrics listener.
    #[arg(long)]
    metrics_endpoint: Option<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if args.threads > 0 {
        builder.worker_threads(args.threads);
    }
    builder.build()?.block_on(run(args))
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(args.log_level.as_filter())),
        )
        .init();

    metrics::init();
    metrics::set_metric_events(!args.disable_metrics);

    // Load and validate service configuration; abort startup on failure.
    tracing::info!("Loading configuration from: {}", args.config);
    let service_config = ServiceConfig::load(&args.config).await?;
    tracing::info!(
        region = %service_config.current_location,
        config_store = %service_config.configuration_store,
        config_container = %service_config.configuration_container,
        domain_suffix = %service_config.domain_suffix,
        "Configuration loaded"
    );

    // Storage transport shared by every engine this process creates.
    let transport = TransportConfig {
        source_addresses: args.source_addresses.clone(),
        multi_nic: !args.disable_multi_nic && !args.source_addresses.is_empty(),
        http_logging: args.enable_sdk_logging,
        ..TransportConfig::default()
    };
    let opener = Arc::new(AzureStoreOpener::new(
        AzureCredentials::from_env(),
        transport,
    ));

    let resolver = Arc::new(DatabaseResolver::new(service_config, opener)?);
    let service = PromptCacheService::new(resolver);

    // Optional Prometheus scrape listener.
    if let Some(endpoint) = &args.metrics_endpoint {
        let listener = tokio::net::TcpListener::bind(endpoint).await?;
        tracing::info!("Metrics listener on {}", endpoint);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, metrics::create_metrics_router()).await {
                tracing::error!("Metrics listener failed: {}", e);
            }
        });
    }

    let reflection = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(promptcache_proto::FILE_DESCRIPTOR_SET)
        .build_v1()?;

    let bind_addr = format!("{}:{}", args.host, args.port).parse()?;
    tracing::info!("PromptCache server starting on {}", bind_addr);

    Server::builder()
        .tcp_nodelay(true)
        .tcp_keepalive(Some(Duration::from_secs(20)))
        .http2_keepalive_interval(Some(Duration::from_secs(10)))
        .http2_keepalive_timeout(Some(Duration::from_secs(5)))
        .initial_stream_window_size(Some(STREAM_WINDOW_SIZE))
        .initial_connection_window_size(Some(STREAM_WINDOW_SIZE))
        .max_frame_size(Some(MAX_FRAME_SIZE))
        .max_concurrent_streams(Some(MAX_CONCURRENT_STREAMS))
        .add_service(
            KvStoreServiceServer::new(service)
                .max_decoding_message_size(MAX_MESSAGE_SIZE)
                .max_encoding_message_size(MAX_MESSAGE_SIZE),
        )
        .add_service(reflection)
        .serve_with_shutdown(bind_addr, shutdown_signal())
        .await?;

    tracing::info!("PromptCache server shut down gracefully");
    Ok(())
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        },
    }
}

//! s3ep — transparent envelope-encrypting proxy for S3-compatible object stores

use arc_swap::ArcSwap;
use axum::extract::State;
use axum::http::uri::Uri;
use axum::middleware::{self, Next};
use clap::Parser;
use s3ep::api::handlers::AppState;
use s3ep::config::Config;
use s3ep::crypto::{EnvelopeEngine, KekRing};
use s3ep::license::LicenseGate;
use s3ep::multipart::MultipartTable;
use s3ep::shutdown::ShutdownSupervisor;
use s3ep::upstream::{Forwarder, ObjectStore, S3Upstream};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Version string including build timestamp for --version output
fn version_long() -> &'static str {
    // e.g. "0.4.3 (built 2026-02-23T21:40:07Z)"
    static V: std::sync::OnceLock<String> = std::sync::OnceLock::new();
    V.get_or_init(|| {
        format!(
            "{} (built {})",
            env!("CARGO_PKG_VERSION"),
            env!("S3EP_BUILD_TIME"),
        )
    })
}

/// s3ep — transparent envelope-encrypting proxy for S3-compatible object stores
#[derive(Parser, Debug)]
#[command(name = "s3ep")]
#[command(version = version_long())]
#[command(author, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Listen address (overrides config)
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Parse and validate the configuration, then exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration from file if specified, otherwise from environment
    let mut config = if let Some(ref path) = cli.config {
        Config::from_file(path)?
    } else {
        Config::from_env()?
    };

    if let Some(ref addr) = cli.listen {
        config.bind_address = addr.parse()?;
    }

    if cli.check_config {
        println!("Configuration OK");
        return Ok(());
    }

    // Initialize tracing.
    // Priority: RUST_LOG > S3EP_LOG_LEVEL > --verbose > config log_level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| std::env::var("S3EP_LOG_LEVEL").map(EnvFilter::new))
        .unwrap_or_else(|_| {
            if cli.verbose {
                EnvFilter::new("s3ep=trace,tower_http=trace")
            } else {
                EnvFilter::new(format!("s3ep={},tower_http=info", config.log_level))
            }
        });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        "Starting s3ep v{} (built {})",
        env!("CARGO_PKG_VERSION"),
        env!("S3EP_BUILD_TIME"),
    );
    info!("  Listen address: {}", config.bind_address);
    info!("  Upstream endpoint: {}", config.upstream.endpoint);
    info!("  Upstream region: {}", config.upstream.region);
    info!(
        "  Streaming threshold: {} MiB",
        config.encryption.streaming_threshold_bytes / 1024 / 1024
    );
    info!("  Active provider alias: {}", config.encryption.active_alias);

    // License gate: the validator collaborator hands us the permitted
    // provider types; absent configuration means unrestricted.
    let gate = match &config.license {
        Some(license) => {
            info!(
                "  License gate: {:?}",
                license.permitted_provider_types
            );
            LicenseGate::from_permitted(license.permitted_provider_types.iter().copied())
        }
        None => LicenseGate::permissive(),
    };

    // Load and self-check every KEK provider before accepting traffic.
    let ring = KekRing::from_config(&config.encryption, &gate)?;
    ring.validate_all().await?;
    let engine = EnvelopeEngine::new(Arc::new(ArcSwap::from_pointee(ring)));

    let store: Arc<dyn ObjectStore> = Arc::new(S3Upstream::new(&config.upstream));
    let forwarder = Arc::new(Forwarder::new(&config.upstream)?);
    let multipart = Arc::new(MultipartTable::new(
        store.clone(),
        config.encryption.multipart_part_size_bytes,
    ));
    let supervisor = ShutdownSupervisor::new();

    // Evict multipart state abandoned by crashed clients; the upstream
    // abort rides along so half-uploaded parts don't accrue storage.
    {
        let multipart = multipart.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(300));
            loop {
                tick.tick().await;
                multipart.cleanup_expired(Duration::from_secs(24 * 3600)).await;
            }
        });
    }

    let state = Arc::new(AppState {
        store,
        engine,
        multipart,
        forwarder,
        supervisor: supervisor.clone(),
        streaming_threshold: config.encryption.streaming_threshold_bytes,
        max_object_size: config.max_object_size,
    });

    let app = s3ep::api::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn_with_state(
            Arc::new(config.virtual_host_suffix.clone()),
            rewrite_virtual_host,
        ))
        // CORS outermost so OPTIONS preflight is answered before anything else
        .layer(CorsLayer::permissive());

    let listener = TcpListener::bind(&config.bind_address).await?;
    info!("s3ep listening on http://{}", config.bind_address);

    let drain_timeout = Duration::from_secs(config.shutdown_timeout_seconds);
    let shutdown_supervisor = supervisor.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown_supervisor.begin_shutdown();

            // Watchdog: if the drain deadline passes, in-flight requests are
            // forcibly dropped rather than holding the process open.
            let watchdog = shutdown_supervisor.clone();
            tokio::spawn(async move {
                if !watchdog.drain(drain_timeout).await {
                    warn!("Drain deadline exceeded, aborting remaining requests");
                    std::process::exit(1);
                }
            });
        })
        .await?;

    let _ = supervisor.drain(drain_timeout).await;
    info!("Server shutdown complete");
    Ok(())
}

/// Rewrite virtual-hosted-style requests (`bucket.suffix` in the Host
/// header) into path-style before routing. Path-style requests and requests
/// for other hosts pass through untouched.
async fn rewrite_virtual_host(
    State(suffix): State<Arc<Option<String>>>,
    mut request: axum::extract::Request,
    next: Next,
) -> axum::response::Response {
    if let Some(ref suffix) = *suffix {
        let host = request
            .headers()
            .get("host")
            .and_then(|v| v.to_str().ok())
            .map(|h| h.split(':').next().unwrap_or(h).to_string());

        if let Some(host) = host {
            if let Some(bucket) = host.strip_suffix(&format!(".{suffix}")) {
                if !bucket.is_empty() && !bucket.contains('.') {
                    let path = request.uri().path();
                    let rewritten = match request.uri().query() {
                        Some(q) => format!("/{bucket}{path}?{q}"),
                        None => format!("/{bucket}{path}"),
                    };
                    if let Ok(uri) = rewritten.parse::<Uri>() {
                        *request.uri_mut() = uri;
                    }
                }
            }
        }
    }
    next.run(request).await
}

/// Handle shutdown signals (SIGINT, SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            warn!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}

//! Dataset Convergence Agent
//!
//! Runs the convergence loop for one node, serving health and Prometheus
//! metrics endpoints alongside it.

use anyhow::Context;
use clap::Parser;
use hyper::service::{make_service_fn, service_fn};
use hyper::{header, Body, Request, Response, Server, StatusCode};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use dataset_convergence_agent::{
    AgentConfig, AgentMetrics, BackendFactory, ClusterStateService, ConfigurationStoreRef,
    ConvergenceLoop, FileConfigurationStore, InMemoryConfigurationStore,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Dataset Convergence Agent - converges block-device datasets on this node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Agent configuration file (YAML); flags override its values
    #[arg(long, env = "AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Desired deployment file (YAML); without it the deployment is held in memory
    #[arg(long, env = "DEPLOYMENT_FILE")]
    deployment: Option<PathBuf>,

    /// Identity of this node in the deployment
    #[arg(long, env = "NODE_HOSTNAME")]
    hostname: Option<String>,

    /// Block device backend (loopback, memory)
    #[arg(long, env = "BACKEND")]
    backend: Option<String>,

    /// Root directory of the loopback backend
    #[arg(long, env = "LOOPBACK_ROOT")]
    loopback_root: Option<PathBuf>,

    /// Seconds between convergence passes
    #[arg(long, env = "CONVERGENCE_INTERVAL")]
    interval_secs: Option<u64>,

    /// Run a single convergence pass and exit
    #[arg(long)]
    once: bool,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// Load the config file, if any, and apply flag overrides
    async fn agent_config(&self) -> anyhow::Result<AgentConfig> {
        let mut config = match &self.config {
            Some(path) => AgentConfig::from_yaml_file(path)
                .await
                .with_context(|| format!("loading agent config {}", path.display()))?,
            None => AgentConfig::default(),
        };

        if let Some(hostname) = &self.hostname {
            config.hostname = hostname.clone();
        }
        if let Some(backend) = &self.backend {
            config.backend.name = backend.clone();
        }
        if let Some(root) = &self.loopback_root {
            config.backend.loopback.root_path = root.clone();
        }
        if let Some(secs) = self.interval_secs {
            config.convergence_interval_secs = secs;
        }

        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    let config = args.agent_config().await?;

    info!("Starting Dataset Convergence Agent");
    info!("  Version: {}", dataset_convergence_agent::VERSION);
    info!("  Hostname: {}", config.hostname);
    info!("  Backend: {}", config.backend.name);
    info!("  Interval: {}s", config.convergence_interval_secs);

    let metrics = AgentMetrics::new(prometheus::default_registry())?;
    let backend = BackendFactory::from_config(config.backend.clone())?;

    let config_store: ConfigurationStoreRef = match &args.deployment {
        Some(path) => {
            info!("  Deployment: {}", path.display());
            Arc::new(FileConfigurationStore::new(path))
        }
        None => {
            warn!("No deployment file given; holding an empty deployment in memory");
            Arc::new(InMemoryConfigurationStore::default())
        }
    };

    let cluster_state = ClusterStateService::with_metrics(metrics.clone());
    let agent = ConvergenceLoop::new(config, backend, config_store, cluster_state, Some(metrics));

    agent.initialize().await?;
    info!("Convergence loop initialized");

    if args.once {
        let report = agent.run_pass().await?;
        info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            "Single pass complete"
        );
        if !report.is_clean() {
            anyhow::bail!("{} action(s) failed", report.failed());
        }
        return Ok(());
    }

    let shutdown = CancellationToken::new();

    // Start health server
    let health_addr = parse_addr(&args.health_addr, "health")?;
    let health_agent = agent.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_addr, health_agent).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = parse_addr(&args.metrics_addr, "metrics")?;
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr).await {
            error!("Metrics server error: {}", e);
        }
    });

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        signal_token.cancel();
    });

    agent.run(shutdown).await;

    info!("Agent shutdown complete");
    Ok(())
}

fn parse_addr(addr: &str, server: &str) -> anyhow::Result<SocketAddr> {
    addr.parse()
        .with_context(|| format!("invalid {} server address: {}", server, addr))
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    if let Ok(directive) = "hyper=warn".parse() {
        filter = filter.add_directive(directive);
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, header::HeaderValue::from_static(content_type));
    response
}

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: SocketAddr, agent: Arc<ConvergenceLoop>) -> anyhow::Result<()> {
    let make_svc = make_service_fn(move |_conn| {
        let agent = agent.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let agent = agent.clone();
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => respond(StatusCode::OK, "text/plain", "ok"),
                        "/readyz" | "/status" => {
                            let last_pass = agent.last_pass().await;
                            let status = match &last_pass {
                                Some(summary) if summary.error.is_none() => StatusCode::OK,
                                _ => StatusCode::SERVICE_UNAVAILABLE,
                            };
                            let body = serde_json::json!({
                                "hostname": agent.hostname(),
                                "last_pass": last_pass,
                            });
                            respond(status, "application/json", body.to_string())
                        }
                        _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!("Health server listening on {}", addr);
    Server::bind(&addr).serve(make_svc).await?;
    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: SocketAddr) -> anyhow::Result<()> {
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let mut buffer = Vec::new();
                    match encoder.encode(&prometheus::gather(), &mut buffer) {
                        Ok(()) => {
                            let mut response = Response::new(Body::from(buffer));
                            if let Ok(value) = header::HeaderValue::from_str(encoder.format_type()) {
                                response.headers_mut().insert(header::CONTENT_TYPE, value);
                            }
                            response
                        }
                        Err(e) => respond(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "text/plain",
                            format!("encoding metrics: {}", e),
                        ),
                    }
                }
                _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr).serve(make_svc).await?;
    Ok(())
}

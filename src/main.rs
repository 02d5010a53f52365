//! JovianDSS CSI Plugin
//!
//! Runs the controller, the node plugin, or both, behind the REST API.

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use joviandss_csi::{
    ApiServer, ApiServerConfig, AppState, BackendFactory, ControllerService, CsiMetrics, Error,
    IdentityService, IscsiAdm, NodeService, PluginConfig, Result, SystemMounter,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Which halves of the plugin this process serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Controller,
    Node,
    All,
}

impl Mode {
    fn controller(self) -> bool {
        matches!(self, Mode::Controller | Mode::All)
    }

    fn node(self) -> bool {
        matches!(self, Mode::Node | Mode::All)
    }
}

/// JovianDSS CSI Plugin
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Plugin configuration file
    #[arg(long, env = "JOVIAN_CSI_CONFIG")]
    config: String,

    /// Services to run
    #[arg(long, env = "JOVIAN_CSI_MODE", value_enum, default_value = "all")]
    mode: Mode,

    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
    api_addr: String,

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

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting {} {}", joviandss_csi::PLUGIN_NAME, joviandss_csi::VERSION);
    info!("  Mode: {:?}", args.mode);
    info!("  REST API: {}", args.api_addr);

    let config = PluginConfig::from_file(&args.config)?;
    let metrics = CsiMetrics::new()?;

    let controller = if args.mode.controller() {
        let controller_config = config.controller.clone().ok_or_else(|| {
            Error::Configuration("controller mode needs a controller section".into())
        })?;
        let backend = BackendFactory::create(&controller_config)?;
        let service = ControllerService::new(controller_config, backend);
        service.initialize().await?;
        Some(Arc::new(service))
    } else {
        None
    };

    let node = if args.mode.node() {
        let node_config = config.node.clone().ok_or_else(|| {
            Error::Configuration("node mode needs a node section".into())
        })?;
        info!("  Node id: {}", node_config.id);
        Some(Arc::new(NodeService::new(
            node_config,
            Arc::new(IscsiAdm::new()),
            Arc::new(SystemMounter::new()),
        )))
    } else {
        None
    };

    let shutdown = CancellationToken::new();

    // Start health server
    let health_addr = parse_addr(&args.health_addr, "health server")?;
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = parse_addr(&args.metrics_addr, "metrics server")?;
    let exported = metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr, exported).await {
            error!("Metrics server error: {}", e);
        }
    });

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupt received, shutting down"),
            Err(e) => error!("Unable to listen for interrupt: {}", e),
        }
        signal.cancel();
    });

    let state = AppState {
        identity: IdentityService::new(controller.is_some()),
        controller,
        node,
        metrics,
    };
    let api_config = ApiServerConfig {
        rest_addr: parse_addr(&args.api_addr, "REST API")?,
    };

    ApiServer::new(api_config, state, shutdown).run().await?;

    info!("Plugin shutdown complete");
    Ok(())
}

fn parse_addr(raw: &str, what: &str) -> Result<SocketAddr> {
    raw.parse()
        .map_err(|e| Error::Configuration(format!("Invalid {} address {}: {}", what, raw, e)))
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
    for directive in ["hyper=warn", "reqwest=info", "tower=warn", "axum=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
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

// =============================================================================
// Health Server
// =============================================================================

fn plain_response(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: SocketAddr) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => plain_response(StatusCode::OK, "ok"),
                _ => plain_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    info!("Health server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Health server bind error: {}", e)))?
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: SocketAddr, metrics: CsiMetrics) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match metrics.encode() {
                            Ok((content_type, buffer)) => {
                                let mut response = plain_response(StatusCode::OK, buffer);
                                if let Ok(value) = HeaderValue::from_str(&content_type) {
                                    response.headers_mut().insert(CONTENT_TYPE, value);
                                }
                                response
                            }
                            Err(e) => plain_response(
                                StatusCode::INTERNAL_SERVER_ERROR,
                                e.to_string(),
                            ),
                        },
                        _ => plain_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    info!("Metrics server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Metrics server bind error: {}", e)))?
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}

use clap::Parser;
use llm_router::config::config_search_paths;
use llm_router::{
    build_router, AppState, HttpTransport, Registry, RegistryHandle, Relay, RouterConfig,
    SharedLogger,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "llm-router",
    about = "Protocol-translating LLM gateway: serve any configured backend in the caller's API",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Audit log file (overrides config)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Print config search paths and exit
    #[arg(long)]
    show_config_paths: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llm_router=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if cli.show_config_paths {
        println!("Config search paths:");
        for (i, path) in config_search_paths().iter().enumerate() {
            println!("  {}. {}", i + 1, path.display());
        }
        return Ok(());
    }

    let (mut config, config_path) = RouterConfig::find_and_load(cli.config.as_deref())?;

    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(log_file) = cli.log_file {
        config.server.log_file = log_file;
    }

    let registry = Arc::new(RegistryHandle::new(Registry::from_config(&config)?));
    let logger = SharedLogger::new(&config.server.log_file)?;
    let transport = Arc::new(HttpTransport::new()?);
    let relay = Relay::new(registry.clone(), transport).with_audit(logger.clone());

    info!("╔═══════════════════════════════════════════════════════╗");
    info!("║           llm-router v{}                           ║", env!("CARGO_PKG_VERSION"));
    info!("╚═══════════════════════════════════════════════════════╝");
    info!("  Config:    {}", config_path.display());
    for route in registry.current().routes() {
        info!(
            "  Model:     {} -> {} {} ({})",
            route.name,
            route.protocol,
            route.url,
            route.upstream_model()
        );
    }
    info!("  Mutations: {} enabled", registry.current().content.len());
    info!("  Log file:  {}", config.server.log_file.display());

    logger.info(
        "startup",
        format!(
            "Starting llm-router models={} port={}",
            config.routes.len(),
            config.server.port
        ),
    );

    #[cfg(unix)]
    spawn_reload_on_hangup(config_path, registry.clone(), logger.clone())?;

    let app = build_router(Arc::new(AppState { relay }));
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    Ok(())
}

/// Re-read the config on SIGHUP and swap the registry snapshot. A broken file
/// keeps the running snapshot.
#[cfg(unix)]
fn spawn_reload_on_hangup(
    path: PathBuf,
    registry: Arc<RegistryHandle>,
    logger: SharedLogger,
) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangups = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        while hangups.recv().await.is_some() {
            match reload(&path) {
                Ok(next) => {
                    let models = next.model_names().len();
                    registry.swap(next);
                    info!(path = %path.display(), models, "Config reloaded");
                    logger.info("reload", format!("Reloaded {} models={}", path.display(), models));
                }
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "Config reload failed");
                    logger.warn("reload", format!("Reload of {} failed: {}", path.display(), e));
                }
            }
        }
    });
    Ok(())
}

#[cfg(unix)]
fn reload(path: &Path) -> llm_router::Result<Registry> {
    Registry::from_config(&RouterConfig::load(path)?)
}

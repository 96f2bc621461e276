use clap::Parser;
use llm_gateway::cache::{MemoryCache, RedisCache, SharedCache};
use llm_gateway::config::config_search_paths;
use llm_gateway::logging::UsageLogger;
use llm_gateway::store::{GatewayStore, MemoryStore, PgStore};
use llm_gateway::{build_router, AppState, Gateway, GatewayConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "llm-gateway",
    about = "Metered OpenAI-compatible gateway in front of OpenAI, Anthropic, Gemini and DeepSeek",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Postgres URL (overrides config)
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Redis URL for the shared cache (overrides config)
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

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
                .unwrap_or_else(|_| "llm_gateway=info,tower_http=info".into()),
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

    let mut config = GatewayConfig::find_and_load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    if cli.database_url.is_some() {
        config.database.url = cli.database_url.clone();
    }
    if cli.redis_url.is_some() {
        config.cache.redis_url = cli.redis_url.clone();
    }
    config.validate()?;

    let store: Arc<dyn GatewayStore> = match config.database.url {
        Some(ref url) => {
            let pg = PgStore::connect(url).await?;
            pg.migrate(&config.database.migrations_dir).await?;
            if !config.seed.is_empty() {
                warn!("[seed] is ignored when a database is configured");
            }
            Arc::new(pg)
        }
        None => {
            let memory = MemoryStore::new();
            config.seed.apply(&memory)?;
            warn!(
                users = config.seed.users.len(),
                channels = config.seed.channels.len(),
                "No database configured, using the in-memory store"
            );
            Arc::new(memory)
        }
    };

    let cache: Arc<dyn SharedCache> = match config.cache.redis_url {
        Some(ref url) => Arc::new(RedisCache::new(url)?),
        None => Arc::new(MemoryCache::new()),
    };

    let client = reqwest::Client::builder()
        .timeout(config.gateway.upstream_timeout())
        .build()?;

    let mut usage = UsageLogger::new(store.clone());
    if let Some(ref path) = config.logging.usage_file {
        usage = usage.with_mirror(path)?;
    }

    let gateway = Arc::new(
        Gateway::new(&config, store, cache, client).with_usage_logger(usage),
    );
    let state = AppState {
        gateway: gateway.clone(),
        settings: config.gateway.clone(),
    };

    info!("llm-gateway v{}", env!("CARGO_PKG_VERSION"));
    info!(
        port = config.port,
        store = if config.database.url.is_some() { "postgres" } else { "memory" },
        cache = if config.cache.redis_url.is_some() { "redis" } else { "memory" },
        max_attempts = config.gateway.max_attempts,
        "configuration loaded"
    );

    let app = build_router(state);
    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped, draining deferred jobs");
    gateway.jobs().shutdown(config.gateway.shutdown_grace()).await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

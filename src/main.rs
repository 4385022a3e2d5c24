use anyhow::Result;
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use corridor_gate::cache::Cache;
use corridor_gate::config::{CacheParams, Config, TimeoutParams};
use corridor_gate::router::{build_router, refresh_catalogs, AppState};

#[derive(Parser)]
#[command(name = "corridor-gate")]
#[command(about = "Prometheus-compatible anomaly-corridor gateway", long_about = None)]
struct Cli {
    /// Path to the INI configuration file
    #[arg(short, long, env = "CORRIDOR_GATE_CONFIG", default_value = "config/config.cfg")]
    config: String,

    /// Server host
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Server port
    #[arg(short, long, default_value = "9105")]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "corridor_gate=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config_path = shellexpand::tilde(&cli.config).to_string();
    let config = Config::from_file(&config_path)?;
    tracing::info!("loaded config from {}", config_path);

    let cache_params = CacheParams::from_config(&config);
    let cache = Arc::new(Cache::open(&cache_params.database_path, cache_params.max_ttl)?);
    tracing::info!(
        path = %cache_params.database_path,
        max_ttl = cache_params.max_ttl,
        "corridor cache ready"
    );

    let timeout_params = TimeoutParams::from_config(&config);
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_params.request_seconds.max(1)))
        .pool_max_idle_per_host(config.get_usize("http.pool_max_idle_per_host", 32))
        .tcp_keepalive(Duration::from_secs(30))
        .tcp_nodelay(true)
        .build()?;

    let state = AppState {
        config: config.clone(),
        cache: cache.clone(),
        http: http.clone(),
    };

    // Periodic catalog refresher.
    let refresh_secs = config.get_i64("catalog.refresh_seconds", 300).max(30) as u64;
    {
        let cache = cache.clone();
        let http = http.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(refresh_secs));
            loop {
                ticker.tick().await;
                refresh_catalogs(&cache, &http).await;
            }
        });
    }

    // Daily cache retirement.
    let cleanup_days = cache_params.cleanup_days;
    {
        let cache = cache.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(86_400));
            loop {
                ticker.tick().await;
                let now = chrono::Utc::now().timestamp();
                match cache.cleanup_old_entries(cleanup_days, now) {
                    Ok(removed) if removed > 0 => {
                        tracing::info!(removed, "retired stale corridor entries")
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "cache cleanup failed"),
                }
            }
        });
    }

    let app = build_router(state);
    let addr = SocketAddr::from((cli.host.parse::<std::net::IpAddr>()?, cli.port));
    tracing::info!("corridor-gate listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

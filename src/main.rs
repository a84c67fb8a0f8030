use antigravity_proxy::pool::{FileTokenStore, GoogleOAuthIssuer, SystemClock};
use antigravity_proxy::{build_router, AppState, ProxyConfig, SharedLogger};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "antigravity-proxy",
    about = "OpenAI and Anthropic compatible gateway in front of a pool of Cloud Code accounts",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Accounts file (overrides config)
    #[arg(long)]
    accounts: Option<PathBuf>,

    /// Log file path
    #[arg(long, default_value = "antigravity-proxy.log")]
    log_file: PathBuf,

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
                .unwrap_or_else(|_| "antigravity_proxy=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if cli.show_config_paths {
        println!("Config search paths:");
        for (i, path) in antigravity_proxy::config::config_search_paths()
            .iter()
            .enumerate()
        {
            println!("  {}. {}", i + 1, path.display());
        }
        return Ok(());
    }

    let mut config = ProxyConfig::find_and_load(cli.config.as_deref())?;

    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(accounts) = cli.accounts {
        config.pool.accounts_file = Some(accounts);
    }

    let logger = SharedLogger::new(&cli.log_file)?;

    let api_key = config.resolve_inbound_key()?;
    let client_secret = match config.resolve_client_secret() {
        Ok(secret) => secret,
        Err(e) => {
            warn!("{}", e);
            String::new()
        }
    };

    let accounts_path = config.accounts_path();
    let store = Arc::new(FileTokenStore::new(&accounts_path));

    let http = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(config.upstream.timeout_secs))
        .build()?;
    let issuer = Arc::new(GoogleOAuthIssuer::new(
        http.clone(),
        config.oauth.client_id.clone(),
        client_secret,
        config.oauth.token_url.clone(),
        Arc::new(SystemClock),
    ));

    let state = Arc::new(AppState::from_config(
        &config,
        http,
        store,
        issuer,
        logger.clone(),
        api_key.clone(),
    ));
    let accounts = state.gateway.orchestrator().pool_size().await?;

    info!("antigravity-proxy v{}", env!("CARGO_PKG_VERSION"));
    info!("  Accounts:  {} ({})", accounts, accounts_path.display());
    info!("  Upstream:  {}", config.upstream.endpoints.join(", "));
    info!("  Port:      {}", config.port);
    info!("  Auth:      {}", if api_key.is_some() { "api key" } else { "open" });
    info!("  Log file:  {}", cli.log_file.display());
    if accounts == 0 {
        warn!("No accounts configured; every request will fail with 401");
    }

    logger.info(
        "startup",
        format!(
            "Starting antigravity-proxy port={} accounts={}",
            config.port, accounts
        ),
    );

    let app = build_router(state);
    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}", bind_addr);
    info!("  OpenAI:    http://localhost:{}/v1/chat/completions", config.port);
    info!("  Anthropic: http://localhost:{}/v1/messages", config.port);

    axum::serve(listener, app).await?;

    Ok(())
}

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::Router;
use clap::Parser;
use joda_session::{RpcWallet, SessionConfig, SessionSync, WalletProvider, WalletWatcher};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

mod routes;
mod state;

use state::AppState;

#[derive(Debug, Parser)]
#[command(name = "joda-server")]
#[command(about = "JODA token sale and staking session backend")]
struct Cli {
    /// JSON config file (camelCase keys); missing fields use BSC testnet defaults.
    #[arg(long, env = "JODA_CONFIG")]
    config: Option<PathBuf>,

    /// Public JSON-RPC URL for reads while no wallet is connected.
    #[arg(long, env = "RPC_URL")]
    rpc_url: Option<String>,

    /// EIP-1193 JSON-RPC endpoint of the signing wallet.
    #[arg(long, env = "WALLET_URL")]
    wallet_url: Option<String>,

    /// Directory containing JODA.json, JODASale.json and JODAStaking.json.
    #[arg(long)]
    abi_dir: Option<PathBuf>,

    /// Port to listen on.
    #[arg(long, default_value = "3000")]
    port: u16,

    /// Directory containing the built UI static files.
    #[arg(long, default_value = "/app/ui")]
    ui_dir: PathBuf,

    /// Public page URL that referral links are built from.
    #[arg(long, default_value = "http://localhost:3000/")]
    site_url: String,

    /// How often to poll the wallet for account and chain changes.
    #[arg(long, default_value = "2000")]
    wallet_poll_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "joda_server=info,joda_session=info,tower_http=info".into()
            }),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => SessionConfig::from_file(path)?,
        None => SessionConfig::default(),
    };
    if let Some(url) = cli.rpc_url.clone() {
        config.rpc_endpoint = url;
    }
    if let Some(dir) = cli.abi_dir.clone() {
        config.abi_dir = dir;
    }

    tracing::info!(
        rpc = %config.rpc_endpoint,
        chain_id = config.chain_id,
        abi_dir = %config.abi_dir.display(),
        "starting joda-server"
    );

    let wallet: Option<Arc<dyn WalletProvider>> = cli.wallet_url.as_ref().map(|url| {
        tracing::info!(wallet_url = %url, "wallet endpoint configured");
        Arc::new(RpcWallet::new(url.clone())) as Arc<dyn WalletProvider>
    });
    if wallet.is_none() {
        tracing::info!("no wallet endpoint, running read-only");
    }

    let session =
        SessionSync::initialize(config, wallet.clone()).context("failed to initialize session")?;

    // Wallet notifications are applied one at a time by the session's pump.
    if let Some(wallet) = wallet {
        let (tx, rx) = mpsc::channel(16);
        WalletWatcher::spawn(wallet, Duration::from_millis(cli.wallet_poll_ms), tx);
        session.spawn_event_pump(rx);
    }

    tokio::spawn({
        let session = session.clone();
        async move {
            session.refresh().await;
        }
    });
    session.start_refresh_loop();

    let state = Arc::new(AppState {
        session: session.clone(),
        ui_dir: cli.ui_dir,
        site_url: cli.site_url,
    });

    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    tracing::info!(%addr, "server listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await
        .context("server error")?;

    session.shutdown();
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    let api = routes::api_router(state.clone());

    let mut app = Router::new()
        .nest("/api", api)
        .merge(routes::ws::router().with_state(state.clone()));

    if state.ui_dir.is_dir() {
        let serve_dir = tower_http::services::ServeDir::new(&state.ui_dir).fallback(
            tower_http::services::ServeFile::new(state.ui_dir.join("index.html")),
        );
        app = app.fallback_service(serve_dir);
    }

    // The UI may be served from another origin during development.
    app.layer(CorsLayer::very_permissive())
}

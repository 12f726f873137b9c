use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use medlink_gateway::{router, security, AppState, GatewayConfig, StoreConfig};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CLEANUP_INTERVAL_SECS: u64 = 30;

#[derive(Parser, Debug)]
#[command(name = "medlink-gateway")]
#[command(about = "medlink gateway - signaling relay and notification streams for consultation calls")]
struct Args {
    /// HTTP listen address
    #[arg(long, env = "MEDLINK_GATEWAY_BIND_ADDR", default_value = "127.0.0.1:3000")]
    bind: SocketAddr,

    /// Seconds a signaling record survives after its last write
    #[arg(long, env = "MEDLINK_SIGNAL_TTL_SECS", default_value_t = 300)]
    signal_ttl_secs: u64,

    /// Maximum concurrent signaling records
    #[arg(long, env = "MEDLINK_SIGNAL_SESSION_LIMIT", default_value_t = 4096)]
    session_limit: usize,

    /// Seconds an initiated call is remembered if nobody ends it
    #[arg(long, env = "MEDLINK_CALL_TTL_SECS", default_value_t = 4 * 60 * 60)]
    call_ttl_secs: u64,

    /// Maximum concurrently announced calls
    #[arg(long, env = "MEDLINK_CALL_LIMIT", default_value_t = 4096)]
    call_limit: usize,

    /// Requests allowed per client, route and window
    #[arg(long, env = "MEDLINK_SIGNAL_RATE_LIMIT", default_value_t = 1200)]
    rate_limit: u32,

    /// Rate limit window in seconds
    #[arg(long, env = "MEDLINK_SIGNAL_RATE_WINDOW_SECS", default_value_t = 60)]
    rate_window_secs: u64,

    /// Seconds between keep-alive pings on notification streams
    #[arg(long, env = "MEDLINK_NOTIFY_PING_SECS", default_value_t = 30)]
    ping_secs: u64,

    /// Accept cross-origin requests from any origin
    #[arg(long, env = "MEDLINK_CORS_ALLOW_ANY", default_value_t = false)]
    cors_allow_any: bool,

    /// Comma separated list of allowed browser origins
    #[arg(long, env = "MEDLINK_ALLOWED_ORIGINS", default_value = "")]
    allowed_origins: String,
}

impl Args {
    fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            store: StoreConfig::new(
                Duration::from_secs(self.signal_ttl_secs),
                self.session_limit,
            ),
            call_ttl: Duration::from_secs(self.call_ttl_secs.max(60)),
            max_calls: self.call_limit.max(1),
            ping_interval: Duration::from_secs(self.ping_secs.max(1)),
            rate_limit: self.rate_limit,
            rate_window: Duration::from_secs(self.rate_window_secs.max(1)),
            cors_allow_any: self.cors_allow_any,
            allowed_origins: self.allowed_origins.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "medlink_gateway=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = args.gateway_config();
    security::check_public_bind_allowed(args.bind)?;

    let state = AppState::new(&config);
    let cleanup = state.spawn_cleanup(Duration::from_secs(CLEANUP_INTERVAL_SECS));
    tracing::info!(
        "signaling records expire after {}s idle, limit {}; calls forgotten after {}s",
        config.store.ttl.as_secs(),
        config.store.max_sessions,
        config.call_ttl.as_secs()
    );

    let app = router(state, &config);

    let listener = match TcpListener::bind(args.bind).await {
        Ok(listener) => listener,
        Err(err) if err.kind() == ErrorKind::AddrInUse => {
            let fallback_addr = SocketAddr::new(args.bind.ip(), 0);
            tracing::warn!(
                "gateway bind {} is already in use, falling back to {}",
                args.bind,
                fallback_addr
            );
            TcpListener::bind(fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };
    tracing::info!("gateway listening on {}", listener.local_addr()?);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown requested");
    })
    .await?;

    cleanup.abort();
    Ok(())
}

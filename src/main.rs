use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

use inline_collector::authority::{JsonDirStore, SessionAuthority};
use inline_collector::core::config::load_collector_config;
use inline_collector::{rpc, AppState};

fn parse_port_from_args() -> Option<u16> {
    let mut args = std::env::args().peekable();
    while let Some(a) = args.next() {
        if a == "--port" {
            if let Some(v) = args.next() {
                if let Ok(p) = v.parse::<u16>() {
                    return Some(p);
                }
            }
        } else if let Some(rest) = a.strip_prefix("--port=") {
            if let Ok(p) = rest.parse::<u16>() {
                return Some(p);
            }
        }
    }
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,tower_http=warn"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = Arc::new(load_collector_config());

    let store_dir = config.authority.resolve_store_dir();
    let store = JsonDirStore::open(&store_dir)?;
    info!("Session store at {}", store_dir.display());

    let ttl = config.authority.resolve_session_ttl();
    let authority = Arc::new(SessionAuthority::open(Arc::new(store), ttl).await?);
    info!(
        "Session authority ready: {} session(s) restored, ttl {}",
        authority.session_count().await,
        ttl.map(|t| format!("{}s", t.as_secs()))
            .unwrap_or_else(|| "disabled".into())
    );

    if ttl.is_some() {
        let sweeper = Arc::clone(&authority);
        let every = config.authority.resolve_sweep_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                match sweeper.evict_stale(Utc::now()).await {
                    Ok(0) => {}
                    Ok(n) => info!("Evicted {} stale session(s)", n),
                    Err(e) => warn!("Session sweep failed: {}", e),
                }
            }
        });
    }

    let state = Arc::new(AppState::new(authority).with_config(Arc::clone(&config)));
    let app = rpc::router(state);

    let port = parse_port_from_args().unwrap_or_else(|| config.authority.resolve_port());
    let bind_addr = format!("127.0.0.1:{}", port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(l) => l,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            anyhow::bail!(
                "Address already in use: {}. Stop the existing authority or run with --port {} (or set INLINE_COLLECTOR_PORT).",
                bind_addr,
                port.saturating_add(1)
            )
        }
        Err(e) => return Err(e.into()),
    };
    info!("Session authority listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Session authority stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).ok();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                if let Some(ref mut s) = sigterm {
                    s.recv().await;
                } else {
                    futures::future::pending::<()>().await;
                }
            } => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

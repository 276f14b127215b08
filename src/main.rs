use std::sync::Arc;

use anyhow::Context;
use game_node_agent::{
    api, config,
    session::MemorySessionStore,
    state::AppState,
    store::Store,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::load_config(&config::config_path()).await?;

    std::fs::create_dir_all(&cfg.log_directory).with_context(|| {
        format!("creating log directory {}", cfg.log_directory.display())
    })?;
    let file_appender = tracing_appender::rolling::daily(&cfg.log_directory, "agent.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    tokio::fs::create_dir_all(&cfg.servers_root)
        .await
        .with_context(|| format!("creating servers root {}", cfg.servers_root.display()))?;
    let store = Store::open(&cfg.database_path)
        .with_context(|| format!("opening database {}", cfg.database_path.display()))?;

    let sessions = Arc::new(MemorySessionStore::new(cfg.session_cookie.clone()));
    for session in &cfg.static_sessions {
        sessions.insert(session.clone());
    }

    let bind_address = cfg.bind_address.clone();
    let state = AppState::new(cfg, store, sessions);

    // Interrupted installs and servers left behind by a previous run
    state.recover()?;
    let dispatcher = state.bus.clone().spawn();

    let app = api::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!("Listening on {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down servers...");
    state.lifecycle.stop_all().await;
    dispatcher.abort();

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
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
}

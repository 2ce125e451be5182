use anyhow::Context;
use clap::Parser;
use llm_relay::config;
use llm_relay::server::{self, AppState};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, value_name = "file", default_value = "config.yaml")]
    config: PathBuf,

    /// Override the listen address from the configuration
    #[arg(short, long)]
    listen: Option<String>,

    /// Seconds between configuration file polls
    #[arg(long, default_value_t = 5)]
    reload_interval: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut runtime_config = config::load_file(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;
    if let Some(listen) = args.listen {
        runtime_config.listen = listen;
    }
    let listen = runtime_config.listen.clone();

    let state = AppState::new(runtime_config)?;
    let _background = server::spawn_background_tasks(&state);
    let _reload = config::spawn_reload_task(
        Arc::clone(&state.store),
        args.config.clone(),
        Duration::from_secs(args.reload_interval.max(1)),
        state.shutdown.clone(),
    );

    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    tracing::info!(%listen, "llm-relay listening");

    let app = server::router(Arc::clone(&state));
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(state.shutdown.clone()))
        .await
        .context("server error")?;

    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let terminate = async {
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("install SIGTERM handler");
            sigterm.recv().await;
        }
        #[cfg(not(unix))]
        std::future::pending::<()>().await;
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
    cancel.cancel();
}

use std::path::PathBuf;
use std::sync::Arc;
use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use uplift::config::{default_config_dir, Config};
use uplift::server::{router, AppState};
use uplift::{Dispatcher, HttpUploader, StoreRegistry, TaskQueue};

#[derive(Parser, Debug)]
#[command(name = "uplift", version, about = "Persistent, throttled upload dispatcher")]
struct Cli {
    /// 配置目录，读取其中的 config.toml
    #[arg(long, env = "UPLIFT_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    uplift::telemetry::init_tracing();

    let cli = Cli::parse();
    let config_dir = cli.config.unwrap_or_else(default_config_dir);
    let config = Config::load(&config_dir).context("failed to load config")?;

    let location = config.store_location().context("invalid store url")?;
    let queue = TaskQueue::open(&StoreRegistry::with_defaults(), &location)
        .await
        .with_context(|| format!("failed to open task store {}", config.store.url))?;

    let uploader = HttpUploader::new(config.uploader_config()).context("invalid uploader config")?;
    let dispatcher = Dispatcher::new(queue.clone(), Arc::new(uploader), config.dispatcher_config())
        .with_retry_policy(config.retry_policy());

    let state = AppState {
        queue: queue.clone(),
        dispatcher: dispatcher.handle(),
    };

    let shutdown = CancellationToken::new();
    let worker = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { dispatcher.run(shutdown).await }
    });

    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(addr = %addr, store = %location.url, "Listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move {
                shutdown_signal().await;
                tracing::info!("Shutting down");
                shutdown.cancel();
            }
        })
        .await
        .context("server error")?;

    shutdown.cancel();
    if let Err(err) = worker.await {
        tracing::error!(error = %err, "Dispatcher task panicked");
    }
    queue.close().await.context("failed to close task store")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = listen_or_pending(tokio::signal::ctrl_c(), "ctrl-c");

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// 监听失败时永远不完成
async fn listen_or_pending<E: std::fmt::Display>(listener: impl Future<Output = Result<(), E>>, name: &str) {
    if let Err(err) = listener.await {
        tracing::error!(error = %err, signal = name, "Failed to listen for signal");
        std::future::pending::<()>().await;
    }
}

use std::sync::Arc;

use anvil_agent::{backend, config::AgentConfig, error::format_error_chain, monitor, RuntimeManager};
use anyhow::Context;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const LOG_FILE: &str = "anvil-agent.log";

fn init_logging(cfg: &AgentConfig) -> anyhow::Result<WorkerGuard> {
    let dir = cfg.data_root.join("logs");
    std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    let (file, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(&dir, LOG_FILE));

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(fmt::layer().with_ansi(false).with_writer(file))
        .init();
    Ok(guard)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let term = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let term = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = term => {}
    }
}

async fn run(cfg: AgentConfig) -> anyhow::Result<()> {
    tracing::info!(
        backend = %cfg.backend.as_str(),
        data_root = %cfg.data_root.display(),
        ports = %format!("{}..={}", cfg.port_range.start, cfg.port_range.end),
        version = env!("CARGO_PKG_VERSION"),
        "anvil-agent starting"
    );

    tokio::fs::create_dir_all(cfg.instances_dir())
        .await
        .with_context(|| format!("create {}", cfg.instances_dir().display()))?;
    let backend = backend::from_config(&cfg)
        .await
        .context("initialise execution backend")?;
    let manager = Arc::new(RuntimeManager::new(cfg, backend));

    match manager.list(false).await {
        Ok(rows) => tracing::info!(instances = rows.len(), "fleet loaded"),
        Err(e) => tracing::warn!(kind = e.kind.as_str(), error = %e, "initial listing failed"),
    }

    let monitors = monitor::spawn_monitors(manager.clone());
    shutdown_signal().await;
    tracing::info!("shutdown requested");
    monitors.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AgentConfig::from_env();
    let _log_guard = init_logging(&cfg)?;

    if let Err(e) = run(cfg).await {
        tracing::error!(error = %format_error_chain(&e), "anvil-agent exited with error");
        return Err(e);
    }
    Ok(())
}

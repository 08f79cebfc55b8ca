use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use tokio::sync::watch;

use crate::shadowlink::{
    config::{self, Mode},
    logging, tunnel,
};

pub async fn run(config_path: Option<PathBuf>, verbose: bool) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging, verbose || cfg.verbose)?;
    let _logrt_guard = logrt; // keep alive

    for w in cfg.warnings() {
        tracing::warn!(warning = %w, "config: suspicious setting");
    }

    tracing::info!(
        config = %resolved.path.display(),
        source = %resolved.source,
        mode = ?cfg.mode,
        profile = ?cfg.profile,
        transport = %cfg.transport.kind,
        algorithm = cfg.algorithm.as_str(),
        obfuscation = cfg.obfuscation.enabled,
        "shadowlink: starting"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let cfg = Arc::new(cfg);
    let res = match cfg.mode {
        Mode::Server => tunnel::start_server(cfg, shutdown_rx).await,
        Mode::Client => tunnel::start_client(cfg, shutdown_rx).await,
    };
    match &res {
        Ok(()) => tracing::info!("shadowlink: stopped"),
        Err(err) => tracing::error!(err = %format!("{err:#}"), "shadowlink: stopped with error"),
    }
    res
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("shutdown: ctrl-c"),
                    _ = term.recv() => tracing::info!("shutdown: sigterm"),
                }
                return;
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: cannot listen for SIGTERM");
            }
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("shutdown: ctrl-c"),
        Err(err) => {
            tracing::warn!(err = %err, "shutdown: cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    }
}

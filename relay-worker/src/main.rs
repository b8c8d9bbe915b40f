// Split-relay worker: one listening port, CONNECT tunnels through a rotating
// proxy pool, optional supervisor link on stdout.

mod config;
mod engine;
mod events;
mod health;
mod relay;
mod supervisor;
mod timer;

#[cfg(test)]
mod testutil;

use std::io;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::engine::WorkerEngine;
use crate::supervisor::SupervisorLink;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> Result<()> {
    let mut config_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("relay-worker {}", VERSION);
                return Ok(());
            }
            "--config" | "-c" => match args.next() {
                Some(p) => config_path = Some(PathBuf::from(p)),
                None => bail!("--config needs a path"),
            },
            other => bail!("unknown argument {other}"),
        }
    }

    let settings = config::load(config_path.as_deref())?;
    init_tracing(&settings.config.logging);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building runtime")?;
    rt.block_on(run(settings))
}

/// Logs go to stderr; stdout is reserved for supervisor frames.
fn init_tracing(logging: &relay_core::config::LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));
    let json = logging.json.then(|| fmt::layer().json().with_writer(io::stderr));
    let plain = (!logging.json).then(|| fmt::layer().compact().with_writer(io::stderr));
    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(plain)
        .init();
}

async fn run(settings: config::WorkerSettings) -> Result<()> {
    let worker_id = settings.worker_id;
    let (link, writer) = if settings.supervised {
        let (link, writer) = SupervisorLink::stdout(worker_id);
        (link, Some(writer))
    } else {
        (SupervisorLink::disabled(worker_id), None)
    };

    let mut engine = WorkerEngine::new(settings.config, worker_id, link.clone())?;
    let listener = match engine.bind().await {
        Ok(l) => l,
        Err(e) => {
            link.error(format!("{e:#}"));
            return Err(e);
        }
    };
    engine.start(listener)?;

    shutdown_signal().await?;
    info!(worker = worker_id, "shutting down");
    engine.stop().await;

    // Every sender must be gone before the writer can drain and finish.
    drop(engine);
    drop(link);
    if let Some(writer) = writer {
        if let Err(e) = writer.await {
            warn!(error = %e, "supervisor writer ended abnormally");
        }
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r.context("waiting for Ctrl+C")?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("waiting for Ctrl+C")?;
    }
    Ok(())
}

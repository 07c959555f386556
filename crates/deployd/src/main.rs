//! deployd - deploy trigger and CI status reconciliation daemon
//!
//! Main entry point for the daemon binary.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use std::path::PathBuf;

use clap::Parser;
use deploy_core::Config;
use deployd::Daemon;
use eyre::WrapErr;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "deployd", about = "Deploy trigger and CI status daemon", version)]
struct Cli {
    /// Optional key=value config file (DEPLOYD_* variables take precedence)
    #[arg(short, long, env = "DEPLOYD_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on (overrides listen_addr)
    #[arg(short, long)]
    listen: Option<String>,

    /// SQLite database path (overrides db_path)
    #[arg(long)]
    db_path: Option<PathBuf>,
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = Config::load(cli.config.as_deref()).wrap_err("failed to load config")?;
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    if let Some(db_path) = cli.db_path {
        config.db_path = Some(db_path);
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    runtime.block_on(async {
        let daemon = Daemon::new(config).await?;

        let run = daemon.run();
        tokio::pin!(run);

        tokio::select! {
            result = &mut run => return result,
            signal = shutdown_signal() => {
                signal?;
                daemon.shutdown();
            }
        }

        // Let in-flight requests drain.
        run.await
    })
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() -> eyre::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).wrap_err("failed to register SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.wrap_err("failed to listen for SIGINT")?;
                info!("received SIGINT, initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, initiating graceful shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .wrap_err("failed to listen for SIGINT")?;
        info!("received SIGINT, initiating graceful shutdown");
    }

    Ok(())
}

//! Deceive: appear offline to your friends while playing Riot games.
//!
//! Works as a local man-in-the-middle on the chat connection. The game
//! client is relaunched with its bootstrap config fetch redirected to a
//! loopback HTTP proxy, which rewrites the chat endpoint to a loopback TLS
//! listener; that listener splices each connection to the real chat server
//! and rewrites presence stanzas in flight. No game files are touched.

mod cert;
mod launcher;
mod proxy;
mod settings;

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};

use launcher::GameProduct;
use proxy::rewriter::PresenceMode;
use proxy::Supervisor;

#[derive(Parser)]
#[command(name = "deceive", version, about = "Appear offline to your friends while playing Riot games")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Also log to stderr (the log file is always written)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Stop any running Riot client and relaunch it through Deceive
    Launch(LaunchArgs),
}

#[derive(Args)]
struct LaunchArgs {
    /// Game to launch
    #[arg(value_enum)]
    game: Option<GameProduct>,

    /// Initial appearance (offline, mobile or online)
    #[arg(long)]
    status: Option<String>,

    /// Keep running in the tray after launch
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    tray: bool,

    /// Patchline to launch the game on
    #[arg(long, default_value = "live")]
    patchline: String,
}

impl Default for LaunchArgs {
    fn default() -> Self {
        Self {
            game: None,
            status: None,
            tray: true,
            patchline: "live".to_string(),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let Command::Launch(args) = cli
        .command
        .unwrap_or_else(|| Command::Launch(LaunchArgs::default()));

    if let Err(e) = run(args).await {
        error!(error = %e, "startup failed");
        eprintln!("deceive: {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: LaunchArgs) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        git = env!("GIT_HASH"),
        "starting Deceive"
    );

    let settings = settings::load_settings();

    // Unknown status strings are an error, never a silent fallback.
    let status = args
        .status
        .as_deref()
        .unwrap_or(&settings.default_status);
    let mode = PresenceMode::from_str(status)
        .map_err(anyhow::Error::msg)
        .context("invalid --status value")?;

    // Everything that can fail fatally happens before the client launches.
    let client = launcher::find_client()?;
    let cert_pair = cert::load_or_generate(&settings::config_dir())?;
    let acceptor = cert::tls_acceptor(&cert_pair)?;

    let supervisor = Arc::new(Supervisor::new(mode, settings.connect_to_muc));
    let chat_port = proxy::start_chat_listener(supervisor.clone(), acceptor)
        .await
        .map_err(anyhow::Error::msg)?;
    let config_port = proxy::start_config_listener(supervisor.clone(), chat_port)
        .await
        .map_err(anyhow::Error::msg)?;

    let game = match args.game.unwrap_or(GameProduct::Prompt) {
        GameProduct::Prompt => launcher::resolve_prompt(&settings.default_game),
        game => game,
    };

    launcher::stop_running_clients();
    launcher::launch_client(&client, game, &args.patchline, config_port)?;

    if !args.tray {
        info!("tray integration disabled, staying attached to this terminal");
    }

    info!(
        appearing = %supervisor.current_mode().await,
        "Deceive is running; chat with the \"Deceive Active!\" contact to change settings, Ctrl-C to quit"
    );

    let mut shutdown = supervisor.subscribe_shutdown();
    tokio::select! {
        _ = wait_for_signal() => info!("signal received, shutting down"),
        _ = shutdown.recv() => info!("shutting down"),
    }
    supervisor.stop().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Always write a daily-rotating log file for bug reports; add stderr when
/// `--verbose` is passed or `RUST_LOG` is set.
fn init_logging(verbose: bool) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("deceive")
        .join("logs");
    if let Err(e) = std::fs::create_dir_all(&log_dir) {
        eprintln!("deceive: could not create log directory {}: {e}", log_dir.display());
    }

    let file_filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("deceive=info")
    };
    let file_appender = tracing_appender::rolling::daily(&log_dir, "deceive.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(file_filter);

    let stderr_layer = if verbose || std::env::var("RUST_LOG").is_ok() {
        let stderr_filter = if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            EnvFilter::new("deceive=debug")
        };
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(stderr_filter),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .init();

    // The guard flushes the background writer on drop; it must live for the
    // whole process.
    std::mem::forget(guard);
}

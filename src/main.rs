// Skipwatch - Spotify skip tracker
// Polls your playback, infers skips the API never reports, and serves the
// analytics the dashboard feeds on

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use skipwatch::config::Config;
use skipwatch::ledger::SkipLedger;
use skipwatch::monitor::Monitor;
use skipwatch::server::{self, AppState};
use skipwatch::spotify::{Session, SpotifyClient};

#[derive(Parser)]
#[command(name = "skipwatch")]
#[command(about = "Spotify skip tracker - polls your playback and records what you skip")]
struct Args {
    /// Enable developer logging (stderr + debug output)
    #[arg(long)]
    dev: bool,
}

fn init_logging(dev: bool) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    // Logs live next to the binary; daily rotation keeps them bounded
    let log_dir = PathBuf::from("logs");
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "skipwatch.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Base filter: info level for general logs, debug for skipwatch
    let base_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,skipwatch=debug"));

    if dev {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_level(true)
            .with_env_filter(base_filter)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(file_writer)
            .with_target(true)
            .with_level(true)
            .with_ansi(false)
            .with_env_filter(base_filter)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    // The guard keeps the non-blocking writer alive for the process lifetime
    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = init_logging(args.dev)?;

    // Load config - falls back to defaults if missing
    let config = Config::load()?;
    let credentials = config.spotify.credentials()?;

    let session = Arc::new(Session::new(credentials));
    let spotify = SpotifyClient::new(session.clone());
    let ledger = Arc::new(SkipLedger::new(&config.database_path)?);
    let monitor = Arc::new(Monitor::new(
        spotify.clone(),
        session.clone(),
        ledger.clone(),
        config.monitor.clone(),
    ));

    info!(
        "visit http://{}:{}/auth/login to connect Spotify",
        config.server.bind_address, config.server.port
    );

    let state = AppState {
        session,
        spotify,
        ledger,
        monitor,
    };
    server::serve(state, &config.server).await
}

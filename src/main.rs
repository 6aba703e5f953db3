//! webpty - serve a terminal to the browser.
//!
//! Each browser tab gets its own pseudo-terminal running the configured
//! command. Open `http://127.0.0.1:5000/` after starting the server.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser as ClapParser;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use webpty::{
    api,
    config::{ConfigError, Settings},
    session::SessionRegistry,
    shutdown::ShutdownCoordinator,
};

/// How long open connections get to flush their close frames.
const CLOSE_FRAME_GRACE: Duration = Duration::from_secs(1);

/// webpty - a terminal in your browser
///
/// Serves a web page with a terminal emulator. Every page load spawns the
/// configured command on a new pseudo-terminal.
#[derive(ClapParser, Debug)]
#[command(name = "webpty", version, about, long_about = None)]
struct Cli {
    /// Config file (default: ~/.config/webpty/config.toml when present)
    #[arg(long, env = "WEBPTY_CONFIG")]
    config: Option<PathBuf>,

    /// Host to serve on
    #[arg(long)]
    host: Option<String>,

    /// Port to serve on
    #[arg(short, long)]
    port: Option<u16>,

    /// Command to run in the terminal (default: $SHELL)
    #[arg(long)]
    command: Option<String>,

    /// Working directory for the command
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Initial terminal rows
    #[arg(long)]
    rows: Option<u16>,

    /// Initial terminal columns
    #[arg(long)]
    cols: Option<u16>,

    /// Milliseconds between terminal output polls
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Maximum bytes read from the terminal per poll
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Maximum number of concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Allow cross-origin requests from this origin (repeatable)
    #[arg(long = "cors-origin")]
    cors_origins: Vec<String>,

    /// Debug logging
    #[arg(long)]
    debug: bool,

    /// Arguments passed to the command
    #[arg(last = true)]
    args: Vec<String>,
}

impl Cli {
    fn apply(self, settings: &mut Settings) {
        if let Some(host) = self.host {
            settings.server.host = host;
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(max) = self.max_sessions {
            settings.server.max_sessions = max;
        }
        if !self.cors_origins.is_empty() {
            settings.server.cors_origins = self.cors_origins;
        }
        if let Some(command) = self.command {
            settings.terminal.command = Some(command);
            // Arguments from the file belong to the file's command.
            settings.terminal.args.clear();
        }
        if !self.args.is_empty() {
            settings.terminal.args = self.args;
        }
        if let Some(cwd) = self.cwd {
            settings.terminal.cwd = Some(cwd);
        }
        if let Some(rows) = self.rows {
            settings.terminal.rows = rows;
        }
        if let Some(cols) = self.cols {
            settings.terminal.cols = cols;
        }
        if let Some(ms) = self.poll_interval_ms {
            settings.pump.poll_interval_ms = ms;
        }
        if let Some(size) = self.chunk_size {
            settings.pump.chunk_size = size;
        }
    }
}

#[derive(Error, Debug)]
pub enum WebptyError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), WebptyError> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let mut settings = Settings::resolve(cli.config.as_deref())?;
    cli.apply(&mut settings);
    settings.validate()?;

    run_server(settings).await
}

fn init_tracing(debug: bool) {
    let default_filter = if debug {
        "webpty=debug,tower_http=debug"
    } else {
        "webpty=info,tower_http=info"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run_server(settings: Settings) -> Result<(), WebptyError> {
    let max_sessions = match settings.server.max_sessions {
        0 => None,
        n => Some(n),
    };
    let sessions = SessionRegistry::with_max_sessions(settings.session_config(), max_sessions);
    let shutdown = ShutdownCoordinator::new();
    let state = api::AppState {
        sessions: sessions.clone(),
        shutdown: shutdown.clone(),
        channel_capacity: settings.pump.channel_capacity,
    };
    let router_config = api::RouterConfig {
        cors_origins: settings.server.cors_origins.clone(),
    };
    let app = api::router(state, router_config);

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind((settings.server.host.as_str(), settings.server.port))
        .await
        .map_err(|source| WebptyError::Bind {
            addr: addr.clone(),
            source,
        })?;
    tracing::info!(
        addr = %listener.local_addr()?,
        command = %sessions.config().command.display(),
        "serving terminal"
    );

    let (server_shutdown_tx, server_shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                server_shutdown_rx.await.ok();
            })
            .await
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
    } else {
        tracing::info!("received Ctrl+C");
    }

    // Signal WebSocket handlers to send close frames
    shutdown.shutdown();
    if !shutdown.wait_idle(CLOSE_FRAME_GRACE).await {
        tracing::warn!(
            open = shutdown.active_count(),
            "connections still open after close-frame grace period"
        );
    }

    let _ = server_shutdown_tx.send(());
    match http_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "HTTP server error"),
        Err(e) => tracing::warn!(?e, "HTTP server task panicked"),
    }

    sessions.drain().await;
    tracing::info!("webpty exiting");
    Ok(())
}

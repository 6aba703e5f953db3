#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use webpty::api::{self, AppState, RouterConfig};
use webpty::protocol::ServerMessage;
use webpty::pty::SpawnCommand;
use webpty::pump::PumpConfig;
use webpty::session::{SessionConfig, SessionRegistry};

/// Session config with a fast pump, so tests don't wait on the 10ms default.
pub fn session_config(command: SpawnCommand) -> SessionConfig {
    SessionConfig {
        command,
        rows: 24,
        cols: 80,
        pump: PumpConfig {
            poll_interval: Duration::from_millis(1),
            ..PumpConfig::default()
        },
    }
}

pub fn sh() -> SpawnCommand {
    SpawnCommand::new("/bin/sh")
}

pub fn cat() -> SpawnCommand {
    SpawnCommand::new("cat")
}

pub fn registry(command: SpawnCommand) -> SessionRegistry {
    SessionRegistry::new(session_config(command))
}

/// Receive output until the concatenated text contains `needle`, or panic
/// after `timeout`.
pub async fn wait_for_output(
    rx: &mut mpsc::Receiver<ServerMessage>,
    needle: &str,
    timeout: Duration,
) -> String {
    let mut text = String::new();
    let deadline = tokio::time::Instant::now() + timeout;
    while !text.contains(needle) {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(ServerMessage::Output { output })) => text.push_str(&output),
            Ok(Some(_)) => {}
            Ok(None) => panic!("channel closed before {needle:?} arrived; got {text:?}"),
            Err(_) => panic!("timed out waiting for {needle:?}; got {text:?}"),
        }
    }
    text
}

/// Serve `state` on an ephemeral port.
pub async fn start_server(state: AppState) -> SocketAddr {
    let app = api::router(state, RouterConfig::default());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    addr
}

//! JSON messages exchanged with the browser over a session's WebSocket.
//!
//! Every frame is a JSON object tagged by `event`:
//!
//! ```text
//! client → server   {"event":"pty-input","input":"ls\r"}
//!                   {"event":"resize","rows":40,"cols":120}
//!                   {"event":"disconnect"}
//! server → client   {"event":"pty-output","output":"..."}
//!                   {"event":"exit","code":0}
//!                   {"event":"error","code":"spawn_failed","message":"..."}
//! ```

use serde::{Deserialize, Serialize};

use crate::session::Control;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(rename = "pty-input", alias = "input")]
    Input { input: String },
    Resize { rows: u16, cols: u16 },
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename = "pty-output")]
    Output { output: String },
    /// The child exited; `code` is absent when it could not be collected.
    Exit { code: Option<u32> },
    Error { code: String, message: String },
}

impl ServerMessage {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.to_owned(),
            message: message.into(),
        }
    }
}

impl From<ClientMessage> for Control {
    fn from(msg: ClientMessage) -> Self {
        match msg {
            ClientMessage::Input { input } => Control::Input(input),
            ClientMessage::Resize { rows, cols } => Control::Resize { rows, cols },
            ClientMessage::Disconnect => Control::Disconnect,
        }
    }
}

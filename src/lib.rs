//! webpty serves interactive pseudo-terminal sessions to a browser.
//!
//! A client creates a session over HTTP, then attaches a WebSocket to it. The
//! first attach spawns the configured command on a fresh pty; terminal output
//! is streamed back as JSON frames and keystrokes and resizes flow the other
//! way. Closing the socket tears the session down and reaps the child.

pub mod api;
pub mod config;
pub mod decoder;
pub mod protocol;
pub mod pty;
pub mod pump;
pub mod session;
pub mod shutdown;

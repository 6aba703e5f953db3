//! The per-session task that moves terminal output onto the session's channel.
//!
//! The pump polls: every `poll_interval` it does a zero-timeout readiness
//! check on the pty and reads at most one chunk. It never parks a thread on a
//! blocking read, and when the outbound channel is full it simply stops
//! reading, which leaves the data in the kernel's pty buffer and throttles
//! the child.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::decoder::Utf8Decoder;
use crate::protocol::ServerMessage;
use crate::pty::{PtyError, PtyHandle, ReadOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PumpConfig {
    /// How long the pump sleeps between readiness checks.
    pub poll_interval: Duration,
    /// Upper bound on the bytes read per iteration (and so per message).
    pub chunk_size: usize,
    /// Consecutive transient read errors tolerated before giving up.
    pub max_transient_errors: u32,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            chunk_size: 20 * 1024,
            max_transient_errors: 8,
        }
    }
}

/// Why a pump stopped.
#[derive(Debug)]
pub enum PumpExit {
    /// The session asked it to stop.
    Cancelled,
    /// The child exited and all of its output has been forwarded.
    EndOfStream,
    /// Nobody is listening any more.
    ChannelClosed,
    /// An unrecoverable read error.
    Failed(PtyError),
}

/// Where a pump reads from. Implemented by [`PtyHandle`].
pub trait OutputSource: Send + Sync {
    /// Read whatever is available right now without blocking.
    fn read_available(&self, buf: &mut [u8]) -> Result<ReadOutcome, PtyError>;
}

impl OutputSource for PtyHandle {
    fn read_available(&self, buf: &mut [u8]) -> Result<ReadOutcome, PtyError> {
        PtyHandle::read_available(self, buf)
    }
}

pub struct OutputPump<S: OutputSource = PtyHandle> {
    source: Arc<S>,
    channel: mpsc::WeakSender<ServerMessage>,
    config: PumpConfig,
    cancelled: CancellationToken,
    decoder: Utf8Decoder,
}

impl<S: OutputSource> OutputPump<S> {
    /// The pump only holds a weak reference to `channel`: the transport owns
    /// the channel and dropping its sender is how it says goodbye.
    pub fn new(
        source: Arc<S>,
        channel: mpsc::WeakSender<ServerMessage>,
        config: PumpConfig,
        cancelled: CancellationToken,
    ) -> Self {
        Self {
            source,
            channel,
            config,
            cancelled,
            decoder: Utf8Decoder::new(),
        }
    }

    pub async fn run(mut self) -> PumpExit {
        let mut buf = vec![0u8; self.config.chunk_size.max(1)];
        let mut transient_errors = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = self.cancelled.cancelled() => return PumpExit::Cancelled,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            match self.source.read_available(&mut buf) {
                Ok(ReadOutcome::Empty) => transient_errors = 0,
                Ok(ReadOutcome::Data(n)) => {
                    transient_errors = 0;
                    let output = self.decoder.decode(&buf[..n]);
                    if output.is_empty() {
                        // Only part of a multi-byte character so far.
                        continue;
                    }
                    if let Some(exit) = self.emit(ServerMessage::Output { output }).await {
                        return exit;
                    }
                }
                Ok(ReadOutcome::Eof) => {
                    if self.decoder.has_pending() {
                        let output = self.decoder.finish();
                        if let Some(exit) = self.emit(ServerMessage::Output { output }).await {
                            return exit;
                        }
                    }
                    return PumpExit::EndOfStream;
                }
                Err(_) if self.cancelled.is_cancelled() => return PumpExit::Cancelled,
                Err(e) if is_transient(&e) && transient_errors < self.config.max_transient_errors => {
                    transient_errors += 1;
                    tracing::debug!(error = %e, attempt = transient_errors, "transient pty read error");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "pty read failed, stopping output pump");
                    return PumpExit::Failed(e);
                }
            }
        }
    }

    /// Send one message, waiting for channel capacity. Returns `Some` when the
    /// pump has to stop instead.
    async fn emit(&self, message: ServerMessage) -> Option<PumpExit> {
        let Some(tx) = self.channel.upgrade() else {
            return Some(PumpExit::ChannelClosed);
        };
        tokio::select! {
            biased;
            _ = self.cancelled.cancelled() => Some(PumpExit::Cancelled),
            sent = tx.send(message) => match sent {
                Ok(()) => None,
                Err(_) => Some(PumpExit::ChannelClosed),
            },
        }
    }
}

fn is_transient(err: &PtyError) -> bool {
    match err {
        PtyError::Io(e) => !matches!(
            e.raw_os_error(),
            Some(libc::EBADF) | Some(libc::ENXIO) | Some(libc::ENODEV)
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::SpawnCommand;

    fn fast() -> PumpConfig {
        PumpConfig {
            poll_interval: Duration::from_millis(1),
            ..PumpConfig::default()
        }
    }

    fn sh_c(script: &str) -> Arc<PtyHandle> {
        let cmd = SpawnCommand::new("/bin/sh").args(["-c", script]);
        Arc::new(PtyHandle::open(&cmd, 24, 80).expect("failed to open pty"))
    }

    async fn collect_output(rx: &mut mpsc::Receiver<ServerMessage>) -> String {
        let mut text = String::new();
        while let Ok(Some(msg)) =
            tokio::time::timeout(Duration::from_millis(200), rx.recv()).await
        {
            if let ServerMessage::Output { output } = msg {
                text.push_str(&output);
            }
        }
        text
    }

    #[tokio::test]
    async fn forwards_output_in_order_and_reports_end_of_stream() {
        let pty = sh_c("printf A; sleep 0.2; printf B");
        let (tx, mut rx) = mpsc::channel(16);
        let pump = OutputPump::new(pty.clone(), tx.downgrade(), fast(), CancellationToken::new());

        let exit = tokio::time::timeout(Duration::from_secs(5), pump.run())
            .await
            .expect("pump should finish once the child exits");
        assert!(matches!(exit, PumpExit::EndOfStream), "got {exit:?}");

        let text = collect_output(&mut rx).await;
        assert!(text.contains("AB"), "expected \"AB\" in output, got: {text:?}");
        pty.close();
    }

    #[tokio::test]
    async fn chunk_size_bounds_each_message() {
        let pty = sh_c("printf 0123456789abcdefghij");
        let (tx, mut rx) = mpsc::channel(64);
        let config = PumpConfig {
            chunk_size: 4,
            ..fast()
        };
        let pump = OutputPump::new(pty.clone(), tx.downgrade(), config, CancellationToken::new());
        let _ = tokio::time::timeout(Duration::from_secs(5), pump.run()).await;

        let mut text = String::new();
        while let Ok(msg) = rx.try_recv() {
            if let ServerMessage::Output { output } = msg {
                assert!(output.len() <= 4, "message larger than a chunk: {output:?}");
                text.push_str(&output);
            }
        }
        assert!(text.contains("0123456789abcdefghij"), "got: {text:?}");
        pty.close();
    }

    #[tokio::test]
    async fn cancellation_stops_without_emitting() {
        let pty = sh_c("sleep 0.3; echo late");
        let (tx, mut rx) = mpsc::channel(16);
        let cancelled = CancellationToken::new();
        let pump = OutputPump::new(pty.clone(), tx.downgrade(), fast(), cancelled.clone());
        let task = tokio::spawn(pump.run());

        cancelled.cancel();
        let exit = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("pump should stop promptly")
            .unwrap();
        assert!(matches!(exit, PumpExit::Cancelled), "got {exit:?}");

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err(), "no message may follow cancellation");
        pty.close();
    }

    #[tokio::test]
    async fn dropped_channel_stops_the_pump() {
        let pty = sh_c("echo hello; sleep 5");
        let (tx, rx) = mpsc::channel(16);
        let weak = tx.downgrade();
        drop(tx);
        drop(rx);
        let pump = OutputPump::new(pty.clone(), weak, fast(), CancellationToken::new());

        let exit = tokio::time::timeout(Duration::from_secs(5), pump.run())
            .await
            .expect("pump should notice the closed channel");
        assert!(matches!(exit, PumpExit::ChannelClosed), "got {exit:?}");
        pty.close();
    }

    #[tokio::test]
    async fn closed_handle_is_fatal() {
        let pty = sh_c("sleep 5");
        pty.close();
        let (tx, _rx) = mpsc::channel(16);
        let pump = OutputPump::new(pty, tx.downgrade(), fast(), CancellationToken::new());
        let exit = tokio::time::timeout(Duration::from_secs(1), pump.run())
            .await
            .unwrap();
        assert!(matches!(exit, PumpExit::Failed(PtyError::Closed)), "got {exit:?}");
    }

    enum Step {
        Data(&'static [u8]),
        Eof,
        Errno(i32),
    }

    /// Replays a fixed sequence of reads, then reports nothing available.
    struct Scripted(parking_lot::Mutex<std::collections::VecDeque<Step>>);

    impl Scripted {
        fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
            Arc::new(Self(parking_lot::Mutex::new(steps.into_iter().collect())))
        }
    }

    impl OutputSource for Scripted {
        fn read_available(&self, buf: &mut [u8]) -> Result<ReadOutcome, PtyError> {
            match self.0.lock().pop_front() {
                Some(Step::Data(bytes)) => {
                    buf[..bytes.len()].copy_from_slice(bytes);
                    Ok(ReadOutcome::Data(bytes.len()))
                }
                Some(Step::Eof) => Ok(ReadOutcome::Eof),
                Some(Step::Errno(code)) => {
                    Err(PtyError::Io(std::io::Error::from_raw_os_error(code)))
                }
                None => Ok(ReadOutcome::Empty),
            }
        }
    }

    fn budget(max_transient_errors: u32) -> PumpConfig {
        PumpConfig {
            max_transient_errors,
            ..fast()
        }
    }

    #[tokio::test]
    async fn transient_errors_within_budget_are_retried() {
        use Step::*;
        let source = Scripted::new([
            Errno(libc::EINTR),
            Errno(libc::EAGAIN),
            Errno(libc::EINTR),
            Data(b"ok"),
            // A successful read resets the count.
            Errno(libc::EINTR),
            Errno(libc::EINTR),
            Errno(libc::EINTR),
            Data(b"!"),
            Eof,
        ]);
        let (tx, mut rx) = mpsc::channel(16);
        let pump = OutputPump::new(source, tx.downgrade(), budget(3), CancellationToken::new());

        let exit = tokio::time::timeout(Duration::from_secs(5), pump.run())
            .await
            .unwrap();
        assert!(matches!(exit, PumpExit::EndOfStream), "got {exit:?}");
        assert_eq!(collect_output(&mut rx).await, "ok!");
    }

    #[tokio::test]
    async fn transient_errors_beyond_budget_are_fatal() {
        let source = Scripted::new((0..4).map(|_| Step::Errno(libc::EINTR)));
        let (tx, mut rx) = mpsc::channel(16);
        let pump = OutputPump::new(source, tx.downgrade(), budget(3), CancellationToken::new());

        let exit = tokio::time::timeout(Duration::from_secs(5), pump.run())
            .await
            .unwrap();
        match exit {
            PumpExit::Failed(PtyError::Io(e)) => assert_eq!(e.raw_os_error(), Some(libc::EINTR)),
            other => panic!("expected a failed pump, got {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn fatal_error_is_not_retried() {
        let source = Scripted::new([Step::Errno(libc::EBADF), Step::Data(b"never")]);
        let (tx, mut rx) = mpsc::channel(16);
        let pump = OutputPump::new(source, tx.downgrade(), budget(3), CancellationToken::new());

        let exit = tokio::time::timeout(Duration::from_secs(5), pump.run())
            .await
            .unwrap();
        assert!(matches!(exit, PumpExit::Failed(PtyError::Io(_))), "got {exit:?}");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn split_character_is_held_until_complete() {
        // "é" is 0xC3 0xA9.
        let source = Scripted::new([Step::Data(b"caf\xC3"), Step::Data(b"\xA9"), Step::Eof]);
        let (tx, mut rx) = mpsc::channel(16);
        let pump = OutputPump::new(source, tx.downgrade(), fast(), CancellationToken::new());

        let exit = pump.run().await;
        assert!(matches!(exit, PumpExit::EndOfStream), "got {exit:?}");
        let mut messages = Vec::new();
        while let Ok(ServerMessage::Output { output }) = rx.try_recv() {
            messages.push(output);
        }
        assert_eq!(messages, vec!["caf".to_string(), "\u{e9}".to_string()]);
    }

    #[tokio::test]
    async fn truncated_tail_is_flushed_at_end_of_stream() {
        let source = Scripted::new([Step::Data(b"ab\xE2\x82"), Step::Eof]);
        let (tx, mut rx) = mpsc::channel(16);
        let pump = OutputPump::new(source, tx.downgrade(), fast(), CancellationToken::new());

        assert!(matches!(pump.run().await, PumpExit::EndOfStream));
        let mut text = String::new();
        while let Ok(ServerMessage::Output { output }) = rx.try_recv() {
            text.push_str(&output);
        }
        assert!(text.starts_with("ab"), "got {text:?}");
        assert!(text.ends_with('\u{FFFD}'), "got {text:?}");
    }

    #[test]
    fn bad_descriptor_is_not_transient() {
        let ebadf = PtyError::Io(std::io::Error::from_raw_os_error(libc::EBADF));
        let eintr = PtyError::Io(std::io::Error::from_raw_os_error(libc::EINTR));
        assert!(!is_transient(&ebadf));
        assert!(is_transient(&eintr));
        assert!(!is_transient(&PtyError::Closed));
    }
}

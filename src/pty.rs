use portable_pty::{
    native_pty_system, Child, ChildKiller, CommandBuilder, ExitStatus, MasterPty, PtyPair, PtySize,
};
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take writer: {0}")]
    TakeWriter(#[source] anyhow::Error),

    #[error("failed to resize pty: {0}")]
    Resize(#[source] anyhow::Error),

    #[error("pty handle is closed")]
    Closed,

    #[error("pty i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// The program a session runs, fixed at server startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Value exported as `TERM` to the child.
    pub term: String,
}

pub const DEFAULT_TERM: &str = "xterm-256color";

/// `$SHELL`, or `/bin/sh` when unset.
pub fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

impl Default for SpawnCommand {
    fn default() -> Self {
        Self::new(default_shell())
    }
}

impl SpawnCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            term: DEFAULT_TERM.to_string(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Human-readable command line, e.g. `bash -l`.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn build(&self) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.cwd {
            cmd.cwd(dir);
        }
        cmd.env("TERM", &self.term);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

/// Result of a single non-blocking read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// `n` bytes were copied into the buffer.
    Data(usize),
    /// Nothing to read right now. Not end-of-stream.
    Empty,
    /// The child is gone and the slave side is closed; nothing more will arrive.
    Eof,
}

fn pty_size(rows: u16, cols: u16) -> PtySize {
    PtySize {
        rows: rows.max(1),
        cols: cols.max(1),
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// A child process running on the slave side of a freshly allocated pty,
/// and the master side we talk to it through.
///
/// Every part sits behind its own lock so that a write stuck on a full input
/// buffer never stalls the output pump, and so every method can take `&self`
/// and the handle can be shared between a session and its pump.
pub struct PtyHandle {
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    reader: Mutex<Option<Box<dyn Read + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    child: Mutex<Option<Box<dyn Child + Send + Sync>>>,
    pid: Option<u32>,
}

impl std::fmt::Debug for PtyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyHandle")
            .field("pid", &self.pid)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl PtyHandle {
    /// Allocate a pty of `rows` x `cols` and spawn `command` on it.
    pub fn open(command: &SpawnCommand, rows: u16, cols: u16) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();
        let PtyPair { master, slave } = pty_system
            .openpty(pty_size(rows, cols))
            .map_err(PtyError::OpenPty)?;

        let mut child = slave
            .spawn_command(command.build())
            .map_err(|source| PtyError::Spawn {
                command: command.program.clone(),
                source,
            })?;
        // The parent must not keep the slave open, otherwise the master never
        // reports end-of-stream once the child exits.
        drop(slave);

        let pid = child.process_id();
        let wiring = master
            .try_clone_reader()
            .map_err(PtyError::CloneReader)
            .and_then(|reader| {
                let writer = master.take_writer().map_err(PtyError::TakeWriter)?;
                Ok((reader, writer))
            });
        let (reader, writer) = match wiring {
            Ok(parts) => parts,
            Err(e) => {
                drop(master);
                reap(child.as_mut());
                return Err(e);
            }
        };

        tracing::debug!(pid, command = %command.display(), rows, cols, "pty opened");

        Ok(Self {
            master: Mutex::new(Some(master)),
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            child: Mutex::new(Some(child)),
            pid,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn is_open(&self) -> bool {
        self.master.lock().is_some()
    }

    /// Write all of `data` to the terminal's input.
    pub fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or(PtyError::Closed)?;
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    /// Read whatever output is ready, up to `buf.len()` bytes, without blocking.
    pub fn read_available(&self, buf: &mut [u8]) -> Result<ReadOutcome, PtyError> {
        // Holding the master lock keeps the descriptor from being closed (and
        // its number reused) between the poll and the read.
        let master = self.master.lock();
        let fd = master
            .as_ref()
            .and_then(|m| m.as_raw_fd())
            .ok_or(PtyError::Closed)?;

        if !poll_readable(fd)? {
            return Ok(ReadOutcome::Empty);
        }

        let mut guard = self.reader.lock();
        let reader = guard.as_mut().ok_or(PtyError::Closed)?;
        match reader.read(buf) {
            Ok(0) => Ok(ReadOutcome::Eof),
            Ok(n) => Ok(ReadOutcome::Data(n)),
            // Linux reports a hung-up slave as EIO on the master.
            Err(e) if e.raw_os_error() == Some(libc::EIO) => Ok(ReadOutcome::Eof),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(ReadOutcome::Empty),
            Err(e) => Err(PtyError::Io(e)),
        }
    }

    /// Tell the terminal driver about a new window size.
    ///
    /// Rows and columns are clamped to at least 1. Resizing a closed handle
    /// is silently ignored.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        let guard = self.master.lock();
        let Some(master) = guard.as_ref() else {
            tracing::debug!(rows, cols, "resize after close ignored");
            return Ok(());
        };
        master.resize(pty_size(rows, cols)).map_err(PtyError::Resize)
    }

    /// Current `(rows, cols)` as reported by the terminal driver.
    pub fn size(&self) -> Result<(u16, u16), PtyError> {
        let guard = self.master.lock();
        let master = guard.as_ref().ok_or(PtyError::Closed)?;
        let size = master.get_size().map_err(PtyError::Resize)?;
        Ok((size.rows, size.cols))
    }

    /// Release the master side, then terminate and reap the child.
    ///
    /// Blocks until the child has been waited on (bounded by the kill
    /// escalation), so call it from a blocking context. Returns the child's
    /// exit status on the first call and `None` afterwards.
    pub fn close(&self) -> Option<ExitStatus> {
        let child = self.child.lock().take();
        if child.is_some() {
            // The child is not reaped yet, so its pid (and process group)
            // cannot have been recycled.
            signal_process_group(self.pid, libc::SIGHUP);
        }
        {
            let mut master = self.master.lock();
            let mut reader = self.reader.lock();
            drop(reader.take());
            drop(master.take());
        }
        // A write stuck on a full input buffer holds this lock until the
        // child is gone and the write fails with EIO; reaping comes first.
        if let Some(mut writer) = self.writer.try_lock() {
            drop(writer.take());
        }

        let mut child = child?;
        let status = reap(child.as_mut());
        tracing::debug!(pid = self.pid, ?status, "pty closed");
        status
    }
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        self.close();
    }
}

const REAP_GRACE_POLLS: u32 = 10;
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Wait for `child` to exit, escalating to a kill if it lingers.
fn reap(child: &mut (dyn Child + Send + Sync)) -> Option<ExitStatus> {
    for _ in 0..REAP_GRACE_POLLS {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => std::thread::sleep(REAP_POLL_INTERVAL),
            Err(e) => {
                tracing::warn!(error = %e, "try_wait on pty child failed");
                break;
            }
        }
    }
    if let Err(e) = child.kill() {
        tracing::debug!(error = %e, "kill on pty child failed");
    }
    match child.wait() {
        Ok(status) => Some(status),
        Err(e) => {
            tracing::warn!(error = %e, "failed to reap pty child");
            None
        }
    }
}

/// Signal the child's whole process group.
///
/// The pty library calls `setsid()` in the child, so the child leads its own
/// group and anything the shell started is signalled too.
fn signal_process_group(pid: Option<u32>, signal: libc::c_int) {
    let Some(pid) = pid else { return };
    if pid == 0 || pid > i32::MAX as u32 {
        tracing::warn!(pid, "PID is 0 or exceeds i32::MAX, cannot send signal");
        return;
    }
    unsafe {
        libc::kill(-(pid as i32), signal);
    }
}

/// Zero-timeout readiness check on the master descriptor.
fn poll_readable(fd: RawFd) -> Result<bool, PtyError> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
    if rc < 0 {
        return Err(PtyError::Io(std::io::Error::last_os_error()));
    }
    if rc == 0 {
        return Ok(false);
    }
    if pfd.revents & libc::POLLNVAL != 0 {
        return Err(PtyError::Io(std::io::Error::from_raw_os_error(libc::EBADF)));
    }
    // HUP/ERR are "readable": the read that follows reports end-of-stream.
    Ok(pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0)
}

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::protocol::ServerMessage;
use crate::pty::{PtyError, PtyHandle, SpawnCommand};
use crate::pump::{OutputPump, PumpConfig, PumpExit};

/// Identifier handed to clients when a terminal is created.
///
/// Allocated from a per-registry counter starting at 1 and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(SessionId)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Active,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client went away or asked to close.
    Disconnected,
    /// The child exited.
    EndOfStream,
    /// The transport dropped the session's channel.
    ChannelClosed,
    /// Reading from the pty failed for good.
    IoError,
    /// The server is shutting down.
    Shutdown,
}

/// What every session in a registry runs, fixed at startup.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub command: SpawnCommand,
    /// Initial window size.
    pub rows: u16,
    pub cols: u16,
    pub pump: PumpConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command: SpawnCommand::default(),
            rows: 50,
            cols: 50,
            pump: PumpConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("failed to start terminal: {0}")]
    Spawn(#[source] PtyError),
    #[error("session {id} is {state:?}")]
    InvalidState { id: SessionId, state: SessionState },
    #[error("session {0} was closed before its terminal started")]
    Closed(SessionId),
    #[error("session {id} has {pending} bytes of unwritten input; the terminal is not reading")]
    InputOverflow { id: SessionId, pending: usize },
    #[error(transparent)]
    Pty(#[from] PtyError),
}

/// An inbound control message, already addressed to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    Input(String),
    Resize { rows: u16, cols: u16 },
    Disconnect,
}

/// Snapshot of a session for listings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub state: SessionState,
    pub pid: Option<u32>,
    pub command: String,
    pub rows: Option<u16>,
    pub cols: Option<u16>,
}

/// How long the final exit notice may wait for room in a congested channel.
const EXIT_NOTICE_TIMEOUT: Duration = Duration::from_secs(1);

/// Input accepted but not yet written to the terminal, per session. Beyond
/// this, input is refused until the child catches up.
pub const MAX_PENDING_INPUT: usize = 1024 * 1024;

/// Ordered queue of keystrokes in front of a blocking writer thread.
///
/// Writes to a pty block once the child stops reading, so they never happen
/// on the caller's task.
struct InputQueue {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    pending: Arc<AtomicUsize>,
}

impl InputQueue {
    fn spawn(id: SessionId, pty: Arc<PtyHandle>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let pending = Arc::new(AtomicUsize::new(0));
        let written = Arc::clone(&pending);

        tokio::task::spawn_blocking(move || {
            while let Some(data) = rx.blocking_recv() {
                if !pty.is_open() {
                    break;
                }
                let result = pty.write(&data);
                written.fetch_sub(data.len(), Ordering::AcqRel);
                match result {
                    Ok(()) => {}
                    Err(PtyError::Closed) => break,
                    Err(e) => {
                        tracing::debug!(session = %id, error = %e, "terminal input writer stopped");
                        break;
                    }
                }
            }
        });

        Self { tx, pending }
    }

    fn push(&self, id: SessionId, data: &[u8]) -> Result<(), SessionError> {
        let pending = self.pending.fetch_add(data.len(), Ordering::AcqRel);
        if pending > 0 && pending + data.len() > MAX_PENDING_INPUT {
            self.pending.fetch_sub(data.len(), Ordering::AcqRel);
            return Err(SessionError::InputOverflow { id, pending });
        }
        if self.tx.send(data.to_vec()).is_err() {
            self.pending.fetch_sub(data.len(), Ordering::AcqRel);
            return Err(SessionError::Pty(PtyError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "terminal input writer stopped",
            ))));
        }
        Ok(())
    }
}

/// One remote terminal: a pty-backed child process bound to one client channel.
///
/// Sessions are created by [`SessionRegistry::create`] in the `Starting` state
/// and only ever move forward: `Starting → Active → Closing → Closed`, or
/// `Starting → Closed` when the child cannot be spawned. Reaching `Closed`
/// releases the pty, reaps the child and removes the session from its
/// registry, exactly once.
pub struct Session {
    id: SessionId,
    config: Arc<SessionConfig>,
    state: watch::Sender<SessionState>,
    /// Present exactly while the session is `Active` (and during teardown).
    pty: Mutex<Option<Arc<PtyHandle>>>,
    pid: Mutex<Option<u32>>,
    channel: Mutex<Option<mpsc::WeakSender<ServerMessage>>>,
    input: Mutex<Option<InputQueue>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    connected: AtomicBool,
    /// Fires when the session leaves `Active`; the pump watches it.
    cancelled: CancellationToken,
    registry: RegistryHandle,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("pid", &self.pid())
            .finish_non_exhaustive()
    }
}

impl Session {
    fn new(id: SessionId, config: Arc<SessionConfig>, registry: RegistryHandle) -> Self {
        Self {
            id,
            config,
            state: watch::channel(SessionState::Starting).0,
            pty: Mutex::new(None),
            pid: Mutex::new(None),
            channel: Mutex::new(None),
            input: Mutex::new(None),
            pump: Mutex::new(None),
            connected: AtomicBool::new(false),
            cancelled: CancellationToken::new(),
            registry,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// PID of the child, once it has been spawned.
    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock()
    }

    /// Whether a client has already claimed this session.
    pub fn is_attached(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn command(&self) -> String {
        self.config.command.display()
    }

    /// Current `(rows, cols)` while a terminal is open.
    pub fn size(&self) -> Option<(u16, u16)> {
        self.active_pty().and_then(|pty| pty.size().ok())
    }

    pub fn info(&self) -> SessionInfo {
        let size = self.size();
        SessionInfo {
            id: self.id,
            state: self.state(),
            pid: self.pid(),
            command: self.command(),
            rows: size.map(|(rows, _)| rows),
            cols: size.map(|(_, cols)| cols),
        }
    }

    /// Wait until the session has reached `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.subscribe_state();
        let _ = rx.wait_for(|state| *state == SessionState::Closed).await;
    }

    /// Spawn the configured command on a new pty and start streaming its
    /// output into `channel`.
    ///
    /// The session keeps only a weak reference to `channel`; the caller must
    /// hold on to the sender for as long as it wants output. If the command
    /// cannot be spawned the session goes straight to `Closed` and leaves the
    /// registry.
    pub async fn on_connect(
        self: &Arc<Self>,
        channel: &mpsc::Sender<ServerMessage>,
    ) -> Result<(), SessionError> {
        let state = self.state();
        if state != SessionState::Starting || self.connected.swap(true, Ordering::AcqRel) {
            return Err(SessionError::InvalidState { id: self.id, state });
        }

        let config = Arc::clone(&self.config);
        let opened = tokio::task::spawn_blocking(move || {
            PtyHandle::open(&config.command, config.rows, config.cols)
        })
        .await
        .unwrap_or_else(|e| Err(PtyError::Io(std::io::Error::other(e))));

        let pty = match opened {
            Ok(pty) => Arc::new(pty),
            Err(e) => {
                tracing::warn!(session = %self.id, command = %self.command(), error = %e, "failed to start terminal");
                self.cancelled.cancel();
                // A concurrent disconnect that already moved us to Closing
                // owns the rest of the teardown.
                if self.transition(&[SessionState::Starting], SessionState::Closed) {
                    self.registry.deregister(self.id);
                }
                return Err(SessionError::Spawn(e));
            }
        };

        let activated = {
            let mut slot = self.pty.lock();
            let won = self.transition(&[SessionState::Starting], SessionState::Active);
            if won {
                *self.input.lock() = Some(InputQueue::spawn(self.id, Arc::clone(&pty)));
                *slot = Some(Arc::clone(&pty));
            }
            won
        };
        if !activated {
            tracing::debug!(session = %self.id, "session closed while spawning, discarding terminal");
            let _ = tokio::task::spawn_blocking(move || pty.close()).await;
            return Err(SessionError::Closed(self.id));
        }
        *self.pid.lock() = pty.pid();
        *self.channel.lock() = Some(channel.downgrade());

        let pump = OutputPump::new(
            Arc::clone(&pty),
            channel.downgrade(),
            self.config.pump.clone(),
            self.cancelled.clone(),
        );
        let session = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let exit = pump.run().await;
            session.on_pump_exit(exit).await;
        });
        *self.pump.lock() = Some(handle);

        tracing::info!(
            session = %self.id,
            pid = pty.pid(),
            command = %self.command(),
            rows = self.config.rows,
            cols = self.config.cols,
            "session active"
        );
        Ok(())
    }

    /// Type `text` into the terminal.
    ///
    /// Never blocks: the bytes are queued for the session's writer thread,
    /// which delivers them in submission order. Input that arrives before the
    /// terminal is up, or after it has been torn down, is dropped without
    /// error. Fails with [`SessionError::InputOverflow`] while the child has
    /// more than [`MAX_PENDING_INPUT`] bytes it has not read yet.
    pub fn on_input(&self, text: &str) -> Result<(), SessionError> {
        if self.state() != SessionState::Active {
            tracing::debug!(session = %self.id, state = ?self.state(), "input for inactive session dropped");
            return Ok(());
        }
        let input = self.input.lock();
        match input.as_ref() {
            Some(queue) => queue.push(self.id, text.as_bytes()),
            None => Ok(()),
        }
    }

    pub fn on_resize(&self, rows: u16, cols: u16) -> Result<(), SessionError> {
        tracing::debug!(session = %self.id, rows, cols, "resize");
        match self.active_pty() {
            Some(pty) => Ok(pty.resize(rows, cols)?),
            None => Ok(()),
        }
    }

    /// Tear the session down because its client left.
    pub async fn on_disconnect(&self) {
        self.close(CloseReason::Disconnected).await;
    }

    /// Stop the pump, close the pty, reap the child and leave the registry.
    ///
    /// When another flow is already closing the session this waits for it to
    /// finish instead. Once this returns no further message is sent on the
    /// session's channel.
    pub async fn close(&self, reason: CloseReason) {
        if !self.begin_closing() {
            self.closed().await;
            return;
        }
        let pump = self.pump.lock().take();
        if let Some(handle) = pump {
            if let Err(e) = handle.await {
                tracing::error!(session = %self.id, "output pump task panicked: {:?}", e);
            }
        }
        self.finish(reason).await;
    }

    async fn on_pump_exit(&self, exit: PumpExit) {
        let reason = match exit {
            PumpExit::Cancelled => return,
            PumpExit::EndOfStream => CloseReason::EndOfStream,
            PumpExit::ChannelClosed => CloseReason::ChannelClosed,
            PumpExit::Failed(e) => {
                tracing::warn!(session = %self.id, error = %e, "terminal output failed");
                CloseReason::IoError
            }
        };
        // Losing this race means a disconnect is already joining this task.
        if !self.begin_closing() {
            return;
        }
        self.finish(reason).await;
    }

    fn begin_closing(&self) -> bool {
        let won = self.transition(
            &[SessionState::Starting, SessionState::Active],
            SessionState::Closing,
        );
        if won {
            self.cancelled.cancel();
        }
        won
    }

    async fn finish(&self, reason: CloseReason) {
        // Queued input dies with the session; a write already in progress
        // fails once the pty is closed.
        drop(self.input.lock().take());
        let pty = self.pty.lock().take();
        let status = match pty {
            Some(pty) => tokio::task::spawn_blocking(move || pty.close())
                .await
                .unwrap_or_else(|e| {
                    tracing::error!(session = %self.id, "pty close task panicked: {:?}", e);
                    None
                }),
            None => None,
        };

        if reason == CloseReason::EndOfStream {
            let channel = self.channel.lock().as_ref().and_then(|weak| weak.upgrade());
            if let Some(tx) = channel {
                let notice = ServerMessage::Exit {
                    code: status.as_ref().map(|s| s.exit_code()),
                };
                let _ = tokio::time::timeout(EXIT_NOTICE_TIMEOUT, tx.send(notice)).await;
            }
        }

        self.transition(&[SessionState::Closing], SessionState::Closed);
        self.registry.deregister(self.id);
        tracing::info!(
            session = %self.id,
            ?reason,
            exit_code = status.as_ref().map(|s| s.exit_code()),
            "session closed"
        );
    }

    fn active_pty(&self) -> Option<Arc<PtyHandle>> {
        if self.state() != SessionState::Active {
            return None;
        }
        self.pty.lock().clone()
    }

    fn transition(&self, from: &[SessionState], to: SessionState) -> bool {
        self.state.send_if_modified(|state| {
            if from.contains(state) {
                *state = to;
                true
            } else {
                false
            }
        })
    }
}

/// Registry-level session lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Created { id: SessionId },
    Destroyed { id: SessionId },
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("session not found: {0}")]
    NotFound(SessionId),
    #[error("session id already in use: {0}")]
    DuplicateId(SessionId),
    #[error("maximum number of sessions reached")]
    MaxSessionsReached,
    #[error("server is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Session(#[from] SessionError),
}

struct RegistryInner {
    sessions: HashMap<SessionId, Arc<Session>>,
    next_id: u64,
    max_sessions: Option<usize>,
    draining: bool,
}

/// The table of live sessions, addressed by [`SessionId`].
///
/// Cheap to clone; clones share the same table. Locks are never held across
/// an `.await` or while a child process is being spawned or reaped.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    events_tx: broadcast::Sender<SessionEvent>,
    config: Arc<SessionConfig>,
}

/// A session's way back to its registry, without keeping the registry alive.
#[derive(Clone)]
struct RegistryHandle {
    inner: Weak<RwLock<RegistryInner>>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl RegistryHandle {
    fn deregister(&self, id: SessionId) {
        if let Some(inner) = self.inner.upgrade() {
            remove_entry(&inner, &self.events_tx, id);
        }
    }
}

fn remove_entry(
    inner: &RwLock<RegistryInner>,
    events_tx: &broadcast::Sender<SessionEvent>,
    id: SessionId,
) -> Option<Arc<Session>> {
    let removed = inner.write().sessions.remove(&id);
    if removed.is_some() {
        let _ = events_tx.send(SessionEvent::Destroyed { id });
    }
    removed
}

impl SessionRegistry {
    /// Default cap on concurrent sessions. Each one costs a pty pair, a child
    /// process and a pump task.
    pub const DEFAULT_MAX_SESSIONS: usize = 256;

    pub fn new(config: SessionConfig) -> Self {
        Self::with_max_sessions(config, Some(Self::DEFAULT_MAX_SESSIONS))
    }

    pub fn with_max_sessions(config: SessionConfig, max_sessions: Option<usize>) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                sessions: HashMap::new(),
                next_id: 0,
                max_sessions,
                draining: false,
            })),
            events_tx,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn handle(&self) -> RegistryHandle {
        RegistryHandle {
            inner: Arc::downgrade(&self.inner),
            events_tx: self.events_tx.clone(),
        }
    }

    /// Register a new session in the `Starting` state and return its id.
    pub fn create(&self) -> Result<SessionId, RegistryError> {
        let mut inner = self.inner.write();
        if inner.draining {
            return Err(RegistryError::ShuttingDown);
        }
        if let Some(max) = inner.max_sessions {
            if inner.sessions.len() >= max {
                return Err(RegistryError::MaxSessionsReached);
            }
        }

        inner.next_id += 1;
        let id = SessionId(inner.next_id);
        if inner.sessions.contains_key(&id) {
            return Err(RegistryError::DuplicateId(id));
        }
        let session = Arc::new(Session::new(id, Arc::clone(&self.config), self.handle()));
        inner.sessions.insert(id, session);
        drop(inner);

        let _ = self.events_tx.send(SessionEvent::Created { id });
        tracing::info!(session = %id, "session created");
        Ok(id)
    }

    /// Create a session and connect it to `channel` in one step.
    ///
    /// On failure nothing is left behind in the registry.
    pub async fn open(
        &self,
        channel: &mpsc::Sender<ServerMessage>,
    ) -> Result<Arc<Session>, RegistryError> {
        let id = self.create()?;
        let session = self.lookup(id).ok_or(RegistryError::NotFound(id))?;
        session.on_connect(channel).await?;
        Ok(session)
    }

    pub fn lookup(&self, id: SessionId) -> Option<Arc<Session>> {
        self.inner.read().sessions.get(&id).cloned()
    }

    /// Drop the entry for `id`. Calling it for an unknown id does nothing.
    ///
    /// A session that is still running is torn down in the background.
    pub fn remove(&self, id: SessionId) -> Option<Arc<Session>> {
        let removed = remove_entry(&self.inner, &self.events_tx, id)?;
        if matches!(removed.state(), SessionState::Starting | SessionState::Active) {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let session = Arc::clone(&removed);
                runtime.spawn(async move { session.close(CloseReason::Disconnected).await });
            }
        }
        Some(removed)
    }

    /// Route an inbound control message to its session.
    ///
    /// Messages for unknown or expired sessions are dropped with a warning.
    pub async fn dispatch(&self, id: SessionId, control: Control) -> Result<(), RegistryError> {
        let Some(session) = self.lookup(id) else {
            tracing::warn!(session = %id, ?control, "control message for unknown session dropped");
            return Err(RegistryError::NotFound(id));
        };
        match control {
            Control::Input(text) => session.on_input(&text)?,
            Control::Resize { rows, cols } => session.on_resize(rows, cols)?,
            Control::Disconnect => session.on_disconnect().await,
        }
        Ok(())
    }

    /// Snapshot of all sessions, ordered by id.
    pub fn list(&self) -> Vec<SessionInfo> {
        let sessions: Vec<Arc<Session>> = self.inner.read().sessions.values().cloned().collect();
        let mut infos: Vec<SessionInfo> = sessions.iter().map(|s| s.info()).collect();
        infos.sort_by_key(|info| info.id);
        infos
    }

    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse new sessions, then close every live one and wait for all of
    /// them to reach `Closed`.
    pub async fn drain(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut inner = self.inner.write();
            inner.draining = true;
            inner.sessions.values().cloned().collect()
        };
        if sessions.is_empty() {
            return;
        }
        tracing::info!(count = sessions.len(), "closing all sessions");
        futures::future::join_all(sessions.iter().map(|s| s.close(CloseReason::Shutdown))).await;
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }
}

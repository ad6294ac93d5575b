//! Pseudo-terminal session management
//!
//! Each session owns exactly one agent process attached to its own
//! pseudo-terminal. A dedicated blocking task waits on the child, so the
//! process is always reaped by the task that owns it; everyone else observes
//! the exit through a watch channel.
//!
//! Termination sends SIGTERM to the child's process group (the child is a
//! session leader), waits up to the grace period, then sends SIGKILL. Only
//! the first `terminate` call for a session does anything.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::watch;

use ca_core::config::RelayConfig;
use ca_core::SpawnError;
use ca_protocol::{SessionId, TerminalSize};

use super::command::CommandSpec;

/// How long to wait for the process to be reaped after SIGKILL
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Process spawned, no output seen yet
    Starting = 0,
    /// Process has produced output
    Active = 1,
    /// Termination in progress
    Closing = 2,
    /// Process reaped
    Terminated = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Starting,
            1 => SessionState::Active,
            2 => SessionState::Closing,
            _ => SessionState::Terminated,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Starting => write!(f, "starting"),
            SessionState::Active => write!(f, "active"),
            SessionState::Closing => write!(f, "closing"),
            SessionState::Terminated => write!(f, "terminated"),
        }
    }
}

/// How the agent process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, `None` if waiting on the child failed
    pub code: Option<u32>,
}

/// I/O handles for a session's pseudo-terminal master
///
/// Handed out once, at creation, so each direction has a single owner.
pub struct SessionIo {
    /// Process output
    pub reader: Box<dyn Read + Send>,
    /// Process input
    pub writer: Box<dyn Write + Send>,
}

impl std::fmt::Debug for SessionIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionIo").finish_non_exhaustive()
    }
}

/// A live terminal session
pub struct PtySession {
    id: SessionId,
    pid: Option<u32>,
    state: AtomicU8,
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    /// Set once the child is reaped, so its pid is never signalled after reuse
    child_exited: Arc<AtomicBool>,
}

impl std::fmt::Debug for PtySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtySession")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .finish()
    }
}

impl PtySession {
    /// Session ID
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Process ID of the agent
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Record that the process produced output
    pub fn mark_active(&self) {
        let _ = self.state.compare_exchange(
            SessionState::Starting as u8,
            SessionState::Active as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Whether the process has been reaped
    pub fn has_exited(&self) -> bool {
        self.child_exited.load(Ordering::Acquire)
    }

    /// Wait until the process has exited and been reaped
    pub async fn exited(&self) -> ProcessExit {
        let mut rx = self.exit_rx.clone();
        let exit = match rx.wait_for(Option::is_some).await {
            Ok(exit) => (*exit).unwrap_or(ProcessExit { code: None }),
            // The waiter task is gone without reporting; treat as exited.
            Err(_) => ProcessExit { code: None },
        };
        exit
    }

    /// Resize the pseudo-terminal
    pub fn resize(&self, size: TerminalSize) -> Result<(), std::io::Error> {
        tracing::debug!("Resizing {} to {}x{}", self.id, size.cols, size.rows);
        let master = self
            .master
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        master
            .resize(pty_size(size))
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    }

    /// Move to `Closing`; false if another caller already did
    fn begin_closing(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= SessionState::Closing as u8 {
                return false;
            }
            match self.state.compare_exchange(
                current,
                SessionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn signal(&self, signal: TermSignal) {
        if self.has_exited() {
            tracing::debug!("{} already exited, not sending {:?}", self.id, signal);
            return;
        }

        #[cfg(unix)]
        if let Some(pid) = self.pid {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;

            let sig = match signal {
                TermSignal::Terminate => Signal::SIGTERM,
                TermSignal::Kill => Signal::SIGKILL,
            };
            match killpg(Pid::from_raw(pid as i32), sig) {
                Ok(()) => return,
                Err(nix::errno::Errno::ESRCH) => return,
                Err(e) => {
                    tracing::debug!("killpg({}, {:?}) failed: {}, signalling child only", pid, sig, e);
                }
            }
        }

        let mut killer = self
            .killer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = killer.kill() {
            tracing::debug!("Failed to kill {}: {}", self.id, e);
        }
    }

    async fn wait_exit(&self, limit: Duration) -> bool {
        tokio::time::timeout(limit, self.exited()).await.is_ok()
    }

    /// SIGTERM, grace period, SIGKILL
    async fn shutdown(&self, grace: Duration) {
        if self.has_exited() {
            return;
        }

        self.signal(TermSignal::Terminate);
        if self.wait_exit(grace).await {
            tracing::debug!("{} exited after SIGTERM", self.id);
            return;
        }

        tracing::warn!(
            "{} still running {:?} after SIGTERM, sending SIGKILL",
            self.id,
            grace
        );
        self.signal(TermSignal::Kill);
        if !self.wait_exit(KILL_WAIT).await {
            tracing::error!("{} (pid {:?}) did not exit after SIGKILL", self.id, self.pid);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum TermSignal {
    Terminate,
    Kill,
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

/// Owns every live session
///
/// The grace period and session cap can be changed while sessions are live;
/// new values apply to the next `create_session` or `terminate` call.
pub struct SessionManager {
    sessions: DashMap<SessionId, Arc<PtySession>>,
    next_id: AtomicU32,
    /// Grace period in milliseconds
    grace_ms: AtomicU64,
    /// Session cap, 0 for unlimited
    max_sessions: AtomicU32,
}

impl SessionManager {
    /// Create a manager with the given termination grace period
    pub fn new(grace: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            next_id: AtomicU32::new(1),
            grace_ms: AtomicU64::new(duration_ms(grace)),
            max_sessions: AtomicU32::new(0),
        }
    }

    /// Create a manager from the relay configuration
    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(config.termination_grace).with_max_sessions(config.max_sessions)
    }

    /// Cap the number of concurrent sessions
    pub fn with_max_sessions(self, max_sessions: Option<u32>) -> Self {
        self.set_max_sessions(max_sessions);
        self
    }

    /// Apply the session settings of a (re)loaded configuration
    pub fn apply_config(&self, config: &RelayConfig) {
        self.set_grace(config.termination_grace);
        self.set_max_sessions(config.max_sessions);
        tracing::debug!(
            "Session settings: grace {:?}, max sessions {:?}",
            config.termination_grace,
            config.max_sessions
        );
    }

    /// Change the grace period between SIGTERM and SIGKILL
    pub fn set_grace(&self, grace: Duration) {
        self.grace_ms.store(duration_ms(grace), Ordering::Release);
    }

    /// Change the session cap; `None` removes it
    pub fn set_max_sessions(&self, max_sessions: Option<u32>) {
        self.max_sessions
            .store(max_sessions.unwrap_or(0), Ordering::Release);
    }

    /// Current session cap
    pub fn max_sessions(&self) -> Option<u32> {
        match self.max_sessions.load(Ordering::Acquire) {
            0 => None,
            max => Some(max),
        }
    }

    /// Spawn `spec` under a new pseudo-terminal
    ///
    /// Must be called from within a Tokio runtime.
    pub fn create_session(&self, spec: CommandSpec) -> Result<(Arc<PtySession>, SessionIo), SpawnError> {
        if let Some(max) = self.max_sessions() {
            if self.sessions.len() >= max as usize {
                return Err(SpawnError::LimitExceeded(max));
            }
        }

        let id = SessionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::info!(
            "Creating {} running {} in {} ({}x{})",
            id,
            spec.program,
            spec.cwd.display(),
            spec.size.cols,
            spec.size.rows
        );

        let pair = native_pty_system()
            .openpty(pty_size(spec.size))
            .map_err(|e| SpawnError::PtyAllocation(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&spec.program);
        cmd.args(&spec.args);
        cmd.cwd(&spec.cwd);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SpawnError::Command {
                program: spec.program.clone(),
                reason: e.to_string(),
            })?;
        // Keep no slave handle in this process, so the reader sees EOF once the child is gone.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let io = match (pair.master.try_clone_reader(), pair.master.take_writer()) {
            (Ok(reader), Ok(writer)) => SessionIo { reader, writer },
            (Err(e), _) | (_, Err(e)) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SpawnError::Io(e.to_string()));
            }
        };

        let (exit_tx, exit_rx) = watch::channel(None);
        let child_exited = Arc::new(AtomicBool::new(false));

        let exited_flag = Arc::clone(&child_exited);
        tokio::task::spawn_blocking(move || {
            let code = match child.wait() {
                Ok(status) => Some(status.exit_code()),
                Err(e) => {
                    tracing::warn!("Failed to wait on {}: {}", id, e);
                    None
                }
            };
            exited_flag.store(true, Ordering::Release);
            tracing::debug!("{} exited with code {:?}", id, code);
            let _ = exit_tx.send(Some(ProcessExit { code }));
        });

        let session = Arc::new(PtySession {
            id,
            pid,
            state: AtomicU8::new(SessionState::Starting as u8),
            master: Mutex::new(pair.master),
            killer: Mutex::new(killer),
            exit_rx,
            child_exited,
        });

        self.sessions.insert(id, Arc::clone(&session));
        tracing::info!("{} started with pid {:?}", id, pid);

        Ok((session, io))
    }

    /// Terminate a session and reap its process
    ///
    /// Returns true for the call that performed the termination and false
    /// for every other call, including calls for unknown sessions.
    pub async fn terminate(&self, id: SessionId) -> bool {
        let Some(session) = self.get(id) else {
            return false;
        };
        if !session.begin_closing() {
            return false;
        }

        tracing::info!("Terminating {}", id);
        session.shutdown(self.grace()).await;

        self.sessions.remove(&id);
        session
            .state
            .store(SessionState::Terminated as u8, Ordering::Release);
        tracing::info!("{} terminated", id);
        true
    }

    /// Terminate every live session
    pub async fn terminate_all(&self) {
        let ids: Vec<SessionId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        if ids.is_empty() {
            return;
        }

        tracing::info!("Terminating {} session(s)", ids.len());
        futures::future::join_all(ids.into_iter().map(|id| self.terminate(id))).await;
    }

    /// Get a session by ID
    pub fn get(&self, id: SessionId) -> Option<Arc<PtySession>> {
        self.sessions.get(&id).map(|entry| Arc::clone(&entry))
    }

    /// IDs of all live sessions
    pub fn list(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }

    /// Number of live sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Grace period between SIGTERM and SIGKILL
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms.load(Ordering::Acquire))
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::from_config(&RelayConfig::default())
    }
}

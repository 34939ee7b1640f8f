//! Session Controller
//!
//! Top-level state machine behind the helper's two commands. `connect`
//! owns the whole session lifecycle: single-session locking, snapshot
//! before any mutation, subprocess startup gated on bootstrap, route
//! installation, and a teardown that is guaranteed to run exactly once,
//! from the normal exit path, the failure path, or the signal path.
//!
//! ```text
//! Idle → Starting → Running → Stopping → Idle
//!           └─────→ Failed ──────┘
//! ```
//!
//! Only `Idle` and `Running` are rest states; `Failed` immediately
//! drains into the cleanup path.

use crate::config::{ConfigError, HelperConfig};
use crate::lock::{LockError, LockProbe, SessionLock};
use crate::netstate::{restore_network, NetworkSnapshot};
use crate::routes::{NetworkConfigError, RouteConfigurator, RouteOps};
use crate::supervisor::{Supervisor, SupervisorError};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

/// How many poll intervals `disconnect` waits for a signalled helper.
const LOCK_WAIT_ATTEMPTS: u32 = 5;

/// Session lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session exists.
    Idle,
    /// Startup sequence in progress.
    Starting,
    /// Session established, awaiting the termination signal.
    Running,
    /// Teardown in progress.
    Stopping,
    /// Startup failed; cleanup pending.
    Failed,
}

impl SessionState {
    /// True for the two stable rest states.
    pub fn is_rest(&self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Running)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, SessionState::Running)
    }
}

/// One connect→running→disconnect lifecycle. Owns the snapshot, the
/// subprocess handles and the teardown-once guard; the route table is
/// reached only through the `RouteOps` passed in by the caller.
pub struct Session {
    config: HelperConfig,
    supervisor: Supervisor,
    snapshot: Option<NetworkSnapshot>,
    state: SessionState,
    torn_down: AtomicBool,
}

impl Session {
    pub fn new(config: HelperConfig) -> Self {
        Self {
            config,
            supervisor: Supervisor::new(),
            snapshot: None,
            state: SessionState::Idle,
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The network state captured for this session, once startup has
    /// progressed past the snapshot.
    pub fn snapshot(&self) -> Option<&NetworkSnapshot> {
        self.snapshot.as_ref()
    }

    /// Run the startup sequence: snapshot, client config, anonymity
    /// client (gated on bootstrap), tunnel bridge, routes. The snapshot
    /// always comes first: nothing is launched and no route is touched
    /// until the original state is safely captured.
    async fn startup(&mut self, ops: &dyn RouteOps) -> Result<(), SessionError> {
        self.state = SessionState::Starting;

        info!("capturing original network state");
        let snapshot = NetworkSnapshot::capture(&self.config, ops)?;

        self.config.write_client_config()?;

        info!("starting anonymity client");
        self.supervisor.start_anonymity_client(&self.config).await?;

        info!("starting tunnel bridge");
        self.supervisor.start_tunnel_bridge(&self.config)?;

        info!("configuring routes");
        RouteConfigurator::new(&self.config, ops)
            .install(&snapshot)
            .await?;

        self.snapshot = Some(snapshot);
        self.state = SessionState::Running;
        Ok(())
    }

    /// Undo every session mutation: restore network state, then signal
    /// the subprocesses. Runs at most once per session; later calls are
    /// no-ops. Teardown-path errors are logged, never propagated.
    pub fn teardown(&mut self, ops: &dyn RouteOps) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state = SessionState::Stopping;
        info!("tearing down session");
        RouteConfigurator::new(&self.config, ops).teardown();
        self.supervisor.stop_all();
        self.state = SessionState::Idle;
    }
}

/// Establish a session and hold it until a termination signal arrives.
///
/// Fails fast when a live session exists. A stale lock (recorded helper
/// is dead) is treated as an abandoned session: the lock is removed and
/// leftover network state is restored before the new session starts.
/// On any startup failure the session is torn down, the lock released,
/// and the error returned for a nonzero exit.
pub async fn connect(config: HelperConfig, ops: &dyn RouteOps) -> Result<(), SessionError> {
    match SessionLock::probe(&config.lock_path) {
        LockProbe::Live(pid) => return Err(SessionError::AlreadyRunning(pid)),
        LockProbe::Stale(pid) => {
            warn!(pid, "stale session lock found; restoring abandoned network state");
            if let Err(e) = std::fs::remove_file(&config.lock_path) {
                warn!(error = %e, "failed to remove stale lock");
            }
            restore_network(&config, ops);
        }
        LockProbe::Absent => {}
    }

    let lock = SessionLock::acquire(&config.lock_path)?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(SessionError::Signal)?;
    let mut sigint = signal(SignalKind::interrupt()).map_err(SessionError::Signal)?;

    let mut session = Session::new(config);
    match session.startup(ops).await {
        Ok(()) => {
            info!("session established; awaiting termination signal");
            tokio::select! {
                _ = sigterm.recv() => info!("termination signal received"),
                _ = sigint.recv() => info!("interrupt received"),
            }
            session.teardown(ops);
            lock.release();
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "startup failed; tearing down");
            session.state = SessionState::Failed;
            session.teardown(ops);
            lock.release();
            Err(e)
        }
    }
}

/// Stop the active session.
///
/// With a live session, signals the owning helper and waits a bounded
/// number of poll intervals for the lock to clear; a helper that does
/// not exit in time is logged, not treated as an error. Without a live
/// session, still runs the best-effort network restore: an abandoned
/// resolver backup or route record is cleaned up even when no helper is
/// around to own it.
pub async fn disconnect(config: HelperConfig, ops: &dyn RouteOps) -> Result<(), SessionError> {
    let LockProbe::Live(pid) = SessionLock::probe(&config.lock_path) else {
        info!("no active session; running best-effort cleanup");
        restore_network(&config, ops);
        return Ok(());
    };

    info!(pid, "signalling active helper");
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        warn!(pid, error = %e, "failed to signal helper");
    }
    for _ in 0..LOCK_WAIT_ATTEMPTS {
        if !SessionLock::is_live(&config.lock_path) {
            info!("helper exited; session closed");
            return Ok(());
        }
        tokio::time::sleep(config.lock_poll_interval()).await;
    }
    if SessionLock::is_live(&config.lock_path) {
        warn!(pid, "helper did not exit in time; lock file may remain");
    } else {
        info!("helper exited; session closed");
    }
    Ok(())
}

/// Session lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("a session is already active (helper pid {0})")]
    AlreadyRunning(i32),

    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("network error: {0}")]
    Network(#[from] NetworkConfigError),

    #[error("subprocess error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),
}

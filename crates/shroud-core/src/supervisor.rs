//! Process Supervisor
//!
//! Starts and stops the two session subprocesses: the anonymity client
//! and the tun-to-proxy bridge. The client's combined output is scanned
//! line by line: every line is mirrored to the log, and the bootstrap
//! marker resolves a readiness signal that the startup sequence races
//! against a timeout. The bridge has no readiness protocol; the caller
//! enforces an interface settle delay instead.
//!
//! Termination is fire-and-forget SIGTERM: teardown must stay bounded
//! even when a subprocess is unresponsive.

use crate::config::HelperConfig;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A subprocess owned by the supervisor for the lifetime of one session.
struct ManagedProcess {
    name: &'static str,
    child: Child,
}

impl ManagedProcess {
    /// Send a graceful termination signal without waiting for exit.
    fn terminate(&mut self) {
        if let Ok(Some(status)) = self.child.try_wait() {
            debug!(name = self.name, %status, "process already exited");
            return;
        }
        if let Some(id) = self.child.id() {
            match kill(Pid::from_raw(id as i32), Signal::SIGTERM) {
                Ok(()) => info!(name = self.name, pid = id, "sent SIGTERM"),
                Err(e) => warn!(name = self.name, pid = id, error = %e, "failed to signal process"),
            }
        }
    }
}

/// Owns the two session subprocesses.
#[derive(Default)]
pub struct Supervisor {
    client: Option<ManagedProcess>,
    bridge: Option<ManagedProcess>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Launch the anonymity client and wait for it to bootstrap.
    ///
    /// Stdout and stderr are piped and scanned; the scanners mirror every
    /// line to the log and keep running until the process exits. This
    /// call resolves when the bootstrap marker appears, and fails when
    /// the timeout elapses first or the process exits without producing
    /// the marker.
    pub async fn start_anonymity_client(
        &mut self,
        config: &HelperConfig,
    ) -> Result<(), SupervisorError> {
        let mut child = Command::new(&config.client_bin)
            .arg("-f")
            .arg(&config.client_config_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                name: "anonymity client",
                source,
            })?;
        info!(pid = child.id(), "anonymity client launched");

        let (ready_tx, mut ready_rx) = mpsc::channel::<()>(1);
        if let Some(out) = child.stdout.take() {
            tokio::spawn(scan_lines(
                "client",
                out,
                config.bootstrap_marker.clone(),
                Some(ready_tx.clone()),
            ));
        }
        if let Some(err) = child.stderr.take() {
            tokio::spawn(scan_lines(
                "client",
                err,
                config.bootstrap_marker.clone(),
                Some(ready_tx.clone()),
            ));
        }
        // scanners hold the only senders left; recv() yields None on exit
        drop(ready_tx);
        self.client = Some(ManagedProcess {
            name: "anonymity client",
            child,
        });

        match tokio::time::timeout(config.bootstrap_timeout(), ready_rx.recv()).await {
            Ok(Some(())) => {
                info!("anonymity client bootstrapped");
                Ok(())
            }
            Ok(None) => Err(SupervisorError::ClientExited),
            Err(_) => Err(SupervisorError::BootstrapTimeout {
                waited: config.bootstrap_timeout(),
            }),
        }
    }

    /// Launch the tunnel bridge bound to the tunnel device and the
    /// client's local proxy endpoint. No readiness wait.
    pub fn start_tunnel_bridge(&mut self, config: &HelperConfig) -> Result<(), SupervisorError> {
        let device = format!("tun://{}", config.tun_device);
        let mut child = Command::new(&config.bridge_bin)
            .arg("-device")
            .arg(&device)
            .arg("-proxy")
            .arg(&config.socks_proxy)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| SupervisorError::Spawn {
                name: "tunnel bridge",
                source,
            })?;
        info!(pid = child.id(), device = %device, "tunnel bridge launched");

        if let Some(out) = child.stdout.take() {
            tokio::spawn(scan_lines("bridge", out, String::new(), None));
        }
        if let Some(err) = child.stderr.take() {
            tokio::spawn(scan_lines("bridge", err, String::new(), None));
        }
        self.bridge = Some(ManagedProcess {
            name: "tunnel bridge",
            child,
        });
        Ok(())
    }

    /// Signal both subprocesses to terminate; never blocks on exit.
    pub fn stop_all(&mut self) {
        if let Some(bridge) = &mut self.bridge {
            bridge.terminate();
        }
        if let Some(client) = &mut self.client {
            client.terminate();
        }
    }
}

/// Mirror a process output stream to the log line by line. When `ready`
/// is set, the first line containing `marker` resolves the readiness
/// signal; scanning continues regardless until the stream closes.
async fn scan_lines<R>(tag: &'static str, stream: R, marker: String, ready: Option<mpsc::Sender<()>>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!("[{tag}] {line}");
        if let Some(tx) = &ready {
            if !marker.is_empty() && line.contains(&marker) {
                let _ = tx.try_send(());
            }
        }
    }
}

/// Subprocess lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to launch {name}: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("anonymity client exited before completing bootstrap")]
    ClientExited,

    #[error("anonymity client did not bootstrap within {}s", .waited.as_secs())]
    BootstrapTimeout { waited: Duration },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn test_config(dir: &tempfile::TempDir, client_script: &str) -> HelperConfig {
        HelperConfig {
            client_bin: write_script(dir.path(), "fake-client", client_script),
            bridge_bin: write_script(dir.path(), "fake-bridge", "sleep 30\n"),
            client_config_path: dir.path().join("client.conf"),
            bootstrap_timeout_secs: 5,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_marker_on_stdout_resolves_readiness() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, "echo 'Bootstrapped 100% (done)'\nsleep 30\n");
        let mut supervisor = Supervisor::new();

        supervisor.start_anonymity_client(&config).await.unwrap();
        supervisor.stop_all();
    }

    #[tokio::test]
    async fn bootstrap_marker_on_stderr_resolves_readiness() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, "echo 'Bootstrapped 100%' 1>&2\nsleep 30\n");
        let mut supervisor = Supervisor::new();

        supervisor.start_anonymity_client(&config).await.unwrap();
        supervisor.stop_all();
    }

    #[tokio::test]
    async fn missing_marker_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir, "echo 'still warming up'\nsleep 30\n");
        config.bootstrap_timeout_secs = 1;
        let mut supervisor = Supervisor::new();

        let result = supervisor.start_anonymity_client(&config).await;

        assert!(matches!(
            result,
            Err(SupervisorError::BootstrapTimeout { .. })
        ));
        supervisor.stop_all();
    }

    #[tokio::test]
    async fn early_exit_without_marker_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, "echo 'goodbye'\n");
        let mut supervisor = Supervisor::new();

        let result = supervisor.start_anonymity_client(&config).await;

        assert!(matches!(result, Err(SupervisorError::ClientExited)));
    }

    #[tokio::test]
    async fn unlaunchable_client_reports_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(&dir, "");
        config.client_bin = dir.path().join("does-not-exist");
        let mut supervisor = Supervisor::new();

        let result = supervisor.start_anonymity_client(&config).await;

        assert!(matches!(result, Err(SupervisorError::Spawn { .. })));
    }

    #[tokio::test]
    async fn stop_all_without_started_processes_is_a_noop() {
        let mut supervisor = Supervisor::new();
        supervisor.stop_all();
    }

    #[tokio::test]
    async fn bridge_launch_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir, "");
        let mut supervisor = Supervisor::new();

        supervisor.start_tunnel_bridge(&config).unwrap();
        supervisor.stop_all();
    }
}

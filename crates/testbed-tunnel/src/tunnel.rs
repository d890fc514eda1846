//! Supervised `ssh -N -L` port forward.
//!
//! The child process is owned by a supervisor task that waits on either the
//! process exiting or a shutdown signal. Closing (or dropping) the tunnel
//! kills the process, so the forward never outlives the run that opened it.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use testbed_core::config::TunnelConfig;
use testbed_core::{Invocation, SshTarget};
use testbed_health::{PollOutcome, Poller};

use crate::error::{TunnelError, TunnelResult};

/// Build the `ssh` invocation that forwards `local_port` to `remote`.
pub fn forward_invocation(target: &SshTarget, config: &TunnelConfig) -> Invocation {
    Invocation::new("ssh")
        .arg("-N")
        .args(["-o", "ExitOnForwardFailure=yes"])
        .args(target.connection_args())
        .arg("-L")
        .arg(format!("{}:{}", config.local_port, config.remote))
        .arg(target.destination())
}

pub struct Tunnel {
    local_port: u16,
    poller: Poller,
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
    exited: Arc<AtomicBool>,
}

impl Tunnel {
    /// Open a forward through `target` as configured.
    pub fn open(target: &SshTarget, config: &TunnelConfig) -> TunnelResult<Self> {
        let poller = Poller::new(
            config.ready_retries,
            Duration::from_millis(config.ready_interval_ms),
        );
        Self::spawn(&forward_invocation(target, config), config.local_port, poller)
    }

    /// Start `invocation` under supervision; `local_port` is where the
    /// forward is expected to listen.
    pub fn spawn(invocation: &Invocation, local_port: u16, poller: Poller) -> TunnelResult<Self> {
        let child = tokio::process::Command::new(&invocation.program)
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TunnelError::Spawn {
                program: invocation.program.clone(),
                source,
            })?;
        info!(command = %invocation, local_port, pid = ?child.id(), "tunnel started");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let exited = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(supervise(child, local_port, shutdown_rx, exited.clone()));

        Ok(Self {
            local_port,
            poller,
            shutdown_tx,
            handle: Some(handle),
            exited,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Whether the forwarding process is still running.
    pub fn is_alive(&self) -> bool {
        !self.exited.load(Ordering::SeqCst)
    }

    /// Wait until the local end accepts connections.
    pub async fn wait_ready(&self) -> TunnelResult<()> {
        let addr = format!("127.0.0.1:{}", self.local_port);
        let result = self
            .poller
            .poll(|_| {
                let addr = addr.as_str();
                async move {
                    if !self.is_alive() {
                        return PollOutcome::Pending;
                    }
                    match TcpStream::connect(addr).await {
                        Ok(_) => PollOutcome::Ready,
                        Err(e) => {
                            debug!(%addr, error = %e, "tunnel not accepting yet");
                            PollOutcome::Pending
                        }
                    }
                }
            })
            .await;

        if result.is_ready() {
            info!(local_port = self.local_port, attempts = result.attempts(), "tunnel ready");
            Ok(())
        } else if !self.is_alive() {
            Err(TunnelError::Exited {
                local_port: self.local_port,
            })
        } else {
            Err(TunnelError::NotReady {
                local_port: self.local_port,
                attempts: result.attempts(),
            })
        }
    }

    /// Stop the process and wait for the supervisor to finish.
    pub async fn close(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "tunnel supervisor failed");
            }
        }
        info!(local_port = self.local_port, "tunnel closed");
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.shutdown_tx.send(true);
            // Aborting drops the child, which kills it.
            handle.abort();
        }
    }
}

async fn supervise(
    mut child: Child,
    local_port: u16,
    mut shutdown: watch::Receiver<bool>,
    exited: Arc<AtomicBool>,
) {
    tokio::select! {
        status = child.wait() => {
            match status {
                Ok(status) => warn!(local_port, %status, "tunnel process exited unexpectedly"),
                Err(e) => warn!(local_port, error = %e, "lost track of tunnel process"),
            }
        }
        _ = shutdown.changed() => {
            debug!(local_port, "stopping tunnel");
            if let Err(e) = child.kill().await {
                warn!(local_port, error = %e, "failed to stop tunnel process");
            }
        }
    }
    exited.store(true, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> SshTarget {
        SshTarget {
            host: "bastion".to_string(),
            user: Some("ci".to_string()),
            port: 2222,
            identity_file: None,
            options: Vec::new(),
        }
    }

    #[test]
    fn forward_invocation_shape() {
        let config = TunnelConfig {
            local_port: 16443,
            remote: "10.0.0.10:6443".to_string(),
            ready_retries: 5,
            ready_interval_ms: 100,
        };
        let inv = forward_invocation(&target(), &config);
        assert_eq!(
            inv.argv(),
            vec![
                "ssh",
                "-N",
                "-o",
                "ExitOnForwardFailure=yes",
                "-o",
                "BatchMode=yes",
                "-p",
                "2222",
                "-L",
                "16443:10.0.0.10:6443",
                "ci@bastion",
            ]
        );
    }

    #[tokio::test]
    async fn missing_binary_fails_to_open() {
        let inv = Invocation::new("/nonexistent/ssh-binary");
        let err = Tunnel::spawn(&inv, 1, Poller::new(1, Duration::from_millis(1))).err();
        assert!(matches!(err, Some(TunnelError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn ready_when_port_accepts_and_close_stops_process() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let inv = Invocation::new("sleep").arg("30");
        let tunnel = Tunnel::spawn(&inv, port, Poller::new(5, Duration::from_millis(20))).unwrap();
        tunnel.wait_ready().await.unwrap();
        assert!(tunnel.is_alive());
        tunnel.close().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exited_process_is_reported() {
        let inv = Invocation::new("true");
        let tunnel = Tunnel::spawn(&inv, 1, Poller::new(50, Duration::from_millis(20))).unwrap();

        for _ in 0..100 {
            if !tunnel.is_alive() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!tunnel.is_alive());
        let err = tunnel.wait_ready().await.unwrap_err();
        assert!(matches!(err, TunnelError::Exited { local_port: 1 }));
    }
}

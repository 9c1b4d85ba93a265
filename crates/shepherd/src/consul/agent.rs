//! Managed Consul agent process.
//!
//! When the backend is not running and `auto_start` is configured, the
//! bridge can launch its own dev-mode agent. This lifecycle is
//! independent of service (de)registration: stopping the manager does
//! not tear the agent down, so registrations stay visible.

use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};

use crate::consul::ConsulRegistry;
use crate::error::{Result, ServiceError};

/// How long to wait for a freshly started agent to answer.
const STARTUP_WAIT: Duration = Duration::from_secs(30);

const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle to a Consul agent process started by this manager.
#[derive(Default)]
pub struct ConsulProcess {
    child: Option<Child>,
}

impl ConsulProcess {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    /// Start a dev-mode agent if the backend is not already answering.
    /// Waits until the backend responds or the startup window elapses.
    pub async fn start(&mut self, registry: &ConsulRegistry, client_addr: &str) -> Result<bool> {
        if registry.is_available().await {
            log::info!("consul already running, no need to start it");
            return Ok(true);
        }

        let mut cmd = Command::new("consul");
        cmd.args(["agent", "-dev", "-client", client_addr])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        cmd.process_group(0);

        log::info!("starting consul: consul agent -dev -client {}", client_addr);
        let child = cmd.spawn().map_err(|e| ServiceError::Startup {
            service: "consul".to_string(),
            message: format!("failed to start consul agent: {}", e),
        })?;
        log::info!("consul agent started with pid {:?}", child.id());
        self.child = Some(child);

        let attempts = STARTUP_WAIT.as_secs();
        for elapsed in 1..=attempts {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if registry.is_available().await {
                log::info!("consul became available after {}s", elapsed);
                return Ok(true);
            }
        }

        log::error!("consul did not become available within {:?}", STARTUP_WAIT);
        self.stop().await;
        Err(ServiceError::Startup {
            service: "consul".to_string(),
            message: format!("agent did not become available within {:?}", STARTUP_WAIT),
        })
    }

    /// Stop the managed agent, if this manager started one.
    pub async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        let pid = child.id();
        log::info!("stopping consul agent (pid {:?})", pid);

        #[cfg(unix)]
        if let Some(pid) = pid {
            let _ = crate::runtime::supervisor::signal_tree(pid, nix::sys::signal::Signal::SIGTERM);
        }
        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }

        match tokio::time::timeout(STOP_TIMEOUT, child.wait()).await {
            Ok(_) => log::info!("consul agent stopped"),
            Err(_) => {
                log::warn!("consul agent did not stop gracefully, force killing");
                #[cfg(unix)]
                if let Some(pid) = pid {
                    let _ = crate::runtime::supervisor::signal_tree(
                        pid,
                        nix::sys::signal::Signal::SIGKILL,
                    );
                }
                let _ = child.kill().await;
            }
        }
    }
}

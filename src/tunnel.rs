//! SSH port-forward management for remote speech services.
//!
//! Every configured service living on a remote machine gets a
//! `ssh -N -L port:localhost:port` forward so the broker can reach it on
//! loopback. Forward processes are tracked through PID files on disk and
//! survive portal restarts; `up` is idempotent. A forward that cannot be
//! established is a startup warning, not a fatal error; dependent speech
//! calls fail with their own unavailability errors until it comes up.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;

use crate::config::{Config, TtsBackendConfig};

/// One desired forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    pub service: String,
    pub machine: String,
    pub port: u16,
}

/// Probe result for one forward.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelStatus {
    pub service: String,
    pub machine: String,
    pub port: u16,
    pub pid: Option<u32>,
    pub alive: bool,
    pub port_open: bool,
}

/// Forwards needed by the services section: everything not on `local`.
pub fn required_tunnels(config: &Config) -> Vec<TunnelSpec> {
    let mut specs = Vec::new();
    for (index, backend) in config.services.tts.iter().enumerate() {
        if let TtsBackendConfig::Network {
            machine,
            port: Some(port),
            ..
        } = backend
        {
            if machine != "local" {
                specs.push(TunnelSpec {
                    service: format!("tts{}", index),
                    machine: machine.clone(),
                    port: *port,
                });
            }
        }
    }
    if let Some(stt) = &config.services.stt {
        if stt.machine != "local" {
            if let Some(port) = stt.port {
                specs.push(TunnelSpec {
                    service: "stt".to_string(),
                    machine: stt.machine.clone(),
                    port,
                });
            }
        }
    }
    specs
}

pub struct TunnelManager {
    config: Arc<Config>,
    dir: PathBuf,
}

impl TunnelManager {
    pub fn new(config: Arc<Config>) -> Self {
        let dir = config.tunnels_dir();
        Self { config, dir }
    }

    fn pid_file(&self, spec: &TunnelSpec) -> PathBuf {
        self.dir
            .join(format!("{}-{}.pid", spec.service, spec.machine))
    }

    async fn read_pid(&self, spec: &TunnelSpec) -> Option<u32> {
        let contents = tokio::fs::read_to_string(self.pid_file(spec)).await.ok()?;
        contents.trim().parse().ok()
    }

    async fn pid_alive(pid: u32) -> bool {
        Command::new("kill")
            .args(["-0", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn port_open(port: u16) -> bool {
        tokio::time::timeout(
            Duration::from_secs(1),
            tokio::net::TcpStream::connect(("127.0.0.1", port)),
        )
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
    }

    /// Start any missing forwards. Returns how many were started.
    pub async fn up(&self) -> usize {
        let _ = tokio::fs::create_dir_all(&self.dir).await;
        let mut started = 0;
        for spec in required_tunnels(&self.config) {
            if let Some(pid) = self.read_pid(&spec).await {
                if Self::pid_alive(pid).await {
                    continue;
                }
            }
            match self.start_forward(&spec).await {
                Ok(pid) => {
                    tracing::info!(
                        "forward {} -> {}:{} up (pid {})",
                        spec.port,
                        spec.machine,
                        spec.port,
                        pid
                    );
                    started += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        "could not establish forward for {} on {}: {}",
                        spec.service,
                        spec.machine,
                        e
                    );
                }
            }
        }
        started
    }

    async fn start_forward(&self, spec: &TunnelSpec) -> std::io::Result<u32> {
        let machine = self.config.machines.get(&spec.machine).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("machine '{}' not configured", spec.machine),
            )
        })?;
        let child = Command::new("ssh")
            .args([
                "-N",
                "-o",
                "BatchMode=yes",
                "-o",
                "ExitOnForwardFailure=yes",
                "-o",
                "ServerAliveInterval=30",
                "-L",
                &format!("{}:localhost:{}", spec.port, spec.port),
                &machine.ssh,
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        let pid = child.id().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "forward exited immediately")
        })?;
        tokio::fs::write(self.pid_file(spec), format!("{}\n", pid)).await?;
        Ok(pid)
    }

    /// Kill all tracked forwards and remove their PID files.
    pub async fn down(&self) {
        for spec in required_tunnels(&self.config) {
            if let Some(pid) = self.read_pid(&spec).await {
                let _ = Command::new("kill")
                    .arg(pid.to_string())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await;
            }
            let _ = tokio::fs::remove_file(self.pid_file(&spec)).await;
        }
    }

    /// Probe every required forward.
    pub async fn status(&self) -> Vec<TunnelStatus> {
        let mut statuses = Vec::new();
        for spec in required_tunnels(&self.config) {
            let pid = self.read_pid(&spec).await;
            let alive = match pid {
                Some(pid) => Self::pid_alive(pid).await,
                None => false,
            };
            let port_open = Self::port_open(spec.port).await;
            statuses.push(TunnelStatus {
                service: spec.service,
                machine: spec.machine,
                port: spec.port,
                pid,
                alive,
                port_open,
            });
        }
        statuses
    }

    /// Bounce the forwards for one machine. Returns how many came back.
    pub async fn restart_for_machine(&self, machine: &str) -> usize {
        for spec in required_tunnels(&self.config) {
            if spec.machine != machine {
                continue;
            }
            if let Some(pid) = self.read_pid(&spec).await {
                let _ = Command::new("kill")
                    .arg(pid.to_string())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await;
            }
            let _ = tokio::fs::remove_file(self.pid_file(&spec)).await;
        }
        self.up().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MachineConfig, SttConfig};

    fn config_with_remote_services() -> Config {
        let mut config = Config::default();
        config.machines.insert(
            "gpu1".to_string(),
            MachineConfig {
                ssh: "ops@gpu1.lan".to_string(),
                projects_root: PathBuf::from("/home/ops/projects"),
                channel_limit: 8,
            },
        );
        config.services.tts.push(TtsBackendConfig::Network {
            url: "http://127.0.0.1:5002/synthesize".to_string(),
            machine: "gpu1".to_string(),
            port: Some(5002),
        });
        config.services.tts.push(TtsBackendConfig::Network {
            url: "http://127.0.0.1:5003/synthesize".to_string(),
            machine: "local".to_string(),
            port: Some(5003),
        });
        config.services.stt = Some(SttConfig {
            url: "http://127.0.0.1:5004/transcribe".to_string(),
            machine: "gpu1".to_string(),
            port: Some(5004),
        });
        config
    }

    #[test]
    fn only_remote_services_need_tunnels() {
        let specs = required_tunnels(&config_with_remote_services());
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].service, "tts0");
        assert_eq!(specs[0].port, 5002);
        assert_eq!(specs[1].service, "stt");
        assert_eq!(specs[1].machine, "gpu1");
    }

    #[test]
    fn no_services_no_tunnels() {
        assert!(required_tunnels(&Config::default()).is_empty());
    }

    #[tokio::test]
    async fn status_reports_missing_forwards() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_with_remote_services();
        config.state_dir = dir.path().to_path_buf();
        let manager = TunnelManager::new(Arc::new(config));
        let statuses = manager.status().await;
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| s.pid.is_none() && !s.alive));
    }
}

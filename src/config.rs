//! Portal configuration.
//!
//! Loaded once at startup from an optional YAML file (`agentwire.yaml`) with
//! environment variable overrides for the common knobs. Unknown top-level
//! keys warn and are ignored. All timeouts are overridable; the defaults
//! match the values the rest of the portal assumes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level portal configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen address, e.g. `0.0.0.0:8787`.
    pub bind: String,
    /// Base URL handed to spawned agents via `AGENTWIRE_URL`.
    pub base_url: String,
    /// Root directory containing project checkouts on the local host.
    pub projects_root: PathBuf,
    /// Directory for portal state: room settings, tunnel pids, uploads, audit log.
    pub state_dir: PathBuf,
    /// Remote machines, keyed by machine id.
    pub machines: HashMap<String, MachineConfig>,
    /// Speech services (TTS/STT engines).
    pub services: ServicesConfig,
    /// Agent command composition.
    pub agent: AgentConfig,
    /// Output pump tuning.
    pub pump: PumpConfig,
    /// All portal deadlines.
    pub timeouts: Timeouts,
    /// Command invoked to notify a parent room when a child goes idle,
    /// e.g. `["agentwire-say", "--notify"]`. The parent room id is appended.
    pub notify_command: Option<Vec<String>>,
    /// Directory of role context templates (`{role}.md`).
    pub roles_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8787".to_string(),
            base_url: "http://127.0.0.1:8787".to_string(),
            projects_root: default_projects_root(),
            state_dir: default_state_dir(),
            machines: HashMap::new(),
            services: ServicesConfig::default(),
            agent: AgentConfig::default(),
            pump: PumpConfig::default(),
            timeouts: Timeouts::default(),
            notify_command: None,
            roles_dir: None,
        }
    }
}

fn default_projects_root() -> PathBuf {
    std::env::var("HOME")
        .map(|h| PathBuf::from(h).join("projects"))
        .unwrap_or_else(|_| PathBuf::from("/projects"))
}

fn default_state_dir() -> PathBuf {
    std::env::var("HOME")
        .map(|h| PathBuf::from(h).join(".agentwire"))
        .unwrap_or_else(|_| PathBuf::from("/var/lib/agentwire"))
}

/// A configured remote machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    /// SSH target, `user@host`.
    pub ssh: String,
    /// Projects root on that machine.
    #[serde(default = "default_projects_root")]
    pub projects_root: PathBuf,
    /// Max concurrent channels multiplexed over the control connection.
    #[serde(default = "default_channel_limit")]
    pub channel_limit: usize,
}

fn default_channel_limit() -> usize {
    8
}

/// Speech service endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    /// TTS backends, tried in order.
    pub tts: Vec<TtsBackendConfig>,
    /// STT engine, if any.
    pub stt: Option<SttConfig>,
    /// External transcoder argv for non-PCM uploads. Reads the source from
    /// stdin and writes 16-kHz mono WAV to stdout.
    pub transcoder: Vec<String>,
}

/// One TTS backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TtsBackendConfig {
    /// HTTP engine: JSON in, WAV bytes out.
    Network {
        url: String,
        /// Machine the engine runs on; non-local engines need a tunnel.
        #[serde(default = "local_machine")]
        machine: String,
        #[serde(default)]
        port: Option<u16>,
    },
    /// Local process: text on stdin, WAV on stdout. `{voice}` in the argv is
    /// substituted with the voice id.
    Local { command: Vec<String> },
}

/// STT engine endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    pub url: String,
    #[serde(default = "local_machine")]
    pub machine: String,
    #[serde(default)]
    pub port: Option<u16>,
}

fn local_machine() -> String {
    "local".to_string()
}

/// How the agent command line is composed per permission mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Base agent argv, e.g. `["claude"]`.
    pub command: Vec<String>,
    /// Appended in bypass mode.
    pub bypass_args: Vec<String>,
    /// Appended in restricted mode (points the hook at the policy).
    pub restricted_args: Vec<String>,
    /// Flag that resumes from a conversation state file; the file path is
    /// appended after it.
    pub resume_flag: String,
    /// Where conversation state files live, per project directory. The
    /// project path is encoded into a single directory name.
    pub conversation_root: PathBuf,
    /// Worker pane agent argv (the lightweight agent).
    pub worker_command: Vec<String>,
    /// Max concurrent worker panes per room.
    pub worker_limit: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string()],
            bypass_args: vec!["--dangerously-skip-permissions".to_string()],
            restricted_args: vec![],
            resume_flag: "--resume".to_string(),
            conversation_root: default_state_dir().join("conversations"),
            worker_command: vec!["claude".to_string(), "--model".to_string(), "haiku".to_string()],
            worker_limit: 2,
        }
    }
}

/// Output pump tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpConfig {
    /// Pane snapshot window in lines.
    pub capture_lines: usize,
    /// Capture interval in milliseconds.
    pub interval_ms: u64,
    /// Largest output frame; bigger diffs send only the tail.
    pub max_frame_bytes: usize,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            capture_lines: 400,
            interval_ms: 300,
            max_frame_bytes: 10 * 1024,
        }
    }
}

/// Every deadline the portal honors. Seconds unless noted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub ws_pong_secs: u64,
    pub ws_write_secs: u64,
    pub reconcile_secs: u64,
    pub permission_secs: u64,
    pub tts_secs: u64,
    pub stt_secs: u64,
    pub graceful_exit_secs: u64,
    pub lock_ttl_secs: u64,
    pub idle_after_secs: u64,
    pub question_expiry_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            ws_pong_secs: 60,
            ws_write_secs: 10,
            reconcile_secs: 5,
            permission_secs: 300,
            tts_secs: 60,
            stt_secs: 30,
            graceful_exit_secs: 3,
            lock_ttl_secs: 15,
            idle_after_secs: 10,
            question_expiry_secs: 600,
        }
    }
}

impl Timeouts {
    pub fn permission(&self) -> Duration {
        Duration::from_secs(self.permission_secs)
    }
    pub fn tts(&self) -> Duration {
        Duration::from_secs(self.tts_secs)
    }
    pub fn stt(&self) -> Duration {
        Duration::from_secs(self.stt_secs)
    }
    pub fn graceful_exit(&self) -> Duration {
        Duration::from_secs(self.graceful_exit_secs)
    }
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
    pub fn idle_after(&self) -> Duration {
        Duration::from_secs(self.idle_after_secs)
    }
    pub fn question_expiry(&self) -> Duration {
        Duration::from_secs(self.question_expiry_secs)
    }
}

impl Config {
    /// Load configuration from the given YAML file, falling back to defaults
    /// when no file is present. Unknown top-level keys warn.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match std::env::var("AGENTWIRE_CONFIG") {
                Ok(p) => PathBuf::from(p),
                Err(_) => {
                    let candidate = default_state_dir().join("agentwire.yaml");
                    if !candidate.exists() {
                        tracing::info!("no config file found, using defaults");
                        return Ok(Self::from_env(Self::default()));
                    }
                    candidate
                }
            },
        };

        let contents = std::fs::read_to_string(&path)?;
        let value: serde_yaml::Value = serde_yaml::from_str(&contents)?;
        warn_unknown_keys(&value);
        let config: Config = serde_yaml::from_value(value)?;
        tracing::info!("loaded config from {}", path.display());
        Ok(Self::from_env(config))
    }

    /// Apply environment overrides on top of a loaded config.
    fn from_env(mut config: Config) -> Config {
        if let Ok(bind) = std::env::var("AGENTWIRE_BIND") {
            config.bind = bind;
        }
        if let Ok(url) = std::env::var("AGENTWIRE_URL") {
            config.base_url = url;
        }
        if let Ok(root) = std::env::var("AGENTWIRE_PROJECTS_ROOT") {
            config.projects_root = PathBuf::from(root);
        }
        config
    }

    /// Projects root for a machine id (`local` or a configured remote).
    pub fn projects_root_for(&self, machine: &str) -> PathBuf {
        if machine == "local" {
            self.projects_root.clone()
        } else {
            self.machines
                .get(machine)
                .map(|m| m.projects_root.clone())
                .unwrap_or_else(|| self.projects_root.clone())
        }
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.state_dir.join("uploads")
    }

    pub fn tunnels_dir(&self) -> PathBuf {
        self.state_dir.join("tunnels")
    }

    pub fn rooms_file(&self) -> PathBuf {
        self.state_dir.join("rooms.json")
    }

    pub fn audit_file(&self) -> PathBuf {
        self.state_dir.join("audit.log")
    }
}

const KNOWN_KEYS: &[&str] = &[
    "bind",
    "base_url",
    "projects_root",
    "state_dir",
    "machines",
    "services",
    "agent",
    "pump",
    "timeouts",
    "notify_command",
    "roles_dir",
];

fn warn_unknown_keys(value: &serde_yaml::Value) {
    let Some(map) = value.as_mapping() else {
        return;
    };
    for key in map.keys() {
        if let Some(name) = key.as_str() {
            if !KNOWN_KEYS.contains(&name) {
                tracing::warn!("unknown config key '{}' ignored", name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_portal_assumptions() {
        let t = Timeouts::default();
        assert_eq!(t.permission_secs, 300);
        assert_eq!(t.lock_ttl_secs, 15);
        assert_eq!(t.graceful_exit_secs, 3);
        let p = PumpConfig::default();
        assert_eq!(p.capture_lines, 400);
        assert_eq!(p.interval_ms, 300);
    }

    #[test]
    fn yaml_round_trip_with_machines() {
        let yaml = r#"
bind: "0.0.0.0:9000"
machines:
  gpu1:
    ssh: "ops@gpu1.lan"
services:
  tts:
    - type: network
      url: "http://127.0.0.1:5002/synthesize"
      machine: gpu1
      port: 5002
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.bind, "0.0.0.0:9000");
        assert_eq!(config.machines["gpu1"].ssh, "ops@gpu1.lan");
        assert_eq!(config.machines["gpu1"].channel_limit, 8);
        assert_eq!(config.services.tts.len(), 1);
    }

    #[test]
    fn unknown_keys_do_not_fail() {
        let yaml = "bind: \"1.2.3.4:1\"\nfrobnicate: true\n";
        let value: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        warn_unknown_keys(&value);
        let config: Config = serde_yaml::from_value(value).unwrap();
        assert_eq!(config.bind, "1.2.3.4:1");
    }
}

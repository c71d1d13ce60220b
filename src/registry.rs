//! Canonical room table and multiplexer reconciliation.
//!
//! A room id has three shapes: `name`, `project/branch`, or either with an
//! `@machine` suffix. The registry is the in-memory source of truth for known
//! rooms across all hosts and reconciles itself against the multiplexer: on
//! demand (coalesced per host) and on a timer. Per-room settings that must
//! survive restarts (voice, permission flags, parent, roles) persist as JSON.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{PortalError, Result};
use crate::host::HostId;
use crate::mux::MuxAdapter;

/// Minimum spacing between on-demand reconciles of one host.
const RECONCILE_COALESCE: Duration = Duration::from_secs(2);

fn segment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,49}$").unwrap())
}

/// Permission mode for the agent in a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionMode {
    Bypass,
    Prompted,
    Restricted,
}

impl PermissionMode {
    pub fn from_flags(bypass: bool, restricted: bool) -> Self {
        if restricted {
            Self::Restricted
        } else if bypass {
            Self::Bypass
        } else {
            Self::Prompted
        }
    }
}

/// Canonical room identity: `project[/branch][@machine]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId {
    pub project: String,
    pub branch: Option<String>,
    pub host: HostId,
}

impl RoomId {
    /// Parse a canonical id. Fails with `BadName` on malformed segments.
    pub fn parse(raw: &str) -> Result<Self> {
        let (base, host) = match raw.rsplit_once('@') {
            Some((base, machine)) => {
                if !segment_re().is_match(machine) {
                    return Err(PortalError::BadName(raw.to_string()));
                }
                (base, HostId::parse(machine))
            }
            None => (raw, HostId::Local),
        };

        let (project, branch) = match base.split_once('/') {
            Some((project, branch)) => (project, Some(branch)),
            None => (base, None),
        };

        if !segment_re().is_match(project) {
            return Err(PortalError::BadName(raw.to_string()));
        }
        if let Some(branch) = branch {
            if !segment_re().is_match(branch) {
                return Err(PortalError::BadName(raw.to_string()));
            }
        }

        Ok(Self {
            project: project.to_string(),
            branch: branch.map(|b| b.to_string()),
            host,
        })
    }

    /// Parse a session name as reported by a given host's multiplexer.
    pub fn from_session(name: &str, host: &HostId) -> Result<Self> {
        let mut id = Self::parse(name)?;
        id.host = host.clone();
        Ok(id)
    }

    /// The multiplexer session name on the room's host.
    pub fn session_name(&self) -> String {
        match &self.branch {
            Some(branch) => format!("{}/{}", self.project, branch),
            None => self.project.clone(),
        }
    }

    /// Canonical string; `@local` is elided.
    pub fn canonical(&self) -> String {
        match &self.host {
            HostId::Local => self.session_name(),
            HostId::Remote(machine) => format!("{}@{}", self.session_name(), machine),
        }
    }

    /// Worktree-backed rooms are those with `project/branch` naming.
    pub fn is_worktree(&self) -> bool {
        self.branch.is_some()
    }
}

impl std::fmt::Display for RoomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical())
    }
}

/// A known room (one agent session).
#[derive(Debug, Clone)]
pub struct Room {
    pub id: RoomId,
    /// Working directory of the agent.
    pub path: PathBuf,
    /// Worktree directory, for `project/branch` rooms created by the portal.
    pub worktree: Option<PathBuf>,
    pub mode: PermissionMode,
    pub voice: Option<String>,
    pub roles: Vec<String>,
    /// Parent room for hierarchical idle notifications.
    pub parent: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Room {
    pub fn discovered(id: RoomId, path: PathBuf, settings: &RoomSettings) -> Self {
        Self {
            id,
            path,
            worktree: None,
            mode: PermissionMode::from_flags(settings.bypass_permissions, settings.restricted),
            voice: settings.voice.clone(),
            roles: settings.roles.clone(),
            parent: settings.parent.clone(),
            created_at: Utc::now(),
        }
    }
}

/// Persisted per-room settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    pub bypass_permissions: bool,
    pub restricted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
}

/// Disk-backed store of per-room settings, keyed by canonical id.
pub struct RoomSettingsStore {
    settings: RwLock<HashMap<String, RoomSettings>>,
    storage_path: PathBuf,
}

impl RoomSettingsStore {
    pub async fn load(storage_path: PathBuf) -> Self {
        let settings = match tokio::fs::read_to_string(&storage_path).await {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(map) => map,
                Err(e) => {
                    tracing::warn!(
                        "unreadable room settings at {}: {}, starting empty",
                        storage_path.display(),
                        e
                    );
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self {
            settings: RwLock::new(settings),
            storage_path,
        }
    }

    pub async fn get(&self, id: &str) -> RoomSettings {
        self.settings.read().await.get(id).cloned().unwrap_or_default()
    }

    pub async fn put(&self, id: &str, settings: RoomSettings) {
        {
            let mut guard = self.settings.write().await;
            guard.insert(id.to_string(), settings);
        }
        self.save().await;
    }

    pub async fn remove(&self, id: &str) {
        let removed = {
            let mut guard = self.settings.write().await;
            guard.remove(id).is_some()
        };
        if removed {
            self.save().await;
        }
    }

    async fn save(&self) {
        let serialized = {
            let guard = self.settings.read().await;
            serde_json::to_string_pretty(&*guard)
        };
        let contents = match serialized {
            Ok(c) => c,
            Err(e) => {
                tracing::error!("failed to serialize room settings: {}", e);
                return;
            }
        };
        if let Some(parent) = self.storage_path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        if let Err(e) = tokio::fs::write(&self.storage_path, contents).await {
            tracing::error!(
                "failed to save room settings to {}: {}",
                self.storage_path.display(),
                e
            );
        }
    }
}

/// Registry lifecycle events for hub/pump teardown.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    RoomAdded(String),
    RoomGone(String),
}

/// Patch applied by config POSTs. `None` leaves a field unchanged; an empty
/// `parent` string clears the parent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoomConfigPatch {
    pub voice: Option<String>,
    pub bypass_permissions: Option<bool>,
    pub restricted: Option<bool>,
    pub parent: Option<String>,
}

/// In-memory map of known rooms across all hosts.
pub struct SessionRegistry {
    rooms: RwLock<HashMap<String, Room>>,
    pub settings: RoomSettingsStore,
    mux: Arc<MuxAdapter>,
    config: Arc<Config>,
    events: broadcast::Sender<RegistryEvent>,
    reconcile_stamps: Mutex<HashMap<String, Instant>>,
}

impl SessionRegistry {
    pub async fn new(config: Arc<Config>, mux: Arc<MuxAdapter>) -> Self {
        let settings = RoomSettingsStore::load(config.rooms_file()).await;
        let (events, _) = broadcast::channel(128);
        Self {
            rooms: RwLock::new(HashMap::new()),
            settings,
            mux,
            config,
            events,
            reconcile_stamps: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub async fn get(&self, id: &str) -> Option<Room> {
        self.rooms.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<Room> {
        let mut rooms: Vec<_> = self.rooms.read().await.values().cloned().collect();
        rooms.sort_by(|a, b| a.id.canonical().cmp(&b.id.canonical()));
        rooms
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.rooms.read().await.contains_key(id)
    }

    /// Insert or replace a room and announce it.
    pub async fn put(&self, room: Room) {
        let key = room.id.canonical();
        let added = {
            let mut rooms = self.rooms.write().await;
            rooms.insert(key.clone(), room).is_none()
        };
        if added {
            let _ = self.events.send(RegistryEvent::RoomAdded(key));
        }
    }

    /// Remove a room and announce `room-gone`. `NotFound` when absent, so
    /// racing deletes see exactly one winner.
    pub async fn delete(&self, id: &str) -> Result<Room> {
        let removed = {
            let mut rooms = self.rooms.write().await;
            rooms.remove(id)
        };
        match removed {
            Some(room) => {
                self.settings.remove(id).await;
                let _ = self.events.send(RegistryEvent::RoomGone(id.to_string()));
                Ok(room)
            }
            None => Err(PortalError::NotFound(id.to_string())),
        }
    }

    /// Apply a config patch and persist the settings subset.
    pub async fn update_config(&self, id: &str, patch: RoomConfigPatch) -> Result<Room> {
        let mut settings = self.settings.get(id).await;
        let updated = {
            let mut rooms = self.rooms.write().await;
            let room = rooms
                .get_mut(id)
                .ok_or_else(|| PortalError::NotFound(id.to_string()))?;

            if let Some(voice) = patch.voice {
                room.voice = Some(voice.clone());
                settings.voice = Some(voice);
            }
            if let Some(bypass) = patch.bypass_permissions {
                settings.bypass_permissions = bypass;
            }
            if let Some(restricted) = patch.restricted {
                settings.restricted = restricted;
            }
            room.mode =
                PermissionMode::from_flags(settings.bypass_permissions, settings.restricted);
            if let Some(parent) = patch.parent {
                if parent.is_empty() {
                    room.parent = None;
                    settings.parent = None;
                } else {
                    room.parent = Some(parent.clone());
                    settings.parent = Some(parent);
                }
            }
            room.clone()
        };
        self.settings.put(id, settings).await;
        Ok(updated)
    }

    /// All hosts that may carry sessions: local plus every configured machine.
    pub fn known_hosts(&self) -> Vec<HostId> {
        let mut hosts = vec![HostId::Local];
        hosts.extend(
            self.config
                .machines
                .keys()
                .map(|m| HostId::Remote(m.clone())),
        );
        hosts
    }

    /// Hosts with at least one registered room, plus local (polling the
    /// local multiplexer is cheap). Remote machines with nothing assigned are
    /// left alone until a listing or room resolution reconciles them on
    /// demand.
    pub async fn active_hosts(&self) -> Vec<HostId> {
        let mut hosts = vec![HostId::Local];
        let rooms = self.rooms.read().await;
        for room in rooms.values() {
            if !room.id.host.is_local() && !hosts.contains(&room.id.host) {
                hosts.push(room.id.host.clone());
            }
        }
        hosts
    }

    /// Diff the multiplexer's session list against the registry for one host.
    ///
    /// Coalesced to at most once per 2s per host; pass `force` to bypass the
    /// coalescing (used by the timer loop).
    pub async fn reconcile(&self, host: &HostId, force: bool) -> Result<()> {
        {
            let mut stamps = self.reconcile_stamps.lock().await;
            let now = Instant::now();
            if !force {
                if let Some(last) = stamps.get(host.machine()) {
                    if now.duration_since(*last) < RECONCILE_COALESCE {
                        return Ok(());
                    }
                }
            }
            stamps.insert(host.machine().to_string(), now);
        }

        let sessions = self.mux.list_sessions(host).await?;
        let live: std::collections::HashSet<String> = sessions
            .iter()
            .filter_map(|s| RoomId::from_session(&s.name, host).ok())
            .map(|id| id.canonical())
            .collect();

        // Rooms present in the registry but gone from the multiplexer.
        let stale: Vec<String> = {
            let rooms = self.rooms.read().await;
            rooms
                .values()
                .filter(|r| &r.id.host == host && !live.contains(&r.id.canonical()))
                .map(|r| r.id.canonical())
                .collect()
        };
        for id in stale {
            tracing::info!("session '{}' disappeared from multiplexer", id);
            let _ = self.delete(&id).await;
        }

        // Sessions in the multiplexer but unknown to the registry.
        for entry in &sessions {
            let Ok(id) = RoomId::from_session(&entry.name, host) else {
                // Foreign sessions with unparseable names are not rooms.
                continue;
            };
            let key = id.canonical();
            if self.contains(&key).await {
                continue;
            }
            let path = match self.mux.pane_info(host, &entry.name, 0).await {
                Ok(info) => PathBuf::from(info.cwd),
                Err(_) => self.config.projects_root_for(host.machine()),
            };
            let settings = self.settings.get(&key).await;
            tracing::info!("discovered session '{}' at {}", key, path.display());
            self.put(Room::discovered(id, path, &settings)).await;
        }

        Ok(())
    }

    /// Periodic reconcile of every active host until cancelled.
    pub async fn run_reconcile_loop(self: Arc<Self>, token: CancellationToken) {
        let interval = Duration::from_secs(self.config.timeouts.reconcile_secs);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            for host in self.active_hosts().await {
                if let Err(e) = self.reconcile(&host, true).await {
                    tracing::debug!("reconcile of {} failed: {}", host, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_name() {
        let id = RoomId::parse("api").unwrap();
        assert_eq!(id.project, "api");
        assert_eq!(id.branch, None);
        assert_eq!(id.host, HostId::Local);
        assert_eq!(id.canonical(), "api");
    }

    #[test]
    fn parses_project_branch() {
        let id = RoomId::parse("api/feat-1").unwrap();
        assert_eq!(id.project, "api");
        assert_eq!(id.branch.as_deref(), Some("feat-1"));
        assert_eq!(id.session_name(), "api/feat-1");
        assert!(id.is_worktree());
    }

    #[test]
    fn parses_machine_suffix() {
        let id = RoomId::parse("api/feat@gpu1").unwrap();
        assert_eq!(id.host, HostId::Remote("gpu1".to_string()));
        assert_eq!(id.canonical(), "api/feat@gpu1");
        assert_eq!(id.session_name(), "api/feat");
    }

    #[test]
    fn rejects_bad_segments() {
        for raw in [
            "",
            "a b",
            "api:x",
            "api?x",
            "api/fe at",
            "api@",
            "-api",
            "_api",
            "api/fe/at/x",
            "a\"b",
            "a*b",
            "a<b",
        ] {
            let err = RoomId::parse(raw).unwrap_err();
            assert_eq!(err.kind(), "BadName", "raw={raw:?}");
        }
    }

    #[test]
    fn accepts_max_length_segment() {
        let name = format!("a{}", "b".repeat(49));
        assert!(RoomId::parse(&name).is_ok());
        let too_long = format!("a{}", "b".repeat(50));
        assert!(RoomId::parse(&too_long).is_err());
    }

    #[test]
    fn mode_from_flags() {
        assert_eq!(
            PermissionMode::from_flags(false, false),
            PermissionMode::Prompted
        );
        assert_eq!(
            PermissionMode::from_flags(true, false),
            PermissionMode::Bypass
        );
        // Restricted wins when both are set.
        assert_eq!(
            PermissionMode::from_flags(true, true),
            PermissionMode::Restricted
        );
    }

    #[tokio::test]
    async fn settings_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rooms.json");
        let store = RoomSettingsStore::load(path.clone()).await;
        store
            .put(
                "api",
                RoomSettings {
                    voice: Some("nova".to_string()),
                    bypass_permissions: true,
                    ..Default::default()
                },
            )
            .await;

        let reloaded = RoomSettingsStore::load(path).await;
        let settings = reloaded.get("api").await;
        assert_eq!(settings.voice.as_deref(), Some("nova"));
        assert!(settings.bypass_permissions);
        assert!(!settings.restricted);
    }

    #[tokio::test]
    async fn active_hosts_tracks_registered_rooms_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.state_dir = dir.path().to_path_buf();
        for machine in ["gpu1", "gpu2"] {
            config.machines.insert(
                machine.to_string(),
                crate::config::MachineConfig {
                    ssh: format!("ops@{}.lan", machine),
                    projects_root: PathBuf::from("/home/ops/projects"),
                    channel_limit: 8,
                },
            );
        }
        let config = Arc::new(config);
        let exec = Arc::new(crate::host::HostExecutor::new(Arc::clone(&config)));
        let mux = Arc::new(MuxAdapter::new(exec, &config));
        let registry = SessionRegistry::new(Arc::clone(&config), mux).await;

        // Empty registry: only local is polled, even with machines configured.
        assert_eq!(registry.active_hosts().await, vec![HostId::Local]);
        assert_eq!(registry.known_hosts().len(), 3);

        registry
            .put(Room::discovered(
                RoomId::parse("api@gpu1").unwrap(),
                PathBuf::from("/tmp"),
                &RoomSettings::default(),
            ))
            .await;
        let active = registry.active_hosts().await;
        assert!(active.contains(&HostId::Remote("gpu1".to_string())));
        assert!(!active.contains(&HostId::Remote("gpu2".to_string())));

        registry.delete("api@gpu1").await.unwrap();
        assert_eq!(registry.active_hosts().await, vec![HostId::Local]);
    }

    #[tokio::test]
    async fn settings_remove_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rooms.json");
        let store = RoomSettingsStore::load(path.clone()).await;
        store.put("api", RoomSettings::default()).await;
        store.remove("api").await;
        let reloaded = RoomSettingsStore::load(path).await;
        assert!(reloaded.get("api").await.voice.is_none());
        assert!(!reloaded.settings.read().await.contains_key("api"));
    }
}

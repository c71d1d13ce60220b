//! High-level session lifecycle: `new`, `fork`, `recreate`, `kill`, and
//! worker-pane spawning.
//!
//! Verbs are atomic from the caller's view: anything a failed verb created
//! (worktree, role files) is rolled back before the error surfaces. All verbs
//! on one room are serialized through a per-id lock; verbs on different rooms
//! run in parallel.
//!
//! Worktree-backed rooms (`project/branch`) own a checkout at
//! `{projects_root}/{project}-worktrees/{branch}`; destroying the room
//! removes that directory.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;

use crate::audit::{AuditEvent, AuditLog};
use crate::config::Config;
use crate::error::{PortalError, Result};
use crate::host::{join_escaped, ExecOutput, HostExecutor, HostId};
use crate::mux::MuxAdapter;
use crate::registry::{PermissionMode, Room, RoomId, RoomSettings, SessionRegistry};

/// Parameters for creating a session.
#[derive(Debug, Clone)]
pub struct CreateSpec {
    pub id: RoomId,
    /// Project directory; defaults to `{projects_root}/{project}`.
    pub path: Option<PathBuf>,
    pub mode: PermissionMode,
    pub voice: Option<String>,
    pub roles: Vec<String>,
    pub parent: Option<String>,
    /// Extra agent argv, e.g. a resume flag from `fork`.
    pub extra_args: Vec<String>,
}

impl CreateSpec {
    pub fn new(id: RoomId) -> Self {
        Self {
            id,
            path: None,
            mode: PermissionMode::Prompted,
            voice: None,
            roles: Vec::new(),
            parent: None,
            extra_args: Vec::new(),
        }
    }

    fn from_room(room: &Room) -> Self {
        Self {
            id: room.id.clone(),
            path: None,
            mode: room.mode,
            voice: room.voice.clone(),
            roles: room.roles.clone(),
            parent: room.parent.clone(),
            extra_args: Vec::new(),
        }
    }
}

/// What a worker pane runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaneKind {
    /// The full agent.
    Agent,
    /// The lightweight agent, subject to the per-room concurrency limit.
    Worker,
}

impl PaneKind {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "agent" => Ok(Self::Agent),
            "worker" => Ok(Self::Worker),
            other => Err(PortalError::BadName(format!("pane kind '{}'", other))),
        }
    }
}

pub struct Orchestrator {
    config: Arc<Config>,
    exec: Arc<HostExecutor>,
    mux: Arc<MuxAdapter>,
    registry: Arc<SessionRegistry>,
    audit: Arc<AuditLog>,
    verb_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<Config>,
        exec: Arc<HostExecutor>,
        mux: Arc<MuxAdapter>,
        registry: Arc<SessionRegistry>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            config,
            exec,
            mux,
            registry,
            audit,
            verb_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn verb_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.verb_locks.lock().await;
        Arc::clone(locks.entry(id.to_string()).or_default())
    }

    async fn git(&self, host: &HostId, args: &[&str]) -> Result<ExecOutput> {
        let mut argv = vec!["git".to_string()];
        argv.extend(args.iter().map(|s| s.to_string()));
        self.exec.run(host, &argv, None).await
    }

    /// `{projects_root}/{project}` on the room's host.
    fn project_dir(&self, id: &RoomId) -> PathBuf {
        self.config
            .projects_root_for(id.host.machine())
            .join(&id.project)
    }

    /// `{projects_root}/{project}-worktrees/{branch}`.
    fn worktree_dir(&self, id: &RoomId, branch: &str) -> PathBuf {
        self.config
            .projects_root_for(id.host.machine())
            .join(format!("{}-worktrees", id.project))
            .join(branch)
    }

    /// Is `path` a git repository, and on which branch?
    pub async fn check_path(&self, host: &HostId, path: &str) -> Result<(bool, Option<String>)> {
        let out = self
            .git(host, &["-C", path, "rev-parse", "--abbrev-ref", "HEAD"])
            .await?;
        if out.success() {
            Ok((true, Some(out.stdout_str().trim().to_string())))
        } else {
            Ok((false, None))
        }
    }

    /// Local branch names, optionally filtered by prefix.
    pub async fn check_branches(
        &self,
        host: &HostId,
        path: &str,
        prefix: &str,
    ) -> Result<Vec<String>> {
        let out = self
            .git(
                host,
                &[
                    "-C",
                    path,
                    "for-each-ref",
                    "--format",
                    "%(refname:short)",
                    "refs/heads",
                ],
            )
            .await?;
        if !out.success() {
            return Ok(Vec::new());
        }
        Ok(out
            .stdout_str()
            .lines()
            .map(str::trim)
            .filter(|b| !b.is_empty() && b.starts_with(prefix))
            .map(String::from)
            .collect())
    }

    async fn default_branch(&self, host: &HostId, repo: &str) -> String {
        let out = self
            .git(
                host,
                &["-C", repo, "symbolic-ref", "--short", "refs/remotes/origin/HEAD"],
            )
            .await;
        match out {
            Ok(out) if out.success() => {
                let full = out.stdout_str().trim().to_string();
                full.strip_prefix("origin/").unwrap_or(&full).to_string()
            }
            _ => "main".to_string(),
        }
    }

    async fn branch_exists(&self, host: &HostId, repo: &str, branch: &str) -> bool {
        self.git(
            host,
            &[
                "-C",
                repo,
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{}", branch),
            ],
        )
        .await
        .map(|out| out.success())
        .unwrap_or(false)
    }

    /// Create the worktree checkout for a `project/branch` room. Returns the
    /// worktree directory.
    async fn create_worktree(&self, id: &RoomId, branch: &str) -> Result<PathBuf> {
        let repo = self.project_dir(id);
        let repo_str = repo.to_string_lossy().to_string();
        let (is_git, _) = self.check_path(&id.host, &repo_str).await?;
        if !is_git {
            return Err(PortalError::Conflict(format!(
                "{} is not a git repository",
                repo.display()
            )));
        }

        let dir = self.worktree_dir(id, branch);
        let dir_str = dir.to_string_lossy().to_string();
        let out = if self.branch_exists(&id.host, &repo_str, branch).await {
            self.git(&id.host, &["-C", &repo_str, "worktree", "add", &dir_str, branch])
                .await?
        } else {
            let base = self.default_branch(&id.host, &repo_str).await;
            self.git(
                &id.host,
                &["-C", &repo_str, "worktree", "add", "-b", branch, &dir_str, &base],
            )
            .await?
        };
        if !out.success() {
            let stderr = out.stderr.trim().to_string();
            if stderr.contains("already exists") {
                return Err(PortalError::AlreadyExists(format!("worktree {}", dir.display())));
            }
            return Err(PortalError::Internal(format!("worktree add: {}", stderr)));
        }
        Ok(dir)
    }

    async fn remove_worktree(&self, id: &RoomId, dir: &PathBuf) {
        let repo = self.project_dir(id).to_string_lossy().to_string();
        let dir_str = dir.to_string_lossy().to_string();
        let removed = self
            .git(
                &id.host,
                &["-C", &repo, "worktree", "remove", "--force", &dir_str],
            )
            .await;
        let clean = matches!(&removed, Ok(out) if out.success());
        if !clean {
            // The repo may be gone or the tree dirty beyond --force; take the
            // directory out directly and let git prune the record.
            let _ = self
                .exec
                .run(
                    &id.host,
                    &["rm".to_string(), "-rf".to_string(), dir_str],
                    None,
                )
                .await;
            let _ = self.git(&id.host, &["-C", &repo, "worktree", "prune"]).await;
        }
    }

    /// Write role context files into the working directory. Returns the paths
    /// written, for rollback.
    async fn write_role_files(
        &self,
        host: &HostId,
        cwd: &PathBuf,
        roles: &[String],
    ) -> Result<Vec<String>> {
        let Some(roles_dir) = self.config.roles_dir.clone() else {
            if !roles.is_empty() {
                tracing::warn!("roles requested but no roles_dir configured");
            }
            return Ok(Vec::new());
        };
        let mut written = Vec::new();
        for role in roles {
            let template = roles_dir.join(format!("{}.md", role));
            let contents = match tokio::fs::read(&template).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("role template {} unreadable: {}", template.display(), e);
                    continue;
                }
            };
            let target = cwd.join(format!("{}.md", role.to_uppercase()));
            let target_str = target.to_string_lossy().to_string();
            let out = self
                .exec
                .run(
                    host,
                    &["tee".to_string(), target_str.clone()],
                    Some(&contents),
                )
                .await?;
            if !out.success() {
                return Err(PortalError::Internal(format!(
                    "writing role file {}: {}",
                    target_str,
                    out.stderr.trim()
                )));
            }
            written.push(target_str);
        }
        Ok(written)
    }

    /// Agent command line for a room: environment contract, base argv, mode
    /// flags, any extra args.
    fn compose_command(&self, id: &RoomId, mode: PermissionMode, extra: &[String]) -> String {
        let mut argv = vec![
            "env".to_string(),
            format!("AGENTWIRE_ROOM={}", id.canonical()),
            format!("AGENTWIRE_URL={}", self.config.base_url),
        ];
        argv.extend(self.config.agent.command.iter().cloned());
        match mode {
            PermissionMode::Bypass => argv.extend(self.config.agent.bypass_args.iter().cloned()),
            PermissionMode::Prompted => {}
            PermissionMode::Restricted => {
                argv.extend(self.config.agent.restricted_args.iter().cloned())
            }
        }
        argv.extend(extra.iter().cloned());
        join_escaped(&argv)
    }

    /// Create a session. Rolls back the worktree and any role files on
    /// failure.
    pub async fn create(&self, spec: CreateSpec) -> Result<Room> {
        let key = spec.id.canonical();
        let lock = self.verb_lock(&key).await;
        let _guard = lock.lock().await;

        if self.registry.contains(&key).await
            || self
                .mux
                .has_session(&spec.id.host, &spec.id.session_name())
                .await?
        {
            return Err(PortalError::AlreadyExists(key));
        }

        // Resolve the working directory, creating the worktree when the id
        // carries a branch.
        let mut worktree = None;
        let cwd = match (&spec.id.branch, &spec.path) {
            (Some(branch), _) => {
                let dir = self.create_worktree(&spec.id, branch).await?;
                worktree = Some(dir.clone());
                dir
            }
            (None, Some(path)) => path.clone(),
            (None, None) => self.project_dir(&spec.id),
        };

        let role_files = match self.write_role_files(&spec.id.host, &cwd, &spec.roles).await {
            Ok(files) => files,
            Err(e) => {
                if let Some(dir) = &worktree {
                    self.remove_worktree(&spec.id, dir).await;
                }
                return Err(e);
            }
        };

        let command = self.compose_command(&spec.id, spec.mode, &spec.extra_args);
        let created = self
            .mux
            .new_session(
                &spec.id.host,
                &spec.id.session_name(),
                &cwd.to_string_lossy(),
                &command,
            )
            .await;
        if let Err(e) = created {
            for file in &role_files {
                let _ = self
                    .exec
                    .run(
                        &spec.id.host,
                        &["rm".to_string(), "-f".to_string(), file.clone()],
                        None,
                    )
                    .await;
            }
            if let Some(dir) = &worktree {
                self.remove_worktree(&spec.id, dir).await;
            }
            return Err(e);
        }

        let room = Room {
            id: spec.id.clone(),
            path: cwd.clone(),
            worktree,
            mode: spec.mode,
            voice: spec.voice.clone(),
            roles: spec.roles.clone(),
            parent: spec.parent.clone(),
            created_at: Utc::now(),
        };
        self.registry.put(room.clone()).await;
        self.registry
            .settings
            .put(
                &key,
                RoomSettings {
                    voice: spec.voice,
                    bypass_permissions: spec.mode == PermissionMode::Bypass,
                    restricted: spec.mode == PermissionMode::Restricted,
                    parent: spec.parent,
                    roles: spec.roles,
                },
            )
            .await;

        self.audit
            .record(AuditEvent::SessionCreated {
                session: key,
                path: cwd.to_string_lossy().to_string(),
                machine: spec.id.host.machine().to_string(),
            })
            .await;

        Ok(room)
    }

    /// Kill a session: graceful exit, worktree removal, registry delete.
    /// Racing kills see exactly one winner; the loser gets `NotFound`.
    pub async fn kill(&self, id: &str) -> Result<()> {
        let lock = self.verb_lock(id).await;
        let _guard = lock.lock().await;

        let room = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| PortalError::NotFound(format!("session '{}'", id)))?;

        match self
            .mux
            .kill_session(&room.id.host, &room.id.session_name())
            .await
        {
            Ok(()) | Err(PortalError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let worktree = room.worktree.clone().or_else(|| {
            room.id
                .branch
                .as_deref()
                .map(|b| self.worktree_dir(&room.id, b))
        });
        if let Some(dir) = worktree {
            self.remove_worktree(&room.id, &dir).await;
        }

        self.registry.delete(id).await?;
        self.audit
            .record(AuditEvent::SessionKilled {
                session: id.to_string(),
            })
            .await;
        Ok(())
    }

    /// Fork a session: copy the source's conversation state into the target's
    /// project directory and start the target resuming from it.
    pub async fn fork(&self, source: &str, target_id: RoomId) -> Result<Room> {
        let target_key = target_id.canonical();
        if target_key == source {
            return Err(PortalError::Conflict(
                "fork target must differ from the source".to_string(),
            ));
        }
        let source_room = self
            .registry
            .get(source)
            .await
            .ok_or_else(|| PortalError::NotFound(format!("session '{}'", source)))?;
        if self.registry.contains(&target_key).await {
            return Err(PortalError::AlreadyExists(target_key));
        }

        let mut spec = CreateSpec::from_room(&source_room);
        spec.id = target_id.clone();
        spec.parent = None;

        // Conversation state lives under a per-project directory keyed by the
        // encoded working directory path.
        let source_dir = conversation_dir(
            &self.config.agent.conversation_root,
            &source_room.path.to_string_lossy(),
        );
        let target_path = self.project_dir(&target_id);
        let target_dir =
            conversation_dir(&self.config.agent.conversation_root, &target_path.to_string_lossy());

        if let Some(state_file) = self.latest_state_file(&source_room.id.host, &source_dir).await {
            let file_name = state_file
                .rsplit_once('/')
                .map(|(_, name)| name.to_string())
                .unwrap_or_else(|| state_file.clone());
            let target_file = format!("{}/{}", target_dir.to_string_lossy(), file_name);
            let host = &target_id.host;
            let _ = self
                .exec
                .run(
                    host,
                    &[
                        "mkdir".to_string(),
                        "-p".to_string(),
                        target_dir.to_string_lossy().to_string(),
                    ],
                    None,
                )
                .await;
            let copied = self
                .exec
                .run(
                    host,
                    &["cp".to_string(), state_file.clone(), target_file.clone()],
                    None,
                )
                .await?;
            if copied.success() {
                spec.extra_args = vec![self.config.agent.resume_flag.clone(), target_file];
            } else {
                tracing::warn!(
                    "conversation copy for fork {} -> {} failed: {}",
                    source,
                    target_key,
                    copied.stderr.trim()
                );
            }
        } else {
            tracing::info!("fork {}: no conversation state to copy", source);
        }

        let room = self.create(spec).await?;
        self.audit
            .record(AuditEvent::SessionForked {
                source: source.to_string(),
                target: target_key,
            })
            .await;
        Ok(room)
    }

    async fn latest_state_file(&self, host: &HostId, dir: &PathBuf) -> Option<String> {
        let out = self
            .exec
            .run(
                host,
                &[
                    "ls".to_string(),
                    "-t".to_string(),
                    dir.to_string_lossy().to_string(),
                ],
                None,
            )
            .await
            .ok()?;
        if !out.success() {
            return None;
        }
        out.stdout_str()
            .lines()
            .map(str::trim)
            .find(|name| name.ends_with(".jsonl"))
            .map(|name| format!("{}/{}", dir.to_string_lossy(), name))
    }

    /// Recreate a session in place: kill, refresh the base branch for
    /// worktree-backed rooms, and create again with the same parameters.
    pub async fn recreate(&self, id: &str) -> Result<Room> {
        let room = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| PortalError::NotFound(format!("session '{}'", id)))?;
        let spec = CreateSpec::from_room(&room);

        self.kill(id).await?;

        if let Some(branch) = &room.id.branch {
            let repo = self.project_dir(&room.id).to_string_lossy().to_string();
            let base = self.default_branch(&room.id.host, &repo).await;
            let fetched = self
                .git(&room.id.host, &["-C", &repo, "fetch", "origin", &base])
                .await;
            if let Ok(out) = fetched {
                if !out.success() {
                    tracing::warn!(
                        "fetch of {} before recreating '{}' failed: {}",
                        base,
                        id,
                        out.stderr.trim()
                    );
                }
            }
            tracing::info!("recreating '{}' on branch {}", id, branch);
        }

        let room = self.create(spec).await?;
        self.audit
            .record(AuditEvent::SessionRecreated {
                session: id.to_string(),
            })
            .await;
        Ok(room)
    }

    /// Add a worker pane to a session. The lightweight agent is capped by the
    /// per-room concurrency limit.
    pub async fn spawn_pane(
        &self,
        id: &str,
        kind: PaneKind,
        branch: Option<&str>,
    ) -> Result<u32> {
        let lock = self.verb_lock(id).await;
        let _guard = lock.lock().await;

        let room = self
            .registry
            .get(id)
            .await
            .ok_or_else(|| PortalError::NotFound(format!("session '{}'", id)))?;
        let session = room.id.session_name();

        let command_argv = match kind {
            PaneKind::Agent => self.config.agent.command.clone(),
            PaneKind::Worker => {
                let worker_bin = self
                    .config
                    .agent
                    .worker_command
                    .first()
                    .cloned()
                    .unwrap_or_default();
                let panes = self.mux.list_panes(&room.id.host, &session).await?;
                let running = panes
                    .iter()
                    .filter(|(index, cmd)| *index != 0 && worker_bin.ends_with(cmd.as_str()))
                    .count();
                if running >= self.config.agent.worker_limit {
                    return Err(PortalError::ConcurrencyLimit(format!(
                        "{} worker panes already running in '{}'",
                        running, id
                    )));
                }
                self.config.agent.worker_command.clone()
            }
        };

        // Optional isolated worktree for the pane.
        let mut cwd = room.path.clone();
        let mut created_worktree = None;
        if let Some(branch) = branch {
            let dir = self.create_worktree(&room.id, branch).await?;
            created_worktree = Some(dir.clone());
            cwd = dir;
        }

        let mut argv = vec![
            "env".to_string(),
            format!("AGENTWIRE_ROOM={}", room.id.canonical()),
            format!("AGENTWIRE_URL={}", self.config.base_url),
        ];
        argv.extend(command_argv);
        let command = format!(
            "cd {} && {}",
            crate::host::shell_escape(&cwd.to_string_lossy()),
            join_escaped(&argv)
        );

        match self.mux.spawn_pane(&room.id.host, &session, &command).await {
            Ok(index) => {
                self.audit
                    .record(AuditEvent::PaneSpawned {
                        session: id.to_string(),
                        pane: index,
                    })
                    .await;
                Ok(index)
            }
            Err(e) => {
                if let Some(dir) = created_worktree {
                    self.remove_worktree(&room.id, &dir).await;
                }
                Err(e)
            }
        }
    }
}

/// Encode a working directory into the conversation-state directory name,
/// following the agent's convention of replacing separators with dashes.
fn conversation_dir(root: &PathBuf, cwd: &str) -> PathBuf {
    let encoded: String = cwd
        .chars()
        .map(|c| if c == '/' || c == '.' { '-' } else { c })
        .collect();
    root.join(encoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_orchestrator() -> Orchestrator {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.state_dir = dir.path().to_path_buf();
        config.projects_root = PathBuf::from("/home/u/projects");
        config.base_url = "http://portal:8787".to_string();
        let config = Arc::new(config);
        let exec = Arc::new(HostExecutor::new(Arc::clone(&config)));
        let mux = Arc::new(MuxAdapter::new(Arc::clone(&exec), &config));
        let registry =
            Arc::new(SessionRegistry::new(Arc::clone(&config), Arc::clone(&mux)).await);
        let audit = Arc::new(AuditLog::new(config.audit_file()));
        Orchestrator::new(config, exec, mux, registry, audit)
    }

    #[tokio::test]
    async fn worktree_dir_layout() {
        let orch = test_orchestrator().await;
        let id = RoomId::parse("api/feat").unwrap();
        assert_eq!(
            orch.worktree_dir(&id, "feat"),
            PathBuf::from("/home/u/projects/api-worktrees/feat")
        );
        assert_eq!(orch.project_dir(&id), PathBuf::from("/home/u/projects/api"));
    }

    #[tokio::test]
    async fn compose_command_carries_env_contract() {
        let orch = test_orchestrator().await;
        let id = RoomId::parse("api").unwrap();
        let cmd = orch.compose_command(&id, PermissionMode::Bypass, &[]);
        assert!(cmd.starts_with("env AGENTWIRE_ROOM=api AGENTWIRE_URL="), "{cmd}");
        assert!(cmd.contains("--dangerously-skip-permissions"));

        let prompted = orch.compose_command(&id, PermissionMode::Prompted, &[]);
        assert!(!prompted.contains("--dangerously-skip-permissions"));

        let resumed = orch.compose_command(
            &id,
            PermissionMode::Prompted,
            &["--resume".to_string(), "/tmp/state file.jsonl".to_string()],
        );
        assert!(resumed.ends_with("--resume '/tmp/state file.jsonl'"), "{resumed}");
    }

    #[tokio::test]
    async fn kill_unknown_session_is_not_found() {
        let orch = test_orchestrator().await;
        let err = orch.kill("ghost").await.unwrap_err();
        assert_eq!(err.kind(), "NotFound");
    }

    #[tokio::test]
    async fn fork_onto_itself_conflicts() {
        let orch = test_orchestrator().await;
        let err = orch
            .fork("api", RoomId::parse("api").unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "Conflict");
    }

    #[test]
    fn conversation_dir_encodes_path() {
        let root = PathBuf::from("/home/u/.claude/projects");
        let dir = conversation_dir(&root, "/home/u/projects/api");
        assert_eq!(
            dir,
            PathBuf::from("/home/u/.claude/projects/-home-u-projects-api")
        );
    }

    #[test]
    fn pane_kind_parsing() {
        assert_eq!(PaneKind::parse("worker").unwrap(), PaneKind::Worker);
        assert_eq!(PaneKind::parse("agent").unwrap(), PaneKind::Agent);
        assert!(PaneKind::parse("gpu").is_err());
    }
}

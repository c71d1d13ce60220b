//! Command execution on local and remote hosts.
//!
//! Local commands fork/exec directly. Remote commands ride a persistent SSH
//! control connection per machine (`ControlMaster=auto`), with a bounded
//! number of concurrent channels. A dead control connection is re-established
//! transparently with exponential backoff; only three consecutive dial
//! failures within a short window surface as `HostUnreachable`.
//!
//! Remote command lines are composed from argv vectors with every component
//! shell-escaped. User input is never interpolated into a shell string.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{PortalError, Result};

/// Where a command runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostId {
    Local,
    Remote(String),
}

impl HostId {
    pub fn parse(machine: &str) -> Self {
        if machine.is_empty() || machine == "local" {
            Self::Local
        } else {
            Self::Remote(machine.to_string())
        }
    }

    pub fn machine(&self) -> &str {
        match self {
            Self::Local => "local",
            Self::Remote(name) => name,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local)
    }
}

impl std::fmt::Display for HostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.machine())
    }
}

/// Collected output of a finished command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub exit: i32,
}

impl ExecOutput {
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn success(&self) -> bool {
        self.exit == 0
    }
}

/// Escape one argv component for a POSIX shell.
pub fn shell_escape(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:@%+,".contains(c))
    {
        return arg.to_string();
    }
    let mut escaped = String::with_capacity(arg.len() + 2);
    escaped.push('\'');
    for c in arg.chars() {
        if c == '\'' {
            escaped.push_str("'\\''");
        } else {
            escaped.push(c);
        }
    }
    escaped.push('\'');
    escaped
}

/// Join an argv vector into a single escaped shell command line.
pub fn join_escaped(argv: &[String]) -> String {
    argv.iter()
        .map(|a| shell_escape(a))
        .collect::<Vec<_>>()
        .join(" ")
}

const DIAL_BACKOFF_START: Duration = Duration::from_millis(100);
const DIAL_BACKOFF_MAX: Duration = Duration::from_secs(5);
const DIAL_RETRY_BUDGET: Duration = Duration::from_secs(30);
const DIAL_FAILURE_WINDOW: Duration = Duration::from_secs(10);
const DIAL_FAILURE_LIMIT: u32 = 3;

/// Outcome of recording a dial failure.
#[derive(Debug, PartialEq, Eq)]
enum DialVerdict {
    /// Retry after this delay (jitter not yet applied).
    Retry(Duration),
    /// Three consecutive failures inside the window.
    Unreachable,
}

/// Consecutive-failure bookkeeping for one remote.
#[derive(Debug)]
struct DialWindow {
    failures: u32,
    first_failure: Option<Instant>,
    backoff: Duration,
}

impl DialWindow {
    fn new() -> Self {
        Self {
            failures: 0,
            first_failure: None,
            backoff: DIAL_BACKOFF_START,
        }
    }

    fn record_success(&mut self) {
        self.failures = 0;
        self.first_failure = None;
        self.backoff = DIAL_BACKOFF_START;
    }

    fn record_failure(&mut self, now: Instant) -> DialVerdict {
        match self.first_failure {
            Some(first) if now.duration_since(first) <= DIAL_FAILURE_WINDOW => {
                self.failures += 1;
            }
            _ => {
                self.first_failure = Some(now);
                self.failures = 1;
            }
        }
        if self.failures >= DIAL_FAILURE_LIMIT {
            self.record_success();
            return DialVerdict::Unreachable;
        }
        let delay = self.backoff;
        self.backoff = (self.backoff * 2).min(DIAL_BACKOFF_MAX);
        DialVerdict::Retry(delay)
    }
}

/// ±20% jitter.
fn with_jitter(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    delay.mul_f64(factor)
}

struct RemoteHost {
    ssh_target: String,
    control_path: PathBuf,
    channels: Semaphore,
    dial: Mutex<DialWindow>,
}

impl RemoteHost {
    /// SSH argv prefix sharing the per-host control connection.
    fn ssh_prefix(&self, tty: bool) -> Vec<String> {
        let mut argv = vec!["ssh".to_string()];
        if tty {
            argv.push("-tt".to_string());
        }
        for opt in [
            "ControlMaster=auto".to_string(),
            format!("ControlPath={}", self.control_path.display()),
            "ControlPersist=60".to_string(),
            "BatchMode=yes".to_string(),
            "ConnectTimeout=5".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
        ] {
            argv.push("-o".to_string());
            argv.push(opt);
        }
        argv.push(self.ssh_target.clone());
        argv.push("--".to_string());
        argv
    }
}

/// Input side of a pty attachment.
#[derive(Debug)]
pub enum PtyCommand {
    Input(Vec<u8>),
    Resize { cols: u16, rows: u16 },
}

/// Bidirectional byte channel to a pty-backed process.
pub struct PtyHandle {
    pub input: mpsc::UnboundedSender<PtyCommand>,
    pub output: mpsc::UnboundedReceiver<Vec<u8>>,
    killer: PtyKiller,
}

/// Kill handle for the pty child, detachable from the byte channels.
#[derive(Clone)]
pub struct PtyKiller {
    child: Arc<std::sync::Mutex<Option<Box<dyn portable_pty::Child + Send>>>>,
}

impl PtyKiller {
    pub fn kill(&self) {
        if let Ok(mut guard) = self.child.lock() {
            if let Some(mut child) = guard.take() {
                let _ = child.kill();
            }
        }
    }
}

impl PtyHandle {
    pub fn kill(&self) {
        self.killer.kill();
    }

    /// Break the handle into its input sender, output receiver, and killer.
    pub fn split(
        self,
    ) -> (
        mpsc::UnboundedSender<PtyCommand>,
        mpsc::UnboundedReceiver<Vec<u8>>,
        PtyKiller,
    ) {
        (self.input, self.output, self.killer)
    }
}

/// Runs commands locally or over SSH on configured machines.
pub struct HostExecutor {
    config: Arc<Config>,
    remotes: RwLock<HashMap<String, Arc<RemoteHost>>>,
}

impl HostExecutor {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            remotes: RwLock::new(HashMap::new()),
        }
    }

    async fn remote(&self, machine: &str) -> Result<Arc<RemoteHost>> {
        {
            let remotes = self.remotes.read().await;
            if let Some(remote) = remotes.get(machine) {
                return Ok(Arc::clone(remote));
            }
        }
        let machine_cfg = self
            .config
            .machines
            .get(machine)
            .ok_or_else(|| PortalError::NotFound(format!("machine '{}'", machine)))?;
        let mut remotes = self.remotes.write().await;
        let remote = remotes.entry(machine.to_string()).or_insert_with(|| {
            Arc::new(RemoteHost {
                ssh_target: machine_cfg.ssh.clone(),
                control_path: self
                    .config
                    .state_dir
                    .join(format!("cm-{}.sock", machine)),
                channels: Semaphore::new(machine_cfg.channel_limit),
                dial: Mutex::new(DialWindow::new()),
            })
        });
        Ok(Arc::clone(remote))
    }

    /// Run a command to completion, optionally feeding stdin.
    pub async fn run(
        &self,
        host: &HostId,
        argv: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput> {
        match host {
            HostId::Local => spawn_collect(argv, stdin).await,
            HostId::Remote(machine) => {
                let remote = self.remote(machine).await?;
                self.run_remote(&remote, argv, stdin).await
            }
        }
    }

    async fn run_remote(
        &self,
        remote: &RemoteHost,
        argv: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<ExecOutput> {
        let _permit = remote
            .channels
            .acquire()
            .await
            .map_err(|_| PortalError::internal("ssh channel pool closed"))?;

        let mut ssh_argv = remote.ssh_prefix(false);
        ssh_argv.push(join_escaped(argv));

        let started = Instant::now();
        loop {
            let output = spawn_collect(&ssh_argv, stdin).await?;
            // 255 is ssh's own exit code: dial or transport failure, not the
            // remote command failing.
            if output.exit != 255 {
                remote.dial.lock().await.record_success();
                return Ok(output);
            }
            tracing::debug!(
                target = %remote.ssh_target,
                stderr = %output.stderr.trim(),
                "ssh transport failure, retrying"
            );
            let verdict = remote.dial.lock().await.record_failure(Instant::now());
            match verdict {
                DialVerdict::Unreachable => {
                    return Err(PortalError::HostUnreachable(remote.ssh_target.clone()));
                }
                DialVerdict::Retry(delay) => {
                    if started.elapsed() + delay > DIAL_RETRY_BUDGET {
                        return Err(PortalError::HostUnreachable(remote.ssh_target.clone()));
                    }
                    tokio::time::sleep(with_jitter(delay)).await;
                }
            }
        }
    }

    /// Start a command and stream its stdout. Cancel the returned token to
    /// kill the child.
    pub async fn stream(
        &self,
        host: &HostId,
        argv: &[String],
    ) -> Result<(mpsc::Receiver<bytes::Bytes>, CancellationToken)> {
        let argv = match host {
            HostId::Local => argv.to_vec(),
            HostId::Remote(machine) => {
                let remote = self.remote(machine).await?;
                let mut ssh_argv = remote.ssh_prefix(false);
                ssh_argv.push(join_escaped(argv));
                ssh_argv
            }
        };

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let mut child = cmd
            .spawn()
            .map_err(|e| PortalError::internal(format!("spawn {}: {}", argv[0], e)))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| PortalError::internal("child stdout not captured"))?;

        let (tx, rx) = mpsc::channel(64);
        let token = CancellationToken::new();
        let task_token = token.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 8192];
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => {
                        let _ = child.kill().await;
                        break;
                    }
                    read = stdout.read(&mut buf) => match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if tx.send(bytes::Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                                let _ = child.kill().await;
                                break;
                            }
                        }
                    }
                }
            }
            let _ = child.wait().await;
        });

        Ok((rx, token))
    }

    /// Attach a bidirectional pty to a command (local fork or `ssh -tt`).
    pub async fn attach_pty(
        &self,
        host: &HostId,
        argv: &[String],
        cols: u16,
        rows: u16,
    ) -> Result<PtyHandle> {
        let full_argv = match host {
            HostId::Local => argv.to_vec(),
            HostId::Remote(machine) => {
                let remote = self.remote(machine).await?;
                let mut ssh_argv = remote.ssh_prefix(true);
                ssh_argv.push(join_escaped(argv));
                ssh_argv
            }
        };

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PortalError::internal(format!("openpty: {}", e)))?;

        let mut cmd = CommandBuilder::new(&full_argv[0]);
        for arg in &full_argv[1..] {
            cmd.arg(arg);
        }
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PortalError::internal(format!("spawn pty {}: {}", full_argv[0], e)))?;
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PortalError::internal(format!("pty reader: {}", e)))?;
        let mut writer = pair
            .master
            .take_writer()
            .map_err(|e| PortalError::internal(format!("pty writer: {}", e)))?;

        let (input_tx, mut input_rx) = mpsc::unbounded_channel::<PtyCommand>();
        let (output_tx, output_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let killer = PtyKiller {
            child: Arc::new(std::sync::Mutex::new(Some(child))),
        };

        // Writer/resizer thread owns the master.
        let master = pair.master;
        tokio::task::spawn_blocking(move || {
            use std::io::Write;
            while let Some(msg) = input_rx.blocking_recv() {
                match msg {
                    PtyCommand::Input(data) => {
                        let _ = writer.write_all(&data);
                        let _ = writer.flush();
                    }
                    PtyCommand::Resize { cols, rows } => {
                        let _ = master.resize(PtySize {
                            rows,
                            cols,
                            pixel_width: 0,
                            pixel_height: 0,
                        });
                    }
                }
            }
        });

        // Reader thread.
        tokio::task::spawn_blocking(move || {
            use std::io::Read;
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if output_tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok(PtyHandle {
            input: input_tx,
            output: output_rx,
            killer,
        })
    }
}

async fn spawn_collect(argv: &[String], stdin: Option<&[u8]>) -> Result<ExecOutput> {
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..])
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| PortalError::internal(format!("spawn {}: {}", argv[0], e)))?;

    if let Some(input) = stdin {
        if let Some(mut handle) = child.stdin.take() {
            handle
                .write_all(input)
                .await
                .map_err(|e| PortalError::internal(format!("stdin write: {}", e)))?;
        }
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| PortalError::internal(format!("wait {}: {}", argv[0], e)))?;

    Ok(ExecOutput {
        stdout: output.stdout,
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit: output.status.code().unwrap_or(-1),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_passes_plain_words() {
        assert_eq!(shell_escape("tmux"), "tmux");
        assert_eq!(shell_escape("a-b_c.d/e"), "a-b_c.d/e");
    }

    #[test]
    fn escape_quotes_specials() {
        assert_eq!(shell_escape("a b"), "'a b'");
        assert_eq!(shell_escape("$(rm -rf /)"), "'$(rm -rf /)'");
        assert_eq!(shell_escape("it's"), "'it'\\''s'");
        assert_eq!(shell_escape(""), "''");
    }

    #[test]
    fn join_escapes_each_component() {
        let argv = vec!["echo".to_string(), "hello world".to_string()];
        assert_eq!(join_escaped(&argv), "echo 'hello world'");
    }

    #[test]
    fn dial_window_allows_two_failures() {
        let mut window = DialWindow::new();
        let now = Instant::now();
        assert_eq!(
            window.record_failure(now),
            DialVerdict::Retry(DIAL_BACKOFF_START)
        );
        assert_eq!(
            window.record_failure(now),
            DialVerdict::Retry(DIAL_BACKOFF_START * 2)
        );
        assert_eq!(window.record_failure(now), DialVerdict::Unreachable);
    }

    #[test]
    fn dial_window_resets_outside_window() {
        let mut window = DialWindow::new();
        let start = Instant::now();
        window.record_failure(start);
        window.record_failure(start);
        // A failure past the window restarts the count.
        let later = start + DIAL_FAILURE_WINDOW + Duration::from_secs(1);
        assert!(matches!(
            window.record_failure(later),
            DialVerdict::Retry(_)
        ));
    }

    #[test]
    fn dial_success_clears_state() {
        let mut window = DialWindow::new();
        let now = Instant::now();
        window.record_failure(now);
        window.record_failure(now);
        window.record_success();
        assert!(matches!(window.record_failure(now), DialVerdict::Retry(d) if d == DIAL_BACKOFF_START));
    }

    #[test]
    fn backoff_caps_at_max() {
        let mut window = DialWindow::new();
        let start = Instant::now();
        let mut last = Duration::ZERO;
        for i in 0..12u32 {
            // Keep each failure in a fresh window so the count never trips.
            let t = start + DIAL_FAILURE_WINDOW * (i + 1) + Duration::from_secs(u64::from(i));
            if let DialVerdict::Retry(d) = window.record_failure(t) {
                last = d;
            }
        }
        assert!(last <= DIAL_BACKOFF_MAX);
    }

    #[tokio::test]
    async fn local_run_collects_output() {
        let config = Arc::new(Config::default());
        let exec = HostExecutor::new(config);
        let out = exec
            .run(
                &HostId::Local,
                &["sh".to_string(), "-c".to_string(), "printf hi; exit 3".to_string()],
                None,
            )
            .await
            .unwrap();
        assert_eq!(out.stdout_str(), "hi");
        assert_eq!(out.exit, 3);
    }

    #[tokio::test]
    async fn local_run_feeds_stdin() {
        let config = Arc::new(Config::default());
        let exec = HostExecutor::new(config);
        let out = exec
            .run(
                &HostId::Local,
                &["cat".to_string()],
                Some(b"roundtrip"),
            )
            .await
            .unwrap();
        assert_eq!(out.stdout_str(), "roundtrip");
    }

    #[tokio::test]
    async fn unknown_machine_is_not_found() {
        let config = Arc::new(Config::default());
        let exec = HostExecutor::new(config);
        let err = exec
            .run(&HostId::Remote("nope".to_string()), &["true".to_string()], None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "NotFound");
    }
}

//! Out-of-process contexts speaking JSON lines over stdio.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use plughost_core::{GuestMessage, HostMessage, InstanceId};
use plughost_manifest::{IsolationLimits, Manifest};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::confine::Confinement;
use super::thread::NATIVE_EXTENSION;
use super::{ContextChannels, ContextExit, ContextHandle, ExecutionBackend, LaunchSpec};
use crate::error::{RuntimeError, RuntimeResult};

/// Environment variables passed through to plugin processes.
const ALLOWED_ENV_VARS: &[&str] = &["HOME", "USER", "LANG", "LC_ALL", "LC_CTYPE", "TMPDIR"];

/// `PATH` seen by plugin processes.
const SAFE_PATH_DIRS: &[&str] = &["/usr/bin", "/bin", "/usr/local/bin"];

/// Default resource sampling interval.
const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// Consecutive over-limit CPU samples before the process is killed.
const CPU_STRIKES: u32 = 3;

/// `/proc` reports CPU time in `USER_HZ` ticks, fixed at 100 on Linux.
const TICKS_PER_SECOND: f64 = 100.0;

/// Ceilings enforced on a plugin process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessLimits {
    /// Resident memory ceiling in KiB.
    pub max_rss_kib: Option<u64>,
    /// Sustained CPU ceiling in percent of one core.
    pub max_cpu_percent: Option<u32>,
}

impl From<&IsolationLimits> for ProcessLimits {
    fn from(limits: &IsolationLimits) -> Self {
        Self {
            max_rss_kib: (limits.max_heap_mb > 0).then(|| limits.max_heap_mb.saturating_mul(1024)),
            max_cpu_percent: (limits.max_cpu_percent > 0).then_some(limits.max_cpu_percent),
        }
    }
}

/// Runs each instance as a child process.
///
/// The entry point is started through the interpreter configured for its
/// extension, or executed directly when none is configured. The child gets
/// a cleared environment with a fixed `PATH`, the staged payload as its
/// working directory, piped stdio, and a [`Confinement`] derived from its
/// grants. Its stderr is forwarded to the host log line by line.
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    interpreters: BTreeMap<String, String>,
    sample_interval: Duration,
}

impl ProcessBackend {
    /// Create a backend with an extension → interpreter table.
    #[must_use]
    pub fn new(interpreters: BTreeMap<String, String>) -> Self {
        Self {
            interpreters,
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
        }
    }

    /// Set how often memory and CPU are sampled.
    #[must_use]
    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    fn command(&self, spec: &LaunchSpec) -> (Command, Confinement) {
        let extension = spec.manifest.entry_extension().unwrap_or_default();
        let interpreter = self.interpreters.get(extension).map(Path::new);
        let mut cmd = match interpreter {
            Some(interpreter) => {
                let mut cmd = Command::new(interpreter);
                cmd.arg(&spec.entry);
                cmd
            },
            None => Command::new(&spec.entry),
        };

        cmd.env_clear();
        for var in ALLOWED_ENV_VARS {
            if let Ok(value) = std::env::var(var) {
                cmd.env(var, value);
            }
        }
        cmd.env("PATH", SAFE_PATH_DIRS.join(":"))
            .env("PLUGHOST_INSTANCE", spec.instance.to_string())
            .current_dir(&spec.dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let confinement = Confinement::for_launch(spec, interpreter);
        confinement.apply(&mut cmd);
        (cmd, confinement)
    }
}

impl Default for ProcessBackend {
    fn default() -> Self {
        Self::new(BTreeMap::new())
    }
}

#[async_trait]
impl ExecutionBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    fn supports(&self, manifest: &Manifest) -> bool {
        manifest
            .entry_extension()
            .is_some_and(|ext| ext != NATIVE_EXTENSION)
    }

    async fn launch(&self, spec: LaunchSpec) -> RuntimeResult<ContextChannels> {
        if !spec.entry.is_file() {
            return Err(RuntimeError::EntryPoint {
                entry: spec.entry.display().to_string(),
                reason: "entry point is not a file".to_string(),
            });
        }

        let (mut cmd, confinement) = self.command(&spec);
        debug!(
            instance = %spec.instance,
            rules = confinement.rules().len(),
            address_space = ?confinement.address_space_bytes(),
            "confining plugin process"
        );
        let mut child = cmd.spawn().map_err(|e| {
            RuntimeError::Startup(format!("failed to start {}: {e}", spec.entry.display()))
        })?;
        let pid = child.id();
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(RuntimeError::Startup("child stdio was not captured".to_string()));
        };
        info!(instance = %spec.instance, pid, entry = %spec.entry.display(), "plugin process started");

        let (to_guest, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, from_guest) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = CancellationToken::new();

        tokio::spawn(write_messages(stdin, outbound_rx));
        tokio::spawn(read_messages(spec.instance.clone(), stdout, inbound_tx));
        tokio::spawn(forward_stderr(spec.instance.clone(), stderr));
        tokio::spawn(monitor(
            spec.instance.clone(),
            child,
            ProcessLimits::from(&spec.manifest.isolation_limits),
            self.sample_interval,
            kill.clone(),
            exit_tx,
        ));

        Ok(ContextChannels {
            outbound: to_guest.clone(),
            inbound: from_guest,
            handle: Box::new(ProcessHandle {
                pid,
                to_guest,
                exit: exit_rx,
                kill,
            }),
        })
    }
}

async fn write_messages(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<HostMessage>) {
    while let Some(message) = rx.recv().await {
        let mut line = match serde_json::to_vec(&message) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to encode host message");
                continue;
            },
        };
        line.push(b'\n');
        if stdin.write_all(&line).await.is_err() || stdin.flush().await.is_err() {
            debug!("plugin stdin closed");
            break;
        }
    }
}

async fn read_messages(
    instance: InstanceId,
    stdout: tokio::process::ChildStdout,
    tx: mpsc::UnboundedSender<GuestMessage>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => {},
            Ok(Some(line)) => match serde_json::from_str::<GuestMessage>(&line) {
                Ok(message) => {
                    if tx.send(message).is_err() {
                        break;
                    }
                },
                Err(e) => warn!(instance = %instance, error = %e, "ignoring malformed plugin message"),
            },
            Ok(None) => break,
            Err(e) => {
                warn!(instance = %instance, error = %e, "failed to read plugin stdout");
                break;
            },
        }
    }
}

async fn forward_stderr(instance: InstanceId, stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(target: "plughost::plugin", instance = %instance, stream = "stderr", "{line}");
    }
}

/// Wait for the child, sampling resources until it exits.
async fn monitor(
    instance: InstanceId,
    mut child: Child,
    limits: ProcessLimits,
    interval: Duration,
    kill: CancellationToken,
    exit_tx: watch::Sender<Option<ContextExit>>,
) {
    let pid = child.id();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut sampler = Sampler::new(limits);
    let mut breach: Option<String> = None;
    let mut killed = false;

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            () = kill.cancelled(), if !killed => {
                killed = true;
                let _ = child.start_kill();
            },
            _ = ticker.tick(), if breach.is_none() => {
                if let Some(reason) = pid.and_then(|pid| sampler.sample(pid)) {
                    warn!(instance = %instance, %reason, "plugin exceeded resource limit, killing");
                    breach = Some(reason);
                    let _ = child.start_kill();
                }
            },
        }
    };

    let exit = match (breach, status) {
        (Some(reason), _) => ContextExit::LimitExceeded(reason),
        (None, Ok(status)) if status.success() || killed => ContextExit::Normal,
        (None, Ok(status)) => ContextExit::Crashed(format!("process exited with {status}")),
        (None, Err(e)) => ContextExit::Crashed(format!("failed to wait for process: {e}")),
    };
    debug!(instance = %instance, ?exit, "plugin process exited");
    let _ = exit_tx.send(Some(exit));
}

/// Tracks successive `/proc` samples for one process.
struct Sampler {
    limits: ProcessLimits,
    last: Option<(u64, std::time::Instant)>,
    cpu_strikes: u32,
}

impl Sampler {
    fn new(limits: ProcessLimits) -> Self {
        Self {
            limits,
            last: None,
            cpu_strikes: 0,
        }
    }

    /// Returns a reason when a limit is breached.
    fn sample(&mut self, pid: u32) -> Option<String> {
        let proc_dir = Path::new("/proc").join(pid.to_string());

        if let Some(max) = self.limits.max_rss_kib
            && let Some(rss) = std::fs::read_to_string(proc_dir.join("status"))
                .ok()
                .and_then(|s| resident_kib(&s))
            && rss > max
        {
            return Some(format!("resident memory {rss} KiB exceeds {max} KiB"));
        }

        let max_cpu = self.limits.max_cpu_percent?;
        let ticks = std::fs::read_to_string(proc_dir.join("stat"))
            .ok()
            .and_then(|s| cpu_ticks(&s))?;
        let now = std::time::Instant::now();
        let previous = self.last.replace((ticks, now));
        let (prev_ticks, prev_at) = previous?;
        let percent = cpu_percent(ticks.saturating_sub(prev_ticks), now.duration_since(prev_at));
        if percent > f64::from(max_cpu) {
            self.cpu_strikes = self.cpu_strikes.saturating_add(1);
        } else {
            self.cpu_strikes = 0;
        }
        (self.cpu_strikes >= CPU_STRIKES)
            .then(|| format!("cpu usage {percent:.0}% exceeds {max_cpu}% for {CPU_STRIKES} samples"))
    }
}

#[allow(clippy::cast_precision_loss)]
fn cpu_percent(ticks: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    (ticks as f64 / TICKS_PER_SECOND) / secs * 100.0
}

/// `VmRSS` in KiB from the contents of `/proc/<pid>/status`.
#[must_use]
pub fn resident_kib(status: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|n| n.parse().ok())
}

/// `utime + stime` in ticks from the contents of `/proc/<pid>/stat`.
#[must_use]
pub fn cpu_ticks(stat: &str) -> Option<u64> {
    // The command name may contain spaces and parens; fields resume after
    // the last ')'. utime and stime are fields 14 and 15 overall.
    let rest = &stat[stat.rfind(')')?.saturating_add(1)..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime.saturating_add(stime))
}

struct ProcessHandle {
    pid: Option<u32>,
    to_guest: mpsc::UnboundedSender<HostMessage>,
    exit: watch::Receiver<Option<ContextExit>>,
    kill: CancellationToken,
}

impl ProcessHandle {
    fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }
}

#[async_trait]
impl ContextHandle for ProcessHandle {
    fn exit_signal(&self) -> watch::Receiver<Option<ContextExit>> {
        self.exit.clone()
    }

    async fn terminate(&self, grace: Duration) {
        if self.has_exited() {
            return;
        }
        let _ = self.to_guest.send(HostMessage::Shutdown);
        if let Some(pid) = self.pid {
            send_sigterm(pid);
        }
        let mut exit = self.exit.clone();
        if tokio::time::timeout(grace, exit.wait_for(Option::is_some))
            .await
            .is_ok()
        {
            return;
        }
        warn!(pid = ?self.pid, "plugin process ignored SIGTERM, killing");
        self.kill.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), exit.wait_for(Option::is_some)).await;
    }

    fn pid(&self) -> Option<u32> {
        self.pid
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    if let Ok(raw) = i32::try_from(pid)
        && let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM)
    {
        debug!(pid, error = %e, "SIGTERM failed");
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}

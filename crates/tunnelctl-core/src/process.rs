//! External process helpers
//!
//! Command construction for the tunnel launcher plus pid-based liveness and
//! signalling, used when the supervisor has no in-process handle (adopted
//! tunnels, self-healing status checks).

use std::io;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::model::Tunnel;
use crate::render::ArtifactPaths;

/// Launcher program and argument template
///
/// Arguments may contain `{config}`, `{credentials}`, `{remote_id}` and `{id}`,
/// substituted per tunnel at spawn time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    pub program: String,
    pub args: Vec<String>,
}

impl Default for CommandTemplate {
    fn default() -> Self {
        Self::cloudflared("cloudflared")
    }
}

impl CommandTemplate {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// `<binary> tunnel --config {config} run {remote_id}`
    pub fn cloudflared(binary: impl Into<String>) -> Self {
        Self::new(
            binary,
            ["tunnel", "--config", "{config}", "run", "{remote_id}"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        )
    }

    pub fn render_args(&self, tunnel: &Tunnel, paths: &ArtifactPaths) -> Vec<String> {
        let config = paths.config.display().to_string();
        let credentials = paths.credentials.display().to_string();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{config}", &config)
                    .replace("{credentials}", &credentials)
                    .replace("{remote_id}", &tunnel.remote_id)
                    .replace("{id}", &tunnel.id)
            })
            .collect()
    }

    /// Command with piped output, ready to spawn
    pub fn command(&self, tunnel: &Tunnel, paths: &ArtifactPaths) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(self.render_args(tunnel, paths))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }
}

/// Start-time token of a process, `None` when unavailable
///
/// On Linux this is field 22 of `/proc/<pid>/stat` (clock ticks since boot).
pub fn start_fingerprint(pid: u32) -> Option<u64> {
    proc_stat(pid).map(|(_, start_time)| start_time)
}

#[cfg(target_os = "linux")]
fn proc_stat(pid: u32) -> Option<(char, u64)> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // comm may contain spaces and parens; fields resume after the last ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let state = fields.first()?.chars().next()?;
    let start_time = fields.get(19)?.parse().ok()?;
    Some((state, start_time))
}

#[cfg(not(target_os = "linux"))]
fn proc_stat(_pid: u32) -> Option<(char, u64)> {
    None
}

#[cfg(unix)]
fn to_pid(pid: u32) -> Option<libc::pid_t> {
    // 0 and negative values address process groups
    if pid == 0 || pid > i32::MAX as u32 {
        None
    } else {
        Some(pid as libc::pid_t)
    }
}

/// Whether `pid` refers to a live process
///
/// When `fingerprint` is given and the current start time can be read, it
/// must match; otherwise the pid has been reused by another process.
#[cfg(unix)]
pub fn is_alive(pid: u32, fingerprint: Option<u64>) -> bool {
    let Some(raw) = to_pid(pid) else {
        return false;
    };

    // SAFETY: signal 0 performs only the existence and permission check.
    let exists = unsafe { libc::kill(raw, 0) } == 0
        || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    if !exists {
        return false;
    }

    match proc_stat(pid) {
        Some(('Z', _)) => false,
        Some((_, current)) => fingerprint.map_or(true, |expected| expected == current),
        None => true,
    }
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32, _fingerprint: Option<u64>) -> bool {
    false
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let raw = to_pid(pid).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("invalid pid {}", pid))
    })?;
    // SAFETY: raw is a positive pid, so only that single process is signalled.
    if unsafe { libc::kill(raw, signal) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Ask a process to exit
#[cfg(unix)]
pub fn terminate(pid: u32) -> io::Result<()> {
    send_signal(pid, libc::SIGTERM)
}

#[cfg(unix)]
pub fn force_kill(pid: u32) -> io::Result<()> {
    send_signal(pid, libc::SIGKILL)
}

#[cfg(not(unix))]
pub fn terminate(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "signalling processes by pid is not supported on this platform",
    ))
}

#[cfg(not(unix))]
pub fn force_kill(pid: u32) -> io::Result<()> {
    terminate(pid)
}

/// Poll every 100ms until the process is gone; `true` if it exited in time
pub async fn wait_for_exit(pid: u32, fingerprint: Option<u64>, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !is_alive(pid, fingerprint) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

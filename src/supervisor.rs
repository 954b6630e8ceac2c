//! Launches a child under a given UID/GID with rlimits, a wall-clock
//! timeout, and stdio pipes; collects its exit status; delivers signals;
//! enforces output-size caps.
//!
//! The fork/setuid/setrlimit/setpgid/exec sequence runs as a `pre_exec`
//! closure (the portable equivalent of a raw zygote fork). The concurrent
//! drain/feed/watchdog loop is a `tokio::select!` over the child's piped
//! stdio, a deadline sleep, and an mpsc channel of signal requests: three
//! producer tasks plus one watchdog, joined by a single completion point.

use std::{
    ffi::OsString,
    os::unix::process::ExitStatusExt,
    path::PathBuf,
    time::{Duration, Instant},
};

use nix::sys::signal::Signal;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    process::Command,
    sync::mpsc,
};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to launch {path}")]
    Launch {
        path: PathBuf,
        #[source]
        cause: std::io::Error,
    },
    #[error("failed to reap child process")]
    Wait(#[source] std::io::Error),
}

/// Resource caps enforced for a single phase.
#[derive(Debug, Clone)]
pub struct Limits {
    pub wall_ms: u64,
    /// `None` means no `RLIMIT_AS` is applied (still subject to whatever
    /// ceiling the caller already folded in).
    pub memory_bytes: Option<u64>,
    pub max_output_bytes: usize,
    pub max_processes: u64,
    pub max_open_files: u64,
    pub max_file_size_bytes: u64,
}

/// Where a phase's stdin comes from.
pub enum StdinSource {
    /// Batch mode: a finite buffer, written then closed.
    Buffer(Vec<u8>),
    /// Interactive mode: a channel of chunks, closed (dropped) on producer EOF.
    Channel(mpsc::UnboundedReceiver<Vec<u8>>),
}

/// A live stdout/stderr chunk, for interactive republishing on the event bus.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// `{ stdout, stderr, combined_output, exit_code, signal, wall_ms, message }`
/// as specified. Exactly one of `exit_code`/`signal` is set for a process
/// that actually started; both `None` with `message` set means launch failed.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PhaseResult {
    pub stdout: String,
    pub stderr: String,
    pub combined_output: String,
    pub exit_code: Option<i64>,
    pub signal: Option<String>,
    pub wall_ms: u64,
    pub message: Option<String>,
}

pub struct RunRequest {
    pub cmd: PathBuf,
    pub argv: Vec<OsString>,
    pub cwd: PathBuf,
    pub env: Vec<(OsString, OsString)>,
    pub uid: u32,
    pub gid: u32,
    pub stdin: StdinSource,
    pub limits: Limits,
    /// Live stdout/stderr chunks, for interactive mode. `None` in batch mode.
    pub events: Option<mpsc::UnboundedSender<SupervisorEvent>>,
    /// Asynchronous signal-delivery requests for the running phase.
    pub signals: Option<mpsc::UnboundedReceiver<Signal>>,
}

/// Runs `cmd` to completion under the given limits, draining stdout/stderr
/// concurrently with feeding stdin so the child is never blocked by a full
/// pipe, and enforcing `limits.wall_ms` with a `SIGKILL` to the whole
/// process group on expiry.
pub async fn run(request: RunRequest) -> Result<PhaseResult, SupervisorError> {
    let RunRequest {
        cmd,
        argv,
        cwd,
        env,
        uid,
        gid,
        stdin,
        limits,
        events,
        mut signals,
    } = request;

    let mut command = Command::new(&cmd);
    command
        .args(&argv)
        .current_dir(&cwd)
        .env_clear()
        .envs(env)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);

    apply_pre_exec(&mut command, uid, gid, &limits);

    let started = Instant::now();
    let mut child = match command.spawn() {
        Ok(c) => c,
        Err(cause) => {
            return Ok(PhaseResult {
                message: Some(format!("failed to launch {}: {cause}", cmd.display())),
                wall_ms: started.elapsed().as_millis() as u64,
                ..Default::default()
            });
        }
    };
    let pid = child
        .id()
        .ok_or_else(|| SupervisorError::Wait(std::io::Error::other("child has no pid")))?
        as i32;

    let mut child_stdin = child.stdin.take();
    let mut stdout_reader = child.stdout.take().expect("stdout was piped");
    let mut stderr_reader = child.stderr.take().expect("stderr was piped");

    // Batch stdin is written by a detached task so a pipe-buffer-sized
    // payload can't deadlock against the read loop below.
    if let StdinSource::Buffer(buf) = &stdin {
        if let Some(mut pipe) = child_stdin.take() {
            let buf = buf.clone();
            tokio::spawn(async move {
                let _ = pipe.write_all(&buf).await;
                let _ = pipe.shutdown().await;
            });
        }
    }
    let mut stdin_channel = match stdin {
        StdinSource::Channel(rx) => Some(rx),
        StdinSource::Buffer(_) => None,
    };

    let deadline = tokio::time::sleep(Duration::from_millis(limits.wall_ms));
    tokio::pin!(deadline);

    let mut stdout_buf: Vec<u8> = Vec::new();
    let mut stderr_buf: Vec<u8> = Vec::new();
    let mut combined: Vec<u8> = Vec::new();
    let combined_cap = limits.max_output_bytes.saturating_mul(2);
    let mut stdout_open = true;
    let mut stderr_open = true;
    let mut read_buf = [0u8; 8192];
    let mut timed_out = false;
    let mut exit_status = None;

    loop {
        if !stdout_open && !stderr_open {
            exit_status = Some(child.wait().await.map_err(SupervisorError::Wait)?);
            break;
        }
        tokio::select! {
            biased;
            status = child.wait(), if stdout_open || stderr_open => {
                // Keep draining whatever is already buffered in the pipes
                // before treating the process as gone.
                match status {
                    Ok(s) => { exit_status = Some(s); }
                    Err(e) => return Err(SupervisorError::Wait(e)),
                }
                drain_remaining(&mut stdout_reader, &mut stdout_buf, &mut combined, combined_cap, limits.max_output_bytes, &events, true).await;
                drain_remaining(&mut stderr_reader, &mut stderr_buf, &mut combined, combined_cap, limits.max_output_bytes, &events, false).await;
                break;
            }
            result = stdout_reader.read(&mut read_buf), if stdout_open => {
                match result {
                    Ok(0) => stdout_open = false,
                    Ok(n) => record_chunk(&read_buf[..n], &mut stdout_buf, &mut combined, combined_cap, limits.max_output_bytes, &events, true),
                    Err(_) => stdout_open = false,
                }
            }
            result = stderr_reader.read(&mut read_buf), if stderr_open => {
                match result {
                    Ok(0) => stderr_open = false,
                    Ok(n) => record_chunk(&read_buf[..n], &mut stderr_buf, &mut combined, combined_cap, limits.max_output_bytes, &events, false),
                    Err(_) => stderr_open = false,
                }
            }
            chunk = recv_stdin(&mut stdin_channel) => {
                match chunk {
                    Some(bytes) => {
                        if let Some(pipe) = child_stdin.as_mut() {
                            let _ = pipe.write_all(&bytes).await;
                        }
                    }
                    None => {
                        // The channel is closed for good; drop it so the next
                        // iteration's `recv_stdin` call falls through to the
                        // `pending()` arm instead of winning the biased select
                        // on every poll and starving `recv_signal`/`deadline`.
                        stdin_channel = None;
                        child_stdin.take();
                    }
                }
            }
            sig = recv_signal(&mut signals) => {
                match sig {
                    Some(sig) => {
                        nix::sys::signal::kill(nix::unistd::Pid::from_raw(-pid), sig).ok();
                    }
                    // Same fusing as the stdin channel above: a closed signal
                    // channel must not keep winning the biased select forever,
                    // or the deadline branch after it would starve.
                    None => signals = None,
                }
            }
            _ = &mut deadline => {
                timed_out = true;
                nix::sys::signal::kill(nix::unistd::Pid::from_raw(-pid), Signal::SIGKILL).ok();
                exit_status = Some(child.wait().await.map_err(SupervisorError::Wait)?);
                break;
            }
        }
    }

    // Mop up any surviving descendants of the process group unconditionally.
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(-pid), Signal::SIGKILL).ok();

    let wall_ms = started.elapsed().as_millis() as u64;
    let (exit_code, signal) = if timed_out {
        (None, Some("SIGKILL".to_string()))
    } else {
        match exit_status {
            Some(status) => (status.code().map(i64::from), status.signal().map(signal_name)),
            None => (None, None),
        }
    };

    Ok(PhaseResult {
        stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
        stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
        combined_output: String::from_utf8_lossy(&combined).into_owned(),
        exit_code,
        signal,
        wall_ms,
        message: if timed_out { Some("timeout".to_string()) } else { None },
    })
}

async fn recv_stdin(channel: &mut Option<mpsc::UnboundedReceiver<Vec<u8>>>) -> Option<Vec<u8>> {
    match channel {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn recv_signal(channel: &mut Option<mpsc::UnboundedReceiver<Signal>>) -> Option<Signal> {
    match channel {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[allow(clippy::too_many_arguments)]
fn record_chunk(
    chunk: &[u8],
    buf: &mut Vec<u8>,
    combined: &mut Vec<u8>,
    combined_cap: usize,
    cap: usize,
    events: &Option<mpsc::UnboundedSender<SupervisorEvent>>,
    is_stdout: bool,
) {
    if let Some(tx) = events {
        let event = if is_stdout {
            SupervisorEvent::Stdout(chunk.to_vec())
        } else {
            SupervisorEvent::Stderr(chunk.to_vec())
        };
        let _ = tx.send(event);
    }
    if buf.len() < cap {
        let remaining = cap - buf.len();
        buf.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
    }
    if combined.len() < combined_cap {
        let remaining = combined_cap - combined.len();
        combined.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
    }
}

#[allow(clippy::too_many_arguments)]
async fn drain_remaining(
    reader: &mut (impl tokio::io::AsyncRead + Unpin),
    buf: &mut Vec<u8>,
    combined: &mut Vec<u8>,
    combined_cap: usize,
    cap: usize,
    events: &Option<mpsc::UnboundedSender<SupervisorEvent>>,
    is_stdout: bool,
) {
    let mut scratch = [0u8; 8192];
    loop {
        match tokio::time::timeout(Duration::from_millis(50), reader.read(&mut scratch)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => record_chunk(&scratch[..n], buf, combined, combined_cap, cap, events, is_stdout),
            Ok(Err(_)) => break,
        }
    }
}

fn signal_name(signum: i32) -> String {
    Signal::try_from(signum)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("SIG{signum}"))
}

fn apply_pre_exec(command: &mut Command, uid: u32, gid: u32, limits: &Limits) {
    let memory_bytes = limits.memory_bytes;
    let max_processes = limits.max_processes;
    let max_open_files = limits.max_open_files;
    let max_file_size_bytes = limits.max_file_size_bytes;

    // SAFETY: only async-signal-safe syscalls (setgid/setuid/setrlimit/setpgid)
    // run in the child between fork and exec.
    unsafe {
        command.pre_exec(move || {
            if libc::setpgid(0, 0) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::setgid(gid) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::setuid(uid) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            if let Some(bytes) = memory_bytes {
                set_rlimit(libc::RLIMIT_AS, bytes)?;
                set_rlimit(libc::RLIMIT_DATA, bytes)?;
            }
            set_rlimit(libc::RLIMIT_NPROC, max_processes)?;
            set_rlimit(libc::RLIMIT_NOFILE, max_open_files)?;
            set_rlimit(libc::RLIMIT_FSIZE, max_file_size_bytes)?;
            Ok(())
        });
    }
}

fn set_rlimit(resource: libc::c_int, value: u64) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: value,
        rlim_max: value,
    };
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> Limits {
        Limits {
            wall_ms: 2_000,
            memory_bytes: Some(256 * 1024 * 1024),
            max_output_bytes: 1 << 16,
            max_processes: 16,
            max_open_files: 64,
            max_file_size_bytes: 1 << 20,
        }
    }

    fn current_uid_gid() -> (u32, u32) {
        (
            nix::unistd::Uid::current().as_raw(),
            nix::unistd::Gid::current().as_raw(),
        )
    }

    #[tokio::test]
    async fn echoes_stdout_and_exits_zero() {
        let (uid, gid) = current_uid_gid();
        let result = run(RunRequest {
            cmd: PathBuf::from("/bin/echo"),
            argv: vec!["hello".into()],
            cwd: std::env::temp_dir(),
            env: vec![],
            uid,
            gid,
            stdin: StdinSource::Buffer(Vec::new()),
            limits: limits(),
            events: None,
            signals: None,
        })
        .await
        .unwrap();
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.signal, None);
    }

    #[tokio::test]
    async fn timeout_kills_with_sigkill() {
        let (uid, gid) = current_uid_gid();
        let mut l = limits();
        l.wall_ms = 200;
        let result = run(RunRequest {
            cmd: PathBuf::from("/bin/sleep"),
            argv: vec!["10".into()],
            cwd: std::env::temp_dir(),
            env: vec![],
            uid,
            gid,
            stdin: StdinSource::Buffer(Vec::new()),
            limits: l,
            events: None,
            signals: None,
        })
        .await
        .unwrap();
        assert_eq!(result.signal.as_deref(), Some("SIGKILL"));
        assert_eq!(result.message.as_deref(), Some("timeout"));
        assert!(result.wall_ms >= 200);
    }

    #[tokio::test]
    async fn missing_binary_yields_launch_message() {
        let (uid, gid) = current_uid_gid();
        let result = run(RunRequest {
            cmd: PathBuf::from("/no/such/binary"),
            argv: vec![],
            cwd: std::env::temp_dir(),
            env: vec![],
            uid,
            gid,
            stdin: StdinSource::Buffer(Vec::new()),
            limits: limits(),
            events: None,
            signals: None,
        })
        .await
        .unwrap();
        assert!(result.message.is_some());
        assert_eq!(result.exit_code, None);
        assert_eq!(result.signal, None);
    }
}

//! Orchestrates a single request: stages files, runs compile then run phase
//! through the Isolation Provider and Process Supervisor, exposes a batch
//! and an interactive execution mode, and cleans up on every exit path.
//!
//! State machine: `Created --prime--> Primed --execute*--> Done --cleanup-->
//! Cleaned`. From any non-Cleaned state, `cleanup()` is a legal transition
//! directly to Cleaned (the abort path for client disconnect or a failed
//! phase). The slot is represented as `Option<Slot>`, handed to the Job at
//! `prime` and handed back at `cleanup`: double-cleanup is a no-op because
//! `Option::take` only yields the slot once.

use std::{
    ffi::OsString,
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use nix::sys::signal::Signal;
use tokio::sync::mpsc;

use crate::{
    bus::{BusEvent, EventBus, Stage},
    isolation::{IsolationError, IsolationProvider, Slot},
    registry::RuntimeDescriptor,
    supervisor::{self, Limits, PhaseResult, RunRequest, StdinSource, SupervisorError},
};

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("file path escapes the sandbox root: {0}")]
    PathEscape(PathBuf),
    #[error("request has no files")]
    NoFiles,
    #[error(transparent)]
    Isolation(#[from] IsolationError),
    #[error("failed to stage file {path}")]
    Stage {
        path: PathBuf,
        #[source]
        cause: std::io::Error,
    },
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error("operation is not valid in state {0:?}")]
    InvalidState(JobState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Created,
    Primed,
    Executing,
    Done,
    Cleaned,
}

#[derive(Debug, Clone)]
pub struct FileEntry {
    /// Relative path; validated at `prime` to stay within the slot root.
    pub path: PathBuf,
    pub content: Vec<u8>,
    pub executable: bool,
}

#[derive(Debug, Clone)]
pub struct JobRequest {
    pub alias: String,
    pub args: Vec<String>,
    pub files: Vec<FileEntry>,
    pub compile_ms: u64,
    pub run_ms: u64,
    /// `None` means unlimited, subject to the engine's memory ceiling.
    pub compile_bytes: Option<u64>,
    pub run_bytes: Option<u64>,
    pub max_output_bytes: usize,
    /// Batch-mode stdin. Ignored by `execute_interactive`.
    pub stdin: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub language: String,
    pub version: String,
    pub compile: Option<PhaseResult>,
    pub run: Option<PhaseResult>,
}

pub struct Job {
    state: JobState,
    runtime: Arc<RuntimeDescriptor>,
    request: JobRequest,
    isolation: Arc<IsolationProvider>,
    memory_ceiling_bytes: u64,
    max_processes: u64,
    max_open_files: u64,
    max_file_size_bytes: u64,
    slot: Option<Slot>,
    entry_point: Option<String>,
}

impl Job {
    pub fn new(
        runtime: Arc<RuntimeDescriptor>,
        request: JobRequest,
        isolation: Arc<IsolationProvider>,
        memory_ceiling_bytes: u64,
    ) -> Job {
        Job {
            state: JobState::Created,
            runtime,
            request,
            isolation,
            memory_ceiling_bytes,
            max_processes: 16,
            max_open_files: 64,
            max_file_size_bytes: 16 * 1024 * 1024,
            slot: None,
            entry_point: None,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Acquires a sandbox slot and stages every requested file into it.
    /// On any staging failure the slot is released before returning, so the
    /// Job is left in `Created`, not leaked mid-prime.
    pub fn prime(&mut self) -> Result<(), JobError> {
        if self.state != JobState::Created {
            return Err(JobError::InvalidState(self.state));
        }
        if self.request.files.is_empty() {
            return Err(JobError::NoFiles);
        }

        let slot = self.isolation.acquire()?;
        match self.stage_files(&slot) {
            Ok(entry_point) => {
                self.entry_point = Some(entry_point);
                self.slot = Some(slot);
                self.state = JobState::Primed;
                Ok(())
            }
            Err(e) => {
                self.isolation.release(slot);
                Err(e)
            }
        }
    }

    fn stage_files(&self, slot: &Slot) -> Result<String, JobError> {
        let mut entry_point = None;
        for (index, file) in self.request.files.iter().enumerate() {
            let dest = safe_join(&slot.dir, &file.path)?;
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).map_err(|cause| JobError::Stage {
                    path: dest.clone(),
                    cause,
                })?;
            }
            std::fs::write(&dest, &file.content).map_err(|cause| JobError::Stage {
                path: dest.clone(),
                cause,
            })?;
            let make_executable = index == 0 || file.executable;
            if make_executable {
                use std::os::unix::fs::PermissionsExt;
                let mut perms = std::fs::metadata(&dest)
                    .map_err(|cause| JobError::Stage {
                        path: dest.clone(),
                        cause,
                    })?
                    .permissions();
                perms.set_mode(perms.mode() | 0o111);
                std::fs::set_permissions(&dest, perms).map_err(|cause| JobError::Stage {
                    path: dest.clone(),
                    cause,
                })?;
            }
            if index == 0 {
                entry_point = dest.file_name().map(|n| n.to_string_lossy().into_owned());
            }
        }
        entry_point.ok_or(JobError::NoFiles)
    }

    /// Batch mode: runs compile (if the runtime has one) then run, returning
    /// both phase results. A failed compile skips run entirely.
    pub async fn execute(&mut self) -> Result<ExecutionResult, JobError> {
        self.begin_execute()?;
        let result = self.run_phases(None).await;
        self.state = JobState::Done;
        result
    }

    /// Interactive mode: identical phase sequence, but stdout/stderr/stage/exit
    /// are republished on `bus`, run-phase stdin is sourced from `bus`, and
    /// `signal` messages on `bus` are forwarded to whichever phase is running.
    pub async fn execute_interactive(&mut self, bus: &EventBus) -> Result<ExecutionResult, JobError> {
        self.begin_execute()?;
        let result = self.run_phases(Some(bus)).await;
        self.state = JobState::Done;
        result
    }

    fn begin_execute(&mut self) -> Result<(), JobError> {
        if self.state != JobState::Primed {
            return Err(JobError::InvalidState(self.state));
        }
        self.state = JobState::Executing;
        Ok(())
    }

    async fn run_phases(&mut self, bus: Option<&EventBus>) -> Result<ExecutionResult, JobError> {
        let slot = self.slot.as_ref().expect("run_phases called without a primed slot");
        let entry_point = self.entry_point.clone().expect("run_phases called without an entry point");

        let mut compile_result = None;
        if let Some(compile_script) = &self.runtime.compile_script {
            let argv = self
                .request
                .files
                .iter()
                .filter_map(|f| f.path.file_name())
                .map(OsString::from)
                .collect();
            let limits = self.limits_for(self.request.compile_ms, self.request.compile_bytes);
            let result = self
                .run_phase(Stage::Compile, compile_script, argv, slot, limits, Vec::new(), bus, false)
                .await?;
            let failed = result.exit_code.map_or(true, |c| c != 0) || result.signal.is_some();
            compile_result = Some(result);
            if failed {
                return Ok(ExecutionResult {
                    language: self.runtime.language.clone(),
                    version: self.runtime.version.to_string(),
                    compile: compile_result,
                    run: None,
                });
            }
        }

        let mut argv = vec![OsString::from(entry_point)];
        argv.extend(self.request.args.iter().map(|s| OsString::from(s.as_str())));
        let limits = self.limits_for(self.request.run_ms, self.request.run_bytes);
        let stdin = std::mem::take(&mut self.request.stdin);
        let run_result = self
            .run_phase(Stage::Run, &self.runtime.run_script.clone(), argv, slot, limits, stdin, bus, true)
            .await?;

        Ok(ExecutionResult {
            language: self.runtime.language.clone(),
            version: self.runtime.version.to_string(),
            compile: compile_result,
            run: Some(run_result),
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_phase(
        &self,
        stage: Stage,
        script: &Path,
        argv: Vec<OsString>,
        slot: &Slot,
        limits: Limits,
        batch_stdin: Vec<u8>,
        bus: Option<&EventBus>,
        accepts_interactive_stdin: bool,
    ) -> Result<PhaseResult, JobError> {
        if let Some(bus) = bus {
            bus.publish(BusEvent::Stage(stage));
        }

        let mut env: Vec<(OsString, OsString)> = self
            .runtime
            .base_env
            .iter()
            .map(|(k, v)| (OsString::from(k.as_str()), OsString::from(v.as_str())))
            .collect();
        env.push(("PISTON_LANGUAGE".into(), self.request.alias.clone().into()));

        let (events_tx, forward_handle) = match bus {
            Some(bus) => {
                let (tx, mut rx) = mpsc::unbounded_channel();
                let bus = bus.clone();
                let handle = tokio::spawn(async move {
                    while let Some(event) = rx.recv().await {
                        let translated = match event {
                            supervisor::SupervisorEvent::Stdout(b) => BusEvent::Stdout(b),
                            supervisor::SupervisorEvent::Stderr(b) => BusEvent::Stderr(b),
                        };
                        bus.publish(translated);
                    }
                });
                (Some(tx), Some(handle))
            }
            None => (None, None),
        };

        let (stdin_source, signal_handle) = if let (Some(bus), true) = (bus, accepts_interactive_stdin) {
            let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
            let (signal_tx, signal_rx) = mpsc::unbounded_channel();
            let mut sub = bus.subscribe();
            let handle = tokio::spawn(async move {
                loop {
                    match sub.recv().await {
                        Ok(BusEvent::Stdin(bytes)) => {
                            if stdin_tx.send(bytes).is_err() {
                                break;
                            }
                        }
                        Ok(BusEvent::Signal(sig)) => {
                            if signal_tx.send(sig).is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
            (StdinSource::Channel(stdin_rx), Some((signal_rx, handle)))
        } else {
            (StdinSource::Buffer(batch_stdin), None)
        };

        let signals: Option<mpsc::UnboundedReceiver<Signal>> =
            signal_handle.map(|(rx, _handle)| rx);

        let request = RunRequest {
            cmd: script.to_path_buf(),
            argv,
            cwd: slot.dir.clone(),
            env,
            uid: slot.uid,
            gid: slot.gid,
            stdin: stdin_source,
            limits,
            events: events_tx,
            signals,
        };

        let result = supervisor::run(request).await?;

        if let Some(handle) = forward_handle {
            let _ = handle.await;
        }

        if let Some(bus) = bus {
            bus.publish(BusEvent::Exit {
                stage,
                exit_code: result.exit_code,
                signal: result.signal.clone(),
            });
        }

        Ok(result)
    }

    fn limits_for(&self, wall_ms: u64, requested_bytes: Option<u64>) -> Limits {
        let memory_bytes = Some(match requested_bytes {
            None => self.memory_ceiling_bytes,
            Some(b) => b.min(self.memory_ceiling_bytes),
        });
        Limits {
            wall_ms,
            memory_bytes,
            max_output_bytes: self.request.max_output_bytes,
            max_processes: self.max_processes,
            max_open_files: self.max_open_files,
            max_file_size_bytes: self.max_file_size_bytes,
        }
    }

    /// Idempotent: kills any still-running supervised process and releases
    /// the slot. Safe to call from any state, including after a failed
    /// `prime` or mid-phase on client disconnect.
    pub fn cleanup(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.isolation.release(slot);
        }
        self.state = JobState::Cleaned;
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        if self.state != JobState::Cleaned {
            self.cleanup();
        }
    }
}

/// Rejects absolute paths and any path whose normalized form escapes
/// `root` (walked component-wise so `a/../../etc/passwd` can't hide an
/// escape behind a legitimate-looking prefix).
fn safe_join(root: &Path, relative: &Path) -> Result<PathBuf, JobError> {
    if relative.is_absolute() {
        return Err(JobError::PathEscape(relative.to_path_buf()));
    }
    let mut depth: i64 = 0;
    for component in relative.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return Err(JobError::PathEscape(relative.to_path_buf()));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(JobError::PathEscape(relative.to_path_buf()));
            }
        }
    }
    Ok(root.join(relative))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::registry::Version;
    use std::collections::HashMap;

    fn test_runtime(compile_script: Option<&str>) -> Arc<RuntimeDescriptor> {
        Arc::new(RuntimeDescriptor {
            language: "python".to_string(),
            version: Version::parse("3.10.0").unwrap(),
            aliases: vec![],
            install_prefix: PathBuf::from("/opt/python"),
            compile_script: compile_script.map(PathBuf::from),
            run_script: PathBuf::from("/bin/cat"),
            base_env: HashMap::new(),
            runtime: "cpython".to_string(),
        })
    }

    fn test_isolation(root: &Path) -> Arc<IsolationProvider> {
        let cfg = EngineConfig {
            slot_count: 2,
            isolate_root: root.to_path_buf(),
            ..EngineConfig::default()
        };
        Arc::new(IsolationProvider::new(&cfg).unwrap())
    }

    fn running_as_root() -> bool {
        nix::unistd::Uid::effective().is_root()
    }

    #[test]
    fn path_escape_is_rejected() {
        let root = PathBuf::from("/isolate/3");
        assert!(safe_join(&root, Path::new("../../etc/passwd")).is_err());
        assert!(safe_join(&root, Path::new("/etc/passwd")).is_err());
        assert!(safe_join(&root, Path::new("sub/../ok.py")).is_ok());
        assert!(safe_join(&root, Path::new("sub/../../escape.py")).is_err());
    }

    #[test]
    fn prime_fails_and_releases_slot_on_path_escape() {
        if !running_as_root() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let isolation = test_isolation(dir.path());
        let request = JobRequest {
            alias: "python".to_string(),
            args: vec![],
            files: vec![FileEntry {
                path: PathBuf::from("../escape.py"),
                content: b"print(1)".to_vec(),
                executable: false,
            }],
            compile_ms: 1000,
            run_ms: 1000,
            compile_bytes: None,
            run_bytes: None,
            max_output_bytes: 4096,
            stdin: Vec::new(),
        };
        let mut job = Job::new(test_runtime(None), request, isolation.clone(), 1 << 30);
        assert!(job.prime().is_err());
        assert_eq!(job.state(), JobState::Created);
    }

    #[test]
    fn double_cleanup_is_a_no_op() {
        if !running_as_root() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let isolation = test_isolation(dir.path());
        let request = JobRequest {
            alias: "python".to_string(),
            args: vec![],
            files: vec![FileEntry {
                path: PathBuf::from("main.py"),
                content: b"print(1)".to_vec(),
                executable: false,
            }],
            compile_ms: 1000,
            run_ms: 1000,
            compile_bytes: None,
            run_bytes: None,
            max_output_bytes: 4096,
            stdin: Vec::new(),
        };
        let mut job = Job::new(test_runtime(None), request, isolation, 1 << 30);
        job.prime().unwrap();
        job.cleanup();
        assert_eq!(job.state(), JobState::Cleaned);
        job.cleanup();
        assert_eq!(job.state(), JobState::Cleaned);
    }
}

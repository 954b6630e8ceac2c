//! Allocates numbered sandbox slots, each bound to a dedicated low-privilege
//! UID/GID pair and a scratch directory only that UID may read or write.
//!
//! The UID/GID uniqueness is the isolation primitive: a slot's UID cannot
//! read another slot's files and cannot signal another slot's processes.
//! Allocation is a fixed-size pool guarded by one lock, keyed by slot id
//! rather than raw uid.

use std::{collections::HashSet, path::PathBuf};

use parking_lot::Mutex;

use crate::config::EngineConfig;

#[derive(Debug, thiserror::Error)]
pub enum IsolationError {
    #[error("no free sandbox slot (pool exhausted)")]
    Exhausted,
    #[error("failed to prepare scratch directory {path}")]
    ScratchDir {
        path: PathBuf,
        #[source]
        cause: std::io::Error,
    },
    #[error("failed to set ownership of {path} to uid {uid}")]
    Chown {
        path: PathBuf,
        uid: u32,
        #[source]
        cause: nix::Error,
    },
}

/// A leased sandbox slot: a scratch directory plus a dedicated UID/GID.
///
/// Owned exclusively by whichever `Job` holds it, from `prime` to `cleanup`.
#[derive(Debug)]
pub struct Slot {
    pub id: u32,
    pub uid: u32,
    pub gid: u32,
    pub dir: PathBuf,
}

#[derive(Debug)]
pub struct IsolationProvider {
    isolate_root: PathBuf,
    base_uid: u32,
    base_gid: u32,
    free: Mutex<HashSet<u32>>,
}

impl IsolationProvider {
    pub fn new(config: &EngineConfig) -> Result<IsolationProvider, IsolationError> {
        std::fs::create_dir_all(&config.isolate_root).map_err(|cause| IsolationError::ScratchDir {
            path: config.isolate_root.clone(),
            cause,
        })?;
        Ok(IsolationProvider {
            isolate_root: config.isolate_root.clone(),
            base_uid: config.base_uid,
            base_gid: config.base_gid,
            free: Mutex::new((0..config.slot_count).collect()),
        })
    }

    /// Returns a free slot, with a freshly emptied, correctly-owned scratch
    /// directory. Fails if the pool is exhausted.
    pub fn acquire(&self) -> Result<Slot, IsolationError> {
        let id = {
            let mut free = self.free.lock();
            let id = *free.iter().next().ok_or(IsolationError::Exhausted)?;
            free.remove(&id);
            id
        };
        let uid = self.base_uid + id;
        let gid = self.base_gid + id;
        let dir = self.isolate_root.join(id.to_string());

        if let Err(e) = reset_scratch_dir(&dir, uid, gid) {
            self.free.lock().insert(id);
            return Err(e);
        }

        Ok(Slot { id, uid, gid, dir })
    }

    /// Kills any surviving process owned by the slot's UID, empties the
    /// scratch directory, and returns the slot to the free set. Best-effort:
    /// logs rather than propagating I/O failures, because a leaked slot is
    /// worse than a dirty one (the next `acquire` of this id re-empties the
    /// directory anyway).
    pub fn release(&self, slot: Slot) {
        kill_all_owned_by(slot.uid);
        if let Err(e) = empty_dir(&slot.dir) {
            tracing::warn!(slot_id = slot.id, error = %e, "failed to empty scratch directory on release");
        }
        self.free.lock().insert(slot.id);
    }
}

fn reset_scratch_dir(dir: &PathBuf, uid: u32, gid: u32) -> Result<(), IsolationError> {
    if dir.exists() {
        empty_dir(dir).map_err(|cause| IsolationError::ScratchDir {
            path: dir.clone(),
            cause,
        })?;
    } else {
        std::fs::create_dir_all(dir).map_err(|cause| IsolationError::ScratchDir {
            path: dir.clone(),
            cause,
        })?;
    }
    let mut perms = std::fs::metadata(dir)
        .map_err(|cause| IsolationError::ScratchDir {
            path: dir.clone(),
            cause,
        })?
        .permissions();
    std::os::unix::fs::PermissionsExt::set_mode(&mut perms, 0o700);
    std::fs::set_permissions(dir, perms).map_err(|cause| IsolationError::ScratchDir {
        path: dir.clone(),
        cause,
    })?;
    nix::unistd::chown(
        dir,
        Some(nix::unistd::Uid::from_raw(uid)),
        Some(nix::unistd::Gid::from_raw(gid)),
    )
    .map_err(|cause| IsolationError::Chown {
        path: dir.clone(),
        uid,
        cause,
    })
}

/// Best-effort recursive unlink that tolerates `EBUSY` via a few retries
/// (a just-killed child's pipe fds can keep a directory entry transiently busy).
fn empty_dir(dir: &PathBuf) -> std::io::Result<()> {
    let entries: Vec<_> = std::fs::read_dir(dir)?.filter_map(|e| e.ok()).collect();
    for entry in entries {
        let path = entry.path();
        let file_type = entry.file_type()?;
        let mut last_err = None;
        for attempt in 0..5 {
            let result = if file_type.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            match result {
                Ok(()) => {
                    last_err = None;
                    break;
                }
                Err(e) if e.raw_os_error() == Some(libc::EBUSY) && attempt < 4 => {
                    last_err = Some(e);
                    std::thread::sleep(std::time::Duration::from_millis(20));
                }
                Err(e) => {
                    last_err = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = last_err {
            return Err(e);
        }
    }
    Ok(())
}

/// Sends `SIGKILL` to every process whose real UID matches `uid`, by
/// scanning `/proc`. Best-effort: a process that exits mid-scan is not an
/// error.
fn kill_all_owned_by(uid: u32) {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<i32>().ok()) else {
            continue;
        };
        let status_path = entry.path().join("status");
        let Ok(status) = std::fs::read_to_string(&status_path) else {
            continue;
        };
        let owner = status
            .lines()
            .find(|l| l.starts_with("Uid:"))
            .and_then(|l| l.split_whitespace().nth(1))
            .and_then(|s| s.parse::<u32>().ok());
        if owner == Some(uid) {
            nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::Signal::SIGKILL)
                .ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(root: &std::path::Path) -> EngineConfig {
        EngineConfig {
            slot_count: 2,
            base_uid: 100_000,
            base_gid: 100_000,
            isolate_root: root.to_path_buf(),
            ..EngineConfig::default()
        }
    }

    /// `chown` to an arbitrary uid needs `CAP_CHOWN`; skip acquire-dependent
    /// assertions when the test runner isn't root, rather than failing on
    /// unrelated privilege.
    fn running_as_root() -> bool {
        nix::unistd::Uid::effective().is_root()
    }

    #[test]
    fn acquire_release_roundtrip() {
        if !running_as_root() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let provider = IsolationProvider::new(&test_config(dir.path())).unwrap();
        let slot = provider.acquire().unwrap();
        assert_eq!(slot.uid, 100_000 + slot.id);
        provider.release(slot);
    }

    #[test]
    fn exhaustion_is_reported() {
        if !running_as_root() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let provider = IsolationProvider::new(&test_config(dir.path())).unwrap();
        let a = provider.acquire().unwrap();
        let b = provider.acquire().unwrap();
        assert!(matches!(provider.acquire(), Err(IsolationError::Exhausted)));
        provider.release(a);
        provider.release(b);
    }

    #[test]
    fn release_returns_slot_to_pool() {
        if !running_as_root() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let provider = IsolationProvider::new(&test_config(dir.path())).unwrap();
        let slot = provider.acquire().unwrap();
        let id = slot.id;
        provider.release(slot);
        let reacquired = provider.acquire().unwrap();
        assert_eq!(reacquired.id, id);
        provider.release(reacquired);
    }
}

// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::task::TaskId;
use crate::{AppError, AppResult};

const LOCK_FILE_NAME: &str = ".lock";
/// A lock file nobody could parse is only considered abandoned after this
/// long, its writer may still be filling it in.
const UNREADABLE_LOCK_GRACE: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize, Deserialize)]
struct LockFileContent {
    owner: String,
    process_id: String,
    pid: u32,
    acquired_at: String,
}

fn process_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::new(),
    );
    system.process(pid).is_some()
}

/// Writes `content` into a freshly created lock file. On failure the file is
/// removed again, a lock nobody recorded could never be released.
fn fill_lock_file<W: Write>(
    lock_file: &Path,
    mut file: W,
    content: &LockFileContent,
) -> AppResult<()> {
    let written = serde_json::to_string(content)
        .map_err(AppError::from)
        .and_then(|json| Ok(file.write_all(json.as_bytes())?));
    if written.is_err() {
        if let Err(e) = fs::remove_file(lock_file) {
            warn!(
                "failed to remove half written lock file {}: {}",
                lock_file.display(),
                e
            );
        }
    }
    written
}

/// Per application root of the task directories, plus the lock table that
/// makes every task directory single-writer.
///
/// Workers in one process share the directory through an `Arc` and contend on
/// the in-memory table. Other processes are kept out by a `.lock` file created
/// exclusively inside the task directory. Acquisition never waits: a taken
/// lock is reported as [`AppError::LockUnavailable`].
#[derive(Debug)]
pub struct StateDirectory {
    base_dir: PathBuf,
    process_id: String,
    locks: DashMap<TaskId, String>,
}

impl StateDirectory {
    pub fn new(state_dir: impl AsRef<Path>, application_id: &str) -> AppResult<Self> {
        let base_dir = state_dir.as_ref().join(application_id);
        fs::create_dir_all(&base_dir)?;
        let process_id = Uuid::new_v4().to_string();
        info!(
            "state directory {} opened by process {}",
            base_dir.display(),
            process_id
        );
        Ok(Self {
            base_dir,
            process_id,
            locks: DashMap::new(),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Directory of one task, created on demand.
    pub fn directory_for_task(&self, task_id: TaskId) -> AppResult<PathBuf> {
        let dir = self.base_dir.join(task_id.to_string());
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Takes the task lock for `owner`. Locking again by the same owner
    /// succeeds.
    pub fn lock(&self, task_id: TaskId, owner: &str) -> AppResult<()> {
        match self.locks.entry(task_id) {
            Entry::Occupied(entry) => {
                if entry.get() == owner {
                    return Ok(());
                }
                debug!(
                    "lock of task {} requested by {} is held by {}",
                    task_id,
                    owner,
                    entry.get()
                );
                Err(AppError::LockUnavailable(task_id))
            }
            Entry::Vacant(entry) => {
                let lock_file = self.directory_for_task(task_id)?.join(LOCK_FILE_NAME);
                let Some(file) = self.create_lock_file(&lock_file, task_id)? else {
                    return Err(AppError::LockUnavailable(task_id));
                };
                let content = LockFileContent {
                    owner: owner.to_string(),
                    process_id: self.process_id.clone(),
                    pid: std::process::id(),
                    acquired_at: chrono::Local::now().to_rfc3339(),
                };
                fill_lock_file(&lock_file, file, &content)?;
                entry.insert(owner.to_string());
                debug!("task {} locked by {}", task_id, owner);
                Ok(())
            }
        }
    }

    /// Creates the lock file exclusively. A file left behind by a process
    /// that is gone is removed and creation retried once; `None` means a live
    /// process holds the lock.
    fn create_lock_file(&self, lock_file: &Path, task_id: TaskId) -> AppResult<Option<File>> {
        let create = || OpenOptions::new().write(true).create_new(true).open(lock_file);
        match create() {
            Ok(file) => return Ok(Some(file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }
        if !self.reclaim_abandoned(lock_file, task_id)? {
            debug!(
                "lock file {} of task {} belongs to another process",
                lock_file.display(),
                task_id
            );
            return Ok(None);
        }
        match create() {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Removes `lock_file` if the process that wrote it no longer exists.
    /// Returns whether the lock is free to take.
    fn reclaim_abandoned(&self, lock_file: &Path, task_id: TaskId) -> AppResult<bool> {
        let raw = match fs::read_to_string(lock_file) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str::<LockFileContent>(&raw) {
            Ok(holder) => {
                if holder.pid == std::process::id() || process_alive(holder.pid) {
                    return Ok(false);
                }
                warn!(
                    "task {} lock of {} was left by process {} which is gone, reclaiming it",
                    task_id, holder.owner, holder.pid
                );
            }
            Err(_) => {
                let age = match fs::metadata(lock_file).and_then(|meta| meta.modified()) {
                    Ok(modified) => modified.elapsed().unwrap_or_default(),
                    Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
                    Err(e) => return Err(e.into()),
                };
                if age < UNREADABLE_LOCK_GRACE {
                    return Ok(false);
                }
                warn!(
                    "task {} lock file is unreadable and {:?} old, reclaiming it",
                    task_id, age
                );
            }
        }

        // another process may have reclaimed and retaken it meanwhile
        if fs::read_to_string(lock_file).ok().as_deref() != Some(raw.as_str()) {
            return Ok(false);
        }
        match fs::remove_file(lock_file) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    /// Releases the lock if `owner` holds it; a lock held by someone else is
    /// left alone.
    pub fn unlock(&self, task_id: TaskId, owner: &str) -> AppResult<()> {
        let Some((_, _)) = self.locks.remove_if(&task_id, |_, holder| holder == owner) else {
            return Ok(());
        };
        let lock_file = self.base_dir.join(task_id.to_string()).join(LOCK_FILE_NAME);
        match fs::remove_file(&lock_file) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("lock file of task {} vanished before unlock", task_id)
            }
            Err(e) => return Err(e.into()),
        }
        debug!("task {} unlocked by {}", task_id, owner);
        Ok(())
    }

    pub fn lock_owner(&self, task_id: TaskId) -> Option<String> {
        self.locks.get(&task_id).map(|owner| owner.value().clone())
    }

    pub fn is_locked(&self, task_id: TaskId) -> bool {
        self.locks.contains_key(&task_id)
    }
}

impl Drop for StateDirectory {
    fn drop(&mut self) {
        for entry in self.locks.iter() {
            let lock_file = self.base_dir.join(entry.key().to_string()).join(LOCK_FILE_NAME);
            if let Err(e) = fs::remove_file(&lock_file) {
                warn!("failed to release lock file {}: {}", lock_file.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn lock_is_exclusive_per_owner() {
        let dir = TempDir::new().unwrap();
        let state_dir = StateDirectory::new(dir.path(), "app").unwrap();
        let id = TaskId::new(0, 1);

        state_dir.lock(id, "worker-1").unwrap();
        state_dir.lock(id, "worker-1").unwrap();
        assert!(matches!(
            state_dir.lock(id, "worker-2"),
            Err(AppError::LockUnavailable(t)) if t == id
        ));
        assert_eq!(state_dir.lock_owner(id).as_deref(), Some("worker-1"));

        // only the holder can release
        state_dir.unlock(id, "worker-2").unwrap();
        assert!(state_dir.is_locked(id));
        state_dir.unlock(id, "worker-1").unwrap();
        state_dir.lock(id, "worker-2").unwrap();
    }

    #[test]
    fn lock_file_keeps_other_processes_out() {
        let dir = TempDir::new().unwrap();
        let first = StateDirectory::new(dir.path(), "app").unwrap();
        let second = StateDirectory::new(dir.path(), "app").unwrap();
        let id = TaskId::new(1, 0);

        first.lock(id, "worker-1").unwrap();
        assert!(first.base_dir().join("1_0").join(LOCK_FILE_NAME).exists());
        assert!(matches!(
            second.lock(id, "worker-1"),
            Err(AppError::LockUnavailable(_))
        ));

        first.unlock(id, "worker-1").unwrap();
        second.lock(id, "worker-1").unwrap();
    }

    fn write_lock_file(state_dir: &StateDirectory, id: TaskId, pid: u32) -> PathBuf {
        let lock_file = state_dir.directory_for_task(id).unwrap().join(LOCK_FILE_NAME);
        let content = LockFileContent {
            owner: "worker-1".to_string(),
            process_id: Uuid::new_v4().to_string(),
            pid,
            acquired_at: chrono::Local::now().to_rfc3339(),
        };
        fs::write(&lock_file, serde_json::to_string(&content).unwrap()).unwrap();
        lock_file
    }

    #[cfg(unix)]
    #[test]
    fn lock_left_by_crashed_process_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let state_dir = StateDirectory::new(dir.path(), "app").unwrap();
        let id = TaskId::new(0, 0);

        let mut crashed = std::process::Command::new("true").spawn().unwrap();
        let pid = crashed.id();
        crashed.wait().unwrap();
        let lock_file = write_lock_file(&state_dir, id, pid);

        state_dir.lock(id, "worker-2").unwrap();
        assert_eq!(state_dir.lock_owner(id).as_deref(), Some("worker-2"));
        let holder: LockFileContent =
            serde_json::from_str(&fs::read_to_string(&lock_file).unwrap()).unwrap();
        assert_eq!(holder.pid, std::process::id());
        assert_eq!(holder.owner, "worker-2");
    }

    #[cfg(unix)]
    #[test]
    fn lock_of_live_process_is_kept_until_it_exits() {
        let dir = TempDir::new().unwrap();
        let state_dir = StateDirectory::new(dir.path(), "app").unwrap();
        let id = TaskId::new(0, 1);

        let mut holder = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        write_lock_file(&state_dir, id, holder.id());
        assert!(matches!(
            state_dir.lock(id, "worker-2"),
            Err(AppError::LockUnavailable(_))
        ));

        holder.kill().unwrap();
        holder.wait().unwrap();
        state_dir.lock(id, "worker-2").unwrap();
    }

    #[test]
    fn fresh_unreadable_lock_file_is_respected() {
        let dir = TempDir::new().unwrap();
        let state_dir = StateDirectory::new(dir.path(), "app").unwrap();
        let id = TaskId::new(2, 0);
        let lock_file = state_dir.directory_for_task(id).unwrap().join(LOCK_FILE_NAME);
        fs::write(&lock_file, "").unwrap();

        assert!(matches!(
            state_dir.lock(id, "worker-1"),
            Err(AppError::LockUnavailable(_))
        ));
        assert!(lock_file.exists());
    }

    #[derive(Debug)]
    struct DiskFull;

    impl Write for DiskFull {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(ErrorKind::Other, "no space left"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn failed_lock_write_leaves_no_lock_file() {
        let dir = TempDir::new().unwrap();
        let state_dir = StateDirectory::new(dir.path(), "app").unwrap();
        let id = TaskId::new(0, 3);
        let lock_file = state_dir.directory_for_task(id).unwrap().join(LOCK_FILE_NAME);
        fs::write(&lock_file, "").unwrap();

        let content = LockFileContent {
            owner: "worker-1".to_string(),
            process_id: Uuid::new_v4().to_string(),
            pid: std::process::id(),
            acquired_at: chrono::Local::now().to_rfc3339(),
        };
        let result = fill_lock_file(&lock_file, DiskFull, &content);
        assert!(matches!(result, Err(AppError::IoError(_))));
        assert!(!lock_file.exists());
        state_dir.lock(id, "worker-1").unwrap();
    }

    #[test]
    fn drop_releases_lock_files() {
        let dir = TempDir::new().unwrap();
        {
            let state_dir = StateDirectory::new(dir.path(), "app").unwrap();
            state_dir.lock(TaskId::new(0, 0), "w").unwrap();
        }
        let state_dir = StateDirectory::new(dir.path(), "app").unwrap();
        state_dir.lock(TaskId::new(0, 0), "w").unwrap();
    }
}

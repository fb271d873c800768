// C2T - CPU Testing Tool
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Child processes in their own process groups.
//!
//! Emulators and debug stubs fork helpers of their own, so every child is
//! started as the leader of a fresh process group and torn down by signalling
//! the whole group. A [`GroupChild`] that is dropped kills its group, which
//! keeps error paths from leaking processes.

use std::{
    collections::BTreeSet,
    fs::{self, File},
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use tokio::process::{Child, Command};
use tracing::{debug, info, trace};

use crate::C2tResult;

type Groups = Arc<Mutex<BTreeSet<i32>>>;

fn kill_group(pgid: i32) {
    // SAFETY: killpg only sends a signal; a stale group yields ESRCH.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        trace!(pgid, error = %std::io::Error::last_os_error(), "killpg failed");
    }
}

/// Kills a process group when dropped.
///
/// Guards short-lived groups such as build stages, whose tools may outlive
/// the shell that started them.
#[derive(Debug)]
pub(crate) struct GroupGuard {
    pgid: Option<i32>,
}

impl GroupGuard {
    /// Guard the group led by `pid`, as returned by `Child::id`.
    pub(crate) fn new(pid: Option<u32>) -> Self {
        Self { pgid: pid.and_then(|pid| i32::try_from(pid).ok()) }
    }
}

impl Drop for GroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_group(pgid);
        }
    }
}

/// Spawns children and keeps track of their process groups.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    groups: Groups,
    log_dir: PathBuf,
}

impl ProcessSupervisor {
    /// Supervisor writing child output to `log_dir/<name>.log`.
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self { groups: Arc::default(), log_dir: log_dir.into() }
    }

    /// Directory receiving child output.
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Start `command_line` through the shell as a new process group leader.
    pub fn spawn(&self, name: &str, command_line: &str) -> C2tResult<GroupChild> {
        fs::create_dir_all(&self.log_dir)?;
        let log_path = self.log_dir.join(format!("{name}.log"));
        let stdout = File::create(&log_path)?;
        let stderr = stdout.try_clone()?;

        let child = Command::new("sh")
            .arg("-c")
            .arg(format!("exec {command_line}"))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0)
            .kill_on_drop(true)
            .spawn()?;
        let pgid = child.id().and_then(|pid| i32::try_from(pid).ok());
        if let Some(pgid) = pgid {
            self.groups.lock().insert(pgid);
        }
        info!(name, pid = ?child.id(), log = %log_path.display(), "Started {command_line}");
        Ok(GroupChild { name: name.to_string(), child, pgid, groups: self.groups.clone() })
    }

    /// Process groups still alive (not yet torn down).
    pub fn live_groups(&self) -> Vec<i32> {
        self.groups.lock().iter().copied().collect()
    }

    /// Kill every group this supervisor started.
    pub fn kill_all(&self) {
        let groups = std::mem::take(&mut *self.groups.lock());
        for pgid in groups {
            debug!(pgid, "Killing process group");
            kill_group(pgid);
        }
    }
}

/// A running child leading its own process group.
#[derive(Debug)]
pub struct GroupChild {
    name: String,
    child: Child,
    pgid: Option<i32>,
    groups: Groups,
}

impl GroupChild {
    /// Name given at spawn time.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Process id, while the child has not been reaped.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Exit status, if the child has already exited.
    pub fn try_exit(&mut self) -> C2tResult<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }

    fn kill_now(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            self.groups.lock().remove(&pgid);
            kill_group(pgid);
        }
    }

    /// Stop the child and its group, then reap it.
    ///
    /// Unless `immediate`, the child first gets `grace` to exit on its own.
    pub async fn terminate(mut self, grace: Duration, immediate: bool) {
        if !immediate {
            match tokio::time::timeout(grace, self.child.wait()).await {
                Ok(Ok(status)) => debug!(name = %self.name, %status, "Child exited"),
                Ok(Err(e)) => debug!(name = %self.name, error = %e, "Waiting for child failed"),
                Err(_) => debug!(name = %self.name, "Child still running after grace period"),
            }
        }
        self.kill_now();
        if let Err(e) = self.child.wait().await {
            debug!(name = %self.name, error = %e, "Reaping child failed");
        }
        debug!(name = %self.name, "Child torn down");
    }
}

impl Drop for GroupChild {
    fn drop(&mut self) {
        self.kill_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alive(pid: u32) -> bool {
        Path::new(&format!("/proc/{pid}")).exists()
    }

    #[tokio::test]
    async fn test_terminate_kills_and_reaps_group() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProcessSupervisor::new(dir.path());
        let child = supervisor.spawn("sleeper", "sleep 30").unwrap();
        let pid = child.id().unwrap();
        assert_eq!(supervisor.live_groups().len(), 1);

        child.terminate(Duration::from_millis(50), false).await;
        assert!(supervisor.live_groups().is_empty());
        assert!(!alive(pid));
        assert!(dir.path().join("sleeper.log").exists());
    }

    #[tokio::test]
    async fn test_exited_child_reports_status() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProcessSupervisor::new(dir.path());
        let mut child = supervisor.spawn("quick", "sh -c 'echo hello; exit 3'").unwrap();
        let mut status = None;
        for _ in 0..100 {
            status = child.try_exit().unwrap();
            if status.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status.and_then(|s| s.code()), Some(3));
        child.terminate(Duration::ZERO, true).await;
        let log = fs::read_to_string(dir.path().join("quick.log")).unwrap();
        assert_eq!(log.trim(), "hello");
    }
}

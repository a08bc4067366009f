// Copyright (c) 2025 Huawei Technologies Co.,Ltd. All rights reserved.
//
// ozoned is licensed under Mulan PSL v2.
// You can use this software according to the terms and conditions of the Mulan
// PSL v2.
// You may obtain a copy of Mulan PSL v2 at:
//         http://license.coscl.org.cn/MulanPSL2
// THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY
// KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO
// NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
// See the Mulan PSL v2 for more details.

//! Task launching contract.
//!
//! The supervisor core never forks or execs by itself; it prepares a
//! `TaskEnv` and hands it to a `TaskLauncher`. The launcher is expected
//! to put the child into the prepared cgroups, apply namespaces, mounts
//! and capabilities per the env, and report the root pid back.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;

use util::unix::{is_zombie, pid_alive, proc_stat};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    pub dest: PathBuf,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rlimit {
    pub name: String,
    pub soft: u64,
    pub hard: u64,
}

/// Everything a launcher needs to spawn the container's root task.
#[derive(Debug, Clone, Default)]
pub struct TaskEnv {
    pub container: String,
    pub command: String,
    pub cwd: PathBuf,
    pub root: PathBuf,
    pub root_rdonly: bool,
    pub user: String,
    pub group: String,
    pub env: Vec<String>,
    pub isolate: bool,
    pub new_mount_ns: bool,
    pub hostname: String,
    pub bind_dns: bool,
    pub stdin_path: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub bind_mounts: Vec<BindMount>,
    pub devices: Vec<String>,
    pub capabilities: Vec<String>,
    pub rlimits: Vec<Rlimit>,
    /// Loop device number backing the root, -1 when the root is a
    /// plain directory.
    pub loop_dev: i32,
    /// Pid of the closest running ancestor whose namespaces a
    /// non-isolated task joins.
    pub parent_ns_pid: Option<i32>,
    /// Leaf cgroup paths the child must enter before exec, keyed by
    /// subsystem name.
    pub cgroups: HashMap<String, PathBuf>,
}

/// External spawner contract. `start` returns the root pid; errors
/// should keep the causing errno in their chain.
pub trait TaskLauncher: Send + Sync {
    fn start(&self, env: &TaskEnv) -> Result<i32>;
    fn kill(&self, pid: i32, signal: i32) -> Result<()>;
}

/// Handle to a running (or reattached) process group root.
#[derive(Clone)]
pub struct Task {
    pid: i32,
    launcher: Arc<dyn TaskLauncher>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("pid", &self.pid).finish()
    }
}

impl Task {
    pub fn new(pid: i32, launcher: Arc<dyn TaskLauncher>) -> Self {
        Task { pid, launcher }
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        self.pid > 0 && pid_alive(self.pid) && !is_zombie(self.pid)
    }

    pub fn is_zombie(&self) -> bool {
        self.pid > 0 && is_zombie(self.pid)
    }

    /// Whether the process is still parented by this daemon. Used when
    /// reattaching after a restart: a reparented task was lost.
    pub fn has_correct_parent(&self) -> bool {
        match proc_stat(self.pid) {
            Ok(st) => st.ppid == std::process::id() as i32,
            Err(_) => false,
        }
    }

    pub fn kill(&self, signal: i32) -> Result<()> {
        self.launcher.kill(self.pid, signal)
    }
}

#[cfg(test)]
pub mod fake {
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Mutex;

    use super::*;
    use anyhow::{anyhow, Context};

    /// Scripted launcher for state-machine tests: hands out fake pids,
    /// records kills, optionally fails with a given errno.
    pub struct FakeLauncher {
        next_pid: AtomicI32,
        pub fail_errno: Mutex<Option<i32>>,
        pub started: Mutex<Vec<TaskEnv>>,
        pub killed: Mutex<Vec<(i32, i32)>>,
    }

    impl FakeLauncher {
        pub fn new() -> Self {
            FakeLauncher {
                // Far above pid_max so the fake pids never look alive.
                next_pid: AtomicI32::new(0x400000),
                fail_errno: Mutex::new(None),
                started: Mutex::new(Vec::new()),
                killed: Mutex::new(Vec::new()),
            }
        }

        pub fn fail_with(&self, errno: i32) {
            *self.fail_errno.lock().unwrap() = Some(errno);
        }

        pub fn started_count(&self) -> usize {
            self.started.lock().unwrap().len()
        }
    }

    impl Default for FakeLauncher {
        fn default() -> Self {
            Self::new()
        }
    }

    impl TaskLauncher for FakeLauncher {
        fn start(&self, env: &TaskEnv) -> Result<i32> {
            if let Some(errno) = *self.fail_errno.lock().unwrap() {
                let io = std::io::Error::from_raw_os_error(errno);
                return Err(anyhow::Error::from(io))
                    .with_context(|| format!("Failed to spawn {}", env.command));
            }
            if env.command.is_empty() {
                return Err(anyhow!("empty command"));
            }
            self.started.lock().unwrap().push(env.clone());
            Ok(self.next_pid.fetch_add(1, Ordering::SeqCst))
        }

        fn kill(&self, pid: i32, signal: i32) -> Result<()> {
            self.killed.lock().unwrap().push((pid, signal));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeLauncher;
    use super::*;
    use crate::error::errno_of;

    #[test]
    fn test_fake_launcher_hands_out_pids() {
        let launcher = Arc::new(FakeLauncher::new());
        let env = TaskEnv {
            command: "/bin/true".to_string(),
            ..Default::default()
        };
        let pid1 = launcher.start(&env).unwrap();
        let pid2 = launcher.start(&env).unwrap();
        assert_ne!(pid1, pid2);
        assert_eq!(launcher.started_count(), 2);
    }

    #[test]
    fn test_fake_launcher_failure_carries_errno() {
        let launcher = FakeLauncher::new();
        launcher.fail_with(libc::ENOENT);
        let env = TaskEnv {
            command: "/bin/missing".to_string(),
            ..Default::default()
        };
        let err = launcher.start(&env).unwrap_err();
        assert_eq!(errno_of(&err), Some(libc::ENOENT));
    }

    #[test]
    fn test_task_not_running_for_fake_pid() {
        let launcher: Arc<dyn TaskLauncher> = Arc::new(FakeLauncher::new());
        let task = Task::new(0x400001, launcher);
        assert!(!task.is_running());
        assert!(!task.has_correct_parent());
    }
}

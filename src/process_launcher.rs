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

//! Plain task launcher.
//!
//! Spawns the container command through `/bin/sh -c` in its own session:
//! stdio redirected, rlimits applied, the child moved into the prepared
//! leaf cgroups before exec. Namespace isolation, pivot_root and
//! capability application belong to the full spawner shipped separately;
//! this launcher covers supervision on the host.

use std::fs::{self, File, OpenOptions};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{kill, Signal};
use nix::unistd::{Gid, Group, Pid, Uid, User};

use container::launcher::{Rlimit, TaskEnv, TaskLauncher};

pub struct ProcessLauncher;

fn resource_for(name: &str) -> Option<Resource> {
    match name {
        "as" => Some(Resource::RLIMIT_AS),
        "core" => Some(Resource::RLIMIT_CORE),
        "cpu" => Some(Resource::RLIMIT_CPU),
        "data" => Some(Resource::RLIMIT_DATA),
        "fsize" => Some(Resource::RLIMIT_FSIZE),
        "memlock" => Some(Resource::RLIMIT_MEMLOCK),
        "msgqueue" => Some(Resource::RLIMIT_MSGQUEUE),
        "nice" => Some(Resource::RLIMIT_NICE),
        "nofile" => Some(Resource::RLIMIT_NOFILE),
        "nproc" => Some(Resource::RLIMIT_NPROC),
        "rtprio" => Some(Resource::RLIMIT_RTPRIO),
        "sigpending" => Some(Resource::RLIMIT_SIGPENDING),
        "stack" => Some(Resource::RLIMIT_STACK),
        _ => None,
    }
}

fn resolve_uid(user: &str) -> Result<Uid> {
    if let Ok(uid) = user.parse::<u32>() {
        return Ok(Uid::from_raw(uid));
    }
    match User::from_name(user).with_context(|| format!("Failed to look up user {}", user))? {
        Some(entry) => Ok(entry.uid),
        None => bail!("Unknown user {}", user),
    }
}

fn resolve_gid(group: &str) -> Result<Gid> {
    if let Ok(gid) = group.parse::<u32>() {
        return Ok(Gid::from_raw(gid));
    }
    match Group::from_name(group).with_context(|| format!("Failed to look up group {}", group))? {
        Some(entry) => Ok(entry.gid),
        None => bail!("Unknown group {}", group),
    }
}

impl TaskLauncher for ProcessLauncher {
    fn start(&self, env: &TaskEnv) -> Result<i32> {
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg(&env.command);

        command.env_clear();
        for pair in &env.env {
            if let Some((key, value)) = pair.split_once('=') {
                command.env(key, value);
            }
        }

        if !env.cwd.as_os_str().is_empty() {
            if !env.cwd.exists() {
                fs::create_dir_all(&env.cwd)
                    .with_context(|| format!("Failed to create cwd {:?}", env.cwd))?;
            }
            command.current_dir(&env.cwd);
        }

        if !env.user.is_empty() {
            command.uid(resolve_uid(&env.user)?.as_raw());
        }
        if !env.group.is_empty() {
            command.gid(resolve_gid(&env.group)?.as_raw());
        }

        let stdin = File::open(&env.stdin_path)
            .with_context(|| format!("Failed to open stdin {:?}", env.stdin_path))?;
        command.stdin(Stdio::from(stdin));
        for (path, target) in [(&env.stdout_path, 1), (&env.stderr_path, 2)] {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open stdio file {:?}", path))?;
            if target == 1 {
                command.stdout(Stdio::from(file));
            } else {
                command.stderr(Stdio::from(file));
            }
        }

        let cgroups: Vec<std::path::PathBuf> = env.cgroups.values().cloned().collect();
        let rlimits: Vec<Rlimit> = env.rlimits.clone();
        // SAFETY: the hook only calls async-signal-safe style operations
        // (setsid, open/write, setrlimit) before exec.
        unsafe {
            command.pre_exec(move || {
                libc::setsid();

                let pid = libc::getpid();
                for path in &cgroups {
                    fs::write(path.join("cgroup.procs"), pid.to_string())?;
                }

                for limit in &rlimits {
                    if let Some(resource) = resource_for(&limit.name) {
                        setrlimit(resource, limit.soft, limit.hard)
                            .map_err(std::io::Error::from)?;
                    }
                }
                Ok(())
            });
        }

        let child = command
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'", env.command))?;
        Ok(child.id() as i32)
    }

    fn kill(&self, pid: i32, signal: i32) -> Result<()> {
        let signal = Signal::try_from(signal).with_context(|| format!("Bad signal {}", signal))?;
        kill(Pid::from_raw(pid), signal).with_context(|| format!("Failed to kill {}", pid))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmm_sys_util::tempdir::TempDir;

    fn reap(pid: i32) -> i32 {
        let mut status = 0;
        // SAFETY: status is a valid out-param and the pid is our child.
        let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
        assert_eq!(ret, pid);
        status
    }

    fn env_fixture(dir: &TempDir, command: &str) -> TaskEnv {
        TaskEnv {
            command: command.to_string(),
            cwd: dir.as_path().join("cwd"),
            stdin_path: "/dev/null".into(),
            stdout_path: dir.as_path().join("stdout").into(),
            stderr_path: dir.as_path().join("stderr").into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_spawn_captures_stdout() {
        let dir = TempDir::new().unwrap();
        let env = env_fixture(&dir, "echo supervised");

        let pid = ProcessLauncher.start(&env).unwrap();
        assert!(pid > 0);
        let status = reap(pid);
        assert!(libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0);

        let out = fs::read_to_string(dir.as_path().join("stdout")).unwrap();
        assert_eq!(out.trim(), "supervised");
    }

    #[test]
    fn test_child_enters_cgroup() {
        let dir = TempDir::new().unwrap();
        let cgroup_dir = dir.as_path().join("freezer");
        fs::create_dir_all(&cgroup_dir).unwrap();

        let mut env = env_fixture(&dir, "true");
        env.cgroups
            .insert("freezer".to_string(), cgroup_dir.clone());

        let pid = ProcessLauncher.start(&env).unwrap();
        reap(pid);
        let recorded = fs::read_to_string(cgroup_dir.join("cgroup.procs")).unwrap();
        assert_eq!(recorded.parse::<i32>().unwrap(), pid);
    }

    #[test]
    fn test_kill_terminates_task() {
        let dir = TempDir::new().unwrap();
        let env = env_fixture(&dir, "exec sleep 60");

        let pid = ProcessLauncher.start(&env).unwrap();
        ProcessLauncher.kill(pid, libc::SIGKILL).unwrap();
        let status = reap(pid);
        assert!(libc::WIFSIGNALED(status));
        assert_eq!(libc::WTERMSIG(status), libc::SIGKILL);
    }
}

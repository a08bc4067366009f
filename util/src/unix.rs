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

use std::fs;

use anyhow::{anyhow, Result};

use crate::UtilError;

/// Fields of `/proc/<pid>/stat` the supervisor cares about.
pub struct ProcStat {
    pub pid: i32,
    pub comm: String,
    pub state: char,
    pub ppid: i32,
}

/// Parse `/proc/<pid>/stat`. The comm field may contain spaces and
/// parentheses, so fields are split after the last ')'.
pub fn proc_stat(pid: i32) -> Result<ProcStat> {
    let raw = fs::read_to_string(format!("/proc/{}/stat", pid))
        .map_err(|_| anyhow!(UtilError::ReadProcStat(pid)))?;

    let open = raw.find('(').ok_or(UtilError::ParseProcStat(pid))?;
    let close = raw.rfind(')').ok_or(UtilError::ParseProcStat(pid))?;
    let comm = raw[open + 1..close].to_string();
    let mut rest = raw[close + 1..].split_whitespace();

    let state = rest
        .next()
        .and_then(|s| s.chars().next())
        .ok_or(UtilError::ParseProcStat(pid))?;
    let ppid = rest
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or(UtilError::ParseProcStat(pid))?;

    Ok(ProcStat {
        pid,
        comm,
        state,
        ppid,
    })
}

/// True when the pid exists and is a zombie.
pub fn is_zombie(pid: i32) -> bool {
    matches!(proc_stat(pid), Ok(st) if st.state == 'Z')
}

/// True when a process with the given pid exists (including zombies).
pub fn pid_alive(pid: i32) -> bool {
    // SAFETY: kill with signal 0 only performs the existence check.
    let ret = unsafe { libc::kill(pid, 0) };
    ret == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proc_stat_self() {
        let pid = std::process::id() as i32;
        let st = proc_stat(pid).unwrap();
        assert_eq!(st.pid, pid);
        assert!(!st.comm.is_empty());
        assert!(st.ppid > 0);
        assert_ne!(st.state, 'Z');
    }

    #[test]
    fn test_pid_alive() {
        assert!(pid_alive(std::process::id() as i32));
        // Pids just below the default pid_max are practically never in use.
        assert!(!pid_alive(0x3ffff0));
    }
}

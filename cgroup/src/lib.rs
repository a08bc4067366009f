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

//! Cgroup-v1 driver.
//!
//! The supervisor operates on leaf cgroups under
//! `<subsystem root>/<supervisor root>/<container path>` for every
//! mounted controller. Knob writes are idempotent: the current kernel
//! value is read first and matching writes are skipped, which avoids
//! spurious EBUSY when re-applying limits.

pub mod error;
pub mod subsystem;

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

pub use error::CgroupError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subsystem {
    Cpu,
    Cpuacct,
    Memory,
    Freezer,
    Blkio,
    Netcls,
    Devices,
}

pub const ALL_SUBSYSTEMS: [Subsystem; 7] = [
    Subsystem::Cpu,
    Subsystem::Cpuacct,
    Subsystem::Memory,
    Subsystem::Freezer,
    Subsystem::Blkio,
    Subsystem::Netcls,
    Subsystem::Devices,
];

impl Subsystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subsystem::Cpu => "cpu",
            Subsystem::Cpuacct => "cpuacct",
            Subsystem::Memory => "memory",
            Subsystem::Freezer => "freezer",
            Subsystem::Blkio => "blkio",
            Subsystem::Netcls => "net_cls",
            Subsystem::Devices => "devices",
        }
    }
}

/// One leaf cgroup directory in a specific hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cgroup {
    path: PathBuf,
}

impl Cgroup {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn create(&self) -> Result<()> {
        if !self.path.exists() {
            fs::create_dir_all(&self.path)
                .with_context(|| format!("Failed to create cgroup {:?}", self.path))?;
        }
        Ok(())
    }

    /// Remove the cgroup directory. The kernel refuses while tasks
    /// remain, which callers handle by killing and retrying.
    pub fn remove(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_dir(&self.path)
                .with_context(|| format!("Failed to remove cgroup {:?}", self.path))?;
        }
        Ok(())
    }

    pub fn has_knob(&self, knob: &str) -> bool {
        self.path.join(knob).exists()
    }

    pub fn get_knob(&self, knob: &str) -> Result<String> {
        let path = self.path.join(knob);
        let mut value = fs::read_to_string(&path)
            .map_err(|_| anyhow!(CgroupError::ReadKnob(path.to_string_lossy().to_string())))?;
        if value.ends_with('\n') {
            value.pop();
        }
        Ok(value)
    }

    pub fn get_knob_u64(&self, knob: &str) -> Result<u64> {
        let raw = self.get_knob(knob)?;
        raw.parse::<u64>()
            .map_err(|_| anyhow!(CgroupError::ReadKnob(knob.to_string())))
    }

    /// Write a knob unconditionally. The io error stays in the chain so
    /// callers can classify the errno (EBUSY on memory.limit, ...).
    pub fn set_knob_raw(&self, knob: &str, value: &str) -> Result<()> {
        let path = self.path.join(knob);
        fs::write(&path, format!("{}\n", value)).with_context(|| {
            CgroupError::WriteKnob(value.to_string(), path.to_string_lossy().to_string())
        })
    }

    /// Write a knob, skipping the write when the kernel already holds
    /// the desired value.
    pub fn set_knob(&self, knob: &str, value: &str) -> Result<()> {
        if !self.has_knob(knob) {
            return Err(anyhow!(CgroupError::NoKnob(knob.to_string())));
        }
        if self.get_knob(knob)? == value {
            return Ok(());
        }
        self.set_knob_raw(knob, value)
    }

    pub fn set_knob_u64(&self, knob: &str, value: u64) -> Result<()> {
        self.set_knob(knob, &value.to_string())
    }

    fn read_pid_list(&self, knob: &str) -> Result<Vec<i32>> {
        let path = self.path.join(knob);
        let file = File::open(&path)
            .map_err(|_| anyhow!(CgroupError::ReadKnob(path.to_string_lossy().to_string())))?;
        let mut pids = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if let Ok(pid) = line.trim().parse::<i32>() {
                pids.push(pid);
            }
        }
        Ok(pids)
    }

    /// Thread-group leaders in this cgroup.
    pub fn procs(&self) -> Result<Vec<i32>> {
        self.read_pid_list("cgroup.procs")
    }

    /// Every task in this cgroup, including threads.
    pub fn tasks(&self) -> Result<Vec<i32>> {
        self.read_pid_list("tasks")
    }

    pub fn is_empty(&self) -> bool {
        match self.tasks() {
            Ok(tasks) => tasks.is_empty(),
            Err(_) => true,
        }
    }

    /// Send `signal` to every task currently in the cgroup.
    pub fn kill_all(&self, signal: i32) -> Result<()> {
        for pid in self.tasks()? {
            // SAFETY: sending a signal to an arbitrary pid is inherently racy
            // and the error is inspected below.
            let ret = unsafe { libc::kill(pid, signal) };
            if ret != 0 {
                let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
                if errno != libc::ESRCH {
                    return Err(anyhow!(CgroupError::WriteKnob(
                        format!("signal {}", signal),
                        format!("pid {}", pid),
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Paths to every controller hierarchy plus the supervisor's own root
/// cgroup name inside each of them.
pub struct CgroupDriver {
    roots: HashMap<Subsystem, PathBuf>,
    root_name: String,
}

impl CgroupDriver {
    /// Discover mounted hierarchies from `/proc/mounts`.
    pub fn new(root_name: &str) -> Result<Self> {
        let mut roots = HashMap::new();
        let mounts = File::open("/proc/mounts").with_context(|| "Failed to open '/proc/mounts'")?;
        for line in BufReader::new(mounts).lines() {
            let line = line.with_context(|| "Failed to read '/proc/mounts'")?;
            let fields: Vec<&str> = line.split(' ').collect();
            if fields.len() < 4 || fields[2] != "cgroup" {
                continue;
            }
            for subsys in ALL_SUBSYSTEMS.iter() {
                if fields[3].split(',').any(|o| o == subsys.as_str()) {
                    roots.entry(*subsys).or_insert_with(|| PathBuf::from(fields[1]));
                }
            }
        }

        for subsys in ALL_SUBSYSTEMS.iter() {
            if !roots.contains_key(subsys) {
                return Err(anyhow!(CgroupError::NoHierarchy(subsys.as_str())));
            }
        }

        Ok(CgroupDriver {
            roots,
            root_name: root_name.to_string(),
        })
    }

    /// Build a driver over explicit hierarchy roots. Tests point every
    /// subsystem at scratch directories.
    pub fn with_roots(roots: HashMap<Subsystem, PathBuf>, root_name: &str) -> Self {
        CgroupDriver {
            roots,
            root_name: root_name.to_string(),
        }
    }

    /// The supervisor's own cgroup in a hierarchy; parent of every
    /// container leaf.
    pub fn supervisor_cgroup(&self, subsys: Subsystem) -> Result<Cgroup> {
        let root = self
            .roots
            .get(&subsys)
            .ok_or(CgroupError::NoHierarchy(subsys.as_str()))?;
        Ok(Cgroup {
            path: root.join(&self.root_name),
        })
    }

    /// Leaf cgroup for a container path such as `a/b`.
    pub fn leaf_cgroup(&self, subsys: Subsystem, container_path: &str) -> Result<Cgroup> {
        let base = self.supervisor_cgroup(subsys)?;
        Ok(Cgroup {
            path: base.path.join(container_path),
        })
    }

    /// Create the supervisor root cgroup in every hierarchy.
    pub fn prepare(&self) -> Result<()> {
        for subsys in ALL_SUBSYSTEMS.iter() {
            self.supervisor_cgroup(*subsys)?.create()?;
        }
        Ok(())
    }
}

// Test-only helper so state-machine tests can run against scratch dirs.
pub fn scratch_driver(base: &Path, root_name: &str) -> CgroupDriver {
    let mut roots = HashMap::new();
    for subsys in ALL_SUBSYSTEMS.iter() {
        let dir = base.join(subsys.as_str());
        let _ = fs::create_dir_all(&dir);
        roots.insert(*subsys, dir);
    }
    CgroupDriver::with_roots(roots, root_name)
}

pub(crate) fn open_readonly(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .open(path)
        .with_context(|| format!("Failed to open {:?}", path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmm_sys_util::tempdir::TempDir;

    #[test]
    fn test_leaf_path_layout() {
        let dir = TempDir::new().unwrap();
        let driver = scratch_driver(dir.as_path(), "ozoned");

        let leaf = driver.leaf_cgroup(Subsystem::Memory, "a/b").unwrap();
        assert_eq!(leaf.path(), dir.as_path().join("memory/ozoned/a/b"));
    }

    #[test]
    fn test_knob_write_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let driver = scratch_driver(dir.as_path(), "ozoned");
        let leaf = driver.leaf_cgroup(Subsystem::Memory, "a").unwrap();
        leaf.create().unwrap();

        leaf.set_knob_raw("memory.limit_in_bytes", "1048576").unwrap();
        let knob = leaf.path().join("memory.limit_in_bytes");
        let before = fs::metadata(&knob).unwrap().modified().unwrap();

        // Same value: the file must not be rewritten.
        leaf.set_knob("memory.limit_in_bytes", "1048576").unwrap();
        let after = fs::metadata(&knob).unwrap().modified().unwrap();
        assert_eq!(before, after);

        leaf.set_knob("memory.limit_in_bytes", "2097152").unwrap();
        assert_eq!(leaf.get_knob_u64("memory.limit_in_bytes").unwrap(), 2097152);
    }

    #[test]
    fn test_missing_knob_is_reported() {
        let dir = TempDir::new().unwrap();
        let driver = scratch_driver(dir.as_path(), "ozoned");
        let leaf = driver.leaf_cgroup(Subsystem::Memory, "a").unwrap();
        leaf.create().unwrap();

        assert!(!leaf.has_knob("memory.low_limit_in_bytes"));
        assert!(leaf.set_knob("memory.low_limit_in_bytes", "1").is_err());
    }

    #[test]
    fn test_task_enumeration() {
        let dir = TempDir::new().unwrap();
        let driver = scratch_driver(dir.as_path(), "ozoned");
        let leaf = driver.leaf_cgroup(Subsystem::Freezer, "a").unwrap();
        leaf.create().unwrap();

        fs::write(leaf.path().join("tasks"), "101\n102\n").unwrap();
        fs::write(leaf.path().join("cgroup.procs"), "101\n").unwrap();

        assert_eq!(leaf.tasks().unwrap(), vec![101, 102]);
        assert_eq!(leaf.procs().unwrap(), vec![101]);
        assert!(!leaf.is_empty());

        fs::write(leaf.path().join("tasks"), "").unwrap();
        assert!(leaf.is_empty());
    }
}

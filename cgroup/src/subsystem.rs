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

//! Semantic operations on leaf cgroups, one section per controller.

use std::os::unix::io::AsRawFd;

use anyhow::{anyhow, Context, Result};
use log::warn;
use vmm_sys_util::eventfd::EventFd;

use crate::{open_readonly, Cgroup, CgroupError};
use util::time::sleep_while;

pub const KNOB_MEM_LIMIT: &str = "memory.limit_in_bytes";
pub const KNOB_MEM_GUARANTEE: &str = "memory.low_limit_in_bytes";
pub const KNOB_MEM_SOFT_LIMIT: &str = "memory.soft_limit_in_bytes";
pub const KNOB_MEM_RECHARGE: &str = "memory.recharge_on_pgfault";
pub const KNOB_MEM_IO_LIMIT: &str = "memory.fs_bps_limit";
pub const KNOB_MEM_USE_HIERARCHY: &str = "memory.use_hierarchy";
pub const KNOB_CPU_SMART: &str = "cpu.smart";

const FREEZER_SETTLE_MS: u64 = 3000;

// memory

/// Hard limit in bytes; 0 lifts the limit.
pub fn set_memory_limit(cg: &Cgroup, limit: u64) -> Result<()> {
    if limit == 0 && !cg.has_knob(KNOB_MEM_LIMIT) {
        return Ok(());
    }
    let value = if limit == 0 {
        "-1".to_string()
    } else {
        limit.to_string()
    };
    cg.set_knob(KNOB_MEM_LIMIT, &value)
}

/// Low-limit guarantee; requires a kernel with low_limit support.
pub fn set_memory_guarantee(cg: &Cgroup, guarantee: u64) -> Result<()> {
    if !cg.has_knob(KNOB_MEM_GUARANTEE) {
        if guarantee == 0 {
            return Ok(());
        }
        return Err(anyhow!(CgroupError::NoKnob(KNOB_MEM_GUARANTEE.to_string())));
    }
    cg.set_knob_u64(KNOB_MEM_GUARANTEE, guarantee)
}

pub fn set_soft_limit(cg: &Cgroup, limit: u64) -> Result<()> {
    cg.set_knob_u64(KNOB_MEM_SOFT_LIMIT, limit)
}

pub fn get_soft_limit(cg: &Cgroup) -> Result<u64> {
    cg.get_knob_u64(KNOB_MEM_SOFT_LIMIT)
}

pub fn set_recharge_on_pgfault(cg: &Cgroup, recharge: bool) -> Result<()> {
    if !cg.has_knob(KNOB_MEM_RECHARGE) {
        if !recharge {
            return Ok(());
        }
        return Err(anyhow!(CgroupError::NoKnob(KNOB_MEM_RECHARGE.to_string())));
    }
    cg.set_knob(KNOB_MEM_RECHARGE, if recharge { "1" } else { "0" })
}

/// Per-cgroup filesystem bandwidth limit; 0 lifts the limit.
pub fn set_io_limit(cg: &Cgroup, limit: u64) -> Result<()> {
    if !cg.has_knob(KNOB_MEM_IO_LIMIT) {
        if limit == 0 {
            return Ok(());
        }
        return Err(anyhow!(CgroupError::NoKnob(KNOB_MEM_IO_LIMIT.to_string())));
    }
    cg.set_knob_u64(KNOB_MEM_IO_LIMIT, limit)
}

/// Hierarchical accounting. The kernel refuses to clear the flag once
/// child groups exist, so callers treat failure as tolerated.
pub fn use_hierarchy(cg: &Cgroup, on: bool) -> Result<()> {
    cg.set_knob(KNOB_MEM_USE_HIERARCHY, if on { "1" } else { "0" })
}

/// Register an OOM eventfd with `memory.oom_control` through
/// `cgroup.event_control`. The returned eventfd becomes readable when
/// the kernel kills a task in this cgroup for exceeding its limit.
/// Returns None on kernels without the control file.
pub fn register_oom_event(cg: &Cgroup) -> Result<Option<EventFd>> {
    if !cg.has_knob("memory.oom_control") {
        warn!("No memory.oom_control in {:?}, OOM events disabled", cg.path());
        return Ok(None);
    }

    let efd = EventFd::new(libc::EFD_CLOEXEC | libc::EFD_NONBLOCK)
        .with_context(|| "Failed to create OOM eventfd")?;

    let oom_control = open_readonly(&cg.path().join("memory.oom_control"))?;
    let request = format!("{} {}", efd.as_raw_fd(), oom_control.as_raw_fd());
    cg.set_knob_raw("cgroup.event_control", &request)?;

    Ok(Some(efd))
}

// cpu

/// Scheduling policy: normal, rt or idle. `rt` maps to the `cpu.smart`
/// knob where the kernel provides it.
pub fn set_cpu_policy(cg: &Cgroup, policy: &str) -> Result<()> {
    match policy {
        "normal" => {
            if cg.has_knob(KNOB_CPU_SMART) {
                cg.set_knob(KNOB_CPU_SMART, "0")?;
            }
            Ok(())
        }
        "rt" => {
            if !cg.has_knob(KNOB_CPU_SMART) {
                return Err(anyhow!(CgroupError::NoKnob(KNOB_CPU_SMART.to_string())));
            }
            cg.set_knob(KNOB_CPU_SMART, "1")
        }
        "idle" => Err(anyhow!(CgroupError::NoKnob("cpu idle policy".to_string()))),
        _ => Err(anyhow!(CgroupError::WriteKnob(
            policy.to_string(),
            "cpu policy".to_string(),
        ))),
    }
}

/// CPU limit in percent of one core; 0 or >= 100 lifts the quota.
pub fn set_cpu_limit(cg: &Cgroup, percent: u64) -> Result<()> {
    if percent == 0 || percent >= 100 {
        if !cg.has_knob("cpu.cfs_quota_us") {
            return Ok(());
        }
        return cg.set_knob("cpu.cfs_quota_us", "-1");
    }
    let period = cg.get_knob_u64("cpu.cfs_period_us")?;
    cg.set_knob_u64("cpu.cfs_quota_us", period * percent / 100)
}

/// CPU guarantee in percent, expressed through cpu.shares.
pub fn set_cpu_guarantee(cg: &Cgroup, percent: u64) -> Result<()> {
    if percent == 0 && !cg.has_knob("cpu.shares") {
        return Ok(());
    }
    let shares = std::cmp::max(2, 1024 * percent / 100);
    cg.set_knob_u64("cpu.shares", shares)
}

// blkio

/// Batch workloads get half the default IO weight.
pub fn set_blkio_policy(cg: &Cgroup, batch: bool) -> Result<()> {
    if !cg.has_knob("blkio.weight") {
        if !batch {
            return Ok(());
        }
        return Err(anyhow!(CgroupError::NoKnob("blkio.weight".to_string())));
    }
    cg.set_knob("blkio.weight", if batch { "500" } else { "1000" })
}

// freezer

pub const FREEZER_FROZEN: &str = "FROZEN";
pub const FREEZER_THAWED: &str = "THAWED";

pub fn is_frozen(cg: &Cgroup) -> bool {
    matches!(cg.get_knob("freezer.state"), Ok(state) if state.starts_with(FREEZER_FROZEN))
}

/// Freeze every task in the cgroup, waiting for the kernel to settle.
pub fn freeze(cg: &Cgroup) -> Result<()> {
    cg.set_knob_raw("freezer.state", FREEZER_FROZEN)?;
    if !sleep_while(FREEZER_SETTLE_MS, || !is_frozen(cg)) {
        return Err(anyhow!(CgroupError::FreezerStuck(FREEZER_FROZEN)));
    }
    Ok(())
}

pub fn unfreeze(cg: &Cgroup) -> Result<()> {
    cg.set_knob_raw("freezer.state", FREEZER_THAWED)?;
    if !sleep_while(FREEZER_SETTLE_MS, || is_frozen(cg)) {
        return Err(anyhow!(CgroupError::FreezerStuck(FREEZER_THAWED)));
    }
    Ok(())
}

// devices

/// Replace the device whitelist: deny everything, then allow each rule.
pub fn allow_devices(cg: &Cgroup, rules: &[String]) -> Result<()> {
    cg.set_knob_raw("devices.deny", "a")?;
    for rule in rules {
        cg.set_knob_raw("devices.allow", rule)?;
    }
    Ok(())
}

// net_cls

pub fn set_classid(cg: &Cgroup, classid: u32) -> Result<()> {
    let value = classid.to_string();
    if cg.has_knob("net_cls.classid") && cg.get_knob("net_cls.classid")? == value {
        return Ok(());
    }
    cg.set_knob_raw("net_cls.classid", &value)
}

/// Apply `use_hierarchy` tolerantly: log and continue on refusal so a
/// config flip does not wedge running containers.
pub fn use_hierarchy_tolerant(cg: &Cgroup, on: bool) {
    if let Err(e) = use_hierarchy(cg, on) {
        warn!("Can't set use_hierarchy for {:?}: {:?}", cg.path(), e);
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::{scratch_driver, Subsystem};
    use vmm_sys_util::tempdir::TempDir;

    #[test]
    fn test_memory_limit_zero_lifts() {
        let dir = TempDir::new().unwrap();
        let driver = scratch_driver(dir.as_path(), "ozoned");
        let cg = driver.leaf_cgroup(Subsystem::Memory, "a").unwrap();
        cg.create().unwrap();
        cg.set_knob_raw(KNOB_MEM_LIMIT, "9223372036854771712").unwrap();

        set_memory_limit(&cg, 0).unwrap();
        assert_eq!(cg.get_knob(KNOB_MEM_LIMIT).unwrap(), "-1");

        set_memory_limit(&cg, 4 << 20).unwrap();
        assert_eq!(cg.get_knob_u64(KNOB_MEM_LIMIT).unwrap(), 4 << 20);
    }

    #[test]
    fn test_guarantee_requires_kernel_support() {
        let dir = TempDir::new().unwrap();
        let driver = scratch_driver(dir.as_path(), "ozoned");
        let cg = driver.leaf_cgroup(Subsystem::Memory, "a").unwrap();
        cg.create().unwrap();

        // Knob missing: zero is a no-op, non-zero is an error.
        assert!(set_memory_guarantee(&cg, 0).is_ok());
        assert!(set_memory_guarantee(&cg, 1 << 20).is_err());

        cg.set_knob_raw(KNOB_MEM_GUARANTEE, "0").unwrap();
        set_memory_guarantee(&cg, 1 << 20).unwrap();
        assert_eq!(cg.get_knob_u64(KNOB_MEM_GUARANTEE).unwrap(), 1 << 20);
    }

    #[test]
    fn test_cpu_limit_quota() {
        let dir = TempDir::new().unwrap();
        let driver = scratch_driver(dir.as_path(), "ozoned");
        let cg = driver.leaf_cgroup(Subsystem::Cpu, "a").unwrap();
        cg.create().unwrap();
        cg.set_knob_raw("cpu.cfs_period_us", "100000").unwrap();
        cg.set_knob_raw("cpu.cfs_quota_us", "-1").unwrap();

        set_cpu_limit(&cg, 50).unwrap();
        assert_eq!(cg.get_knob("cpu.cfs_quota_us").unwrap(), "50000");

        set_cpu_limit(&cg, 100).unwrap();
        assert_eq!(cg.get_knob("cpu.cfs_quota_us").unwrap(), "-1");
    }

    #[test]
    fn test_freeze_and_thaw() {
        let dir = TempDir::new().unwrap();
        let driver = scratch_driver(dir.as_path(), "ozoned");
        let cg = driver.leaf_cgroup(Subsystem::Freezer, "a").unwrap();
        cg.create().unwrap();

        freeze(&cg).unwrap();
        assert!(is_frozen(&cg));
        unfreeze(&cg).unwrap();
        assert!(!is_frozen(&cg));
    }

    #[test]
    fn test_allow_devices_rewrites_whitelist() {
        let dir = TempDir::new().unwrap();
        let driver = scratch_driver(dir.as_path(), "ozoned");
        let cg = driver.leaf_cgroup(Subsystem::Devices, "a").unwrap();
        cg.create().unwrap();

        allow_devices(&cg, &["c 1:3 rwm".to_string()]).unwrap();
        assert_eq!(fs::read_to_string(cg.path().join("devices.deny")).unwrap(), "a\n");
        assert_eq!(
            fs::read_to_string(cg.path().join("devices.allow")).unwrap(),
            "c 1:3 rwm\n"
        );
    }
}

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

//! Host-wide loop device pool. A container whose root is a regular
//! file gets a device number here; the number is persisted so restore
//! can reclaim it. Both directions are idempotent.

use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;

use anyhow::{Context, Result};

const LOOP_CONTROL: &str = "/dev/loop-control";
const LOOP_CTL_GET_FREE: libc::c_ulong = 0x4C82;
const LOOP_CTL_REMOVE: libc::c_ulong = 0x4C81;

/// Allocate a free loop device number.
pub fn get_loop_dev() -> Result<i32> {
    let ctl = OpenOptions::new()
        .read(true)
        .write(true)
        .open(LOOP_CONTROL)
        .with_context(|| format!("Failed to open {}", LOOP_CONTROL))?;

    // SAFETY: LOOP_CTL_GET_FREE takes no argument and returns the index.
    let nr = unsafe { libc::ioctl(ctl.as_raw_fd(), LOOP_CTL_GET_FREE) };
    if nr < 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| "Failed to allocate loop device");
    }
    Ok(nr)
}

/// Return a loop device number to the pool. A device that is already
/// gone or still briefly busy is not an error.
pub fn put_loop_dev(nr: i32) -> Result<()> {
    let ctl = OpenOptions::new()
        .read(true)
        .write(true)
        .open(LOOP_CONTROL)
        .with_context(|| format!("Failed to open {}", LOOP_CONTROL))?;

    // SAFETY: LOOP_CTL_REMOVE takes the device index as argument.
    let ret = unsafe { libc::ioctl(ctl.as_raw_fd(), LOOP_CTL_REMOVE, nr as libc::c_long) };
    if ret < 0 {
        let errno = std::io::Error::last_os_error();
        match errno.raw_os_error() {
            Some(libc::ENODEV) | Some(libc::EBUSY) => return Ok(()),
            _ => {
                return Err(errno).with_context(|| format!("Failed to release loop device {}", nr))
            }
        }
    }
    Ok(())
}

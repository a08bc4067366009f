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

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use libc::{c_int, c_void, siginfo_t};
use vmm_sys_util::signal::register_signal_handler;

/// Set by the termination handler; the main loop checks it each pass.
/// Containers keep running: their state is persisted and reclaimed on
/// the next start through restore.
pub static SHUTDOWN: AtomicBool = AtomicBool::new(false);

static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

/// Eventfd written from the handler so a blocked epoll_wait wakes up.
pub fn set_wake_fd(fd: RawFd) {
    WAKE_FD.store(fd, Ordering::SeqCst);
}

extern "C" fn handle_signal_term(_num: c_int, _: *mut siginfo_t, _: *mut c_void) {
    SHUTDOWN.store(true, Ordering::SeqCst);
    let fd = WAKE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let value: u64 = 1;
        // SAFETY: write(2) is async-signal-safe and the buffer is local.
        unsafe {
            libc::write(fd, &value as *const u64 as *const c_void, 8);
        }
    }
}

/// Register kill signal handlers. Signals supported now are SIGTERM and
/// SIGINT.
pub fn register_kill_signal() {
    register_signal_handler(libc::SIGTERM, handle_signal_term)
        .expect("Register signal handler for SIGTERM failed!");
    register_signal_handler(libc::SIGINT, handle_signal_term)
        .expect("Register signal handler for SIGINT failed!");
}

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

use std::thread::sleep;
use std::time::Duration;

pub const MILLISECONDS_PER_SECOND: u64 = 1_000;
pub const NANOSECONDS_PER_MILLISECOND: u64 = 1_000_000;

fn clock_ms(clock: libc::clockid_t) -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a local variable and valid.
    unsafe {
        libc::clock_gettime(clock, &mut ts);
    }
    ts.tv_sec as u64 * MILLISECONDS_PER_SECOND + ts.tv_nsec as u64 / NANOSECONDS_PER_MILLISECOND
}

/// Wall-clock milliseconds since the epoch.
pub fn current_time_ms() -> u64 {
    clock_ms(libc::CLOCK_REALTIME)
}

/// Monotonic milliseconds since an arbitrary origin.
pub fn monotonic_time_ms() -> u64 {
    clock_ms(libc::CLOCK_MONOTONIC)
}

const POLL_STEP_MS: u64 = 100;

/// Poll `pred` until it returns false or `timeout_ms` expires.
///
/// Returns true when the predicate went false in time, false on timeout.
pub fn sleep_while<F>(timeout_ms: u64, mut pred: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = monotonic_time_ms() + timeout_ms;
    loop {
        if !pred() {
            return true;
        }
        let now = monotonic_time_ms();
        if now >= deadline {
            return false;
        }
        sleep(Duration::from_millis(POLL_STEP_MS.min(deadline - now)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_while_immediate() {
        assert!(sleep_while(1000, || false));
    }

    #[test]
    fn test_sleep_while_timeout() {
        let start = monotonic_time_ms();
        assert!(!sleep_while(150, || true));
        assert!(monotonic_time_ms() - start >= 150);
    }

    #[test]
    fn test_sleep_while_counts_down() {
        let mut remaining = 2;
        assert!(sleep_while(5000, || {
            if remaining == 0 {
                return false;
            }
            remaining -= 1;
            true
        }));
    }
}

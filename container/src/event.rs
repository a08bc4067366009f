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

//! Events routed through the supervisor's single dispatch function,
//! and the waiter objects clients block on.

use std::collections::VecDeque;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use log::warn;
use vmm_sys_util::eventfd::EventFd;

/// Everything asynchronous funnels into this variant: the SIGCHLD
/// reaper, per-container OOM eventfds and the timer queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Exit { pid: i32, status: i32 },
    Oom { fd: RawFd },
    Respawn { id: u32 },
    RotateLogs,
}

/// Cross-thread event queue backed by an eventfd, drained on the event
/// loop thread.
pub struct EventQueue {
    efd: EventFd,
    queue: Mutex<VecDeque<Event>>,
}

impl EventQueue {
    pub fn new() -> Result<Self> {
        Ok(EventQueue {
            efd: EventFd::new(libc::EFD_NONBLOCK).with_context(|| "Failed to create eventfd")?,
            queue: Mutex::new(VecDeque::new()),
        })
    }

    pub fn push(&self, event: Event) {
        self.queue.lock().unwrap().push_back(event);
        if let Err(e) = self.efd.write(1) {
            warn!("Failed to signal event queue: {:?}", e);
        }
    }

    pub fn drain(&self) -> Vec<Event> {
        let mut queue = self.queue.lock().unwrap();
        queue.drain(..).collect()
    }

    pub fn raw_fd(&self) -> RawFd {
        self.efd.as_raw_fd()
    }
}

/// A client blocked in a wait call. The registry holds weak references;
/// a waiter is signalled at most once, with the name of the departing
/// container rewritten into the caller's namespace.
pub struct Waiter {
    namespace: String,
    result: Mutex<Option<String>>,
    cond: Condvar,
}

impl Waiter {
    pub fn new(namespace: &str) -> Arc<Self> {
        Arc::new(Waiter {
            namespace: namespace.to_string(),
            result: Mutex::new(None),
            cond: Condvar::new(),
        })
    }

    /// Signal with the absolute container name. Only the first signal
    /// is kept.
    pub fn signal(&self, abs_name: &str) {
        let relative = abs_name
            .strip_prefix(&self.namespace)
            .unwrap_or(abs_name)
            .to_string();
        let mut result = self.result.lock().unwrap();
        if result.is_none() {
            *result = Some(relative);
            self.cond.notify_all();
        }
    }

    pub fn is_signalled(&self) -> bool {
        self.result.lock().unwrap().is_some()
    }

    /// Block until signalled or the timeout expires.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<String> {
        let result = self.result.lock().unwrap();
        let (result, _) = self
            .cond
            .wait_timeout_while(result, timeout, |r| r.is_none())
            .unwrap();
        result.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_drains_in_order() {
        let queue = EventQueue::new().unwrap();
        queue.push(Event::Exit {
            pid: 100,
            status: 0,
        });
        queue.push(Event::RotateLogs);

        let drained = queue.drain();
        assert_eq!(
            drained,
            vec![
                Event::Exit {
                    pid: 100,
                    status: 0
                },
                Event::RotateLogs
            ]
        );
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn test_waiter_signalled_once_with_relative_name() {
        let waiter = Waiter::new("ns/");
        waiter.signal("ns/web/backend");
        waiter.signal("ns/other");

        assert_eq!(
            waiter.wait_timeout(Duration::from_millis(10)),
            Some("web/backend".to_string())
        );
    }

    #[test]
    fn test_waiter_outside_namespace_gets_absolute_name() {
        let waiter = Waiter::new("ns/");
        waiter.signal("elsewhere");
        assert_eq!(
            waiter.wait_timeout(Duration::from_millis(10)),
            Some("elsewhere".to_string())
        );
    }

    #[test]
    fn test_waiter_wakes_blocked_thread() {
        let waiter = Waiter::new("");
        let clone = waiter.clone();
        let thread = std::thread::spawn(move || clone.wait_timeout(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(20));
        waiter.signal("a");
        assert_eq!(thread.join().unwrap(), Some("a".to_string()));
    }
}

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

//! Container lifecycle and resource-coordination engine.

pub mod config;
pub mod container;
pub mod data;
pub mod error;
pub mod event;
pub mod launcher;
pub mod loopdev;
pub mod property;
pub mod registry;
pub mod value;

use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::warn;
use vmm_sys_util::epoll::EventSet;
use vmm_sys_util::eventfd::EventFd;

use cgroup::CgroupDriver;
use kv_store::KvStore;
use network::NetworkManager;
use util::loop_context::{EventNotifier, LoopHandle, NotifierCallback, NotifierOperation};

use config::DaemonConfig;
use event::{Event, EventQueue};
use launcher::TaskLauncher;

/// Host scope; never persisted, never operated on.
pub const ROOT_CONTAINER_ID: u32 = 0;
/// The supervisor's own scope; parent of every top-level container.
pub const SUPERVISOR_ROOT_ID: u32 = 1;
/// First id handed to user containers.
pub const FIRST_CONTAINER_ID: u32 = 2;

/// Daemon-wide counters.
#[derive(Default)]
pub struct Statistics {
    pub created: AtomicU64,
    pub started: AtomicU64,
    pub start_failed: AtomicU64,
    pub oom_kills: AtomicU64,
    pub restore_failed: AtomicU64,
    pub respawns: AtomicU64,
}

impl Statistics {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Explicit context passed to every operation: configuration plus each
/// subsystem behind its narrow interface. No global singletons.
pub struct Engine {
    pub config: DaemonConfig,
    pub kv: KvStore,
    pub cgroups: CgroupDriver,
    pub net: Option<NetworkManager>,
    pub launcher: Arc<dyn TaskLauncher>,
    pub events: Arc<EventQueue>,
    pub stats: Statistics,
    loop_handle: Mutex<Option<LoopHandle>>,
}

impl Engine {
    pub fn new(
        config: DaemonConfig,
        kv: KvStore,
        cgroups: CgroupDriver,
        net: Option<NetworkManager>,
        launcher: Arc<dyn TaskLauncher>,
        events: Arc<EventQueue>,
    ) -> Self {
        Engine {
            config,
            kv,
            cgroups,
            net,
            launcher,
            events,
            stats: Statistics::default(),
            loop_handle: Mutex::new(None),
        }
    }

    /// Attach the event loop; before this, timers degrade to immediate
    /// queue pushes (unit tests drive the queue by hand).
    pub fn set_loop_handle(&self, handle: LoopHandle) {
        *self.loop_handle.lock().unwrap() = Some(handle);
    }

    pub fn has_loop_handle(&self) -> bool {
        self.loop_handle.lock().unwrap().is_some()
    }

    pub fn link_names(&self) -> Vec<String> {
        match &self.net {
            Some(net) => net.interface_names(),
            None => Vec::new(),
        }
    }

    /// Queue `event` after `delay`.
    pub fn schedule(&self, delay: Duration, event: Event) {
        let handle = self.loop_handle.lock().unwrap().clone();
        match handle {
            Some(handle) => {
                let events = self.events.clone();
                handle.delay_call(
                    Box::new(move || {
                        events.push(event.clone());
                    }),
                    delay,
                );
            }
            None => self.events.push(event),
        }
    }

    /// Register an OOM eventfd with the event loop; firing queues
    /// `Event::Oom` for the dispatch function.
    pub fn watch_oom_fd(&self, efd: &EventFd) {
        let handle = self.loop_handle.lock().unwrap().clone();
        if let Some(handle) = handle {
            let events = self.events.clone();
            let callback: Box<NotifierCallback> = Box::new(move |_, fd: RawFd| {
                util::loop_context::read_fd(fd);
                events.push(Event::Oom { fd });
                None
            });
            handle.update_events(vec![EventNotifier::new(
                NotifierOperation::Add,
                efd.as_raw_fd(),
                EventSet::IN,
                vec![Arc::new(Mutex::new(callback))],
            )]);
        }
    }

    pub fn unwatch_oom_fd(&self, efd: &EventFd) {
        let handle = self.loop_handle.lock().unwrap().clone();
        if let Some(handle) = handle {
            handle.update_events(vec![EventNotifier::new(
                NotifierOperation::Delete,
                efd.as_raw_fd(),
                EventSet::IN,
                Vec::new(),
            )]);
        }
    }

    /// Total host memory in bytes, for guarantee admission control.
    pub fn total_memory(&self) -> u64 {
        // SAFETY: an all-zero sysinfo struct is a valid out-param.
        let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
        // SAFETY: info is a local variable and valid.
        let ret = unsafe { libc::sysinfo(&mut info) };
        if ret != 0 {
            warn!("sysinfo failed, assuming unlimited host memory");
            return u64::MAX;
        }
        info.totalram as u64 * info.mem_unit as u64
    }
}

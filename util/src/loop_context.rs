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

use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Debug;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use libc::{c_void, read};
use log::warn;
use vmm_sys_util::epoll::{ControlOperation, Epoll, EpollEvent, EventSet};
use vmm_sys_util::eventfd::EventFd;

use crate::UtilError;
use anyhow::{anyhow, Result};

const READY_EVENT_MAX: usize = 256;

#[derive(Debug, PartialEq, Eq)]
pub enum NotifierOperation {
    /// Add a file descriptor to the event table and bind notifiers to it.
    Add = 1,
    /// Replace the handlers associated with a registered file descriptor.
    Modify = 2,
    /// Delete a file descriptor from the event table.
    Delete = 4,
}

#[derive(Debug, PartialEq, Eq)]
enum EventStatus {
    /// Event is currently monitored in epoll.
    Alive = 0,
    /// Event is removed, waiting for garbage collection.
    Removed = 1,
}

pub type NotifierCallback = dyn Fn(EventSet, RawFd) -> Option<Vec<EventNotifier>> + Send;

/// Epoll Event Notifier Entry.
pub struct EventNotifier {
    /// Raw file descriptor.
    pub raw_fd: i32,
    /// Notifier operation.
    pub op: NotifierOperation,
    /// The types of events for which we use this fd.
    pub event: EventSet,
    /// Event handler list, one fd event may have many handlers.
    pub handlers: Vec<Arc<Mutex<Box<NotifierCallback>>>>,
    /// Event status.
    status: EventStatus,
}

impl fmt::Debug for EventNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventNotifier")
            .field("raw_fd", &self.raw_fd)
            .field("op", &self.op)
            .field("event", &self.event)
            .field("status", &self.status)
            .finish()
    }
}

impl EventNotifier {
    /// Constructs a new `EventNotifier`.
    pub fn new(
        op: NotifierOperation,
        raw_fd: i32,
        event: EventSet,
        handlers: Vec<Arc<Mutex<Box<NotifierCallback>>>>,
    ) -> Self {
        EventNotifier {
            raw_fd,
            op,
            event,
            handlers,
            status: EventStatus::Alive,
        }
    }
}

/// EventLoop manager, advise continue running or stop running.
pub trait EventLoopManager: Send + Sync {
    fn loop_should_exit(&self) -> bool;
    fn loop_cleanup(&self) -> Result<()>;
}

/// Timer structure is used for delay function execution.
struct Timer {
    /// Given the function that will be called.
    func: Box<dyn Fn() + Send>,
    /// Given the real time when the `func` will be called.
    expire_time: Instant,
}

impl Timer {
    pub fn new(func: Box<dyn Fn() + Send>, delay: Duration) -> Self {
        Timer {
            func,
            expire_time: Instant::now() + delay,
        }
    }
}

/// Cloneable handle that lets worker threads feed the loop: register or
/// delete fd notifiers and schedule delayed calls. The loop's epoll wait
/// is kicked through an eventfd so a cross-thread update takes effect
/// without waiting for the next natural wakeup.
#[derive(Clone)]
pub struct LoopHandle {
    requests: Arc<Mutex<Vec<EventNotifier>>>,
    timers: Arc<Mutex<Vec<Timer>>>,
    kick: Arc<EventFd>,
}

impl LoopHandle {
    /// Queue notifier updates to be applied by the loop thread.
    pub fn update_events(&self, notifiers: Vec<EventNotifier>) {
        self.requests.lock().unwrap().extend(notifiers);
        if let Err(e) = self.kick.write(1) {
            warn!("Failed to kick event loop: {:?}", e);
        }
    }

    /// Call the function given by `func` after `delay`.
    pub fn delay_call(&self, func: Box<dyn Fn() + Send>, delay: Duration) {
        let timer = Timer::new(func, delay);
        let mut timers = self.timers.lock().unwrap();

        // insert in order of expire_time
        let mut index = timers.len();
        for (i, t) in timers.iter().enumerate() {
            if timer.expire_time < t.expire_time {
                index = i;
                break;
            }
        }
        timers.insert(index, timer);
        drop(timers);

        if let Err(e) = self.kick.write(1) {
            warn!("Failed to kick event loop: {:?}", e);
        }
    }
}

/// Epoll Loop Context
#[allow(clippy::vec_box)]
pub struct EventLoopContext {
    /// Epoll file descriptor.
    epoll: Epoll,
    /// Control epoll loop running.
    manager: Option<Arc<Mutex<dyn EventLoopManager>>>,
    /// Fds registered to the `EventLoop`.
    events: Arc<RwLock<BTreeMap<RawFd, Box<EventNotifier>>>>,
    /// Events abandoned are stored in garbage collector.
    gc: Arc<RwLock<Vec<Box<EventNotifier>>>>,
    /// Temp events vector, store wait returned events.
    ready_events: Vec<EpollEvent>,
    /// Timer list, shared with `LoopHandle`.
    timers: Arc<Mutex<Vec<Timer>>>,
    /// Notifier updates queued by other threads.
    requests: Arc<Mutex<Vec<EventNotifier>>>,
    /// Wakes the epoll wait when timers or requests change.
    kick: Arc<EventFd>,
}

// SAFETY: pointers stored as epoll event data reference boxes owned by
// `events`, which are only dropped through the gc after removal.
unsafe impl Sync for EventLoopContext {}
// SAFETY: see above.
unsafe impl Send for EventLoopContext {}

impl EventLoopContext {
    /// Constructs a new `EventLoopContext`.
    pub fn new() -> Self {
        let mut ctx = EventLoopContext {
            epoll: Epoll::new().unwrap(),
            manager: None,
            events: Arc::new(RwLock::new(BTreeMap::new())),
            gc: Arc::new(RwLock::new(Vec::new())),
            ready_events: vec![EpollEvent::default(); READY_EVENT_MAX],
            timers: Arc::new(Mutex::new(Vec::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
            kick: Arc::new(EventFd::new(libc::EFD_NONBLOCK).unwrap()),
        };

        let kick_fd = ctx.kick.as_raw_fd();
        let handler: Box<NotifierCallback> = Box::new(move |_, fd| {
            read_fd(fd);
            None
        });
        ctx.add_event(EventNotifier::new(
            NotifierOperation::Add,
            kick_fd,
            EventSet::IN,
            vec![Arc::new(Mutex::new(handler))],
        ))
        .unwrap();

        ctx
    }

    pub fn set_manager(&mut self, manager: Arc<Mutex<dyn EventLoopManager>>) {
        self.manager = Some(manager);
    }

    /// Get a handle for cross-thread notifier updates and timers.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            requests: self.requests.clone(),
            timers: self.timers.clone(),
            kick: self.kick.clone(),
        }
    }

    fn clear_gc(&mut self) {
        let mut gc = self.gc.write().unwrap();
        gc.clear();
    }

    fn add_event(&mut self, event: EventNotifier) -> Result<()> {
        // If the fd is already monitored, just append the new handlers.
        let mut events_map = self.events.write().unwrap();
        if let Some(notifier) = events_map.get_mut(&event.raw_fd) {
            let mut event = event;
            notifier.handlers.append(&mut event.handlers);
            return Ok(());
        }

        let raw_fd = event.raw_fd;
        events_map.insert(raw_fd, Box::new(event));
        let event = events_map.get(&raw_fd).unwrap();
        self.epoll.ctl(
            ControlOperation::Add,
            event.raw_fd,
            EpollEvent::new(event.event, &**event as *const _ as u64),
        )?;

        Ok(())
    }

    fn rm_event(&mut self, event: &EventNotifier) -> Result<()> {
        let mut events_map = self.events.write().unwrap();
        match events_map.get_mut(&event.raw_fd) {
            Some(notifier) => {
                if let EventStatus::Alive = notifier.status {
                    if let Err(error) = self.epoll.ctl(
                        ControlOperation::Delete,
                        notifier.raw_fd,
                        EpollEvent::default(),
                    ) {
                        let error_num = error.raw_os_error().unwrap();
                        if error_num != libc::EBADF && error_num != libc::ENOENT {
                            return Err(anyhow!(UtilError::BadSyscall(error)));
                        }
                    }
                }

                notifier.status = EventStatus::Removed;
                let event = events_map.remove(&event.raw_fd).unwrap();
                self.gc.write().unwrap().push(event);
            }
            _ => {
                return Err(anyhow!(UtilError::NoRegisterFd(event.raw_fd)));
            }
        }

        Ok(())
    }

    /// Change the callback for an event.
    fn modify_event(&mut self, event: EventNotifier) -> Result<()> {
        let mut events_map = self.events.write().unwrap();
        match events_map.get_mut(&event.raw_fd) {
            Some(notifier) => {
                notifier.handlers.clear();
                let mut event = event;
                notifier.handlers.append(&mut event.handlers);
            }
            _ => {
                return Err(anyhow!(UtilError::NoRegisterFd(event.raw_fd)));
            }
        }
        Ok(())
    }

    /// Update fds registered to `EventLoop` according to the operation type.
    ///
    /// # Arguments
    ///
    /// * `notifiers` - event notifiers wanted to add to or remove from `EventLoop`.
    pub fn update_events(&mut self, notifiers: Vec<EventNotifier>) -> Result<()> {
        for en in notifiers {
            match en.op {
                NotifierOperation::Add => {
                    self.add_event(en)?;
                }
                NotifierOperation::Modify => {
                    self.modify_event(en)?;
                }
                NotifierOperation::Delete => {
                    self.rm_event(&en)?;
                }
            }
        }

        Ok(())
    }

    fn drain_requests(&mut self) -> Result<()> {
        let requests = {
            let mut requests = self.requests.lock().unwrap();
            std::mem::take(&mut *requests)
        };
        self.update_events(requests)
    }

    /// Executes `epoll.wait()` to wait for events, and call the responding callbacks.
    pub fn run(&mut self) -> Result<bool> {
        if let Some(manager) = &self.manager {
            if manager.lock().unwrap().loop_should_exit() {
                manager.lock().unwrap().loop_cleanup()?;
                return Ok(false);
            }
        }

        self.drain_requests()?;
        self.epoll_wait_manager(self.timers_min_timeout())
    }

    /// Get the expire_time of the soonest Timer, and then translate it to timeout.
    fn timers_min_timeout(&self) -> i32 {
        let timers = self.timers.lock().unwrap();
        if timers.is_empty() {
            return -1;
        }

        let now = Instant::now();
        if timers[0].expire_time <= now {
            return 0;
        }

        let timeout = (timers[0].expire_time - now).as_millis();
        if timeout >= i32::MAX as u128 {
            i32::MAX - 1
        } else {
            timeout as i32
        }
    }

    /// Call function of the timers which have already expired.
    fn run_timers(&mut self) {
        let now = Instant::now();
        let expired_timers: Vec<Timer> = {
            let mut timers = self.timers.lock().unwrap();
            let mut expired_nr = 0;
            for timer in timers.iter() {
                if timer.expire_time > now {
                    break;
                }
                expired_nr += 1;
            }
            timers.drain(0..expired_nr).collect()
        };

        for timer in expired_timers {
            (timer.func)();
        }
    }

    fn epoll_wait_manager(&mut self, time_out: i32) -> Result<bool> {
        let ev_count = match self.epoll.wait(time_out, &mut self.ready_events[..]) {
            Ok(ev_count) => ev_count,
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => 0,
            Err(e) => return Err(anyhow!(UtilError::EpollWait(e))),
        };

        for i in 0..ev_count {
            // SAFETY: elements in self.events never get released in other functions.
            let event = unsafe {
                let event_ptr = self.ready_events[i].data() as *const EventNotifier;
                &*event_ptr as &EventNotifier
            };
            if let EventStatus::Alive = event.status {
                let mut notifiers = Vec::new();
                for j in 0..event.handlers.len() {
                    let handle = event.handlers[j].lock().unwrap();
                    if let Some(mut notifier) =
                        handle(self.ready_events[i].event_set(), event.raw_fd)
                    {
                        notifiers.append(&mut notifier);
                    }
                }
                self.update_events(notifiers)?;
            }
        }

        self.run_timers();
        self.clear_gc();
        Ok(true)
    }
}

impl Default for EventLoopContext {
    fn default() -> Self {
        Self::new()
    }
}

pub fn read_fd(fd: RawFd) -> u64 {
    let mut value: u64 = 0;

    // SAFETY: value is a local variable sized for the read.
    let ret = unsafe {
        read(
            fd,
            &mut value as *mut u64 as *mut c_void,
            std::mem::size_of::<u64>(),
        )
    };

    if ret == -1 {
        warn!("Failed to read fd");
    }

    value
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use vmm_sys_util::eventfd::EventFd;

    impl EventLoopContext {
        fn check_existence(&self, fd: RawFd) -> Option<bool> {
            let events_map = self.events.read().unwrap();
            events_map
                .get(&fd)
                .map(|notifier| notifier.status == EventStatus::Alive)
        }
    }

    fn counting_handler(hits: Arc<AtomicU64>) -> Arc<Mutex<Box<NotifierCallback>>> {
        let handler: Box<NotifierCallback> = Box::new(move |_, fd| {
            read_fd(fd);
            hits.fetch_add(1, Ordering::SeqCst);
            None
        });
        Arc::new(Mutex::new(handler))
    }

    #[test]
    fn test_add_and_fire() {
        let mut mainloop = EventLoopContext::new();
        let fd = EventFd::new(libc::EFD_NONBLOCK).unwrap();
        let hits = Arc::new(AtomicU64::new(0));

        mainloop
            .update_events(vec![EventNotifier::new(
                NotifierOperation::Add,
                fd.as_raw_fd(),
                EventSet::IN,
                vec![counting_handler(hits.clone())],
            )])
            .unwrap();

        fd.write(1).unwrap();
        mainloop.run().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(mainloop.check_existence(fd.as_raw_fd()).unwrap());
    }

    #[test]
    fn test_delete_event() {
        let mut mainloop = EventLoopContext::new();
        let fd = EventFd::new(libc::EFD_NONBLOCK).unwrap();
        let hits = Arc::new(AtomicU64::new(0));

        mainloop
            .update_events(vec![EventNotifier::new(
                NotifierOperation::Add,
                fd.as_raw_fd(),
                EventSet::IN,
                vec![counting_handler(hits.clone())],
            )])
            .unwrap();
        mainloop
            .update_events(vec![EventNotifier::new(
                NotifierOperation::Delete,
                fd.as_raw_fd(),
                EventSet::IN,
                Vec::new(),
            )])
            .unwrap();

        // The write must go unnoticed; a short timer bounds the wait.
        fd.write(1).unwrap();
        mainloop
            .handle()
            .delay_call(Box::new(|| {}), Duration::from_millis(10));
        mainloop.run().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(mainloop.check_existence(fd.as_raw_fd()).is_none());
    }

    #[test]
    fn test_cross_thread_timer() {
        let mut mainloop = EventLoopContext::new();
        let handle = mainloop.handle();
        let hits = Arc::new(AtomicU64::new(0));

        let hits2 = hits.clone();
        let thread = std::thread::spawn(move || {
            handle.delay_call(
                Box::new(move || {
                    hits2.fetch_add(1, Ordering::SeqCst);
                }),
                Duration::from_millis(10),
            );
        });
        thread.join().unwrap();

        // First run is woken by the kick, second waits out the timer.
        mainloop.run().unwrap();
        while hits.load(Ordering::SeqCst) == 0 {
            mainloop.run().unwrap();
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}

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

//! Container registry: the name map, the id allocator, the holder lock
//! and every operation that can touch more than one container.
//!
//! Lock order, strictly: holder -> container -> network. Multi-container
//! operations snapshot the tree under the holder lock, then process one
//! container lock at a time; bounded kernel polls run under at most the
//! single container lock. Only property writes hold the holder lock
//! together with container locks, which serializes the hierarchical
//! limit checks.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{info, warn};

use cgroup::{subsystem as cgknob, Subsystem};
use kv_store::KvNode;
use util::time::sleep_while;
use util::unix::pid_alive;

use crate::container::{
    Container, ContainerState, Cred, ROOT_CONTAINER, SUPERVISOR_ROOT_CONTAINER,
};
use crate::data::{D_RESPAWN_COUNT, D_START_ERRNO};
use crate::error::{errno_of, Error, Result};
use crate::event::{Event, Waiter};
use crate::launcher::Task;
use crate::property::{
    alias_to_property, parse_property_name, property_to_alias, P_COMMAND, P_ISOLATE,
    P_MEM_GUARANTEE, P_PORTO_NAMESPACE, P_RAW_DEATH_TIME, P_RAW_NAME, P_RAW_ROOT_PID,
    P_RAW_START_TIME, P_VIRT_MODE, VIRT_MODE_OS, ALIASES, HIERARCHICAL_PROPS,
};
use crate::value::{
    Value, ValueKind, OS_MODE, PARENT_RO, PATH, RESTRICTED_ROOT_ONLY, S_RUNNING, SUPERUSER_ONLY,
};
use crate::{Engine, Statistics, FIRST_CONTAINER_ID, ROOT_CONTAINER_ID, SUPERVISOR_ROOT_ID};

const MAX_NAME_DEPTH: usize = 7;
const MAX_NAME_LEN: usize = 128;
const META_SOFT_LIMIT: u64 = 1 << 20;
/// Exit status recorded for OOM kills: terminated by SIGKILL.
const OOM_EXIT_STATUS: i32 = libc::SIGKILL;

struct IdAlloc {
    bits: Vec<u64>,
    max: u32,
}

impl IdAlloc {
    fn new(max: u32) -> Self {
        IdAlloc {
            bits: vec![0; (max as usize + 63) / 64],
            max,
        }
    }

    fn mark(&mut self, id: u32) -> bool {
        if id >= self.max || self.bits[id as usize / 64] & (1u64 << (id % 64)) != 0 {
            return false;
        }
        self.bits[id as usize / 64] |= 1u64 << (id % 64);
        true
    }

    fn allocate(&mut self) -> Option<u32> {
        for id in FIRST_CONTAINER_ID..self.max {
            if self.mark(id) {
                return Some(id);
            }
        }
        None
    }

    fn retire(&mut self, id: u32) {
        if id < self.max {
            self.bits[id as usize / 64] &= !(1u64 << (id % 64));
        }
    }
}

struct Holder {
    names: HashMap<String, u32>,
    arena: HashMap<u32, Arc<Container>>,
    ids: IdAlloc,
}

pub struct Registry {
    engine: Arc<Engine>,
    holder: Mutex<Holder>,
}

fn name_depth(name: &str) -> usize {
    name.split('/').count()
}

fn parent_name(name: &str) -> Option<&str> {
    name.rfind('/').map(|pos| &name[..pos])
}

fn valid_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(Error::InvalidValue(format!("invalid container name: {}", name)));
    }
    if name == ROOT_CONTAINER || name == SUPERVISOR_ROOT_CONTAINER {
        return Err(Error::Permission(format!("{} is a reserved name", name)));
    }
    if name_depth(name) > MAX_NAME_DEPTH {
        return Err(Error::InvalidValue(format!(
            "container name depth exceeds {}",
            MAX_NAME_DEPTH
        )));
    }
    for component in name.split('/') {
        if component.is_empty() {
            return Err(Error::InvalidValue(format!("invalid container name: {}", name)));
        }
        for ch in component.chars() {
            if !(ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' || ch == '.' || ch == '@') {
                return Err(Error::InvalidValue(format!(
                    "invalid character '{}' in container name",
                    ch
                )));
            }
        }
    }
    Ok(())
}

impl Registry {
    pub fn new(engine: Arc<Engine>) -> Arc<Self> {
        let max = engine.config.container.max_containers + FIRST_CONTAINER_ID;
        let mut holder = Holder {
            names: HashMap::new(),
            arena: HashMap::new(),
            ids: IdAlloc::new(max),
        };

        for (id, name, parent) in [
            (ROOT_CONTAINER_ID, ROOT_CONTAINER, None),
            (SUPERVISOR_ROOT_ID, SUPERVISOR_ROOT_CONTAINER, Some(ROOT_CONTAINER_ID)),
        ] {
            holder.ids.mark(id);
            let c = Container::new(id, name, parent, Cred::default());
            c.lock().state = ContainerState::Meta;
            holder.names.insert(name.to_string(), id);
            holder.arena.insert(id, c);
        }
        {
            let root = holder.arena.get(&ROOT_CONTAINER_ID).unwrap();
            root.lock().children.push(SUPERVISOR_ROOT_ID);
        }

        Arc::new(Registry {
            engine,
            holder: Mutex::new(holder),
        })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    // Phase-A helpers: all tree lookups happen under the holder lock and
    // never while a container lock is held.

    fn resolve(&self, name: &str) -> Result<Arc<Container>> {
        let holder = self.holder.lock().unwrap();
        holder
            .names
            .get(name)
            .and_then(|id| holder.arena.get(id))
            .cloned()
            .ok_or_else(|| Error::ContainerDoesNotExist(name.to_string()))
    }

    fn resolve_user(&self, name: &str) -> Result<Arc<Container>> {
        let c = self.resolve(name)?;
        if c.is_root() || c.is_supervisor_root() {
            return Err(Error::Permission(format!(
                "{} is provided in read-only mode",
                name
            )));
        }
        Ok(c)
    }

    fn by_id(&self, id: u32) -> Option<Arc<Container>> {
        self.holder.lock().unwrap().arena.get(&id).cloned()
    }

    /// Ancestor chain, nearest parent first, roots included.
    fn ancestors(&self, c: &Container) -> Vec<Arc<Container>> {
        let holder = self.holder.lock().unwrap();
        let mut chain = Vec::new();
        let mut cursor = c.parent_id();
        while let Some(id) = cursor {
            match holder.arena.get(&id) {
                Some(parent) => {
                    cursor = parent.parent_id();
                    chain.push(parent.clone());
                }
                None => break,
            }
        }
        chain
    }

    fn children_of(&self, c: &Container) -> Vec<Arc<Container>> {
        let holder = self.holder.lock().unwrap();
        let ids = c.lock().children.clone();
        ids.iter()
            .filter_map(|id| holder.arena.get(id).cloned())
            .collect()
    }

    /// Descendants with every parent ahead of its children; reversing
    /// the list therefore gives a safe bottom-up order.
    fn subtree(&self, c: &Arc<Container>) -> Vec<Arc<Container>> {
        let holder = self.holder.lock().unwrap();
        let mut result = Vec::new();
        let mut frontier = vec![c.clone()];
        while let Some(node) = frontier.pop() {
            let ids = node.lock().children.clone();
            for id in ids {
                if let Some(child) = holder.arena.get(&id) {
                    result.push(child.clone());
                    frontier.push(child.clone());
                }
            }
        }
        result
    }

    fn find_by_pid(&self, pid: i32) -> Option<Arc<Container>> {
        let candidates: Vec<Arc<Container>> = {
            let holder = self.holder.lock().unwrap();
            holder.arena.values().cloned().collect()
        };
        candidates.into_iter().find(|c| {
            let inner = c.lock();
            matches!(&inner.task, Some(task) if task.pid() == pid)
        })
    }

    fn find_by_oom_fd(&self, fd: i32) -> Option<Arc<Container>> {
        use std::os::unix::io::AsRawFd;
        let candidates: Vec<Arc<Container>> = {
            let holder = self.holder.lock().unwrap();
            holder.arena.values().cloned().collect()
        };
        candidates.into_iter().find(|c| {
            let inner = c.lock();
            matches!(&inner.oom_efd, Some(efd) if efd.as_raw_fd() == fd)
        })
    }

    /// Demote a lost-and-restored container that can no longer produce
    /// events. Called at the top of every operation.
    fn sync_container(&self, c: &Arc<Container>) {
        let demote = {
            let mut inner = c.lock();
            c.lost_and_empty(&self.engine, &mut inner)
        };
        if demote {
            self.exit_one(c, -1, false, true);
        }
    }

    // Creation and destruction.

    pub fn create(&self, name: &str, cred: Cred) -> Result<()> {
        valid_name(name)?;

        let (c, parent) = {
            let mut holder = self.holder.lock().unwrap();
            if holder.names.contains_key(name) {
                return Err(Error::ContainerAlreadyExists(name.to_string()));
            }

            let parent_id = match parent_name(name) {
                None => SUPERVISOR_ROOT_ID,
                Some(parent) => *holder
                    .names
                    .get(parent)
                    .ok_or_else(|| Error::ContainerDoesNotExist(parent.to_string()))?,
            };
            let parent = holder.arena.get(&parent_id).cloned().unwrap();

            let id = holder
                .ids
                .allocate()
                .ok_or_else(|| Error::ResourceNotAvailable("out of container ids".to_string()))?;

            let c = Container::new(id, name, Some(parent_id), cred);
            holder.names.insert(name.to_string(), id);
            holder.arena.insert(id, c.clone());
            (c, parent)
        };

        info!(
            "Create {} with id {} uid {} gid {}",
            name,
            c.id(),
            cred.uid,
            cred.gid
        );

        let prepared = {
            let mut inner = c.lock();
            c.prepare(&self.engine, &mut inner, cred).map(|_| {
                c.write_state(&self.engine, &mut inner, ContainerState::Stopped);
            })
        };
        if let Err(e) = prepared {
            warn!("Can't prepare container {}: {}", name, e);
            let _ = self.engine.kv.remove(&c.kv_node());
            let mut holder = self.holder.lock().unwrap();
            holder.names.remove(name);
            holder.arena.remove(&c.id());
            holder.ids.retire(c.id());
            return Err(e);
        }

        {
            let _holder = self.holder.lock().unwrap();
            parent.lock().children.push(c.id());
        }
        Statistics::bump(&self.engine.stats.created);
        Ok(())
    }

    pub fn destroy(&self, name: &str) -> Result<()> {
        let c = self.resolve_user(name)?;
        info!("Destroy {} {}", name, c.id());
        self.sync_container(&c);

        // Bottom-up: reversed breadth-first order ends with the target.
        let mut members = self.subtree(&c);
        members.reverse();
        members.push(c.clone());
        for member in members {
            self.destroy_leaf(&member)?;
        }
        Ok(())
    }

    fn destroy_leaf(&self, c: &Arc<Container>) -> Result<()> {
        let state = c.lock().state;
        if state == ContainerState::Paused {
            self.resume_internal(c)?;
        }
        if state != ContainerState::Stopped {
            if let Err(e) = self.stop_one(c) {
                warn!("Can't stop {} for destroy: {}", c.name(), e);
                return Err(e);
            }
        }

        if let Err(e) = self.engine.kv.remove(&c.kv_node()) {
            warn!("Can't remove key-value node {}: {:#}", c.kv_node(), e);
        }

        let mut holder = self.holder.lock().unwrap();
        holder.names.remove(c.name());
        holder.arena.remove(&c.id());
        holder.ids.retire(c.id());
        if let Some(parent_id) = c.parent_id() {
            if let Some(parent) = holder.arena.get(&parent_id) {
                parent.lock().children.retain(|id| *id != c.id());
            }
        }
        Ok(())
    }

    // Listing and lookup.

    pub fn list(&self) -> Vec<String> {
        let holder = self.holder.lock().unwrap();
        let mut names: Vec<String> = holder
            .names
            .keys()
            .filter(|n| !n.starts_with('/'))
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn list_children(&self, name: &str) -> Result<Vec<String>> {
        let c = self.resolve(name)?;
        let mut names: Vec<String> = self
            .children_of(&c)
            .iter()
            .map(|child| child.name().to_string())
            .collect();
        names.sort();
        Ok(names)
    }

    pub fn state_of(&self, name: &str) -> Result<ContainerState> {
        let c = self.resolve(name)?;
        let state = c.lock().state;
        Ok(state)
    }

    /// Enumerable properties and data fields with their descriptions,
    /// for the front-end's list commands. Hidden values are omitted.
    pub fn list_properties(&self) -> Vec<(&'static str, &'static str)> {
        crate::property::PROPERTY_DEFS
            .iter()
            .filter(|d| !d.has_flags(crate::value::HIDDEN))
            .map(|d| (d.name, d.desc))
            .collect()
    }

    pub fn list_data(&self) -> Vec<(&'static str, &'static str)> {
        crate::data::DATA_DEFS
            .iter()
            .filter(|d| !d.has_flags(crate::value::HIDDEN))
            .map(|d| (d.name, d.desc))
            .collect()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.holder.lock().unwrap().names.contains_key(name)
    }

    // Acquisition: advisory exclusive-use markers, not locks.

    pub fn acquire(&self, name: &str) -> Result<bool> {
        let c = self.resolve_user(name)?;
        if self.is_acquired(&c) {
            return Ok(false);
        }
        c.lock().acquired = true;
        Ok(true)
    }

    pub fn release(&self, name: &str) -> Result<()> {
        let c = self.resolve_user(name)?;
        c.lock().acquired = false;
        Ok(())
    }

    /// Acquisition of a container conceptually covers all descendants;
    /// the walk goes upward from the target.
    pub fn is_acquired(&self, c: &Arc<Container>) -> bool {
        if c.lock().acquired {
            return true;
        }
        self.ancestors(c).iter().any(|a| a.lock().acquired)
    }

    // State machine entry points.

    pub fn start(&self, name: &str) -> Result<()> {
        let c = self.resolve_user(name)?;

        // Stopped ancestors are brought up as Meta first, outermost
        // inward; an ancestor with its own command cannot be implied.
        let ancestors = self.ancestors(&c);
        for ancestor in ancestors.iter().rev() {
            if ancestor.id() < FIRST_CONTAINER_ID {
                continue;
            }
            let (state, command_empty) = {
                let inner = ancestor.lock();
                (
                    inner.state,
                    ancestor
                        .get_prop(&self.engine, &inner, P_COMMAND)?
                        .as_str()
                        .is_empty(),
                )
            };
            if state == ContainerState::Stopped {
                if !command_empty {
                    return Err(Error::InvalidState(format!(
                        "parent {} is not running",
                        ancestor.name()
                    )));
                }
                self.start_one(ancestor)?;
            }
        }

        self.start_one(&c)
    }

    fn start_one(&self, c: &Arc<Container>) -> Result<()> {
        self.sync_container(c);
        let eng = &self.engine;
        let ancestors = self.ancestors(c);
        let (parent_tc, share_tc, parent_ns_pid) = self.network_context(c, &ancestors);

        let mut inner = c.lock();

        // An unprivileged OS-mode container runs with stock values for
        // the sensitive properties.
        let virt_mode = c.get_prop(eng, &inner, P_VIRT_MODE)?.as_str().to_string();
        if virt_mode == VIRT_MODE_OS && inner.owner.uid != 0 {
            let names: Vec<&'static str> = inner
                .props
                .defs()
                .iter()
                .filter(|d| d.has_flags(OS_MODE))
                .map(|d| d.name)
                .collect();
            for prop in names {
                inner.props.reset(prop);
            }
        }

        let meta = c.get_prop(eng, &inner, P_COMMAND)?.as_str().is_empty();
        c.check_start(eng, &inner, meta)?;

        info!("Start {} {}", c.name(), c.id());
        inner.lost_and_restored = false;
        inner.cgroup_empty_since = 0;

        c.set_data(eng, &mut inner, D_RESPAWN_COUNT, Value::Uint(0))?;
        c.set_data(eng, &mut inner, crate::data::D_EXIT_STATUS, Value::Int(-1))?;
        c.set_data(eng, &mut inner, crate::data::D_OOM_KILLED, Value::Bool(false))?;
        c.set_prop(
            eng,
            &mut inner,
            P_RAW_START_TIME,
            Value::Uint(util::time::current_time_ms()),
        )?;

        if let Err(e) = c.prepare_network(eng, &mut inner, parent_tc, share_tc) {
            c.free_resources(eng, &mut inner);
            return Err(e);
        }
        if let Err(e) = c.prepare_cgroups(eng, &mut inner) {
            c.free_resources(eng, &mut inner);
            return Err(e);
        }

        if !meta {
            if let Err(e) = c.prepare_loop_dev(eng, &mut inner) {
                c.free_resources(eng, &mut inner);
                return Err(e);
            }

            let env = match c.prepare_task_env(eng, &inner, parent_ns_pid) {
                Ok(env) => env,
                Err(e) => {
                    warn!("Can't prepare task: {}", e);
                    c.free_resources(eng, &mut inner);
                    return Err(e);
                }
            };

            match eng.launcher.start(&env) {
                Err(e) => {
                    let errno = errno_of(&e).unwrap_or(0);
                    if let Err(se) =
                        c.set_data(eng, &mut inner, D_START_ERRNO, Value::Int(errno as i64))
                    {
                        warn!("Can't set start_errno: {}", se);
                    }
                    Statistics::bump(&eng.stats.start_failed);
                    c.free_resources(eng, &mut inner);
                    return Err(Error::from(e));
                }
                Ok(pid) => {
                    info!("{} started {}", c.name(), pid);
                    c.set_data(eng, &mut inner, D_START_ERRNO, Value::Int(-1))?;
                    c.set_prop(eng, &mut inner, P_RAW_ROOT_PID, Value::Int(pid as i64))?;
                    inner.task = Some(Task::new(pid, eng.launcher.clone()));
                }
            }
        }

        let new_state = if meta {
            ContainerState::Meta
        } else {
            ContainerState::Running
        };
        self.apply_state(c, &mut inner, new_state, &ancestors);
        drop(inner);

        self.update_soft_limits(c, &ancestors);
        Statistics::bump(&eng.stats.started);
        Ok(())
    }

    /// Traffic-class context for a start: the parent class handle, an
    /// optionally shared class for non-isolated containers, and the pid
    /// whose namespaces a non-isolated task joins.
    fn network_context(
        &self,
        c: &Arc<Container>,
        ancestors: &[Arc<Container>],
    ) -> (u32, Option<u32>, Option<i32>) {
        let default_handle = network::tc_handle(network::TC_MAJOR, network::TC_DEFAULT_MINOR);

        let mut parent_ns_pid = None;
        for ancestor in ancestors {
            let inner = ancestor.lock();
            if let Some(task) = &inner.task {
                if task.is_running() {
                    parent_ns_pid = Some(task.pid());
                    break;
                }
            }
        }

        let isolate = {
            let inner = c.lock();
            c.get_prop(&self.engine, &inner, P_ISOLATE)
                .map(|v| v.as_bool())
                .unwrap_or(true)
        };

        let parent_tc = ancestors
            .first()
            .and_then(|parent| parent.lock().tclass.map(|t| t.handle))
            .unwrap_or(default_handle);

        let share_tc = if !isolate && parent_ns_pid.is_some() {
            Some(parent_tc)
        } else {
            None
        };

        if isolate {
            parent_ns_pid = None;
        }

        (parent_tc, share_tc, parent_ns_pid)
    }

    pub fn stop(&self, name: &str) -> Result<()> {
        let c = self.resolve_user(name)?;
        self.stop_one(&c)
    }

    fn stop_one(&self, c: &Arc<Container>) -> Result<()> {
        self.sync_container(c);
        let eng = &self.engine;
        let ancestors = self.ancestors(c);

        let mut inner = c.lock();
        match inner.state {
            ContainerState::Stopped => {
                return Err(Error::InvalidState(format!(
                    "invalid container state {}",
                    inner.state.as_str()
                )));
            }
            ContainerState::Paused => {
                // Implicit resume before the kill.
                if let Ok(cg) = c.leaf_cgroup(eng, Subsystem::Freezer) {
                    if let Err(e) = cgknob::unfreeze(&cg) {
                        warn!("Can't resume {} for stop: {:#}", c.name(), e);
                    }
                }
            }
            _ => {}
        }

        info!("Stop {} {}", c.name(), c.id());
        c.shutdown_oom(eng, &mut inner);

        let running_pid = inner
            .task
            .as_ref()
            .filter(|task| task.is_running())
            .map(|task| task.pid());
        if let Some(pid) = running_pid {
            c.kill_all(eng, &inner)?;

            let cg = c.leaf_cgroup(eng, Subsystem::Freezer)?;
            let drained = sleep_while(eng.config.container.stop_timeout_ms, || {
                !(cg.is_empty() && !pid_alive(pid))
            });
            if !drained {
                warn!("Can't wait for container {} to stop", c.name());
                return Err(c.stop_timeout_error(eng));
            }
        }

        self.apply_state(c, &mut inner, ContainerState::Stopped, &ancestors);
        drop(inner);

        for child in self.children_of(c) {
            if child.lock().state != ContainerState::Stopped {
                if let Err(e) = self.stop_one(&child) {
                    warn!("Can't stop child {}: {}", child.name(), e);
                }
            }
        }

        self.update_soft_limits(c, &ancestors);

        let mut inner = c.lock();
        c.free_resources(eng, &mut inner);
        Ok(())
    }

    pub fn pause(&self, name: &str) -> Result<()> {
        let c = self.resolve_user(name)?;
        self.sync_container(&c);
        let eng = &self.engine;
        let ancestors = self.ancestors(&c);

        let mut inner = c.lock();
        if !matches!(inner.state, ContainerState::Running | ContainerState::Meta) {
            return Err(Error::InvalidState(format!(
                "invalid container state {}",
                inner.state.as_str()
            )));
        }

        let cg = c.leaf_cgroup(eng, Subsystem::Freezer)?;
        cgknob::freeze(&cg).map_err(|e| {
            warn!("Can't pause {}: {:#}", c.name(), e);
            Error::from(e)
        })?;

        self.apply_state(&c, &mut inner, ContainerState::Paused, &ancestors);
        drop(inner);

        // The kernel freezes the whole hierarchy; only the states need
        // propagating.
        for member in self.subtree(&c) {
            let member_ancestors = self.ancestors(&member);
            let mut minner = member.lock();
            if matches!(minner.state, ContainerState::Running | ContainerState::Meta) {
                self.apply_state(&member, &mut minner, ContainerState::Paused, &member_ancestors);
            }
        }
        Ok(())
    }

    pub fn resume(&self, name: &str) -> Result<()> {
        let c = self.resolve_user(name)?;
        self.sync_container(&c);

        for ancestor in self.ancestors(&c) {
            if ancestor.lock().state == ContainerState::Paused {
                return Err(Error::InvalidState(format!(
                    "parent {} is paused",
                    ancestor.name()
                )));
            }
        }
        self.resume_internal(&c)
    }

    fn resume_internal(&self, c: &Arc<Container>) -> Result<()> {
        let eng = &self.engine;
        let ancestors = self.ancestors(c);

        let mut inner = c.lock();
        if inner.state != ContainerState::Paused {
            return Err(Error::InvalidState(format!(
                "invalid container state {}",
                inner.state.as_str()
            )));
        }

        let cg = c.leaf_cgroup(eng, Subsystem::Freezer)?;
        cgknob::unfreeze(&cg).map_err(|e| {
            warn!("Can't resume {}: {:#}", c.name(), e);
            Error::from(e)
        })?;

        let meta = c.get_prop(eng, &inner, P_COMMAND)?.as_str().is_empty();
        let new_state = if meta {
            ContainerState::Meta
        } else {
            ContainerState::Running
        };
        self.apply_state(c, &mut inner, new_state, &ancestors);
        drop(inner);

        for member in self.subtree(c) {
            let member_ancestors = self.ancestors(&member);
            let mut minner = member.lock();
            if minner.state == ContainerState::Paused {
                let meta = member
                    .get_prop(eng, &minner, P_COMMAND)
                    .map(|v| v.as_str().is_empty())
                    .unwrap_or(false);
                let state = if meta {
                    ContainerState::Meta
                } else {
                    ContainerState::Running
                };
                self.apply_state(&member, &mut minner, state, &member_ancestors);
            }
        }
        Ok(())
    }

    pub fn kill(&self, name: &str, signal: i32) -> Result<()> {
        let c = self.resolve_user(name)?;
        self.sync_container(&c);
        info!("Kill {} {}", name, signal);

        let inner = c.lock();
        if inner.state != ContainerState::Running {
            return Err(Error::InvalidState(format!(
                "invalid container state {}",
                inner.state.as_str()
            )));
        }
        match &inner.task {
            Some(task) => task.kill(signal).map_err(Error::from),
            None => Err(Error::InvalidState("container has no task".to_string())),
        }
    }

    /// State bookkeeping shared by every transition: running-children
    /// counters on the ancestor chain, the persisted state field and
    /// waiter notification.
    fn apply_state(
        &self,
        c: &Arc<Container>,
        inner: &mut crate::container::ContainerInner,
        new_state: ContainerState,
        ancestors: &[Arc<Container>],
    ) {
        let old = inner.state;
        if old == new_state {
            return;
        }
        info!(
            "{}: change state {} -> {}",
            c.name(),
            old.as_str(),
            new_state.as_str()
        );

        let diff = (new_state == ContainerState::Running) as i64
            - (old == ContainerState::Running) as i64;
        if diff != 0 {
            c.bump_running_children(diff);
            for ancestor in ancestors {
                ancestor.bump_running_children(diff);
            }
        }

        c.write_state(&self.engine, inner, new_state);
    }

    /// A Meta container's memory soft limit tracks whether anything in
    /// its subtree still runs: the host default while active, one MiB
    /// once idle.
    fn update_soft_limits(&self, c: &Arc<Container>, ancestors: &[Arc<Container>]) {
        let eng = &self.engine;
        let default_limit = eng
            .cgroups
            .supervisor_cgroup(Subsystem::Memory)
            .ok()
            .and_then(|cg| cgknob::get_soft_limit(&cg).ok());
        let default_limit = match default_limit {
            Some(limit) => limit,
            None => return,
        };

        let mut chain = vec![c.clone()];
        chain.extend(ancestors.iter().cloned());
        for member in chain {
            if member.id() < FIRST_CONTAINER_ID {
                continue;
            }
            let inner = member.lock();
            if inner.state != ContainerState::Meta {
                continue;
            }
            let limit = if member.running_children() > 0 {
                default_limit
            } else {
                META_SOFT_LIMIT
            };
            if let Some(cg) = inner.leaf_cgroups.get(&Subsystem::Memory) {
                if let Err(e) = cgknob::set_soft_limit(cg, limit) {
                    warn!("Can't update meta soft limit for {}: {:#}", member.name(), e);
                }
            }
        }
    }

    // Event dispatch.

    pub fn dispatch(&self, event: Event) {
        match event {
            Event::Exit { pid, status } => {
                if let Some(c) = self.find_by_pid(pid) {
                    self.exit_one(&c, status, false, false);
                }
            }
            Event::Oom { fd } => {
                if let Some(c) = self.find_by_oom_fd(fd) {
                    Statistics::bump(&self.engine.stats.oom_kills);
                    self.exit_one(&c, OOM_EXIT_STATUS, true, false);
                }
            }
            Event::Respawn { id } => {
                if let Some(c) = self.by_id(id) {
                    let may = {
                        let inner = c.lock();
                        c.may_respawn(&self.engine, &inner)
                    };
                    if may {
                        if let Err(e) = self.respawn(&c) {
                            warn!("Can't respawn container {}: {}", c.name(), e);
                        } else {
                            info!("Respawned {}", c.name());
                        }
                    }
                }
            }
            Event::RotateLogs => {
                self.rotate_and_age();
                if self.engine.has_loop_handle() {
                    self.engine.schedule(
                        Duration::from_millis(self.engine.config.container.rotate_period_ms),
                        Event::RotateLogs,
                    );
                }
            }
        }
    }

    fn exit_one(&self, c: &Arc<Container>, status: i32, oom_killed: bool, force: bool) {
        let eng = &self.engine;
        let ancestors = self.ancestors(c);

        let mut inner = c.lock();
        if matches!(inner.state, ContainerState::Dead | ContainerState::Stopped) {
            return;
        }

        let isolate = c
            .get_prop(eng, &inner, P_ISOLATE)
            .map(|v| v.as_bool())
            .unwrap_or(true);
        if !force && !oom_killed && isolate && !self.reaped_root_only(c, &inner) {
            warn!(
                "Skipped bogus exit event ({}), some process is still alive in {}",
                status,
                c.name()
            );
            return;
        }

        info!(
            "Exit {} with status {}{}",
            c.name(),
            status,
            if oom_killed { " invoked by OOM" } else { "" }
        );

        c.shutdown_oom(eng, &mut inner);
        c.record_exit(eng, &mut inner, status, oom_killed);

        if oom_killed || !isolate {
            if let Err(e) = c.kill_all(eng, &inner) {
                warn!("Can't kill all tasks in container: {}", e);
            }
        }
        drop(inner);

        // Exit propagates down to everything still running.
        for member in self.subtree(c) {
            let member_ancestors = self.ancestors(&member);
            let mut minner = member.lock();
            if matches!(minner.state, ContainerState::Running | ContainerState::Meta) {
                if let Err(e) = member.kill_all(eng, &minner) {
                    warn!("Child {} can't be killed: {}", member.name(), e);
                }
                member.shutdown_oom(eng, &mut minner);
                member.record_exit(eng, &mut minner, status, oom_killed);
                self.apply_state(&member, &mut minner, ContainerState::Dead, &member_ancestors);
                let member_respawns = member.may_respawn(eng, &minner);
                drop(minner);
                if member_respawns {
                    self.schedule_respawn(&member);
                }
            }
        }

        let mut inner = c.lock();
        self.apply_state(c, &mut inner, ContainerState::Dead, &ancestors);
        let may_respawn = c.may_respawn(eng, &inner);
        drop(inner);

        self.update_soft_limits(c, &ancestors);
        if may_respawn {
            self.schedule_respawn(c);
        }
    }

    /// True when nothing but the (already exited) root task remains in
    /// the freezer cgroup, i.e. the exit event is genuine.
    fn reaped_root_only(&self, c: &Arc<Container>, inner: &crate::container::ContainerInner) -> bool {
        let procs = c.processes(&self.engine, inner);
        let root_pid = inner.task.as_ref().map(|t| t.pid()).unwrap_or(0);
        procs.iter().all(|pid| *pid == root_pid)
    }

    fn schedule_respawn(&self, c: &Arc<Container>) {
        self.engine.schedule(
            Duration::from_millis(self.engine.config.container.respawn_delay_ms),
            Event::Respawn { id: c.id() },
        );
    }

    /// Stop plus Start; the counter moves whether or not the new start
    /// succeeds.
    fn respawn(&self, c: &Arc<Container>) -> Result<()> {
        Statistics::bump(&self.engine.stats.respawns);

        let count = {
            let inner = c.lock();
            c.get_data_value(&self.engine, &inner, D_RESPAWN_COUNT)
                .map(|v| v.as_uint())
                .unwrap_or(0)
        };

        self.stop_one(c)?;
        let result = self.start_one(c);

        let mut inner = c.lock();
        if let Err(e) = c.set_data(
            &self.engine,
            &mut inner,
            D_RESPAWN_COUNT,
            Value::Uint(count + 1),
        ) {
            warn!("Can't bump respawn counter for {}: {}", c.name(), e);
        }
        drop(inner);

        result
    }

    /// One rotation tick: truncate oversized stdio logs of running
    /// containers and retire dead containers past their aging time.
    fn rotate_and_age(&self) {
        let all: Vec<Arc<Container>> = {
            let holder = self.holder.lock().unwrap();
            holder.arena.values().cloned().collect()
        };

        let mut aged = Vec::new();
        for c in all {
            if c.id() < FIRST_CONTAINER_ID {
                continue;
            }
            let inner = c.lock();
            match inner.state {
                ContainerState::Running => c.rotate_logs(&self.engine, &inner),
                ContainerState::Dead if c.can_remove_dead(&self.engine, &inner) => {
                    aged.push(c.name().to_string());
                }
                _ => {}
            }
        }

        for name in aged {
            info!("Removing dead container {} past its aging time", name);
            if let Err(e) = self.destroy(&name) {
                warn!("Can't remove aged container {}: {}", name, e);
            }
        }
    }

    // Properties and data.

    pub fn get_property(
        &self,
        name: &str,
        property: &str,
        client_root: Option<&Path>,
    ) -> Result<String> {
        let c = self.resolve(name)?;
        if c.is_root() || c.is_supervisor_root() {
            return Err(Error::InvalidProperty(format!(
                "no properties for container {}",
                name
            )));
        }

        let (prop_name, idx) = parse_property_name(property);
        let prop_name = if ALIASES.iter().any(|(alias, _)| *alias == property) {
            alias_to_property(property, "").0
        } else {
            prop_name
        };

        let inner = c.lock();
        let def = inner.props.check(&prop_name)?;
        let value = c.get_prop(&self.engine, &inner, &prop_name)?;

        let mut text = match idx {
            Some(idx) => {
                if value.kind() != ValueKind::UintMap {
                    return Err(Error::InvalidValue(
                        "Invalid subscript for property".to_string(),
                    ));
                }
                match value.as_uint_map().get(&idx) {
                    Some(entry) => entry.to_string(),
                    None => return Err(Error::InvalidValue(format!("invalid index {}", idx))),
                }
            }
            None => value.format(),
        };

        text = property_to_alias(property, &text);

        if def.has_flags(PATH) {
            if let Some(root) = client_root {
                let root_str = root.to_string_lossy();
                if root_str != "/" {
                    if let Some(stripped) = text.strip_prefix(root_str.as_ref()) {
                        text = if stripped.is_empty() {
                            "/".to_string()
                        } else {
                            stripped.to_string()
                        };
                    }
                }
            }
        }

        Ok(text)
    }

    pub fn set_property(
        &self,
        name: &str,
        property: &str,
        raw_value: &str,
        superuser: bool,
        client_root: Option<&Path>,
    ) -> Result<()> {
        let c = self.resolve(name)?;
        if c.is_root() || c.is_supervisor_root() {
            return Err(Error::InvalidValue(format!(
                "Can't set property for container {}",
                name
            )));
        }
        self.sync_container(&c);

        let (prop_name, idx) = parse_property_name(property);
        let (prop_name, raw_value) = if ALIASES.iter().any(|(alias, _)| *alias == prop_name) {
            alias_to_property(&prop_name, raw_value.trim())
        } else {
            (prop_name, raw_value.trim().to_string())
        };

        // The holder lock is held for the whole write: hierarchical
        // checks read siblings and ancestors and must be serialized.
        let holder = self.holder.lock().unwrap();
        let ancestors = Self::ancestors_under(&holder, &c);
        let use_parent_ns = self.use_parent_namespace(&c, &ancestors);

        let eng = &self.engine;
        let mut inner = c.lock();
        let def = inner.props.check(&prop_name)?;

        let mut raw_value = raw_value;
        if def.has_flags(PATH) {
            if let Some(root) = client_root {
                let root_str = root.to_string_lossy();
                if root_str != "/" {
                    raw_value = format!("{}{}", root_str.trim_end_matches('/'), raw_value);
                }
            }
        }

        if def.has_flags(SUPERUSER_ONLY) && !superuser {
            let current = c.get_prop(eng, &inner, &prop_name)?.format();
            if current != raw_value {
                return Err(Error::Permission(
                    "Only root can change this property".to_string(),
                ));
            }
        }
        if def.has_flags(RESTRICTED_ROOT_ONLY) && !superuser {
            return Err(Error::Permission(
                "Only restricted root can change this property".to_string(),
            ));
        }

        if !def.has_state(inner.state.bit()) {
            return Err(Error::InvalidState(format!(
                "Can't set property {} in state {}",
                prop_name,
                inner.state.as_str()
            )));
        }

        if def.has_flags(PARENT_RO) && use_parent_ns {
            return Err(Error::NotSupported(format!(
                "Can't set {} for child container",
                prop_name
            )));
        }

        let value = match &idx {
            Some(idx) => {
                let current = c.get_prop(eng, &inner, &prop_name)?;
                if current.kind() != ValueKind::UintMap {
                    return Err(Error::InvalidValue(
                        "Invalid subscript for property".to_string(),
                    ));
                }
                let mut map = current.as_uint_map();
                if !map.contains_key(idx.as_str()) {
                    return Err(Error::InvalidValue(format!("Invalid index {}", idx)));
                }
                let entry = raw_value.parse::<u64>().map_err(|_| {
                    Error::InvalidValue(format!("Invalid integer value for index {}", idx))
                })?;
                map.insert(idx.clone(), entry);
                Value::UintMap(map)
            }
            None => inner.props.parse_for(&prop_name, &raw_value)?,
        };

        {
            let links = eng.link_names();
            let ctx = c.value_ctx(eng, &inner, &links);
            inner.props.validate(&ctx, &prop_name, &value)?;
        }

        if HIERARCHICAL_PROPS.contains(&prop_name.as_str()) {
            self.check_hierarchy(&holder, &c, &inner, &prop_name, value.as_uint(), &ancestors)?;
        }
        self.check_kernel_support(&c, &inner, &prop_name, &value)?;
        if prop_name == P_MEM_GUARANTEE {
            self.check_guarantee_total(&holder, &c, value.as_uint())?;
        }

        c.set_prop(eng, &mut inner, &prop_name, value)?;

        // Dynamic properties reach the kernel right away; a value equal
        // to the current knob state writes nothing.
        if def.has_state(S_RUNNING)
            && !matches!(inner.state, ContainerState::Stopped | ContainerState::Dead)
        {
            c.apply_dynamic_properties(eng, &inner)?;
        }

        Ok(())
    }

    pub fn get_data(&self, name: &str, data: &str) -> Result<String> {
        let c = self.resolve_user(name)?;
        self.sync_container(&c);

        let (data_name, idx) = parse_property_name(data);
        let inner = c.lock();
        let def = inner
            .data
            .find(&data_name)
            .ok_or_else(|| Error::InvalidData("invalid container data".to_string()))?;

        if !def.has_state(inner.state.bit()) {
            return Err(Error::InvalidState(format!(
                "{} is not available in state {}",
                data_name,
                inner.state.as_str()
            )));
        }

        let value = c.get_data_value(&self.engine, &inner, &data_name)?;
        match idx {
            Some(idx) => match value.as_uint_map().get(&idx) {
                Some(entry) => Ok(entry.to_string()),
                None => Err(Error::InvalidValue(format!("invalid index {}", idx))),
            },
            None => Ok(value.format()),
        }
    }

    /// Per-interface traffic counters of a running container.
    pub fn get_stats(
        &self,
        name: &str,
        kind: network::TcStat,
    ) -> Result<std::collections::BTreeMap<String, u64>> {
        let c = self.resolve_user(name)?;
        let net = self
            .engine
            .net
            .as_ref()
            .ok_or_else(|| Error::NotSupported("network support is disabled".to_string()))?;

        let handle = {
            let inner = c.lock();
            inner
                .tclass
                .map(|t| t.handle)
                .ok_or_else(|| Error::InvalidState("container has no traffic class".to_string()))?
        };
        net.get_stats(handle, kind).map_err(Error::from)
    }

    // Hierarchical limit checks; the caller holds the holder lock and
    // the target's container lock.

    fn ancestors_under(holder: &MutexGuard<Holder>, c: &Container) -> Vec<Arc<Container>> {
        let mut chain = Vec::new();
        let mut cursor = c.parent_id();
        while let Some(id) = cursor {
            match holder.arena.get(&id) {
                Some(parent) => {
                    cursor = parent.parent_id();
                    chain.push(parent.clone());
                }
                None => break,
            }
        }
        chain
    }

    fn use_parent_namespace(&self, c: &Arc<Container>, ancestors: &[Arc<Container>]) -> bool {
        let isolate = {
            let inner = c.lock();
            c.get_prop(&self.engine, &inner, P_ISOLATE)
                .map(|v| v.as_bool())
                .unwrap_or(true)
        };
        if isolate {
            return false;
        }
        ancestors.iter().any(|a| {
            let inner = a.lock();
            matches!(&inner.task, Some(task) if task.is_running())
        })
    }

    /// Recursive sum of a property over a subtree: a child with an
    /// explicit non-zero value contributes it, otherwise its own
    /// children are summed. `except` substitutes a prospective value
    /// for one container.
    fn children_sum(
        &self,
        holder: &MutexGuard<Holder>,
        children: &[u32],
        prop: &str,
        except: Option<u32>,
        except_val: u64,
    ) -> u64 {
        let mut sum = 0;
        for id in children {
            let child = match holder.arena.get(id) {
                Some(child) => child.clone(),
                None => continue,
            };
            if except == Some(*id) {
                sum += except_val;
                continue;
            }
            let (value, grandchildren) = {
                let inner = child.lock();
                let value = child
                    .get_prop(&self.engine, &inner, prop)
                    .map(|v| v.as_uint())
                    .unwrap_or(0);
                (value, inner.children.clone())
            };
            if value > 0 {
                sum += value;
            } else {
                sum += self.children_sum(holder, &grandchildren, prop, except, except_val);
            }
        }
        sum
    }

    /// The full hierarchical rule: the new value must cover the
    /// children's sum, must not exceed any ancestor's non-zero value,
    /// and must keep the parent's children-sum within the parent.
    fn check_hierarchy(
        &self,
        holder: &MutexGuard<Holder>,
        c: &Arc<Container>,
        inner: &crate::container::ContainerInner,
        prop: &str,
        value: u64,
        ancestors: &[Arc<Container>],
    ) -> Result<()> {
        let children = self.children_sum(holder, &inner.children, prop, None, 0);
        if children > 0 && value < children {
            return Err(Error::InvalidValue(
                "invalid hierarchical value".to_string(),
            ));
        }

        for ancestor in ancestors {
            if ancestor.id() < FIRST_CONTAINER_ID {
                continue;
            }
            let aval = {
                let ainner = ancestor.lock();
                ancestor
                    .get_prop(&self.engine, &ainner, prop)
                    .map(|v| v.as_uint())
                    .unwrap_or(0)
            };
            if aval > 0 && value > aval {
                return Err(Error::InvalidValue(
                    "invalid hierarchical value".to_string(),
                ));
            }
        }

        if let Some(parent) = ancestors.first() {
            if parent.id() >= FIRST_CONTAINER_ID {
                let (pval, siblings) = {
                    let pinner = parent.lock();
                    let pval = parent
                        .get_prop(&self.engine, &pinner, prop)
                        .map(|v| v.as_uint())
                        .unwrap_or(0);
                    (pval, pinner.children.clone())
                };
                let sum = self.children_sum(holder, &siblings, prop, Some(c.id()), value);
                if pval > 0 && sum > pval {
                    return Err(Error::InvalidValue(
                        "invalid hierarchical value".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// A memory guarantee must leave the configured reserve on the host.
    fn check_guarantee_total(
        &self,
        holder: &MutexGuard<Holder>,
        c: &Arc<Container>,
        value: u64,
    ) -> Result<()> {
        let supervisor_children = match holder.arena.get(&SUPERVISOR_ROOT_ID) {
            Some(root) => root.lock().children.clone(),
            None => return Ok(()),
        };
        let total = self.children_sum(
            holder,
            &supervisor_children,
            P_MEM_GUARANTEE,
            Some(c.id()),
            value,
        );
        if total + self.engine.config.daemon.memory_guarantee_reserve > self.engine.total_memory()
        {
            return Err(Error::ResourceNotAvailable(
                "can't guarantee all available memory".to_string(),
            ));
        }
        Ok(())
    }

    /// Reject values the running kernel has no knob for.
    fn check_kernel_support(
        &self,
        _c: &Arc<Container>,
        _inner: &crate::container::ContainerInner,
        prop: &str,
        value: &Value,
    ) -> Result<()> {
        let supervisor = |subsys| self.engine.cgroups.supervisor_cgroup(subsys);
        match prop {
            P_MEM_GUARANTEE => {
                let cg = supervisor(Subsystem::Memory).map_err(Error::from)?;
                if value.as_uint() > 0 && !cg.has_knob(cgknob::KNOB_MEM_GUARANTEE) {
                    return Err(Error::NotSupported("invalid kernel".to_string()));
                }
            }
            crate::property::P_RECHARGE_ON_PGFAULT => {
                let cg = supervisor(Subsystem::Memory).map_err(Error::from)?;
                if value.as_bool() && !cg.has_knob(cgknob::KNOB_MEM_RECHARGE) {
                    return Err(Error::NotSupported("invalid kernel".to_string()));
                }
            }
            crate::property::P_CPU_POLICY => {
                if value.as_str() == "rt" {
                    let cg = supervisor(Subsystem::Cpu).map_err(Error::from)?;
                    if !cg.has_knob(cgknob::KNOB_CPU_SMART) {
                        return Err(Error::NotSupported("invalid kernel".to_string()));
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    // Waiters.

    pub fn add_waiter(&self, name: &str, waiter: &Arc<Waiter>) -> Result<()> {
        let c = self.resolve_user(name)?;
        let mut inner = c.lock();
        c.add_waiter(&mut inner, waiter);
        Ok(())
    }

    // Relative naming for clients confined to a sub-namespace.

    /// The namespace prefix seen by clients running inside `name`.
    pub fn container_namespace(&self, name: &str) -> Result<String> {
        let c = self.resolve(name)?;
        let mut parts = Vec::new();
        for ancestor in self.ancestors(&c).iter().rev() {
            if ancestor.id() < FIRST_CONTAINER_ID {
                continue;
            }
            let inner = ancestor.lock();
            parts.push(
                ancestor
                    .get_prop(&self.engine, &inner, P_PORTO_NAMESPACE)?
                    .as_str()
                    .to_string(),
            );
        }
        {
            let inner = c.lock();
            if c.id() >= FIRST_CONTAINER_ID {
                parts.push(
                    c.get_prop(&self.engine, &inner, P_PORTO_NAMESPACE)?
                        .as_str()
                        .to_string(),
                );
            }
        }
        Ok(parts.concat())
    }

    pub fn relative_name(&self, namespace: &str, abs_name: &str) -> Result<String> {
        if abs_name == ROOT_CONTAINER {
            return Ok(ROOT_CONTAINER.to_string());
        }
        if namespace.is_empty() {
            return Ok(abs_name.to_string());
        }
        match abs_name.strip_prefix(namespace) {
            Some(stripped) if !stripped.is_empty() => Ok(stripped.to_string()),
            _ => Err(Error::ContainerDoesNotExist(format!(
                "Can't access container {} from namespace {}",
                abs_name, namespace
            ))),
        }
    }

    pub fn absolute_name(&self, namespace: &str, rel_name: &str) -> String {
        if rel_name == ROOT_CONTAINER || rel_name == SUPERVISOR_ROOT_CONTAINER {
            return rel_name.to_string();
        }
        format!("{}{}", namespace, rel_name)
    }

    // Restore.

    /// Rebuild the tree from the KV store at daemon start.
    pub fn restore_all(&self) {
        let eng = &self.engine;
        let (nodes, failed) = match eng.kv.load_all() {
            Ok(result) => result,
            Err(e) => {
                warn!("Can't load key-value store: {:#}", e);
                return;
            }
        };
        for node in failed {
            Statistics::bump(&eng.stats.restore_failed);
            let _ = eng.kv.remove(&node);
        }

        let mut entries: Vec<(u32, String, KvNode)> = Vec::new();
        for (file, node) in nodes {
            let id = match file.parse::<u32>() {
                Ok(id) if id >= FIRST_CONTAINER_ID => id,
                _ => {
                    warn!("Alien file {} in the key-value store", file);
                    let _ = eng.kv.remove(&file);
                    continue;
                }
            };
            let name = match node.get(P_RAW_NAME) {
                Some(name) => name.clone(),
                None => {
                    warn!("Node {} has no name, dropping", file);
                    let _ = eng.kv.remove(&file);
                    continue;
                }
            };
            if node.get(crate::data::D_STATE).is_none() {
                // Created was never committed; nothing to restore.
                let _ = eng.kv.remove(&file);
                continue;
            }
            entries.push((id, name, node));
        }

        entries.sort_by(|a, b| name_depth(&a.1).cmp(&name_depth(&b.1)).then(a.1.cmp(&b.1)));

        for (id, name, node) in entries {
            info!("Restore {} with id {}", name, id);
            if let Err(e) = self.restore_one(id, &name, &node) {
                warn!("Can't restore {}: {}", name, e);
                Statistics::bump(&eng.stats.restore_failed);
                let _ = eng.kv.remove(&id.to_string());
                let mut holder = self.holder.lock().unwrap();
                if holder.names.get(&name) == Some(&id) {
                    holder.names.remove(&name);
                }
                holder.arena.remove(&id);
                holder.ids.retire(id);
                let parent_id = match parent_name(&name) {
                    None => Some(SUPERVISOR_ROOT_ID),
                    Some(parent) => holder.names.get(parent).copied(),
                };
                if let Some(parent) = parent_id.and_then(|pid| holder.arena.get(&pid)) {
                    parent.lock().children.retain(|child| *child != id);
                }
            }
        }
    }

    fn restore_one(&self, id: u32, name: &str, node: &KvNode) -> Result<()> {
        let eng = &self.engine;

        let c = {
            let mut holder = self.holder.lock().unwrap();
            if holder.names.contains_key(name) {
                return Err(Error::ContainerAlreadyExists(name.to_string()));
            }
            let parent_id = match parent_name(name) {
                None => SUPERVISOR_ROOT_ID,
                Some(parent) => *holder
                    .names
                    .get(parent)
                    .ok_or_else(|| Error::ContainerDoesNotExist(parent.to_string()))?,
            };
            if !holder.ids.mark(id) {
                return Err(Error::InvalidData(format!("id {} is already taken", id)));
            }
            let parent = holder.arena.get(&parent_id).cloned().unwrap();
            let c = Container::new(id, name, Some(parent_id), Cred::default());
            holder.names.insert(name.to_string(), id);
            holder.arena.insert(id, c.clone());
            parent.lock().children.push(id);
            c
        };

        {
            let mut inner = c.lock();
            c.restore_maps(&mut inner, node)?;
            let uid = node
                .get(crate::property::P_USER)
                .and_then(|u| u.parse().ok())
                .unwrap_or(0);
            let gid = node
                .get(crate::property::P_GROUP)
                .and_then(|g| g.parse().ok())
                .unwrap_or(0);
            inner.owner = Cred { uid, gid };
        }

        // Start was committed iff the pid was ever recorded; the value
        // itself is zeroed again when the task exits. A node whose last
        // persisted state is Stopped went through a full Stop and owns
        // no resources, whatever the stale pid says.
        let root_pid = node.get(P_RAW_ROOT_PID).and_then(|p| p.parse::<i32>().ok());
        let persisted = node
            .get(crate::data::D_STATE)
            .and_then(|s| ContainerState::from_str(s));
        match root_pid {
            Some(pid) if persisted != Some(ContainerState::Stopped) => {
                let pid = if pid == std::process::id() as i32 { 0 } else { pid };
                info!("{}: restore started container {}", name, pid);
                self.restore_started(&c, pid, node)
            }
            _ => self.restore_created(&c),
        }
    }

    fn restore_started(&self, c: &Arc<Container>, pid: i32, node: &KvNode) -> Result<()> {
        let eng = &self.engine;

        // Bring stopped meta ancestors up so the leaf paths exist.
        let ancestors = self.ancestors(c);
        for ancestor in ancestors.iter().rev() {
            if ancestor.id() < FIRST_CONTAINER_ID {
                continue;
            }
            let (state, command_empty) = {
                let inner = ancestor.lock();
                (
                    inner.state,
                    ancestor
                        .get_prop(eng, &inner, P_COMMAND)?
                        .as_str()
                        .is_empty(),
                )
            };
            if state == ContainerState::Stopped && command_empty {
                info!("Start parent {} as meta for restore", ancestor.name());
                self.start_one(ancestor)?;
            }
        }

        let (parent_tc, share_tc, _) = self.network_context(c, &ancestors);
        let mut inner = c.lock();

        if let Err(e) = c.prepare_network(eng, &mut inner, parent_tc, share_tc) {
            c.free_resources(eng, &mut inner);
            return Err(e);
        }
        if let Err(e) = c.prepare_cgroups(eng, &mut inner) {
            c.free_resources(eng, &mut inner);
            return Err(e);
        }

        if pid > 0 {
            c.reattach_task(eng, &mut inner, pid);
        } else {
            // The task is gone for sure; the first sync demotes the
            // container unless the persisted state already says Dead.
            inner.task = None;
            inner.lost_and_restored = true;
        }

        let persisted = node
            .get(crate::data::D_STATE)
            .and_then(|s| ContainerState::from_str(s))
            .unwrap_or(ContainerState::Running);

        if persisted == ContainerState::Dead {
            // Death time recording is newer than some nodes; default it.
            if !inner.props.has_value(P_RAW_DEATH_TIME) {
                let _ = c.set_prop(
                    eng,
                    &mut inner,
                    P_RAW_DEATH_TIME,
                    Value::Uint(util::time::current_time_ms()),
                );
            }
            self.apply_state(c, &mut inner, ContainerState::Dead, &ancestors);
        } else {
            if !inner.props.has_value(P_RAW_START_TIME) {
                let _ = c.set_prop(
                    eng,
                    &mut inner,
                    P_RAW_START_TIME,
                    Value::Uint(util::time::current_time_ms()),
                );
            }
            let meta = c.get_prop(eng, &inner, P_COMMAND)?.as_str().is_empty();
            let state = if meta {
                ContainerState::Meta
            } else {
                ContainerState::Running
            };
            self.apply_state(c, &mut inner, state, &ancestors);

            // Pause state is recovered from the freezer knob itself.
            if let Ok(cg) = c.leaf_cgroup(eng, Subsystem::Freezer) {
                if cgknob::is_frozen(&cg) {
                    self.apply_state(c, &mut inner, ContainerState::Paused, &ancestors);
                }
            }
        }

        let may_respawn = c.may_respawn(eng, &inner);
        drop(inner);

        self.sync_container(c);
        self.update_soft_limits(c, &ancestors);
        if may_respawn {
            self.schedule_respawn(c);
        }
        Ok(())
    }

    fn restore_created(&self, c: &Arc<Container>) -> Result<()> {
        let eng = &self.engine;
        info!("{}: restore created container", c.name());

        let mut inner = c.lock();
        // Start was never reported; make sure nothing is left running.
        match c.leaf_cgroup(eng, Subsystem::Freezer) {
            Ok(cg) => {
                if cg.exists() && !cg.is_empty() {
                    if let Err(e) = c.kill_all(eng, &inner) {
                        warn!("Can't kill stray tasks of {}: {}", c.name(), e);
                    }
                }
            }
            Err(e) => warn!("Can't check freezer of {}: {}", c.name(), e),
        }

        inner.state = ContainerState::Stopped;
        inner.task = None;
        c.remove_stdio_logs(eng, &inner);

        // A loop device recorded before the restart belongs to the pool
        // again; Stopped containers hold no resources.
        let loop_dev = c
            .get_prop(eng, &inner, crate::property::P_RAW_LOOP_DEV)
            .map(|v| v.as_int())
            .unwrap_or(-1) as i32;
        if loop_dev >= 0 {
            if let Err(e) = crate::loopdev::put_loop_dev(loop_dev) {
                warn!("Can't reclaim loop device {}: {:#}", loop_dev, e);
            }
            if let Err(e) = c.set_prop(eng, &mut inner, crate::property::P_RAW_LOOP_DEV, Value::Int(-1))
            {
                warn!("Can't reset raw_loop_dev for {}: {}", c.name(), e);
            }
        }
        Ok(())
    }

    /// Wire the event queue into the loop and arm the periodic tick.
    pub fn attach_to_loop(self: &Arc<Self>, handle: &util::loop_context::LoopHandle) {
        use util::loop_context::{EventNotifier, NotifierCallback, NotifierOperation};
        use vmm_sys_util::epoll::EventSet;

        self.engine.set_loop_handle(handle.clone());

        let registry = self.clone();
        let events = self.engine.events.clone();
        let callback: Box<NotifierCallback> = Box::new(move |_, fd| {
            util::loop_context::read_fd(fd);
            for event in events.drain() {
                registry.dispatch(event);
            }
            None
        });
        handle.update_events(vec![EventNotifier::new(
            NotifierOperation::Add,
            self.engine.events.raw_fd(),
            EventSet::IN,
            vec![Arc::new(Mutex::new(callback))],
        )]);

        self.engine.schedule(
            Duration::from_millis(self.engine.config.container.rotate_period_ms),
            Event::RotateLogs,
        );
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::config::DaemonConfig;
    use crate::event::EventQueue;
    use crate::launcher::fake::FakeLauncher;
    use kv_store::KvStore;
    use network::mock::MockNetlink;
    use network::{Interface, NetDefaults, NetworkManager, TcStat};
    use vmm_sys_util::tempdir::TempDir;

    const CRED: Cred = Cred {
        uid: 1000,
        gid: 1000,
    };

    fn build_engine(dir: &Path, launcher: Arc<FakeLauncher>) -> Arc<Engine> {
        let mut config = DaemonConfig::default();
        config.container.kill_timeout_ms = 10;
        config.container.stop_timeout_ms = 10;
        config.container.respawn_delay_ms = 1;
        config.container.tmp_dir = dir.join("place").to_string_lossy().to_string();

        let kv_dir = dir.join("kv");
        fs::create_dir_all(&kv_dir).unwrap();
        let kv = KvStore::new(&kv_dir);

        let cgroups = cgroup::scratch_driver(&dir.join("sys"), "ozoned");
        cgroups.prepare().unwrap();
        // The scratch hierarchy needs the knobs the admission checks
        // probe on the supervisor cgroup.
        let memroot = cgroups.supervisor_cgroup(Subsystem::Memory).unwrap();
        memroot.set_knob_raw(cgknob::KNOB_MEM_GUARANTEE, "0").unwrap();
        memroot
            .set_knob_raw(cgknob::KNOB_MEM_SOFT_LIMIT, "9223372036854771712")
            .unwrap();
        let cpuroot = cgroups.supervisor_cgroup(Subsystem::Cpu).unwrap();
        cpuroot.set_knob_raw(cgknob::KNOB_CPU_SMART, "0").unwrap();

        let net = NetworkManager::new(
            Box::new(MockNetlink::new(vec![
                Interface {
                    name: "eth0".to_string(),
                    index: 2,
                },
                Interface {
                    name: "eth1".to_string(),
                    index: 3,
                },
            ])),
            NetDefaults {
                prio: 3,
                guarantee: 0,
                max_guarantee: 1 << 30,
                limit: 1 << 30,
            },
        );
        net.prepare().unwrap();

        let events = Arc::new(EventQueue::new().unwrap());
        Arc::new(Engine::new(config, kv, cgroups, Some(net), launcher, events))
    }

    struct Fixture {
        dir: TempDir,
        launcher: Arc<FakeLauncher>,
        registry: Arc<Registry>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let launcher = Arc::new(FakeLauncher::new());
        let engine = build_engine(dir.as_path(), launcher.clone());
        Fixture {
            dir,
            launcher,
            registry: Registry::new(engine),
        }
    }

    /// Dispatch queued events until the queue stays empty, like the
    /// event loop thread would.
    fn drain(registry: &Arc<Registry>) {
        loop {
            let events = registry.engine().events.drain();
            if events.is_empty() {
                return;
            }
            for event in events {
                registry.dispatch(event);
            }
        }
    }

    fn set(f: &Fixture, name: &str, prop: &str, value: &str) -> Result<()> {
        f.registry.set_property(name, prop, value, false, None)
    }

    fn root_pid(f: &Fixture, name: &str) -> i32 {
        f.registry.get_data(name, "root_pid").unwrap().parse().unwrap()
    }

    /// Seed a leaf cgroup with knob files before the container starts,
    /// standing in for what the kernel materializes on mkdir.
    fn seed_leaf(f: &Fixture, subsys: Subsystem, name: &str, knobs: &[(&str, &str)]) {
        let cg = f.registry.engine().cgroups.leaf_cgroup(subsys, name).unwrap();
        cg.create().unwrap();
        for (knob, value) in knobs {
            cg.set_knob_raw(knob, value).unwrap();
        }
    }

    #[test]
    fn test_create_start_stop_destroy() {
        let f = fixture();
        f.registry.create("a", CRED).unwrap();
        set(&f, "a", "command", "/bin/sleep 60").unwrap();

        f.registry.start("a").unwrap();
        assert_eq!(f.registry.state_of("a").unwrap(), ContainerState::Running);
        assert!(root_pid(&f, "a") > 0);
        assert_eq!(f.launcher.started_count(), 1);

        let freezer = f
            .registry
            .engine()
            .cgroups
            .leaf_cgroup(Subsystem::Freezer, "a")
            .unwrap();
        assert!(freezer.exists());

        f.registry.stop("a").unwrap();
        assert_eq!(f.registry.state_of("a").unwrap(), ContainerState::Stopped);
        {
            let c = f.registry.resolve("a").unwrap();
            let inner = c.lock();
            assert!(inner.leaf_cgroups.is_empty());
            assert!(inner.tclass.is_none());
            assert!(inner.task.is_none());
        }

        f.registry.destroy("a").unwrap();
        match f.registry.state_of("a") {
            Err(Error::ContainerDoesNotExist(_)) => {}
            other => panic!("unexpected: {:?}", other.map(|s| s.as_str())),
        }
    }

    #[test]
    fn test_stop_and_destroy_idempotence() {
        let f = fixture();
        f.registry.create("a", CRED).unwrap();

        match f.registry.stop("a") {
            Err(Error::InvalidState(_)) => {}
            other => panic!("unexpected: {:?}", other),
        }

        f.registry.destroy("a").unwrap();
        match f.registry.destroy("a") {
            Err(Error::ContainerDoesNotExist(_)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_create_rejects_duplicates_and_orphans() {
        let f = fixture();
        f.registry.create("a", CRED).unwrap();
        match f.registry.create("a", CRED) {
            Err(Error::ContainerAlreadyExists(_)) => {}
            other => panic!("unexpected: {:?}", other),
        }
        match f.registry.create("missing/child", CRED) {
            Err(Error::ContainerDoesNotExist(_)) => {}
            other => panic!("unexpected: {:?}", other),
        }
        assert!(f.registry.create("a/b", CRED).is_ok());
        assert_eq!(f.registry.list(), vec!["a", "a/b"]);
        assert_eq!(f.registry.list_children("a").unwrap(), vec!["a/b"]);
    }

    #[test]
    fn test_id_reuse_after_destroy() {
        let f = fixture();
        f.registry.create("a", CRED).unwrap();
        assert_eq!(
            f.registry.get_property("a", "raw_id", None).unwrap(),
            FIRST_CONTAINER_ID.to_string()
        );
        f.registry.destroy("a").unwrap();
        f.registry.create("b", CRED).unwrap();
        assert_eq!(
            f.registry.get_property("b", "raw_id", None).unwrap(),
            FIRST_CONTAINER_ID.to_string()
        );
    }

    #[test]
    fn test_nested_meta_and_aging() {
        let f = fixture();
        f.registry.create("p", CRED).unwrap();
        f.registry.create("p/c", CRED).unwrap();
        set(&f, "p/c", "command", "/bin/true").unwrap();
        set(&f, "p/c", "aging_time", "0").unwrap();

        // Starting the leaf pulls the stopped meta parent up first.
        f.registry.start("p/c").unwrap();
        assert_eq!(f.registry.state_of("p").unwrap(), ContainerState::Meta);
        assert_eq!(f.registry.state_of("p/c").unwrap(), ContainerState::Running);
        {
            let p = f.registry.resolve("p").unwrap();
            assert_eq!(p.running_children(), 1);
        }

        let pid = root_pid(&f, "p/c");
        f.registry.dispatch(Event::Exit { pid, status: 0 });
        assert_eq!(f.registry.state_of("p/c").unwrap(), ContainerState::Dead);
        assert_eq!(f.registry.get_data("p/c", "exit_status").unwrap(), "0");
        {
            let p = f.registry.resolve("p").unwrap();
            assert_eq!(p.running_children(), 0);
        }

        // Aging time zero: the next rotation tick removes the corpse.
        f.registry.dispatch(Event::RotateLogs);
        assert!(!f.registry.exists("p/c"));
        assert_eq!(f.registry.state_of("p").unwrap(), ContainerState::Meta);
    }

    #[test]
    fn test_hierarchical_guarantee_rejection() {
        let f = fixture();
        f.registry.create("p", CRED).unwrap();
        f.registry.create("p/c1", CRED).unwrap();
        f.registry.create("p/c2", CRED).unwrap();

        set(&f, "p", "memory_guarantee", "10M").unwrap();
        set(&f, "p/c1", "memory_guarantee", "6M").unwrap();

        // 6M + 5M exceeds the parent's 10M.
        match set(&f, "p/c2", "memory_guarantee", "5M") {
            Err(Error::InvalidValue(_)) => {}
            other => panic!("unexpected: {:?}", other),
        }
        set(&f, "p/c2", "memory_guarantee", "4M").unwrap();

        // A child above any ancestor's value is rejected outright.
        match set(&f, "p/c1", "memory_guarantee", "12M") {
            Err(Error::InvalidValue(_)) => {}
            other => panic!("unexpected: {:?}", other),
        }

        // Lowering the parent below the children's sum is rejected too.
        match set(&f, "p", "memory_guarantee", "9M") {
            Err(Error::InvalidValue(_)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_dynamic_property_reaches_kernel_idempotently() {
        let f = fixture();
        f.registry.create("a", CRED).unwrap();
        set(&f, "a", "command", "/bin/sleep 60").unwrap();
        seed_leaf(&f, Subsystem::Memory, "a", &[(cgknob::KNOB_MEM_LIMIT, "0")]);

        f.registry.start("a").unwrap();
        let memcg = f
            .registry
            .engine()
            .cgroups
            .leaf_cgroup(Subsystem::Memory, "a")
            .unwrap();
        // Start applied the default (unlimited) value.
        assert_eq!(memcg.get_knob(cgknob::KNOB_MEM_LIMIT).unwrap(), "-1");

        set(&f, "a", "memory_limit", "4M").unwrap();
        assert_eq!(memcg.get_knob_u64(cgknob::KNOB_MEM_LIMIT).unwrap(), 4 << 20);
        assert_eq!(f.registry.get_property("a", "memory_limit", None).unwrap(), "4194304");

        // Same value again: no kernel write.
        let knob = memcg.path().join(cgknob::KNOB_MEM_LIMIT);
        let before = fs::metadata(&knob).unwrap().modified().unwrap();
        set(&f, "a", "memory_limit", "4M").unwrap();
        assert_eq!(fs::metadata(&knob).unwrap().modified().unwrap(), before);
    }

    #[test]
    fn test_static_property_gated_by_state() {
        let f = fixture();
        f.registry.create("a", CRED).unwrap();
        set(&f, "a", "command", "/bin/sleep 60").unwrap();
        f.registry.start("a").unwrap();

        match set(&f, "a", "command", "/bin/true") {
            Err(Error::InvalidState(_)) => {}
            other => panic!("unexpected: {:?}", other),
        }
        // Dynamic properties stay settable while running.
        set(&f, "a", "memory_limit", "0").unwrap();
    }

    #[test]
    fn test_property_aliases_translate_values() {
        let f = fixture();
        f.registry.create("a", CRED).unwrap();

        set(&f, "a", "memory.limit_in_bytes", "8388608").unwrap();
        assert_eq!(
            f.registry.get_property("a", "memory_limit", None).unwrap(),
            "8388608"
        );

        assert_eq!(f.registry.get_property("a", "cpu.smart", None).unwrap(), "0");
        set(&f, "a", "cpu.smart", "1").unwrap();
        assert_eq!(f.registry.get_property("a", "cpu_policy", None).unwrap(), "rt");
        assert_eq!(f.registry.get_property("a", "cpu.smart", None).unwrap(), "1");

        set(&f, "a", "memory.recharge_on_pgfault", "0").unwrap();
        assert_eq!(
            f.registry
                .get_property("a", "recharge_on_pgfault", None)
                .unwrap(),
            "false"
        );
    }

    #[test]
    fn test_subscripted_map_access() {
        let f = fixture();
        f.registry.create("a", CRED).unwrap();

        set(&f, "a", "net_guarantee[eth0]", "1000").unwrap();
        assert_eq!(
            f.registry
                .get_property("a", "net_guarantee[eth0]", None)
                .unwrap(),
            "1000"
        );
        // Untouched interfaces keep the configured default.
        assert_eq!(
            f.registry
                .get_property("a", "net_guarantee[eth1]", None)
                .unwrap(),
            "0"
        );
        match set(&f, "a", "net_guarantee[wlan9]", "1") {
            Err(Error::InvalidValue(_)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_oom_delivery() {
        let f = fixture();
        f.registry.create("a", CRED).unwrap();
        set(&f, "a", "command", "/bin/sleep 60").unwrap();
        set(&f, "a", "memory_limit", "4M").unwrap();
        seed_leaf(
            &f,
            Subsystem::Memory,
            "a",
            &[
                (cgknob::KNOB_MEM_LIMIT, "0"),
                ("memory.oom_control", "oom_kill_disable 0"),
            ],
        );

        f.registry.start("a").unwrap();
        let fd = {
            let c = f.registry.resolve("a").unwrap();
            let inner = c.lock();
            use std::os::unix::io::AsRawFd;
            inner.oom_efd.as_ref().expect("oom eventfd registered").as_raw_fd()
        };

        f.registry.dispatch(Event::Oom { fd });
        assert_eq!(f.registry.state_of("a").unwrap(), ContainerState::Dead);
        assert_eq!(f.registry.get_data("a", "oom_killed").unwrap(), "true");
        assert_eq!(
            f.registry.get_data("a", "exit_status").unwrap(),
            libc::SIGKILL.to_string()
        );
        assert_eq!(f.registry.engine().stats.oom_kills.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_respawn_bounded() {
        let f = fixture();
        f.registry.create("a", CRED).unwrap();
        set(&f, "a", "command", "/bin/false").unwrap();
        set(&f, "a", "respawn", "true").unwrap();
        set(&f, "a", "max_respawns", "2").unwrap();

        f.registry.start("a").unwrap();
        for _ in 0..3 {
            let pid = {
                let c = f.registry.resolve("a").unwrap();
                let inner = c.lock();
                inner.task.as_ref().unwrap().pid()
            };
            f.registry.dispatch(Event::Exit { pid, status: 256 });
            drain(&f.registry);
        }

        assert_eq!(f.registry.get_data("a", "respawn_count").unwrap(), "2");
        assert_eq!(f.registry.state_of("a").unwrap(), ContainerState::Dead);
    }

    #[test]
    fn test_restart_recovery() {
        let f = fixture();
        f.registry.create("a", CRED).unwrap();
        set(&f, "a", "command", "/bin/sleep 60").unwrap();
        seed_leaf(
            &f,
            Subsystem::Memory,
            "a",
            &[("memory.oom_control", "oom_kill_disable 0")],
        );
        f.registry.start("a").unwrap();

        // Stand in a real process for the recorded root pid, parented by
        // this test exactly like a supervised task would be.
        let mut child = std::process::Command::new("sleep")
            .arg("60")
            .spawn()
            .unwrap();
        let pid = child.id() as i32;
        let engine = f.registry.engine();
        engine
            .kv
            .append(
                &FIRST_CONTAINER_ID.to_string(),
                &[("raw_root_pid".to_string(), pid.to_string())],
            )
            .unwrap();
        let freezer = engine.cgroups.leaf_cgroup(Subsystem::Freezer, "a").unwrap();
        freezer.set_knob_raw("tasks", &pid.to_string()).unwrap();

        // Daemon restart: a fresh engine and registry over the same
        // state directories.
        let launcher2 = Arc::new(FakeLauncher::new());
        let engine2 = build_engine(f.dir.as_path(), launcher2);
        let registry2 = Registry::new(engine2);
        registry2.restore_all();

        assert_eq!(registry2.state_of("a").unwrap(), ContainerState::Running);
        assert_eq!(
            registry2.get_property("a", "raw_root_pid", None).unwrap(),
            pid.to_string()
        );
        {
            let c = registry2.resolve("a").unwrap();
            let inner = c.lock();
            assert!(inner.oom_efd.is_some(), "OOM eventfd re-registered");
            assert!(!inner.lost_and_restored);
        }
        let stats = registry2.get_stats("a", TcStat::Bytes).unwrap();
        assert_eq!(stats.len(), 2);

        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn test_restore_keeps_persistent_properties() {
        let f = fixture();
        f.registry.create("a", CRED).unwrap();
        set(&f, "a", "memory_limit", "8M").unwrap();
        set(&f, "a", "private", "build=42").unwrap();

        let launcher2 = Arc::new(FakeLauncher::new());
        let engine2 = build_engine(f.dir.as_path(), launcher2);
        let registry2 = Registry::new(engine2);
        registry2.restore_all();

        assert_eq!(registry2.state_of("a").unwrap(), ContainerState::Stopped);
        assert_eq!(
            registry2.get_property("a", "memory_limit", None).unwrap(),
            "8388608"
        );
        assert_eq!(
            registry2.get_property("a", "private", None).unwrap(),
            "build=42"
        );
    }

    #[test]
    fn test_pause_propagation() {
        let f = fixture();
        f.registry.create("p", CRED).unwrap();
        f.registry.create("p/c", CRED).unwrap();
        set(&f, "p/c", "command", "/bin/sleep 60").unwrap();
        f.registry.start("p/c").unwrap();

        f.registry.pause("p").unwrap();
        assert_eq!(f.registry.state_of("p").unwrap(), ContainerState::Paused);
        assert_eq!(f.registry.state_of("p/c").unwrap(), ContainerState::Paused);

        match f.registry.resume("p/c") {
            Err(Error::InvalidState(message)) => assert!(message.contains("paused")),
            other => panic!("unexpected: {:?}", other),
        }

        f.registry.resume("p").unwrap();
        assert_eq!(f.registry.state_of("p").unwrap(), ContainerState::Meta);
        assert_eq!(f.registry.state_of("p/c").unwrap(), ContainerState::Running);
    }

    #[test]
    fn test_traffic_class_stats() {
        let f = fixture();
        f.registry.create("a", CRED).unwrap();
        set(&f, "a", "command", "/bin/sleep 60").unwrap();

        match f.registry.get_stats("a", TcStat::Bytes) {
            Err(Error::InvalidState(_)) => {}
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }

        f.registry.start("a").unwrap();
        let stats = f.registry.get_stats("a", TcStat::Bytes).unwrap();
        assert_eq!(stats.len(), 2);
        assert!(stats.contains_key("eth0") && stats.contains_key("eth1"));
    }

    #[test]
    fn test_waiter_signalled_on_departure_from_running() {
        let f = fixture();
        f.registry.create("a", CRED).unwrap();
        set(&f, "a", "command", "/bin/sleep 60").unwrap();
        f.registry.start("a").unwrap();

        let waiter = Waiter::new("");
        f.registry.add_waiter("a", &waiter).unwrap();
        assert!(!waiter.is_signalled());

        f.registry.stop("a").unwrap();
        assert_eq!(
            waiter.wait_timeout(Duration::from_millis(100)),
            Some("a".to_string())
        );
    }

    #[test]
    fn test_start_failure_leaves_container_stopped() {
        let f = fixture();
        f.registry.create("a", CRED).unwrap();
        set(&f, "a", "command", "/bin/vanished").unwrap();
        f.launcher.fail_with(libc::ENOENT);

        assert!(f.registry.start("a").is_err());
        assert_eq!(f.registry.state_of("a").unwrap(), ContainerState::Stopped);
        assert_eq!(
            f.registry.get_data("a", "start_errno").unwrap(),
            libc::ENOENT.to_string()
        );
        {
            let c = f.registry.resolve("a").unwrap();
            let inner = c.lock();
            assert!(inner.leaf_cgroups.is_empty());
            assert!(inner.tclass.is_none());
            assert!(inner.task.is_none());
        }
        assert_eq!(
            f.registry.engine().stats.start_failed.load(Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn test_acquisition_covers_descendants() {
        let f = fixture();
        f.registry.create("p", CRED).unwrap();
        f.registry.create("p/c", CRED).unwrap();

        assert!(f.registry.acquire("p").unwrap());
        assert!(!f.registry.acquire("p/c").unwrap());
        f.registry.release("p").unwrap();
        assert!(f.registry.acquire("p/c").unwrap());
    }

    #[test]
    fn test_namespace_relative_names() {
        let f = fixture();
        f.registry.create("p", CRED).unwrap();
        set(&f, "p", "porto_namespace", "p/").unwrap();
        f.registry.create("p/c", CRED).unwrap();

        let ns = f.registry.container_namespace("p").unwrap();
        assert_eq!(ns, "p/");
        assert_eq!(f.registry.relative_name(&ns, "p/c").unwrap(), "c");
        assert_eq!(f.registry.absolute_name(&ns, "c"), "p/c");
        match f.registry.relative_name(&ns, "elsewhere") {
            Err(Error::ContainerDoesNotExist(_)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_property_listing_hides_raw_values() {
        let f = fixture();
        let props = f.registry.list_properties();
        assert!(props.iter().any(|(name, _)| *name == "command"));
        assert!(!props.iter().any(|(name, _)| name.starts_with("raw_")));
        assert!(f.registry.list_data().iter().any(|(name, _)| *name == "state"));
    }

    #[test]
    fn test_superuser_only_property_denied() {
        let f = fixture();
        f.registry.create("a", CRED).unwrap();
        match set(&f, "a", "user", "root") {
            Err(Error::Permission(_)) => {}
            other => panic!("unexpected: {:?}", other),
        }
        f.registry
            .set_property("a", "user", "root", true, None)
            .unwrap();
    }
}

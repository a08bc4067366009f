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

//! Per-container state and single-container mechanics.
//!
//! Everything that touches more than one container (subtree stops,
//! hierarchical limits, running-children accounting) is orchestrated by
//! the registry; this module owns one container's kernel bindings.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use anyhow::anyhow;
use log::{info, warn};
use vmm_sys_util::eventfd::EventFd;

use cgroup::{subsystem as cgknob, Cgroup, Subsystem, ALL_SUBSYSTEMS};
use util::time::{current_time_ms, sleep_while};

use crate::data::{
    DATA_DEFS, D_EXIT_STATUS, D_OOM_KILLED, D_RESPAWN_COUNT, D_STATE, D_START_ERRNO,
};
use crate::error::{errno_of, Error, Result};
use crate::event::Waiter;
use crate::launcher::{BindMount, Rlimit, Task, TaskEnv};
use crate::loopdev;
use crate::property::{
    parse_bind, parse_ulimit, P_AGING_TIME, P_ALLOWED_DEVICES, P_BIND, P_BIND_DNS,
    P_CAPABILITIES, P_COMMAND, P_CPU_GUARANTEE, P_CPU_LIMIT, P_CPU_POLICY, P_CWD, P_ENV,
    P_HOSTNAME, P_IO_LIMIT, P_IO_POLICY, P_ISOLATE, P_MAX_RESPAWNS, P_MEM_GUARANTEE, P_MEM_LIMIT,
    P_NET_GUARANTEE, P_NET_LIMIT, P_NET_PRIO, P_RAW_DEATH_TIME, P_RAW_LOOP_DEV, P_RAW_ROOT_PID,
    P_RECHARGE_ON_PGFAULT, P_RESPAWN, P_ROOT, P_ROOT_RDONLY, P_STDERR_PATH, P_STDIN_PATH,
    P_STDOUT_PATH, P_USER, PROPERTY_DEFS,
};
use crate::value::{Value, ValueCtx, ValueMap, PARENT_RO, PERSISTENT};
use crate::{Engine, SUPERVISOR_ROOT_ID};

pub const ROOT_CONTAINER: &str = "/";
pub const SUPERVISOR_ROOT_CONTAINER: &str = "/ozoned";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Stopped,
    Running,
    Paused,
    Meta,
    Dead,
}

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Stopped => "stopped",
            ContainerState::Running => "running",
            ContainerState::Paused => "paused",
            ContainerState::Meta => "meta",
            ContainerState::Dead => "dead",
        }
    }

    pub fn from_str(raw: &str) -> Option<ContainerState> {
        match raw {
            "stopped" => Some(ContainerState::Stopped),
            "running" => Some(ContainerState::Running),
            "paused" => Some(ContainerState::Paused),
            "meta" => Some(ContainerState::Meta),
            "dead" => Some(ContainerState::Dead),
            _ => None,
        }
    }

    pub fn bit(&self) -> u32 {
        match self {
            ContainerState::Stopped => crate::value::S_STOPPED,
            ContainerState::Running => crate::value::S_RUNNING,
            ContainerState::Paused => crate::value::S_PAUSED,
            ContainerState::Meta => crate::value::S_META,
            ContainerState::Dead => crate::value::S_DEAD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cred {
    pub uid: u32,
    pub gid: u32,
}

/// Traffic class binding. A non-isolated container shares its parent's
/// class and must not delete it on teardown.
#[derive(Debug, Clone, Copy)]
pub struct TrafficClass {
    pub handle: u32,
    pub owned: bool,
}

pub struct ContainerInner {
    pub state: ContainerState,
    pub owner: Cred,
    pub props: ValueMap,
    pub data: ValueMap,
    pub task: Option<Task>,
    pub leaf_cgroups: HashMap<Subsystem, Cgroup>,
    pub tclass: Option<TrafficClass>,
    pub oom_efd: Option<EventFd>,
    pub acquired: bool,
    pub lost_and_restored: bool,
    /// Child container ids; mutated only under the holder lock.
    pub children: Vec<u32>,
    pub waiters: Vec<Weak<Waiter>>,
    /// When the freezer cgroup was first observed empty, ms since the
    /// epoch; 0 while tasks remain.
    pub cgroup_empty_since: u64,
}

pub struct Container {
    id: u32,
    name: String,
    parent: Option<u32>,
    /// Number of Running containers in this subtree. Kept as an atomic
    /// so state changes can bump ancestors without taking their locks.
    running_children: AtomicI64,
    inner: Mutex<ContainerInner>,
}

impl Container {
    pub fn new(id: u32, name: &str, parent: Option<u32>, owner: Cred) -> Arc<Container> {
        Arc::new(Container {
            id,
            name: name.to_string(),
            parent,
            running_children: AtomicI64::new(0),
            inner: Mutex::new(ContainerInner {
                state: ContainerState::Stopped,
                owner,
                props: ValueMap::new(PROPERTY_DEFS),
                data: ValueMap::new(DATA_DEFS),
                task: None,
                leaf_cgroups: HashMap::new(),
                tclass: None,
                oom_efd: None,
                acquired: false,
                lost_and_restored: false,
                children: Vec::new(),
                waiters: Vec::new(),
                cgroup_empty_since: 0,
            }),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent_id(&self) -> Option<u32> {
        self.parent
    }

    pub fn is_root(&self) -> bool {
        self.id == crate::ROOT_CONTAINER_ID
    }

    pub fn is_supervisor_root(&self) -> bool {
        self.id == SUPERVISOR_ROOT_ID
    }

    pub fn lock(&self) -> MutexGuard<'_, ContainerInner> {
        self.inner.lock().unwrap()
    }

    pub fn running_children(&self) -> i64 {
        self.running_children.load(Ordering::SeqCst)
    }

    pub fn bump_running_children(&self, diff: i64) {
        self.running_children.fetch_add(diff, Ordering::SeqCst);
    }

    pub fn kv_node(&self) -> String {
        self.id.to_string()
    }

    /// Whether this container persists at all; the two roots do not.
    pub fn persistent(&self) -> bool {
        self.id >= crate::FIRST_CONTAINER_ID
    }

    pub fn value_ctx<'a>(
        &'a self,
        eng: &'a Engine,
        inner: &'a ContainerInner,
        links: &'a [String],
    ) -> ValueCtx<'a> {
        ValueCtx {
            name: &self.name,
            id: self.id,
            config: &eng.config,
            links,
            props: &inner.props,
            owner_is_root: inner.owner.uid == 0,
        }
    }

    pub fn get_prop(&self, eng: &Engine, inner: &ContainerInner, name: &str) -> Result<Value> {
        let links = eng.link_names();
        let ctx = self.value_ctx(eng, inner, &links);
        inner.props.get(&ctx, name)
    }

    pub fn get_data_value(
        &self,
        eng: &Engine,
        inner: &ContainerInner,
        name: &str,
    ) -> Result<Value> {
        let links = eng.link_names();
        let ctx = self.value_ctx(eng, inner, &links);
        inner.data.get(&ctx, name)
    }

    /// Store a property and append it to the KV node when persistent.
    /// The log is written before any kernel side-effect that depends on
    /// the value, so restore reflects what the kernel saw.
    pub fn set_prop(
        &self,
        eng: &Engine,
        inner: &mut ContainerInner,
        name: &str,
        value: Value,
    ) -> Result<()> {
        let persistent = inner.props.check(name)?.has_flags(PERSISTENT);
        let pair = (name.to_string(), value.format());
        inner.props.store(name, value)?;
        if persistent && self.persistent() {
            eng.kv
                .append(&self.kv_node(), &[pair])
                .map_err(Error::from)?;
        }
        Ok(())
    }

    pub fn set_data(
        &self,
        eng: &Engine,
        inner: &mut ContainerInner,
        name: &str,
        value: Value,
    ) -> Result<()> {
        let persistent = inner.data.check(name)?.has_flags(PERSISTENT);
        let pair = (name.to_string(), value.format());
        inner.data.store(name, value)?;
        if persistent && self.persistent() {
            eng.kv
                .append(&self.kv_node(), &[pair])
                .map_err(Error::from)?;
        }
        Ok(())
    }

    /// Initialize the value maps of a freshly created container and
    /// write its first persistent record.
    pub fn prepare(&self, eng: &Engine, inner: &mut ContainerInner, owner: Cred) -> Result<()> {
        inner.owner = owner;
        inner.props.store(
            crate::property::P_RAW_ID,
            Value::Uint(self.id as u64),
        )?;
        inner
            .props
            .store(crate::property::P_RAW_NAME, Value::Str(self.name.clone()))?;
        inner.props.store(P_USER, Value::Str(owner.uid.to_string()))?;
        inner
            .props
            .store(crate::property::P_GROUP, Value::Str(owner.gid.to_string()))?;
        inner.data.store(D_START_ERRNO, Value::Int(-1))?;

        if self.persistent() {
            let mut pairs = inner.props.persistent_pairs();
            pairs.extend(inner.data.persistent_pairs());
            eng.kv
                .rewrite(&self.kv_node(), &pairs)
                .map_err(Error::from)?;
        }
        Ok(())
    }

    /// Fill the maps back in from a restored KV node.
    pub fn restore_maps(
        &self,
        inner: &mut ContainerInner,
        node: &std::collections::BTreeMap<String, String>,
    ) -> Result<()> {
        inner.props.restore(node).map_err(|e| {
            Error::InvalidData(format!("bad property record for {}: {}", self.name, e))
        })?;
        inner.data.restore(node).map_err(|e| {
            Error::InvalidData(format!("bad data record for {}: {}", self.name, e))
        })?;
        Ok(())
    }

    /// The container path inside every cgroup hierarchy.
    fn cgroup_path(&self) -> &str {
        &self.name
    }

    pub fn leaf_cgroup(&self, eng: &Engine, subsys: Subsystem) -> Result<Cgroup> {
        eng.cgroups
            .leaf_cgroup(subsys, self.cgroup_path())
            .map_err(Error::from)
    }

    fn freezer(&self, eng: &Engine, inner: &ContainerInner) -> Result<Cgroup> {
        if let Some(cg) = inner.leaf_cgroups.get(&Subsystem::Freezer) {
            return Ok(cg.clone());
        }
        self.leaf_cgroup(eng, Subsystem::Freezer)
    }

    pub fn processes(&self, eng: &Engine, inner: &ContainerInner) -> Vec<i32> {
        self.freezer(eng, inner)
            .and_then(|cg| cg.procs().map_err(Error::from))
            .unwrap_or_default()
    }

    /// Apply every dynamic (cgroup-backed) property to the kernel.
    pub fn apply_dynamic_properties(&self, eng: &Engine, inner: &ContainerInner) -> Result<()> {
        let memcg = self.bound_cgroup(inner, Subsystem::Memory, eng)?;

        cgknob::use_hierarchy_tolerant(&memcg, eng.config.container.use_hierarchy);

        let guarantee = self.get_prop(eng, inner, P_MEM_GUARANTEE)?.as_uint();
        cgknob::set_memory_guarantee(&memcg, guarantee).map_err(|e| {
            warn!("Can't set {}: {:#}", P_MEM_GUARANTEE, e);
            Error::from(e)
        })?;

        let limit = self.get_prop(eng, inner, P_MEM_LIMIT)?.as_uint();
        if let Err(e) = cgknob::set_memory_limit(&memcg, limit) {
            if errno_of(&e) == Some(libc::EBUSY) {
                return Err(Error::InvalidValue(format!("{} is too low", P_MEM_LIMIT)));
            }
            warn!("Can't set {}: {:#}", P_MEM_LIMIT, e);
            return Err(e.into());
        }

        let recharge = self.get_prop(eng, inner, P_RECHARGE_ON_PGFAULT)?.as_bool();
        cgknob::set_recharge_on_pgfault(&memcg, recharge).map_err(Error::from)?;

        let cpucg = self.bound_cgroup(inner, Subsystem::Cpu, eng)?;
        let policy = self.get_prop(eng, inner, P_CPU_POLICY)?;
        cgknob::set_cpu_policy(&cpucg, policy.as_str()).map_err(Error::from)?;
        if policy.as_str() == "normal" {
            let limit = self.get_prop(eng, inner, P_CPU_LIMIT)?.as_uint();
            cgknob::set_cpu_limit(&cpucg, limit).map_err(Error::from)?;
            let guarantee = self.get_prop(eng, inner, P_CPU_GUARANTEE)?.as_uint();
            cgknob::set_cpu_guarantee(&cpucg, guarantee).map_err(Error::from)?;
        }

        let blkcg = self.bound_cgroup(inner, Subsystem::Blkio, eng)?;
        let io_policy = self.get_prop(eng, inner, P_IO_POLICY)?;
        cgknob::set_blkio_policy(&blkcg, io_policy.as_str() == "batch").map_err(Error::from)?;

        let io_limit = self.get_prop(eng, inner, P_IO_LIMIT)?.as_uint();
        cgknob::set_io_limit(&memcg, io_limit).map_err(Error::from)?;

        Ok(())
    }

    fn bound_cgroup(
        &self,
        inner: &ContainerInner,
        subsys: Subsystem,
        eng: &Engine,
    ) -> Result<Cgroup> {
        if let Some(cg) = inner.leaf_cgroups.get(&subsys) {
            return Ok(cg.clone());
        }
        self.leaf_cgroup(eng, subsys)
    }

    /// Create the leaf cgroups and bind them to the container. The
    /// netcls classid is written when networking is enabled.
    pub fn prepare_cgroups(&self, eng: &Engine, inner: &mut ContainerInner) -> Result<()> {
        for subsys in ALL_SUBSYSTEMS.iter() {
            if *subsys == Subsystem::Netcls && eng.net.is_none() {
                continue;
            }
            let cg = self.leaf_cgroup(eng, *subsys)?;
            if let Err(e) = cg.create() {
                inner.leaf_cgroups.clear();
                return Err(e.into());
            }
            inner.leaf_cgroups.insert(*subsys, cg);
        }

        if eng.net.is_some() {
            if let (Some(netcls), Some(tclass)) =
                (inner.leaf_cgroups.get(&Subsystem::Netcls), inner.tclass)
            {
                cgknob::set_classid(netcls, tclass.handle).map_err(|e| {
                    warn!("Can't set classid: {:#}", e);
                    Error::from(e)
                })?;
            }
        }

        self.apply_dynamic_properties(eng, inner)?;

        self.prepare_oom_monitor(eng, inner)?;

        let devices = self.get_prop(eng, inner, P_ALLOWED_DEVICES)?;
        let devcg = inner.leaf_cgroups.get(&Subsystem::Devices).cloned();
        if let Some(devcg) = devcg {
            cgknob::allow_devices(&devcg, devices.as_list()).map_err(|e| {
                warn!("Can't set {}: {:#}", P_ALLOWED_DEVICES, e);
                Error::from(e)
            })?;
        }

        Ok(())
    }

    /// Create the traffic class. A non-isolated container with a running
    /// parent shares the parent's class instead.
    pub fn prepare_network(
        &self,
        eng: &Engine,
        inner: &mut ContainerInner,
        parent_handle: u32,
        share_parent: Option<u32>,
    ) -> Result<()> {
        let net = match &eng.net {
            Some(net) => net,
            None => return Ok(()),
        };

        if let Some(shared) = share_parent {
            inner.tclass = Some(TrafficClass {
                handle: shared,
                owned: false,
            });
            return Ok(());
        }

        let handle = network::tc_handle(network::TC_MAJOR, self.id as u16);
        let prio = self.get_prop(eng, inner, P_NET_PRIO)?.as_uint_map();
        let rate = self.get_prop(eng, inner, P_NET_GUARANTEE)?.as_uint_map();
        let ceil = self.get_prop(eng, inner, P_NET_LIMIT)?.as_uint_map();

        net.create_class(handle, parent_handle, &prio, &rate, &ceil)
            .map_err(|e| {
                warn!("Can't create tclass: {:#}", e);
                Error::from(e)
            })?;

        inner.tclass = Some(TrafficClass {
            handle,
            owned: true,
        });
        Ok(())
    }

    /// Register the OOM eventfd with the event loop.
    pub fn prepare_oom_monitor(&self, eng: &Engine, inner: &mut ContainerInner) -> Result<()> {
        let memcg = match inner.leaf_cgroups.get(&Subsystem::Memory) {
            Some(cg) => cg.clone(),
            None => return Ok(()),
        };

        let efd = match cgknob::register_oom_event(&memcg).map_err(|e| {
            warn!("Can't prepare OOM monitoring: {:#}", e);
            Error::from(e)
        })? {
            Some(efd) => efd,
            None => return Ok(()),
        };

        eng.watch_oom_fd(&efd);
        inner.oom_efd = Some(efd);
        Ok(())
    }

    pub fn shutdown_oom(&self, eng: &Engine, inner: &mut ContainerInner) {
        if let Some(efd) = inner.oom_efd.take() {
            eng.unwatch_oom_fd(&efd);
        }
    }

    /// Send a signal to every task, optionally under a freeze so that
    /// nothing escapes by forking.
    pub fn send_signal(
        &self,
        eng: &Engine,
        inner: &ContainerInner,
        signal: i32,
        freeze: bool,
    ) -> Result<()> {
        let cg = self.freezer(eng, inner)?;
        info!("Send signal {} to {}", signal, self.name);

        if freeze {
            if let Err(e) = cgknob::freeze(&cg) {
                warn!("Can't freeze container: {:#}", e);
            }
        }

        let result = cg.kill_all(signal).map_err(Error::from);

        if freeze {
            if let Err(e) = cgknob::unfreeze(&cg) {
                warn!("Can't unfreeze container: {:#}", e);
            }
        }

        result
    }

    /// Graceful SIGTERM, bounded wait, then SIGKILL under freeze.
    ///
    /// The caller holds only this container's lock; the holder lock must
    /// not be held across the polling sleep.
    pub fn kill_all(&self, eng: &Engine, inner: &ContainerInner) -> Result<()> {
        let cg = self.freezer(eng, inner)?;
        info!("Kill all {}", self.name);

        if self.send_signal(eng, inner, libc::SIGTERM, false).is_ok() {
            let done = sleep_while(eng.config.container.kill_timeout_ms, || !cg.is_empty());
            if !done {
                info!("Child didn't exit via SIGTERM, sending SIGKILL");
            }
        }

        self.send_signal(eng, inner, libc::SIGKILL, true)
    }

    /// Build the environment handed to the external task launcher.
    pub fn prepare_task_env(
        &self,
        eng: &Engine,
        inner: &ContainerInner,
        parent_ns_pid: Option<i32>,
    ) -> Result<TaskEnv> {
        let isolate = self.get_prop(eng, inner, P_ISOLATE)?.as_bool();
        if !isolate {
            for def in inner.props.defs() {
                if def.has_flags(PARENT_RO) && !inner.props.is_default(def.name) {
                    return Err(Error::InvalidValue(format!(
                        "Can't use custom {} with {} == false",
                        def.name, P_ISOLATE
                    )));
                }
            }
        }

        let command = self.get_prop(eng, inner, P_COMMAND)?.as_str().to_string();
        let cwd = self.get_prop(eng, inner, P_CWD)?.as_str().to_string();
        let user = self.get_prop(eng, inner, P_USER)?.as_str().to_string();
        let group = self
            .get_prop(eng, inner, crate::property::P_GROUP)?
            .as_str()
            .to_string();

        let root_prop = self.get_prop(eng, inner, P_ROOT)?.as_str().to_string();
        let loop_dev = self.get_prop(eng, inner, P_RAW_LOOP_DEV)?.as_int() as i32;
        let root = if loop_dev >= 0 {
            PathBuf::from(self.tmp_dir(eng))
        } else {
            PathBuf::from(&root_prop)
        };

        let mut env = self.get_prop(eng, inner, P_ENV)?.as_list().to_vec();
        for (key, value) in [
            (
                "PATH",
                "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
            ),
            ("container", "ozoned".to_string()),
            ("HOME", cwd.clone()),
            ("USER", user.clone()),
        ] {
            if !env.iter().any(|e| e.starts_with(&format!("{}=", key))) {
                env.push(format!("{}={}", key, value));
            }
        }

        let mut bind_mounts = Vec::new();
        for line in self.get_prop(eng, inner, P_BIND)?.as_list() {
            let (source, dest, read_only) = parse_bind(line)?;
            bind_mounts.push(BindMount {
                source: PathBuf::from(source),
                dest: PathBuf::from(dest),
                read_only,
            });
        }

        let mut rlimits = Vec::new();
        for line in self.get_prop(eng, inner, crate::property::P_ULIMIT)?.as_list() {
            let (name, soft, hard) = parse_ulimit(line)?;
            rlimits.push(Rlimit { name, soft, hard });
        }

        let root_rdonly = self.get_prop(eng, inner, P_ROOT_RDONLY)?.as_bool();
        let env = TaskEnv {
            container: self.name.clone(),
            command,
            cwd: PathBuf::from(cwd),
            root,
            root_rdonly,
            user,
            group,
            env,
            isolate,
            new_mount_ns: isolate || root_rdonly || !bind_mounts.is_empty(),
            hostname: self.get_prop(eng, inner, P_HOSTNAME)?.as_str().to_string(),
            bind_dns: self.get_prop(eng, inner, P_BIND_DNS)?.as_bool(),
            stdin_path: PathBuf::from(self.get_prop(eng, inner, P_STDIN_PATH)?.as_str()),
            stdout_path: PathBuf::from(self.get_prop(eng, inner, P_STDOUT_PATH)?.as_str()),
            stderr_path: PathBuf::from(self.get_prop(eng, inner, P_STDERR_PATH)?.as_str()),
            bind_mounts,
            devices: self.get_prop(eng, inner, P_ALLOWED_DEVICES)?.as_list().to_vec(),
            capabilities: self.get_prop(eng, inner, P_CAPABILITIES)?.as_list().to_vec(),
            rlimits,
            loop_dev,
            parent_ns_pid,
            cgroups: inner
                .leaf_cgroups
                .iter()
                .map(|(s, cg)| (s.as_str().to_string(), cg.path().to_path_buf()))
                .collect(),
        };
        Ok(env)
    }

    pub fn tmp_dir(&self, eng: &Engine) -> String {
        format!("{}/{}", eng.config.container.tmp_dir, self.id)
    }

    fn remove_log(path: &str) {
        let p = Path::new(path);
        match p.metadata() {
            Ok(meta) if meta.is_file() => {
                if let Err(e) = std::fs::remove_file(p) {
                    warn!("Can't remove stdio file {}: {}", path, e);
                }
            }
            _ => {}
        }
    }

    /// Remove default stdout/stderr files; explicitly configured paths
    /// belong to the user and stay.
    pub fn remove_stdio_logs(&self, eng: &Engine, inner: &ContainerInner) {
        for prop in [P_STDOUT_PATH, P_STDERR_PATH] {
            if inner.props.is_default(prop) {
                if let Ok(path) = self.get_prop(eng, inner, prop) {
                    Self::remove_log(path.as_str());
                }
            }
        }
    }

    /// Truncate stdout/stderr when they outgrow the configured cap.
    pub fn rotate_logs(&self, eng: &Engine, inner: &ContainerInner) {
        let max = eng.config.container.max_log_size;
        for prop in [P_STDOUT_PATH, P_STDERR_PATH] {
            let path = match self.get_prop(eng, inner, prop) {
                Ok(v) => v.as_str().to_string(),
                Err(_) => continue,
            };
            let p = Path::new(&path);
            if let Ok(meta) = p.metadata() {
                if meta.is_file() && meta.len() > max {
                    if let Err(e) =
                        std::fs::OpenOptions::new().write(true).open(p).and_then(|f| f.set_len(0))
                    {
                        warn!("Can't rotate {}: {}", path, e);
                    }
                }
            }
        }
    }

    /// Free every kernel resource. Best-effort: teardown continues past
    /// intermediate failures so a later Destroy converges.
    pub fn free_resources(&self, eng: &Engine, inner: &mut ContainerInner) {
        for (_, cg) in inner.leaf_cgroups.drain() {
            if let Err(e) = cg.remove() {
                warn!("Can't remove cgroup {:?}: {:#}", cg.path(), e);
            }
        }

        if let Some(tclass) = inner.tclass.take() {
            if tclass.owned {
                if let Some(net) = &eng.net {
                    if let Err(e) = net.delete_class(tclass.handle) {
                        warn!("Can't remove tclass {:#x}: {:#}", tclass.handle, e);
                    }
                }
            }
        }

        inner.task = None;
        self.shutdown_oom(eng, inner);
        self.remove_stdio_logs(eng, inner);

        let loop_dev = self
            .get_prop(eng, inner, P_RAW_LOOP_DEV)
            .map(|v| v.as_int())
            .unwrap_or(-1) as i32;
        if let Err(e) = self.set_prop(eng, inner, P_RAW_LOOP_DEV, Value::Int(-1)) {
            warn!("Can't set {}: {}", P_RAW_LOOP_DEV, e);
        }
        if loop_dev >= 0 {
            if let Err(e) = loopdev::put_loop_dev(loop_dev) {
                warn!("Can't put loop device {}: {:#}", loop_dev, e);
            }
        }
    }

    /// Record death: exit status, death time and the OOM flag.
    pub fn record_exit(
        &self,
        eng: &Engine,
        inner: &mut ContainerInner,
        status: i32,
        oom_killed: bool,
    ) {
        if let Err(e) = self.set_data(eng, inner, D_EXIT_STATUS, Value::Int(status as i64)) {
            warn!("Can't set {}: {}", D_EXIT_STATUS, e);
        }
        if let Err(e) = self.set_prop(
            eng,
            inner,
            P_RAW_DEATH_TIME,
            Value::Uint(current_time_ms()),
        ) {
            warn!("Can't set {}: {}", P_RAW_DEATH_TIME, e);
        }
        if oom_killed {
            if let Err(e) = self.set_data(eng, inner, D_OOM_KILLED, Value::Bool(true)) {
                warn!("Can't set {}: {}", D_OOM_KILLED, e);
            }
        }
        if let Err(e) = self.set_prop(eng, inner, P_RAW_ROOT_PID, Value::Int(0)) {
            warn!("Can't set {}: {}", P_RAW_ROOT_PID, e);
        }
    }

    /// Whether the respawn policy allows another go.
    pub fn may_respawn(&self, eng: &Engine, inner: &ContainerInner) -> bool {
        if inner.state != ContainerState::Dead {
            return false;
        }
        let respawn = self
            .get_prop(eng, inner, P_RESPAWN)
            .map(|v| v.as_bool())
            .unwrap_or(false);
        if !respawn {
            return false;
        }
        let max = self
            .get_prop(eng, inner, P_MAX_RESPAWNS)
            .map(|v| v.as_int())
            .unwrap_or(-1);
        let count = self
            .get_data_value(eng, inner, D_RESPAWN_COUNT)
            .map(|v| v.as_uint())
            .unwrap_or(0);
        max < 0 || count < max as u64
    }

    /// Dead containers age out of the registry after `aging_time`.
    pub fn can_remove_dead(&self, eng: &Engine, inner: &ContainerInner) -> bool {
        if inner.state != ContainerState::Dead {
            return false;
        }
        let death_time = self
            .get_prop(eng, inner, P_RAW_DEATH_TIME)
            .map(|v| v.as_uint())
            .unwrap_or(0);
        let aging = self
            .get_prop(eng, inner, P_AGING_TIME)
            .map(|v| v.as_uint())
            .unwrap_or(0);
        death_time / 1000 + aging <= current_time_ms() / 1000
    }

    pub fn add_waiter(&self, inner: &mut ContainerInner, waiter: &Arc<Waiter>) {
        if inner.state == ContainerState::Running {
            inner.waiters.retain(|w| w.upgrade().is_some());
            inner.waiters.push(Arc::downgrade(waiter));
        } else {
            waiter.signal(&self.name);
        }
    }

    pub fn notify_waiters(&self, inner: &mut ContainerInner) {
        if inner.state != ContainerState::Running {
            let waiters = std::mem::take(&mut inner.waiters);
            for weak in waiters {
                if let Some(waiter) = weak.upgrade() {
                    waiter.signal(&self.name);
                }
            }
        }
    }

    /// Record the new state in the data map. Waiter notification and
    /// running-children accounting are the registry's concern.
    pub fn write_state(&self, eng: &Engine, inner: &mut ContainerInner, state: ContainerState) {
        inner.state = state;
        if let Err(e) = self.set_data(eng, inner, D_STATE, Value::Str(state.as_str().to_string()))
        {
            warn!("Can't persist state of {}: {}", self.name, e);
        }
        self.notify_waiters(inner);
    }

    /// A lost-and-restored container with an empty freezer cgroup will
    /// never produce another event; report whether it should be demoted.
    pub fn lost_and_empty(&self, eng: &Engine, inner: &mut ContainerInner) -> bool {
        if !(inner.lost_and_restored && inner.state == ContainerState::Running) {
            return false;
        }
        let task_dead = inner.task.as_ref().map(|t| !t.is_running()).unwrap_or(true);
        let empty = self
            .freezer(eng, inner)
            .map(|cg| cg.is_empty())
            .unwrap_or(true);
        if task_dead && empty {
            if inner.cgroup_empty_since == 0 {
                inner.cgroup_empty_since = current_time_ms();
            }
            info!(
                "Lost and restored container {} is empty since {}, mark it dead",
                self.name, inner.cgroup_empty_since
            );
            return true;
        }
        false
    }

    /// Verify the start preconditions that only involve this container.
    pub fn check_start(&self, eng: &Engine, inner: &ContainerInner, meta: bool) -> Result<()> {
        if inner.state != ContainerState::Stopped {
            return Err(Error::InvalidState(format!(
                "invalid container state {}",
                inner.state.as_str()
            )));
        }
        if !meta
            && self
                .get_prop(eng, inner, P_COMMAND)?
                .as_str()
                .is_empty()
        {
            return Err(Error::InvalidValue("container command is empty".to_string()));
        }
        if self.get_prop(eng, inner, P_ROOT)?.as_str() == "/"
            && self.get_prop(eng, inner, P_ROOT_RDONLY)?.as_bool()
        {
            return Err(Error::InvalidValue("can't make / read-only".to_string()));
        }

        // Re-validate everything non-default now that the full property
        // picture exists; set-order could have hidden a violation.
        let links = eng.link_names();
        let ctx = self.value_ctx(eng, inner, &links);
        for def in inner.props.defs() {
            if inner.props.is_default(def.name) {
                continue;
            }
            let value = inner.props.get(&ctx, def.name)?;
            inner.props.validate(&ctx, def.name, &value)?;
        }
        Ok(())
    }

    /// Attach a loop device when the root is a regular file. The device
    /// number is persisted before anything else can fail, so restore can
    /// always reclaim it.
    pub fn prepare_loop_dev(&self, eng: &Engine, inner: &mut ContainerInner) -> Result<()> {
        let root = self.get_prop(eng, inner, P_ROOT)?.as_str().to_string();
        if root == "/" || Path::new(&root).is_dir() {
            return Ok(());
        }

        let loop_nr = loopdev::get_loop_dev().map_err(Error::from)?;
        if let Err(e) = self.set_prop(eng, inner, P_RAW_LOOP_DEV, Value::Int(loop_nr as i64)) {
            let _ = loopdev::put_loop_dev(loop_nr);
            return Err(e);
        }
        Ok(())
    }

    /// Reattach to a process recorded before a daemon restart. Returns
    /// true when the task is confidently ours, false when it was lost.
    pub fn reattach_task(&self, eng: &Engine, inner: &mut ContainerInner, pid: i32) -> bool {
        let task = Task::new(pid, eng.launcher.clone());
        let attached;

        if task.has_correct_parent() {
            if task.is_zombie() {
                info!("Task {} is zombie and belongs to the supervisor", pid);
                attached = true;
            } else {
                let in_freezer = self
                    .freezer(eng, inner)
                    .map(|cg| cg.tasks().unwrap_or_default().contains(&pid))
                    .unwrap_or(false);
                if in_freezer {
                    info!("Task {} is running and belongs to the supervisor", pid);
                    attached = true;
                } else {
                    warn!("Task {} runs outside its freezer cgroup", pid);
                    attached = false;
                }
            }
        } else {
            info!("Task {} is dead or was reparented", pid);
            attached = false;
        }

        inner.task = Some(task);
        inner.lost_and_restored = !attached;
        attached
    }

    /// Resolve the freezer into a concrete error for stop timeouts.
    pub fn stop_timeout_error(&self, eng: &Engine) -> Error {
        Error::from(anyhow!(
            "Container {} didn't stop in {}ms",
            self.name,
            eng.config.container.stop_timeout_ms
        ))
    }
}

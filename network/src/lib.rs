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

//! Traffic-class management.
//!
//! The manager maintains one HTB hierarchy per non-loopback running
//! interface:
//!
//! ```text
//! 1:0 qdisc
//! 1:1 default / supervisor-root class
//! 1:3 container a    1:4 container b
//! 1:5 container a/c
//! ```
//!
//! Handle encoding: the major is fixed, the minor is the container id.
//! A cgroup filter on the qdisc steers packets by `net_cls.classid`.
//! All mutating operations run under the single manager lock; callers
//! never hold a container lock while waiting on it in reverse order.

pub mod error;

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use log::{info, warn};

pub use error::NetworkError;

pub type TcHandle = u32;

/// Fixed major of the supervisor's HTB hierarchy.
pub const TC_MAJOR: u16 = 1;
/// Minor of the qdisc itself.
pub const TC_ROOT_MINOR: u16 = 0;
/// Minor of the default class; unclassified traffic lands here. It is
/// also the supervisor-root class, since the supervisor root container
/// id is 1.
pub const TC_DEFAULT_MINOR: u16 = 1;

pub fn tc_handle(major: u16, minor: u16) -> TcHandle {
    (major as u32) << 16 | minor as u32
}

pub fn tc_major(handle: TcHandle) -> u16 {
    (handle >> 16) as u16
}

pub fn tc_minor(handle: TcHandle) -> u16 {
    (handle & 0xffff) as u16
}

/// Per-class counters exported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcStat {
    Packets,
    Bytes,
    Drops,
    Overlimits,
    RateBps,
    RatePps,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub index: i32,
}

/// Per-interface uint values with a `"default"` fallback entry.
pub type UintMap = BTreeMap<String, u64>;

pub fn uint_map_get(map: &UintMap, name: &str) -> u64 {
    map.get(name)
        .or_else(|| map.get("default"))
        .copied()
        .unwrap_or(0)
}

/// Low-level netlink operations, provided by the rtnetlink backend
/// shipped with the daemon packaging. `add_class` must behave as
/// create-or-replace; `del_class` must fail with
/// `NetworkError::ClassBusy` while child classes exist.
pub trait NetlinkDriver: Send {
    /// Non-loopback running interfaces.
    fn list_interfaces(&self) -> Result<Vec<Interface>>;
    fn create_root_qdisc(&self, ifindex: i32, handle: TcHandle, default_minor: u16) -> Result<()>;
    fn add_class(
        &self,
        ifindex: i32,
        parent: TcHandle,
        handle: TcHandle,
        prio: u64,
        rate: u64,
        ceil: u64,
    ) -> Result<()>;
    fn del_class(&self, ifindex: i32, handle: TcHandle) -> Result<()>;
    /// All (handle, parent) pairs on an interface.
    fn list_classes(&self, ifindex: i32) -> Result<Vec<(TcHandle, TcHandle)>>;
    fn add_cgroup_filter(&self, ifindex: i32, parent: TcHandle) -> Result<()>;
    fn class_stat(&self, ifindex: i32, handle: TcHandle, kind: TcStat) -> Result<u64>;
}

/// Root-class rates installed on every interface.
#[derive(Debug, Clone)]
pub struct NetDefaults {
    pub prio: u64,
    pub guarantee: u64,
    pub max_guarantee: u64,
    pub limit: u64,
}

struct NetInner {
    driver: Box<dyn NetlinkDriver>,
    ifaces: Vec<Interface>,
    defaults: NetDefaults,
}

pub struct NetworkManager {
    inner: Mutex<NetInner>,
}

impl NetworkManager {
    pub fn new(driver: Box<dyn NetlinkDriver>, defaults: NetDefaults) -> Self {
        NetworkManager {
            inner: Mutex::new(NetInner {
                driver,
                ifaces: Vec::new(),
                defaults,
            }),
        }
    }

    /// Discover interfaces and install the qdisc, default class and
    /// cgroup filter on each.
    pub fn prepare(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.ifaces = inner.driver.list_interfaces()?;

        let ifaces = inner.ifaces.clone();
        for iface in &ifaces {
            Self::prepare_interface(&mut inner, iface)?;
        }
        Ok(())
    }

    fn prepare_interface(inner: &mut NetInner, iface: &Interface) -> Result<()> {
        info!("Prepare link {} {}", iface.name, iface.index);

        let root = tc_handle(TC_MAJOR, TC_ROOT_MINOR);
        inner
            .driver
            .create_root_qdisc(iface.index, root, TC_DEFAULT_MINOR)?;

        inner.driver.add_class(
            iface.index,
            root,
            tc_handle(TC_MAJOR, TC_DEFAULT_MINOR),
            inner.defaults.prio,
            rate_or_min(inner.defaults.max_guarantee),
            inner.defaults.limit,
        )?;

        inner.driver.add_cgroup_filter(iface.index, root)?;
        Ok(())
    }

    /// Create (or re-apply) the HTB class for a container on every
    /// interface. `rate` 0 is remapped to 1: TC refuses a zero rate but
    /// the supervisor calls it a guarantee, where zero is meaningful.
    pub fn create_class(
        &self,
        handle: TcHandle,
        parent: TcHandle,
        prio: &UintMap,
        rate: &UintMap,
        ceil: &UintMap,
    ) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        for iface in &inner.ifaces {
            inner.driver.add_class(
                iface.index,
                parent,
                handle,
                uint_map_get(prio, &iface.name),
                rate_or_min(uint_map_get(rate, &iface.name)),
                uint_map_get(ceil, &iface.name),
            )?;
        }
        Ok(())
    }

    /// Delete a container's class on every interface. A busy class is
    /// removed bottom-up: children are collected breadth-first and
    /// deleted in reverse, then the deletion is retried.
    pub fn delete_class(&self, handle: TcHandle) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        for iface in &inner.ifaces {
            match inner.driver.del_class(iface.index, handle) {
                Ok(()) => continue,
                Err(e) if is_busy(&e) => {
                    let classes = inner.driver.list_classes(iface.index)?;
                    let mut doomed = vec![handle];
                    let mut i = 0;
                    while i < doomed.len() {
                        for (h, parent) in &classes {
                            if *parent == doomed[i] {
                                doomed.push(*h);
                            }
                        }
                        i += 1;
                    }
                    for h in doomed.iter().rev() {
                        inner.driver.del_class(iface.index, *h)?;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Per-interface counters for one class.
    pub fn get_stats(&self, handle: TcHandle, kind: TcStat) -> Result<BTreeMap<String, u64>> {
        let inner = self.inner.lock().unwrap();
        let mut result = BTreeMap::new();
        for iface in &inner.ifaces {
            let value = inner.driver.class_stat(iface.index, handle, kind)?;
            result.insert(iface.name.clone(), value);
        }
        Ok(result)
    }

    /// Refresh the interface list: new links get the root qdisc and
    /// default class, vanished links are forgotten.
    pub fn update_interfaces(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let fresh = inner.driver.list_interfaces()?;

        for iface in &fresh {
            if !inner.ifaces.iter().any(|i| i.name == iface.name) {
                info!("Found new link: {}", iface.name);
                Self::prepare_interface(&mut inner, iface)?;
            }
        }
        for iface in &inner.ifaces {
            if !fresh.iter().any(|i| i.name == iface.name) {
                warn!("Link {} disappeared, dropping its classes", iface.name);
            }
        }

        inner.ifaces = fresh;
        Ok(())
    }

    pub fn interface_names(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .ifaces
            .iter()
            .map(|i| i.name.clone())
            .collect()
    }
}

fn rate_or_min(rate: u64) -> u64 {
    if rate == 0 {
        1
    } else {
        rate
    }
}

fn is_busy(e: &anyhow::Error) -> bool {
    matches!(e.downcast_ref::<NetworkError>(), Some(NetworkError::ClassBusy(_)))
}

/// In-memory `NetlinkDriver` used by this crate's tests and by the
/// supervisor's state-machine tests.
pub mod mock {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct MockState {
        /// ifindex -> handle -> (parent, prio, rate, ceil)
        pub classes: HashMap<i32, HashMap<TcHandle, (TcHandle, u64, u64, u64)>>,
        pub qdiscs: HashMap<i32, TcHandle>,
        pub filters: HashMap<i32, TcHandle>,
        pub ifaces: Vec<Interface>,
        pub bytes: u64,
    }

    pub struct MockNetlink {
        pub state: std::sync::Arc<Mutex<MockState>>,
    }

    impl MockNetlink {
        pub fn new(ifaces: Vec<Interface>) -> Self {
            MockNetlink {
                state: std::sync::Arc::new(Mutex::new(MockState {
                    ifaces,
                    ..Default::default()
                })),
            }
        }

        /// Shared view of the state, kept by tests after the driver
        /// itself moves into the manager.
        pub fn shared(&self) -> std::sync::Arc<Mutex<MockState>> {
            self.state.clone()
        }
    }

    impl NetlinkDriver for MockNetlink {
        fn list_interfaces(&self) -> Result<Vec<Interface>> {
            Ok(self.state.lock().unwrap().ifaces.clone())
        }

        fn create_root_qdisc(
            &self,
            ifindex: i32,
            handle: TcHandle,
            _default_minor: u16,
        ) -> Result<()> {
            self.state.lock().unwrap().qdiscs.insert(ifindex, handle);
            Ok(())
        }

        fn add_class(
            &self,
            ifindex: i32,
            parent: TcHandle,
            handle: TcHandle,
            prio: u64,
            rate: u64,
            ceil: u64,
        ) -> Result<()> {
            if rate == 0 {
                return Err(anyhow!(NetworkError::Netlink("zero rate".to_string())));
            }
            self.state
                .lock()
                .unwrap()
                .classes
                .entry(ifindex)
                .or_default()
                .insert(handle, (parent, prio, rate, ceil));
            Ok(())
        }

        fn del_class(&self, ifindex: i32, handle: TcHandle) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            let classes = state.classes.entry(ifindex).or_default();
            if !classes.contains_key(&handle) {
                return Err(anyhow!(NetworkError::NoSuchClass(
                    handle,
                    ifindex.to_string()
                )));
            }
            if classes.values().any(|(parent, ..)| *parent == handle) {
                return Err(anyhow!(NetworkError::ClassBusy(handle)));
            }
            classes.remove(&handle);
            Ok(())
        }

        fn list_classes(&self, ifindex: i32) -> Result<Vec<(TcHandle, TcHandle)>> {
            let state = self.state.lock().unwrap();
            Ok(state
                .classes
                .get(&ifindex)
                .map(|m| m.iter().map(|(h, (p, ..))| (*h, *p)).collect())
                .unwrap_or_default())
        }

        fn add_cgroup_filter(&self, ifindex: i32, parent: TcHandle) -> Result<()> {
            self.state.lock().unwrap().filters.insert(ifindex, parent);
            Ok(())
        }

        fn class_stat(&self, ifindex: i32, handle: TcHandle, _kind: TcStat) -> Result<u64> {
            let state = self.state.lock().unwrap();
            match state.classes.get(&ifindex).and_then(|m| m.get(&handle)) {
                Some(_) => Ok(state.bytes),
                None => Err(anyhow!(NetworkError::NoSuchClass(
                    handle,
                    ifindex.to_string()
                ))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockNetlink;
    use super::*;

    fn two_links() -> Vec<Interface> {
        vec![
            Interface {
                name: "eth0".to_string(),
                index: 2,
            },
            Interface {
                name: "eth1".to_string(),
                index: 3,
            },
        ]
    }

    fn manager(driver: MockNetlink) -> NetworkManager {
        NetworkManager::new(
            Box::new(driver),
            NetDefaults {
                prio: 3,
                guarantee: 0,
                max_guarantee: 1 << 30,
                limit: 1 << 30,
            },
        )
    }

    #[test]
    fn test_prepare_installs_qdisc_default_class_and_filter() {
        let mock = MockNetlink::new(two_links());
        let mgr = manager(mock);
        mgr.prepare().unwrap();

        let stats = mgr
            .get_stats(tc_handle(TC_MAJOR, TC_DEFAULT_MINOR), TcStat::Bytes)
            .unwrap();
        assert_eq!(stats.len(), 2);
        assert!(stats.contains_key("eth0") && stats.contains_key("eth1"));
    }

    #[test]
    fn test_create_class_remaps_zero_rate() {
        let mock = MockNetlink::new(two_links());
        let mgr = manager(mock);
        mgr.prepare().unwrap();

        let mut rate = UintMap::new();
        rate.insert("default".to_string(), 0);
        let handle = tc_handle(TC_MAJOR, 2);
        // A zero rate would be rejected by the driver; the manager must
        // remap it to the minimal valid guarantee.
        mgr.create_class(
            handle,
            tc_handle(TC_MAJOR, TC_DEFAULT_MINOR),
            &UintMap::new(),
            &rate,
            &UintMap::new(),
        )
        .unwrap();
        assert_eq!(mgr.get_stats(handle, TcStat::Bytes).unwrap().len(), 2);
    }

    #[test]
    fn test_per_interface_override() {
        let mock = MockNetlink::new(two_links());
        let mgr = manager(mock);
        mgr.prepare().unwrap();

        let mut ceil = UintMap::new();
        ceil.insert("default".to_string(), 1000);
        ceil.insert("eth1".to_string(), 2000);
        assert_eq!(uint_map_get(&ceil, "eth0"), 1000);
        assert_eq!(uint_map_get(&ceil, "eth1"), 2000);
    }

    #[test]
    fn test_delete_busy_class_removes_children_post_order() {
        let mock = MockNetlink::new(two_links());
        let mgr = manager(mock);
        mgr.prepare().unwrap();

        let parent = tc_handle(TC_MAJOR, 2);
        let child = tc_handle(TC_MAJOR, 3);
        let grandchild = tc_handle(TC_MAJOR, 4);
        let root = tc_handle(TC_MAJOR, TC_DEFAULT_MINOR);

        let mut rate = UintMap::new();
        rate.insert("default".to_string(), 1);
        mgr.create_class(parent, root, &UintMap::new(), &rate, &UintMap::new())
            .unwrap();
        mgr.create_class(child, parent, &UintMap::new(), &rate, &UintMap::new())
            .unwrap();
        mgr.create_class(grandchild, child, &UintMap::new(), &rate, &UintMap::new())
            .unwrap();

        mgr.delete_class(parent).unwrap();
        assert!(mgr.get_stats(parent, TcStat::Bytes).is_err());
        assert!(mgr.get_stats(child, TcStat::Bytes).is_err());
        assert!(mgr.get_stats(grandchild, TcStat::Bytes).is_err());
    }

    #[test]
    fn test_update_interfaces_prepares_new_links() {
        let mock = MockNetlink::new(two_links());
        let state = mock.shared();
        let mgr = manager(mock);
        mgr.prepare().unwrap();
        assert_eq!(mgr.interface_names(), vec!["eth0", "eth1"]);

        state.lock().unwrap().ifaces.push(Interface {
            name: "eth2".to_string(),
            index: 4,
        });
        mgr.update_interfaces().unwrap();
        assert_eq!(mgr.interface_names(), vec!["eth0", "eth1", "eth2"]);

        // The fresh link got the default class installed.
        let qdiscs = state.lock().unwrap().qdiscs.clone();
        assert!(qdiscs.contains_key(&4));
        let stats = mgr
            .get_stats(tc_handle(TC_MAJOR, TC_DEFAULT_MINOR), TcStat::Bytes)
            .unwrap();
        assert_eq!(stats.len(), 3);
    }
}

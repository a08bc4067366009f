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

mod process_launcher;
mod signal_handler;

use std::path::PathBuf;
use std::process::exit;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};

use cgroup::CgroupDriver;
use container::config::DaemonConfig;
use container::event::{Event, EventQueue};
use container::registry::Registry;
use container::Engine;
use kv_store::KvStore;
use network::NetworkManager;
use util::loop_context::{EventLoopContext, EventLoopManager};

use crate::process_launcher::ProcessLauncher;

/// Name of the supervisor's own cgroup under every hierarchy root.
const CGROUP_ROOT_NAME: &str = "ozoned";

#[derive(Parser, Debug)]
#[command(version, author, about = "Linux container supervisor")]
struct Cli {
    /// Path of the daemon configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Path of log file.
    #[arg(short, long)]
    log: Option<PathBuf>,
    /// Enable debug log level.
    #[arg(short, long)]
    debug: bool,
}

struct DaemonManager;

impl EventLoopManager for DaemonManager {
    fn loop_should_exit(&self) -> bool {
        signal_handler::SHUTDOWN.load(Ordering::SeqCst)
    }

    fn loop_cleanup(&self) -> util::Result<()> {
        info!("Leaving containers running; state is reclaimed on restart");
        Ok(())
    }
}

/// Reap children forever and feed their exit statuses to the engine.
fn spawn_reaper(events: Arc<EventQueue>) -> Result<()> {
    thread::Builder::new()
        .name("reaper".to_string())
        .spawn(move || loop {
            let mut status: libc::c_int = 0;
            // SAFETY: status is a valid out-param.
            let pid = unsafe { libc::waitpid(-1, &mut status, 0) };
            if pid > 0 {
                events.push(Event::Exit { pid, status });
                continue;
            }
            let errno = std::io::Error::last_os_error().raw_os_error();
            if errno == Some(libc::ECHILD) {
                // No children yet; don't spin.
                thread::sleep(Duration::from_millis(200));
            }
            if signal_handler::SHUTDOWN.load(Ordering::SeqCst) {
                return;
            }
        })
        .with_context(|| "Failed to spawn reaper thread")?;
    Ok(())
}

/// The HTB backend binds in through `network::NetlinkDriver`; this build
/// carries no rtnetlink bindings, so traffic accounting stays off until
/// the driver component is installed alongside the daemon.
fn build_network(config: &DaemonConfig) -> Option<NetworkManager> {
    if config.network.enabled {
        warn!("network.enabled is set but no netlink driver is linked in; traffic classes disabled");
    }
    None
}

fn real_main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => DaemonConfig::from_file(path)?,
        None => DaemonConfig::default(),
    };

    let log_path = cli
        .log
        .clone()
        .or_else(|| config.daemon.log_file.clone().map(PathBuf::from));
    util::logger::init(&log_path, cli.debug).with_context(|| "Failed to init logger")?;

    info!("Starting ozoned");

    let kv = KvStore::new(&config.container.kv_dir);
    kv.mount_tmpfs(config.container.kv_size_mb)
        .with_context(|| "Failed to mount the key-value tmpfs")?;

    let cgroups = CgroupDriver::new(CGROUP_ROOT_NAME)
        .with_context(|| "Failed to discover cgroup hierarchies")?;
    cgroups.prepare()?;

    let net = build_network(&config);
    if let Some(net) = &net {
        net.prepare()?;
    }

    let events = Arc::new(EventQueue::new()?);
    let engine = Arc::new(Engine::new(
        config,
        kv,
        cgroups,
        net,
        Arc::new(ProcessLauncher),
        events.clone(),
    ));
    let registry = Registry::new(engine);

    let mut main_loop = EventLoopContext::new();
    registry.attach_to_loop(&main_loop.handle());
    main_loop.set_manager(Arc::new(Mutex::new(DaemonManager)));

    registry.restore_all();

    spawn_reaper(events.clone())?;
    signal_handler::set_wake_fd(events.raw_fd());
    signal_handler::register_kill_signal();

    while main_loop.run()? {}

    info!("ozoned exits");
    Ok(())
}

fn main() {
    if let Err(e) = real_main() {
        eprintln!("ERROR: {:?}", e);
        exit(1);
    }
    exit(0);
}

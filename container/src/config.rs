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

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

fn default_tmp_dir() -> String {
    "/place/ozoned".to_string()
}
fn default_kv_dir() -> String {
    "/tmp/ozoned".to_string()
}
fn default_kv_size_mb() -> u64 {
    32
}
fn default_kill_timeout_ms() -> u64 {
    30_000
}
fn default_stop_timeout_ms() -> u64 {
    5_000
}
fn default_respawn_delay_ms() -> u64 {
    1_000
}
fn default_aging_time_s() -> u64 {
    86_400
}
fn default_rotate_period_ms() -> u64 {
    60_000
}
fn default_max_log_size() -> u64 {
    10 << 20
}
fn default_stdout_limit() -> u64 {
    8 << 20
}
fn default_private_max() -> u64 {
    1024
}
fn default_use_hierarchy() -> bool {
    true
}
fn default_max_containers() -> u32 {
    4096
}
fn default_true() -> bool {
    true
}
fn default_net_prio() -> u64 {
    3
}
fn default_net_guarantee() -> u64 {
    0
}
fn default_net_max_guarantee() -> u64 {
    4 << 30
}
fn default_net_limit() -> u64 {
    4 << 30
}
fn default_memory_reserve() -> u64 {
    2 << 30
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ContainerSection {
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: String,
    #[serde(default = "default_kv_dir")]
    pub kv_dir: String,
    #[serde(default = "default_kv_size_mb")]
    pub kv_size_mb: u64,
    #[serde(default = "default_kill_timeout_ms")]
    pub kill_timeout_ms: u64,
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    #[serde(default = "default_respawn_delay_ms")]
    pub respawn_delay_ms: u64,
    #[serde(default = "default_aging_time_s")]
    pub aging_time_s: u64,
    #[serde(default = "default_rotate_period_ms")]
    pub rotate_period_ms: u64,
    #[serde(default = "default_max_log_size")]
    pub max_log_size: u64,
    #[serde(default = "default_stdout_limit")]
    pub stdout_limit: u64,
    #[serde(default = "default_private_max")]
    pub private_max: u64,
    #[serde(default = "default_use_hierarchy")]
    pub use_hierarchy: bool,
    #[serde(default = "default_max_containers")]
    pub max_containers: u32,
}

impl Default for ContainerSection {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct NetworkSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_net_prio")]
    pub default_prio: u64,
    #[serde(default = "default_net_guarantee")]
    pub default_guarantee: u64,
    #[serde(default = "default_net_max_guarantee")]
    pub default_max_guarantee: u64,
    #[serde(default = "default_net_limit")]
    pub default_limit: u64,
}

impl Default for NetworkSection {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DaemonSection {
    #[serde(default = "default_memory_reserve")]
    pub memory_guarantee_reserve: u64,
    #[serde(default)]
    pub log_file: Option<String>,
}

impl Default for DaemonSection {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap()
    }
}

/// Daemon configuration, read from a JSON file.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct DaemonConfig {
    #[serde(default)]
    pub container: ContainerSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub daemon: DaemonSection,
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config: DaemonConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        config.check()?;
        Ok(config)
    }

    /// Healthy check for the parsed configuration.
    pub fn check(&self) -> Result<()> {
        if self.container.kv_size_mb == 0 {
            bail!("container.kv_size_mb must not be zero");
        }
        if self.container.max_containers == 0 {
            bail!("container.max_containers must not be zero");
        }
        if self.container.stop_timeout_ms == 0 || self.container.kill_timeout_ms == 0 {
            bail!("container timeouts must not be zero");
        }
        if self.network.default_prio > 7 {
            bail!("network.default_prio must be within 0-7");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = DaemonConfig::default();
        config.check().unwrap();
        assert_eq!(config.container.kv_size_mb, 32);
        assert_eq!(config.container.max_containers, 4096);
        assert!(config.network.enabled);
    }

    #[test]
    fn test_partial_json_overrides() {
        let raw = r#"{ "container": { "stop_timeout_ms": 123 }, "network": { "enabled": false } }"#;
        let config: DaemonConfig = serde_json::from_str(raw).unwrap();
        config.check().unwrap();
        assert_eq!(config.container.stop_timeout_ms, 123);
        assert!(!config.network.enabled);
        assert_eq!(config.container.kill_timeout_ms, 30_000);
    }

    #[test]
    fn test_check_rejects_bad_prio() {
        let raw = r#"{ "network": { "default_prio": 8 } }"#;
        let config: DaemonConfig = serde_json::from_str(raw).unwrap();
        assert!(config.check().is_err());
    }
}

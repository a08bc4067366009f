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

//! Persistent key-value store for container state.
//!
//! One file per container on a daemon-private tmpfs. Each file is an
//! append-only sequence of length-delimited records; a record holds a
//! batch of key/value string pairs. Loading merges records in order so
//! that the last write wins per key, which lets state updates be a
//! cheap append while the full picture stays recoverable after a
//! daemon restart.

pub mod error;

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use log::{info, warn};
use nix::mount::{mount, MsFlags};

pub use error::KvStoreError;

/// A record larger than this is considered corrupt rather than read.
const RECORD_SIZE_MAX: u32 = 1024 * 1024;

/// Merged view of one container's persistent pairs.
pub type KvNode = BTreeMap<String, String>;

pub struct KvStore {
    dir: PathBuf,
}

impl KvStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        KvStore {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Mount the private tmpfs backing the store unless `/proc/mounts`
    /// already shows one at the store directory.
    pub fn mount_tmpfs(&self, size_mb: u64) -> Result<()> {
        let mountpoint = self.dir.to_string_lossy().to_string();

        let mounts = File::open("/proc/mounts").with_context(|| "Failed to open '/proc/mounts'")?;
        for line in BufReader::new(mounts).lines() {
            let line = line.with_context(|| "Failed to read '/proc/mounts'")?;
            let mut fields = line.split(' ');
            let (_source, target) = (fields.next(), fields.next());
            if target == Some(mountpoint.as_str()) {
                info!("Key-value tmpfs already mounted on {}", mountpoint);
                return Ok(());
            }
        }

        if !self.dir.exists() {
            fs::create_dir_all(&self.dir)
                .with_context(|| format!("Failed to create directory {:?}", self.dir))?;
        }

        let opts = format!("size={}m", size_mb);
        mount(
            Some("tmpfs"),
            &self.dir,
            Some("tmpfs"),
            MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID,
            Some(opts.as_str()),
        )
        .map_err(|e| anyhow!(KvStoreError::Mount(format!("{}: {}", mountpoint, e))))?;

        Ok(())
    }

    fn node_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Whether a node file exists for `name`.
    pub fn has_node(&self, name: &str) -> bool {
        self.node_path(name).exists()
    }

    /// List node names, one per regular file in the store directory.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut nodes = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read store directory {:?}", self.dir))?
        {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                nodes.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        nodes.sort();
        Ok(nodes)
    }

    /// Load one node, merging records last-write-wins.
    pub fn load(&self, name: &str) -> Result<KvNode> {
        let path = self.node_path(name);
        let file =
            File::open(&path).with_context(|| format!("Failed to open kv node {:?}", path))?;
        let mut reader = BufReader::new(file);
        let mut node = KvNode::new();

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e).with_context(|| format!("Failed to read kv node {:?}", path)),
            }

            let len = LittleEndian::read_u32(&len_buf);
            if len > RECORD_SIZE_MAX {
                return Err(anyhow!(KvStoreError::Oversized(name.to_string())));
            }

            let mut payload = vec![0u8; len as usize];
            reader
                .read_exact(&mut payload)
                .map_err(|_| anyhow!(KvStoreError::Corrupt(name.to_string())))?;

            let pairs: Vec<(String, String)> = serde_json::from_slice(&payload)
                .map_err(|_| anyhow!(KvStoreError::Corrupt(name.to_string())))?;
            for (key, value) in pairs {
                node.insert(key, value);
            }
        }

        Ok(node)
    }

    /// Load every node in the store. A node that fails to load is
    /// reported in the error map so the caller can skip that container
    /// during restore instead of aborting the whole pass.
    pub fn load_all(&self) -> Result<(HashMap<String, KvNode>, Vec<String>)> {
        let mut map = HashMap::new();
        let mut failed = Vec::new();

        for name in self.list()? {
            info!("Restoring kv node {}", name);
            match self.load(&name) {
                Ok(node) => {
                    map.insert(name, node);
                }
                Err(e) => {
                    warn!("Failed to load kv node {}: {:?}", name, e);
                    failed.push(name);
                }
            }
        }

        Ok((map, failed))
    }

    fn write_record(file: &mut File, pairs: &[(String, String)]) -> Result<()> {
        let payload = serde_json::to_vec(pairs).with_context(|| "Failed to encode kv record")?;
        let mut len_buf = [0u8; 4];
        LittleEndian::write_u32(&mut len_buf, payload.len() as u32);
        file.write_all(&len_buf)?;
        file.write_all(&payload)?;
        file.flush()?;
        Ok(())
    }

    /// Append one record of pairs to a node, creating it if needed.
    pub fn append(&self, name: &str, pairs: &[(String, String)]) -> Result<()> {
        let path = self.node_path(name);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open kv node {:?}", path))?;
        Self::write_record(&mut file, pairs)
            .with_context(|| format!("Failed to append kv node {:?}", path))
    }

    /// Atomically replace a node's content with a single record,
    /// compacting the log.
    pub fn rewrite(&self, name: &str, pairs: &[(String, String)]) -> Result<()> {
        let path = self.node_path(name);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("Failed to open kv node {:?}", path))?;
        Self::write_record(&mut file, pairs)
            .with_context(|| format!("Failed to rewrite kv node {:?}", path))
    }

    /// Remove a node file. Missing files are not an error so Destroy
    /// stays idempotent.
    pub fn remove(&self, name: &str) -> Result<()> {
        let path = self.node_path(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove kv node {:?}", path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmm_sys_util::tempdir::TempDir;

    fn pairs(kv: &[(&str, &str)]) -> Vec<(String, String)> {
        kv.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_append_and_load_merges_last_write() {
        let dir = TempDir::new().unwrap();
        let store = KvStore::new(dir.as_path());

        store
            .append("2", &pairs(&[("state", "stopped"), ("user", "nobody")]))
            .unwrap();
        store.append("2", &pairs(&[("state", "running")])).unwrap();

        let node = store.load("2").unwrap();
        assert_eq!(node.get("state").unwrap(), "running");
        assert_eq!(node.get("user").unwrap(), "nobody");
    }

    #[test]
    fn test_rewrite_compacts() {
        let dir = TempDir::new().unwrap();
        let store = KvStore::new(dir.as_path());

        for i in 0..16 {
            store
                .append("3", &pairs(&[("respawn_count", &i.to_string())]))
                .unwrap();
        }
        let before = fs::metadata(dir.as_path().join("3")).unwrap().len();

        store
            .rewrite("3", &pairs(&[("respawn_count", "15")]))
            .unwrap();
        let after = fs::metadata(dir.as_path().join("3")).unwrap().len();
        assert!(after < before);
        assert_eq!(store.load("3").unwrap().get("respawn_count").unwrap(), "15");
    }

    #[test]
    fn test_corrupt_record_fails_single_node() {
        let dir = TempDir::new().unwrap();
        let store = KvStore::new(dir.as_path());

        store.append("2", &pairs(&[("state", "stopped")])).unwrap();
        // Truncated payload: claims 100 bytes, delivers none.
        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.as_path().join("3"))
            .or_else(|_| File::create(dir.as_path().join("3")))
            .unwrap();
        file.write_all(&[100, 0, 0, 0]).unwrap();

        let (map, failed) = store.load_all().unwrap();
        assert!(map.contains_key("2"));
        assert_eq!(failed, vec!["3".to_string()]);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = KvStore::new(dir.as_path());

        store.append("2", &pairs(&[("state", "stopped")])).unwrap();
        store.remove("2").unwrap();
        store.remove("2").unwrap();
        assert!(!store.has_node("2"));
        assert!(store.list().unwrap().is_empty());
    }
}

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

use std::fs::{File, OpenOptions};
use std::io::{stderr, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use log::{set_boxed_logger, set_max_level, Level, LevelFilter, Log, Metadata, Record};
use nix::unistd::{getpid, gettid};

fn wall_time() -> (i64, i64) {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a local variable and valid.
    unsafe {
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
    }
    (ts.tv_sec, ts.tv_nsec)
}

fn formatted_now() -> String {
    let (sec, nsec) = wall_time();
    // SAFETY: an all-zero value is valid for libc::tm.
    let mut ti: libc::tm = unsafe { std::mem::zeroed() };
    // SAFETY: sec and ti are both local variables and valid.
    unsafe {
        libc::localtime_r(&sec, &mut ti);
    }

    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:09}",
        ti.tm_year + 1900,
        ti.tm_mon + 1,
        ti.tm_mday,
        ti.tm_hour,
        ti.tm_min,
        ti.tm_sec,
        nsec
    )
}

struct DaemonLogger {
    handler: Mutex<Box<dyn Write + Send>>,
    level: Level,
}

impl Log for DaemonLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let fmt_msg = format!(
            "{:<5}: [{}][{}][{}: {}]:{}: {}\n",
            formatted_now(),
            getpid(),
            gettid(),
            record.file().unwrap_or(""),
            record.line().unwrap_or(0),
            record.level(),
            record.args()
        );

        let mut handler = self.handler.lock().unwrap();
        if let Err(e) = handler.write_all(fmt_msg.as_bytes()) {
            eprintln!("Failed to log message: {:?}", e);
        }
    }

    fn flush(&self) {}
}

fn open_log_file(path: &PathBuf) -> Result<File> {
    OpenOptions::new()
        .read(false)
        .append(true)
        .create(true)
        .mode(0o640)
        .open(path)
        .with_context(|| format!("Failed to open log file {:?}", path))
}

/// Initialize the global logger writing to `path`, or stderr when no path
/// is given. Level comes from `OZONED_LOG_LEVEL` unless `debug` is set.
pub fn init(path: &Option<PathBuf>, debug: bool) -> Result<()> {
    let level = if debug {
        Level::Debug
    } else {
        match std::env::var("OZONED_LOG_LEVEL") {
            Ok(l) => match l.to_lowercase().as_str() {
                "error" => Level::Error,
                "warn" => Level::Warn,
                "info" => Level::Info,
                "debug" => Level::Debug,
                "trace" => Level::Trace,
                _ => Level::Info,
            },
            _ => Level::Info,
        }
    };

    let handler: Box<dyn Write + Send> = match path {
        Some(p) => Box::new(open_log_file(p)?),
        None => Box::new(stderr()),
    };

    let logger = DaemonLogger {
        handler: Mutex::new(handler),
        level,
    };
    set_boxed_logger(Box::new(logger))
        .map(|_| set_max_level(LevelFilter::Trace))
        .with_context(|| "Logger has been already set")?;
    Ok(())
}

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

//! Container property table.
//!
//! Each property is one record: type, flags, legal states, default and
//! validator. User-visible configuration lives here; runtime read-only
//! fields are in `data.rs`.

use std::path::Path;

use crate::error::{Error, Result};
use crate::value::{
    Value, ValueCtx, ValueDef, ValueKind, ANY_STATE, DYNAMIC_STATES, HIDDEN, OS_MODE, PARENT_DEF,
    PARENT_RO, PATH, PERSISTENT, RESTRICTED_ROOT_ONLY, STATIC_STATES, SUPERUSER_ONLY, UNIT,
};

pub const P_COMMAND: &str = "command";
pub const P_USER: &str = "user";
pub const P_GROUP: &str = "group";
pub const P_ENV: &str = "env";
pub const P_ROOT: &str = "root";
pub const P_ROOT_RDONLY: &str = "root_readonly";
pub const P_CWD: &str = "cwd";
pub const P_STDIN_PATH: &str = "stdin_path";
pub const P_STDOUT_PATH: &str = "stdout_path";
pub const P_STDERR_PATH: &str = "stderr_path";
pub const P_STDOUT_LIMIT: &str = "stdout_limit";
pub const P_MEM_GUARANTEE: &str = "memory_guarantee";
pub const P_MEM_LIMIT: &str = "memory_limit";
pub const P_RECHARGE_ON_PGFAULT: &str = "recharge_on_pgfault";
pub const P_CPU_POLICY: &str = "cpu_policy";
pub const P_CPU_LIMIT: &str = "cpu_limit";
pub const P_CPU_GUARANTEE: &str = "cpu_guarantee";
pub const P_IO_POLICY: &str = "io_policy";
pub const P_IO_LIMIT: &str = "io_limit";
pub const P_NET_GUARANTEE: &str = "net_guarantee";
pub const P_NET_LIMIT: &str = "net_limit";
pub const P_NET_PRIO: &str = "net_priority";
pub const P_NET: &str = "net";
pub const P_IP: &str = "ip";
pub const P_DEFAULT_GW: &str = "default_gw";
pub const P_RESPAWN: &str = "respawn";
pub const P_MAX_RESPAWNS: &str = "max_respawns";
pub const P_ISOLATE: &str = "isolate";
pub const P_PRIVATE: &str = "private";
pub const P_ULIMIT: &str = "ulimit";
pub const P_HOSTNAME: &str = "hostname";
pub const P_BIND_DNS: &str = "bind_dns";
pub const P_BIND: &str = "bind";
pub const P_ALLOWED_DEVICES: &str = "allowed_devices";
pub const P_CAPABILITIES: &str = "capabilities";
pub const P_VIRT_MODE: &str = "virt_mode";
pub const P_AGING_TIME: &str = "aging_time";
pub const P_PORTO_NAMESPACE: &str = "porto_namespace";

pub const P_RAW_ID: &str = "raw_id";
pub const P_RAW_NAME: &str = "raw_name";
pub const P_RAW_ROOT_PID: &str = "raw_root_pid";
pub const P_RAW_LOOP_DEV: &str = "raw_loop_dev";
pub const P_RAW_START_TIME: &str = "raw_start_time";
pub const P_RAW_DEATH_TIME: &str = "raw_death_time";

pub const VIRT_MODE_APP: &str = "app";
pub const VIRT_MODE_OS: &str = "os";

/// Properties whose uint values obey parent >= sum(children).
pub const HIERARCHICAL_PROPS: [&str; 2] = [P_MEM_GUARANTEE, P_MEM_LIMIT];

/// Legacy knob-style names rewritten to canonical properties. Values
/// are translated in `alias_to_property` / `property_to_alias`.
pub const ALIASES: [(&str, &str); 4] = [
    ("cpu.smart", P_CPU_POLICY),
    ("memory.limit_in_bytes", P_MEM_LIMIT),
    ("memory.low_limit_in_bytes", P_MEM_GUARANTEE),
    ("memory.recharge_on_pgfault", P_RECHARGE_ON_PGFAULT),
];

/// Split `name[idx]` subscript syntax into name and index.
pub fn parse_property_name(orig: &str) -> (String, Option<String>) {
    if let Some(open) = orig.find('[') {
        let name = orig[..open].to_string();
        let idx = orig[open + 1..]
            .trim_end_matches(|c: char| c == ']' || c.is_whitespace())
            .to_string();
        (name, Some(idx))
    } else {
        (orig.to_string(), None)
    }
}

/// Rewrite an alias to its canonical property, translating the value.
pub fn alias_to_property(property: &str, value: &str) -> (String, String) {
    match property {
        "cpu.smart" => (
            P_CPU_POLICY.to_string(),
            if value == "0" { "normal" } else { "rt" }.to_string(),
        ),
        "memory.limit_in_bytes" => (P_MEM_LIMIT.to_string(), value.to_string()),
        "memory.low_limit_in_bytes" => (P_MEM_GUARANTEE.to_string(), value.to_string()),
        "memory.recharge_on_pgfault" => (
            P_RECHARGE_ON_PGFAULT.to_string(),
            if value == "0" { "false" } else { "true" }.to_string(),
        ),
        _ => (property.to_string(), value.to_string()),
    }
}

/// Translate a canonical value back into the alias form on get.
pub fn property_to_alias(orig_property: &str, value: &str) -> String {
    match orig_property {
        "cpu.smart" => {
            if value == "rt" {
                "1".to_string()
            } else {
                "0".to_string()
            }
        }
        "memory.recharge_on_pgfault" => {
            if value == "true" {
                "1".to_string()
            } else {
                "0".to_string()
            }
        }
        _ => value.to_string(),
    }
}

fn empty_str(_: &ValueCtx) -> Value {
    Value::Str(String::new())
}

fn empty_list(_: &ValueCtx) -> Value {
    Value::List(Vec::new())
}

fn uint_zero(_: &ValueCtx) -> Value {
    Value::Uint(0)
}

fn bool_false(_: &ValueCtx) -> Value {
    Value::Bool(false)
}

fn bool_true(_: &ValueCtx) -> Value {
    Value::Bool(true)
}

fn virt_mode_of(ctx: &ValueCtx) -> String {
    ctx.props
        .get(ctx, P_VIRT_MODE)
        .map(|v| v.as_str().to_string())
        .unwrap_or_else(|_| VIRT_MODE_APP.to_string())
}

fn default_command(ctx: &ValueCtx) -> Value {
    if virt_mode_of(ctx) == VIRT_MODE_OS {
        Value::Str("/sbin/init".to_string())
    } else {
        Value::Str(String::new())
    }
}

fn default_root(_: &ValueCtx) -> Value {
    Value::Str("/".to_string())
}

fn default_cwd(ctx: &ValueCtx) -> Value {
    if virt_mode_of(ctx) == VIRT_MODE_OS {
        return Value::Str("/".to_string());
    }
    if !ctx.props.is_default(P_ROOT) {
        return Value::Str("/".to_string());
    }
    Value::Str(format!("{}/{}", ctx.config.container.tmp_dir, ctx.name))
}

fn default_stdin(_: &ValueCtx) -> Value {
    Value::Str("/dev/null".to_string())
}

fn default_std_file(ctx: &ValueCtx, name: &str) -> Value {
    if virt_mode_of(ctx) == VIRT_MODE_OS {
        return Value::Str("/dev/null".to_string());
    }

    let root = ctx
        .props
        .get(ctx, P_ROOT)
        .map(|v| v.as_str().to_string())
        .unwrap_or_else(|_| "/".to_string());
    let cwd = ctx
        .props
        .get(ctx, P_CWD)
        .map(|v| v.as_str().to_string())
        .unwrap_or_else(|_| "/".to_string());

    let base = if root == "/" {
        cwd
    } else {
        format!("{}{}", root.trim_end_matches('/'), cwd)
    };
    Value::Str(format!("{}/{}", base.trim_end_matches('/'), name))
}

fn default_stdout(ctx: &ValueCtx) -> Value {
    default_std_file(ctx, "stdout")
}

fn default_stderr(ctx: &ValueCtx) -> Value {
    default_std_file(ctx, "stderr")
}

fn default_stdout_limit(ctx: &ValueCtx) -> Value {
    Value::Uint(ctx.config.container.stdout_limit)
}

fn default_cpu_policy(_: &ValueCtx) -> Value {
    Value::Str("normal".to_string())
}

fn default_cpu_limit(_: &ValueCtx) -> Value {
    Value::Uint(100)
}

fn default_io_policy(_: &ValueCtx) -> Value {
    Value::Str("normal".to_string())
}

fn net_map_default(ctx: &ValueCtx, per_link: u64) -> Value {
    let mut map = crate::value::UintMap::new();
    map.insert("default".to_string(), per_link);
    for link in ctx.links {
        map.insert(link.clone(), per_link);
    }
    Value::UintMap(map)
}

fn default_net_guarantee(ctx: &ValueCtx) -> Value {
    net_map_default(ctx, ctx.config.network.default_guarantee)
}

fn default_net_limit(ctx: &ValueCtx) -> Value {
    net_map_default(ctx, ctx.config.network.default_limit)
}

fn default_net_prio(ctx: &ValueCtx) -> Value {
    net_map_default(ctx, ctx.config.network.default_prio)
}

fn default_net(_: &ValueCtx) -> Value {
    Value::List(vec!["host".to_string()])
}

fn default_ip(_: &ValueCtx) -> Value {
    Value::List(Vec::new())
}

fn default_gw(_: &ValueCtx) -> Value {
    Value::Str("0.0.0.0".to_string())
}

fn default_max_respawns(_: &ValueCtx) -> Value {
    Value::Int(-1)
}

fn default_bind_dns(ctx: &ValueCtx) -> Value {
    if virt_mode_of(ctx) == VIRT_MODE_OS {
        return Value::Bool(false);
    }
    let isolate = ctx
        .props
        .get(ctx, P_ISOLATE)
        .map(|v| v.as_bool())
        .unwrap_or(true);
    if !isolate || ctx.props.is_default(P_ROOT) {
        Value::Bool(false)
    } else {
        Value::Bool(true)
    }
}

fn default_allowed_devices(ctx: &ValueCtx) -> Value {
    if virt_mode_of(ctx) == VIRT_MODE_OS {
        Value::List(
            [
                "c 1:3 rwm", "c 1:5 rwm", "c 1:7 rwm", "c 1:9 rwm", "c 1:8 rwm", "c 136:* rw",
                "c 5:2 rwm", "c 254:0 rm", "c 10:237 rmw", "b 7:* rmw",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        )
    } else {
        Value::List(vec!["a *:* rwm".to_string()])
    }
}

struct CapDesc {
    name: &'static str,
    restricted: bool,
}

const SUPPORTED_CAPS: [CapDesc; 24] = [
    CapDesc { name: "CHOWN", restricted: true },
    CapDesc { name: "DAC_OVERRIDE", restricted: true },
    CapDesc { name: "DAC_READ_SEARCH", restricted: false },
    CapDesc { name: "FOWNER", restricted: true },
    CapDesc { name: "FSETID", restricted: true },
    CapDesc { name: "KILL", restricted: true },
    CapDesc { name: "SETGID", restricted: true },
    CapDesc { name: "SETUID", restricted: true },
    CapDesc { name: "SETPCAP", restricted: false },
    CapDesc { name: "NET_BIND_SERVICE", restricted: true },
    CapDesc { name: "NET_BROADCAST", restricted: false },
    CapDesc { name: "NET_ADMIN", restricted: true },
    CapDesc { name: "NET_RAW", restricted: true },
    CapDesc { name: "IPC_LOCK", restricted: true },
    CapDesc { name: "SYS_CHROOT", restricted: true },
    CapDesc { name: "SYS_PTRACE", restricted: false },
    CapDesc { name: "SYS_ADMIN", restricted: false },
    CapDesc { name: "SYS_BOOT", restricted: false },
    CapDesc { name: "SYS_NICE", restricted: false },
    CapDesc { name: "SYS_RESOURCE", restricted: true },
    CapDesc { name: "MKNOD", restricted: false },
    CapDesc { name: "AUDIT_WRITE", restricted: false },
    CapDesc { name: "SETFCAP", restricted: false },
    CapDesc { name: "SYSLOG", restricted: false },
];

fn default_capabilities(ctx: &ValueCtx) -> Value {
    let restricted = virt_mode_of(ctx) == VIRT_MODE_OS;
    let caps = SUPPORTED_CAPS
        .iter()
        .filter(|c| ctx.owner_is_root || (restricted && c.restricted))
        .map(|c| c.name.to_string())
        .collect();
    Value::List(caps)
}

fn default_virt_mode(_: &ValueCtx) -> Value {
    Value::Str(VIRT_MODE_APP.to_string())
}

fn default_aging_time(ctx: &ValueCtx) -> Value {
    Value::Uint(ctx.config.container.aging_time_s)
}

fn default_raw_root_pid(_: &ValueCtx) -> Value {
    Value::Int(0)
}

fn default_raw_loop_dev(_: &ValueCtx) -> Value {
    Value::Int(-1)
}

// Validators.

fn valid_path(_: &ValueCtx, value: &Value) -> Result<()> {
    let s = value.as_str();
    if s.is_empty() || !s.starts_with('/') {
        return Err(Error::InvalidValue("invalid directory".to_string()));
    }
    Ok(())
}

fn valid_existing_file(_: &ValueCtx, value: &Value) -> Result<()> {
    if !Path::new(value.as_str()).exists() {
        return Err(Error::InvalidValue("file doesn't exist".to_string()));
    }
    Ok(())
}

fn valid_user(_: &ValueCtx, value: &Value) -> Result<()> {
    if value.as_str().is_empty() {
        return Err(Error::InvalidValue("user must not be empty".to_string()));
    }
    Ok(())
}

fn valid_stdout_limit(ctx: &ValueCtx, value: &Value) -> Result<()> {
    let max = ctx.config.container.stdout_limit;
    if value.as_uint() > max {
        return Err(Error::InvalidValue(format!(
            "Maximum number of bytes: {}",
            max
        )));
    }
    Ok(())
}

fn valid_cpu_policy(_: &ValueCtx, value: &Value) -> Result<()> {
    match value.as_str() {
        "normal" | "rt" => Ok(()),
        "idle" => Err(Error::NotSupported("not implemented".to_string())),
        _ => Err(Error::InvalidValue("invalid policy".to_string())),
    }
}

fn valid_percent(_: &ValueCtx, value: &Value) -> Result<()> {
    if value.as_uint() > 100 {
        return Err(Error::InvalidValue("invalid percentage".to_string()));
    }
    Ok(())
}

fn valid_io_policy(_: &ValueCtx, value: &Value) -> Result<()> {
    match value.as_str() {
        "normal" | "batch" => Ok(()),
        _ => Err(Error::InvalidValue("invalid policy".to_string())),
    }
}

fn valid_net_map(ctx: &ValueCtx, value: &Value) -> Result<()> {
    for key in value.as_uint_map().keys() {
        if key != "default" && !ctx.links.iter().any(|l| l == key) {
            return Err(Error::InvalidValue(format!("invalid interface {}", key)));
        }
    }
    Ok(())
}

fn valid_net_prio(ctx: &ValueCtx, value: &Value) -> Result<()> {
    valid_net_map(ctx, value)?;
    for prio in value.as_uint_map().values() {
        if *prio > 7 {
            return Err(Error::InvalidValue("invalid value".to_string()));
        }
    }
    Ok(())
}

fn valid_net(_: &ValueCtx, value: &Value) -> Result<()> {
    let lines = value.as_list();
    if lines.is_empty() {
        return Err(Error::InvalidValue(
            "Configuration is not specified".to_string(),
        ));
    }

    let mut host_all = false;
    let mut none = false;
    for line in lines {
        if none {
            return Err(Error::InvalidValue(
                "none can't be mixed with other types".to_string(),
            ));
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            return Err(Error::InvalidValue(format!("Invalid net in: {}", line)));
        }
        if host_all {
            return Err(Error::InvalidValue(
                "host can't be mixed with other settings".to_string(),
            ));
        }
        match tokens[0] {
            "none" => none = true,
            "host" => {
                if tokens.len() > 2 {
                    return Err(Error::InvalidValue(format!("Invalid net in: {}", line)));
                }
                if tokens.len() == 1 {
                    host_all = true;
                }
            }
            // macvlan <master> <name> / veth <name> <bridge>
            "macvlan" | "veth" => {
                if tokens.len() < 3 {
                    return Err(Error::InvalidValue(format!("Invalid net in: {}", line)));
                }
            }
            _ => {
                return Err(Error::InvalidValue(format!("Invalid net in: {}", line)));
            }
        }
    }
    Ok(())
}

fn valid_ip(_: &ValueCtx, value: &Value) -> Result<()> {
    for line in value.as_list() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() != 2 {
            return Err(Error::InvalidValue(format!(
                "Invalid address/prefix in: {}",
                line
            )));
        }
        let (addr, prefix) = match tokens[1].split_once('/') {
            Some((a, p)) => (a, p),
            None => (tokens[1], "32"),
        };
        if addr.parse::<std::net::IpAddr>().is_err() || prefix.parse::<u8>().is_err() {
            return Err(Error::InvalidValue(format!(
                "Invalid address/prefix in: {}",
                line
            )));
        }
    }
    Ok(())
}

fn valid_gw(_: &ValueCtx, value: &Value) -> Result<()> {
    value
        .as_str()
        .parse::<std::net::IpAddr>()
        .map(|_| ())
        .map_err(|_| Error::InvalidValue("invalid gateway address".to_string()))
}

fn valid_private(ctx: &ValueCtx, value: &Value) -> Result<()> {
    if value.as_str().len() as u64 > ctx.config.container.private_max {
        return Err(Error::InvalidValue("Value is too long".to_string()));
    }
    Ok(())
}

pub const ULIMIT_NAMES: [&str; 16] = [
    "as", "core", "cpu", "data", "fsize", "locks", "memlock", "msgqueue", "nice", "nofile",
    "nproc", "rss", "rtprio", "rttime", "sigpending", "stack",
];

/// Parse one `name: soft hard` ulimit line into (name, soft, hard).
pub fn parse_ulimit(line: &str) -> Result<(String, u64, u64)> {
    let (name, rest) = line
        .split_once(':')
        .ok_or_else(|| Error::InvalidValue("Invalid limits format".to_string()))?;
    let name = name.trim();
    if !ULIMIT_NAMES.contains(&name) {
        return Err(Error::InvalidValue(format!("Invalid limit {}", name)));
    }

    let bounds: Vec<&str> = rest.split_whitespace().collect();
    if bounds.len() != 2 {
        return Err(Error::InvalidValue(format!(
            "Invalid limits number for {}",
            name
        )));
    }

    let parse_bound = |raw: &str| -> Result<u64> {
        if raw == "unlim" || raw == "unlimited" {
            return Ok(u64::MAX);
        }
        raw.parse::<u64>()
            .map_err(|_| Error::InvalidValue(format!("Invalid limit value for {}", name)))
    };

    Ok((name.to_string(), parse_bound(bounds[0])?, parse_bound(bounds[1])?))
}

fn valid_ulimit(_: &ValueCtx, value: &Value) -> Result<()> {
    for line in value.as_list() {
        parse_ulimit(line)?;
    }
    Ok(())
}

/// Parse one `source dest [ro|rw]` bind line.
pub fn parse_bind(line: &str) -> Result<(String, String, bool)> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() != 2 && tokens.len() != 3 {
        return Err(Error::InvalidValue(format!("Invalid bind in: {}", line)));
    }
    let read_only = match tokens.get(2) {
        None | Some(&"rw") => false,
        Some(&"ro") => true,
        Some(other) => {
            return Err(Error::InvalidValue(format!(
                "Invalid bind type in: {}",
                other
            )))
        }
    };
    Ok((tokens[0].to_string(), tokens[1].to_string(), read_only))
}

fn valid_bind(_: &ValueCtx, value: &Value) -> Result<()> {
    for line in value.as_list() {
        let (source, _, _) = parse_bind(line)?;
        if !Path::new(&source).exists() {
            return Err(Error::InvalidValue(format!(
                "Source bind {} doesn't exist",
                source
            )));
        }
    }
    Ok(())
}

fn valid_capabilities(_: &ValueCtx, value: &Value) -> Result<()> {
    for cap in value.as_list() {
        if !SUPPORTED_CAPS.iter().any(|c| c.name == cap) {
            return Err(Error::InvalidValue(format!(
                "Unsupported capability {}",
                cap
            )));
        }
    }
    Ok(())
}

fn valid_virt_mode(_: &ValueCtx, value: &Value) -> Result<()> {
    match value.as_str() {
        VIRT_MODE_APP | VIRT_MODE_OS => Ok(()),
        other => Err(Error::InvalidValue(format!(
            "Unsupported virt_mode: {}",
            other
        ))),
    }
}

pub static PROPERTY_DEFS: &[ValueDef] = &[
    ValueDef {
        name: P_COMMAND,
        desc: "Command executed upon container start",
        kind: ValueKind::Str,
        flags: PERSISTENT | OS_MODE,
        states: STATIC_STATES,
        default: default_command,
        validate: None,
    },
    ValueDef {
        name: P_USER,
        desc: "Start command with given user",
        kind: ValueKind::Str,
        flags: SUPERUSER_ONLY | PARENT_DEF | PERSISTENT,
        states: STATIC_STATES,
        default: empty_str,
        validate: Some(valid_user),
    },
    ValueDef {
        name: P_GROUP,
        desc: "Start command with given group",
        kind: ValueKind::Str,
        flags: SUPERUSER_ONLY | PARENT_DEF | PERSISTENT,
        states: STATIC_STATES,
        default: empty_str,
        validate: Some(valid_user),
    },
    ValueDef {
        name: P_ENV,
        desc: "Container environment variables",
        kind: ValueKind::List,
        flags: PARENT_DEF | PERSISTENT,
        states: STATIC_STATES,
        default: empty_list,
        validate: None,
    },
    ValueDef {
        name: P_ROOT,
        desc: "Container root directory",
        kind: ValueKind::Str,
        flags: PARENT_RO | PERSISTENT | PATH,
        states: STATIC_STATES,
        default: default_root,
        validate: Some(valid_path),
    },
    ValueDef {
        name: P_ROOT_RDONLY,
        desc: "Mount root directory in read-only mode",
        kind: ValueKind::Bool,
        flags: PARENT_RO | PERSISTENT,
        states: STATIC_STATES,
        default: bool_false,
        validate: None,
    },
    ValueDef {
        name: P_CWD,
        desc: "Container working directory",
        kind: ValueKind::Str,
        flags: PARENT_DEF | PERSISTENT | OS_MODE | PATH,
        states: STATIC_STATES,
        default: default_cwd,
        validate: Some(valid_path),
    },
    ValueDef {
        name: P_STDIN_PATH,
        desc: "Container standard input path",
        kind: ValueKind::Str,
        flags: PERSISTENT | OS_MODE | PATH,
        states: STATIC_STATES,
        default: default_stdin,
        validate: Some(valid_existing_file),
    },
    ValueDef {
        name: P_STDOUT_PATH,
        desc: "Container standard output path",
        kind: ValueKind::Str,
        flags: PERSISTENT | OS_MODE | PATH,
        states: STATIC_STATES,
        default: default_stdout,
        validate: Some(valid_path),
    },
    ValueDef {
        name: P_STDERR_PATH,
        desc: "Container standard error path",
        kind: ValueKind::Str,
        flags: PERSISTENT | OS_MODE | PATH,
        states: STATIC_STATES,
        default: default_stderr,
        validate: Some(valid_path),
    },
    ValueDef {
        name: P_STDOUT_LIMIT,
        desc: "Return no more than given number of bytes from stdout/stderr",
        kind: ValueKind::Uint,
        flags: PERSISTENT,
        states: STATIC_STATES,
        default: default_stdout_limit,
        validate: Some(valid_stdout_limit),
    },
    ValueDef {
        name: P_MEM_GUARANTEE,
        desc: "Guaranteed amount of memory",
        kind: ValueKind::Uint,
        flags: PARENT_RO | PERSISTENT | UNIT,
        states: DYNAMIC_STATES,
        default: uint_zero,
        validate: None,
    },
    ValueDef {
        name: P_MEM_LIMIT,
        desc: "Memory hard limit",
        kind: ValueKind::Uint,
        flags: PERSISTENT | UNIT,
        states: DYNAMIC_STATES,
        default: uint_zero,
        validate: None,
    },
    ValueDef {
        name: P_RECHARGE_ON_PGFAULT,
        desc: "Recharge memory on page fault",
        kind: ValueKind::Bool,
        flags: PARENT_RO | PERSISTENT,
        states: DYNAMIC_STATES,
        default: bool_false,
        validate: None,
    },
    ValueDef {
        name: P_CPU_POLICY,
        desc: "CPU policy: rt, normal, idle",
        kind: ValueKind::Str,
        flags: PARENT_RO | PERSISTENT,
        states: DYNAMIC_STATES,
        default: default_cpu_policy,
        validate: Some(valid_cpu_policy),
    },
    ValueDef {
        name: P_CPU_LIMIT,
        desc: "CPU limit in percent",
        kind: ValueKind::Uint,
        flags: PARENT_RO | PERSISTENT,
        states: DYNAMIC_STATES,
        default: default_cpu_limit,
        validate: Some(valid_percent),
    },
    ValueDef {
        name: P_CPU_GUARANTEE,
        desc: "CPU guarantee in percent",
        kind: ValueKind::Uint,
        flags: PARENT_RO | PERSISTENT,
        states: DYNAMIC_STATES,
        default: uint_zero,
        validate: Some(valid_percent),
    },
    ValueDef {
        name: P_IO_POLICY,
        desc: "IO policy: normal or batch",
        kind: ValueKind::Str,
        flags: PERSISTENT,
        states: DYNAMIC_STATES,
        default: default_io_policy,
        validate: Some(valid_io_policy),
    },
    ValueDef {
        name: P_IO_LIMIT,
        desc: "Filesystem bandwidth limit [bytes/s]",
        kind: ValueKind::Uint,
        flags: PERSISTENT | UNIT,
        states: DYNAMIC_STATES,
        default: uint_zero,
        validate: None,
    },
    ValueDef {
        name: P_NET_GUARANTEE,
        desc: "Guaranteed network bandwidth [bytes/s] per interface",
        kind: ValueKind::UintMap,
        flags: PARENT_RO | PERSISTENT,
        states: STATIC_STATES,
        default: default_net_guarantee,
        validate: Some(valid_net_map),
    },
    ValueDef {
        name: P_NET_LIMIT,
        desc: "Maximum network bandwidth [bytes/s] per interface",
        kind: ValueKind::UintMap,
        flags: PARENT_RO | PERSISTENT,
        states: STATIC_STATES,
        default: default_net_limit,
        validate: Some(valid_net_map),
    },
    ValueDef {
        name: P_NET_PRIO,
        desc: "Network priority: 0-7 per interface",
        kind: ValueKind::UintMap,
        flags: PARENT_RO | PERSISTENT,
        states: STATIC_STATES,
        default: default_net_prio,
        validate: Some(valid_net_prio),
    },
    ValueDef {
        name: P_NET,
        desc: "Container network settings",
        kind: ValueKind::List,
        flags: PARENT_RO | PERSISTENT,
        states: STATIC_STATES,
        default: default_net,
        validate: Some(valid_net),
    },
    ValueDef {
        name: P_IP,
        desc: "IP configuration",
        kind: ValueKind::List,
        flags: PARENT_RO | PERSISTENT | HIDDEN,
        states: STATIC_STATES,
        default: default_ip,
        validate: Some(valid_ip),
    },
    ValueDef {
        name: P_DEFAULT_GW,
        desc: "Default gateway",
        kind: ValueKind::Str,
        flags: PARENT_RO | PERSISTENT | HIDDEN,
        states: STATIC_STATES,
        default: default_gw,
        validate: Some(valid_gw),
    },
    ValueDef {
        name: P_RESPAWN,
        desc: "Automatically respawn dead container",
        kind: ValueKind::Bool,
        flags: PERSISTENT,
        states: STATIC_STATES,
        default: bool_false,
        validate: None,
    },
    ValueDef {
        name: P_MAX_RESPAWNS,
        desc: "Limit respawn count for specific container",
        kind: ValueKind::Int,
        flags: PERSISTENT,
        states: STATIC_STATES,
        default: default_max_respawns,
        validate: None,
    },
    ValueDef {
        name: P_ISOLATE,
        desc: "Isolate container from parent",
        kind: ValueKind::Bool,
        flags: PERSISTENT | OS_MODE,
        states: STATIC_STATES,
        default: bool_true,
        validate: None,
    },
    ValueDef {
        name: P_PRIVATE,
        desc: "User-defined property",
        kind: ValueKind::Str,
        flags: PERSISTENT,
        states: DYNAMIC_STATES,
        default: empty_str,
        validate: Some(valid_private),
    },
    ValueDef {
        name: P_ULIMIT,
        desc: "Container resource limits",
        kind: ValueKind::List,
        flags: PARENT_DEF | PERSISTENT,
        states: STATIC_STATES,
        default: empty_list,
        validate: Some(valid_ulimit),
    },
    ValueDef {
        name: P_HOSTNAME,
        desc: "Container hostname",
        kind: ValueKind::Str,
        flags: PARENT_RO | PERSISTENT,
        states: STATIC_STATES,
        default: empty_str,
        validate: None,
    },
    ValueDef {
        name: P_BIND_DNS,
        desc: "Bind /etc/resolv.conf and /etc/hosts of host to container",
        kind: ValueKind::Bool,
        flags: PARENT_RO | PERSISTENT | OS_MODE,
        states: STATIC_STATES,
        default: default_bind_dns,
        validate: None,
    },
    ValueDef {
        name: P_BIND,
        desc: "Share host directories with container",
        kind: ValueKind::List,
        flags: PARENT_RO | PERSISTENT | OS_MODE,
        states: STATIC_STATES,
        default: empty_list,
        validate: Some(valid_bind),
    },
    ValueDef {
        name: P_ALLOWED_DEVICES,
        desc: "Devices that container can create/read/write",
        kind: ValueKind::List,
        flags: PARENT_RO | PERSISTENT | OS_MODE,
        states: STATIC_STATES,
        default: default_allowed_devices,
        validate: None,
    },
    ValueDef {
        name: P_CAPABILITIES,
        desc: "Limit container capabilities",
        kind: ValueKind::List,
        flags: PERSISTENT | OS_MODE | SUPERUSER_ONLY,
        states: STATIC_STATES,
        default: default_capabilities,
        validate: Some(valid_capabilities),
    },
    ValueDef {
        name: P_VIRT_MODE,
        desc: "Virtualization mode: os or app",
        kind: ValueKind::Str,
        flags: PERSISTENT | RESTRICTED_ROOT_ONLY,
        states: STATIC_STATES,
        default: default_virt_mode,
        validate: Some(valid_virt_mode),
    },
    ValueDef {
        name: P_AGING_TIME,
        desc: "After given number of seconds dead containers are removed",
        kind: ValueKind::Uint,
        flags: PERSISTENT,
        states: DYNAMIC_STATES,
        default: default_aging_time,
        validate: None,
    },
    ValueDef {
        name: P_PORTO_NAMESPACE,
        desc: "Container name prefix for nested clients",
        kind: ValueKind::Str,
        flags: PERSISTENT,
        states: STATIC_STATES,
        default: empty_str,
        validate: None,
    },
    // Hidden bookkeeping values.
    ValueDef {
        name: P_RAW_ID,
        desc: "",
        kind: ValueKind::Uint,
        flags: HIDDEN | PERSISTENT,
        states: ANY_STATE,
        default: uint_zero,
        validate: None,
    },
    ValueDef {
        name: P_RAW_NAME,
        desc: "",
        kind: ValueKind::Str,
        flags: HIDDEN | PERSISTENT,
        states: ANY_STATE,
        default: empty_str,
        validate: None,
    },
    ValueDef {
        name: P_RAW_ROOT_PID,
        desc: "",
        kind: ValueKind::Int,
        flags: HIDDEN | PERSISTENT,
        states: ANY_STATE,
        default: default_raw_root_pid,
        validate: None,
    },
    ValueDef {
        name: P_RAW_LOOP_DEV,
        desc: "",
        kind: ValueKind::Int,
        flags: HIDDEN | PERSISTENT,
        states: ANY_STATE,
        default: default_raw_loop_dev,
        validate: None,
    },
    ValueDef {
        name: P_RAW_START_TIME,
        desc: "",
        kind: ValueKind::Uint,
        flags: HIDDEN | PERSISTENT,
        states: ANY_STATE,
        default: uint_zero,
        validate: None,
    },
    ValueDef {
        name: P_RAW_DEATH_TIME,
        desc: "",
        kind: ValueKind::Uint,
        flags: HIDDEN | PERSISTENT,
        states: ANY_STATE,
        default: uint_zero,
        validate: None,
    },
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::value::ValueMap;

    fn ctx_fixture<'a>(
        props: &'a ValueMap,
        config: &'a DaemonConfig,
        links: &'a [String],
    ) -> ValueCtx<'a> {
        ValueCtx {
            name: "a",
            id: 2,
            config,
            links,
            props,
            owner_is_root: false,
        }
    }

    #[test]
    fn test_alias_round_trip() {
        let (prop, value) = alias_to_property("cpu.smart", "1");
        assert_eq!(prop, P_CPU_POLICY);
        assert_eq!(value, "rt");
        assert_eq!(property_to_alias("cpu.smart", "rt"), "1");

        let (prop, value) = alias_to_property("memory.recharge_on_pgfault", "0");
        assert_eq!(prop, P_RECHARGE_ON_PGFAULT);
        assert_eq!(value, "false");
    }

    #[test]
    fn test_subscript_parse() {
        let (name, idx) = parse_property_name("net_guarantee[eth0]");
        assert_eq!(name, "net_guarantee");
        assert_eq!(idx.as_deref(), Some("eth0"));

        let (name, idx) = parse_property_name("memory_limit");
        assert_eq!(name, "memory_limit");
        assert!(idx.is_none());
    }

    #[test]
    fn test_command_default_follows_virt_mode() {
        let config = DaemonConfig::default();
        let links: Vec<String> = Vec::new();
        let mut props = ValueMap::new(PROPERTY_DEFS);

        {
            let ctx = ctx_fixture(&props, &config, &links);
            assert_eq!(props.get(&ctx, P_COMMAND).unwrap().as_str(), "");
        }

        props
            .store(P_VIRT_MODE, Value::Str(VIRT_MODE_OS.to_string()))
            .unwrap();
        let ctx = ctx_fixture(&props, &config, &links);
        assert_eq!(props.get(&ctx, P_COMMAND).unwrap().as_str(), "/sbin/init");
        assert_eq!(props.get(&ctx, P_CWD).unwrap().as_str(), "/");
    }

    #[test]
    fn test_net_prio_validation() {
        let config = DaemonConfig::default();
        let links = vec!["eth0".to_string()];
        let props = ValueMap::new(PROPERTY_DEFS);
        let ctx = ctx_fixture(&props, &config, &links);

        let good = Value::parse(ValueKind::UintMap, "eth0: 3", false).unwrap();
        assert!(props.validate(&ctx, P_NET_PRIO, &good).is_ok());

        let bad_prio = Value::parse(ValueKind::UintMap, "eth0: 9", false).unwrap();
        assert!(props.validate(&ctx, P_NET_PRIO, &bad_prio).is_err());

        let bad_link = Value::parse(ValueKind::UintMap, "wlan7: 3", false).unwrap();
        assert!(props.validate(&ctx, P_NET_PRIO, &bad_link).is_err());
    }

    #[test]
    fn test_ulimit_parse() {
        assert_eq!(
            parse_ulimit("nofile: 1024 4096").unwrap(),
            ("nofile".to_string(), 1024, 4096)
        );
        assert_eq!(parse_ulimit("core: unlim unlimited").unwrap().1, u64::MAX);
        assert!(parse_ulimit("bogus: 1 2").is_err());
        assert!(parse_ulimit("nofile: 1").is_err());
    }

    #[test]
    fn test_bind_parse() {
        assert_eq!(
            parse_bind("/src /dst ro").unwrap(),
            ("/src".to_string(), "/dst".to_string(), true)
        );
        assert!(!parse_bind("/src /dst").unwrap().2);
        assert!(parse_bind("/src").is_err());
        assert!(parse_bind("/src /dst rx").is_err());
    }

    #[test]
    fn test_capabilities_default_for_plain_user() {
        let config = DaemonConfig::default();
        let links: Vec<String> = Vec::new();
        let props = ValueMap::new(PROPERTY_DEFS);
        let ctx = ctx_fixture(&props, &config, &links);

        // Plain app-mode owner gets no ambient capabilities.
        let caps = props.get(&ctx, P_CAPABILITIES).unwrap();
        assert!(caps.as_list().is_empty());

        let bogus = Value::List(vec!["FLY".to_string()]);
        assert!(props.validate(&ctx, P_CAPABILITIES, &bogus).is_err());
    }
}

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

//! Runtime read-only data fields. Reads are gated by container state;
//! several fields are views over hidden raw properties.

use crate::property::{P_RAW_DEATH_TIME, P_RAW_ROOT_PID, P_RAW_START_TIME};
use crate::value::{
    Value, ValueCtx, ValueDef, ValueKind, ANY_STATE, PERSISTENT, RUN_STATES, S_DEAD, S_META,
    S_PAUSED, S_RUNNING, S_STOPPED,
};

pub const D_STATE: &str = "state";
pub const D_EXIT_STATUS: &str = "exit_status";
pub const D_START_ERRNO: &str = "start_errno";
pub const D_OOM_KILLED: &str = "oom_killed";
pub const D_RESPAWN_COUNT: &str = "respawn_count";
pub const D_ROOT_PID: &str = "root_pid";
pub const D_START_TIME: &str = "start_time";
pub const D_DEATH_TIME: &str = "death_time";

fn default_state(_: &ValueCtx) -> Value {
    Value::Str(String::new())
}

fn default_minus_one(_: &ValueCtx) -> Value {
    Value::Int(-1)
}

fn default_false(_: &ValueCtx) -> Value {
    Value::Bool(false)
}

fn default_zero(_: &ValueCtx) -> Value {
    Value::Uint(0)
}

fn default_root_pid(ctx: &ValueCtx) -> Value {
    match ctx.props.get(ctx, P_RAW_ROOT_PID) {
        Ok(v) => Value::Int(v.as_int()),
        Err(_) => Value::Int(0),
    }
}

fn default_start_time(ctx: &ValueCtx) -> Value {
    match ctx.props.get(ctx, P_RAW_START_TIME) {
        Ok(v) => Value::Uint(v.as_uint()),
        Err(_) => Value::Uint(0),
    }
}

fn default_death_time(ctx: &ValueCtx) -> Value {
    match ctx.props.get(ctx, P_RAW_DEATH_TIME) {
        Ok(v) => Value::Uint(v.as_uint()),
        Err(_) => Value::Uint(0),
    }
}

pub static DATA_DEFS: &[ValueDef] = &[
    ValueDef {
        name: D_STATE,
        desc: "Container state",
        kind: ValueKind::Str,
        flags: PERSISTENT,
        states: ANY_STATE,
        default: default_state,
        validate: None,
    },
    ValueDef {
        name: D_EXIT_STATUS,
        desc: "Task exit status",
        kind: ValueKind::Int,
        flags: PERSISTENT,
        states: S_DEAD,
        default: default_minus_one,
        validate: None,
    },
    ValueDef {
        name: D_START_ERRNO,
        desc: "Errno of the last failed start",
        kind: ValueKind::Int,
        flags: PERSISTENT,
        states: S_STOPPED,
        default: default_minus_one,
        validate: None,
    },
    ValueDef {
        name: D_OOM_KILLED,
        desc: "Whether the container was killed by the OOM killer",
        kind: ValueKind::Bool,
        flags: PERSISTENT,
        states: S_DEAD,
        default: default_false,
        validate: None,
    },
    ValueDef {
        name: D_RESPAWN_COUNT,
        desc: "How many times the container was respawned",
        kind: ValueKind::Uint,
        flags: PERSISTENT,
        states: ANY_STATE,
        default: default_zero,
        validate: None,
    },
    ValueDef {
        name: D_ROOT_PID,
        desc: "Pid of the root task",
        kind: ValueKind::Int,
        flags: 0,
        states: S_RUNNING | S_META | S_PAUSED,
        default: default_root_pid,
        validate: None,
    },
    ValueDef {
        name: D_START_TIME,
        desc: "Time of the last start, ms since the epoch",
        kind: ValueKind::Uint,
        flags: 0,
        states: RUN_STATES,
        default: default_start_time,
        validate: None,
    },
    ValueDef {
        name: D_DEATH_TIME,
        desc: "Time of the last exit, ms since the epoch",
        kind: ValueKind::Uint,
        flags: 0,
        states: S_DEAD,
        default: default_death_time,
        validate: None,
    },
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DaemonConfig;
    use crate::property::PROPERTY_DEFS;
    use crate::value::ValueMap;

    #[test]
    fn test_no_name_conflicts_with_properties() {
        for data in DATA_DEFS {
            assert!(
                !PROPERTY_DEFS.iter().any(|p| p.name == data.name),
                "data and property names conflict: {}",
                data.name
            );
        }
    }

    #[test]
    fn test_root_pid_reads_raw_property() {
        let config = DaemonConfig::default();
        let links: Vec<String> = Vec::new();
        let mut props = ValueMap::new(PROPERTY_DEFS);
        props.store(P_RAW_ROOT_PID, Value::Int(4242)).unwrap();

        let data = ValueMap::new(DATA_DEFS);
        let ctx = ValueCtx {
            name: "a",
            id: 2,
            config: &config,
            links: &links,
            props: &props,
            owner_is_root: false,
        };
        assert_eq!(data.get(&ctx, D_ROOT_PID).unwrap().as_int(), 4242);
    }

    #[test]
    fn test_exit_status_gated_to_dead() {
        let def = DATA_DEFS.iter().find(|d| d.name == D_EXIT_STATUS).unwrap();
        assert!(def.has_state(S_DEAD));
        assert!(!def.has_state(S_RUNNING));
    }
}

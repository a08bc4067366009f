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

//! Typed, validated named-value maps.
//!
//! Properties and data fields are both described by a flat table of
//! `ValueDef` records: name, type, flag set, legal states, a default
//! function and an optional validator. The map itself only stores
//! explicitly set values; reads fall back to the computed default.

use std::collections::{BTreeMap, HashMap};

use crate::config::DaemonConfig;
use crate::error::{Error, Result};

// Value flags.
pub const PERSISTENT: u32 = 1 << 0;
pub const HIDDEN: u32 = 1 << 1;
pub const SUPERUSER_ONLY: u32 = 1 << 2;
pub const RESTRICTED_ROOT_ONLY: u32 = 1 << 3;
pub const PARENT_RO: u32 = 1 << 4;
pub const PARENT_DEF: u32 = 1 << 5;
pub const OS_MODE: u32 = 1 << 6;
pub const PATH: u32 = 1 << 7;
/// Uint values carrying a K/M/G/T suffix on input.
pub const UNIT: u32 = 1 << 8;

// State bits for read/write gating.
pub const S_STOPPED: u32 = 1 << 0;
pub const S_RUNNING: u32 = 1 << 1;
pub const S_PAUSED: u32 = 1 << 2;
pub const S_META: u32 = 1 << 3;
pub const S_DEAD: u32 = 1 << 4;

pub const STATIC_STATES: u32 = S_STOPPED;
pub const DYNAMIC_STATES: u32 = S_STOPPED | S_RUNNING | S_PAUSED | S_META;
pub const ANY_STATE: u32 = S_STOPPED | S_RUNNING | S_PAUSED | S_META | S_DEAD;
pub const RUN_STATES: u32 = S_RUNNING | S_PAUSED | S_META | S_DEAD;

pub type UintMap = BTreeMap<String, u64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Str,
    Bool,
    Int,
    Uint,
    List,
    UintMap,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Bool(bool),
    Int(i64),
    Uint(u64),
    List(Vec<String>),
    UintMap(UintMap),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Str(_) => ValueKind::Str,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Uint(_) => ValueKind::Uint,
            Value::List(_) => ValueKind::List,
            Value::UintMap(_) => ValueKind::UintMap,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Value::Str(s) => s,
            _ => "",
        }
    }

    pub fn as_bool(&self) -> bool {
        matches!(self, Value::Bool(true))
    }

    pub fn as_int(&self) -> i64 {
        match self {
            Value::Int(v) => *v,
            _ => 0,
        }
    }

    pub fn as_uint(&self) -> u64 {
        match self {
            Value::Uint(v) => *v,
            _ => 0,
        }
    }

    pub fn as_list(&self) -> &[String] {
        match self {
            Value::List(v) => v,
            _ => &[],
        }
    }

    pub fn as_uint_map(&self) -> UintMap {
        match self {
            Value::UintMap(m) => m.clone(),
            _ => UintMap::new(),
        }
    }

    /// Canonical text form, also used for persistence.
    pub fn format(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            Value::Bool(b) => if *b { "true" } else { "false" }.to_string(),
            Value::Int(v) => v.to_string(),
            Value::Uint(v) => v.to_string(),
            Value::List(v) => v.join("; "),
            Value::UintMap(m) => m
                .iter()
                .map(|(k, v)| format!("{}: {}", k, v))
                .collect::<Vec<_>>()
                .join("; "),
        }
    }

    /// Parse the text form of a value of the given kind. `unit` allows
    /// K/M/G/T suffixes on uints.
    pub fn parse(kind: ValueKind, raw: &str, unit: bool) -> Result<Value> {
        let raw = raw.trim();
        match kind {
            ValueKind::Str => Ok(Value::Str(raw.to_string())),
            ValueKind::Bool => match raw {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(Error::InvalidValue(format!("invalid boolean: {}", raw))),
            },
            ValueKind::Int => raw
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|_| Error::InvalidValue(format!("invalid integer: {}", raw))),
            ValueKind::Uint => parse_uint(raw, unit),
            ValueKind::List => {
                let items: Vec<String> = raw
                    .split(';')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
                Ok(Value::List(items))
            }
            ValueKind::UintMap => {
                let mut map = UintMap::new();
                for item in raw.split(';') {
                    let item = item.trim();
                    if item.is_empty() {
                        continue;
                    }
                    let (key, val) = item
                        .split_once(':')
                        .ok_or_else(|| Error::InvalidValue(format!("invalid map entry: {}", item)))?;
                    map.insert(key.trim().to_string(), parse_uint(val.trim(), unit)?.as_uint());
                }
                Ok(Value::UintMap(map))
            }
        }
    }
}

fn parse_uint(raw: &str, unit: bool) -> Result<Value> {
    if raw.is_empty() {
        return Err(Error::InvalidValue("empty integer".to_string()));
    }

    let (digits, multiplier) = if unit {
        match raw.as_bytes()[raw.len() - 1].to_ascii_uppercase() {
            b'K' => (&raw[..raw.len() - 1], 1u64 << 10),
            b'M' => (&raw[..raw.len() - 1], 1u64 << 20),
            b'G' => (&raw[..raw.len() - 1], 1u64 << 30),
            b'T' => (&raw[..raw.len() - 1], 1u64 << 40),
            _ => (raw, 1),
        }
    } else {
        (raw, 1)
    };

    let base = digits
        .trim()
        .parse::<u64>()
        .map_err(|_| Error::InvalidValue(format!("invalid unsigned integer: {}", raw)))?;
    base.checked_mul(multiplier)
        .map(Value::Uint)
        .ok_or_else(|| Error::InvalidValue(format!("value overflows: {}", raw)))
}

/// Context handed to default and validate functions. Carries everything
/// a single container knows about itself; cross-container checks (the
/// hierarchical limits) live in the state machine.
pub struct ValueCtx<'a> {
    pub name: &'a str,
    pub id: u32,
    pub config: &'a DaemonConfig,
    pub links: &'a [String],
    pub props: &'a ValueMap,
    pub owner_is_root: bool,
}

pub type DefaultFn = fn(&ValueCtx) -> Value;
pub type ValidateFn = fn(&ValueCtx, &Value) -> Result<()>;

pub struct ValueDef {
    pub name: &'static str,
    pub desc: &'static str,
    pub kind: ValueKind,
    pub flags: u32,
    pub states: u32,
    pub default: DefaultFn,
    pub validate: Option<ValidateFn>,
}

impl ValueDef {
    pub fn has_flags(&self, flags: u32) -> bool {
        self.flags & flags != 0
    }

    pub fn has_state(&self, state_bit: u32) -> bool {
        self.states & state_bit != 0
    }
}

/// A typed map over a definition table. Only explicitly set values are
/// stored; `get` falls back to the per-container default.
pub struct ValueMap {
    defs: &'static [ValueDef],
    values: HashMap<&'static str, Value>,
}

impl ValueMap {
    pub fn new(defs: &'static [ValueDef]) -> Self {
        ValueMap {
            defs,
            values: HashMap::new(),
        }
    }

    pub fn defs(&self) -> &'static [ValueDef] {
        self.defs
    }

    pub fn find(&self, name: &str) -> Option<&'static ValueDef> {
        self.defs.iter().find(|d| d.name == name)
    }

    pub fn check(&self, name: &str) -> Result<&'static ValueDef> {
        self.find(name)
            .ok_or_else(|| Error::InvalidProperty(format!("invalid property {}", name)))
    }

    pub fn is_default(&self, name: &str) -> bool {
        !self.values.contains_key(name)
    }

    pub fn has_value(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn get(&self, ctx: &ValueCtx, name: &str) -> Result<Value> {
        let def = self.check(name)?;
        match self.values.get(name) {
            Some(v) => Ok(v.clone()),
            None => Ok((def.default)(ctx)),
        }
    }

    /// Run the validator for a prospective value.
    pub fn validate(&self, ctx: &ValueCtx, name: &str, value: &Value) -> Result<()> {
        let def = self.check(name)?;
        if value.kind() != def.kind {
            return Err(Error::InvalidValue(format!(
                "wrong type for {}",
                def.name
            )));
        }
        if let Some(validate) = def.validate {
            validate(ctx, value)?;
        }
        Ok(())
    }

    /// Store a value without validation. Callers validate first; restore
    /// trusts what was persisted.
    pub fn store(&mut self, name: &str, value: Value) -> Result<()> {
        let def = self.check(name)?;
        self.values.insert(def.name, value);
        Ok(())
    }

    pub fn reset(&mut self, name: &str) {
        self.values.remove(name);
    }

    pub fn parse_for(&self, name: &str, raw: &str) -> Result<Value> {
        let def = self.check(name)?;
        Value::parse(def.kind, raw, def.has_flags(UNIT))
    }

    /// Pairs for a full rewrite of the persistent node.
    pub fn persistent_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        for def in self.defs {
            if !def.has_flags(PERSISTENT) {
                continue;
            }
            if let Some(v) = self.values.get(def.name) {
                pairs.push((def.name.to_string(), v.format()));
            }
        }
        pairs
    }

    /// Fill the map back in from a restored node. Unknown keys are
    /// ignored so new daemons still read nodes from older ones.
    pub fn restore(&mut self, node: &BTreeMap<String, String>) -> Result<()> {
        for def in self.defs {
            if !def.has_flags(PERSISTENT) {
                continue;
            }
            if let Some(raw) = node.get(def.name) {
                let value = Value::parse(def.kind, raw, def.has_flags(UNIT))?;
                self.values.insert(def.name, value);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_uint_units() {
        assert_eq!(parse_uint("4M", true).unwrap().as_uint(), 4 << 20);
        assert_eq!(parse_uint("2k", true).unwrap().as_uint(), 2048);
        assert_eq!(parse_uint("100", true).unwrap().as_uint(), 100);
        assert!(parse_uint("4M", false).is_err());
        assert!(parse_uint("", true).is_err());
    }

    #[test]
    fn test_list_round_trip() {
        let v = Value::parse(ValueKind::List, "a; b ;c", false).unwrap();
        assert_eq!(v.as_list(), &["a", "b", "c"]);
        assert_eq!(v.format(), "a; b; c");
    }

    #[test]
    fn test_uint_map_round_trip() {
        let v = Value::parse(ValueKind::UintMap, "eth0: 100; default: 5", false).unwrap();
        let m = v.as_uint_map();
        assert_eq!(m.get("eth0"), Some(&100));
        assert_eq!(m.get("default"), Some(&5));
        assert_eq!(v.format(), "default: 5; eth0: 100");
    }

    #[test]
    fn test_bool_rejects_garbage() {
        assert!(Value::parse(ValueKind::Bool, "yes", false).is_err());
        assert!(Value::parse(ValueKind::Bool, "true", false).unwrap().as_bool());
    }
}

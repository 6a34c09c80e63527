//! Host facts gathered for registration, grounded on
//! `original_source/lib/utils.py::get_mem_size/get_cpu_info/get_os_type`.
//!
//! Memory comes from `sysinfo` (the corpus's idiomatic source for
//! this); per-core CPU info and OS identification are read directly from
//! `/proc/cpuinfo` and `/etc/os-release`, kept faithful to the original's
//! exact field semantics since the controller may depend on their shape.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use sysinfo::{RefreshKind, System, SystemExt};

/// Total installed memory, in bytes.
pub fn get_mem_size() -> u64 {
    let sys = System::new_with_specifics(RefreshKind::new().with_memory());
    sys.total_memory() * 1024
}

/// `/proc/cpuinfo`, keyed by the `processor` field, each holding the
/// remaining `key: value` lines for that logical core — the same shape as
/// the original's `cpu_dict[processor] = {key: val, ...}`.
pub fn get_cpu_info() -> Result<BTreeMap<String, BTreeMap<String, String>>> {
    let contents = std::fs::read_to_string("/proc/cpuinfo").context("read /proc/cpuinfo")?;
    let mut cpu_dict = BTreeMap::new();
    let mut current: Option<String> = None;
    let mut core_dict = BTreeMap::new();
    for line in contents.lines() {
        let line = line.trim();
        let Some((key, val)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_string();
        let val = val.trim().to_string();
        if key == "processor" {
            if let Some(prev) = current.take() {
                cpu_dict.insert(prev, std::mem::take(&mut core_dict));
            }
            current = Some(val.clone());
            continue;
        }
        core_dict.insert(key, val);
    }
    if let Some(prev) = current {
        cpu_dict.insert(prev, core_dict);
    }
    Ok(cpu_dict)
}

/// `"<ID> <VERSION_ID>"` from `/etc/os-release`, or `"unknow_os"` — the
/// original's literal sentinel, kept because the controller may match on it.
pub fn get_os_type() -> String {
    let Ok(contents) = std::fs::read_to_string("/etc/os-release") else {
        return "unknow_os".to_string();
    };
    let mut fields = BTreeMap::new();
    for line in contents.lines() {
        let line = line.trim();
        let Some((key, val)) = line.split_once('=') else {
            continue;
        };
        let val = val.trim();
        let val = val
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(val);
        fields.insert(key.to_string(), val.to_string());
    }
    match (fields.get("ID"), fields.get("VERSION_ID")) {
        (Some(id), Some(version)) => format!("{id} {version}"),
        _ => "unknow_os".to_string(),
    }
}

//! Process-wide config store (C1).
//!
//! Grounded on `original_source/lib/config.py`: an INI-like `key = value`
//! file (`#`/`;` comments), loaded once at startup, plus the "resolve my_ip
//! from NIC list + mgr_network" dance. Modeled as a value behind a single
//! lock and injected via `Arc`, rather than a language-level global.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use anyhow::{Context, Result};
use camino::Utf8Path;

use crate::ip_util;

#[derive(Debug, Default)]
pub struct Config {
    data: RwLock<HashMap<String, String>>,
}

impl Config {
    /// Load a `key = value` / `key=value` file, skipping blank lines and
    /// `#`/`;`-prefixed comments, then resolve `my_ip` and store it under
    /// that key. Last write wins for duplicate keys.
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_std_path())
            .with_context(|| format!("load configuration file {path}"))?;
        let mut data = HashMap::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let Some(pos) = line.find('=') else {
                continue;
            };
            let key = line[..pos].trim().to_string();
            let value = line[pos + 1..].trim().to_string();
            data.insert(key, value);
        }

        let cfg = Config {
            data: RwLock::new(data),
        };

        let nics = ip_util::local_ipv4_addrs().context("enumerate local NICs")?;
        let mgr_network = cfg.get("mgr_network");
        let my_ip = ip_util::resolve_my_ip(
            &nics,
            mgr_network.as_deref().filter(|s| !s.is_empty()),
        )
        .context("resolve management ip")?;
        cfg.set("my_ip", my_ip.to_string());

        Ok(cfg)
    }

    /// Build a config directly from an in-memory map, skipping NIC
    /// resolution — used by tests and by the `chp`/`cft` task-table tests
    /// that only need `my_ip`/`internal_rpc_pass`.
    pub fn from_map(data: HashMap<String, String>) -> Self {
        Config {
            data: RwLock::new(data),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.data.read().unwrap().get(key).cloned()
    }

    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    pub fn get_int(&self, key: &str) -> Result<i64> {
        let v = self
            .get(key)
            .ok_or_else(|| anyhow::anyhow!("config key {key} not set"))?;
        v.parse()
            .with_context(|| format!("config key {key} is not an integer: {v:?}"))
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.data.read().unwrap().contains_key(key)
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.data.write().unwrap().insert(key.into(), value.into());
    }

    pub fn all(&self) -> HashMap<String, String> {
        self.data.read().unwrap().clone()
    }

    /// `server_address` split into `(host, port)` pairs.
    pub fn controller_addresses(&self) -> Result<Vec<(String, u16)>> {
        let raw = self
            .get("server_address")
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("can not find server_address config in clup-agent.conf"))?;
        let mut out = Vec::new();
        for hostport in raw.trim().split(',') {
            let hostport = hostport.trim();
            let (host, port) = hostport
                .rsplit_once(':')
                .ok_or_else(|| anyhow::anyhow!("invalid server_address entry {hostport:?}"))?;
            out.push((host.to_string(), port.parse().context("controller port")?));
        }
        if out.is_empty() {
            anyhow::bail!("can not find server_address config in clup-agent.conf");
        }
        Ok(out)
    }
}

/// `<run>/clup-agent.pid`, where `<run>` is `/run` if it exists, else `/var/run`.
pub fn run_path() -> &'static Path {
    if Path::new("/run").is_dir() {
        Path::new("/run")
    } else {
        Path::new("/var/run")
    }
}

pub fn pid_file_path() -> std::path::PathBuf {
    run_path().join(crate::defaults::PID_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_write_wins_and_reads_observe_it() {
        let cfg = Config::from_map(HashMap::new());
        cfg.set("k", "v1");
        cfg.set("k", "v2");
        assert_eq!(cfg.get("k").as_deref(), Some("v2"));
    }

    #[test]
    fn controller_addresses_parses_comma_separated_hostports() {
        let mut m = HashMap::new();
        m.insert("server_address".to_string(), "10.0.0.1:4242,10.0.0.2:4242".to_string());
        let cfg = Config::from_map(m);
        let addrs = cfg.controller_addresses().unwrap();
        assert_eq!(addrs, vec![("10.0.0.1".to_string(), 4242), ("10.0.0.2".to_string(), 4242)]);
    }
}

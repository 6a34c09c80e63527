//! Virtual-IP management. `service_hander.py` delegates `vip_exists`,
//! `check_and_add_vip` and `check_and_del_vip` to an `ip_lib` module that
//! isn't part of the retrieved source; this is a from-scratch
//! implementation of the same three operations against Linux's `ip`
//! command, following the same "thin OS glue" shape as
//! [`super::mount`].

use std::net::Ipv4Addr;

use anyhow::{Context, Result};
use nix::sys::socket::SockaddrLike;

use super::run_cmd::run_cmd_result;

struct NicAddr {
    name: String,
    ip: Ipv4Addr,
    prefix_len: u8,
}

fn all_nic_addrs() -> Result<Vec<NicAddr>> {
    let mut out = Vec::new();
    for iface in nix::ifaddrs::getifaddrs().context("enumerate network interfaces")? {
        let Some(address) = iface.address else { continue };
        let Some(sin) = address.as_sockaddr_in() else { continue };
        let ip = Ipv4Addr::from(sin.ip());
        if ip.is_loopback() {
            continue;
        }
        let prefix_len = iface
            .netmask
            .and_then(|nm| nm.as_sockaddr_in().map(|s| s.ip()))
            .map(|raw| u32::from(raw).count_ones() as u8)
            .unwrap_or(32);
        out.push(NicAddr { name: iface.interface_name, ip, prefix_len });
    }
    Ok(out)
}

/// Whether `vip` is currently assigned to any local interface.
pub fn vip_exists(vip: Ipv4Addr) -> Result<bool> {
    Ok(all_nic_addrs()?.iter().any(|a| a.ip == vip))
}

/// The interface whose non-VIP (prefix < 32) network contains `vip`, used
/// to pick a `dev` for `ip addr add`.
fn nic_for_network_containing(vip: Ipv4Addr) -> Option<String> {
    let vip_num = u32::from(vip);
    all_nic_addrs().ok()?.into_iter().find_map(|a| {
        if a.prefix_len >= 32 {
            return None;
        }
        let mask = if a.prefix_len == 0 { 0 } else { u32::MAX << (32 - a.prefix_len) };
        if (u32::from(a.ip) & mask) == (vip_num & mask) {
            Some(a.name)
        } else {
            None
        }
    })
}

/// The interface `vip` is currently bound to, if any.
fn nic_holding(vip: Ipv4Addr) -> Option<String> {
    all_nic_addrs()
        .ok()?
        .into_iter()
        .find(|a| a.ip == vip)
        .map(|a| a.name)
}

/// Adds `vip` as a /32 on whichever interface's network contains it, unless
/// it's already present.
pub async fn check_and_add_vip(vip: Ipv4Addr) -> Result<(), String> {
    if vip_exists(vip).map_err(|e| e.to_string())? {
        return Ok(());
    }
    let nic = nic_for_network_containing(vip)
        .ok_or_else(|| format!("no local network contains vip {vip}"))?;
    let result = run_cmd_result(&format!("ip addr add {vip}/32 dev {nic}")).await;
    if result.ret_code == 0 {
        Ok(())
    } else {
        Err(result.stderr)
    }
}

/// Removes `vip` from whichever interface currently holds it, if any.
pub async fn check_and_del_vip(vip: Ipv4Addr) -> Result<(), String> {
    let Some(nic) = nic_holding(vip) else {
        return Ok(());
    };
    let result = run_cmd_result(&format!("ip addr del {vip}/32 dev {nic}")).await;
    if result.ret_code == 0 {
        Ok(())
    } else {
        Err(result.stderr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_never_matches_as_a_vip() {
        assert!(!vip_exists(Ipv4Addr::new(127, 0, 0, 1)).unwrap());
    }
}

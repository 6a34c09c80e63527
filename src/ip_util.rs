//! NIC enumeration, grounded on `original_source/lib/config.py`'s use of
//! `ip_lib.get_nic_ip_dict()` / `ip_lib.ipv4_to_num()`.

use std::net::Ipv4Addr;

use anyhow::{Context, Result};
use nix::ifaddrs::getifaddrs;
use nix::sys::socket::SockaddrLike;

/// One IPv4 address bound to a local interface, with its netmask prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NicAddr {
    pub ip: Ipv4Addr,
    pub prefix_len: u8,
}

/// Enumerate all non-loopback IPv4 addresses on this host, skipping /32
/// addresses (the original treats a /32 as a VIP and ignores it for the
/// purpose of resolving `my_ip`).
pub fn local_ipv4_addrs() -> Result<Vec<NicAddr>> {
    let mut out = Vec::new();
    for iface in getifaddrs().context("enumerate network interfaces")? {
        let Some(address) = iface.address else {
            continue;
        };
        let Some(sin) = address.as_sockaddr_in() else {
            continue;
        };
        let ip = Ipv4Addr::from(sin.ip());
        if ip.is_loopback() {
            continue;
        }
        let prefix_len = iface
            .netmask
            .and_then(|nm| nm.as_sockaddr_in().map(|s| s.ip()))
            .map(|raw| u32::from(raw).count_ones() as u8)
            .unwrap_or(32);
        if prefix_len == 32 {
            continue;
        }
        out.push(NicAddr { ip, prefix_len });
    }
    Ok(out)
}

pub fn ipv4_to_num(addr: Ipv4Addr) -> u32 {
    u32::from(addr)
}

/// Resolve this host's management IP among possibly several NIC addresses,
/// using `mgr_network` (an IPv4 network address, no prefix) to disambiguate.
///
/// Mirrors `config.py::load()`'s multi-homing branch verbatim.
pub fn resolve_my_ip(addrs: &[NicAddr], mgr_network: Option<&str>) -> Result<Ipv4Addr> {
    if addrs.is_empty() {
        anyhow::bail!("no non-loopback IPv4 address found on this host");
    }
    if addrs.len() == 1 {
        return Ok(addrs[0].ip);
    }
    let network_addr = mgr_network
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            let ips: Vec<String> = addrs.iter().map(|a| a.ip.to_string()).collect();
            anyhow::anyhow!(
                "this machine has more than one ip({:?}), must config 'mgr_network' in clup-agent.conf",
                ips
            )
        })?;
    let network_addr: Ipv4Addr = network_addr
        .parse()
        .with_context(|| format!("invalid mgr_network {network_addr:?}"))?;
    let network_num = ipv4_to_num(network_addr);

    for a in addrs {
        let netmask_num: u32 = if a.prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - a.prefix_len)
        };
        if ipv4_to_num(a.ip) & netmask_num == network_num & netmask_num {
            return Ok(a.ip);
        }
    }
    let ips: Vec<String> = addrs.iter().map(|a| a.ip.to_string()).collect();
    anyhow::bail!(
        "config mgr_network is error, this machine ip({:?}) not in this network({})",
        ips,
        network_addr
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_single_address_without_mgr_network() {
        let addrs = [NicAddr {
            ip: "10.0.1.5".parse().unwrap(),
            prefix_len: 24,
        }];
        assert_eq!(resolve_my_ip(&addrs, None).unwrap(), addrs[0].ip);
    }

    #[test]
    fn disambiguates_multi_homed_host_via_mgr_network() {
        let addrs = [
            NicAddr {
                ip: "10.0.1.5".parse().unwrap(),
                prefix_len: 24,
            },
            NicAddr {
                ip: "192.168.1.5".parse().unwrap(),
                prefix_len: 24,
            },
        ];
        let ip = resolve_my_ip(&addrs, Some("192.168.1.0")).unwrap();
        assert_eq!(ip, "192.168.1.5".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn fails_closed_without_mgr_network_when_multi_homed() {
        let addrs = [
            NicAddr {
                ip: "10.0.1.5".parse().unwrap(),
                prefix_len: 24,
            },
            NicAddr {
                ip: "192.168.1.5".parse().unwrap(),
                prefix_len: 24,
            },
        ];
        assert!(resolve_my_ip(&addrs, None).is_err());
    }
}

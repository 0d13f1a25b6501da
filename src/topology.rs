use ipnet::Ipv4Net;
use serde::Serialize;
use std::{
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

use crate::config::Config;
use crate::error::ValidationError;

pub const NS_PREFIX: &str = "ns-";

/// Every name and address owned by the tunnel on one port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Topology {
    pub port: u16,
    pub subnet_octet: u8,
    pub namespace: String,
    pub host_veth: String,
    pub ns_veth: String,
    pub host_ip: Ipv4Addr,
    pub ns_ip: Ipv4Addr,
    pub subnet: Ipv4Net,
    pub tunnel_ifname: String,
}

/// Map a port to its topology. Pure; the single source of every name.
pub fn derive(port: u32) -> Result<Topology, ValidationError> {
    if !(1..=65535).contains(&port) {
        return Err(ValidationError::PortOutOfRange(port));
    }
    let port = port as u16;
    let octet = subnet_octet(port);

    Ok(Topology {
        port,
        subnet_octet: octet,
        namespace: format!("{NS_PREFIX}{port}"),
        host_veth: format!("veth-{port}"),
        ns_veth: format!("vpeer-{port}"),
        host_ip: Ipv4Addr::new(10, 100, octet, 1),
        ns_ip: Ipv4Addr::new(10, 100, octet, 2),
        // /24 on a .0 address never fails
        subnet: Ipv4Net::new(Ipv4Addr::new(10, 100, octet, 0), 24).unwrap_or_default(),
        tunnel_ifname: tunnel_ifname(port),
    })
}

fn subnet_octet(port: u16) -> u8 {
    ((port % 250) + 1) as u8
}

/// 16-bit permutation of the port: short, stable, and never shared by two ports.
fn mix16(port: u16) -> u16 {
    let mut h = port ^ 0x5bd1;
    h = h.wrapping_mul(0x2c1b);
    h ^= h >> 7;
    h = h.wrapping_mul(0x9e3b);
    h ^= h >> 8;
    h
}

fn tunnel_ifname(port: u16) -> String {
    format!("wg-{:04x}", mix16(port))
}

/// Port encoded in a namespace name we created (`ns-<port>`).
pub fn port_of_namespace(name: &str) -> Option<u16> {
    let digits = name.strip_prefix(NS_PREFIX)?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u16>().ok().filter(|p| *p != 0)
}

/// Other ports whose subnet is the same /24 as `port`.
pub fn overlapping(port: u16, others: &[u16]) -> Vec<u16> {
    let mine = subnet_octet(port);
    others
        .iter()
        .copied()
        .filter(|p| *p != port && subnet_octet(*p) == mine)
        .collect()
}

/// Well-known per-port files.
#[derive(Debug, Clone)]
pub struct PortPaths {
    pub proxy_config: PathBuf,
    pub proxy_log: PathBuf,
    pub debug_bundle: PathBuf,
    pub resolv_dir: PathBuf,
}

impl Topology {
    pub fn paths(&self, cfg: &Config) -> PortPaths {
        let p = self.port;
        PortPaths {
            proxy_config: cfg.run_dir.join(format!("xray-{p}.json")),
            proxy_log: cfg.run_dir.join(format!("xray-{p}.log")),
            debug_bundle: cfg.run_dir.join(format!("debug-{p}.log")),
            resolv_dir: cfg.netns_etc_dir.join(&self.namespace),
        }
    }
}

pub fn lock_path(state_dir: &Path, port: u16) -> PathBuf {
    state_dir.join("locks").join(format!("port-{port}.lock"))
}

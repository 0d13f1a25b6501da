//! Routes and the fwmark policy inside a tunnel namespace.
//!
//! New connections leave through the tunnel (main table default). Packets of
//! already established flows from the namespace address are marked and looked
//! up in table 100, which sends them back out the veth. That keeps DNAT'd
//! inbound replies and the tunnel's own handshake off the tunnel.

use log::info;
use std::net::Ipv4Addr;

use crate::error::CommandError;
use crate::host::{self, Host};
use crate::iptables::{self, Rule};
use crate::topology::Topology;

pub const POLICY_TABLE: &str = "100";
pub const FWMARK: &str = "1";

pub fn mark_rule(t: &Topology) -> Rule {
    let ns_ip = t.ns_ip.to_string();
    Rule::in_ns(
        &t.namespace,
        "mangle",
        "OUTPUT",
        &["-s", &ns_ip, "-m", "conntrack", "--ctstate", "ESTABLISHED,RELATED", "-j", "MARK", "--set-mark", FWMARK],
    )
}

fn ip_ns(h: &dyn Host, ns: &str, args: &[&str]) -> Result<String, CommandError> {
    let mut v = vec!["-n", ns];
    v.extend_from_slice(args);
    host::ok(h, "ip", &v)
}

fn main_routes(op: &'static str, t: &Topology, ifname: &str, endpoint: Option<Ipv4Addr>) -> Vec<Vec<String>> {
    let s = |v: &[&str]| v.iter().map(|x| x.to_string()).collect::<Vec<_>>();
    let subnet = t.subnet.to_string();
    let ns_ip = t.ns_ip.to_string();
    let host_ip = t.host_ip.to_string();

    let mut v = vec![s(&["route", op, &subnet, "dev", &t.ns_veth, "proto", "kernel", "scope", "link", "src", &ns_ip])];
    if let Some(ep) = endpoint {
        let ep = format!("{ep}/32");
        v.push(s(&["route", op, &ep, "via", &host_ip, "dev", &t.ns_veth]));
    }
    v.push(s(&["route", op, "default", "dev", ifname]));
    v
}

fn apply(h: &dyn Host, ns: &str, routes: &[Vec<String>]) -> Result<(), CommandError> {
    for r in routes {
        let args: Vec<&str> = r.iter().map(String::as_str).collect();
        ip_ns(h, ns, &args)?;
    }
    Ok(())
}

/// Flush main and the policy table, then install the full route set, the
/// fwmark rule and the conntrack mark.
pub fn install_routes(h: &dyn Host, t: &Topology, endpoint: Ipv4Addr) -> Result<(), CommandError> {
    let ns = t.namespace.as_str();
    let host_ip = t.host_ip.to_string();
    info!("routing {ns}: default via {}, established via {} ({})", t.tunnel_ifname, host_ip, t.ns_veth);

    host::quiet(h, "ip", &["-n", ns, "route", "flush", "table", "main"]);
    host::quiet(h, "ip", &["-n", ns, "route", "flush", "table", POLICY_TABLE]);

    apply(h, ns, &main_routes("add", t, &t.tunnel_ifname, Some(endpoint)))?;
    ip_ns(h, ns, &["route", "add", "default", "via", &host_ip, "dev", &t.ns_veth, "table", POLICY_TABLE])?;

    // ip rule has no -C; drain existing copies before adding
    let rule = ["fwmark", FWMARK, "lookup", POLICY_TABLE];
    for _ in 0..8 {
        let mut del = vec!["rule", "del"];
        del.extend_from_slice(&rule);
        if ip_ns(h, ns, &del).is_err() {
            break;
        }
    }
    let mut add = vec!["rule", "add"];
    add.extend_from_slice(&rule);
    ip_ns(h, ns, &add)?;

    iptables::install(h, &mark_rule(t))?;
    Ok(())
}

/// Re-point the three main-table routes (replace semantics). The policy table,
/// rule and mark are left alone.
pub fn refresh(h: &dyn Host, t: &Topology, ifname: &str, endpoint: Option<Ipv4Addr>) -> Result<(), CommandError> {
    info!("refresh routes in {} via {ifname}", t.namespace);
    apply(h, &t.namespace, &main_routes("replace", t, ifname, endpoint))
}

/// `net.ipv4.ip_forward=1` on the host.
pub fn enable_forwarding(h: &dyn Host) -> Result<(), CommandError> {
    host::ok(h, "sysctl", &["-w", "net.ipv4.ip_forward=1"]).map(|_| ())
}

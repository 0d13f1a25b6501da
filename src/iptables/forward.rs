use log::info;

use super::{Rule, install_all, remove_all};
use crate::error::CommandError;
use crate::host::Host;
use crate::topology::Topology;

const PROTOS: [&str; 2] = ["tcp", "udp"];

/// Host nat PREROUTING: external traffic on the port goes to the namespace.
pub fn dnat_rules(t: &Topology) -> Vec<Rule> {
    let port = t.port.to_string();
    let dest = format!("{}:{}", t.ns_ip, t.port);
    PROTOS
        .iter()
        .map(|&p| {
            Rule::host("nat", "PREROUTING", &["-p", p, "--dport", &port, "-j", "DNAT", "--to-destination", &dest])
        })
        .collect()
}

/// Host-side egress of the namespace subnet, except back out the veth.
pub fn host_masquerade(t: &Topology) -> Rule {
    let subnet = t.subnet.to_string();
    Rule::host("nat", "POSTROUTING", &["-s", &subnet, "!", "-o", &t.host_veth, "-j", "MASQUERADE"])
}

/// Namespace-side egress through the tunnel interface.
pub fn ns_masquerade(t: &Topology) -> Rule {
    Rule::in_ns(&t.namespace, "nat", "POSTROUTING", &["-o", &t.tunnel_ifname, "-j", "MASQUERADE"])
}

/// FORWARD accepts in both directions, at the head of the chain.
pub fn forward_rules(t: &Topology) -> Vec<Rule> {
    let port = t.port.to_string();
    let ip = format!("{}/32", t.ns_ip);
    let mut v = Vec::with_capacity(4);
    for p in PROTOS {
        v.push(Rule::host("filter", "FORWARD", &["-p", p, "-d", &ip, "--dport", &port, "-j", "ACCEPT"]).at(1));
        v.push(Rule::host("filter", "FORWARD", &["-p", p, "-i", &t.host_veth, "-s", &ip, "-j", "ACCEPT"]).at(1));
    }
    v
}

fn host_rules(t: &Topology) -> Vec<Rule> {
    let mut v = dnat_rules(t);
    v.push(host_masquerade(t));
    v.extend(forward_rules(t));
    v
}

/// Every forwarding rule for the port. The namespace rule needs the namespace.
pub fn install(h: &dyn Host, t: &Topology) -> Result<(), CommandError> {
    install_all(h, &[ns_masquerade(t)])?;
    install_all(h, &host_rules(t))?;
    info!("firewall: port {} forwarded to {}", t.port, t.ns_ip);
    Ok(())
}

/// Host-side rules only; namespace rules vanish with the namespace.
pub fn remove(h: &dyn Host, t: &Topology) -> usize {
    remove_all(h, &host_rules(t))
}

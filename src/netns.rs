use log::{info, warn};
use std::time::Duration;

use crate::error::{CommandError, ProvisionError};
use crate::host::{self, Host};
use crate::iptables::{diag, forward};
use crate::topology::Topology;

const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Names from `ip netns list` (the first token of each line).
pub fn list(h: &dyn Host) -> Vec<String> {
    host::stdout(h, "ip", &["netns", "list"])
        .map(|out| {
            out.lines()
                .filter_map(|l| l.split_whitespace().next())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub fn exists(h: &dyn Host, ns: &str) -> bool {
    list(h).iter().any(|n| n == ns)
}

/// Remove whatever a previous run on this port may have left behind.
fn cleanup(h: &dyn Host, t: &Topology) {
    if host::quiet(h, "ip", &["netns", "delete", &t.namespace]) {
        warn!("removed stale namespace {}", t.namespace);
    }
    if host::quiet(h, "ip", &["link", "delete", &t.host_veth]) {
        warn!("removed stale veth {}", t.host_veth);
    }
    let n = forward::remove(h, t) + diag::remove_log_rules(h, t);
    if n > 0 {
        warn!("removed {n} stale firewall rules for port {}", t.port);
    }
}

fn create_namespace(h: &dyn Host, ns: &str) -> Result<(), ProvisionError> {
    let first = match host::ok(h, "ip", &["netns", "add", ns]) {
        Ok(_) => return Ok(()),
        Err(e) => e,
    };
    warn!("namespace {ns} create failed, retrying once: {first}");
    host::quiet(h, "ip", &["netns", "delete", ns]);
    h.sleep(RETRY_DELAY);
    host::ok(h, "ip", &["netns", "add", ns])
        .map(|_| ())
        .map_err(|source| ProvisionError::NamespaceCreateFailed { namespace: ns.to_string(), source })
}

fn step(step: &'static str, r: Result<String, CommandError>) -> Result<(), ProvisionError> {
    r.map(|_| ()).map_err(|source| ProvisionError::Step { step, source })
}

fn wire(h: &dyn Host, t: &Topology) -> Result<(), ProvisionError> {
    let ns = t.namespace.as_str();
    let host_cidr = format!("{}/24", t.host_ip);
    let ns_cidr = format!("{}/24", t.ns_ip);

    step(
        "create veth pair",
        host::ok(h, "ip", &["link", "add", &t.host_veth, "type", "veth", "peer", "name", &t.ns_veth]),
    )?;
    step("host veth up", host::ok(h, "ip", &["link", "set", &t.host_veth, "up"]))?;
    step("flush host veth", host::ok(h, "ip", &["addr", "flush", "dev", &t.host_veth]))?;
    step("address host veth", host::ok(h, "ip", &["addr", "add", &host_cidr, "dev", &t.host_veth]))?;

    step("move veth into namespace", host::ok(h, "ip", &["link", "set", &t.ns_veth, "netns", ns]))?;
    step("loopback up", host::ok(h, "ip", &["-n", ns, "link", "set", "lo", "up"]))?;
    step("namespace veth up", host::ok(h, "ip", &["-n", ns, "link", "set", &t.ns_veth, "up"]))?;
    step("flush namespace veth", host::ok(h, "ip", &["-n", ns, "addr", "flush", "dev", &t.ns_veth]))?;
    step("address namespace veth", host::ok(h, "ip", &["-n", ns, "addr", "add", &ns_cidr, "dev", &t.ns_veth]))?;
    Ok(())
}

/// Fresh namespace and veth pair for the port, addressed on its /24.
///
/// Anything left over from an earlier run is torn down first, so calling this
/// twice converges on the same state. A failure after the namespace exists
/// removes the namespace and veth again.
pub fn create(h: &dyn Host, t: &Topology) -> Result<(), ProvisionError> {
    info!("provision {} ({} <-> {})", t.namespace, t.host_veth, t.ns_veth);
    cleanup(h, t);
    create_namespace(h, &t.namespace)?;

    if let Err(e) = wire(h, t) {
        warn!("provision {} failed, rolling back: {e}", t.namespace);
        destroy(h, t);
        return Err(e);
    }
    Ok(())
}

/// Delete namespace and host veth; absence of either is fine.
pub fn destroy(h: &dyn Host, t: &Topology) {
    let ns_gone = host::quiet(h, "ip", &["netns", "delete", &t.namespace]);
    let veth_gone = host::quiet(h, "ip", &["link", "delete", &t.host_veth]);
    info!("destroy {}: namespace {} veth {}", t.namespace, gone(ns_gone), gone(veth_gone));
}

fn gone(removed: bool) -> &'static str {
    if removed { "removed" } else { "absent" }
}

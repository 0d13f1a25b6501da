//! Point-in-time text report of everything one port's tunnel touches.

use anyhow::{Context, Result};
use log::info;
use std::{
    fmt::Write as _,
    fs,
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::config::Config;
use crate::host::{self, Host};
use crate::netns;
use crate::topology::Topology;

const CONNTRACK_LINES: usize = 10;

fn section(out: &mut String, title: &str, body: &str) {
    let _ = writeln!(out, "=== {title} ===");
    out.push_str(body);
    if !body.ends_with('\n') {
        out.push('\n');
    }
    out.push('\n');
}

fn filtered(text: &str, t: &Topology, limit: Option<usize>) -> String {
    let port = t.port.to_string();
    let mut out = String::new();
    let lines = text.lines().filter(|l| l.contains(&port) || l.contains("10.100"));
    for l in lines.take(limit.unwrap_or(usize::MAX)) {
        out.push_str(l);
        out.push('\n');
    }
    out
}

/// Build the report. Namespace sections are skipped when it does not exist.
pub fn collect(h: &dyn Host, cfg: &Config, t: &Topology) -> String {
    let ns = t.namespace.as_str();
    let ts = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    let mut out = format!("=== Debug Log for Port {} ({ns}) ===\nTimestamp: {ts}\n\n", t.port);

    let names = netns::list(h);
    let present = names.iter().any(|n| n == ns);
    let info_body: String = names.iter().filter(|n| *n == ns).map(|n| format!("{n}\n")).collect();
    section(&mut out, "Namespace Info", &info_body);

    if present {
        let echo = cfg.probe.echo_url.as_str();
        section(&mut out, "IP Addresses", &host::output(h, "ip", &["-n", ns, "addr", "show"]));
        section(&mut out, "Routing Table", &host::output(h, "ip", &["-n", ns, "route", "show"]));
        section(&mut out, "IP Rules", &host::output(h, "ip", &["-n", ns, "rule", "show"]));
        section(&mut out, "WireGuard Status", &host::output_in(h, ns, "wg", &["show"]));
        section(&mut out, "Listening Ports", &host::output_in(h, ns, "ss", &["-tulnp"]));
        section(&mut out, "Namespace iptables", &host::output_in(h, ns, "iptables", &["-t", "nat", "-L", "-n", "-v"]));
        section(&mut out, "Route to 8.8.8.8", &host::output(h, "ip", &["-n", ns, "route", "get", "8.8.8.8"]));
        section(&mut out, "Curl Test", &host::output_in(h, ns, "curl", &["-s", "--max-time", "5", echo]));
    }

    let host_chains = [
        ("Host iptables NAT PREROUTING", ["-t", "nat", "-L", "PREROUTING", "-n", "-v"]),
        ("Host iptables FORWARD", ["-t", "filter", "-L", "FORWARD", "-n", "-v"]),
        ("Host iptables NAT POSTROUTING", ["-t", "nat", "-L", "POSTROUTING", "-n", "-v"]),
    ];
    for (title, args) in host_chains {
        section(&mut out, title, &filtered(&host::output(h, "iptables", &args), t, None));
    }
    let ct = host::output(h, "conntrack", &["-L", "-n"]);
    section(&mut out, "Connection Tracking", &filtered(&ct, t, Some(CONNTRACK_LINES)));
    section(&mut out, "Veth Interface", &host::output(h, "ip", &["addr", "show", &t.host_veth]));
    out
}

/// Write the report to `<run_dir>/debug-<P>.log`.
pub fn write(h: &dyn Host, cfg: &Config, t: &Topology) -> Result<(PathBuf, String)> {
    let text = collect(h, cfg, t);
    let path = t.paths(cfg).debug_bundle;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("mkdir {}", parent.display()))?;
    }
    fs::write(&path, &text).with_context(|| format!("write {}", path.display()))?;
    info!("debug bundle for port {} written to {}", t.port, path.display());
    Ok((path, text))
}

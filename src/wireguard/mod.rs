pub mod conf;

use log::{info, warn};
use std::{fs, io::Write, net::Ipv4Addr, path::Path, time::Duration};

pub use conf::{Endpoint, TunnelConf};

use crate::config::Config;
use crate::error::{CommandError, ConfigError, ResolutionError};
use crate::host::{self, Host};
use crate::netns;
use crate::topology::Topology;

const DEFAULT_ADDRESS: &str = "10.0.0.2/32";
const BOUNCE_DELAY: Duration = Duration::from_secs(2);

fn first_ipv4<'a>(mut tokens: impl Iterator<Item = &'a str>) -> Option<Ipv4Addr> {
    tokens.find_map(|t| t.trim().parse::<Ipv4Addr>().ok())
}

/// IPv4 for an endpoint host: literal, system resolver, `getent`, then `dig`.
pub fn resolve_endpoint(h: &dyn Host, host: &str) -> Result<Ipv4Addr, ResolutionError> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Ok(ip);
    }
    if let Some(ip) = h.lookup_ipv4(host) {
        info!("resolved {host} -> {ip} (system resolver)");
        return Ok(ip);
    }
    let getent = host::stdout(h, "getent", &["ahostsv4", host])
        .and_then(|out| first_ipv4(out.lines().filter_map(|l| l.split_whitespace().next())));
    if let Some(ip) = getent {
        info!("resolved {host} -> {ip} (getent)");
        return Ok(ip);
    }
    let dig = host::stdout(h, "dig", &["+short", "A", host]).and_then(|out| first_ipv4(out.lines()));
    if let Some(ip) = dig {
        info!("resolved {host} -> {ip} (dig)");
        return Ok(ip);
    }
    Err(ResolutionError::EndpointUnresolvable(host.to_string()))
}

/// Endpoint IPv4 of a tunnel config.
pub fn resolve(h: &dyn Host, conf: &TunnelConf) -> Result<Ipv4Addr, ResolutionError> {
    let ep = conf.endpoint().ok_or(ResolutionError::MissingEndpoint)?;
    resolve_endpoint(h, &ep.host)
}

fn step(step: &'static str, r: Result<String, CommandError>) -> Result<(), ConfigError> {
    r.map(|_| ()).map_err(|source| ConfigError::Step { step, source })
}

fn delete_interface(h: &dyn Host, t: &Topology) {
    host::quiet(h, "ip", &["-n", &t.namespace, "link", "delete", &t.tunnel_ifname]);
    host::quiet(h, "ip", &["link", "delete", &t.tunnel_ifname]);
}

/// `wg setconf` from a private temp file under `run_dir`, gone once applied.
///
/// The file is created exclusively under a random name (0600), so nothing
/// pre-placed at a known path can receive the key.
fn set_conf(h: &dyn Host, cfg: &Config, t: &Topology, text: &str) -> Result<(), ConfigError> {
    let io = |source| ConfigError::Io { step: "write tunnel config", source };
    fs::create_dir_all(&cfg.run_dir).map_err(io)?;
    let mut f = tempfile::Builder::new()
        .prefix(&format!("wg-{}-", t.port))
        .suffix(".conf")
        .tempfile_in(&cfg.run_dir)
        .map_err(io)?;
    f.write_all(text.as_bytes()).and_then(|_| f.flush()).map_err(io)?;

    let path = f.path().to_string_lossy().into_owned();
    let r = host::ok(h, "wg", &["setconf", &t.tunnel_ifname, &path]);
    if let Err(e) = f.close() {
        warn!("remove {path}: {e}");
    }
    step("apply tunnel config", r)
}

fn install(h: &dyn Host, cfg: &Config, t: &Topology, conf: &TunnelConf) -> Result<(), ConfigError> {
    let ns = t.namespace.as_str();
    let wg = t.tunnel_ifname.as_str();

    step("create tunnel interface", host::ok(h, "ip", &["link", "add", wg, "type", "wireguard"]))?;
    set_conf(h, cfg, t, &conf.stripped())?;
    step("move tunnel interface", host::ok(h, "ip", &["link", "set", wg, "netns", ns]))?;

    let mut addrs = conf.addresses();
    if addrs.is_empty() {
        addrs.push(DEFAULT_ADDRESS.to_string());
    }
    for a in &addrs {
        step("address tunnel interface", host::ok(h, "ip", &["-n", ns, "addr", "add", a, "dev", wg]))?;
    }
    if let Some(mtu) = conf.mtu() {
        let mtu = mtu.to_string();
        step("set tunnel mtu", host::ok(h, "ip", &["-n", ns, "link", "set", wg, "mtu", &mtu]))?;
    }
    step("tunnel interface up", host::ok(h, "ip", &["-n", ns, "link", "set", wg, "up"]))?;

    let mut servers = conf.dns();
    if servers.is_empty() {
        servers.push(cfg.nameserver.clone());
    }
    let dir = t.paths(cfg).resolv_dir;
    write_resolv(&dir, &servers).map_err(|source| ConfigError::Io { step: "write resolv.conf", source })?;
    Ok(())
}

/// Bring the tunnel interface up inside the namespace from `conf` and return
/// the endpoint IPv4 for routing.
///
/// The endpoint is resolved before anything is touched. On any later failure
/// the interface, namespace and veth are all removed.
pub fn configure(h: &dyn Host, cfg: &Config, t: &Topology, conf: &TunnelConf) -> Result<Ipv4Addr, ConfigError> {
    let endpoint = resolve(h, conf)?;
    info!("configure {} in {} (endpoint {endpoint})", t.tunnel_ifname, t.namespace);

    delete_interface(h, t);
    if let Err(e) = install(h, cfg, t, conf) {
        warn!("configure {} failed, rolling back: {e}", t.tunnel_ifname);
        delete_interface(h, t);
        netns::destroy(h, t);
        return Err(e);
    }
    Ok(endpoint)
}

/// `/etc/netns/<ns>/resolv.conf`: addresses as nameservers, names as search domains.
pub fn write_resolv(dir: &Path, servers: &[String]) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    let mut text = String::new();
    let search: Vec<&str> = servers
        .iter()
        .map(String::as_str)
        .filter(|s| s.parse::<std::net::IpAddr>().is_err())
        .collect();
    for s in servers.iter().filter(|s| s.parse::<std::net::IpAddr>().is_ok()) {
        text.push_str(&format!("nameserver {s}\n"));
    }
    if !search.is_empty() {
        text.push_str(&format!("search {}\n", search.join(" ")));
    }
    fs::write(dir.join("resolv.conf"), text)
}

pub fn remove_resolv(dir: &Path) {
    if dir.exists() {
        if let Err(e) = fs::remove_dir_all(dir) {
            warn!("remove {}: {e}", dir.display());
        }
    }
}

/// First WireGuard interface inside the namespace.
pub fn find_interface(h: &dyn Host, ns: &str) -> Option<String> {
    host::stdout_in(h, ns, "wg", &["show", "interfaces"])?
        .split_whitespace()
        .next()
        .map(str::to_string)
}

/// Most recent handshake across peers, unix seconds; `None` if never.
pub fn latest_handshake(h: &dyn Host, ns: &str, ifname: &str) -> Option<u64> {
    host::stdout_in(h, ns, "wg", &["show", ifname, "latest-handshakes"])?
        .lines()
        .filter_map(|l| l.split_whitespace().nth(1))
        .filter_map(|ts| ts.parse::<u64>().ok())
        .filter(|ts| *ts > 0)
        .max()
}

/// Endpoint host of the running interface, as reported by `wg showconf`.
pub fn running_endpoint(h: &dyn Host, ns: &str, ifname: &str) -> Option<Endpoint> {
    let text = host::stdout_in(h, ns, "wg", &["showconf", ifname])?;
    TunnelConf::parse(&text).endpoint()
}

/// Link down, pause, link up, pause.
pub fn bounce(h: &dyn Host, ns: &str, ifname: &str) -> Result<(), CommandError> {
    host::ok(h, "ip", &["-n", ns, "link", "set", ifname, "down"])?;
    h.sleep(BOUNCE_DELAY);
    host::ok(h, "ip", &["-n", ns, "link", "set", ifname, "up"])?;
    h.sleep(BOUNCE_DELAY);
    Ok(())
}

/// Poll for a handshake; true as soon as one is seen.
pub fn wait_handshake(h: &dyn Host, ns: &str, ifname: &str, attempts: u32, interval: Duration) -> bool {
    for _ in 0..attempts {
        h.sleep(interval);
        if latest_handshake(h, ns, ifname).is_some() {
            return true;
        }
    }
    false
}

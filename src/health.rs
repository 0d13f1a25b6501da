//! Read-only status of tunnels, derived from the live namespace on every call.

use log::debug;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt,
    net::{IpAddr, Ipv4Addr},
    sync::Mutex,
    time::Duration,
};

use crate::config::Config;
use crate::host::{self, Host};
use crate::netns;
use crate::sockets;
use crate::topology::{self, Topology};
use crate::wireguard;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownReason {
    NoNamespace,
    NoInterface,
    NoHandshake,
    LinkDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStatus {
    Active,
    Down(DownReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyStatus {
    Running,
    Stopped,
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelStatus::Active => f.write_str("active"),
            TunnelStatus::Down(DownReason::NoNamespace) => f.write_str("down (no namespace)"),
            TunnelStatus::Down(DownReason::NoInterface) => f.write_str("down (no interface)"),
            TunnelStatus::Down(DownReason::NoHandshake) => f.write_str("down (no handshake)"),
            TunnelStatus::Down(DownReason::LinkDown) => f.write_str("down (link down)"),
        }
    }
}

impl fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProxyStatus::Running => "running",
            ProxyStatus::Stopped => "stopped",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelRecord {
    pub port: u16,
    pub namespace: String,
    pub interface_name: Option<String>,
    pub up: bool,
    pub last_handshake: Option<u64>,
    pub listening: bool,
    pub egress_ip: Option<String>,
    pub tunnel: TunnelStatus,
    pub proxy: ProxyStatus,
    pub geo: Option<String>,
}

impl TunnelRecord {
    pub fn egress(&self) -> &str {
        self.egress_ip.as_deref().unwrap_or("unknown")
    }
}

#[derive(Debug, Deserialize)]
struct LinkJson {
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    operstate: String,
}

/// UP, or UNKNOWN with carrier (how point-to-point devices report).
fn link_is_up(h: &dyn Host, ns: &str, ifname: &str) -> bool {
    let Some(out) = host::stdout(h, "ip", &["-n", ns, "-j", "link", "show", "dev", ifname]) else {
        return false;
    };
    let links: Vec<LinkJson> = match serde_json::from_str(&out) {
        Ok(v) => v,
        Err(e) => {
            debug!("ip -j link show {ifname}: {e}");
            return false;
        }
    };
    links.iter().any(|l| {
        let has = |f: &str| l.flags.iter().any(|x| x == f);
        l.operstate == "UP" || (l.operstate == "UNKNOWN" && has("LOWER_UP")) || (has("UP") && has("LOWER_UP"))
    })
}

/// Tunnel interface in the namespace: the derived name, or whatever WireGuard
/// interface is there.
fn interface(h: &dyn Host, t: &Topology) -> Option<String> {
    let present = host::stdout_in(h, &t.namespace, "wg", &["show", "interfaces"])?;
    let names: Vec<&str> = present.split_whitespace().collect();
    if names.contains(&t.tunnel_ifname.as_str()) {
        return Some(t.tunnel_ifname.clone());
    }
    names.first().map(|s| s.to_string())
}

/// Public address as seen from inside the namespace.
pub fn egress_ip(h: &dyn Host, cfg: &Config, ns: &str) -> Option<String> {
    let timeout = cfg.probe.echo_timeout_s.to_string();
    let out = host::stdout_in(h, ns, "curl", &["-s", "--max-time", &timeout, &cfg.probe.echo_url])?;
    let ip = out.trim();
    ip.parse::<IpAddr>().ok().map(|_| ip.to_string())
}

pub fn probe_topology(h: &dyn Host, cfg: &Config, t: &Topology) -> TunnelRecord {
    let mut rec = TunnelRecord {
        port: t.port,
        namespace: t.namespace.clone(),
        interface_name: None,
        up: false,
        last_handshake: None,
        listening: false,
        egress_ip: None,
        tunnel: TunnelStatus::Down(DownReason::NoNamespace),
        proxy: ProxyStatus::Stopped,
        geo: None,
    };
    if !netns::exists(h, &t.namespace) {
        return rec;
    }

    rec.listening = sockets::is_listening(h, &t.namespace, t.port);
    if rec.listening {
        rec.proxy = ProxyStatus::Running;
    }

    rec.tunnel = match interface(h, t) {
        None => TunnelStatus::Down(DownReason::NoInterface),
        Some(ifname) => {
            rec.last_handshake = wireguard::latest_handshake(h, &t.namespace, &ifname);
            rec.up = link_is_up(h, &t.namespace, &ifname);
            rec.interface_name = Some(ifname);
            match (rec.last_handshake, rec.up) {
                (None, _) => TunnelStatus::Down(DownReason::NoHandshake),
                (Some(_), false) => TunnelStatus::Down(DownReason::LinkDown),
                (Some(_), true) => TunnelStatus::Active,
            }
        }
    };

    rec.egress_ip = egress_ip(h, cfg, &t.namespace);
    if cfg.probe.geo_enabled {
        rec.geo = rec.egress_ip.as_deref().and_then(|ip| geo(cfg, ip));
    }
    rec
}

/// Status of one port. Never fails; an invalid port reads as absent.
pub fn probe(h: &dyn Host, cfg: &Config, port: u16) -> TunnelRecord {
    match topology::derive(u32::from(port)) {
        Ok(t) => probe_topology(h, cfg, &t),
        Err(_) => TunnelRecord {
            port,
            namespace: String::new(),
            interface_name: None,
            up: false,
            last_handshake: None,
            listening: false,
            egress_ip: None,
            tunnel: TunnelStatus::Down(DownReason::NoNamespace),
            proxy: ProxyStatus::Stopped,
            geo: None,
        },
    }
}

/// Ports of every `ns-<port>` namespace, ascending.
pub fn ports(h: &dyn Host) -> Vec<u16> {
    let mut v: Vec<u16> = netns::list(h).iter().filter_map(|n| topology::port_of_namespace(n)).collect();
    v.sort_unstable();
    v.dedup();
    v
}

pub fn list(h: &dyn Host, cfg: &Config) -> Vec<TunnelRecord> {
    ports(h).into_iter().map(|p| probe(h, cfg, p)).collect()
}

/// Process-wide IPv4 -> "city, country" map. Failed lookups are cached too.
pub struct GeoCache {
    entries: Mutex<BTreeMap<String, Option<String>>>,
}

impl GeoCache {
    pub const fn new() -> Self {
        Self { entries: Mutex::new(BTreeMap::new()) }
    }

    pub fn lookup_with(&self, ip: &str, fetch: impl FnOnce(Ipv4Addr) -> Option<String>) -> Option<String> {
        let v4 = ip.parse::<Ipv4Addr>().ok()?;
        if let Some(hit) = self.lock().get(ip) {
            return hit.clone();
        }
        let found = fetch(v4);
        self.lock().insert(ip.to_string(), found.clone());
        found
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Option<String>>> {
        match self.entries.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

static GEO: GeoCache = GeoCache::new();

#[derive(Debug, Deserialize)]
struct GeoReply {
    status: String,
    #[serde(default)]
    country: String,
    #[serde(default)]
    city: String,
}

/// "city, country" from an ip-api style JSON reply.
fn parse_geo(body: &str) -> Option<String> {
    let r: GeoReply = serde_json::from_str(body).ok()?;
    if r.status != "success" || (r.country.is_empty() && r.city.is_empty()) {
        return None;
    }
    Some(format!("{}, {}", r.city, r.country))
}

fn fetch_geo(cfg: &Config, ip: Ipv4Addr) -> Option<String> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_millis(cfg.probe.geo_timeout_ms))
        .build()
        .ok()?;
    let url = format!("{}/{ip}?fields=status,country,city", cfg.probe.geo_url.trim_end_matches('/'));
    match client.get(&url).send().and_then(|r| r.text()) {
        Ok(body) => parse_geo(&body),
        Err(e) => {
            debug!("geo {ip}: {e}");
            None
        }
    }
}

pub fn geo(cfg: &Config, ip: &str) -> Option<String> {
    GEO.lookup_with(ip, |v4| fetch_geo(cfg, v4))
}

/// The host's own public address, from the IP-echo URL.
pub fn host_egress(cfg: &Config) -> Option<String> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(cfg.probe.echo_timeout_s.max(1) * 3))
        .build()
        .ok()?;
    let body = client.get(&cfg.probe.echo_url).send().and_then(|r| r.text()).ok()?;
    let ip = body.trim();
    ip.parse::<IpAddr>().ok().map(|_| ip.to_string())
}

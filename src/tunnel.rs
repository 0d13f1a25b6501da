//! Lifecycle of one port's tunnel: create, delete, restart, proxy start/stop.
//!
//! Every mutating operation holds the port's lock for its whole duration.

use log::{info, warn};
use std::{fs, net::Ipv4Addr, time::Duration};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{ConfigError, Error, ProcessError, Result};
use crate::health;
use crate::host::Host;
use crate::iptables::{diag, forward};
use crate::lock::PortLock;
use crate::netns;
use crate::programs::xray::{self, ConfigDocument, StartReport};
use crate::routing;
use crate::topology::{self, Topology};
use crate::vless::{self, Identity};
use crate::wireguard::{self, TunnelConf};

const HANDSHAKE_ATTEMPTS: u32 = 10;
const HANDSHAKE_INTERVAL: Duration = Duration::from_secs(2);

/// Outcome of launching the proxy. The network stays up when this fails.
#[derive(Debug)]
pub struct ProxyOutcome {
    pub identity: Identity,
    pub result: std::result::Result<StartReport, ProcessError>,
    pub connection_string: String,
}

impl ProxyOutcome {
    pub fn confirmed(&self) -> bool {
        matches!(&self.result, Ok(r) if r.listening)
    }
}

#[derive(Debug)]
pub struct CreateReport {
    pub topology: Topology,
    pub endpoint: Ipv4Addr,
    pub overlaps: Vec<u16>,
    pub proxy: ProxyOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartReport {
    pub interface: String,
    pub endpoint: Option<Ipv4Addr>,
    pub handshake: bool,
}

/// What the inbound should admit.
#[derive(Debug, Clone, Default)]
pub struct ProxyRequest {
    /// Parsed connection URI; `None` keeps the existing identity or makes one.
    pub identity: Option<Identity>,
    /// Additional client ids; `None` keeps the ones already configured.
    pub clients: Option<Vec<Uuid>>,
}

impl ProxyRequest {
    pub fn from_uri(uri: Option<&str>, clients: Option<Vec<Uuid>>) -> Result<Self> {
        let identity = uri.map(vless::parse).transpose()?;
        Ok(Self { identity, clients })
    }
}

/// Host written into connection strings: configured, probed, or a placeholder.
pub fn connection_host(cfg: &Config) -> String {
    if let Some(h) = &cfg.public_host {
        return h.clone();
    }
    health::host_egress(cfg).unwrap_or_else(|| "SERVER_IP".to_string())
}

fn lock(cfg: &Config, t: &Topology) -> Result<PortLock> {
    PortLock::acquire(&cfg.state_dir, t.port)
}

/// Host-side rules, namespace, veth and resolver file. Absence is fine.
fn teardown(h: &dyn Host, cfg: &Config, t: &Topology) {
    forward::remove(h, t);
    diag::remove_log_rules(h, t);
    netns::destroy(h, t);
    wireguard::remove_resolv(&t.paths(cfg).resolv_dir);
}

fn bring_up_network(h: &dyn Host, cfg: &Config, t: &Topology, conf: &TunnelConf) -> Result<Ipv4Addr> {
    netns::create(h, t)?;
    let endpoint = wireguard::configure(h, cfg, t, conf).map_err(|e| match e {
        ConfigError::Resolution(r) => Error::Resolution(r),
        e => Error::Config(e),
    })?;

    if let Err(e) = routing::install_routes(h, t, endpoint) {
        warn!("routing for port {} failed, rolling back", t.port);
        teardown(h, cfg, t);
        return Err(Error::Routing(e));
    }
    if let Err(e) = routing::enable_forwarding(h) {
        warn!("could not enable ip_forward: {e}");
    }
    if let Err(e) = forward::install(h, t) {
        warn!("firewall for port {} failed, rolling back", t.port);
        teardown(h, cfg, t);
        return Err(Error::Firewall(e));
    }
    Ok(endpoint)
}

fn launch_proxy(h: &dyn Host, cfg: &Config, t: &Topology, identity: Identity, clients: &[Uuid]) -> ProxyOutcome {
    let paths = t.paths(cfg);
    let doc = xray::render(&identity, t.port, clients);
    let result = doc
        .write(&paths.proxy_config)
        .and_then(|_| xray::start(h, cfg, &t.namespace, t.port, &paths.proxy_config, &paths.proxy_log));
    let connection_string = identity.connection_string(&connection_host(cfg), t.port, &t.namespace);
    let outcome = ProxyOutcome { identity, result, connection_string };
    match &outcome.result {
        Ok(r) if outcome.confirmed() => info!("proxy on port {} confirmed (pid {})", t.port, r.pid),
        Ok(r) => warn!("proxy on port {} not confirmed listening (pid {})", t.port, r.pid),
        Err(e) => warn!("proxy on port {}: {e}", t.port),
    }
    outcome
}

/// Bring up the whole tunnel for `port` from WireGuard text and start its proxy.
///
/// Validation and an endpoint resolution check happen before anything is
/// changed. A proxy left from an earlier create is stopped while its namespace
/// still exists. Network failures roll back; a proxy failure leaves the
/// network in place and is reported in `CreateReport::proxy`.
pub fn create(h: &dyn Host, cfg: &Config, port: u32, wg_text: &str, req: ProxyRequest) -> Result<CreateReport> {
    let t = topology::derive(port)?;
    let conf = TunnelConf::parse(wg_text);
    wireguard::resolve(h, &conf)?;
    let identity = req
        .identity
        .unwrap_or_else(|| Identity::generate(&cfg.proxy.default_header_host, &cfg.proxy.default_header_path));

    let _lock = lock(cfg, &t)?;
    let overlaps = topology::overlapping(t.port, &health::ports(h));
    if !overlaps.is_empty() {
        warn!("subnet {} of port {} is also used by ports {overlaps:?}", t.subnet, t.port);
    }

    if netns::exists(h, &t.namespace) {
        let old = xray::stop(h, &t.namespace, t.port);
        if !old.is_empty() {
            info!("stopped previous proxy {old:?} on port {}", t.port);
        }
    }

    info!("create tunnel on port {}", t.port);
    let endpoint = bring_up_network(h, cfg, &t, &conf)?;

    let clients = req.clients.unwrap_or_default();
    let proxy = launch_proxy(h, cfg, &t, identity, &clients);
    Ok(CreateReport { topology: t, endpoint, overlaps, proxy })
}

/// Stop the proxy and remove everything the port owns.
pub fn delete(h: &dyn Host, cfg: &Config, port: u32) -> Result<()> {
    let t = topology::derive(port)?;
    let _lock = lock(cfg, &t)?;
    info!("delete tunnel on port {}", t.port);

    if netns::exists(h, &t.namespace) {
        xray::stop(h, &t.namespace, t.port);
    }
    teardown(h, cfg, &t);
    let conf = t.paths(cfg).proxy_config;
    if conf.exists() {
        if let Err(e) = fs::remove_file(&conf) {
            warn!("remove {}: {e}", conf.display());
        }
    }
    Ok(())
}

/// Bounce the tunnel interface, re-point routes and wait for a handshake.
pub fn restart(h: &dyn Host, cfg: &Config, port: u32) -> Result<RestartReport> {
    let t = topology::derive(port)?;
    let _lock = lock(cfg, &t)?;
    if !netns::exists(h, &t.namespace) {
        return Err(Error::NoTunnel(t.port));
    }
    let ifname = wireguard::find_interface(h, &t.namespace).ok_or(Error::NoTunnel(t.port))?;

    let endpoint = wireguard::running_endpoint(h, &t.namespace, &ifname)
        .and_then(|ep| wireguard::resolve_endpoint(h, &ep.host).ok());
    if endpoint.is_none() {
        warn!("endpoint of {ifname} not resolvable, endpoint route left as is");
    }

    info!("restart {ifname} in {}", t.namespace);
    wireguard::bounce(h, &t.namespace, &ifname)
        .map_err(|source| ConfigError::Step { step: "bounce tunnel interface", source })?;
    routing::refresh(h, &t, &ifname, endpoint).map_err(Error::Routing)?;

    let handshake = wireguard::wait_handshake(h, &t.namespace, &ifname, HANDSHAKE_ATTEMPTS, HANDSHAKE_INTERVAL);
    if !handshake {
        warn!("{ifname}: no handshake yet after restart");
    }
    Ok(RestartReport { interface: ifname, endpoint, handshake })
}

/// (Re)write the proxy config and (re)start the proxy in an existing tunnel.
pub fn proxy_start(h: &dyn Host, cfg: &Config, port: u32, req: ProxyRequest) -> Result<ProxyOutcome> {
    let t = topology::derive(port)?;
    let _lock = lock(cfg, &t)?;
    if !netns::exists(h, &t.namespace) {
        return Err(Error::NoTunnel(t.port));
    }

    let existing = ConfigDocument::load(&t.paths(cfg).proxy_config).ok();
    let identity = match (req.identity, existing.as_ref().and_then(|d| d.identity().ok())) {
        (Some(i), _) => i,
        (None, Some(i)) => {
            info!("reusing identity {} for port {}", i.client_id, t.port);
            i
        }
        (None, None) => Identity::generate(&cfg.proxy.default_header_host, &cfg.proxy.default_header_path),
    };
    let clients = match req.clients {
        Some(c) => c,
        None => existing.map(|d| d.clients()).unwrap_or_default(),
    };
    Ok(launch_proxy(h, cfg, &t, identity, &clients))
}

pub fn proxy_stop(h: &dyn Host, cfg: &Config, port: u32) -> Result<Vec<u32>> {
    let t = topology::derive(port)?;
    let _lock = lock(cfg, &t)?;
    if !netns::exists(h, &t.namespace) {
        return Ok(Vec::new());
    }
    Ok(xray::stop(h, &t.namespace, t.port))
}

pub fn proxy_logs(cfg: &Config, port: u32, lines: usize) -> Result<Vec<String>> {
    let t = topology::derive(port)?;
    Ok(xray::logs(&t.paths(cfg).proxy_log, lines))
}

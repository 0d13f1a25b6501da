use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{fs, path::PathBuf};
use uuid::Uuid;

use crate::config::Config;
use crate::debug;
use crate::health::{self, TunnelRecord};
use crate::host::Host;
use crate::iptables::diag;
use crate::programs::xray;
use crate::topology;
use crate::tunnel::{self, ProxyOutcome, ProxyRequest};

#[derive(Debug, Parser)]
#[command(
    name = "wgns",
    about = "Per-port WireGuard network namespaces with a VLESS inbound",
    long_about = "wgns gives every port its own network namespace: a veth pair to the host, one WireGuard \
interface for egress, and an xray VLESS inbound listening on that port. Host DNAT/FORWARD rules send \
inbound traffic on the port into the namespace.",
    arg_required_else_help = true
)]
pub struct Args {
    /// JSON config file; every field has a default.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// trace, debug, info, warn, error (overrides the config file)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create the tunnel for PORT from a WireGuard config and start its proxy.
    Create {
        port: u32,
        wg_conf: PathBuf,
        /// vless:// URI whose identity the inbound should use
        #[arg(long)]
        uri: Option<String>,
        /// File with one client UUID per line
        #[arg(long)]
        clients: Option<PathBuf>,
    },
    /// Stop the proxy and remove the tunnel.
    Delete { port: u32 },
    /// Bounce the tunnel interface and wait for a handshake.
    Restart { port: u32 },
    /// Status of every tunnel.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Status of one tunnel.
    Status {
        port: u32,
        #[arg(long)]
        json: bool,
    },
    /// Proxy process control.
    Proxy {
        #[command(subcommand)]
        action: ProxyAction,
    },
    /// Write the diagnostic bundle for PORT.
    Debug {
        port: u32,
        /// Then trace live traffic until Ctrl-C
        #[arg(long)]
        watch: bool,
    },
    /// Trace live traffic for PORT until Ctrl-C.
    Watch { port: u32 },
}

#[derive(Debug, Subcommand)]
pub enum ProxyAction {
    Start {
        port: u32,
        #[arg(long)]
        uri: Option<String>,
        #[arg(long)]
        clients: Option<PathBuf>,
    },
    Stop { port: u32 },
    Logs {
        port: u32,
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
    },
}

fn read_clients(path: Option<&PathBuf>) -> Result<Option<Vec<Uuid>>> {
    let Some(path) = path else { return Ok(None) };
    let text = fs::read_to_string(path).with_context(|| format!("read client list {}", path.display()))?;
    let ids = xray::read_client_list(&text).with_context(|| format!("client list {}", path.display()))?;
    Ok(Some(ids))
}

fn request(uri: Option<&str>, clients: Option<&PathBuf>) -> Result<ProxyRequest> {
    let clients = read_clients(clients)?;
    Ok(ProxyRequest::from_uri(uri, clients)?)
}

fn print_proxy(port: u16, p: &ProxyOutcome) {
    match &p.result {
        Ok(r) if p.confirmed() => {
            println!("proxy on port {port} running (pid {})", r.pid);
        }
        Ok(r) => {
            println!("proxy on port {port} started (pid {}) but not confirmed listening", r.pid);
            for l in &r.log_tail {
                println!("  {l}");
            }
        }
        Err(e) => println!("proxy on port {port} failed: {e}"),
    }
    println!("client id: {}", p.identity.client_id);
    println!("{}", p.connection_string);
}

fn print_record(r: &TunnelRecord) {
    let geo = r.geo.as_deref().map(|g| format!(" ({g})")).unwrap_or_default();
    println!(
        "{:<6} {:<10} {:<8} tunnel={:<24} proxy={:<8} egress={}{geo}",
        r.port,
        r.namespace,
        r.interface_name.as_deref().unwrap_or("-"),
        r.tunnel.to_string(),
        r.proxy.to_string(),
        r.egress(),
    );
}

pub fn dispatch(h: &dyn Host, cfg: &Config, command: Command) -> Result<()> {
    match command {
        Command::Create { port, wg_conf, uri, clients } => {
            let text = fs::read_to_string(&wg_conf).with_context(|| format!("read {}", wg_conf.display()))?;
            let req = request(uri.as_deref(), clients.as_ref())?;
            let report = tunnel::create(h, cfg, port, &text, req).with_context(|| format!("create port {port}"))?;
            let t = &report.topology;
            println!("tunnel {} up: {} via {} (endpoint {})", t.port, t.namespace, t.tunnel_ifname, report.endpoint);
            if !report.overlaps.is_empty() {
                println!("note: subnet {} shared with ports {:?}", t.subnet, report.overlaps);
            }
            print_proxy(t.port, &report.proxy);
        }
        Command::Delete { port } => {
            tunnel::delete(h, cfg, port).with_context(|| format!("delete port {port}"))?;
            println!("tunnel {port} removed");
        }
        Command::Restart { port } => {
            let r = tunnel::restart(h, cfg, port).with_context(|| format!("restart port {port}"))?;
            let state = if r.handshake { "handshake ok" } else { "no handshake yet" };
            let endpoint = r.endpoint.map(|ip| ip.to_string()).unwrap_or_else(|| "unresolved".into());
            println!("{} restarted: {state} (endpoint {endpoint})", r.interface);
        }
        Command::List { json } => {
            let records = health::list(h, cfg);
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("no tunnels");
            } else {
                records.iter().for_each(print_record);
            }
        }
        Command::Status { port, json } => {
            let t = topology::derive(port)?;
            let record = health::probe_topology(h, cfg, &t);
            if json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                print_record(&record);
            }
        }
        Command::Proxy { action } => match action {
            ProxyAction::Start { port, uri, clients } => {
                let req = request(uri.as_deref(), clients.as_ref())?;
                let out = tunnel::proxy_start(h, cfg, port, req).with_context(|| format!("start proxy on {port}"))?;
                print_proxy(topology::derive(port)?.port, &out);
            }
            ProxyAction::Stop { port } => {
                let pids = tunnel::proxy_stop(h, cfg, port).with_context(|| format!("stop proxy on {port}"))?;
                if pids.is_empty() {
                    println!("no proxy was listening on {port}");
                } else {
                    println!("stopped pids {pids:?}");
                }
            }
            ProxyAction::Logs { port, lines } => {
                for l in tunnel::proxy_logs(cfg, port, lines)? {
                    println!("{l}");
                }
            }
        },
        Command::Debug { port, watch } => {
            let t = topology::derive(port)?;
            let (path, text) = debug::write(h, cfg, &t)?;
            print!("{text}");
            println!("saved to {}", path.display());
            if watch {
                diag::watch(h, &t, &cfg.kern_log)?;
            }
        }
        Command::Watch { port } => {
            let t = topology::derive(port)?;
            diag::watch(h, &t, &cfg.kern_log)?;
        }
    }
    Ok(())
}

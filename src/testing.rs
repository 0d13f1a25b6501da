//! In-memory stand-in for the machine: enough of `ip`, `iptables`, `wg`, `ss`
//! and `curl` for the engine's command vectors, plus process spawn/kill.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    net::Ipv4Addr,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::Mutex,
    time::Duration,
};

use crate::config::Config;
use crate::host::{Host, Sig};
use crate::shell::Capture;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Link {
    pub kind: String,
    pub up: bool,
    pub addrs: Vec<String>,
    pub peer: Option<String>,
    pub mtu: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Net {
    pub links: BTreeMap<String, Link>,
    /// table -> routes in insertion order
    pub routes: BTreeMap<String, Vec<String>>,
    pub rules: Vec<String>,
    /// (table, chain) -> rule specs
    pub iptables: BTreeMap<(String, String), Vec<String>>,
}

impl Net {
    pub fn chain(&self, table: &str, chain: &str) -> Vec<String> {
        self.iptables
            .get(&(table.to_string(), chain.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn rule_count(&self) -> usize {
        self.iptables.values().map(|v| v.len()).sum()
    }
}

/// Listeners whose namespace was deleted under them are re-tagged with this.
pub const DETACHED_NS: &str = "(deleted) ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener {
    pub ns: String,
    pub port: u16,
    pub pid: u32,
}

#[derive(Debug, Default)]
pub struct State {
    pub host: Net,
    pub namespaces: BTreeMap<String, Net>,
    pub handshakes: BTreeMap<String, u64>,
    pub wg_conf: BTreeMap<String, String>,
    pub listeners: Vec<Listener>,
    pub alive: BTreeSet<u32>,
    pub egress: Option<String>,
    pub dns: BTreeMap<String, Ipv4Addr>,
    /// A command whose joined argv contains one of these fails.
    pub fail: Vec<String>,
    /// Like `fail`, but each entry is consumed by its first match.
    pub fail_once: Vec<String>,
    pub calls: Vec<String>,
    pub spawned: Vec<Vec<String>>,
    pub signals: Vec<(u32, Sig)>,
    /// What a piped follower (`tail -F`, `dmesg -w`) prints before exiting.
    pub follower_output: String,
    pub listen_on_spawn: bool,
    pub handshake_on_up: bool,
    pub next_pid: u32,
    pub slept: Duration,
}

pub struct FakeHost {
    pub state: Mutex<State>,
}

type Out = (i32, String);

fn ok_out() -> Out {
    (0, String::new())
}

fn err(code: i32, msg: &str) -> Out {
    (code, format!("{msg}\n"))
}

impl FakeHost {
    pub fn new() -> Self {
        let st = State { listen_on_spawn: true, handshake_on_up: true, next_pid: 4000, ..State::default() };
        Self { state: Mutex::new(st) }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut st = self.state.lock().unwrap();
        f(&mut st)
    }

    pub fn fail_on(&self, pattern: &str) {
        self.with(|s| s.fail.push(pattern.to_string()));
    }

    pub fn fail_once_on(&self, pattern: &str) {
        self.with(|s| s.fail_once.push(pattern.to_string()));
    }

    pub fn has_ns(&self, ns: &str) -> bool {
        self.with(|s| s.namespaces.contains_key(ns))
    }

    pub fn host_net(&self) -> Net {
        self.with(|s| s.host.clone())
    }

    pub fn ns_net(&self, ns: &str) -> Option<Net> {
        self.with(|s| s.namespaces.get(ns).cloned())
    }

    /// Everything a lifecycle operation can change, for before/after comparison.
    pub fn snapshot(&self) -> (Net, BTreeMap<String, Net>) {
        self.with(|s| (s.host.clone(), s.namespaces.clone()))
    }

    pub fn calls_matching(&self, needle: &str) -> Vec<String> {
        self.with(|s| s.calls.iter().filter(|c| c.contains(needle)).cloned().collect())
    }

    /// Pretend a process is already bound to a port inside a namespace.
    pub fn add_listener(&self, ns: &str, port: u16) -> u32 {
        self.with(|s| {
            s.next_pid += 1;
            let pid = s.next_pid;
            s.listeners.push(Listener { ns: ns.to_string(), port, pid });
            s.alive.insert(pid);
            pid
        })
    }
}

/// Config rooted in `dir` with no settle delay.
pub fn test_config(dir: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.state_dir = dir.join("state");
    cfg.run_dir = dir.join("run");
    cfg.netns_etc_dir = dir.join("netns");
    cfg.kern_log = dir.join("kern.log");
    cfg.proxy.settle_ms = 0;
    cfg.proxy.bin = dir.join("xray-ns");
    cfg.probe.geo_enabled = false;
    cfg.public_host = Some("203.0.113.7".to_string());
    fs::write(&cfg.proxy.bin, b"#!/bin/sh\n").unwrap();
    cfg
}

pub const SAMPLE_WG: &str = "\
[Interface]
PrivateKey = aGVsbG8taGVsbG8taGVsbG8taGVsbG8taGVsbG8tISE=
Address = 10.8.0.2/32
DNS = 9.9.9.9
MTU = 1380
PostUp = iptables -A FORWARD -j ACCEPT

[Peer]
PublicKey = d29ybGQtd29ybGQtd29ybGQtd29ybGQtd29ybGQtISE=
AllowedIPs = 0.0.0.0/0
Endpoint = 198.51.100.20:51820
PersistentKeepalive = 25
";

impl Host for FakeHost {
    fn exec(&self, cmd: &str, args: &[&str], _capture: Capture) -> anyhow::Result<(i32, String)> {
        let mut st = self.state.lock().unwrap();
        let line = if args.is_empty() { cmd.to_string() } else { format!("{cmd} {}", args.join(" ")) };
        st.calls.push(line.clone());

        if st.fail.iter().any(|p| line.contains(p.as_str())) {
            return Ok(err(1, "injected failure"));
        }
        if let Some(i) = st.fail_once.iter().position(|p| line.contains(p.as_str())) {
            st.fail_once.remove(i);
            return Ok(err(1, "injected failure"));
        }

        Ok(dispatch(&mut st, None, cmd, args))
    }

    fn spawn_detached(&self, program: &str, args: &[&str], log_path: &Path) -> anyhow::Result<u32> {
        let mut st = self.state.lock().unwrap();
        let mut argv = vec![program.to_string()];
        argv.extend(args.iter().map(|s| s.to_string()));
        st.spawned.push(argv);

        st.next_pid += 1;
        let pid = st.next_pid;

        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let ns = match args {
            ["netns", "exec", ns, ..] => ns.to_string(),
            _ => String::new(),
        };
        if !st.namespaces.contains_key(&ns) {
            fs::write(log_path, format!("Cannot open network namespace \"{ns}\"\n"))?;
            return Ok(pid);
        }

        let port = args
            .iter()
            .position(|a| *a == "-c")
            .and_then(|i| args.get(i + 1))
            .and_then(|p| fs::read_to_string(p).ok())
            .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
            .and_then(|v| v["inbounds"][0]["port"].as_u64())
            .map(|p| p as u16);

        fs::write(log_path, "Xray started\n")?;
        if let (true, Some(port)) = (st.listen_on_spawn, port) {
            st.listeners.push(Listener { ns, port, pid });
            st.alive.insert(pid);
        }
        Ok(pid)
    }

    fn spawn_piped(&self, program: &str, args: &[&str]) -> anyhow::Result<Child> {
        let mut st = self.state.lock().unwrap();
        let line = format!("{program} {}", args.join(" "));
        st.calls.push(line.clone());
        if st.fail.iter().any(|p| line.contains(p.as_str())) {
            anyhow::bail!("spawn {program}: injected failure");
        }
        let child = Command::new("printf")
            .args(["%s", st.follower_output.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()?;
        Ok(child)
    }

    fn signal(&self, pid: u32, sig: Sig) -> bool {
        let mut st = self.state.lock().unwrap();
        st.signals.push((pid, sig));
        if !st.alive.remove(&pid) {
            return false;
        }
        st.listeners.retain(|l| l.pid != pid);
        true
    }

    fn alive(&self, pid: u32) -> bool {
        self.with(|s| s.alive.contains(&pid))
    }

    fn lookup_ipv4(&self, name: &str) -> Option<Ipv4Addr> {
        self.with(|s| s.dns.get(name).copied())
    }

    fn sleep(&self, d: Duration) {
        self.with(|s| s.slept += d);
    }
}

fn net_mut<'a>(st: &'a mut State, ns: &Option<String>) -> Option<&'a mut Net> {
    match ns {
        None => Some(&mut st.host),
        Some(n) => st.namespaces.get_mut(n),
    }
}

fn dispatch(st: &mut State, ns: Option<String>, cmd: &str, args: &[&str]) -> Out {
    match cmd {
        "ip" => ip(st, ns, args),
        "iptables" => iptables(st, ns, args),
        "wg" => wg(st, ns, args),
        "ss" => ss(st, ns),
        "curl" => match (&ns, &st.egress) {
            (Some(_), Some(ip)) => (0, format!("{ip}\n")),
            _ => err(28, ""),
        },
        "sysctl" => ok_out(),
        "getent" => match args.last().and_then(|h| st.dns.get(*h)) {
            Some(ip) => (0, format!("{ip}       STREAM host\n{ip}       DGRAM\n")),
            None => err(2, ""),
        },
        "dig" => ok_out(),
        _ => err(127, &format!("{cmd}: command not found")),
    }
}

fn ip(st: &mut State, mut ns: Option<String>, mut args: &[&str]) -> Out {
    let mut json = false;
    while let Some(first) = args.first() {
        match *first {
            "-j" => {
                json = true;
                args = &args[1..];
            }
            "-n" if args.len() > 1 => {
                ns = Some(args[1].to_string());
                args = &args[2..];
            }
            "-4" | "-6" | "-o" => args = &args[1..],
            _ => break,
        }
    }
    if let Some(n) = &ns {
        if !st.namespaces.contains_key(n) && args.first() != Some(&"netns") {
            return err(1, &format!("Cannot open network namespace \"{n}\": No such file or directory"));
        }
    }

    match args.first().copied() {
        Some("netns") => netns(st, &args[1..]),
        Some("link") => link(st, ns, &args[1..], json),
        Some("addr") | Some("address") => addr(st, ns, &args[1..]),
        Some("route") => route(st, ns, &args[1..]),
        Some("rule") => rule(st, ns, &args[1..]),
        _ => err(255, "Object unknown"),
    }
}

fn netns(st: &mut State, args: &[&str]) -> Out {
    match args {
        ["list"] | [] => {
            let mut out = String::new();
            for (i, n) in st.namespaces.keys().rev().enumerate() {
                out.push_str(&format!("{n} (id: {i})\n"));
            }
            (0, out)
        }
        ["add", name] => {
            if st.namespaces.contains_key(*name) {
                return err(1, &format!("Cannot create namespace file \"/run/netns/{name}\": File exists"));
            }
            let mut net = Net::default();
            net.links.insert("lo".into(), Link { kind: "loopback".into(), ..Link::default() });
            st.namespaces.insert(name.to_string(), net);
            ok_out()
        }
        ["delete", name] | ["del", name] => match st.namespaces.remove(*name) {
            None => err(1, &format!("Cannot remove namespace file \"/run/netns/{name}\": No such file or directory")),
            Some(net) => {
                for (ifname, l) in net.links {
                    if let Some(peer) = l.peer {
                        remove_anywhere(st, &peer);
                    }
                    st.handshakes.remove(&ifname);
                }
                // processes inside keep the old namespace alive, unnamed
                for l in st.listeners.iter_mut().filter(|l| l.ns == *name) {
                    l.ns = format!("{DETACHED_NS}{name}");
                }
                ok_out()
            }
        },
        ["exec", name, cmd, rest @ ..] => {
            if !st.namespaces.contains_key(*name) {
                return err(1, &format!("Cannot open network namespace \"{name}\": No such file or directory"));
            }
            dispatch(st, Some(name.to_string()), cmd, rest)
        }
        _ => err(255, "Command unknown"),
    }
}

fn remove_anywhere(st: &mut State, ifname: &str) {
    st.host.links.remove(ifname);
    for net in st.namespaces.values_mut() {
        net.links.remove(ifname);
    }
}

fn exists_anywhere(st: &State, ifname: &str) -> bool {
    st.host.links.contains_key(ifname) || st.namespaces.values().any(|n| n.links.contains_key(ifname))
}

fn strip_dev<'a>(args: &'a [&'a str]) -> &'a [&'a str] {
    match args.first() {
        Some(&"dev") => &args[1..],
        _ => args,
    }
}

fn link_json(name: &str, l: &Link) -> serde_json::Value {
    let mut flags: Vec<&str> = match l.kind.as_str() {
        "wireguard" => vec!["POINTOPOINT", "NOARP"],
        "loopback" => vec!["LOOPBACK"],
        _ => vec!["BROADCAST", "MULTICAST"],
    };
    let operstate = if l.up {
        flags.push("UP");
        flags.push("LOWER_UP");
        if l.kind == "veth" { "UP" } else { "UNKNOWN" }
    } else {
        "DOWN"
    };
    serde_json::json!({
        "ifname": name,
        "flags": flags,
        "mtu": l.mtu.unwrap_or(1500),
        "operstate": operstate,
        "linkinfo": { "info_kind": l.kind },
    })
}

fn link(st: &mut State, ns: Option<String>, args: &[&str], json: bool) -> Out {
    match args.first().copied() {
        Some("add") => {
            let rest = strip_dev(&args[1..]);
            match rest {
                [name, "type", "veth", "peer", "name", peer] => {
                    if exists_anywhere(st, name) || exists_anywhere(st, peer) {
                        return err(2, "RTNETLINK answers: File exists");
                    }
                    let Some(net) = net_mut(st, &ns) else { return err(1, "no namespace") };
                    net.links.insert(name.to_string(), Link { kind: "veth".into(), peer: Some(peer.to_string()), ..Link::default() });
                    net.links.insert(peer.to_string(), Link { kind: "veth".into(), peer: Some(name.to_string()), ..Link::default() });
                    ok_out()
                }
                [name, "type", kind] => {
                    if exists_anywhere(st, name) {
                        return err(2, "RTNETLINK answers: File exists");
                    }
                    let Some(net) = net_mut(st, &ns) else { return err(1, "no namespace") };
                    net.links.insert(name.to_string(), Link { kind: kind.to_string(), ..Link::default() });
                    ok_out()
                }
                _ => err(255, "bad link add"),
            }
        }
        Some("delete") | Some("del") => {
            let rest = strip_dev(&args[1..]);
            let Some(name) = rest.first() else { return err(255, "missing dev") };
            let Some(net) = net_mut(st, &ns) else { return err(1, "no namespace") };
            match net.links.remove(*name) {
                None => err(1, &format!("Cannot find device \"{name}\"")),
                Some(l) => {
                    if let Some(peer) = l.peer {
                        remove_anywhere(st, &peer);
                    }
                    st.handshakes.remove(*name);
                    ok_out()
                }
            }
        }
        Some("set") => {
            let rest = strip_dev(&args[1..]);
            let Some((name, ops)) = rest.split_first() else { return err(255, "missing dev") };
            let name = name.to_string();
            let handshake_on_up = st.handshake_on_up;
            let Some(net) = net_mut(st, &ns) else { return err(1, "no namespace") };
            if !net.links.contains_key(&name) {
                return err(1, &format!("Cannot find device \"{name}\""));
            }
            let mut i = 0;
            while i < ops.len() {
                match ops[i] {
                    "up" | "down" => {
                        let up = ops[i] == "up";
                        let net = net_mut(st, &ns).unwrap();
                        let l = net.links.get_mut(&name).unwrap();
                        l.up = up;
                        let is_wg = l.kind == "wireguard";
                        if is_wg && up && handshake_on_up {
                            st.handshakes.insert(name.clone(), 1_760_000_000);
                        }
                        if is_wg && !up {
                            st.handshakes.remove(&name);
                        }
                        i += 1;
                    }
                    "mtu" => {
                        let v = ops.get(i + 1).and_then(|s| s.parse().ok());
                        let net = net_mut(st, &ns).unwrap();
                        net.links.get_mut(&name).unwrap().mtu = v;
                        i += 2;
                    }
                    "netns" => {
                        let Some(target) = ops.get(i + 1).map(|s| s.to_string()) else { return err(255, "missing netns") };
                        if !st.namespaces.contains_key(&target) {
                            return err(1, &format!("Invalid \"netns\" value \"{target}\""));
                        }
                        let l = net_mut(st, &ns).unwrap().links.remove(&name).unwrap();
                        st.namespaces.get_mut(&target).unwrap().links.insert(name.clone(), l);
                        i += 2;
                    }
                    other => return err(255, &format!("unknown link op {other}")),
                }
            }
            ok_out()
        }
        Some("show") | Some("list") | None => {
            let Some(net) = net_mut(st, &ns) else { return err(1, "no namespace") };
            let rest = if args.is_empty() { &args[..] } else { &args[1..] };
            let selected: Vec<(String, Link)> = match rest {
                ["dev", name] | [name] if *name != "type" => match net.links.get(*name) {
                    Some(l) => vec![(name.to_string(), l.clone())],
                    None => return err(1, &format!("Device \"{name}\" does not exist.")),
                },
                ["type", kind] => net
                    .links
                    .iter()
                    .filter(|(_, l)| l.kind == *kind)
                    .map(|(n, l)| (n.clone(), l.clone()))
                    .collect(),
                _ => net.links.iter().map(|(n, l)| (n.clone(), l.clone())).collect(),
            };
            if json {
                let v: Vec<serde_json::Value> = selected.iter().map(|(n, l)| link_json(n, l)).collect();
                (0, serde_json::to_string(&v).unwrap())
            } else {
                let mut out = String::new();
                for (i, (n, l)) in selected.iter().enumerate() {
                    let state = if l.up { "UP" } else { "DOWN" };
                    out.push_str(&format!("{}: {n}: <> mtu {} state {state}\n", i + 1, l.mtu.unwrap_or(1500)));
                }
                (0, out)
            }
        }
        _ => err(255, "bad link command"),
    }
}

fn addr(st: &mut State, ns: Option<String>, args: &[&str]) -> Out {
    let Some(net) = net_mut(st, &ns) else { return err(1, "no namespace") };
    match args {
        ["flush", "dev", name] => match net.links.get_mut(*name) {
            Some(l) => {
                l.addrs.clear();
                ok_out()
            }
            None => err(1, &format!("Device \"{name}\" does not exist.")),
        },
        ["add", cidr, "dev", name] => match net.links.get_mut(*name) {
            Some(l) => {
                if l.addrs.iter().any(|a| a == cidr) {
                    return err(2, "RTNETLINK answers: File exists");
                }
                l.addrs.push(cidr.to_string());
                ok_out()
            }
            None => err(1, &format!("Cannot find device \"{name}\"")),
        },
        [] | ["show", ..] => {
            let rest = args.get(1..).unwrap_or(&[]);
            let mut out = String::new();
            for (n, l) in &net.links {
                if let ["dev", want] | [want] = rest {
                    if n.as_str() != *want {
                        continue;
                    }
                }
                out.push_str(&format!("{n}:\n"));
                for a in &l.addrs {
                    out.push_str(&format!("    inet {a} scope global {n}\n"));
                }
            }
            (0, out)
        }
        _ => err(255, "bad addr command"),
    }
}

fn split_table<'a>(args: &[&'a str]) -> (Vec<&'a str>, String) {
    let mut spec = Vec::new();
    let mut table = "main".to_string();
    let mut i = 0;
    while i < args.len() {
        if args[i] == "table" && i + 1 < args.len() {
            table = args[i + 1].to_string();
            i += 2;
        } else {
            spec.push(args[i]);
            i += 1;
        }
    }
    (spec, table)
}

fn route(st: &mut State, ns: Option<String>, args: &[&str]) -> Out {
    let Some(net) = net_mut(st, &ns) else { return err(1, "no namespace") };
    match args.first().copied() {
        Some(op @ ("add" | "replace")) => {
            let (spec, table) = split_table(&args[1..]);
            if let Some(i) = spec.iter().position(|t| *t == "dev") {
                let dev = spec.get(i + 1).copied().unwrap_or("");
                if !net.links.contains_key(dev) {
                    return err(1, &format!("Cannot find device \"{dev}\""));
                }
            }
            let line = spec.join(" ");
            let dest = spec.first().copied().unwrap_or("").to_string();
            let routes = net.routes.entry(table).or_default();
            let same_dest = routes.iter().position(|r| r.split_whitespace().next() == Some(dest.as_str()));
            match (op, same_dest) {
                ("add", Some(_)) => err(2, "RTNETLINK answers: File exists"),
                ("replace", Some(i)) => {
                    routes[i] = line;
                    ok_out()
                }
                _ => {
                    routes.push(line);
                    ok_out()
                }
            }
        }
        Some("flush") => {
            let (_, table) = split_table(&args[1..]);
            net.routes.remove(&table);
            ok_out()
        }
        Some("show") | Some("list") | None => {
            let (_, table) = split_table(args.get(1..).unwrap_or(&[]));
            let lines = net.routes.get(&table).cloned().unwrap_or_default();
            (0, lines.iter().map(|l| format!("{l}\n")).collect())
        }
        Some("get") => (0, "8.8.8.8 dev wg src 10.8.0.2\n".to_string()),
        _ => err(255, "bad route command"),
    }
}

fn rule(st: &mut State, ns: Option<String>, args: &[&str]) -> Out {
    let Some(net) = net_mut(st, &ns) else { return err(1, "no namespace") };
    match args.first().copied() {
        Some("add") => {
            net.rules.push(args[1..].join(" "));
            ok_out()
        }
        Some("del") | Some("delete") => {
            let spec = args[1..].join(" ");
            match net.rules.iter().position(|r| *r == spec) {
                Some(i) => {
                    net.rules.remove(i);
                    ok_out()
                }
                None => err(2, "RTNETLINK answers: No such file or directory"),
            }
        }
        Some("show") | Some("list") | None => {
            let mut out = String::from("0:\tfrom all lookup local\n");
            for r in &net.rules {
                out.push_str(&format!("32765:\tfrom all {r}\n"));
            }
            (0, out)
        }
        _ => err(255, "bad rule command"),
    }
}

fn iptables(st: &mut State, ns: Option<String>, args: &[&str]) -> Out {
    let Some(net) = net_mut(st, &ns) else { return err(1, "no namespace") };
    let mut table = "filter".to_string();
    let mut rest: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i] {
            "-w" => i += 1,
            "-t" if i + 1 < args.len() => {
                table = args[i + 1].to_string();
                i += 2;
            }
            a => {
                rest.push(a);
                i += 1;
            }
        }
    }
    let Some((op, rest)) = rest.split_first() else { return err(2, "no command") };
    let chain = rest.first().copied().unwrap_or("").to_string();
    let after_chain = if rest.is_empty() { &rest[..] } else { &rest[1..] };
    let key = (table.clone(), chain.clone());
    match *op {
        "-A" => {
            net.iptables.entry(key).or_default().push(after_chain.join(" "));
            ok_out()
        }
        "-I" => {
            let (pos, spec) = match after_chain.first().and_then(|p| p.parse::<usize>().ok()) {
                Some(p) => (p.max(1) - 1, &after_chain[1..]),
                None => (0, after_chain),
            };
            let v = net.iptables.entry(key).or_default();
            let pos = pos.min(v.len());
            v.insert(pos, spec.join(" "));
            ok_out()
        }
        "-D" => {
            let spec = after_chain.join(" ");
            let bad = || err(1, "iptables: Bad rule (does a matching rule exist in that chain?).");
            let Some(v) = net.iptables.get_mut(&key) else { return bad() };
            let Some(idx) = v.iter().position(|r| *r == spec) else { return bad() };
            v.remove(idx);
            if v.is_empty() {
                net.iptables.remove(&key);
            }
            ok_out()
        }
        "-S" => {
            let mut out = String::new();
            for ((t, c), rules) in &net.iptables {
                if *t != table || (!chain.is_empty() && *c != chain) {
                    continue;
                }
                for r in rules {
                    out.push_str(&format!("-A {c} {r}\n"));
                }
            }
            (0, out)
        }
        "-L" | "-nL" => {
            let mut out = String::new();
            for ((t, c), rules) in &net.iptables {
                if *t != table || (!chain.is_empty() && !chain.starts_with('-') && *c != chain) {
                    continue;
                }
                out.push_str(&format!("Chain {c}\n"));
                for r in rules {
                    out.push_str(&format!("    {r}\n"));
                }
            }
            (0, out)
        }
        _ => err(2, &format!("unknown option {op}")),
    }
}

fn wg(st: &mut State, ns: Option<String>, args: &[&str]) -> Out {
    let handshakes = st.handshakes.clone();
    let confs = st.wg_conf.clone();
    let Some(net) = net_mut(st, &ns) else { return err(1, "no namespace") };
    let is_wg = |n: &Net, name: &str| n.links.get(name).map(|l| l.kind == "wireguard").unwrap_or(false);
    match args {
        ["setconf", name, path] => {
            if !is_wg(net, name) {
                return err(1, "Unable to modify interface: No such device");
            }
            match fs::read_to_string(PathBuf::from(path)) {
                Ok(text) => {
                    st.wg_conf.insert(name.to_string(), text);
                    ok_out()
                }
                Err(_) => err(1, &format!("fopen: {path}: No such file or directory")),
            }
        }
        ["show", "interfaces"] => {
            let names: Vec<&str> = net
                .links
                .iter()
                .filter(|(_, l)| l.kind == "wireguard")
                .map(|(n, _)| n.as_str())
                .collect();
            (0, format!("{}\n", names.join(" ")))
        }
        ["show", name, "latest-handshakes"] => {
            if !is_wg(net, name) {
                return err(1, "Unable to access interface: No such device");
            }
            let ts = handshakes.get(*name).copied().unwrap_or(0);
            (0, format!("d29ybGQtd29ybGQtd29ybGQtd29ybGQtd29ybGQtISE=\t{ts}\n"))
        }
        ["show", name] => {
            if !is_wg(net, name) {
                return err(1, "Unable to access interface: No such device");
            }
            let mut out = format!("interface: {name}\n  listening port: 40000\n");
            if handshakes.contains_key(*name) {
                out.push_str("  latest handshake: 5 seconds ago\n");
            }
            (0, out)
        }
        ["showconf", name] => match confs.get(*name) {
            Some(c) if is_wg(net, name) => (0, c.clone()),
            _ => err(1, "Unable to access interface: No such device"),
        },
        _ => err(1, "Invalid subcommand"),
    }
}

fn ss(st: &State, ns: Option<String>) -> Out {
    let ns = ns.unwrap_or_default();
    let mut out = String::new();
    for l in st.listeners.iter().filter(|l| l.ns == ns) {
        out.push_str(&format!(
            "LISTEN 0      4096         0.0.0.0:{}      0.0.0.0:*    users:((\"xray-ns\",pid={},fd=3))\n",
            l.port, l.pid
        ));
    }
    (0, out)
}

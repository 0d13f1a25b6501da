//! Kernel-log tracing of a port's traffic: LOG copies of the DNAT and FORWARD
//! rules plus a foreground follower of the kernel log.

use anyhow::{Context, Result};
use log::{info, warn};
use std::{
    io::{BufRead, BufReader, Write},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError},
        Arc,
    },
    thread,
    time::Duration,
};

use super::{install, remove, Rule};
use crate::error::CommandError;
use crate::host::Host;
use crate::topology::Topology;

const POLL: Duration = Duration::from_millis(200);

pub fn prefixes(port: u16) -> [String; 3] {
    [format!("[DNAT-{port}] "), format!("[FWD-{port}] "), format!("[RET-{port}] ")]
}

pub fn log_rules(t: &Topology) -> Vec<Rule> {
    let port = t.port.to_string();
    let ip = format!("{}/32", t.ns_ip);
    let [dnat, fwd, ret] = prefixes(t.port);
    let mut v = Vec::with_capacity(6);
    for p in ["tcp", "udp"] {
        let log = |prefix: &str| ["-j", "LOG", "--log-prefix", prefix, "--log-level", "4"].map(String::from);
        let mut r = Rule::host("nat", "PREROUTING", &["-p", p, "--dport", &port]).at(1);
        r.spec.extend(log(&dnat));
        v.push(r);
        let mut r = Rule::host("filter", "FORWARD", &["-p", p, "-d", &ip, "--dport", &port]).at(1);
        r.spec.extend(log(&fwd));
        v.push(r);
        let mut r = Rule::host("filter", "FORWARD", &["-p", p, "-i", &t.host_veth, "-s", &ip]).at(1);
        r.spec.extend(log(&ret));
        v.push(r);
    }
    v
}

/// Removes the port's LOG rules when dropped, whatever the exit path.
pub struct LogRules<'a> {
    h: &'a dyn Host,
    rules: Vec<Rule>,
}

impl<'a> LogRules<'a> {
    pub fn install(h: &'a dyn Host, t: &Topology) -> Result<Self, CommandError> {
        let mut guard = Self { h, rules: Vec::new() };
        for r in log_rules(t) {
            install(h, &r)?;
            guard.rules.push(r);
        }
        info!("diagnostic LOG rules installed for port {}", t.port);
        Ok(guard)
    }
}

impl Drop for LogRules<'_> {
    fn drop(&mut self) {
        let n: usize = self.rules.iter().map(|r| remove(self.h, r)).sum();
        info!("diagnostic LOG rules removed ({n})");
    }
}

/// Delete LOG rules a previous watch may have left behind.
pub fn remove_log_rules(h: &dyn Host, t: &Topology) -> usize {
    log_rules(t).iter().map(|r| remove(h, r)).sum()
}

fn is_match(line: &str, tags: &[String]) -> bool {
    tags.iter().any(|t| line.contains(t.trim_end()))
}

/// Copy matching lines from `rx` to `out` until `stop` is set or the sender
/// goes away. Returns the number of lines printed.
fn pump(rx: &Receiver<String>, port: u16, out: &mut dyn Write, stop: &AtomicBool) -> Result<usize> {
    let tags = prefixes(port);
    let mut printed = 0;
    while !stop.load(Ordering::Relaxed) {
        match rx.recv_timeout(POLL) {
            Ok(line) => {
                if is_match(&line, &tags) {
                    writeln!(out, "{line}")?;
                    out.flush()?;
                    printed += 1;
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    Ok(printed)
}

/// Trace the port's traffic in the foreground until Ctrl-C/SIGTERM or the
/// log follower exits. LOG rules and the follower never outlive this call.
pub fn watch(h: &dyn Host, t: &Topology, kern_log: &Path) -> Result<()> {
    let stop = Arc::new(AtomicBool::new(false));
    let sig_ids = [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM]
        .into_iter()
        .map(|s| signal_hook::flag::register(s, Arc::clone(&stop)))
        .collect::<std::io::Result<Vec<_>>>()
        .context("install signal handlers")?;

    let result = (|| -> Result<()> {
        let _rules = LogRules::install(h, t).context("install LOG rules")?;

        let kern = kern_log.to_string_lossy();
        let mut child = if kern_log.exists() {
            h.spawn_piped("tail", &["-n", "0", "-F", &kern])?
        } else {
            warn!("{} not found, following dmesg", kern_log.display());
            h.spawn_piped("dmesg", &["-w"])?
        };

        let (tx, rx) = mpsc::channel();
        if let Some(stdout) = child.stdout.take() {
            thread::spawn(move || {
                for line in BufReader::new(stdout).lines().map_while(|l| l.ok()) {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            });
        }

        println!("watching port {} (Ctrl-C to stop)", t.port);
        let pumped = pump(&rx, t.port, &mut std::io::stdout().lock(), &stop);

        let _ = child.kill();
        let _ = child.wait();
        info!("log follower stopped after {} lines", pumped.as_ref().copied().unwrap_or(0));
        pumped.map(|_| ())
    })();

    for id in sig_ids {
        signal_hook::low_level::unregister(id);
    }
    result
}

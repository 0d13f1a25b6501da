use std::collections::BTreeSet;

use crate::host::{self, Host};

/// One listening TCP socket from `ss -H -ltnp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listener {
    pub port: u16,
    pub pids: Vec<u32>,
}

fn parse_line(line: &str) -> Option<Listener> {
    let mut cols = line.split_whitespace();
    let state = cols.next()?;
    if state != "LISTEN" {
        return None;
    }
    // Recv-Q, Send-Q, then the local address
    let local = cols.nth(2)?;
    let port = local.rsplit_once(':')?.1.parse().ok()?;

    let mut pids = Vec::new();
    let mut rest = line;
    while let Some(i) = rest.find("pid=") {
        rest = &rest[i + 4..];
        let end = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if let Ok(p) = rest[..end].parse::<u32>() {
            pids.push(p);
        }
    }
    Some(Listener { port, pids })
}

pub fn parse(out: &str) -> Vec<Listener> {
    out.lines().filter_map(parse_line).collect()
}

/// Listening TCP sockets inside the namespace; empty if `ss` fails.
pub fn listeners(h: &dyn Host, ns: &str) -> Vec<Listener> {
    host::stdout_in(h, ns, "ss", &["-H", "-ltnp"]).map(|o| parse(&o)).unwrap_or_default()
}

pub fn is_listening(h: &dyn Host, ns: &str, port: u16) -> bool {
    listeners(h, ns).iter().any(|l| l.port == port)
}

/// Processes owning a listening socket on `port` inside the namespace.
pub fn pids_on_port(h: &dyn Host, ns: &str, port: u16) -> Vec<u32> {
    let set: BTreeSet<u32> = listeners(h, ns)
        .into_iter()
        .filter(|l| l.port == port)
        .flat_map(|l| l.pids)
        .filter(|p| *p > 1)
        .collect();
    set.into_iter().collect()
}

//! The seam between the engine and the machine it mutates.
//!
//! Every namespace, link, route and firewall change goes through [`Host`] as an
//! argument vector. Nothing here builds shell command lines.

use log::debug;
use std::{
    net::{Ipv4Addr, SocketAddr, ToSocketAddrs},
    path::Path,
    process::Child,
    time::Duration,
};

use crate::error::CommandError;
use crate::shell::{self, Capture};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sig {
    Term,
    Kill,
}

impl Sig {
    fn raw(self) -> libc::c_int {
        match self {
            Sig::Term => libc::SIGTERM,
            Sig::Kill => libc::SIGKILL,
        }
    }
}

pub trait Host: Send + Sync {
    /// Run to completion; `Err` only when the program could not be run.
    fn exec(&self, cmd: &str, args: &[&str], capture: Capture) -> anyhow::Result<(i32, String)>;

    fn spawn_detached(&self, program: &str, args: &[&str], log_path: &Path) -> anyhow::Result<u32>;

    /// Foreground child with its stdout piped back to us.
    fn spawn_piped(&self, program: &str, args: &[&str]) -> anyhow::Result<Child>;

    fn signal(&self, pid: u32, sig: Sig) -> bool;

    fn alive(&self, pid: u32) -> bool;

    /// System resolver (getaddrinfo), IPv4 answers only.
    fn lookup_ipv4(&self, name: &str) -> Option<Ipv4Addr>;

    fn sleep(&self, d: Duration);
}

/// The real machine.
pub struct SystemHost {
    pub timeout: Duration,
}

impl Default for SystemHost {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(15) }
    }
}

impl Host for SystemHost {
    fn exec(&self, cmd: &str, args: &[&str], capture: Capture) -> anyhow::Result<(i32, String)> {
        shell::run_timeout(cmd, args, capture, self.timeout)
    }

    fn spawn_detached(&self, program: &str, args: &[&str], log_path: &Path) -> anyhow::Result<u32> {
        shell::spawn_detached(program, args, log_path)
    }

    fn spawn_piped(&self, program: &str, args: &[&str]) -> anyhow::Result<Child> {
        shell::spawn_piped(program, args)
    }

    fn signal(&self, pid: u32, sig: Sig) -> bool {
        shell::signal(pid, sig.raw())
    }

    fn alive(&self, pid: u32) -> bool {
        shell::pid_alive(pid)
    }

    fn lookup_ipv4(&self, name: &str) -> Option<Ipv4Addr> {
        let addrs = (name, 0u16).to_socket_addrs().ok()?;
        addrs
            .filter_map(|a| match a {
                SocketAddr::V4(v4) => Some(*v4.ip()),
                SocketAddr::V6(_) => None,
            })
            .next()
    }

    fn sleep(&self, d: Duration) {
        std::thread::sleep(d);
    }
}

fn describe(cmd: &str, args: &[&str]) -> String {
    if args.is_empty() {
        cmd.to_string()
    } else {
        format!("{cmd} {}", args.join(" "))
    }
}

/// Run and require exit code 0; returns combined output.
pub fn ok(h: &dyn Host, cmd: &str, args: &[&str]) -> Result<String, CommandError> {
    match h.exec(cmd, args, Capture::Both) {
        Ok((0, out)) => Ok(out),
        Ok((code, output)) => Err(CommandError { cmd: describe(cmd, args), code, output }),
        Err(e) => Err(CommandError { cmd: describe(cmd, args), code: -1, output: format!("{e:#}") }),
    }
}

/// Best-effort: failures (including "not found") are logged at debug level only.
pub fn quiet(h: &dyn Host, cmd: &str, args: &[&str]) -> bool {
    match ok(h, cmd, args) {
        Ok(_) => true,
        Err(e) => {
            debug!("ignored: {e}");
            false
        }
    }
}

/// Stdout of a successful run, `None` otherwise.
pub fn stdout(h: &dyn Host, cmd: &str, args: &[&str]) -> Option<String> {
    match h.exec(cmd, args, Capture::Stdout) {
        Ok((0, out)) => Some(out),
        Ok((code, _)) => {
            debug!("{} exited {code}", describe(cmd, args));
            None
        }
        Err(e) => {
            debug!("{}: {e:#}", describe(cmd, args));
            None
        }
    }
}

/// Combined output regardless of exit status; used by reports.
pub fn output(h: &dyn Host, cmd: &str, args: &[&str]) -> String {
    match h.exec(cmd, args, Capture::Both) {
        Ok((_, out)) => out,
        Err(e) => format!("{e:#}\n"),
    }
}

/// `ip netns exec <ns> <cmd> <args...>` as an argument vector for `ip`.
pub fn in_ns<'a>(ns: &'a str, cmd: &'a str, args: &[&'a str]) -> Vec<&'a str> {
    let mut v = Vec::with_capacity(args.len() + 4);
    v.extend_from_slice(&["netns", "exec", ns, cmd]);
    v.extend_from_slice(args);
    v
}

pub fn stdout_in(h: &dyn Host, ns: &str, cmd: &str, args: &[&str]) -> Option<String> {
    stdout(h, "ip", &in_ns(ns, cmd, args))
}

pub fn output_in(h: &dyn Host, ns: &str, cmd: &str, args: &[&str]) -> String {
    output(h, "ip", &in_ns(ns, cmd, args))
}

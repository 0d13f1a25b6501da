//! Idempotent iptables rule management, on the host or inside a namespace.
//!
//! A rule is described once as data; install/remove/exists all derive their
//! argument vectors from it so add and delete can never drift apart.

pub mod diag;
pub mod forward;

use log::{debug, info};

use crate::error::CommandError;
use crate::host::{self, Host};

/// Upper bound on delete passes; a chain holding more copies than this is
/// not something we created.
const MAX_COPIES: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    /// `None` is the host's tables.
    pub ns: Option<String>,
    pub table: &'static str,
    pub chain: &'static str,
    /// Insert at this 1-based position instead of appending.
    pub position: Option<u32>,
    pub spec: Vec<String>,
}

impl Rule {
    pub fn host(table: &'static str, chain: &'static str, spec: &[&str]) -> Self {
        Self {
            ns: None,
            table,
            chain,
            position: None,
            spec: spec.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn in_ns(ns: &str, table: &'static str, chain: &'static str, spec: &[&str]) -> Self {
        Self { ns: Some(ns.to_string()), ..Self::host(table, chain, spec) }
    }

    pub fn at(mut self, position: u32) -> Self {
        self.position = Some(position);
        self
    }

    fn argv(&self, op: &str) -> Vec<String> {
        let mut v: Vec<String> = Vec::with_capacity(self.spec.len() + 10);
        if let Some(ns) = &self.ns {
            v.extend(["netns", "exec", ns.as_str(), "iptables"].map(String::from));
        }
        v.extend(["-w", "-t", self.table, op, self.chain].map(String::from));
        if op == "-I" {
            if let Some(p) = self.position {
                v.push(p.to_string());
            }
        }
        v.extend(self.spec.iter().cloned());
        v
    }

    fn run(&self, h: &dyn Host, op: &str) -> Result<String, CommandError> {
        let argv = self.argv(op);
        let args: Vec<&str> = argv.iter().map(String::as_str).collect();
        let cmd = if self.ns.is_some() { "ip" } else { "iptables" };
        host::ok(h, cmd, &args)
    }

    pub fn describe(&self) -> String {
        let scope = self.ns.as_deref().unwrap_or("host");
        format!("[{scope}] -t {} {} {}", self.table, self.chain, self.spec.join(" "))
    }
}

/// Delete every copy of `rule`; returns how many were removed.
pub fn remove(h: &dyn Host, rule: &Rule) -> usize {
    let mut removed = 0;
    while removed < MAX_COPIES {
        match rule.run(h, "-D") {
            Ok(_) => removed += 1,
            Err(e) => {
                if removed == 0 {
                    debug!("not present: {} ({e})", rule.describe());
                }
                break;
            }
        }
    }
    removed
}

/// Remove any copies, then add exactly one.
pub fn install(h: &dyn Host, rule: &Rule) -> Result<(), CommandError> {
    let stale = remove(h, rule);
    if stale > 0 {
        debug!("removed {stale} stale copies of {}", rule.describe());
    }
    let op = if rule.position.is_some() { "-I" } else { "-A" };
    rule.run(h, op)?;
    info!("iptables: {}", rule.describe());
    Ok(())
}

pub fn install_all(h: &dyn Host, rules: &[Rule]) -> Result<(), CommandError> {
    for r in rules {
        install(h, r)?;
    }
    Ok(())
}

pub fn remove_all(h: &dyn Host, rules: &[Rule]) -> usize {
    rules.iter().map(|r| remove(h, r)).sum()
}

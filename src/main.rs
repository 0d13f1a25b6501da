mod cli;
mod config;
mod debug;
mod error;
mod health;
mod host;
mod iptables;
mod lock;
mod logging;
mod netns;
mod programs;
mod routing;
mod shell;
mod sockets;
mod topology;
mod tunnel;
mod vless;
mod wireguard;

#[cfg(test)]
mod testing;

use anyhow::Result;
use clap::Parser;
use log::debug;

/// Namespaces, links and netfilter all need CAP_NET_ADMIN; require root outright.
fn require_root(euid: libc::uid_t) -> Result<()> {
    if euid != 0 {
        anyhow::bail!("root privileges are required");
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = cli::Args::parse();
    require_root(unsafe { libc::geteuid() })?;

    let cfg = config::Config::load_or_default(args.config.as_deref())?;
    logging::init(&cfg, args.log_level.as_deref())?;
    debug!("config: {cfg:?}");

    cli::dispatch(&host::SystemHost::default(), &cfg, args.command)
}

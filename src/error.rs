use std::fmt;

use thiserror::Error;

/// A command that ran but did not exit 0 (or could not be run at all).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandError {
    pub cmd: String,
    pub code: i32,
    pub output: String,
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let out = self.output.trim();
        if out.is_empty() {
            write!(f, "`{}` exited with {}", self.cmd, self.code)
        } else {
            write!(f, "`{}` exited with {}: {}", self.cmd, self.code, out)
        }
    }
}

impl std::error::Error for CommandError {}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("port {0} is outside 1..=65535")]
    PortOutOfRange(u32),
    #[error("invalid client id in identity list: {0}")]
    InvalidClientId(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty connection URI")]
    Empty,
    #[error("unsupported transport '{0}' (only tcp)")]
    UnsupportedTransport(String),
    #[error("invalid identity '{0}' (expected xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx)")]
    InvalidIdentity(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("tunnel config has no Endpoint")]
    MissingEndpoint,
    #[error("could not resolve endpoint host '{0}' to an IPv4 address")]
    EndpointUnresolvable(String),
}

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("failed to create namespace {namespace} after one retry: {source}")]
    NamespaceCreateFailed {
        namespace: String,
        #[source]
        source: CommandError,
    },
    #[error("{step} failed: {source}")]
    Step {
        step: &'static str,
        #[source]
        source: CommandError,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    #[error("{step} failed: {source}")]
    Step {
        step: &'static str,
        #[source]
        source: CommandError,
    },
    #[error("{step} failed: {source}")]
    Io {
        step: &'static str,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("proxy binary not found: {0}")]
    BinaryMissing(String),
    #[error("write proxy config {path}: {source}")]
    WriteConfig {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("launch proxy in {namespace}: {reason}")]
    Launch { namespace: String, reason: String },
    #[error("namespace {0} does not exist")]
    NoNamespace(String),
}

/// Top-level error of a lifecycle operation; the variant names the stage.
#[derive(Debug, Error)]
pub enum Error {
    #[error("validation: {0}")]
    Validation(#[from] ValidationError),
    #[error("connection URI: {0}")]
    Parse(#[from] ParseError),
    #[error("endpoint: {0}")]
    Resolution(#[from] ResolutionError),
    #[error("provision: {0}")]
    Provision(#[from] ProvisionError),
    #[error("tunnel config: {0}")]
    Config(#[from] ConfigError),
    #[error("routing: {0}")]
    Routing(CommandError),
    #[error("firewall: {0}")]
    Firewall(CommandError),
    #[error("proxy: {0}")]
    Process(#[from] ProcessError),
    #[error("lock port {port}: {reason}")]
    Lock { port: u16, reason: String },
    #[error("no tunnel on port {0}")]
    NoTunnel(u16),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

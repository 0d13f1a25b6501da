use anyhow::{Context, Result as AnyResult};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::Path,
};
use uuid::Uuid;

use super::{tail_lines, terminate};
use crate::config::Config;
use crate::error::{ParseError, ProcessError, ValidationError};
use crate::host::Host;
use crate::netns;
use crate::sockets;
use crate::vless::{self, HeaderObfuscation, Identity, Security, Transport};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDocument {
    pub log: LogSection,
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSection {
    pub loglevel: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inbound {
    pub listen: String,
    pub port: u16,
    pub protocol: String,
    pub settings: InboundSettings,
    pub stream_settings: StreamSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundSettings {
    pub clients: Vec<Client>,
    pub decryption: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: String,
    #[serde(default)]
    pub flow: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    pub network: String,
    pub security: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_settings: Option<TcpSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpSettings {
    pub header: TcpHeader,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpHeader {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<HttpRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpRequest {
    pub version: String,
    pub method: String,
    pub path: Vec<String>,
    pub headers: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outbound {
    pub protocol: String,
    pub tag: String,
}

fn tcp_settings(h: &HeaderObfuscation) -> TcpSettings {
    TcpSettings {
        header: TcpHeader {
            kind: HeaderObfuscation::KIND.to_string(),
            request: Some(HttpRequest {
                version: "1.1".to_string(),
                method: "GET".to_string(),
                path: vec![h.path.clone()],
                headers: BTreeMap::from([("Host".to_string(), vec![h.host_header.clone()])]),
            }),
        },
    }
}

/// One VLESS inbound on `0.0.0.0:listen_port` and a direct outbound,
/// admitting `extra` client ids after the identity's own.
pub fn render(identity: &Identity, listen_port: u16, extra: &[Uuid]) -> ConfigDocument {
    let mut ids = vec![identity.client_id];
    for id in extra {
        if !ids.contains(id) {
            ids.push(*id);
        }
    }
    ConfigDocument {
        log: LogSection { loglevel: "warning".to_string() },
        inbounds: vec![Inbound {
            listen: "0.0.0.0".to_string(),
            port: listen_port,
            protocol: "vless".to_string(),
            settings: InboundSettings {
                clients: ids.iter().map(|id| Client { id: id.to_string(), flow: String::new() }).collect(),
                decryption: "none".to_string(),
            },
            stream_settings: StreamSettings {
                network: Transport::Tcp.to_string(),
                security: identity.security.as_str().to_string(),
                tcp_settings: identity.header.as_ref().map(tcp_settings),
            },
        }],
        outbounds: vec![Outbound { protocol: "freedom".to_string(), tag: "direct".to_string() }],
    }
}

impl ConfigDocument {
    pub fn clients(&self) -> Vec<Uuid> {
        self.inbounds
            .iter()
            .flat_map(|i| i.settings.clients.iter())
            .filter_map(|c| vless::parse_client_id(&c.id))
            .collect()
    }

    /// The identity this document was rendered from (its first client).
    pub fn identity(&self) -> Result<Identity, ParseError> {
        let inbound = self.inbounds.first().ok_or(ParseError::Empty)?;
        let first = inbound.settings.clients.first().ok_or(ParseError::Empty)?;
        let client_id = vless::parse_client_id(&first.id).ok_or_else(|| ParseError::InvalidIdentity(first.id.clone()))?;

        let ss = &inbound.stream_settings;
        if ss.network != "tcp" {
            return Err(ParseError::UnsupportedTransport(ss.network.clone()));
        }
        let security = if ss.security.is_empty() || ss.security == "none" {
            Security::None
        } else {
            Security::Other(ss.security.clone())
        };
        let header = ss
            .tcp_settings
            .as_ref()
            .filter(|t| t.header.kind == HeaderObfuscation::KIND)
            .and_then(|t| t.header.request.as_ref())
            .map(|r| HeaderObfuscation {
                host_header: r.headers.get("Host").and_then(|v| v.first()).cloned().unwrap_or_default(),
                path: r.path.first().cloned().unwrap_or_else(|| "/".to_string()),
            });

        Ok(Identity { client_id, transport: Transport::Tcp, security, header })
    }

    pub fn write(&self, path: &Path) -> Result<(), ProcessError> {
        let err = |source| ProcessError::WriteConfig { path: path.display().to_string(), source };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(err)?;
        }
        let mut text = serde_json::to_string_pretty(self).map_err(|e| err(e.into()))?;
        text.push('\n');
        fs::write(path, text).map_err(err)
    }

    pub fn load(path: &Path) -> AnyResult<Self> {
        let s = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        serde_json::from_str(&s).with_context(|| format!("parse json {}", path.display()))
    }
}

/// Client ids supplied from outside, one per line; `#` comments and blanks skipped.
pub fn read_client_list(text: &str) -> Result<Vec<Uuid>, ValidationError> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| vless::parse_client_id(l).ok_or_else(|| ValidationError::InvalidClientId(l.to_string())))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartReport {
    pub pid: u32,
    pub listening: bool,
    /// Last log lines, filled only when the listener was not seen.
    pub log_tail: Vec<String>,
}

/// Launch the proxy inside `ns` against `config_path`, replacing whatever
/// already listens on `port` there.
pub fn start(
    h: &dyn Host,
    cfg: &Config,
    ns: &str,
    port: u16,
    config_path: &Path,
    log_path: &Path,
) -> Result<StartReport, ProcessError> {
    if !netns::exists(h, ns) {
        return Err(ProcessError::NoNamespace(ns.to_string()));
    }
    let bin = cfg.proxy.bin.to_string_lossy().into_owned();
    if !cfg.proxy.bin.is_file() {
        return Err(ProcessError::BinaryMissing(bin));
    }

    let replaced = stop(h, ns, port);
    if !replaced.is_empty() {
        info!("replaced existing listener on {port} in {ns} (pids {replaced:?})");
    }

    let conf = config_path.to_string_lossy();
    let pid = h
        .spawn_detached("ip", &["netns", "exec", ns, &bin, "run", "-c", &conf], log_path)
        .map_err(|e| ProcessError::Launch { namespace: ns.to_string(), reason: format!("{e:#}") })?;

    h.sleep(cfg.proxy.settle());
    let listening = sockets::is_listening(h, ns, port);
    let log_tail = if listening {
        info!("proxy pid={pid} listening on {port} in {ns}");
        Vec::new()
    } else {
        warn!("proxy pid={pid} not confirmed listening on {port} in {ns}");
        tail_lines(log_path, cfg.proxy.log_tail_lines)
    };
    Ok(StartReport { pid, listening, log_tail })
}

/// Terminate whatever listens on `port` in `ns`; returns the pids signalled.
pub fn stop(h: &dyn Host, ns: &str, port: u16) -> Vec<u32> {
    let pids = sockets::pids_on_port(h, ns, port);
    terminate(h, &pids);
    pids
}

pub fn logs(log_path: &Path, n: usize) -> Vec<String> {
    tail_lines(log_path, n)
}

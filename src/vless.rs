//! `vless://<uuid>@<host>:<port>?<query>#<tag>` connection URIs.

use std::fmt;
use uuid::Uuid;

use crate::error::ParseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("tcp")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Security {
    None,
    Other(String),
}

impl Security {
    fn from_query(v: &str) -> Self {
        if v.is_empty() || v.eq_ignore_ascii_case("none") {
            Security::None
        } else {
            Security::Other(v.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Security::None => "none",
            Security::Other(s) => s,
        }
    }
}

/// HTTP request header disguise on the TCP stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderObfuscation {
    pub host_header: String,
    pub path: String,
}

impl HeaderObfuscation {
    pub const KIND: &'static str = "http";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub client_id: Uuid,
    pub transport: Transport,
    pub security: Security,
    pub header: Option<HeaderObfuscation>,
}

impl Identity {
    /// Fresh random id with HTTP header obfuscation.
    pub fn generate(host_header: &str, path: &str) -> Self {
        Self {
            client_id: Uuid::new_v4(),
            transport: Transport::Tcp,
            security: Security::None,
            header: Some(HeaderObfuscation { host_header: host_header.to_string(), path: path.to_string() }),
        }
    }

    /// The URI an operator pastes into a client; `parse` reads it back.
    pub fn connection_string(&self, host: &str, port: u16, tag: &str) -> String {
        let mut s = format!(
            "vless://{}@{host}:{port}?type={}&security={}",
            self.client_id,
            self.transport,
            encode(self.security.as_str())
        );
        if let Some(h) = &self.header {
            s.push_str(&format!(
                "&headerType={}&host={}&path={}",
                HeaderObfuscation::KIND,
                encode(&h.host_header),
                encode(&h.path)
            ));
        }
        if !tag.is_empty() {
            s.push('#');
            s.push_str(&encode(tag));
        }
        s
    }
}

/// Canonical 8-4-4-4-12 hex only; `Uuid::parse_str` alone also takes braces,
/// urn prefixes and the simple form.
pub fn parse_client_id(s: &str) -> Option<Uuid> {
    let groups: Vec<&str> = s.split('-').collect();
    let lens = [8, 4, 4, 4, 12];
    if groups.len() != 5
        || groups.iter().zip(lens).any(|(g, n)| g.len() != n || !g.chars().all(|c| c.is_ascii_hexdigit()))
    {
        return None;
    }
    Uuid::parse_str(s).ok()
}

fn hex(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// `%XX` and `+` decoding; malformed escapes are kept literally.
fn decode(s: &str) -> String {
    let b = s.as_bytes();
    let mut out = Vec::with_capacity(b.len());
    let mut i = 0;
    while i < b.len() {
        match b[i] {
            b'%' if i + 2 < b.len() => match (hex(b[i + 1]), hex(b[i + 2])) {
                (Some(h), Some(l)) => {
                    out.push(h << 4 | l);
                    i += 3;
                    continue;
                }
                _ => out.push(b'%'),
            },
            b'+' => out.push(b' '),
            c => out.push(c),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Parse a connection URI. Performs no I/O.
pub fn parse(uri: &str) -> Result<Identity, ParseError> {
    let uri = uri.trim();
    if uri.is_empty() {
        return Err(ParseError::Empty);
    }
    let rest = match uri.split_once("://") {
        Some((_, r)) => r,
        None => uri,
    };
    let rest = rest.split_once('#').map_or(rest, |(r, _)| r);
    let (before_query, query) = rest.split_once('?').unwrap_or((rest, ""));
    let id = before_query.split_once('@').map_or(before_query, |(id, _)| id);
    let id = decode(id);

    let mut transport = None;
    let mut security = Security::None;
    let mut header_type = None;
    let mut host = String::new();
    let mut path = None;
    for pair in query.split('&') {
        let Some((k, v)) = pair.split_once('=') else { continue };
        let v = decode(v);
        match k {
            "type" => transport = Some(v),
            "security" => security = Security::from_query(&v),
            "headerType" => header_type = Some(v),
            "host" => host = v,
            "path" => path = Some(v),
            _ => {}
        }
    }

    match transport.as_deref() {
        None | Some("") | Some("tcp") => {}
        Some(other) => return Err(ParseError::UnsupportedTransport(other.to_string())),
    }
    let client_id = parse_client_id(&id).ok_or(ParseError::InvalidIdentity(id))?;

    let header = match header_type.as_deref() {
        Some(k) if k.eq_ignore_ascii_case(HeaderObfuscation::KIND) => Some(HeaderObfuscation {
            host_header: host,
            path: path.filter(|p| !p.is_empty()).unwrap_or_else(|| "/".to_string()),
        }),
        _ => None,
    };

    Ok(Identity { client_id, transport: Transport::Tcp, security, header })
}

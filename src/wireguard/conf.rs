//! WireGuard `Key = Value` configuration text.

/// Keys the engine handles itself; `wg setconf` rejects them anyway.
const HOST_ROUTING_KEYS: [&str; 8] = ["Address", "DNS", "Table", "MTU", "PreUp", "PostUp", "PreDown", "PostDown"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Section(String),
    Pair { key: String, value: String, raw: String },
    /// Comments, blank lines, anything unparsed; kept verbatim.
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// `host:port` or `[v6]:port`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']')?;
            let port = tail.strip_prefix(':')?.parse().ok()?;
            return Some(Self { host: host.to_string(), port });
        }
        let (host, port) = s.rsplit_once(':')?;
        if host.is_empty() || host.contains(':') {
            return None;
        }
        Some(Self { host: host.to_string(), port: port.parse().ok()? })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TunnelConf {
    lines: Vec<Line>,
}

impl TunnelConf {
    pub fn parse(text: &str) -> Self {
        let lines = text
            .lines()
            .map(|raw| {
                let t = raw.trim();
                if t.starts_with('[') && t.ends_with(']') {
                    return Line::Section(t[1..t.len() - 1].trim().to_string());
                }
                if t.starts_with('#') || t.starts_with(';') {
                    return Line::Other(raw.to_string());
                }
                match t.split_once('=') {
                    Some((k, v)) if !k.trim().is_empty() => Line::Pair {
                        key: k.trim().to_string(),
                        value: v.trim().to_string(),
                        raw: raw.to_string(),
                    },
                    _ => Line::Other(raw.to_string()),
                }
            })
            .collect();
        Self { lines }
    }

    fn values<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.lines.iter().filter_map(move |l| match l {
            Line::Pair { key: k, value, .. } if k.eq_ignore_ascii_case(key) => Some(value.as_str()),
            _ => None,
        })
    }

    fn list(&self, key: &str) -> Vec<String> {
        self.values(key)
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// First `Endpoint` in the text.
    pub fn endpoint(&self) -> Option<Endpoint> {
        self.values("Endpoint").find_map(Endpoint::parse)
    }

    pub fn addresses(&self) -> Vec<String> {
        self.list("Address")
    }

    pub fn dns(&self) -> Vec<String> {
        self.list("DNS")
    }

    pub fn mtu(&self) -> Option<u32> {
        self.values("MTU").find_map(|v| v.parse().ok())
    }

    /// The text `wg setconf` accepts: host-routing keys removed, the rest verbatim.
    pub fn stripped(&self) -> String {
        let mut out = String::new();
        for l in &self.lines {
            let raw = match l {
                Line::Section(s) => {
                    out.push_str(&format!("[{s}]\n"));
                    continue;
                }
                Line::Pair { key, .. } if HOST_ROUTING_KEYS.iter().any(|k| k.eq_ignore_ascii_case(key)) => continue,
                Line::Pair { raw, .. } => raw,
                Line::Other(raw) => raw,
            };
            out.push_str(raw);
            out.push('\n');
        }
        out
    }
}

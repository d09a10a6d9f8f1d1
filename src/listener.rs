//! Listener and virtual host model.
//!
//! `ListenerRecord` and `VHostMapping` are the raw rows handed over by a
//! [`ConfigStore`](crate::collab::ConfigStore). They are validated into a
//! `ListenerSpec`, which is what handlers serve from. A running listener
//! holds its spec behind an `ArcSwap` so a reconcile can replace the vhost
//! map while connections that already loaded the old snapshot keep it.

use crate::error::ConfigError;
use crate::sni::normalize_host;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// Live listener configuration shared between the registry and its handler
pub type SharedSpec = Arc<ArcSwap<ListenerSpec>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Http,
    Https,
}

impl Protocol {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Some(Protocol::Tcp),
            "udp" => Some(Protocol::Udp),
            "http" => Some(Protocol::Http),
            "https" => Some(Protocol::Https),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }

    pub fn transport(&self) -> Transport {
        match self {
            Protocol::Udp => Transport::Datagram,
            _ => Transport::Stream,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Socket class of a bind. TCP and UDP may share a port number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Stream,
    Datagram,
}

/// Identity of a bound socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BindKey {
    pub transport: Transport,
    pub addr: SocketAddr,
}

impl fmt::Display for BindKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let proto = match self.transport {
            Transport::Stream => "tcp",
            Transport::Datagram => "udp",
        };
        write!(f, "{}/{}", proto, self.addr)
    }
}

/// Which accept loop a listener runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerKind {
    /// Plain TCP splice to a single target
    Tcp,
    /// TCP splice routed by sniffed SNI or Host
    TransparentTcp,
    Udp,
    /// ACME challenge responder and HTTPS redirector
    HttpRedirect,
    /// TLS-terminating HTTP reverse proxy
    Https,
}

/// A backend address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
}

impl Target {
    /// `host:port`, the key used by the health tracker
    pub fn addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn is_tls(&self) -> bool {
        self.protocol == Protocol::Https
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.addr())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VHostEntry {
    pub hostname: String,
    pub target_host: String,
    pub target_port: u16,
    pub target_protocol: Protocol,
}

impl VHostEntry {
    pub fn target(&self) -> Target {
        Target {
            host: self.target_host.clone(),
            port: self.target_port,
            protocol: self.target_protocol,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListenerSpec {
    pub id: i64,
    pub listen_protocol: Protocol,
    pub listen_host: IpAddr,
    pub listen_port: u16,
    pub target_protocol: Protocol,
    pub target_host: String,
    pub target_port: u16,
    pub vhosts: BTreeMap<String, VHostEntry>,
    pub error_page_html: Option<String>,
    pub tls_passthrough: bool,
}

impl ListenerSpec {
    pub fn bind_key(&self) -> BindKey {
        BindKey {
            transport: self.listen_protocol.transport(),
            addr: SocketAddr::new(self.listen_host, self.listen_port),
        }
    }

    pub fn kind(&self) -> ListenerKind {
        match self.listen_protocol {
            Protocol::Tcp if self.vhosts.is_empty() => ListenerKind::Tcp,
            Protocol::Tcp => ListenerKind::TransparentTcp,
            Protocol::Udp => ListenerKind::Udp,
            Protocol::Http => ListenerKind::HttpRedirect,
            Protocol::Https if self.tls_passthrough => ListenerKind::TransparentTcp,
            Protocol::Https => ListenerKind::Https,
        }
    }

    /// The listener's own target, if it has one
    pub fn static_target(&self) -> Option<Target> {
        if self.target_host.is_empty() || self.target_port == 0 {
            return None;
        }
        Some(Target {
            host: self.target_host.clone(),
            port: self.target_port,
            protocol: self.target_protocol,
        })
    }

    /// Find the vhost entry for a hostname: exact match first, then the
    /// closest `*.` wildcard.
    pub fn vhost(&self, hostname: &str) -> Option<&VHostEntry> {
        if let Some(entry) = self.vhosts.get(hostname) {
            return Some(entry);
        }
        let mut rest = hostname;
        while let Some((_, parent)) = rest.split_once('.') {
            if let Some(entry) = self.vhosts.get(&format!("*.{}", parent)) {
                return Some(entry);
            }
            rest = parent;
        }
        None
    }

    /// Effective backend for a connection.
    ///
    /// Falls back to the static target for unknown or missing hostnames
    /// unless `strict` is set and the listener has vhosts.
    pub fn resolve_target(&self, hostname: Option<&str>, strict: bool) -> Option<Target> {
        if let Some(entry) = hostname.and_then(|h| self.vhost(h)) {
            return Some(entry.target());
        }
        if strict && !self.vhosts.is_empty() {
            return None;
        }
        self.static_target()
    }

    /// Every backend this listener may dial
    pub fn targets(&self) -> Vec<Target> {
        let mut targets: Vec<Target> = self.static_target().into_iter().collect();
        for entry in self.vhosts.values() {
            let target = entry.target();
            if !targets.contains(&target) {
                targets.push(target);
            }
        }
        targets
    }

    pub fn into_shared(self) -> SharedSpec {
        Arc::new(ArcSwap::from_pointee(self))
    }

    /// Validate a stored listener together with the mappings that name it
    pub fn from_record(
        record: &ListenerRecord,
        mappings: &[VHostMapping],
    ) -> Result<Self, ConfigError> {
        let id = record.id;
        let listen_protocol =
            Protocol::from_str(&record.listen_protocol).ok_or_else(|| {
                ConfigError::UnknownProtocol {
                    id,
                    protocol: record.listen_protocol.clone(),
                }
            })?;

        let target_protocol = match record.target_protocol.as_deref() {
            None | Some("") => match listen_protocol {
                Protocol::Https | Protocol::Http => Protocol::Http,
                other => other,
            },
            Some(raw) => Protocol::from_str(raw).ok_or_else(|| ConfigError::UnknownProtocol {
                id,
                protocol: raw.to_string(),
            })?,
        };

        if record.listen_port == 0 {
            return Err(ConfigError::ZeroListenPort { id });
        }

        let listen_host: IpAddr =
            record
                .listen_host
                .parse()
                .map_err(|_| ConfigError::InvalidListenHost {
                    id,
                    host: record.listen_host.clone(),
                })?;

        let target_host = record.target_host.trim().to_string();
        if listen_protocol != Protocol::Http {
            if target_host.is_empty() && !has_mappings(id, mappings) {
                return Err(ConfigError::MissingTargetHost {
                    id,
                    protocol: listen_protocol.as_str(),
                });
            }
            if !target_host.is_empty() && record.target_port == 0 {
                return Err(ConfigError::ZeroTargetPort { id });
            }
        }

        let mut vhosts = BTreeMap::new();
        for mapping in mappings.iter().filter(|m| m.listener_id == id) {
            let entry = mapping.to_entry(target_protocol)?;
            // first mapping for a hostname wins
            vhosts.entry(entry.hostname.clone()).or_insert(entry);
        }

        Ok(Self {
            id,
            listen_protocol,
            listen_host,
            listen_port: record.listen_port,
            target_protocol,
            target_host,
            target_port: record.target_port,
            vhosts,
            error_page_html: record.error_page_html.clone().filter(|p| !p.is_empty()),
            tls_passthrough: record.tls_passthrough,
        })
    }
}

fn has_mappings(id: i64, mappings: &[VHostMapping]) -> bool {
    mappings.iter().any(|m| m.listener_id == id)
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

fn default_enabled() -> bool {
    true
}

/// A listener as stored by the configuration source
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ListenerRecord {
    pub id: i64,

    /// tcp, udp, http or https
    pub listen_protocol: String,

    #[serde(default = "default_listen_host")]
    pub listen_host: String,

    pub listen_port: u16,

    /// Defaults to the listen protocol (http for web listeners)
    #[serde(default)]
    pub target_protocol: Option<String>,

    #[serde(default)]
    pub target_host: String,

    #[serde(default)]
    pub target_port: u16,

    /// Served instead of the generic page when the backend is unavailable
    #[serde(default)]
    pub error_page_html: Option<String>,

    #[serde(default)]
    pub tls_passthrough: bool,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// A hostname routed to a backend on one listener
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct VHostMapping {
    pub listener_id: i64,
    pub hostname: String,
    pub target_host: String,
    pub target_port: u16,
    #[serde(default)]
    pub target_protocol: Option<String>,
}

impl VHostMapping {
    fn to_entry(&self, default_protocol: Protocol) -> Result<VHostEntry, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidVHost {
            hostname: self.hostname.clone(),
            reason: reason.to_string(),
        };

        let hostname = match self.hostname.strip_prefix("*.") {
            Some(rest) => normalize_host(rest).map(|h| format!("*.{}", h)),
            None => normalize_host(&self.hostname),
        }
        .ok_or_else(|| invalid("invalid hostname"))?;

        if self.target_host.trim().is_empty() {
            return Err(invalid("target host is empty"));
        }
        if self.target_port == 0 {
            return Err(invalid("target port must be non-zero"));
        }

        let target_protocol = match self.target_protocol.as_deref() {
            None | Some("") => default_protocol,
            Some(raw) => Protocol::from_str(raw).ok_or_else(|| invalid("unknown protocol"))?,
        };

        Ok(VHostEntry {
            hostname,
            target_host: self.target_host.trim().to_string(),
            target_port: self.target_port,
            target_protocol,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn record(id: i64, protocol: &str, port: u16) -> ListenerRecord {
        ListenerRecord {
            id,
            listen_protocol: protocol.to_string(),
            listen_host: "127.0.0.1".to_string(),
            listen_port: port,
            target_protocol: None,
            target_host: "127.0.0.1".to_string(),
            target_port: 9000,
            error_page_html: None,
            tls_passthrough: false,
            enabled: true,
        }
    }

    pub(crate) fn mapping(listener_id: i64, hostname: &str, port: u16) -> VHostMapping {
        VHostMapping {
            listener_id,
            hostname: hostname.to_string(),
            target_host: "127.0.0.1".to_string(),
            target_port: port,
            target_protocol: None,
        }
    }

    #[test]
    fn test_from_record_basic() {
        let spec = ListenerSpec::from_record(&record(1, "tcp", 7000), &[]).unwrap();
        assert_eq!(spec.kind(), ListenerKind::Tcp);
        assert_eq!(spec.target_protocol, Protocol::Tcp);
        assert_eq!(
            spec.bind_key().to_string(),
            "tcp/127.0.0.1:7000".to_string()
        );
    }

    #[test]
    fn test_from_record_rejects_bad_input() {
        let err = ListenerSpec::from_record(&record(1, "sctp", 7000), &[]).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownProtocol { .. }));

        let err = ListenerSpec::from_record(&record(2, "tcp", 0), &[]).unwrap_err();
        assert_eq!(err, ConfigError::ZeroListenPort { id: 2 });

        let mut r = record(3, "https", 8443);
        r.target_host = String::new();
        let err = ListenerSpec::from_record(&r, &[]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingTargetHost { id: 3, .. }));

        let mut r = record(4, "tcp", 7000);
        r.listen_host = "localhost".into();
        let err = ListenerSpec::from_record(&r, &[]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidListenHost { .. }));
    }

    #[test]
    fn test_http_listener_needs_no_target() {
        let mut r = record(5, "http", 8080);
        r.target_host = String::new();
        r.target_port = 0;
        let spec = ListenerSpec::from_record(&r, &[]).unwrap();
        assert_eq!(spec.kind(), ListenerKind::HttpRedirect);
        assert!(spec.static_target().is_none());
    }

    #[test]
    fn test_kind_selection() {
        let spec = ListenerSpec::from_record(
            &record(1, "tcp", 7000),
            &[mapping(1, "db.example.com", 5432)],
        )
        .unwrap();
        assert_eq!(spec.kind(), ListenerKind::TransparentTcp);

        let mut r = record(2, "https", 8443);
        r.tls_passthrough = true;
        let spec = ListenerSpec::from_record(&r, &[]).unwrap();
        assert_eq!(spec.kind(), ListenerKind::TransparentTcp);

        let spec = ListenerSpec::from_record(&record(3, "udp", 5353), &[]).unwrap();
        assert_eq!(spec.kind(), ListenerKind::Udp);
        assert_eq!(spec.bind_key().transport, Transport::Datagram);

        let spec = ListenerSpec::from_record(&record(4, "https", 8443), &[]).unwrap();
        assert_eq!(spec.kind(), ListenerKind::Https);
        assert_eq!(spec.target_protocol, Protocol::Http);
    }

    #[test]
    fn test_resolve_target() {
        let spec = ListenerSpec::from_record(
            &record(1, "https", 8443),
            &[
                mapping(1, "App.Example.com", 3001),
                mapping(1, "*.example.com", 3002),
                mapping(1, "app.example.com", 3999),
            ],
        )
        .unwrap();

        // first mapping wins, hostnames are normalized
        assert_eq!(spec.resolve_target(Some("app.example.com"), false).unwrap().port, 3001);
        assert_eq!(spec.resolve_target(Some("api.example.com"), false).unwrap().port, 3002);
        assert_eq!(spec.resolve_target(Some("a.b.example.com"), false).unwrap().port, 3002);

        // permissive fallback to the static target
        assert_eq!(spec.resolve_target(Some("other.org"), false).unwrap().port, 9000);
        assert_eq!(spec.resolve_target(None, false).unwrap().port, 9000);

        // strict mode refuses unknown hosts
        assert!(spec.resolve_target(Some("other.org"), true).is_none());
        assert!(spec.resolve_target(None, true).is_none());
    }

    #[test]
    fn test_vhost_protocol_override() {
        let mut m = mapping(1, "secure.example.com", 443);
        m.target_protocol = Some("https".into());
        let spec = ListenerSpec::from_record(&record(1, "https", 8443), &[m]).unwrap();
        let target = spec.resolve_target(Some("secure.example.com"), false).unwrap();
        assert!(target.is_tls());
        assert_eq!(target.to_string(), "https://127.0.0.1:443");
    }

    #[test]
    fn test_invalid_vhost_rejected() {
        let err = ListenerSpec::from_record(
            &record(1, "https", 8443),
            &[mapping(1, "bad host", 3000)],
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidVHost { .. }));
    }

    #[test]
    fn test_targets_deduplicated() {
        let spec = ListenerSpec::from_record(
            &record(1, "https", 8443),
            &[mapping(1, "a.example.com", 9000), mapping(1, "b.example.com", 9001)],
        )
        .unwrap();
        let addrs: Vec<String> = spec.targets().iter().map(Target::addr).collect();
        assert_eq!(addrs, vec!["127.0.0.1:9000", "127.0.0.1:9001"]);
    }

    #[test]
    fn test_deserialize_record_defaults() {
        let toml = r#"
id = 3
listen_protocol = "tcp"
listen_port = 2222
target_host = "10.0.0.2"
target_port = 22
"#;
        let record: ListenerRecord = toml::from_str(toml).unwrap();
        assert_eq!(record.listen_host, "0.0.0.0");
        assert!(record.enabled);
        assert!(!record.tls_passthrough);
        assert!(record.target_protocol.is_none());
    }
}

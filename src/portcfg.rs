//! Port configuration: the schema-driven, protocol-tagged description of a
//! thing to listen on, per §3 and §6's "Port configuration schema".

use std::net::Ipv4Addr;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::socket::DEFAULT_FLOOD_LIMIT;

pub const DEFAULT_CONNECT_FREQ: u32 = 0; // 0 == unlimited
pub const DEFAULT_BACKLOG: u32 = 128;

/// A configured bind address: either a specific interface address or the
/// wildcard that expands to one copy per local interface at bind time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Address {
    Any,
    Specific(Ipv4Addr),
}

impl Address {
    pub fn parse(s: &str) -> Result<Self> {
        if s == "*" {
            return Ok(Address::Any);
        }
        s.parse::<Ipv4Addr>()
            .map(Address::Specific)
            .map_err(|_| Error::configuration("ipaddr", format!("not a dotted-quad or '*': {s}")))
    }

    pub fn is_any(&self) -> bool {
        matches!(self, Address::Any)
    }
}

/// A single CIDR-equivalent ACL entry, e.g. `192.168.0.0/16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidrV4 {
    pub addr: Ipv4Addr,
    pub prefix_len: u8,
}

impl CidrV4 {
    pub fn parse(s: &str) -> Result<Self> {
        let (addr_s, len_s) = s
            .split_once('/')
            .ok_or_else(|| Error::configuration("acl", format!("expected addr/prefix: {s}")))?;
        let addr = addr_s
            .parse::<Ipv4Addr>()
            .map_err(|_| Error::configuration("acl", format!("bad address: {addr_s}")))?;
        let prefix_len: u8 = len_s
            .parse()
            .map_err(|_| Error::configuration("acl", format!("bad prefix length: {len_s}")))?;
        if prefix_len > 32 {
            return Err(Error::configuration("acl", format!("prefix length out of range: {prefix_len}")));
        }
        Ok(CidrV4 { addr, prefix_len })
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        if self.prefix_len == 0 {
            return true;
        }
        let mask = !0u32 << (32 - self.prefix_len as u32);
        (u32::from(self.addr) & mask) == (u32::from(ip) & mask)
    }
}

/// Evaluates `allow` then `deny`: an `allow` list, if non-empty, is a
/// whitelist (absence is rejection); `deny` then excludes matches from
/// what `allow` let through.
#[derive(Debug, Clone, Default)]
pub struct Acl {
    pub allow: Vec<CidrV4>,
    pub deny: Vec<CidrV4>,
}

impl Acl {
    pub fn permits(&self, ip: Ipv4Addr) -> bool {
        if !self.allow.is_empty() && !self.allow.iter().any(|c| c.contains(ip)) {
            return false;
        }
        !self.deny.iter().any(|c| c.contains(ip))
    }
}

/// Fields shared by every socket-backed (non-pipe) protocol.
#[derive(Debug, Clone)]
pub struct NetCommon {
    pub address: Address,
    pub port: u16,
    pub device: Option<String>,
    pub send_buffer_size: usize,
    pub recv_buffer_size: usize,
    pub detection_wait_secs: u64,
    pub detection_fill: usize,
    pub flood_limit: i32,
    pub connect_freq: u32,
    pub acl: Acl,
}

impl Default for NetCommon {
    fn default() -> Self {
        NetCommon {
            address: Address::Any,
            port: 0,
            device: None,
            send_buffer_size: crate::buffer::DEFAULT_BUFFER_SIZE,
            recv_buffer_size: crate::buffer::DEFAULT_BUFFER_SIZE,
            detection_wait_secs: crate::socket::DEFAULT_DETECTION_WAIT_SECS,
            detection_fill: crate::socket::DEFAULT_DETECTION_FILL,
            flood_limit: DEFAULT_FLOOD_LIMIT,
            connect_freq: DEFAULT_CONNECT_FREQ,
            acl: Acl::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TcpConfig {
    pub common: NetCommon,
    pub backlog: u32,
}

#[derive(Debug, Clone)]
pub struct UdpConfig {
    pub common: NetCommon,
}

#[derive(Debug, Clone)]
pub struct IcmpConfig {
    pub common: NetCommon,
}

#[derive(Debug, Clone)]
pub struct RawConfig {
    pub common: NetCommon,
}

#[derive(Debug, Clone)]
pub struct PipeEnd {
    pub path: PathBuf,
    pub mode: u32,
    pub user: Option<String>,
    pub group: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PipeConfig {
    pub recv: PipeEnd,
    pub send: PipeEnd,
}

#[derive(Debug, Clone)]
pub enum PortConfig {
    Tcp(TcpConfig),
    Udp(UdpConfig),
    Icmp(IcmpConfig),
    Raw(RawConfig),
    Pipe(PipeConfig),
}

/// What two port configurations are compared on to decide whether they
/// name "the same listener" for the binding manager (§4.7).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindKey {
    Inet { port: u16, address: InetAddrKey },
    Pipe { recv: PathBuf, send: PathBuf },
}

/// `Address` without the wrapped socket type so `BindKey` can derive `Eq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InetAddrKey {
    Any,
    Specific(Ipv4Addr),
}

impl From<Address> for InetAddrKey {
    fn from(a: Address) -> Self {
        match a {
            Address::Any => InetAddrKey::Any,
            Address::Specific(ip) => InetAddrKey::Specific(ip),
        }
    }
}

impl PortConfig {
    pub fn common(&self) -> Option<&NetCommon> {
        match self {
            PortConfig::Tcp(c) => Some(&c.common),
            PortConfig::Udp(c) => Some(&c.common),
            PortConfig::Icmp(c) => Some(&c.common),
            PortConfig::Raw(c) => Some(&c.common),
            PortConfig::Pipe(_) => None,
        }
    }

    pub fn bind_key(&self) -> BindKey {
        match self {
            PortConfig::Pipe(p) => BindKey::Pipe {
                recv: p.recv.path.clone(),
                send: p.send.path.clone(),
            },
            _ => {
                let common = self.common().expect("non-pipe variant always has common fields");
                BindKey::Inet {
                    port: common.port,
                    address: common.address.into(),
                }
            }
        }
    }

    /// Whether this configuration's address is the wildcard; pipes are
    /// never wildcard-expanded.
    pub fn is_wildcard(&self) -> bool {
        self.common().map(|c| c.address.is_any()).unwrap_or(false)
    }

    /// Expands an INADDR_ANY port configuration into one copy per local
    /// interface address (§4.7's first bullet); non-wildcard and pipe
    /// configurations expand to themselves.
    pub fn expand(&self, local_interfaces: &[Ipv4Addr]) -> Vec<PortConfig> {
        if !self.is_wildcard() || local_interfaces.is_empty() {
            return vec![self.clone()];
        }
        local_interfaces
            .iter()
            .map(|addr| self.with_address(Address::Specific(*addr)))
            .collect()
    }

    fn with_address(&self, address: Address) -> PortConfig {
        match self {
            PortConfig::Tcp(c) => {
                let mut c = c.clone();
                c.common.address = address;
                PortConfig::Tcp(c)
            }
            PortConfig::Udp(c) => {
                let mut c = c.clone();
                c.common.address = address;
                PortConfig::Udp(c)
            }
            PortConfig::Icmp(c) => {
                let mut c = c.clone();
                c.common.address = address;
                PortConfig::Icmp(c)
            }
            PortConfig::Raw(c) => {
                let mut c = c.clone();
                c.common.address = address;
                PortConfig::Raw(c)
            }
            PortConfig::Pipe(p) => PortConfig::Pipe(p.clone()),
        }
    }
}

/// Parses a `serde_json::Value` config object into a [`PortConfig`],
/// dispatching on the `proto` field. This is the schema-driven replacement
/// for the original's byte-offset prototype walk (§2 ambient stack).
pub fn from_json(value: &serde_json::Value) -> Result<PortConfig> {
    let proto = value
        .get("proto")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::configuration("proto", "missing or not a string"))?;

    if proto == "pipe" {
        return Ok(PortConfig::Pipe(pipe_config_from_json(value)?));
    }

    let common = net_common_from_json(value)?;
    Ok(match proto {
        "tcp" => PortConfig::Tcp(TcpConfig {
            backlog: value
                .get("backlog")
                .and_then(|v| v.as_u64())
                .map(|v| v as u32)
                .unwrap_or(DEFAULT_BACKLOG),
            common,
        }),
        "udp" => PortConfig::Udp(UdpConfig { common }),
        "icmp" => PortConfig::Icmp(IcmpConfig { common }),
        "raw" => PortConfig::Raw(RawConfig { common }),
        other => return Err(Error::configuration("proto", format!("unknown protocol: {other}"))),
    })
}

fn net_common_from_json(value: &serde_json::Value) -> Result<NetCommon> {
    let mut common = NetCommon::default();
    if let Some(ipaddr) = value.get("ipaddr").and_then(|v| v.as_str()) {
        common.address = Address::parse(ipaddr)?;
    }
    let port = value
        .get("port")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| Error::configuration("port", "missing or not a number"))?;
    common.port = u16::try_from(port).map_err(|_| Error::configuration("port", "out of range 0-65535"))?;
    common.device = value.get("device").and_then(|v| v.as_str()).map(str::to_owned);
    if let Some(n) = value.get("send-buffer-size").and_then(|v| v.as_u64()) {
        common.send_buffer_size = n as usize;
    }
    if let Some(n) = value.get("recv-buffer-size").and_then(|v| v.as_u64()) {
        common.recv_buffer_size = n as usize;
    }
    if let Some(n) = value.get("detection-wait").and_then(|v| v.as_u64()) {
        common.detection_wait_secs = n;
    }
    if let Some(n) = value.get("detection-fill").and_then(|v| v.as_u64()) {
        common.detection_fill = n as usize;
    }
    if let Some(n) = value.get("flood-limit").and_then(|v| v.as_i64()) {
        common.flood_limit = n as i32;
    }
    if let Some(n) = value.get("connect-frequency").and_then(|v| v.as_u64()) {
        common.connect_freq = n as u32;
    }
    common.acl.allow = parse_cidr_list(value.get("allow"))?;
    common.acl.deny = parse_cidr_list(value.get("deny"))?;
    Ok(common)
}

fn parse_cidr_list(value: Option<&serde_json::Value>) -> Result<Vec<CidrV4>> {
    let Some(value) = value else { return Ok(Vec::new()) };
    let Some(entries) = value.as_array() else {
        return Err(Error::configuration("acl", "expected a list of strings"));
    };
    entries
        .iter()
        .map(|v| {
            v.as_str()
                .ok_or_else(|| Error::configuration("acl", "expected a string entry"))
                .and_then(CidrV4::parse)
        })
        .collect()
}

fn pipe_end_from_json(value: &serde_json::Value, key: &str) -> Result<PipeEnd> {
    let obj = value
        .get(key)
        .ok_or_else(|| Error::configuration(key, "missing pipe endpoint"))?;
    let path = obj
        .get("path")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::configuration(key, "missing path"))?;
    let mode = obj.get("mode").and_then(|v| v.as_u64()).unwrap_or(0o600) as u32;
    let user = obj.get("user").and_then(|v| v.as_str()).map(str::to_owned);
    let group = obj.get("group").and_then(|v| v.as_str()).map(str::to_owned);
    Ok(PipeEnd {
        path: PathBuf::from(path),
        mode,
        user,
        group,
    })
}

fn pipe_config_from_json(value: &serde_json::Value) -> Result<PipeConfig> {
    Ok(PipeConfig {
        recv: pipe_end_from_json(value, "recv-pipe")?,
        send: pipe_end_from_json(value, "send-pipe")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wildcard_address_parses_as_any() {
        assert_eq!(Address::parse("*").unwrap(), Address::Any);
        assert_eq!(
            Address::parse("192.168.1.5").unwrap(),
            Address::Specific(Ipv4Addr::new(192, 168, 1, 5))
        );
    }

    #[test]
    fn cidr_contains_respects_prefix_length() {
        let net = CidrV4::parse("192.168.0.0/16").unwrap();
        assert!(net.contains(Ipv4Addr::new(192, 168, 1, 5)));
        assert!(!net.contains(Ipv4Addr::new(192, 169, 1, 5)));
    }

    #[test]
    fn acl_deny_overrides_broad_allow() {
        let acl = Acl {
            allow: vec![CidrV4::parse("10.0.0.0/8").unwrap()],
            deny: vec![CidrV4::parse("10.0.0.0/24").unwrap()],
        };
        assert!(acl.permits(Ipv4Addr::new(10, 1, 2, 3)));
        assert!(!acl.permits(Ipv4Addr::new(10, 0, 0, 9)));
    }

    #[test]
    fn expand_produces_one_copy_per_interface() {
        let cfg = from_json(&json!({"proto": "tcp", "port": 6000, "ipaddr": "*"})).unwrap();
        let interfaces = vec![Ipv4Addr::new(127, 0, 0, 1), Ipv4Addr::new(192, 168, 1, 5)];
        let expanded = cfg.expand(&interfaces);
        assert_eq!(expanded.len(), 2);
        assert!(expanded.iter().all(|c| !c.is_wildcard()));
    }

    #[test]
    fn from_json_builds_tcp_config_with_defaults() {
        let cfg = from_json(&json!({"proto": "tcp", "port": 6000})).unwrap();
        match cfg {
            PortConfig::Tcp(t) => {
                assert_eq!(t.backlog, DEFAULT_BACKLOG);
                assert_eq!(t.common.port, 6000);
                assert!(t.common.address.is_any());
            }
            _ => panic!("expected tcp"),
        }
    }

    #[test]
    fn from_json_builds_pipe_config() {
        let cfg = from_json(&json!({
            "proto": "pipe",
            "recv-pipe": {"path": "/tmp/in", "mode": 384},
            "send-pipe": {"path": "/tmp/out", "mode": 384},
        }))
        .unwrap();
        match cfg {
            PortConfig::Pipe(p) => {
                assert_eq!(p.recv.path, PathBuf::from("/tmp/in"));
                assert_eq!(p.send.path, PathBuf::from("/tmp/out"));
            }
            _ => panic!("expected pipe"),
        }
    }

    #[test]
    fn from_json_rejects_unknown_protocol() {
        assert!(from_json(&json!({"proto": "sctp", "port": 1})).is_err());
    }
}

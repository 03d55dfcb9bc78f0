//! Filter data model
//!
//! `CompiledFilter` is what the policy compiler hands to the engine: one
//! fully-resolved rule. `ExistingFilter` is what enumeration reads back.
//!
//! ## Filter keys
//!
//! A filter key identifies both *which* rule a filter belongs to and *what*
//! it matches. Reconciliation compares keys only, so two filters with equal
//! keys must be content-identical. [`CompiledFilter::derive_key`] produces
//! such a key: a UUID v5 in [`FILTER_KEY_NAMESPACE`] over a versioned,
//! escaped rendering of every field except the key itself. The rendering
//! must never change without bumping [`KEY_FORMAT_VERSION`], otherwise every
//! installed filter is seen as obsolete on the next apply.

use crate::error::{FilterError, FilterResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use uuid::Uuid;

/// Namespace for derived filter keys
pub const FILTER_KEY_NAMESPACE: Uuid = Uuid::from_u128(0x6a1e0c52_3d4f_4b7a_8c2e_9f105b3d7e41);

/// Prefix of the rendering hashed into a filter key
pub const KEY_FORMAT_VERSION: &str = "wfpguard-filter-v2";

/// IANA protocol numbers used by the policy compiler
pub mod protocol {
    pub const ICMP: u8 = 1;
    pub const TCP: u8 = 6;
    pub const UDP: u8 = 17;
    pub const ICMPV6: u8 = 58;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterAction {
    Allow,
    Block,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outbound,
    Inbound,
}

impl fmt::Display for FilterAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterAction::Allow => write!(f, "allow"),
            FilterAction::Block => write!(f, "block"),
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outbound => write!(f, "outbound"),
            Direction::Inbound => write!(f, "inbound"),
        }
    }
}

/// Remote address condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "lowercase")]
pub enum RemoteAddress {
    V4 { addr: Ipv4Addr, mask: Ipv4Addr },
    V6 { addr: Ipv6Addr, prefix_len: u8 },
}

impl RemoteAddress {
    /// Match exactly one host
    pub fn host(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(addr) => RemoteAddress::V4 {
                addr,
                mask: Ipv4Addr::BROADCAST,
            },
            IpAddr::V6(addr) => RemoteAddress::V6 {
                addr,
                prefix_len: 128,
            },
        }
    }

    /// Parse `addr` or `addr/prefix`
    pub fn parse_cidr(input: &str) -> Result<Self, String> {
        let (addr_part, prefix_part) = match input.split_once('/') {
            Some((a, p)) => (a, Some(p)),
            None => (input, None),
        };

        let ip: IpAddr = addr_part
            .trim()
            .parse()
            .map_err(|e| format!("invalid address '{}': {}", addr_part, e))?;

        let max = if ip.is_ipv6() { 128u8 } else { 32u8 };
        let prefix = match prefix_part {
            Some(p) => p
                .trim()
                .parse::<u8>()
                .map_err(|e| format!("invalid prefix '{}': {}", p, e))?,
            None => max,
        };
        if prefix > max {
            return Err(format!("prefix /{} exceeds /{}", prefix, max));
        }

        Ok(match ip {
            IpAddr::V4(addr) => RemoteAddress::V4 {
                addr,
                mask: prefix_to_mask(prefix),
            },
            IpAddr::V6(addr) => RemoteAddress::V6 {
                addr,
                prefix_len: prefix,
            },
        })
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self, RemoteAddress::V6 { .. })
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            RemoteAddress::V4 { mask, .. } => {
                let m = u32::from(*mask);
                if m.leading_ones() + m.trailing_zeros() != 32 {
                    return Err(format!("mask {} is not contiguous", mask));
                }
            }
            RemoteAddress::V6 { prefix_len, .. } => {
                if *prefix_len > 128 {
                    return Err(format!("IPv6 prefix /{} exceeds /128", prefix_len));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteAddress::V4 { addr, mask } => write!(f, "{}/{}", addr, mask),
            RemoteAddress::V6 { addr, prefix_len } => write!(f, "{}/{}", addr, prefix_len),
        }
    }
}

/// IPv4 mask for a prefix length (0..=32)
pub fn prefix_to_mask(prefix: u8) -> Ipv4Addr {
    let bits = match prefix {
        0 => 0,
        p if p >= 32 => u32::MAX,
        p => u32::MAX << (32 - p),
    };
    Ipv4Addr::from(bits)
}

/// Remote port condition: a single port or an inclusive range, never both
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PortMatch {
    Exact { port: u16 },
    Range { start: u16, end: u16 },
}

impl fmt::Display for PortMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortMatch::Exact { port } => write!(f, "{}", port),
            PortMatch::Range { start, end } => write!(f, "{}-{}", start, end),
        }
    }
}

/// A fully-resolved, engine-ready rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledFilter {
    pub filter_key: Uuid,
    pub rule_id: String,
    pub action: FilterAction,
    pub direction: Direction,
    /// IANA protocol number, see [`protocol`]
    pub protocol: u8,
    #[serde(default)]
    pub remote_address: Option<RemoteAddress>,
    #[serde(default)]
    pub remote_port: Option<PortMatch>,
    /// Full DOS path of the executable this rule is scoped to
    #[serde(default)]
    pub process_path: Option<String>,
    /// Explicit priority; `None` lets the filtering engine rank by specificity
    #[serde(default)]
    pub weight: Option<u64>,
    pub display_name: String,
    #[serde(default)]
    pub description: String,
}

impl CompiledFilter {
    pub fn builder(rule_id: impl Into<String>) -> CompiledFilterBuilder {
        CompiledFilterBuilder::new(rule_id.into())
    }

    /// Deterministic key over everything this filter matches and reports
    pub fn derive_key(&self) -> Uuid {
        Uuid::new_v5(&FILTER_KEY_NAMESPACE, self.key_material().as_bytes())
    }

    pub fn verify_key(&self) -> bool {
        self.filter_key == self.derive_key()
    }

    fn key_material(&self) -> String {
        // Present values carry a `+` so no value can render like an absent one
        let opt = |v: Option<String>| match v {
            Some(v) => format!("+{}", v),
            None => "-".to_string(),
        };
        [
            KEY_FORMAT_VERSION.to_string(),
            escape(&self.rule_id),
            self.action.to_string(),
            self.direction.to_string(),
            self.protocol.to_string(),
            opt(self.remote_address.map(|a| a.to_string())),
            opt(self.remote_port.map(|p| p.to_string())),
            // Windows paths are case-insensitive
            opt(self.process_path.as_ref().map(|p| escape(&p.to_lowercase()))),
            opt(self.weight.map(|w| w.to_string())),
            escape(&self.display_name),
            escape(&self.description),
        ]
        .join("|")
    }

    /// Structural checks done before any native call.
    pub fn validate(&self) -> FilterResult<()> {
        if self.rule_id.trim().is_empty() {
            return Err(FilterError::invalid(&self.rule_id, "rule id is empty"));
        }
        if self.display_name.is_empty() {
            return Err(FilterError::invalid(&self.rule_id, "display name is empty"));
        }
        if let Some(addr) = &self.remote_address {
            addr.validate()
                .map_err(|reason| FilterError::invalid(&self.rule_id, reason))?;
        }
        if let Some(port) = &self.remote_port {
            if self.protocol != protocol::TCP && self.protocol != protocol::UDP {
                return Err(FilterError::invalid(
                    &self.rule_id,
                    format!("port condition requires TCP or UDP, got protocol {}", self.protocol),
                ));
            }
            if let PortMatch::Range { start, end } = port {
                if start > end {
                    return Err(FilterError::invalid(
                        &self.rule_id,
                        format!("port range {}-{} is inverted", start, end),
                    ));
                }
            }
        }
        if let Some(path) = &self.process_path {
            if path.trim().is_empty() {
                return Err(FilterError::invalid(&self.rule_id, "process path is empty"));
            }
        }
        Ok(())
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('|', "\\|")
}

/// Fluent construction of a [`CompiledFilter`] with a derived key
#[derive(Debug, Clone)]
pub struct CompiledFilterBuilder {
    filter: CompiledFilter,
}

impl CompiledFilterBuilder {
    fn new(rule_id: String) -> Self {
        Self {
            filter: CompiledFilter {
                filter_key: Uuid::nil(),
                display_name: rule_id.clone(),
                rule_id,
                action: FilterAction::Block,
                direction: Direction::Outbound,
                protocol: protocol::TCP,
                remote_address: None,
                remote_port: None,
                process_path: None,
                weight: None,
                description: String::new(),
            },
        }
    }

    pub fn action(mut self, action: FilterAction) -> Self {
        self.filter.action = action;
        self
    }

    pub fn direction(mut self, direction: Direction) -> Self {
        self.filter.direction = direction;
        self
    }

    pub fn protocol(mut self, protocol: u8) -> Self {
        self.filter.protocol = protocol;
        self
    }

    pub fn remote_address(mut self, address: RemoteAddress) -> Self {
        self.filter.remote_address = Some(address);
        self
    }

    pub fn remote_host(self, ip: IpAddr) -> Self {
        self.remote_address(RemoteAddress::host(ip))
    }

    pub fn remote_port(mut self, port: u16) -> Self {
        self.filter.remote_port = Some(PortMatch::Exact { port });
        self
    }

    pub fn remote_port_range(mut self, start: u16, end: u16) -> Self {
        self.filter.remote_port = Some(PortMatch::Range { start, end });
        self
    }

    pub fn process_path(mut self, path: impl Into<String>) -> Self {
        self.filter.process_path = Some(path.into());
        self
    }

    pub fn weight(mut self, weight: u64) -> Self {
        self.filter.weight = Some(weight);
        self
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.filter.display_name = name.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.filter.description = description.into();
        self
    }

    pub fn build(mut self) -> FilterResult<CompiledFilter> {
        self.filter.validate()?;
        self.filter.filter_key = self.filter.derive_key();
        Ok(self.filter)
    }
}

/// A filter read back from this engine's sublayer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingFilter {
    pub filter_key: Uuid,
    /// Engine-assigned identifier, used for by-ID deletion
    pub filter_id: u64,
    pub display_name: String,
}

/// Outcome of one `apply_filters` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyResult {
    pub created: usize,
    pub removed: usize,
    pub unchanged: usize,
}

impl ApplyResult {
    pub fn is_noop(&self) -> bool {
        self.created == 0 && self.removed == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CompiledFilter {
        CompiledFilter::builder("block-cloudflare")
            .action(FilterAction::Block)
            .protocol(protocol::TCP)
            .remote_host("1.1.1.1".parse().unwrap())
            .remote_port(443)
            .weight(10)
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_derives_key() {
        let filter = sample();
        assert_ne!(filter.filter_key, Uuid::nil());
        assert!(filter.verify_key());
        assert_eq!(filter.display_name, "block-cloudflare");
    }

    #[test]
    fn test_key_is_deterministic() {
        assert_eq!(sample().filter_key, sample().filter_key);
    }

    #[test]
    fn test_key_changes_with_content() {
        let base = sample();
        let mut changed = base.clone();
        changed.remote_port = Some(PortMatch::Exact { port: 80 });
        assert_ne!(base.derive_key(), changed.derive_key());

        let mut renamed = base.clone();
        renamed.display_name = "other".to_string();
        assert_ne!(base.derive_key(), renamed.derive_key());

        let mut unweighted = base.clone();
        unweighted.weight = None;
        assert_ne!(base.derive_key(), unweighted.derive_key());
    }

    #[test]
    fn test_key_ignores_process_path_case() {
        let a = CompiledFilter::builder("r").process_path(r"C:\Apps\Game.exe").build().unwrap();
        let b = CompiledFilter::builder("r").process_path(r"c:\apps\game.exe").build().unwrap();
        assert_eq!(a.filter_key, b.filter_key);
    }

    #[test]
    fn test_key_escapes_separators() {
        let a = CompiledFilter::builder("a|b").display_name("c").build().unwrap();
        let b = CompiledFilter::builder("a").display_name("b|c").build().unwrap();
        assert_ne!(a.filter_key, b.filter_key);
    }

    #[test]
    fn test_key_is_stable_across_releases() {
        // Installed filters are matched by this value after an upgrade
        let filter = CompiledFilter::builder("stable").build().unwrap();
        let expected = Uuid::new_v5(
            &FILTER_KEY_NAMESPACE,
            b"wfpguard-filter-v2|stable|block|outbound|6|-|-|-|-|stable|",
        );
        assert_eq!(filter.filter_key, expected);

        let ported = CompiledFilter::builder("stable").remote_port(443).build().unwrap();
        let expected = Uuid::new_v5(
            &FILTER_KEY_NAMESPACE,
            b"wfpguard-filter-v2|stable|block|outbound|6|-|+443|-|-|stable|",
        );
        assert_eq!(ported.filter_key, expected);
    }

    #[test]
    fn test_key_separates_absent_from_dash_values() {
        let absent = CompiledFilter::builder("r").build().unwrap();
        let dash = CompiledFilter::builder("r").process_path("-").build().unwrap();
        assert_ne!(absent, dash);
        assert_ne!(absent.filter_key, dash.filter_key);

        let plus = CompiledFilter::builder("r").process_path("+").build().unwrap();
        assert_ne!(dash.filter_key, plus.filter_key);
        assert_ne!(absent.filter_key, plus.filter_key);
    }

    #[test]
    fn test_inverted_port_range_rejected() {
        let err = CompiledFilter::builder("r").remote_port_range(90, 80).build().unwrap_err();
        assert!(matches!(err, FilterError::InvalidFilter { .. }));
    }

    #[test]
    fn test_port_requires_tcp_or_udp() {
        let err = CompiledFilter::builder("r")
            .protocol(protocol::ICMP)
            .remote_port(80)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("requires TCP or UDP"));
    }

    #[test]
    fn test_non_contiguous_mask_rejected() {
        let err = CompiledFilter::builder("r")
            .remote_address(RemoteAddress::V4 {
                addr: Ipv4Addr::new(10, 0, 0, 0),
                mask: Ipv4Addr::new(255, 0, 255, 0),
            })
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("not contiguous"));
    }

    #[test]
    fn test_empty_process_path_rejected() {
        assert!(CompiledFilter::builder("r").process_path("  ").build().is_err());
    }

    #[test]
    fn test_parse_cidr() {
        assert_eq!(
            RemoteAddress::parse_cidr("10.0.0.0/8").unwrap(),
            RemoteAddress::V4 {
                addr: Ipv4Addr::new(10, 0, 0, 0),
                mask: Ipv4Addr::new(255, 0, 0, 0),
            }
        );
        assert_eq!(
            RemoteAddress::parse_cidr("1.1.1.1").unwrap(),
            RemoteAddress::host("1.1.1.1".parse().unwrap())
        );
        assert!(RemoteAddress::parse_cidr("2001:db8::/32").unwrap().is_ipv6());
        assert!(RemoteAddress::parse_cidr("10.0.0.0/33").is_err());
        assert!(RemoteAddress::parse_cidr("not-an-ip").is_err());
    }

    #[test]
    fn test_prefix_to_mask() {
        assert_eq!(prefix_to_mask(0), Ipv4Addr::new(0, 0, 0, 0));
        assert_eq!(prefix_to_mask(24), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(prefix_to_mask(32), Ipv4Addr::BROADCAST);
    }

    #[test]
    fn test_json_shape() {
        let json = r#"{
            "filter_key": "6a1e0c52-3d4f-4b7a-8c2e-9f105b3d7e41",
            "rule_id": "r1",
            "action": "allow",
            "direction": "inbound",
            "protocol": 17,
            "remote_address": {"family": "v4", "addr": "192.168.1.0", "mask": "255.255.255.0"},
            "remote_port": {"kind": "range", "start": 5000, "end": 5100},
            "display_name": "Allow LAN voice"
        }"#;
        let filter: CompiledFilter = serde_json::from_str(json).unwrap();
        assert_eq!(filter.action, FilterAction::Allow);
        assert_eq!(filter.direction, Direction::Inbound);
        assert_eq!(filter.remote_port, Some(PortMatch::Range { start: 5000, end: 5100 }));
        assert!(filter.process_path.is_none());
        assert!(filter.weight.is_none());
        assert!(filter.validate().is_ok());
    }

    #[test]
    fn test_apply_result_noop() {
        assert!(ApplyResult { created: 0, removed: 0, unchanged: 4 }.is_noop());
        assert!(!ApplyResult { created: 1, removed: 0, unchanged: 0 }.is_noop());
    }
}

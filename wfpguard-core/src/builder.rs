//! Native filter construction
//!
//! Turns a [`CompiledFilter`] into a [`FilterPlan`]: the layer, action,
//! weight and the exact list of condition slots the native filter record
//! will carry. The backend marshals the plan; this module decides what goes
//! into it.
//!
//! Condition slots:
//! - protocol, always
//! - remote address, if set
//! - remote port, exact or range (never both)
//! - application identity, if the rule is scoped to a process
//!
//! A process-scoped rule whose executable cannot be resolved is never
//! installed. Dropping the application condition instead would turn the rule
//! into one that matches every process on the machine.

use crate::backend::BackendSession;
use crate::error::{FilterError, FilterResult};
use crate::filter::{CompiledFilter, Direction, FilterAction, PortMatch, RemoteAddress};
use crate::identity::EngineIdentity;
use crate::status::StatusKind;
use uuid::Uuid;

/// Filter ID reported when the filter was already installed
pub const EXISTING_FILTER_ID: u64 = 0;

/// ALE layers a filter can attach to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterLayer {
    AleConnectV4,
    AleConnectV6,
    AleRecvAcceptV4,
    AleRecvAcceptV6,
}

impl FilterLayer {
    /// Outbound rules filter at connect, inbound rules at accept.
    ///
    /// A filter without a remote address attaches to the IPv4 layer only, so
    /// a port-only or process-scoped rule does not see IPv6 traffic. Each key
    /// maps to one native filter; cover IPv6 with a second rule carrying an
    /// IPv6 address.
    pub fn for_filter(direction: Direction, ipv6: bool) -> Self {
        match (direction, ipv6) {
            (Direction::Outbound, false) => FilterLayer::AleConnectV4,
            (Direction::Outbound, true) => FilterLayer::AleConnectV6,
            (Direction::Inbound, false) => FilterLayer::AleRecvAcceptV4,
            (Direction::Inbound, true) => FilterLayer::AleRecvAcceptV6,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FilterLayer::AleConnectV4 => "ALE Connect IPv4",
            FilterLayer::AleConnectV6 => "ALE Connect IPv6",
            FilterLayer::AleRecvAcceptV4 => "ALE Recv IPv4",
            FilterLayer::AleRecvAcceptV6 => "ALE Recv IPv6",
        }
    }
}

/// One condition slot of a native filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Protocol(u8),
    /// Host byte order, as the native record expects
    RemoteAddressV4 { addr: u32, mask: u32 },
    RemoteAddressV6 { addr: [u8; 16], prefix_len: u8 },
    RemotePort(u16),
    RemotePortRange { start: u16, end: u16 },
    /// Value is the resolved application identity blob
    AppId,
}

/// Everything needed to add one native filter, minus the app-id blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterPlan {
    pub key: Uuid,
    pub display_name: String,
    pub description: String,
    pub provider_key: Uuid,
    pub sublayer_key: Uuid,
    pub layer: FilterLayer,
    pub action: FilterAction,
    /// `None` lets the filtering engine rank the filter by specificity
    pub weight: Option<u64>,
    pub persistent: bool,
    pub conditions: Vec<Condition>,
}

impl FilterPlan {
    pub fn from_filter(filter: &CompiledFilter, identity: &EngineIdentity) -> Self {
        let ipv6 = filter.remote_address.map(|a| a.is_ipv6()).unwrap_or(false);

        let slots = 1
            + usize::from(filter.remote_address.is_some())
            + usize::from(filter.remote_port.is_some())
            + usize::from(filter.process_path.is_some());
        let mut conditions = Vec::with_capacity(slots);

        conditions.push(Condition::Protocol(filter.protocol));

        if let Some(address) = filter.remote_address {
            conditions.push(match address {
                RemoteAddress::V4 { addr, mask } => Condition::RemoteAddressV4 {
                    addr: u32::from(addr),
                    mask: u32::from(mask),
                },
                RemoteAddress::V6 { addr, prefix_len } => Condition::RemoteAddressV6 {
                    addr: addr.octets(),
                    prefix_len,
                },
            });
        }

        if let Some(port) = filter.remote_port {
            conditions.push(match port {
                PortMatch::Exact { port } => Condition::RemotePort(port),
                PortMatch::Range { start, end } => Condition::RemotePortRange { start, end },
            });
        }

        if filter.process_path.is_some() {
            conditions.push(Condition::AppId);
        }

        FilterPlan {
            key: filter.filter_key,
            display_name: filter.display_name.clone(),
            description: filter.description.clone(),
            provider_key: identity.provider_key,
            sublayer_key: identity.sublayer_key,
            layer: FilterLayer::for_filter(filter.direction, ipv6),
            action: filter.action,
            weight: filter.weight,
            persistent: identity.persistent,
            conditions,
        }
    }

    pub fn requires_app_id(&self) -> bool {
        self.conditions.contains(&Condition::AppId)
    }
}

/// Build the native record for `filter` and add it in `session`.
///
/// Returns the engine-assigned filter ID, or [`EXISTING_FILTER_ID`] if a
/// filter with the same key is already installed. The resolved app-id blob
/// is released when this returns, on every path.
pub fn build_and_add_filter<S: BackendSession>(
    session: &S,
    filter: &CompiledFilter,
    identity: &EngineIdentity,
) -> FilterResult<u64> {
    let plan = FilterPlan::from_filter(filter, identity);

    let app_id = match filter.process_path.as_deref() {
        Some(path) => match session.resolve_app_id(path) {
            Ok(blob) => Some(blob),
            Err(status) => {
                log::error!(
                    "Refusing to add '{}': cannot resolve application '{}': {}",
                    filter.display_name, path, status
                );
                return Err(FilterError::ProcessIdentity {
                    path: path.to_string(),
                    status,
                });
            }
        },
        None => None,
    };

    match session.add_filter(&plan, app_id.as_ref()) {
        Ok(filter_id) => {
            log::debug!(
                "Added filter '{}' ({}) on {}, ID: {}",
                filter.display_name,
                filter.filter_key,
                plan.layer.name(),
                filter_id
            );
            Ok(filter_id)
        }
        Err(status) if status.kind() == StatusKind::AlreadyExists => {
            log::debug!("Filter {} already exists", filter.filter_key);
            Ok(EXISTING_FILTER_ID)
        }
        Err(status) => Err(FilterError::native(
            format!("Adding filter '{}'", filter.display_name),
            status,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::protocol;

    fn identity() -> EngineIdentity {
        EngineIdentity::with_keys(Uuid::from_u128(10), Uuid::from_u128(20))
    }

    #[test]
    fn test_protocol_only_has_one_slot() {
        let filter = CompiledFilter::builder("r").protocol(protocol::UDP).build().unwrap();
        let plan = FilterPlan::from_filter(&filter, &identity());
        assert_eq!(plan.conditions, vec![Condition::Protocol(17)]);
        assert!(!plan.requires_app_id());
    }

    #[test]
    fn test_full_filter_has_four_slots() {
        let filter = CompiledFilter::builder("r")
            .remote_host("10.1.2.3".parse().unwrap())
            .remote_port(443)
            .process_path(r"C:\app.exe")
            .build()
            .unwrap();
        let plan = FilterPlan::from_filter(&filter, &identity());
        assert_eq!(
            plan.conditions,
            vec![
                Condition::Protocol(6),
                Condition::RemoteAddressV4 {
                    addr: 0x0A01_0203,
                    mask: 0xFFFF_FFFF
                },
                Condition::RemotePort(443),
                Condition::AppId,
            ]
        );
        assert!(plan.requires_app_id());
    }

    #[test]
    fn test_port_range_uses_range_slot() {
        let filter = CompiledFilter::builder("r").remote_port_range(1000, 2000).build().unwrap();
        let plan = FilterPlan::from_filter(&filter, &identity());
        assert_eq!(plan.conditions.len(), 2);
        assert_eq!(
            plan.conditions[1],
            Condition::RemotePortRange {
                start: 1000,
                end: 2000
            }
        );
    }

    #[test]
    fn test_layer_follows_direction_and_family() {
        let outbound = CompiledFilter::builder("o").build().unwrap();
        let inbound = CompiledFilter::builder("i").direction(Direction::Inbound).build().unwrap();
        let inbound_v6 = CompiledFilter::builder("i6")
            .direction(Direction::Inbound)
            .remote_host("2001:db8::1".parse().unwrap())
            .build()
            .unwrap();

        let id = identity();
        assert_eq!(FilterPlan::from_filter(&outbound, &id).layer, FilterLayer::AleConnectV4);
        assert_eq!(FilterPlan::from_filter(&inbound, &id).layer, FilterLayer::AleRecvAcceptV4);
        assert_eq!(FilterPlan::from_filter(&inbound_v6, &id).layer, FilterLayer::AleRecvAcceptV6);
    }

    #[test]
    fn test_addressless_rules_stay_on_ipv4_layer() {
        let id = identity();
        let port_only = CompiledFilter::builder("p").remote_port(53).build().unwrap();
        let scoped = CompiledFilter::builder("s").process_path(r"C:\app.exe").build().unwrap();
        assert_eq!(FilterPlan::from_filter(&port_only, &id).layer, FilterLayer::AleConnectV4);
        assert_eq!(FilterPlan::from_filter(&scoped, &id).layer, FilterLayer::AleConnectV4);
    }

    #[test]
    fn test_plan_carries_identity_and_weight() {
        let filter = CompiledFilter::builder("r").weight(42).build().unwrap();
        let plan = FilterPlan::from_filter(&filter, &identity());
        assert_eq!(plan.provider_key, Uuid::from_u128(10));
        assert_eq!(plan.sublayer_key, Uuid::from_u128(20));
        assert_eq!(plan.weight, Some(42));
        assert_eq!(plan.key, filter.filter_key);
        assert!(plan.persistent);
    }

    #[test]
    fn test_unweighted_filter_leaves_weight_empty() {
        let filter = CompiledFilter::builder("r").build().unwrap();
        assert_eq!(FilterPlan::from_filter(&filter, &identity()).weight, None);
    }
}

//! Native record marshalling
//!
//! `FWPM_FILTER0` is a tree of raw pointers: display strings, the provider
//! key, the weight and every non-scalar condition value live outside the
//! struct. [`FilterArena`] owns all of that storage for exactly one
//! `FwpmFilterAdd0` call; the [`NativeFilter`] it hands out borrows the arena
//! so the record cannot outlive the memory it points into.

use crate::builder::{Condition, FilterLayer, FilterPlan};
use crate::filter::FilterAction;
use std::marker::PhantomData;
use uuid::Uuid;
use windows::core::{GUID, PWSTR};
use windows::Win32::NetworkManagement::WindowsFilteringPlatform::*;

pub(super) fn to_guid(key: &Uuid) -> GUID {
    GUID::from_u128(key.as_u128())
}

pub(super) fn from_guid(guid: &GUID) -> Uuid {
    Uuid::from_u128(guid.to_u128())
}

/// NUL-terminated UTF-16
pub(super) fn wide(value: &str) -> Vec<u16> {
    value.encode_utf16().chain(std::iter::once(0)).collect()
}

pub(super) fn layer_key(layer: FilterLayer) -> GUID {
    match layer {
        FilterLayer::AleConnectV4 => FWPM_LAYER_ALE_AUTH_CONNECT_V4,
        FilterLayer::AleConnectV6 => FWPM_LAYER_ALE_AUTH_CONNECT_V6,
        FilterLayer::AleRecvAcceptV4 => FWPM_LAYER_ALE_AUTH_RECV_ACCEPT_V4,
        FilterLayer::AleRecvAcceptV6 => FWPM_LAYER_ALE_AUTH_RECV_ACCEPT_V6,
    }
}

/// Storage behind one native filter record
pub(super) struct FilterArena {
    key: GUID,
    sublayer_key: GUID,
    layer: GUID,
    action: FilterAction,
    persistent: bool,
    name: Vec<u16>,
    description: Vec<u16>,
    provider_key: Box<GUID>,
    weight: Option<Box<u64>>,
    // Boxed so condition pointers stay valid when the arena moves
    v4: Box<FWP_V4_ADDR_AND_MASK>,
    v6: Box<FWP_V6_ADDR_AND_MASK>,
    range: Box<FWP_RANGE0>,
    conditions: Vec<FWPM_FILTER_CONDITION0>,
}

impl FilterArena {
    /// `app_id` must stay alive until the record has been handed to the engine
    pub(super) fn new(plan: &FilterPlan, app_id: Option<*mut FWP_BYTE_BLOB>) -> Self {
        let mut arena = Self {
            key: to_guid(&plan.key),
            sublayer_key: to_guid(&plan.sublayer_key),
            layer: layer_key(plan.layer),
            action: plan.action,
            persistent: plan.persistent,
            name: wide(&plan.display_name),
            description: wide(&plan.description),
            provider_key: Box::new(to_guid(&plan.provider_key)),
            weight: plan.weight.map(Box::new),
            v4: Box::default(),
            v6: Box::default(),
            range: Box::default(),
            conditions: Vec::with_capacity(plan.conditions.len()),
        };

        for condition in &plan.conditions {
            let native = match *condition {
                Condition::Protocol(protocol) => FWPM_FILTER_CONDITION0 {
                    fieldKey: FWPM_CONDITION_IP_PROTOCOL,
                    matchType: FWP_MATCH_EQUAL,
                    conditionValue: FWP_CONDITION_VALUE0 {
                        r#type: FWP_UINT8,
                        Anonymous: FWP_CONDITION_VALUE0_0 { uint8: protocol },
                    },
                },
                Condition::RemoteAddressV4 { addr, mask } => {
                    arena.v4.addr = addr;
                    arena.v4.mask = mask;
                    FWPM_FILTER_CONDITION0 {
                        fieldKey: FWPM_CONDITION_IP_REMOTE_ADDRESS,
                        matchType: FWP_MATCH_EQUAL,
                        conditionValue: FWP_CONDITION_VALUE0 {
                            r#type: FWP_V4_ADDR_MASK,
                            Anonymous: FWP_CONDITION_VALUE0_0 {
                                v4AddrMask: &mut *arena.v4 as *mut _,
                            },
                        },
                    }
                }
                Condition::RemoteAddressV6 { addr, prefix_len } => {
                    arena.v6.addr = addr;
                    arena.v6.prefixLength = prefix_len;
                    FWPM_FILTER_CONDITION0 {
                        fieldKey: FWPM_CONDITION_IP_REMOTE_ADDRESS,
                        matchType: FWP_MATCH_EQUAL,
                        conditionValue: FWP_CONDITION_VALUE0 {
                            r#type: FWP_V6_ADDR_MASK,
                            Anonymous: FWP_CONDITION_VALUE0_0 {
                                v6AddrMask: &mut *arena.v6 as *mut _,
                            },
                        },
                    }
                }
                Condition::RemotePort(port) => FWPM_FILTER_CONDITION0 {
                    fieldKey: FWPM_CONDITION_IP_REMOTE_PORT,
                    matchType: FWP_MATCH_EQUAL,
                    conditionValue: FWP_CONDITION_VALUE0 {
                        r#type: FWP_UINT16,
                        Anonymous: FWP_CONDITION_VALUE0_0 { uint16: port },
                    },
                },
                Condition::RemotePortRange { start, end } => {
                    *arena.range = FWP_RANGE0 {
                        valueLow: FWP_VALUE0 {
                            r#type: FWP_UINT16,
                            Anonymous: FWP_VALUE0_0 { uint16: start },
                        },
                        valueHigh: FWP_VALUE0 {
                            r#type: FWP_UINT16,
                            Anonymous: FWP_VALUE0_0 { uint16: end },
                        },
                    };
                    FWPM_FILTER_CONDITION0 {
                        fieldKey: FWPM_CONDITION_IP_REMOTE_PORT,
                        matchType: FWP_MATCH_RANGE,
                        conditionValue: FWP_CONDITION_VALUE0 {
                            r#type: FWP_RANGE_TYPE,
                            Anonymous: FWP_CONDITION_VALUE0_0 {
                                rangeValue: &mut *arena.range as *mut _,
                            },
                        },
                    }
                }
                Condition::AppId => match app_id {
                    Some(blob) => FWPM_FILTER_CONDITION0 {
                        fieldKey: FWPM_CONDITION_ALE_APP_ID,
                        matchType: FWP_MATCH_EQUAL,
                        conditionValue: FWP_CONDITION_VALUE0 {
                            r#type: FWP_BYTE_BLOB_TYPE,
                            Anonymous: FWP_CONDITION_VALUE0_0 { byteBlob: blob },
                        },
                    },
                    // Never reached: the builder refuses to add a process
                    // rule without a resolved blob
                    None => continue,
                },
            };
            arena.conditions.push(native);
        }

        arena
    }

    pub(super) fn condition_count(&self) -> usize {
        self.conditions.len()
    }

    pub(super) fn native(&mut self) -> NativeFilter<'_> {
        let weight = match self.weight.as_deref_mut() {
            Some(weight) => FWP_VALUE0 {
                r#type: FWP_UINT64,
                Anonymous: FWP_VALUE0_0 {
                    uint64: weight as *mut u64,
                },
            },
            // Empty weight: the engine ranks the filter by specificity
            None => FWP_VALUE0::default(),
        };

        let action = match self.action {
            FilterAction::Allow => FWP_ACTION_PERMIT,
            FilterAction::Block => FWP_ACTION_BLOCK,
        };

        let flags = if self.persistent {
            FWPM_FILTER_FLAG_PERSISTENT
        } else {
            FWPM_FILTER_FLAGS(0)
        };

        let raw = FWPM_FILTER0 {
            filterKey: self.key,
            displayData: FWPM_DISPLAY_DATA0 {
                name: PWSTR::from_raw(self.name.as_mut_ptr()),
                description: PWSTR::from_raw(self.description.as_mut_ptr()),
            },
            flags,
            providerKey: &mut *self.provider_key as *mut GUID,
            layerKey: self.layer,
            subLayerKey: self.sublayer_key,
            weight,
            numFilterConditions: self.conditions.len() as u32,
            filterCondition: self.conditions.as_mut_ptr(),
            action: FWPM_ACTION0 {
                r#type: action,
                Anonymous: FWPM_ACTION0_0 {
                    filterType: GUID::zeroed(),
                },
            },
            ..Default::default()
        };

        NativeFilter {
            raw,
            _arena: PhantomData,
        }
    }
}

/// Filter record borrowing its arena
pub(super) struct NativeFilter<'a> {
    pub(super) raw: FWPM_FILTER0,
    _arena: PhantomData<&'a mut FilterArena>,
}

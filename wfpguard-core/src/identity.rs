//! Provider and sublayer identity
//!
//! The provider and sublayer GUIDs are the engine's namespace in the filter
//! table: every filter it owns lives in this sublayer and references this
//! provider. They must stay stable across restarts and upgrades. Tests and
//! side-by-side installs inject a different identity instead of touching
//! the well-known one.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Well-known provider key
pub const WFPGUARD_PROVIDER_KEY: Uuid = Uuid::from_u128(0x5f3b9c4e_7a21_4d6b_9e0f_2c8a1b7d4e31);

/// Well-known sublayer key
pub const WFPGUARD_SUBLAYER_KEY: Uuid = Uuid::from_u128(0x5f3b9c4e_7a21_4d6b_9e0f_2c8a1b7d4e32);

const PROVIDER_NAME: &str = "WfpGuard";
const PROVIDER_DESC: &str = "WfpGuard host firewall provider";
const SUBLAYER_NAME: &str = "WfpGuard Policy Sublayer";
const SUBLAYER_DESC: &str = "Filters installed from the WfpGuard policy";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineIdentity {
    pub provider_key: Uuid,
    pub sublayer_key: Uuid,
    pub provider_name: String,
    pub provider_description: String,
    pub sublayer_name: String,
    pub sublayer_description: String,
    /// Sublayer priority relative to other vendors' sublayers
    pub sublayer_weight: u16,
    /// Survive BFE restarts and reboots
    pub persistent: bool,
}

impl Default for EngineIdentity {
    fn default() -> Self {
        Self {
            provider_key: WFPGUARD_PROVIDER_KEY,
            sublayer_key: WFPGUARD_SUBLAYER_KEY,
            provider_name: PROVIDER_NAME.to_string(),
            provider_description: PROVIDER_DESC.to_string(),
            sublayer_name: SUBLAYER_NAME.to_string(),
            sublayer_description: SUBLAYER_DESC.to_string(),
            sublayer_weight: 0x8000,
            persistent: true,
        }
    }
}

impl EngineIdentity {
    /// Same display data, different keys
    pub fn with_keys(provider_key: Uuid, sublayer_key: Uuid) -> Self {
        Self {
            provider_key,
            sublayer_key,
            ..Self::default()
        }
    }

    pub fn provider_spec(&self) -> ProviderSpec {
        ProviderSpec {
            key: self.provider_key,
            name: self.provider_name.clone(),
            description: self.provider_description.clone(),
            persistent: self.persistent,
        }
    }

    pub fn sublayer_spec(&self) -> SublayerSpec {
        SublayerSpec {
            key: self.sublayer_key,
            provider_key: self.provider_key,
            name: self.sublayer_name.clone(),
            description: self.sublayer_description.clone(),
            weight: self.sublayer_weight,
            persistent: self.persistent,
        }
    }
}

/// Provider record handed to the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSpec {
    pub key: Uuid,
    pub name: String,
    pub description: String,
    pub persistent: bool,
}

/// Sublayer record handed to the backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SublayerSpec {
    pub key: Uuid,
    pub provider_key: Uuid,
    pub name: String,
    pub description: String,
    pub weight: u16,
    pub persistent: bool,
}

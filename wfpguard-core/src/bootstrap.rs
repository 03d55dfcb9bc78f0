//! Provider and sublayer bootstrap
//!
//! Both operations run in their own transaction. "Already exists" on create
//! and "not found" on delete count as success, so racing installers and
//! retried calls converge on the same state.

use crate::backend::BackendSession;
use crate::error::{FilterError, FilterResult};
use crate::identity::EngineIdentity;
use crate::session::with_transaction;
use crate::status::{NativeStatus, StatusKind};

/// Whether the provider is registered
pub fn provider_exists<S: BackendSession>(
    session: &S,
    identity: &EngineIdentity,
) -> FilterResult<bool> {
    lookup(session.get_provider(&identity.provider_key), "FwpmProviderGetByKey0")
}

/// Whether the sublayer is registered
pub fn sublayer_exists<S: BackendSession>(
    session: &S,
    identity: &EngineIdentity,
) -> FilterResult<bool> {
    lookup(session.get_sublayer(&identity.sublayer_key), "FwpmSubLayerGetByKey0")
}

fn lookup(result: Result<(), NativeStatus>, operation: &str) -> FilterResult<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(status) if status.kind() == StatusKind::NotFound => Ok(false),
        Err(status) => Err(FilterError::native(operation, status)),
    }
}

/// Create the provider and sublayer if missing
pub fn ensure_provider_and_sublayer<S: BackendSession>(
    session: &S,
    identity: &EngineIdentity,
) -> FilterResult<()> {
    // Already bootstrapped: no transaction
    if provider_exists(session, identity)? && sublayer_exists(session, identity)? {
        log::debug!("Provider and sublayer already registered");
        return Ok(());
    }

    with_transaction(session, |s| {
        if !provider_exists(s, identity)? {
            match s.add_provider(&identity.provider_spec()) {
                Ok(()) => log::info!("WFP provider registered: {}", identity.provider_name),
                Err(status) if status.created_or_exists() => {
                    log::info!("WFP provider already registered")
                }
                Err(status) => return Err(FilterError::native("FwpmProviderAdd0", status)),
            }
        }

        if !sublayer_exists(s, identity)? {
            match s.add_sublayer(&identity.sublayer_spec()) {
                Ok(()) => log::info!("WFP sublayer created: {}", identity.sublayer_name),
                Err(status) if status.created_or_exists() => {
                    log::info!("WFP sublayer already exists")
                }
                Err(status) => return Err(FilterError::native("FwpmSubLayerAdd0", status)),
            }
        }

        Ok(())
    })
}

/// Remove the sublayer, then the provider
///
/// Fails with [`FilterError::SublayerInUse`] while the sublayer still holds
/// filters; nothing is removed in that case.
pub fn remove_provider_and_sublayer<S: BackendSession>(
    session: &S,
    identity: &EngineIdentity,
) -> FilterResult<()> {
    with_transaction(session, |s| {
        match s.delete_sublayer(&identity.sublayer_key) {
            Ok(()) => log::info!("WFP sublayer removed: {}", identity.sublayer_name),
            Err(status) if status.kind() == StatusKind::InUse => {
                log::warn!("Sublayer {} still holds filters", identity.sublayer_key);
                return Err(FilterError::SublayerInUse {
                    sublayer: identity.sublayer_key,
                });
            }
            Err(status) if status.deleted_or_missing() => {
                log::debug!("WFP sublayer already removed")
            }
            Err(status) => return Err(FilterError::native("FwpmSubLayerDeleteByKey0", status)),
        }

        match s.delete_provider(&identity.provider_key) {
            Ok(()) => log::info!("WFP provider removed: {}", identity.provider_name),
            Err(status) if status.deleted_or_missing() => {
                log::debug!("WFP provider already removed")
            }
            Err(status) => return Err(FilterError::native("FwpmProviderDeleteByKey0", status)),
        }

        Ok(())
    })
}

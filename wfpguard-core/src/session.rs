//! Sessions and transactions
//!
//! A session is whatever [`FilterBackend::open_session`] returns; it closes
//! itself when dropped. A [`Transaction`] aborts itself when dropped unless
//! [`Transaction::commit`] succeeded, so an early `?`, a failed commit and a
//! panic all leave the filter table exactly as it was.

use crate::backend::{BackendSession, FilterBackend};
use crate::error::{FilterError, FilterResult};

/// Open a session, logging the failure with context
pub fn open_session<B: FilterBackend>(backend: &B) -> FilterResult<B::Session> {
    backend.open_session().map_err(|e| {
        log::error!("Failed to open filter engine session: {}", e);
        e
    })
}

/// Open transaction, aborted on drop unless committed
pub struct Transaction<'s, S: BackendSession> {
    session: &'s S,
    committed: bool,
}

impl<'s, S: BackendSession> Transaction<'s, S> {
    pub fn begin(session: &'s S) -> FilterResult<Self> {
        session
            .begin_transaction()
            .map_err(|status| FilterError::native("FwpmTransactionBegin0", status))?;
        log::debug!("Filter transaction started");
        Ok(Self {
            session,
            committed: false,
        })
    }

    pub fn session(&self) -> &'s S {
        self.session
    }

    pub fn commit(mut self) -> FilterResult<()> {
        self.session
            .commit_transaction()
            .map_err(|status| FilterError::native("FwpmTransactionCommit0", status))?;
        self.committed = true;
        log::debug!("Filter transaction committed");
        Ok(())
    }
}

impl<S: BackendSession> Drop for Transaction<'_, S> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match self.session.abort_transaction() {
            Ok(()) => log::warn!("Filter transaction aborted, no changes applied"),
            Err(status) => log::warn!("Failed to abort filter transaction: {}", status),
        }
    }
}

/// Run `body` inside a transaction; commit only if it returns `Ok`
pub fn with_transaction<S, T, F>(session: &S, body: F) -> FilterResult<T>
where
    S: BackendSession,
    F: FnOnce(&S) -> FilterResult<T>,
{
    let txn = Transaction::begin(session)?;
    let value = body(txn.session())?;
    txn.commit()?;
    Ok(value)
}

//! Filter enumeration
//!
//! The native enumeration API has no sublayer predicate, so every filter in
//! the table is read back in fixed-size batches and filtered here.

use crate::backend::BackendSession;
use crate::error::{FilterError, FilterResult};
use crate::filter::ExistingFilter;
use uuid::Uuid;

/// Records requested per `FwpmFilterEnum0` call
pub const DEFAULT_BATCH_SIZE: u32 = 100;

/// Destroys the enumeration cursor on drop
struct CursorGuard<'s, S: BackendSession> {
    session: &'s S,
    cursor: S::Cursor,
}

impl<S: BackendSession> Drop for CursorGuard<'_, S> {
    fn drop(&mut self) {
        // A leaked cursor cannot corrupt the table
        if let Err(status) = self.session.destroy_filter_enum(self.cursor) {
            log::warn!("Failed to destroy filter enumeration handle: {}", status);
        }
    }
}

/// Every filter in `sublayer_key`, read back in batches of `batch_size`
pub fn enumerate_filters_in_sublayer<S: BackendSession>(
    session: &S,
    sublayer_key: &Uuid,
    batch_size: u32,
) -> FilterResult<Vec<ExistingFilter>> {
    let batch_size = batch_size.max(1);

    let cursor = session
        .create_filter_enum()
        .map_err(|status| FilterError::native("FwpmFilterCreateEnumHandle0", status))?;
    let guard = CursorGuard { session, cursor };

    let mut found = Vec::new();
    let mut scanned = 0usize;

    loop {
        let batch = guard
            .session
            .fetch_filters(guard.cursor, batch_size)
            .map_err(|status| FilterError::native("FwpmFilterEnum0", status))?;
        if batch.is_empty() {
            break;
        }
        scanned += batch.len();
        found.extend(
            batch
                .into_iter()
                .filter(|record| record.sublayer_key == *sublayer_key)
                .map(ExistingFilter::from),
        );
    }

    log::debug!(
        "Enumerated {} filters, {} in sublayer {}",
        scanned,
        found.len(),
        sublayer_key
    );
    Ok(found)
}

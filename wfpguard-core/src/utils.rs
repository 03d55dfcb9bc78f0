//! Small helpers shared by the engine and the binaries

use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
//  RETRY UTILITIES
// ═══════════════════════════════════════════════════════════════════════════════

/// Default retry delays in milliseconds (exponential backoff)
const DEFAULT_RETRY_DELAYS: [u64; 3] = [250, 500, 1000];

/// Retry a synchronous operation with exponential backoff
///
/// Stops at the first success, or at the first error `should_retry`
/// rejects. `max_attempts` is clamped to 1..=10.
pub fn with_retry_sync<T, E, F, P>(
    max_attempts: u32,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = max_attempts.clamp(1, 10);
    let mut attempt = 1;

    loop {
        match operation() {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt >= max_attempts {
                    if max_attempts > 1 {
                        log::error!("All {} attempts failed. Last error: {}", max_attempts, e);
                    }
                    return Err(e);
                }
                if !should_retry(&e) {
                    return Err(e);
                }

                let delay_idx = (attempt as usize - 1).min(DEFAULT_RETRY_DELAYS.len() - 1);
                let delay_ms = DEFAULT_RETRY_DELAYS[delay_idx];
                log::warn!(
                    "Attempt {}/{} failed: {}, retrying in {}ms...",
                    attempt, max_attempts, e, delay_ms
                );
                std::thread::sleep(Duration::from_millis(delay_ms));
                attempt += 1;
            }
        }
    }
}

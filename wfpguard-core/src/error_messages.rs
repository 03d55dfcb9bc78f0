//! User-Friendly Error Messages
//!
//! Converts engine errors into text a control-plane client can show to a
//! person. Raw WFP codes are replaced with what they mean.

use crate::error::FilterError;
use crate::status::{ERROR_ACCESS_DENIED, RPC_S_SERVER_UNAVAILABLE};
use std::sync::OnceLock;

/// Convert an engine error into a user-friendly message
pub fn user_friendly_error(error: &FilterError) -> String {
    match error {
        FilterError::SublayerInUse { .. } => {
            "Firewall rules are still installed.\n\nRemove all filters before uninstalling.".to_string()
        }

        FilterError::ProcessIdentity { path, .. } => {
            format!(
                "Application not found.\n\nThe rule targets '{}', which could not be resolved. The rule was not installed.",
                path
            )
        }

        FilterError::InvalidFilter { rule_id, reason } => {
            format!("Invalid rule '{}'.\n\n{}", rule_id, reason)
        }

        FilterError::NotSupported => {
            "Windows Filtering Platform is not available.\n\nThis feature requires Windows.".to_string()
        }

        FilterError::Native { operation, status } => {
            if status.code() == ERROR_ACCESS_DENIED {
                "Administrator privileges required.\n\nPlease run as Administrator.".to_string()
            } else if status.code() == RPC_S_SERVER_UNAVAILABLE {
                "Base Filtering Engine is not running.\n\nStart the BFE service and try again.".to_string()
            } else if error.is_recoverable() {
                "The firewall is busy.\n\nPlease try again in a moment.".to_string()
            } else {
                format!(
                    "Firewall update failed.\n\n{}",
                    simplify_message(&format!("{} failed: {}", operation, status))
                )
            }
        }

        FilterError::Unexpected { .. } => {
            "Internal error.\n\nNo changes were applied.".to_string()
        }

        FilterError::Settings(msg) => {
            format!("Invalid configuration.\n\n{}", simplify_message(msg))
        }

        FilterError::Io(e) => {
            format!("System error.\n\n{}", e)
        }
    }
}

/// Simplify a technical message by removing error codes and hex values
fn simplify_message(msg: &str) -> String {
    let simplified = msg
        .replace("0x80320009 (FWP_E_ALREADY_EXISTS)", "already exists")
        .replace("0x80320008 (FWP_E_NOT_FOUND)", "not found")
        .replace("0x80320007 (FWP_E_SUBLAYER_NOT_FOUND)", "sublayer not found")
        .replace("0x80320005 (FWP_E_PROVIDER_NOT_FOUND)", "provider not found")
        .replace("0x80320004 (FWP_E_LAYER_NOT_FOUND)", "layer not found")
        .replace("0x8032000A (FWP_E_IN_USE)", "in use");

    // Remove remaining hex codes like "0x8007xxxx"
    static RE_HEX: OnceLock<Option<regex_lite::Regex>> = OnceLock::new();
    match RE_HEX.get_or_init(|| regex_lite::Regex::new(r"0x[0-9a-fA-F]{8}").ok()) {
        Some(re) => re.replace_all(&simplified, "[error]").to_string(),
        None => simplified,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{NativeStatus, FWP_E_TIMEOUT, FWP_E_ALREADY_EXISTS};
    use uuid::Uuid;

    #[test]
    fn test_access_denied_message() {
        let err = FilterError::native("FwpmEngineOpen0", NativeStatus(ERROR_ACCESS_DENIED));
        assert!(user_friendly_error(&err).contains("Administrator"));
    }

    #[test]
    fn test_bfe_unavailable_message() {
        let err = FilterError::native("FwpmEngineOpen0", NativeStatus(RPC_S_SERVER_UNAVAILABLE));
        assert!(user_friendly_error(&err).contains("BFE"));
    }

    #[test]
    fn test_transient_message() {
        let err = FilterError::native("FwpmTransactionCommit0", NativeStatus(FWP_E_TIMEOUT));
        assert!(user_friendly_error(&err).contains("try again"));
    }

    #[test]
    fn test_in_use_message() {
        let err = FilterError::SublayerInUse { sublayer: Uuid::nil() };
        assert!(user_friendly_error(&err).contains("Remove all filters"));
    }

    #[test]
    fn test_process_identity_message_names_path() {
        let err = FilterError::ProcessIdentity {
            path: r"C:\Games\game.exe".to_string(),
            status: NativeStatus(2),
        };
        let msg = user_friendly_error(&err);
        assert!(msg.contains(r"C:\Games\game.exe"));
        assert!(msg.contains("not installed"));
    }

    #[test]
    fn test_simplify_message_strips_codes() {
        assert_eq!(
            simplify_message("FwpmSubLayerAdd0 failed: 0x80320009 (FWP_E_ALREADY_EXISTS)"),
            "FwpmSubLayerAdd0 failed: already exists"
        );
        assert_eq!(simplify_message("call failed: 0x12345678"), "call failed: [error]");
    }

    #[test]
    fn test_simplify_message_strips_codes_next_to_punctuation() {
        let err = FilterError::Settings("bad value (0xDEADBEEF), code 0x80320001.".to_string());
        assert_eq!(
            user_friendly_error(&err),
            "Invalid configuration.\n\nbad value ([error]), code [error]."
        );
    }

    #[test]
    fn test_simplify_message_keeps_line_breaks() {
        assert_eq!(simplify_message("line one\n  line two"), "line one\n  line two");
    }

    #[test]
    fn test_generic_native_message_is_simplified() {
        let err = FilterError::native("FwpmSubLayerAdd0", NativeStatus(FWP_E_ALREADY_EXISTS));
        let msg = user_friendly_error(&err);
        assert!(msg.contains("already exists"));
        assert!(!msg.contains("0x8032"));
    }
}

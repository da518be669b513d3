//! Pure mapping from transport closure causes to controller policy.

use serde::{Deserialize, Serialize};

use crate::types::CloseCause;

/// Close code the transport uses when the remote invalidated the device.
pub const LOGGED_OUT_CODE: u16 = 401;
/// Close code the transport uses when it needs a fresh session.
pub const RESTART_REQUIRED_CODE: u16 = 515;

/// Taxonomy of closure reasons.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Remote explicitly invalidated the session; needs a full reset.
    LoggedOut,
    /// Transient renegotiation requested by the transport.
    RestartRequired,
    /// Anything else.
    Unknown,
}

/// What the controller should do about a closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecommendedAction {
    /// Stop and wait for a caller-initiated reset.
    RequireReset,
    /// Retry after consulting the loop guard.
    RetryGuarded,
    /// Retry after the flat moderate delay.
    RetryFlat,
}

/// Classifier output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub reason: DisconnectReason,
    pub action: RecommendedAction,
}

impl Classification {
    pub fn for_reason(reason: DisconnectReason) -> Self {
        let action = match reason {
            DisconnectReason::LoggedOut => RecommendedAction::RequireReset,
            DisconnectReason::RestartRequired => RecommendedAction::RetryGuarded,
            DisconnectReason::Unknown => RecommendedAction::RetryFlat,
        };
        Self { reason, action }
    }

    /// Classification used when opening the transport failed outright.
    pub fn open_failure() -> Self {
        Self::for_reason(DisconnectReason::Unknown)
    }
}

/// Classify a raw closure cause.
pub fn classify_disconnect(cause: &CloseCause) -> Classification {
    let reason = match cause.code {
        Some(code) => classify_close_code(code),
        None => cause
            .message
            .as_deref()
            .map(classify_close_message)
            .unwrap_or(DisconnectReason::Unknown),
    };
    Classification::for_reason(reason)
}

/// Map a transport close code to a reason.
pub fn classify_close_code(code: u16) -> DisconnectReason {
    match code {
        LOGGED_OUT_CODE => DisconnectReason::LoggedOut,
        RESTART_REQUIRED_CODE => DisconnectReason::RestartRequired,
        _ => DisconnectReason::Unknown,
    }
}

fn classify_close_message(message: &str) -> DisconnectReason {
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("logged out") {
        DisconnectReason::LoggedOut
    } else if lowered.contains("restart required") {
        DisconnectReason::RestartRequired
    } else {
        DisconnectReason::Unknown
    }
}

/// Short label for log lines, e.g. `loggedOut` or `code:428`.
pub fn describe_cause(cause: &CloseCause) -> String {
    match (classify_disconnect(cause).reason, cause.code) {
        (DisconnectReason::LoggedOut, _) => "loggedOut".to_owned(),
        (DisconnectReason::RestartRequired, _) => "restartRequired".to_owned(),
        (DisconnectReason::Unknown, Some(code)) => format!("code:{code}"),
        (DisconnectReason::Unknown, None) => "unknown".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_close_codes() {
        assert_eq!(classify_close_code(401), DisconnectReason::LoggedOut);
        assert_eq!(classify_close_code(515), DisconnectReason::RestartRequired);
        assert_eq!(classify_close_code(428), DisconnectReason::Unknown);
        assert_eq!(classify_close_code(500), DisconnectReason::Unknown);
    }

    #[test]
    fn recommends_action_per_reason() {
        let logged_out = classify_disconnect(&CloseCause::with_code(401));
        assert_eq!(logged_out.action, RecommendedAction::RequireReset);

        let restart = classify_disconnect(&CloseCause::with_code(515));
        assert_eq!(restart.action, RecommendedAction::RetryGuarded);

        let other = classify_disconnect(&CloseCause::default());
        assert_eq!(other.reason, DisconnectReason::Unknown);
        assert_eq!(other.action, RecommendedAction::RetryFlat);
    }

    #[test]
    fn falls_back_to_message_hints_without_code() {
        let restart = CloseCause::with_message("Stream Errored (restart required)");
        assert_eq!(
            classify_disconnect(&restart).reason,
            DisconnectReason::RestartRequired
        );

        let logged_out = CloseCause::with_message("Connection Failure: Logged Out");
        assert_eq!(
            classify_disconnect(&logged_out).reason,
            DisconnectReason::LoggedOut
        );
    }

    #[test]
    fn code_takes_precedence_over_message() {
        let cause = CloseCause {
            code: Some(428),
            message: Some("restart required".to_owned()),
        };
        assert_eq!(classify_disconnect(&cause).reason, DisconnectReason::Unknown);
    }

    #[test]
    fn describes_causes_for_log_lines() {
        assert_eq!(describe_cause(&CloseCause::with_code(401)), "loggedOut");
        assert_eq!(describe_cause(&CloseCause::with_code(515)), "restartRequired");
        assert_eq!(describe_cause(&CloseCause::with_code(428)), "code:428");
        assert_eq!(describe_cause(&CloseCause::default()), "unknown");
    }
}

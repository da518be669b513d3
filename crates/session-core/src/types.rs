use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

/// Instance id used when a caller does not name one.
pub const DEFAULT_INSTANCE_ID: &str = "default";

const MAX_INSTANCE_ID_LEN: usize = 64;

/// Sanitized instance identifier.
///
/// Always non-empty and safe to use as a single path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// Sanitize caller input, falling back to [`DEFAULT_INSTANCE_ID`].
    pub fn sanitize(raw: Option<&str>) -> Self {
        Self::sanitize_or(raw, DEFAULT_INSTANCE_ID)
    }

    /// Sanitize caller input, falling back to `fallback` when nothing usable remains.
    pub fn sanitize_or(raw: Option<&str>, fallback: &str) -> Self {
        let candidate = sanitize_component(raw.unwrap_or_default(), MAX_INSTANCE_ID_LEN);
        if !candidate.is_empty() {
            return Self(candidate);
        }

        let fallback = sanitize_component(fallback, MAX_INSTANCE_ID_LEN);
        if fallback.is_empty() {
            Self(DEFAULT_INSTANCE_ID.to_owned())
        } else {
            Self(fallback)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self(DEFAULT_INSTANCE_ID.to_owned())
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn sanitize_component(input: &str, max_len: usize) -> String {
    let mut out = String::with_capacity(input.len().min(max_len));
    let mut last_was_sep = false;
    for ch in input.trim().chars() {
        let next = if ch.is_ascii_alphanumeric() || ch == '-' {
            ch
        } else {
            '_'
        };

        if next == '_' {
            if last_was_sep {
                continue;
            }
            last_was_sep = true;
        } else {
            last_was_sep = false;
        }

        out.push(next);
        if out.len() >= max_len {
            break;
        }
    }

    out.trim_matches('_').to_owned()
}

/// Simplified connection state reported to callers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No transport session exists and none is being attempted.
    #[default]
    Disconnected,
    /// A session is opening, waiting for pairing, or waiting on a scheduled retry.
    Connecting,
    /// The transport session is open.
    Connected,
}

/// Caller-facing status snapshot derived from an instance runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BotStatus {
    /// Sanitized instance id.
    pub instance_id: InstanceId,
    /// Current connection state.
    pub connection_state: ConnectionState,
    /// Convenience flag, `true` only when `connection_state` is `Connected`.
    pub connected: bool,
    /// Whether a pairing code is currently available.
    pub has_pairing_code: bool,
    /// Human-readable note when automatic recovery needs caller attention.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advisory_note: Option<String>,
}

/// Severity of a user-facing log entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// One entry of the user-facing audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogItem {
    /// Milliseconds since Unix epoch.
    pub timestamp_ms: u64,
    pub level: LogLevel,
    pub message: String,
}

/// Raw closure cause as reported by the transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CloseCause {
    /// Transport status code, when one was reported.
    pub code: Option<u16>,
    /// Transport error message, when one was reported.
    pub message: Option<String>,
}

impl CloseCause {
    pub fn with_code(code: u16) -> Self {
        Self {
            code: Some(code),
            message: None,
        }
    }

    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: Some(message.into()),
        }
    }
}

/// Opaque credential material owned by the transport.
///
/// The controller only moves it between the transport and the credential store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CredentialState {
    /// Named key material entries.
    pub entries: BTreeMap<String, String>,
}

impl CredentialState {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }
}

/// Events emitted by a live transport session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A new pairing code (QR payload) was issued.
    PairingCodeIssued(String),
    /// The session is open and authenticated.
    Opened,
    /// The session closed.
    Closed(CloseCause),
    /// Credential material changed and must be persisted.
    CredentialsChanged(CredentialState),
}

/// Observability-only record persisted per instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ProjectionRecord {
    pub instance_id: InstanceId,
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connection_update_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_pairing_code_at_ms: Option<u64>,
}

impl ProjectionRecord {
    pub fn new(instance_id: InstanceId) -> Self {
        Self {
            instance_id,
            ..Self::default()
        }
    }

    /// Merge a patch into the record; set fields win, unset fields are kept.
    pub fn apply(&mut self, patch: &ProjectionPatch) {
        if let Some(connected) = patch.connected {
            self.connected = connected;
        }
        if let Some(at) = patch.last_connection_update_ms {
            self.last_connection_update_ms = Some(at);
        }
        if let Some(at) = patch.last_pairing_code_at_ms {
            self.last_pairing_code_at_ms = Some(at);
        }
    }
}

/// Partial update for a [`ProjectionRecord`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ProjectionPatch {
    pub connected: Option<bool>,
    pub last_connection_update_ms: Option<u64>,
    pub last_pairing_code_at_ms: Option<u64>,
}

impl ProjectionPatch {
    /// Patch recording a connected/disconnected transition at `at_ms`.
    pub fn connection(connected: bool, at_ms: u64) -> Self {
        Self {
            connected: Some(connected),
            last_connection_update_ms: Some(at_ms),
            last_pairing_code_at_ms: None,
        }
    }

    /// Patch recording a pairing code issuance at `at_ms`.
    pub fn pairing_code_issued(at_ms: u64) -> Self {
        Self {
            last_pairing_code_at_ms: Some(at_ms),
            ..Self::default()
        }
    }
}

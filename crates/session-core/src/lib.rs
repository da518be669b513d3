//! Core session-supervision contract shared by the controller runtime and its observers.
//!
//! This crate defines the instance status model, the disconnect taxonomy,
//! reconnect backoff and loop detection, the per-instance state machine, and
//! the observer broadcast hub.

/// Disconnect cause classification.
pub mod classifier;
/// Injected time sources.
pub mod clock;
/// Stable session error types.
pub mod error;
/// Observer fan-out with log and status replay.
pub mod hub;
/// Bounded log history.
pub mod log_ring;
/// Restart-required loop detection.
pub mod loop_guard;
/// Backoff policy and reconnect tuning.
pub mod retry;
/// Per-instance lifecycle state machine.
pub mod state_machine;
/// Status, event and persistence payload types.
pub mod types;

pub use classifier::{
    Classification, DisconnectReason, RecommendedAction, classify_close_code,
    classify_disconnect, describe_cause,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{SessionError, SessionErrorCategory};
pub use hub::{
    BroadcastHub, ChannelObserver, HelloPayload, HubFrame, Observer, ObserverError, ObserverId,
};
pub use log_ring::{DEFAULT_LOG_CAPACITY, LogRing};
pub use loop_guard::{FailureWindow, GuardDecision, LoopGuard};
pub use retry::{ReconnectSettings, RetryPolicy};
pub use state_machine::{ClosedOutcome, ConnectOrigin, InstanceRuntime, SessionSlot};
pub use types::{
    BotStatus, CloseCause, ConnectionEvent, ConnectionState, CredentialState, DEFAULT_INSTANCE_ID,
    InstanceId, LogItem, LogLevel, ProjectionPatch, ProjectionRecord,
};

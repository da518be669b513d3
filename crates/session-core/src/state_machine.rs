use std::time::{Duration, Instant};

use crate::{
    classifier::{Classification, DisconnectReason, classify_disconnect},
    error::SessionError,
    loop_guard::{FailureWindow, GuardDecision, LoopGuard},
    types::{BotStatus, CloseCause, ConnectionState, InstanceId},
};

pub const LOGGED_OUT_ADVISORY: &str =
    "The session was logged out remotely. Call reset to pair a new device.";
pub const RESTART_ADVISORY: &str = "The transport requested a restart; reconnecting.";
pub const RECONNECTING_ADVISORY: &str = "Connection lost; reconnecting.";

/// What currently occupies the instance's single transport slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSlot {
    /// Nothing open, nothing pending.
    Idle,
    /// `Transport::open` is in flight.
    Opening,
    /// A transport handle is live.
    Live,
    /// A retry is scheduled for the current generation.
    RetryPending,
}

/// Who asked for a session to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOrigin {
    /// A caller invoked `connect`, `ensure` or `reset`.
    Caller,
    /// A retry scheduled for `generation` came due.
    ScheduledRetry { generation: u64 },
}

/// Result of feeding a closure into the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedOutcome {
    /// The closure belongs to a superseded session and was ignored.
    Stale,
    /// A manual disconnect was in progress; no retry.
    ManualStop,
    /// Recovery needs a caller-initiated reset.
    Halted { classification: Classification },
    /// A retry must be scheduled for `generation` after `delay`.
    RetryScheduled {
        classification: Classification,
        generation: u64,
        delay: Duration,
        occurrences: Option<usize>,
    },
    /// The loop guard suspended automatic recovery.
    LoopDetected {
        classification: Classification,
        occurrences: usize,
    },
}

/// Per-instance lifecycle state, free of any I/O.
///
/// Every session attempt gets a new generation; work tagged with an older
/// generation is stale and must be discarded.
#[derive(Debug, Clone)]
pub struct InstanceRuntime {
    instance_id: InstanceId,
    state: ConnectionState,
    pairing_code: Option<String>,
    manual_disconnect_requested: bool,
    failure_window: FailureWindow,
    advisory_note: Option<String>,
    generation: u64,
    slot: SessionSlot,
}

impl InstanceRuntime {
    pub fn new(instance_id: InstanceId) -> Self {
        Self {
            instance_id,
            state: ConnectionState::Disconnected,
            pairing_code: None,
            manual_disconnect_requested: false,
            failure_window: FailureWindow::default(),
            advisory_note: None,
            generation: 0,
            slot: SessionSlot::Idle,
        }
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn pairing_code(&self) -> Option<&str> {
        self.pairing_code.as_deref()
    }

    pub fn advisory_note(&self) -> Option<&str> {
        self.advisory_note.as_deref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn slot(&self) -> SessionSlot {
        self.slot
    }

    pub fn manual_disconnect_requested(&self) -> bool {
        self.manual_disconnect_requested
    }

    pub fn failure_count(&self) -> usize {
        self.failure_window.len()
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    /// Whether an open or a retry is outstanding.
    pub fn attempt_in_flight(&self) -> bool {
        self.slot != SessionSlot::Idle
    }

    pub fn status(&self) -> BotStatus {
        BotStatus {
            instance_id: self.instance_id.clone(),
            connection_state: self.state,
            connected: self.state == ConnectionState::Connected,
            has_pairing_code: self.pairing_code.is_some(),
            advisory_note: self.advisory_note.clone(),
        }
    }

    /// Enter `Connecting` with a fresh generation.
    ///
    /// Callers are refused while a session is connecting or connected; a
    /// scheduled retry is refused unless it is still the pending one.
    pub fn begin_connect(&mut self, origin: ConnectOrigin) -> Result<u64, SessionError> {
        match origin {
            ConnectOrigin::Caller => {
                if self.state != ConnectionState::Disconnected {
                    return Err(SessionError::invalid_state(self.state, "connect"));
                }
                self.failure_window.clear();
                self.advisory_note = None;
            }
            ConnectOrigin::ScheduledRetry { generation } => {
                if generation != self.generation {
                    return Err(SessionError::stale_generation(self.generation, generation));
                }
                if self.manual_disconnect_requested || self.slot != SessionSlot::RetryPending {
                    return Err(SessionError::invalid_state(self.state, "scheduled retry"));
                }
            }
        }

        self.generation += 1;
        self.state = ConnectionState::Connecting;
        self.pairing_code = None;
        self.manual_disconnect_requested = false;
        self.slot = SessionSlot::Opening;
        Ok(self.generation)
    }

    /// The transport handed back a live handle for `generation`.
    pub fn on_session_ready(&mut self, generation: u64) -> bool {
        if !self.is_current(generation) || self.slot != SessionSlot::Opening {
            return false;
        }
        self.slot = SessionSlot::Live;
        true
    }

    pub fn on_pairing_code(&mut self, generation: u64, code: String) -> bool {
        if !self.accepts_session_event(generation) {
            return false;
        }
        self.pairing_code = Some(code);
        self.state = ConnectionState::Connecting;
        true
    }

    pub fn on_opened(&mut self, generation: u64) -> bool {
        if !self.accepts_session_event(generation) {
            return false;
        }
        self.pairing_code = None;
        self.failure_window.clear();
        self.advisory_note = None;
        self.state = ConnectionState::Connected;
        true
    }

    /// Whether credential updates from `generation` may be persisted.
    pub fn accepts_credentials(&self, generation: u64) -> bool {
        self.accepts_session_event(generation)
    }

    pub fn on_closed(
        &mut self,
        generation: u64,
        cause: &CloseCause,
        now: Instant,
        guard: &LoopGuard,
        unknown_delay: Duration,
    ) -> ClosedOutcome {
        self.close_with(
            generation,
            classify_disconnect(cause),
            now,
            guard,
            unknown_delay,
        )
    }

    /// Opening the transport failed; handled as an unclassified closure.
    pub fn on_open_failed(
        &mut self,
        generation: u64,
        now: Instant,
        guard: &LoopGuard,
        unknown_delay: Duration,
    ) -> ClosedOutcome {
        if self.slot != SessionSlot::Opening {
            return ClosedOutcome::Stale;
        }
        self.close_with(
            generation,
            Classification::open_failure(),
            now,
            guard,
            unknown_delay,
        )
    }

    /// First half of a caller-initiated teardown.
    pub fn request_manual_disconnect(&mut self) {
        self.manual_disconnect_requested = true;
    }

    /// Second half of a caller-initiated teardown: force `Disconnected`.
    ///
    /// Bumps the generation so late events and pending retries turn stale.
    pub fn complete_disconnect(&mut self) {
        self.generation += 1;
        self.slot = SessionSlot::Idle;
        self.pairing_code = None;
        self.advisory_note = None;
        self.state = ConnectionState::Disconnected;
    }

    /// Park the instance in `Disconnected` with a note for the caller.
    pub fn suspend(&mut self, note: impl Into<String>) {
        self.complete_disconnect();
        self.advisory_note = Some(note.into());
    }

    fn accepts_session_event(&self, generation: u64) -> bool {
        self.is_current(generation)
            && matches!(self.slot, SessionSlot::Opening | SessionSlot::Live)
    }

    fn close_with(
        &mut self,
        generation: u64,
        classification: Classification,
        now: Instant,
        guard: &LoopGuard,
        unknown_delay: Duration,
    ) -> ClosedOutcome {
        if !self.accepts_session_event(generation) {
            return ClosedOutcome::Stale;
        }
        self.slot = SessionSlot::Idle;
        self.pairing_code = None;

        if self.manual_disconnect_requested {
            self.state = ConnectionState::Disconnected;
            return ClosedOutcome::ManualStop;
        }

        match classification.reason {
            DisconnectReason::LoggedOut => {
                self.state = ConnectionState::Disconnected;
                self.advisory_note = Some(LOGGED_OUT_ADVISORY.to_owned());
                ClosedOutcome::Halted { classification }
            }
            DisconnectReason::RestartRequired => {
                match guard.record(&mut self.failure_window, now) {
                    GuardDecision::Retry { delay, occurrences } => {
                        self.state = ConnectionState::Connecting;
                        self.advisory_note = Some(RESTART_ADVISORY.to_owned());
                        self.slot = SessionSlot::RetryPending;
                        ClosedOutcome::RetryScheduled {
                            classification,
                            generation: self.generation,
                            delay,
                            occurrences: Some(occurrences),
                        }
                    }
                    GuardDecision::LoopDetected { occurrences } => {
                        self.state = ConnectionState::Disconnected;
                        self.advisory_note = Some(loop_advisory(occurrences, guard.window()));
                        ClosedOutcome::LoopDetected {
                            classification,
                            occurrences,
                        }
                    }
                }
            }
            DisconnectReason::Unknown => {
                self.state = ConnectionState::Connecting;
                self.advisory_note = Some(RECONNECTING_ADVISORY.to_owned());
                self.slot = SessionSlot::RetryPending;
                ClosedOutcome::RetryScheduled {
                    classification,
                    generation: self.generation,
                    delay: unknown_delay,
                    occurrences: None,
                }
            }
        }
    }
}

/// Advisory shown when the loop guard suspends recovery.
pub fn loop_advisory(occurrences: usize, window: Duration) -> String {
    format!(
        "Reconnect loop detected: {occurrences} restart-required disconnects within {}s. \
         Automatic reconnect is suspended; check network, firewall or DNS access, then call connect or reset.",
        window.as_secs()
    )
}

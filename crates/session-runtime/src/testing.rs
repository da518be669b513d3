//! In-process transport driven by tests and the smoke binary.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use session_core::{ConnectionEvent, CredentialState, InstanceId};
use tokio::{
    sync::{mpsc, watch},
    time::timeout,
};

use crate::transport::{Transport, TransportError, TransportHandle, TransportSession};

/// Event replayed into every opened session after `after` has elapsed
/// since the previous step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptStep {
    pub after: Duration,
    pub event: ConnectionEvent,
}

impl ScriptStep {
    pub fn new(after: Duration, event: ConnectionEvent) -> Self {
        Self { after, event }
    }
}

/// How logout and close calls behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TeardownBehavior {
    #[default]
    Succeed,
    Fail,
    /// Never resolve, to exercise teardown timeouts.
    Hang,
}

#[derive(Debug, Default)]
struct SessionFlags {
    live: AtomicBool,
    logout_requested: AtomicBool,
    closed: AtomicBool,
}

#[derive(Debug)]
struct SessionRecord {
    instance_id: InstanceId,
    credentials: CredentialState,
    events: Option<mpsc::UnboundedSender<ConnectionEvent>>,
    flags: Arc<SessionFlags>,
}

#[derive(Debug, Default)]
struct ScriptState {
    sessions: Vec<SessionRecord>,
    open_failures: VecDeque<TransportError>,
    script: Vec<ScriptStep>,
    teardown: TeardownBehavior,
    open_delay: Duration,
    open_attempts: usize,
    max_live_per_instance: usize,
}

impl ScriptState {
    fn live_for(&self, instance_id: &InstanceId) -> usize {
        self.sessions
            .iter()
            .filter(|session| {
                &session.instance_id == instance_id && session.flags.live.load(Ordering::SeqCst)
            })
            .count()
    }
}

/// Transport double that records sessions and lets callers push events into them.
///
/// A session counts as live from `open` until its handle is closed or
/// dropped, or a `Closed` event is pushed into it.
#[derive(Clone)]
pub struct ScriptedTransport {
    state: Arc<Mutex<ScriptState>>,
    attempts: Arc<watch::Sender<usize>>,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        let (attempts, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(ScriptState::default())),
            attempts: Arc::new(attempts),
        }
    }

    /// Replay `steps` into every session opened from now on.
    pub fn with_script(self, steps: Vec<ScriptStep>) -> Self {
        self.lock().script = steps;
        self
    }

    pub fn fail_next_open(&self, err: TransportError) {
        self.lock().open_failures.push_back(err);
    }

    pub fn set_teardown(&self, behavior: TeardownBehavior) {
        self.lock().teardown = behavior;
    }

    /// Make every later `open` take `delay` before it hands back a session.
    pub fn set_open_delay(&self, delay: Duration) {
        self.lock().open_delay = delay;
    }

    /// Number of `open` calls started, failed ones included.
    pub fn open_attempts(&self) -> usize {
        self.lock().open_attempts
    }

    /// Number of sessions successfully opened.
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn live_count(&self, instance_id: &InstanceId) -> usize {
        self.lock().live_for(instance_id)
    }

    /// Highest number of simultaneously live sessions seen for any one instance.
    pub fn max_live_per_instance(&self) -> usize {
        self.lock().max_live_per_instance
    }

    pub fn credentials_of(&self, session: usize) -> Option<CredentialState> {
        self.lock()
            .sessions
            .get(session)
            .map(|record| record.credentials.clone())
    }

    pub fn instance_of(&self, session: usize) -> Option<InstanceId> {
        self.lock()
            .sessions
            .get(session)
            .map(|record| record.instance_id.clone())
    }

    pub fn logout_requested(&self, session: usize) -> bool {
        self.flag(session, |flags| &flags.logout_requested)
    }

    pub fn closed(&self, session: usize) -> bool {
        self.flag(session, |flags| &flags.closed)
    }

    /// Push an event into session `session`. Returns `false` when nobody listens.
    pub fn emit(&self, session: usize, event: ConnectionEvent) -> bool {
        let state = self.lock();
        let Some(record) = state.sessions.get(session) else {
            return false;
        };
        if matches!(event, ConnectionEvent::Closed(_)) {
            record.flags.live.store(false, Ordering::SeqCst);
        }
        record
            .events
            .as_ref()
            .is_some_and(|events| events.send(event).is_ok())
    }

    /// Push an event into the most recently opened session.
    pub fn emit_latest(&self, event: ConnectionEvent) -> bool {
        let latest = self.session_count().checked_sub(1);
        latest.is_some_and(|session| self.emit(session, event))
    }

    /// Drop the sending side of a session's event stream.
    pub fn end_events(&self, session: usize) {
        if let Some(record) = self.lock().sessions.get_mut(session) {
            record.events = None;
        }
    }

    /// Wait until at least `count` open attempts have finished.
    pub async fn wait_for_open_attempts(&self, count: usize, limit: Duration) -> bool {
        let mut attempts = self.attempts.subscribe();
        matches!(
            timeout(limit, attempts.wait_for(|seen| *seen >= count)).await,
            Ok(Ok(_))
        )
    }

    fn flag(&self, session: usize, select: impl Fn(&SessionFlags) -> &AtomicBool) -> bool {
        self.lock()
            .sessions
            .get(session)
            .is_some_and(|record| select(&record.flags).load(Ordering::SeqCst))
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_script(
        steps: Vec<ScriptStep>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
        flags: Arc<SessionFlags>,
    ) {
        tokio::spawn(async move {
            for step in steps {
                tokio::time::sleep(step.after).await;
                if matches!(step.event, ConnectionEvent::Closed(_)) {
                    flags.live.store(false, Ordering::SeqCst);
                }
                if events.send(step.event).is_err() {
                    break;
                }
            }
        });
    }
}

impl Transport for ScriptedTransport {
    type Handle = ScriptedHandle;

    async fn open(
        &self,
        instance_id: &InstanceId,
        credentials: CredentialState,
    ) -> Result<TransportSession<ScriptedHandle>, TransportError> {
        let delay = {
            let mut state = self.lock();
            state.open_attempts += 1;
            state.open_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let opened = {
            let mut state = self.lock();
            match state.open_failures.pop_front() {
                Some(err) => Err(err),
                None => {
                    let (events_tx, events_rx) = mpsc::unbounded_channel();
                    let flags = Arc::new(SessionFlags::default());
                    flags.live.store(true, Ordering::SeqCst);
                    state.sessions.push(SessionRecord {
                        instance_id: instance_id.clone(),
                        credentials,
                        events: Some(events_tx.clone()),
                        flags: Arc::clone(&flags),
                    });
                    let live = state.live_for(instance_id);
                    state.max_live_per_instance = state.max_live_per_instance.max(live);
                    Ok((events_tx, events_rx, flags, state.script.clone()))
                }
            }
        };
        self.attempts.send_modify(|seen| *seen += 1);

        let (events_tx, events_rx, flags, script) = opened?;
        if !script.is_empty() {
            Self::spawn_script(script, events_tx, Arc::clone(&flags));
        }

        Ok(TransportSession {
            handle: ScriptedHandle {
                flags,
                state: Arc::clone(&self.state),
            },
            events: events_rx,
        })
    }
}

#[derive(Debug)]
pub struct ScriptedHandle {
    flags: Arc<SessionFlags>,
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedHandle {
    fn behavior(&self) -> TeardownBehavior {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .teardown
    }

    async fn finish(&self, step: &str) -> Result<(), TransportError> {
        match self.behavior() {
            TeardownBehavior::Succeed => Ok(()),
            TeardownBehavior::Fail => Err(TransportError::Teardown(format!("scripted {step} failure"))),
            TeardownBehavior::Hang => std::future::pending().await,
        }
    }
}

impl TransportHandle for ScriptedHandle {
    async fn request_logout(&self) -> Result<(), TransportError> {
        self.flags.logout_requested.store(true, Ordering::SeqCst);
        self.finish("logout").await
    }

    async fn close(&self) -> Result<(), TransportError> {
        let result = self.finish("close").await;
        if result.is_ok() {
            self.flags.closed.store(true, Ordering::SeqCst);
            self.flags.live.store(false, Ordering::SeqCst);
        }
        result
    }
}

impl Drop for ScriptedHandle {
    fn drop(&mut self) {
        self.flags.live.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use session_core::CloseCause;

    use super::*;

    fn id(raw: &str) -> InstanceId {
        InstanceId::sanitize(Some(raw))
    }

    #[tokio::test]
    async fn records_sessions_and_routes_events() {
        let transport = ScriptedTransport::new();
        let mut creds = CredentialState::default();
        creds.insert("noise_key", "abc");

        let mut session = transport
            .open(&id("a"), creds.clone())
            .await
            .expect("open should succeed");

        assert_eq!(transport.session_count(), 1);
        assert_eq!(transport.credentials_of(0), Some(creds));
        assert_eq!(transport.live_count(&id("a")), 1);

        assert!(transport.emit(0, ConnectionEvent::PairingCodeIssued("XYZ".into())));
        let event = timeout(Duration::from_secs(2), session.events.recv())
            .await
            .expect("event timeout")
            .expect("event receive");
        assert_eq!(event, ConnectionEvent::PairingCodeIssued("XYZ".into()));

        assert!(transport.emit(0, ConnectionEvent::Closed(CloseCause::with_code(515))));
        assert_eq!(transport.live_count(&id("a")), 0);
    }

    #[tokio::test]
    async fn failed_opens_count_as_attempts_only() {
        let transport = ScriptedTransport::new();
        transport.fail_next_open(TransportError::Unavailable("offline".into()));

        let err = transport
            .open(&id("a"), CredentialState::default())
            .await
            .expect_err("first open must fail");
        assert_eq!(err, TransportError::Unavailable("offline".into()));
        assert_eq!(transport.open_attempts(), 1);
        assert_eq!(transport.session_count(), 0);
        assert!(transport.wait_for_open_attempts(1, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn close_and_drop_end_liveness() {
        let transport = ScriptedTransport::new();
        let first = transport
            .open(&id("a"), CredentialState::default())
            .await
            .expect("open");
        first.handle.close().await.expect("close");
        assert!(transport.closed(0));
        assert_eq!(transport.live_count(&id("a")), 0);

        let second = transport
            .open(&id("a"), CredentialState::default())
            .await
            .expect("open");
        assert_eq!(transport.live_count(&id("a")), 1);
        drop(second);
        assert_eq!(transport.live_count(&id("a")), 0);
        assert_eq!(transport.max_live_per_instance(), 1);
    }

    #[tokio::test]
    async fn failing_teardown_keeps_session_live_until_dropped() {
        let transport = ScriptedTransport::new();
        transport.set_teardown(TeardownBehavior::Fail);
        let session = transport
            .open(&id("a"), CredentialState::default())
            .await
            .expect("open");

        assert!(session.handle.request_logout().await.is_err());
        assert!(transport.logout_requested(0));
        assert!(session.handle.close().await.is_err());
        assert_eq!(transport.live_count(&id("a")), 1);

        drop(session);
        assert_eq!(transport.live_count(&id("a")), 0);
    }

    #[tokio::test]
    async fn delayed_open_counts_the_attempt_before_the_session_exists() {
        let transport = ScriptedTransport::new();
        transport.set_open_delay(Duration::from_millis(50));

        let opener = transport.clone();
        let pending = tokio::spawn(async move {
            opener.open(&id("a"), CredentialState::default()).await
        });
        timeout(Duration::from_secs(2), async {
            while transport.open_attempts() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("attempt timeout");
        assert_eq!(transport.session_count(), 0);

        let session = timeout(Duration::from_secs(2), pending)
            .await
            .expect("open timeout")
            .expect("open task")
            .expect("open should succeed");
        assert_eq!(transport.session_count(), 1);
        assert_eq!(transport.live_count(&id("a")), 1);
        drop(session);
    }

    #[tokio::test]
    async fn replays_script_into_each_session() {
        let transport = ScriptedTransport::new().with_script(vec![
            ScriptStep::new(Duration::from_millis(5), ConnectionEvent::PairingCodeIssued("QR".into())),
            ScriptStep::new(Duration::from_millis(5), ConnectionEvent::Opened),
        ]);
        let mut session = transport
            .open(&id("a"), CredentialState::default())
            .await
            .expect("open");

        let mut seen = Vec::new();
        for _ in 0..2 {
            let event = timeout(Duration::from_secs(2), session.events.recv())
                .await
                .expect("event timeout")
                .expect("event receive");
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                ConnectionEvent::PairingCodeIssued("QR".into()),
                ConnectionEvent::Opened
            ]
        );
    }
}

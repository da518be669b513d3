use std::{future::Future, marker::PhantomData, sync::Arc, time::Duration};

use session_core::{
    BotStatus, BroadcastHub, CloseCause, Clock, ClosedOutcome, ConnectOrigin, ConnectionEvent,
    ConnectionState, CredentialState, InstanceId, InstanceRuntime, LogLevel, LoopGuard,
    ProjectionPatch, SessionError, SessionErrorCategory, describe_cause,
};
use session_platform::{CredentialStore, ProjectionStore, StoreError};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::transport::{Transport, TransportError, TransportHandle, TransportSession};

const COMMAND_QUEUE_CAPACITY: usize = 64;

/// Latest published view of an instance, readable without waiting on its worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSnapshot {
    pub status: BotStatus,
    pub pairing_code: Option<String>,
}

impl InstanceSnapshot {
    fn of(runtime: &InstanceRuntime) -> Self {
        Self {
            status: runtime.status(),
            pairing_code: runtime.pairing_code().map(str::to_owned),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operation {
    Connect,
    Ensure,
    Disconnect,
    Reset,
}

pub(crate) enum WorkerCommand {
    Caller {
        operation: Operation,
        reply: oneshot::Sender<BotStatus>,
    },
    Transport {
        generation: u64,
        event: ConnectionEvent,
    },
    RetryDue {
        generation: u64,
    },
}

/// Collaborators shared by every instance worker.
pub(crate) struct WorkerContext<T: Transport> {
    pub(crate) transport: Arc<T>,
    pub(crate) credentials: Arc<dyn CredentialStore>,
    pub(crate) projection: Arc<dyn ProjectionStore>,
    pub(crate) hub: Arc<BroadcastHub>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) guard: LoopGuard,
    pub(crate) unknown_retry_delay: Duration,
    pub(crate) teardown_timeout: Duration,
}

impl<T: Transport> Clone for WorkerContext<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            credentials: Arc::clone(&self.credentials),
            projection: Arc::clone(&self.projection),
            hub: Arc::clone(&self.hub),
            clock: Arc::clone(&self.clock),
            guard: self.guard,
            unknown_retry_delay: self.unknown_retry_delay,
            teardown_timeout: self.teardown_timeout,
        }
    }
}

/// Caller side of one instance worker.
pub struct InstanceHandle<T: Transport> {
    instance_id: InstanceId,
    commands: mpsc::Sender<WorkerCommand>,
    snapshot: watch::Receiver<InstanceSnapshot>,
    transport: PhantomData<fn() -> T>,
}

impl<T: Transport> Clone for InstanceHandle<T> {
    fn clone(&self) -> Self {
        Self {
            instance_id: self.instance_id.clone(),
            commands: self.commands.clone(),
            snapshot: self.snapshot.clone(),
            transport: PhantomData,
        }
    }
}

impl<T: Transport> InstanceHandle<T> {
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn status(&self) -> BotStatus {
        self.snapshot.borrow().status.clone()
    }

    pub fn pairing_code(&self) -> Option<String> {
        self.snapshot.borrow().pairing_code.clone()
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Queue a caller operation and wait for the status it settles on.
    ///
    /// Falls back to the last published status once the worker is gone.
    pub(crate) async fn request(&self, operation: Operation) -> BotStatus {
        let (reply, response) = oneshot::channel();
        let command = WorkerCommand::Caller { operation, reply };
        if self.commands.send(command).await.is_err() {
            tracing::debug!(instance_id = %self.instance_id, ?operation, "instance worker stopped; returning last status");
            return self.status();
        }
        response.await.unwrap_or_else(|_| self.status())
    }
}

struct LiveSession<H> {
    generation: u64,
    session_id: Uuid,
    handle: H,
    pump: CancellationToken,
}

type OpenResult<H> = Result<TransportSession<H>, TransportError>;

/// A `Transport::open` call still running for `generation`.
struct PendingOpen<H> {
    generation: u64,
    task: JoinHandle<OpenResult<H>>,
}

/// Resolve the in-flight open, or never when there is none.
async fn next_opened<H: Send + 'static>(
    pending: &mut Option<PendingOpen<H>>,
) -> (u64, OpenResult<H>) {
    let Some(open) = pending.as_mut() else {
        return std::future::pending().await;
    };
    let result = (&mut open.task)
        .await
        .unwrap_or_else(|err| Err(TransportError::Open(format!("open task failed: {err}"))));
    (open.generation, result)
}

/// Spawn the sequential owner of one instance.
pub(crate) fn spawn_worker<T: Transport>(
    runtime: InstanceRuntime,
    context: WorkerContext<T>,
    shutdown: CancellationToken,
) -> (InstanceHandle<T>, JoinHandle<()>) {
    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
    let (snapshot_tx, snapshot_rx) = watch::channel(InstanceSnapshot::of(&runtime));
    let instance_id = runtime.instance_id().clone();

    let worker = InstanceWorker {
        runtime,
        context,
        command_tx: command_tx.clone(),
        command_rx,
        snapshot_tx,
        opening: None,
        live: None,
        shutdown,
    };
    let task = tokio::spawn(worker.run());

    let handle = InstanceHandle {
        instance_id,
        commands: command_tx,
        snapshot: snapshot_rx,
        transport: PhantomData,
    };
    (handle, task)
}

struct InstanceWorker<T: Transport> {
    runtime: InstanceRuntime,
    context: WorkerContext<T>,
    command_tx: mpsc::Sender<WorkerCommand>,
    command_rx: mpsc::Receiver<WorkerCommand>,
    snapshot_tx: watch::Sender<InstanceSnapshot>,
    /// At most one open runs at a time; teardown settles it before anything new starts.
    opening: Option<PendingOpen<T::Handle>>,
    live: Option<LiveSession<T::Handle>>,
    shutdown: CancellationToken,
}

impl<T: Transport> InstanceWorker<T> {
    async fn run(mut self) {
        tracing::debug!(instance_id = %self.runtime.instance_id(), "instance worker started");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                (generation, result) = next_opened(&mut self.opening), if self.opening.is_some() => {
                    self.opening = None;
                    self.handle_session_opened(generation, result).await;
                }
                command = self.command_rx.recv() => {
                    let Some(command) = command else { break };
                    self.handle_command(command).await;
                }
            }
        }

        // Pending retries are children of the shutdown token and die with it.
        if let Some(session) = self.settle_pending_open().await {
            self.teardown("close", session.handle.close()).await;
        }
        if let Some(live) = self.live.take() {
            live.pump.cancel();
            self.teardown("close", live.handle.close()).await;
        }
        tracing::debug!(instance_id = %self.runtime.instance_id(), "instance worker stopped");
    }

    async fn handle_command(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::Caller { operation, reply } => {
                match operation {
                    Operation::Connect => self.handle_connect(),
                    Operation::Ensure => self.handle_ensure(),
                    Operation::Disconnect => self.handle_disconnect().await,
                    Operation::Reset => self.handle_reset().await,
                }
                let _ = reply.send(self.runtime.status());
            }
            WorkerCommand::Transport { generation, event } => {
                self.handle_transport_event(generation, event);
            }
            WorkerCommand::RetryDue { generation } => self.handle_retry_due(generation),
        }
    }

    fn handle_connect(&mut self) {
        if let Err(err) = self.start_session(ConnectOrigin::Caller) {
            tracing::debug!(
                instance_id = %self.runtime.instance_id(),
                code = %err.code,
                "connect is a no-op: {}",
                err.message
            );
        }
    }

    fn handle_ensure(&mut self) {
        let idle = self.runtime.state() == ConnectionState::Disconnected
            && !self.runtime.attempt_in_flight()
            && self.runtime.advisory_note().is_none();
        if !idle {
            tracing::debug!(
                instance_id = %self.runtime.instance_id(),
                state = ?self.runtime.state(),
                slot = ?self.runtime.slot(),
                "ensure left instance untouched"
            );
            return;
        }
        self.handle_connect();
    }

    async fn handle_disconnect(&mut self) {
        self.end_session(true).await;
        let instance_id = self.runtime.instance_id().clone();
        self.context
            .hub
            .log(LogLevel::Info, format!("[{instance_id}] Disconnected by API."));
        self.publish();
    }

    async fn handle_reset(&mut self) {
        self.end_session(true).await;
        let instance_id = self.runtime.instance_id().clone();

        if let Err(err) = self.context.credentials.erase(&instance_id) {
            let err = map_store_error("erase_credentials", &instance_id, err);
            tracing::error!(instance_id = %instance_id, code = %err.code, "reset could not erase credentials: {}", err.message);
            self.runtime.suspend(format!(
                "Reset could not erase stored credentials ({}). Fix storage access and call reset again.",
                err.message
            ));
            self.context.hub.log(
                LogLevel::Error,
                format!("[{instance_id}] Reset failed: {}", err.message),
            );
            self.publish();
            return;
        }

        self.context.hub.log(
            LogLevel::Info,
            format!("[{instance_id}] Reset done. Generating new pairing code..."),
        );
        self.publish();
        self.handle_connect();
    }

    fn handle_retry_due(&mut self, generation: u64) {
        if let Err(err) = self.start_session(ConnectOrigin::ScheduledRetry { generation }) {
            tracing::debug!(
                instance_id = %self.runtime.instance_id(),
                generation,
                code = %err.code,
                "dropping superseded retry"
            );
        }
    }

    /// Enter `Connecting`, load credentials and open a session in the background.
    fn start_session(&mut self, origin: ConnectOrigin) -> Result<(), SessionError> {
        let generation = self.runtime.begin_connect(origin)?;
        let instance_id = self.runtime.instance_id().clone();

        tracing::info!(instance_id = %instance_id, generation, ?origin, "starting transport session");
        self.context
            .hub
            .log(LogLevel::Info, format!("[{instance_id}] Connecting..."));
        self.publish();

        let credentials = match self.context.credentials.load(&instance_id) {
            Ok(credentials) => credentials,
            Err(StoreError::NotFound) => CredentialState::default(),
            Err(err) => {
                let err = map_store_error("load_credentials", &instance_id, err);
                tracing::error!(instance_id = %instance_id, generation, code = %err.code, "failed to load credentials: {}", err.message);
                self.fail_open(generation, &format!("credentials unavailable: {}", err.message));
                return Ok(());
            }
        };

        self.spawn_open(generation, credentials);
        Ok(())
    }

    fn spawn_open(&mut self, generation: u64, credentials: CredentialState) {
        let transport = Arc::clone(&self.context.transport);
        let instance_id = self.runtime.instance_id().clone();

        let task = tokio::spawn(async move { transport.open(&instance_id, credentials).await });
        self.opening = Some(PendingOpen { generation, task });
    }

    /// Wait for an in-flight open to finish, bounded by the teardown timeout.
    ///
    /// Returns the session it produced so the caller can tear it down.
    async fn settle_pending_open(&mut self) -> Option<TransportSession<T::Handle>> {
        let mut open = self.opening.take()?;
        match timeout(self.context.teardown_timeout, &mut open.task).await {
            Ok(Ok(Ok(session))) => {
                tracing::debug!(instance_id = %self.runtime.instance_id(), generation = open.generation, "settled in-flight open for teardown");
                Some(session)
            }
            Ok(Ok(Err(err))) => {
                tracing::debug!(instance_id = %self.runtime.instance_id(), generation = open.generation, error = %err, "in-flight open failed during teardown");
                None
            }
            Ok(Err(err)) => {
                tracing::warn!(instance_id = %self.runtime.instance_id(), generation = open.generation, error = %err, "open task failed during teardown");
                None
            }
            Err(_) => {
                open.task.abort();
                tracing::warn!(
                    instance_id = %self.runtime.instance_id(),
                    generation = open.generation,
                    timeout_ms = self.context.teardown_timeout.as_millis() as u64,
                    "abandoned open that outlived the teardown timeout"
                );
                None
            }
        }
    }

    async fn handle_session_opened(
        &mut self,
        generation: u64,
        result: Result<TransportSession<T::Handle>, TransportError>,
    ) {
        let session = match result {
            Ok(session) => session,
            Err(err) => {
                tracing::warn!(instance_id = %self.runtime.instance_id(), generation, error = %err, "transport open failed");
                self.fail_open(generation, &err.to_string());
                return;
            }
        };

        if !self.runtime.on_session_ready(generation) {
            tracing::debug!(instance_id = %self.runtime.instance_id(), generation, "closing session opened for a superseded attempt");
            self.teardown("close", session.handle.close()).await;
            return;
        }

        if let Some(previous) = self.live.take() {
            previous.pump.cancel();
            self.teardown("close", previous.handle.close()).await;
        }

        let session_id = Uuid::new_v4();
        let pump = self.spawn_event_pump(generation, session.events);
        tracing::info!(instance_id = %self.runtime.instance_id(), generation, %session_id, "transport session opened");
        self.live = Some(LiveSession {
            generation,
            session_id,
            handle: session.handle,
            pump,
        });
    }

    /// Forward session events into the worker queue, tagged with their generation.
    fn spawn_event_pump(
        &self,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) -> CancellationToken {
        let stop = self.shutdown.child_token();
        let stop_child = stop.child_token();
        let commands = self.command_tx.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = stop_child.cancelled() => break,
                    event = events.recv() => event,
                };
                let event = event.unwrap_or_else(|| ConnectionEvent::Closed(CloseCause::default()));
                let closed = matches!(event, ConnectionEvent::Closed(_));
                let command = WorkerCommand::Transport { generation, event };
                if commands.send(command).await.is_err() || closed {
                    break;
                }
            }
        });

        stop
    }

    fn handle_transport_event(&mut self, generation: u64, event: ConnectionEvent) {
        let instance_id = self.runtime.instance_id().clone();
        match event {
            ConnectionEvent::PairingCodeIssued(code) => {
                if !self.runtime.on_pairing_code(generation, code) {
                    return self.ignore_stale(generation, "pairing_code_issued");
                }
                self.upsert_projection(ProjectionPatch::pairing_code_issued(
                    self.context.clock.unix_millis(),
                ));
                self.context
                    .hub
                    .log(LogLevel::Info, format!("[{instance_id}] New pairing code issued."));
                self.publish();
            }
            ConnectionEvent::Opened => {
                if !self.runtime.on_opened(generation) {
                    return self.ignore_stale(generation, "opened");
                }
                self.upsert_projection(ProjectionPatch::connection(
                    true,
                    self.context.clock.unix_millis(),
                ));
                self.context
                    .hub
                    .log(LogLevel::Info, format!("[{instance_id}] Connected."));
                self.publish();
            }
            ConnectionEvent::CredentialsChanged(credentials) => {
                if !self.runtime.accepts_credentials(generation) {
                    return self.ignore_stale(generation, "credentials_changed");
                }
                if let Err(err) = self.context.credentials.save(&instance_id, &credentials) {
                    let err = map_store_error("save_credentials", &instance_id, err);
                    tracing::error!(instance_id = %instance_id, generation, code = %err.code, "failed to persist credentials: {}", err.message);
                    self.context.hub.log(
                        LogLevel::Warn,
                        format!("[{instance_id}] Failed to persist credentials: {}", err.message),
                    );
                }
            }
            ConnectionEvent::Closed(cause) => {
                let label = describe_cause(&cause);
                let outcome = self.runtime.on_closed(
                    generation,
                    &cause,
                    self.context.clock.now(),
                    &self.context.guard,
                    self.context.unknown_retry_delay,
                );
                if outcome != ClosedOutcome::Stale {
                    self.release_live(generation);
                }
                self.apply_closed_outcome(outcome, &label);
            }
        }
    }

    fn fail_open(&mut self, generation: u64, reason: &str) {
        let outcome = self.runtime.on_open_failed(
            generation,
            self.context.clock.now(),
            &self.context.guard,
            self.context.unknown_retry_delay,
        );
        self.apply_closed_outcome(outcome, &format!("open failed: {reason}"));
    }

    fn apply_closed_outcome(&mut self, outcome: ClosedOutcome, label: &str) {
        let instance_id = self.runtime.instance_id().clone();
        match outcome {
            ClosedOutcome::Stale => {
                tracing::debug!(instance_id = %instance_id, label, "ignoring closure of a superseded session");
                return;
            }
            ClosedOutcome::ManualStop => {
                self.context.hub.log(
                    LogLevel::Info,
                    format!("[{instance_id}] Disconnected ({label})."),
                );
            }
            ClosedOutcome::Halted { classification } => {
                tracing::warn!(instance_id = %instance_id, reason = ?classification.reason, "session logged out; waiting for reset");
                self.context.hub.log(
                    LogLevel::Error,
                    format!("[{instance_id}] Disconnected ({label}). Call reset to pair a new device."),
                );
            }
            ClosedOutcome::RetryScheduled {
                classification,
                generation,
                delay,
                occurrences,
            } => {
                tracing::info!(
                    instance_id = %instance_id,
                    generation,
                    reason = ?classification.reason,
                    delay_ms = delay.as_millis() as u64,
                    ?occurrences,
                    "scheduling reconnect"
                );
                self.context.hub.log(
                    LogLevel::Warn,
                    format!(
                        "[{instance_id}] Disconnected ({label}); reconnecting in {}ms.",
                        delay.as_millis()
                    ),
                );
                self.schedule_retry(generation, delay);
            }
            ClosedOutcome::LoopDetected { occurrences, .. } => {
                tracing::error!(instance_id = %instance_id, occurrences, "reconnect loop detected; automatic recovery suspended");
                let note = self.runtime.advisory_note().unwrap_or_default().to_owned();
                self.context
                    .hub
                    .log(LogLevel::Error, format!("[{instance_id}] {note}"));
            }
        }

        self.upsert_projection(ProjectionPatch::connection(
            false,
            self.context.clock.unix_millis(),
        ));
        self.publish();
    }

    fn schedule_retry(&self, generation: u64, delay: Duration) {
        let commands = self.command_tx.clone();
        let stop = self.shutdown.child_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = commands.send(WorkerCommand::RetryDue { generation }).await;
                }
            }
        });
    }

    /// Caller-initiated teardown; `logout` also revokes the paired device.
    async fn end_session(&mut self, logout: bool) {
        self.runtime.request_manual_disconnect();
        if let Some(session) = self.settle_pending_open().await {
            if logout {
                self.teardown("logout", session.handle.request_logout()).await;
            }
            self.teardown("close", session.handle.close()).await;
        }
        if let Some(live) = self.live.take() {
            live.pump.cancel();
            if logout {
                self.teardown("logout", live.handle.request_logout()).await;
            }
            self.teardown("close", live.handle.close()).await;
            tracing::info!(instance_id = %self.runtime.instance_id(), session_id = %live.session_id, "transport session torn down");
        }
        self.runtime.complete_disconnect();
        self.upsert_projection(ProjectionPatch::connection(
            false,
            self.context.clock.unix_millis(),
        ));
    }

    fn release_live(&mut self, generation: u64) {
        if !self
            .live
            .as_ref()
            .is_some_and(|live| live.generation == generation)
        {
            return;
        }
        if let Some(live) = self.live.take() {
            live.pump.cancel();
            tracing::info!(instance_id = %self.runtime.instance_id(), generation, session_id = %live.session_id, "transport session closed");
        }
    }

    async fn teardown(
        &self,
        step: &'static str,
        call: impl Future<Output = Result<(), TransportError>>,
    ) {
        match timeout(self.context.teardown_timeout, call).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(instance_id = %self.runtime.instance_id(), step, error = %err, "ignoring failed teardown call");
            }
            Err(_) => {
                tracing::warn!(
                    instance_id = %self.runtime.instance_id(),
                    step,
                    timeout_ms = self.context.teardown_timeout.as_millis() as u64,
                    "ignoring timed out teardown call"
                );
            }
        }
    }

    fn ignore_stale(&self, generation: u64, event: &'static str) {
        tracing::debug!(
            instance_id = %self.runtime.instance_id(),
            generation,
            current = self.runtime.generation(),
            event,
            "ignoring event from a superseded session"
        );
    }

    fn upsert_projection(&self, patch: ProjectionPatch) {
        let instance_id = self.runtime.instance_id();
        if let Err(err) = self.context.projection.upsert(instance_id, &patch) {
            let err = map_store_error("upsert_projection", instance_id, err);
            tracing::warn!(instance_id = %instance_id, code = %err.code, "projection update failed: {}", err.message);
        }
    }

    fn publish(&self) {
        let snapshot = InstanceSnapshot::of(&self.runtime);
        let status = snapshot.status.clone();
        self.snapshot_tx.send_replace(snapshot);
        self.context.hub.publish_status(status);
    }
}

pub(crate) fn map_store_error(
    operation: &str,
    instance_id: &InstanceId,
    err: StoreError,
) -> SessionError {
    match err {
        StoreError::NotFound => SessionError::new(
            SessionErrorCategory::Storage,
            "store_record_not_found",
            format!("no stored record for '{instance_id}' during {operation}"),
        ),
        StoreError::Unavailable(message) => SessionError::new(
            SessionErrorCategory::Storage,
            "store_unavailable",
            format!("store unavailable during {operation} for '{instance_id}': {message}"),
        ),
        StoreError::Backend(message) => SessionError::new(
            SessionErrorCategory::Storage,
            "store_backend_error",
            format!("store backend error during {operation} for '{instance_id}': {message}"),
        ),
        StoreError::Serialization(message) => SessionError::new(
            SessionErrorCategory::Serialization,
            "store_serialization_error",
            format!("stored data for '{instance_id}' is unreadable during {operation}: {message}"),
        ),
    }
}

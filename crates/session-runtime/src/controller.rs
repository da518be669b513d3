use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use session_core::{
    BotStatus, BroadcastHub, Clock, HubFrame, InstanceId, InstanceRuntime, LoopGuard, ObserverId,
    ProjectionRecord, ReconnectSettings, SessionError,
};
use session_platform::{CredentialStore, ProjectionStore};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    registry::InstanceRegistry,
    transport::Transport,
    worker::{InstanceHandle, Operation, WorkerContext, map_store_error, spawn_worker},
};

pub const DEFAULT_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSettings {
    pub reconnect: ReconnectSettings,
    /// Bound on each best-effort logout or close call.
    pub teardown_timeout: Duration,
    /// Instance used when callers pass no id.
    pub default_instance_id: InstanceId,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            reconnect: ReconnectSettings::default(),
            teardown_timeout: DEFAULT_TEARDOWN_TIMEOUT,
            default_instance_id: InstanceId::default(),
        }
    }
}

/// Everything the controller drives, built by the composition root.
pub struct Collaborators<T: Transport> {
    pub transport: Arc<T>,
    pub credentials: Arc<dyn CredentialStore>,
    pub projection: Arc<dyn ProjectionStore>,
    pub hub: Arc<BroadcastHub>,
    pub registry: Arc<InstanceRegistry<T>>,
    pub clock: Arc<dyn Clock>,
}

/// Caller-facing façade over the per-instance workers.
///
/// Operations never fail: problems end up in the returned status's
/// advisory note and in the hub log. Operations create an instance on first
/// reference, which spawns its worker, so they must run inside a tokio
/// runtime. Status reads never create instances.
pub struct SessionController<T: Transport> {
    context: WorkerContext<T>,
    registry: Arc<InstanceRegistry<T>>,
    default_instance_id: InstanceId,
    shutdown: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Transport> SessionController<T> {
    pub fn new(collaborators: Collaborators<T>, settings: ControllerSettings) -> Self {
        let Collaborators {
            transport,
            credentials,
            projection,
            hub,
            registry,
            clock,
        } = collaborators;

        let context = WorkerContext {
            transport,
            credentials,
            projection,
            hub,
            clock,
            guard: LoopGuard::from_settings(&settings.reconnect),
            unknown_retry_delay: settings.reconnect.unknown_retry_delay(),
            teardown_timeout: settings.teardown_timeout,
        };

        Self {
            context,
            registry,
            default_instance_id: settings.default_instance_id,
            shutdown: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Sanitize caller input the way every operation does.
    pub fn resolve_instance_id(&self, raw: Option<&str>) -> InstanceId {
        InstanceId::sanitize_or(raw, self.default_instance_id.as_str())
    }

    /// Start a session unless one is already connecting or connected.
    pub async fn connect(&self, instance_id: Option<&str>) -> BotStatus {
        self.instance(instance_id).request(Operation::Connect).await
    }

    /// Start a session only if the instance is idle and not suspended.
    pub async fn ensure(&self, instance_id: Option<&str>) -> BotStatus {
        self.instance(instance_id).request(Operation::Ensure).await
    }

    /// Log out and close the session; no retry follows.
    pub async fn disconnect(&self, instance_id: Option<&str>) -> BotStatus {
        self.instance(instance_id).request(Operation::Disconnect).await
    }

    /// Disconnect, erase credentials and pair from scratch.
    pub async fn reset(&self, instance_id: Option<&str>) -> BotStatus {
        self.instance(instance_id).request(Operation::Reset).await
    }

    /// An instance nobody has referenced yet reads as a fresh `Disconnected` status.
    pub fn status(&self, instance_id: Option<&str>) -> BotStatus {
        let instance_id = self.resolve_instance_id(instance_id);
        match self.registry.get(&instance_id) {
            Some(handle) => handle.status(),
            None => InstanceRuntime::new(instance_id).status(),
        }
    }

    pub fn pairing_code(&self, instance_id: Option<&str>) -> Option<String> {
        let instance_id = self.resolve_instance_id(instance_id);
        self.registry
            .get(&instance_id)
            .and_then(|handle| handle.pairing_code())
    }

    /// Status of every known instance, ordered by id.
    pub fn statuses(&self) -> Vec<BotStatus> {
        self.registry
            .list()
            .iter()
            .map(InstanceHandle::status)
            .collect()
    }

    pub fn projection(&self, instance_id: Option<&str>) -> Result<ProjectionRecord, SessionError> {
        let instance_id = self.resolve_instance_id(instance_id);
        self.context
            .projection
            .get(&instance_id)
            .map_err(|err| map_store_error("get_projection", &instance_id, err))
    }

    /// Attach a channel observer; the default instance is created first so
    /// its status is part of the replay.
    pub fn subscribe(&self, buffer: usize) -> (ObserverId, mpsc::Receiver<HubFrame>) {
        self.instance(None);
        self.context.hub.subscribe(buffer)
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.context.hub
    }

    /// Stop every worker. Live sessions are closed without logging out.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            if let Err(err) = worker.await {
                tracing::warn!(error = %err, "instance worker ended abnormally");
            }
        }
    }

    fn instance(&self, raw: Option<&str>) -> InstanceHandle<T> {
        let instance_id = self.resolve_instance_id(raw);
        self.registry.get_or_insert_with(&instance_id, || {
            let runtime = InstanceRuntime::new(instance_id.clone());
            self.context.hub.seed_status(runtime.status());
            let (handle, task) =
                spawn_worker(runtime, self.context.clone(), self.shutdown.child_token());
            self.workers
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(task);
            tracing::debug!(instance_id = %instance_id, "instance created");
            handle
        })
    }
}

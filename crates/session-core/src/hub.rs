//! Fan-out of status and log notifications to attached observers.
//!
//! Publishing never fails and never blocks on an observer: a closed or
//! saturated observer is dropped from the set instead.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, Mutex, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::{
    clock::{Clock, SystemClock},
    log_ring::{DEFAULT_LOG_CAPACITY, LogRing},
    types::{BotStatus, InstanceId, LogItem, LogLevel},
};

/// Payload of the first frame an observer receives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HelloPayload {
    pub ok: bool,
    /// Replayed log ring, oldest first.
    pub last_logs: Vec<LogItem>,
}

/// Wire frame delivered to observers: `{"type": ..., "payload": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum HubFrame {
    Hello(HelloPayload),
    Status(BotStatus),
    Log(LogItem),
}

/// Per-observer delivery failure. Always treated as an implicit detach.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ObserverError {
    #[error("observer is closed")]
    Closed,
    #[error("observer buffer is full")]
    Full,
}

/// Receiving end of the hub, e.g. one WebSocket connection.
pub trait Observer: Send + Sync {
    fn is_open(&self) -> bool;

    /// Deliver one frame without blocking.
    fn send(&self, frame: &HubFrame) -> Result<(), ObserverError>;
}

/// Observer backed by a bounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::Sender<HubFrame>,
}

impl ChannelObserver {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<HubFrame>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

impl Observer for ChannelObserver {
    fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    fn send(&self, frame: &HubFrame) -> Result<(), ObserverError> {
        self.tx.try_send(frame.clone()).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => ObserverError::Full,
            mpsc::error::TrySendError::Closed(_) => ObserverError::Closed,
        })
    }
}

/// Identifier handed out by [`BroadcastHub::attach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

#[derive(Debug, Default)]
struct ReplayState {
    logs: LogRing,
    statuses: BTreeMap<InstanceId, BotStatus>,
}

pub struct BroadcastHub {
    observers: RwLock<HashMap<ObserverId, Arc<dyn Observer>>>,
    replay: Mutex<ReplayState>,
    next_id: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl BroadcastHub {
    pub fn new(log_capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            observers: RwLock::new(HashMap::new()),
            replay: Mutex::new(ReplayState {
                logs: LogRing::new(log_capacity),
                statuses: BTreeMap::new(),
            }),
            next_id: AtomicU64::new(1),
            clock,
        }
    }

    /// Attach an observer after replaying the log ring and every known status.
    ///
    /// Replay and insertion happen under the exclusive lock that publishers
    /// take shared, so the observer sees no gap and no duplicate.
    pub fn attach(&self, observer: Arc<dyn Observer>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut observers = self.observers.write().unwrap_or_else(PoisonError::into_inner);

        let replay_frames = {
            let replay = self.replay.lock().unwrap_or_else(PoisonError::into_inner);
            let mut frames = Vec::with_capacity(replay.statuses.len() + 1);
            frames.push(HubFrame::Hello(HelloPayload {
                ok: true,
                last_logs: replay.logs.list(),
            }));
            frames.extend(replay.statuses.values().cloned().map(HubFrame::Status));
            frames
        };

        if !observer.is_open() {
            return id;
        }
        for frame in &replay_frames {
            if observer.send(frame).is_err() {
                return id;
            }
        }

        observers.insert(id, observer);
        id
    }

    /// Attach a [`ChannelObserver`] and return its receiving end.
    pub fn subscribe(&self, buffer: usize) -> (ObserverId, mpsc::Receiver<HubFrame>) {
        let (observer, rx) = ChannelObserver::new(buffer);
        let id = self.attach(Arc::new(observer));
        (id, rx)
    }

    /// Remove an observer. Idempotent.
    pub fn detach(&self, id: ObserverId) -> bool {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    pub fn observer_count(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Record `frame` in the replay buffer and deliver it to every open observer.
    pub fn publish(&self, frame: HubFrame) {
        let failed: Vec<ObserverId> = {
            let observers = self.observers.read().unwrap_or_else(PoisonError::into_inner);
            self.remember(&frame);
            observers
                .iter()
                .filter(|(_, observer)| !observer.is_open() || observer.send(&frame).is_err())
                .map(|(id, _)| *id)
                .collect()
        };

        for id in failed {
            self.detach(id);
        }
    }

    pub fn publish_status(&self, status: BotStatus) {
        self.publish(HubFrame::Status(status));
    }

    /// Append an entry to the log ring and broadcast it.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) -> LogItem {
        let item = LogItem {
            timestamp_ms: self.clock.unix_millis(),
            level,
            message: message.into(),
        };
        self.publish(HubFrame::Log(item.clone()));
        item
    }

    /// Seed the status replay for an instance nobody has published yet.
    pub fn seed_status(&self, status: BotStatus) {
        let mut replay = self.replay.lock().unwrap_or_else(PoisonError::into_inner);
        replay
            .statuses
            .entry(status.instance_id.clone())
            .or_insert(status);
    }

    /// Snapshot of the log ring, oldest first.
    pub fn logs(&self) -> Vec<LogItem> {
        self.replay
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .logs
            .list()
    }

    fn remember(&self, frame: &HubFrame) {
        let mut replay = self.replay.lock().unwrap_or_else(PoisonError::into_inner);
        match frame {
            HubFrame::Log(item) => replay.logs.push(item.clone()),
            HubFrame::Status(status) => {
                replay
                    .statuses
                    .insert(status.instance_id.clone(), status.clone());
            }
            HubFrame::Hello(_) => {}
        }
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY, Arc::new(SystemClock))
    }
}

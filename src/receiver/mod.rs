//! Motion receivers
//!
//! A [`MotionReceiver`] owns one protocol listener and the [`PoseModel`] it
//! feeds. The listener runs as its own tokio task; the pose model stays
//! readable whether or not the listener is running, and keeps the last known
//! pose across disconnects.

pub mod signal;

pub use signal::{stop_channel, Backoff, StopSignal, StopTrigger};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::pose::PoseModel;

/// A wire protocol that turns capture-device input into pose writes.
///
/// `run` is the listener loop. It must race every blocking await against
/// `stop` and return once stop is requested.
#[async_trait]
pub trait MotionSource: Send + Sync + 'static {
    /// Protocol identifier, e.g. "vmc"
    fn name(&self) -> &str;

    async fn run(&self, pose: Arc<PoseModel>, stop: StopSignal);
}

/// Lifecycle of a receiver's listener task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReceiverState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for ReceiverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReceiverState::Created => "created",
            ReceiverState::Starting => "starting",
            ReceiverState::Running => "running",
            ReceiverState::Stopping => "stopping",
            ReceiverState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// One protocol's ingestion lifecycle and its pose state
pub struct MotionReceiver {
    name: String,
    source: Arc<dyn MotionSource>,
    pose: Arc<PoseModel>,
    state: Mutex<ReceiverState>,
    trigger: StopTrigger,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MotionReceiver {
    /// Wrap a protocol source. The receiver is named after the source.
    pub fn new(source: impl MotionSource) -> Self {
        Self::from_arc(Arc::new(source))
    }

    pub fn from_arc(source: Arc<dyn MotionSource>) -> Self {
        let (trigger, _) = stop_channel();
        Self {
            name: source.name().to_string(),
            source,
            pose: Arc::new(PoseModel::new()),
            state: Mutex::new(ReceiverState::Created),
            trigger,
            task: tokio::sync::Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The pose model this receiver writes into
    pub fn pose(&self) -> &Arc<PoseModel> {
        &self.pose
    }

    pub fn state(&self) -> ReceiverState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), ReceiverState::Starting | ReceiverState::Running)
    }

    /// Spawn the listener task and return immediately.
    ///
    /// No-op while already starting or running, and refused while a previous
    /// listener is still shutting down. Must be called from within a tokio
    /// runtime.
    pub fn start(&self) {
        let mut state = self.state.lock();
        match *state {
            ReceiverState::Starting | ReceiverState::Running => return,
            ReceiverState::Stopping => {
                tracing::warn!("Receiver {} is still stopping, not starting", self.name);
                return;
            }
            ReceiverState::Created | ReceiverState::Stopped => {}
        }

        // A stop holds the task slot until the old listener has exited
        let mut task = match self.task.try_lock() {
            Ok(task) => task,
            Err(_) => {
                tracing::warn!("Receiver {} is still stopping, not starting", self.name);
                return;
            }
        };
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            tracing::warn!("Receiver {} listener has not exited, not starting", self.name);
            return;
        }

        *state = ReceiverState::Starting;
        self.trigger.reset();
        let source = Arc::clone(&self.source);
        let pose = Arc::clone(&self.pose);
        let stop = self.trigger.subscribe();
        let name = self.name.clone();

        let handle = tokio::spawn(async move {
            source.run(pose, stop).await;
            tracing::debug!("Receiver {} listener loop exited", name);
        });

        *task = Some(handle);
        *state = ReceiverState::Running;
        tracing::info!("Receiver {} started", self.name);
    }

    /// Signal the listener to exit and wait for it.
    ///
    /// Idempotent, and safe to call when `start` never ran. Concurrent callers
    /// all return only after the listener task has exited.
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock();
            match *state {
                ReceiverState::Created | ReceiverState::Stopped => {
                    *state = ReceiverState::Stopped;
                    return;
                }
                ReceiverState::Stopping => {}
                ReceiverState::Starting | ReceiverState::Running => {
                    *state = ReceiverState::Stopping;
                }
            }
        }

        self.trigger.stop();

        // Held across the join so a second caller waits for the same exit
        let mut task = self.task.lock().await;
        if let Some(handle) = task.take() {
            if let Err(e) = handle.await {
                tracing::error!("Receiver {} listener task failed: {}", self.name, e);
            }
        }
        drop(task);

        let mut state = self.state.lock();
        if *state == ReceiverState::Stopping {
            *state = ReceiverState::Stopped;
            tracing::info!("Receiver {} stopped", self.name);
        }
    }
}

impl fmt::Debug for MotionReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MotionReceiver")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

//! Authoritative recording session state.
//!
//! ```text
//! idle ──start──▶ recording ◀──resume── paused
//!                  │    ▲  └───pause───▶  │
//!                 stop  └──start── stopped ◀──stop──┘
//! ```
//!
//! [`SessionCoordinator`] holds the state machine, the registry of capture
//! contexts and the relay from contexts to the sink and UI. It runs as a single
//! task ([`SessionCoordinator::spawn`]) fed by a command channel, so transition
//! requests are applied strictly one at a time. Everything else talks to it
//! through a cloneable [`CoordinatorHandle`].

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::capture::StepTransport;
use crate::config::RecorderConfig;
use crate::error::{DeliveryError, RecorderError, Result, TransitionError};
use crate::sink::StepSink;
use crate::store::MetadataStore;
use crate::types::{
    ContextId, SessionCommand, SessionState, StateChange, StatusNotification, Step,
};

const UI_CHANNEL_CAPACITY: usize = 64;

/// Next state for `command`, `Ok(None)` for an accepted no-op.
///
/// `start` while already recording is idempotent: no reset, no broadcast.
pub fn next_state(
    from: SessionState,
    command: SessionCommand,
) -> std::result::Result<Option<SessionState>, TransitionError> {
    use SessionCommand::*;
    use SessionState::*;

    match (from, command) {
        (Idle | Stopped, Start) => Ok(Some(Recording)),
        (Recording, Start) => Ok(None),
        (Recording, Pause) => Ok(Some(Paused)),
        (Paused, Resume) => Ok(Some(Recording)),
        (Recording | Paused, Stop) => Ok(Some(Stopped)),
        _ => Err(TransitionError { command, from }),
    }
}

/// Delivery channel to one capture context.
pub trait ContextLink: Send {
    /// False when the context no longer exists.
    fn deliver(&self, change: StateChange) -> bool;
}

impl ContextLink for mpsc::UnboundedSender<StateChange> {
    fn deliver(&self, change: StateChange) -> bool {
        self.send(change).is_ok()
    }
}

/// Per-recipient outcome of one state broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: Vec<ContextId>,
    pub failed: Vec<(ContextId, DeliveryError)>,
}

impl BroadcastReport {
    pub fn all_delivered(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Result of an accepted command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub from: SessionState,
    pub to: SessionState,
    pub epoch: u64,
    /// False when the command was an accepted no-op.
    pub changed: bool,
    pub report: BroadcastReport,
}

/// Snapshot of the coordinator for status queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub status: StatusNotification,
    pub epoch: u64,
    pub contexts: usize,
}

/// What UI observers receive.
#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    Status(StatusNotification),
    /// A relayed Step, addressed to the context owning the control panel.
    Step {
        step: Step,
        origin: ContextId,
        panel: Option<ContextId>,
    },
}

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub display_buffer: usize,
    pub panel_key: String,
}

impl From<&RecorderConfig> for CoordinatorOptions {
    fn from(config: &RecorderConfig) -> Self {
        Self {
            display_buffer: config.display_buffer,
            panel_key: config.panel_key.clone(),
        }
    }
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self::from(&RecorderConfig::default())
    }
}

pub struct SessionCoordinator {
    state: SessionState,
    epoch: u64,
    contexts: BTreeMap<ContextId, Box<dyn ContextLink>>,
    next_context: u64,
    sink: Arc<dyn StepSink>,
    metadata: Metadata,
    panel: Option<ContextId>,
    ui: broadcast::Sender<UiEvent>,
    recent: VecDeque<Step>,
    options: CoordinatorOptions,
}

impl SessionCoordinator {
    /// Context ids restart with every coordinator, so a panel owner left in
    /// `store` by an earlier run is cleared here.
    pub fn new(
        sink: Arc<dyn StepSink>,
        mut store: Box<dyn MetadataStore>,
        options: CoordinatorOptions,
    ) -> Self {
        if store.get(&options.panel_key).is_some() {
            debug!(key = %options.panel_key, "clearing panel owner from a previous run");
            if let Err(error) = store.remove(&options.panel_key) {
                warn!(%error, "could not clear stale panel owner");
            }
        }
        let (ui, _) = broadcast::channel(UI_CHANNEL_CAPACITY);
        Self {
            state: SessionState::Idle,
            epoch: 0,
            contexts: BTreeMap::new(),
            next_context: 1,
            sink,
            metadata: Metadata::Inline(store),
            panel: None,
            ui,
            recent: VecDeque::new(),
            options,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.state,
            status: self.state.status(),
            epoch: self.epoch,
            contexts: self.contexts.len(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.ui.subscribe()
    }

    /// Validate and apply one command, then fan the result out.
    pub fn apply(
        &mut self,
        command: SessionCommand,
    ) -> std::result::Result<TransitionOutcome, TransitionError> {
        let from = self.state;
        let Some(to) = next_state(from, command)? else {
            debug!(%command, state = %from, "command is a no-op");
            return Ok(TransitionOutcome {
                from,
                to: from,
                epoch: self.epoch,
                changed: false,
                report: BroadcastReport::default(),
            });
        };

        if to == SessionState::Recording && matches!(from, SessionState::Idle | SessionState::Stopped) {
            self.epoch += 1;
        }
        self.state = to;
        info!(%command, %from, %to, epoch = self.epoch, "session transition");

        let status = to.status();
        self.sink.publish_status(status);
        let report = self.broadcast(StateChange {
            state: to,
            epoch: self.epoch,
        });
        let _ = self.ui.send(UiEvent::Status(status));

        Ok(TransitionOutcome {
            from,
            to,
            epoch: self.epoch,
            changed: true,
            report,
        })
    }

    /// Deliver `change` to every registered context. One failing recipient never
    /// stops the others; recipients that are gone are dropped from the registry.
    pub fn broadcast(&mut self, change: StateChange) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for (&id, link) in &self.contexts {
            if link.deliver(change) {
                report.delivered.push(id);
            } else {
                report.failed.push((id, DeliveryError::ContextGone(id)));
            }
        }
        for (id, error) in &report.failed {
            debug!(context = %id, %error, "pruning unreachable context");
            self.contexts.remove(id);
            self.release_panel(*id);
        }
        report
    }

    /// Add a context. A session already in progress is replayed to it at once.
    pub fn register(&mut self, link: Box<dyn ContextLink>) -> ContextId {
        let id = ContextId(self.next_context);
        self.next_context += 1;

        if matches!(self.state, SessionState::Recording | SessionState::Paused) {
            let change = StateChange {
                state: self.state,
                epoch: self.epoch,
            };
            if !link.deliver(change) {
                debug!(context = %id, "context closed before registration completed");
                return id;
            }
        }
        self.contexts.insert(id, link);
        debug!(context = %id, total = self.contexts.len(), "context registered");
        id
    }

    pub fn unregister(&mut self, id: ContextId) {
        if self.contexts.remove(&id).is_some() {
            debug!(context = %id, "context unregistered");
        }
        self.release_panel(id);
    }

    /// Forward a Step to the sink and UI. Steps that were in flight when the
    /// session stopped are still forwarded.
    pub fn relay(&mut self, origin: ContextId, step: Step) {
        self.sink.submit(&step);

        if self.options.display_buffer > 0 {
            while self.recent.len() >= self.options.display_buffer {
                self.recent.pop_front();
            }
            self.recent.push_back(step.clone());
        }

        let panel = self.panel_owner();
        let _ = self.ui.send(UiEvent::Step {
            step,
            origin,
            panel,
        });
    }

    /// Recent Steps, oldest first.
    pub fn recent_steps(&self) -> Vec<Step> {
        self.recent.iter().cloned().collect()
    }

    /// Grant the control panel to registered context `id` unless another live
    /// context already owns it.
    pub fn request_panel(&mut self, id: ContextId) -> bool {
        if !self.contexts.contains_key(&id) {
            debug!(context = %id, "panel request from unregistered context");
            return false;
        }
        match self.panel {
            Some(owner) if owner == id => return true,
            Some(owner) if self.contexts.contains_key(&owner) => return false,
            _ => {}
        }
        self.panel = Some(id);
        let key = self.options.panel_key.clone();
        self.persist(MetadataWrite::Set {
            key,
            value: json!(id.0),
        });
        info!(context = %id, "control panel assigned");
        true
    }

    fn panel_owner(&self) -> Option<ContextId> {
        self.panel
    }

    fn release_panel(&mut self, id: ContextId) {
        if self.panel == Some(id) {
            self.panel = None;
            let key = self.options.panel_key.clone();
            self.persist(MetadataWrite::Remove { key });
        }
    }

    fn persist(&mut self, write: MetadataWrite) {
        match &mut self.metadata {
            Metadata::Inline(store) => apply_write(store.as_mut(), write),
            Metadata::WriteBehind { writes, .. } => {
                if writes.send(write).is_err() {
                    warn!("metadata writer is gone; write dropped");
                }
            }
        }
    }

    /// Run as a task; the returned handle is the only way in.
    ///
    /// From here on the metadata store is written from a blocking thread so
    /// disk I/O never stalls command processing.
    pub fn spawn(mut self) -> (CoordinatorHandle, JoinHandle<()>) {
        self.metadata = match self.metadata {
            Metadata::Inline(store) => {
                let (writes, rx) = mpsc::unbounded_channel();
                let writer = tokio::task::spawn_blocking(move || write_behind(store, rx));
                Metadata::WriteBehind { writes, writer }
            }
            running => running,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = CoordinatorHandle {
            tx,
            ui: self.ui.clone(),
        };
        let task = tokio::spawn(self.run(rx));
        (handle, task)
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            self.handle(command);
        }
        if let Metadata::WriteBehind { writes, writer } = self.metadata {
            drop(writes);
            if let Err(error) = writer.await {
                warn!(%error, "metadata writer failed");
            }
        }
        debug!("coordinator stopped: all handles dropped");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Transition { command, reply } => {
                let result = self.apply(command);
                if let Err(error) = &result {
                    warn!(%error, "rejected session command");
                }
                let _ = reply.send(result);
            }
            Command::Register { link, reply } => {
                let _ = reply.send(self.register(link));
            }
            Command::Unregister { id } => self.unregister(id),
            Command::SubmitStep { origin, step } => self.relay(origin, step),
            Command::RequestPanel { id, reply } => {
                let _ = reply.send(self.request_panel(id));
            }
            Command::Status { reply } => {
                let _ = reply.send(self.status());
            }
            Command::RecentSteps { reply } => {
                let _ = reply.send(self.recent_steps());
            }
        }
    }
}

enum Metadata {
    Inline(Box<dyn MetadataStore>),
    WriteBehind {
        writes: mpsc::UnboundedSender<MetadataWrite>,
        writer: JoinHandle<()>,
    },
}

enum MetadataWrite {
    Set { key: String, value: serde_json::Value },
    Remove { key: String },
}

fn apply_write(store: &mut dyn MetadataStore, write: MetadataWrite) {
    let (key, result) = match write {
        MetadataWrite::Set { key, value } => {
            let result = store.set(&key, value);
            (key, result)
        }
        MetadataWrite::Remove { key } => {
            let result = store.remove(&key);
            (key, result)
        }
    };
    if let Err(error) = result {
        warn!(%key, %error, "could not persist session metadata");
    }
}

fn write_behind(
    mut store: Box<dyn MetadataStore>,
    mut writes: mpsc::UnboundedReceiver<MetadataWrite>,
) {
    while let Some(write) = writes.blocking_recv() {
        apply_write(store.as_mut(), write);
    }
}

enum Command {
    Transition {
        command: SessionCommand,
        reply: oneshot::Sender<std::result::Result<TransitionOutcome, TransitionError>>,
    },
    Register {
        link: Box<dyn ContextLink>,
        reply: oneshot::Sender<ContextId>,
    },
    Unregister {
        id: ContextId,
    },
    SubmitStep {
        origin: ContextId,
        step: Step,
    },
    RequestPanel {
        id: ContextId,
        reply: oneshot::Sender<bool>,
    },
    Status {
        reply: oneshot::Sender<SessionStatus>,
    },
    RecentSteps {
        reply: oneshot::Sender<Vec<Step>>,
    },
}

/// Cloneable front door to a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<Command>,
    ui: broadcast::Sender<UiEvent>,
}

impl CoordinatorHandle {
    pub async fn start(&self) -> Result<TransitionOutcome> {
        self.command(SessionCommand::Start).await
    }

    pub async fn pause(&self) -> Result<TransitionOutcome> {
        self.command(SessionCommand::Pause).await
    }

    pub async fn resume(&self) -> Result<TransitionOutcome> {
        self.command(SessionCommand::Resume).await
    }

    pub async fn stop(&self) -> Result<TransitionOutcome> {
        self.command(SessionCommand::Stop).await
    }

    pub async fn command(&self, command: SessionCommand) -> Result<TransitionOutcome> {
        let result = self
            .request(|reply| Command::Transition { command, reply })
            .await?;
        Ok(result?)
    }

    /// Register a new context and hand back the receiving end of its state feed.
    pub async fn register(&self) -> Result<(ContextId, mpsc::UnboundedReceiver<StateChange>)> {
        let (link, inbox) = mpsc::unbounded_channel();
        let id = self
            .request(|reply| Command::Register {
                link: Box::new(link),
                reply,
            })
            .await?;
        Ok((id, inbox))
    }

    pub fn unregister(&self, id: ContextId) {
        let _ = self.tx.send(Command::Unregister { id });
    }

    pub async fn request_panel(&self, id: ContextId) -> Result<bool> {
        self.request(|reply| Command::RequestPanel { id, reply }).await
    }

    pub async fn status(&self) -> Result<SessionStatus> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub async fn recent_steps(&self) -> Result<Vec<Step>> {
        self.request(|reply| Command::RecentSteps { reply }).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.ui.subscribe()
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| RecorderError::CoordinatorGone)?;
        response.await.map_err(|_| RecorderError::CoordinatorGone)
    }
}

impl StepTransport for CoordinatorHandle {
    fn send_step(&self, origin: ContextId, step: Step) {
        if self.tx.send(Command::SubmitStep { origin, step }).is_err() {
            debug!(context = %origin, "coordinator gone; step dropped");
        }
    }
}

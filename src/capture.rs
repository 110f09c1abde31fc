//! Per-page capture: local session flags, event filtering and Step emission.
//!
//! A [`CaptureContext`] mirrors the coordinator's state from the broadcasts it
//! receives. Observers stay attached for the page's whole life; while the local
//! state is anything but `recording` events are simply dropped.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::coordinator::CoordinatorHandle;
use crate::dom::Document;
use crate::error::Result;
use crate::locator::capture_snapshot;
use crate::normalizer::{
    Clock, DomEvent, NavigationSignal, NavigationWatcher, PageContext, RawEvent, SequenceCounter,
    accept_event, normalize,
};
use crate::types::{ActionKind, ActionPayload, ContextId, SessionState, StateChange, Step};

/// Outbound path for Steps. Best effort: the producer is never told about failures.
pub trait StepTransport: Send + Sync {
    fn send_step(&self, origin: ContextId, step: Step);
}

pub struct CaptureContext {
    id: ContextId,
    recording: bool,
    paused: bool,
    epoch: Option<u64>,
    sequence: SequenceCounter,
    page: PageContext,
    navigation: NavigationWatcher,
    transport: Arc<dyn StepTransport>,
    clock: Arc<dyn Clock>,
    inbox: Option<mpsc::UnboundedReceiver<StateChange>>,
}

impl CaptureContext {
    pub fn new(
        id: ContextId,
        page: PageContext,
        transport: Arc<dyn StepTransport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let navigation = NavigationWatcher::new(page.url.clone());
        Self {
            id,
            recording: false,
            paused: false,
            epoch: None,
            sequence: SequenceCounter::default(),
            page,
            navigation,
            transport,
            clock,
            inbox: None,
        }
    }

    /// Register with a running coordinator and pick up any session in progress.
    pub async fn attach(
        coordinator: &CoordinatorHandle,
        page: PageContext,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let (id, inbox) = coordinator.register().await?;
        let mut context = Self::new(id, page, Arc::new(coordinator.clone()), clock);
        context.inbox = Some(inbox);
        context.pump();
        Ok(context)
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn page(&self) -> &PageContext {
        &self.page
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Only state in which Steps are produced.
    pub fn is_capturing(&self) -> bool {
        self.recording && !self.paused
    }

    /// Sequence id of the last Step this context produced.
    pub fn last_sequence_id(&self) -> u64 {
        self.sequence.last()
    }

    /// Mirror a coordinator broadcast. Returns false when nothing changed.
    ///
    /// A new epoch means a fresh session, which restarts numbering; a resume
    /// arrives under the same epoch and continues it.
    pub fn apply_state_change(&mut self, change: StateChange) -> bool {
        let (recording, paused) = match change.state {
            SessionState::Recording => (true, false),
            SessionState::Paused => (true, true),
            SessionState::Idle | SessionState::Stopped => (false, false),
        };
        let new_session = self.epoch != Some(change.epoch);
        if !new_session && self.recording == recording && self.paused == paused {
            trace!(context = %self.id, state = %change.state, "state already applied");
            return false;
        }
        if new_session {
            self.sequence.reset();
            self.epoch = Some(change.epoch);
        }
        self.recording = recording;
        self.paused = paused;
        debug!(context = %self.id, state = %change.state, epoch = change.epoch, "local state updated");
        true
    }

    /// Apply every broadcast that has arrived so far without waiting.
    pub fn pump(&mut self) -> usize {
        let mut pending = Vec::new();
        if let Some(inbox) = self.inbox.as_mut() {
            while let Ok(change) = inbox.try_recv() {
                pending.push(change);
            }
        }
        let applied = pending.len();
        for change in pending {
            self.apply_state_change(change);
        }
        applied
    }

    /// Wait for the next broadcast and apply it. `None` once the coordinator is gone.
    pub async fn next_state_change(&mut self) -> Option<StateChange> {
        let change = self.inbox.as_mut()?.recv().await?;
        self.apply_state_change(change);
        Some(change)
    }

    /// Handle a DOM event from the page's capture-phase listeners.
    pub fn handle_dom_event(&mut self, doc: &Document, event: DomEvent) -> Option<Step> {
        if !self.is_capturing() {
            trace!(context = %self.id, kind = ?event.kind, "event discarded: not recording");
            return None;
        }
        let accepted = accept_event(doc, &event)?;
        let snapshot = capture_snapshot(doc, accepted.target);
        let step = normalize(
            accepted.action,
            RawEvent {
                page: self.page.clone(),
                payload: accepted.payload,
            },
            snapshot,
            &mut self.sequence,
            self.clock.as_ref(),
        );
        Some(self.emit(step))
    }

    /// Location changed without a page load (single-page-app routing).
    pub fn handle_route_change(
        &mut self,
        url: &str,
        title: &str,
        signal: NavigationSignal,
    ) -> Option<Step> {
        if !self.navigation.observe(url, signal) {
            return None;
        }
        self.page = PageContext::new(url, title);
        if !self.is_capturing() {
            return None;
        }
        Some(self.emit_page_step(ActionKind::Navigate))
    }

    /// A full document load finished in this context.
    pub fn handle_page_load(&mut self, url: &str, title: &str) -> Option<Step> {
        self.navigation.reset(url);
        self.page = PageContext::new(url, title);
        if !self.is_capturing() {
            return None;
        }
        Some(self.emit_page_step(ActionKind::Open))
    }

    fn emit_page_step(&mut self, action: ActionKind) -> Step {
        let step = normalize(
            action,
            RawEvent {
                page: self.page.clone(),
                payload: ActionPayload::default(),
            },
            None,
            &mut self.sequence,
            self.clock.as_ref(),
        );
        self.emit(step)
    }

    fn emit(&self, step: Step) -> Step {
        debug!(context = %self.id, id = step.sequence_id, action = %step.action, "step captured");
        self.transport.send_step(self.id, step.clone());
        step
    }
}

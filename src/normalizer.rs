//! Raw DOM events to immutable [`Step`] records.
//!
//! Filtering ([`accept_event`]) runs before normalization and decides whether an
//! event is worth a Step at all. [`normalize`] then stamps sequence, page and
//! time onto the accepted event.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::dom::{Document, NodeId};
use crate::types::{ActionKind, ActionPayload, ElementSnapshot, RESERVED_FIELDS, Step};

/// Source of `timestampMillis`. Swappable so tests stay deterministic.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self(AtomicU64::new(start))
    }

    pub fn advance(&self, millis: u64) {
        self.0.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-context step numbering. The first Step after a reset gets id 1.
#[derive(Debug, Default, Clone)]
pub struct SequenceCounter {
    last: u64,
}

impl SequenceCounter {
    pub fn reset(&mut self) {
        self.last = 0;
    }

    pub fn next_id(&mut self) -> u64 {
        self.last += 1;
        self.last
    }

    pub fn last(&self) -> u64 {
        self.last
    }
}

/// Location and title of the page an event happened on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageContext {
    pub url: String,
    pub title: String,
}

impl PageContext {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
        }
    }
}

/// DOM event types the capture layer listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomEventKind {
    Click,
    Input,
    Change,
    Submit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomEvent {
    pub kind: DomEventKind,
    pub target: NodeId,
}

impl DomEvent {
    pub fn new(kind: DomEventKind, target: NodeId) -> Self {
        Self { kind, target }
    }
}

/// An event that passed the filtering policy.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedEvent {
    pub action: ActionKind,
    pub target: NodeId,
    pub payload: ActionPayload,
}

/// Filtering policy: which DOM events become Steps.
///
/// - `click` on any element
/// - `input` on `input`/`textarea`, never on password fields
/// - `change` on `select` (value) and checkbox/radio inputs (checked flag)
/// - `submit`
pub fn accept_event(doc: &Document, event: &DomEvent) -> Option<AcceptedEvent> {
    let el = doc.element(event.target)?;
    let (action, payload) = match event.kind {
        DomEventKind::Click => (ActionKind::Click, ActionPayload::default()),
        DomEventKind::Input => {
            if !matches!(el.tag(), "input" | "textarea") || el.is_password_field() {
                return None;
            }
            (ActionKind::Input, ActionPayload::with_value(el.current_value()))
        }
        DomEventKind::Change => match (el.tag(), el.input_type().as_deref()) {
            ("select", _) => (ActionKind::Select, ActionPayload::with_value(el.current_value())),
            ("input", Some("checkbox" | "radio")) => {
                (ActionKind::Check, ActionPayload::with_checked(el.checked))
            }
            _ => return None,
        },
        DomEventKind::Submit => (ActionKind::Submit, ActionPayload::default()),
    };
    Some(AcceptedEvent {
        action,
        target: event.target,
        payload,
    })
}

/// The event-side inputs of a Step.
#[derive(Debug, Clone, Default)]
pub struct RawEvent {
    pub page: PageContext,
    pub payload: ActionPayload,
}

/// Build a Step, consuming exactly one sequence id.
pub fn normalize(
    action: ActionKind,
    raw: RawEvent,
    snapshot: Option<ElementSnapshot>,
    sequence: &mut SequenceCounter,
    clock: &dyn Clock,
) -> Step {
    let RawEvent { page, mut payload } = raw;
    let has_value = payload.value.is_some();
    let has_checked = payload.checked.is_some();
    payload.extra.retain(|key, _| {
        let shadowed = RESERVED_FIELDS.contains(&key.as_str())
            || (key == "value" && has_value)
            || (key == "checked" && has_checked);
        if shadowed {
            debug!(key = %key, "dropping payload field that shadows a step field");
        }
        !shadowed
    });

    let primary_selector = snapshot
        .as_ref()
        .map(|s| s.primary_selector().to_string())
        .unwrap_or_default();

    Step {
        sequence_id: sequence.next_id(),
        action,
        url: page.url,
        page_title: page.title,
        timestamp_millis: clock.now_millis(),
        primary_selector,
        element: snapshot,
        payload,
    }
}

/// Which host signal reported a location change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationSignal {
    /// Subtree mutation observed; the URL was re-read afterwards.
    DomMutation,
    /// `pushState`/`popstate`/`hashchange` notification.
    HistoryChange,
}

/// Collapses duplicate route-change notifications for one URL transition.
#[derive(Debug, Clone)]
pub struct NavigationWatcher {
    last_url: String,
}

impl NavigationWatcher {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            last_url: url.into(),
        }
    }

    /// Record a location report. True when the URL actually changed.
    pub fn observe(&mut self, url: &str, signal: NavigationSignal) -> bool {
        if url == self.last_url {
            debug!(url, ?signal, "duplicate location report suppressed");
            return false;
        }
        self.last_url = url.to_string();
        true
    }

    /// A full page load replaces the baseline without counting as a route change.
    pub fn reset(&mut self, url: impl Into<String>) {
        self.last_url = url.into();
    }

    pub fn last_url(&self) -> &str {
        &self.last_url
    }
}

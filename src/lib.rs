//! Records user interactions with a web page as replayable Steps.
//!
//! Each Step says what happened (click, input, navigation...) and how to find
//! the same element again: a ranked list of selector candidates. Any number of
//! capture contexts (tabs, frames) stay in agreement about the recording
//! session through a single coordinator that they only reach by messages.

pub mod capture;
pub mod config;
pub mod coordinator;
pub mod dom;
pub mod error;
pub mod locator;
pub mod normalizer;
pub mod sink;
pub mod store;
pub mod types;

pub use capture::{CaptureContext, StepTransport};
pub use config::RecorderConfig;
pub use coordinator::{
    BroadcastReport, CoordinatorHandle, CoordinatorOptions, SessionCoordinator, SessionStatus,
    TransitionOutcome, UiEvent,
};
pub use dom::{Document, NodeId, NodeSpec};
pub use error::{DeliveryError, RecorderError, TransitionError};
pub use locator::{capture_snapshot, css_path, generate_candidates};
pub use normalizer::{
    Clock, DomEvent, DomEventKind, ManualClock, NavigationSignal, PageContext, SystemClock,
};
pub use sink::{ChannelSink, HttpSink, NullSink, SinkRecord, StepSink};
pub use store::{JsonFileStore, MemoryStore, MetadataStore};
pub use types::{
    ActionKind, ActionPayload, BoundingBox, ContextId, ElementSnapshot, SelectorCandidate,
    SelectorKind, SessionCommand, SessionState, StateChange, StatusNotification, Step,
};

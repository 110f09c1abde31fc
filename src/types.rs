use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Most recent Steps kept for UI observers.
pub const DISPLAY_BUFFER_DEFAULT: usize = 50;
/// Visible text kept in an element snapshot.
pub const SNAPSHOT_TEXT_MAX_CHARS: usize = 100;
/// Visible text used inside a text selector.
pub const TEXT_SELECTOR_MAX_CHARS: usize = 50;

/// Payload keys a Step owns itself. Action payloads may never overwrite them.
pub const RESERVED_FIELDS: [&str; 7] = [
    "id",
    "action",
    "url",
    "title",
    "timestamp",
    "selector",
    "elementInfo",
];

/// One observation context (a tab, a frame) as known to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(pub u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What the user did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Click,
    Input,
    Select,
    Check,
    Submit,
    Navigate,
    Open,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Click => "click",
            ActionKind::Input => "input",
            ActionKind::Select => "select",
            ActionKind::Check => "check",
            ActionKind::Submit => "submit",
            ActionKind::Navigate => "navigate",
            ActionKind::Open => "open",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a selector candidate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectorKind {
    Id,
    Name,
    TestAttribute,
    Text,
    Placeholder,
    Href,
    InputType,
    CssPath,
}

/// One proposed selector with its confidence score. Produced fresh per query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorCandidate {
    pub kind: SelectorKind,
    pub value: String,
    pub score: u32,
}

/// Element rectangle in viewport coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Element state captured atomically when the triggering event fired.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementSnapshot {
    pub tag: String,
    #[serde(rename = "text")]
    pub visible_text: String,
    pub id: String,
    pub name: String,
    #[serde(rename = "class")]
    pub class_name: String,
    pub placeholder: String,
    pub href: String,
    pub value: String,
    #[serde(rename = "rect")]
    pub bounding_box: BoundingBox,
    /// Ranked candidates, best first.
    #[serde(rename = "selectors")]
    pub candidates: Vec<SelectorCandidate>,
}

impl ElementSnapshot {
    pub fn primary_selector(&self) -> &str {
        self.candidates
            .first()
            .map(|c| c.value.as_str())
            .unwrap_or_default()
    }
}

/// Action-specific fields merged into a Step.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ActionPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked: Option<bool>,
    /// Anything else the producer attached. Reserved keys are stripped on normalization.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ActionPayload {
    pub fn with_value(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            ..Self::default()
        }
    }

    pub fn with_checked(checked: bool) -> Self {
        Self {
            checked: Some(checked),
            ..Self::default()
        }
    }
}

/// One normalized recorded interaction. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    #[serde(rename = "id")]
    pub sequence_id: u64,
    #[serde(rename = "action")]
    pub action: ActionKind,
    pub url: String,
    #[serde(rename = "title")]
    pub page_title: String,
    #[serde(rename = "timestamp")]
    pub timestamp_millis: u64,
    #[serde(rename = "selector")]
    pub primary_selector: String,
    #[serde(rename = "elementInfo", default, skip_serializing_if = "Option::is_none")]
    pub element: Option<ElementSnapshot>,
    #[serde(flatten)]
    pub payload: ActionPayload,
}

/// Authoritative session state, owned by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    #[default]
    Idle,
    Recording,
    Paused,
    Stopped,
}

impl SessionState {
    pub fn status(self) -> StatusNotification {
        match self {
            SessionState::Recording => StatusNotification {
                recording: true,
                paused: false,
            },
            SessionState::Paused => StatusNotification {
                recording: true,
                paused: true,
            },
            SessionState::Idle | SessionState::Stopped => StatusNotification {
                recording: false,
                paused: false,
            },
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Idle => "idle",
            SessionState::Recording => "recording",
            SessionState::Paused => "paused",
            SessionState::Stopped => "stopped",
        })
    }
}

/// User-facing session commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionCommand {
    Start,
    Pause,
    Resume,
    Stop,
}

impl fmt::Display for SessionCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionCommand::Start => "start",
            SessionCommand::Pause => "pause",
            SessionCommand::Resume => "resume",
            SessionCommand::Stop => "stop",
        })
    }
}

/// `{ recording, paused }` pair pushed to the sink and UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusNotification {
    pub recording: bool,
    pub paused: bool,
}

/// State broadcast from the coordinator to every capture context.
///
/// `epoch` increases on every fresh start, so a context can tell a new session
/// from a resumed one even if it missed intermediate messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChange {
    pub state: SessionState,
    pub epoch: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_step() -> Step {
        Step {
            sequence_id: 3,
            action: ActionKind::Input,
            url: "https://shop.test/login".into(),
            page_title: "Login".into(),
            timestamp_millis: 1_700_000_000_000,
            primary_selector: "#email".into(),
            element: None,
            payload: ActionPayload::with_value("a@b.c"),
        }
    }

    #[test]
    fn step_wire_shape() {
        let value = serde_json::to_value(sample_step()).unwrap();
        assert_eq!(
            value,
            json!({
                "id": 3,
                "action": "input",
                "url": "https://shop.test/login",
                "title": "Login",
                "timestamp": 1_700_000_000_000u64,
                "selector": "#email",
                "value": "a@b.c",
            })
        );
    }

    #[test]
    fn step_parses_from_wire() {
        let step: Step = serde_json::from_value(json!({
            "id": 1,
            "action": "check",
            "url": "https://x.test/",
            "title": "X",
            "timestamp": 5,
            "selector": "#agree",
            "checked": true,
        }))
        .unwrap();
        assert_eq!(step.action, ActionKind::Check);
        assert_eq!(step.payload.checked, Some(true));
        assert!(step.payload.extra.is_empty());
        assert!(step.element.is_none());
    }

    #[test]
    fn status_pairs() {
        assert_eq!(
            SessionState::Paused.status(),
            StatusNotification {
                recording: true,
                paused: true
            }
        );
        assert_eq!(SessionState::Stopped.status(), StatusNotification::default());
        assert_eq!(SessionState::Idle.status(), StatusNotification::default());
    }

    #[test]
    fn primary_selector_of_empty_snapshot() {
        let snapshot = ElementSnapshot {
            tag: "div".into(),
            visible_text: String::new(),
            id: String::new(),
            name: String::new(),
            class_name: String::new(),
            placeholder: String::new(),
            href: String::new(),
            value: String::new(),
            bounding_box: BoundingBox::default(),
            candidates: Vec::new(),
        };
        assert_eq!(snapshot.primary_selector(), "");
    }
}

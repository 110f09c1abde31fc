//! Scripted browsing sessions.
//!
//! A scenario file declares the pages each context starts on and a script of
//! session commands and user interactions. Running one drives real
//! [`CaptureContext`]s against a live coordinator, so every Step takes the
//! same path it would take from a browser.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result, anyhow};
use serde::Deserialize;
use step_recorder::{
    CaptureContext, Clock, CoordinatorHandle, Document, DomEvent, DomEventKind, NavigationSignal,
    NodeSpec, PageContext, SessionCommand, StatusNotification, Step, StepSink,
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    pub pages: Vec<PageSpec>,
    pub script: Vec<Action>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PageSpec {
    pub context: String,
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default = "NodeSpec::blank_page")]
    pub dom: NodeSpec,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "do", rename_all = "snake_case")]
pub enum Action {
    Command {
        command: SessionCommand,
    },
    Click {
        context: String,
        target: String,
    },
    Input {
        context: String,
        target: String,
        value: String,
    },
    Change {
        context: String,
        target: String,
        #[serde(default)]
        value: Option<String>,
        #[serde(default)]
        checked: Option<bool>,
    },
    Submit {
        context: String,
        target: String,
    },
    Route {
        context: String,
        url: String,
        #[serde(default)]
        title: String,
    },
    Load {
        context: String,
        url: String,
        #[serde(default)]
        title: String,
        #[serde(default)]
        dom: Option<NodeSpec>,
    },
    OpenContext {
        page: PageSpec,
    },
    CloseContext {
        context: String,
    },
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading scenario {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing scenario {}", path.display()))
    }
}

/// What a run produced, as seen by the contexts.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub emitted: Vec<Step>,
    pub rejected_commands: usize,
}

struct Tab {
    capture: CaptureContext,
    doc: Document,
}

pub struct ScenarioRunner {
    coordinator: CoordinatorHandle,
    clock: Arc<dyn Clock>,
    tabs: BTreeMap<String, Tab>,
}

impl ScenarioRunner {
    pub fn new(coordinator: CoordinatorHandle, clock: Arc<dyn Clock>) -> Self {
        Self {
            coordinator,
            clock,
            tabs: BTreeMap::new(),
        }
    }

    pub async fn run(mut self, scenario: Scenario) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        for page in scenario.pages {
            self.open(page).await?;
        }

        for (index, action) in scenario.script.into_iter().enumerate() {
            debug!(index, ?action, "script action");
            match action {
                Action::Command { command } => {
                    if let Err(error) = self.coordinator.command(command).await {
                        warn!(%error, "command rejected");
                        summary.rejected_commands += 1;
                    }
                    self.pump_all();
                }
                Action::Click { context, target } => {
                    let step = self.dispatch(&context, &target, DomEventKind::Click, |_| {})?;
                    summary.emitted.extend(step);
                }
                Action::Input {
                    context,
                    target,
                    value,
                } => {
                    let step = self.dispatch(&context, &target, DomEventKind::Input, |el| {
                        el.value = Some(value)
                    })?;
                    summary.emitted.extend(step);
                }
                Action::Change {
                    context,
                    target,
                    value,
                    checked,
                } => {
                    let step = self.dispatch(&context, &target, DomEventKind::Change, |el| {
                        if let Some(value) = value {
                            el.value = Some(value);
                        }
                        if let Some(checked) = checked {
                            el.checked = checked;
                        }
                    })?;
                    summary.emitted.extend(step);
                }
                Action::Submit { context, target } => {
                    let step = self.dispatch(&context, &target, DomEventKind::Submit, |_| {})?;
                    summary.emitted.extend(step);
                }
                Action::Route {
                    context,
                    url,
                    title,
                } => {
                    let tab = self.tab(&context)?;
                    let step =
                        tab.capture
                            .handle_route_change(&url, &title, NavigationSignal::HistoryChange);
                    summary.emitted.extend(step);
                }
                Action::Load {
                    context,
                    url,
                    title,
                    dom,
                } => {
                    let tab = self.tab(&context)?;
                    if let Some(spec) = dom {
                        tab.doc = Document::from_spec(&spec)?;
                    }
                    summary
                        .emitted
                        .extend(tab.capture.handle_page_load(&url, &title));
                }
                Action::OpenContext { page } => self.open(page).await?,
                Action::CloseContext { context } => {
                    let tab = self
                        .tabs
                        .remove(&context)
                        .ok_or_else(|| anyhow!("no context named {context:?}"))?;
                    self.coordinator.unregister(tab.capture.id());
                    info!(context = %tab.capture.id(), name = %context, "context closed");
                }
            }
        }

        // Steps and commands share one queue, so a status round-trip means every
        // emitted Step has been relayed.
        let status = self.coordinator.status().await?;
        info!(state = %status.state, steps = summary.emitted.len(), "scenario finished");
        Ok(summary)
    }

    async fn open(&mut self, page: PageSpec) -> Result<()> {
        if self.tabs.contains_key(&page.context) {
            return Err(anyhow!("context {:?} is already open", page.context));
        }
        let doc = Document::from_spec(&page.dom)
            .with_context(|| format!("page for context {:?}", page.context))?;
        let capture = CaptureContext::attach(
            &self.coordinator,
            PageContext::new(&page.url, &page.title),
            self.clock.clone(),
        )
        .await?;
        let owns_panel = self.coordinator.request_panel(capture.id()).await?;
        info!(
            context = %capture.id(),
            name = %page.context,
            recording = capture.is_recording(),
            owns_panel,
            "context opened"
        );
        self.tabs.insert(
            page.context,
            Tab { capture, doc },
        );
        Ok(())
    }

    fn pump_all(&mut self) {
        for tab in self.tabs.values_mut() {
            tab.capture.pump();
        }
    }

    fn tab(&mut self, name: &str) -> Result<&mut Tab> {
        self.tabs
            .get_mut(name)
            .ok_or_else(|| anyhow!("no context named {name:?}"))
    }

    fn dispatch(
        &mut self,
        context: &str,
        target: &str,
        kind: DomEventKind,
        mutate: impl FnOnce(&mut step_recorder::dom::Element),
    ) -> Result<Option<Step>> {
        let tab = self.tab(context)?;
        let node = tab.doc.resolve(target)?;
        if let Some(el) = tab.doc.element_mut(node) {
            mutate(el);
        }
        Ok(tab
            .capture
            .handle_dom_event(&tab.doc, DomEvent::new(kind, node)))
    }
}

/// Writes each Step as one JSON line on stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl StepSink for StdoutSink {
    fn submit(&self, step: &Step) {
        match serde_json::to_string(step) {
            Ok(line) => println!("{line}"),
            Err(error) => warn!(%error, id = step.sequence_id, "could not encode step"),
        }
    }

    fn publish_status(&self, status: StatusNotification) {
        debug!(recording = status.recording, paused = status.paused, "status");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use step_recorder::{
        ActionKind, ChannelSink, CoordinatorOptions, ManualClock, MemoryStore, SessionCoordinator,
        SinkRecord,
    };

    const SCENARIO: &str = r#"{
        "pages": [{
            "context": "main",
            "url": "https://shop.test/login",
            "title": "Login",
            "dom": { "tag": "html", "children": [{ "tag": "body", "children": [
                { "tag": "input", "ref": "email", "attrs": { "type": "email", "placeholder": "Email" } },
                { "tag": "input", "ref": "pw", "attrs": { "type": "password" } },
                { "tag": "input", "ref": "terms", "attrs": { "type": "checkbox", "name": "terms" } },
                { "tag": "button", "attrs": { "id": "go" }, "children": ["Sign in"] }
            ]}]}
        }],
        "script": [
            { "do": "click", "context": "main", "target": "go" },
            { "do": "command", "command": "start" },
            { "do": "input", "context": "main", "target": "email", "value": "a@b.test" },
            { "do": "input", "context": "main", "target": "pw", "value": "hunter2" },
            { "do": "change", "context": "main", "target": "terms", "checked": true },
            { "do": "click", "context": "main", "target": "go" },
            { "do": "route", "context": "main", "url": "https://shop.test/home", "title": "Home" },
            { "do": "command", "command": "resume" },
            { "do": "command", "command": "stop" },
            { "do": "click", "context": "main", "target": "go" }
        ]
    }"#;

    #[tokio::test]
    async fn scripted_session_produces_ordered_steps() {
        let (sink, mut rx) = ChannelSink::new();
        let coordinator = SessionCoordinator::new(
            Arc::new(sink),
            Box::new(MemoryStore::default()),
            CoordinatorOptions::default(),
        );
        let (handle, _task) = coordinator.spawn();
        let scenario: Scenario = serde_json::from_str(SCENARIO).unwrap();

        let summary = ScenarioRunner::new(handle, Arc::new(ManualClock::new(1_000)))
            .run(scenario)
            .await
            .unwrap();

        assert_eq!(summary.rejected_commands, 1);
        let actions: Vec<_> = summary.emitted.iter().map(|s| s.action).collect();
        assert_eq!(
            actions,
            vec![
                ActionKind::Input,
                ActionKind::Check,
                ActionKind::Click,
                ActionKind::Navigate
            ]
        );
        let ids: Vec<_> = summary.emitted.iter().map(|s| s.sequence_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert_eq!(summary.emitted[0].primary_selector, r#"[placeholder="Email"]"#);

        let mut relayed = Vec::new();
        while let Ok(record) = rx.try_recv() {
            if let SinkRecord::Step(step) = record {
                relayed.push(step.sequence_id);
            }
        }
        assert_eq!(relayed, vec![1, 2, 3, 4]);
    }

    #[test]
    fn unknown_action_is_a_parse_error() {
        let raw = r#"{ "pages": [], "script": [{ "do": "hover", "context": "x" }] }"#;
        assert!(serde_json::from_str::<Scenario>(raw).is_err());
    }

    #[test]
    fn page_without_dom_gets_a_blank_body() {
        let raw = r#"{ "context": "main", "url": "https://x.test/" }"#;
        let page: PageSpec = serde_json::from_str(raw).unwrap();
        let doc = Document::from_spec(&page.dom).unwrap();
        assert_eq!(doc.children(doc.root()).len(), 1);
    }
}

use std::sync::Arc;

use step_recorder::{
    ActionKind, CaptureContext, ChannelSink, CoordinatorHandle, CoordinatorOptions, Document,
    DomEvent, DomEventKind, ManualClock, MemoryStore, NodeSpec, PageContext, SessionState,
    SessionCoordinator, SinkRecord, Step,
};
use tokio::sync::mpsc::UnboundedReceiver;

const PAGE: &str = r#"{
    "tag": "html",
    "children": [{ "tag": "body", "children": [
        { "tag": "button", "attrs": { "id": "buy" }, "children": ["Buy"] },
        { "tag": "a", "ref": "help", "attrs": { "href": "/help" }, "children": ["Help"] }
    ]}]
}"#;

fn page() -> Document {
    let spec: NodeSpec = serde_json::from_str(PAGE).unwrap();
    Document::from_spec(&spec).unwrap()
}

fn spawn(options: CoordinatorOptions) -> (CoordinatorHandle, UnboundedReceiver<SinkRecord>) {
    let (sink, rx) = ChannelSink::new();
    let coordinator =
        SessionCoordinator::new(Arc::new(sink), Box::new(MemoryStore::default()), options);
    let (handle, _task) = coordinator.spawn();
    (handle, rx)
}

async fn attach(handle: &CoordinatorHandle, url: &str) -> CaptureContext {
    CaptureContext::attach(
        handle,
        PageContext::new(url, "Shop"),
        Arc::new(ManualClock::new(0)),
    )
    .await
    .unwrap()
}

fn click(context: &mut CaptureContext, doc: &Document, target: &str) -> Option<Step> {
    let node = doc.resolve(target).unwrap();
    context.handle_dom_event(doc, DomEvent::new(DomEventKind::Click, node))
}

fn drain_steps(rx: &mut UnboundedReceiver<SinkRecord>) -> Vec<Step> {
    let mut steps = Vec::new();
    while let Ok(record) = rx.try_recv() {
        if let SinkRecord::Step(step) = record {
            steps.push(step);
        }
    }
    steps
}

#[tokio::test]
async fn pause_suppresses_capture_without_breaking_the_sequence() {
    let (handle, mut rx) = spawn(CoordinatorOptions::default());
    let doc = page();
    let mut tab = attach(&handle, "https://shop.test/").await;

    handle.start().await.unwrap();
    tab.pump();
    for _ in 0..3 {
        assert!(click(&mut tab, &doc, "buy").is_some());
    }

    handle.pause().await.unwrap();
    tab.pump();
    for _ in 0..2 {
        assert!(click(&mut tab, &doc, "buy").is_none());
    }

    handle.resume().await.unwrap();
    tab.pump();
    assert!(click(&mut tab, &doc, "help").is_some());

    handle.stop().await.unwrap();
    tab.pump();
    assert!(click(&mut tab, &doc, "buy").is_none());

    let status = handle.status().await.unwrap();
    assert_eq!(status.state, SessionState::Stopped);

    let steps = drain_steps(&mut rx);
    let ids: Vec<_> = steps.iter().map(|s| s.sequence_id).collect();
    assert_eq!(ids, vec![1, 2, 3, 4]);
    assert_eq!(steps[0].primary_selector, "#buy");
    assert_eq!(steps[3].primary_selector, r#"a:text("Help")"#);
    assert!(steps.iter().all(|s| s.action == ActionKind::Click));
}

#[tokio::test]
async fn every_context_follows_the_session() {
    let (handle, mut rx) = spawn(CoordinatorOptions::default());
    let doc = page();
    let mut first = attach(&handle, "https://shop.test/a").await;
    let mut second = attach(&handle, "https://shop.test/b").await;

    handle.start().await.unwrap();
    first.pump();
    second.pump();
    assert!(first.is_capturing() && second.is_capturing());

    click(&mut first, &doc, "buy");
    click(&mut second, &doc, "buy");
    click(&mut first, &doc, "buy");

    handle.status().await.unwrap();
    let steps = drain_steps(&mut rx);
    let from_a: Vec<_> = steps
        .iter()
        .filter(|s| s.url.ends_with("/a"))
        .map(|s| s.sequence_id)
        .collect();
    let from_b: Vec<_> = steps
        .iter()
        .filter(|s| s.url.ends_with("/b"))
        .map(|s| s.sequence_id)
        .collect();
    assert_eq!(from_a, vec![1, 2]);
    assert_eq!(from_b, vec![1]);
}

#[tokio::test]
async fn late_joiner_starts_in_the_current_state() {
    let (handle, mut rx) = spawn(CoordinatorOptions::default());
    let doc = page();

    handle.start().await.unwrap();
    handle.pause().await.unwrap();

    let mut late = attach(&handle, "https://shop.test/late").await;
    assert!(late.is_recording());
    assert!(late.is_paused());
    assert!(click(&mut late, &doc, "buy").is_none());

    handle.resume().await.unwrap();
    late.pump();
    let step = click(&mut late, &doc, "buy").unwrap();
    assert_eq!(step.sequence_id, 1);

    handle.status().await.unwrap();
    assert_eq!(drain_steps(&mut rx).len(), 1);
}

#[tokio::test]
async fn new_session_restarts_numbering() {
    let (handle, mut rx) = spawn(CoordinatorOptions::default());
    let doc = page();
    let mut tab = attach(&handle, "https://shop.test/").await;

    handle.start().await.unwrap();
    tab.pump();
    click(&mut tab, &doc, "buy");
    click(&mut tab, &doc, "buy");
    handle.stop().await.unwrap();

    // The tab never sees the stop before the next start.
    let second = handle.start().await.unwrap();
    assert_eq!(second.epoch, 2);
    tab.pump();
    assert_eq!(click(&mut tab, &doc, "buy").unwrap().sequence_id, 1);

    handle.status().await.unwrap();
    let ids: Vec<_> = drain_steps(&mut rx).iter().map(|s| s.sequence_id).collect();
    assert_eq!(ids, vec![1, 2, 1]);
}

#[tokio::test]
async fn closed_context_is_dropped_from_broadcasts() {
    let (handle, _rx) = spawn(CoordinatorOptions::default());
    let tab = attach(&handle, "https://shop.test/").await;
    let keep = attach(&handle, "https://shop.test/keep").await;
    drop(tab);

    let outcome = handle.start().await.unwrap();
    assert_eq!(outcome.report.delivered, vec![keep.id()]);
    assert_eq!(outcome.report.failed.len(), 1);

    let outcome = handle.pause().await.unwrap();
    assert!(outcome.report.all_delivered());
    assert_eq!(handle.status().await.unwrap().contexts, 1);
    drop(keep);
}

#[tokio::test]
async fn display_buffer_keeps_the_latest_steps() {
    let (handle, _rx) = spawn(CoordinatorOptions {
        display_buffer: 2,
        ..CoordinatorOptions::default()
    });
    let doc = page();
    let mut tab = attach(&handle, "https://shop.test/").await;
    handle.start().await.unwrap();
    tab.pump();
    for _ in 0..5 {
        click(&mut tab, &doc, "buy");
    }

    let recent = handle.recent_steps().await.unwrap();
    let ids: Vec<_> = recent.iter().map(|s| s.sequence_id).collect();
    assert_eq!(ids, vec![4, 5]);
}

#[tokio::test]
async fn first_context_owns_the_panel() {
    let (handle, _rx) = spawn(CoordinatorOptions::default());
    let first = attach(&handle, "https://shop.test/1").await;
    let second = attach(&handle, "https://shop.test/2").await;

    assert!(handle.request_panel(first.id()).await.unwrap());
    assert!(!handle.request_panel(second.id()).await.unwrap());

    handle.unregister(first.id());
    assert!(handle.request_panel(second.id()).await.unwrap());
}

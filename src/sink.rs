//! Terminal consumers of recorded Steps.
//!
//! A sink makes no delivery promise. `submit` returns immediately, never fails
//! from the caller's point of view and never retries. Records that are
//! delivered arrive in the order they were submitted. When the collector is
//! down, Steps are dropped and the failure is only logged.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{DeliveryError, Result};
use crate::types::{StatusNotification, Step};

pub const PUSH_STEP_PATH: &str = "/api/push-step";
pub const RECORDING_STATUS_PATH: &str = "/api/recording-status";

pub trait StepSink: Send + Sync {
    /// Hand a Step over. Must not block and must not panic.
    fn submit(&self, step: &Step);

    /// Session status changed. Same delivery rules as `submit`.
    fn publish_status(&self, _status: StatusNotification) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl StepSink for NullSink {
    fn submit(&self, step: &Step) {
        debug!(id = step.sequence_id, "null sink dropped step");
    }
}

/// What a [`ChannelSink`] forwards.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkRecord {
    Step(Step),
    Status(StatusNotification),
}

/// Forwards to an in-process receiver. A dropped receiver just loses records.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkRecord>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StepSink for ChannelSink {
    fn submit(&self, step: &Step) {
        if self.tx.send(SinkRecord::Step(step.clone())).is_err() {
            debug!(id = step.sequence_id, "channel sink receiver gone");
        }
    }

    fn publish_status(&self, status: StatusNotification) {
        let _ = self.tx.send(SinkRecord::Status(status));
    }
}

/// Pushes Steps and status changes to a remote collector over HTTP.
///
/// Records go through one queue drained by a single delivery task, so the
/// collector sees them in submission order. The task is started on the current
/// Tokio runtime the first time something is submitted; nothing is awaited by
/// the caller and responses are only inspected for logging.
#[derive(Debug, Clone)]
pub struct HttpSink {
    client: reqwest::Client,
    step_url: String,
    status_url: String,
    queue: Arc<OnceLock<mpsc::UnboundedSender<Outbound>>>,
}

#[derive(Debug)]
struct Outbound {
    url: String,
    body: serde_json::Value,
    what: &'static str,
}

impl HttpSink {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let base = base_url.trim_end_matches('/');
        Ok(Self {
            client,
            step_url: format!("{base}{PUSH_STEP_PATH}"),
            status_url: format!("{base}{RECORDING_STATUS_PATH}"),
            queue: Arc::new(OnceLock::new()),
        })
    }

    pub fn step_url(&self) -> &str {
        &self.step_url
    }

    fn post(&self, url: &str, body: serde_json::Value, what: &'static str) {
        let queue = match self.queue.get() {
            Some(queue) => queue,
            None => {
                let handle = match tokio::runtime::Handle::try_current() {
                    Ok(handle) => handle,
                    Err(_) => {
                        warn!(what, error = %DeliveryError::NoRuntime, "dropping outbound record");
                        return;
                    }
                };
                self.queue.get_or_init(|| {
                    let (tx, rx) = mpsc::unbounded_channel();
                    handle.spawn(deliver(self.client.clone(), rx));
                    tx
                })
            }
        };
        let record = Outbound {
            url: url.to_string(),
            body,
            what,
        };
        if queue.send(record).is_err() {
            warn!(what, error = %DeliveryError::NoRuntime, "delivery task is gone");
        }
    }
}

/// Sends queued records one after another until every sender is dropped.
async fn deliver(client: reqwest::Client, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(Outbound { url, body, what }) = rx.recv().await {
        match client.post(&url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(what, %url, "delivered");
            }
            Ok(response) => {
                let error = DeliveryError::Http(format!("status {}", response.status()));
                warn!(what, %url, %error, "collector rejected record");
            }
            Err(e) => {
                let error = DeliveryError::Http(e.to_string());
                warn!(what, %url, %error, "failed to deliver record");
            }
        }
    }
    debug!("http sink delivery task stopped");
}

impl StepSink for HttpSink {
    fn submit(&self, step: &Step) {
        self.post(
            &self.step_url,
            json!({ "action": "step", "data": step }),
            "step",
        );
    }

    fn publish_status(&self, status: StatusNotification) {
        self.post(&self.status_url, json!(status), "status");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActionKind, ActionPayload};

    fn step(id: u64) -> Step {
        Step {
            sequence_id: id,
            action: ActionKind::Click,
            url: "https://x.test/".into(),
            page_title: "X".into(),
            timestamp_millis: 1,
            primary_selector: "#go".into(),
            element: None,
            payload: ActionPayload::default(),
        }
    }

    #[test]
    fn channel_sink_forwards_in_order() {
        let (sink, mut rx) = ChannelSink::new();
        sink.submit(&step(1));
        sink.publish_status(StatusNotification {
            recording: true,
            paused: true,
        });
        sink.submit(&step(2));
        assert_eq!(rx.try_recv().unwrap(), SinkRecord::Step(step(1)));
        assert!(matches!(rx.try_recv().unwrap(), SinkRecord::Status(s) if s.paused));
        assert_eq!(rx.try_recv().unwrap(), SinkRecord::Step(step(2)));
    }

    #[test]
    fn channel_sink_survives_dropped_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.submit(&step(1));
        sink.publish_status(StatusNotification::default());
    }

    #[test]
    fn http_sink_builds_endpoint_urls() {
        let sink = HttpSink::new("http://collector.test:5001/", Duration::from_secs(1)).unwrap();
        assert_eq!(sink.step_url(), "http://collector.test:5001/api/push-step");
        assert_eq!(sink.status_url, "http://collector.test:5001/api/recording-status");
    }

    #[test]
    fn http_sink_without_runtime_drops_quietly() {
        let sink = HttpSink::new("http://127.0.0.1:9", Duration::from_millis(50)).unwrap();
        sink.submit(&step(1));
        sink.publish_status(StatusNotification::default());
    }

    #[tokio::test]
    async fn http_sink_clones_share_one_delivery_queue() {
        let sink = HttpSink::new("http://127.0.0.1:9", Duration::from_millis(50)).unwrap();
        let clone = sink.clone();
        assert!(sink.queue.get().is_none());
        clone.submit(&step(1));
        assert!(sink.queue.get().is_some());
    }

    #[tokio::test]
    async fn http_sink_unreachable_collector_does_not_surface() {
        let sink = HttpSink::new("http://127.0.0.1:9", Duration::from_millis(50)).unwrap();
        sink.submit(&step(1));
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

//! Scripted collaborators shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::time::Instant;

use crate::brain::{EngineTransport, TransportReply};
use crate::error::AgentError;
use crate::surface::{PageSurface, Readiness};

pub fn ready(url: &str) -> Readiness {
    Readiness {
        width: 1000.0,
        height: 800.0,
        is_loading: false,
        ready_state: "complete".to_string(),
        url: url.to_string(),
    }
}

/// Pops scripted values on each call; the last value sticks once the queue runs dry.
struct Script<T: Clone> {
    queue: VecDeque<T>,
    last: T,
}

impl<T: Clone> Script<T> {
    fn new(last: T) -> Self {
        Self {
            queue: VecDeque::new(),
            last,
        }
    }

    fn next(&mut self) -> T {
        if let Some(value) = self.queue.pop_front() {
            self.last = value.clone();
        }
        self.last.clone()
    }
}

pub struct FakeSurface {
    readiness: Mutex<Script<Readiness>>,
    captures: Mutex<Script<Vec<u8>>>,
    texts: Mutex<Script<String>>,
    fail_actions: Mutex<bool>,
    fail_text: Mutex<bool>,
    load_delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: Mutex<Vec<String>>,
}

/// Counts a surface call for as long as it is alive.
struct InFlight<'a>(&'a FakeSurface);

impl<'a> InFlight<'a> {
    fn enter(surface: &'a FakeSurface) -> Self {
        let now = surface.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        surface.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(surface)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for FakeSurface {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSurface {
    pub fn new() -> Self {
        Self {
            readiness: Mutex::new(Script::new(ready("https://example.test/"))),
            captures: Mutex::new(Script::new(vec![1, 2, 3])),
            texts: Mutex::new(Script::new("Example page".to_string())),
            fail_actions: Mutex::new(false),
            fail_text: Mutex::new(false),
            load_delay: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push_readiness(&self, state: Readiness) {
        self.readiness.lock().unwrap().queue.push_back(state);
    }

    pub fn set_readiness(&self, state: Readiness) {
        let mut script = self.readiness.lock().unwrap();
        script.queue.clear();
        script.last = state;
    }

    pub fn push_capture(&self, bytes: Vec<u8>) {
        self.captures.lock().unwrap().queue.push_back(bytes);
    }

    pub fn push_text(&self, text: &str) {
        self.texts.lock().unwrap().queue.push_back(text.to_string());
    }

    pub fn set_text(&self, text: &str) {
        let mut script = self.texts.lock().unwrap();
        script.queue.clear();
        script.last = text.to_string();
    }

    pub fn fail_actions(&self, fail: bool) {
        *self.fail_actions.lock().unwrap() = fail;
    }

    /// Page text reads fail while set.
    pub fn fail_text(&self, fail: bool) {
        *self.fail_text.lock().unwrap() = fail;
    }

    /// Every `load` takes this long to return.
    pub fn set_load_delay(&self, delay: Duration) {
        *self.load_delay.lock().unwrap() = delay;
    }

    /// Highest number of surface calls that were in progress at once.
    pub fn max_concurrent_calls(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Calls made so far: `load:<url>`, `capture`, `text`, `click`, `scroll`, `type`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls that act on the page (everything except reads).
    pub fn effects(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c != "capture" && c != "text" && c != "readiness")
            .collect()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

#[async_trait]
impl PageSurface for FakeSurface {
    async fn load(&self, url: &str) -> Result<()> {
        let _call = InFlight::enter(self);
        self.record(format!("load:{url}"));
        let delay = *self.load_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if *self.fail_actions.lock().unwrap() {
            return Err(anyhow!("navigation refused"));
        }
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value> {
        let _call = InFlight::enter(self);
        if script.contains("innerText") {
            self.record("text");
            if *self.fail_text.lock().unwrap() {
                return Err(anyhow!("page text unavailable"));
            }
            return Ok(serde_json::Value::String(self.texts.lock().unwrap().next()));
        }
        let kind = if script.contains("elementFromPoint") {
            "click"
        } else if script.contains("scrollBy") {
            "scroll"
        } else if script.contains("activeElement") {
            "type"
        } else {
            "script"
        };
        self.record(kind);
        if *self.fail_actions.lock().unwrap() {
            return Err(anyhow!("script threw"));
        }
        Ok(match kind {
            "click" => serde_json::json!("button"),
            "type" => serde_json::json!("typed into input"),
            _ => serde_json::json!(0),
        })
    }

    async fn capture(&self) -> Result<Vec<u8>> {
        let _call = InFlight::enter(self);
        self.record("capture");
        Ok(self.captures.lock().unwrap().next())
    }

    async fn readiness(&self) -> Result<Readiness> {
        let _call = InFlight::enter(self);
        Ok(self.readiness.lock().unwrap().next())
    }
}

/// Decision-engine transport replaying scripted replies in order.
pub struct FakeTransport {
    replies: Mutex<VecDeque<TransportReply>>,
    calls: Mutex<Vec<(Instant, String, Value)>>,
    hang_when_empty: Mutex<bool>,
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            replies: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            hang_when_empty: Mutex::new(false),
        }
    }

    /// 200 replies carry an empty action list; anything else an error body.
    pub fn with_statuses(statuses: &[u16]) -> Arc<Self> {
        let transport = Self::new();
        for status in statuses {
            if *status == 200 {
                transport.push_text("{\"actions\":[]}");
            } else {
                transport.push(*status, json!({"error":{"message":"slow down"}}));
            }
        }
        Arc::new(transport)
    }

    pub fn push(&self, status: u16, body: Value) {
        self.replies
            .lock()
            .unwrap()
            .push_back(TransportReply { status, body });
    }

    /// A successful reply whose candidate text is `text`.
    pub fn push_text(&self, text: &str) {
        self.push(
            200,
            json!({"candidates":[{"content":{"parts":[{"text": text}]}}]}),
        );
    }

    /// Once the script runs out, block until the caller gives up.
    pub fn hang_when_empty(&self) {
        *self.hang_when_empty.lock().unwrap() = true;
    }

    pub fn calls(&self) -> Vec<(Instant, String, Value)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls().into_iter().map(|c| c.0).collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    async fn next(&self, url: &str, body: Value) -> Result<TransportReply, AgentError> {
        self.calls
            .lock()
            .unwrap()
            .push((Instant::now(), url.to_string(), body));
        let reply = self.replies.lock().unwrap().pop_front();
        let hang = *self.hang_when_empty.lock().unwrap();
        match reply {
            Some(reply) => Ok(reply),
            None if hang => std::future::pending().await,
            None => Err(AgentError::Network("no scripted reply".into())),
        }
    }
}

#[async_trait]
impl EngineTransport for FakeTransport {
    async fn post_json(&self, url: &str, _api_key: &str, body: &Value) -> Result<TransportReply, AgentError> {
        self.next(url, body.clone()).await
    }

    async fn get_json(&self, url: &str, _api_key: &str) -> Result<TransportReply, AgentError> {
        self.next(url, Value::Null).await
    }
}

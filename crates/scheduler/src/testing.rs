//! In-memory transports for tests
//!
//! A [`ScriptedTransport`] holds every fetch until the test decides its
//! outcome, so tests can observe queue state while transfers are in flight.

use crate::error::TransportError;
use crate::request::ProgressSink;
use crate::transport::Transport;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

type Outcome = Result<Bytes, TransportError>;

#[derive(Default)]
struct Script {
    calls: Vec<String>,
    outcomes: HashMap<String, Outcome>,
    fallback: Option<Outcome>,
}

/// Transport whose fetches block until an outcome is scripted for their URL
pub struct ScriptedTransport {
    name: &'static str,
    reports_progress: bool,
    script: Mutex<Script>,
    released: Notify,
    started: Notify,
}

impl ScriptedTransport {
    /// A transport that reports progress, like the streaming primary
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self::build(name, true))
    }

    /// A transport without progress reporting, like the plain fallback
    pub fn passive(name: &'static str) -> Arc<Self> {
        Arc::new(Self::build(name, false))
    }

    fn build(name: &'static str, reports_progress: bool) -> Self {
        Self {
            name,
            reports_progress,
            script: Mutex::new(Script::default()),
            released: Notify::new(),
            started: Notify::new(),
        }
    }

    /// Complete fetches of `url` with `body`
    pub fn respond(&self, url: &str, body: impl Into<Bytes>) {
        self.script(url, Ok(body.into()));
    }

    /// Fail fetches of `url` with `err`
    pub fn fail(&self, url: &str, err: TransportError) {
        self.script(url, Err(err));
    }

    /// Complete every fetch without its own script with `body`
    pub fn respond_all(&self, body: impl Into<Bytes>) {
        self.script.lock().unwrap().fallback = Some(Ok(body.into()));
        self.released.notify_waiters();
    }

    /// Fail every fetch without its own script with `err`
    pub fn fail_all(&self, err: TransportError) {
        self.script.lock().unwrap().fallback = Some(Err(err));
        self.released.notify_waiters();
    }

    /// URLs fetched so far, in call order
    pub fn calls(&self) -> Vec<String> {
        self.script.lock().unwrap().calls.clone()
    }

    /// Number of fetches started so far
    pub fn call_count(&self) -> usize {
        self.script.lock().unwrap().calls.len()
    }

    /// Waits until at least `count` fetches have started.
    pub async fn wait_for_calls(&self, count: usize) {
        loop {
            let started = self.started.notified();
            if self.call_count() >= count {
                return;
            }
            started.await;
        }
    }

    fn script(&self, url: &str, outcome: Outcome) {
        self.script
            .lock()
            .unwrap()
            .outcomes
            .insert(url.to_string(), outcome);
        self.released.notify_waiters();
    }

    fn outcome(&self, url: &str) -> Option<Outcome> {
        let script = self.script.lock().unwrap();
        script
            .outcomes
            .get(url)
            .or(script.fallback.as_ref())
            .cloned()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn fetch(&self, url: &str, progress: &ProgressSink) -> Result<Bytes, TransportError> {
        self.script.lock().unwrap().calls.push(url.to_string());
        self.started.notify_waiters();

        let outcome = loop {
            let released = self.released.notified();
            if let Some(outcome) = self.outcome(url) {
                break outcome;
            }
            released.await;
        };

        if let (true, Ok(body)) = (self.reports_progress, &outcome) {
            let len = body.len() as u64;
            progress.report(len / 2, Some(len));
            progress.report(len, Some(len));
        }
        outcome
    }

    fn reports_progress(&self) -> bool {
        self.reports_progress
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

//! In-memory host and endpoints for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Semaphore, oneshot};

use crate::endpoint::{
    Endpoint, EndpointError, EndpointFactory, EndpointFut, EndpointLink, FailureEvent, FailureSink,
    StartupError,
};
use crate::host::{ActionReply, Host, LogChannel, MessageAction};
use crate::types::SessionConfig;

/// Poll `cond` until it holds, failing the test after five seconds.
pub(crate) async fn eventually(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RecordedError {
    pub message: String,
    pub actions: Vec<MessageAction>,
}

/// Records every message and answers with a fixed action, if offered.
#[derive(Default)]
pub(crate) struct RecordingHost {
    answer: Option<MessageAction>,
    errors: Mutex<Vec<RecordedError>>,
    channels: Mutex<HashMap<String, Arc<RecordingChannel>>>,
    channel_requests: AtomicUsize,
}

impl RecordingHost {
    /// A host whose user dismisses every message.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn answering(action: MessageAction) -> Self {
        Self {
            answer: Some(action),
            ..Self::default()
        }
    }

    pub fn errors(&self) -> Vec<RecordedError> {
        self.errors.lock().unwrap().clone()
    }

    /// The channel with `name`, created on first use.
    pub fn channel(&self, name: &str) -> Arc<RecordingChannel> {
        self.channels
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RecordingChannel::new(name)))
            .clone()
    }

    /// How many times `log_channel` was called.
    pub fn log_channel_requests(&self) -> usize {
        self.channel_requests.load(Ordering::SeqCst)
    }
}

impl Host for RecordingHost {
    fn show_error(&self, message: &str, actions: &[MessageAction]) -> ActionReply {
        self.errors.lock().unwrap().push(RecordedError {
            message: message.to_string(),
            actions: actions.to_vec(),
        });
        let (tx, rx) = oneshot::channel();
        if let Some(answer) = self.answer
            && actions.contains(&answer)
        {
            let _ = tx.send(answer);
        }
        rx
    }

    fn log_channel(&self, name: &str) -> Arc<dyn LogChannel> {
        self.channel_requests.fetch_add(1, Ordering::SeqCst);
        self.channel(name)
    }
}

pub(crate) struct RecordingChannel {
    name: String,
    lines: Mutex<Vec<String>>,
    reveals: AtomicUsize,
}

impl RecordingChannel {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            lines: Mutex::new(Vec::new()),
            reveals: AtomicUsize::new(0),
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    pub fn reveal_count(&self) -> usize {
        self.reveals.load(Ordering::SeqCst)
    }

    pub async fn wait_revealed(&self, count: usize) {
        eventually(|| self.reveal_count() >= count).await;
    }

    pub async fn wait_for_line(&self, line: &str) {
        eventually(|| self.lines().iter().any(|l| l == line)).await;
    }
}

impl LogChannel for RecordingChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn append_line(&self, line: &str) {
        self.lines.lock().unwrap().push(line.to_string());
    }

    fn reveal(&self) {
        self.reveals.fetch_add(1, Ordering::SeqCst);
    }
}

/// Endpoint that records traffic and fails on demand.
pub(crate) struct MockEndpoint {
    sink: FailureSink,
    command_result: Result<Value, EndpointError>,
    commands: Mutex<Vec<(String, Vec<Value>)>>,
    notifications: Mutex<Vec<(&'static str, Value)>>,
    shutdown_delay: Option<Duration>,
    shut_down: AtomicBool,
}

impl MockEndpoint {
    pub fn generation(&self) -> u64 {
        self.sink.generation()
    }

    /// Report `event` the way a real transport would.
    pub async fn fail(&self, event: FailureEvent) -> bool {
        self.sink.report(event).await
    }

    pub fn commands(&self) -> Vec<(String, Vec<Value>)> {
        self.commands.lock().unwrap().clone()
    }

    pub fn notifications(&self) -> Vec<(&'static str, Value)> {
        self.notifications.lock().unwrap().clone()
    }

    pub fn methods(&self) -> Vec<&'static str> {
        self.notifications().into_iter().map(|(m, _)| m).collect()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

impl Endpoint for MockEndpoint {
    fn execute_command(
        &self,
        command: String,
        args: Vec<Value>,
    ) -> EndpointFut<'_, Result<Value, EndpointError>> {
        Box::pin(async move {
            if self.is_shut_down() {
                return Err(EndpointError::Closed);
            }
            self.commands.lock().unwrap().push((command, args));
            self.command_result.clone()
        })
    }

    fn notify(
        &self,
        method: &'static str,
        params: Value,
    ) -> EndpointFut<'_, Result<(), EndpointError>> {
        Box::pin(async move {
            if self.is_shut_down() {
                return Err(EndpointError::Closed);
            }
            self.notifications.lock().unwrap().push((method, params));
            Ok(())
        })
    }

    fn shutdown(&self) -> EndpointFut<'_, ()> {
        Box::pin(async move {
            if let Some(delay) = self.shutdown_delay {
                tokio::time::sleep(delay).await;
            }
            self.shut_down.store(true, Ordering::SeqCst);
        })
    }
}

/// Hands out [`MockEndpoint`]s and keeps every one it built.
pub(crate) struct MockFactory {
    attempts: AtomicUsize,
    endpoints: Mutex<Vec<Arc<MockEndpoint>>>,
    /// Connects numbered from this one (1-based) fail.
    fail_from: Option<usize>,
    gate: Option<Semaphore>,
    command_result: Result<Value, EndpointError>,
    shutdown_delay: Option<Duration>,
}

impl Default for MockFactory {
    fn default() -> Self {
        Self {
            attempts: AtomicUsize::new(0),
            endpoints: Mutex::new(Vec::new()),
            fail_from: None,
            gate: None,
            command_result: Ok(Value::Null),
            shutdown_delay: None,
        }
    }
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every connect from the `attempt`-th on fails.
    pub fn failing_from(attempt: usize) -> Self {
        Self {
            fail_from: Some(attempt),
            ..Self::default()
        }
    }

    /// Only `permits` connects proceed until [`MockFactory::release`] is called.
    pub fn gated(permits: usize) -> Self {
        Self {
            gate: Some(Semaphore::new(permits)),
            ..Self::default()
        }
    }

    pub fn with_command_result(result: Result<Value, EndpointError>) -> Self {
        Self {
            command_result: result,
            ..Self::default()
        }
    }

    /// Endpoints take `delay` to finish shutting down.
    pub fn slow_shutdown(delay: Duration) -> Self {
        Self {
            shutdown_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn release(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn endpoints(&self) -> Vec<Arc<MockEndpoint>> {
        self.endpoints.lock().unwrap().clone()
    }

    pub fn latest(&self) -> Arc<MockEndpoint> {
        self.endpoints().last().cloned().unwrap()
    }
}

impl EndpointFactory for MockFactory {
    fn connect<'a>(
        &'a self,
        _config: &'a SessionConfig,
        link: EndpointLink,
    ) -> EndpointFut<'a, Result<Arc<dyn Endpoint>, StartupError>> {
        Box::pin(async move {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            if self.fail_from.is_some_and(|from| attempt >= from) {
                return Err(StartupError::Spawn {
                    command: "mock".to_string(),
                    source: std::io::Error::other("connection refused"),
                });
            }
            let endpoint = Arc::new(MockEndpoint {
                sink: link.sink,
                command_result: self.command_result.clone(),
                commands: Mutex::new(Vec::new()),
                notifications: Mutex::new(Vec::new()),
                shutdown_delay: self.shutdown_delay,
                shut_down: AtomicBool::new(false),
            });
            self.endpoints.lock().unwrap().push(endpoint.clone());
            Ok(endpoint as Arc<dyn Endpoint>)
        })
    }
}

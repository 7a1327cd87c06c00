//! The seam between the supervisor and a live transport.
//!
//! The supervisor only ever sees `dyn Endpoint`. The bundled implementation
//! lives in `connection`; tests plug in in-memory endpoints.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::host::LogChannel;
use crate::types::SessionConfig;

/// Boxed future returned by endpoint operations.
pub type EndpointFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A failure surfaced by a transport endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureEvent {
    /// The connection is alive but a message could not be read or written.
    Error {
        detail: String,
        /// Summary of the last protocol message exchanged, if any.
        message: Option<String>,
        /// How many errors this endpoint has seen, including this one.
        count: u32,
    },
    /// The server process exited or the socket dropped.
    Closed,
}

/// Failure of a single operation on a connected endpoint.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    #[error("not connected to a language server")]
    NotConnected,
    #[error("connection closed")]
    Closed,
    #[error("request timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("{message} (code {code})")]
    Response { code: i64, message: String },
    #[error("encoding message: {0}")]
    Encode(String),
}

/// An endpoint could not be constructed.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("{command} not found in PATH")]
    NotFound {
        command: String,
        #[source]
        source: which::Error,
    },
    #[error("spawning {command}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("language server did not connect on port {port}")]
    Accept {
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("initialize failed: {0}")]
    Initialize(String),
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
}

/// Where an endpoint reports its failures.
///
/// Every event is tagged with the generation of the endpoint that produced
/// it, so the supervisor can drop reports from endpoints it already replaced.
#[derive(Debug, Clone)]
pub struct FailureSink {
    generation: u64,
    tx: mpsc::Sender<(u64, FailureEvent)>,
}

impl FailureSink {
    pub(crate) fn new(generation: u64, tx: mpsc::Sender<(u64, FailureEvent)>) -> Self {
        Self { generation, tx }
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Deliver an event. Returns `false` once nobody is listening.
    pub async fn report(&self, event: FailureEvent) -> bool {
        self.tx.send((self.generation, event)).await.is_ok()
    }
}

/// Everything a factory needs besides the configuration.
#[derive(Clone)]
pub struct EndpointLink {
    pub sink: FailureSink,
    pub log: Arc<dyn LogChannel>,
}

/// A live connection to a language server.
pub trait Endpoint: Send + Sync {
    /// Send `workspace/executeCommand` and wait for the result.
    fn execute_command(
        &self,
        command: String,
        args: Vec<Value>,
    ) -> EndpointFut<'_, Result<Value, EndpointError>>;

    /// Send a notification.
    fn notify(&self, method: &'static str, params: Value)
    -> EndpointFut<'_, Result<(), EndpointError>>;

    /// Tear the connection down. Calling it again is a no-op.
    fn shutdown(&self) -> EndpointFut<'_, ()>;
}

/// Constructs endpoints for a session.
pub trait EndpointFactory: Send + Sync {
    fn connect<'a>(
        &'a self,
        config: &'a SessionConfig,
        link: EndpointLink,
    ) -> EndpointFut<'a, Result<Arc<dyn Endpoint>, StartupError>>;
}

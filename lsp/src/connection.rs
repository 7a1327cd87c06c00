//! Bundled transport endpoint: a language server process reached over stdio
//! or a loopback socket, speaking framed JSON-RPC.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::codec::{FrameReader, FrameWriter};
use crate::endpoint::{
    Endpoint, EndpointError, EndpointFactory, EndpointFut, EndpointLink, FailureEvent, FailureSink,
    StartupError,
};
use crate::host::LogChannel;
use crate::protocol::{self, Incoming, Notification, Request};
use crate::types::{LaunchDescriptor, SessionConfig, TraceLevel, TransportKind};

const SHUTDOWN_TIMEOUT_SECS: u64 = 2;

const ACCEPT_TIMEOUT_SECS: u64 = 10;

const WRITER_CHANNEL_CAPACITY: usize = 64;

type PendingMap = Mutex<HashMap<u64, oneshot::Sender<Value>>>;

enum WriterCommand {
    Send(Value),
    Shutdown,
}

/// Connects sessions to real language server processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessFactory;

impl EndpointFactory for ProcessFactory {
    fn connect<'a>(
        &'a self,
        config: &'a SessionConfig,
        link: EndpointLink,
    ) -> EndpointFut<'a, Result<Arc<dyn Endpoint>, StartupError>> {
        Box::pin(async move {
            let connection = LspConnection::launch(config, link).await?;
            Ok(Arc::new(connection) as Arc<dyn Endpoint>)
        })
    }
}

/// State shared between the connection handle and its reader/writer tasks.
struct Wire {
    server: String,
    log: Arc<dyn LogChannel>,
    trace: TraceLevel,
    sink: FailureSink,
    /// Answers `workspace/workspaceFolders`.
    root_uri: String,
    pending: PendingMap,
    errors: AtomicU32,
    last_message: std::sync::Mutex<Option<String>>,
    /// Set once teardown begins; the reader then exits without reporting.
    closing: AtomicBool,
    /// Set once the reader task has stopped.
    reader_done: AtomicBool,
}

impl Wire {
    fn record(&self, direction: &str, frame: &Value) {
        let summary = protocol::describe(frame);
        match self.trace {
            TraceLevel::Off => {}
            TraceLevel::Messages => {
                self.log.append_line(&format!("[Trace - {direction}] {summary}"));
            }
            TraceLevel::Verbose => {
                self.log
                    .append_line(&format!("[Trace - {direction}] {summary}\n{frame:#}"));
            }
        }
        *self
            .last_message
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(summary);
    }

    fn last_message(&self) -> Option<String> {
        self.last_message
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    async fn report_error(&self, detail: String) {
        if self.is_closing() {
            return;
        }
        let count = self.errors.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        tracing::warn!(server = %self.server, count, "LSP transport error: {detail}");
        self.log.append_line(&format!("[Error] {detail}"));
        self.sink
            .report(FailureEvent::Error {
                detail,
                message: self.last_message(),
                count,
            })
            .await;
    }
}

/// A live connection to one language server.
pub struct LspConnection {
    wire: Arc<Wire>,
    writer_tx: mpsc::Sender<WriterCommand>,
    next_id: AtomicU64,
    timeout: Duration,
    child: Mutex<Option<Child>>,
    tasks: Vec<JoinHandle<()>>,
}

impl LspConnection {
    /// Start the configured server and run the initialize handshake.
    pub async fn launch(config: &SessionConfig, link: EndpointLink) -> Result<Self, StartupError> {
        let root_uri = workspace_root_uri(config)?;
        let program = config.launch.program();
        let resolved = which::which(program).map_err(|source| StartupError::NotFound {
            command: program.to_string(),
            source,
        })?;

        let mut cmd = Command::new(&resolved);
        let mut listener = None;
        match &config.launch {
            LaunchDescriptor::Executable { args, .. } => {
                cmd.args(args);
            }
            LaunchDescriptor::Module { module, args, .. } => {
                cmd.arg(module);
                match config.launch.transport() {
                    TransportKind::Stdio => {
                        cmd.arg("--stdio");
                    }
                    TransportKind::Socket { port } => {
                        let bound = TcpListener::bind(("127.0.0.1", port))
                            .await
                            .map_err(|source| StartupError::Accept {
                                port,
                                source,
                            })?;
                        let actual = bound
                            .local_addr()
                            .map_err(|source| StartupError::Accept {
                                port,
                                source,
                            })?
                            .port();
                        cmd.arg(format!("--socket={actual}"));
                        listener = Some((bound, actual));
                    }
                }
                cmd.args(args);
            }
        }

        if let Some(root) = &config.root {
            cmd.current_dir(root);
        }
        let piped_stdio = listener.is_none();
        cmd.stdin(if piped_stdio { Stdio::piped() } else { Stdio::null() })
            .stdout(if piped_stdio { Stdio::piped() } else { Stdio::null() })
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!(server = %config.id, command = %resolved.display(), "Spawning language server");
        let mut child = cmd.spawn().map_err(|source| StartupError::Spawn {
            command: program.to_string(),
            source,
        })?;

        let mut tasks = Vec::new();
        if let Some(stderr) = child.stderr.take() {
            tasks.push(forward_stderr(stderr, link.log.clone()));
        }

        match listener {
            None => {
                let missing = |what: &str| StartupError::Spawn {
                    command: program.to_string(),
                    source: std::io::Error::other(format!("no {what} from child")),
                };
                let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
                let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
                Self::establish(stdout, stdin, Some(child), tasks, config, &root_uri, link).await
            }
            Some((listener, port)) => {
                let accepted = tokio::time::timeout(
                    Duration::from_secs(ACCEPT_TIMEOUT_SECS),
                    listener.accept(),
                )
                .await;
                let stream = match accepted {
                    Ok(Ok((stream, _))) => stream,
                    Ok(Err(source)) => return Err(StartupError::Accept { port, source }),
                    Err(_) => {
                        return Err(StartupError::Accept {
                            port,
                            source: std::io::Error::new(
                                std::io::ErrorKind::TimedOut,
                                "server never connected",
                            ),
                        });
                    }
                };
                let (read, write) = stream.into_split();
                Self::establish(read, write, Some(child), tasks, config, &root_uri, link).await
            }
        }
    }

    /// Wire up reader/writer tasks over an existing byte stream and run the
    /// initialize handshake.
    pub(crate) async fn establish<R, W>(
        reader: R,
        writer: W,
        child: Option<Child>,
        mut tasks: Vec<JoinHandle<()>>,
        config: &SessionConfig,
        root_uri: &str,
        link: EndpointLink,
    ) -> Result<Self, StartupError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let wire = Arc::new(Wire {
            server: config.id.clone(),
            log: link.log,
            trace: config.trace,
            sink: link.sink,
            root_uri: root_uri.to_string(),
            pending: Mutex::new(HashMap::new()),
            errors: AtomicU32::new(0),
            last_message: std::sync::Mutex::new(None),
            closing: AtomicBool::new(false),
            reader_done: AtomicBool::new(false),
        });

        let (writer_tx, writer_rx) = mpsc::channel(WRITER_CHANNEL_CAPACITY);
        tasks.push(tokio::spawn(write_loop(
            FrameWriter::new(writer),
            writer_rx,
            wire.clone(),
        )));
        tasks.push(tokio::spawn(read_loop(
            FrameReader::new(reader),
            writer_tx.clone(),
            wire.clone(),
        )));

        let connection = Self {
            wire,
            writer_tx,
            next_id: AtomicU64::new(1),
            timeout: config.request_timeout(),
            child: Mutex::new(child),
            tasks,
        };

        connection.initialize(root_uri, &config.id).await?;
        Ok(connection)
    }

    async fn initialize(&self, root_uri: &str, client: &str) -> Result<(), StartupError> {
        let params = protocol::initialize_params(root_uri, client);
        let response = self.request("initialize", Some(params)).await?;
        if let Err((code, message)) = protocol::response_outcome(&response) {
            return Err(StartupError::Initialize(format!("{message} (code {code})")));
        }
        self.send_notification("initialized", Some(serde_json::json!({})))
            .await?;
        tracing::info!(server = %self.wire.server, "Language server initialized");
        Ok(())
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, EndpointError> {
        self.request_with_timeout(method, params, self.timeout)
            .await
    }

    async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, EndpointError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let frame = serde_json::to_value(Request::new(id, method, params))
            .map_err(|e| EndpointError::Encode(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.wire.pending.lock().await.insert(id, tx);

        // The reader drains `pending` on exit; an entry inserted after that
        // would otherwise wait out the full timeout.
        if self.wire.reader_done.load(Ordering::SeqCst)
            || self
                .writer_tx
                .send(WriterCommand::Send(frame))
                .await
                .is_err()
        {
            self.wire.pending.lock().await.remove(&id);
            return Err(EndpointError::Closed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                self.wire.pending.lock().await.remove(&id);
                Err(EndpointError::Closed)
            }
            Err(_) => {
                self.wire.pending.lock().await.remove(&id);
                Err(EndpointError::Timeout(timeout))
            }
        }
    }

    async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), EndpointError> {
        if self.wire.reader_done.load(Ordering::SeqCst) {
            return Err(EndpointError::Closed);
        }
        let frame = serde_json::to_value(Notification::new(method, params))
            .map_err(|e| EndpointError::Encode(e.to_string()))?;
        self.writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .map_err(|_| EndpointError::Closed)
    }

    async fn shutdown_inner(&self) {
        if self.wire.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(server = %self.wire.server, "Shutting down language server");

        let grace = Duration::from_secs(SHUTDOWN_TIMEOUT_SECS);
        if let Ok(response) = self.request_with_timeout("shutdown", None, grace).await
            && response.get("error").is_none()
        {
            let _ = self.send_notification("exit", None).await;
        }
        let _ = self.writer_tx.send(WriterCommand::Shutdown).await;

        if let Some(mut child) = self.child.lock().await.take()
            && tokio::time::timeout(grace, child.wait()).await.is_err()
        {
            tracing::debug!(server = %self.wire.server, "Language server didn't exit in time, killing");
            let _ = child.kill().await;
        }

        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for LspConnection {
    fn drop(&mut self) {
        self.wire.closing.store(true, Ordering::SeqCst);
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Endpoint for LspConnection {
    fn execute_command(
        &self,
        command: String,
        args: Vec<Value>,
    ) -> EndpointFut<'_, Result<Value, EndpointError>> {
        Box::pin(async move {
            let params = protocol::execute_command_params(&command, args);
            let response = self
                .request("workspace/executeCommand", Some(params))
                .await?;
            protocol::response_outcome(&response)
                .map_err(|(code, message)| EndpointError::Response { code, message })
        })
    }

    fn notify(
        &self,
        method: &'static str,
        params: Value,
    ) -> EndpointFut<'_, Result<(), EndpointError>> {
        Box::pin(self.send_notification(method, Some(params)))
    }

    fn shutdown(&self) -> EndpointFut<'_, ()> {
        Box::pin(self.shutdown_inner())
    }
}

fn workspace_root_uri(config: &SessionConfig) -> Result<String, StartupError> {
    let root = config
        .workspace_root()
        .map_err(|e| StartupError::Config(format!("cannot determine working directory: {e}")))?;
    protocol::path_to_file_uri(&root)
        .map(|uri| uri.to_string())
        .map_err(|e| StartupError::Config(e.to_string()))
}

fn forward_stderr(stderr: ChildStderr, log: Arc<dyn LogChannel>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            log.append_line(&line);
        }
    })
}

async fn write_loop<W>(
    mut writer: FrameWriter<W>,
    mut rx: mpsc::Receiver<WriterCommand>,
    wire: Arc<Wire>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriterCommand::Send(frame) => {
                wire.record("send", &frame);
                if let Err(e) = writer.write_frame(&frame).await {
                    // Fail the request now rather than at its timeout.
                    if frame.get("method").is_some()
                        && let Some(id) = frame.get("id").and_then(Value::as_u64)
                    {
                        wire.pending.lock().await.remove(&id);
                    }
                    wire.report_error(format!("write failed: {e}")).await;
                }
            }
            WriterCommand::Shutdown => break,
        }
    }
}

async fn read_loop<R>(
    mut reader: FrameReader<R>,
    writer_tx: mpsc::Sender<WriterCommand>,
    wire: Arc<Wire>,
) where
    R: AsyncRead + Unpin,
{
    loop {
        match reader.read_frame().await {
            Ok(Some(frame)) => {
                wire.record("recv", &frame);
                dispatch(&frame, &wire, &writer_tx).await;
            }
            Ok(None) => {
                tracing::info!(server = %wire.server, "Language server closed the connection");
                break;
            }
            Err(e) if e.is_recoverable() => {
                wire.report_error(format!("read failed: {e}")).await;
            }
            Err(e) => {
                tracing::warn!(server = %wire.server, "LSP reader error: {e}");
                break;
            }
        }
    }

    wire.reader_done.store(true, Ordering::SeqCst);
    wire.pending.lock().await.clear();
    if !wire.is_closing() {
        wire.sink.report(FailureEvent::Closed).await;
    }
}

async fn dispatch(frame: &Value, wire: &Wire, writer_tx: &mpsc::Sender<WriterCommand>) {
    let Some(incoming) = protocol::classify(frame) else {
        tracing::trace!(server = %wire.server, "Ignoring malformed JSON-RPC frame");
        return;
    };

    match incoming {
        Incoming::Response { id, body } => {
            if let Some(tx) = wire.pending.lock().await.remove(&id) {
                let _ = tx.send(body);
            }
        }
        Incoming::ServerRequest { id, method, params } => {
            tracing::debug!(server = %wire.server, "Server request: {method}");
            let reply =
                protocol::reply_to_server_request(&id, &method, params.as_ref(), &wire.root_uri);
            let _ = writer_tx.send(WriterCommand::Send(reply)).await;
        }
        Incoming::Notification { method, params } => match method.as_str() {
            "window/logMessage" | "window/showMessage" => {
                let params = params.unwrap_or_default();
                let Some(message) = params.get("message").and_then(Value::as_str) else {
                    return;
                };
                let level = match params.get("type").and_then(Value::as_u64) {
                    Some(1) => "Error",
                    Some(2) => "Warn",
                    Some(3) => "Info",
                    _ => "Log",
                };
                wire.log.append_line(&format!("[{level}] {message}"));
            }
            _ => {
                tracing::trace!(server = %wire.server, "Ignoring notification: {method}");
            }
        },
    }
}

//! Session supervisor: owns the endpoint lifecycle and applies the fault
//! policy.
//!
//! One [`Supervisor`] drives one session. Failure events from the live
//! endpoint arrive on an mpsc channel drained by a single task, so restart
//! and shutdown decisions never overlap. `stop()` cancels that task through
//! a `watch` channel before tearing anything down.

use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};

use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard, mpsc, watch};
use tokio::task::JoinHandle;

use crate::documents::{OpenDocuments, Selector, WatchFilter};
use crate::endpoint::{
    Endpoint, EndpointError, EndpointFactory, EndpointLink, FailureEvent, FailureSink,
    StartupError,
};
use crate::host::{Host, LogChannel, MessageAction, surface_error};
use crate::interceptor::CommandInterceptor;
use crate::policy::{self, CloseAction, ErrorAction};
use crate::protocol;
use crate::types::{FileChange, SessionConfig, SessionState, SessionStatus};

/// Capacity of the failure event channel shared by all endpoint generations.
const EVENT_CHANNEL_CAPACITY: usize = 64;

type EventTx = mpsc::Sender<(u64, FailureEvent)>;
type EventRx = mpsc::Receiver<(u64, FailureEvent)>;

/// Handle on the task draining failure events.
struct RunHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Everything guarded by the session lock.
#[derive(Default)]
struct SessionCore {
    state: SessionState,
    config: Option<Arc<SessionConfig>>,
    crash_count: u32,
    generation: u64,
    endpoint: Option<Arc<dyn Endpoint>>,
    events: Option<EventTx>,
    log: Option<Arc<dyn LogChannel>>,
    documents: OpenDocuments,
    selector: Option<Selector>,
    watch: Option<WatchFilter>,
    root: PathBuf,
}

impl SessionCore {
    fn server(&self) -> &str {
        self.config.as_deref().map_or("", |c| c.id.as_str())
    }

    fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    fn document_uri(&self, path: &Path) -> Option<String> {
        match protocol::path_to_file_uri(&self.absolute(path)) {
            Ok(uri) => Some(uri.to_string()),
            Err(e) => {
                tracing::warn!(server = %self.server(), "Skipping document: {e}");
                None
            }
        }
    }

    async fn forward(&self, method: &'static str, params: Value) {
        let Some(endpoint) = &self.endpoint else {
            return;
        };
        if let Err(e) = endpoint.notify(method, params).await {
            tracing::warn!(server = %self.server(), "Failed to send {method}: {e}");
        }
    }

    async fn replay_documents(&self) {
        let opens: Vec<Value> = self
            .documents
            .iter()
            .map(|(uri, doc)| {
                protocol::did_open_params(uri, &doc.language_id, doc.version, &doc.text)
            })
            .collect();
        if !opens.is_empty() {
            tracing::debug!(server = %self.server(), count = opens.len(), "Replaying open documents");
        }
        for params in opens {
            self.forward("textDocument/didOpen", params).await;
        }
    }
}

struct Shared {
    host: Arc<dyn Host>,
    factory: Arc<dyn EndpointFactory>,
    core: Mutex<SessionCore>,
    status: watch::Sender<SessionStatus>,
    /// Endpoint commands go to. Only set while the session is active.
    live: std::sync::Mutex<Option<Arc<dyn Endpoint>>>,
    interceptor: std::sync::Mutex<CommandInterceptor>,
}

impl Shared {
    fn publish(&self, core: &SessionCore) {
        self.status.send_replace(SessionStatus {
            state: core.state,
            crash_count: core.crash_count,
            generation: core.generation,
        });
    }

    fn set_live(&self, endpoint: Option<Arc<dyn Endpoint>>) {
        *self.live.lock().unwrap_or_else(PoisonError::into_inner) = endpoint;
    }

    fn live(&self) -> Option<Arc<dyn Endpoint>> {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn interceptor(&self) -> CommandInterceptor {
        self.interceptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn surface(&self, core: &SessionCore, message: &str) {
        surface_error(
            self.host.as_ref(),
            message,
            MessageAction::ShowOutput,
            core.log.clone(),
        );
    }

    /// Shut the endpoint down and leave the session `Stopped`.
    async fn teardown(&self, core: &mut SessionCore) {
        core.state = SessionState::ShuttingDown;
        self.publish(core);
        self.set_live(None);
        core.events = None;
        if let Some(endpoint) = core.endpoint.take() {
            endpoint.shutdown().await;
        }
        core.documents.clear();
        core.state = SessionState::Stopped;
        self.publish(core);
    }

    /// Returns `false` once the session is no longer active.
    async fn on_error(
        &self,
        core: &mut SessionCore,
        config: &SessionConfig,
        detail: &str,
        message: Option<&str>,
        count: u32,
    ) -> bool {
        let budget = config.crash_budget;
        match policy::decide_on_error(count, budget) {
            ErrorAction::Continue => {
                tracing::warn!(server = %config.id, count, %budget, "Language server error: {detail}");
                true
            }
            ErrorAction::Shutdown => {
                tracing::error!(server = %config.id, count, %budget, "Too many language server errors, shutting down");
                self.teardown(core).await;
                self.surface(core, &policy::shutdown_message(detail, message));
                false
            }
        }
    }

    /// Returns `false` once the session is no longer active.
    async fn on_closed(
        &self,
        core: &mut SessionCore,
        config: &Arc<SessionConfig>,
        cancel: &mut watch::Receiver<bool>,
    ) -> bool {
        let budget = config.crash_budget;
        let (action, crashes) = policy::decide_on_closed(core.crash_count, budget);
        core.crash_count = crashes;

        if action == CloseAction::DoNotRestart {
            tracing::error!(server = %config.id, crashes, %budget, "Language server keeps closing, giving up");
            self.teardown(core).await;
            self.surface(
                core,
                &policy::gave_up_message(config.display_name(), crashes),
            );
            return false;
        }

        tracing::warn!(server = %config.id, crashes, %budget, "Language server closed, restarting");
        core.state = SessionState::Restarting;
        self.publish(core);
        self.set_live(None);

        let (Some(events), Some(log)) = (core.events.clone(), core.log.clone()) else {
            return false;
        };
        // Runs to completion even if `stop()` is pending.
        if let Some(old) = core.endpoint.take() {
            old.shutdown().await;
        }

        core.generation += 1;
        let link = EndpointLink {
            sink: FailureSink::new(core.generation, events),
            log: log.clone(),
        };
        let connected = tokio::select! {
            biased;
            _ = cancel.changed() => return false,
            connected = self.factory.connect(config, link) => connected,
        };

        match connected {
            Ok(endpoint) => {
                core.endpoint = Some(endpoint.clone());
                core.replay_documents().await;
                core.state = SessionState::Active;
                self.set_live(Some(endpoint));
                self.publish(core);
                tracing::info!(server = %config.id, generation = core.generation, "Language server restarted");
                true
            }
            Err(e) => {
                tracing::error!(server = %config.id, "Failed to restart language server: {e}");
                log.append_line(&format!("[Error] Restart failed: {e}"));
                core.events = None;
                core.documents.clear();
                core.state = SessionState::Stopped;
                self.publish(core);
                self.surface(
                    core,
                    &format!(
                        "Failed to restart language server '{}': {e}.",
                        config.display_name()
                    ),
                );
                false
            }
        }
    }

    async fn lock_unless_cancelled(
        &self,
        cancel: &mut watch::Receiver<bool>,
    ) -> Option<MutexGuard<'_, SessionCore>> {
        tokio::select! {
            biased;
            _ = cancel.changed() => None,
            core = self.core.lock() => Some(core),
        }
    }
}

/// Drain failure events until cancelled or the session stops.
async fn run_events(shared: Arc<Shared>, mut rx: EventRx, mut cancel: watch::Receiver<bool>) {
    loop {
        let (generation, event) = tokio::select! {
            biased;
            _ = cancel.changed() => break,
            next = rx.recv() => match next {
                Some(next) => next,
                None => break,
            },
        };
        let Some(mut core) = shared.lock_unless_cancelled(&mut cancel).await else {
            break;
        };

        if generation != core.generation || core.state != SessionState::Active {
            tracing::debug!(
                server = %core.server(),
                generation,
                current = core.generation,
                state = core.state.label(),
                "Discarding failure event: {event:?}"
            );
            continue;
        }
        let Some(config) = core.config.clone() else {
            continue;
        };

        let active = match event {
            FailureEvent::Error {
                detail,
                message,
                count,
            } => {
                shared
                    .on_error(&mut core, &config, &detail, message.as_deref(), count)
                    .await
            }
            FailureEvent::Closed => shared.on_closed(&mut core, &config, &mut cancel).await,
        };
        if !active {
            break;
        }
    }
}

/// Supervises one language server session.
pub struct Supervisor {
    shared: Arc<Shared>,
    run: std::sync::Mutex<Option<RunHandle>>,
}

impl Supervisor {
    #[must_use]
    pub fn new(host: Arc<dyn Host>, factory: Arc<dyn EndpointFactory>) -> Self {
        let (status, _) = watch::channel(SessionStatus::default());
        let interceptor = CommandInterceptor::new(host.clone(), None);
        Self {
            shared: Arc::new(Shared {
                host,
                factory,
                core: Mutex::new(SessionCore::default()),
                status,
                live: std::sync::Mutex::new(None),
                interceptor: std::sync::Mutex::new(interceptor),
            }),
            run: std::sync::Mutex::new(None),
        }
    }

    fn take_run(&self) -> Option<RunHandle> {
        self.run
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    async fn finish_run(&self) {
        let Some(run) = self.take_run() else {
            return;
        };
        let _ = run.cancel.send(true);
        if let Err(e) = run.task.await
            && e.is_panic()
        {
            tracing::error!("Session event task panicked: {e}");
        }
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        *self.shared.status.borrow()
    }

    /// Follow status changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.shared.status.subscribe()
    }

    /// Start a fresh session.
    ///
    /// A no-op while a session is already starting, active or restarting.
    /// Resets the crash counter. Failures are surfaced to the host and
    /// returned.
    pub async fn start(&self, config: SessionConfig) -> Result<(), StartupError> {
        let mut core = self.shared.core.lock().await;
        if core.state.is_running() {
            tracing::debug!(server = %config.id, state = core.state.label(), "Session already running, ignoring start");
            return Ok(());
        }
        // A session that stopped itself leaves its finished task behind.
        self.finish_run().await;

        let config = Arc::new(config);
        let log = self.shared.host.log_channel(&config.id);
        let (events, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        core.config = Some(config.clone());
        core.log = Some(log.clone());
        core.crash_count = 0;
        core.generation += 1;
        core.documents.clear();
        core.state = SessionState::Starting;
        self.shared.publish(&core);
        *self
            .shared
            .interceptor
            .lock()
            .unwrap_or_else(PoisonError::into_inner) =
            CommandInterceptor::new(self.shared.host.clone(), Some(log.clone()));

        tracing::info!(server = %config.id, generation = core.generation, "Starting language server session");
        let connected = match prepare(&config) {
            Ok((selector, watch, root)) => {
                core.selector = Some(selector);
                core.watch = Some(watch);
                core.root = root;
                let link = EndpointLink {
                    sink: FailureSink::new(core.generation, events.clone()),
                    log: log.clone(),
                };
                self.shared.factory.connect(&config, link).await
            }
            Err(e) => Err(e),
        };

        let endpoint = match connected {
            Ok(endpoint) => endpoint,
            Err(e) => {
                tracing::error!(server = %config.id, "Failed to start language server: {e}");
                log.append_line(&format!("[Error] Start failed: {e}"));
                core.state = SessionState::Stopped;
                self.shared.publish(&core);
                self.shared.surface(
                    &core,
                    &format!(
                        "Failed to start language server '{}': {e}.",
                        config.display_name()
                    ),
                );
                return Err(e);
            }
        };

        core.endpoint = Some(endpoint.clone());
        core.events = Some(events);
        core.state = SessionState::Active;
        self.shared.set_live(Some(endpoint));
        self.shared.publish(&core);
        tracing::info!(server = %config.id, "Language server session active");

        let (cancel, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(run_events(self.shared.clone(), rx, cancel_rx));
        *self.run.lock().unwrap_or_else(PoisonError::into_inner) = Some(RunHandle { cancel, task });
        Ok(())
    }

    /// Tear the session down. Safe to call repeatedly.
    pub async fn stop(&self) {
        self.finish_run().await;

        let mut core = self.shared.core.lock().await;
        match core.state {
            SessionState::Idle | SessionState::Stopped => {
                tracing::debug!(server = %core.server(), state = core.state.label(), "Nothing to stop");
            }
            _ => {
                self.shared.teardown(&mut core).await;
                tracing::info!(server = %core.server(), "Language server session stopped");
            }
        }
        drop(core);

        // A start that raced this call may have spawned a new task.
        self.finish_run().await;
    }

    /// Execute a workspace command through the interceptor.
    ///
    /// Never waits on a restart: without a live endpoint the command fails
    /// at once and resolves to `null`.
    pub async fn execute_command(&self, command: &str, args: Vec<Value>) -> Value {
        let endpoint = self.shared.live();
        self.shared
            .interceptor()
            .execute_intercepted(command, args, |command, args| async move {
                match endpoint {
                    Some(endpoint) => endpoint.execute_command(command, args).await,
                    None => Err(EndpointError::NotConnected),
                }
            })
            .await
    }

    /// Forward `textDocument/didOpen` if the selector accepts the document.
    pub async fn did_open(&self, path: &Path, language_id: &str, text: &str) {
        let mut core = self.shared.core.lock().await;
        if core.state != SessionState::Active {
            tracing::debug!(server = %core.server(), "Session not active, ignoring didOpen");
            return;
        }
        let Some(uri) = core.document_uri(path) else {
            return;
        };
        let accepted = match (&core.selector, url::Url::parse(&uri)) {
            (Some(selector), Ok(parsed)) => {
                selector.matches(&parsed, &core.absolute(path), language_id)
            }
            _ => false,
        };
        if !accepted || !core.documents.open(&uri, language_id, text) {
            return;
        }
        core.forward(
            "textDocument/didOpen",
            protocol::did_open_params(&uri, language_id, 1, text),
        )
        .await;
    }

    /// Forward a full-text `textDocument/didChange` for an open document.
    pub async fn did_change(&self, path: &Path, text: &str) {
        let mut core = self.shared.core.lock().await;
        if core.state != SessionState::Active {
            return;
        }
        let Some(uri) = core.document_uri(path) else {
            return;
        };
        let Some(version) = core.documents.change(&uri, text) else {
            return;
        };
        core.forward(
            "textDocument/didChange",
            protocol::did_change_params(&uri, version, text),
        )
        .await;
    }

    pub async fn did_close(&self, path: &Path) {
        let mut core = self.shared.core.lock().await;
        if core.state != SessionState::Active {
            return;
        }
        let Some(uri) = core.document_uri(path) else {
            return;
        };
        if core.documents.close(&uri) {
            core.forward("textDocument/didClose", protocol::did_close_params(&uri))
                .await;
        }
    }

    /// Forward the changes matching the watch patterns.
    pub async fn files_changed(&self, changes: &[FileChange]) {
        let core = self.shared.core.lock().await;
        if core.state != SessionState::Active {
            return;
        }
        let Some(watch) = &core.watch else {
            return;
        };
        let matched: Vec<(String, &FileChange)> = changes
            .iter()
            .filter(|change| watch.matches(&core.absolute(&change.path), &core.root))
            .filter_map(|change| core.document_uri(&change.path).map(|uri| (uri, change)))
            .collect();
        if matched.is_empty() {
            return;
        }
        core.forward(
            "workspace/didChangeWatchedFiles",
            protocol::did_change_watched_files_params(&matched),
        )
        .await;
    }
}

fn prepare(config: &SessionConfig) -> Result<(Selector, WatchFilter, PathBuf), StartupError> {
    let selector = Selector::new(&config.document_selector)?;
    let watch = WatchFilter::new(&config.watch_patterns)?;
    let root = config
        .workspace_root()
        .map_err(|e| StartupError::Config(format!("cannot determine working directory: {e}")))?;
    Ok((selector, watch, root))
}

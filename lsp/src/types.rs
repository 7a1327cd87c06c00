//! Public configuration and status types.
//!
//! The host builds a [`SessionConfig`] (usually by deserializing it), hands
//! it to `Supervisor::start`, and watches [`SessionStatus`] to follow the
//! session through restarts.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::policy::CrashBudget;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

fn default_runtime() -> String {
    String::from("node")
}

const fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

/// Configuration for one session. Immutable once the session starts.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Client id (e.g. "genjilsp"). Also names the session log channel.
    #[serde(default)]
    pub id: String,
    /// Human-readable name for messages. Falls back to `id`.
    #[serde(default)]
    pub name: Option<String>,
    /// How to reach the language server.
    pub launch: LaunchDescriptor,
    /// Workspace root sent as `rootUri`. Defaults to the current directory.
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// Which documents this session handles. Empty matches everything.
    #[serde(default)]
    pub document_selector: Vec<DocumentFilter>,
    /// Globs for workspace file events forwarded to the server.
    #[serde(default)]
    pub watch_patterns: Vec<String>,
    /// Failures tolerated before automatic recovery gives up.
    #[serde(default)]
    pub crash_budget: CrashBudget,
    /// Per-request timeout, including `initialize`.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// How much protocol traffic to copy into the log channel.
    #[serde(default)]
    pub trace: TraceLevel,
}

impl SessionConfig {
    #[must_use]
    pub fn new(id: impl Into<String>, launch: LaunchDescriptor) -> Self {
        Self {
            id: id.into(),
            name: None,
            launch,
            root: None,
            document_selector: Vec::new(),
            watch_patterns: Vec::new(),
            crash_budget: CrashBudget::default(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            trace: TraceLevel::Off,
        }
    }

    #[must_use]
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// `root` resolved against the current directory.
    pub fn workspace_root(&self) -> std::io::Result<PathBuf> {
        let cwd = std::env::current_dir()?;
        Ok(match &self.root {
            Some(root) => cwd.join(root),
            None => cwd,
        })
    }

    /// Language id of the first filter that names one.
    #[must_use]
    pub fn default_language(&self) -> Option<&str> {
        self.document_selector
            .iter()
            .find_map(|f| f.language.as_deref())
    }
}

/// How the server process is started.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LaunchDescriptor {
    /// Run an executable speaking LSP over stdio.
    Executable {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Run a script module under a runtime (e.g. `node server.js`).
    Module {
        module: PathBuf,
        #[serde(default = "default_runtime")]
        runtime: String,
        #[serde(default)]
        transport: TransportKind,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl LaunchDescriptor {
    /// The program that gets resolved on `PATH`.
    #[must_use]
    pub fn program(&self) -> &str {
        match self {
            Self::Executable { command, .. } => command,
            Self::Module { runtime, .. } => runtime,
        }
    }

    #[must_use]
    pub fn transport(&self) -> TransportKind {
        match self {
            Self::Executable { .. } => TransportKind::Stdio,
            Self::Module { transport, .. } => *transport,
        }
    }
}

/// Channel used for a module launch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    Stdio,
    /// Listen on `127.0.0.1:port` (0 picks a free port) and let the server
    /// connect back.
    Socket {
        #[serde(default)]
        port: u16,
    },
}

/// One entry of a document selector. Absent fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DocumentFilter {
    /// URI scheme, e.g. "file".
    #[serde(default)]
    pub scheme: Option<String>,
    /// LSP language id, e.g. "sql".
    #[serde(default)]
    pub language: Option<String>,
    /// Glob matched against the document path.
    #[serde(default)]
    pub pattern: Option<String>,
}

/// Protocol tracing into the session log channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceLevel {
    #[default]
    Off,
    /// One line per message.
    Messages,
    /// Full JSON bodies.
    Verbose,
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Idle,
    Starting,
    Active,
    Restarting,
    ShuttingDown,
    Stopped,
}

impl SessionState {
    /// Whether `start()` would be a no-op.
    #[must_use]
    pub fn is_running(self) -> bool {
        matches!(self, Self::Starting | Self::Active | Self::Restarting)
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Restarting => "restarting",
            Self::ShuttingDown => "shutting down",
            Self::Stopped => "stopped",
        }
    }
}

/// Observable snapshot of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Closed events counted since the last fresh start.
    pub crash_count: u32,
    /// Bumped every time a new endpoint is constructed.
    pub generation: u64,
}

/// Kind of a workspace file event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChangeKind {
    Created = 1,
    Changed = 2,
    Deleted = 3,
}

/// A workspace file event from the host's watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: PathBuf,
    pub kind: FileChangeKind,
}

impl FileChange {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, kind: FileChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

//! Terminal implementation of the session host.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use tether_lsp::{ActionReply, Host, LogChannel, MessageAction};
use tokio::sync::oneshot;

/// Lines kept per channel for `reveal`.
const CHANNEL_SCROLLBACK: usize = 1000;

/// Prints messages to stderr. With `reveal_on_error` every message is
/// answered with its first action, so failures dump the relevant log.
pub struct TerminalHost {
    reveal_on_error: bool,
    channels: Mutex<HashMap<String, Arc<BufferedChannel>>>,
}

impl TerminalHost {
    pub fn new(reveal_on_error: bool) -> Self {
        Self {
            reveal_on_error,
            channels: Mutex::new(HashMap::new()),
        }
    }
}

impl Host for TerminalHost {
    fn show_error(&self, message: &str, actions: &[MessageAction]) -> ActionReply {
        eprintln!("error: {message}");
        let (tx, rx) = oneshot::channel();
        match actions.first() {
            Some(&action) if self.reveal_on_error => {
                let _ = tx.send(action);
            }
            Some(_) => {
                let labels: Vec<&str> = actions.iter().map(|a| a.label()).collect();
                eprintln!("  (available: {}; pass --reveal-on-error)", labels.join(", "));
            }
            None => {}
        }
        rx
    }

    fn log_channel(&self, name: &str) -> Arc<dyn LogChannel> {
        self.channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(BufferedChannel::new(name)))
            .clone()
    }
}

/// Keeps recent lines in memory and mirrors them to the tracing log.
pub struct BufferedChannel {
    name: String,
    lines: Mutex<VecDeque<String>>,
}

impl BufferedChannel {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            lines: Mutex::new(VecDeque::new()),
        }
    }

    fn snapshot(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

impl LogChannel for BufferedChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn append_line(&self, line: &str) {
        tracing::debug!(channel = %self.name, "{line}");
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == CHANNEL_SCROLLBACK {
            lines.pop_front();
        }
        lines.push_back(line.to_string());
    }

    fn reveal(&self) {
        eprintln!("--- {} ---", self.name);
        for line in self.snapshot() {
            eprintln!("{line}");
        }
        eprintln!("---");
    }
}

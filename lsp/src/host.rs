//! Capabilities the host editor provides to a session.
//!
//! The session never owns UI. It asks the host to show a message, and it
//! writes to log channels the host hands out.

use std::sync::Arc;

use tokio::sync::oneshot;

/// An action offered alongside an error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageAction {
    /// Reveal the protocol trace for a failed command.
    ShowTrace,
    /// Reveal the session output after the server gave up.
    ShowOutput,
}

impl MessageAction {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::ShowTrace => "Show Trace",
            Self::ShowOutput => "Show Output",
        }
    }
}

/// Resolves with the action the user picked.
///
/// The host drops the sender when the message is dismissed.
pub type ActionReply = oneshot::Receiver<MessageAction>;

/// Host editor surface.
pub trait Host: Send + Sync {
    /// Show a dismissible error message. Must not block.
    fn show_error(&self, message: &str, actions: &[MessageAction]) -> ActionReply;

    /// Create (or obtain an existing) named log channel.
    fn log_channel(&self, name: &str) -> Arc<dyn LogChannel>;
}

/// A named, append-only output surface.
pub trait LogChannel: Send + Sync {
    fn name(&self) -> &str;

    fn append_line(&self, line: &str);

    /// Bring the channel to the user's attention.
    fn reveal(&self);
}

/// Show `message` and reveal `log` if the user picks `action`.
///
/// Returns immediately; the answer is awaited on a detached task.
pub(crate) fn surface_error(
    host: &dyn Host,
    message: &str,
    action: MessageAction,
    log: Option<Arc<dyn LogChannel>>,
) {
    let Some(log) = log else {
        drop(host.show_error(message, &[]));
        return;
    };

    let reply = host.show_error(message, &[action]);
    tokio::spawn(async move {
        if let Ok(picked) = reply.await
            && picked == action
        {
            log.reveal();
        }
    });
}

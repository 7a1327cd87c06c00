//! Fault policy: pure restart/shutdown decisions.
//!
//! Nothing here touches a connection. The supervisor feeds in the counts it
//! has and applies whatever comes back.

use std::fmt;
use std::num::NonZeroU32;

use serde::Deserialize;

/// Number of failures tolerated before automatic recovery gives up.
pub const DEFAULT_CRASH_BUDGET: u32 = 5;

/// Failure threshold shared by the error and closed paths.
///
/// Always positive; a zero budget is rejected at the deserialization boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct CrashBudget(NonZeroU32);

impl CrashBudget {
    /// Returns `None` for zero.
    #[must_use]
    pub fn new(value: u32) -> Option<Self> {
        NonZeroU32::new(value).map(Self)
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0.get()
    }
}

impl Default for CrashBudget {
    fn default() -> Self {
        Self(NonZeroU32::new(DEFAULT_CRASH_BUDGET).unwrap_or(NonZeroU32::MIN))
    }
}

impl fmt::Display for CrashBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reaction to a transport error on a live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    Continue,
    Shutdown,
}

/// Reaction to the connection closing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    Restart,
    DoNotRestart,
}

/// Decide how to react to the `occurrence_count`-th transport error.
///
/// The count comes from the transport itself and is not tracked here.
#[must_use]
pub fn decide_on_error(occurrence_count: u32, budget: CrashBudget) -> ErrorAction {
    if occurrence_count < budget.get() {
        ErrorAction::Continue
    } else {
        ErrorAction::Shutdown
    }
}

/// Decide how to react to a closed connection.
///
/// Returns the action together with the incremented crash counter, which the
/// caller stores until the next fresh start resets it.
#[must_use]
pub fn decide_on_closed(crash_counter: u32, budget: CrashBudget) -> (CloseAction, u32) {
    let crashes = crash_counter.saturating_add(1);
    let action = if crashes < budget.get() {
        CloseAction::Restart
    } else {
        CloseAction::DoNotRestart
    };
    (action, crashes)
}

/// User-facing text for an error that exhausted the budget.
#[must_use]
pub fn shutdown_message(detail: &str, last_message: Option<&str>) -> String {
    format!(
        "Error communicating with the language server: {detail}: {}.",
        last_message.unwrap_or("no message exchanged")
    )
}

/// User-facing text for a close that exhausted the budget.
#[must_use]
pub fn gave_up_message(server: &str, crashes: u32) -> String {
    format!(
        "The language server '{server}' stopped {crashes} times. It will not be restarted."
    )
}

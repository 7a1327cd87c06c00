//! Client-side supervisor for a Language Server Protocol session.
//!
//! A [`Supervisor`] launches a language server through an
//! [`EndpointFactory`], forwards documents and commands to it, and applies
//! the fault policy when the connection errors or closes: restart a bounded
//! number of times, then give up and tell the user.

pub mod codec;
pub mod endpoint;
pub mod host;
pub mod interceptor;
pub mod policy;
pub mod types;

pub(crate) mod documents;
pub(crate) mod protocol;

mod connection;
mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::{LspConnection, ProcessFactory};
pub use endpoint::{
    Endpoint, EndpointError, EndpointFactory, EndpointFut, EndpointLink, FailureEvent, FailureSink,
    StartupError,
};
pub use host::{ActionReply, Host, LogChannel, MessageAction};
pub use interceptor::CommandInterceptor;
pub use policy::{CloseAction, CrashBudget, ErrorAction};
pub use supervisor::Supervisor;
pub use types::{
    DocumentFilter, FileChange, FileChangeKind, LaunchDescriptor, SessionConfig, SessionState,
    SessionStatus, TraceLevel, TransportKind,
};

//! Error capture around `workspace/executeCommand`.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use crate::endpoint::EndpointError;
use crate::host::{Host, LogChannel, MessageAction, surface_error};

/// Wraps outbound commands so a failure never reaches the caller.
///
/// A failed command resolves to `null` and the user gets a dismissible
/// message offering the session trace.
#[derive(Clone)]
pub struct CommandInterceptor {
    host: Arc<dyn Host>,
    trace: Option<Arc<dyn LogChannel>>,
}

impl CommandInterceptor {
    #[must_use]
    pub fn new(host: Arc<dyn Host>, trace: Option<Arc<dyn LogChannel>>) -> Self {
        Self { host, trace }
    }

    /// Run `forward` and swallow its error.
    pub async fn execute_intercepted<F, Fut>(
        &self,
        command: &str,
        args: Vec<Value>,
        forward: F,
    ) -> Value
    where
        F: FnOnce(String, Vec<Value>) -> Fut,
        Fut: Future<Output = Result<Value, EndpointError>>,
    {
        match forward(command.to_string(), args).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(command, "Command failed: {e}");
                if let Some(trace) = &self.trace {
                    trace.append_line(&format!("[Error] Command '{command}' failed: {e}"));
                }
                surface_error(
                    self.host.as_ref(),
                    &format!("Command '{command}' failed: {e}."),
                    MessageAction::ShowTrace,
                    self.trace.clone(),
                );
                Value::Null
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingHost;

    fn interceptor(host: &Arc<RecordingHost>) -> CommandInterceptor {
        let trace = host.log_channel("genjilsp");
        CommandInterceptor::new(host.clone(), Some(trace))
    }

    #[tokio::test]
    async fn test_success_passes_result_through() {
        let host = Arc::new(RecordingHost::new());
        let result = interceptor(&host)
            .execute_intercepted("genji.run", vec![serde_json::json!(1)], |command, args| async move {
                assert_eq!(command, "genji.run");
                Ok(serde_json::json!({ "rows": args }))
            })
            .await;
        assert_eq!(result, serde_json::json!({ "rows": [1] }));
        assert!(host.errors().is_empty());
    }

    #[tokio::test]
    async fn test_failure_yields_null_and_one_message() {
        let host = Arc::new(RecordingHost::new());
        let result = interceptor(&host)
            .execute_intercepted("genji.run", vec![], |_, _| async {
                Err(EndpointError::Response {
                    code: -32603,
                    message: "boom".to_string(),
                })
            })
            .await;

        assert_eq!(result, Value::Null);
        let errors = host.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "Command 'genji.run' failed: boom (code -32603).");
        assert_eq!(errors[0].actions, vec![MessageAction::ShowTrace]);
        assert!(
            host.channel("genjilsp")
                .lines()
                .contains(&"[Error] Command 'genji.run' failed: boom (code -32603)".to_string())
        );
    }

    #[tokio::test]
    async fn test_show_trace_reveals_channel() {
        let host = Arc::new(RecordingHost::answering(MessageAction::ShowTrace));
        interceptor(&host)
            .execute_intercepted("x", vec![], |_, _| async { Err(EndpointError::NotConnected) })
            .await;
        host.channel("genjilsp").wait_revealed(1).await;
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_independent() {
        let host = Arc::new(RecordingHost::new());
        let interceptor = interceptor(&host);

        let ok = interceptor.execute_intercepted("a", vec![], |_, _| async {
            tokio::task::yield_now().await;
            Ok(serde_json::json!("a"))
        });
        let failed = interceptor.execute_intercepted("b", vec![], |_, _| async {
            tokio::task::yield_now().await;
            Err(EndpointError::Closed)
        });
        let (ok, failed) = tokio::join!(ok, failed);

        assert_eq!(ok, serde_json::json!("a"));
        assert_eq!(failed, Value::Null);
        assert_eq!(host.errors().len(), 1);
        assert!(host.errors()[0].message.starts_with("Command 'b' failed"));
    }
}

//! JSON-RPC message shapes and the LSP parameters this client sends.

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;

use crate::types::FileChange;

/// Method not found.
pub(crate) const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub(crate) struct PathToUriError {
    path: PathBuf,
}

#[derive(Debug, Serialize)]
pub(crate) struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> Request<'a> {
    pub fn new(id: u64, method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> Notification<'a> {
    pub fn new(method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

/// A frame received from the server, classified.
#[derive(Debug, PartialEq)]
pub(crate) enum Incoming {
    Response { id: u64, body: Value },
    ServerRequest { id: Value, method: String, params: Option<Value> },
    Notification { method: String, params: Option<Value> },
}

pub(crate) fn classify(frame: &Value) -> Option<Incoming> {
    let id = frame.get("id");
    let method = frame.get("method").and_then(Value::as_str).map(String::from);
    let is_response = frame.get("result").is_some() || frame.get("error").is_some();
    let params = frame.get("params").cloned();

    match (id, method, is_response) {
        (Some(id), None, true) => Some(Incoming::Response {
            id: id.as_u64()?,
            body: frame.clone(),
        }),
        (Some(id), Some(method), _) => Some(Incoming::ServerRequest {
            id: id.clone(),
            method,
            params,
        }),
        (None, Some(method), _) => Some(Incoming::Notification { method, params }),
        _ => None,
    }
}

/// Split a response body into its result or its error.
pub(crate) fn response_outcome(body: &Value) -> Result<Value, (i64, String)> {
    match body.get("error") {
        Some(error) => Err((
            error.get("code").and_then(Value::as_i64).unwrap_or(0),
            error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        )),
        None => Ok(body.get("result").cloned().unwrap_or(Value::Null)),
    }
}

/// One-line description of a frame for logs and error messages.
pub(crate) fn describe(frame: &Value) -> String {
    let method = frame.get("method").and_then(Value::as_str);
    match (frame.get("id"), method) {
        (Some(id), Some(method)) => format!("request '{method}' (id {id})"),
        (None, Some(method)) => format!("notification '{method}'"),
        (Some(id), None) if frame.get("error").is_some() => format!("error response (id {id})"),
        (Some(id), None) => format!("response (id {id})"),
        (None, None) => String::from("unrecognized message"),
    }
}

/// The single workspace folder a session exposes.
fn workspace_folders(root_uri: &str) -> Value {
    serde_json::json!([{
        "uri": root_uri,
        "name": "workspace"
    }])
}

/// Reply for a request the server sends to us.
pub(crate) fn reply_to_server_request(
    id: &Value,
    method: &str,
    params: Option<&Value>,
    root_uri: &str,
) -> Value {
    match method {
        "workspace/configuration" => {
            let items = params
                .and_then(|p| p.get("items"))
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": vec![Value::Null; items],
            })
        }
        "workspace/workspaceFolders" => serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": workspace_folders(root_uri),
        }),
        "client/registerCapability"
        | "client/unregisterCapability"
        | "window/workDoneProgress/create" => serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": null,
        }),
        _ => serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {
                "code": METHOD_NOT_FOUND,
                "message": format!("Method not found: {method}"),
            },
        }),
    }
}

pub(crate) fn initialize_params(root_uri: &str, client_name: &str) -> Value {
    serde_json::json!({
        "processId": std::process::id(),
        "clientInfo": { "name": client_name },
        "rootUri": root_uri,
        "capabilities": {
            "workspace": {
                "executeCommand": { "dynamicRegistration": false },
                "didChangeWatchedFiles": { "dynamicRegistration": false },
                "configuration": true,
                "workspaceFolders": true
            },
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": false,
                    "willSave": false,
                    "willSaveWaitUntil": false,
                    "didSave": false
                }
            },
            "window": {
                "workDoneProgress": true
            }
        },
        "workspaceFolders": workspace_folders(root_uri)
    })
}

pub(crate) fn did_open_params(uri: &str, language_id: &str, version: i32, text: &str) -> Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

pub(crate) fn did_change_params(uri: &str, version: i32, text: &str) -> Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri,
            "version": version
        },
        "contentChanges": [{
            "text": text
        }]
    })
}

pub(crate) fn did_close_params(uri: &str) -> Value {
    serde_json::json!({
        "textDocument": { "uri": uri }
    })
}

pub(crate) fn did_change_watched_files_params(changes: &[(String, &FileChange)]) -> Value {
    let changes: Vec<Value> = changes
        .iter()
        .map(|(uri, change)| serde_json::json!({ "uri": uri, "type": change.kind as u8 }))
        .collect();
    serde_json::json!({ "changes": changes })
}

pub(crate) fn execute_command_params(command: &str, args: Vec<Value>) -> Value {
    serde_json::json!({
        "command": command,
        "arguments": args,
    })
}

pub(crate) fn path_to_file_uri(path: &Path) -> Result<url::Url, PathToUriError> {
    url::Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FileChangeKind;

    #[test]
    fn test_request_omits_missing_params() {
        let json = serde_json::to_value(Request::new(1, "shutdown", None)).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["id"], 1);
        assert_eq!(json["method"], "shutdown");
        assert!(json.get("params").is_none());
    }

    #[test]
    fn test_notification_has_no_id() {
        let json =
            serde_json::to_value(Notification::new("initialized", Some(serde_json::json!({}))))
                .unwrap();
        assert!(json.get("id").is_none());
        assert!(json["params"].is_object());
    }

    #[test]
    fn test_classify_frames() {
        let response = serde_json::json!({"jsonrpc": "2.0", "id": 3, "result": null});
        assert!(matches!(
            classify(&response),
            Some(Incoming::Response { id: 3, .. })
        ));

        let request = serde_json::json!({"jsonrpc": "2.0", "id": "a", "method": "workspace/configuration"});
        assert!(matches!(
            classify(&request),
            Some(Incoming::ServerRequest { ref method, .. }) if method == "workspace/configuration"
        ));

        let notification = serde_json::json!({"jsonrpc": "2.0", "method": "window/logMessage", "params": {}});
        assert!(matches!(
            classify(&notification),
            Some(Incoming::Notification { ref method, .. }) if method == "window/logMessage"
        ));

        assert!(classify(&serde_json::json!({"jsonrpc": "2.0"})).is_none());
        assert!(classify(&serde_json::json!({"id": "x", "result": 1})).is_none());
    }

    #[test]
    fn test_response_outcome() {
        let ok = serde_json::json!({"id": 1, "result": {"applied": true}});
        assert_eq!(response_outcome(&ok), Ok(serde_json::json!({"applied": true})));

        let null = serde_json::json!({"id": 1, "result": null});
        assert_eq!(response_outcome(&null), Ok(Value::Null));

        let err = serde_json::json!({"id": 1, "error": {"code": -32602, "message": "bad args"}});
        assert_eq!(response_outcome(&err), Err((-32602, "bad args".to_string())));
    }

    #[test]
    fn test_describe() {
        assert_eq!(
            describe(&serde_json::json!({"id": 1, "method": "initialize"})),
            "request 'initialize' (id 1)"
        );
        assert_eq!(
            describe(&serde_json::json!({"method": "exit"})),
            "notification 'exit'"
        );
        assert_eq!(
            describe(&serde_json::json!({"id": 4, "result": 1})),
            "response (id 4)"
        );
        assert_eq!(
            describe(&serde_json::json!({"id": 4, "error": {}})),
            "error response (id 4)"
        );
    }

    #[test]
    fn test_reply_to_configuration_request() {
        let params = serde_json::json!({"items": [{"section": "a"}, {"section": "b"}]});
        let reply = reply_to_server_request(
            &serde_json::json!(7),
            "workspace/configuration",
            Some(&params),
            "file:///work",
        );
        assert_eq!(reply["id"], 7);
        assert_eq!(reply["result"], serde_json::json!([null, null]));
    }

    #[test]
    fn test_reply_to_workspace_folders_request() {
        let reply = reply_to_server_request(
            &serde_json::json!(3),
            "workspace/workspaceFolders",
            None,
            "file:///work",
        );
        assert_eq!(reply["id"], 3);
        assert!(reply.get("error").is_none());
        assert_eq!(
            reply["result"],
            serde_json::json!([{"uri": "file:///work", "name": "workspace"}])
        );
        let init = initialize_params("file:///work", "genji");
        assert_eq!(init["capabilities"]["workspace"]["workspaceFolders"], true);
        assert_eq!(init["workspaceFolders"], reply["result"]);
    }

    #[test]
    fn test_reply_to_register_capability() {
        let reply = reply_to_server_request(
            &serde_json::json!(1),
            "client/registerCapability",
            None,
            "file:///work",
        );
        assert!(reply["result"].is_null());
        assert!(reply.get("error").is_none());
    }

    #[test]
    fn test_reply_to_unknown_request() {
        let reply = reply_to_server_request(
            &serde_json::json!(5),
            "workspace/applyEdit",
            None,
            "file:///work",
        );
        assert_eq!(reply["error"]["code"], METHOD_NOT_FOUND);
        assert!(
            reply["error"]["message"]
                .as_str()
                .unwrap()
                .contains("workspace/applyEdit")
        );
    }

    #[test]
    fn test_initialize_params() {
        let params = initialize_params("file:///work", "genjilsp");
        assert!(params["processId"].is_number());
        assert_eq!(params["rootUri"], "file:///work");
        assert_eq!(params["clientInfo"]["name"], "genjilsp");
        assert!(params["capabilities"]["workspace"]["executeCommand"].is_object());
    }

    #[test]
    fn test_document_params() {
        let open = did_open_params("file:///q.sql", "sql", 1, "select 1");
        assert_eq!(open["textDocument"]["languageId"], "sql");
        assert_eq!(open["textDocument"]["version"], 1);

        let change = did_change_params("file:///q.sql", 2, "select 2");
        assert_eq!(change["textDocument"]["version"], 2);
        assert_eq!(change["contentChanges"][0]["text"], "select 2");

        let close = did_close_params("file:///q.sql");
        assert_eq!(close["textDocument"]["uri"], "file:///q.sql");
    }

    #[test]
    fn test_watched_files_params() {
        let change = FileChange::new("/work/q.sql", FileChangeKind::Deleted);
        let params = did_change_watched_files_params(&[("file:///work/q.sql".to_string(), &change)]);
        assert_eq!(params["changes"][0]["uri"], "file:///work/q.sql");
        assert_eq!(params["changes"][0]["type"], 3);
    }

    #[test]
    fn test_execute_command_params() {
        let params = execute_command_params("genji.run", vec![serde_json::json!("select 1")]);
        assert_eq!(params["command"], "genji.run");
        assert_eq!(params["arguments"][0], "select 1");
    }

    #[cfg(not(windows))]
    #[test]
    fn test_path_to_file_uri() {
        let uri = path_to_file_uri(Path::new("/work/q.sql")).unwrap();
        assert_eq!(uri.as_str(), "file:///work/q.sql");
        assert!(path_to_file_uri(Path::new("relative.sql")).is_err());
    }
}

//! Wire codec for the agent app-server protocol
//!
//! Messages are newline-delimited JSON objects shaped like JSON-RPC 2.0:
//! requests carry `id` + `method`, responses carry `id` + `result`/`error`,
//! notifications carry `method` only.

use crate::{BridgeError, Result};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::warn;

/// Longest slice of a raw line echoed into log output
const LOG_PREVIEW_CHARS: usize = 120;

/// JSON-RPC request structure (a notification when `id` is absent)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn request(id: u64, method: &str, params: Value) -> Self {
        Self {
            method: method.to_string(),
            id: Some(id),
            params: Some(params),
        }
    }

    pub fn notification(method: &str, params: Option<Value>) -> Self {
        Self {
            method: method.to_string(),
            id: None,
            params,
        }
    }
}

/// JSON-RPC response structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn result(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: u64, error: JsonRpcError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    /// Server-provided message, with `data.details` appended when present.
    pub fn display_message(&self) -> String {
        let details = self
            .data
            .as_ref()
            .and_then(|data| data.get("details"))
            .and_then(Value::as_str)
            .unwrap_or("");
        let message = if self.message.is_empty() {
            "unknown error"
        } else {
            self.message.as_str()
        };
        if details.is_empty() {
            message.to_string()
        } else {
            format!("{message}: {details}")
        }
    }
}

/// A decoded inbound line
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    /// Reply to one of our requests
    Response {
        id: u64,
        outcome: std::result::Result<Value, JsonRpcError>,
    },
    /// Server asking the client something; must be answered on `id`
    Request {
        id: u64,
        method: String,
        params: Value,
    },
    /// Fire-and-forget server event
    Notification { method: String, params: Value },
}

impl IncomingMessage {
    pub fn method(&self) -> Option<&str> {
        match self {
            IncomingMessage::Request { method, .. } | IncomingMessage::Notification { method, .. } => {
                Some(method)
            }
            IncomingMessage::Response { .. } => None,
        }
    }

    pub fn params(&self) -> Option<&Value> {
        match self {
            IncomingMessage::Request { params, .. } | IncomingMessage::Notification { params, .. } => {
                Some(params)
            }
            IncomingMessage::Response { .. } => None,
        }
    }

    /// Interpret an already-parsed JSON value.
    pub fn from_json(json: Value) -> Result<Self> {
        let Value::Object(mut map) = json else {
            return Err(BridgeError::Malformed("message is not a JSON object".to_string()));
        };
        let id = map.get("id").and_then(parse_id);
        let method = map
            .get("method")
            .and_then(Value::as_str)
            .map(str::to_string);
        let params = map.remove("params").unwrap_or(Value::Null);

        match (method, id) {
            (Some(method), Some(id)) => Ok(IncomingMessage::Request { id, method, params }),
            (Some(method), None) => {
                if map.get("id").is_some_and(|id| !id.is_null()) {
                    warn!("Server request {} has a non-numeric id; treating as notification", method);
                }
                Ok(IncomingMessage::Notification { method, params })
            }
            (None, Some(id)) => {
                if let Some(error) = map.remove("error").filter(|e| !e.is_null()) {
                    let error = serde_json::from_value::<JsonRpcError>(error.clone()).unwrap_or(
                        JsonRpcError {
                            code: 0,
                            message: error.to_string(),
                            data: None,
                        },
                    );
                    Ok(IncomingMessage::Response {
                        id,
                        outcome: Err(error),
                    })
                } else if let Some(result) = map.remove("result") {
                    Ok(IncomingMessage::Response {
                        id,
                        outcome: Ok(result),
                    })
                } else {
                    Err(BridgeError::Malformed(format!(
                        "response {id} has neither result nor error"
                    )))
                }
            }
            (None, None) => Err(BridgeError::Malformed(
                "message has neither method nor id".to_string(),
            )),
        }
    }
}

/// Ids are numeric on this protocol, but some servers echo them as strings.
fn parse_id(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|raw| raw.trim().parse::<u64>().ok()))
}

/// Frame one message as a single line terminated by `\n`.
pub fn encode<T: Serialize>(message: &T) -> Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Decode one line. Blank lines yield `Ok(None)`.
pub fn decode_line(line: &str) -> Result<Option<IncomingMessage>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let json: Value = serde_json::from_str(trimmed)
        .map_err(|e| BridgeError::Malformed(format!("{e}: {}", preview(trimmed))))?;
    IncomingMessage::from_json(json).map(Some)
}

/// Lazily decode a byte stream into messages, one per line.
///
/// Lines that fail to decode are logged and skipped; the stream ends at EOF
/// or on the first read error.
pub fn decode_stream<R>(reader: R) -> impl Stream<Item = IncomingMessage>
where
    R: AsyncBufRead + Unpin,
{
    futures::stream::unfold(reader.lines(), |mut lines| async move {
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match decode_line(&line) {
                    Ok(Some(message)) => return Some((message, lines)),
                    Ok(None) => continue,
                    Err(e) => {
                        warn!("Dropping undecodable line: {}", e);
                        continue;
                    }
                },
                Ok(None) => return None,
                Err(e) => {
                    warn!("Read error on agent stream: {}", e);
                    return None;
                }
            }
        }
    })
}

/// Shorten a raw line for log output without splitting a character.
pub fn preview(line: &str) -> &str {
    match line.char_indices().nth(LOG_PREVIEW_CHARS) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}

/// Client request methods
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "initialized";
    pub const THREAD_START: &str = "thread/start";
    pub const THREAD_RESUME: &str = "thread/resume";
    pub const THREAD_LIST: &str = "thread/list";
    pub const THREAD_ARCHIVE: &str = "thread/archive";
    pub const THREAD_COMPACT: &str = "thread/compact/start";
    pub const THREAD_SET_NAME: &str = "thread/name/set";
    pub const TURN_START: &str = "turn/start";
    pub const TURN_INTERRUPT: &str = "turn/interrupt";
    pub const REVIEW_START: &str = "review/start";
    pub const MODEL_LIST: &str = "model/list";
}

/// Server notification and server-request methods
pub mod notifications {
    // Connection
    pub const CONNECTED: &str = "codex/connected";

    // Turn lifecycle
    pub const TURN_STARTED: &str = "turn/started";
    pub const TURN_COMPLETED: &str = "turn/completed";
    pub const TURN_PLAN_UPDATED: &str = "turn/plan/updated";
    pub const TURN_DIFF_UPDATED: &str = "turn/diff/updated";
    pub const TURN_PERMISSION_DENIED: &str = "turn/permissionDenied";

    // Items
    pub const ITEM_STARTED: &str = "item/started";
    pub const ITEM_COMPLETED: &str = "item/completed";
    pub const ITEM_AGENT_MESSAGE_DELTA: &str = "item/agentMessage/delta";

    // Server requests (server -> client, answered on the request id)
    pub const REQUEST_USER_INPUT: &str = "item/tool/requestUserInput";
    pub const APPROVAL_SUFFIX: &str = "requestApproval";

    // Command execution
    pub const COMMAND_EXEC_OUTPUT_DELTA: &str = "item/commandExecution/outputDelta";
    pub const TERMINAL_INTERACTION: &str = "item/commandExecution/terminalInteraction";

    // File changes
    pub const FILE_CHANGE_OUTPUT_DELTA: &str = "item/fileChange/outputDelta";

    // Reasoning
    pub const REASONING_SUMMARY_TEXT_DELTA: &str = "item/reasoning/summaryTextDelta";
    pub const REASONING_SUMMARY_PART_ADDED: &str = "item/reasoning/summaryPartAdded";
    pub const REASONING_TEXT_DELTA: &str = "item/reasoning/textDelta";

    // Thread lifecycle
    pub const THREAD_STARTED: &str = "thread/started";
    pub const THREAD_CREATED: &str = "thread/created";
    pub const THREAD_NAME_UPDATED: &str = "thread/name/updated";
    pub const THREAD_TOKEN_USAGE_UPDATED: &str = "thread/tokenUsage/updated";
    pub const THREAD_COMPACTED: &str = "thread/compacted";

    // Errors
    pub const ERROR: &str = "error";
}

/// Parameters for the `initialize` request
pub fn initialize_params(client_name: &str, version: &str) -> Value {
    serde_json::json!({
        "clientInfo": {
            "name": client_name,
            "title": "Session Bridge",
            "version": version
        },
        "capabilities": {
            "experimentalApi": true
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    #[test]
    fn test_encode_ends_with_newline() {
        let line = encode(&JsonRpcRequest::request(7, "turn/start", json!({"threadId": "t"}))).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        let parsed: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(parsed["id"], 7);
        assert_eq!(parsed["method"], "turn/start");
    }

    #[test]
    fn test_notification_omits_id() {
        let line = encode(&JsonRpcRequest::notification("initialized", None)).unwrap();
        let parsed: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert!(parsed.get("id").is_none());
        assert!(parsed.get("params").is_none());
    }

    #[test]
    fn test_decode_message_kinds() {
        let response = decode_line(r#"{"id":3,"result":{"ok":true}}"#).unwrap().unwrap();
        assert_eq!(
            response,
            IncomingMessage::Response {
                id: 3,
                outcome: Ok(json!({"ok": true}))
            }
        );

        let error = decode_line(r#"{"id":"4","error":{"code":-1,"message":"boom"}}"#)
            .unwrap()
            .unwrap();
        match error {
            IncomingMessage::Response { id, outcome: Err(e) } => {
                assert_eq!(id, 4);
                assert_eq!(e.message, "boom");
            }
            other => panic!("unexpected {other:?}"),
        }

        let request = decode_line(
            r#"{"id":9,"method":"item/commandExecution/requestApproval","params":{"command":"ls"}}"#,
        )
        .unwrap()
        .unwrap();
        assert!(matches!(request, IncomingMessage::Request { id: 9, .. }));

        let notification = decode_line(r#"{"method":"turn/started","params":{"threadId":"t"}}"#)
            .unwrap()
            .unwrap();
        assert_eq!(notification.method(), Some("turn/started"));
    }

    #[test]
    fn test_decode_rejects_shapeless_objects() {
        assert!(matches!(decode_line("{}"), Err(BridgeError::Malformed(_))));
        assert!(matches!(decode_line("[1,2]"), Err(BridgeError::Malformed(_))));
        assert!(matches!(decode_line(r#"{"id":1}"#), Err(BridgeError::Malformed(_))));
        assert!(decode_line("   ").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stream_skips_malformed_lines() {
        let input = concat!(
            "not json at all\n",
            "{\"method\":\"turn/started\",\"params\":{}}\n",
            "\n",
            "{\"id\":1,\"result\":{}}\n",
            "{\"method\":\"item/started\",\"params\":{}}\n",
        );
        let messages: Vec<IncomingMessage> =
            decode_stream(tokio::io::BufReader::new(input.as_bytes())).collect().await;
        assert_eq!(messages.len(), 3);
    }

    #[test]
    fn test_error_display_message_appends_details() {
        let error = JsonRpcError {
            code: 1,
            message: "failed".to_string(),
            data: Some(json!({"details": "disk full"})),
        };
        assert_eq!(error.display_message(), "failed: disk full");
    }

    #[test]
    fn test_preview_respects_char_boundaries() {
        let line = "é".repeat(200);
        assert_eq!(preview(&line).chars().count(), LOG_PREVIEW_CHARS);
    }
}

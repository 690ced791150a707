//! Wire protocol types for host-worker communication.
//!
//! One channel (worker stdin/stdout), one JSON object per line:
//! - **Host → worker**: Init, ExecResponse
//! - **Worker → host**: ExecRequest, Done, Error

use std::collections::BTreeMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// A direction of the protocol: the set of frame kinds one side may send.
pub trait Frame: Serialize + DeserializeOwned {
    /// Values of the `type` tag this direction understands.
    const KINDS: &'static [&'static str];

    fn kind(&self) -> &'static str;

    /// Whether a frame of `kind` blocks its sender until it gets a reply.
    fn expects_reply(_kind: &str) -> bool {
        false
    }
}

/// Correlation id of an exec request, echoed verbatim in the response.
///
/// Kept as raw JSON so any id the worker picks (string, integer, float,
/// object) comes back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Value);

impl RequestId {
    /// Canonical text used for duplicate detection and logging.
    pub fn key(&self) -> String {
        match &self.0 {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Value::String(s) => f.write_str(s),
            other => write!(f, "{other}"),
        }
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(Value::from(s))
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self(Value::from(n))
    }
}

impl From<Value> for RequestId {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// Frames sent by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum HostFrame {
    /// Session setup, sent exactly once right after spawn (must be first message).
    Init {
        instruction: String,
        session_id: String,
        model: String,
        system_prompt: String,
        /// Distributed tracing headers so the worker's spans nest under the host's.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        trace_headers: Option<BTreeMap<String, String>>,
    },

    ExecResponse {
        id: RequestId,
        output: String,
        exit_code: i32,
    },
}

impl Frame for HostFrame {
    const KINDS: &'static [&'static str] = &["init", "exec_response"];

    fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::ExecResponse { .. } => "exec_response",
        }
    }
}

/// Frames sent by the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum WorkerFrame {
    /// Run a shell command in the sandbox. The worker blocks until the response arrives.
    ExecRequest { id: RequestId, command: String },

    /// Terminal success, carrying the worker's full message history.
    Done {
        #[serde(default, deserialize_with = "null_as_default")]
        messages: Vec<RawMessage>,
    },

    /// Terminal failure.
    Error {
        #[serde(default, deserialize_with = "null_as_default")]
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },
}

impl Frame for WorkerFrame {
    const KINDS: &'static [&'static str] = &["exec_request", "done", "error"];

    fn expects_reply(kind: &str) -> bool {
        kind == "exec_request"
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::ExecRequest { .. } => "exec_request",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }
}

/// Treat an explicit `null` like a missing field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Author of a message in the worker's history.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Ai,
    Tool,
    /// system, human and anything newer; carried through but never reconstructed.
    #[default]
    #[serde(other)]
    Other,
}

/// One entry of the `done` frame's history. Order is the only ordering signal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawMessage {
    #[serde(default, deserialize_with = "null_as_default")]
    pub role: Role,
    /// Plain string or a list of content blocks.
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<RawToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl RawMessage {
    /// Flatten `content` into the text shown in a trajectory step.
    ///
    /// Block lists keep only their text parts, one per line.
    pub fn text(&self) -> String {
        match &self.content {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            Value::Array(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    Value::String(s) => Some(s.as_str()),
                    Value::Object(_) => block.get("text").and_then(Value::as_str),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
            other => other.to_string(),
        }
    }

    pub fn tool_calls(&self) -> &[RawToolCall] {
        self.tool_calls.as_deref().unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawToolCall {
    #[serde(default, deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(default = "empty_args")]
    pub args: Value,
}

fn empty_args() -> Value {
    Value::Object(serde_json::Map::new())
}

/// Token usage reported for one model call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default, alias = "inputTokens", deserialize_with = "null_as_default")]
    pub input_tokens: u64,
    #[serde(default, alias = "outputTokens", deserialize_with = "null_as_default")]
    pub output_tokens: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn init_serializes() {
        let frame = HostFrame::Init {
            instruction: "Create hello.txt".to_string(),
            session_id: "sess-1".to_string(),
            model: "anthropic:claude-sonnet-4-5-20250929".to_string(),
            system_prompt: "You are an agent.".to_string(),
            trace_headers: None,
        };
        insta::assert_json_snapshot!(frame, @r#"
        {
          "type": "init",
          "instruction": "Create hello.txt",
          "sessionId": "sess-1",
          "model": "anthropic:claude-sonnet-4-5-20250929",
          "systemPrompt": "You are an agent."
        }
        "#);
    }

    #[test]
    fn init_with_trace_headers_serializes() {
        let headers = BTreeMap::from([(
            "traceparent".to_string(),
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01".to_string(),
        )]);
        let frame = HostFrame::Init {
            instruction: "ls".to_string(),
            session_id: "sess-2".to_string(),
            model: "m".to_string(),
            system_prompt: "p".to_string(),
            trace_headers: Some(headers),
        };
        insta::assert_json_snapshot!(frame, @r#"
        {
          "type": "init",
          "instruction": "ls",
          "sessionId": "sess-2",
          "model": "m",
          "systemPrompt": "p",
          "traceHeaders": {
            "traceparent": "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01"
          }
        }
        "#);
    }

    #[test]
    fn exec_response_serializes() {
        let frame = HostFrame::ExecResponse {
            id: RequestId::from("req-7"),
            output: "hello".to_string(),
            exit_code: 0,
        };
        insta::assert_json_snapshot!(frame, @r#"
        {
          "type": "exec_response",
          "id": "req-7",
          "output": "hello",
          "exitCode": 0
        }
        "#);
    }

    #[test]
    fn exec_response_keeps_numeric_id() {
        let frame = HostFrame::ExecResponse {
            id: RequestId::from(42),
            output: String::new(),
            exit_code: 2,
        };
        insta::assert_json_snapshot!(frame, @r#"
        {
          "type": "exec_response",
          "id": 42,
          "output": "",
          "exitCode": 2
        }
        "#);
    }

    #[test]
    fn error_without_stack_serializes() {
        let frame = WorkerFrame::Error {
            message: "model unavailable".to_string(),
            stack: None,
        };
        insta::assert_json_snapshot!(frame, @r#"
        {
          "type": "error",
          "message": "model unavailable"
        }
        "#);
    }

    #[test]
    fn done_deserializes_langchain_history() {
        let frame: WorkerFrame = serde_json::from_value(json!({
            "type": "done",
            "messages": [
                {"role": "human", "content": "do it"},
                {
                    "role": "ai",
                    "content": [{"type": "text", "text": "on it"}],
                    "toolCalls": [{"id": "call_1", "name": "execute", "args": {"command": "ls"}}],
                    "usage": {"inputTokens": 12, "outputTokens": 3}
                },
                {"role": "tool", "content": "a.txt", "toolCallId": "call_1"}
            ]
        }))
        .unwrap();

        let WorkerFrame::Done { messages } = frame else {
            panic!("wrong variant");
        };
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, Role::Other);
        assert_eq!(messages[1].role, Role::Ai);
        assert_eq!(messages[1].text(), "on it");
        assert_eq!(messages[1].tool_calls()[0].name, "execute");
        assert_eq!(
            messages[1].usage,
            Some(Usage {
                input_tokens: 12,
                output_tokens: 3
            })
        );
        assert_eq!(messages[2].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn raw_message_tolerates_null_fields() {
        let msg: RawMessage = serde_json::from_value(json!({
            "role": "ai",
            "content": null,
            "toolCalls": null,
            "usage": null
        }))
        .unwrap();
        assert_eq!(msg.text(), "");
        assert!(msg.tool_calls().is_empty());
        assert!(msg.usage.is_none());
    }

    #[test]
    fn explicit_nulls_fall_back_to_defaults() {
        let msg: RawMessage = serde_json::from_value(json!({
            "role": null,
            "content": "x",
            "usage": {"input_tokens": null, "output_tokens": 4}
        }))
        .unwrap();
        assert_eq!(msg.role, Role::Other);
        assert_eq!(
            msg.usage,
            Some(Usage {
                input_tokens: 0,
                output_tokens: 4
            })
        );

        let done: WorkerFrame =
            serde_json::from_value(json!({"type": "done", "messages": null})).unwrap();
        assert_eq!(done, WorkerFrame::Done { messages: vec![] });

        let call: RawToolCall =
            serde_json::from_value(json!({"id": null, "name": "ls", "args": {}})).unwrap();
        assert_eq!(call.id, "");
    }

    #[test]
    fn request_id_echoes_any_json_value() {
        for id in [json!(1.5), json!(18446744073709551615u64), json!({"n": 1}), json!(null)] {
            let frame: WorkerFrame = serde_json::from_value(
                json!({"type": "exec_request", "id": id.clone(), "command": "ls"}),
            )
            .unwrap();
            let WorkerFrame::ExecRequest { id: request_id, .. } = frame else {
                panic!("wrong variant");
            };
            let response = HostFrame::ExecResponse {
                id: request_id,
                output: String::new(),
                exit_code: 0,
            };
            assert_eq!(serde_json::to_value(&response).unwrap()["id"], id);
        }
    }

    #[test]
    fn request_id_display_is_unquoted_for_strings() {
        assert_eq!(RequestId::from("req-1").to_string(), "req-1");
        assert_eq!(RequestId::from(7).key(), "7");
        assert_eq!(RequestId::from(json!({"a": 1})).to_string(), r#"{"a":1}"#);
    }

    #[test]
    fn tool_call_args_default_to_empty_object() {
        let call: RawToolCall = serde_json::from_value(json!({"id": "c", "name": "ls"})).unwrap();
        assert_eq!(call.args, json!({}));
    }

    #[test]
    fn frame_kinds_match_tags() {
        let frame = WorkerFrame::ExecRequest {
            id: RequestId::from(1),
            command: "pwd".to_string(),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], frame.kind());
        assert!(WorkerFrame::KINDS.contains(&frame.kind()));
    }
}

use rewind_common::ErrorKind;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// Correlation id used when a line could not be parsed far enough to read
/// its own id.
pub const PARSE_ERROR_ID: &str = "parse-error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Action,
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: RequestKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
}

impl Request {
    pub fn ping(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: RequestKind::Ping,
            tool: None,
            args: None,
        }
    }

    pub fn action(id: impl Into<String>, tool: impl Into<String>, args: Option<Value>) -> Self {
        Self {
            id: id.into(),
            kind: RequestKind::Action,
            tool: Some(tool.into()),
            args,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl Response {
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ok: false,
            result: None,
            error: Some(ErrorPayload {
                kind,
                message: message.into(),
            }),
        }
    }

    pub fn pong(id: impl Into<String>) -> Self {
        Self::success(id, serde_json::json!({ "pong": true }))
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::failure(PARSE_ERROR_ID, ErrorKind::ProtocolError, message)
    }

    /// Encodes as one wire line, newline included.
    pub fn to_line(&self) -> String {
        match serde_json::to_string(self) {
            Ok(mut line) => {
                line.push('\n');
                line
            }
            Err(e) => {
                let fallback = Response::failure(
                    self.id.clone(),
                    ErrorKind::Internal,
                    format!("failed to encode response: {}", e),
                );
                format!(
                    "{}\n",
                    serde_json::to_string(&fallback).unwrap_or_default()
                )
            }
        }
    }
}

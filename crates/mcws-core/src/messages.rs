//! Typed bodies for the well-known frame purposes.
//!
//! Only the envelopes this library itself needs to build or inspect are
//! typed; game-specific payloads stay `serde_json::Value`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Origin stamped on every command request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOrigin {
    #[serde(rename = "type")]
    pub origin_type: String,
}

impl Default for CommandOrigin {
    fn default() -> Self {
        CommandOrigin {
            origin_type: "player".to_string(),
        }
    }
}

/// Body of a current-shape command request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequestBody {
    pub version: u32,
    #[serde(rename = "commandLine")]
    pub command_line: String,
    pub origin: CommandOrigin,
}

/// Body of a legacy-shape command request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegacyCommandRequestBody {
    pub version: u32,
    pub name: String,
    pub overload: String,
    pub input: Value,
    pub origin: CommandOrigin,
}

/// Body of a `ws:encrypt` request (server → client).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptRequestBody {
    pub mode: String,
    #[serde(rename = "publicKey")]
    pub public_key: String,
    pub salt: String,
}

/// Body of a `ws:encrypt` response (client → server).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptResponseBody {
    #[serde(rename = "publicKey")]
    pub public_key: String,
}

/// Body of a `chat:subscribe` request. Null filters match anything, and the
/// keys are always present on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatSubscribeBody {
    pub sender: Option<String>,
    pub receiver: Option<String>,
    pub message: Option<String>,
}

/// Body of a `chat:unsubscribe` request. With no `requestId` the key is
/// omitted entirely (the empty-object form tears down every filter).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatUnsubscribeBody {
    #[serde(
        rename = "requestId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub request_id: Option<Uuid>,
}

/// Body of an `error` purpose frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "statusCode", default)]
    pub status_code: i64,
    #[serde(rename = "statusMessage", default)]
    pub status_message: String,
}

/// A command line, either whole or as tokens joined with single spaces.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandLine {
    Line(String),
    Tokens(Vec<String>),
}

impl CommandLine {
    pub fn into_line(self) -> String {
        match self {
            CommandLine::Line(line) => line,
            CommandLine::Tokens(tokens) => tokens.join(" "),
        }
    }
}

impl From<&str> for CommandLine {
    fn from(s: &str) -> Self {
        CommandLine::Line(s.to_string())
    }
}

impl From<String> for CommandLine {
    fn from(s: String) -> Self {
        CommandLine::Line(s)
    }
}

impl From<Vec<String>> for CommandLine {
    fn from(tokens: Vec<String>) -> Self {
        CommandLine::Tokens(tokens)
    }
}

impl From<Vec<&str>> for CommandLine {
    fn from(tokens: Vec<&str>) -> Self {
        CommandLine::Tokens(tokens.into_iter().map(str::to_string).collect())
    }
}

/// Whether a command status code signals failure (high bit set).
pub fn is_command_error(status_code: i64) -> bool {
    status_code & 0x8000_0000 != 0
}

/// Extract `(statusCode, statusMessage)` from a response body, if present.
pub fn command_status(body: &Value) -> Option<(i64, String)> {
    let code = body.get("statusCode")?.as_i64()?;
    let message = body
        .get("statusMessage")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Some((code, message))
}

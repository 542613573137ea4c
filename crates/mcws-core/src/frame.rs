//! The JSON frame envelope: `{ "header": {...}, "body": <any> }`.
//!
//! Decode is deliberately permissive — unknown header fields are ignored, a
//! missing `requestId` maps to the all-zeros sentinel, and unrecognized
//! purposes survive as `Purpose::Custom` so they can reach the fallback
//! channel instead of being dropped.

use crate::error::{CoreError, CoreResult};
use crate::purpose::Purpose;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Purpose-dependent optional header fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtraHeaders {
    #[serde(rename = "eventName", default, skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,

    #[serde(rename = "dataType", default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,

    /// The `type` discriminator on data responses (0 for catalog payloads).
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Value>,

    #[serde(rename = "actionName", default, skip_serializing_if = "Option::is_none")]
    pub action_name: Option<String>,
}

impl ExtraHeaders {
    pub fn is_empty(&self) -> bool {
        self == &ExtraHeaders::default()
    }
}

/// One decoded protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Raw protocol version from the header (kept raw to tolerate versions
    /// newer than this library).
    pub version: u32,
    /// Correlation id; `Uuid::nil()` means "no correlation".
    pub request_id: Uuid,
    pub purpose: Purpose,
    pub extra: ExtraHeaders,
    pub body: Value,
}

#[derive(Serialize, Deserialize)]
struct WireHeader {
    version: u32,
    #[serde(rename = "requestId", default = "Uuid::nil")]
    request_id: Uuid,
    #[serde(rename = "messagePurpose")]
    purpose: String,
    #[serde(flatten)]
    extra: ExtraHeaders,
}

#[derive(Serialize, Deserialize)]
struct WireFrame {
    header: WireHeader,
    #[serde(default)]
    body: Value,
}

impl Frame {
    /// A command-style frame with a fresh v4 `requestId`.
    pub fn request(version: u32, purpose: Purpose, body: Value) -> Frame {
        Frame {
            version,
            request_id: Uuid::new_v4(),
            purpose,
            extra: ExtraHeaders::default(),
            body,
        }
    }

    /// A frame with the sentinel (all-zeros) `requestId`.
    pub fn bare(version: u32, purpose: Purpose, body: Value) -> Frame {
        Frame {
            version,
            request_id: Uuid::nil(),
            purpose,
            extra: ExtraHeaders::default(),
            body,
        }
    }

    /// A response echoing the given request id.
    pub fn response(version: u32, purpose: Purpose, request_id: Uuid, body: Value) -> Frame {
        Frame {
            version,
            request_id,
            purpose,
            extra: ExtraHeaders::default(),
            body,
        }
    }

    pub fn with_request_id(mut self, id: Uuid) -> Frame {
        self.request_id = id;
        self
    }

    pub fn with_event_name(mut self, name: impl Into<String>) -> Frame {
        self.extra.event_name = Some(name.into());
        self
    }

    pub fn with_data_type(mut self, data_type: impl Into<String>, kind: i64) -> Frame {
        self.extra.data_type = Some(data_type.into());
        self.extra.kind = Some(kind);
        self
    }

    pub fn with_agent_action(mut self, action: Value, action_name: impl Into<String>) -> Frame {
        self.extra.action = Some(action);
        self.extra.action_name = Some(action_name.into());
        self
    }

    /// The event name for `event`/`chat` frames: header first, then body,
    /// else the empty string.
    pub fn event_name(&self) -> &str {
        if let Some(name) = self.extra.event_name.as_deref() {
            return name;
        }
        self.body
            .get("eventName")
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    /// Encode to compact JSON text.
    pub fn encode(&self) -> CoreResult<String> {
        let wire = WireFrame {
            header: WireHeader {
                version: self.version,
                request_id: self.request_id,
                purpose: self.purpose.as_str().into_owned(),
                extra: self.extra.clone(),
            },
            body: self.body.clone(),
        };
        Ok(serde_json::to_string(&wire)?)
    }

    /// Decode from JSON text.
    pub fn decode(text: &str) -> CoreResult<Frame> {
        let wire: WireFrame = serde_json::from_str(text)
            .map_err(|e| CoreError::Codec(format!("malformed envelope: {e}")))?;
        Ok(Frame {
            version: wire.header.version,
            request_id: wire.header.request_id,
            purpose: Purpose::parse(&wire.header.purpose),
            extra: wire.header.extra,
            body: wire.body,
        })
    }
}

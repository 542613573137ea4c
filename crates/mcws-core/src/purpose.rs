//! The `messagePurpose` dispatch key.
//!
//! Purposes form a closed set plus two open tails: `data:<name>` bulk
//! requests and a `Custom` fallback for anything this library does not
//! recognize (delivered unmodified to the fallback channel).

use std::borrow::Cow;
use std::fmt;

/// Every purpose a frame can carry, request and response side.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Purpose {
    CommandRequest,
    CommandResponse,
    Error,
    Event,
    Subscribe,
    Unsubscribe,
    AgentAction,
    ChatSubscribe,
    ChatUnsubscribe,
    Chat,
    Encrypt,
    /// `data:<name>` bulk catalog request (block, item, mob, or arbitrary).
    DataRequest(String),
    /// The `data` response purpose.
    Data,
    /// Anything else; preserved verbatim.
    Custom(String),
}

impl Purpose {
    /// Bulk request purpose for one of the known catalog kinds.
    pub fn data_request(kind: impl Into<String>) -> Purpose {
        Purpose::DataRequest(kind.into())
    }

    pub fn as_str(&self) -> Cow<'_, str> {
        use Purpose::*;
        Cow::Borrowed(match self {
            CommandRequest => "commandRequest",
            CommandResponse => "commandResponse",
            Error => "error",
            Event => "event",
            Subscribe => "subscribe",
            Unsubscribe => "unsubscribe",
            AgentAction => "action:agent",
            ChatSubscribe => "chat:subscribe",
            ChatUnsubscribe => "chat:unsubscribe",
            Chat => "chat",
            Encrypt => "ws:encrypt",
            Data => "data",
            DataRequest(name) => return Cow::Owned(format!("data:{name}")),
            Custom(name) => name.as_str(),
        })
    }

    /// Parse a wire purpose. Infallible: unknown strings become `Custom`.
    pub fn parse(s: &str) -> Purpose {
        use Purpose::*;
        match s {
            "commandRequest" => CommandRequest,
            "commandResponse" => CommandResponse,
            "error" => Error,
            "event" => Event,
            "subscribe" => Subscribe,
            "unsubscribe" => Unsubscribe,
            "action:agent" => AgentAction,
            "chat:subscribe" => ChatSubscribe,
            "chat:unsubscribe" => ChatUnsubscribe,
            "chat" => Chat,
            "ws:encrypt" => Encrypt,
            "data" => Data,
            _ => match s.strip_prefix("data:") {
                Some(name) => DataRequest(name.to_string()),
                None => Custom(s.to_string()),
            },
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

impl From<&str> for Purpose {
    fn from(s: &str) -> Purpose {
        Purpose::parse(s)
    }
}

/// The three catalog kinds the game is known to answer.
pub mod data_kind {
    pub const BLOCK: &str = "block";
    pub const ITEM: &str = "item";
    pub const MOB: &str = "mob";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_known() {
        for s in [
            "commandRequest",
            "commandResponse",
            "error",
            "event",
            "subscribe",
            "unsubscribe",
            "action:agent",
            "chat:subscribe",
            "chat:unsubscribe",
            "chat",
            "ws:encrypt",
            "data",
        ] {
            assert_eq!(Purpose::parse(s).as_str(), s);
        }
    }

    #[test]
    fn data_request_tail() {
        assert_eq!(
            Purpose::parse("data:block"),
            Purpose::DataRequest("block".into())
        );
        assert_eq!(Purpose::data_request("mob").as_str(), "data:mob");
    }

    #[test]
    fn unknown_is_custom() {
        let p = Purpose::parse("somethingNew");
        assert_eq!(p, Purpose::Custom("somethingNew".into()));
        assert_eq!(p.as_str(), "somethingNew");
    }
}

//! WebSocket upgrade with the game's key relaxation.
//!
//! The listener performs its own HTTP/1.1 upgrade instead of delegating to
//! a strict implementation, because pre-1.2 game builds send an
//! 11-character base64 `Sec-WebSocket-Key` (plus one `=`) rather than the
//! RFC 6455 16-byte form. The accept key is always computed over the
//! client's original key string, short or not. The upgrade also requires
//! the `com.microsoft.minecraft.wsencrypt` subprotocol.

use crate::error::ServerError;
use base64::{engine::general_purpose, Engine as _};
use mcws_core::SUBPROTOCOL;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const MAX_REQUEST_BYTES: usize = 8 * 1024;

/// Parsed fields of an accepted upgrade request.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    pub path: String,
    pub key: String,
    pub protocols: Vec<String>,
}

/// RFC 6455 accept key, computed over the client's key verbatim.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    general_purpose::STANDARD.encode(hasher.finalize())
}

/// A standard key decodes to exactly 16 bytes.
fn is_standard_key(key: &str) -> bool {
    general_purpose::STANDARD
        .decode(key)
        .map(|bytes| bytes.len() == 16)
        .unwrap_or(false)
}

/// The non-standard short form old game builds send: eleven base64
/// characters and a trailing `=`.
fn is_legacy_short_key(key: &str) -> bool {
    let bytes = key.as_bytes();
    bytes.len() == 12
        && bytes[11] == b'='
        && bytes[..11]
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || *b == b'+' || *b == b'/')
}

pub fn is_acceptable_key(key: &str) -> bool {
    is_standard_key(key) || is_legacy_short_key(key)
}

/// Parse and validate the upgrade request text (everything up to the blank
/// line).
fn parse_upgrade(text: &str) -> Result<UpgradeRequest, String> {
    let mut lines = text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let path = parts.next().unwrap_or_default();
    if method != "GET" {
        return Err(format!("unsupported method {method}"));
    }

    let mut upgrade = None;
    let mut key = None;
    let mut version = None;
    let mut protocols = Vec::new();
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "upgrade" => upgrade = Some(value.to_ascii_lowercase()),
            "sec-websocket-key" => key = Some(value.to_string()),
            "sec-websocket-version" => version = Some(value.to_string()),
            "sec-websocket-protocol" => {
                protocols.extend(value.split(',').map(|p| p.trim().to_string()));
            }
            _ => {}
        }
    }

    if upgrade.as_deref() != Some("websocket") {
        return Err("missing Upgrade: websocket".into());
    }
    if version.as_deref() != Some("13") {
        return Err(format!(
            "unsupported websocket version {}",
            version.as_deref().unwrap_or("<none>")
        ));
    }
    let key = key.ok_or("missing Sec-WebSocket-Key")?;
    if !is_acceptable_key(&key) {
        return Err("malformed Sec-WebSocket-Key".into());
    }
    if !protocols.iter().any(|p| p == SUBPROTOCOL) {
        return Err(format!("subprotocol {SUBPROTOCOL} not offered"));
    }

    Ok(UpgradeRequest {
        path: path.to_string(),
        key,
        protocols,
    })
}

/// Perform the upgrade on a fresh TCP connection. On success the stream is
/// positioned at the first WebSocket frame.
pub async fn upgrade(stream: &mut TcpStream) -> Result<UpgradeRequest, ServerError> {
    let mut buf = Vec::with_capacity(1024);
    let header_end = loop {
        let mut chunk = [0u8; 512];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ServerError::Handshake(
                "connection closed mid-handshake".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_REQUEST_BYTES {
            return Err(ServerError::Handshake("upgrade request too large".into()));
        }
    };

    let text = std::str::from_utf8(&buf[..header_end])
        .map_err(|_| ServerError::Handshake("request is not utf-8".into()))?;
    let request = match parse_upgrade(text) {
        Ok(request) => request,
        Err(reason) => {
            let _ = stream
                .write_all(b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n")
                .await;
            return Err(ServerError::Handshake(reason));
        }
    };

    debug!(path = %request.path, key = %request.key, "accepting websocket upgrade");
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         Sec-WebSocket-Protocol: {}\r\n\r\n",
        accept_key(&request.key),
        SUBPROTOCOL,
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(request)
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc_sample_accept_key() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn standard_key_accepted() {
        assert!(is_acceptable_key("dGhlIHNhbXBsZSBub25jZQ=="));
    }

    #[test]
    fn legacy_short_key_accepted() {
        assert!(is_acceptable_key("0123456789a="));
        assert!(is_acceptable_key("abcDEF+/123="));
    }

    #[test]
    fn bad_keys_rejected() {
        assert!(!is_acceptable_key(""));
        assert!(!is_acceptable_key("tooshort="));
        assert!(!is_acceptable_key("0123456789ab"));
        assert!(!is_acceptable_key("with space a="));
        assert!(!is_acceptable_key("not base64 at all"));
    }

    fn request(key: &str, protocol: &str) -> String {
        format!(
            "GET /ws HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\n\
             Connection: Upgrade\r\nSec-WebSocket-Key: {key}\r\n\
             Sec-WebSocket-Version: 13\r\nSec-WebSocket-Protocol: {protocol}\r\n"
        )
    }

    #[test]
    fn parse_accepts_short_key() {
        let req = parse_upgrade(&request("0123456789a=", SUBPROTOCOL)).unwrap();
        assert_eq!(req.key, "0123456789a=");
        assert_eq!(req.path, "/ws");
        assert_eq!(req.protocols, vec![SUBPROTOCOL.to_string()]);
    }

    #[test]
    fn parse_requires_subprotocol() {
        let err = parse_upgrade(&request("dGhlIHNhbXBsZSBub25jZQ==", "something.else"))
            .unwrap_err();
        assert!(err.contains("subprotocol"));
    }

    #[test]
    fn parse_accepts_protocol_list() {
        let protocols = format!("first.choice, {SUBPROTOCOL}");
        let req = parse_upgrade(&request("dGhlIHNhbXBsZSBub25jZQ==", &protocols)).unwrap();
        assert_eq!(req.protocols.len(), 2);
    }

    #[test]
    fn parse_rejects_non_get() {
        let text = "POST / HTTP/1.1\r\nUpgrade: websocket\r\n";
        assert!(parse_upgrade(text).is_err());
    }
}

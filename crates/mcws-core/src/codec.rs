//! Encrypt-aware wire codec.
//!
//! Sits between the frame envelope and the transport. Owns the session's
//! encryption tri-state: plaintext, key exchange in flight, or active
//! ciphers. The state only moves forward — a session that has negotiated
//! (or even merely attempted) encryption never returns to plaintext.

use crate::crypto::{self, CipherPair, EncryptionMode, KeyExchange, KeyExchangeOffer};
use crate::error::{CoreError, CoreResult};
use crate::frame::Frame;
use crate::transport::WireMessage;

enum EncryptionState {
    Plain,
    /// Exchange in flight. The inner option is taken on completion; a
    /// failed completion leaves `None` behind, which keeps further
    /// handshake attempts rejected.
    Negotiating(Option<KeyExchange>),
    Encrypted(CipherPair),
}

/// Frame ⇄ wire-message codec with the encryption state machine.
pub struct WireCodec {
    state: EncryptionState,
    /// Latched the first time a post-activation inbound payload is not
    /// printable JSON. Activation timing races across the handshake
    /// boundary, so the peer may still deliver a trailing plaintext frame.
    saw_ciphertext: bool,
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl WireCodec {
    pub fn new() -> WireCodec {
        WireCodec {
            state: EncryptionState::Plain,
            saw_ciphertext: false,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.state, EncryptionState::Encrypted(_))
    }

    /// Whether a handshake has been started (or finished); a second one
    /// must not be attempted.
    pub fn encryption_engaged(&self) -> bool {
        !matches!(self.state, EncryptionState::Plain)
    }

    /// Initiator side: generate the keypair and salt for the request frame.
    pub fn begin_key_exchange(&mut self, mode: EncryptionMode) -> CoreResult<KeyExchangeOffer> {
        match self.state {
            EncryptionState::Plain => {}
            EncryptionState::Negotiating(_) => return Err(CoreError::EncryptionPending),
            EncryptionState::Encrypted(_) => return Err(CoreError::EncryptionActive),
        }
        let exchange = KeyExchange::initiate(mode)?;
        let offer = exchange.offer();
        self.state = EncryptionState::Negotiating(Some(exchange));
        Ok(offer)
    }

    /// Initiator side: consume the peer's response and activate.
    pub fn complete_key_exchange(&mut self, peer_public_b64: &str) -> CoreResult<()> {
        let exchange = match &mut self.state {
            EncryptionState::Negotiating(slot) => {
                slot.take().ok_or(CoreError::EncryptionPending)?
            }
            EncryptionState::Encrypted(_) => return Err(CoreError::EncryptionActive),
            EncryptionState::Plain => {
                return Err(CoreError::Crypto("no key exchange in flight".into()))
            }
        };
        let pair = exchange.complete(peer_public_b64)?;
        self.state = EncryptionState::Encrypted(pair);
        Ok(())
    }

    /// Responder side: derive ciphers from the peer's offer. The returned
    /// pair is installed with [`WireCodec::activate`] only after the
    /// response frame has been sent, so the response itself stays
    /// plaintext.
    pub fn respond_key_exchange(
        &mut self,
        mode: EncryptionMode,
        peer_public_b64: &str,
        salt_b64: &str,
    ) -> CoreResult<(String, CipherPair)> {
        match self.state {
            EncryptionState::Plain => {}
            EncryptionState::Negotiating(_) => return Err(CoreError::EncryptionPending),
            EncryptionState::Encrypted(_) => return Err(CoreError::EncryptionActive),
        }
        self.state = EncryptionState::Negotiating(None);
        let (public_key, pair) = crypto::respond(mode, peer_public_b64, salt_b64)?;
        Ok((public_key, pair))
    }

    pub fn activate(&mut self, pair: CipherPair) {
        self.state = EncryptionState::Encrypted(pair);
    }

    /// Encode a frame for the wire, encrypting when active.
    pub fn encode(&mut self, frame: &Frame) -> CoreResult<WireMessage> {
        let text = frame.encode()?;
        match &mut self.state {
            EncryptionState::Encrypted(pair) => {
                let mut bytes = text.into_bytes();
                pair.encrypt(&mut bytes);
                Ok(WireMessage::Binary(bytes))
            }
            _ => Ok(WireMessage::Text(text)),
        }
    }

    /// Decode one wire message into a frame, decrypting when active.
    pub fn decode(&mut self, msg: WireMessage) -> CoreResult<Frame> {
        let mut bytes = msg
            .into_bytes()
            .ok_or_else(|| CoreError::Codec("close signal is not a frame".into()))?;
        if let EncryptionState::Encrypted(pair) = &mut self.state {
            if self.saw_ciphertext || !looks_like_plaintext(&bytes) {
                self.saw_ciphertext = true;
                pair.decrypt(&mut bytes);
            }
        }
        let text = std::str::from_utf8(&bytes)
            .map_err(|e| CoreError::Codec(format!("frame is not utf-8: {e}")))?;
        Frame::decode(text)
    }
}

/// Every plaintext frame starts with an opening brace; anything else is
/// ciphertext.
fn looks_like_plaintext(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'{')
}

//! ECDH key exchange and the AES-256-CFB session ciphers.
//!
//! Key agreement runs over secp384r1 with ephemeral keypairs; public keys
//! travel base64-encoded in SubjectPublicKeyInfo DER form. The session key
//! is `SHA-256(salt ‖ shared_secret)`; its first 16 bytes double as the IV.
//! Each direction owns an independent stateful cipher context so encrypt
//! and decrypt advance with their own byte counts.

use crate::error::{CoreError, CoreResult};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes256;
use base64::{engine::general_purpose, Engine as _};
use p384::ecdh::EphemeralSecret;
use p384::pkcs8::{DecodePublicKey, EncodePublicKey};
use p384::PublicKey;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::fmt;

/// Length of the server-chosen salt.
pub const SALT_LEN: usize = 16;

/// Cipher modes the handshake can negotiate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EncryptionMode {
    /// AES-256-CFB with 8-bit feedback (`cfb8` on the wire).
    #[default]
    Cfb8,
    /// AES-256-CFB with full-block feedback (`cfb`, alias `cfb128`).
    Cfb,
}

impl EncryptionMode {
    pub fn wire_name(self) -> &'static str {
        match self {
            EncryptionMode::Cfb8 => "cfb8",
            EncryptionMode::Cfb => "cfb",
        }
    }

    pub fn parse(s: &str) -> Option<EncryptionMode> {
        match s {
            "cfb8" => Some(EncryptionMode::Cfb8),
            "cfb" | "cfb128" => Some(EncryptionMode::Cfb),
            _ => None,
        }
    }
}

impl fmt::Display for EncryptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

type Cfb8Enc = cfb8::Encryptor<Aes256>;
type Cfb8Dec = cfb8::Decryptor<Aes256>;
type CfbEnc = cfb_mode::BufEncryptor<Aes256>;
type CfbDec = cfb_mode::BufDecryptor<Aes256>;

enum EncryptDir {
    Cfb8(Box<Cfb8Enc>),
    Cfb(Box<CfbEnc>),
}

enum DecryptDir {
    Cfb8(Box<Cfb8Dec>),
    Cfb(Box<CfbDec>),
}

/// Paired stateful cipher contexts for one session, keyed identically but
/// advancing independently per direction.
pub struct CipherPair {
    enc: EncryptDir,
    dec: DecryptDir,
}

impl fmt::Debug for CipherPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherPair").finish_non_exhaustive()
    }
}

impl CipherPair {
    pub fn new(mode: EncryptionMode, key: &[u8; 32], iv: &[u8; 16]) -> CipherPair {
        match mode {
            EncryptionMode::Cfb8 => CipherPair {
                enc: EncryptDir::Cfb8(Box::new(Cfb8Enc::new(key.into(), iv.into()))),
                dec: DecryptDir::Cfb8(Box::new(Cfb8Dec::new(key.into(), iv.into()))),
            },
            EncryptionMode::Cfb => CipherPair {
                enc: EncryptDir::Cfb(Box::new(CfbEnc::new(key.into(), iv.into()))),
                dec: DecryptDir::Cfb(Box::new(CfbDec::new(key.into(), iv.into()))),
            },
        }
    }

    /// Encrypt outbound bytes in place.
    pub fn encrypt(&mut self, data: &mut [u8]) {
        match &mut self.enc {
            EncryptDir::Cfb8(enc) => {
                for byte in data.iter_mut() {
                    enc.encrypt_block_mut(GenericArray::from_mut_slice(std::slice::from_mut(byte)));
                }
            }
            EncryptDir::Cfb(enc) => enc.encrypt(data),
        }
    }

    /// Decrypt inbound bytes in place.
    pub fn decrypt(&mut self, data: &mut [u8]) {
        match &mut self.dec {
            DecryptDir::Cfb8(dec) => {
                for byte in data.iter_mut() {
                    dec.decrypt_block_mut(GenericArray::from_mut_slice(std::slice::from_mut(byte)));
                }
            }
            DecryptDir::Cfb(dec) => dec.decrypt(data),
        }
    }
}

/// One side's in-flight key exchange (initiator side).
pub struct KeyExchange {
    secret: EphemeralSecret,
    public_key_b64: String,
    salt: [u8; SALT_LEN],
    mode: EncryptionMode,
}

impl fmt::Debug for KeyExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyExchange")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

/// The public half of an initiated exchange, ready to go on the wire.
#[derive(Debug, Clone)]
pub struct KeyExchangeOffer {
    pub mode: EncryptionMode,
    /// Base64 of the initiator's public key in SPKI DER form.
    pub public_key: String,
    /// Base64 of the 16-byte salt.
    pub salt: String,
}

impl KeyExchange {
    /// Generate an ephemeral keypair and a fresh salt.
    pub fn initiate(mode: EncryptionMode) -> CoreResult<KeyExchange> {
        let mut rng = rand::thread_rng();
        let secret = EphemeralSecret::random(&mut rng);
        let public_key_b64 = encode_public_key(&secret.public_key())?;
        let mut salt = [0u8; SALT_LEN];
        rng.fill(&mut salt[..]);
        Ok(KeyExchange {
            secret,
            public_key_b64,
            salt,
            mode,
        })
    }

    pub fn mode(&self) -> EncryptionMode {
        self.mode
    }

    pub fn offer(&self) -> KeyExchangeOffer {
        KeyExchangeOffer {
            mode: self.mode,
            public_key: self.public_key_b64.clone(),
            salt: general_purpose::STANDARD.encode(self.salt),
        }
    }

    /// Finish the exchange with the responder's public key.
    pub fn complete(self, peer_public_b64: &str) -> CoreResult<CipherPair> {
        let peer = decode_public_key(peer_public_b64)?;
        let shared = self.secret.diffie_hellman(&peer);
        let (key, iv) = derive_key(&self.salt, shared.raw_secret_bytes());
        Ok(CipherPair::new(self.mode, &key, &iv))
    }
}

/// Responder side: derive the session ciphers from the initiator's public
/// key and salt, returning our own public key for the response frame.
pub fn respond(
    mode: EncryptionMode,
    peer_public_b64: &str,
    salt_b64: &str,
) -> CoreResult<(String, CipherPair)> {
    let peer = decode_public_key(peer_public_b64)?;
    let salt = general_purpose::STANDARD
        .decode(salt_b64)
        .map_err(|e| CoreError::Crypto(format!("invalid salt: {e}")))?;
    let secret = EphemeralSecret::random(&mut rand::thread_rng());
    let public_key_b64 = encode_public_key(&secret.public_key())?;
    let shared = secret.diffie_hellman(&peer);
    let (key, iv) = derive_key(&salt, shared.raw_secret_bytes());
    Ok((public_key_b64, CipherPair::new(mode, &key, &iv)))
}

/// `K = SHA-256(salt ‖ shared_secret)`; IV is the first 16 bytes of K.
fn derive_key(salt: &[u8], shared: &[u8]) -> ([u8; 32], [u8; 16]) {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(shared);
    let digest = hasher.finalize();
    let mut key = [0u8; 32];
    key.copy_from_slice(&digest);
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&digest[..16]);
    (key, iv)
}

fn encode_public_key(public: &PublicKey) -> CoreResult<String> {
    let der = public
        .to_public_key_der()
        .map_err(|e| CoreError::Crypto(format!("public key encode: {e}")))?;
    Ok(general_purpose::STANDARD.encode(der.as_bytes()))
}

fn decode_public_key(b64: &str) -> CoreResult<PublicKey> {
    let der = general_purpose::STANDARD
        .decode(b64)
        .map_err(|e| CoreError::Crypto(format!("invalid public key base64: {e}")))?;
    PublicKey::from_public_key_der(&der)
        .map_err(|e| CoreError::Crypto(format!("invalid public key: {e}")))
}

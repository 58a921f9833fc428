//! Identity and message cryptography shared by the relay and the SDK.
//!
//! Identities are Ed25519 keypairs; public keys travel as base64-encoded SPKI
//! DER. Pairwise message keys come from X25519 ECDH over the converted
//! Ed25519 keys, stretched with HKDF-SHA-256 and used with AES-256-GCM.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use ed25519_dalek::pkcs8::{DecodePublicKey, EncodePublicKey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256, Sha512};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::sdk::error::SdkError;

/// Protocol label prefixed to the HKDF info string.
const KDF_PROTOCOL: &str = "cc4me-v1";

pub const NONCE_LEN: usize = 12;
pub const SHARED_KEY_LEN: usize = 32;

pub fn generate_keypair() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// Base64-encoded SPKI DER of an Ed25519 public key, the wire form every
/// relay row and envelope field uses.
pub fn spki_der_b64(key: &VerifyingKey) -> String {
    let der = key
        .to_public_key_der()
        .expect("Ed25519 SPKI encoding is infallible");
    B64.encode(der.as_bytes())
}

pub fn verifying_key_from_spki_b64(encoded: &str) -> Result<VerifyingKey, SdkError> {
    let der = B64
        .decode(encoded)
        .map_err(|_| SdkError::InvalidKey("public key is not valid base64".into()))?;
    VerifyingKey::from_public_key_der(&der)
        .map_err(|_| SdkError::InvalidKey("public key is not Ed25519 SPKI DER".into()))
}

pub fn sign_detached(key: &SigningKey, message: &[u8]) -> String {
    B64.encode(key.sign(message).to_bytes())
}

pub fn verify_detached(key: &VerifyingKey, message: &[u8], signature_b64: &str) -> bool {
    let Ok(bytes) = B64.decode(signature_b64) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(&bytes) else {
        return false;
    };
    key.verify(message, &sig).is_ok()
}

/// Montgomery u-coordinate of an Ed25519 public key (birational map).
pub fn x25519_public(key: &VerifyingKey) -> X25519Public {
    X25519Public::from(key.to_montgomery().to_bytes())
}

/// X25519 scalar for an Ed25519 signing key: SHA-512 of the 32-byte seed,
/// low 32 bytes, RFC 7748 clamping.
pub fn x25519_secret(key: &SigningKey) -> StaticSecret {
    let digest = Sha512::digest(key.to_bytes());
    let mut scalar = [0u8; 32];
    scalar.copy_from_slice(&digest[..32]);
    scalar[0] &= 0xF8;
    scalar[31] &= 0x7F;
    scalar[31] |= 0x40;
    StaticSecret::from(scalar)
}

/// Pairwise message key. The HKDF info string orders the two agent names
/// lexicographically so both peers derive the same key regardless of which
/// side runs the derivation.
pub fn derive_shared_key(
    local: &SigningKey,
    peer: &VerifyingKey,
    local_name: &str,
    peer_name: &str,
) -> [u8; SHARED_KEY_LEN] {
    let shared = x25519_secret(local).diffie_hellman(&x25519_public(peer));
    let (lo, hi) = if local_name <= peer_name {
        (local_name, peer_name)
    } else {
        (peer_name, local_name)
    };
    let info = format!("{KDF_PROTOCOL}|{lo}|{hi}");
    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut okm = [0u8; SHARED_KEY_LEN];
    hk.expand(info.as_bytes(), &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    okm
}

/// AES-256-GCM with the message id as AAD. Output is base64 of
/// `ciphertext || 16-byte tag` plus the base64 nonce.
pub fn encrypt(
    key: &[u8; SHARED_KEY_LEN],
    message_id: &str,
    plaintext: &[u8],
) -> Result<(String, String), SdkError> {
    let cipher = Aes256Gcm::new(key.into());
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: message_id.as_bytes(),
            },
        )
        .map_err(|_| SdkError::EncryptionFailed)?;
    Ok((B64.encode(ciphertext), B64.encode(nonce_bytes)))
}

/// Any tag failure (wrong key, wrong AAD, tampered ciphertext) is a hard
/// `DecryptionFailed`.
pub fn decrypt(
    key: &[u8; SHARED_KEY_LEN],
    message_id: &str,
    ciphertext_b64: &str,
    nonce_b64: &str,
) -> Result<Vec<u8>, SdkError> {
    let ciphertext = B64
        .decode(ciphertext_b64)
        .map_err(|_| SdkError::DecryptionFailed)?;
    let nonce_bytes = B64.decode(nonce_b64).map_err(|_| SdkError::DecryptionFailed)?;
    if nonce_bytes.len() != NONCE_LEN {
        return Err(SdkError::DecryptionFailed);
    }
    let cipher = Aes256Gcm::new(key.into());
    cipher
        .decrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: ciphertext.as_slice(),
                aad: message_id.as_bytes(),
            },
        )
        .map_err(|_| SdkError::DecryptionFailed)
}

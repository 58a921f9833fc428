use chrono::{DateTime, Utc};
use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::sdk::error::SdkError;

pub const ENVELOPE_VERSION: &str = "2.0";

/// Envelopes older or newer than this are rejected on receive.
pub const TIMESTAMP_WINDOW_MS: i64 = 300_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub ciphertext: String,
    pub nonce: String,
}

/// The signed, encrypted wire message POSTed directly between agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub version: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub message_id: String,
    pub sender: String,
    pub recipient: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub timestamp: String,
    pub payload: EncryptedPayload,
    pub signature: String,
}

impl Envelope {
    /// Canonical signing bytes: JSON of every field except `signature`.
    /// serde_json's default map is ordered, so the encoding is bit-stable
    /// across sender and receiver.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut value = serde_json::to_value(self).expect("envelope always serializes");
        if let serde_json::Value::Object(map) = &mut value {
            map.remove("signature");
        }
        serde_json::to_vec(&value).expect("envelope always serializes")
    }

    pub fn sign(&mut self, key: &SigningKey) {
        self.signature = crypto::sign_detached(key, &self.signing_bytes());
    }

    pub fn verify_signature(&self, key: &VerifyingKey) -> bool {
        crypto::verify_detached(key, &self.signing_bytes(), &self.signature)
    }

    pub fn timestamp_in_window(&self, now: DateTime<Utc>) -> bool {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .map(|t| (now - t.with_timezone(&Utc)).num_milliseconds().abs() <= TIMESTAMP_WINDOW_MS)
            .unwrap_or(false)
    }
}

/// Encrypt `plaintext` for one recipient and produce the signed envelope.
/// Group messages reuse the same message id across recipients but get a
/// fresh nonce and recipient-specific ciphertext here each call.
#[allow(clippy::too_many_arguments)]
pub fn seal(
    kind: &str,
    message_id: &str,
    sender: &str,
    recipient: &str,
    group_id: Option<&str>,
    shared_key: &[u8; crypto::SHARED_KEY_LEN],
    plaintext: &serde_json::Value,
    signing_key: &SigningKey,
) -> Result<Envelope, SdkError> {
    let bytes = serde_json::to_vec(plaintext)
        .map_err(|e| SdkError::InvalidEnvelope(format!("payload does not serialize: {e}")))?;
    let (ciphertext, nonce) = crypto::encrypt(shared_key, message_id, &bytes)?;

    let mut envelope = Envelope {
        version: ENVELOPE_VERSION.to_string(),
        kind: kind.to_string(),
        message_id: message_id.to_string(),
        sender: sender.to_string(),
        recipient: recipient.to_string(),
        group_id: group_id.map(String::from),
        timestamp: Utc::now().to_rfc3339(),
        payload: EncryptedPayload { ciphertext, nonce },
        signature: String::new(),
    };
    envelope.sign(signing_key);
    Ok(envelope)
}

/// Decrypt the payload. Signature and window checks are the caller's job;
/// any AEAD failure here is terminal.
pub fn open(
    envelope: &Envelope,
    shared_key: &[u8; crypto::SHARED_KEY_LEN],
) -> Result<serde_json::Value, SdkError> {
    let bytes = crypto::decrypt(
        shared_key,
        &envelope.message_id,
        &envelope.payload.ciphertext,
        &envelope.payload.nonce,
    )?;
    serde_json::from_slice(&bytes).map_err(|_| SdkError::DecryptionFailed)
}

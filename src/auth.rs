//! Request authentication: detached Ed25519 over a canonical signing string,
//! bounded by a 5-minute replay window. No nonce store.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use chrono::{DateTime, Utc};
use rocket::http::Status;
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};

use crate::crypto;

/// Maximum clock skew between `X-Timestamp` and the relay clock.
pub const MAX_SKEW_MS: i64 = 300_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    MalformedAuth,
    UnknownAgent,
    Revoked,
    Pending,
    TimestampExpired,
    InvalidSignature,
    Internal,
}

impl AuthError {
    pub fn status(self) -> Status {
        match self {
            AuthError::Revoked | AuthError::Pending => Status::Forbidden,
            AuthError::Internal => Status::InternalServerError,
            _ => Status::Unauthorized,
        }
    }

    pub fn kind(self) -> &'static str {
        match self {
            AuthError::MalformedAuth => "MalformedAuth",
            AuthError::UnknownAgent => "UnknownAgent",
            AuthError::Revoked => "Revoked",
            AuthError::Pending => "Pending",
            AuthError::TimestampExpired => "TimestampExpired",
            AuthError::InvalidSignature => "InvalidSignature",
            AuthError::Internal => "Internal",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            AuthError::MalformedAuth => "Malformed Authorization header",
            AuthError::UnknownAgent => "Unknown agent",
            AuthError::Revoked => "Agent is revoked",
            AuthError::Pending => "Agent is pending approval",
            AuthError::TimestampExpired => "Timestamp outside the allowed window",
            AuthError::InvalidSignature => "Signature verification failed",
            AuthError::Internal => "Internal error",
        }
    }
}

/// `^[A-Za-z0-9_-]{1,64}$`
pub fn valid_agent_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

pub fn body_sha256_hex(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// Hash used for bodyless (GET/DELETE) requests.
pub fn empty_body_hash() -> String {
    body_sha256_hex(b"")
}

/// `<METHOD> <PATH>\n<ISO-8601 timestamp>\n<lowercase hex SHA-256 of body>`
pub fn canonical_string(method: &str, path: &str, timestamp: &str, body_hash_hex: &str) -> String {
    format!("{method} {path}\n{timestamp}\n{body_hash_hex}")
}

/// `Signature <agent_name>:<base64_signature>`, split on the first colon.
pub fn parse_auth_header(header: &str) -> Result<(String, Vec<u8>), AuthError> {
    let rest = header
        .strip_prefix("Signature ")
        .ok_or(AuthError::MalformedAuth)?;
    let (name, sig) = rest.split_once(':').ok_or(AuthError::MalformedAuth)?;
    if !valid_agent_name(name) || sig.is_empty() {
        return Err(AuthError::MalformedAuth);
    }
    let sig_bytes = B64.decode(sig).map_err(|_| AuthError::MalformedAuth)?;
    Ok((name.to_string(), sig_bytes))
}

/// Full verification procedure. Returns the authenticated agent name.
pub fn authenticate(
    conn: &Connection,
    method: &str,
    path: &str,
    timestamp: &str,
    auth_header: &str,
    body_hash_hex: &str,
    now: DateTime<Utc>,
) -> Result<String, AuthError> {
    let (name, sig_bytes) = parse_auth_header(auth_header)?;

    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT public_key, status FROM agents WHERE name = ?1",
            params![&name],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|_| AuthError::Internal)?;
    let (public_key, status) = row.ok_or(AuthError::UnknownAgent)?;

    match status.as_str() {
        "revoked" => return Err(AuthError::Revoked),
        "pending" => return Err(AuthError::Pending),
        _ => {}
    }

    let ts = DateTime::parse_from_rfc3339(timestamp)
        .map_err(|_| AuthError::TimestampExpired)?
        .with_timezone(&Utc);
    if (now - ts).num_milliseconds().abs() > MAX_SKEW_MS {
        return Err(AuthError::TimestampExpired);
    }

    let key =
        crypto::verifying_key_from_spki_b64(&public_key).map_err(|_| AuthError::InvalidSignature)?;
    let sig =
        ed25519_dalek::Signature::from_slice(&sig_bytes).map_err(|_| AuthError::InvalidSignature)?;
    let signing_string = canonical_string(method, path, timestamp, body_hash_hex);
    use ed25519_dalek::Verifier;
    key.verify(signing_string.as_bytes(), &sig)
        .map_err(|_| AuthError::InvalidSignature)?;

    Ok(name)
}

/// Build the `Authorization` header value the SDK sends.
pub fn format_auth_header(name: &str, signature_b64: &str) -> String {
    format!("Signature {name}:{signature_b64}")
}

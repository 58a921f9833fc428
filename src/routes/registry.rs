use crate::auth::valid_agent_name;
use crate::crypto;
use crate::db::Db;
use crate::error::ApiError;
use crate::models::*;
use crate::routes::{AuthHeaders, SignedJson};
use rocket::serde::json::Json;
use rocket::{State, get, post};
use rusqlite::{OptionalExtension, params};

use super::verify::is_disposable;

/// Registration is email-gated: the (name, email) pair must have completed
/// verification first. Agents are auto-approved into `active`; the manual
/// approval flow is retired (its routes answer 410 below).
#[post("/registry/agents", format = "json", data = "<body>")]
pub fn register_agent(
    db: &State<Db>,
    body: Json<RegisterAgent>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let name = body.name.trim();
    let email = body.owner_email.trim().to_ascii_lowercase();

    if !valid_agent_name(name) {
        return Err(ApiError::bad_request(
            "InvalidName",
            "Agent name must match ^[A-Za-z0-9_-]{1,64}$",
        ));
    }
    if is_disposable(&email) {
        return Err(ApiError::bad_request(
            "DisposableEmail",
            "Disposable email domains are not accepted",
        ));
    }
    if crypto::verifying_key_from_spki_b64(&body.public_key).is_err() {
        return Err(ApiError::bad_request(
            "InvalidRequest",
            "publicKey must be base64 SPKI DER of an Ed25519 key",
        ));
    }

    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());

    let verified: Option<i64> = conn
        .query_row(
            "SELECT verified FROM email_verifications WHERE agent_name = ?1 AND email = ?2",
            params![name, &email],
            |r| r.get(0),
        )
        .optional()?;
    if verified != Some(1) {
        return Err(ApiError::forbidden(
            "EmailNotVerified",
            "Verify the owner email before registering",
        ));
    }

    let name_taken: Option<String> = conn
        .query_row(
            "SELECT name FROM agents WHERE name = ?1",
            params![name],
            |r| r.get(0),
        )
        .optional()?;
    if name_taken.is_some() {
        return Err(ApiError::duplicate("Agent name already registered"));
    }
    let email_taken: Option<String> = conn
        .query_row(
            "SELECT name FROM agents WHERE owner_email = ?1",
            params![&email],
            |r| r.get(0),
        )
        .optional()?;
    if email_taken.is_some() {
        return Err(ApiError::duplicate("Owner email already registered"));
    }
    let key_taken: Option<String> = conn
        .query_row(
            "SELECT name FROM agents WHERE public_key = ?1",
            params![&body.public_key],
            |r| r.get(0),
        )
        .optional()?;
    if key_taken.is_some() {
        return Err(ApiError::duplicate("Public key already registered"));
    }

    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO agents (name, public_key, owner_email, endpoint, email_verified, status, created_at)
         VALUES (?1, ?2, ?3, ?4, 1, 'active', ?5)",
        params![name, &body.public_key, &email, &body.endpoint, &now],
    )?;

    Ok(Json(serde_json::json!({
        "name": name,
        "status": "active",
        "createdAt": now
    })))
}

#[get("/registry/agents/<name>")]
pub fn lookup_agent(db: &State<Db>, name: &str) -> Result<Json<AgentLookup>, ApiError> {
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    conn.query_row(
        "SELECT name, public_key, status FROM agents WHERE name = ?1",
        params![name],
        |r| {
            Ok(AgentLookup {
                name: r.get(0)?,
                public_key: r.get(1)?,
                status: r.get(2)?,
            })
        },
    )
    .optional()?
    .map(Json)
    .ok_or_else(|| ApiError::not_found("No such agent"))
}

/// The directory is not enumerable.
#[get("/registry/agents")]
pub fn list_agents_gone() -> ApiError {
    ApiError::gone("Agent listing is no longer available")
}

#[post("/registry/agents/<_name>/approve")]
pub fn approve_agent_gone(_name: &str) -> ApiError {
    ApiError::gone("Manual approval was retired; registration is auto-approved")
}

#[post("/registry/agents/<_name>/reject")]
pub fn reject_agent_gone(_name: &str) -> ApiError {
    ApiError::gone("Manual approval was retired; registration is auto-approved")
}

/// Revocation: admin-only. Flips the target and appends the signed
/// `revocation` broadcast in the same transaction.
#[post("/registry/agents/<name>/revoke", format = "json", data = "<body>")]
pub fn revoke_agent(
    db: &State<Db>,
    headers: AuthHeaders,
    name: &str,
    body: SignedJson<RevokeAgent>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let caller = headers.authenticate_with_hash(&conn, &body.body_hash)?;

    let admin_key: Option<String> = conn
        .query_row(
            "SELECT admin_public_key FROM admins WHERE agent = ?1",
            params![&caller],
            |r| r.get(0),
        )
        .optional()?;
    let Some(admin_key) = admin_key else {
        return Err(ApiError::forbidden(
            "Forbidden",
            "Only admins may revoke agents",
        ));
    };

    let target: Option<String> = conn
        .query_row(
            "SELECT status FROM agents WHERE name = ?1",
            params![name],
            |r| r.get(0),
        )
        .optional()?;
    if target.is_none() {
        return Err(ApiError::not_found("No such agent"));
    }

    // The broadcast payload is canonical sorted-key JSON; the admin client
    // signs exactly this string with the admin key.
    let payload =
        serde_json::json!({ "reason": "admin_revocation", "revokedAgent": name }).to_string();
    let key = crypto::verifying_key_from_spki_b64(&admin_key)
        .map_err(|_| ApiError::internal("Stored admin key is unreadable"))?;
    if !crypto::verify_detached(&key, payload.as_bytes(), &body.value.broadcast_signature) {
        return Err(ApiError::forbidden(
            "InvalidSignature",
            "Broadcast signature does not verify against the admin key",
        ));
    }

    let now = chrono::Utc::now().to_rfc3339();
    let broadcast_id = uuid::Uuid::new_v4().to_string();
    let tx = conn.transaction()?;
    tx.execute(
        "UPDATE agents SET status = 'revoked' WHERE name = ?1",
        params![name],
    )?;
    tx.execute(
        "INSERT INTO broadcasts (id, type, payload, sender, signature, created_at)
         VALUES (?1, 'revocation', ?2, ?3, ?4, ?5)",
        params![
            &broadcast_id,
            &payload,
            &caller,
            &body.value.broadcast_signature,
            &now
        ],
    )?;
    tx.commit()?;

    Ok(Json(serde_json::json!({
        "revoked": name,
        "broadcastId": broadcast_id
    })))
}

/// Immediate authenticated key swap. The two-phase pending flow is reserved
/// for email-driven recovery below.
#[post("/registry/agents/<name>/rotate-key", format = "json", data = "<body>")]
pub fn rotate_key(
    db: &State<Db>,
    headers: AuthHeaders,
    name: &str,
    body: SignedJson<RotateKey>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let caller = headers.authenticate_with_hash(&conn, &body.body_hash)?;
    if caller != name {
        return Err(ApiError::forbidden(
            "Forbidden",
            "Agents may only rotate their own key",
        ));
    }

    let new_key = body.value.new_public_key.trim();
    if crypto::verifying_key_from_spki_b64(new_key).is_err() {
        return Err(ApiError::bad_request(
            "InvalidRequest",
            "newPublicKey must be base64 SPKI DER of an Ed25519 key",
        ));
    }
    let taken: Option<String> = conn
        .query_row(
            "SELECT name FROM agents WHERE public_key = ?1 AND name != ?2",
            params![new_key, name],
            |r| r.get(0),
        )
        .optional()?;
    if taken.is_some() {
        return Err(ApiError::duplicate("Public key already registered"));
    }

    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE agents SET public_key = ?1, key_updated_at = ?2,
                pending_public_key = NULL, recovery_initiated_at = NULL
         WHERE name = ?3",
        params![new_key, &now, name],
    )?;

    Ok(Json(serde_json::json!({
        "rotated": true,
        "keyUpdatedAt": now
    })))
}

/// Recovery entry point for an agent that lost its key: verified owner email
/// required; records the replacement key as pending. Completion is out of
/// band.
#[post("/registry/agents/<name>/recover", format = "json", data = "<body>")]
pub fn recover_agent(
    db: &State<Db>,
    name: &str,
    body: Json<RecoverAgent>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let email = body.email.trim().to_ascii_lowercase();
    if crypto::verifying_key_from_spki_b64(body.new_public_key.trim()).is_err() {
        return Err(ApiError::bad_request(
            "InvalidRequest",
            "newPublicKey must be base64 SPKI DER of an Ed25519 key",
        ));
    }

    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let row: Option<(Option<String>, i64)> = conn
        .query_row(
            "SELECT owner_email, email_verified FROM agents WHERE name = ?1",
            params![name],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((owner_email, email_verified)) = row else {
        return Err(ApiError::not_found("No such agent"));
    };
    if email_verified != 1 || owner_email.as_deref() != Some(email.as_str()) {
        return Err(ApiError::forbidden(
            "EmailNotVerified",
            "Recovery requires the verified owner email",
        ));
    }

    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE agents SET pending_public_key = ?1, recovery_initiated_at = ?2 WHERE name = ?3",
        params![body.new_public_key.trim(), &now, name],
    )?;

    Ok(Json(serde_json::json!({
        "recoveryInitiated": true,
        "initiatedAt": now
    })))
}

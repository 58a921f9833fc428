use crate::RelayConfig;
use crate::db::Db;
use crate::error::{ApiError, RelayError};
use crate::models::*;
use crate::rate_limit::{self, RateLimited, RateLimitedError};
use crate::routes::presence::is_online;
use crate::routes::{AuthHeaders, SignedJson};
use chrono::{DateTime, Duration, Utc};
use rocket::serde::json::Json;
use rocket::{State, delete, get, post};
use rusqlite::{Connection, OptionalExtension, params};

/// A pending request older than this is treated as non-existent.
const PENDING_EXPIRY_DAYS: i64 = 30;

/// Denials before the recipient's block takes effect.
const DENIALS_UNTIL_BLOCK: i64 = 3;

/// Normalized pair key: `agent_a < agent_b` lexicographically. Every contact
/// read and write goes through this ordering; no symmetric row can exist.
fn pair<'a>(x: &'a str, y: &'a str) -> (&'a str, &'a str) {
    if x < y { (x, y) } else { (y, x) }
}

fn pending_cutoff(now: DateTime<Utc>) -> String {
    (now - Duration::days(PENDING_EXPIRY_DAYS)).to_rfc3339()
}

/// Self-request, target existence, and block checks: everything that does
/// not touch the contact row itself.
fn precheck_target(conn: &Connection, from: &str, to: &str) -> Result<(), ApiError> {
    if from == to {
        return Err(ApiError::bad_request(
            "InvalidRequest",
            "Cannot request contact with yourself",
        ));
    }

    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM agents WHERE name = ?1",
            params![to],
            |r| r.get(0),
        )
        .optional()?;
    if status.as_deref() != Some("active") {
        return Err(ApiError::not_found("No such agent"));
    }

    let blocked: Option<String> = conn
        .query_row(
            "SELECT blocker FROM blocks WHERE blocker = ?1 AND blocked = ?2",
            params![to, from],
            |r| r.get(0),
        )
        .optional()?;
    if blocked.is_some() {
        return Err(ApiError::forbidden(
            "Blocked",
            "This agent is not accepting your requests",
        ));
    }
    Ok(())
}

/// Create or revive the pair row. A fresh `pending` or any `active` row is a
/// duplicate; a stale `pending`, `denied`, or `removed` row is reset to
/// `pending` with the new requester, keeping its denial history.
fn upsert_request(
    conn: &Connection,
    from: &str,
    to: &str,
    now: DateTime<Utc>,
) -> Result<(), ApiError> {
    let (a, b) = pair(from, to);
    let now_str = now.to_rfc3339();

    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT status, created_at FROM contacts WHERE agent_a = ?1 AND agent_b = ?2",
            params![a, b],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;

    match row {
        None => {
            conn.execute(
                "INSERT INTO contacts (agent_a, agent_b, status, requested_by, greeting,
                                       denial_count, created_at, updated_at)
                 VALUES (?1, ?2, 'pending', ?3, NULL, 0, ?4, ?4)",
                params![a, b, from, &now_str],
            )?;
            Ok(())
        }
        Some((status, created_at)) => {
            let fresh = created_at >= pending_cutoff(now);
            match status.as_str() {
                "active" => Err(ApiError::duplicate("Already contacts")),
                "pending" if fresh => Err(ApiError::duplicate("Request already pending")),
                // Stale pending, denied, or removed: revive as a new request.
                _ => {
                    conn.execute(
                        "UPDATE contacts SET status = 'pending', requested_by = ?3,
                                greeting = NULL, created_at = ?4, updated_at = ?4
                         WHERE agent_a = ?1 AND agent_b = ?2",
                        params![a, b, from, &now_str],
                    )?;
                    Ok(())
                }
            }
        }
    }
}

/// Single or batch contact request: `to` is a name or an array of names. The
/// greeting field is retired and must be empty; batches draw their whole
/// size from the hourly counter up front.
#[post("/contacts/request", format = "json", data = "<body>")]
pub fn request_contact(
    db: &State<Db>,
    config: &State<RelayConfig>,
    headers: AuthHeaders,
    body: SignedJson<RequestContact>,
) -> Result<RateLimited<serde_json::Value>, RelayError> {
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let from = headers.authenticate_with_hash(&conn, &body.body_hash)?;
    let now = Utc::now();

    if body
        .value
        .greeting
        .as_deref()
        .is_some_and(|g| !g.is_empty())
    {
        return Err(ApiError::bad_request(
            "GreetingRejected",
            "Greetings are no longer carried on contact requests",
        )
        .into());
    }

    match &body.value.to {
        ContactTarget::One(to) => {
            let to = to.trim().to_string();
            precheck_target(&conn, &from, &to)?;

            let rl = rate_limit::check(
                &conn,
                &format!("contacts:request:{from}"),
                config.contact_request_limit,
                1,
                now,
            )?;
            if !rl.allowed {
                return Err(RateLimitedError {
                    info: rl,
                    message: format!(
                        "Rate limited: max {} contact requests per hour",
                        config.contact_request_limit
                    ),
                }
                .into());
            }

            upsert_request(&conn, &from, &to, now)?;
            Ok(RateLimited::new(
                Json(serde_json::json!({ "to": to, "status": "pending" })),
                rl,
            ))
        }
        ContactTarget::Many(targets) => {
            let rl = rate_limit::check(
                &conn,
                &format!("contacts:request:{from}"),
                config.contact_request_limit,
                targets.len() as i64,
                now,
            )?;
            if !rl.allowed {
                return Err(RateLimitedError {
                    info: rl,
                    message: format!(
                        "Rate limited: max {} contact requests per hour",
                        config.contact_request_limit
                    ),
                }
                .into());
            }

            let results: Vec<ContactRequestResult> = targets
                .iter()
                .map(|raw| {
                    let to = raw.trim().to_string();
                    let outcome = precheck_target(&conn, &from, &to)
                        .and_then(|_| upsert_request(&conn, &from, &to, now));
                    match outcome {
                        Ok(()) => ContactRequestResult {
                            to,
                            ok: true,
                            status: 200,
                            error: None,
                        },
                        Err(e) => ContactRequestResult {
                            to,
                            ok: false,
                            status: e.status.code,
                            error: Some(e.message),
                        },
                    }
                })
                .collect();

            Ok(RateLimited::new(
                Json(serde_json::json!({ "results": results })),
                rl,
            ))
        }
    }
}

/// Pending invitations addressed to the caller, at most 30 days old. No
/// greeting is exposed: only who asked, their registered email, and when.
#[get("/contacts/pending")]
pub fn list_pending(
    db: &State<Db>,
    headers: AuthHeaders,
) -> Result<Json<Vec<PendingContact>>, ApiError> {
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let me = headers.authenticate(&conn)?;
    let cutoff = pending_cutoff(Utc::now());

    let mut stmt = conn.prepare(
        "SELECT c.requested_by, a.owner_email, c.created_at
         FROM contacts c JOIN agents a ON a.name = c.requested_by
         WHERE (c.agent_a = ?1 OR c.agent_b = ?1)
           AND c.status = 'pending'
           AND c.requested_by != ?1
           AND c.created_at >= ?2
         ORDER BY c.created_at ASC",
    )?;
    let pending: Vec<PendingContact> = stmt
        .query_map(params![&me, &cutoff], |r| {
            Ok(PendingContact {
                from: r.get(0)?,
                requester_email: r.get(1)?,
                created_at: r.get(2)?,
            })
        })?
        .filter_map(|r| r.ok())
        .collect();

    Ok(Json(pending))
}

/// Accept a pending request from `requester`. Echoes the requester's key and
/// endpoint so the caller can complete its side of the endpoint exchange.
#[post("/contacts/<requester>/accept")]
pub fn accept_contact(
    db: &State<Db>,
    headers: AuthHeaders,
    requester: &str,
) -> Result<Json<ContactDescriptor>, ApiError> {
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let me = headers.authenticate(&conn)?;
    let now = Utc::now();

    load_pending_for_action(&conn, &me, requester, now)?;

    let (a, b) = pair(&me, requester);
    conn.execute(
        "UPDATE contacts SET status = 'active', updated_at = ?3
         WHERE agent_a = ?1 AND agent_b = ?2",
        params![a, b, now.to_rfc3339()],
    )?;

    let descriptor = conn.query_row(
        "SELECT name, public_key, endpoint FROM agents WHERE name = ?1",
        params![requester],
        |r| {
            Ok(ContactDescriptor {
                agent: r.get(0)?,
                public_key: r.get(1)?,
                endpoint: r.get(2)?,
            })
        },
    )?;

    Ok(Json(descriptor))
}

/// Deny a pending request. The row persists so denials accumulate; the third
/// one inserts a block against the requester.
#[post("/contacts/<requester>/deny")]
pub fn deny_contact(
    db: &State<Db>,
    headers: AuthHeaders,
    requester: &str,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mut conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let me = headers.authenticate(&conn)?;
    let now = Utc::now();

    load_pending_for_action(&conn, &me, requester, now)?;

    let (a, b) = pair(&me, requester);
    let now_str = now.to_rfc3339();
    let tx = conn.transaction()?;
    tx.execute(
        "UPDATE contacts SET status = 'denied', denial_count = denial_count + 1, updated_at = ?3
         WHERE agent_a = ?1 AND agent_b = ?2",
        params![a, b, &now_str],
    )?;
    let denials: i64 = tx.query_row(
        "SELECT denial_count FROM contacts WHERE agent_a = ?1 AND agent_b = ?2",
        params![a, b],
        |r| r.get(0),
    )?;
    if denials >= DENIALS_UNTIL_BLOCK {
        tx.execute(
            "INSERT OR IGNORE INTO blocks (blocker, blocked, created_at) VALUES (?1, ?2, ?3)",
            params![&me, requester, &now_str],
        )?;
    }
    tx.commit()?;

    Ok(Json(serde_json::json!({
        "denied": requester,
        "denialCount": denials
    })))
}

/// Shared accept/deny precondition: a fresh pending row for the pair whose
/// requester is the other agent.
fn load_pending_for_action(
    conn: &Connection,
    me: &str,
    requester: &str,
    now: DateTime<Utc>,
) -> Result<(), ApiError> {
    let (a, b) = pair(me, requester);
    let row: Option<(String, String, String)> = conn
        .query_row(
            "SELECT status, requested_by, created_at
             FROM contacts WHERE agent_a = ?1 AND agent_b = ?2",
            params![a, b],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;

    let Some((status, requested_by, created_at)) = row else {
        return Err(ApiError::not_found("No pending invitation from this agent"));
    };
    if status != "pending" || created_at < pending_cutoff(now) {
        return Err(ApiError::not_found("No pending invitation from this agent"));
    }
    if requested_by == me {
        return Err(ApiError::bad_request(
            "InvalidRequest",
            "Cannot act on your own request",
        ));
    }
    Ok(())
}

/// Active contacts of the caller, with presence-derived online state.
#[get("/contacts")]
pub fn list_contacts(
    db: &State<Db>,
    headers: AuthHeaders,
) -> Result<Json<Vec<ContactEntry>>, ApiError> {
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let me = headers.authenticate(&conn)?;
    let now = Utc::now();

    let mut stmt = conn.prepare(
        "SELECT a.name, a.public_key, a.endpoint, c.updated_at, a.last_seen,
                a.key_updated_at, a.recovery_initiated_at
         FROM contacts c
         JOIN agents a ON a.name = CASE WHEN c.agent_a = ?1 THEN c.agent_b ELSE c.agent_a END
         WHERE (c.agent_a = ?1 OR c.agent_b = ?1) AND c.status = 'active'
         ORDER BY a.name ASC",
    )?;
    let contacts: Vec<ContactEntry> = stmt
        .query_map(params![&me], |r| {
            let last_seen: Option<String> = r.get(4)?;
            let recovery: Option<String> = r.get(6)?;
            Ok(ContactEntry {
                agent: r.get(0)?,
                public_key: r.get(1)?,
                endpoint: r.get(2)?,
                since: r.get(3)?,
                online: is_online(last_seen.as_deref(), now),
                last_seen,
                key_updated_at: r.get(5)?,
                recovery_in_progress: recovery.is_some(),
            })
        })?
        .filter_map(|r| r.ok())
        .collect();

    Ok(Json(contacts))
}

/// Remove an active contact. The pair may be re-requested afterwards.
#[delete("/contacts/<other>")]
pub fn remove_contact(
    db: &State<Db>,
    headers: AuthHeaders,
    other: &str,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let me = headers.authenticate(&conn)?;

    let (a, b) = pair(&me, other);
    let updated = conn.execute(
        "UPDATE contacts SET status = 'removed', updated_at = ?3
         WHERE agent_a = ?1 AND agent_b = ?2 AND status = 'active'",
        params![a, b, Utc::now().to_rfc3339()],
    )?;
    if updated == 0 {
        return Err(ApiError::not_found("No active contact with this agent"));
    }

    Ok(Json(serde_json::json!({ "removed": other })))
}

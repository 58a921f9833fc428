use crate::db::Db;
use crate::error::ApiError;
use crate::models::PresenceUpdate;
use crate::routes::{AuthHeaders, SignedJson};
use chrono::{DateTime, Utc};
use rocket::serde::json::Json;
use rocket::{State, put};
use rusqlite::params;

/// Clients heartbeat every 10 minutes; an agent is offline once its last
/// heartbeat is more than two intervals old.
pub const HEARTBEAT_INTERVAL_MS: i64 = 600_000;
pub const ONLINE_THRESHOLD_MS: i64 = 2 * HEARTBEAT_INTERVAL_MS;

/// Exactly at the threshold is still online; one millisecond past is not.
pub fn is_online(last_seen: Option<&str>, now: DateTime<Utc>) -> bool {
    let Some(last_seen) = last_seen else {
        return false;
    };
    let Ok(seen) = DateTime::parse_from_rfc3339(last_seen) else {
        return false;
    };
    (now - seen.with_timezone(&Utc)).num_milliseconds() <= ONLINE_THRESHOLD_MS
}

/// Heartbeat: stamps `last_seen` and, when supplied, the direct-delivery
/// endpoint.
#[put("/presence", format = "json", data = "<body>")]
pub fn update_presence(
    db: &State<Db>,
    headers: AuthHeaders,
    body: SignedJson<PresenceUpdate>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let me = headers.authenticate_with_hash(&conn, &body.body_hash)?;

    let now = Utc::now().to_rfc3339();
    match &body.value.endpoint {
        Some(endpoint) => conn.execute(
            "UPDATE agents SET last_seen = ?2, endpoint = ?3 WHERE name = ?1",
            params![&me, &now, endpoint],
        )?,
        None => conn.execute(
            "UPDATE agents SET last_seen = ?2 WHERE name = ?1",
            params![&me, &now],
        )?,
    };

    Ok(Json(serde_json::json!({ "agent": me, "lastSeen": now })))
}

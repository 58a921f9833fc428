use crate::crypto;
use crate::db::Db;
use crate::error::ApiError;
use crate::models::*;
use crate::routes::{AuthHeaders, SignedJson};
use rocket::serde::json::Json;
use rocket::{State, get, post};
use rusqlite::{OptionalExtension, params};

const BROADCAST_TYPES: &[&str] = &[
    "security-alert",
    "maintenance",
    "update",
    "announcement",
    "revocation",
];

/// Admin keys are public material; the listing lets agents verify broadcast
/// signatures locally.
#[get("/admin/keys")]
pub fn admin_keys(db: &State<Db>) -> Result<Json<Vec<AdminKeyEntry>>, ApiError> {
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let mut stmt =
        conn.prepare("SELECT agent, admin_public_key, added_at FROM admins ORDER BY added_at ASC")?;
    let keys: Vec<AdminKeyEntry> = stmt
        .query_map([], |r| {
            Ok(AdminKeyEntry {
                agent: r.get(0)?,
                admin_public_key: r.get(1)?,
                added_at: r.get(2)?,
            })
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(Json(keys))
}

/// Append to the signed broadcast log. The payload is opaque to the relay;
/// the signature must verify against the caller's admin key over the raw
/// payload string.
#[post("/admin/broadcast", format = "json", data = "<body>")]
pub fn create_broadcast(
    db: &State<Db>,
    headers: AuthHeaders,
    body: SignedJson<CreateBroadcast>,
) -> Result<Json<BroadcastEntry>, ApiError> {
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
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
            "Only admins may create broadcasts",
        ));
    };

    if !BROADCAST_TYPES.contains(&body.value.broadcast_type.as_str()) {
        return Err(ApiError::bad_request(
            "InvalidRequest",
            "Unknown broadcast type",
        ));
    }

    let key = crypto::verifying_key_from_spki_b64(&admin_key)
        .map_err(|_| ApiError::internal("Stored admin key is unreadable"))?;
    if !crypto::verify_detached(&key, body.value.payload.as_bytes(), &body.value.signature) {
        return Err(ApiError::forbidden(
            "InvalidSignature",
            "Signature does not verify against the admin key",
        ));
    }

    let entry = BroadcastEntry {
        id: uuid::Uuid::new_v4().to_string(),
        broadcast_type: body.value.broadcast_type.clone(),
        payload: body.value.payload.clone(),
        sender: caller,
        signature: body.value.signature.clone(),
        created_at: chrono::Utc::now().to_rfc3339(),
    };
    conn.execute(
        "INSERT INTO broadcasts (id, type, payload, sender, signature, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            &entry.id,
            &entry.broadcast_type,
            &entry.payload,
            &entry.sender,
            &entry.signature,
            &entry.created_at
        ],
    )?;

    Ok(Json(entry))
}

#[derive(rocket::FromForm)]
pub struct BroadcastFilter {
    #[field(name = "type")]
    kind: Option<String>,
}

#[get("/admin/broadcasts?<filter..>")]
pub fn list_broadcasts(
    db: &State<Db>,
    filter: BroadcastFilter,
) -> Result<Json<Vec<BroadcastEntry>>, ApiError> {
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());

    let map_row = |r: &rusqlite::Row| -> rusqlite::Result<BroadcastEntry> {
        Ok(BroadcastEntry {
            id: r.get(0)?,
            broadcast_type: r.get(1)?,
            payload: r.get(2)?,
            sender: r.get(3)?,
            signature: r.get(4)?,
            created_at: r.get(5)?,
        })
    };

    let broadcasts: Vec<BroadcastEntry> = match filter.kind {
        Some(kind) => {
            let mut stmt = conn.prepare(
                "SELECT id, type, payload, sender, signature, created_at
                 FROM broadcasts WHERE type = ?1 ORDER BY created_at DESC",
            )?;
            let rows: Vec<BroadcastEntry> = stmt
                .query_map(params![&kind], map_row)?
                .filter_map(|r| r.ok())
                .collect();
            rows
        }
        None => {
            let mut stmt = conn.prepare(
                "SELECT id, type, payload, sender, signature, created_at
                 FROM broadcasts ORDER BY created_at DESC",
            )?;
            let rows: Vec<BroadcastEntry> = stmt
                .query_map([], map_row)?
                .filter_map(|r| r.ok())
                .collect();
            rows
        }
    };

    Ok(Json(broadcasts))
}

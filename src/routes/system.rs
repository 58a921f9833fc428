use crate::db::Db;
use rocket::serde::json::Json;
use rocket::{Request, State, catch, get};

#[get("/health")]
pub fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "cc4me-relay",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[get("/stats")]
pub fn stats(db: &State<Db>) -> Json<serde_json::Value> {
    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());

    let count = |sql: &str| -> i64 { conn.query_row(sql, [], |r| r.get(0)).unwrap_or(0) };

    let active_agents = count("SELECT COUNT(*) FROM agents WHERE status = 'active'");
    let revoked_agents = count("SELECT COUNT(*) FROM agents WHERE status = 'revoked'");
    let active_contacts = count("SELECT COUNT(*) FROM contacts WHERE status = 'active'");
    let pending_contacts = count("SELECT COUNT(*) FROM contacts WHERE status = 'pending'");
    let active_groups = count("SELECT COUNT(*) FROM groups WHERE status = 'active'");
    let broadcasts = count("SELECT COUNT(*) FROM broadcasts");

    Json(serde_json::json!({
        "agents": { "active": active_agents, "revoked": revoked_agents },
        "contacts": { "active": active_contacts, "pending": pending_contacts },
        "groups": { "active": active_groups },
        "broadcasts": broadcasts
    }))
}

#[catch(404)]
pub fn not_found(req: &Request) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "error": format!("No such route: {} {}", req.method(), req.uri().path()),
        "kind": "NotFound"
    }))
}

#[catch(429)]
pub fn too_many_requests() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "error": "Too many requests",
        "kind": "RateLimited"
    }))
}

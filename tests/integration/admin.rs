use crate::common::{open_db, register_agent, signed, test_client, TestAgent, TestClient};
use cc4me::crypto;
use ed25519_dalek::SigningKey;
use rocket::http::Status;

/// Grant an agent admin authority the way deployments do: by inserting the
/// admins row directly. Returns the admin signing key.
fn grant_admin(client: &TestClient, agent: &TestAgent) -> SigningKey {
    let admin_key = crypto::generate_keypair();
    let conn = open_db(client);
    conn.execute(
        "INSERT INTO admins (agent, admin_public_key, added_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![
            &agent.name,
            crypto::spki_der_b64(&admin_key.verifying_key()),
            chrono::Utc::now().to_rfc3339()
        ],
    )
    .unwrap();
    admin_key
}

#[test]
fn test_admin_keys_listing() {
    let client = test_client();
    let root = register_agent(&client, "root");
    grant_admin(&client, &root);

    let res = client.get("/admin/keys").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let keys: Vec<serde_json::Value> = res.into_json().unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0]["agent"], "root");
    assert!(keys[0]["adminPublicKey"].is_string());
}

#[test]
fn test_broadcast_create_and_list() {
    let client = test_client();
    let root = register_agent(&client, "root");
    let admin_key = grant_admin(&client, &root);

    let payload = serde_json::json!({ "message": "scheduled downtime" }).to_string();
    let signature = crypto::sign_detached(&admin_key, payload.as_bytes());

    let res = signed(
        &client,
        &root,
        "POST",
        "/admin/broadcast",
        Some(serde_json::json!({
            "type": "maintenance",
            "payload": payload,
            "signature": signature
        })),
    );
    assert_eq!(res.status(), Status::Ok);
    let created: serde_json::Value = res.into_json().unwrap();
    assert_eq!(created["type"], "maintenance");
    assert_eq!(created["sender"], "root");

    let res = client.get("/admin/broadcasts").dispatch();
    let all: Vec<serde_json::Value> = res.into_json().unwrap();
    assert_eq!(all.len(), 1);

    let res = client.get("/admin/broadcasts?type=maintenance").dispatch();
    let filtered: Vec<serde_json::Value> = res.into_json().unwrap();
    assert_eq!(filtered.len(), 1);
    let res = client.get("/admin/broadcasts?type=update").dispatch();
    let none: Vec<serde_json::Value> = res.into_json().unwrap();
    assert!(none.is_empty());
}

#[test]
fn test_broadcast_requires_admin_row() {
    let client = test_client();
    let alice = register_agent(&client, "alice");

    let payload = "{}".to_string();
    let signature = crypto::sign_detached(&alice.key, payload.as_bytes());
    let res = signed(
        &client,
        &alice,
        "POST",
        "/admin/broadcast",
        Some(serde_json::json!({
            "type": "announcement",
            "payload": payload,
            "signature": signature
        })),
    );
    assert_eq!(res.status(), Status::Forbidden);
}

#[test]
fn test_broadcast_bad_signature() {
    let client = test_client();
    let root = register_agent(&client, "root");
    let admin_key = grant_admin(&client, &root);

    // Signed over different bytes than the stored payload.
    let signature = crypto::sign_detached(&admin_key, b"something else");
    let res = signed(
        &client,
        &root,
        "POST",
        "/admin/broadcast",
        Some(serde_json::json!({
            "type": "announcement",
            "payload": "{}",
            "signature": signature
        })),
    );
    assert_eq!(res.status(), Status::Forbidden);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["kind"], "InvalidSignature");
}

#[test]
fn test_broadcast_unknown_type() {
    let client = test_client();
    let root = register_agent(&client, "root");
    let admin_key = grant_admin(&client, &root);

    let signature = crypto::sign_detached(&admin_key, b"{}");
    let res = signed(
        &client,
        &root,
        "POST",
        "/admin/broadcast",
        Some(serde_json::json!({
            "type": "gossip",
            "payload": "{}",
            "signature": signature
        })),
    );
    assert_eq!(res.status(), Status::BadRequest);
}

// --- Revocation ---

#[test]
fn test_admin_revocation_end_to_end() {
    let client = test_client();
    let root = register_agent(&client, "root");
    let admin_key = grant_admin(&client, &root);
    let rogue = register_agent(&client, "rogue");

    // The relay will store exactly this canonical payload; the admin signs it.
    let payload =
        serde_json::json!({ "reason": "admin_revocation", "revokedAgent": "rogue" }).to_string();
    let signature = crypto::sign_detached(&admin_key, payload.as_bytes());

    let res = signed(
        &client,
        &root,
        "POST",
        "/registry/agents/rogue/revoke",
        Some(serde_json::json!({ "broadcastSignature": signature })),
    );
    assert_eq!(res.status(), Status::Ok);

    // A subsequent signed request from the revoked agent is refused.
    let res = signed(
        &client,
        &rogue,
        "PUT",
        "/presence",
        Some(serde_json::json!({})),
    );
    assert_eq!(res.status(), Status::Forbidden);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["kind"], "Revoked");

    // The revocation broadcast is on the log.
    let res = client.get("/admin/broadcasts?type=revocation").dispatch();
    let broadcasts: Vec<serde_json::Value> = res.into_json().unwrap();
    assert_eq!(broadcasts.len(), 1);
    let payload: serde_json::Value =
        serde_json::from_str(broadcasts[0]["payload"].as_str().unwrap()).unwrap();
    assert_eq!(payload["revokedAgent"], "rogue");
    assert_eq!(payload["reason"], "admin_revocation");

    // Lookup still answers, with the revoked status.
    let res = client.get("/registry/agents/rogue").dispatch();
    let lookup: serde_json::Value = res.into_json().unwrap();
    assert_eq!(lookup["status"], "revoked");
}

#[test]
fn test_revoke_requires_admin() {
    let client = test_client();
    let alice = register_agent(&client, "alice");
    register_agent(&client, "bob");

    let signature = crypto::sign_detached(&alice.key, b"{}");
    let res = signed(
        &client,
        &alice,
        "POST",
        "/registry/agents/bob/revoke",
        Some(serde_json::json!({ "broadcastSignature": signature })),
    );
    assert_eq!(res.status(), Status::Forbidden);
}

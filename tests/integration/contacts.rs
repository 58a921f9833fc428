use crate::common::{
    make_contacts, open_db, register_agent, signed, test_client, test_client_with_config,
};
use rocket::http::Status;

// --- Request / accept lifecycle ---

#[test]
fn test_request_and_accept() {
    let client = test_client();
    let alice = register_agent(&client, "alice");
    let bob = register_agent(&client, "bob");

    let res = signed(
        &client,
        &alice,
        "POST",
        "/contacts/request",
        Some(serde_json::json!({ "to": "bob" })),
    );
    assert_eq!(res.status(), Status::Ok);

    // Bob sees the pending request with alice's email, no greeting field.
    let res = signed(&client, &bob, "GET", "/contacts/pending", None);
    assert_eq!(res.status(), Status::Ok);
    let pending: Vec<serde_json::Value> = res.into_json().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0]["from"], "alice");
    assert_eq!(pending[0]["requesterEmail"], "alice@example.com");
    assert!(pending[0].get("greeting").is_none());

    // Alice does not see her own outgoing request as pending.
    let res = signed(&client, &alice, "GET", "/contacts/pending", None);
    let pending: Vec<serde_json::Value> = res.into_json().unwrap();
    assert!(pending.is_empty());

    // Accept echoes the contact descriptor for endpoint exchange.
    let res = signed(&client, &bob, "POST", "/contacts/alice/accept", None);
    assert_eq!(res.status(), Status::Ok);
    let descriptor: serde_json::Value = res.into_json().unwrap();
    assert_eq!(descriptor["agent"], "alice");
    assert_eq!(descriptor["publicKey"], alice.public_key_b64());

    // Both sides now list the other.
    for (agent, other) in [(&alice, "bob"), (&bob, "alice")] {
        let res = signed(&client, agent, "GET", "/contacts", None);
        let contacts: Vec<serde_json::Value> = res.into_json().unwrap();
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0]["agent"], other);
    }
}

#[test]
fn test_pair_row_is_normalized() {
    let client = test_client();
    let alice = register_agent(&client, "alice");
    let bob = register_agent(&client, "bob");

    // Bob initiates, but the stored row is still (alice, bob).
    let res = signed(
        &client,
        &bob,
        "POST",
        "/contacts/request",
        Some(serde_json::json!({ "to": "alice" })),
    );
    assert_eq!(res.status(), Status::Ok);

    let conn = open_db(&client);
    let (a, b, requested_by): (String, String, String) = conn
        .query_row(
            "SELECT agent_a, agent_b, requested_by FROM contacts",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .unwrap();
    assert_eq!(a, "alice");
    assert_eq!(b, "bob");
    assert_eq!(requested_by, "bob");

    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM contacts", [], |r| r.get(0))
        .unwrap();
    assert_eq!(count, 1);
}

#[test]
fn test_self_request_rejected() {
    let client = test_client();
    let alice = register_agent(&client, "alice");
    let res = signed(
        &client,
        &alice,
        "POST",
        "/contacts/request",
        Some(serde_json::json!({ "to": "alice" })),
    );
    assert_eq!(res.status(), Status::BadRequest);
}

#[test]
fn test_greeting_rejected() {
    let client = test_client();
    let alice = register_agent(&client, "alice");
    register_agent(&client, "bob");

    let res = signed(
        &client,
        &alice,
        "POST",
        "/contacts/request",
        Some(serde_json::json!({ "to": "bob", "greeting": "hi there" })),
    );
    assert_eq!(res.status(), Status::BadRequest);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["kind"], "GreetingRejected");
}

#[test]
fn test_request_unknown_target() {
    let client = test_client();
    let alice = register_agent(&client, "alice");
    let res = signed(
        &client,
        &alice,
        "POST",
        "/contacts/request",
        Some(serde_json::json!({ "to": "nobody" })),
    );
    assert_eq!(res.status(), Status::NotFound);
}

#[test]
fn test_duplicate_request() {
    let client = test_client();
    let alice = register_agent(&client, "alice");
    register_agent(&client, "bob");

    for expected in [Status::Ok, Status::Conflict] {
        let res = signed(
            &client,
            &alice,
            "POST",
            "/contacts/request",
            Some(serde_json::json!({ "to": "bob" })),
        );
        assert_eq!(res.status(), expected);
    }
}

#[test]
fn test_accept_own_request_rejected() {
    let client = test_client();
    let alice = register_agent(&client, "alice");
    register_agent(&client, "bob");

    signed(
        &client,
        &alice,
        "POST",
        "/contacts/request",
        Some(serde_json::json!({ "to": "bob" })),
    );
    let res = signed(&client, &alice, "POST", "/contacts/bob/accept", None);
    assert_eq!(res.status(), Status::BadRequest);
}

#[test]
fn test_accept_without_request() {
    let client = test_client();
    register_agent(&client, "alice");
    let bob = register_agent(&client, "bob");
    let res = signed(&client, &bob, "POST", "/contacts/alice/accept", None);
    assert_eq!(res.status(), Status::NotFound);
}

// --- Denial counting & blocks ---

#[test]
fn test_three_denials_block_the_requester() {
    let client = test_client();
    let alice = register_agent(&client, "alice");
    let bob = register_agent(&client, "bob");

    for _ in 0..3 {
        let res = signed(
            &client,
            &alice,
            "POST",
            "/contacts/request",
            Some(serde_json::json!({ "to": "bob" })),
        );
        assert_eq!(res.status(), Status::Ok);
        let res = signed(&client, &bob, "POST", "/contacts/alice/deny", None);
        assert_eq!(res.status(), Status::Ok);
    }

    {
        let conn = open_db(&client);
        let blocked: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM blocks WHERE blocker = 'bob' AND blocked = 'alice'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(blocked, 1);
        let denials: i64 = conn
            .query_row("SELECT denial_count FROM contacts", [], |r| r.get(0))
            .unwrap();
        assert_eq!(denials, 3);
    }

    // The fourth request bounces off the block.
    let res = signed(
        &client,
        &alice,
        "POST",
        "/contacts/request",
        Some(serde_json::json!({ "to": "bob" })),
    );
    assert_eq!(res.status(), Status::Forbidden);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["kind"], "Blocked");

    // The block is one-directional: bob may still request alice.
    let res = signed(
        &client,
        &bob,
        "POST",
        "/contacts/request",
        Some(serde_json::json!({ "to": "alice" })),
    );
    assert_eq!(res.status(), Status::Ok);
}

#[test]
fn test_denied_request_can_be_retried() {
    let client = test_client();
    let alice = register_agent(&client, "alice");
    let bob = register_agent(&client, "bob");

    signed(
        &client,
        &alice,
        "POST",
        "/contacts/request",
        Some(serde_json::json!({ "to": "bob" })),
    );
    signed(&client, &bob, "POST", "/contacts/alice/deny", None);

    // Denied is not a duplicate; a retry reopens the request and the
    // denial count survives.
    let res = signed(
        &client,
        &alice,
        "POST",
        "/contacts/request",
        Some(serde_json::json!({ "to": "bob" })),
    );
    assert_eq!(res.status(), Status::Ok);

    let conn = open_db(&client);
    let (status, denials): (String, i64) = conn
        .query_row(
            "SELECT status, denial_count FROM contacts",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .unwrap();
    assert_eq!(status, "pending");
    assert_eq!(denials, 1);
}

// --- Removal ---

#[test]
fn test_remove_and_rerequest() {
    let client = test_client();
    let alice = register_agent(&client, "alice");
    let bob = register_agent(&client, "bob");
    make_contacts(&client, &alice, &bob);

    let res = signed(&client, &alice, "DELETE", "/contacts/bob", None);
    assert_eq!(res.status(), Status::Ok);

    // Gone from both listings, row kept as removed.
    let res = signed(&client, &bob, "GET", "/contacts", None);
    let contacts: Vec<serde_json::Value> = res.into_json().unwrap();
    assert!(contacts.is_empty());
    {
        let conn = open_db(&client);
        let status: String = conn
            .query_row("SELECT status FROM contacts", [], |r| r.get(0))
            .unwrap();
        assert_eq!(status, "removed");
    }

    // The pair can start over.
    let res = signed(
        &client,
        &bob,
        "POST",
        "/contacts/request",
        Some(serde_json::json!({ "to": "alice" })),
    );
    assert_eq!(res.status(), Status::Ok);
}

#[test]
fn test_remove_requires_active_contact() {
    let client = test_client();
    let alice = register_agent(&client, "alice");
    register_agent(&client, "bob");
    let res = signed(&client, &alice, "DELETE", "/contacts/bob", None);
    assert_eq!(res.status(), Status::NotFound);
}

// --- Pending expiry ---

#[test]
fn test_stale_pending_request_expires() {
    let client = test_client();
    let alice = register_agent(&client, "alice");
    let bob = register_agent(&client, "bob");

    signed(
        &client,
        &alice,
        "POST",
        "/contacts/request",
        Some(serde_json::json!({ "to": "bob" })),
    );
    {
        let conn = open_db(&client);
        let stale = (chrono::Utc::now() - chrono::Duration::days(31)).to_rfc3339();
        conn.execute(
            "UPDATE contacts SET created_at = ?1",
            rusqlite::params![stale],
        )
        .unwrap();
    }

    // Hidden from the pending list and unacceptable.
    let res = signed(&client, &bob, "GET", "/contacts/pending", None);
    let pending: Vec<serde_json::Value> = res.into_json().unwrap();
    assert!(pending.is_empty());
    let res = signed(&client, &bob, "POST", "/contacts/alice/accept", None);
    assert_eq!(res.status(), Status::NotFound);

    // A stale pending row is not a duplicate; it may be re-requested even
    // by the other side.
    let res = signed(
        &client,
        &bob,
        "POST",
        "/contacts/request",
        Some(serde_json::json!({ "to": "alice" })),
    );
    assert_eq!(res.status(), Status::Ok);
    let conn = open_db(&client);
    let requested_by: String = conn
        .query_row("SELECT requested_by FROM contacts", [], |r| r.get(0))
        .unwrap();
    assert_eq!(requested_by, "bob");
}

// --- Rate limiting ---

#[test]
fn test_request_rate_limit() {
    let client = test_client_with_config(cc4me::RelayConfig {
        contact_request_limit: 2,
        ..Default::default()
    });
    let alice = register_agent(&client, "alice");
    register_agent(&client, "bob");
    register_agent(&client, "carol");
    register_agent(&client, "dave");

    for to in ["bob", "carol"] {
        let res = signed(
            &client,
            &alice,
            "POST",
            "/contacts/request",
            Some(serde_json::json!({ "to": to })),
        );
        assert_eq!(res.status(), Status::Ok);
    }

    let res = signed(
        &client,
        &alice,
        "POST",
        "/contacts/request",
        Some(serde_json::json!({ "to": "dave" })),
    );
    assert_eq!(res.status(), Status::TooManyRequests);
    assert_eq!(res.headers().get_one("X-RateLimit-Limit"), Some("2"));
    assert_eq!(res.headers().get_one("X-RateLimit-Remaining"), Some("0"));
    assert!(res.headers().get_one("Retry-After").is_some());
    let retry_after: i64 = res
        .headers()
        .get_one("Retry-After")
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after > 0 && retry_after <= 3600);
}

// --- Batch requests ---

#[test]
fn test_batch_request_mixed_results() {
    let client = test_client();
    let alice = register_agent(&client, "alice");
    register_agent(&client, "bob");

    let res = signed(
        &client,
        &alice,
        "POST",
        "/contacts/request",
        Some(serde_json::json!({ "to": ["bob", "nobody", "alice"] })),
    );
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 3);

    let by_target: std::collections::HashMap<&str, &serde_json::Value> = results
        .iter()
        .map(|r| (r["to"].as_str().unwrap(), r))
        .collect();
    assert_eq!(by_target["bob"]["ok"], true);
    assert_eq!(by_target["nobody"]["ok"], false);
    assert_eq!(by_target["nobody"]["status"], 404);
    assert_eq!(by_target["alice"]["ok"], false);
    assert_eq!(by_target["alice"]["status"], 400);
}

#[test]
fn test_batch_request_rate_limited_whole() {
    let client = test_client_with_config(cc4me::RelayConfig {
        contact_request_limit: 2,
        ..Default::default()
    });
    let alice = register_agent(&client, "alice");
    register_agent(&client, "bob");
    register_agent(&client, "carol");
    register_agent(&client, "dave");

    let res = signed(
        &client,
        &alice,
        "POST",
        "/contacts/request",
        Some(serde_json::json!({ "to": ["bob", "carol", "dave"] })),
    );
    assert_eq!(res.status(), Status::TooManyRequests);

    // Nothing was consumed or written.
    let conn = open_db(&client);
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM contacts", [], |r| r.get(0))
        .unwrap();
    assert_eq!(count, 0);
}

// --- Listing fields ---

#[test]
fn test_contact_list_fields() {
    let client = test_client();
    let alice = register_agent(&client, "alice");
    let bob = register_agent(&client, "bob");
    make_contacts(&client, &alice, &bob);

    // Bob heartbeats so alice sees him online.
    let res = signed(
        &client,
        &bob,
        "PUT",
        "/presence",
        Some(serde_json::json!({ "endpoint": "http://bob.example:4000/inbox" })),
    );
    assert_eq!(res.status(), Status::Ok);

    let res = signed(&client, &alice, "GET", "/contacts", None);
    let contacts: Vec<serde_json::Value> = res.into_json().unwrap();
    assert_eq!(contacts.len(), 1);
    let bob_entry = &contacts[0];
    assert_eq!(bob_entry["agent"], "bob");
    assert_eq!(bob_entry["publicKey"], bob.public_key_b64());
    assert_eq!(bob_entry["endpoint"], "http://bob.example:4000/inbox");
    assert_eq!(bob_entry["online"], true);
    assert!(bob_entry["lastSeen"].is_string());
    assert!(bob_entry["since"].is_string());
    assert_eq!(bob_entry["recoveryInProgress"], false);
}

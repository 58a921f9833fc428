use cc4me::crypto;
use ed25519_dalek::SigningKey;
use rocket::http::{ContentType, Header, Status};
use rocket::local::blocking::{Client, LocalResponse};

/// Wrapper around Client that auto-deletes the temp DB on drop.
/// Uses Option<Client> so we can drop the DB connection before deleting the
/// file (WAL mode holds it open).
pub struct TestClient {
    client: Option<Client>,
    pub db_path: String,
}

impl Drop for TestClient {
    fn drop(&mut self) {
        drop(self.client.take());
        let _ = std::fs::remove_file(&self.db_path);
        let _ = std::fs::remove_file(format!("{}-wal", self.db_path));
        let _ = std::fs::remove_file(format!("{}-shm", self.db_path));
    }
}

impl std::ops::Deref for TestClient {
    type Target = Client;
    fn deref(&self) -> &Client {
        self.client.as_ref().unwrap()
    }
}

pub fn temp_db_path() -> String {
    format!(
        "/tmp/cc4me_test_{}.db",
        uuid::Uuid::new_v4().to_string().split('-').next().unwrap()
    )
}

pub fn test_client() -> TestClient {
    let db_path = temp_db_path();
    let rocket = cc4me::rocket_with_db(&db_path);
    let client = Client::tracked(rocket).expect("valid rocket instance");
    TestClient {
        client: Some(client),
        db_path,
    }
}

/// Test client with custom relay configuration (e.g. a tiny contact request
/// limit so 429s are cheap to trigger).
pub fn test_client_with_config(config: cc4me::RelayConfig) -> TestClient {
    let db_path = temp_db_path();
    let rocket = cc4me::rocket_with_db_and_config(&db_path, config);
    let client = Client::tracked(rocket).expect("valid rocket instance");
    TestClient {
        client: Some(client),
        db_path,
    }
}

/// Direct connection to the test database for row-level assertions and
/// fixture surgery (backdating timestamps, seeding admin rows).
pub fn open_db(client: &TestClient) -> rusqlite::Connection {
    let conn = rusqlite::Connection::open(&client.db_path).expect("open test db");
    conn.execute_batch("PRAGMA foreign_keys=ON;").unwrap();
    conn
}

/// A registered agent plus its signing key, for issuing signed requests.
pub struct TestAgent {
    pub name: String,
    pub key: SigningKey,
}

impl TestAgent {
    pub fn public_key_b64(&self) -> String {
        crypto::spki_der_b64(&self.key.verifying_key())
    }
}

/// Complete the verify → confirm → register flow for a fresh agent.
pub fn register_agent(client: &Client, name: &str) -> TestAgent {
    let key = crypto::generate_keypair();
    let public_key = crypto::spki_der_b64(&key.verifying_key());
    let email = format!("{name}@example.com");

    let res = client
        .post("/verify/send")
        .header(ContentType::JSON)
        .body(format!(
            r#"{{"agentName":"{name}","email":"{email}"}}"#
        ))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    let code = body["devCode"].as_str().expect("dev code echoed").to_string();

    let res = client
        .post("/verify/confirm")
        .header(ContentType::JSON)
        .body(format!(
            r#"{{"agentName":"{name}","email":"{email}","code":"{code}"}}"#
        ))
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = client
        .post("/registry/agents")
        .header(ContentType::JSON)
        .body(
            serde_json::json!({
                "name": name,
                "publicKey": public_key,
                "ownerEmail": email,
                "endpoint": format!("http://127.0.0.1:9/{name}")
            })
            .to_string(),
        )
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    TestAgent {
        name: name.to_string(),
        key,
    }
}

/// Issue a signed request. The canonical string covers the path without any
/// query, the `X-Timestamp` header, and the SHA-256 of the exact body bytes.
pub fn signed<'a>(
    client: &'a Client,
    agent: &TestAgent,
    method: &str,
    uri: &'a str,
    body: Option<serde_json::Value>,
) -> LocalResponse<'a> {
    signed_at(client, agent, method, uri, body, chrono::Utc::now())
}

pub fn signed_at<'a>(
    client: &'a Client,
    agent: &TestAgent,
    method: &str,
    uri: &'a str,
    body: Option<serde_json::Value>,
    timestamp: chrono::DateTime<chrono::Utc>,
) -> LocalResponse<'a> {
    let body_bytes = body
        .as_ref()
        .map(|v| serde_json::to_vec(v).unwrap())
        .unwrap_or_default();
    let path = uri.split('?').next().unwrap();
    let ts = timestamp.to_rfc3339();
    let canonical = cc4me::auth::canonical_string(
        method,
        path,
        &ts,
        &cc4me::auth::body_sha256_hex(&body_bytes),
    );
    let signature = crypto::sign_detached(&agent.key, canonical.as_bytes());

    let method = method.parse().expect("valid method");
    let mut req = client
        .req(method, uri)
        .header(Header::new(
            "Authorization",
            cc4me::auth::format_auth_header(&agent.name, &signature),
        ))
        .header(Header::new("X-Timestamp", ts));
    if body.is_some() {
        req = req.header(ContentType::JSON).body(body_bytes);
    }
    req.dispatch()
}

/// Make two agents mutual contacts via request + accept.
pub fn make_contacts(client: &Client, a: &TestAgent, b: &TestAgent) {
    let res = signed(
        client,
        a,
        "POST",
        "/contacts/request",
        Some(serde_json::json!({ "to": b.name })),
    );
    assert_eq!(res.status(), Status::Ok);
    let path = format!("/contacts/{}/accept", a.name);
    let res = signed(client, b, "POST", &path, None);
    assert_eq!(res.status(), Status::Ok);
}

use crate::RelayConfig;
use crate::auth::valid_agent_name;
use crate::db::Db;
use crate::error::{ApiError, RelayError};
use crate::models::*;
use crate::rate_limit::{self, RateLimitedError};
use rocket::serde::json::Json;
use rocket::{State, post};
use rusqlite::{OptionalExtension, params};
use sha2::{Digest, Sha256};

/// Verification codes live this long.
const CODE_TTL_MINUTES: i64 = 10;
const MAX_ATTEMPTS: i64 = 3;

/// Domains that hand out throwaway inboxes. Registration is email-gated, so
/// these defeat the point.
const DISPOSABLE_DOMAINS: &[&str] = &[
    "mailinator.com",
    "guerrillamail.com",
    "10minutemail.com",
    "tempmail.com",
    "temp-mail.org",
    "throwaway.email",
    "yopmail.com",
    "trashmail.com",
    "getnada.com",
    "sharklasers.com",
];

pub fn is_disposable(email: &str) -> bool {
    email
        .rsplit_once('@')
        .map(|(_, domain)| {
            let domain = domain.to_ascii_lowercase();
            DISPOSABLE_DOMAINS.iter().any(|d| domain == *d)
        })
        .unwrap_or(false)
}

fn plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.')
        }
        None => false,
    }
}

pub fn hash_code(code: &str) -> String {
    hex::encode(Sha256::digest(code.as_bytes()))
}

#[post("/verify/send", format = "json", data = "<body>")]
pub fn verify_send(
    db: &State<Db>,
    config: &State<RelayConfig>,
    body: Json<VerifySend>,
) -> Result<Json<serde_json::Value>, RelayError> {
    let name = body.agent_name.trim();
    let email = body.email.trim().to_ascii_lowercase();

    if !valid_agent_name(name) {
        return Err(ApiError::bad_request(
            "InvalidName",
            "Agent name must match ^[A-Za-z0-9_-]{1,64}$",
        )
        .into());
    }
    if !plausible_email(&email) {
        return Err(ApiError::bad_request("InvalidRequest", "Not a valid email address").into());
    }
    if is_disposable(&email) {
        return Err(ApiError::bad_request(
            "DisposableEmail",
            "Disposable email domains are not accepted",
        )
        .into());
    }

    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let now = chrono::Utc::now();

    let rl = rate_limit::check(
        &conn,
        &format!("verify:send:{email}"),
        config.verify_send_limit,
        1,
        now,
    )?;
    if !rl.allowed {
        return Err(RateLimitedError {
            info: rl,
            message: format!(
                "Rate limited: max {} verification emails per hour",
                config.verify_send_limit
            ),
        }
        .into());
    }

    use rand::Rng;
    let code = format!("{:06}", rand::rngs::OsRng.gen_range(0..1_000_000));
    let expires_at = (now + chrono::Duration::minutes(CODE_TTL_MINUTES)).to_rfc3339();

    // New send overwrites any previous code and resets the attempt counter.
    conn.execute(
        "INSERT INTO email_verifications (agent_name, email, code_hash, attempts, expires_at, verified)
         VALUES (?1, ?2, ?3, 0, ?4, 0)
         ON CONFLICT(agent_name) DO UPDATE SET
             email = excluded.email,
             code_hash = excluded.code_hash,
             attempts = 0,
             expires_at = excluded.expires_at,
             verified = 0",
        params![name, &email, hash_code(&code), &expires_at],
    )?;

    let mut response = serde_json::json!({
        "sent": true,
        "expiresAt": expires_at,
    });
    if config.smtp_configured {
        println!("📧 Verification code queued for {email} (agent {name})");
    } else {
        // No sender configured: hand the code back so local setups can
        // complete the flow without an inbox.
        response["devCode"] = serde_json::Value::String(code);
    }

    Ok(Json(response))
}

#[post("/verify/confirm", format = "json", data = "<body>")]
pub fn verify_confirm(
    db: &State<Db>,
    body: Json<VerifyConfirm>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let name = body.agent_name.trim();
    let email = body.email.trim().to_ascii_lowercase();

    let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
    let row: Option<(String, String, i64, String)> = conn
        .query_row(
            "SELECT email, code_hash, attempts, expires_at
             FROM email_verifications WHERE agent_name = ?1",
            params![name],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;

    let Some((stored_email, code_hash, attempts, expires_at)) = row else {
        return Err(ApiError::not_found("No verification pending for this agent"));
    };
    if stored_email != email {
        return Err(ApiError::not_found("No verification pending for this email"));
    }

    let expired = chrono::DateTime::parse_from_rfc3339(&expires_at)
        .map(|t| chrono::Utc::now() > t)
        .unwrap_or(true);
    if expired {
        return Err(ApiError::bad_request(
            "EmailNotVerified",
            "Verification code expired; request a new one",
        ));
    }
    if attempts >= MAX_ATTEMPTS {
        return Err(ApiError::bad_request(
            "EmailNotVerified",
            "Too many attempts; request a new code",
        ));
    }

    if hash_code(body.code.trim()) != code_hash {
        conn.execute(
            "UPDATE email_verifications SET attempts = attempts + 1 WHERE agent_name = ?1",
            params![name],
        )?;
        return Err(ApiError::bad_request(
            "EmailNotVerified",
            "Invalid verification code",
        ));
    }

    conn.execute(
        "UPDATE email_verifications SET verified = 1 WHERE agent_name = ?1",
        params![name],
    )?;

    Ok(Json(serde_json::json!({ "verified": true })))
}

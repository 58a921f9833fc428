// Route module decomposition: each domain area in its own file.
// Shared types (request/data guards) live here; route functions in submodules.

mod admin;
mod contacts;
mod groups;
mod presence;
mod registry;
mod system;
mod verify;

// --- Re-exports (all route functions used by lib.rs mount) ---

pub use admin::{admin_keys, create_broadcast, list_broadcasts};
pub use contacts::{
    accept_contact, deny_contact, list_contacts, list_pending, remove_contact, request_contact,
};
pub use groups::{
    accept_invitation, create_group, decline_invitation, dissolve_group, get_changes, get_group,
    invite_member, leave_group, list_groups, list_invitations, list_members, remove_member,
    transfer_ownership,
};
pub use presence::{HEARTBEAT_INTERVAL_MS, ONLINE_THRESHOLD_MS, is_online, update_presence};
pub use registry::{
    approve_agent_gone, list_agents_gone, lookup_agent, recover_agent, register_agent,
    reject_agent_gone, revoke_agent, rotate_key,
};
pub use system::{health, not_found, stats, too_many_requests};
pub use verify::{verify_confirm, verify_send};

// --- Shared request guards ---

use rocket::data::{self, Data, FromData};
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};
use rusqlite::Connection;

use crate::auth;
use crate::error::ApiError;

/// Captures everything request authentication needs besides the body hash:
/// method, path (no query), and the two protocol headers. Verification is
/// deferred to the route so body-bearing endpoints can hash the raw bytes
/// first.
pub struct AuthHeaders {
    pub method: String,
    pub path: String,
    pub timestamp: String,
    pub authorization: String,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AuthHeaders {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        Outcome::Success(AuthHeaders {
            method: req.method().as_str().to_string(),
            path: req.uri().path().to_string(),
            timestamp: req
                .headers()
                .get_one("X-Timestamp")
                .unwrap_or("")
                .to_string(),
            authorization: req
                .headers()
                .get_one("Authorization")
                .unwrap_or("")
                .to_string(),
        })
    }
}

impl AuthHeaders {
    /// Verify a bodyless (GET/DELETE) request. Returns the agent name.
    pub fn authenticate(&self, conn: &Connection) -> Result<String, ApiError> {
        self.authenticate_with_hash(conn, &auth::empty_body_hash())
    }

    pub fn authenticate_with_hash(
        &self,
        conn: &Connection,
        body_hash: &str,
    ) -> Result<String, ApiError> {
        auth::authenticate(
            conn,
            &self.method,
            &self.path,
            &self.timestamp,
            &self.authorization,
            body_hash,
            chrono::Utc::now(),
        )
        .map_err(|e| ApiError::new(e.status(), e.kind(), e.message()))
    }
}

/// JSON body guard that also records the lowercase-hex SHA-256 of the raw
/// bytes, as the canonical signing string requires.
pub struct SignedJson<T> {
    pub value: T,
    pub body_hash: String,
}

#[rocket::async_trait]
impl<'r, T: serde::de::DeserializeOwned> FromData<'r> for SignedJson<T> {
    type Error = String;

    async fn from_data(req: &'r Request<'_>, data: Data<'r>) -> data::Outcome<'r, Self> {
        let limit = req.limits().get("json").unwrap_or(rocket::data::Limits::JSON);
        let bytes = match data.open(limit).into_bytes().await {
            Ok(b) if b.is_complete() => b.into_inner(),
            Ok(_) => {
                return data::Outcome::Error((
                    Status::PayloadTooLarge,
                    "body exceeds the JSON limit".to_string(),
                ));
            }
            Err(e) => return data::Outcome::Error((Status::BadRequest, e.to_string())),
        };
        let body_hash = auth::body_sha256_hex(&bytes);
        match serde_json::from_slice::<T>(&bytes) {
            Ok(value) => data::Outcome::Success(SignedJson { value, body_hash }),
            Err(e) => data::Outcome::Error((Status::UnprocessableEntity, e.to_string())),
        }
    }
}

//! Hour-window rate limiting backed by the `rate_limits` table. Each key is
//! `<resource>:<principal>`; the row is upserted under the caller's
//! connection lock so concurrent increments serialize on the store.

use chrono::{DateTime, Duration, Utc};
use rocket::Request;
use rocket::http::Header;
use rocket::response::{self, Responder, Response};
use rocket::serde::json::Json;
use rusqlite::{Connection, OptionalExtension, params};

/// One-hour windows.
pub const WINDOW_MS: i64 = 3_600_000;

/// Rate limit status for a key, carried into the response headers.
#[derive(Debug, Clone)]
pub struct RateLimitInfo {
    pub allowed: bool,
    pub limit: i64,
    pub remaining: i64,
    /// Seconds until the current window ends. 0 when no window is open.
    pub retry_after_secs: i64,
}

/// Consume `cost` slots from the counter at `key`, starting a new window if
/// none is open. Denied checks consume nothing.
pub fn check(
    conn: &Connection,
    key: &str,
    limit: i64,
    cost: i64,
    now: DateTime<Utc>,
) -> rusqlite::Result<RateLimitInfo> {
    let row: Option<(i64, String)> = conn
        .query_row(
            "SELECT count, window_start FROM rate_limits WHERE key = ?1",
            params![key],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;

    let open_window = row.and_then(|(count, start)| {
        let started = DateTime::parse_from_rfc3339(&start)
            .ok()?
            .with_timezone(&Utc);
        ((now - started).num_milliseconds() < WINDOW_MS).then_some((count, started))
    });

    match open_window {
        Some((count, started)) => {
            if count + cost > limit {
                let window_end = started + Duration::milliseconds(WINDOW_MS);
                let retry_ms = (window_end - now).num_milliseconds().max(0);
                return Ok(RateLimitInfo {
                    allowed: false,
                    limit,
                    remaining: (limit - count).max(0),
                    retry_after_secs: (retry_ms + 999) / 1000,
                });
            }
            conn.execute(
                "UPDATE rate_limits SET count = count + ?2 WHERE key = ?1",
                params![key, cost],
            )?;
            Ok(RateLimitInfo {
                allowed: true,
                limit,
                remaining: limit - (count + cost),
                retry_after_secs: 0,
            })
        }
        None => {
            if cost > limit {
                return Ok(RateLimitInfo {
                    allowed: false,
                    limit,
                    remaining: limit,
                    retry_after_secs: 0,
                });
            }
            conn.execute(
                "INSERT INTO rate_limits (key, count, window_start) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET count = excluded.count,
                                               window_start = excluded.window_start",
                params![key, cost, now.to_rfc3339()],
            )?;
            Ok(RateLimitInfo {
                allowed: true,
                limit,
                remaining: limit - cost,
                retry_after_secs: 0,
            })
        }
    }
}

/// Wrapper that adds standard rate limit headers to any JSON response.
/// Headers: X-RateLimit-Limit, X-RateLimit-Remaining, X-RateLimit-Reset
pub struct RateLimited<T> {
    pub inner: Json<T>,
    pub info: RateLimitInfo,
}

impl<T> RateLimited<T> {
    pub fn new(inner: Json<T>, info: RateLimitInfo) -> Self {
        Self { inner, info }
    }
}

impl<'r, 'o: 'r, T: serde::Serialize + 'o> Responder<'r, 'o> for RateLimited<T> {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'o> {
        Ok(Response::build_from(self.inner.respond_to(req)?)
            .header(Header::new(
                "X-RateLimit-Limit",
                self.info.limit.to_string(),
            ))
            .header(Header::new(
                "X-RateLimit-Remaining",
                self.info.remaining.to_string(),
            ))
            .header(Header::new(
                "X-RateLimit-Reset",
                self.info.retry_after_secs.to_string(),
            ))
            .finalize())
    }
}

/// Error responder for rate-limited (429) responses with proper headers.
pub struct RateLimitedError {
    pub info: RateLimitInfo,
    pub message: String,
}

impl<'r, 'o: 'r> Responder<'r, 'o> for RateLimitedError {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'o> {
        let body = Json(serde_json::json!({
            "error": self.message,
            "kind": "RateLimited",
            "retry_after": self.info.retry_after_secs,
            "limit": self.info.limit,
            "remaining": 0
        }));

        Response::build_from(body.respond_to(req)?)
            .status(rocket::http::Status::TooManyRequests)
            .header(Header::new(
                "X-RateLimit-Limit",
                self.info.limit.to_string(),
            ))
            .header(Header::new("X-RateLimit-Remaining", "0".to_string()))
            .header(Header::new(
                "X-RateLimit-Reset",
                self.info.retry_after_secs.to_string(),
            ))
            .header(Header::new(
                "Retry-After",
                self.info.retry_after_secs.to_string(),
            ))
            .ok()
    }
}

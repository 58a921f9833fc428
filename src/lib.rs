pub mod auth;
pub mod crypto;
pub mod db;
pub mod error;
pub mod models;
pub mod rate_limit;
pub mod routes;
pub mod sdk;

use db::Db;
use rocket_cors::CorsOptions;
use std::env;

/// Relay-side knobs. Everything here is injectable for tests the same way
/// the env path is.
pub struct RelayConfig {
    /// Contact requests per agent per hour.
    pub contact_request_limit: i64,
    /// Verification emails per address per hour.
    pub verify_send_limit: i64,
    /// Whether an email sender is configured; without one, verification
    /// codes are echoed back in the response for local setups.
    pub smtp_configured: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            contact_request_limit: 100,
            verify_send_limit: 10,
            smtp_configured: false,
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(val) = env::var("CONTACT_REQUEST_LIMIT")
            && let Ok(n) = val.parse::<i64>()
        {
            config.contact_request_limit = n;
        }
        config.smtp_configured = env::var("SMTP_HOST").is_ok();
        config
    }
}

pub fn rocket() -> rocket::Rocket<rocket::Build> {
    let db_path = env::var("DB_PATH").unwrap_or_else(|_| "data/relay.db".to_string());
    rocket_with_db(&db_path)
}

pub fn rocket_with_db(db_path: &str) -> rocket::Rocket<rocket::Build> {
    rocket_with_db_and_config(db_path, RelayConfig::from_env())
}

pub fn rocket_with_db_and_config(
    db_path: &str,
    config: RelayConfig,
) -> rocket::Rocket<rocket::Build> {
    // Ensure data directory exists
    if let Some(parent) = std::path::Path::new(db_path).parent() {
        std::fs::create_dir_all(parent).ok();
    }

    let db = Db::new(db_path);

    let cors = CorsOptions::default()
        .to_cors()
        .expect("Failed to create CORS");

    let mut figment = rocket::Config::figment();
    if let Ok(port) = env::var("PORT")
        && let Ok(port) = port.parse::<u16>()
    {
        figment = figment.merge(("port", port));
    }

    rocket::custom(figment)
        .manage(db)
        .manage(config)
        .attach(cors)
        .register(
            "/",
            rocket::catchers![routes::too_many_requests, routes::not_found],
        )
        .mount(
            "/",
            rocket::routes![
                routes::health,
                routes::stats,
                routes::verify_send,
                routes::verify_confirm,
                routes::register_agent,
                routes::lookup_agent,
                routes::list_agents_gone,
                routes::approve_agent_gone,
                routes::reject_agent_gone,
                routes::revoke_agent,
                routes::rotate_key,
                routes::recover_agent,
                routes::request_contact,
                routes::list_pending,
                routes::accept_contact,
                routes::deny_contact,
                routes::list_contacts,
                routes::remove_contact,
                routes::update_presence,
                routes::admin_keys,
                routes::create_broadcast,
                routes::list_broadcasts,
                routes::create_group,
                routes::list_groups,
                routes::list_invitations,
                routes::get_group,
                routes::dissolve_group,
                routes::invite_member,
                routes::accept_invitation,
                routes::decline_invitation,
                routes::leave_group,
                routes::transfer_ownership,
                routes::list_members,
                routes::remove_member,
                routes::get_changes,
            ],
        )
}

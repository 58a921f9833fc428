use rusqlite::Connection;
use std::sync::Mutex;

pub struct Db {
    pub conn: Mutex<Connection>,
}

/// Latest schema generation. `initialize` applies every migration above the
/// stored `schema_version` and writes this back.
pub const SCHEMA_VERSION: i64 = 2;

impl Db {
    pub fn new(path: &str) -> Self {
        let conn = Connection::open(path).expect("Failed to open database");
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .expect("Failed to set pragmas");
        let db = Db {
            conn: Mutex::new(conn),
        };
        db.initialize();
        db
    }

    /// Open-or-create migration entry point. Idempotent: re-running on an
    /// up-to-date database touches no data; running on a legacy database
    /// preserves agent and contact rows, drops the retired `messages` /
    /// `nonces` tables, and fills in the newer columns and tables.
    pub fn initialize(&self) {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);",
        )
        .expect("Failed to create schema_version table");
        let current: i64 = conn
            .query_row("SELECT version FROM schema_version", [], |r| r.get(0))
            .unwrap_or(0);
        if current == 0 {
            conn.execute("DELETE FROM schema_version", []).ok();
            conn.execute("INSERT INTO schema_version (version) VALUES (0)", [])
                .expect("Failed to seed schema_version");
        }

        // Each generation runs in its own transaction so a failed migration
        // leaves the stored version pointing at the last complete one.
        for (generation, migrate) in [(1, migrate_v1 as MigrationFn), (2, migrate_v2)] {
            if current >= generation {
                continue;
            }
            let tx = conn
                .transaction()
                .expect("Failed to open migration transaction");
            migrate(&tx).expect("Migration failed");
            tx.execute("UPDATE schema_version SET version = ?1", [generation])
                .expect("Failed to update schema_version");
            tx.commit().expect("Failed to commit migration");
        }
    }
}

type MigrationFn = fn(&Connection) -> rusqlite::Result<()>;

/// Generation 1: the base relational layout.
fn migrate_v1(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS agents (
            name TEXT PRIMARY KEY CHECK (length(name) BETWEEN 1 AND 64),
            public_key TEXT NOT NULL UNIQUE,
            owner_email TEXT UNIQUE,
            endpoint TEXT,
            email_verified INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'active'
                CHECK (status IN ('pending', 'active', 'revoked')),
            last_seen TEXT,
            created_at TEXT NOT NULL,
            approved_by TEXT,
            approved_at TEXT
        );

        CREATE TABLE IF NOT EXISTS contacts (
            agent_a TEXT NOT NULL REFERENCES agents(name),
            agent_b TEXT NOT NULL REFERENCES agents(name),
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'active', 'denied', 'removed')),
            requested_by TEXT NOT NULL REFERENCES agents(name),
            greeting TEXT,
            denial_count INTEGER NOT NULL DEFAULT 0 CHECK (denial_count >= 0),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (agent_a, agent_b),
            CHECK (agent_a < agent_b)
        );

        CREATE TABLE IF NOT EXISTS email_verifications (
            agent_name TEXT PRIMARY KEY,
            email TEXT NOT NULL,
            code_hash TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            expires_at TEXT NOT NULL,
            verified INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS admins (
            agent TEXT PRIMARY KEY REFERENCES agents(name),
            admin_public_key TEXT NOT NULL,
            added_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS broadcasts (
            id TEXT PRIMARY KEY,
            type TEXT NOT NULL CHECK (type IN
                ('security-alert', 'maintenance', 'update', 'announcement', 'revocation')),
            payload TEXT NOT NULL,
            sender TEXT NOT NULL REFERENCES agents(name),
            signature TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS rate_limits (
            key TEXT PRIMARY KEY,
            count INTEGER NOT NULL DEFAULT 0,
            window_start TEXT NOT NULL
        );",
    )
}

/// Generation 2: retire the relay-side message store and add the contact-block
/// and group layouts. The relay must never persist message content, so any
/// legacy `messages` / `nonces` tables are dropped outright.
fn migrate_v2(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "DROP TABLE IF EXISTS messages;
         DROP TABLE IF EXISTS nonces;",
    )?;

    // Column adds are idempotent the usual way: ignore "duplicate column"
    // on databases that already carry them.
    conn.execute_batch("ALTER TABLE agents ADD COLUMN key_updated_at TEXT;")
        .ok();
    conn.execute_batch("ALTER TABLE agents ADD COLUMN pending_public_key TEXT;")
        .ok();
    conn.execute_batch("ALTER TABLE agents ADD COLUMN recovery_initiated_at TEXT;")
        .ok();

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS blocks (
            blocker TEXT NOT NULL REFERENCES agents(name),
            blocked TEXT NOT NULL REFERENCES agents(name),
            created_at TEXT NOT NULL,
            PRIMARY KEY (blocker, blocked)
        );

        CREATE TABLE IF NOT EXISTS groups (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL CHECK (length(name) BETWEEN 1 AND 64),
            owner TEXT NOT NULL REFERENCES agents(name),
            status TEXT NOT NULL DEFAULT 'active'
                CHECK (status IN ('active', 'dissolved')),
            members_can_invite INTEGER NOT NULL DEFAULT 0,
            members_can_send INTEGER NOT NULL DEFAULT 1,
            max_members INTEGER NOT NULL DEFAULT 50 CHECK (max_members BETWEEN 1 AND 50),
            created_at TEXT NOT NULL,
            dissolved_at TEXT
        );

        CREATE TABLE IF NOT EXISTS group_memberships (
            group_id TEXT NOT NULL REFERENCES groups(id),
            agent TEXT NOT NULL REFERENCES agents(name),
            role TEXT NOT NULL DEFAULT 'member'
                CHECK (role IN ('owner', 'admin', 'member')),
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'active', 'left', 'removed')),
            invited_by TEXT,
            greeting TEXT CHECK (greeting IS NULL OR length(greeting) <= 500),
            joined_at TEXT,
            left_at TEXT,
            created_at TEXT NOT NULL,
            PRIMARY KEY (group_id, agent)
        );

        CREATE INDEX IF NOT EXISTS idx_memberships_agent ON group_memberships(agent);
        CREATE INDEX IF NOT EXISTS idx_memberships_status ON group_memberships(status);",
    )
}

//! v001 -- Initial schema creation.
//!
//! Users and their device sessions, threads, signal messages with their three
//! delivery-state sets, contact relation records and leases.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    phone_full   TEXT PRIMARY KEY NOT NULL,   -- canonical full phone number
    phone        TEXT NOT NULL,
    country_code TEXT NOT NULL,
    username     TEXT UNIQUE,
    first_name   TEXT NOT NULL DEFAULT '',
    last_name    TEXT NOT NULL DEFAULT '',
    avatar       TEXT,
    created_at   INTEGER NOT NULL             -- unix millis
);

CREATE TABLE IF NOT EXISTS user_sessions (
    phone_full           TEXT NOT NULL,
    session_id           TEXT NOT NULL,
    device_name          TEXT NOT NULL DEFAULT '',
    device_kind          TEXT NOT NULL,       -- 'android' | 'ios'
    os_version           TEXT NOT NULL DEFAULT '',
    online               INTEGER NOT NULL DEFAULT 0,
    push_token           TEXT,                -- primary slot
    secondary_push_token TEXT,                -- secondary slot (iOS remote)
    bundle_id            TEXT,
    app_id               TEXT,
    created_at           INTEGER NOT NULL,

    PRIMARY KEY (phone_full, session_id),
    FOREIGN KEY (phone_full) REFERENCES users(phone_full) ON DELETE CASCADE
);

-- Membership index: which group threads a user belongs to.
CREATE TABLE IF NOT EXISTS user_group_threads (
    phone_full TEXT NOT NULL,
    thread_id  TEXT NOT NULL,

    PRIMARY KEY (phone_full, thread_id)
);

-- ----------------------------------------------------------------
-- Threads
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS signal_threads (
    thread_id        TEXT PRIMARY KEY NOT NULL,
    kind             TEXT NOT NULL,           -- 'solo' | 'group'
    group_name       TEXT NOT NULL DEFAULT '',
    creator          TEXT,
    all_participants TEXT NOT NULL,           -- JSON array
    participants     TEXT NOT NULL,           -- JSON array
    admins           TEXT NOT NULL,           -- JSON array
    created_at       INTEGER NOT NULL,
    last_modified    INTEGER NOT NULL
);

-- ----------------------------------------------------------------
-- Signal messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS signal_msgs (
    msg_id                TEXT PRIMARY KEY NOT NULL,
    thread_id             TEXT NOT NULL,
    thread_kind           TEXT NOT NULL,
    from_user             TEXT NOT NULL,
    to_user               TEXT NOT NULL,
    to_sessions_whitelist TEXT NOT NULL DEFAULT '[]',  -- JSON array
    payload               BLOB NOT NULL,               -- encoded envelope
    created_at            INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_signal_msgs_thread_created
    ON signal_msgs(thread_id, created_at);
CREATE INDEX IF NOT EXISTS idx_signal_msgs_from ON signal_msgs(from_user, created_at);
CREATE INDEX IF NOT EXISTS idx_signal_msgs_to ON signal_msgs(to_user, created_at);

-- Append-only delivery-state sets. Primary keys give set-union semantics.
CREATE TABLE IF NOT EXISTS msg_received_sessions (
    msg_id     TEXT NOT NULL,
    session_id TEXT NOT NULL,
    PRIMARY KEY (msg_id, session_id),
    FOREIGN KEY (msg_id) REFERENCES signal_msgs(msg_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS msg_seen_users (
    msg_id     TEXT NOT NULL,
    phone_full TEXT NOT NULL,
    PRIMARY KEY (msg_id, phone_full),
    FOREIGN KEY (msg_id) REFERENCES signal_msgs(msg_id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS msg_deleted_for (
    msg_id     TEXT NOT NULL,
    phone_full TEXT NOT NULL,
    PRIMARY KEY (msg_id, phone_full),
    FOREIGN KEY (msg_id) REFERENCES signal_msgs(msg_id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Contact relation records
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS user_contacts (
    phone_full TEXT PRIMARY KEY NOT NULL,
    contacts   TEXT NOT NULL                  -- JSON object phone -> Contact
);

CREATE TABLE IF NOT EXISTS phone_in_user_contacts (
    phone_full TEXT PRIMARY KEY NOT NULL,
    users      TEXT NOT NULL                  -- JSON object phone -> ContactSession
);

-- ----------------------------------------------------------------
-- Leases
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS leases (
    name       TEXT PRIMARY KEY NOT NULL,
    token      TEXT NOT NULL,                 -- holder token
    expires_at INTEGER NOT NULL               -- unix millis
);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}

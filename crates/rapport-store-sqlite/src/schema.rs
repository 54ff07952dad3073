//! SQL schema for the Rapport SQLite store.
//!
//! Executed once at connection startup. Future migrations will be gated on
//! `PRAGMA user_version`.

/// Full schema DDL; idempotent thanks to `IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- Directed edges. Rows are never deleted; retirement is status 'removed'.
CREATE TABLE IF NOT EXISTS relationships (
    relationship_id TEXT PRIMARY KEY,
    from_user       TEXT NOT NULL,
    to_user         TEXT NOT NULL,
    kind            TEXT NOT NULL,   -- 'follow' | 'friend_request' | 'block' | 'mute'
    status          TEXT NOT NULL,
    suppressed_from TEXT,            -- status to restore on unblock
    created_at      TEXT NOT NULL,   -- fixed-width RFC 3339, sorts as text
    updated_at      TEXT NOT NULL,
    CHECK (from_user != to_user)
);

-- At most one live row per (from, to, kind).
CREATE UNIQUE INDEX IF NOT EXISTS relationships_live_idx
    ON relationships(from_user, to_user, kind)
    WHERE status != 'removed';

CREATE INDEX IF NOT EXISTS relationships_from_idx ON relationships(from_user, kind, status);
CREATE INDEX IF NOT EXISTS relationships_to_idx   ON relationships(to_user, kind, status);
CREATE INDEX IF NOT EXISTS relationships_page_idx ON relationships(created_at DESC, relationship_id);

CREATE TABLE IF NOT EXISTS rate_limits (
    principal      TEXT NOT NULL,    -- 'user:<uuid>' | 'group:<uuid>'
    action         TEXT NOT NULL,
    window_start   TEXT NOT NULL,
    count          INTEGER NOT NULL,
    last_action_at TEXT NOT NULL,
    PRIMARY KEY (principal, action)
);

CREATE TABLE IF NOT EXISTS spam_flags (
    user_id         TEXT NOT NULL,
    detection_type  TEXT NOT NULL,
    score           REAL NOT NULL,
    flagged_at      TEXT NOT NULL,
    last_updated_at TEXT NOT NULL,
    PRIMARY KEY (user_id, detection_type)
);

CREATE TABLE IF NOT EXISTS account_groups (
    group_id     TEXT PRIMARY KEY,
    created_at   TEXT NOT NULL,
    dissolved_at TEXT
);

-- A user belongs to at most one group.
CREATE TABLE IF NOT EXISTS group_members (
    user_id    TEXT PRIMARY KEY,
    group_id   TEXT NOT NULL REFERENCES account_groups(group_id),
    is_primary INTEGER NOT NULL DEFAULT 0,
    joined_at  TEXT NOT NULL
);

-- At most one primary per group.
CREATE UNIQUE INDEX IF NOT EXISTS group_members_primary_idx
    ON group_members(group_id)
    WHERE is_primary = 1;

CREATE INDEX IF NOT EXISTS group_members_group_idx ON group_members(group_id);

PRAGMA user_version = 1;
";

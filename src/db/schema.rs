/// Schema for the cache store, outbox and generation tables.
pub const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

-- Named cache partitions, one per (kind, generation)
CREATE TABLE IF NOT EXISTS cache_regions (
    name TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    generation TEXT NOT NULL,
    created_at TEXT NOT NULL
);

-- Stored request/response pairs
CREATE TABLE IF NOT EXISTS cache_entries (
    region TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    PRIMARY KEY (region, key_hash),
    FOREIGN KEY (region) REFERENCES cache_regions(name) ON DELETE CASCADE
);

-- Sales that could not reach the server
CREATE TABLE IF NOT EXISTS outbox (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    synced INTEGER NOT NULL DEFAULT 0,
    synced_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_outbox_pending ON outbox(synced, id);

-- Lifecycle state per generation
CREATE TABLE IF NOT EXISTS generations (
    tag TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    installed_at TEXT,
    activated_at TEXT
);
"#;

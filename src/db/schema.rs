/// Schema for the local record database.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS object_stores (
    name TEXT PRIMARY KEY,
    key_path TEXT NOT NULL
);

-- Records keyed by the JSON encoding of their key, so 1 and "1" stay distinct
CREATE TABLE IF NOT EXISTS records (
    store TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (store, key)
);
"#;

//! Database schema and migrations for Hoard.
//!
//! Migrations are applied in order when the database is opened; the
//! schema_version table records how many have run.

/// Database migrations.
///
/// Each entry is a script of `;`-terminated statements.
pub const MIGRATIONS: &[&str] = &[
    // v1: users, content records, folders, files
    r#"
CREATE TABLE users (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    username       TEXT NOT NULL UNIQUE COLLATE NOCASE,
    is_admin       INTEGER NOT NULL DEFAULT 0,
    storage_quota  INTEGER NOT NULL,
    storage_used   INTEGER NOT NULL DEFAULT 0 CHECK (storage_used >= 0),
    created_at     TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per distinct byte sequence; ref_count = number of files pointing here
CREATE TABLE content_records (
    hash        TEXT PRIMARY KEY,
    size        INTEGER NOT NULL CHECK (size >= 0),
    mime_type   TEXT NOT NULL,
    ref_count   INTEGER NOT NULL CHECK (ref_count >= 0),
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE folders (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id    INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    name        TEXT NOT NULL,
    parent_id   INTEGER REFERENCES folders(id) ON DELETE CASCADE,
    is_public   INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at  TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX idx_folders_owner_id ON folders(owner_id);
CREATE INDEX idx_folders_parent_id ON folders(parent_id);

-- Owner and content references are RESTRICT: files must be released through the store
CREATE TABLE files (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id      INTEGER NOT NULL REFERENCES users(id),
    content_hash  TEXT NOT NULL REFERENCES content_records(hash),
    name          TEXT NOT NULL,
    folder_id     INTEGER REFERENCES folders(id) ON DELETE SET NULL,
    is_public     INTEGER NOT NULL DEFAULT 0,
    downloads     INTEGER NOT NULL DEFAULT 0,
    created_at    TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at    TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX idx_files_owner_id ON files(owner_id);
CREATE INDEX idx_files_folder_id ON files(folder_id);
CREATE INDEX idx_files_content_hash ON files(content_hash);
"#,
    // v2: tags and quota attribution
    r#"
CREATE TABLE file_tags (
    file_id  INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
    tag      TEXT NOT NULL,
    PRIMARY KEY (file_id, tag)
);

CREATE INDEX idx_file_tags_tag ON file_tags(tag);

-- Which user a content record's bytes are counted against
CREATE TABLE quota_charges (
    user_id       INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    content_hash  TEXT NOT NULL,
    bytes         INTEGER NOT NULL CHECK (bytes >= 0),
    PRIMARY KEY (user_id, content_hash)
);
"#,
    // v3: share grants
    r#"
CREATE TABLE file_shares (
    file_id     INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
    grantee_id  INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    permission  TEXT NOT NULL CHECK (permission IN ('read', 'write', 'admin')),
    created_at  TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (file_id, grantee_id)
);

CREATE TABLE folder_shares (
    folder_id   INTEGER NOT NULL REFERENCES folders(id) ON DELETE CASCADE,
    grantee_id  INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    permission  TEXT NOT NULL CHECK (permission IN ('read', 'write', 'admin')),
    created_at  TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (folder_id, grantee_id)
);

CREATE INDEX idx_file_shares_grantee ON file_shares(grantee_id);
CREATE INDEX idx_folder_shares_grantee ON folder_shares(grantee_id);
"#,
];

/// Split a migration script into individual statements.
///
/// Comment lines are dropped; empty statements are skipped.
pub fn statements(script: &str) -> Vec<String> {
    let without_comments: String = script
        .lines()
        .filter(|line| !line.trim_start().starts_with("--"))
        .collect::<Vec<_>>()
        .join("\n");

    without_comments
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

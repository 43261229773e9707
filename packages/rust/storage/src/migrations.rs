//! SQL migration definitions for the CELIA database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Append-only output log",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per persisted artifact version
CREATE TABLE IF NOT EXISTS outputs (
    id            TEXT PRIMARY KEY,
    expedient_id  TEXT NOT NULL,
    document_type TEXT NOT NULL,
    section_id    TEXT NOT NULL,
    node_tag      TEXT NOT NULL CHECK (node_tag IN ('structured', 'narrative')),
    version       INTEGER NOT NULL CHECK (version >= 1),
    hash          TEXT NOT NULL,
    artifact_json TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    UNIQUE(expedient_id, document_type, section_id, node_tag, version)
);

CREATE INDEX IF NOT EXISTS idx_outputs_expedient ON outputs(expedient_id, section_id);

-- Rows are never rewritten or removed
CREATE TRIGGER IF NOT EXISTS outputs_no_update BEFORE UPDATE ON outputs BEGIN
    SELECT RAISE(ABORT, 'outputs is append-only: UPDATE rejected');
END;

CREATE TRIGGER IF NOT EXISTS outputs_no_delete BEFORE DELETE ON outputs BEGIN
    SELECT RAISE(ABORT, 'outputs is append-only: DELETE rejected');
END;

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Retrieval snippet corpus with FTS5",
            sql: r#"
CREATE TABLE IF NOT EXISTS snippets (
    id           TEXT PRIMARY KEY,
    source_id    TEXT NOT NULL,
    source_title TEXT NOT NULL,
    page         INTEGER,
    text         TEXT NOT NULL,
    created_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_snippets_source ON snippets(source_id);

CREATE VIRTUAL TABLE IF NOT EXISTS snippets_fts USING fts5(
    text,
    source_title,
    content=snippets,
    content_rowid=rowid,
    tokenize='unicode61 remove_diacritics 2'
);

-- Triggers to keep FTS in sync with the snippets table
CREATE TRIGGER IF NOT EXISTS snippets_fts_insert AFTER INSERT ON snippets BEGIN
    INSERT INTO snippets_fts(rowid, text, source_title)
    VALUES (new.rowid, new.text, new.source_title);
END;

CREATE TRIGGER IF NOT EXISTS snippets_fts_delete AFTER DELETE ON snippets BEGIN
    INSERT INTO snippets_fts(snippets_fts, rowid, text, source_title)
    VALUES ('delete', old.rowid, old.text, old.source_title);
END;

CREATE TRIGGER IF NOT EXISTS snippets_fts_update AFTER UPDATE ON snippets BEGIN
    INSERT INTO snippets_fts(snippets_fts, rowid, text, source_title)
    VALUES ('delete', old.rowid, old.text, old.source_title);
    INSERT INTO snippets_fts(rowid, text, source_title)
    VALUES (new.rowid, new.text, new.source_title);
END;

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}

//! Turso Embedded / libSQL storage layer.
//!
//! The [`Storage`] struct wraps a libSQL database holding:
//! - the append-only output log of structured and narrative artifacts
//! - the retrieval snippet corpus, indexed with FTS5
//!
//! **Access rules:**
//! - generation commands: read-write via [`Storage::open`]
//! - inspection commands: read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use chrono::{DateTime, Utc};
use celia_shared::{
    CeliaError, DocumentType, NarrativeArtifact, NodeTag, Result, Snippet, StructuredArtifact,
};
use libsql::{Connection, Database, params};
use serde_json::Value;
use uuid::Uuid;

/// Most query terms passed to a single FTS5 match.
const MAX_QUERY_TERMS: usize = 32;

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

/// One row of the output log.
#[derive(Debug, Clone)]
pub struct OutputRecord {
    pub id: String,
    pub expedient_id: String,
    pub document_type: DocumentType,
    pub section_id: String,
    pub node: NodeTag,
    pub version: u32,
    pub hash: String,
    pub created_at: DateTime<Utc>,
    /// The artifact exactly as it was persisted.
    pub artifact: Value,
}

fn storage_err(e: impl std::fmt::Display) -> CeliaError {
    CeliaError::Storage(e.to_string())
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CeliaError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(CeliaError::Storage(format!(
                "database not found at {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    CeliaError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(CeliaError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Output log
    // -----------------------------------------------------------------------

    /// Append a structured artifact. Returns the new record id.
    pub async fn append_structured(&self, artifact: &StructuredArtifact) -> Result<String> {
        self.check_writable()?;
        let json = serde_json::to_string(artifact).map_err(storage_err)?;
        insert_output(&self.conn, OutputRow::structured(artifact, &json)).await
    }

    /// Append a narrative artifact. Returns the new record id.
    pub async fn append_narrative(&self, artifact: &NarrativeArtifact) -> Result<String> {
        self.check_writable()?;
        let json = serde_json::to_string(artifact).map_err(storage_err)?;
        insert_output(&self.conn, OutputRow::narrative(artifact, &json)).await
    }

    /// Append a structured artifact and its narrative in one transaction.
    /// Either both rows are recorded or neither is. Returns both record ids.
    pub async fn append_pair(
        &self,
        structured: &StructuredArtifact,
        narrative: &NarrativeArtifact,
    ) -> Result<(String, String)> {
        self.check_writable()?;
        let structured_json = serde_json::to_string(structured).map_err(storage_err)?;
        let narrative_json = serde_json::to_string(narrative).map_err(storage_err)?;

        let tx = self.conn.transaction().await.map_err(storage_err)?;
        let structured_id =
            match insert_output(&tx, OutputRow::structured(structured, &structured_json)).await {
                Ok(id) => id,
                Err(e) => {
                    tx.rollback().await.map_err(storage_err)?;
                    return Err(e);
                }
            };
        let narrative_id =
            match insert_output(&tx, OutputRow::narrative(narrative, &narrative_json)).await {
                Ok(id) => id,
                Err(e) => {
                    tx.rollback().await.map_err(storage_err)?;
                    return Err(e);
                }
            };
        tx.commit().await.map_err(storage_err)?;
        Ok((structured_id, narrative_id))
    }

    /// Highest recorded version and its hash for one artifact stream.
    pub async fn latest_version(
        &self,
        expedient_id: &str,
        document_type: DocumentType,
        section_id: &str,
        node: NodeTag,
    ) -> Result<Option<(u32, String)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT version, hash FROM outputs
                 WHERE expedient_id = ?1 AND document_type = ?2 AND section_id = ?3 AND node_tag = ?4
                 ORDER BY version DESC
                 LIMIT 1",
                params![expedient_id, document_type.as_str(), section_id, node.as_str()],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some((
                row.get::<u32>(0).map_err(storage_err)?,
                row.get::<String>(1).map_err(storage_err)?,
            ))),
            Ok(None) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    /// All outputs for an expedient, optionally limited to one section,
    /// ordered by section, version, then node.
    pub async fn list_outputs(
        &self,
        expedient_id: &str,
        section_id: Option<&str>,
    ) -> Result<Vec<OutputRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, expedient_id, document_type, section_id, node_tag, version, hash, created_at, artifact_json
                 FROM outputs
                 WHERE expedient_id = ?1 AND (?2 IS NULL OR section_id = ?2)
                 ORDER BY section_id, version, node_tag DESC",
                params![expedient_id, section_id],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_output(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Snippet corpus
    // -----------------------------------------------------------------------

    /// Add a passage to the retrieval corpus. Returns the snippet id.
    pub async fn insert_snippet(
        &self,
        source_id: &str,
        source_title: &str,
        page: Option<u32>,
        text: &str,
    ) -> Result<String> {
        self.check_writable()?;
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO snippets (id, source_id, source_title, page, text, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.as_str(),
                    source_id,
                    source_title,
                    page.map(i64::from),
                    text,
                    now.as_str(),
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(id)
    }

    /// Full-text search over the corpus, best match first.
    ///
    /// Free text is turned into an OR of quoted terms, so user punctuation
    /// never reaches the FTS5 query parser.
    pub async fn search_snippets(&self, query: &str, limit: u32) -> Result<Vec<Snippet>> {
        let Some(match_expr) = fts_query(query) else {
            return Ok(Vec::new());
        };

        let mut rows = self
            .conn
            .query(
                "SELECT s.text, s.source_title, s.source_id, s.page, bm25(snippets_fts) AS rank
                 FROM snippets_fts
                 JOIN snippets s ON s.rowid = snippets_fts.rowid
                 WHERE snippets_fts MATCH ?1
                 ORDER BY rank
                 LIMIT ?2",
                params![match_expr.as_str(), limit],
            )
            .await
            .map_err(storage_err)?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let rank: f64 = row.get(4).unwrap_or(0.0);
            results.push(Snippet {
                text: row.get::<String>(0).map_err(storage_err)?,
                source_title: row.get::<String>(1).map_err(storage_err)?,
                source_id: row.get::<String>(2).map_err(storage_err)?,
                page: row.get::<i64>(3).ok().and_then(|p| u32::try_from(p).ok()),
                // bm25 is lower-is-better
                score: -rank,
            });
        }
        Ok(results)
    }
}

struct OutputRow<'a> {
    expedient_id: &'a str,
    document_type: DocumentType,
    section_id: &'a str,
    node: NodeTag,
    version: u32,
    hash: &'a str,
    json: &'a str,
}

impl<'a> OutputRow<'a> {
    fn structured(artifact: &'a StructuredArtifact, json: &'a str) -> Self {
        Self {
            expedient_id: &artifact.expedient_id,
            document_type: artifact.document_type,
            section_id: &artifact.section_id,
            node: NodeTag::Structured,
            version: artifact.version,
            hash: &artifact.hash,
            json,
        }
    }

    fn narrative(artifact: &'a NarrativeArtifact, json: &'a str) -> Self {
        Self {
            expedient_id: &artifact.expedient_id,
            document_type: artifact.document_type,
            section_id: &artifact.section_id,
            node: NodeTag::Narrative,
            version: artifact.version,
            hash: &artifact.hash,
            json,
        }
    }
}

/// Insert one output-log row on `conn` (a plain connection or an open
/// transaction). Returns the new record id.
async fn insert_output(conn: &Connection, row: OutputRow<'_>) -> Result<String> {
    let id = Uuid::now_v7().to_string();
    let now = Utc::now().to_rfc3339();

    conn.execute(
        "INSERT INTO outputs (id, expedient_id, document_type, section_id, node_tag, version, hash, artifact_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            id.as_str(),
            row.expedient_id,
            row.document_type.as_str(),
            row.section_id,
            row.node.as_str(),
            row.version,
            row.hash,
            row.json,
            now.as_str(),
        ],
    )
    .await
    .map_err(|e| {
        let message = e.to_string();
        if message.contains("UNIQUE") {
            CeliaError::Storage(format!(
                "version {} of {} {} ({}) is already recorded for expedient {}",
                row.version,
                row.document_type,
                row.section_id,
                row.node.as_str(),
                row.expedient_id
            ))
        } else {
            CeliaError::Storage(message)
        }
    })?;

    tracing::debug!(
        %id,
        expedient = row.expedient_id,
        section = row.section_id,
        node = row.node.as_str(),
        version = row.version,
        "output appended"
    );
    Ok(id)
}

/// Build an FTS5 match expression from free text.
fn fts_query(text: &str) -> Option<String> {
    let terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 2)
        .take(MAX_QUERY_TERMS)
        .map(|w| format!("\"{}\"", w.to_lowercase()))
        .collect();
    (!terms.is_empty()).then(|| terms.join(" OR "))
}

/// Convert a database row to an [`OutputRecord`].
fn row_to_output(row: &libsql::Row) -> Result<OutputRecord> {
    let document_type: String = row.get(2).map_err(storage_err)?;
    let node: String = row.get(4).map_err(storage_err)?;
    let created_at: String = row.get(7).map_err(storage_err)?;
    let json: String = row.get(8).map_err(storage_err)?;

    Ok(OutputRecord {
        id: row.get::<String>(0).map_err(storage_err)?,
        expedient_id: row.get::<String>(1).map_err(storage_err)?,
        document_type: document_type.parse()?,
        section_id: row.get::<String>(3).map_err(storage_err)?,
        node: node.parse()?,
        version: row.get::<u32>(5).map_err(storage_err)?,
        hash: row.get::<String>(6).map_err(storage_err)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| CeliaError::Storage(format!("invalid date: {e}")))?,
        artifact: serde_json::from_str(&json)
            .map_err(|e| CeliaError::Storage(format!("corrupt artifact json: {e}")))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use celia_shared::{ARTIFACT_SCHEMA_VERSION, Actor, NarrativeRefs};
    use serde_json::{Map, json};

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("celia_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn structured(version: u32, hash: &str) -> StructuredArtifact {
        let mut data = Map::new();
        data.insert("JN.1".into(), json!({"objeto": "Portátiles"}));
        StructuredArtifact {
            schema_version: ARTIFACT_SCHEMA_VERSION.into(),
            expedient_id: "EXP-001".into(),
            document_type: DocumentType::Jn,
            section_id: "JN.1".into(),
            version,
            actor: Actor::Llm,
            timestamp: Utc::now(),
            node: NodeTag::Structured,
            previous_hash: None,
            data,
            missing: vec![],
            alerts: vec![],
            citations: vec![],
            dependencies: vec![],
            repaired: false,
            hash: hash.into(),
        }
    }

    fn narrative(version: u32, structured_hash: &str) -> NarrativeArtifact {
        NarrativeArtifact {
            schema_version: ARTIFACT_SCHEMA_VERSION.into(),
            expedient_id: "EXP-001".into(),
            document_type: DocumentType::Jn,
            section_id: "JN.1".into(),
            version,
            actor: Actor::Llm,
            timestamp: Utc::now(),
            node: NodeTag::Narrative,
            narrative: "Se adquirirán portátiles.".into(),
            refs: NarrativeRefs {
                structured_hash: structured_hash.into(),
                citations: vec![],
            },
            hash: format!("n-{structured_hash}"),
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        assert_eq!(storage.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("celia_test_{}.db", Uuid::now_v7()));
        let s1 = Storage::open(&tmp).await.expect("first open");
        drop(s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn append_and_list_outputs() {
        let storage = test_storage().await;
        storage.append_structured(&structured(1, "h1")).await.expect("append v1");
        storage.append_narrative(&narrative(1, "h1")).await.expect("append narrative");
        storage.append_structured(&structured(2, "h2")).await.expect("append v2");

        let outputs = storage.list_outputs("EXP-001", None).await.unwrap();
        assert_eq!(outputs.len(), 3);
        assert_eq!(outputs[0].version, 1);
        assert_eq!(outputs[0].node, NodeTag::Structured);
        assert_eq!(outputs[1].node, NodeTag::Narrative);
        assert_eq!(outputs[1].artifact["refs"]["hash_json_A"], "h1");
        assert_eq!(outputs[2].hash, "h2");

        let other = storage.list_outputs("EXP-001", Some("JN.2")).await.unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn pair_is_written_together() {
        let storage = test_storage().await;
        let (structured_id, narrative_id) = storage
            .append_pair(&structured(1, "h1"), &narrative(1, "h1"))
            .await
            .unwrap();
        assert_ne!(structured_id, narrative_id);
        assert_eq!(storage.list_outputs("EXP-001", None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_pair_leaves_no_structured_row() {
        let storage = test_storage().await;
        // A narrative v2 already exists, so the pair's second insert collides.
        storage.append_narrative(&narrative(2, "h2")).await.unwrap();

        let err = storage
            .append_pair(&structured(2, "h2"), &narrative(2, "h2"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already recorded"));

        let outputs = storage.list_outputs("EXP-001", None).await.unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].node, NodeTag::Narrative);
        let latest = storage
            .latest_version("EXP-001", DocumentType::Jn, "JN.1", NodeTag::Structured)
            .await
            .unwrap();
        assert!(latest.is_none());
    }

    #[tokio::test]
    async fn latest_version_is_highest() {
        let storage = test_storage().await;
        let none = storage
            .latest_version("EXP-001", DocumentType::Jn, "JN.1", NodeTag::Structured)
            .await
            .unwrap();
        assert!(none.is_none());

        storage.append_structured(&structured(2, "h2")).await.unwrap();
        storage.append_structured(&structured(1, "h1")).await.unwrap();

        let latest = storage
            .latest_version("EXP-001", DocumentType::Jn, "JN.1", NodeTag::Structured)
            .await
            .unwrap();
        assert_eq!(latest, Some((2, "h2".to_string())));
    }

    #[tokio::test]
    async fn duplicate_version_rejected() {
        let storage = test_storage().await;
        storage.append_structured(&structured(1, "h1")).await.unwrap();
        let err = storage
            .append_structured(&structured(1, "other"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already recorded"));
    }

    #[tokio::test]
    async fn outputs_are_append_only() {
        let storage = test_storage().await;
        storage.append_structured(&structured(1, "h1")).await.unwrap();

        let update = storage
            .conn
            .execute("UPDATE outputs SET hash = 'tampered'", params![])
            .await;
        assert!(update.is_err());

        let delete = storage.conn.execute("DELETE FROM outputs", params![]).await;
        assert!(delete.is_err());

        let outputs = storage.list_outputs("EXP-001", None).await.unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].hash, "h1");
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("celia_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        assert!(ro.append_structured(&structured(1, "h1")).await.is_err());
        assert!(ro.insert_snippet("s", "t", None, "texto").await.is_err());
    }

    #[tokio::test]
    async fn readonly_requires_existing_db() {
        let tmp = std::env::temp_dir().join(format!("celia_missing_{}.db", Uuid::now_v7()));
        assert!(Storage::open_readonly(&tmp).await.is_err());
    }

    #[tokio::test]
    async fn snippet_search_ranks_matches() {
        let storage = test_storage().await;
        storage
            .insert_snippet(
                "lcsp-28",
                "LCSP artículo 28",
                Some(12),
                "Necesidad e idoneidad del contrato y eficiencia en la contratación",
            )
            .await
            .unwrap();
        storage
            .insert_snippet(
                "lcsp-99",
                "LCSP artículo 99",
                None,
                "Objeto del contrato y división en lotes",
            )
            .await
            .unwrap();
        storage
            .insert_snippet("ue-2021", "Reglamento UE 2021/241", None, "Publicidad de fondos europeos")
            .await
            .unwrap();

        let results = storage
            .search_snippets("¿Cuál es la idoneidad del contrato?", 5)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].source_id, "lcsp-28");
        assert_eq!(results[0].page, Some(12));
        assert!(results[0].score >= results[1].score);

        let lotes = storage.search_snippets("lotes", 5).await.unwrap();
        assert_eq!(lotes.len(), 1);
        assert_eq!(lotes[0].source_title, "LCSP artículo 99");
    }

    #[tokio::test]
    async fn empty_query_returns_nothing() {
        let storage = test_storage().await;
        storage.insert_snippet("a", "A", None, "texto").await.unwrap();
        assert!(storage.search_snippets("  ?! ", 5).await.unwrap().is_empty());
    }

    #[test]
    fn fts_query_quotes_terms() {
        assert_eq!(
            fts_query("objeto: \"portátiles\" (50)").as_deref(),
            Some("\"objeto\" OR \"portátiles\" OR \"50\"")
        );
        assert_eq!(fts_query("a ! b"), None);
    }
}

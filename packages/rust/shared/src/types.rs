//! Core domain types for CELIA artifacts.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CeliaError;

/// Current schema version for persisted artifacts.
pub const ARTIFACT_SCHEMA_VERSION: &str = "1.0.0";

// ---------------------------------------------------------------------------
// Identity enums
// ---------------------------------------------------------------------------

/// Procurement document an artifact belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DocumentType {
    /// Justificación de la Necesidad.
    Jn,
    /// Pliego de Prescripciones Técnicas.
    Ppt,
    /// Pliego de Cláusulas Administrativas Particulares.
    Pcap,
    /// Documento Europeo Único de Contratación.
    Deuc,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jn => "JN",
            Self::Ppt => "PPT",
            Self::Pcap => "PCAP",
            Self::Deuc => "DEUC",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = CeliaError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "JN" => Ok(Self::Jn),
            "PPT" => Ok(Self::Ppt),
            "PCAP" => Ok(Self::Pcap),
            "DEUC" => Ok(Self::Deuc),
            other => Err(CeliaError::validation(format!(
                "unknown document type '{other}'"
            ))),
        }
    }
}

/// Who produced an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    Llm,
    User,
    System,
}

/// Which half of the structured/narrative pair an artifact is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeTag {
    Structured,
    Narrative,
}

impl NodeTag {
    /// Storage key for the output log.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Structured => "structured",
            Self::Narrative => "narrative",
        }
    }
}

impl FromStr for NodeTag {
    type Err = CeliaError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "structured" => Ok(Self::Structured),
            "narrative" => Ok(Self::Narrative),
            other => Err(CeliaError::validation(format!("unknown node tag '{other}'"))),
        }
    }
}

/// Priority of an inferred dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// A field the builder could not fill or had to reject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingField {
    /// Dotted identifier, e.g. `JN.7.H1.mes`.
    pub field_id: String,
    /// Expected JSON type (`string`, `integer`, `number`, `boolean`, `array`, `object`).
    pub expected_type: String,
    /// Human-readable reason.
    pub reason: String,
    /// Node that detected the gap.
    pub origin_node: NodeTag,
}

/// A document-level dependency inferred from section contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub id: String,
    pub reason: String,
    pub priority: Priority,
}

/// A cited retrieval source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub source_id: String,
    pub source_title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
}

/// A ranked retrieval result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snippet {
    pub text: String,
    pub source_title: String,
    pub source_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    /// Higher is more relevant.
    #[serde(default)]
    pub score: f64,
}

impl Snippet {
    pub fn citation(&self) -> Citation {
        Citation {
            source_id: self.source_id.clone(),
            source_title: self.source_title.clone(),
            page: self.page,
        }
    }
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

/// Canonical structured facts for one section (JSON_A).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredArtifact {
    pub schema_version: String,
    pub expedient_id: String,
    pub document_type: DocumentType,
    pub section_id: String,
    /// Monotonic per (expedient, document, section), starting at 1.
    pub version: u32,
    pub actor: Actor,
    pub timestamp: DateTime<Utc>,
    pub node: NodeTag,
    /// Hash of the previous version of this section, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_hash: Option<String>,
    /// Section payloads keyed by section id.
    pub data: Map<String, Value>,
    #[serde(default)]
    pub missing: Vec<MissingField>,
    #[serde(default)]
    pub alerts: Vec<String>,
    #[serde(default)]
    pub citations: Vec<Citation>,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    /// Set once a repair pass replaced `data`.
    #[serde(default)]
    pub repaired: bool,
    /// SHA-256 over the canonical form of every other field.
    #[serde(default)]
    pub hash: String,
}

impl StructuredArtifact {
    /// The payload object for `section_id`, if present.
    pub fn section_payload(&self, section_id: &str) -> Option<&Map<String, Value>> {
        self.data.get(section_id).and_then(Value::as_object)
    }
}

/// Reference block tying a narrative to its structured source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrativeRefs {
    /// Hash of the structured artifact the narrative was generated from.
    #[serde(rename = "hash_json_A")]
    pub structured_hash: String,
    #[serde(default)]
    pub citations: Vec<Citation>,
}

/// Human-readable text derived from a structured artifact (JSON_B).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrativeArtifact {
    pub schema_version: String,
    pub expedient_id: String,
    pub document_type: DocumentType,
    pub section_id: String,
    pub version: u32,
    pub actor: Actor,
    pub timestamp: DateTime<Utc>,
    pub node: NodeTag,
    pub narrative: String,
    pub refs: NarrativeRefs,
    #[serde(default)]
    pub hash: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_type_parse_and_display() {
        let doc: DocumentType = "jn".parse().expect("parse JN");
        assert_eq!(doc, DocumentType::Jn);
        assert_eq!(doc.to_string(), "JN");
        assert!("XYZ".parse::<DocumentType>().is_err());
    }

    #[test]
    fn document_type_serializes_uppercase() {
        let json = serde_json::to_string(&DocumentType::Pcap).unwrap();
        assert_eq!(json, r#""PCAP""#);
    }

    #[test]
    fn narrative_refs_use_wire_name() {
        let refs = NarrativeRefs {
            structured_hash: "abc".into(),
            citations: vec![],
        };
        let json = serde_json::to_value(&refs).unwrap();
        assert_eq!(json["hash_json_A"], "abc");
    }

    #[test]
    fn structured_artifact_roundtrip() {
        let mut data = Map::new();
        data.insert(
            "JN.1".into(),
            serde_json::json!({"objeto": "Suministro de portátiles"}),
        );
        let artifact = StructuredArtifact {
            schema_version: ARTIFACT_SCHEMA_VERSION.into(),
            expedient_id: "EXP-001".into(),
            document_type: DocumentType::Jn,
            section_id: "JN.1".into(),
            version: 1,
            actor: Actor::Llm,
            timestamp: Utc::now(),
            node: NodeTag::Structured,
            previous_hash: None,
            data,
            missing: vec![MissingField {
                field_id: "JN.1.alcance".into(),
                expected_type: "string".into(),
                reason: "required field absent".into(),
                origin_node: NodeTag::Structured,
            }],
            alerts: vec![],
            citations: vec![],
            dependencies: vec![],
            repaired: false,
            hash: String::new(),
        };

        let json = serde_json::to_string(&artifact).expect("serialize");
        assert!(!json.contains("previous_hash"));
        let parsed: StructuredArtifact = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, artifact);
        assert_eq!(
            parsed.section_payload("JN.1").unwrap()["objeto"],
            "Suministro de portátiles"
        );
    }
}

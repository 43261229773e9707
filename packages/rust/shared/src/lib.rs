//! Shared types, error model, and configuration for CELIA.
//!
//! This crate is the foundation depended on by all other CELIA crates.
//! It provides:
//! - [`CeliaError`], the unified error type
//! - Artifact types ([`StructuredArtifact`], [`NarrativeArtifact`], [`MissingField`], [`Snippet`])
//! - Configuration ([`AppConfig`], [`PipelineConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, GenerationConfig, PipelineConfig, RetrievalConfig, StorageConfig, config_dir,
    config_file_path, init_config, load_config, load_config_from, validate_api_key,
};
pub use error::{CeliaError, Result};
pub use types::{
    ARTIFACT_SCHEMA_VERSION, Actor, Citation, Dependency, DocumentType, MissingField,
    NarrativeArtifact, NarrativeRefs, NodeTag, Priority, Snippet, StructuredArtifact,
};

//! Artifact construction for CELIA.
//!
//! Turns loosely-typed generator output into canonical, hashable artifacts:
//! - [`parser`] extracts JSON objects and narrative text from raw model output
//! - [`sections`] declares the per-section field rules
//! - [`builder`] canonicalizes a raw payload into a [`StructuredArtifact`]
//! - [`canonical`] provides sorted-key serialization and content hashing
//!
//! [`StructuredArtifact`]: celia_shared::StructuredArtifact

pub mod builder;
pub mod canonical;
pub mod parser;
pub mod sections;

pub use builder::{ArtifactBuilder, BuildContext, build_narrative, normalize_payload};
pub use canonical::{ContentHashed, to_canonical_json};
pub use parser::{
    extract_json, extract_json_lenient, extract_narrative_text, narrative_from_output,
    truncate_text,
};
pub use sections::{SectionDescriptor, registry, section};

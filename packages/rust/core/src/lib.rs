//! Generation pipeline for CELIA.
//!
//! Ties the artifact builder, validator and repair loop to the generation and
//! retrieval collaborators:
//! - [`pipeline`] runs one section end to end and returns its [`PipelineState`]
//! - [`validator`] checks structured and narrative artifacts
//! - [`repair`] asks the generator to fix invalid structured output
//! - [`generation`] and [`retrieval`] define the collaborator traits

pub mod generation;
pub mod pipeline;
pub mod prompts;
pub mod repair;
pub mod retrieval;
pub mod validator;

pub use generation::{GenerationRequest, Generator, OpenRouterGenerator};
pub use pipeline::{
    Pipeline, PipelineProgress, PipelineRequest, PipelineState, RepairSummary, SilentProgress,
    Stage, StageError,
};
pub use repair::{RepairOutcome, repair};
pub use retrieval::{CorpusRetriever, NoRetrieval, Retriever, format_context};
pub use validator::{
    ArtifactStatus, CoherenceReport, Severity, ValidationResult, Validator, ValidatorConfig,
    coherence, normalize_text, sanitize_omitted,
};

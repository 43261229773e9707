//! Section pipeline: retrieve → refine → prompts → structured → validate
//! (+ repair) → narrative → validate → verdict.
//!
//! Stages run in a fixed order and never short-circuit. Each stage reads
//! slots filled by earlier stages and writes its own; a stage that fails is
//! recorded in [`PipelineState::stage_errors`] and the run continues.

use std::fmt;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use celia_artifacts::{
    ArtifactBuilder, BuildContext, ContentHashed, build_narrative, extract_json_lenient,
    narrative_from_output, truncate_text,
};
use celia_shared::{
    AppConfig, CeliaError, Citation, DocumentType, NarrativeArtifact, Result, Snippet,
    StructuredArtifact,
};

use crate::generation::{GenerationRequest, Generator};
use crate::prompts::{self, NARRATIVE_SYSTEM, Prompts, REFINE_SYSTEM, STRUCTURED_SYSTEM};
use crate::repair::repair;
use crate::retrieval::{Retriever, format_context};
use crate::validator::{ArtifactStatus, ValidationResult, Validator, ValidatorConfig};

/// Raw output excerpt kept in a parse-failure alert.
const ALERT_EXCERPT_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Retrieve,
    Refine,
    BuildPrompts,
    GenerateStructured,
    ValidateStructured,
    GenerateNarrative,
    ValidateNarrative,
    End,
}

impl Stage {
    pub const ORDER: [Stage; 8] = [
        Stage::Retrieve,
        Stage::Refine,
        Stage::BuildPrompts,
        Stage::GenerateStructured,
        Stage::ValidateStructured,
        Stage::GenerateNarrative,
        Stage::ValidateNarrative,
        Stage::End,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Retrieve => "retrieve",
            Stage::Refine => "refine",
            Stage::BuildPrompts => "build_prompts",
            Stage::GenerateStructured => "generate_structured",
            Stage::ValidateStructured => "validate_structured",
            Stage::GenerateNarrative => "generate_narrative",
            Stage::ValidateNarrative => "validate_narrative",
            Stage::End => "end",
        }
    }

    /// Whether a failure of this stage fails the run in strict mode.
    /// Retrieval failures become notices and the run uses empty context.
    pub fn blocks_verdict(&self) -> bool {
        !matches!(self, Stage::Retrieve)
    }

    /// Human-readable label for progress output.
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Retrieve => "Retrieving context",
            Stage::Refine => "Refining instruction",
            Stage::BuildPrompts => "Building prompts",
            Stage::GenerateStructured => "Generating structured data",
            Stage::ValidateStructured => "Validating structured data",
            Stage::GenerateNarrative => "Drafting narrative",
            Stage::ValidateNarrative => "Validating narrative",
            Stage::End => "Computing verdict",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input for one section run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRequest {
    pub expedient_id: String,
    pub document_type: DocumentType,
    pub section_id: String,
    pub user_text: String,
    /// Pre-seeded snippets; skips the retriever when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrieved_context: Option<Vec<Snippet>>,
    pub version: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_hash: Option<String>,
}

impl PipelineRequest {
    pub fn new(
        expedient_id: impl Into<String>,
        document_type: DocumentType,
        section_id: impl Into<String>,
        user_text: impl Into<String>,
    ) -> Self {
        Self {
            expedient_id: expedient_id.into(),
            document_type,
            section_id: section_id.into(),
            user_text: user_text.into(),
            retrieved_context: None,
            version: 1,
            previous_hash: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageError {
    pub stage: Stage,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct RepairSummary {
    pub attempts: u32,
    pub repaired: bool,
}

/// Everything a run produced, including partial output of failed stages.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineState {
    pub request: PipelineRequest,
    pub retrieved: Option<Vec<Snippet>>,
    pub instruction: Option<String>,
    pub prompts: Option<Prompts>,
    pub structured: Option<StructuredArtifact>,
    pub structured_validation: Option<ValidationResult>,
    pub structured_status: ArtifactStatus,
    pub repair: Option<RepairSummary>,
    pub narrative: Option<NarrativeArtifact>,
    pub narrative_validation: Option<ValidationResult>,
    pub validation_failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_error_message: Option<String>,
    pub stage_errors: Vec<StageError>,
    /// Downgrades and fallbacks that did not fail the run.
    pub notices: Vec<String>,
    pub completed: Vec<Stage>,
}

impl PipelineState {
    pub fn new(request: PipelineRequest) -> Self {
        Self {
            request,
            retrieved: None,
            instruction: None,
            prompts: None,
            structured: None,
            structured_validation: None,
            structured_status: ArtifactStatus::Unvalidated,
            repair: None,
            narrative: None,
            narrative_validation: None,
            validation_failed: false,
            validation_error_message: None,
            stage_errors: Vec::new(),
            notices: Vec::new(),
            completed: Vec::new(),
        }
    }

    /// Both artifacts exist and the verdict allows writing them.
    pub fn is_persistable(&self) -> bool {
        !self.validation_failed && self.structured.is_some() && self.narrative.is_some()
    }

    fn record_error(&mut self, stage: Stage, error: &CeliaError) {
        self.stage_errors.push(StageError {
            stage,
            message: error.to_string(),
        });
    }
}

fn slot<'a, T>(value: &'a Option<T>, stage: Stage, name: &'static str) -> Result<&'a T> {
    value.as_ref().ok_or(CeliaError::MissingStageOutput {
        stage: stage.as_str(),
        slot: name,
    })
}

/// Observer for stage transitions.
pub trait PipelineProgress: Send + Sync {
    fn stage(&self, stage: Stage);
    fn done(&self, state: &PipelineState);
}

/// No-op observer for headless and test runs.
pub struct SilentProgress;

impl PipelineProgress for SilentProgress {
    fn stage(&self, _stage: Stage) {}
    fn done(&self, _state: &PipelineState) {}
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

pub struct Pipeline<G, R> {
    generator: G,
    retriever: R,
    validator: Validator,
    config: AppConfig,
}

impl<G: Generator, R: Retriever> Pipeline<G, R> {
    pub fn new(generator: G, retriever: R, config: &AppConfig) -> Self {
        Self {
            generator,
            retriever,
            validator: Validator::new(ValidatorConfig::from(config)),
            config: config.clone(),
        }
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    /// Run every stage for one section. Always returns the final state.
    #[instrument(skip_all, fields(expedient = %request.expedient_id, section = %request.section_id))]
    pub async fn run(&self, request: PipelineRequest, progress: &dyn PipelineProgress) -> PipelineState {
        info!(version = request.version, "starting section pipeline");
        let mut state = PipelineState::new(request);

        for stage in Stage::ORDER {
            progress.stage(stage);
            let outcome = match stage {
                Stage::Retrieve => self.retrieve(&mut state).await,
                Stage::Refine => self.refine(&mut state).await,
                Stage::BuildPrompts => self.build_prompts(&mut state),
                Stage::GenerateStructured => self.generate_structured(&mut state).await,
                Stage::ValidateStructured => self.validate_structured(&mut state).await,
                Stage::GenerateNarrative => self.generate_narrative(&mut state).await,
                Stage::ValidateNarrative => self.validate_narrative(&mut state),
                Stage::End => self.finish(&mut state),
            };
            if let Err(e) = outcome {
                warn!(stage = %stage, error = %e, "stage failed");
                state.record_error(stage, &e);
            }
            state.completed.push(stage);
        }

        info!(
            validation_failed = state.validation_failed,
            stage_errors = state.stage_errors.len(),
            notices = state.notices.len(),
            "section pipeline finished"
        );
        progress.done(&state);
        state
    }

    async fn retrieve(&self, state: &mut PipelineState) -> Result<()> {
        if let Some(seeded) = &state.request.retrieved_context {
            debug!(snippets = seeded.len(), "using pre-seeded context");
            state.retrieved = Some(seeded.clone());
            return Ok(());
        }

        match self
            .retriever
            .retrieve(&state.request.user_text, self.config.retrieval.limit)
            .await
        {
            Ok(snippets) => {
                debug!(snippets = snippets.len(), "context retrieved");
                state.retrieved = Some(snippets);
                Ok(())
            }
            Err(e) => {
                state.retrieved = Some(Vec::new());
                Err(e)
            }
        }
    }

    async fn refine(&self, state: &mut PipelineState) -> Result<()> {
        let base = prompts::base_instruction(&state.request.section_id);
        if !self.config.pipeline.refine_instruction {
            state.instruction = Some(base);
            return Ok(());
        }

        let request = GenerationRequest::new(
            prompts::refine_prompt(&base, &state.request.user_text),
            self.config.generation.refine_temperature,
            self.config.generation.max_tokens,
        )
        .with_system(REFINE_SYSTEM);

        let instruction = match self.generator.generate(&request).await {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => {
                state
                    .notices
                    .push("instruction refinement returned no text; using the base instruction".into());
                base
            }
            Err(e) => {
                warn!(error = %e, "instruction refinement failed");
                state
                    .notices
                    .push(format!("instruction refinement failed ({e}); using the base instruction"));
                base
            }
        };
        state.instruction = Some(instruction);
        Ok(())
    }

    fn build_prompts(&self, state: &mut PipelineState) -> Result<()> {
        let stage = Stage::BuildPrompts;
        let retrieved = slot(&state.retrieved, stage, "retrieved")?;
        let instruction = slot(&state.instruction, stage, "instruction")?;

        let context = format_context(retrieved, self.config.retrieval.max_context_chars);
        let citations = citations_for(retrieved);
        let structured = prompts::structured_prompt(
            instruction,
            &state.request.section_id,
            &state.request.user_text,
            &context,
            &citations,
            &self.config.pipeline.omitted_sentinel,
        );

        state.prompts = Some(Prompts {
            structured,
            narrative_instruction: prompts::narrative_instruction(&state.request.section_id),
            context,
            citations,
        });
        Ok(())
    }

    async fn generate_structured(&self, state: &mut PipelineState) -> Result<()> {
        let prompts = slot(&state.prompts, Stage::GenerateStructured, "prompts")?;
        let section_id = state.request.section_id.clone();

        let context = BuildContext {
            version: state.request.version,
            previous_hash: state.request.previous_hash.clone(),
            citations: prompts.citations.clone(),
            ..BuildContext::new(state.request.expedient_id.clone(), state.request.document_type)
        };
        let builder = ArtifactBuilder::new(context);

        let request = GenerationRequest::new(
            prompts.structured.clone(),
            self.config.generation.structured_temperature,
            self.config.generation.max_tokens,
        )
        .with_system(STRUCTURED_SYSTEM);

        let raw = match self.generator.generate(&request).await {
            Ok(raw) => raw,
            Err(e) => {
                state.structured = Some(builder.build(&section_id, &serde_json::json!({}))?);
                return Err(e);
            }
        };

        let (object, parse_error) = extract_json_lenient(&raw);
        let artifact = match parse_error {
            None => builder.build(&section_id, &serde_json::Value::Object(object))?,
            Some(message) => {
                warn!(error = %message, "structured output unparsable, building empty payload");
                let mut artifact = builder.build(&section_id, &serde_json::json!({}))?;
                let excerpt = truncate_text(raw.trim(), ALERT_EXCERPT_CHARS, "...");
                artifact
                    .alerts
                    .push(format!("generator output could not be parsed: {message} (raw: {excerpt})"));
                artifact.seal()?;
                artifact
            }
        };
        state.structured = Some(artifact);
        Ok(())
    }

    async fn validate_structured(&self, state: &mut PipelineState) -> Result<()> {
        let stage = Stage::ValidateStructured;
        let section_id = state.request.section_id.clone();
        let mut artifact = slot(&state.structured, stage, "structured")?.clone();
        let mut result = self.validator.validate_structured(&mut artifact, &section_id);

        let max_retries = self.config.pipeline.max_retries;
        let mut failure = None;
        if !result.is_valid() && max_retries > 0 {
            let errors = result.errors().to_vec();
            match repair(
                &self.generator,
                &self.validator,
                artifact.clone(),
                &errors,
                &section_id,
                max_retries,
            )
            .await
            {
                Ok(outcome) => {
                    state.repair = Some(RepairSummary {
                        attempts: outcome.attempts,
                        repaired: outcome.repaired,
                    });
                    artifact = outcome.artifact;
                    result = outcome.result;
                    failure = outcome.error;
                }
                Err(e) => failure = Some(e),
            }
        }

        state.structured_status = ArtifactStatus::settle(&result, self.config.pipeline.strict);
        debug!(status = ?state.structured_status, errors = result.errors().len(), "structured validation settled");
        state.structured = Some(artifact);
        state.structured_validation = Some(result);
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn generate_narrative(&self, state: &mut PipelineState) -> Result<()> {
        let stage = Stage::GenerateNarrative;
        let structured = slot(&state.structured, stage, "structured")?;
        let prompts = slot(&state.prompts, stage, "prompts")?;

        let request = GenerationRequest::new(
            prompts::narrative_prompt(&prompts.narrative_instruction, structured),
            self.config.generation.narrative_temperature,
            self.config.generation.max_tokens,
        )
        .with_system(NARRATIVE_SYSTEM);

        let raw = self.generator.generate(&request).await?;
        let narrative = build_narrative(structured, narrative_from_output(&raw), Utc::now())?;
        debug!(chars = narrative.narrative.chars().count(), "narrative built");
        state.narrative = Some(narrative);
        Ok(())
    }

    fn validate_narrative(&self, state: &mut PipelineState) -> Result<()> {
        let stage = Stage::ValidateNarrative;
        let structured = slot(&state.structured, stage, "structured")?;
        let narrative = slot(&state.narrative, stage, "narrative")?;
        let result = self.validator.validate_narrative(narrative, structured);
        state.narrative_validation = Some(result);
        Ok(())
    }

    fn finish(&self, state: &mut PipelineState) -> Result<()> {
        let mut problems = Vec::new();
        if let Some(result) = &state.structured_validation {
            if !result.is_valid() {
                problems.push(format!("structured validation failed: {}", result.errors().join("; ")));
            }
        }
        if let Some(result) = &state.narrative_validation {
            if !result.is_valid() {
                problems.push(format!("narrative validation failed: {}", result.errors().join("; ")));
            }
        }
        for error in &state.stage_errors {
            if error.stage.blocks_verdict() {
                problems.push(format!("stage {} failed: {}", error.stage, error.message));
            } else {
                state
                    .notices
                    .push(format!("stage {} failed, continued without its output: {}", error.stage, error.message));
            }
        }

        if problems.is_empty() {
            return Ok(());
        }
        if self.config.pipeline.strict {
            state.validation_failed = true;
            state.validation_error_message = Some(problems.join(" | "));
        } else {
            for problem in problems {
                state.notices.push(format!("downgraded in non-strict mode: {problem}"));
            }
        }
        Ok(())
    }
}

/// Distinct citations for the retrieved snippets, in rank order.
fn citations_for(snippets: &[Snippet]) -> Vec<Citation> {
    let mut citations: Vec<Citation> = Vec::new();
    for snippet in snippets {
        let citation = snippet.citation();
        if !citations.contains(&citation) {
            citations.push(citation);
        }
    }
    citations
}

//! End-to-end pipeline runs against scripted collaborators.

use std::collections::VecDeque;
use std::sync::Mutex;

use celia_artifacts::ContentHashed;
use celia_core::{
    ArtifactStatus, GenerationRequest, Generator, NoRetrieval, Pipeline, PipelineRequest,
    Retriever, SilentProgress, Stage,
};
use celia_shared::{AppConfig, CeliaError, DocumentType, Result, Snippet};

enum Reply {
    Text(&'static str),
    Fail(&'static str),
}

/// Answers generation calls in order and records every request.
struct ScriptedGenerator {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn prompt(&self, index: usize) -> String {
        self.requests.lock().unwrap()[index].prompt.clone()
    }
}

impl Generator for ScriptedGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        self.requests.lock().unwrap().push(request.clone());
        match self.replies.lock().unwrap().pop_front() {
            Some(Reply::Text(text)) => Ok(text.to_string()),
            Some(Reply::Fail(message)) => Err(CeliaError::Generation(message.to_string())),
            None => Err(CeliaError::Generation("script exhausted".into())),
        }
    }
}

struct FailingRetriever;

impl Retriever for FailingRetriever {
    async fn retrieve(&self, _query: &str, _limit: usize) -> Result<Vec<Snippet>> {
        Err(CeliaError::Retrieval("index unavailable".into()))
    }
}

const INCOMPLETE_JN1: &str = r#"{"JN.1": {"alcance": "Sede central", "ambito": "Municipal"}}"#;

const COMPLETE_JN1: &str = r#"```json
{"JN.1": {"objeto": "Suministro de 50 ordenadores portátiles", "alcance": "Sede central", "ambito": "Municipal"}}
```"#;

const GOOD_NARRATIVE: &str = r#"{"narrativa": "El objeto del contrato es el suministro de 50 ordenadores portátiles para la sede central, con ámbito municipal."}"#;

fn config(strict: bool, max_retries: u32) -> AppConfig {
    let mut config = AppConfig::default();
    config.pipeline.strict = strict;
    config.pipeline.max_retries = max_retries;
    config.pipeline.refine_instruction = false;
    config
}

fn request() -> PipelineRequest {
    PipelineRequest::new(
        "EXP-2024-001",
        DocumentType::Jn,
        "JN.1",
        "Necesitamos 50 ordenadores portátiles para la sede central del ayuntamiento.",
    )
}

#[tokio::test]
async fn complete_output_passes_without_repair() {
    let generator = ScriptedGenerator::new(vec![Reply::Text(COMPLETE_JN1), Reply::Text(GOOD_NARRATIVE)]);
    let pipeline = Pipeline::new(generator, NoRetrieval, &config(true, 2));

    let state = pipeline.run(request(), &SilentProgress).await;

    assert!(state.stage_errors.is_empty(), "{:?}", state.stage_errors);
    assert!(!state.validation_failed, "{:?}", state.validation_error_message);
    assert_eq!(state.structured_status, ArtifactStatus::Valid);
    assert!(state.repair.is_none());
    assert!(state.is_persistable());
    assert_eq!(state.completed, Stage::ORDER);

    let structured = state.structured.as_ref().unwrap();
    let narrative = state.narrative.as_ref().unwrap();
    assert_eq!(narrative.refs.structured_hash, structured.hash);
    assert!(structured.verify_hash().unwrap());
    assert!(narrative.verify_hash().unwrap());
    assert_eq!(
        state.narrative_validation.as_ref().unwrap().details()["coherence_missing"],
        serde_json::json!(0)
    );
    assert_eq!(pipeline.generator().calls(), 2);
}

#[tokio::test]
async fn missing_required_field_is_repaired_in_one_call() {
    let generator = ScriptedGenerator::new(vec![
        Reply::Text(INCOMPLETE_JN1),
        Reply::Text(COMPLETE_JN1),
        Reply::Text(GOOD_NARRATIVE),
    ]);
    let pipeline = Pipeline::new(generator, NoRetrieval, &config(true, 1));

    let state = pipeline.run(request(), &SilentProgress).await;

    assert!(!state.validation_failed, "{:?}", state.validation_error_message);
    assert_eq!(state.structured_status, ArtifactStatus::Valid);
    let summary = state.repair.unwrap();
    assert_eq!(summary.attempts, 1);
    assert!(summary.repaired);

    let structured = state.structured.as_ref().unwrap();
    assert!(structured.repaired);
    assert!(structured.verify_hash().unwrap());
    assert_eq!(
        structured.section_payload("JN.1").unwrap()["objeto"],
        "Suministro de 50 ordenadores portátiles"
    );

    // structured, repair, narrative
    assert_eq!(pipeline.generator().calls(), 3);
    let repair_prompt = pipeline.generator().prompt(1);
    assert!(repair_prompt.contains("required field 'objeto' is missing"));
    assert!(repair_prompt.contains("\"faltantes\""));
}

#[tokio::test]
async fn unparsable_repairs_exhaust_budget_and_fail() {
    let generator = ScriptedGenerator::new(vec![
        Reply::Text(INCOMPLETE_JN1),
        Reply::Text("Lo siento, no puedo ayudar con eso."),
        Reply::Text("sigue sin ser JSON"),
        Reply::Text(GOOD_NARRATIVE),
    ]);
    let pipeline = Pipeline::new(generator, NoRetrieval, &config(true, 2));

    let state = pipeline.run(request(), &SilentProgress).await;

    assert!(state.validation_failed);
    assert!(!state.is_persistable());
    assert_eq!(state.structured_status, ArtifactStatus::Failed);
    let message = state.validation_error_message.as_deref().unwrap();
    assert!(message.contains("objeto"), "{message}");

    let summary = state.repair.unwrap();
    assert_eq!(summary.attempts, 2);
    assert!(!summary.repaired);

    let structured = state.structured.as_ref().unwrap();
    assert!(!structured.repaired);
    let payload = structured.section_payload("JN.1").unwrap();
    assert_eq!(payload["alcance"], "Sede central");
    assert!(payload.get("objeto").is_none());

    assert_eq!(pipeline.generator().calls(), 4);
}

#[tokio::test]
async fn non_strict_mode_downgrades_to_notices() {
    let generator = ScriptedGenerator::new(vec![Reply::Text(INCOMPLETE_JN1), Reply::Text(GOOD_NARRATIVE)]);
    let pipeline = Pipeline::new(generator, NoRetrieval, &config(false, 0));

    let state = pipeline.run(request(), &SilentProgress).await;

    assert!(!state.validation_failed);
    assert!(state.validation_error_message.is_none());
    assert_eq!(state.structured_status, ArtifactStatus::Invalid);
    assert!(state.repair.is_none());
    assert!(
        state
            .notices
            .iter()
            .any(|n| n.contains("structured validation failed") && n.contains("objeto")),
        "{:?}",
        state.notices
    );
    assert!(state.is_persistable());
}

#[tokio::test]
async fn collaborator_failures_are_recorded_and_run_completes() {
    let generator = ScriptedGenerator::new(vec![Reply::Fail("HTTP 503"), Reply::Fail("HTTP 503")]);
    let pipeline = Pipeline::new(generator, NoRetrieval, &config(true, 0));

    let state = pipeline.run(request(), &SilentProgress).await;

    let failed: Vec<Stage> = state.stage_errors.iter().map(|e| e.stage).collect();
    assert_eq!(
        failed,
        [Stage::GenerateStructured, Stage::GenerateNarrative, Stage::ValidateNarrative]
    );
    assert!(state.stage_errors[0].message.contains("HTTP 503"));
    assert!(state.stage_errors[2].message.contains("narrative"));
    assert_eq!(state.completed, Stage::ORDER);

    // best-effort artifact from an empty payload
    let structured = state.structured.as_ref().unwrap();
    assert!(structured.section_payload("JN.1").unwrap().is_empty());
    assert!(state.narrative.is_none());
    assert!(state.validation_failed);
}

#[tokio::test]
async fn unparsable_structured_output_becomes_alert() {
    let generator = ScriptedGenerator::new(vec![
        Reply::Text("No tengo datos suficientes."),
        Reply::Text(GOOD_NARRATIVE),
    ]);
    let pipeline = Pipeline::new(generator, NoRetrieval, &config(true, 0));

    let state = pipeline.run(request(), &SilentProgress).await;

    assert!(state.stage_errors.is_empty(), "{:?}", state.stage_errors);
    let structured = state.structured.as_ref().unwrap();
    assert!(
        structured.alerts.iter().any(|a| a.contains("could not be parsed")),
        "{:?}",
        structured.alerts
    );
    assert!(structured.verify_hash().unwrap());
    assert!(state.validation_failed);
}

#[tokio::test]
async fn refinement_output_and_fallback() {
    let mut cfg = config(true, 0);
    cfg.pipeline.refine_instruction = true;

    let generator = ScriptedGenerator::new(vec![
        Reply::Text("  Extrae el objeto del suministro de portátiles.  "),
        Reply::Text(COMPLETE_JN1),
        Reply::Text(GOOD_NARRATIVE),
    ]);
    let pipeline = Pipeline::new(generator, NoRetrieval, &cfg);
    let state = pipeline.run(request(), &SilentProgress).await;
    assert_eq!(
        state.instruction.as_deref(),
        Some("Extrae el objeto del suministro de portátiles.")
    );
    assert!(pipeline.generator().prompt(1).starts_with("Extrae el objeto"));
    assert!(state.notices.is_empty());

    let generator = ScriptedGenerator::new(vec![
        Reply::Fail("timeout"),
        Reply::Text(COMPLETE_JN1),
        Reply::Text(GOOD_NARRATIVE),
    ]);
    let pipeline = Pipeline::new(generator, NoRetrieval, &cfg);
    let state = pipeline.run(request(), &SilentProgress).await;
    assert!(state.instruction.as_deref().unwrap().starts_with("Sección JN.1"));
    assert!(state.notices.iter().any(|n| n.contains("refinement failed")));
    assert!(state.stage_errors.is_empty());
    assert!(!state.validation_failed);
}

#[tokio::test]
async fn seeded_context_flows_into_prompt_and_citations() {
    let generator = ScriptedGenerator::new(vec![Reply::Text(COMPLETE_JN1), Reply::Text(GOOD_NARRATIVE)]);
    let pipeline = Pipeline::new(generator, FailingRetriever, &config(true, 0));

    let mut req = request();
    req.retrieved_context = Some(vec![Snippet {
        text: "El expediente incluirá la justificación de la necesidad.".into(),
        source_title: "LCSP artículo 116".into(),
        source_id: "lcsp-116".into(),
        page: Some(12),
        score: 3.2,
    }]);
    let state = pipeline.run(req, &SilentProgress).await;

    assert!(state.stage_errors.is_empty(), "{:?}", state.stage_errors);
    let prompt = pipeline.generator().prompt(0);
    assert!(prompt.contains("[1] LCSP artículo 116 (p. 12)"));
    let structured = state.structured.as_ref().unwrap();
    assert_eq!(structured.citations.len(), 1);
    assert_eq!(
        state.narrative.as_ref().unwrap().refs.citations,
        structured.citations
    );
}

#[tokio::test]
async fn retrieval_failure_continues_with_empty_context() {
    let generator = ScriptedGenerator::new(vec![Reply::Text(COMPLETE_JN1), Reply::Text(GOOD_NARRATIVE)]);
    let pipeline = Pipeline::new(generator, FailingRetriever, &config(false, 0));

    let state = pipeline.run(request(), &SilentProgress).await;

    assert_eq!(state.stage_errors.len(), 1);
    assert_eq!(state.stage_errors[0].stage, Stage::Retrieve);
    assert_eq!(state.retrieved.as_deref(), Some(&[][..]));
    assert!(state.structured.is_some());
    assert!(!state.validation_failed);
    assert!(state.notices.iter().any(|n| n.contains("index unavailable")));
}

#[tokio::test]
async fn retrieval_outage_does_not_fail_strict_run() {
    let generator = ScriptedGenerator::new(vec![Reply::Text(COMPLETE_JN1), Reply::Text(GOOD_NARRATIVE)]);
    let pipeline = Pipeline::new(generator, FailingRetriever, &config(true, 0));

    let state = pipeline.run(request(), &SilentProgress).await;

    assert!(state.structured_validation.as_ref().unwrap().is_valid());
    assert!(state.narrative_validation.as_ref().unwrap().is_valid());
    assert_eq!(state.stage_errors.len(), 1);
    assert_eq!(state.stage_errors[0].stage, Stage::Retrieve);
    assert!(!state.validation_failed, "{:?}", state.validation_error_message);
    assert!(state.validation_error_message.is_none());
    assert!(state.notices.iter().any(|n| n.contains("index unavailable")));
    assert!(state.is_persistable());
}

#[tokio::test]
async fn repair_generator_failure_keeps_attempt_count() {
    let generator = ScriptedGenerator::new(vec![
        Reply::Text(INCOMPLETE_JN1),
        Reply::Fail("HTTP 502"),
        Reply::Text(GOOD_NARRATIVE),
    ]);
    let pipeline = Pipeline::new(generator, NoRetrieval, &config(true, 3));

    let state = pipeline.run(request(), &SilentProgress).await;

    let summary = state.repair.unwrap();
    assert_eq!(summary.attempts, 1);
    assert!(!summary.repaired);
    assert_eq!(state.stage_errors.len(), 1);
    assert_eq!(state.stage_errors[0].stage, Stage::ValidateStructured);
    assert!(state.stage_errors[0].message.contains("HTTP 502"));
    assert_eq!(state.structured_status, ArtifactStatus::Failed);
    assert!(state.validation_failed);
    // structured, one repair, narrative
    assert_eq!(pipeline.generator().calls(), 3);
}

#[tokio::test]
async fn incoherent_narrative_over_threshold_fails() {
    let mut cfg = config(true, 0);
    cfg.pipeline.coherence_error_threshold = 1;
    let generator = ScriptedGenerator::new(vec![
        Reply::Text(COMPLETE_JN1),
        Reply::Text("La presente memoria justifica la necesidad de la contratación propuesta por el servicio."),
    ]);
    let pipeline = Pipeline::new(generator, NoRetrieval, &cfg);

    let state = pipeline.run(request(), &SilentProgress).await;

    assert_eq!(state.structured_status, ArtifactStatus::Valid);
    let narrative = state.narrative_validation.as_ref().unwrap();
    assert!(!narrative.is_valid());
    assert!(state.validation_failed);
    assert!(
        state
            .validation_error_message
            .as_deref()
            .unwrap()
            .contains("narrative validation failed")
    );
}

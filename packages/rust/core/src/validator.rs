//! Structural and narrative validation of artifacts.
//!
//! Errors block strict persistence; warnings are advisory. A result's
//! validity is derived from its error list and cannot be set directly.

use std::collections::BTreeMap;

use serde::Serialize;
use serde::ser::SerializeStruct;
use serde_json::{Map, Value};
use tracing::debug;
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

use celia_artifacts::{ContentHashed, sections};
use celia_shared::{AppConfig, NarrativeArtifact, StructuredArtifact};

/// Leaf keys holding identifiers or technical values rather than facts.
const COHERENCE_DENY_KEYS: &[&str] = &[
    "user_text",
    "texto_original",
    "intencion",
    "expediente_id",
    "codigo",
    "uuid",
];

/// Missing coherence values listed individually as warnings.
const MAX_LISTED_MISSING: usize = 3;

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Ok,
    Warning,
    Critical,
}

/// Outcome of one validation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationResult {
    errors: Vec<String>,
    warnings: Vec<String>,
    details: BTreeMap<String, Value>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn severity(&self) -> Severity {
        if !self.errors.is_empty() {
            Severity::Critical
        } else if !self.warnings.is_empty() {
            Severity::Warning
        } else {
            Severity::Ok
        }
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn details(&self) -> &BTreeMap<String, Value> {
        &self.details
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    pub fn detail(&mut self, key: &str, value: impl Into<Value>) {
        self.details.insert(key.to_string(), value.into());
    }

    fn record_totals(&mut self) {
        let (errors, warnings) = (self.errors.len(), self.warnings.len());
        self.detail("total_errors", errors);
        self.detail("total_warnings", warnings);
    }
}

impl Serialize for ValidationResult {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("ValidationResult", 5)?;
        s.serialize_field("is_valid", &self.is_valid())?;
        s.serialize_field("severity", &self.severity())?;
        s.serialize_field("errors", &self.errors)?;
        s.serialize_field("warnings", &self.warnings)?;
        s.serialize_field("details", &self.details)?;
        s.end()
    }
}

/// Lifecycle of an artifact through validation and repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Unvalidated,
    Valid,
    Invalid,
    /// Invalid after the repair budget ran out, in strict mode.
    Failed,
}

impl ArtifactStatus {
    /// Status after a validation pass once no repair budget remains.
    pub fn settle(result: &ValidationResult, strict: bool) -> Self {
        match (result.is_valid(), strict) {
            (true, _) => Self::Valid,
            (false, true) => Self::Failed,
            (false, false) => Self::Invalid,
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    pub strict: bool,
    pub max_retries: u32,
    pub coherence_error_threshold: usize,
    pub min_narrative_chars: usize,
    pub min_value_chars: usize,
    pub omitted_sentinel: String,
    pub repair_temperature: f32,
    pub repair_max_tokens: u32,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for ValidatorConfig {
    fn from(config: &AppConfig) -> Self {
        let pipeline = &config.pipeline;
        Self {
            strict: pipeline.strict,
            max_retries: pipeline.max_retries,
            coherence_error_threshold: pipeline.coherence_error_threshold,
            min_narrative_chars: pipeline.min_narrative_chars,
            min_value_chars: pipeline.min_value_chars,
            omitted_sentinel: pipeline.omitted_sentinel.clone(),
            repair_temperature: config.generation.repair_temperature,
            repair_max_tokens: config.generation.max_tokens,
        }
    }
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

pub struct Validator {
    config: ValidatorConfig,
}

impl Validator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Structural validation of a structured artifact.
    ///
    /// Sentinel values are cleared in place and the artifact is resealed,
    /// unless its stored hash was already inconsistent.
    pub fn validate_structured(
        &self,
        artifact: &mut StructuredArtifact,
        section_id: &str,
    ) -> ValidationResult {
        let mut result = ValidationResult::new();

        let intact = match artifact.verify_hash() {
            Ok(true) => true,
            Ok(false) => {
                result.error(format!(
                    "hash mismatch: stored '{}' does not match contents",
                    artifact.hash
                ));
                false
            }
            Err(e) => {
                result.error(format!("hash could not be computed: {e}"));
                false
            }
        };

        let (sanitized, rewrites) =
            sanitize_omitted(&Value::Object(artifact.data.clone()), &self.config.omitted_sentinel);
        let sanitized_count = rewrites.len();
        if !rewrites.is_empty() {
            if let Value::Object(data) = sanitized {
                artifact.data = data;
            }
            if intact {
                if let Err(e) = artifact.seal() {
                    result.error(format!("artifact could not be resealed: {e}"));
                }
            }
            for warning in rewrites {
                result.warning(warning);
            }
        }

        if artifact.expedient_id.trim().is_empty() {
            result.error("expedient id is empty");
        }
        if artifact.section_id != section_id {
            result.error(format!(
                "artifact is for section '{}', expected '{section_id}'",
                artifact.section_id
            ));
        }

        let descriptor = sections::section(section_id);
        let mut required_count = 0;
        match (descriptor, artifact.data.get(section_id)) {
            (Some(descriptor), Some(Value::Object(payload))) => {
                let paths = descriptor.required_paths();
                required_count = paths.len();
                check_required(payload, &paths, &mut result);
            }
            (Some(_), _) => {
                result.error(format!("no payload object for section {section_id}"));
            }
            (None, _) => {}
        }

        for missing in &artifact.missing {
            result.warning(format!("{}: {}", missing.field_id, missing.reason));
        }
        for alert in &artifact.alerts {
            result.warning(format!("alert: {alert}"));
        }

        result.detail("section", section_id);
        result.detail("required_fields", required_count);
        result.detail("sanitized", sanitized_count);
        result.detail("repaired", artifact.repaired);
        result.record_totals();

        debug!(
            section = section_id,
            errors = result.errors.len(),
            warnings = result.warnings.len(),
            "structured validation finished"
        );
        result
    }

    /// Narrative validation against the structured artifact it came from.
    pub fn validate_narrative(
        &self,
        narrative: &NarrativeArtifact,
        structured: &StructuredArtifact,
    ) -> ValidationResult {
        self.check_narrative(narrative, structured, &structured.hash)
    }

    /// Validate a stored artifact pair.
    ///
    /// The narrative must reference the structured hash as it was stored;
    /// sanitizing and resealing the structured artifact does not count
    /// against it. Coherence is checked against the sanitized data.
    pub fn validate_pair(
        &self,
        structured: &mut StructuredArtifact,
        narrative: &NarrativeArtifact,
        section_id: &str,
    ) -> (ValidationResult, ValidationResult) {
        let stored_hash = structured.hash.clone();
        let structured_result = self.validate_structured(structured, section_id);
        let narrative_result = self.check_narrative(narrative, structured, &stored_hash);
        (structured_result, narrative_result)
    }

    fn check_narrative(
        &self,
        narrative: &NarrativeArtifact,
        structured: &StructuredArtifact,
        expected_hash: &str,
    ) -> ValidationResult {
        let mut result = ValidationResult::new();

        let text = narrative.narrative.trim();
        let chars = text.chars().count();
        if chars < self.config.min_narrative_chars {
            result.error(format!(
                "narrative has {chars} characters, at least {} required",
                self.config.min_narrative_chars
            ));
        }

        if narrative.refs.structured_hash != expected_hash {
            result.error(format!(
                "narrative references structured hash '{}', current is '{expected_hash}'",
                narrative.refs.structured_hash
            ));
        }
        if narrative.expedient_id != structured.expedient_id
            || narrative.section_id != structured.section_id
        {
            result.error(format!(
                "narrative identity {}/{} does not match structured {}/{}",
                narrative.expedient_id,
                narrative.section_id,
                structured.expedient_id,
                structured.section_id
            ));
        }

        let report = coherence(text, &structured.data, self.config.min_value_chars);
        let missing = report.missing.len();
        if missing > self.config.coherence_error_threshold {
            result.error(format!(
                "narrative is missing {missing} structured values (threshold {})",
                self.config.coherence_error_threshold
            ));
        } else if missing > 0 {
            result.warning(format!("narrative is missing {missing} structured values"));
        }
        for (path, value) in report.missing.iter().take(MAX_LISTED_MISSING) {
            result.warning(format!("value '{value}' of {path} not found in narrative"));
        }

        result.detail("narrative_chars", chars);
        result.detail("coherence_checked", report.checked);
        result.detail("coherence_missing", missing);
        result.detail("coherence_score", report.score());
        result.record_totals();
        result
    }
}

/// Report required fields as errors when absent and warnings when empty.
fn check_required(payload: &Map<String, Value>, paths: &[String], result: &mut ValidationResult) {
    let mut absent: Vec<&str> = Vec::new();
    for path in paths {
        if absent.iter().any(|a| path.starts_with(&format!("{a}."))) {
            continue;
        }
        match lookup(payload, path) {
            None => {
                result.error(format!("required field '{path}' is missing"));
                absent.push(path);
            }
            Some(value) if is_empty(value) => {
                result.warning(format!("required field '{path}' is empty"));
            }
            Some(_) => {}
        }
    }
}

fn lookup<'a>(payload: &'a Map<String, Value>, dotted: &str) -> Option<&'a Value> {
    let mut parts = dotted.split('.');
    let first = payload.get(parts.next()?)?;
    parts.try_fold(first, |value, key| value.get(key))
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Sanitization
// ---------------------------------------------------------------------------

/// Replace every sentinel string with `""`, returning one warning per rewrite.
///
/// Running it again on its own output changes nothing.
pub fn sanitize_omitted(value: &Value, sentinel: &str) -> (Value, Vec<String>) {
    let mut warnings = Vec::new();
    let cleaned = sanitize_at(value, sentinel, "", &mut warnings);
    (cleaned, warnings)
}

fn sanitize_at(value: &Value, sentinel: &str, path: &str, warnings: &mut Vec<String>) -> Value {
    match value {
        Value::String(s) if s.trim().eq_ignore_ascii_case(sentinel) => {
            warnings.push(format!("{path} was marked '{sentinel}' and has been cleared"));
            Value::String(String::new())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), sanitize_at(v, sentinel, &join_key(path, k), warnings)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .enumerate()
                .map(|(i, v)| sanitize_at(v, sentinel, &format!("{path}[{i}]"), warnings))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn join_key(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

// ---------------------------------------------------------------------------
// Coherence
// ---------------------------------------------------------------------------

/// How many structured values appear verbatim (after normalization) in a narrative.
#[derive(Debug, Clone, Default)]
pub struct CoherenceReport {
    pub checked: usize,
    /// `(dotted path, original value)` of each value not found.
    pub missing: Vec<(String, String)>,
}

impl CoherenceReport {
    pub fn score(&self) -> f64 {
        1.0 - self.missing.len() as f64 / self.checked.max(1) as f64
    }
}

/// Check every textual fact of `data` against the narrative.
pub fn coherence(narrative: &str, data: &Map<String, Value>, min_value_chars: usize) -> CoherenceReport {
    let haystack = normalize_text(narrative);
    let mut report = CoherenceReport::default();

    for (path, value) in flatten_facts(data) {
        let needle = normalize_text(&value);
        if needle.chars().count() < min_value_chars {
            continue;
        }
        report.checked += 1;
        if !haystack.contains(&needle) {
            report.missing.push((path, value));
        }
    }
    report
}

/// Lowercase, strip diacritics, drop punctuation, collapse whitespace.
pub fn normalize_text(text: &str) -> String {
    let folded: String = text
        .to_lowercase()
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `(dotted path, text)` for every string and number leaf, skipping
/// identifier keys.
fn flatten_facts(data: &Map<String, Value>) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for (key, value) in data {
        flatten_into(value, key, key, &mut out);
    }
    out
}

fn flatten_into(value: &Value, path: &str, leaf_key: &str, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                flatten_into(v, &join_key(path, k), k, out);
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                flatten_into(v, &format!("{path}[{i}]"), leaf_key, out);
            }
        }
        Value::String(s) if !is_denied(leaf_key) => out.push((path.to_string(), s.clone())),
        Value::Number(n) if !is_denied(leaf_key) => out.push((path.to_string(), number_text(n))),
        _ => {}
    }
}

fn is_denied(key: &str) -> bool {
    let key = key.to_lowercase();
    key.ends_with("_id") || COHERENCE_DENY_KEYS.contains(&key.as_str())
}

/// Whole floats render without a fractional part, as a narrative would write them.
fn number_text(n: &serde_json::Number) -> String {
    match n.as_f64() {
        Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
        _ => n.to_string(),
    }
}

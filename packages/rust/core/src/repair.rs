//! Bounded auto-repair of invalid structured artifacts.

use serde_json::Value;
use tracing::{info, instrument, warn};

use celia_artifacts::{ArtifactBuilder, BuildContext, ContentHashed, extract_json, sections};
use celia_shared::{CeliaError, Result, StructuredArtifact};

use crate::generation::{GenerationRequest, Generator};
use crate::prompts::{self, STRUCTURED_SYSTEM};
use crate::validator::{ValidationResult, Validator};

/// Result of a repair loop.
#[derive(Debug)]
pub struct RepairOutcome {
    /// The last artifact that parsed, or the input if none did.
    pub artifact: StructuredArtifact,
    pub result: ValidationResult,
    /// Generator calls made.
    pub attempts: u32,
    /// Whether `data` was replaced by generator output.
    pub repaired: bool,
    /// Generator failure that ended the loop early.
    pub error: Option<CeliaError>,
}

/// Ask the generator to fix `artifact` until it validates or `max_retries`
/// calls have been made.
///
/// Unparsable repair output keeps the previous artifact. A generator error
/// ends the loop; it is carried in [`RepairOutcome::error`] together with the
/// attempts already spent. Build and hashing errors are returned.
#[instrument(skip_all, fields(section = section_id, max_retries))]
pub async fn repair<G: Generator>(
    generator: &G,
    validator: &Validator,
    artifact: StructuredArtifact,
    errors: &[String],
    section_id: &str,
    max_retries: u32,
) -> Result<RepairOutcome> {
    let config = validator.config();
    let required = sections::section(section_id)
        .map(|d| d.required_paths())
        .unwrap_or_default();

    let mut current = artifact;
    let mut errors = errors.to_vec();
    let mut last: Option<ValidationResult> = None;
    let mut attempts = 0;
    let mut failure = None;

    while attempts < max_retries {
        attempts += 1;
        info!(attempt = attempts, errors = errors.len(), "requesting repair");

        let prompt = prompts::repair_prompt(
            section_id,
            &current.data,
            &errors,
            &required,
            &config.omitted_sentinel,
        );
        let request = GenerationRequest::new(prompt, config.repair_temperature, config.repair_max_tokens)
            .with_system(STRUCTURED_SYSTEM);
        let raw = match generator.generate(&request).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(attempt = attempts, error = %e, "repair generation failed");
                failure = Some(e);
                break;
            }
        };

        let object = match extract_json(&raw) {
            Ok(object) => object,
            Err(e) => {
                warn!(attempt = attempts, error = %e, "repair output unparsable, keeping previous artifact");
                continue;
            }
        };

        let mut candidate = ArtifactBuilder::new(BuildContext::from_artifact(&current))
            .build_at(section_id, &Value::Object(object), current.timestamp)?;
        candidate.repaired = true;
        candidate.seal()?;

        let result = validator.validate_structured(&mut candidate, section_id);
        current = candidate;
        if result.is_valid() {
            info!(attempt = attempts, "repair succeeded");
            last = Some(result);
            break;
        }
        errors = result.errors().to_vec();
        last = Some(result);
    }

    let result = match last {
        Some(result) => result,
        None => validator.validate_structured(&mut current, section_id),
    };

    Ok(RepairOutcome {
        repaired: current.repaired,
        artifact: current,
        result,
        attempts,
        error: failure,
    })
}

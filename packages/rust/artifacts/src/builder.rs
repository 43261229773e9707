//! Canonicalization of raw structured output into a [`StructuredArtifact`].
//!
//! The builder never rejects input. Every rule violation becomes a
//! [`MissingField`] descriptor and processing continues with the rest of the
//! payload, so one artifact reports all of its problems at once.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde_json::{Map, Number, Value};
use tracing::{debug, instrument};

use celia_shared::{
    ARTIFACT_SCHEMA_VERSION, Actor, Citation, Dependency, DocumentType, MissingField,
    NarrativeArtifact, NarrativeRefs, NodeTag, Result, StructuredArtifact,
};

use crate::canonical::ContentHashed;
use crate::sections::{self, FieldKind, FieldRule, ListRule, SectionDescriptor};

/// Identity and provenance shared by every artifact of one build.
#[derive(Debug, Clone)]
pub struct BuildContext {
    pub expedient_id: String,
    pub document_type: DocumentType,
    /// Version to stamp on the artifact (>= 1).
    pub version: u32,
    pub actor: Actor,
    pub previous_hash: Option<String>,
    pub citations: Vec<Citation>,
}

impl BuildContext {
    /// First version of a section, produced by the generator.
    pub fn new(expedient_id: impl Into<String>, document_type: DocumentType) -> Self {
        Self {
            expedient_id: expedient_id.into(),
            document_type,
            version: 1,
            actor: Actor::Llm,
            previous_hash: None,
            citations: Vec::new(),
        }
    }

    /// Context that rebuilds `artifact` with the same identity and provenance.
    pub fn from_artifact(artifact: &StructuredArtifact) -> Self {
        Self {
            expedient_id: artifact.expedient_id.clone(),
            document_type: artifact.document_type,
            version: artifact.version,
            actor: artifact.actor,
            previous_hash: artifact.previous_hash.clone(),
            citations: artifact.citations.clone(),
        }
    }
}

pub struct ArtifactBuilder {
    context: BuildContext,
}

impl ArtifactBuilder {
    pub fn new(context: BuildContext) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &BuildContext {
        &self.context
    }

    /// Build and seal an artifact stamped with the current time.
    pub fn build(&self, section_id: &str, raw: &Value) -> Result<StructuredArtifact> {
        self.build_at(section_id, raw, Utc::now())
    }

    /// Build and seal an artifact with an explicit timestamp.
    ///
    /// Only fails if the finished artifact cannot be serialized for hashing.
    #[instrument(skip_all, fields(section = section_id, expedient = %self.context.expedient_id))]
    pub fn build_at(
        &self,
        section_id: &str,
        raw: &Value,
        timestamp: DateTime<Utc>,
    ) -> Result<StructuredArtifact> {
        let mut missing = Vec::new();
        let mut alerts = Vec::new();

        let mut data = match normalize_payload(section_id, raw) {
            Some(data) => data,
            None => {
                missing.push(missing_field(
                    "data",
                    "object",
                    "generator output is not a JSON object",
                ));
                Map::new()
            }
        };

        for value in data.values_mut() {
            trim_strings(value);
        }

        if sections::section(section_id).is_some() && !data.contains_key(section_id) {
            missing.push(missing_field(
                section_id,
                "object",
                "no payload for the requested section",
            ));
        }

        let mut dependencies: Vec<Dependency> = Vec::new();
        for (key, payload) in data.iter_mut() {
            let Some(descriptor) = sections::section(key) else {
                alerts.push(format!("no schema registered for section {key}"));
                continue;
            };
            apply_descriptor(descriptor, payload, &mut missing);
            infer_dependencies(descriptor, payload, &mut dependencies);
        }

        let mut artifact = StructuredArtifact {
            schema_version: ARTIFACT_SCHEMA_VERSION.to_string(),
            expedient_id: self.context.expedient_id.clone(),
            document_type: self.context.document_type,
            section_id: section_id.to_string(),
            version: self.context.version.max(1),
            actor: self.context.actor,
            timestamp,
            node: NodeTag::Structured,
            previous_hash: self.context.previous_hash.clone(),
            data,
            missing,
            alerts,
            citations: self.context.citations.clone(),
            dependencies,
            repaired: false,
            hash: String::new(),
        };
        artifact.seal()?;

        debug!(
            missing = artifact.missing.len(),
            alerts = artifact.alerts.len(),
            dependencies = artifact.dependencies.len(),
            hash = %artifact.hash,
            "structured artifact built"
        );
        Ok(artifact)
    }
}

/// Seal a narrative derived from `structured`.
///
/// The narrative shares the structured artifact's identity and version and
/// references its current hash.
pub fn build_narrative(
    structured: &StructuredArtifact,
    narrative: impl Into<String>,
    timestamp: DateTime<Utc>,
) -> Result<NarrativeArtifact> {
    let mut artifact = NarrativeArtifact {
        schema_version: ARTIFACT_SCHEMA_VERSION.to_string(),
        expedient_id: structured.expedient_id.clone(),
        document_type: structured.document_type,
        section_id: structured.section_id.clone(),
        version: structured.version,
        actor: structured.actor,
        timestamp,
        node: NodeTag::Narrative,
        narrative: narrative.into().trim().to_string(),
        refs: NarrativeRefs {
            structured_hash: structured.hash.clone(),
            citations: structured.citations.clone(),
        },
        hash: String::new(),
    };
    artifact.seal()?;
    Ok(artifact)
}

/// Bring raw output into the section-keyed `data` shape.
///
/// An object keyed by registered section ids is kept as-is; any other object
/// is treated as the payload of `section_id`. Returns `None` for non-objects.
pub fn normalize_payload(section_id: &str, raw: &Value) -> Option<Map<String, Value>> {
    let object = raw.as_object()?;
    let keyed_by_section = object
        .keys()
        .any(|k| k == section_id || sections::section(k).is_some());
    if keyed_by_section {
        Some(object.clone())
    } else {
        let mut data = Map::new();
        data.insert(section_id.to_string(), raw.clone());
        Some(data)
    }
}

fn missing_field(field_id: &str, expected_type: &str, reason: impl Into<String>) -> MissingField {
    MissingField {
        field_id: field_id.to_string(),
        expected_type: expected_type.to_string(),
        reason: reason.into(),
        origin_node: NodeTag::Structured,
    }
}

fn trim_strings(value: &mut Value) {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.len() != s.len() {
                *s = trimmed.to_string();
            }
        }
        Value::Array(items) => items.iter_mut().for_each(trim_strings),
        Value::Object(map) => map.values_mut().for_each(trim_strings),
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Descriptor walk
// ---------------------------------------------------------------------------

fn apply_descriptor(descriptor: &SectionDescriptor, payload: &mut Value, missing: &mut Vec<MissingField>) {
    let Some(object) = payload.as_object_mut() else {
        missing.push(missing_field(
            descriptor.id,
            "object",
            "section payload is not an object",
        ));
        return;
    };

    check_fields(object, descriptor.fields, descriptor.id, missing);

    for bound in descriptor.bounds {
        let Some(limit) = object.get(bound.bound_field).and_then(Value::as_i64) else {
            continue;
        };
        let rule = descriptor
            .fields
            .iter()
            .find_map(|f| match f.kind {
                FieldKind::List(rule) if f.name == bound.list => Some(rule),
                _ => None,
            });
        let Some(Value::Array(items)) = object.get(bound.list) else {
            continue;
        };
        for (index, item) in items.iter().enumerate() {
            let Some(value) = item.get(bound.item_field).and_then(Value::as_i64) else {
                continue;
            };
            if value > limit {
                let label = item_label(descriptor.id, bound.list, index, item, rule.as_ref());
                missing.push(missing_field(
                    &format!("{label}.{}", bound.item_field),
                    "integer",
                    format!(
                        "{} {value} exceeds {} {limit}",
                        bound.item_field, bound.bound_field
                    ),
                ));
            }
        }
    }
}

fn check_fields(
    object: &mut Map<String, Value>,
    rules: &[FieldRule],
    scope: &str,
    missing: &mut Vec<MissingField>,
) {
    for rule in rules {
        let field_id = format!("{scope}.{}", rule.name);
        let expected = rule.kind.expected_type();

        let Some(value) = object.get_mut(rule.name) else {
            if rule.required {
                missing.push(missing_field(&field_id, expected, "required field is missing"));
            }
            continue;
        };

        if is_blank(value) {
            if rule.required {
                missing.push(missing_field(&field_id, expected, "required field is empty"));
            }
            continue;
        }

        match coerce(rule, value, &field_id, scope, missing) {
            Coerced::Keep => {}
            Coerced::Replace(new_value) => *value = new_value,
            Coerced::Remove(reason) => {
                missing.push(missing_field(&field_id, expected, reason));
                object.remove(rule.name);
            }
        }
    }
}

enum Coerced {
    Keep,
    Replace(Value),
    Remove(String),
}

fn coerce(
    rule: &FieldRule,
    value: &mut Value,
    field_id: &str,
    scope: &str,
    missing: &mut Vec<MissingField>,
) -> Coerced {
    match rule.kind {
        FieldKind::Text => match value {
            Value::String(_) => Coerced::Keep,
            Value::Number(n) => Coerced::Replace(Value::String(n.to_string())),
            Value::Bool(b) => Coerced::Replace(Value::String(b.to_string())),
            _ => Coerced::Remove("expected text".into()),
        },
        FieldKind::Integer { min, max } => match parse_integer(value) {
            None => Coerced::Remove(format!("'{}' is not an integer", display(value))),
            Some(n) if min.is_some_and(|m| n < m) || max.is_some_and(|m| n > m) => {
                Coerced::Remove(format!("{n} is outside {}", describe_range(min, max)))
            }
            Some(n) => Coerced::Replace(Value::from(n)),
        },
        FieldKind::Currency => match parse_currency(value) {
            Some(Ok(amount)) => Coerced::Replace(amount),
            Some(Err(reason)) => Coerced::Remove(reason),
            None => Coerced::Remove(format!("'{}' is not an amount", display(value))),
        },
        FieldKind::Boolean => match parse_bool(value) {
            Some(b) => Coerced::Replace(Value::Bool(b)),
            None => Coerced::Remove(format!("'{}' is not a yes/no value", display(value))),
        },
        FieldKind::Object(inner) => match value.as_object_mut() {
            Some(map) => {
                check_fields(map, inner, field_id, missing);
                Coerced::Keep
            }
            None => Coerced::Remove("expected an object".into()),
        },
        FieldKind::List(list_rule) => match value {
            Value::Array(items) => {
                check_list(items, rule.name, &list_rule, scope, missing);
                if list_rule.non_empty && items.is_empty() {
                    missing.push(missing_field(field_id, "array", "list must not be empty"));
                }
                Coerced::Keep
            }
            _ => Coerced::Remove("expected a list".into()),
        },
    }
}

fn check_list(
    items: &mut Vec<Value>,
    list_name: &str,
    rule: &ListRule,
    scope: &str,
    missing: &mut Vec<MissingField>,
) {
    let mut seen = HashSet::new();
    let mut index = 0;
    items.retain_mut(|item| {
        let position = index;
        index += 1;

        let label = item_label(scope, list_name, position, item, Some(rule));
        let Some(map) = item.as_object_mut() else {
            missing.push(missing_field(&label, "object", "list item is not an object"));
            return false;
        };

        if let Some(id) = rule.item_id.and_then(|key| map.get(key)).and_then(id_text) {
            if !seen.insert(id.clone()) {
                missing.push(missing_field(
                    &format!("{scope}.{list_name}[{position}]"),
                    "object",
                    format!("duplicate identifier '{id}' dropped"),
                ));
                return false;
            }
        }

        check_fields(map, rule.item_fields, &label, missing);
        true
    });
}

/// `<scope>.<item_id>` when the item carries an id, else `<scope>.<list>[<index>]`.
fn item_label(
    scope: &str,
    list_name: &str,
    index: usize,
    item: &Value,
    rule: Option<&ListRule>,
) -> String {
    rule.and_then(|r| r.item_id)
        .and_then(|key| item.get(key))
        .and_then(id_text)
        .map(|id| format!("{scope}.{id}"))
        .unwrap_or_else(|| format!("{scope}.{list_name}[{index}]"))
}

fn id_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn infer_dependencies(descriptor: &SectionDescriptor, payload: &Value, out: &mut Vec<Dependency>) {
    for rule in descriptor.dependencies {
        let applies = match rule.when {
            None => true,
            Some(flag) => payload.get(flag).and_then(Value::as_bool) == Some(true),
        };
        if applies && !out.iter().any(|d| d.id == rule.id) {
            out.push(Dependency {
                id: rule.id.to_string(),
                reason: rule.reason.to_string(),
                priority: rule.priority,
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Scalar parsing
// ---------------------------------------------------------------------------

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn describe_range(min: Option<i64>, max: Option<i64>) -> String {
    match (min, max) {
        (Some(lo), Some(hi)) => format!("[{lo}, {hi}]"),
        (Some(lo), None) => format!(">= {lo}"),
        (None, Some(hi)) => format!("<= {hi}"),
        (None, None) => "range".into(),
    }
}

fn parse_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && f.abs() < 9.0e15).map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.fract() == 0.0 && f.abs() < 9.0e15)
                    .map(|f| f as i64)
            })
        }
        _ => None,
    }
}

fn parse_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "sí" | "si" | "true" => Some(true),
            "no" | "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Parse an amount and round it half-up to cents.
///
/// Returns `None` when the value is not numeric and `Some(Err)` when it is
/// numeric but negative.
fn parse_currency(value: &Value) -> Option<std::result::Result<Value, String>> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => currency_text(s)?,
        _ => return None,
    };
    let cents = round_half_up_cents(&text)?;
    if cents < 0 {
        return Some(Err(format!("amount {text} must not be negative")));
    }
    let amount = cents as f64 / 100.0;
    Number::from_f64(amount).map(|n| Ok(Value::Number(n)))
}

/// Strip currency decorations and accept a decimal comma.
fn currency_text(raw: &str) -> Option<String> {
    let mut text: String = raw
        .trim()
        .trim_end_matches("EUR")
        .trim_end_matches('€')
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if text.is_empty() {
        return None;
    }
    if text.contains(',') {
        if text.contains('.') {
            // 1.234,56
            text = text.replace('.', "").replace(',', ".");
        } else {
            text = text.replace(',', ".");
        }
    }
    Some(text)
}

/// Exact decimal rounding on the textual value; `1000.005` becomes 100001 cents.
fn round_half_up_cents(text: &str) -> Option<i128> {
    let text = if text.contains(['e', 'E']) {
        let parsed: f64 = text.parse().ok().filter(|f: &f64| f.is_finite())?;
        format!("{parsed:.6}")
    } else {
        text.to_string()
    };

    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(&text)),
    };
    let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }
    if !int_part.chars().all(|c| c.is_ascii_digit()) || !frac_part.chars().all(|c| c.is_ascii_digit())
    {
        return None;
    }
    if int_part.len() > 30 {
        return None;
    }

    let whole: i128 = if int_part.is_empty() { 0 } else { int_part.parse().ok()? };
    let mut frac = frac_part.bytes().map(|b| i128::from(b - b'0'));
    let tenths = frac.next().unwrap_or(0);
    let hundredths = frac.next().unwrap_or(0);
    let round_up = frac.next().is_some_and(|d| d >= 5);

    let cents = whole * 100 + tenths * 10 + hundredths + i128::from(round_up);
    Some(if negative { -cents } else { cents })
}

//! Canonical serialization and content hashing.
//!
//! Objects are written with recursively sorted keys and no insignificant
//! whitespace, so two artifacts that differ only in field insertion order
//! hash identically.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use celia_shared::{CeliaError, NarrativeArtifact, Result, StructuredArtifact};

/// Name of the field excluded from the hash input.
const HASH_FIELD: &str = "hash";

/// Serialize a JSON value canonically: sorted keys, compact separators.
pub fn to_canonical_json(value: &Value) -> String {
    match value {
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(to_canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        Value::Object(map) => {
            let sorted: BTreeMap<&String, String> = map
                .iter()
                .map(|(k, v)| (k, to_canonical_json(v)))
                .collect();
            let items: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| format!("{}:{v}", Value::String(k.clone())))
                .collect();
            format!("{{{}}}", items.join(","))
        }
        // Scalars already have a single compact form.
        scalar => scalar.to_string(),
    }
}

/// Hex-encoded SHA-256 of a string.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// An artifact whose `hash` field covers every other field.
pub trait ContentHashed: Serialize {
    fn stored_hash(&self) -> &str;

    fn set_hash(&mut self, hash: String);

    /// Recompute the hash over the canonical form, excluding the hash field.
    fn compute_hash(&self) -> Result<String> {
        let mut value = serde_json::to_value(self)
            .map_err(|e| CeliaError::validation(format!("artifact is not serializable: {e}")))?;
        if let Value::Object(map) = &mut value {
            map.remove(HASH_FIELD);
        }
        Ok(sha256_hex(&to_canonical_json(&value)))
    }

    /// Store a freshly computed hash. Call after every mutation.
    fn seal(&mut self) -> Result<()> {
        let hash = self.compute_hash()?;
        self.set_hash(hash);
        Ok(())
    }

    /// Whether the stored hash matches the current contents.
    fn verify_hash(&self) -> Result<bool> {
        Ok(!self.stored_hash().is_empty() && self.compute_hash()? == self.stored_hash())
    }
}

impl ContentHashed for StructuredArtifact {
    fn stored_hash(&self) -> &str {
        &self.hash
    }

    fn set_hash(&mut self, hash: String) {
        self.hash = hash;
    }
}

impl ContentHashed for NarrativeArtifact {
    fn stored_hash(&self) -> &str {
        &self.hash
    }

    fn set_hash(&mut self, hash: String) {
        self.hash = hash;
    }
}

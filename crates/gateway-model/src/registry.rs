// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Model & Policy Registry (C1).
//!
//! Maintains the allow-listed model identifiers for each vendor and exposes
//! the three operations the Router needs before it will dispatch a call:
//! `validate`, `normalize`, `infer_vendor`. Unknown models fail loudly —
//! this registry never silently substitutes a different model.

use std::collections::{HashMap, HashSet};

use crate::error::{ErrorKind, GatewayError};
use crate::types::Vendor;

/// Per-vendor allow-list of model identifiers, sourced from configuration.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    allow_lists: HashMap<Vendor, HashSet<String>>,
}

impl ModelRegistry {
    pub fn new(allow_lists: HashMap<Vendor, Vec<String>>) -> Self {
        Self {
            allow_lists: allow_lists
                .into_iter()
                .map(|(vendor, models)| (vendor, models.into_iter().collect()))
                .collect(),
        }
    }

    fn allowed(&self, vendor: Vendor) -> &HashSet<String> {
        static EMPTY: std::sync::OnceLock<HashSet<String>> = std::sync::OnceLock::new();
        self.allow_lists.get(&vendor).unwrap_or_else(|| EMPTY.get_or_init(HashSet::new))
    }

    /// `validate(vendor, model) -> (ok, reason)`. Normalizes the model id
    /// before checking the allow-list so a resource-prefixed id (e.g.
    /// `models/gemini-2.0-flash`) matches a bare catalog entry.
    pub fn validate(&self, vendor: Vendor, model: &str) -> Result<(), GatewayError> {
        let canonical = normalize(vendor, model);
        let list = self.allowed(vendor);
        if list.contains(&canonical) {
            Ok(())
        } else {
            let mut known: Vec<&str> = list.iter().map(String::as_str).collect();
            known.sort_unstable();
            Err(GatewayError::new(
                ErrorKind::ModelNotAllowed,
                format!(
                    "model {model:?} is not in the {vendor} allow-list; currently allowed: [{}]",
                    known.join(", ")
                ),
            ))
        }
    }

    /// Resolve a vendor for a model id with no explicit vendor, by checking
    /// which allow-list contains it. Returns `None` rather than guessing —
    /// the Router surfaces `INVALID_REQUEST` when inference fails.
    pub fn infer_vendor(&self, model: &str) -> Option<Vendor> {
        for vendor in [Vendor::OpenAi, Vendor::Vertex] {
            let canonical = normalize(vendor, model);
            if self.allowed(vendor).contains(&canonical) {
                return Some(vendor);
            }
        }
        None
    }
}

/// Normalization rules: strip vendor-specific resource prefixes, preserve
/// case on the model id itself, lowercase the vendor name (the enum already
/// guarantees this). Pure function so C6/C7/tests can call it without a
/// registry instance.
pub fn normalize(vendor: Vendor, model: &str) -> String {
    let stripped = match vendor {
        Vendor::Vertex => model.strip_prefix("models/").unwrap_or(model),
        Vendor::OpenAi => model,
    };
    stripped.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ModelRegistry {
        let mut lists = HashMap::new();
        lists.insert(Vendor::OpenAi, vec!["gpt-5".to_string(), "gpt-5-mini".to_string()]);
        lists.insert(Vendor::Vertex, vec!["gemini-2.0-flash".to_string()]);
        ModelRegistry::new(lists)
    }

    #[test]
    fn validate_accepts_listed_model() {
        assert!(registry().validate(Vendor::OpenAi, "gpt-5").is_ok());
    }

    #[test]
    fn validate_rejects_unlisted_model() {
        let err = registry().validate(Vendor::OpenAi, "gpt-3.5-turbo").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ModelNotAllowed);
        assert!(err.message.contains("gpt-5"), "remediation text should list the allow-list");
    }

    #[test]
    fn validate_normalizes_vertex_resource_prefix() {
        assert!(registry().validate(Vendor::Vertex, "models/gemini-2.0-flash").is_ok());
    }

    #[test]
    fn infer_vendor_finds_unique_owner() {
        assert_eq!(registry().infer_vendor("gemini-2.0-flash"), Some(Vendor::Vertex));
        assert_eq!(registry().infer_vendor("gpt-5"), Some(Vendor::OpenAi));
    }

    #[test]
    fn infer_vendor_returns_none_for_unknown_model() {
        assert_eq!(registry().infer_vendor("llama-70b"), None);
    }

    #[test]
    fn normalize_preserves_case() {
        assert_eq!(normalize(Vendor::OpenAi, "GPT-5"), "GPT-5");
    }

    #[test]
    fn validate_against_empty_allow_list_fails_loudly() {
        let empty = ModelRegistry::default();
        let err = empty.validate(Vendor::OpenAi, "gpt-5").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ModelNotAllowed);
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Grounding Detector (C6): pure functions over the raw vendor JSON payload.
//!
//! Both vendors are inspected as `serde_json::Value` rather than a typed SDK
//! struct — this tolerates whatever exact shape the SDK or a proxy emits
//! without the detector needing to track every SDK release.

use std::collections::HashSet;

use serde_json::Value;

/// Responses-API item types that count as tool-call evidence. Matched both
/// exactly and, for the `web_search_preview*` family, by prefix.
const SEARCH_TYPES: &[&str] =
    &["web_search_call", "web_search_result", "web_search_preview", "tool_use", "tool_result", "function_call", "function_result"];

const CITATION_ANNOTATION_TYPES: &[&str] = &["url_citation", "web_result", "citation", "url", "reference"];

/// Vertex `grounding_metadata` field names that indicate search grounding
/// occurred, snake_case paired with the camelCase alias the SDK sometimes
/// emits instead.
const VERTEX_GROUNDING_FIELDS: &[(&str, &str)] = &[
    ("web_search_queries", "webSearchQueries"),
    ("grounding_chunks", "groundingChunks"),
    ("search_entry_point", "searchEntryPoint"),
    ("citations", "citations"),
    ("retrieved_contexts", "retrievedContexts"),
    ("supporting_evidence", "supportingEvidence"),
    ("grounding_attributions", "groundingAttributions"),
];

#[derive(Debug, Clone, Default)]
pub struct DetectionResult {
    pub grounded_effective: bool,
    pub tool_call_count: u32,
    /// Distinct `type`/annotation-type strings observed, for debug-level
    /// bookkeeping — lets future allow-list expansion be driven by what was
    /// actually seen rather than re-deriving it from raw payload dumps.
    pub types_seen: HashSet<String>,
}

fn field_any<'a>(obj: &'a Value, snake: &str, camel: &str) -> Option<&'a Value> {
    obj.get(snake).or_else(|| obj.get(camel))
}

/// Vendor A (OpenAI-style Responses): scans the `output` array for tool-call
/// items and message annotations that indicate a search/citation occurred.
pub fn detect_openai_grounding(response: &Value) -> DetectionResult {
    let mut result = DetectionResult::default();
    let Some(output) = response.get("output").and_then(Value::as_array) else {
        return result;
    };

    for item in output {
        if let Some(item_type) = item.get("type").and_then(Value::as_str) {
            let lower = item_type.to_ascii_lowercase();
            let is_search_type = SEARCH_TYPES.iter().any(|t| lower == *t || lower.starts_with(t)) || lower.contains("search");
            if is_search_type {
                result.types_seen.insert(item_type.to_string());
                result.grounded_effective = true;
                result.tool_call_count += 1;
            }
        }

        if let Some(content) = item.get("content").and_then(Value::as_array) {
            for block in content {
                let Some(annotations) = block.get("annotations").and_then(Value::as_array) else { continue };
                for annotation in annotations {
                    if let Some(atype) = annotation.get("type").and_then(Value::as_str) {
                        let lower = atype.to_ascii_lowercase();
                        if CITATION_ANNOTATION_TYPES.iter().any(|t| lower == *t) {
                            result.types_seen.insert(atype.to_string());
                            result.grounded_effective = true;
                            result.tool_call_count += 1;
                        }
                    }
                }
            }
        }
    }

    tracing::debug!(types_seen = ?result.types_seen, "openai grounding detection types observed");
    result
}

/// Vendor B (Vertex/Gemini): inspects each candidate's `grounding_metadata`.
pub fn detect_vertex_grounding(response: &Value) -> DetectionResult {
    let mut result = DetectionResult::default();
    let Some(candidates) = response.get("candidates").and_then(Value::as_array) else {
        return result;
    };

    for candidate in candidates {
        let Some(metadata) = field_any(candidate, "grounding_metadata", "groundingMetadata") else { continue };

        for (snake, camel) in VERTEX_GROUNDING_FIELDS {
            if let Some(value) = field_any(metadata, snake, camel) {
                let present = match value {
                    Value::Array(a) => !a.is_empty(),
                    Value::Null => false,
                    _ => true,
                };
                if present {
                    result.types_seen.insert((*snake).to_string());
                    result.grounded_effective = true;
                }
            }
        }

        if result.grounded_effective {
            let query_count =
                field_any(metadata, "web_search_queries", "webSearchQueries").and_then(Value::as_array).map(|a| a.len()).unwrap_or(0);
            result.tool_call_count += if query_count > 0 { query_count as u32 } else { 1 };
        }
    }

    tracing::debug!(types_seen = ?result.types_seen, "vertex grounding detection fields observed");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn openai_detects_web_search_call() {
        let response = json!({"output": [{"type": "web_search_call"}]});
        let result = detect_openai_grounding(&response);
        assert!(result.grounded_effective);
        assert_eq!(result.tool_call_count, 1);
    }

    #[test]
    fn openai_detects_preview_variant_by_prefix() {
        let response = json!({"output": [{"type": "web_search_preview_20240101"}]});
        assert!(detect_openai_grounding(&response).grounded_effective);
    }

    #[test]
    fn openai_detects_url_citation_annotation() {
        let response = json!({
            "output": [{
                "type": "message",
                "content": [{"annotations": [{"type": "url_citation"}]}]
            }]
        });
        let result = detect_openai_grounding(&response);
        assert!(result.grounded_effective);
        assert_eq!(result.tool_call_count, 1);
    }

    #[test]
    fn openai_plain_message_is_not_grounded() {
        let response = json!({"output": [{"type": "message", "content": [{"text": "hi"}]}]});
        assert!(!detect_openai_grounding(&response).grounded_effective);
    }

    #[test]
    fn vertex_detects_snake_case_web_search_queries() {
        let response = json!({
            "candidates": [{"grounding_metadata": {"web_search_queries": ["weather today"]}}]
        });
        let result = detect_vertex_grounding(&response);
        assert!(result.grounded_effective);
        assert_eq!(result.tool_call_count, 1);
    }

    #[test]
    fn vertex_detects_camel_case_grounding_chunks() {
        let response = json!({
            "candidates": [{"groundingMetadata": {"groundingChunks": [{"web": {}}]}}]
        });
        assert!(detect_vertex_grounding(&response).grounded_effective);
    }

    #[test]
    fn vertex_tool_call_count_defaults_to_one_without_queries() {
        let response = json!({
            "candidates": [{"grounding_metadata": {"citations": [{"url": "https://example.com"}]}}]
        });
        assert_eq!(detect_vertex_grounding(&response).tool_call_count, 1);
    }

    #[test]
    fn vertex_empty_metadata_is_not_grounded() {
        let response = json!({"candidates": [{"grounding_metadata": {}}]});
        assert!(!detect_vertex_grounding(&response).grounded_effective);
    }
}

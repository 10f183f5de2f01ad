// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ErrorKind, GatewayError};

/// The two vendor families this gateway speaks natively.
///
/// There is intentionally no open-ended `String` vendor id: the Router only
/// ever dispatches to one of two wire formats, and adding a third requires a
/// new adapter, not a new enum variant at the config layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vendor {
    /// An OpenAI-style Responses API.
    OpenAi,
    /// Google Vertex / Gemini GenerateContent.
    Vertex,
}

impl Vendor {
    pub fn as_str(self) -> &'static str {
        match self {
            Vendor::OpenAi => "openai",
            Vendor::Vertex => "vertex",
        }
    }
}

impl std::fmt::Display for Vendor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Vendor {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" | "a" => Ok(Vendor::OpenAi),
            "vertex" | "google" | "gemini" | "b" => Ok(Vendor::Vertex),
            other => Err(GatewayError::new(
                ErrorKind::InvalidRequest,
                format!("unrecognized vendor {other:?}"),
            )),
        }
    }
}

/// A role in the conversation. Spec messages are system/user/assistant only —
/// tool-call plumbing is internal to each provider adapter, never part of the
/// unified contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single message in the conversation history. Content is always plain
/// text; the unified contract has no multimodal surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self { role: Role::System, content: text.into() }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self { role: Role::User, content: text.into() }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: text.into() }
    }
}

/// Grounding policy requested for a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroundingMode {
    #[default]
    Off,
    Auto,
    Required,
}

/// Optional ambient-location trigger attached to a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlsContext {
    pub country_code: String,
    pub locale: String,
}

/// Request sent to the gateway. Immutable once accepted: the Router is the
/// only component permitted to mutate it (ALS injection, policy
/// normalization), and only before the first provider call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Explicit vendor, or `None` to infer from `model` via the registry.
    pub vendor: Option<Vendor>,
    pub model: String,
    pub messages: Vec<Message>,
    pub grounded: bool,
    pub grounding_mode: GroundingMode,
    pub json_mode: bool,
    pub json_schema: Option<serde_json::Value>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub seed: Option<u64>,
    pub als_context: Option<AlsContext>,
    /// Free-form provenance: template id, run id, tenant id, ...
    pub meta: std::collections::HashMap<String, String>,
    /// Set by the Router after ALS injection to guard against double
    /// injection by a retried call path. Never set by callers.
    #[serde(default)]
    pub als_applied: bool,
}

impl CompletionRequest {
    /// Validate the request-shape invariants from the data model. Does not
    /// validate the model against an allow-list — that is the Registry's job
    /// (C1), which needs a resolved vendor first.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.messages.is_empty() {
            return Err(GatewayError::new(ErrorKind::InvalidRequest, "messages must not be empty"));
        }
        if self.model.trim().is_empty() {
            return Err(GatewayError::new(ErrorKind::InvalidRequest, "model must not be empty"));
        }
        let user_messages = self.messages.iter().filter(|m| m.role == Role::User).count();
        if user_messages != 1 {
            return Err(GatewayError::new(
                ErrorKind::InvalidRequest,
                format!("exactly one user message is required, found {user_messages}"),
            ));
        }
        if self.grounding_mode == GroundingMode::Required && !self.grounded {
            return Err(GatewayError::new(
                ErrorKind::InvalidRequest,
                "grounding_mode=required implies grounded=true",
            ));
        }
        Ok(())
    }

    /// SHA-256 over the ordered (role, content) pairs, used to prove the
    /// prompt was not mutated across retries (P1).
    pub fn hash_messages(&self) -> String {
        hash_messages(&self.messages)
    }
}

pub fn hash_messages(messages: &[Message]) -> String {
    let mut hasher = Sha256::new();
    for m in messages {
        hasher.update(match m.role {
            Role::System => b"system\0" as &[u8],
            Role::User => b"user\0",
            Role::Assistant => b"assistant\0",
        });
        hasher.update(m.content.as_bytes());
        hasher.update(b"\0");
    }
    hex::encode(hasher.finalize())
}

/// Token usage for one call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt: u32,
    pub completion: u32,
    pub total: u32,
    pub reasoning: Option<u32>,
}

/// A single extracted citation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub url: String,
    pub title: Option<String>,
    pub domain: String,
    pub anchored: bool,
    pub source_ref: Option<String>,
}

/// Exhaustive call provenance (§4.13), attached to the Response and mirrored
/// into the telemetry record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseMetadata {
    pub response_api_variant: Option<String>,
    pub text_source: Option<String>,
    pub why_not_grounded: Option<String>,
    pub tool_call_count: u32,
    pub anchored_citations_count: u32,
    pub unlinked_sources_count: u32,
    pub als_present: bool,
    pub als_sha256: Option<String>,
    pub als_variant_id: Option<u32>,
    pub als_seed_key_id: Option<String>,
    pub als_nfc_length: Option<usize>,
    pub als_leakage_detected: bool,
    pub ungrounded_retry: u32,
    pub finish_reasons: Vec<String>,
    pub block_reason: Option<String>,
    pub retry_count: u32,
    pub last_backoff_ms: Option<u64>,
    pub circuit_state: Option<String>,
    pub upstream_status: Option<u16>,
    pub limiter_bypassed: bool,
}

/// Normalized response returned to the caller (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    pub model_version: Option<String>,
    pub model_fingerprint: Option<String>,
    pub grounded_effective: bool,
    pub usage: Usage,
    pub latency_ms: u64,
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub citations: Vec<Citation>,
    pub metadata: ResponseMetadata,
}

impl CompletionResponse {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            content: String::new(),
            model_version: None,
            model_fingerprint: None,
            grounded_effective: false,
            usage: Usage::default(),
            latency_ms: 0,
            success: false,
            error_kind: Some(kind),
            error_message: Some(message.into()),
            citations: Vec::new(),
            metadata: ResponseMetadata::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_request() -> CompletionRequest {
        CompletionRequest {
            model: "gpt-5".into(),
            messages: vec![Message::system("be helpful"), Message::user("hi")],
            ..Default::default()
        }
    }

    #[test]
    fn validate_accepts_minimal_request() {
        assert!(minimal_request().validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_messages() {
        let req = CompletionRequest { model: "gpt-5".into(), ..Default::default() };
        assert!(req.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_model() {
        let req = CompletionRequest { messages: vec![Message::user("hi")], ..Default::default() };
        assert!(req.validate().is_err());
    }

    #[test]
    fn validate_rejects_more_than_one_user_message() {
        let mut req = minimal_request();
        req.messages.push(Message::user("again"));
        assert!(req.validate().is_err());
    }

    #[test]
    fn validate_rejects_required_without_grounded() {
        let mut req = minimal_request();
        req.grounding_mode = GroundingMode::Required;
        req.grounded = false;
        assert!(req.validate().is_err());
    }

    #[test]
    fn validate_accepts_required_with_grounded() {
        let mut req = minimal_request();
        req.grounding_mode = GroundingMode::Required;
        req.grounded = true;
        assert!(req.validate().is_ok());
    }

    #[test]
    fn hash_messages_is_stable_across_clones() {
        let req = minimal_request();
        let h1 = req.hash_messages();
        let h2 = req.clone().hash_messages();
        assert_eq!(h1, h2);
    }

    #[test]
    fn hash_messages_changes_when_content_changes() {
        let req = minimal_request();
        let mut req2 = req.clone();
        req2.messages[1].content.push('!');
        assert_ne!(req.hash_messages(), req2.hash_messages());
    }

    #[test]
    fn vendor_from_str_accepts_aliases() {
        assert_eq!("openai".parse::<Vendor>().unwrap(), Vendor::OpenAi);
        assert_eq!("google".parse::<Vendor>().unwrap(), Vendor::Vertex);
        assert_eq!("gemini".parse::<Vendor>().unwrap(), Vendor::Vertex);
        assert!("unknown_vendor".parse::<Vendor>().is_err());
    }
}

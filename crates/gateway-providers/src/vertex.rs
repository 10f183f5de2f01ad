// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Provider Adapter B (C9): Google Vertex / Gemini GenerateContent.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};

use gateway_config::VendorConfig;
use gateway_model::{
    CompletionRequest, CompletionResponse, ErrorKind, GatewayError, Message, ResponseMetadata, Role, Usage, Vendor,
};
use gateway_resiliency::{retry_with_backoff, AttemptError, CircuitBreakerRegistry, FailureClass, RetryPolicy};

use crate::adapter::{parse_retry_after_header, ProviderAdapter};

const SYNTHETIC_EMIT_FUNCTION: &str = "emit_result";

pub struct VertexAdapter {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    breakers: Arc<CircuitBreakerRegistry>,
    retry_policy: RetryPolicy,
    vertex_relaxed_required: bool,
    citation_extractor_emit_unlinked: bool,
}

impl VertexAdapter {
    pub fn new(
        http: reqwest::Client,
        vendor_config: &VendorConfig,
        api_key: String,
        breakers: Arc<CircuitBreakerRegistry>,
        retry_policy: RetryPolicy,
        vertex_relaxed_required: bool,
        citation_extractor_emit_unlinked: bool,
    ) -> Self {
        Self {
            http,
            base_url: vendor_config.base_url.clone().unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1".to_string()),
            api_key,
            breakers,
            retry_policy,
            vertex_relaxed_required,
            citation_extractor_emit_unlinked,
        }
    }

    async fn send_payload(&self, model: &str, payload: &Value) -> Result<(u16, Value, Option<Duration>), GatewayError> {
        let url = format!("{}/models/{model}:generateContent?key={}", self.base_url, self.api_key);
        let response = self
            .http
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| GatewayError::new(ErrorKind::ServiceUnavailableUpstream, format!("request failed: {e}")))?;
        let status = response.status().as_u16();
        let retry_after = parse_retry_after_header(response.headers());
        let body: Value = response.json().await.unwrap_or(Value::Null);
        Ok((status, body, retry_after))
    }
}

/// Rejects conversations that aren't exactly system + user, preserving
/// auditability per §4.11.1.
pub(crate) fn validate_two_message_shape(messages: &[Message]) -> Result<(&Message, &Message), GatewayError> {
    if messages.len() != 2 || messages[0].role != Role::System || messages[1].role != Role::User {
        return Err(GatewayError::new(
            ErrorKind::InvalidRequest,
            "vertex adapter requires exactly one system message followed by one user message",
        ));
    }
    Ok((&messages[0], &messages[1]))
}

pub(crate) fn build_payload(request: &CompletionRequest, use_ffc: bool) -> Result<Value, GatewayError> {
    let (system, user) = validate_two_message_shape(&request.messages)?;

    let mut payload = json!({
        "contents": [{"role": "user", "parts": [{"text": user.content}]}],
        "system_instruction": {"parts": [{"text": system.content}]},
        "generation_config": generation_config(request),
        "safety_settings": safety_settings(),
    });

    if request.grounded {
        let mut tools = vec![json!({"google_search": {}})];
        if use_ffc {
            if let Some(schema) = &request.json_schema {
                tools.push(json!({
                    "function_declarations": [{
                        "name": SYNTHETIC_EMIT_FUNCTION,
                        "description": "Emits the final structured answer.",
                        "parameters": schema,
                    }]
                }));
                payload["tool_config"] = json!({
                    "function_calling_config": {"mode": "ANY", "allowed_function_names": [SYNTHETIC_EMIT_FUNCTION]}
                });
            }
        } else {
            payload["tool_config"] = json!({"function_calling_config": {"mode": "AUTO"}});
        }
        payload["tools"] = Value::Array(tools);
    } else if use_ffc {
        return Err(GatewayError::new(ErrorKind::GroundedJsonUnsupported, "FFC requires grounding to be enabled"));
    }

    Ok(payload)
}

fn generation_config(request: &CompletionRequest) -> Value {
    let mut config = json!({});
    if let Some(t) = request.temperature {
        config["temperature"] = json!(t);
    }
    if let Some(p) = request.top_p {
        config["topP"] = json!(p);
    }
    if let Some(max_tokens) = request.max_tokens {
        config["maxOutputTokens"] = json!(max_tokens);
    }
    if let Some(seed) = request.seed {
        config["seed"] = json!(seed);
    }
    config
}

fn safety_settings() -> Value {
    let categories = [
        "HARM_CATEGORY_HARASSMENT",
        "HARM_CATEGORY_HATE_SPEECH",
        "HARM_CATEGORY_SEXUALLY_EXPLICIT",
        "HARM_CATEGORY_DANGEROUS_CONTENT",
    ];
    Value::Array(categories.iter().map(|c| json!({"category": c, "threshold": "BLOCK_ONLY_HIGH"})).collect())
}

/// Walks `candidates[*].content.parts[*].text`, falling back to a function
/// call's serialized arguments when the synthetic emit function was used.
pub(crate) fn extract_text(response: &Value) -> (String, &'static str, Vec<String>, Option<String>) {
    let finish_reasons: Vec<String> = response
        .get("candidates")
        .and_then(Value::as_array)
        .map(|candidates| candidates.iter().filter_map(|c| c.get("finishReason").and_then(Value::as_str).map(String::from)).collect())
        .unwrap_or_default();

    let block_reason =
        response.get("promptFeedback").and_then(|f| f.get("blockReason")).and_then(Value::as_str).map(String::from);

    let Some(candidate) = response.get("candidates").and_then(Value::as_array).and_then(|c| c.first()) else {
        return (String::new(), "empty", finish_reasons, block_reason);
    };
    let Some(parts) = candidate.get("content").and_then(|c| c.get("parts")).and_then(Value::as_array) else {
        return (String::new(), "empty", finish_reasons, block_reason);
    };

    for part in parts {
        if let Some(call) = part.get("functionCall") {
            if call.get("name").and_then(Value::as_str) == Some(SYNTHETIC_EMIT_FUNCTION) {
                let args = call.get("args").cloned().unwrap_or(Value::Null);
                return (args.to_string(), "function_call_arguments", finish_reasons, block_reason);
            }
        }
    }

    let mut text = String::new();
    for part in parts {
        if let Some(t) = part.get("text").and_then(Value::as_str) {
            text.push_str(t);
        }
    }
    (text, "candidate_parts", finish_reasons, block_reason)
}

fn collect_vertex_sources(response: &Value) -> Vec<gateway_grounding::RawSource> {
    let mut sources = Vec::new();
    let Some(candidates) = response.get("candidates").and_then(Value::as_array) else { return sources };
    for candidate in candidates {
        let metadata = candidate.get("grounding_metadata").or_else(|| candidate.get("groundingMetadata"));
        let Some(metadata) = metadata else { continue };
        let chunks = metadata.get("grounding_chunks").or_else(|| metadata.get("groundingChunks")).and_then(Value::as_array);
        if let Some(chunks) = chunks {
            for chunk in chunks {
                if let Some(url) = chunk.get("web").and_then(|w| w.get("uri")).and_then(Value::as_str) {
                    sources.push(gateway_grounding::RawSource {
                        url: url.to_string(),
                        title: chunk.get("web").and_then(|w| w.get("title")).and_then(Value::as_str).map(String::from),
                        anchored: metadata.get("grounding_supports").or_else(|| metadata.get("groundingSupports")).is_some(),
                        source_ref: None,
                    });
                }
            }
        }
        let citations = metadata.get("citations").and_then(Value::as_array);
        if let Some(citations) = citations {
            for citation in citations {
                if let Some(url) = citation.get("url").and_then(Value::as_str) {
                    sources.push(gateway_grounding::RawSource { url: url.to_string(), title: None, anchored: false, source_ref: None });
                }
            }
        }
    }
    sources
}

#[async_trait]
impl ProviderAdapter for VertexAdapter {
    fn vendor(&self) -> Vendor {
        Vendor::Vertex
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, GatewayError> {
        request.validate()?;
        validate_two_message_shape(&request.messages)?;

        let breaker = self.breakers.get(self.vendor().as_str(), &request.model);
        let expected_hash = request.hash_messages();
        let use_ffc = request.grounded && request.json_mode;
        let started = Instant::now();
        let model = request.model.clone();

        if !breaker.allow() {
            // Fail fast while open (P5/P8): never enter the retry loop,
            // which would otherwise back off across attempts that all
            // reject without touching the network.
            return Err(GatewayError::new(ErrorKind::ServiceUnavailableUpstream, "circuit breaker open"));
        }

        let outcome = retry_with_backoff(&self.retry_policy, &expected_hash, |attempt| {
            let breaker = breaker.clone();
            let hash = expected_hash.clone();
            let model = model.clone();
            async move {
                let payload = build_payload(request, use_ffc).map_err(AttemptError::new)?;
                if !breaker.allow() {
                    return Err(AttemptError::new(GatewayError::new(ErrorKind::ServiceUnavailableUpstream, "circuit breaker open")));
                }
                match self.send_payload(&model, &payload).await {
                    Ok((status, body, _retry_after)) if (200..300).contains(&status) => {
                        breaker.record_success();
                        let response = self.build_response(request, &body, started.elapsed());
                        Ok((response, hash))
                    }
                    Ok((status, body, retry_after)) => {
                        let class = if status >= 500 {
                            FailureClass::Server5xx
                        } else if status == 429 {
                            FailureClass::RateLimited429
                        } else {
                            FailureClass::Other
                        };
                        breaker.record_failure(class);
                        Err(classify_http_error(status, &body, attempt, self.retry_policy.max_attempts, retry_after))
                    }
                    Err(e) => {
                        breaker.record_failure(FailureClass::Server5xx);
                        Err(AttemptError::new(e))
                    }
                }
            }
        })
        .await?;

        let mut response = outcome.response;
        response.metadata.retry_count = outcome.attempts - 1;
        response.metadata.last_backoff_ms = outcome.last_backoff_ms;
        Ok(response)
    }
}

impl VertexAdapter {
    fn build_response(&self, request: &CompletionRequest, body: &Value, latency: Duration) -> CompletionResponse {
        let (content, text_source, finish_reasons, block_reason) = extract_text(body);

        let detection = gateway_grounding::detect_vertex_grounding(body);
        let raw_sources = collect_vertex_sources(body);
        let extraction = gateway_grounding::CitationExtractor { emit_unlinked: self.citation_extractor_emit_unlinked, ..Default::default() }.extract(raw_sources);
        let anchored_count = extraction.citations.iter().filter(|c| c.anchored).count() as u32;

        let usage = body
            .get("usageMetadata")
            .map(|u| Usage {
                prompt: u.get("promptTokenCount").and_then(Value::as_u64).unwrap_or(0) as u32,
                completion: u.get("candidatesTokenCount").and_then(Value::as_u64).unwrap_or(0) as u32,
                total: u.get("totalTokenCount").and_then(Value::as_u64).unwrap_or(0) as u32,
                reasoning: None,
            })
            .unwrap_or_default();

        let base_metadata = ResponseMetadata {
            text_source: Some(text_source.to_string()),
            tool_call_count: detection.tool_call_count,
            anchored_citations_count: anchored_count,
            unlinked_sources_count: extraction.unlinked_count as u32,
            finish_reasons: finish_reasons.clone(),
            block_reason: block_reason.clone(),
            ..Default::default()
        };

        // Empty-text policy: a safety block or empty parts is success=true,
        // content="", never an error (§4.11 empty-text policy).
        if content.is_empty() && (block_reason.is_some() || finish_reasons.iter().any(|r| r != "STOP")) {
            return CompletionResponse {
                content: String::new(),
                model_version: Some(request.model.clone()),
                model_fingerprint: None,
                grounded_effective: false,
                usage,
                latency_ms: latency.as_millis() as u64,
                success: true,
                error_kind: None,
                error_message: None,
                citations: Vec::new(),
                metadata: base_metadata,
            };
        }

        match gateway_grounding::enforce(Vendor::Vertex, request.grounding_mode, &detection, anchored_count, self.vertex_relaxed_required)
        {
            Ok(outcome) => CompletionResponse {
                content,
                model_version: Some(request.model.clone()),
                model_fingerprint: None,
                grounded_effective: outcome.grounded_effective,
                usage,
                latency_ms: latency.as_millis() as u64,
                success: true,
                error_kind: None,
                error_message: None,
                citations: extraction.citations,
                metadata: ResponseMetadata { why_not_grounded: outcome.why_not_grounded, ..base_metadata },
            },
            Err(e) => CompletionResponse {
                metadata: ResponseMetadata { why_not_grounded: Some(e.message.clone()), ..base_metadata },
                ..CompletionResponse::error(e.kind, e.message)
            },
        }
    }
}

fn classify_http_error(status: u16, body: &Value, attempt: u32, max_attempts: u32, retry_after: Option<Duration>) -> AttemptError {
    let message = body.get("error").and_then(|e| e.get("message")).and_then(Value::as_str).unwrap_or("upstream error").to_string();
    match status {
        401 | 403 => AttemptError::new(GatewayError::new(ErrorKind::VendorAuthError, message)),
        429 => {
            // §4.5/§7: consecutive 429s exhausting the retry budget are
            // reclassified as quota exhaustion, not retried further.
            if attempt >= max_attempts {
                return AttemptError::new(GatewayError::new(ErrorKind::RateLimitedQuota, message));
            }
            let error = GatewayError::new(ErrorKind::RateLimited, message);
            match retry_after {
                Some(d) => AttemptError::with_retry_after(error, d),
                None => AttemptError::new(error),
            }
        }
        400 | 422 => AttemptError::new(GatewayError::new(ErrorKind::InvalidRequest, message)),
        _ => AttemptError::new(GatewayError::new(ErrorKind::ServiceUnavailableUpstream, message)),
    }
}

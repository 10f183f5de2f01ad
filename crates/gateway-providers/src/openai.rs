// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Provider Adapter A (C8): an OpenAI-style Responses API.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};

use gateway_config::VendorConfig;
use gateway_model::{
    CompletionRequest, CompletionResponse, ErrorKind, GatewayError, GroundingMode, Message, ResponseMetadata, Role, Usage, Vendor,
};
use gateway_resiliency::{retry_with_backoff, AttemptError, CircuitBreakerRegistry, FailureClass, RetryPolicy};

use crate::adapter::{parse_retry_after_header, ProviderAdapter};

const MIN_OUTPUT_TOKENS: u32 = 16;
const DEFAULT_OUTPUT_TOKENS: u32 = 1024;
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Model name fragments that reject an explicit `temperature`.
const REASONING_MODEL_MARKERS: &[&str] = &["o1", "o3", "o4", "-reasoning"];

pub struct OpenAiAdapter {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    breakers: Arc<CircuitBreakerRegistry>,
    retry_policy: RetryPolicy,
    grounding_token_cap: u32,
    allow_preview_compat: bool,
    ungrounded_json_envelope_fallback: bool,
    citation_extractor_emit_unlinked: bool,
    health_checked: std::sync::atomic::AtomicBool,
}

impl OpenAiAdapter {
    pub fn new(
        http: reqwest::Client,
        vendor_config: &VendorConfig,
        api_key: String,
        breakers: Arc<CircuitBreakerRegistry>,
        retry_policy: RetryPolicy,
        allow_preview_compat: bool,
        ungrounded_json_envelope_fallback: bool,
        citation_extractor_emit_unlinked: bool,
    ) -> Self {
        Self {
            http,
            base_url: vendor_config.base_url.clone().unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key,
            breakers,
            retry_policy,
            grounding_token_cap: vendor_config.grounding_token_cap,
            allow_preview_compat,
            ungrounded_json_envelope_fallback,
            citation_extractor_emit_unlinked,
            health_checked: std::sync::atomic::AtomicBool::new(false),
        }
    }

    async fn ensure_health_checked(&self) {
        use std::sync::atomic::Ordering;
        if self.health_checked.load(Ordering::Relaxed) {
            return;
        }
        let url = format!("{}/models", self.base_url);
        let _ = tokio::time::timeout(HEALTH_CHECK_TIMEOUT, self.http.get(&url).bearer_auth(&self.api_key).send()).await;
        self.health_checked.store(true, Ordering::Relaxed);
    }

    async fn send_payload(&self, payload: &Value) -> Result<(u16, Value, Option<Duration>), GatewayError> {
        let url = format!("{}/responses", self.base_url);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
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

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn vendor(&self) -> Vendor {
        Vendor::OpenAi
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, GatewayError> {
        request.validate()?;
        self.ensure_health_checked().await;

        let breaker = self.breakers.get(self.vendor().as_str(), &request.model);
        let expected_hash = request.hash_messages();
        let max_output_tokens = resolve_max_output_tokens(request.max_tokens, request.grounded, self.grounding_token_cap);
        let include_temperature = !is_reasoning_model(&request.model);
        let started = Instant::now();

        let mut tool_variant = "web_search".to_string();
        let mut text_source = "message_output_text".to_string();

        if !breaker.allow() {
            // Fail fast while open (P5/P8): never enter the retry loop,
            // which would otherwise back off across attempts that all
            // reject without touching the network.
            return Err(GatewayError::new(ErrorKind::ServiceUnavailableUpstream, "circuit breaker open"));
        }

        let outcome = retry_with_backoff(&self.retry_policy, &expected_hash, |attempt| {
            let breaker = breaker.clone();
            let payload = build_payload(request, &tool_variant, max_output_tokens, include_temperature);
            let hash = expected_hash.clone();
            let mut text_source = text_source.clone();
            async move {
                if !breaker.allow() {
                    return Err(AttemptError::new(GatewayError::new(
                        ErrorKind::ServiceUnavailableUpstream,
                        "circuit breaker open",
                    )));
                }

                match self.send_payload(&payload).await {
                    Ok((status, body, _retry_after)) if (200..300).contains(&status) => {
                        breaker.record_success();
                        let response = self.build_response(request, &body, started.elapsed(), &mut text_source).await?;
                        Ok((response, hash))
                    }
                    Ok((status, body, retry_after)) => {
                        let class = if status >= 500 { FailureClass::Server5xx } else if status == 429 { FailureClass::RateLimited429 } else { FailureClass::Other };
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
        .await;

        match outcome {
            Ok(result) => {
                let mut response = result.response;
                response.metadata.retry_count = result.attempts - 1;
                response.metadata.last_backoff_ms = result.last_backoff_ms;
                response.metadata.response_api_variant = Some(tool_variant.clone());

                if response.success && response.content.is_empty() && !request.grounded && self.ungrounded_json_envelope_fallback {
                    // TextEnvelope fallback (§4.10.3): a strictly conversational
                    // model returned no text; retry once with a synthetic
                    // `{content: string}` schema and unwrap the envelope.
                    if let Ok(envelope_response) = self.complete_envelope_retry(request, max_output_tokens, include_temperature, started).await {
                        return Ok(envelope_response);
                    }
                }
                Ok(response)
            }
            Err(e) if request.grounded && self.allow_preview_compat && tool_variant == "web_search" => {
                // Retry once against the preview tool name per §4.10.2.
                tool_variant = "web_search_preview".to_string();
                self.complete_with_fixed_tool(request, &tool_variant, max_output_tokens, include_temperature, &expected_hash, &breaker, started).await.map_err(|_| e)
            }
            Err(e) => Err(e),
        }
    }
}

impl OpenAiAdapter {
    async fn complete_with_fixed_tool(
        &self,
        request: &CompletionRequest,
        tool_variant: &str,
        max_output_tokens: u32,
        include_temperature: bool,
        expected_hash: &str,
        breaker: &Arc<gateway_resiliency::CircuitBreaker>,
        started: Instant,
    ) -> Result<CompletionResponse, GatewayError> {
        let payload = build_payload(request, tool_variant, max_output_tokens, include_temperature);
        if !breaker.allow() {
            return Err(GatewayError::new(ErrorKind::ServiceUnavailableUpstream, "circuit breaker open"));
        }
        let (status, body, _retry_after) = self.send_payload(&payload).await?;
        if !(200..300).contains(&status) {
            breaker.record_failure(if status >= 500 { FailureClass::Server5xx } else { FailureClass::Other });
            return Err(GatewayError::new(ErrorKind::ServiceUnavailableUpstream, format!("preview retry failed with status {status}")));
        }
        breaker.record_success();
        let mut text_source = "message_output_text".to_string();
        let mut response = self.build_response(request, &body, started.elapsed(), &mut text_source).await?;
        response.metadata.response_api_variant = Some(tool_variant.to_string());
        Ok(response)
    }

    /// §4.10.3: a strictly conversational model returned no text on the
    /// first ungrounded attempt. Re-issue once with a synthetic
    /// `{content: string}` schema and unwrap the envelope.
    async fn complete_envelope_retry(
        &self,
        request: &CompletionRequest,
        max_output_tokens: u32,
        include_temperature: bool,
        started: Instant,
    ) -> Result<CompletionResponse, GatewayError> {
        let payload = build_envelope_payload(request, max_output_tokens, include_temperature);
        let (status, body, _retry_after) = self.send_payload(&payload).await?;
        if !(200..300).contains(&status) {
            return Err(GatewayError::new(ErrorKind::ServiceUnavailableUpstream, format!("envelope retry failed with status {status}")));
        }

        let envelope_text = extract_envelope_content(&body).ok_or_else(|| GatewayError::new(ErrorKind::EmptyCompletion, "envelope retry returned no usable content"))?;

        let mut text_source = "json_envelope_fallback".to_string();
        let mut response = self.build_response(request, &body, started.elapsed(), &mut text_source).await?;
        response.content = envelope_text;
        response.metadata.text_source = Some("json_envelope_fallback".to_string());
        response.metadata.ungrounded_retry = 1;
        response.metadata.response_api_variant = Some("web_search".to_string());
        Ok(response)
    }

    async fn build_response(
        &self,
        request: &CompletionRequest,
        body: &Value,
        latency: Duration,
        text_source: &mut String,
    ) -> Result<CompletionResponse, GatewayError> {
        let (content, source) = extract_text(body, request.grounded);
        *text_source = source.to_string();

        let detection = gateway_grounding::detect_openai_grounding(body);
        let raw_sources = collect_openai_sources(body);
        let extraction = gateway_grounding::CitationExtractor { emit_unlinked: self.citation_extractor_emit_unlinked, ..Default::default() }.extract(raw_sources);
        let anchored_count = extraction.citations.iter().filter(|c| c.anchored).count() as u32;

        let policy_outcome =
            gateway_grounding::enforce(Vendor::OpenAi, request.grounding_mode, &detection, anchored_count, false);

        let usage = body
            .get("usage")
            .map(|u| Usage {
                prompt: u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
                completion: u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
                total: u.get("total_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
                reasoning: u.get("reasoning_tokens").and_then(Value::as_u64).map(|v| v as u32),
            })
            .unwrap_or_default();

        let metadata = ResponseMetadata {
            response_api_variant: None,
            text_source: Some(text_source.clone()),
            why_not_grounded: None,
            tool_call_count: detection.tool_call_count,
            anchored_citations_count: anchored_count,
            unlinked_sources_count: extraction.unlinked_count as u32,
            circuit_state: None,
            ..Default::default()
        };

        match policy_outcome {
            Ok(outcome) => Ok(CompletionResponse {
                content,
                model_version: body.get("model").and_then(Value::as_str).map(String::from),
                model_fingerprint: body.get("system_fingerprint").and_then(Value::as_str).map(String::from),
                grounded_effective: outcome.grounded_effective,
                usage,
                latency_ms: latency.as_millis() as u64,
                success: true,
                error_kind: None,
                error_message: None,
                citations: extraction.citations,
                metadata: ResponseMetadata { why_not_grounded: outcome.why_not_grounded, ..metadata },
            }),
            Err(e) => Ok(CompletionResponse {
                content: String::new(),
                success: false,
                error_kind: Some(e.kind),
                error_message: Some(e.message.clone()),
                metadata: ResponseMetadata { why_not_grounded: Some(e.message), ..metadata },
                ..CompletionResponse::error(e.kind, "grounding policy not satisfied")
            }),
        }
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

fn tool_choice_for(mode: GroundingMode) -> Value {
    match mode {
        GroundingMode::Required => json!("required"),
        _ => json!("auto"),
    }
}

pub(crate) fn is_reasoning_model(model: &str) -> bool {
    let lower = model.to_ascii_lowercase();
    REASONING_MODEL_MARKERS.iter().any(|marker| lower.contains(marker))
}

pub(crate) fn resolve_max_output_tokens(requested: Option<u32>, grounded: bool, grounding_cap: u32) -> u32 {
    let mut value = requested.unwrap_or(DEFAULT_OUTPUT_TOKENS);
    if grounded {
        value = value.min(grounding_cap);
    }
    value.max(MIN_OUTPUT_TOKENS)
}

pub(crate) fn build_payload(request: &CompletionRequest, tool_variant: &str, max_output_tokens: u32, include_temperature: bool) -> Value {
    let input: Vec<Value> = request
        .messages
        .iter()
        .map(|m: &Message| json!({"role": role_str(m.role), "content": [{"type": "input_text", "text": m.content}]}))
        .collect();

    let mut payload = json!({
        "model": request.model,
        "input": input,
        "max_output_tokens": max_output_tokens,
    });

    if request.grounded {
        payload["tools"] = json!([{"type": tool_variant}]);
        payload["tool_choice"] = tool_choice_for(request.grounding_mode);
    }
    if request.json_mode {
        if let Some(schema) = &request.json_schema {
            payload["text"] = json!({"format": {"type": "json_schema", "name": "response", "schema": schema, "strict": true}});
        }
    }
    if include_temperature {
        if let Some(t) = request.temperature {
            payload["temperature"] = json!(t);
        }
    }
    if let Some(p) = request.top_p {
        payload["top_p"] = json!(p);
    }
    if let Some(seed) = request.seed {
        payload["seed"] = json!(seed);
    }
    payload
}

/// Synthetic `{content: string}` schema used by the TextEnvelope fallback
/// (§4.10.3) — grounding tools are never attached on this retry since it
/// only applies to ungrounded calls.
fn build_envelope_payload(request: &CompletionRequest, max_output_tokens: u32, include_temperature: bool) -> Value {
    let mut payload = build_payload(request, "web_search", max_output_tokens, include_temperature);
    payload["text"] = json!({
        "format": {
            "type": "json_schema",
            "name": "envelope",
            "schema": {"type": "object", "properties": {"content": {"type": "string"}}, "required": ["content"]},
            "strict": true,
        }
    });
    payload
}

pub(crate) fn extract_text(response: &Value, grounded: bool) -> (String, &'static str) {
    if let Some(output) = response.get("output").and_then(Value::as_array) {
        for item in output {
            if item.get("type").and_then(Value::as_str) == Some("message") {
                if let Some(content) = item.get("content").and_then(Value::as_array) {
                    for block in content {
                        if block.get("type").and_then(Value::as_str) == Some("output_text") {
                            if let Some(text) = block.get("text").and_then(Value::as_str) {
                                if !text.is_empty() {
                                    return (text.to_string(), "message_output_text");
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    if let Some(text) = response.get("output_text").and_then(Value::as_str) {
        if !text.is_empty() {
            return (text.to_string(), "output_text_field");
        }
    }

    if !grounded {
        if let Some(output) = response.get("output").and_then(Value::as_array) {
            for item in output {
                if item.get("type").and_then(Value::as_str) == Some("reasoning") {
                    if let Some(text) = item.get("text").and_then(Value::as_str) {
                        if !text.is_empty() {
                            return (text.to_string(), "reasoning_fallback");
                        }
                    }
                }
            }
        }
    }

    (String::new(), "empty")
}

fn extract_envelope_content(response: &Value) -> Option<String> {
    let (text, _) = extract_text(response, false);
    serde_json::from_str::<Value>(&text).ok()?.get("content")?.as_str().map(String::from)
}

fn collect_openai_sources(response: &Value) -> Vec<gateway_grounding::RawSource> {
    let mut sources = Vec::new();
    let Some(output) = response.get("output").and_then(Value::as_array) else { return sources };
    for item in output {
        let Some(content) = item.get("content").and_then(Value::as_array) else { continue };
        for block in content {
            let Some(annotations) = block.get("annotations").and_then(Value::as_array) else { continue };
            for annotation in annotations {
                if let Some(url) = annotation.get("url").and_then(Value::as_str) {
                    sources.push(gateway_grounding::RawSource {
                        url: url.to_string(),
                        title: annotation.get("title").and_then(Value::as_str).map(String::from),
                        anchored: true,
                        source_ref: None,
                    });
                }
            }
        }
    }
    sources
}

fn classify_http_error(status: u16, body: &Value, attempt: u32, max_attempts: u32, retry_after_header: Option<Duration>) -> AttemptError {
    let message = body.get("error").and_then(|e| e.get("message")).and_then(Value::as_str).unwrap_or("upstream error").to_string();
    match status {
        401 | 403 => AttemptError::new(GatewayError::new(ErrorKind::VendorAuthError, message)),
        429 => {
            // §4.5: honor the `Retry-After` header when present, falling
            // back to a JSON body hint some vendors send instead.
            let retry_after = retry_after_header.or_else(|| body.get("retry_after_seconds").and_then(Value::as_u64).map(Duration::from_secs));
            if attempt >= max_attempts {
                // §4.5/§7: consecutive 429s exhausting the retry budget are
                // reclassified as quota exhaustion, not retried further.
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

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Router (C10): the only component permitted to mutate a request
//! (ALS injection, policy normalization). Everything else treats the
//! request as read-only.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use gateway_config::AlsConfig;
use gateway_grounding::AlsBuilder;
use gateway_model::{CompletionRequest, CompletionResponse, ErrorKind, GatewayError, Message, ModelRegistry, Role, ResponseMetadata, Vendor};
use gateway_providers::ProviderAdapter;
use gateway_resiliency::{Admission, RateLimiter};

use crate::telemetry::{build_record, TelemetryEmitter};

pub struct TimeoutConfig {
    pub grounded: Duration,
    pub ungrounded: Duration,
}

pub struct Router {
    registry: ModelRegistry,
    als_builder: AlsBuilder,
    limiters: HashMap<Vendor, Arc<RateLimiter>>,
    adapters: HashMap<Vendor, Arc<dyn ProviderAdapter>>,
    timeouts: TimeoutConfig,
    telemetry: TelemetryEmitter,
}

impl Router {
    pub fn new(
        registry: ModelRegistry,
        als_config: &AlsConfig,
        als_seed_key: Vec<u8>,
        limiters: HashMap<Vendor, Arc<RateLimiter>>,
        adapters: HashMap<Vendor, Arc<dyn ProviderAdapter>>,
        timeouts: TimeoutConfig,
        telemetry: TelemetryEmitter,
    ) -> Self {
        let als_builder = AlsBuilder::new(als_seed_key, als_config.seed_key_id.clone(), als_config.template_id.clone(), als_config.max_chars.0);
        Self { registry, als_builder, limiters, adapters, timeouts, telemetry }
    }

    pub async fn complete(&self, mut request: CompletionRequest) -> CompletionResponse {
        let request_id = uuid::Uuid::new_v4().to_string();
        let started = Instant::now();

        let response = self.complete_inner(&mut request, &request_id).await;

        self.telemetry.emit(build_record(request_id, &request, &response));
        let _ = started; // latency already captured per-adapter; kept for future end-to-end metrics.
        response
    }

    async fn complete_inner(&self, request: &mut CompletionRequest, request_id: &str) -> CompletionResponse {
        let vendor = match self.resolve_vendor(request) {
            Ok(v) => v,
            Err(e) => return error_response(e),
        };
        request.vendor = Some(vendor);

        if let Err(e) = request.validate() {
            return error_response(e);
        }
        if let Err(e) = self.registry.validate(vendor, &request.model) {
            return error_response(e);
        }

        self.normalize_legacy_fields(request);

        if let Err(e) = self.apply_als(request) {
            return error_response(e);
        }

        let timeout = if request.grounded { self.timeouts.grounded } else { self.timeouts.ungrounded };
        let estimated_tokens = estimate_tokens(request);

        let Some(limiter) = self.limiters.get(&vendor) else {
            return error_response(GatewayError::new(ErrorKind::InvalidRequest, "no rate limiter configured for vendor"));
        };
        let admission = limiter.acquire(estimated_tokens).await;
        let limiter_bypassed = matches!(admission, Admission::Bypassed);

        let Some(adapter) = self.adapters.get(&vendor) else {
            return error_response(GatewayError::new(ErrorKind::InvalidRequest, "no adapter configured for vendor"));
        };

        let mut response = match tokio::time::timeout(timeout, adapter.complete(request)).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => error_response(e),
            Err(_) => error_response(GatewayError::new(ErrorKind::Timeout, format!("deadline of {timeout:?} exceeded"))),
        };

        drop(admission);
        limiter.commit(response.usage.total, estimated_tokens, request.grounded);
        response.metadata.limiter_bypassed = limiter_bypassed;

        if let Some(als_text) = self.pending_als_text(request) {
            response.metadata.als_present = true;
            response.metadata.als_sha256 = request.meta.get("__als_sha256").cloned();
            response.metadata.als_variant_id = request.meta.get("__als_variant_id").and_then(|v| v.parse().ok());
            response.metadata.als_seed_key_id = request.meta.get("__als_seed_key_id").cloned();
            response.metadata.als_nfc_length = request.meta.get("__als_nfc_length").and_then(|v| v.parse().ok());
            response.metadata.als_leakage_detected = gateway_grounding::detect_leakage(&als_text, &response.content);
        }

        tracing::info!(request_id, vendor = %vendor, model = %request.model, success = response.success, "call completed");
        response
    }

    fn resolve_vendor(&self, request: &CompletionRequest) -> Result<Vendor, GatewayError> {
        if let Some(v) = request.vendor {
            return Ok(v);
        }
        self.registry
            .infer_vendor(&request.model)
            .ok_or_else(|| GatewayError::new(ErrorKind::ModelNotAllowed, format!("cannot infer vendor for model {:?}", request.model)))
    }

    /// Historical "proxy" transport modes are removed; normalize them away
    /// and record the fact, never silently drop them.
    fn normalize_legacy_fields(&self, request: &mut CompletionRequest) {
        if let Some(value) = request.meta.remove("transport") {
            if value == "proxy" {
                tracing::info!("stripped legacy proxy transport field from request meta");
            }
        }
    }

    fn apply_als(&self, request: &mut CompletionRequest) -> Result<(), GatewayError> {
        if request.als_applied {
            return Ok(());
        }
        let Some(als_context) = request.als_context.clone() else { return Ok(()) };

        let block = self.als_builder.build(&als_context.country_code)?;
        inject_als(&mut request.messages, &block.text);
        request.als_applied = true;
        request.meta.insert("__als_sha256".to_string(), block.sha256.clone());
        request.meta.insert("__als_variant_id".to_string(), block.variant_id.to_string());
        request.meta.insert("__als_seed_key_id".to_string(), block.seed_key_id.clone());
        request.meta.insert("__als_nfc_length".to_string(), block.nfc_length.to_string());
        request.meta.insert("__als_text".to_string(), block.text);
        Ok(())
    }

    fn pending_als_text(&self, request: &CompletionRequest) -> Option<String> {
        request.meta.get("__als_text").cloned()
    }
}

fn inject_als(messages: &mut Vec<Message>, als_text: &str) {
    if let Some(system_msg) = messages.iter_mut().find(|m| m.role == Role::System) {
        system_msg.content = format!("{}\n\n{}", system_msg.content, als_text);
    } else {
        let insert_at = messages.iter().position(|m| m.role == Role::User).unwrap_or(0);
        messages.insert(insert_at, Message::system(als_text.to_string()));
    }
}

/// Rough token estimate for rate-limiter admission: ~4 chars/token on the
/// input plus the requested (or default) output budget.
fn estimate_tokens(request: &CompletionRequest) -> u32 {
    let char_count: usize = request.messages.iter().map(|m| m.content.len()).sum();
    let input_estimate = ((char_count / 4).max(1)) as u32;
    let output_estimate = request.max_tokens.unwrap_or(1024);
    input_estimate.saturating_add(output_estimate)
}

fn error_response(e: GatewayError) -> CompletionResponse {
    CompletionResponse {
        metadata: ResponseMetadata { why_not_grounded: None, ..Default::default() },
        ..CompletionResponse::error(e.kind, e.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_config::{AlsConfig, AlsMaxChars};
    use gateway_model::{CompletionResponse, ErrorKind, GroundingMode};
    use gateway_providers::MockAdapter;

    fn registry() -> ModelRegistry {
        let mut allow = std::collections::HashMap::new();
        allow.insert(Vendor::OpenAi, vec!["gpt-5".to_string()]);
        allow.insert(Vendor::Vertex, vec!["gemini-2.0-flash".to_string()]);
        ModelRegistry::new(allow)
    }

    fn als_config() -> AlsConfig {
        AlsConfig { seed_key_env: "GATEWAY_ALS_SEED_KEY".into(), seed_key_id: "v1".into(), template_id: "civic-v1".into(), max_chars: AlsMaxChars(350) }
    }

    fn build_router(adapters: HashMap<Vendor, Arc<dyn ProviderAdapter>>) -> Router {
        let mut limiters = HashMap::new();
        limiters.insert(Vendor::OpenAi, Arc::new(RateLimiter::new(100_000, 8)));
        limiters.insert(Vendor::Vertex, Arc::new(RateLimiter::new(100_000, 8)));
        let (telemetry, _rx) = TelemetryEmitter::new(16);
        Router::new(
            registry(),
            &als_config(),
            b"test-seed".to_vec(),
            limiters,
            adapters,
            TimeoutConfig { grounded: Duration::from_secs(120), ungrounded: Duration::from_secs(60) },
            telemetry,
        )
    }

    fn request() -> CompletionRequest {
        CompletionRequest {
            vendor: Some(Vendor::OpenAi),
            model: "gpt-5".into(),
            messages: vec![Message::system("be helpful"), Message::user("hi")],
            grounding_mode: GroundingMode::Off,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn rejects_model_not_in_allow_list() {
        let mut adapters: HashMap<Vendor, Arc<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert(Vendor::OpenAi, Arc::new(MockAdapter::new(Vendor::OpenAi, vec![])));
        let router = build_router(adapters);
        let mut req = request();
        req.model = "not-allowed".into();
        let response = router.complete(req).await;
        assert!(!response.success);
        assert_eq!(response.error_kind, Some(ErrorKind::ModelNotAllowed));
    }

    #[tokio::test]
    async fn dispatches_to_mock_adapter_and_returns_success() {
        let mock = Arc::new(MockAdapter::new(
            Vendor::OpenAi,
            vec![Ok(CompletionResponse { content: "hello".into(), success: true, ..CompletionResponse::error(ErrorKind::EmptyCompletion, "") })],
        ));
        let mut adapters: HashMap<Vendor, Arc<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert(Vendor::OpenAi, mock.clone());
        let router = build_router(adapters);
        let response = router.complete(request()).await;
        assert!(response.success);
        assert_eq!(response.content, "hello");
    }

    #[tokio::test]
    async fn injects_als_into_existing_system_message() {
        let mock = Arc::new(MockAdapter::new(
            Vendor::OpenAi,
            vec![Ok(CompletionResponse { content: "ok".into(), success: true, ..CompletionResponse::error(ErrorKind::EmptyCompletion, "") })],
        ));
        let mut adapters: HashMap<Vendor, Arc<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert(Vendor::OpenAi, mock.clone());
        let router = build_router(adapters);
        let mut req = request();
        req.als_context = Some(gateway_model::AlsContext { country_code: "US".into(), locale: "en-US".into() });
        let _ = router.complete(req).await;

        let calls = mock.calls.lock().unwrap();
        let sent = &calls[0];
        assert!(sent.als_applied);
        let system_content = &sent.messages.iter().find(|m| m.role == Role::System).unwrap().content;
        assert!(system_content.len() > "be helpful".len());
    }

    #[tokio::test]
    async fn strips_legacy_proxy_transport_field() {
        let mock = Arc::new(MockAdapter::new(
            Vendor::OpenAi,
            vec![Ok(CompletionResponse { content: "ok".into(), success: true, ..CompletionResponse::error(ErrorKind::EmptyCompletion, "") })],
        ));
        let mut adapters: HashMap<Vendor, Arc<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert(Vendor::OpenAi, mock.clone());
        let router = build_router(adapters);
        let mut req = request();
        req.meta.insert("transport".into(), "proxy".into());
        let _ = router.complete(req).await;
        let calls = mock.calls.lock().unwrap();
        assert!(!calls[0].meta.contains_key("transport"));
    }

    #[tokio::test]
    async fn adapter_timeout_becomes_timeout_error() {
        struct SlowAdapter;
        #[async_trait::async_trait]
        impl ProviderAdapter for SlowAdapter {
            fn vendor(&self) -> Vendor {
                Vendor::OpenAi
            }
            async fn complete(&self, _request: &CompletionRequest) -> Result<CompletionResponse, GatewayError> {
                tokio::time::sleep(Duration::from_secs(10)).await;
                unreachable!()
            }
        }
        let mut limiters = HashMap::new();
        limiters.insert(Vendor::OpenAi, Arc::new(RateLimiter::new(100_000, 8)));
        limiters.insert(Vendor::Vertex, Arc::new(RateLimiter::new(100_000, 8)));
        let mut adapters: HashMap<Vendor, Arc<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert(Vendor::OpenAi, Arc::new(SlowAdapter));
        let (telemetry, _rx) = TelemetryEmitter::new(16);
        let router = Router::new(
            registry(),
            &als_config(),
            b"test-seed".to_vec(),
            limiters,
            adapters,
            TimeoutConfig { grounded: Duration::from_millis(10), ungrounded: Duration::from_millis(10) },
            telemetry,
        );
        let response = router.complete(request()).await;
        assert!(!response.success);
        assert_eq!(response.error_kind, Some(ErrorKind::Timeout));
    }
}

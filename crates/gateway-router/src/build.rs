// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Composition root: turns a loaded [`GatewayConfig`] plus resolved vendor
//! credentials into a fully wired [`Router`]. Kept separate from `router.rs`
//! so `Router` itself never reads config or touches the network directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use gateway_config::{resolve_credential, GatewayConfig};
use gateway_model::{ModelRegistry, Vendor};
use gateway_providers::{OpenAiAdapter, ProviderAdapter, VertexAdapter};
use gateway_resiliency::{CircuitBreakerRegistry, RateLimiter, RetryPolicy};

use crate::router::{Router, TimeoutConfig};
use crate::telemetry::TelemetryEmitter;

const OPENAI_DEFAULT_CREDENTIAL_ENV: &str = "OPENAI_API_KEY";
const VERTEX_DEFAULT_CREDENTIAL_ENV: &str = "VERTEX_API_KEY";
const TELEMETRY_QUEUE_CAPACITY: usize = 1024;

/// Builds a [`Router`] and its telemetry receiver from configuration. Missing
/// credentials for a vendor that has a non-empty allow-list fail loudly here,
/// at wiring time, rather than at first call.
pub fn build_router(
    config: &GatewayConfig,
    als_seed_key: Vec<u8>,
) -> anyhow::Result<(Router, tokio::sync::mpsc::Receiver<crate::telemetry::TelemetryRecord>)> {
    let http = reqwest::Client::new();
    let breakers = Arc::new(CircuitBreakerRegistry::new());
    let retry_policy = RetryPolicy::default();

    let mut allow_lists: HashMap<Vendor, Vec<String>> = HashMap::new();
    let mut limiters: HashMap<Vendor, Arc<RateLimiter>> = HashMap::new();
    let mut adapters: HashMap<Vendor, Arc<dyn ProviderAdapter>> = HashMap::new();

    if let Some(vendor_config) = config.vendors.get("openai") {
        allow_lists.insert(Vendor::OpenAi, vendor_config.allow_list.clone());
        limiters.insert(
            Vendor::OpenAi,
            Arc::new(RateLimiter::new(vendor_config.rate_limit.tokens_per_minute, vendor_config.rate_limit.max_concurrency as usize)),
        );
        let api_key = resolve_credential(vendor_config, OPENAI_DEFAULT_CREDENTIAL_ENV)?;
        adapters.insert(
            Vendor::OpenAi,
            Arc::new(OpenAiAdapter::new(
                http.clone(),
                vendor_config,
                api_key,
                breakers.clone(),
                retry_policy.clone(),
                config.feature_flags.allow_preview_compat,
                config.feature_flags.ungrounded_json_envelope_fallback,
                config.feature_flags.citation_extractor_emit_unlinked,
            )),
        );
    }

    if let Some(vendor_config) = config.vendors.get("vertex") {
        allow_lists.insert(Vendor::Vertex, vendor_config.allow_list.clone());
        limiters.insert(
            Vendor::Vertex,
            Arc::new(RateLimiter::new(vendor_config.rate_limit.tokens_per_minute, vendor_config.rate_limit.max_concurrency as usize)),
        );
        let api_key = resolve_credential(vendor_config, VERTEX_DEFAULT_CREDENTIAL_ENV)?;
        adapters.insert(
            Vendor::Vertex,
            Arc::new(VertexAdapter::new(
                http.clone(),
                vendor_config,
                api_key,
                breakers.clone(),
                retry_policy.clone(),
                config.feature_flags.vertex_relaxed_required,
                config.feature_flags.citation_extractor_emit_unlinked,
            )),
        );
    }

    let registry = ModelRegistry::new(allow_lists);
    let timeouts = TimeoutConfig {
        grounded: Duration::from_secs(config.timeouts.grounded_seconds),
        ungrounded: Duration::from_secs(config.timeouts.ungrounded_seconds),
    };
    let (telemetry, receiver) = TelemetryEmitter::new(TELEMETRY_QUEUE_CAPACITY);

    let router = Router::new(registry, &config.als, als_seed_key, limiters, adapters, timeouts, telemetry);
    Ok((router, receiver))
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_config::VendorConfig;

    fn config_with_openai_only() -> GatewayConfig {
        let mut vendors = HashMap::new();
        vendors.insert(
            "openai".to_string(),
            VendorConfig { allow_list: vec!["gpt-5".into()], api_key_env: Some("GATEWAY_TEST_BUILD_OPENAI_KEY".into()), ..VendorConfig::default() },
        );
        GatewayConfig { vendors, ..GatewayConfig::default() }
    }

    #[test]
    fn build_router_fails_loudly_when_credential_is_missing() {
        std::env::remove_var("GATEWAY_TEST_BUILD_OPENAI_KEY");
        let result = build_router(&config_with_openai_only(), b"seed".to_vec());
        assert!(result.is_err());
    }

    #[test]
    fn build_router_succeeds_once_credential_is_set() {
        std::env::set_var("GATEWAY_TEST_BUILD_OPENAI_KEY", "sk-test");
        let result = build_router(&config_with_openai_only(), b"seed".to_vec());
        assert!(result.is_ok());
        std::env::remove_var("GATEWAY_TEST_BUILD_OPENAI_KEY");
    }
}

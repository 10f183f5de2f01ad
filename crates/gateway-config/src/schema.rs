// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_tpm() -> u32 {
    60_000
}

fn default_max_concurrency() -> u32 {
    8
}

fn default_grounding_token_cap() -> u32 {
    6000
}

fn default_grounded_timeout_s() -> u64 {
    120
}

fn default_ungrounded_timeout_s() -> u64 {
    60
}

/// Top-level gateway configuration, assembled by [`crate::loader::load`] from
/// layered YAML files and then overlaid with environment-variable
/// credentials and feature flags (see [`crate::env`]).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Per-vendor allow-lists, rate limits, and grounding ceilings.
    ///
    /// ```yaml
    /// vendors:
    ///   openai:
    ///     allow_list: [gpt-5, gpt-5-mini]
    ///     rate_limit: { tokens_per_minute: 90000, max_concurrency: 16 }
    ///   vertex:
    ///     allow_list: [gemini-2.0-flash, gemini-2.0-pro]
    /// ```
    #[serde(default)]
    pub vendors: HashMap<String, VendorConfig>,
    #[serde(default)]
    pub als: AlsConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub feature_flags: FeatureFlags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorConfig {
    /// Model identifiers this vendor may serve. Requests for any other model
    /// fail loudly (C1) — there is no implicit wildcard.
    #[serde(default)]
    pub allow_list: Vec<String>,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Ceiling applied to `max_output_tokens` on grounded calls (§4.10.4).
    #[serde(default = "default_grounding_token_cap")]
    pub grounding_token_cap: u32,
    /// Environment variable holding the vendor's credential. Read once at
    /// process init; a missing value fails loudly rather than at first call.
    pub api_key_env: Option<String>,
    pub base_url: Option<String>,
}

impl Default for VendorConfig {
    fn default() -> Self {
        Self {
            allow_list: Vec::new(),
            rate_limit: RateLimitConfig::default(),
            grounding_token_cap: default_grounding_token_cap(),
            api_key_env: None,
            base_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Sliding-minute token budget (C3).
    #[serde(default = "default_tpm")]
    pub tokens_per_minute: u32,
    /// Concurrency semaphore size (C3).
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { tokens_per_minute: default_tpm(), max_concurrency: default_max_concurrency() }
    }
}

/// Ambient Location Signal generation settings (C2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlsConfig {
    /// Environment variable holding the HMAC seed key. Never stored in YAML.
    #[serde(default = "default_seed_key_env")]
    pub seed_key_env: String,
    /// Identifies which seed key was used, for provenance without exposing
    /// the key itself in telemetry.
    #[serde(default = "default_seed_key_id")]
    pub seed_key_id: String,
    /// Identifies the template revision used to render ALS blocks.
    #[serde(default = "default_template_id")]
    pub template_id: String,
    #[serde(default)]
    pub max_chars: AlsMaxChars,
}

fn default_seed_key_env() -> String {
    "GATEWAY_ALS_SEED_KEY".to_string()
}

fn default_seed_key_id() -> String {
    "v1".to_string()
}

fn default_template_id() -> String {
    "civic-v1".to_string()
}

/// Newtype so the 350-char invariant (§4.2, P4) has one place to change and
/// cannot silently drift if a future config field reuses `max_chars`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AlsMaxChars(pub usize);

impl Default for AlsMaxChars {
    fn default() -> Self {
        Self(350)
    }
}

impl Default for AlsConfig {
    fn default() -> Self {
        Self {
            seed_key_env: default_seed_key_env(),
            seed_key_id: default_seed_key_id(),
            template_id: default_template_id(),
            max_chars: AlsMaxChars::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_grounded_timeout_s")]
    pub grounded_seconds: u64,
    #[serde(default = "default_ungrounded_timeout_s")]
    pub ungrounded_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { grounded_seconds: default_grounded_timeout_s(), ungrounded_seconds: default_ungrounded_timeout_s() }
    }
}

/// Deployment-level toggles named in §6. All default to the behavior the
/// original source shipped with in its non-experimental path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlags {
    /// Allow Adapter A to retry with a preview tool variant (`web_search` →
    /// `web_search_preview`) on an HTTP 400 "unsupported" response.
    #[serde(default = "default_true")]
    pub allow_preview_compat: bool,
    /// Allow the TextEnvelope fallback (§4.10.3) for ungrounded empty
    /// completions.
    #[serde(default = "default_true")]
    pub ungrounded_json_envelope_fallback: bool,
    /// Include unlinked (non-anchored) sources in the Citation Extractor's
    /// output, not just anchored ones.
    #[serde(default = "default_true")]
    pub citation_extractor_emit_unlinked: bool,
    /// Legacy "proxy"/"vantage" transport modes are removed; this flag only
    /// controls whether the Router logs that it stripped one (§9 Open
    /// Question 3). Normalization happens unconditionally.
    #[serde(default = "default_true")]
    pub disable_proxies: bool,
    /// §9 Open Question 1, decided in DESIGN.md: whether REQUIRED on Vertex
    /// is satisfied by unlinked-only citations (search ran, nothing
    /// anchored). Off by default — the strict interpretation.
    #[serde(default)]
    pub vertex_relaxed_required: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            allow_preview_compat: true,
            ungrounded_json_envelope_fallback: true,
            citation_extractor_emit_unlinked: true,
            disable_proxies: true,
            vertex_relaxed_required: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_no_vendors() {
        let cfg = GatewayConfig::default();
        assert!(cfg.vendors.is_empty());
    }

    #[test]
    fn vendor_config_defaults_match_spec_ceiling() {
        let v = VendorConfig::default();
        assert_eq!(v.grounding_token_cap, 6000);
        assert_eq!(v.rate_limit.max_concurrency, 8);
    }

    #[test]
    fn als_max_chars_defaults_to_350() {
        assert_eq!(AlsConfig::default().max_chars.0, 350);
    }

    #[test]
    fn feature_flags_default_relaxed_off() {
        assert!(!FeatureFlags::default().vertex_relaxed_required);
    }
}

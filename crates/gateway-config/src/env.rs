// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Environment-variable overlay for the feature flags named in §6.
//!
//! YAML config owns allow-lists and rate limits; booleans that operators
//! commonly flip per-deployment without a config redeploy read from the
//! environment instead, overriding whatever the YAML layers produced.

use crate::FeatureFlags;

/// Applies any set `GATEWAY_*` environment variables on top of `base`,
/// returning the effective flags. Unset variables leave the YAML-derived
/// value untouched.
pub struct FeatureFlagOverrides;

impl FeatureFlagOverrides {
    pub fn apply(base: FeatureFlags) -> FeatureFlags {
        FeatureFlags {
            allow_preview_compat: env_bool("ALLOW_PREVIEW_COMPAT", base.allow_preview_compat),
            ungrounded_json_envelope_fallback: env_bool(
                "UNGROUNDED_JSON_ENVELOPE_FALLBACK",
                base.ungrounded_json_envelope_fallback,
            ),
            citation_extractor_emit_unlinked: env_bool(
                "CITATION_EXTRACTOR_EMIT_UNLINKED",
                base.citation_extractor_emit_unlinked,
            ),
            disable_proxies: env_bool("DISABLE_PROXIES", base.disable_proxies),
            vertex_relaxed_required: env_bool("VERTEX_RELAXED_REQUIRED", base.vertex_relaxed_required),
        }
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Grounding Policy State Machine (§4.8) and the JSON × Grounding
//! combination check (§4.9).

use gateway_model::{ErrorKind, GatewayError, GroundingMode, Vendor};

use crate::detector::DetectionResult;

#[derive(Debug, Clone, Default)]
pub struct PolicyOutcome {
    pub grounded_effective: bool,
    pub why_not_grounded: Option<String>,
    /// Set when an `OFF` call unexpectedly received tool evidence anyway.
    pub anomaly: bool,
}

/// Applies the grounding policy after a call returns. `anchored_citations_count`
/// is the count already produced by the Citation Extractor (C7).
pub fn enforce(
    vendor: Vendor,
    mode: GroundingMode,
    detection: &DetectionResult,
    anchored_citations_count: u32,
    vertex_relaxed_required: bool,
) -> Result<PolicyOutcome, GatewayError> {
    match mode {
        GroundingMode::Off => {
            if detection.grounded_effective {
                tracing::warn!("grounding evidence present on an OFF-mode call");
            }
            Ok(PolicyOutcome { grounded_effective: detection.grounded_effective, why_not_grounded: None, anomaly: detection.grounded_effective })
        }
        GroundingMode::Auto => Ok(PolicyOutcome {
            grounded_effective: detection.grounded_effective,
            why_not_grounded: (!detection.grounded_effective).then(|| "no_tool_calls".to_string()),
            anomaly: false,
        }),
        GroundingMode::Required => {
            if !detection.grounded_effective {
                return Err(GatewayError::new(ErrorKind::GroundingRequiredFailed, "no_tool_calls"));
            }
            // Vendor A always needs at least one anchored citation; Vendor B
            // may be satisfied by unlinked-only evidence when the deployment
            // opts into the relaxed profile.
            let satisfied = anchored_citations_count >= 1 || (vendor == Vendor::Vertex && vertex_relaxed_required);
            if !satisfied {
                return Err(GatewayError::new(ErrorKind::GroundingRequiredFailed, "only_unlinked_citations"));
            }
            Ok(PolicyOutcome { grounded_effective: true, why_not_grounded: None, anomaly: false })
        }
    }
}

/// Capability probe: fails fast without attempting the call when the model
/// is already known not to support web search.
pub fn capability_probe(mode: GroundingMode, model_supports_search: bool) -> Result<(), GatewayError> {
    if mode == GroundingMode::Required && !model_supports_search {
        return Err(GatewayError::new(ErrorKind::GroundingNotSupported, "model does not support web search"));
    }
    Ok(())
}

/// Checks whether the model/vendor combination can deliver grounded output
/// under a forced JSON schema in the same call.
pub fn check_json_grounding_combination(supported: bool) -> Result<(), GatewayError> {
    if !supported {
        return Err(GatewayError::new(ErrorKind::GroundedJsonUnsupported, "model cannot combine grounding and JSON output in one call"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grounded() -> DetectionResult {
        DetectionResult { grounded_effective: true, tool_call_count: 1, types_seen: Default::default() }
    }

    fn ungrounded() -> DetectionResult {
        DetectionResult::default()
    }

    #[test]
    fn off_mode_passes_through_regardless_of_evidence() {
        let outcome = enforce(Vendor::OpenAi, GroundingMode::Off, &grounded(), 1, false).unwrap();
        assert!(outcome.anomaly);
    }

    #[test]
    fn auto_mode_never_fails() {
        let outcome = enforce(Vendor::OpenAi, GroundingMode::Auto, &ungrounded(), 0, false).unwrap();
        assert!(!outcome.grounded_effective);
        assert_eq!(outcome.why_not_grounded.as_deref(), Some("no_tool_calls"));
    }

    #[test]
    fn required_fails_without_any_tool_evidence() {
        let err = enforce(Vendor::OpenAi, GroundingMode::Required, &ungrounded(), 0, false).unwrap_err();
        assert_eq!(err.kind, ErrorKind::GroundingRequiredFailed);
    }

    #[test]
    fn required_fails_for_vendor_a_without_anchored_citation() {
        let err = enforce(Vendor::OpenAi, GroundingMode::Required, &grounded(), 0, false).unwrap_err();
        assert_eq!(err.kind, ErrorKind::GroundingRequiredFailed);
    }

    #[test]
    fn required_succeeds_for_vendor_a_with_anchored_citation() {
        let outcome = enforce(Vendor::OpenAi, GroundingMode::Required, &grounded(), 1, false).unwrap();
        assert!(outcome.grounded_effective);
    }

    #[test]
    fn required_fails_for_vendor_b_unlinked_only_when_strict() {
        let err = enforce(Vendor::Vertex, GroundingMode::Required, &grounded(), 0, false).unwrap_err();
        assert_eq!(err.kind, ErrorKind::GroundingRequiredFailed);
    }

    #[test]
    fn required_succeeds_for_vendor_b_unlinked_only_when_relaxed() {
        let outcome = enforce(Vendor::Vertex, GroundingMode::Required, &grounded(), 0, true).unwrap();
        assert!(outcome.grounded_effective);
    }

    #[test]
    fn capability_probe_blocks_unsupported_models() {
        let err = capability_probe(GroundingMode::Required, false).unwrap_err();
        assert_eq!(err.kind, ErrorKind::GroundingNotSupported);
    }

    #[test]
    fn capability_probe_allows_auto_on_unsupported_models() {
        assert!(capability_probe(GroundingMode::Auto, false).is_ok());
    }

    #[test]
    fn json_combination_check_fails_when_unsupported() {
        let err = check_json_grounding_combination(false).unwrap_err();
        assert_eq!(err.kind, ErrorKind::GroundedJsonUnsupported);
    }
}

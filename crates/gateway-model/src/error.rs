// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The surface-able error taxonomy (§7). Every kind here is something a
/// caller may legitimately branch on; anything else is a bug, not a
/// `GatewayError` variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    InvalidRequest,
    ModelNotAllowed,
    VendorAuthError,
    RateLimited,
    RateLimitedQuota,
    ServiceUnavailableUpstream,
    Timeout,
    GroundingRequiredFailed,
    GroundingNotSupported,
    GroundedJsonUnsupported,
    EmptyCompletion,
    Cancelled,
}

impl ErrorKind {
    /// Whether the Retry/Backoff Engine (C5) may retry an error of this kind.
    /// `RateLimited` is retryable up to the point it is reclassified as
    /// `RateLimitedQuota`; `ServiceUnavailableUpstream` is retryable until the
    /// breaker opens.
    pub fn retryable(self) -> bool {
        matches!(self, ErrorKind::ServiceUnavailableUpstream | ErrorKind::Timeout | ErrorKind::RateLimited)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::InvalidRequest => "INVALID_REQUEST",
            ErrorKind::ModelNotAllowed => "MODEL_NOT_ALLOWED",
            ErrorKind::VendorAuthError => "VENDOR_AUTH_ERROR",
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::RateLimitedQuota => "RATE_LIMITED_QUOTA",
            ErrorKind::ServiceUnavailableUpstream => "SERVICE_UNAVAILABLE_UPSTREAM",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::GroundingRequiredFailed => "GROUNDING_REQUIRED_FAILED",
            ErrorKind::GroundingNotSupported => "GROUNDING_NOT_SUPPORTED",
            ErrorKind::GroundedJsonUnsupported => "GROUNDED_JSON_UNSUPPORTED",
            ErrorKind::EmptyCompletion => "EMPTY_COMPLETION",
            ErrorKind::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// The gateway's single error type. Adapters translate vendor SDK/HTTP errors
/// into this taxonomy; the Router never leaks a raw SDK error to the caller.
#[derive(Debug, Error, Clone)]
#[error("{kind}: {message}")]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub message: String,
    /// Correlates with the telemetry record emitted for the same call.
    pub telemetry_id: Option<String>,
}

impl GatewayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), telemetry_id: None }
    }

    pub fn with_telemetry_id(mut self, id: impl Into<String>) -> Self {
        self.telemetry_id = Some(id.into());
        self
    }

    pub fn retryable(&self) -> bool {
        self.kind.retryable()
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The shared adapter boundary both vendor adapters implement.

use async_trait::async_trait;
use gateway_model::{CompletionRequest, CompletionResponse, GatewayError, Vendor};

/// A single-vendor completion backend. Implementations own their own
/// retry/backoff looping against C5 and consult C4 (circuit breaker) before
/// each attempt; they never own their own breaker instance.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn vendor(&self) -> Vendor;

    /// Performs one logical call, including internal retries. Returns an
    /// error only for conditions the Router must translate into a
    /// `success=false` response; adapters never panic on vendor data.
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, GatewayError>;
}

/// Parses the `Retry-After` header's delay-seconds form (§4.5: "honor
/// `Retry-After` header if present"). HTTP-date form is not emitted by
/// either vendor's 429 responses, so it is not handled here.
pub(crate) fn parse_retry_after_header(headers: &reqwest::header::HeaderMap) -> Option<std::time::Duration> {
    headers.get(reqwest::header::RETRY_AFTER)?.to_str().ok()?.trim().parse::<u64>().ok().map(std::time::Duration::from_secs)
}

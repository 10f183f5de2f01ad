// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Telemetry Emitter (C11): one best-effort, non-blocking record per call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use gateway_model::{CompletionRequest, CompletionResponse, Vendor};
use serde::Serialize;
use tokio::sync::mpsc;

/// One record per call, success or failure. Field names mirror §4.13.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryRecord {
    pub request_id: String,
    pub vendor: Option<Vendor>,
    pub requested_model: String,
    pub effective_model: Option<String>,
    pub response_api_variant: Option<String>,

    pub grounded_requested: bool,
    pub grounding_mode: gateway_model::GroundingMode,
    pub grounded_effective: bool,
    pub why_not_grounded: Option<String>,
    pub tool_call_count: u32,
    pub anchored_citations_count: u32,
    pub unlinked_sources_count: u32,

    pub als_present: bool,
    pub als_sha256: Option<String>,
    pub als_variant_id: Option<u32>,
    pub als_seed_key_id: Option<String>,
    pub als_nfc_length: Option<usize>,

    pub retry_count: u32,
    pub last_backoff_ms: Option<u64>,
    pub circuit_state: Option<String>,
    pub upstream_status: Option<u16>,
    pub limiter_bypassed: bool,

    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub latency_ms: u64,

    pub template_id: Option<String>,
    pub run_id: Option<String>,
    pub tenant_id: Option<String>,

    pub success: bool,
    pub error_kind: Option<String>,
}

pub fn build_record(request_id: String, request: &CompletionRequest, response: &CompletionResponse) -> TelemetryRecord {
    TelemetryRecord {
        request_id,
        vendor: request.vendor,
        requested_model: request.model.clone(),
        effective_model: response.model_version.clone(),
        response_api_variant: response.metadata.response_api_variant.clone(),
        grounded_requested: request.grounded,
        grounding_mode: request.grounding_mode,
        grounded_effective: response.grounded_effective,
        why_not_grounded: response.metadata.why_not_grounded.clone(),
        tool_call_count: response.metadata.tool_call_count,
        anchored_citations_count: response.metadata.anchored_citations_count,
        unlinked_sources_count: response.metadata.unlinked_sources_count,
        als_present: response.metadata.als_present,
        als_sha256: response.metadata.als_sha256.clone(),
        als_variant_id: response.metadata.als_variant_id,
        als_seed_key_id: response.metadata.als_seed_key_id.clone(),
        als_nfc_length: response.metadata.als_nfc_length,
        retry_count: response.metadata.retry_count,
        last_backoff_ms: response.metadata.last_backoff_ms,
        circuit_state: response.metadata.circuit_state.clone(),
        upstream_status: response.metadata.upstream_status,
        limiter_bypassed: response.metadata.limiter_bypassed,
        prompt_tokens: response.usage.prompt,
        completion_tokens: response.usage.completion,
        total_tokens: response.usage.total,
        latency_ms: response.latency_ms,
        template_id: request.meta.get("template_id").cloned(),
        run_id: request.meta.get("run_id").cloned(),
        tenant_id: request.meta.get("tenant_id").cloned(),
        success: response.success,
        error_kind: response.error_kind.map(|k| k.to_string()),
    }
}

/// Emission is best-effort: a full queue drops the record and increments a
/// counter rather than blocking or failing the call.
pub struct TelemetryEmitter {
    sender: mpsc::Sender<TelemetryRecord>,
    dropped: Arc<AtomicU64>,
}

impl TelemetryEmitter {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TelemetryRecord>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender, dropped: Arc::new(AtomicU64::new(0)) }, receiver)
    }

    pub fn emit(&self, record: TelemetryRecord) {
        if self.sender.try_send(record).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("telemetry queue full, dropping record");
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_model::{CompletionRequest, CompletionResponse, ErrorKind, Message};

    #[tokio::test]
    async fn emit_delivers_to_receiver() {
        let (emitter, mut rx) = TelemetryEmitter::new(4);
        let request = CompletionRequest { model: "gpt-5".into(), messages: vec![Message::user("hi")], ..Default::default() };
        let response = CompletionResponse::error(ErrorKind::EmptyCompletion, "x");
        emitter.emit(build_record("req-1".into(), &request, &response));
        let record = rx.recv().await.unwrap();
        assert_eq!(record.requested_model, "gpt-5");
    }

    #[test]
    fn emit_increments_dropped_counter_when_queue_full() {
        let (emitter, _rx) = TelemetryEmitter::new(1);
        let request = CompletionRequest { model: "gpt-5".into(), messages: vec![Message::user("hi")], ..Default::default() };
        let response = CompletionResponse::error(ErrorKind::EmptyCompletion, "x");
        emitter.emit(build_record("req-1".into(), &request, &response));
        emitter.emit(build_record("req-2".into(), &request, &response));
        emitter.emit(build_record("req-3".into(), &request, &response));
        assert!(emitter.dropped_count() >= 1);
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! A fixture-driven fake adapter backing the seed-test scenarios without
//! any network access.

use std::sync::Mutex;

use async_trait::async_trait;
use gateway_model::{CompletionRequest, CompletionResponse, GatewayError, Vendor};

use crate::adapter::ProviderAdapter;

/// Replays a queue of canned results, one per call, in order. Exhausting
/// the queue is a test-authoring bug, so it panics rather than fabricating
/// a response.
pub struct MockAdapter {
    vendor: Vendor,
    responses: Mutex<Vec<Result<CompletionResponse, GatewayError>>>,
    pub calls: Mutex<Vec<CompletionRequest>>,
}

impl MockAdapter {
    pub fn new(vendor: Vendor, responses: Vec<Result<CompletionResponse, GatewayError>>) -> Self {
        Self { vendor, responses: Mutex::new(responses), calls: Mutex::new(Vec::new()) }
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn vendor(&self) -> Vendor {
        self.vendor
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, GatewayError> {
        self.calls.lock().unwrap().push(request.clone());
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            panic!("MockAdapter queue exhausted — the test scenario issued more calls than it set up");
        }
        responses.remove(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_model::{CompletionResponse, ErrorKind, Message};

    fn request() -> CompletionRequest {
        CompletionRequest { model: "gpt-5".into(), messages: vec![Message::user("hi")], ..Default::default() }
    }

    #[tokio::test]
    async fn replays_responses_in_order() {
        let adapter = MockAdapter::new(
            Vendor::OpenAi,
            vec![Ok(CompletionResponse::error(ErrorKind::EmptyCompletion, "first")), Err(GatewayError::new(ErrorKind::Timeout, "second"))],
        );
        let first = adapter.complete(&request()).await;
        assert!(first.unwrap().error_message.unwrap().contains("first"));
        let second = adapter.complete(&request()).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn records_every_call() {
        let adapter = MockAdapter::new(Vendor::OpenAi, vec![Ok(CompletionResponse::error(ErrorKind::EmptyCompletion, "x"))]);
        let _ = adapter.complete(&request()).await;
        assert_eq!(adapter.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    #[should_panic(expected = "queue exhausted")]
    async fn panics_when_queue_exhausted() {
        let adapter = MockAdapter::new(Vendor::OpenAi, vec![]);
        let _ = adapter.complete(&request()).await;
    }
}

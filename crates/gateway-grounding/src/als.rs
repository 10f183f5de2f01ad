// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! ALS Builder (C2): a deterministic, HMAC-seeded ambient location signal.
//!
//! The raw block text must never reach a log line — only its SHA-256 and
//! provenance fields. Callers that need to inspect the text do so only to
//! inject it into a request, never to log it.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

use gateway_model::{ErrorKind, GatewayError};

type HmacSha256 = Hmac<Sha256>;

/// Fixed, regulatory-neutral date so the block is reproducible regardless of
/// when it is generated.
const FIXED_DATE: &str = "2024-01-15";

/// Generic civic phrases; index chosen deterministically by HMAC, never by
/// content of the request.
const PHRASES: &[&str] = &[
    "Public offices follow standard weekday hours unless otherwise posted.",
    "Local date formatting follows the regional civic convention.",
    "Government services observe published regional holidays.",
    "Addresses follow the regional postal format where applicable.",
];

const TIMEZONES: &[&[&str]] = &[
    &["UTC"],
    &["America/New_York", "America/Chicago", "America/Los_Angeles"],
    &["Europe/London"],
    &["Europe/Berlin", "Europe/Paris"],
    &["Asia/Tokyo"],
    &["Australia/Sydney"],
];

/// Known commercial/brand terms that must never appear in a rendered block —
/// a build-time template sanity check, not a runtime content filter.
const FORBIDDEN_TERMS: &[&str] = &["google", "openai", "amazon", "microsoft", "http://", "https://"];

#[derive(Debug, Clone)]
pub struct AlsBlock {
    pub text: String,
    pub sha256: String,
    pub variant_id: u32,
    pub seed_key_id: String,
    pub nfc_length: usize,
}

pub struct AlsBuilder {
    seed_key: Vec<u8>,
    seed_key_id: String,
    template_id: String,
    max_chars: usize,
}

impl AlsBuilder {
    pub fn new(seed_key: Vec<u8>, seed_key_id: impl Into<String>, template_id: impl Into<String>, max_chars: usize) -> Self {
        Self { seed_key, seed_key_id: seed_key_id.into(), template_id: template_id.into(), max_chars }
    }

    /// Builds the block for `country_code`. Fails with `INVALID_REQUEST`
    /// (`ALS_BLOCK_TOO_LONG`) rather than truncating — truncation would
    /// silently break the prompt-immutability guarantee downstream.
    pub fn build(&self, country_code: &str) -> Result<AlsBlock, GatewayError> {
        let country = canonicalize_country(country_code);
        let digest = self.hmac_digest(&country);

        let phrase_idx = (u64::from_be_bytes(digest[0..8].try_into().unwrap()) % PHRASES.len() as u64) as usize;
        let tz_group = &TIMEZONES[phrase_idx % TIMEZONES.len()];
        let tz_idx = (u32::from_be_bytes(digest[8..12].try_into().unwrap()) as usize) % tz_group.len();
        let timezone = tz_group[tz_idx];

        let rendered = format!("[{country} / {timezone} / {FIXED_DATE}] {}", PHRASES[phrase_idx]);
        let normalized = normalize_text(&rendered);

        let nfc_length = normalized.chars().count();
        if nfc_length > self.max_chars {
            return Err(GatewayError::new(
                ErrorKind::InvalidRequest,
                format!("ALS_BLOCK_TOO_LONG: block is {nfc_length} chars, max is {}", self.max_chars),
            ));
        }
        debug_assert!(validate_als_block(&normalized), "als template produced a disallowed block");

        let sha256 = hex::encode(Sha256::digest(normalized.as_bytes()));
        Ok(AlsBlock { text: normalized, sha256, variant_id: phrase_idx as u32, seed_key_id: self.seed_key_id.clone(), nfc_length })
    }

    fn hmac_digest(&self, country: &str) -> [u8; 32] {
        let mut mac = HmacSha256::new_from_slice(&self.seed_key).expect("HMAC accepts a key of any length");
        mac.update(self.seed_key_id.as_bytes());
        mac.update(b"|");
        mac.update(self.template_id.as_bytes());
        mac.update(b"|");
        mac.update(country.as_bytes());
        mac.finalize().into_bytes().into()
    }
}

fn canonicalize_country(country_code: &str) -> String {
    let upper = country_code.trim().to_ascii_uppercase();
    if upper == "UK" {
        "GB".to_string()
    } else {
        upper
    }
}

fn normalize_text(raw: &str) -> String {
    let crlf_normalized = raw.replace("\r\n", "\n");
    let nfc: String = crlf_normalized.nfc().collect();
    nfc.trim_end().to_string()
}

/// Rejects a block containing a literal URL or a commercial brand name.
fn validate_als_block(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    !FORBIDDEN_TERMS.iter().any(|term| lower.contains(term))
}

/// Detects whether `output` echoes a 2-3 word n-gram from `als_text`
/// verbatim — a sign the civic hint leaked into user-visible text. Never
/// fails the call; the Router only sets a telemetry flag.
pub fn detect_leakage(als_text: &str, output: &str) -> bool {
    let als_words: Vec<&str> = als_text.split_whitespace().collect();
    let output_lower = output.to_ascii_lowercase();
    for window in als_words.windows(3) {
        let ngram = window.join(" ").to_ascii_lowercase();
        if ngram.len() > 6 && output_lower.contains(&ngram) {
            return true;
        }
    }
    false
}

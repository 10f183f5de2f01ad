// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Citation Extractor (C7): resolves, normalizes, dedups and caps the
//! sources a grounded call surfaced.

use std::collections::HashSet;

use gateway_model::Citation;
use percent_encoding::percent_decode_str;
use url::Url;

const REDIRECT_HOST: &str = "vertexaisearch.cloud.google.com";
const REDIRECT_PATH_MARKER: &str = "grounding-api-redirect";
const REDIRECT_QUERY_KEYS: &[&str] = &["url", "u", "target", "q"];
const MAX_DECODE_ROUNDS: usize = 3;

/// Second-level public suffixes under which the registrable domain keeps
/// three labels instead of two (`co.uk` → `example.co.uk`, not `co.uk`).
const SECOND_LEVEL_SUFFIXES: &[&str] = &["co.uk", "ac.jp", "co.jp", "com.au", "co.nz", "org.uk", "gov.uk"];

/// A candidate source before resolution/normalization.
#[derive(Debug, Clone)]
pub struct RawSource {
    pub url: String,
    pub title: Option<String>,
    /// True if tied to a text span (character offsets) or an inline
    /// `url_citation`-style annotation.
    pub anchored: bool,
    pub source_ref: Option<String>,
}

pub struct CitationExtractor {
    pub max_total: usize,
    pub max_per_domain: usize,
    /// When false, unanchored sources are dropped from `citations` after
    /// dedup/capping but still counted in `unlinked_count`.
    pub emit_unlinked: bool,
}

impl Default for CitationExtractor {
    fn default() -> Self {
        Self { max_total: 10, max_per_domain: 3, emit_unlinked: true }
    }
}

/// Outcome of extraction: the capped, normalized list plus the raw count
/// observed before capping (always recorded in telemetry).
pub struct ExtractionResult {
    pub citations: Vec<Citation>,
    pub raw_count: usize,
    /// Unanchored sources seen after dedup/capping, whether or not they
    /// were kept in `citations` — always recorded, regardless of
    /// `emit_unlinked`.
    pub unlinked_count: usize,
}

impl CitationExtractor {
    pub fn extract(&self, sources: Vec<RawSource>) -> ExtractionResult {
        let raw_count = sources.len();
        let mut seen_urls: HashSet<String> = HashSet::new();
        let mut per_domain: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
        let mut out = Vec::new();

        for source in sources {
            let (resolved_url, raw_uri) = resolve_redirect(&source.url);
            let Some(normalized) = normalize_url(&resolved_url) else { continue };

            if !seen_urls.insert(normalized.clone()) {
                continue;
            }
            let domain = registrable_domain(&normalized);
            let count = per_domain.entry(domain.clone()).or_insert(0);
            if *count >= self.max_per_domain {
                continue;
            }
            *count += 1;

            out.push(Citation {
                url: normalized,
                title: source.title,
                domain,
                anchored: source.anchored,
                source_ref: source.source_ref.or(raw_uri),
            });

            if out.len() >= self.max_total {
                break;
            }
        }

        let unlinked_count = out.iter().filter(|c| !c.anchored).count();
        if !self.emit_unlinked {
            out.retain(|c| c.anchored);
        }

        ExtractionResult { citations: out, raw_count, unlinked_count }
    }
}

/// Decodes a known redirector URL to the underlying target, retaining the
/// original as `raw_uri` for provenance. Non-redirector URLs pass through
/// unchanged with `raw_uri = None`.
fn resolve_redirect(raw: &str) -> (String, Option<String>) {
    let Ok(parsed) = Url::parse(raw) else { return (raw.to_string(), None) };
    let is_redirector = parsed.host_str() == Some(REDIRECT_HOST) && parsed.path().contains(REDIRECT_PATH_MARKER);
    if !is_redirector {
        return (raw.to_string(), None);
    }

    let from_query = REDIRECT_QUERY_KEYS.iter().find_map(|key| parsed.query_pairs().find(|(k, _)| k == *key).map(|(_, v)| v.to_string()));
    let candidate = from_query.unwrap_or_else(|| {
        let segment = parsed.path_segments().and_then(|mut s| s.next_back()).unwrap_or("").to_string();
        // Some redirectors embed `url=`/`u=`/`target=`/`q=` directly in the
        // last path segment rather than as a query param.
        REDIRECT_QUERY_KEYS
            .iter()
            .find_map(|key| {
                let marker = format!("{key}=");
                segment.find(marker.as_str()).map(|idx| segment[idx + marker.len()..].to_string())
            })
            .unwrap_or(segment)
    });

    let mut decoded = candidate;
    for _ in 0..MAX_DECODE_ROUNDS {
        let next = percent_decode_str(&decoded.replace('+', " ")).decode_utf8_lossy().to_string();
        if next == decoded {
            break;
        }
        decoded = next;
        if Url::parse(&decoded).is_ok() {
            break;
        }
    }

    if Url::parse(&decoded).is_ok() {
        (decoded, Some(raw.to_string()))
    } else {
        (raw.to_string(), None)
    }
}

/// Lowercases the host, drops the fragment, and strips `utm_*` query params.
fn normalize_url(raw: &str) -> Option<String> {
    let mut parsed = Url::parse(raw).ok()?;
    parsed.set_fragment(None);

    let kept_pairs: Vec<(String, String)> =
        parsed.query_pairs().filter(|(k, _)| !k.starts_with("utm_")).map(|(k, v)| (k.into_owned(), v.into_owned())).collect();
    if kept_pairs.is_empty() {
        parsed.set_query(None);
    } else {
        let query = kept_pairs.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join("&");
        parsed.set_query(Some(&query));
    }

    let host = parsed.host_str()?.to_ascii_lowercase();
    parsed.set_host(Some(&host)).ok()?;
    Some(parsed.to_string())
}

fn registrable_domain(normalized_url: &str) -> String {
    let Ok(parsed) = Url::parse(normalized_url) else { return normalized_url.to_string() };
    let Some(host) = parsed.host_str() else { return normalized_url.to_string() };
    let stripped = host.strip_prefix("www.").unwrap_or(host);
    let labels: Vec<&str> = stripped.split('.').collect();
    if labels.len() < 2 {
        return stripped.to_string();
    }
    let last_two = labels[labels.len() - 2..].join(".");
    if SECOND_LEVEL_SUFFIXES.contains(&last_two.as_str()) && labels.len() >= 3 {
        labels[labels.len() - 3..].join(".")
    } else {
        last_two
    }
}

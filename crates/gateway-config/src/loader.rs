// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::GatewayConfig;

/// Ordered list of config file locations searched from lowest to highest
/// priority. Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    paths.push(PathBuf::from("/etc/gateway/config.yaml"));
    paths.push(PathBuf::from("/etc/gateway/config.yml"));

    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/gateway/config.yaml"));
        paths.push(home.join(".config/gateway/config.yml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("gateway/config.yaml"));
        paths.push(cfg.join("gateway/config.yml"));
    }

    paths.push(PathBuf::from(".gateway/config.yaml"));
    paths.push(PathBuf::from(".gateway/config.yml"));
    paths.push(PathBuf::from("gateway.yaml"));
    paths.push(PathBuf::from("gateway.yml"));

    paths
}

/// Load configuration by merging all discovered YAML files. `extra` may
/// provide an explicit path (e.g. a host-process `--config` flag).
pub fn load(extra: Option<&Path>) -> anyhow::Result<GatewayConfig> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                .with_context(|| format!("parsing {}", path.display()))?;
            merge_yaml(&mut merged, layer);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        let text =
            std::fs::read_to_string(p).with_context(|| format!("reading {}", p.display()))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", p.display()))?;
        merge_yaml(&mut merged, layer);
    }

    let config: GatewayConfig = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty()) {
        GatewayConfig::default()
    } else {
        serde_yaml::from_value(merged).context("deserializing merged gateway config")?
    };
    Ok(config)
}

/// Deep-merge `src` into `dst`; `src` wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

/// Resolve a credential for a vendor section: reads `api_key_env` if set,
/// otherwise falls through to the vendor's canonical default env var. A
/// missing required credential fails loudly at load time (§6), never lazily
/// on first call.
pub fn resolve_credential(vendor: &crate::VendorConfig, default_env: &str) -> anyhow::Result<String> {
    let env_name = vendor.api_key_env.as_deref().unwrap_or(default_env);
    std::env::var(env_name)
        .with_context(|| format!("required credential {env_name} is not set"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn val(s: &str) -> serde_yaml::Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn merge_scalar_src_wins() {
        let mut dst = val("x: 1");
        let src = val("x: 2");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["x"].as_i64(), Some(2));
    }

    #[test]
    fn merge_preserves_keys_not_in_src() {
        let mut dst = val("a: 1\nb: 2");
        let src = val("b: 99");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["a"].as_i64(), Some(1));
        assert_eq!(dst["b"].as_i64(), Some(99));
    }

    #[test]
    fn merge_nested_vendor_tables() {
        let mut dst = val("vendors:\n  openai:\n    allow_list: [gpt-5]\n    grounding_token_cap: 6000");
        let src = val("vendors:\n  openai:\n    allow_list: [gpt-5, gpt-5-mini]");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["vendors"]["openai"]["grounding_token_cap"].as_i64(), Some(6000));
    }

    #[test]
    fn load_returns_error_when_explicit_path_missing() {
        let result = load(Some(Path::new("/tmp/gateway_nonexistent_config_xyz.yaml")));
        assert!(result.is_err());
    }

    #[test]
    fn load_with_no_extra_path_returns_defaults() {
        let cfg = load(None).unwrap();
        assert!(cfg.vendors.is_empty());
    }

    #[test]
    fn load_explicit_file_overrides_defaults() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "vendors:\n  openai:\n    allow_list: [gpt-5]\n    rate_limit:\n      tokens_per_minute: 10000"
        )
        .unwrap();
        let cfg = load(Some(f.path())).unwrap();
        let openai = cfg.vendors.get("openai").unwrap();
        assert_eq!(openai.allow_list, vec!["gpt-5".to_string()]);
        assert_eq!(openai.rate_limit.tokens_per_minute, 10_000);
    }

    #[test]
    fn resolve_credential_prefers_explicit_env_name() {
        std::env::set_var("GATEWAY_TEST_CRED_A", "secret-a");
        let vendor = crate::VendorConfig {
            api_key_env: Some("GATEWAY_TEST_CRED_A".into()),
            ..crate::VendorConfig::default()
        };
        let cred = resolve_credential(&vendor, "GATEWAY_TEST_CRED_DEFAULT").unwrap();
        assert_eq!(cred, "secret-a");
        std::env::remove_var("GATEWAY_TEST_CRED_A");
    }

    #[test]
    fn resolve_credential_fails_loudly_when_unset() {
        std::env::remove_var("GATEWAY_TEST_CRED_MISSING");
        let vendor = crate::VendorConfig {
            api_key_env: Some("GATEWAY_TEST_CRED_MISSING".into()),
            ..crate::VendorConfig::default()
        };
        assert!(resolve_credential(&vendor, "GATEWAY_TEST_CRED_DEFAULT").is_err());
    }
}

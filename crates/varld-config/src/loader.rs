// Copyright (c) 2024-2026 The varld contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::{Config, StorageBackend};

/// Ordered list of config file locations searched from lowest to highest priority.
/// Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. System-wide default
    paths.push(PathBuf::from("/etc/varld/config.yaml"));
    paths.push(PathBuf::from("/etc/varld/config.yml"));

    // 2. XDG / home
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/varld/config.yaml"));
        paths.push(home.join(".config/varld/config.yml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("varld/config.yaml"));
        paths.push(cfg.join("varld/config.yml"));
    }

    // 3. Workspace-local
    paths.push(PathBuf::from(".varld/config.yaml"));
    paths.push(PathBuf::from(".varld/config.yml"));
    paths.push(PathBuf::from(".varld.yaml"));
    paths.push(PathBuf::from(".varld.yml"));

    paths
}

/// Load configuration by merging all discovered YAML files.
/// The `extra` argument may provide an explicit path (e.g. `--config` CLI flag).
///
/// Environment variables are applied last and win over every file layer:
/// - `AGENT_WORLD_DATA_PATH` — storage root override
/// - `VARLD_STORAGE` — back-end toggle (`file` | `memory`)
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
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

    // Deserialize the merged YAML value into Config, falling back to defaults
    // when the merged value is empty (no config files found).
    let mut config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty())
    {
        Config::default()
    } else {
        serde_yaml::from_value(merged).unwrap_or_default()
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

/// Apply environment overrides onto an already-merged config.
fn apply_env_overrides(config: &mut Config) {
    if let Ok(path) = std::env::var("AGENT_WORLD_DATA_PATH") {
        if !path.is_empty() {
            config.storage.data_path = PathBuf::from(path);
        }
    }
    if let Ok(backend) = std::env::var("VARLD_STORAGE") {
        match backend.as_str() {
            "file" => config.storage.backend = StorageBackend::File,
            "memory" => config.storage.backend = StorageBackend::Memory,
            other if !other.is_empty() => {
                debug!(value = %other, "ignoring unknown VARLD_STORAGE value");
            }
            _ => {}
        }
    }
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
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

// ─── Unit tests ──────────────────────────────────────────────────────────────

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
    fn merge_nested_tables() {
        let mut dst = val("chat:\n  provider: openai\n  model: gpt-4o");
        let src = val("chat:\n  model: gpt-4o-mini");
        merge_yaml(&mut dst, src);
        assert_eq!(dst["chat"]["provider"].as_str(), Some("openai"));
        assert_eq!(dst["chat"]["model"].as_str(), Some("gpt-4o-mini"));
    }

    #[test]
    fn load_returns_error_when_explicit_path_missing() {
        let result = load(Some(Path::new("/tmp/varld_nonexistent_config_xyz.yaml")));
        assert!(result.is_err());
    }

    #[test]
    fn load_explicit_file_overrides_defaults() {
        use std::io::Write;
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "world:\n  turn_limit: 9").unwrap();
        let cfg = load(Some(f.path())).unwrap();
        assert_eq!(cfg.world.turn_limit, 9);
    }

    #[test]
    fn env_data_path_override_wins() {
        let mut cfg = Config::default();
        std::env::set_var("AGENT_WORLD_DATA_PATH", "/tmp/varld-env-root");
        apply_env_overrides(&mut cfg);
        std::env::remove_var("AGENT_WORLD_DATA_PATH");
        assert_eq!(cfg.storage.data_path, PathBuf::from("/tmp/varld-env-root"));
    }

    #[test]
    fn env_backend_toggle_selects_memory() {
        let mut cfg = Config::default();
        std::env::set_var("VARLD_STORAGE", "memory");
        apply_env_overrides(&mut cfg);
        std::env::remove_var("VARLD_STORAGE");
        assert_eq!(cfg.storage.backend, StorageBackend::Memory);
    }
}

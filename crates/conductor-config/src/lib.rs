//! conductor-config
//!
//! Cluster name resolution and layered YAML configuration for pool
//! membership filters and per-pool memory sizes.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

const CLUSTER_NAME_ENV: &str = "CONDUCTOR_CLUSTER_NAME_FILE";
const DEFAULT_CLUSTER_NAME_FILE: &str = ".cluster_name";

/// Resolve the cluster name from a single-line text file. Checks
/// `CONDUCTOR_CLUSTER_NAME_FILE` first, then falls back to
/// `~/.cluster_name`.
pub fn read_cluster_name(override_path: Option<&Path>) -> Result<String> {
    let path = match override_path {
        Some(p) => p.to_path_buf(),
        None => match std::env::var(CLUSTER_NAME_ENV) {
            Ok(p) => PathBuf::from(p),
            Err(_) => home_dir()
                .context("could not determine home directory")?
                .join(DEFAULT_CLUSTER_NAME_FILE),
        },
    };

    let contents = fs::read_to_string(&path)
        .with_context(|| format!("read cluster name file: {}", path.display()))?;
    let name = contents.trim();
    if name.is_empty() {
        anyhow::bail!("cluster name file {} is empty", path.display());
    }
    Ok(name.to_string())
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// One pool's membership filter (provider tag match) and per-node memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub memory_mib: u64,
}

/// Top-level config shape: pool name -> pool config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub pools: BTreeMap<String, PoolConfig>,
}

/// Result of loading and merging one or more YAML layers.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: ClusterConfig,
    pub canonical_json: String,
    pub config_hash: String,
}

/// Load and deep-merge YAML files in order (later files override earlier
/// ones), then canonicalize to JSON with sorted keys and hash the result so
/// a config's effect on scheduling is reproducible and loggable.
pub fn load_layered_yaml(paths: &[&Path]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());

    for p in paths {
        if !p.exists() {
            continue;
        }
        let s = fs::read_to_string(p).with_context(|| format!("read config: {}", p.display()))?;
        let yaml_val: serde_yaml::Value =
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml: {}", p.display()))?;
        let json_val = serde_json::to_value(yaml_val).context("yaml->json conversion failed")?;
        deep_merge(&mut merged, json_val);
    }

    let canonical = canonicalize_json(&merged);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let config_hash = hex::encode(hasher.finalize());

    let config: ClusterConfig =
        serde_json::from_str(&canonical).context("config does not match expected shape")?;

    Ok(LoadedConfig {
        config,
        canonical_json: canonical,
        config_hash,
    })
}

fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val;
        }
    }
}

fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(name: &str, contents: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("conductor-config-test-{}-{}", std::process::id(), name));
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn cluster_name_reads_and_trims_file() {
        let path = write_temp("cluster", "my-cluster\n");
        let name = read_cluster_name(Some(&path)).unwrap();
        assert_eq!(name, "my-cluster");
        fs::remove_file(path).ok();
    }

    #[test]
    fn cluster_name_rejects_empty_file() {
        let path = write_temp("empty", "\n");
        assert!(read_cluster_name(Some(&path)).is_err());
        fs::remove_file(path).ok();
    }

    #[test]
    fn layered_yaml_overlay_overrides_base() {
        let base = write_temp(
            "base.yaml",
            "pools:\n  small:\n    memory_mib: 1024\n    tags:\n      role: small\n",
        );
        let overlay = write_temp("overlay.yaml", "pools:\n  small:\n    memory_mib: 2048\n");

        let loaded = load_layered_yaml(&[&base, &overlay]).unwrap();
        let small = &loaded.config.pools["small"];
        assert_eq!(small.memory_mib, 2048);
        assert_eq!(small.tags["role"], "small");

        fs::remove_file(base).ok();
        fs::remove_file(overlay).ok();
    }

    #[test]
    fn hash_is_stable_across_equivalent_layer_splits() {
        let combined = write_temp(
            "combined.yaml",
            "pools:\n  a:\n    memory_mib: 1024\n  b:\n    memory_mib: 2048\n",
        );
        let layer_a = write_temp("split-a.yaml", "pools:\n  a:\n    memory_mib: 1024\n");
        let layer_b = write_temp("split-b.yaml", "pools:\n  b:\n    memory_mib: 2048\n");

        let one_shot = load_layered_yaml(&[&combined]).unwrap();
        let split = load_layered_yaml(&[&layer_a, &layer_b]).unwrap();
        assert_eq!(one_shot.config_hash, split.config_hash);

        fs::remove_file(combined).ok();
        fs::remove_file(layer_a).ok();
        fs::remove_file(layer_b).ok();
    }

    #[test]
    fn missing_overlay_file_is_skipped_not_an_error() {
        let base = write_temp("base-only.yaml", "pools:\n  a:\n    memory_mib: 1024\n");
        let missing = PathBuf::from("/nonexistent/conductor.local.yaml");
        let loaded = load_layered_yaml(&[&base, &missing]).unwrap();
        assert_eq!(loaded.config.pools["a"].memory_mib, 1024);
        fs::remove_file(base).ok();
    }
}

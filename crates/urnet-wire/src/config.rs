//! Configuration loading from `~/.urnet/config.toml` with defaults.
//!
//! A config may list other TOML files under `include`; they are merged
//! first and the including file overrides them. Paths are relative to the
//! including file and may not climb out of its directory.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use urnet_types::config::BusConfig;

const MAX_INCLUDE_DEPTH: u32 = 10;

/// Load bus configuration, falling back to defaults on any error.
pub fn load_config(path: Option<&Path>) -> BusConfig {
    let config_path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(path = %config_path.display(), "Config file not found, using defaults");
        return BusConfig::default();
    }

    let contents = match std::fs::read_to_string(&config_path) {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, path = %config_path.display(), "Failed to read config file, using defaults");
            return BusConfig::default();
        }
    };
    let mut root = match toml::from_str::<toml::Value>(&contents) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, path = %config_path.display(), "Failed to parse config, using defaults");
            return BusConfig::default();
        }
    };

    let base_dir = config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let mut visited = HashSet::new();
    visited.insert(std::fs::canonicalize(&config_path).unwrap_or_else(|_| config_path.clone()));
    if let Err(e) = resolve_includes(&mut root, &base_dir, &mut visited, 0) {
        warn!(error = %e, "Config include resolution failed, using root config only");
    }
    if let toml::Value::Table(tbl) = &mut root {
        tbl.remove("include");
    }

    match root.try_into::<BusConfig>() {
        Ok(config) => {
            info!(path = %config_path.display(), "Loaded configuration");
            config
        }
        Err(e) => {
            warn!(error = %e, path = %config_path.display(), "Invalid config, using defaults");
            BusConfig::default()
        }
    }
}

fn resolve_includes(
    root: &mut toml::Value,
    dir: &Path,
    visited: &mut HashSet<PathBuf>,
    depth: u32,
) -> Result<(), String> {
    if depth > MAX_INCLUDE_DEPTH {
        return Err(format!("include depth exceeded {MAX_INCLUDE_DEPTH}"));
    }
    let includes: Vec<String> = match root.get("include") {
        Some(toml::Value::Array(arr)) => arr
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        _ => return Ok(()),
    };

    let mut merged = toml::Value::Table(toml::map::Map::new());
    for include in &includes {
        let rel = Path::new(include);
        if rel.is_absolute() {
            return Err(format!("include rejects absolute path: {include}"));
        }
        if rel
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(format!("include rejects path traversal: {include}"));
        }

        let resolved = dir.join(rel);
        let canonical = std::fs::canonicalize(&resolved)
            .map_err(|e| format!("include {}: {e}", resolved.display()))?;
        if !visited.insert(canonical.clone()) {
            return Err(format!("circular include: {}", resolved.display()));
        }

        let text = std::fs::read_to_string(&canonical)
            .map_err(|e| format!("include {}: {e}", resolved.display()))?;
        let mut value: toml::Value =
            toml::from_str(&text).map_err(|e| format!("include {}: {e}", resolved.display()))?;
        let child_dir = canonical.parent().unwrap_or(dir).to_path_buf();
        resolve_includes(&mut value, &child_dir, visited, depth + 1)?;
        if let toml::Value::Table(tbl) = &mut value {
            tbl.remove("include");
        }
        deep_merge_toml(&mut merged, &value);
    }

    // The including file wins over everything it includes.
    deep_merge_toml(&mut merged, root);
    *root = merged;
    Ok(())
}

/// Deep-merge two TOML values; `overlay` wins for non-table values.
pub fn deep_merge_toml(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_tbl), toml::Value::Table(overlay_tbl)) => {
            for (key, value) in overlay_tbl {
                match base_tbl.get_mut(key) {
                    Some(existing) => deep_merge_toml(existing, value),
                    None => {
                        base_tbl.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// `~/.urnet`, or a directory under the temp dir when there is no home.
pub fn urnet_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".urnet")
}

pub fn default_config_path() -> PathBuf {
    urnet_home().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_missing_file() {
        let config = load_config(Some(Path::new("/nonexistent/urnet.toml")));
        assert_eq!(config.directory.address_prefix, "UADDR");
        assert!(config.network.pipe_path.is_none());
    }

    #[test]
    fn test_load_config_reads_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            [directory]
            address = "HUB_01"
            call_timeout_ms = 250

            [network]
            ws_listen = "127.0.0.1:7700"
            "#,
        )
        .unwrap();
        let config = load_config(Some(&path));
        assert_eq!(config.directory.address.as_deref(), Some("HUB_01"));
        assert_eq!(config.directory.call_timeout_ms, 250);
        assert_eq!(config.directory.max_hops, 16);
        assert_eq!(config.network.ws_listen.as_deref(), Some("127.0.0.1:7700"));
    }

    #[test]
    fn test_bad_toml_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[directory\naddress = ").unwrap();
        assert!(load_config(Some(&path)).directory.address.is_none());
    }

    #[test]
    fn test_include_is_overridden_by_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("base.toml")).unwrap();
        writeln!(f, "[directory]\ncall_timeout_ms = 1\nmax_hops = 4").unwrap();
        drop(f);
        let root = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&root).unwrap();
        writeln!(f, "include = [\"base.toml\"]\n[directory]\ncall_timeout_ms = 900").unwrap();
        drop(f);

        let config = load_config(Some(&root));
        assert_eq!(config.directory.call_timeout_ms, 900);
        assert_eq!(config.directory.max_hops, 4);
    }

    #[test]
    fn test_include_traversal_rejected() {
        let mut root: toml::Value = toml::from_str("include = [\"../x.toml\"]").unwrap();
        let mut visited = HashSet::new();
        assert!(resolve_includes(&mut root, Path::new("."), &mut visited, 0).is_err());
    }

    #[test]
    fn test_circular_include_detected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.toml"), "include = [\"b.toml\"]").unwrap();
        std::fs::write(dir.path().join("b.toml"), "include = [\"a.toml\"]").unwrap();
        let mut root: toml::Value = toml::from_str("include = [\"a.toml\"]").unwrap();
        let mut visited = HashSet::new();
        let err = resolve_includes(&mut root, dir.path(), &mut visited, 0).unwrap_err();
        assert!(err.contains("circular"));
    }
}

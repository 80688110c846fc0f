//! Configuration loader with multi-source merging

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use config::{Config, Environment, File, FileFormat, Map, Source, Value};
use tracing::debug;

use crate::{ConfigError, ExperimentConfig};

/// Root-level INI keys kept for older experiment files, with the sectioned
/// spelling they also appear under and the key they map to.
const LEGACY_KEYS: &[(&str, &[&str], &str, LegacyKind)] = &[
    ("numnodes", &["node", "number_of_nodes"], "cluster.nodes", LegacyKind::Integer),
    (
        "failureprobability",
        &["network", "omission_probability"],
        "network.drop_probability",
        LegacyKind::Float,
    ),
    ("requestcount", &["workload", "request_count"], "workload.requests", LegacyKind::Integer),
    ("seed", &["run", "seed"], "run.seed", LegacyKind::Integer),
    ("delaymin", &["network", "delay_min"], "network.delay_min_ms", LegacyKind::Integer),
    ("delaymax", &["network", "delay_max"], "network.delay_max_ms", LegacyKind::Integer),
];

#[derive(Debug, Clone, Copy)]
enum LegacyKind {
    Integer,
    Float,
}

/// Configuration loader with builder pattern
pub struct ConfigLoader {
    file: Option<PathBuf>,
    env_prefix: String,
    overrides: Vec<(String, String)>,
}

impl ConfigLoader {
    /// Create a loader that reads defaults and `LINKFAIL_*` variables only.
    pub fn new() -> Self {
        Self {
            file: None,
            env_prefix: "LINKFAIL".to_string(),
            overrides: Vec::new(),
        }
    }

    /// Read a config file; the format follows the extension.
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Self {
        self.file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the environment variable prefix (default: "LINKFAIL")
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Override one dotted key (`network.drop_probability`), above every
    /// other source.
    pub fn with_override(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.overrides.push((key.into(), value.to_string()));
        self
    }

    /// Load configuration from all sources with proper precedence, then
    /// validate it.
    pub fn load(self) -> Result<ExperimentConfig, ConfigError> {
        let mut builder = Config::builder();

        // 1. Built-in defaults
        builder = builder.add_source(Config::try_from(&ExperimentConfig::default())?);

        // 2. Config file, then its legacy root-level keys
        if let Some(path) = &self.file {
            let format = file_format(path)?;
            builder = builder.add_source(File::from(path.as_path()).format(format).required(true));

            let file_only = Config::builder()
                .add_source(File::from(path.as_path()).format(format).required(true))
                .build()?;
            if let Some(legacy) = legacy_overrides(&file_only.collect()?)? {
                builder = builder.add_source(File::from_str(&legacy, FileFormat::Toml));
            }
        }

        // 3. Environment variables (LINKFAIL_NETWORK__DROP_PROBABILITY)
        builder = builder.add_source(
            Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        // 4. CLI overrides
        for (key, value) in self.overrides {
            builder = builder.set_override(key, value)?;
        }

        let experiment: ExperimentConfig = builder.build()?.try_deserialize()?;
        experiment.validate()?;
        Ok(experiment)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn file_format(path: &Path) -> Result<FileFormat, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("toml") => Ok(FileFormat::Toml),
        Some("ini" | "cfg") => Ok(FileFormat::Ini),
        _ => Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
    }
}

/// Translates legacy keys into a TOML fragment. Root-level keys win over
/// their sectioned spelling.
fn legacy_overrides(root: &Map<String, Value>) -> Result<Option<String>, ConfigError> {
    let mut sections: BTreeMap<&str, Vec<(&str, String)>> = BTreeMap::new();

    for (root_key, sectioned, target, kind) in LEGACY_KEYS {
        let raw = find(root, root_key).or_else(|| find_nested(root, sectioned));
        let Some(raw) = raw else { continue };

        let rendered = match kind {
            LegacyKind::Integer => raw
                .trim()
                .parse::<u64>()
                .map(|v| v.to_string())
                .map_err(|_| legacy_error(target, &raw))?,
            LegacyKind::Float => raw
                .trim()
                .parse::<f64>()
                .map(|v| format!("{v:?}"))
                .map_err(|_| legacy_error(target, &raw))?,
        };
        debug!(key = %target, value = %rendered, "applying legacy config key");
        let (section, key) = target.split_once('.').unwrap_or(("", target));
        sections.entry(section).or_default().push((key, rendered));
    }

    if sections.is_empty() {
        return Ok(None);
    }

    let mut fragment = String::new();
    for (section, entries) in sections {
        fragment.push_str(&format!("[{section}]\n"));
        for (key, value) in entries {
            fragment.push_str(&format!("{key} = {value}\n"));
        }
    }
    Ok(Some(fragment))
}

fn legacy_error(target: &str, raw: &str) -> ConfigError {
    ConfigError::ValidationError(format!("legacy value '{raw}' for {target} is not a number"))
}

fn find(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.iter()
        .find(|(k, _)| k.to_ascii_lowercase().replace('_', "") == key)
        .and_then(|(_, v)| v.clone().into_string().ok())
}

fn find_nested(map: &Map<String, Value>, path: &[&str]) -> Option<String> {
    let (section, key) = match path {
        [section, key] => (*section, *key),
        _ => return None,
    };
    let table = map
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(section))
        .and_then(|(_, v)| v.clone().into_table().ok())?;
    table
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .and_then(|(_, v)| v.clone().into_string().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Granularity;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_load_defaults() {
        let config = ConfigLoader::new()
            .with_env_prefix("LINKFAIL_TEST_UNSET")
            .load()
            .expect("defaults load");

        assert_eq!(config, ExperimentConfig::default());
    }

    #[test]
    fn test_load_toml_file() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("experiment.toml");
        fs::write(
            &path,
            r#"
[cluster]
nodes = 7
byzantine = ["6=silent"]

[network]
granularity = "per_node"
node_probabilities = [0.0, 0.1, 0.1, 0.1, 0.1, 0.1, 0.5]
delay_min_ms = 2
delay_max_ms = 2

[run]
seed = 7
"#,
        )
        .expect("write config");

        let config = ConfigLoader::new()
            .with_env_prefix("LINKFAIL_TEST_UNSET")
            .with_file(&path)
            .load()
            .expect("config loads");

        assert_eq!(config.cluster.nodes, 7);
        assert_eq!(config.cluster.byzantine.len(), 1);
        assert_eq!(config.network.granularity, Granularity::PerNode);
        assert_eq!(config.network.node_probabilities[6], 0.5);
        assert_eq!(config.network.delay_max_ms, 2);
        assert_eq!(config.run.seed, 7);
        // untouched sections keep their defaults
        assert_eq!(config.workload.requests, 100);
    }

    #[test]
    fn test_legacy_ini_keys() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("simulation.ini");
        fs::write(
            &path,
            "numNodes = 7\nfailureProbability = 0.25\nrequestCount = 40\nseed = 99\n\n[network]\ndelay_min_ms = 3\n",
        )
        .expect("write config");

        let config = ConfigLoader::new()
            .with_env_prefix("LINKFAIL_TEST_UNSET")
            .with_file(&path)
            .load()
            .expect("config loads");

        assert_eq!(config.cluster.nodes, 7);
        assert_eq!(config.network.drop_probability, 0.25);
        assert_eq!(config.workload.requests, 40);
        assert_eq!(config.run.seed, 99);
        assert_eq!(config.network.delay_min_ms, 3);
    }

    #[test]
    fn test_sectioned_legacy_ini_keys() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("simulation.ini");
        fs::write(
            &path,
            "[node]\nnumber_of_nodes = 10\n\n[network]\nomission_probability = 0.05\ndelay_min = 4\ndelay_max = 9\n",
        )
        .expect("write config");

        let config = ConfigLoader::new()
            .with_env_prefix("LINKFAIL_TEST_UNSET")
            .with_file(&path)
            .load()
            .expect("config loads");

        assert_eq!(config.cluster.nodes, 10);
        assert_eq!(config.network.drop_probability, 0.05);
        assert_eq!(config.network.delay_min_ms, 4);
        assert_eq!(config.network.delay_max_ms, 9);
    }

    #[test]
    fn test_overrides_win_over_file() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("experiment.toml");
        fs::write(&path, "[network]\ndrop_probability = 0.3\n").expect("write config");

        let config = ConfigLoader::new()
            .with_env_prefix("LINKFAIL_TEST_UNSET")
            .with_file(&path)
            .with_override("network.drop_probability", 0.1)
            .with_override("workload.requests", 5)
            .load()
            .expect("config loads");

        assert_eq!(config.network.drop_probability, 0.1);
        assert_eq!(config.workload.requests, 5);
    }

    #[test]
    fn test_invalid_file_fails_fast() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("experiment.toml");
        fs::write(&path, "[cluster]\nnodes = 5\n").expect("write config");

        let result = ConfigLoader::new()
            .with_env_prefix("LINKFAIL_TEST_UNSET")
            .with_file(&path)
            .load();
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_missing_and_unknown_files() {
        let dir = tempdir().expect("temp dir");
        let missing = dir.path().join("nope.toml");
        assert!(matches!(
            ConfigLoader::new().with_file(&missing).load(),
            Err(ConfigError::NotFound(_))
        ));

        let yaml = dir.path().join("experiment.yaml");
        fs::write(&yaml, "cluster: {}\n").expect("write config");
        assert!(matches!(
            ConfigLoader::new().with_file(&yaml).load(),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_bad_legacy_value() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("simulation.ini");
        fs::write(&path, "numNodes = four\n").expect("write config");

        let result = ConfigLoader::new()
            .with_env_prefix("LINKFAIL_TEST_UNSET")
            .with_file(&path)
            .load();
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    // Environment variables are not exercised here: setting them is unsafe
    // under edition 2024 and they leak between parallel tests. Usage:
    //
    // LINKFAIL_NETWORK__DROP_PROBABILITY=0.2
    // LINKFAIL_CLUSTER__NODES=7
}

//! Settings-file layering and connection-descriptor loading (spec §6).
//!
//! Mirrors `settings.py`'s section dataclasses and
//! `SETTINGS_SCHEMA`/`VALID_VALUES` validation one-to-one, format changed
//! from `settings.ini` to `config/settings.toml` per SPEC_FULL.md, and with
//! `resume` renamed `checkpoint` / `tm1_integration` renamed
//! `remote_integration` to drop the TM1-specific naming (see DESIGN.md).
//! Single-file rather than `cortex-core::config`'s one-file-per-section
//! split: RushTI's settings surface is an order of magnitude smaller.

use std::collections::BTreeSet;
use std::env;
use std::path::{Path, PathBuf};

use rushti_core::{ConnectionDescriptor, WorkflowMode, WorkflowSettings};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid settings.toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid connections.toml: {0}")]
    ConnectionsToml(String),

    #[error("{section}.{key} must be at least 1, got {value}")]
    MustBeAtLeastOne { section: &'static str, key: &'static str, value: i64 },

    #[error(transparent)]
    Base64(#[from] base64::DecodeError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsSettings {
    pub max_workers: u32,
    pub retries: u32,
    pub result_file: String,
    pub mode: WorkflowMode,
}

impl Default for DefaultsSettings {
    fn default() -> Self {
        Self { max_workers: 4, retries: 0, result_file: String::new(), mode: WorkflowMode::Norm }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizationSettings {
    pub lookback_runs: u32,
    pub time_of_day_weighting: bool,
    pub min_samples: u32,
    pub cache_duration_hours: u32,
}

impl Default for OptimizationSettings {
    fn default() -> Self {
        Self { lookback_runs: 10, time_of_day_weighting: false, min_samples: 3, cache_duration_hours: 24 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub format: String,
    pub file: Option<String>,
    pub max_file_size_mb: u32,
    pub backup_count: u32,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            format: "%(asctime)s %(levelname)s %(message)s".to_string(),
            file: None,
            max_file_size_mb: 10,
            backup_count: 5,
        }
    }
}

/// Generalized from `tm1_integration`: pushes run results into the remote
/// analytics server's own cube/dimension model rather than the TM1-named
/// defaults the source hard-codes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteIntegrationSettings {
    pub push_results: bool,
    pub auto_load_results: bool,
    pub default_instance: Option<String>,
    pub default_cube: String,
    pub default_workflow_dim: String,
    pub default_task_id_dim: String,
    pub default_run_id_dim: String,
    pub default_measure_dim: String,
}

impl Default for RemoteIntegrationSettings {
    fn default() -> Self {
        Self {
            push_results: false,
            auto_load_results: false,
            default_instance: None,
            default_cube: "rushti".to_string(),
            default_workflow_dim: "rushti_workflow".to_string(),
            default_task_id_dim: "rushti_task_id".to_string(),
            default_run_id_dim: "rushti_run_id".to_string(),
            default_measure_dim: "rushti_measure".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExclusiveModeSettings {
    pub enabled: bool,
    pub polling_interval: u64,
    pub timeout: u64,
}

impl Default for ExclusiveModeSettings {
    fn default() -> Self {
        Self { enabled: false, polling_interval: 30, timeout: 600 }
    }
}

/// Renamed from `resume` (spec.md §6 calls this feature "checkpoint").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSettings {
    pub enabled: bool,
    pub checkpoint_interval: u64,
    pub checkpoint_dir: String,
    pub auto_resume: bool,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self { enabled: false, checkpoint_interval: 60, checkpoint_dir: "./checkpoints".to_string(), auto_resume: false }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsSettings {
    pub enabled: bool,
    pub retention_days: u32,
    pub db_path: String,
}

impl Default for StatsSettings {
    fn default() -> Self {
        Self { enabled: false, retention_days: 90, db_path: String::new() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub defaults: DefaultsSettings,
    pub optimization: OptimizationSettings,
    pub logging: LoggingSettings,
    pub remote_integration: RemoteIntegrationSettings,
    pub exclusive_mode: ExclusiveModeSettings,
    pub checkpoint: CheckpointSettings,
    pub stats: StatsSettings,
}

const KNOWN_SECTIONS: &[&str] =
    &["defaults", "optimization", "logging", "remote_integration", "exclusive_mode", "checkpoint", "stats"];

fn known_keys(section: &str) -> &'static [&'static str] {
    match section {
        "defaults" => &["max_workers", "retries", "result_file", "mode"],
        "optimization" => &["lookback_runs", "time_of_day_weighting", "min_samples", "cache_duration_hours"],
        "logging" => &["level", "format", "file", "max_file_size_mb", "backup_count"],
        "remote_integration" => &[
            "push_results",
            "auto_load_results",
            "default_instance",
            "default_cube",
            "default_workflow_dim",
            "default_task_id_dim",
            "default_run_id_dim",
            "default_measure_dim",
        ],
        "exclusive_mode" => &["enabled", "polling_interval", "timeout"],
        "checkpoint" => &["enabled", "checkpoint_interval", "checkpoint_dir", "auto_resume"],
        "stats" => &["enabled", "retention_days", "db_path"],
        _ => &[],
    }
}

/// Logs a warning (never an error) for any section or key not in the known
/// schema, matching `settings.py`'s "(possible typo?)" warnings.
fn warn_on_unknown_keys(value: &toml::Value) {
    let Some(table) = value.as_table() else { return };
    for (section, contents) in table {
        if !KNOWN_SECTIONS.contains(&section.as_str()) {
            tracing::warn!(section, "unknown section in settings.toml (possible typo?)");
            continue;
        }
        let Some(section_table) = contents.as_table() else { continue };
        let allowed = known_keys(section);
        for key in section_table.keys() {
            if !allowed.contains(&key.as_str()) {
                tracing::warn!(section, key, "unknown setting in settings.toml (possible typo?)");
            }
        }
    }
}

fn validate(settings: &Settings) -> Result<(), ConfigError> {
    if settings.defaults.max_workers < 1 {
        return Err(ConfigError::MustBeAtLeastOne {
            section: "defaults",
            key: "max_workers",
            value: settings.defaults.max_workers as i64,
        });
    }
    Ok(())
}

/// `config/settings.toml` next to `root`, falling back to a legacy
/// `settings.toml` directly under `root` with a deprecation warning (spec
/// §6 / `resolve_settings_path`).
fn resolve_settings_path(root: &Path) -> (PathBuf, bool) {
    let new_path = root.join("config").join("settings.toml");
    if new_path.exists() {
        return (new_path, false);
    }
    let legacy_path = root.join("settings.toml");
    if legacy_path.exists() {
        return (legacy_path, true);
    }
    (new_path, false)
}

/// Loads settings with the source's discovery order: explicit `path`,
/// then `$RUSHTI_DIR/config/settings.toml`, then `<cwd>/config/settings.toml`
/// with a legacy `<cwd>/settings.toml` fallback. Returns built-in defaults
/// when no file is found at any location.
pub fn load_settings(path: Option<&Path>) -> Result<Settings, ConfigError> {
    let resolved = match path {
        Some(explicit) => explicit.to_path_buf(),
        None => {
            if let Ok(rushti_dir) = env::var("RUSHTI_DIR") {
                let env_path = PathBuf::from(&rushti_dir).join("config").join("settings.toml");
                if env_path.exists() {
                    env_path
                } else {
                    tracing::warn!(rushti_dir, "RUSHTI_DIR set but settings.toml not found in its config/ dir");
                    let (fallback, is_legacy) = resolve_settings_path(&env::current_dir()?);
                    if is_legacy {
                        tracing::warn!("settings.toml found at legacy root path; move it under config/");
                    }
                    fallback
                }
            } else {
                let (fallback, is_legacy) = resolve_settings_path(&env::current_dir()?);
                if is_legacy {
                    tracing::warn!("settings.toml found at legacy root path; move it under config/");
                }
                fallback
            }
        }
    };

    if !resolved.exists() {
        tracing::debug!(path = %resolved.display(), "settings.toml not found, using defaults");
        return Ok(Settings::default());
    }

    tracing::info!(path = %resolved.display(), "loading settings");
    let contents = std::fs::read_to_string(&resolved)?;
    let raw: toml::Value = toml::from_str(&contents)?;
    warn_on_unknown_keys(&raw);

    let settings: Settings = toml::from_str(&contents)?;
    validate(&settings)?;
    Ok(settings)
}

/// Per-run CLI overrides, highest precedence (spec §6 / `_apply_cli_args`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CliOverrides {
    pub max_workers: Option<u32>,
    pub retries: Option<u32>,
    pub result_file: Option<String>,
    pub mode: Option<WorkflowMode>,
}

/// Applies a workflow file's `settings` block, the second-highest
/// precedence tier (spec §6 / `_apply_json_settings`).
pub fn apply_workflow_settings(settings: &mut Settings, workflow: &WorkflowSettings) {
    settings.defaults.max_workers = workflow.max_workers;
    settings.defaults.retries = workflow.retries;
    if let Some(result_file) = &workflow.result_file {
        settings.defaults.result_file = result_file.clone();
    }
    settings.defaults.mode = workflow.mode;
    settings.exclusive_mode.enabled = workflow.exclusive;
}

/// Applies CLI flags, the top precedence tier.
pub fn apply_cli_overrides(settings: &mut Settings, cli: &CliOverrides) {
    if let Some(max_workers) = cli.max_workers {
        settings.defaults.max_workers = max_workers;
    }
    if let Some(retries) = cli.retries {
        settings.defaults.retries = retries;
    }
    if let Some(result_file) = &cli.result_file {
        settings.defaults.result_file = result_file.clone();
    }
    if let Some(mode) = cli.mode {
        settings.defaults.mode = mode;
    }
}

/// Loads `connections.toml`: a map of instance name to connection record,
/// with the password decoded from base64-at-rest on the way in.
pub fn load_connections(path: &Path) -> Result<std::collections::BTreeMap<String, ConnectionDescriptor>, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let mut raw: std::collections::BTreeMap<String, ConnectionDescriptor> = toml::from_str(&contents)?;
    for descriptor in raw.values_mut() {
        descriptor.password = rushti_core::decode_password_at_rest(&descriptor.password)?;
    }
    Ok(raw)
}

/// Drops connection entries for instances the workflow never references
/// (spec §6: "Instances not present in the workflow are ignored").
pub fn filter_for_workflow(
    connections: std::collections::BTreeMap<String, ConnectionDescriptor>,
    instances: &BTreeSet<String>,
) -> std::collections::BTreeMap<String, ConnectionDescriptor> {
    connections.into_iter().filter(|(name, _)| instances.contains(name)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_when_no_file_present() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings(Some(&dir.path().join("does-not-exist.toml"))).unwrap();
        assert_eq!(settings.defaults.max_workers, 4);
        assert_eq!(settings.checkpoint.checkpoint_dir, "./checkpoints");
    }

    #[test]
    fn loads_known_sections_and_rejects_bad_max_workers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[defaults]\nmax_workers = 0\n").unwrap();
        drop(file);

        let result = load_settings(Some(&path));
        assert!(matches!(result, Err(ConfigError::MustBeAtLeastOne { .. })));
    }

    #[test]
    fn loads_overridden_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "[defaults]\nmax_workers = 16\nretries = 2\n\n[stats]\nenabled = true\n").unwrap();

        let settings = load_settings(Some(&path)).unwrap();
        assert_eq!(settings.defaults.max_workers, 16);
        assert_eq!(settings.defaults.retries, 2);
        assert!(settings.stats.enabled);
    }

    #[test]
    fn cli_overrides_win_over_workflow_settings() {
        let mut settings = Settings::default();
        let workflow_settings = WorkflowSettings { max_workers: 8, ..Default::default() };
        apply_workflow_settings(&mut settings, &workflow_settings);
        assert_eq!(settings.defaults.max_workers, 8);

        let cli = CliOverrides { max_workers: Some(32), ..Default::default() };
        apply_cli_overrides(&mut settings, &cli);
        assert_eq!(settings.defaults.max_workers, 32);
    }

    #[test]
    fn connections_are_decoded_and_filtered_by_workflow_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("connections.toml");
        let encoded = {
            use base64::Engine as _;
            base64::engine::general_purpose::STANDARD.encode("secret")
        };
        std::fs::write(
            &path,
            format!(
                "[srv01]\naddress = \"tm1.example.com\"\nport = 12345\nuser = \"admin\"\npassword = \"{encoded}\"\n\n\
                 [srv02]\naddress = \"other.example.com\"\nport = 12346\nuser = \"admin\"\npassword = \"{encoded}\"\n"
            ),
        )
        .unwrap();

        let connections = load_connections(&path).unwrap();
        assert_eq!(connections.get("srv01").unwrap().password, "secret");

        let instances: BTreeSet<String> = ["srv01".to_string()].into_iter().collect();
        let filtered = filter_for_workflow(connections, &instances);
        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key("srv01"));
    }
}

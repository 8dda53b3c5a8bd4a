//! Configuration Vault – reads/writes `~/.tavern/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use zeroize::{Zeroize, ZeroizeOnDrop};

use tavern_runtime::ConsolidationConfig;

/// API key for the model server.  Wiped from memory on drop.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.is_empty() { "<not set>" } else { "<redacted>" })
    }
}

/// Persisted operator configuration stored in `~/.tavern/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory holding one storage unit per tenant.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Short-term record count that triggers automatic consolidation.
    #[serde(default = "default_ceiling")]
    pub consolidation_ceiling: usize,

    /// Minimum similarity score for an existing fact to be judged.
    #[serde(default = "default_similarity_floor")]
    pub similarity_floor: f32,

    #[serde(default = "default_oracle_timeout_secs")]
    pub oracle_timeout_secs: u64,

    #[serde(default = "default_oracle_attempts")]
    pub oracle_attempts: u32,

    /// Base URL of the OpenAI-compatible model server.
    #[serde(default = "default_llm_base_url")]
    pub llm_base_url: String,

    /// Model used for extraction and judgment (e.g. "llama3").
    #[serde(default = "default_model")]
    pub active_model: String,

    /// Optional bearer token for hosted model servers.
    #[serde(default, skip_serializing_if = "ApiKey::is_empty")]
    pub api_key: ApiKey,
}

impl Config {
    pub fn consolidation(&self) -> ConsolidationConfig {
        ConsolidationConfig {
            ceiling: self.consolidation_ceiling,
            similarity_floor: self.similarity_floor,
            oracle_timeout: Duration::from_secs(self.oracle_timeout_secs),
            oracle_attempts: self.oracle_attempts,
        }
    }
}

fn home_dir() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

fn default_data_dir() -> PathBuf {
    tavern_dir_for_home(&home_dir()).join("data")
}
fn default_ceiling() -> usize {
    ConsolidationConfig::default().ceiling
}
fn default_similarity_floor() -> f32 {
    ConsolidationConfig::default().similarity_floor
}
fn default_oracle_timeout_secs() -> u64 {
    ConsolidationConfig::default().oracle_timeout.as_secs()
}
fn default_oracle_attempts() -> u32 {
    ConsolidationConfig::default().oracle_attempts
}
fn default_llm_base_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_model() -> String {
    "llama3".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            consolidation_ceiling: default_ceiling(),
            similarity_floor: default_similarity_floor(),
            oracle_timeout_secs: default_oracle_timeout_secs(),
            oracle_attempts: default_oracle_attempts(),
            llm_base_url: default_llm_base_url(),
            active_model: default_model(),
            api_key: ApiKey::default(),
        }
    }
}

/// Return the path to `~/.tavern/config.toml`.
pub fn config_path() -> PathBuf {
    tavern_dir_for_home(&home_dir()).join("config.toml")
}

pub(crate) fn tavern_dir_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".tavern")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `TAVERN_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `TAVERN_DATA_DIR` | `data_dir` |
/// | `TAVERN_LLM_URL` | `llm_base_url` |
/// | `TAVERN_MODEL` | `active_model` |
/// | `TAVERN_CONSOLIDATION_CEILING` | `consolidation_ceiling` |
/// | `TAVERN_API_KEY` | `api_key` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("TAVERN_DATA_DIR") {
        cfg.data_dir = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("TAVERN_LLM_URL") {
        cfg.llm_base_url = v;
    }
    if let Ok(v) = std::env::var("TAVERN_MODEL") {
        cfg.active_model = v;
    }
    if let Ok(v) = std::env::var("TAVERN_CONSOLIDATION_CEILING")
        && let Ok(ceiling) = v.parse::<usize>()
        && ceiling > 0
    {
        cfg.consolidation_ceiling = ceiling;
    }
    if let Ok(v) = std::env::var("TAVERN_API_KEY") {
        cfg.api_key = ApiKey::new(v);
    }
}

/// Save the config to disk, creating `~/.tavern/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        // Owner-only (rwx------) on Unix.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    // Owner-only read/write (rw-------) on Unix.
    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config_path(dir: &tempfile::TempDir) -> PathBuf {
        tavern_dir_for_home(&dir.path().to_string_lossy()).join("config.toml")
    }

    #[test]
    fn config_debug_redacts_api_key() {
        let cfg = Config {
            api_key: ApiKey::new("sk-super-secret"),
            ..Config::default()
        };
        let debug_str = format!("{:?}", cfg);
        assert!(!debug_str.contains("sk-super-secret"));
        assert!(debug_str.contains("<redacted>"));
    }

    #[test]
    fn config_debug_shows_not_set_for_empty_key() {
        let debug_str = format!("{:?}", Config::default());
        assert!(debug_str.contains("<not set>"));
    }

    #[test]
    fn defaults_match_consolidation_defaults() {
        let cfg = Config::default();
        let consolidation = cfg.consolidation();
        assert_eq!(consolidation.ceiling, 500);
        assert_eq!(consolidation.oracle_timeout, Duration::from_secs(60));
        assert_eq!(consolidation.oracle_attempts, 2);
        assert!(cfg.data_dir.ends_with(".tavern/data"));
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = temp_config_path(&dir);
        save_to(&Config::default(), &path).expect("save");

        let file_mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = fs::metadata(path.parent().unwrap()).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn roundtrip_preserves_fields() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = temp_config_path(&dir);
        let cfg = Config {
            data_dir: PathBuf::from("/srv/tavern"),
            consolidation_ceiling: 250,
            active_model: "mistral".into(),
            ..Config::default()
        };
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.consolidation_ceiling, 250);
        assert_eq!(loaded.active_model, "mistral");
        assert!(loaded.api_key.is_empty());
    }

    #[test]
    fn missing_fields_take_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = temp_config_path(&dir);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "active_model = \"phi3\"\n").unwrap();

        let loaded = load_from(&path).unwrap().unwrap();
        assert_eq!(loaded.active_model, "phi3");
        assert_eq!(loaded.oracle_attempts, 2);
        assert_eq!(loaded.similarity_floor, 0.75);
    }

    #[test]
    fn api_key_is_written_without_redaction() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = temp_config_path(&dir);
        let cfg = Config {
            api_key: ApiKey::new("sk-123"),
            ..Config::default()
        };
        save_to(&cfg, &path).unwrap();
        assert!(fs::read_to_string(&path).unwrap().contains("api_key = \"sk-123\""));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        assert!(load_from(&temp_config_path(&dir)).unwrap().is_none());
    }

    #[test]
    fn config_path_points_to_tavern_dir() {
        let p = tavern_dir_for_home("/home/testuser").join("config.toml");
        assert!(p.to_string_lossy().contains(".tavern"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn apply_env_overrides_changes_model_and_url() {
        // SAFETY: these variables are only touched by this test.
        unsafe {
            std::env::set_var("TAVERN_MODEL", "qwen2");
            std::env::set_var("TAVERN_LLM_URL", "http://gpu-box:11434");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.active_model, "qwen2");
        assert_eq!(cfg.llm_base_url, "http://gpu-box:11434");
        unsafe {
            std::env::remove_var("TAVERN_MODEL");
            std::env::remove_var("TAVERN_LLM_URL");
        }
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_ceiling() {
        // SAFETY: this variable is only touched by this test.
        unsafe { std::env::set_var("TAVERN_CONSOLIDATION_CEILING", "lots") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.consolidation_ceiling, 500);
        unsafe { std::env::set_var("TAVERN_CONSOLIDATION_CEILING", "0") };
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.consolidation_ceiling, 500);
        unsafe { std::env::set_var("TAVERN_CONSOLIDATION_CEILING", "42") };
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.consolidation_ceiling, 42);
        unsafe { std::env::remove_var("TAVERN_CONSOLIDATION_CEILING") };
    }

    #[test]
    fn apply_env_overrides_sets_data_dir_and_key() {
        // SAFETY: these variables are only touched by this test.
        unsafe {
            std::env::set_var("TAVERN_DATA_DIR", "/var/lib/tavern");
            std::env::set_var("TAVERN_API_KEY", "from-env");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/tavern"));
        assert_eq!(cfg.api_key.expose(), "from-env");
        unsafe {
            std::env::remove_var("TAVERN_DATA_DIR");
            std::env::remove_var("TAVERN_API_KEY");
        }
    }
}

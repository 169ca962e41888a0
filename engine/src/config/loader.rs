use crate::config::error::{ConfigError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding the template manifest and cached archive blobs
    #[serde(default = "default_cache_root")]
    pub cache_root: PathBuf,

    /// Extraction ceilings
    #[serde(default)]
    pub limits: ExtractLimits,

    /// Directory lock lifetime and sweeping
    #[serde(default)]
    pub locks: LockConfig,

    /// Remote origin behaviour
    #[serde(default)]
    pub origin: OriginConfig,

    /// Theme file conventions
    #[serde(default)]
    pub theme: ThemeConfig,

    /// Tree scanning for wildcard targets
    #[serde(default)]
    pub scan: ScanConfig,
}

/// Ceilings enforced while planning an extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractLimits {
    /// Maximum number of entries in one archive
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Maximum uncompressed size of a single entry
    #[serde(default = "default_max_entry_bytes")]
    pub max_entry_bytes: u64,

    /// Maximum cumulative uncompressed size of an archive
    #[serde(default = "default_max_total_bytes")]
    pub max_total_bytes: u64,
}

/// Directory lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Seconds before an unreleased lock expires
    #[serde(default = "default_lock_ttl_secs")]
    pub ttl_secs: u64,

    /// Seconds between expiry sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// Origin fetch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginConfig {
    /// Timeout for a single fetch attempt in milliseconds
    #[serde(default = "default_origin_timeout_ms")]
    pub timeout_ms: u64,

    /// Retries after the first failed attempt
    #[serde(default = "default_origin_max_retries")]
    pub max_retries: usize,

    /// First backoff delay in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Local mirror directory used as origin (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror_dir: Option<PathBuf>,
}

/// Theme rewriter conventions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThemeConfig {
    /// Style files probed in order when a change names no file
    #[serde(default = "default_style_candidates")]
    pub style_candidates: Vec<String>,

    /// Selector of the default-scope variable block
    #[serde(default = "default_selector")]
    pub default_selector: String,

    /// Selector of the alternate-mode variable block
    #[serde(default = "default_alternate_selector")]
    pub alternate_selector: String,
}

/// Tree scanning configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Directory names never descended into
    #[serde(default = "default_ignore_dirs")]
    pub ignore_dirs: Vec<String>,
}

/// Longest lock lifetime or sweep interval accepted from configuration.
pub const MAX_LOCK_SECS: u64 = 24 * 60 * 60;

// Default value functions
fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join("tplforge"))
        .unwrap_or_else(|| PathBuf::from(".tplforge-cache"))
}
fn default_max_entries() -> usize {
    10_000
}
fn default_max_entry_bytes() -> u64 {
    64 * 1024 * 1024
}
fn default_max_total_bytes() -> u64 {
    512 * 1024 * 1024
}
fn default_lock_ttl_secs() -> u64 {
    300
}
fn default_sweep_interval_secs() -> u64 {
    30
}
fn default_origin_timeout_ms() -> u64 {
    30_000
}
fn default_origin_max_retries() -> usize {
    2
}
fn default_initial_backoff_ms() -> u64 {
    200
}
fn default_style_candidates() -> Vec<String> {
    [
        "app/globals.css",
        "src/app/globals.css",
        "styles/globals.css",
        "src/styles/globals.css",
        "src/index.css",
        "app/global.css",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
fn default_selector() -> String {
    ":root".to_string()
}
fn default_alternate_selector() -> String {
    ".dark".to_string()
}
fn default_ignore_dirs() -> Vec<String> {
    ["node_modules", ".git", ".next", "dist", "build", "target"]
        .into_iter()
        .map(String::from)
        .collect()
}

// Default implementations
impl Default for ExtractLimits {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            max_entry_bytes: default_max_entry_bytes(),
            max_total_bytes: default_max_total_bytes(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_lock_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_origin_timeout_ms(),
            max_retries: default_origin_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            mirror_dir: None,
        }
    }
}

impl Default for ThemeConfig {
    fn default() -> Self {
        Self {
            style_candidates: default_style_candidates(),
            default_selector: default_selector(),
            alternate_selector: default_alternate_selector(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            ignore_dirs: default_ignore_dirs(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_root: default_cache_root(),
            limits: ExtractLimits::default(),
            locks: LockConfig::default(),
            origin: OriginConfig::default(),
            theme: ThemeConfig::default(),
            scan: ScanConfig::default(),
        }
    }
}

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl OriginConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }
}

impl EngineConfig {
    /// Reject values that would disable a safety ceiling.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("limits.max_entries", self.limits.max_entries == 0),
            ("limits.max_entry_bytes", self.limits.max_entry_bytes == 0),
            ("limits.max_total_bytes", self.limits.max_total_bytes == 0),
            ("locks.ttl_secs", self.locks.ttl_secs == 0),
            ("locks.sweep_interval_secs", self.locks.sweep_interval_secs == 0),
            ("origin.timeout_ms", self.origin.timeout_ms == 0),
        ];
        if let Some((field, _)) = checks.iter().find(|(_, is_zero)| *is_zero) {
            return Err(ConfigError::ValidationError {
                field: (*field).to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        let ceilings = [
            ("locks.ttl_secs", self.locks.ttl_secs),
            ("locks.sweep_interval_secs", self.locks.sweep_interval_secs),
        ];
        if let Some((field, _)) = ceilings.iter().find(|(_, secs)| *secs > MAX_LOCK_SECS) {
            return Err(ConfigError::ValidationError {
                field: (*field).to_string(),
                reason: format!("must not exceed {MAX_LOCK_SECS} seconds"),
            });
        }
        if self.limits.max_entry_bytes > self.limits.max_total_bytes {
            return Err(ConfigError::ValidationError {
                field: "limits.max_entry_bytes".to_string(),
                reason: "must not exceed limits.max_total_bytes".to_string(),
            });
        }
        if self.theme.default_selector.trim().is_empty()
            || self.theme.alternate_selector.trim().is_empty()
        {
            return Err(ConfigError::ValidationError {
                field: "theme".to_string(),
                reason: "selectors must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Builds an [`EngineConfig`] from four layers, later ones winning:
///
/// 1. the `#[serde(default)]` values above
/// 2. one TOML or JSON file
/// 3. `TPLFORGE_*` variables, `__` between section and key
///    (`TPLFORGE_LIMITS__MAX_ENTRIES=500`)
/// 4. explicit overrides such as a command line's `--cache-root`
///
/// The merged result is validated before it is returned.
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    required: bool,
    cache_root: Option<PathBuf>,
    mirror_dir: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read `path`; loading fails if it does not exist.
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.file = Some(path.as_ref().to_path_buf());
        self.required = true;
        self
    }

    /// Read whichever of the conventional locations exists, if any.
    pub fn discover() -> Self {
        Self {
            file: Self::find_config_file(),
            ..Self::default()
        }
    }

    pub fn with_cache_root<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.cache_root = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn with_mirror_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.mirror_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn load(&self) -> Result<EngineConfig> {
        let mut builder = Config::builder();
        if let Some(path) = &self.file {
            if path.exists() {
                builder = builder.add_source(File::from(path.as_path()));
            } else if self.required {
                return Err(ConfigError::FileNotFound(path.clone()));
            }
        }
        builder = builder.add_source(
            Environment::with_prefix("TPLFORGE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("theme.style_candidates")
                .with_list_parse_key("scan.ignore_dirs"),
        );

        let mut config: EngineConfig = builder
            .build()?
            .try_deserialize()
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;
        if let Some(cache_root) = &self.cache_root {
            config.cache_root = cache_root.clone();
        }
        if let Some(mirror_dir) = &self.mirror_dir {
            config.origin.mirror_dir = Some(mirror_dir.clone());
        }
        config.validate()?;

        tracing::debug!(
            cache_root = %config.cache_root.display(),
            file = ?self.file,
            mirror = ?config.origin.mirror_dir,
            "engine configuration loaded"
        );
        Ok(config)
    }

    /// `./tplforge.toml`, then `<config dir>/tplforge/config.toml`.
    pub fn find_config_file() -> Option<PathBuf> {
        let local = PathBuf::from("tplforge.toml");
        if local.is_file() {
            return Some(local);
        }
        dirs::config_dir()
            .map(|dir| dir.join("tplforge").join("config.toml"))
            .filter(|path| path.is_file())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.limits.max_entries, 10_000);
        assert_eq!(config.limits.max_entry_bytes, 64 * 1024 * 1024);
        assert_eq!(config.locks.ttl_secs, 300);
        assert_eq!(config.theme.default_selector, ":root");
        assert_eq!(config.theme.alternate_selector, ".dark");
        assert!(config.scan.ignore_dirs.contains(&"node_modules".to_string()));
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_load_with_defaults_only() {
        let config = ConfigLoader::new().load().expect("defaults load");
        assert_eq!(config.origin.max_retries, 2);
        assert!(config.origin.mirror_dir.is_none());
    }

    #[test]
    #[serial]
    fn test_file_layer_overrides_defaults() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("tplforge.toml");
        std::fs::write(
            &path,
            "[limits]\nmax_entries = 42\n\n[locks]\nttl_secs = 5\n",
        )
        .expect("write config");

        let config = ConfigLoader::new().with_file(&path).load().expect("load");
        assert_eq!(config.limits.max_entries, 42);
        assert_eq!(config.locks.ttl(), Duration::from_secs(5));
        // untouched sections keep their defaults
        assert_eq!(config.limits.max_total_bytes, 512 * 1024 * 1024);
    }

    #[test]
    #[serial]
    fn test_env_layer_overrides_file() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("tplforge.toml");
        std::fs::write(&path, "[origin]\ntimeout_ms = 1000\n").expect("write config");

        // SAFETY: tests touching the environment are serialized
        unsafe { env::set_var("TPLFORGE_ORIGIN__TIMEOUT_MS", "2500") };
        let result = ConfigLoader::new().with_file(&path).load();
        unsafe { env::remove_var("TPLFORGE_ORIGIN__TIMEOUT_MS") };

        let config = result.expect("load");
        assert_eq!(config.origin.timeout(), Duration::from_millis(2500));
    }

    #[test]
    #[serial]
    fn test_missing_file_is_reported() {
        let err = ConfigLoader::new()
            .with_file("/definitely/not/here/tplforge.toml")
            .load()
            .unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    #[serial]
    fn overrides_win_over_env_and_file() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("tplforge.toml");
        std::fs::write(&path, "cache_root = \"/from/file\"\n").expect("write config");

        // SAFETY: tests touching the environment are serialized
        unsafe { env::set_var("TPLFORGE_CACHE_ROOT", "/from/env") };
        let result = ConfigLoader::new()
            .with_file(&path)
            .with_cache_root(dir.path().join("cache"))
            .with_mirror_dir(dir.path().join("mirror"))
            .load();
        unsafe { env::remove_var("TPLFORGE_CACHE_ROOT") };

        let config = result.expect("load");
        assert_eq!(config.cache_root, dir.path().join("cache"));
        assert_eq!(config.origin.mirror_dir, Some(dir.path().join("mirror")));
    }

    #[test]
    #[serial]
    fn discovered_file_may_be_absent() {
        let loader = ConfigLoader {
            file: Some(PathBuf::from("/definitely/not/here/tplforge.toml")),
            ..ConfigLoader::default()
        };
        assert!(loader.load().is_ok());
    }

    #[test]
    fn lock_durations_are_capped() {
        let mut config = EngineConfig::default();
        config.locks.ttl_secs = u64::MAX;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("locks.ttl_secs"));

        config.locks.ttl_secs = MAX_LOCK_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_ceiling_rejected() {
        let mut config = EngineConfig::default();
        config.limits.max_total_bytes = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("limits.max_total_bytes"));
    }

    #[test]
    fn test_entry_ceiling_above_total_rejected() {
        let mut config = EngineConfig::default();
        config.limits.max_entry_bytes = config.limits.max_total_bytes + 1;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError { .. })
        ));
    }
}

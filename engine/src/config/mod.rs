//! Engine configuration.
//!
//! Defaults, then a TOML/JSON file, then `TPLFORGE_*` variables, then
//! explicit overrides. See [`ConfigLoader`].
//!
//! ```no_run
//! use tplforge_engine::config::ConfigLoader;
//!
//! let config = ConfigLoader::discover()
//!     .with_cache_root("/var/cache/tplforge")
//!     .load()
//!     .expect("valid configuration");
//! ```

pub mod error;
pub mod loader;

// Re-export main types
pub use error::{ConfigError, Result};
pub use loader::{
    ConfigLoader, EngineConfig, ExtractLimits, LockConfig, OriginConfig, ScanConfig, ThemeConfig,
};

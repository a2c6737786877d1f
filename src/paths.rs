//! Centralized application directory paths.
//!
//! Single source of truth for filesystem paths the pipeline touches:
//! per-stage config files and the conversation store root. Uses the
//! [`dirs`] crate for platform-appropriate resolution.
//!
//! All paths can be overridden for testing or custom deployments via
//! `SPEECHD_CONFIG_DIR` / `SPEECHD_DATA_DIR`.

use std::path::PathBuf;

/// Application config directory (`<config_dir>/speechd/`).
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("SPEECHD_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join("speechd"))
        .unwrap_or_else(|| PathBuf::from("/tmp/speechd-config"))
}

/// Application data directory (`<data_dir>/speechd/`), parent of the
/// conversation store's `outputs/` tree.
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("SPEECHD_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join("speechd"))
        .unwrap_or_else(|| PathBuf::from("/tmp/speechd-data"))
}

/// Default root directory for the conversation store (`<data_dir>/outputs`).
#[must_use]
pub fn default_store_root() -> PathBuf {
    data_dir().join("outputs")
}

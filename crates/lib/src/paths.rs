//! Default directory locations.

use std::path::PathBuf;

use crate::consts::APP_NAME;

/// Environment variable overriding the working directory.
pub const WORKDIR_ENV: &str = "LAYERFORGE_WORKDIR";

/// Returns the user's home directory
#[cfg(windows)]
pub fn home_dir() -> PathBuf {
  std::env::var("USERPROFILE").map(PathBuf::from).unwrap_or_default()
}

/// Returns the user's home directory
#[cfg(not(windows))]
pub fn home_dir() -> PathBuf {
  std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("/"))
}

/// Returns the directory for cache files for the application
#[cfg(windows)]
pub fn cache_dir() -> PathBuf {
  std::env::var("LOCALAPPDATA")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir().join("AppData").join("Local"))
    .join(APP_NAME)
    .join("Cache")
}

/// Returns the directory for cache files for the application
#[cfg(not(windows))]
pub fn cache_dir() -> PathBuf {
  let cache_home = std::env::var("XDG_CACHE_HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir().join(".cache"));
  cache_home.join(APP_NAME)
}

/// Where phase outputs are staged while a layer builds.
///
/// `LAYERFORGE_WORKDIR` wins; otherwise a `work` directory under the cache
/// directory.
pub fn working_dir() -> PathBuf {
  std::env::var(WORKDIR_ENV)
    .map(PathBuf::from)
    .unwrap_or_else(|_| cache_dir().join("work"))
}

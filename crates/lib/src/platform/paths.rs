use std::path::PathBuf;

use crate::consts::APP_NAME;

/// Environment variable overriding the store location.
pub const STORE_ENV: &str = "LAYERFORGE_STORE";

/// Environment variable naming the base registry (directory or `http(s)://` URL).
pub const REGISTRY_ENV: &str = "LAYERFORGE_REGISTRY";

/// Returns the user's home directory
pub fn home_dir() -> PathBuf {
  std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("/root"))
}

/// Returns the directory for data files for the application
pub fn data_dir() -> PathBuf {
  let data_home = std::env::var("XDG_DATA_HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir().join(".local").join("share"));
  data_home.join(APP_NAME)
}

/// Returns the layer store root.
///
/// `LAYERFORGE_STORE` wins; otherwise `<data_dir>/store`.
pub fn store_dir() -> PathBuf {
  if let Ok(path) = std::env::var(STORE_ENV)
    && !path.is_empty()
  {
    return PathBuf::from(path);
  }
  data_dir().join("store")
}

/// Returns the configured base registry location, if any.
pub fn registry_location() -> Option<String> {
  std::env::var(REGISTRY_ENV).ok().filter(|s| !s.is_empty())
}

/// Returns the default local registry directory (`<data_dir>/registry`).
pub fn default_registry_dir() -> PathBuf {
  data_dir().join("registry")
}

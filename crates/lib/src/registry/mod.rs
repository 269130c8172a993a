//! Base snapshot registries.
//!
//! A registry maps `id:version` to a root filesystem. Directory registries may
//! hold an unpacked `rootfs/` or a `rootfs.tar.gz`; HTTP registries serve the
//! archive plus a `rootfs.tar.gz.sha256` digest file. Archives are unpacked
//! once into `<store>/bases/<digest>/rootfs` and shared by every build.

mod http;
mod local;
mod unpack;

use std::future::Future;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub use http::HttpRegistry;
pub use local::LocalRegistry;
pub use unpack::{pack_directory, unpack_archive};

use crate::recipe::BaseSpec;
use crate::util::hash::DirHashError;

pub const ARCHIVE_NAME: &str = "rootfs.tar.gz";
pub const DIGEST_SUFFIX: &str = ".sha256";
pub const ROOTFS_DIR: &str = "rootfs";

/// A resolved, pinned base snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseImageRef {
  pub id: String,
  pub version: String,
  /// SHA-256 of the archive, or of the directory tree for unpacked bases.
  pub digest: String,
  /// Root filesystem to copy from. Never modified.
  pub rootfs: PathBuf,
  /// Where the snapshot came from (directory or URL).
  pub origin: String,
}

#[derive(Debug, Error)]
pub enum RegistryError {
  #[error("base {base} not found in registry {location}")]
  NotFound { base: String, location: String },

  #[error("I/O error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to fetch {url}: {message}")]
  Fetch { url: String, message: String },

  #[error("digest mismatch for {url}: expected {expected}, got {actual}")]
  DigestMismatch {
    url: String,
    expected: String,
    actual: String,
  },

  #[error("invalid digest file {0}")]
  InvalidDigest(String),

  #[error(transparent)]
  Hash(#[from] DirHashError),

  #[error("background task failed: {0}")]
  Join(String),
}

impl RegistryError {
  pub(crate) fn io(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
    move |source| RegistryError::Io {
      path: path.to_path_buf(),
      source,
    }
  }
}

pub trait BaseRegistry {
  /// Human-readable location for logs and errors.
  fn location(&self) -> String;

  /// Locate `base` and make its rootfs available on disk.
  ///
  /// `bases_dir` is the store's shared directory for unpacked snapshots.
  fn resolve(
    &self,
    base: &BaseSpec,
    bases_dir: &Path,
  ) -> impl Future<Output = Result<BaseImageRef, RegistryError>> + Send;
}

/// The configured registry, chosen from its location string.
#[derive(Debug, Clone)]
pub enum Registry {
  Local(LocalRegistry),
  Http(HttpRegistry),
}

impl Registry {
  /// `http://` and `https://` locations use HTTP; anything else is a directory.
  pub fn from_location(location: &str) -> Self {
    if location.starts_with("http://") || location.starts_with("https://") {
      Registry::Http(HttpRegistry::new(location))
    } else {
      Registry::Local(LocalRegistry::new(PathBuf::from(location)))
    }
  }
}

impl BaseRegistry for Registry {
  fn location(&self) -> String {
    match self {
      Registry::Local(r) => r.location(),
      Registry::Http(r) => r.location(),
    }
  }

  async fn resolve(&self, base: &BaseSpec, bases_dir: &Path) -> Result<BaseImageRef, RegistryError> {
    match self {
      Registry::Local(r) => r.resolve(base, bases_dir).await,
      Registry::Http(r) => r.resolve(base, bases_dir).await,
    }
  }
}

/// Resolve a base snapshot, logging where it came from.
pub async fn resolve_base<R: BaseRegistry>(
  registry: &R,
  base: &BaseSpec,
  bases_dir: &Path,
) -> Result<BaseImageRef, RegistryError> {
  info!(base = %base, registry = %registry.location(), "resolving base");
  let resolved = registry.resolve(base, bases_dir).await?;
  info!(base = %base, digest = %resolved.digest, rootfs = ?resolved.rootfs, "base resolved");
  Ok(resolved)
}

/// Unpack an archive with the given digest into the shared bases directory.
///
/// Reuses an existing unpacked copy.
pub(crate) async fn unpack_shared(archive: PathBuf, digest: &str, bases_dir: &Path) -> Result<PathBuf, RegistryError> {
  let dest = bases_dir.join(digest).join(ROOTFS_DIR);
  if dest.is_dir() {
    return Ok(dest);
  }
  let target = dest.clone();
  tokio::task::spawn_blocking(move || unpack_archive(&archive, &target).map_err(RegistryError::io(&target)))
    .await
    .map_err(|e| RegistryError::Join(e.to_string()))??;
  Ok(dest)
}

/// Parse the first token of a `sha256sum`-style digest file.
pub(crate) fn parse_digest(content: &str) -> Option<String> {
  let token = content.split_whitespace().next()?.to_ascii_lowercase();
  (token.len() == 64 && token.chars().all(|c| c.is_ascii_hexdigit())).then_some(token)
}

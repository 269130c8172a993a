use std::path::{Path, PathBuf};

use tracing::debug;

use super::{ARCHIVE_NAME, BaseImageRef, BaseRegistry, DIGEST_SUFFIX, ROOTFS_DIR, RegistryError, parse_digest};
use crate::recipe::BaseSpec;
use crate::util::hash::{hash_directory, hash_file};

/// A directory laid out as `<root>/<id>/<version>/{rootfs/, rootfs.tar.gz}`.
#[derive(Debug, Clone)]
pub struct LocalRegistry {
  root: PathBuf,
}

impl LocalRegistry {
  pub fn new(root: PathBuf) -> Self {
    Self { root }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn entry_dir(&self, base: &BaseSpec) -> PathBuf {
    self.root.join(&base.id).join(&base.version)
  }
}

impl BaseRegistry for LocalRegistry {
  fn location(&self) -> String {
    self.root.display().to_string()
  }

  async fn resolve(&self, base: &BaseSpec, bases_dir: &Path) -> Result<BaseImageRef, RegistryError> {
    let entry = self.entry_dir(base);
    let rootfs = entry.join(ROOTFS_DIR);
    let archive = entry.join(ARCHIVE_NAME);

    if rootfs.is_dir() {
      debug!(path = ?rootfs, "using unpacked base");
      let dir = rootfs.clone();
      let digest = tokio::task::spawn_blocking(move || hash_directory(&dir, &[]))
        .await
        .map_err(|e| RegistryError::Join(e.to_string()))??;
      return Ok(BaseImageRef {
        id: base.id.clone(),
        version: base.version.clone(),
        digest: digest.0,
        rootfs,
        origin: entry.display().to_string(),
      });
    }

    if archive.is_file() {
      let path = archive.clone();
      let digest = tokio::task::spawn_blocking(move || hash_file(&path))
        .await
        .map_err(|e| RegistryError::Join(e.to_string()))??
        .0;

      let digest_file = entry.join(format!("{ARCHIVE_NAME}{DIGEST_SUFFIX}"));
      if digest_file.is_file() {
        let content = tokio::fs::read_to_string(&digest_file)
          .await
          .map_err(RegistryError::io(&digest_file))?;
        let expected =
          parse_digest(&content).ok_or_else(|| RegistryError::InvalidDigest(digest_file.display().to_string()))?;
        if expected != digest {
          return Err(RegistryError::DigestMismatch {
            url: archive.display().to_string(),
            expected,
            actual: digest,
          });
        }
      }

      let rootfs = super::unpack_shared(archive, &digest, bases_dir).await?;
      return Ok(BaseImageRef {
        id: base.id.clone(),
        version: base.version.clone(),
        digest,
        rootfs,
        origin: entry.display().to_string(),
      });
    }

    Err(RegistryError::NotFound {
      base: base.to_string(),
      location: self.location(),
    })
  }
}

use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::{ARCHIVE_NAME, BaseImageRef, BaseRegistry, DIGEST_SUFFIX, ROOTFS_DIR, RegistryError, parse_digest};
use crate::recipe::BaseSpec;

/// A registry served over HTTP(S) at `<url>/<id>/<version>/rootfs.tar.gz`.
#[derive(Debug, Clone)]
pub struct HttpRegistry {
  base_url: String,
  client: reqwest::Client,
}

impl HttpRegistry {
  pub fn new(base_url: &str) -> Self {
    Self {
      base_url: base_url.trim_end_matches('/').to_string(),
      client: reqwest::Client::new(),
    }
  }

  fn archive_url(&self, base: &BaseSpec) -> String {
    format!("{}/{}/{}/{}", self.base_url, base.id, base.version, ARCHIVE_NAME)
  }

  async fn fetch_digest(&self, base: &BaseSpec, archive_url: &str) -> Result<String, RegistryError> {
    let url = format!("{archive_url}{DIGEST_SUFFIX}");
    let response = self.client.get(&url).send().await.map_err(|e| RegistryError::Fetch {
      url: url.clone(),
      message: e.to_string(),
    })?;

    if response.status() == reqwest::StatusCode::NOT_FOUND {
      return Err(RegistryError::NotFound {
        base: base.to_string(),
        location: self.base_url.clone(),
      });
    }
    if !response.status().is_success() {
      return Err(RegistryError::Fetch {
        url,
        message: format!("HTTP {}", response.status()),
      });
    }

    let body = response.text().await.map_err(|e| RegistryError::Fetch {
      url: url.clone(),
      message: e.to_string(),
    })?;
    parse_digest(&body).ok_or(RegistryError::InvalidDigest(url))
  }

  /// Stream the archive to `dest`, returning its SHA-256.
  async fn download(&self, url: &str, dest: &Path) -> Result<String, RegistryError> {
    let mut response = self.client.get(url).send().await.map_err(|e| RegistryError::Fetch {
      url: url.to_string(),
      message: e.to_string(),
    })?;
    if !response.status().is_success() {
      return Err(RegistryError::Fetch {
        url: url.to_string(),
        message: format!("HTTP {}", response.status()),
      });
    }

    let mut file = tokio::fs::File::create(dest).await.map_err(RegistryError::io(dest))?;
    let mut hasher = Sha256::new();
    let mut size = 0usize;
    while let Some(chunk) = response.chunk().await.map_err(|e| RegistryError::Fetch {
      url: url.to_string(),
      message: e.to_string(),
    })? {
      hasher.update(&chunk);
      size += chunk.len();
      file.write_all(&chunk).await.map_err(RegistryError::io(dest))?;
    }
    file.flush().await.map_err(RegistryError::io(dest))?;

    info!(url = %url, size, "download complete");
    Ok(hex::encode(hasher.finalize()))
  }
}

impl BaseRegistry for HttpRegistry {
  fn location(&self) -> String {
    self.base_url.clone()
  }

  async fn resolve(&self, base: &BaseSpec, bases_dir: &Path) -> Result<BaseImageRef, RegistryError> {
    let url = self.archive_url(base);
    let expected = self.fetch_digest(base, &url).await?;

    let cached = bases_dir.join(&expected).join(ROOTFS_DIR);
    if cached.is_dir() {
      debug!(digest = %expected, "base already unpacked");
      return Ok(BaseImageRef {
        id: base.id.clone(),
        version: base.version.clone(),
        digest: expected,
        rootfs: cached,
        origin: url,
      });
    }

    tokio::fs::create_dir_all(bases_dir)
      .await
      .map_err(RegistryError::io(bases_dir))?;
    let download = tempfile::Builder::new()
      .prefix(".download-")
      .suffix(".tar.gz")
      .tempfile_in(bases_dir)
      .map_err(RegistryError::io(bases_dir))?
      .into_temp_path();

    let actual = self.download(&url, &download).await?;
    if actual != expected {
      return Err(RegistryError::DigestMismatch {
        url,
        expected,
        actual,
      });
    }

    let rootfs = super::unpack_shared(download.to_path_buf(), &expected, bases_dir).await?;
    Ok(BaseImageRef {
      id: base.id.clone(),
      version: base.version.clone(),
      digest: expected,
      rootfs,
      origin: url,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::registry::pack_directory;
  use crate::util::hash::{hash_bytes, hash_file};
  use std::fs;
  use tempfile::TempDir;

  fn archive_bytes(temp: &TempDir) -> Vec<u8> {
    let src = temp.path().join("src");
    fs::create_dir_all(src.join("etc")).unwrap();
    fs::write(src.join("etc/os-release"), "ID=debian\n").unwrap();
    let archive = temp.path().join("rootfs.tar.gz");
    pack_directory(&src, &archive).unwrap();
    fs::read(archive).unwrap()
  }

  #[tokio::test]
  async fn downloads_verifies_and_unpacks() {
    let temp = TempDir::new().unwrap();
    let bytes = archive_bytes(&temp);
    let digest = hash_bytes(&bytes).0;

    let mut server = mockito::Server::new_async().await;
    let sha = server
      .mock("GET", "/python/3.10-slim/rootfs.tar.gz.sha256")
      .with_body(format!("{digest}  rootfs.tar.gz\n"))
      .expect(2)
      .create_async()
      .await;
    let archive = server
      .mock("GET", "/python/3.10-slim/rootfs.tar.gz")
      .with_body(bytes)
      .expect(1)
      .create_async()
      .await;

    let registry = HttpRegistry::new(&server.url());
    let bases = temp.path().join("bases");
    let spec = BaseSpec::parse("python:3.10-slim").unwrap();

    let first = registry.resolve(&spec, &bases).await.unwrap();
    assert_eq!(first.digest, digest);
    assert!(first.rootfs.join("etc/os-release").is_file());

    // Second resolution reuses the unpacked copy.
    let second = registry.resolve(&spec, &bases).await.unwrap();
    assert_eq!(second.rootfs, first.rootfs);

    sha.assert_async().await;
    archive.assert_async().await;
  }

  #[tokio::test]
  async fn digest_mismatch_is_rejected() {
    let temp = TempDir::new().unwrap();
    let bytes = archive_bytes(&temp);
    let wrong = hash_file(&temp.path().join("src/etc/os-release")).unwrap().0;

    let mut server = mockito::Server::new_async().await;
    server
      .mock("GET", "/debian/12/rootfs.tar.gz.sha256")
      .with_body(wrong)
      .create_async()
      .await;
    server
      .mock("GET", "/debian/12/rootfs.tar.gz")
      .with_body(bytes)
      .create_async()
      .await;

    let registry = HttpRegistry::new(&server.url());
    let bases = temp.path().join("bases");
    let err = registry
      .resolve(&BaseSpec::parse("debian:12").unwrap(), &bases)
      .await
      .unwrap_err();
    assert!(matches!(err, RegistryError::DigestMismatch { .. }));
    assert_eq!(fs::read_dir(&bases).unwrap().count(), 0);
  }

  #[tokio::test]
  async fn missing_digest_is_not_found() {
    let temp = TempDir::new().unwrap();
    let mut server = mockito::Server::new_async().await;
    server
      .mock("GET", "/python/0.1/rootfs.tar.gz.sha256")
      .with_status(404)
      .create_async()
      .await;

    let registry = HttpRegistry::new(&server.url());
    let err = registry
      .resolve(&BaseSpec::parse("python:0.1").unwrap(), temp.path())
      .await
      .unwrap_err();
    assert!(matches!(err, RegistryError::NotFound { .. }));
  }
}

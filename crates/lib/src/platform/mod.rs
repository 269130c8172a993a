//! Host platform queries.

pub mod paths;

/// Whether the current process runs with root privileges.
///
/// Chroot isolation and bind mounts are only available when elevated.
#[cfg(unix)]
pub fn is_elevated() -> bool {
  rustix::process::geteuid().is_root()
}

#[cfg(not(unix))]
pub fn is_elevated() -> bool {
  false
}

/// The `os-arch` pair of the running host, e.g. `linux-x86_64`.
pub fn host_triple() -> String {
  format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn host_triple_has_two_parts() {
    let triple = host_triple();
    assert_eq!(triple.split('-').count(), 2, "unexpected triple {triple}");
  }
}

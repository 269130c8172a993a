//! Crate-wide constants.

pub const APP_NAME: &str = "layerforge";

/// Length of the truncated hex digest used for layer keys and store paths.
pub const OBJ_HASH_PREFIX_LEN: usize = 20;

/// Marker file written last when a layer is published.
pub const LAYER_MARKER: &str = ".layerforge-layer";

/// Directory inside a layer holding its rootfs snapshot.
pub const LAYER_ROOTFS_DIR: &str = "rootfs";

/// Working directory used when a recipe never declares one.
pub const DEFAULT_WORKDIR: &str = "/";

/// Entrypoint used when a recipe never declares one.
pub const DEFAULT_ENTRYPOINT: &str = "/bin/sh";

/// Search path exported to build commands and started processes.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// 1980-01-01T00:00:00Z, the ZIP epoch.
pub const SOURCE_DATE_EPOCH: &str = "315532800";

/// Default bound on steps that reach the network.
pub const DEFAULT_NETWORK_TIMEOUT_SECS: u64 = 600;

/// Entries skipped when materializing a source tree unless a step overrides them.
pub const DEFAULT_COPY_EXCLUDES: &[&str] = &[".git", "target", "__pycache__"];

//! Running command templates against a working rootfs.
//!
//! Commands run with a cleared environment. Only `PATH`, `HOME`, `LANG`,
//! `SOURCE_DATE_EPOCH` and the variables declared by earlier env-set steps
//! are visible, so a build never depends on the caller's shell.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info};

use super::StepError;
use super::fs::rootfs_path;
use crate::consts::SOURCE_DATE_EPOCH;
use crate::placeholder::{self, TemplateVars};
use crate::platform::is_elevated;

/// How build commands reach the working rootfs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
  /// `chroot <rootfs> /bin/sh -c <cmd>`; requires root.
  Chroot,
  /// `/bin/sh -c <cmd>` on the host with the rootfs as working directory.
  Host,
}

impl Isolation {
  /// Chroot when running as root, host otherwise.
  pub fn detect() -> Self {
    if is_elevated() { Isolation::Chroot } else { Isolation::Host }
  }

  pub fn parse(value: &str) -> Option<Self> {
    match value {
      "chroot" => Some(Isolation::Chroot),
      "host" => Some(Isolation::Host),
      _ => None,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Isolation::Chroot => "chroot",
      Isolation::Host => "host",
    }
  }
}

/// Everything a step needs to run commands in the working rootfs.
#[derive(Debug, Clone)]
pub struct ExecEnv {
  pub rootfs: PathBuf,
  pub isolation: Isolation,
  pub path: String,
  /// Variables declared by env-set steps so far.
  pub vars: BTreeMap<String, String>,
}

impl ExecEnv {
  /// How an image path appears to a command.
  ///
  /// Inside a chroot image paths are used as-is; on the host they are joined
  /// onto the rootfs.
  pub fn command_path(&self, image_path: &str) -> String {
    match self.isolation {
      Isolation::Chroot => image_path.to_string(),
      Isolation::Host => rootfs_path(&self.rootfs, image_path).display().to_string(),
    }
  }

  /// Template variables with `rootfs` bound for this isolation mode.
  pub fn template_vars(&self) -> TemplateVars {
    TemplateVars::new(&self.command_path("/"))
  }

  /// Substitute `template` and run it, returning trimmed stdout.
  pub async fn run_template(&self, template: &str, vars: &TemplateVars) -> Result<String, StepError> {
    let cmd = placeholder::substitute(template, vars)?;
    self.run(&cmd).await
  }

  /// Run a shell command, returning trimmed stdout.
  pub async fn run(&self, cmd: &str) -> Result<String, StepError> {
    info!(cmd = %cmd, isolation = self.isolation.as_str(), "executing command");

    let mut command = match self.isolation {
      Isolation::Chroot => {
        let mut c = Command::new("chroot");
        c.arg(&self.rootfs).arg("/bin/sh").arg("-c").arg(cmd);
        c
      }
      Isolation::Host => {
        let mut c = Command::new("/bin/sh");
        c.arg("-c").arg(cmd).current_dir(&self.rootfs);
        c
      }
    };

    command
      .env_clear()
      .env("PATH", &self.path)
      .env("HOME", "/root")
      .env("LANG", "C")
      .env("LC_ALL", "C")
      .env("SOURCE_DATE_EPOCH", SOURCE_DATE_EPOCH)
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true);
    for (key, value) in &self.vars {
      command.env(key, value);
    }
    if self.isolation == Isolation::Host {
      command.env("ROOTFS", &self.rootfs);
    }

    let output = command.output().await.map_err(|source| StepError::Spawn {
      cmd: cmd.to_string(),
      source,
    })?;

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

    if !output.status.success() {
      if !stdout.is_empty() {
        debug!(stdout = %stdout, "command stdout");
      }
      return Err(StepError::Command {
        cmd: cmd.to_string(),
        exit_code: output.status.code(),
        stderr,
      });
    }

    if !stdout.is_empty() {
      debug!(stdout = %stdout, "command output");
    }
    Ok(stdout)
  }
}

/// Short human reason from a failed command, for dependency errors.
pub(crate) fn failure_reason(err: &StepError) -> String {
  match err {
    StepError::Command { exit_code, stderr, .. } => {
      let last = stderr.lines().rev().find(|l| !l.trim().is_empty()).map(str::trim);
      match (last, exit_code) {
        (Some(line), _) => line.to_string(),
        (None, Some(code)) => format!("command exited with code {code}"),
        (None, None) => "command terminated by signal".to_string(),
      }
    }
    other => other.to_string(),
  }
}

/// The candidate named closest to the end of a failed command's stderr.
///
/// Names compare case-insensitively with `_` and `-` treated alike, and only
/// whole words match, so `git` is not found in `digit`.
pub(crate) fn named_in_failure<'a>(err: &StepError, candidates: &[&'a str]) -> Option<&'a str> {
  let StepError::Command { stderr, .. } = err else {
    return None;
  };
  stderr.lines().rev().find_map(|line| {
    let words: Vec<String> = line
      .split(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+')))
      .map(|w| normalize_name(w.trim_matches('.')))
      .filter(|w| !w.is_empty())
      .collect();
    candidates
      .iter()
      .copied()
      .find(|name| words.contains(&normalize_name(name)))
  })
}

fn normalize_name(name: &str) -> String {
  name.to_ascii_lowercase().replace('_', "-")
}

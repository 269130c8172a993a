//! Process environment carried by an image.
//!
//! Variables declared with env-set steps are exported to every later build
//! command and, unchanged, to the process started from the image. The
//! environment is built once from the image config and never mutated after.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Suppresses installer prompts during system package installation.
pub const NON_INTERACTIVE_INSTALL: (&str, &str) = ("DEBIAN_FRONTEND", "noninteractive");

/// Flushes standard streams immediately so logs arrive in order.
pub const UNBUFFERED_OUTPUT: (&str, &str) = ("PYTHONUNBUFFERED", "1");

/// Stops compiled bytecode from being written into the image.
pub const NO_BYTECODE_CACHE: (&str, &str) = ("PYTHONDONTWRITEBYTECODE", "1");

/// The recognized variables with a one-line description of their effect.
pub const RECOGNIZED: &[(&str, &str)] = &[
  (NON_INTERACTIVE_INSTALL.0, "suppress installer prompts"),
  (UNBUFFERED_OUTPUT.0, "unbuffered standard streams"),
  (NO_BYTECODE_CACHE.0, "no bytecode cache files"),
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeEnvironment(BTreeMap<String, String>);

impl RuntimeEnvironment {
  pub fn new(vars: BTreeMap<String, String>) -> Self {
    Self(vars)
  }

  /// The three variables a development image normally sets.
  pub fn development_defaults() -> Self {
    Self(
      [NON_INTERACTIVE_INSTALL, UNBUFFERED_OUTPUT, NO_BYTECODE_CACHE]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect(),
    )
  }

  pub fn get(&self, name: &str) -> Option<&str> {
    self.0.get(name).map(String::as_str)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn as_map(&self) -> &BTreeMap<String, String> {
    &self.0
  }

  pub fn non_interactive_installs(&self) -> bool {
    self.get(NON_INTERACTIVE_INSTALL.0) == Some(NON_INTERACTIVE_INSTALL.1)
  }

  pub fn unbuffered_output(&self) -> bool {
    self.get(UNBUFFERED_OUTPUT.0).is_some_and(is_truthy)
  }

  pub fn bytecode_cache_disabled(&self) -> bool {
    self.get(NO_BYTECODE_CACHE.0).is_some_and(is_truthy)
  }
}

impl From<BTreeMap<String, String>> for RuntimeEnvironment {
  fn from(vars: BTreeMap<String, String>) -> Self {
    Self(vars)
  }
}

fn is_truthy(value: &str) -> bool {
  !value.is_empty() && value != "0"
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn development_defaults_enable_all_modes() {
    let env = RuntimeEnvironment::development_defaults();
    assert_eq!(env.len(), 3);
    assert!(env.non_interactive_installs());
    assert!(env.unbuffered_output());
    assert!(env.bytecode_cache_disabled());
  }

  #[test]
  fn zero_disables_flag() {
    let env = RuntimeEnvironment::new(BTreeMap::from([("PYTHONUNBUFFERED".to_string(), "0".to_string())]));
    assert!(!env.unbuffered_output());
    assert!(!env.non_interactive_installs());
  }

  #[test]
  fn iteration_is_sorted() {
    let env = RuntimeEnvironment::development_defaults();
    let names: Vec<_> = env.iter().map(|(k, _)| k).collect();
    assert_eq!(names, vec!["DEBIAN_FRONTEND", "PYTHONDONTWRITEBYTECODE", "PYTHONUNBUFFERED"]);
  }
}

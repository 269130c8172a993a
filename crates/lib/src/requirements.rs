//! Flat dependency manifests (`name` or `name==version` per line).

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
  /// The name as written.
  pub name: String,
  pub version: Option<String>,
}

impl Requirement {
  /// Lowercase name with `_` and `.` folded to `-`.
  pub fn normalized_name(&self) -> String {
    normalize_name(&self.name)
  }
}

impl fmt::Display for Requirement {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.version {
      Some(v) => write!(f, "{}=={}", self.name, v),
      None => write!(f, "{}", self.name),
    }
  }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{dependency}: {reason}")]
pub struct RequirementError {
  pub dependency: String,
  pub line: usize,
  pub reason: String,
}

pub fn normalize_name(name: &str) -> String {
  name
    .chars()
    .map(|c| match c {
      '_' | '.' => '-',
      other => other.to_ascii_lowercase(),
    })
    .collect()
}

/// Parse a manifest, rejecting anything but exact pins.
///
/// Repeating a dependency with the same pin is allowed; repeating it with a
/// different pin is a conflict.
pub fn parse_requirements(content: &str) -> Result<Vec<Requirement>, RequirementError> {
  let mut seen: BTreeMap<String, (usize, Option<String>)> = BTreeMap::new();
  let mut out = Vec::new();

  for (idx, raw) in content.lines().enumerate() {
    let line_no = idx + 1;
    let line = match raw.find('#') {
      Some(pos) => &raw[..pos],
      None => raw,
    }
    .trim();
    if line.is_empty() {
      continue;
    }

    let requirement = parse_line(line).map_err(|reason| RequirementError {
      dependency: line.to_string(),
      line: line_no,
      reason,
    })?;

    let key = requirement.normalized_name();
    match seen.get(&key) {
      Some((first_line, version)) if *version != requirement.version => {
        return Err(RequirementError {
          dependency: requirement.name.clone(),
          line: line_no,
          reason: format!(
            "conflicting versions: {} (line {}) and {} (line {})",
            version.as_deref().unwrap_or("any"),
            first_line,
            requirement.version.as_deref().unwrap_or("any"),
            line_no
          ),
        });
      }
      Some(_) => continue,
      None => {
        seen.insert(key, (line_no, requirement.version.clone()));
        out.push(requirement);
      }
    }
  }

  Ok(out)
}

fn parse_line(line: &str) -> Result<Requirement, String> {
  let (name, version) = match line.split_once("==") {
    Some((name, version)) => (name.trim(), Some(version.trim())),
    None => (line, None),
  };

  let is_name_char = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.');
  if name.is_empty() || !name.chars().all(is_name_char) {
    if name.contains(['<', '>', '~', '!', '=', ';', '@']) {
      return Err("only exact `==` pins are supported".to_string());
    }
    return Err(format!("invalid dependency name '{name}'"));
  }

  let version = match version {
    Some(v) if v.is_empty() => return Err("empty version after `==`".to_string()),
    Some(v) if !v.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '+' | '!')) => {
      return Err("only exact `==` pins are supported".to_string());
    }
    Some(v) => Some(v.to_string()),
    None => None,
  };

  Ok(Requirement {
    name: name.to_string(),
    version,
  })
}

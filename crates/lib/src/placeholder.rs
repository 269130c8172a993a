//! Placeholder parsing and substitution for tool command templates.
//!
//! Package and manifest tools are configured as shell command templates whose
//! step-specific values are only known at execution time.
//!
//! # Placeholder Formats
//!
//! - `$${package}` - the single package being resolved
//! - `$${packages}` - all packages of the step, space separated
//! - `$${requirement}` - one manifest entry as written (`name==version`)
//! - `$${manifest}` - the manifest path inside the image
//! - `$${rootfs}` - the rootfs directory as seen by the command
//!
//! # Shell Variables
//!
//! Single `$` characters pass through unchanged, so `$HOME` and `$ROOTFS`
//! reach the shell as written.
//!
//! # Escaping
//!
//! Use `$$$` before `{` to produce a literal `$${` sequence.
//!
//! # Example
//!
//! ```
//! use layerforge_lib::placeholder::{parse, Segment, Placeholder};
//!
//! let segments = parse("apt-get install -y $${packages}").unwrap();
//! assert_eq!(segments, vec![
//!     Segment::Literal("apt-get install -y ".to_string()),
//!     Segment::Placeholder(Placeholder::Packages),
//! ]);
//! ```

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
  Package,
  Packages,
  Requirement,
  Manifest,
  Rootfs,
}

impl Placeholder {
  fn name(self) -> &'static str {
    match self {
      Placeholder::Package => "package",
      Placeholder::Packages => "packages",
      Placeholder::Requirement => "requirement",
      Placeholder::Manifest => "manifest",
      Placeholder::Rootfs => "rootfs",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
  Literal(String),
  Placeholder(Placeholder),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaceholderError {
  #[error("unclosed placeholder at position {0}")]
  Unclosed(usize),

  #[error("unknown placeholder: {0}")]
  Unknown(String),

  #[error("placeholder '{0}' has no value in this context")]
  Unbound(&'static str),
}

/// Supplies values for placeholders during substitution.
pub trait Resolver {
  fn resolve(&self, placeholder: Placeholder) -> Option<&str>;
}

/// Values bound for one template invocation.
#[derive(Debug, Clone, Default)]
pub struct TemplateVars {
  pub package: Option<String>,
  pub packages: Option<String>,
  pub requirement: Option<String>,
  pub manifest: Option<String>,
  pub rootfs: Option<String>,
}

impl TemplateVars {
  pub fn new(rootfs: &str) -> Self {
    Self {
      rootfs: Some(rootfs.to_string()),
      ..Default::default()
    }
  }

  pub fn with_package(mut self, package: &str) -> Self {
    self.package = Some(package.to_string());
    self
  }

  pub fn with_packages(mut self, packages: &[String]) -> Self {
    self.packages = Some(packages.join(" "));
    self
  }

  pub fn with_requirement(mut self, requirement: &str) -> Self {
    self.requirement = Some(requirement.to_string());
    self
  }

  pub fn with_manifest(mut self, manifest: &str) -> Self {
    self.manifest = Some(manifest.to_string());
    self
  }
}

impl Resolver for TemplateVars {
  fn resolve(&self, placeholder: Placeholder) -> Option<&str> {
    match placeholder {
      Placeholder::Package => self.package.as_deref(),
      Placeholder::Packages => self.packages.as_deref(),
      Placeholder::Requirement => self.requirement.as_deref(),
      Placeholder::Manifest => self.manifest.as_deref(),
      Placeholder::Rootfs => self.rootfs.as_deref(),
    }
  }
}

/// Parse a template into literal and placeholder segments.
pub fn parse(input: &str) -> Result<Vec<Segment>, PlaceholderError> {
  let mut segments = Vec::new();
  let mut literal = String::new();
  let mut chars = input.char_indices().peekable();

  while let Some((pos, ch)) = chars.next() {
    if ch != '$' {
      literal.push(ch);
      continue;
    }

    match chars.peek() {
      Some((_, '$')) => {
        chars.next();

        match chars.peek() {
          Some((_, '$')) => {
            chars.next();
            match chars.peek() {
              Some((_, '{')) => {
                literal.push_str("$${");
                chars.next();
              }
              _ => literal.push_str("$$$"),
            }
          }
          Some((_, '{')) => {
            chars.next();

            if !literal.is_empty() {
              segments.push(Segment::Literal(std::mem::take(&mut literal)));
            }

            let mut content = String::new();
            let mut found_close = false;
            for (_, c) in chars.by_ref() {
              if c == '}' {
                found_close = true;
                break;
              }
              content.push(c);
            }

            if !found_close {
              return Err(PlaceholderError::Unclosed(pos));
            }

            segments.push(Segment::Placeholder(parse_placeholder_content(&content)?));
          }
          _ => literal.push_str("$$"),
        }
      }
      _ => literal.push('$'),
    }
  }

  if !literal.is_empty() {
    segments.push(Segment::Literal(literal));
  }

  Ok(segments)
}

fn parse_placeholder_content(content: &str) -> Result<Placeholder, PlaceholderError> {
  match content.trim() {
    "package" => Ok(Placeholder::Package),
    "packages" => Ok(Placeholder::Packages),
    "requirement" => Ok(Placeholder::Requirement),
    "manifest" => Ok(Placeholder::Manifest),
    "rootfs" => Ok(Placeholder::Rootfs),
    other => Err(PlaceholderError::Unknown(other.to_string())),
  }
}

/// Parse and substitute in one step.
pub fn substitute(input: &str, resolver: &impl Resolver) -> Result<String, PlaceholderError> {
  let segments = parse(input)?;
  substitute_segments(&segments, resolver)
}

pub fn substitute_segments(segments: &[Segment], resolver: &impl Resolver) -> Result<String, PlaceholderError> {
  let mut result = String::new();

  for segment in segments {
    match segment {
      Segment::Literal(s) => result.push_str(s),
      Segment::Placeholder(p) => {
        let value = resolver.resolve(*p).ok_or(PlaceholderError::Unbound(p.name()))?;
        result.push_str(value);
      }
    }
  }

  Ok(result)
}

/// Check a template for syntax errors without binding any values.
pub fn validate(input: &str) -> Result<(), PlaceholderError> {
  parse(input).map(|_| ())
}

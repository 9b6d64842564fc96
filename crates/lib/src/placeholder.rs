//! Placeholder parsing and substitution for build step arguments and
//! environment values.
//!
//! Formulas cannot know where they, their dependencies, or their unpacked
//! sources will live until a run is planned. Values refer to those locations
//! through placeholders that are substituted right before use.
//!
//! # Placeholder Formats
//!
//! - `$${prefix}` - install path of the formula the value belongs to
//! - `$${src}` - unpacked source directory
//! - `$${work}` - scratch working directory of the build
//! - `$${jobs}` - make job count for the build
//! - `$${dep:NAME}` - install path of dependency NAME
//! - `$${opt:NAME}` - `1` when option NAME is enabled, `0` otherwise
//! - `$${env:VAR}` - current value of VAR in the build environment
//! - `$${resource:NAME}` - path of the fetched resource NAME
//!
//! # Shell Variables
//!
//! Single `$` characters pass through unchanged, so shell variables like
//! `$HOME` and `$PATH` work naturally without any escaping.
//!
//! # Escaping
//!
//! Use `$$$` before `{` to produce a literal `$${` sequence.
//!
//! # Example
//!
//! ```
//! use keg_lib::placeholder::{parse, Segment, Placeholder};
//!
//! let segments = parse("$${dep:zlib}/lib:$HOME").unwrap();
//! assert_eq!(segments, vec![
//!     Segment::Placeholder(Placeholder::Dependency("zlib".to_string())),
//!     Segment::Literal("/lib:$HOME".to_string()),
//! ]);
//! ```

use std::collections::BTreeMap;

use thiserror::Error;

/// A parsed placeholder reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
  Prefix,
  Src,
  Work,
  Jobs,
  Dependency(String),
  Option(String),
  Env(String),
  Resource(String),
}

/// A segment of parsed text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
  Literal(String),
  Placeholder(Placeholder),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaceholderError {
  #[error("unclosed placeholder at position {0}")]
  Unclosed(usize),

  #[error("unknown placeholder type: {0}")]
  UnknownType(String),

  #[error("malformed placeholder: {0}")]
  Malformed(String),

  #[error("$${{{0}}} is not available in this context")]
  Unavailable(&'static str),

  #[error("unknown dependency in placeholder: {0}")]
  UnknownDependency(String),

  #[error("unknown option in placeholder: {0}")]
  UnknownOption(String),

  #[error("environment variable {0} is not set")]
  MissingEnv(String),

  #[error("unknown resource in placeholder: {0}")]
  UnknownResource(String),
}

/// Resolves placeholder values for one substitution context.
pub trait Resolver {
  fn resolve_prefix(&self) -> Result<&str, PlaceholderError>;

  fn resolve_src(&self) -> Result<&str, PlaceholderError>;

  fn resolve_work(&self) -> Result<&str, PlaceholderError>;

  fn resolve_jobs(&self) -> Result<&str, PlaceholderError>;

  fn resolve_dependency(&self, name: &str) -> Result<&str, PlaceholderError>;

  /// Returns `"1"` or `"0"`.
  fn resolve_option(&self, name: &str) -> Result<&str, PlaceholderError>;

  fn resolve_env(&self, var: &str) -> Result<&str, PlaceholderError>;

  fn resolve_resource(&self, name: &str) -> Result<&str, PlaceholderError>;
}

/// Parse a string containing placeholders into segments.
///
/// # Errors
///
/// Returns an error if a placeholder is unclosed, empty, or of an unknown type.
pub fn parse(input: &str) -> Result<Vec<Segment>, PlaceholderError> {
  let mut segments = Vec::new();
  let mut literal = String::new();
  let mut chars = input.char_indices().peekable();

  while let Some((pos, ch)) = chars.next() {
    if ch != '$' {
      literal.push(ch);
      continue;
    }

    if !matches!(chars.peek(), Some((_, '$'))) {
      // Lone $, shell variables pass through
      literal.push('$');
      continue;
    }
    chars.next();

    match chars.peek() {
      Some((_, '$')) => {
        chars.next();
        if matches!(chars.peek(), Some((_, '{'))) {
          chars.next();
          literal.push_str("$${");
        } else {
          literal.push_str("$$$");
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

  if !literal.is_empty() {
    segments.push(Segment::Literal(literal));
  }

  Ok(segments)
}

fn parse_placeholder_content(content: &str) -> Result<Placeholder, PlaceholderError> {
  match content {
    "prefix" => return Ok(Placeholder::Prefix),
    "src" => return Ok(Placeholder::Src),
    "work" => return Ok(Placeholder::Work),
    "jobs" => return Ok(Placeholder::Jobs),
    _ => {}
  }

  let (kind, rest) = content
    .split_once(':')
    .ok_or_else(|| PlaceholderError::UnknownType(content.to_string()))?;
  if rest.is_empty() {
    return Err(PlaceholderError::Malformed(format!("missing name in '{content}'")));
  }

  let name = rest.to_string();
  match kind {
    "dep" => Ok(Placeholder::Dependency(name)),
    "opt" => Ok(Placeholder::Option(name)),
    "env" => Ok(Placeholder::Env(name)),
    "resource" => Ok(Placeholder::Resource(name)),
    _ => Err(PlaceholderError::UnknownType(kind.to_string())),
  }
}

/// Parse and substitute in one step.
pub fn substitute(input: &str, resolver: &impl Resolver) -> Result<String, PlaceholderError> {
  let segments = parse(input)?;
  substitute_segments(&segments, resolver)
}

/// Substitute placeholders in pre-parsed segments.
pub fn substitute_segments(segments: &[Segment], resolver: &impl Resolver) -> Result<String, PlaceholderError> {
  let mut result = String::new();

  for segment in segments {
    match segment {
      Segment::Literal(s) => result.push_str(s),
      Segment::Placeholder(p) => {
        let value = match p {
          Placeholder::Prefix => resolver.resolve_prefix()?,
          Placeholder::Src => resolver.resolve_src()?,
          Placeholder::Work => resolver.resolve_work()?,
          Placeholder::Jobs => resolver.resolve_jobs()?,
          Placeholder::Dependency(name) => resolver.resolve_dependency(name)?,
          Placeholder::Option(name) => resolver.resolve_option(name)?,
          Placeholder::Env(var) => resolver.resolve_env(var)?,
          Placeholder::Resource(name) => resolver.resolve_resource(name)?,
        };
        result.push_str(value);
      }
    }
  }

  Ok(result)
}

/// The standard resolver: a set of borrowed lookups, any of which may be
/// absent in a given context (environment exports have no `$${src}`, for
/// instance).
#[derive(Debug, Clone, Copy, Default)]
pub struct Scope<'a> {
  pub prefix: Option<&'a str>,
  pub src: Option<&'a str>,
  pub work: Option<&'a str>,
  pub jobs: Option<&'a str>,
  /// Dependency name to install path.
  pub dependencies: Option<&'a BTreeMap<String, String>>,
  pub options: Option<&'a BTreeMap<String, bool>>,
  pub env: Option<&'a BTreeMap<String, String>>,
  /// Resource name to fetched path.
  pub resources: Option<&'a BTreeMap<String, String>>,
}

impl Resolver for Scope<'_> {
  fn resolve_prefix(&self) -> Result<&str, PlaceholderError> {
    self.prefix.ok_or(PlaceholderError::Unavailable("prefix"))
  }

  fn resolve_src(&self) -> Result<&str, PlaceholderError> {
    self.src.ok_or(PlaceholderError::Unavailable("src"))
  }

  fn resolve_work(&self) -> Result<&str, PlaceholderError> {
    self.work.ok_or(PlaceholderError::Unavailable("work"))
  }

  fn resolve_jobs(&self) -> Result<&str, PlaceholderError> {
    self.jobs.ok_or(PlaceholderError::Unavailable("jobs"))
  }

  fn resolve_dependency(&self, name: &str) -> Result<&str, PlaceholderError> {
    self
      .dependencies
      .and_then(|deps| deps.get(name))
      .map(String::as_str)
      .ok_or_else(|| PlaceholderError::UnknownDependency(name.to_string()))
  }

  fn resolve_option(&self, name: &str) -> Result<&str, PlaceholderError> {
    match self.options.and_then(|opts| opts.get(name)) {
      Some(true) => Ok("1"),
      Some(false) => Ok("0"),
      None => Err(PlaceholderError::UnknownOption(name.to_string())),
    }
  }

  fn resolve_env(&self, var: &str) -> Result<&str, PlaceholderError> {
    self
      .env
      .and_then(|env| env.get(var))
      .map(String::as_str)
      .ok_or_else(|| PlaceholderError::MissingEnv(var.to_string()))
  }

  fn resolve_resource(&self, name: &str) -> Result<&str, PlaceholderError> {
    self
      .resources
      .and_then(|res| res.get(name))
      .map(String::as_str)
      .ok_or_else(|| PlaceholderError::UnknownResource(name.to_string()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn deps() -> BTreeMap<String, String> {
    BTreeMap::from([
      ("openssl".to_string(), "/store/obj/openssl-1.0.2h-a1b2c3".to_string()),
      ("zlib".to_string(), "/store/obj/zlib-1.2.8-d4e5f6".to_string()),
    ])
  }

  // ==========================================================================
  // Realistic Scenario Tests
  // ==========================================================================

  #[test]
  fn configure_with_dependency_prefixes() {
    let deps = deps();
    let scope = Scope {
      prefix: Some("/store/obj/thrift-0.9.3-abc"),
      dependencies: Some(&deps),
      ..Default::default()
    };

    let arg = "--with-openssl=$${dep:openssl} --prefix=$${prefix}";
    assert_eq!(
      substitute(arg, &scope).unwrap(),
      "--with-openssl=/store/obj/openssl-1.0.2h-a1b2c3 --prefix=/store/obj/thrift-0.9.3-abc"
    );
  }

  #[test]
  fn make_jobs_and_option_flag() {
    let options = BTreeMap::from([("lite".to_string(), true), ("shared".to_string(), false)]);
    let scope = Scope {
      jobs: Some("8"),
      options: Some(&options),
      ..Default::default()
    };

    let cmd = "make -j$${jobs} LITE=$${opt:lite} SHARED=$${opt:shared}";
    assert_eq!(substitute(cmd, &scope).unwrap(), "make -j8 LITE=1 SHARED=0");
  }

  #[test]
  fn cflags_reference_current_environment() {
    let env = BTreeMap::from([("CFLAGS".to_string(), "-O2".to_string())]);
    let scope = Scope {
      env: Some(&env),
      ..Default::default()
    };

    assert_eq!(substitute("$${env:CFLAGS} -fPIC", &scope).unwrap(), "-O2 -fPIC");
  }

  #[test]
  fn resource_and_work_paths() {
    let resources = BTreeMap::from([("cacert".to_string(), "/tmp/w/resources/cacert".to_string())]);
    let scope = Scope {
      work: Some("/tmp/w"),
      src: Some("/tmp/w/src"),
      resources: Some(&resources),
      ..Default::default()
    };

    let cmd = "cp $${resource:cacert} $${src}/certs && ls $${work}";
    assert_eq!(
      substitute(cmd, &scope).unwrap(),
      "cp /tmp/w/resources/cacert /tmp/w/src/certs && ls /tmp/w"
    );
  }

  // ==========================================================================
  // Error Tests
  // ==========================================================================

  #[test]
  fn error_unclosed_placeholder() {
    assert_eq!(parse("abc $${prefix"), Err(PlaceholderError::Unclosed(4)));
  }

  #[test]
  fn error_unknown_placeholder_type() {
    assert_eq!(
      parse("$${build:abc:out}"),
      Err(PlaceholderError::UnknownType("build".to_string()))
    );
    assert_eq!(parse("$${out}"), Err(PlaceholderError::UnknownType("out".to_string())));
  }

  #[test]
  fn error_missing_name() {
    assert!(matches!(parse("$${dep:}"), Err(PlaceholderError::Malformed(_))));
  }

  #[test]
  fn error_missing_env_variable() {
    let env = BTreeMap::new();
    let scope = Scope {
      env: Some(&env),
      ..Default::default()
    };
    assert_eq!(
      substitute("$${env:LDFLAGS}", &scope),
      Err(PlaceholderError::MissingEnv("LDFLAGS".to_string()))
    );
  }

  #[test]
  fn error_unavailable_in_scope() {
    let scope = Scope::default();
    assert_eq!(substitute("$${src}/include", &scope), Err(PlaceholderError::Unavailable("src")));
  }

  #[test]
  fn error_unknown_dependency() {
    let deps = deps();
    let scope = Scope {
      dependencies: Some(&deps),
      ..Default::default()
    };
    assert_eq!(
      substitute("$${dep:boost}", &scope),
      Err(PlaceholderError::UnknownDependency("boost".to_string()))
    );
  }

  #[test]
  fn unavailable_message_shows_placeholder() {
    assert_eq!(PlaceholderError::Unavailable("src").to_string(), "$${src} is not available in this context");
  }

  // ==========================================================================
  // Edge Cases
  // ==========================================================================

  #[test]
  fn shell_variables_pass_through() {
    let segments = parse("echo $HOME $$ $PATH").unwrap();
    assert_eq!(segments, vec![Segment::Literal("echo $HOME $$ $PATH".to_string())]);
  }

  #[test]
  fn escape_placeholder_syntax() {
    let segments = parse("literal $$${prefix}").unwrap();
    assert_eq!(segments, vec![Segment::Literal("literal $${prefix}".to_string())]);
  }

  #[test]
  fn triple_dollar_without_brace_preserved() {
    assert_eq!(parse("a$$$b").unwrap(), vec![Segment::Literal("a$$$b".to_string())]);
  }

  #[test]
  fn empty_input() {
    assert_eq!(parse("").unwrap(), vec![]);
  }

  #[test]
  fn adjacent_placeholders_no_separator() {
    let segments = parse("$${prefix}$${jobs}").unwrap();
    assert_eq!(
      segments,
      vec![
        Segment::Placeholder(Placeholder::Prefix),
        Segment::Placeholder(Placeholder::Jobs),
      ]
    );
  }

  #[test]
  fn names_may_contain_colons() {
    assert_eq!(
      parse("$${opt:with:colon}").unwrap(),
      vec![Segment::Placeholder(Placeholder::Option("with:colon".to_string()))]
    );
  }
}

//! Noise suppression
//!
//! An [`ExclusionFilter`] drops raw records whose subjects (app names,
//! senders, file paths) match configured exclusions. Names match exactly;
//! path patterns containing glob metacharacters are compiled with `glob`,
//! anything else matches as a substring.

use crate::config::{CollectorOverrides, FilterConfig};
use crate::error::{Error, Result};
use glob::Pattern;

#[derive(Debug, Clone)]
enum PathRule {
    Fragment(String),
    Glob(Pattern),
}

impl PathRule {
    fn parse(raw: &str) -> Result<Self> {
        if raw.contains(['*', '?', '[']) {
            Pattern::new(raw)
                .map(PathRule::Glob)
                .map_err(|e| Error::Config(format!("invalid exclude pattern '{}': {}", raw, e)))
        } else {
            Ok(PathRule::Fragment(raw.to_string()))
        }
    }

    fn matches(&self, subject: &str) -> bool {
        match self {
            PathRule::Fragment(fragment) => subject.contains(fragment.as_str()),
            PathRule::Glob(pattern) => pattern.matches(subject),
        }
    }
}

/// Per-collector exclusion predicate.
#[derive(Debug, Clone, Default)]
pub struct ExclusionFilter {
    names: Vec<String>,
    paths: Vec<PathRule>,
}

impl ExclusionFilter {
    pub fn new<N, P>(names: N, paths: P) -> Result<Self>
    where
        N: IntoIterator,
        N::Item: Into<String>,
        P: IntoIterator,
        P::Item: AsRef<str>,
    {
        let names = names.into_iter().map(Into::into).collect();
        let paths = paths
            .into_iter()
            .map(|p| PathRule::parse(p.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { names, paths })
    }

    /// Global exclusions plus a collector's own, plus any built-in defaults.
    pub fn from_config(
        global: &FilterConfig,
        overrides: &CollectorOverrides,
        builtin_names: &[&str],
        builtin_paths: &[&str],
    ) -> Result<Self> {
        let names = global
            .exclude_names
            .iter()
            .chain(&overrides.exclude_names)
            .map(String::as_str)
            .chain(builtin_names.iter().copied());
        let paths = global
            .exclude_paths
            .iter()
            .chain(&overrides.exclude_paths)
            .map(String::as_str)
            .chain(builtin_paths.iter().copied());
        Self::new(names, paths)
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty() && self.paths.is_empty()
    }

    /// True if any subject is an excluded name or matches an excluded path.
    pub fn is_excluded<S: AsRef<str>>(&self, subjects: &[S]) -> bool {
        subjects.iter().any(|subject| {
            let subject = subject.as_ref();
            self.names.iter().any(|name| name == subject)
                || self.paths.iter().any(|rule| rule.matches(subject))
        })
    }
}

//! Package filters and class-name matching.

use serde::{Deserialize, Serialize};

use std::collections::BTreeSet;

use crate::{ProfilerError, ProfilerResult};

/// Package name used for classes declared without a package.
pub const DEFAULT_PACKAGE: &str = "(default package)";

/// Trailing marker meaning "this package and all sub-packages".
pub const WILDCARD: char = '*';

/// Prefix of JVM array class names (`[Lcom.acme.Foo;`, `[I`).
pub const ARRAY_TYPE_MARKER: char = '[';

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageFilterSet {
    #[serde(default)]
    pub profiled: BTreeSet<String>,
    #[serde(default)]
    pub ignored: BTreeSet<String>,
    #[serde(default)]
    pub profiled_classloaders: BTreeSet<String>,
}

impl PackageFilterSet {
    pub fn profiling(packages: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            profiled: packages.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// A class is profiled when it matches `profiled` and not `ignored`.
    pub fn includes(&self, class_name: &str) -> bool {
        matches(class_name, &self.profiled) && !matches(class_name, &self.ignored)
    }
}

/// Returns the package part of a fully-qualified class name.
pub fn package_of(class_name: &str) -> &str {
    match class_name.rfind('.') {
        Some(idx) => &class_name[..idx],
        None => DEFAULT_PACKAGE,
    }
}

/// Decides whether `class_name` belongs to one of `patterns`.
///
/// An empty pattern set matches nothing. A pattern ending in `.*` matches the
/// stem package and every package below it; any other pattern must equal the
/// package exactly.
pub fn matches<'a, I>(class_name: &str, patterns: I) -> bool
where
    I: IntoIterator<Item = &'a String>,
{
    let package = package_of(class_name);
    patterns
        .into_iter()
        .any(|pattern| pattern_matches(package, pattern))
}

fn pattern_matches(package: &str, pattern: &str) -> bool {
    let Some(stem) = pattern.strip_suffix(WILDCARD) else {
        return package == pattern;
    };
    let stem = stem.strip_suffix('.').unwrap_or(stem);
    if stem.is_empty() {
        return true;
    }
    package == stem
        || package
            .strip_prefix(stem)
            .is_some_and(|rest| rest.starts_with('.'))
}

/// Parses a comma-separated package list as sent through `setFilter`.
pub fn parse_package_list(value: &str) -> ProfilerResult<BTreeSet<String>> {
    let mut out = BTreeSet::new();
    for raw in value.split(',') {
        let item = raw.trim();
        if item.is_empty() {
            continue;
        }
        validate_pattern(item)?;
        out.insert(item.to_string());
    }
    Ok(out)
}

pub fn join_package_list<'a>(packages: impl IntoIterator<Item = &'a String>) -> String {
    packages
        .into_iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

fn validate_pattern(pattern: &str) -> ProfilerResult<()> {
    if pattern.chars().any(char::is_whitespace) {
        return Err(ProfilerError::InvalidFilterSyntax(format!(
            "{pattern:?} contains whitespace"
        )));
    }
    let body = match pattern.strip_suffix(WILDCARD) {
        Some("") => return Ok(()),
        Some(stem) => stem.strip_suffix('.').ok_or_else(|| {
            ProfilerError::InvalidFilterSyntax(format!(
                "{pattern:?}: wildcard must follow a package separator"
            ))
        })?,
        None => pattern,
    };
    if body.contains(WILDCARD) {
        return Err(ProfilerError::InvalidFilterSyntax(format!(
            "{pattern:?}: wildcard is only allowed as a trailing \".*\""
        )));
    }
    if body.split('.').any(str::is_empty) {
        return Err(ProfilerError::InvalidFilterSyntax(format!(
            "{pattern:?} has an empty package segment"
        )));
    }
    Ok(())
}

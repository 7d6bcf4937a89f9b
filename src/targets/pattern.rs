//! Target Matcher - Resolve mutation patterns to registered render handles.
//!
//! A pattern is a sequence of path segments. A trailing wildcard marker
//! turns the last segment into a string prefix:
//!
//! ```text
//! "chart.tooltip"  exact         matches chart.tooltip only
//! "scatter*"       prefix        matches scatter1, scatterBar, scattering
//! "chart.bar*"     prefix        matches chart.bar0, chart.barLabel
//! ```
//!
//! Matching is case-sensitive and segment-aligned: a pattern only matches
//! paths with the same number of segments. Exclude patterns always win.

use std::collections::BTreeMap;

use log::{debug, warn};

use super::registry::{self, RenderHandle};
use crate::config::{segment_separator, wildcard_marker};
use crate::error::{ReactionError, Result};
use crate::types::Mutation;

// =============================================================================
// Pattern
// =============================================================================

/// A parsed target/exclude pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPattern {
    segments: Vec<String>,
    prefix: bool,
}

impl TargetPattern {
    /// Parse using the configured separator and wildcard marker.
    pub fn parse(text: &str) -> Result<Self> {
        Self::parse_with(text, segment_separator(), wildcard_marker())
    }

    pub fn parse_with(text: &str, separator: char, wildcard: char) -> Result<Self> {
        let invalid = |reason| ReactionError::InvalidPattern {
            pattern: text.to_string(),
            reason,
        };

        if text.is_empty() {
            return Err(invalid("empty pattern"));
        }

        let (body, prefix) = match text.strip_suffix(wildcard) {
            Some(body) => (body, true),
            None => (text, false),
        };
        if body.contains(wildcard) {
            return Err(invalid("wildcard marker is only allowed at the end"));
        }

        let segments: Vec<String> = body.split(separator).map(str::to_string).collect();
        let last = segments.len() - 1;
        // An empty last segment is fine for prefix patterns ("chart.*").
        if segments
            .iter()
            .enumerate()
            .any(|(i, s)| s.is_empty() && !(prefix && i == last))
        {
            return Err(invalid("empty path segment"));
        }

        Ok(Self { segments, prefix })
    }

    /// Exact pattern from segments.
    pub fn exact<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
            prefix: false,
        }
    }

    /// Prefix pattern from segments; the last segment is a string prefix.
    pub fn prefix<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
            prefix: true,
        }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_prefix(&self) -> bool {
        self.prefix
    }

    /// Whether `path` is selected by this pattern.
    pub fn matches(&self, path: &[String]) -> bool {
        if path.len() != self.segments.len() {
            return false;
        }
        let Some((last, head)) = self.segments.split_last() else {
            return false;
        };
        let n = head.len();
        if path[..n] != *head {
            return false;
        }
        if self.prefix {
            path[n].starts_with(last.as_str())
        } else {
            path[n] == *last
        }
    }
}

// =============================================================================
// Compiled target set
// =============================================================================

/// A mutation's target and exclude lists, parsed once.
#[derive(Debug, Clone, Default)]
pub struct TargetSet {
    target: Vec<TargetPattern>,
    exclude: Vec<TargetPattern>,
}

impl TargetSet {
    /// Parse every pattern, failing on the first invalid one.
    pub fn parse(target: &[String], exclude: &[String]) -> Result<Self> {
        Ok(Self {
            target: target.iter().map(|p| TargetPattern::parse(p)).collect::<Result<_>>()?,
            exclude: exclude.iter().map(|p| TargetPattern::parse(p)).collect::<Result<_>>()?,
        })
    }

    /// Parse a mutation's patterns, skipping (and logging) invalid ones.
    ///
    /// Mutations come out of derive functions, so there is no caller to
    /// hand an error to.
    pub fn from_mutation(mutation: &Mutation) -> Self {
        let lenient = |patterns: &[String]| -> Vec<TargetPattern> {
            patterns
                .iter()
                .filter_map(|p| match TargetPattern::parse(p) {
                    Ok(pattern) => Some(pattern),
                    Err(err) => {
                        warn!("ignoring pattern in mutation: {err}");
                        None
                    }
                })
                .collect()
        };
        Self {
            target: lenient(&mutation.target),
            exclude: lenient(&mutation.exclude),
        }
    }

    /// Matches at least one target and no exclude.
    pub fn selects(&self, path: &[String]) -> bool {
        self.target.iter().any(|p| p.matches(path)) && !self.exclude.iter().any(|p| p.matches(path))
    }

    /// Target paths named exactly (no wildcard) that no exclude removes.
    pub fn exact_paths(&self) -> impl Iterator<Item = &[String]> + '_ {
        self.target
            .iter()
            .filter(|p| !p.prefix)
            .map(|p| p.segments.as_slice())
            .filter(|path| !self.exclude.iter().any(|e| e.matches(path)))
    }

    /// Select from an ordered path index.
    ///
    /// Exact patterns are direct lookups. Prefix patterns scan only the
    /// contiguous key run that can share the prefix.
    pub fn select_from<'a, V>(&self, index: &'a BTreeMap<Vec<String>, V>) -> Vec<&'a V> {
        let mut selected: BTreeMap<&Vec<String>, &V> = BTreeMap::new();

        for pattern in &self.target {
            if !pattern.prefix {
                if let Some((path, value)) = index.get_key_value(&pattern.segments) {
                    selected.insert(path, value);
                }
                continue;
            }
            let Some((last, head)) = pattern.segments.split_last() else {
                continue;
            };
            let n = head.len();
            for (path, value) in index.range(pattern.segments.clone()..) {
                let in_run = path.len() > n && path[..n] == *head && path[n].starts_with(last.as_str());
                if !in_run {
                    break;
                }
                if path.len() == n + 1 {
                    selected.insert(path, value);
                }
            }
        }

        selected
            .into_iter()
            .filter(|(path, _)| !self.exclude.iter().any(|p| p.matches(path)))
            .map(|(_, value)| value)
            .collect()
    }
}

// =============================================================================
// Matching against the registry
// =============================================================================

/// Registered handles selected by a mutation, in path order.
///
/// Returns an empty list when nothing matches; unmatched mutations are
/// dropped by the caller.
pub fn match_handles(mutation: &Mutation) -> Vec<RenderHandle> {
    let set = TargetSet::from_mutation(mutation);
    let handles = registry::select(&set);
    if handles.is_empty() {
        debug!("no registered handle matches {:?}", mutation.target);
    }
    handles
}

/// Whether a mutation selects this particular handle.
pub fn handle_matches(handle: &RenderHandle, mutation: &Mutation) -> bool {
    TargetSet::from_mutation(mutation).selects(handle.path())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn path(text: &str) -> Vec<String> {
        text.split('.').map(str::to_string).collect()
    }

    #[test]
    fn test_parse_exact_and_prefix() {
        let exact = TargetPattern::parse_with("chart.tooltip", '.', '*').unwrap();
        assert_eq!(exact, TargetPattern::exact(["chart", "tooltip"]));

        let prefix = TargetPattern::parse_with("scatter*", '.', '*').unwrap();
        assert!(prefix.is_prefix());
        assert_eq!(prefix.segments(), ["scatter".to_string()]);

        let any_child = TargetPattern::parse_with("chart.*", '.', '*').unwrap();
        assert_eq!(any_child, TargetPattern::prefix(["chart", ""]));
    }

    #[test]
    fn test_parse_rejects_bad_patterns() {
        for bad in ["", "a.*.b", "a*b", "a..b", ".a"] {
            assert!(
                matches!(TargetPattern::parse_with(bad, '.', '*'), Err(ReactionError::InvalidPattern { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_scatter_prefix() {
        let pattern = TargetPattern::parse_with("scatter*", '.', '*').unwrap();

        assert!(pattern.matches(&path("scatter1")));
        assert!(pattern.matches(&path("scatterBar")));
        assert!(pattern.matches(&path("scattering")));
        assert!(!pattern.matches(&path("line-scatter")));
        assert!(!pattern.matches(&path("bar")));
        assert!(!pattern.matches(&path("Scatter1")));
        assert!(!pattern.matches(&path("scatter1.label")));
    }

    #[test]
    fn test_segment_boundaries() {
        let pattern = TargetPattern::exact(["chart", "bar"]);
        assert!(pattern.matches(&path("chart.bar")));
        assert!(!pattern.matches(&path("chart.bars")));
        assert!(!pattern.matches(&path("chart")));
        assert!(!pattern.matches(&path("chart.bar.label")));

        let nested = TargetPattern::prefix(["chart", "bar"]);
        assert!(nested.matches(&path("chart.bars")));
        assert!(!nested.matches(&path("charts.bar")));
    }

    #[test]
    fn test_exclude_overrides_target() {
        let set = TargetSet::parse(&["scatter*".into()], &["scatterBar".into()]).unwrap();
        assert!(set.selects(&path("scatter1")));
        assert!(!set.selects(&path("scatterBar")));
    }

    #[test]
    fn test_select_from_index() {
        let mut index = BTreeMap::new();
        for (i, p) in ["bar", "line-scatter", "scatter1", "scatter1.label", "scatterBar", "scattering", "zoom"]
            .iter()
            .enumerate()
        {
            index.insert(path(p), i);
        }

        let set = TargetSet::parse(&["scatter*".into(), "bar".into()], &["scattering".into()]).unwrap();
        assert_eq!(set.select_from(&index), vec![&0, &2, &4]);

        let none = TargetSet::parse(&["pie".into()], &[]).unwrap();
        assert!(none.select_from(&index).is_empty());
    }
}

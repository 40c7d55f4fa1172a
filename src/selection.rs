//! Tag-based test selection.
//!
//! Tags are free-text, comma-separated, and compared case-insensitively
//! throughout. Folder-level exclusion is decided once per folder against a
//! variant's negative filter; per-test eligibility additionally applies the
//! positive filter and the compile-flag denylist.

use std::collections::BTreeSet;

use crate::loader::{Test, TestFolder};

/// A set of lower-cased tags.
pub type TagSet = BTreeSet<String>;

/// Split a comma-separated tag string into a [`TagSet`].
///
/// Tags are trimmed and lower-cased; empty fragments are dropped.
pub fn split_tags(text: &str) -> TagSet {
    text.to_lowercase()
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Lower-case an arbitrary collection of tag strings into a [`TagSet`].
pub fn lower_set<I, S>(items: I) -> TagSet
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    items
        .into_iter()
        .map(|s| s.as_ref().to_lowercase())
        .collect()
}

/// Whether a folder participates in a run with the given negative filter.
///
/// Exclusion is decided once for the whole folder: if any folder tag appears
/// in the negative filter, none of its tests run, independent of per-test
/// tags.
pub fn folder_eligible(folder: &TestFolder, not_tags: &TagSet) -> bool {
    folder.tags.is_disjoint(not_tags)
}

/// Whether a single test is eligible under the given filters.
///
/// A test runs iff its tags are disjoint from `not_tags`, its tags are a
/// superset of `tags` (an empty positive filter matches everything), and
/// none of its declared compile flags appear in `not_compile_flags`.
pub fn test_eligible(
    test: &Test,
    tags: &TagSet,
    not_tags: &TagSet,
    not_compile_flags: Option<&TagSet>,
) -> bool {
    let test_tags = test.tag_set();
    if !test_tags.is_disjoint(not_tags) {
        return false;
    }
    if !tags.is_empty() && !tags.is_subset(&test_tags) {
        return false;
    }
    if let Some(denied) = not_compile_flags {
        if let Some(flags) = &test.compile_flags {
            if flags
                .to_lowercase()
                .split_whitespace()
                .any(|f| denied.contains(f))
            {
                return false;
            }
        }
    }
    true
}

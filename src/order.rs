//! Group-based ordering of discovered entries.
//!
//! Entries carry a free-form `group` label. A preference such as
//! `["cors", "apiSpec", ""]` says: everything in `cors` first, then
//! `apiSpec`, then everything else. The empty string is the catch-all
//! marker and may sit anywhere in the list:
//!
//! | preference              | unlisted groups go… |
//! |-------------------------|---------------------|
//! | `["a", "b"]`            | after `b`           |
//! | `["a", "", "b"]`        | between `a` and `b` |
//! | `[]`                    | nowhere special: discovery order is kept |
//!
//! Sorting is stable, so entries that rank equal keep discovery order.

use crate::registry::InterceptorEntry;

/// The default preference: CORS first, API spec second, then the rest.
pub const DEFAULT_ORDERED_GROUPS: [&str; 3] = ["cors", "apiSpec", ""];

/// Returns `entries` in execution order for `preference`.
///
/// Pure: `entries` is not modified and the result depends only on the
/// arguments.
pub fn resolve<S: AsRef<str>>(entries: &[InterceptorEntry], preference: &[S]) -> Vec<InterceptorEntry> {
    let mut ordered = entries.to_vec();
    if preference.is_empty() {
        return ordered;
    }
    // `sort_by_cached_key` is stable and computes each rank once.
    ordered.sort_by_cached_key(|entry| rank(entry.group(), preference));
    ordered
}

/// Position of `group` in `preference`, first occurrence wins.
///
/// Unlisted groups (and `""` itself) share the catch-all position, or sort
/// after every listed group when there is no catch-all.
fn rank<S: AsRef<str>>(group: &str, preference: &[S]) -> usize {
    let position = |label: &str| preference.iter().position(|p| p.as_ref() == label);
    position(group)
        .or_else(|| position(""))
        .unwrap_or(preference.len())
}

//! Extension version ordering.
//!
//! Extension versions are one to four dot-separated integers ("1", "2.0.13",
//! "128.0.6613.84"). Components are compared numerically from left to right,
//! a missing component counts as 0 and a component that is not a plain
//! unsigned integer also counts as 0. So "1.0" == "1.0.0" and "1.0.beta"
//! == "1.0.0": an unparsable suffix can never look like an upgrade.

use std::cmp::Ordering;

fn component(part: &str) -> u64 {
    part.trim().parse().unwrap_or(0)
}

/// Compare two version strings.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let a_parts: Vec<&str> = a.split('.').collect();
    let b_parts: Vec<&str> = b.split('.').collect();
    let len = a_parts.len().max(b_parts.len());

    for i in 0..len {
        let a_value = a_parts.get(i).map(|p| component(p)).unwrap_or(0);
        let b_value = b_parts.get(i).map(|p| component(p)).unwrap_or(0);
        match a_value.cmp(&b_value) {
            Ordering::Equal => continue,
            other => return other,
        }
    }

    Ordering::Equal
}

/// Check if version `candidate` is strictly newer than `current`
pub fn is_newer_version(candidate: &str, current: &str) -> bool {
    compare_versions(candidate, current) == Ordering::Greater
}

/// Whether a version string is safe to use as a cache file name.
pub fn is_valid_version(version: &str) -> bool {
    !version.is_empty()
        && !version.starts_with('.')
        && version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

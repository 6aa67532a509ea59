//! Pure functions over archive-relative paths.
//!
//! Paths here are always forward-slash and case-sensitive, matching tar
//! entry names exactly; backslashes are never interpreted as separators.

/// Collapses `.` and `..` components without touching the filesystem.
///
/// `normalize` never returns a path with a leading `./`, a trailing `/`,
/// or any `.` component. A leading `..` is preserved (there is nothing to
/// collapse it against), matching how `path.join("..")` behaves for
/// archive-relative names that walk above their nominal root.
pub fn normalize(p: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for component in p.split('/') {
        match component {
            "" | "." => continue,
            ".." => {
                if let Some(last) = out.last() {
                    if *last != ".." {
                        out.pop();
                        continue;
                    }
                }
                out.push("..");
            }
            _ => out.push(component),
        }
    }
    if out.is_empty() {
        ".".to_string()
    } else {
        out.join("/")
    }
}

/// Returns true iff `inner` (after normalization) is equal to `outer`, or
/// is strictly below it: the relative path from `outer` to `inner` has no
/// leading `..` component.
pub fn contains(outer: &str, inner: &str) -> bool {
    let outer = normalize(outer);
    let inner = normalize(inner);
    if outer == inner {
        return true;
    }
    if outer == "." {
        // everything non-relative (no leading "..") is under the root
        return !inner.split('/').next().is_some_and(|c| c == "..");
    }
    match inner.strip_prefix(&outer) {
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}

/// Strips the `outer` prefix from `inner`, returning the remaining
/// archive-relative path. Panics if `!contains(outer, inner)` — callers
/// must check containment first, matching how [`crate::tar_demux`] only
/// calls this after filtering on `contains`.
pub fn relative(outer: &str, inner: &str) -> String {
    let outer_n = normalize(outer);
    let inner_n = normalize(inner);
    if outer_n == inner_n {
        return String::new();
    }
    if outer_n == "." {
        return inner_n;
    }
    inner_n
        .strip_prefix(&outer_n)
        .and_then(|rest| rest.strip_prefix('/'))
        .map(|s| s.to_string())
        .expect("relative() called with inner not contained in outer")
}

/// Joins an archive-relative path onto a context, normalizing the
/// result. `join(".", "Dockerfile") == "Dockerfile"`.
pub fn join(outer: &str, rel: &str) -> String {
    if outer == "." || outer.is_empty() {
        normalize(rel)
    } else {
        normalize(&format!("{outer}/{rel}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_dot_and_dotdot() {
        assert_eq!(normalize("./a/./b"), "a/b");
        assert_eq!(normalize("a/b/../c"), "a/c");
        assert_eq!(normalize("a/../../b"), "../b");
        assert_eq!(normalize(""), ".");
        assert_eq!(normalize("."), ".");
        assert_eq!(normalize("./"), ".");
    }

    #[test]
    fn contains_edge_cases_from_spec() {
        assert!(!contains(".", ".."));
        assert!(contains("a", "b/../a/f"));
    }

    #[test]
    fn contains_is_reflexive() {
        for p in [".", "a", "a/b", "a/b/c"] {
            assert!(contains(p, p));
        }
    }

    #[test]
    fn contains_is_transitive() {
        assert!(contains(".", "a"));
        assert!(contains("a", "a/b"));
        assert!(contains(".", "a/b"));

        assert!(contains("a", "a/b/c"));
        assert!(contains("a/b", "a/b/c/d"));
        assert!(contains("a", "a/b/c/d"));
    }

    #[test]
    fn contains_rejects_siblings_and_parents() {
        assert!(!contains("a/b", "a/c"));
        assert!(!contains("a/b", "a"));
        assert!(!contains("a", ".."));
    }

    #[test]
    fn relative_strips_outer_prefix() {
        assert_eq!(relative(".", "a/b"), "a/b");
        assert_eq!(relative("s2", "s2/Dockerfile"), "Dockerfile");
        assert_eq!(relative("a/b", "a/b/c/d"), "c/d");
    }

    #[test]
    fn join_resolves_against_context() {
        assert_eq!(join(".", "Dockerfile"), "Dockerfile");
        assert_eq!(join("s2", "Dockerfile-alternate"), "s2/Dockerfile-alternate");
        assert_eq!(join(".", "test2/Dockerfile-alternate"), "test2/Dockerfile-alternate");
    }
}

//! Path utilities.
//!
//! Paths are UTF-8 strings with `/` separators. Components are yielded
//! without normalization: `.` and `..` are passed through for the dentry
//! walk to interpret.

/// Returns `true` if the path is absolute.
pub fn is_absolute(path: &str) -> bool {
    path.starts_with('/')
}

/// Iterates over the non-empty components of a path.
///
/// Repeated and trailing slashes are skipped, so `"/a//b/"` yields
/// `["a", "b"]`.
pub fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// Splits a path into `(parent, file_name)`.
///
/// Returns `None` if the path has no final component (empty or `/`).
pub fn split_parent(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.rfind('/') {
        Some(0) => Some(("/", &trimmed[1..])),
        Some(idx) => Some((&trimmed[..idx], &trimmed[idx + 1..])),
        None => Some(("", trimmed)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn absolute_detection() {
        assert!(is_absolute("/init"));
        assert!(!is_absolute("init"));
        assert!(!is_absolute(""));
    }

    #[test]
    fn component_iteration() {
        let parts: Vec<_> = components("/dir1/hello.txt").collect();
        assert_eq!(parts, ["dir1", "hello.txt"]);

        let parts: Vec<_> = components("/a//b/").collect();
        assert_eq!(parts, ["a", "b"]);

        assert_eq!(components("/").count(), 0);
        assert_eq!(components("").count(), 0);
    }

    #[test]
    fn dot_components_pass_through() {
        let parts: Vec<_> = components("./a/../b").collect();
        assert_eq!(parts, [".", "a", "..", "b"]);
    }

    #[test]
    fn parent_split() {
        assert_eq!(split_parent("/dir1/hello.txt"), Some(("/dir1", "hello.txt")));
        assert_eq!(split_parent("/init"), Some(("/", "init")));
        assert_eq!(split_parent("init"), Some(("", "init")));
        assert_eq!(split_parent("/a/b/"), Some(("/a", "b")));
        assert_eq!(split_parent("/"), None);
        assert_eq!(split_parent(""), None);
    }
}

//! Path canonical forms. Every path in the tree, the metadata store and the
//! remote key space is absolute; files (and the root) carry no trailing
//! slash, directories carry exactly one. All public operations funnel their
//! input through one of the two forms below before touching any index.

use crate::common::error::{Error, Result};

/// File form: rebuilt from the path's components, so separators collapse
/// and a trailing slash drops out. An input with no components is the root.
pub fn normalize_path(path: &str) -> Result<String> {
    if path.is_empty() {
        return Err(Error::InvalidArgument("empty path".to_string()));
    }
    let mut canonical = String::with_capacity(path.len() + 1);
    for component in path.split('/').filter(|c| !c.is_empty()) {
        canonical.push('/');
        canonical.push_str(component);
    }
    if canonical.is_empty() {
        canonical.push('/');
    }
    Ok(canonical)
}

/// Directory form: the file form plus the trailing slash ("/" stays "/")
pub fn as_dir_path(path: &str) -> Result<String> {
    let mut canonical = normalize_path(path)?;
    if canonical != "/" {
        canonical.push('/');
    }
    Ok(canonical)
}

pub fn is_dir_path(path: &str) -> bool {
    path.ends_with('/')
}

pub fn is_root(path: &str) -> bool {
    path == "/"
}

/// Containing directory, in directory form. None at the root.
pub fn parent_path(path: &str) -> Option<String> {
    let canonical = normalize_path(path).ok()?;
    if canonical == "/" {
        return None;
    }
    let split = canonical.rfind('/')?;
    Some(canonical[..=split].to_string())
}

/// Last component of a path; the root names itself
pub fn file_name(path: &str) -> Option<String> {
    let canonical = normalize_path(path).ok()?;
    if canonical == "/" {
        return Some("/".to_string());
    }
    let split = canonical.rfind('/')?;
    Some(canonical[split + 1..].to_string())
}

/// A child's canonical path under a parent directory
pub fn join_child(parent: &str, name: &str) -> Result<String> {
    let dir = as_dir_path(parent)?;
    normalize_path(&format!("{}{}", dir, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path_rebuilds_file_form() {
        assert_eq!(normalize_path("data/set.bin").unwrap(), "/data/set.bin");
        assert_eq!(normalize_path("/data/set.bin/").unwrap(), "/data/set.bin");
        assert_eq!(normalize_path("//data///set.bin").unwrap(), "/data/set.bin");
        assert_eq!(normalize_path("/").unwrap(), "/");
        assert_eq!(normalize_path("///").unwrap(), "/");
        assert!(normalize_path("").is_err());
    }

    #[test]
    fn test_as_dir_path_appends_exactly_one_slash() {
        assert_eq!(as_dir_path("/data/logs").unwrap(), "/data/logs/");
        assert_eq!(as_dir_path("/data/logs///").unwrap(), "/data/logs/");
        assert_eq!(as_dir_path("/").unwrap(), "/");
        assert!(is_dir_path("/data/logs/"));
        assert!(!is_dir_path("/data/set.bin"));
    }

    #[test]
    fn test_parent_path_is_in_dir_form() {
        assert_eq!(parent_path("/data/set.bin").unwrap(), "/data/");
        assert_eq!(parent_path("/data/logs/").unwrap(), "/data/");
        assert_eq!(parent_path("/data").unwrap(), "/");
        assert_eq!(parent_path("/"), None);
    }

    #[test]
    fn test_file_name_ignores_dir_form() {
        assert_eq!(file_name("/data/set.bin").unwrap(), "set.bin");
        assert_eq!(file_name("/data/logs/").unwrap(), "logs");
        assert_eq!(file_name("/").unwrap(), "/");
    }

    #[test]
    fn test_join_child_funnels_through_dir_form() {
        assert_eq!(join_child("/data", "set.bin").unwrap(), "/data/set.bin");
        assert_eq!(join_child("/data/", "set.bin").unwrap(), "/data/set.bin");
        assert_eq!(join_child("/", "data").unwrap(), "/data");
    }
}

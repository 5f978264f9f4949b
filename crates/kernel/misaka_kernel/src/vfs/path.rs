use std::string::String;

use misaka_kernel_params::MAX_PATH;

use crate::error::KernelError;

/// Turns `path` into an absolute path without `.` or `..` components.
///
/// Relative paths are resolved against `cwd`, which must be absolute. `..`
/// at the root stays at the root.
pub fn canonicalize_path(cwd: &str, path: &str) -> Result<String, KernelError> {
    let mut components = Vec::new();
    let base = if path.starts_with('/') { "" } else { cwd };
    for component in base.split('/').chain(path.split('/')) {
        match component {
            "" | "." => {}
            ".." => {
                components.pop();
            }
            c => components.push(c),
        }
    }

    let mut out = String::with_capacity(path.len() + 1);
    for c in &components {
        out.push('/');
        out.push_str(c);
    }
    if out.is_empty() {
        out.push('/');
    }
    if out.len() > MAX_PATH {
        return Err(KernelError::PathTooLong);
    }
    Ok(out)
}

/// Splits an absolute canonical path into its components.
pub(super) fn components(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|c| !c.is_empty())
}

/// Splits a canonical path into its parent directory and final component.
pub(crate) fn split_parent(path: &str) -> Option<(&str, &str)> {
    let (parent, name) = path.rsplit_once('/')?;
    if name.is_empty() {
        return None;
    }
    Some((if parent.is_empty() { "/" } else { parent }, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_dots() {
        assert_eq!(canonicalize_path("/", "a/./b/../c").unwrap(), "/a/c");
        assert_eq!(canonicalize_path("/home/user", "../x").unwrap(), "/home/x");
        assert_eq!(canonicalize_path("/home", "/etc//passwd").unwrap(), "/etc/passwd");
        assert_eq!(canonicalize_path("/", "../../..").unwrap(), "/");
        assert_eq!(canonicalize_path("/tmp", "").unwrap(), "/tmp");
    }

    #[test]
    fn rejects_long_paths() {
        let long = "x/".repeat(MAX_PATH);
        assert_eq!(
            canonicalize_path("/", &long),
            Err(KernelError::PathTooLong)
        );
    }

    #[test]
    fn parent_split() {
        assert_eq!(split_parent("/a/b"), Some(("/a", "b")));
        assert_eq!(split_parent("/a"), Some(("/", "a")));
        assert_eq!(split_parent("/"), None);
    }
}

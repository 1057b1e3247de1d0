//! Remote path helpers.
//!
//! Remote paths are UTF-8, `/`-separated, with no leading slash and no `.`
//! or `..` segments. The empty string is the remote root.

use crate::error::{Error, Result};

/// Check that `path` is a well-formed remote path.
pub fn validate(path: &str) -> Result<()> {
    if path.starts_with('/') {
        return Err(Error::no_retry("remote path must not start with '/'").with_path(path));
    }
    for segment in path.split('/') {
        if !path.is_empty() && segment.is_empty() {
            return Err(Error::no_retry("remote path has an empty segment").with_path(path));
        }
        if segment == "." || segment == ".." {
            return Err(Error::no_retry("remote path must not contain '.' or '..'").with_path(path));
        }
    }
    Ok(())
}

/// Join a directory path and a child name. Either side may be empty.
pub fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else if name.is_empty() {
        dir.to_string()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}

/// The parent directory of `path` (`""` for top-level entries).
pub fn parent(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some((dir, _)) => dir,
        None => "",
    }
}

/// The final component of `path`.
pub fn name(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some((_, n)) => n,
        None => path,
    }
}

/// Strip `root` from the front of `path`, yielding the path relative to it.
pub fn relative<'a>(path: &'a str, root: &str) -> &'a str {
    if root.is_empty() {
        return path;
    }
    path.strip_prefix(root)
        .map(|rest| rest.trim_start_matches('/'))
        .unwrap_or(path)
}

/// Depth of a path: number of segments (0 for the root).
pub fn depth(path: &str) -> usize {
    if path.is_empty() {
        0
    } else {
        path.split('/').count()
    }
}

/// Case-fold a name for comparison on case-insensitive remotes.
pub fn fold(name: &str) -> String {
    name.to_lowercase()
}

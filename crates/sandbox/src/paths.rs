//! Container-side path handling.
//!
//! Paths inside the container are always POSIX, whatever the host is, so they
//! are handled as strings rather than `std::path::Path`.

use agentbox_core::{Error, Result};

/// Lexically normalize an absolute container path.
///
/// Resolves `.` and `..` without touching any filesystem; `..` never climbs
/// above `/`. Relative input is taken relative to `/`.
pub fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Join `path` onto `base` unless it is already absolute.
pub fn join_path(base: &str, path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else if base.ends_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    }
}

/// Whether normalized `path` equals `root` or lies below it.
pub fn is_within(root: &str, path: &str) -> bool {
    let root = normalize_path(root);
    let path = normalize_path(path);
    root == "/" || path == root || path.starts_with(&format!("{}/", root))
}

/// Resolve `path` (absolute or relative to `root`) and require it to stay
/// inside `root`.
pub fn confine(root: &str, path: &str) -> Result<String> {
    let resolved = normalize_path(&join_path(root, path));
    if is_within(root, &resolved) {
        Ok(resolved)
    } else {
        Err(Error::security_violation(format!(
            "path '{}' escapes workspace root '{}'",
            path, root
        )))
    }
}

/// Split a normalized absolute path into its directory and file name.
pub fn split_parent(path: &str) -> (String, String) {
    match path.rfind('/') {
        Some(0) => ("/".to_string(), path[1..].to_string()),
        Some(i) => (path[..i].to_string(), path[i + 1..].to_string()),
        None => ("/".to_string(), path.to_string()),
    }
}

/// Quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

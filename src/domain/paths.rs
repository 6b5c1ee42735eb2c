//! Path Helpers
//!
//! Lexical path handling shared by client keys and server lookups. Nothing
//! here touches the filesystem.

/// Absolute, lexically normalized form of `path` relative to `cwd`
pub fn absolute(path: &str, cwd: &str) -> String {
    if path.starts_with('/') {
        normalize(path)
    } else {
        normalize(&format!("{}/{}", cwd, path))
    }
}

/// Collapse `//`, `.` and `..` components of an absolute path
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            part => parts.push(part),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Parent directory of an absolute path (`/` for top-level entries)
pub fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// Split an absolute path into directory and final component
pub fn split(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(idx) => (parent_dir(path), &path[idx + 1..]),
        None => ("", path),
    }
}

/// Join a directory and a name
pub fn join(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

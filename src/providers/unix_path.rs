//! Slash-separated path algebra for remote backends
//!
//! Remote servers speak POSIX paths regardless of the host platform, so SFTP
//! and FTP compose paths here instead of going through `std::path`.

/// Lexically normalize a path: collapse repeated slashes, drop `.`, resolve `..`.
///
/// `..` never climbs above the root of an absolute path. An empty result is `"."`.
pub fn clean(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            _ => parts.push(part),
        }
    }

    let joined = parts.join("/");
    match (absolute, joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Join two path fragments and clean the result
pub fn join(base: &str, name: &str) -> String {
    if base.is_empty() {
        return clean(name);
    }
    if name.is_empty() {
        return clean(base);
    }
    clean(&format!("{}/{}", base, name))
}

/// Parent directory; `"/"` for top-level entries and the root itself
pub fn parent(path: &str) -> String {
    let cleaned = clean(path);
    match cleaned.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => cleaned[..idx].to_string(),
        None => ".".to_string(),
    }
}

/// Final path component; `"/"` for the root
pub fn base(path: &str) -> String {
    let cleaned = clean(path);
    if cleaned == "/" {
        return cleaned;
    }
    match cleaned.rfind('/') {
        Some(idx) => cleaned[idx + 1..].to_string(),
        None => cleaned,
    }
}

/// Components of an absolute path, root excluded
pub fn components(path: &str) -> Vec<String> {
    clean(path)
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .map(str::to_string)
        .collect()
}

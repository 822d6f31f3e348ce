//! Path manipulations used when pairing symbol sources with packages.

use std::path::{Component, Path};

/// Returns the file name of `path`, truncated after the last `.so`.
///
/// This strips version suffixes of shared libraries, so that `/usr/lib64/libfoo.so.1.2` and
/// `/usr/lib/libfoo.so.1` both become `libfoo.so`.
pub fn libname(path: &str) -> &str {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rfind(".so") {
        Some(idx) if idx > 0 => &name[..idx + 3],
        _ => name,
    }
}

/// Toggles the `/usr` prefix of `path`.
///
/// `/usr/bin/foo` becomes `/bin/foo` and vice versa.
pub fn usrmove(path: &str) -> String {
    match path.strip_prefix("/usr") {
        Some(stripped) => stripped.to_owned(),
        None => format!("/usr{path}"),
    }
}

/// Lexically normalizes an absolute path, resolving `.` and `..` components.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().unwrap_or_default()),
            Component::ParentDir => {
                parts.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    format!("/{}", parts.join("/"))
}

/// Returns the paths under which a binary referenced as `path` may be packaged.
///
/// The stored path is tried first. Paths of real files additionally yield their `/usr` toggled
/// variant and normalized forms.
pub fn candidate_paths(path: &str) -> Vec<String> {
    let mut paths = vec![path.to_owned()];
    if path.contains('/') {
        let normalized = normalize(path);
        for candidate in [usrmove(path), normalized.clone(), usrmove(&normalized)] {
            if !paths.contains(&candidate) {
                paths.push(candidate);
            }
        }
    }
    paths
}

/// Returns the path of the debug file for `build_id` within a debuginfo package.
pub fn build_id_debug_path(build_id: &str) -> String {
    let split = build_id
        .char_indices()
        .nth(2)
        .map_or(build_id.len(), |(idx, _)| idx);
    let (dir, file) = build_id.split_at(split);
    format!("/usr/lib/debug/.build-id/{dir}/{file}.debug")
}

//! Mapping manifest names onto destination and content-store paths

use std::path::{Path, PathBuf};

use crate::error::ReconstructionError;

/// Characters that are not valid in file names on every destination platform
const HOSTILE_CHARS: [char; 7] = ['<', '>', ':', '"', '|', '?', '*'];

/// Replace path-hostile characters with an underscore
pub fn sanitize_component(component: &str) -> String {
    component
        .chars()
        .map(|c| if HOSTILE_CHARS.contains(&c) { '_' } else { c })
        .collect()
}

/// Sanitize a `/`-separated manifest path into a platform relative path
///
/// Empty and `.` components are dropped and `..` is neutralised, so the
/// result always stays below whatever root it is joined onto.
pub fn sanitize_relative_path(relative_path: &str) -> PathBuf {
    relative_path
        .split('/')
        .filter(|component| !component.is_empty() && *component != ".")
        .map(|component| {
            if component == ".." {
                "_".to_string()
            } else {
                sanitize_component(component)
            }
        })
        .collect()
}

/// `root/domain[/relativePath]` with every part sanitized
pub fn destination_path(root: &Path, domain: &str, relative_path: &str) -> PathBuf {
    let mut path = root.join(domain_component(domain));
    let relative = sanitize_relative_path(relative_path);
    if !relative.as_os_str().is_empty() {
        path.push(relative);
    }
    path
}

// The domain is always exactly one path component
fn domain_component(domain: &str) -> String {
    let sanitized = sanitize_component(domain).replace('/', "_");
    match sanitized.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => sanitized,
    }
}

/// Blob location in the sharded content store: `root/id[0:2]/id`
pub fn content_store_path(root: &Path, identifier: &str) -> Result<PathBuf, ReconstructionError> {
    let shard = identifier
        .get(..2)
        .filter(|_| !identifier.contains(['/', '\\']) && identifier != "..")
        .ok_or_else(|| ReconstructionError::InvalidIdentifier(identifier.to_string()))?;
    Ok(root.join(shard).join(identifier))
}

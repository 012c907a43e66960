use crate::errors::SubPathError;
use std::path::{Component, Path};

/// Filter an artifact's paths down to those under `sub_path`
///
/// An empty sub path or `.` keeps every path unchanged. Otherwise paths
/// below the sub path come back relative to it, and a path equal to the sub
/// path comes back as its final segment. Matching nothing is an error.
pub fn filter_mount_paths_by_sub_path(
    paths: &[String],
    sub_path: &str,
) -> Result<Vec<String>, SubPathError> {
    Ok(sub_path_entries(paths, sub_path)?
        .into_iter()
        .map(|(_, relative)| relative)
        .collect())
}

/// Like [filter_mount_paths_by_sub_path], keeping each original path
/// alongside its filtered form
pub fn sub_path_entries(
    paths: &[String],
    sub_path: &str,
) -> Result<Vec<(String, String)>, SubPathError> {
    let prefix = normalize(sub_path)?;
    if prefix.is_empty() {
        return Ok(paths.iter().map(|path| (path.clone(), path.clone())).collect());
    }

    let with_separator = format!("{}/", prefix);
    let mut matched = Vec::new();
    for path in paths {
        let trimmed = path.strip_prefix("./").unwrap_or(path);
        if let Some(rest) = trimmed.strip_prefix(&with_separator) {
            if !rest.is_empty() {
                matched.push((path.clone(), rest.to_string()));
            }
        } else if trimmed == prefix {
            let name = Path::new(trimmed)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| trimmed.to_string());
            matched.push((path.clone(), name));
        }
    }
    if matched.is_empty() {
        return Err(SubPathError::NoMatch(sub_path.to_string()));
    }
    Ok(matched)
}

fn normalize(sub_path: &str) -> Result<String, SubPathError> {
    let trimmed = sub_path.strip_prefix("./").unwrap_or(sub_path);
    let trimmed = trimmed.trim_end_matches('/');
    if trimmed.is_empty() || trimmed == "." {
        return Ok(String::new());
    }
    let path = Path::new(trimmed);
    let escapes = path
        .components()
        .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(SubPathError::Escapes(sub_path.to_string()));
    }
    Ok(trimmed.to_string())
}

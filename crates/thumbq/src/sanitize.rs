//! Keeps server-side paths out of logs, spans and user-visible errors.

use std::path::Path;

/// The file name of `path`, for span fields and log lines.
pub fn redact_path(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("<unknown>")
        .to_string()
}

/// Replaces every occurrence of each path in `text` with its file name.
/// Tool output quotes the paths it was given, and that text ends up in a
/// job's `errorMessage`.
pub fn redact_paths_in(text: &str, paths: &[&Path]) -> String {
    let mut known: Vec<(String, String)> = paths
        .iter()
        .filter_map(|p| {
            let full = p.to_str()?;
            (!full.is_empty()).then(|| (full.to_string(), redact_path(p)))
        })
        .collect();
    // A directory is a prefix of the files inside it.
    known.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

    known
        .iter()
        .fold(text.to_string(), |acc, (full, name)| acc.replace(full, name))
}

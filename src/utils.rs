//! Utility functions.

use std::path::Path;

/// Converts a relative filesystem path to the forward-slash form used in archives.
pub fn to_archive_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

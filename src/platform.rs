//! Cross-platform utilities for crosslink
//!
//! This module provides platform-agnostic functions for:
//! - Home directory detection
//! - Config and downloads directory paths
//! - Hostname detection for the pairing payload
//!
//! Supports Linux, macOS, and Windows.

use std::path::PathBuf;

/// Get the user's home directory in a cross-platform way.
pub fn home_dir() -> Option<PathBuf> {
    dirs_next::home_dir()
}

/// Get the crosslink config directory.
///
/// Returns:
/// - Linux/macOS: `~/.crosslink`
/// - Windows: `%USERPROFILE%\.crosslink`
pub fn config_dir() -> PathBuf {
    home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".crosslink")
}

/// Directory that received files land in when no override is configured.
///
/// Falls back to `~/Downloads`, then to the working directory.
pub fn downloads_dir() -> PathBuf {
    dirs_next::download_dir()
        .or_else(|| home_dir().map(|h| h.join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Get the system hostname, used as the `host` field of the pairing payload.
pub fn hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "Unknown".to_string())
}

/// Extract the last component from a path string, handling both
/// forward slashes and backslashes.
///
/// Filenames announced by phones may carry either separator.
pub fn extract_path_basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_path_basename_unix() {
        assert_eq!(extract_path_basename("/home/user/photo.jpg"), "photo.jpg");
        assert_eq!(extract_path_basename("/home/user/"), "");
        assert_eq!(extract_path_basename("photo.jpg"), "photo.jpg");
    }

    #[test]
    fn test_extract_path_basename_windows() {
        assert_eq!(extract_path_basename(r"C:\Users\user\notes.txt"), "notes.txt");
        assert_eq!(extract_path_basename(r"..\..\evil.exe"), "evil.exe");
    }

    #[test]
    fn test_config_dir() {
        let dir = config_dir();
        assert!(dir.ends_with(".crosslink"));
    }

    #[test]
    fn test_hostname_not_empty() {
        assert!(!hostname().is_empty());
    }
}

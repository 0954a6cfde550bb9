//! Static frontend bundle.
//!
//! A bundle is a directory of built frontend files. Its digest covers every
//! object key and file content, so any change to the build changes the
//! inputs of the upload resource.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::ConfigError;

/// One file to upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleFile {
    /// Object key, `/`-separated and relative to the bundle root.
    pub key: String,
    /// Path on disk.
    pub path: PathBuf,
    /// MIME type sent with the object.
    pub content_type: &'static str,
    /// Size in bytes.
    pub size: u64,
}

/// A scanned bundle directory.
#[derive(Debug, Clone)]
pub struct SiteBundle {
    files: Vec<BundleFile>,
    digest: String,
}

impl SiteBundle {
    /// Scans a directory recursively. Files are sorted by key. Symlinked
    /// directories are not descended into.
    ///
    /// # Errors
    ///
    /// Returns `InvalidBundle` if the directory is missing, unreadable or
    /// contains no files.
    pub fn scan(root: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let root = root.as_ref().to_path_buf();
        let invalid = |message: String| ConfigError::InvalidBundle {
            path: root.clone(),
            message,
        };

        if !root.is_dir() {
            return Err(invalid(String::from("not a directory")));
        }

        let mut paths = Vec::new();
        for entry in WalkDir::new(&root).sort_by_file_name() {
            let entry = entry.map_err(|e| invalid(e.to_string()))?;
            if entry.path().is_file() {
                paths.push(entry.into_path());
            }
        }

        let mut files = Vec::with_capacity(paths.len());
        let mut hasher = Sha256::new();
        for path in paths {
            let key = object_key(&root, &path)
                .ok_or_else(|| invalid(format!("unusable file name {}", path.display())))?;
            let bytes = std::fs::read(&path).map_err(|e| invalid(format!("{key}: {e}")))?;

            hasher.update(key.as_bytes());
            hasher.update([0]);
            hasher.update(Sha256::digest(&bytes));

            files.push(BundleFile {
                content_type: content_type(&key),
                size: bytes.len() as u64,
                key,
                path,
            });
        }
        files.sort_by(|a, b| a.key.cmp(&b.key));

        if files.is_empty() {
            return Err(invalid(String::from("no files to upload")));
        }

        Ok(Self {
            files,
            digest: hex::encode(hasher.finalize()),
        })
    }

    /// Files in key order.
    #[must_use]
    pub fn files(&self) -> &[BundleFile] {
        &self.files
    }

    /// Content digest.
    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Total size in bytes.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

fn object_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Option<Vec<&str>> = relative.components().map(|c| c.as_os_str().to_str()).collect();
    Some(parts?.join("/"))
}

/// MIME type by file extension.
#[must_use]
pub fn content_type(key: &str) -> &'static str {
    let extension = key
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "application/javascript",
        "json" | "map" => "application/json",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "txt" => "text/plain; charset=utf-8",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "wasm" => "application/wasm",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn bundle_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>tasks</h1>").unwrap();
        std::fs::create_dir(dir.path().join("assets")).unwrap();
        std::fs::write(dir.path().join("assets/app.js"), "console.log(1)").unwrap();
        dir
    }

    #[test]
    fn test_scan_lists_keys_with_types() {
        let dir = bundle_dir();
        let bundle = SiteBundle::scan(dir.path()).unwrap();

        let keys: Vec<&str> = bundle.files().iter().map(|f| f.key.as_str()).collect();
        assert_eq!(keys, vec!["assets/app.js", "index.html"]);
        assert_eq!(bundle.files()[0].content_type, "application/javascript");
        assert_eq!(bundle.files()[1].content_type, "text/html; charset=utf-8");
        assert_eq!(bundle.total_size(), 28);
    }

    #[test]
    fn test_digest_tracks_content() {
        let dir = bundle_dir();
        let first = SiteBundle::scan(dir.path()).unwrap().digest().to_string();
        assert_eq!(first, SiteBundle::scan(dir.path()).unwrap().digest());

        std::fs::write(dir.path().join("index.html"), "<h1>changed</h1>").unwrap();
        assert_ne!(first, SiteBundle::scan(dir.path()).unwrap().digest());
    }

    #[test]
    fn test_empty_or_missing_dir_is_invalid() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            SiteBundle::scan(dir.path()),
            Err(ConfigError::InvalidBundle { .. })
        ));
        assert!(SiteBundle::scan(dir.path().join("missing")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_directories_are_not_followed() {
        let dir = bundle_dir();
        std::os::unix::fs::symlink(dir.path(), dir.path().join("loop")).unwrap();

        let bundle = SiteBundle::scan(dir.path()).unwrap();
        let keys: Vec<&str> = bundle.files().iter().map(|f| f.key.as_str()).collect();
        assert_eq!(keys, vec!["assets/app.js", "index.html"]);
    }

    #[test]
    fn test_unknown_extension() {
        assert_eq!(content_type("LICENSE"), "application/octet-stream");
        assert_eq!(content_type("logo.PNG"), "image/png");
    }
}

//! Media root listing and path resolution.
//!
//! Items are addressed by their `/`-separated path relative to the media
//! root.  Anything that could step outside the root is rejected before it
//! reaches mpv.

use std::path::{Component, Path, PathBuf};

use playsync_proto::protocol::{ItemRef, MediaPage};
use tracing::debug;

use crate::error::ApiError;

const MEDIA_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "webm", "avi", "mov", "m4v", "wmv", "ts", "mpg", "mpeg", "mp3", "flac", "wav",
    "ogg", "opus", "m4a", "aac",
];

const MAX_DEPTH: usize = 16;
pub const MAX_PAGE: usize = 500;

pub struct MediaLibrary {
    root: PathBuf,
}

impl MediaLibrary {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map an item path onto an existing file under the root.
    pub fn resolve(&self, rel: &str) -> Result<PathBuf, ApiError> {
        let rel = rel.trim();
        if rel.is_empty() {
            return Err(ApiError::InvalidPath("empty path".to_string()));
        }
        let mut resolved = self.root.clone();
        for part in rel.split(['/', '\\']).filter(|p| !p.is_empty()) {
            let mut components = Path::new(part).components();
            match (components.next(), components.next()) {
                (Some(Component::Normal(name)), None) => resolved.push(name),
                _ => return Err(ApiError::InvalidPath(rel.to_string())),
            }
        }
        if rel.starts_with('/') || rel.starts_with('\\') {
            return Err(ApiError::InvalidPath(rel.to_string()));
        }
        if !resolved.is_file() {
            return Err(ApiError::NotFound(rel.to_string()));
        }
        Ok(resolved)
    }

    /// Ordered, paged listing of media files, optionally filtered by a
    /// case-insensitive substring of the path.
    pub async fn list(
        &self,
        query: Option<&str>,
        offset: usize,
        limit: usize,
    ) -> Result<MediaPage, ApiError> {
        let root = self.root.clone();
        let mut items = tokio::task::spawn_blocking(move || scan(&root))
            .await
            .map_err(|e| ApiError::Io(std::io::Error::other(e)))??;

        if let Some(q) = query.map(str::trim).filter(|q| !q.is_empty()) {
            let needle = q.to_lowercase();
            items.retain(|item| item.path.to_lowercase().contains(&needle));
        }

        let total = items.len();
        let items = items
            .into_iter()
            .skip(offset)
            .take(limit.clamp(1, MAX_PAGE))
            .collect();
        Ok(MediaPage { items, total })
    }
}

fn is_media(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| MEDIA_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn scan(root: &Path) -> std::io::Result<Vec<ItemRef>> {
    let mut found = Vec::new();
    let mut stack = vec![(root.to_path_buf(), 0usize)];
    while let Some((dir, depth)) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if dir == root => return Err(e),
            Err(e) => {
                debug!("library: skipping {:?}: {}", dir, e);
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                if depth < MAX_DEPTH {
                    stack.push((path, depth + 1));
                }
            } else if is_media(&path) {
                if let Ok(rel) = path.strip_prefix(root) {
                    let rel = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    found.push(ItemRef::new(rel));
                }
            }
        }
    }
    found.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(found)
}

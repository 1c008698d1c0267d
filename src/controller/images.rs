//! Content-addressed staging area for image layer uploads.
//!
//! Layers are keyed by digest. A digest is cached iff its final file exists
//! in the cache directory; partially uploaded layers live next to it with
//! an `.uploading` suffix and are reclaimed at startup or when their writer
//! goes quiet. The "being uploaded" table is process-local — exactly one
//! writer per digest is admitted while the broker runs.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};

use crate::constants::{LAYER_CACHE_DIR, MAX_UPLOAD_OFFER, UPLOADING_SUFFIX, UPLOAD_ACTIVE_WINDOW_SECS};
use crate::controller::CommandError;

pub struct ImageCache {
    dir: PathBuf,
    cached: HashSet<String>,
    uploading: HashMap<String, File>,
}

impl std::fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCache")
            .field("cached", &self.cached.len())
            .field("uploading", &self.uploading.len())
            .finish()
    }
}

impl ImageCache {
    /// Open the cache under `state_dir`, deleting any partial files left by
    /// a previous run and listing the completed layers.
    pub fn open(state_dir: &Path) -> Result<ImageCache> {
        let dir = state_dir.join(LAYER_CACHE_DIR);
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating layer cache dir: {}", dir.display()))?;

        let mut cached = HashSet::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(UPLOADING_SUFFIX) {
                log::info!("removing stale partial upload: {name}");
                let _ = fs::remove_file(entry.path());
            } else {
                cached.insert(name);
            }
        }
        log::info!("layer cache opened with {} layers", cached.len());

        Ok(ImageCache { dir, cached, uploading: HashMap::new() })
    }

    pub fn layer_path(&self, digest: &str) -> PathBuf {
        self.dir.join(digest)
    }

    fn partial_path(&self, digest: &str) -> PathBuf {
        self.dir.join(format!("{digest}{UPLOADING_SUFFIX}"))
    }

    pub fn is_cached(&self, digest: &str) -> bool {
        self.cached.contains(digest)
    }

    /// Given the layers an image needs, return those that must be uploaded.
    ///
    /// Nulls are stripped and duplicates answered once. A digest with a
    /// partial file written to in the last ten seconds has a live uploader
    /// and the whole offer is refused; older partials are reclaimed and the
    /// digest included in the answer.
    pub fn upload_requirements(&mut self, layers: &[Option<String>]) -> Result<Vec<String>, CommandError> {
        let distinct: HashSet<&String> = layers.iter().flatten().collect();
        if distinct.len() > MAX_UPLOAD_OFFER {
            return Err(CommandError::invalid("Upload offer is too large (>256 layers)"));
        }

        let mut needed = Vec::new();
        let mut answered = HashSet::new();
        for digest in layers.iter().flatten() {
            if !answered.insert(digest.clone()) || self.cached.contains(digest) {
                continue;
            }
            check_digest(digest)?;
            if self.uploading.contains_key(digest) {
                let partial = self.partial_path(digest);
                match fs::metadata(&partial).and_then(|m| m.modified()) {
                    Ok(modified) => {
                        let quiet = SystemTime::now()
                            .duration_since(modified)
                            .unwrap_or_default()
                            .as_secs();
                        if quiet < UPLOAD_ACTIVE_WINDOW_SECS {
                            return Err(CommandError::invalid("Layer is currently being uploaded"));
                        }
                        log::info!("reclaiming stalled upload: {digest}");
                        self.uploading.remove(digest);
                        let _ = fs::remove_file(&partial);
                    }
                    Err(_) => {
                        // partial vanished underneath us; drop the writer
                        self.uploading.remove(digest);
                    }
                }
            }
            needed.push(digest.clone());
        }
        Ok(needed)
    }

    /// Append one decompressed slab to a layer's partial file.
    pub fn upload_slab(&mut self, digest: &str, slab: i64, bulk: &[u8]) -> Result<String, CommandError> {
        check_digest(digest)?;
        if !self.uploading.contains_key(digest) {
            let file = OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(self.partial_path(digest))
                .map_err(|e| CommandError::invalid(format!("Could not open layer for writing: {e}")))?;
            self.uploading.insert(digest.to_string(), file);
        }
        let file = self.uploading.get_mut(digest).expect("writer just ensured");
        lzma_rs::lzma_decompress(&mut Cursor::new(bulk), file)
            .map_err(|e| CommandError::invalid(format!("Could not decompress slab: {e}")))?;
        let mut label = (slab + 1).to_string();
        label.truncate(16);
        Ok(format!("Received slab: {label}"))
    }

    /// Seal a layer: close the partial file and move it to its final name.
    pub fn upload_complete(&mut self, digest: &str) -> Result<String, CommandError> {
        check_digest(digest)?;
        let Some(file) = self.uploading.remove(digest) else {
            return Err(CommandError::invalid("No upload in progress for that layer"));
        };
        drop(file);
        fs::rename(self.partial_path(digest), self.layer_path(digest))
            .map_err(|e| CommandError::invalid(format!("Could not finalise layer: {e}")))?;
        self.cached.insert(digest.to_string());
        let mut short = digest.to_string();
        short.truncate(16);
        Ok(format!("Received complete layer: {short}"))
    }
}

/// Digests become file names; restrict them to hash-safe characters.
fn check_digest(digest: &str) -> Result<(), CommandError> {
    if digest.is_empty() || !digest.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(CommandError::invalid("Malformed layer digest"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn compress(data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        lzma_rs::lzma_compress(&mut Cursor::new(data), &mut out).unwrap();
        out
    }

    fn some(s: &str) -> Option<String> {
        Some(s.to_string())
    }

    #[test]
    fn test_upload_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = ImageCache::open(dir.path()).unwrap();

        let needed = cache.upload_requirements(&[some("a"), some("b")]).unwrap();
        assert_eq!(needed, vec!["a", "b"]);

        cache.upload_slab("a", 0, &compress(b"hello")).unwrap();
        cache.upload_slab("a", 1, &compress(b" world")).unwrap();
        cache.upload_complete("a").unwrap();

        let needed = cache.upload_requirements(&[some("a"), some("b")]).unwrap();
        assert_eq!(needed, vec!["b"]);

        let mut contents = String::new();
        File::open(cache.layer_path("a")).unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "hello world");
    }

    #[test]
    fn test_live_upload_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = ImageCache::open(dir.path()).unwrap();
        cache.upload_slab("abc", 0, &compress(b"partial")).unwrap();
        // the partial was just written, so a second uploader is refused
        let err = cache.upload_requirements(&[some("abc")]).unwrap_err();
        assert!(err.to_string().contains("currently being uploaded"));
    }

    #[test]
    fn test_nulls_and_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = ImageCache::open(dir.path()).unwrap();
        let needed = cache
            .upload_requirements(&[None, some("a"), some("a"), None, some("b")])
            .unwrap();
        assert_eq!(needed, vec!["a", "b"]);
    }

    #[test]
    fn test_offer_size_cap() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = ImageCache::open(dir.path()).unwrap();
        let offer: Vec<Option<String>> = (0..257).map(|i| some(&format!("layer{i}"))).collect();
        assert!(cache.upload_requirements(&offer).is_err());
    }

    #[test]
    fn test_partials_deleted_at_startup() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut cache = ImageCache::open(dir.path()).unwrap();
            cache.upload_slab("aaa", 0, &compress(b"x")).unwrap();
            cache.upload_slab("bbb", 0, &compress(b"y")).unwrap();
            cache.upload_complete("bbb").unwrap();
        }
        let cache = ImageCache::open(dir.path()).unwrap();
        assert!(!cache.is_cached("aaa"));
        assert!(cache.is_cached("bbb"));
        assert!(!dir.path().join(LAYER_CACHE_DIR).join("aaa.uploading").exists());
    }

    #[test]
    fn test_traversal_digest_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = ImageCache::open(dir.path()).unwrap();
        assert!(cache.upload_slab("../escape", 0, &compress(b"x")).is_err());
    }
}

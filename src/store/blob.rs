use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use super::StoreError;

const REF_PREFIX: &str = "sha256:";
const HEX_LEN: usize = 64;
const TMP_PREFIX: &str = ".tmp-";

/// Content-addressed byte store. Objects live under two-hex-character prefix
/// directories, named by their full digest, so per-directory fanout stays
/// bounded while a full traversal remains a plain directory walk.
pub struct BlobStore {
    base: PathBuf,
}

/// Parses `[scheme://]algo:hex` into the bare hex digest. Only sha256 with a
/// correctly sized hex payload is accepted.
pub fn parse_ref(r: &str) -> Result<String, StoreError> {
    let trimmed = r.trim();
    let rest = match trimmed.split_once("://") {
        Some((_, rest)) => rest,
        None => trimmed,
    };
    let Some((algo, hex)) = rest.split_once(':') else {
        return Err(StoreError::InvalidRef(r.to_string()));
    };
    if !algo.trim().eq_ignore_ascii_case("sha256") {
        return Err(StoreError::InvalidRef(r.to_string()));
    }
    let hex = hex.trim().to_ascii_lowercase();
    if hex.len() != HEX_LEN || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(StoreError::InvalidRef(r.to_string()));
    }
    Ok(hex)
}

fn is_hex_name(name: &str) -> bool {
    name.len() == HEX_LEN && name.bytes().all(|b| b.is_ascii_hexdigit())
}

impl BlobStore {
    pub fn new(base: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base = base.into();
        fs::create_dir_all(&base)?;
        Ok(Self { base })
    }

    fn object_path(&self, hex: &str) -> PathBuf {
        self.base.join(&hex[..2]).join(hex)
    }

    /// Stores the bytes and returns their content address. Idempotent: a
    /// second put of equal bytes returns the same ref without rewriting.
    pub fn put(&self, bytes: &[u8]) -> Result<String, StoreError> {
        let hex = format!("{:x}", Sha256::digest(bytes));
        let blob_ref = format!("{REF_PREFIX}{hex}");
        let path = self.object_path(&hex);
        if path.exists() {
            return Ok(blob_ref);
        }

        let dir = path.parent().expect("object path has a parent");
        fs::create_dir_all(dir)?;
        let tmp = dir.join(format!("{TMP_PREFIX}{}", Uuid::new_v4()));
        fs::write(&tmp, bytes)?;
        if let Err(err) = fs::rename(&tmp, &path) {
            // Concurrent put of the same content may have won the rename.
            let _ = fs::remove_file(&tmp);
            if !path.exists() {
                return Err(err.into());
            }
        }
        Ok(blob_ref)
    }

    pub fn get(&self, r: &str) -> Result<Vec<u8>, StoreError> {
        let hex = parse_ref(r)?;
        match fs::read(self.object_path(&hex)) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(r.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn exists(&self, r: &str) -> Result<bool, StoreError> {
        let hex = parse_ref(r)?;
        Ok(self.object_path(&hex).exists())
    }

    /// Deletes objects that are not in the live set and whose modification
    /// time is older than `min_age`. Temporary files and names that are not
    /// full hex digests are left alone. Returns the number of deletions.
    pub fn garbage_collect(
        &self,
        live_refs: &[String],
        min_age: Duration,
    ) -> Result<usize, StoreError> {
        let live: std::collections::HashSet<String> = live_refs
            .iter()
            .filter_map(|r| parse_ref(r).ok())
            .collect();
        let cutoff = SystemTime::now().checked_sub(min_age);

        let mut deleted = 0usize;
        for prefix_entry in fs::read_dir(&self.base)? {
            let Ok(prefix_entry) = prefix_entry else {
                continue;
            };
            let prefix_path = prefix_entry.path();
            if !prefix_path.is_dir() {
                continue;
            }
            deleted += self.collect_dir(&prefix_path, &live, cutoff);
            // Drop prefix directories emptied by this pass; fails while non-empty.
            let _ = fs::remove_dir(&prefix_path);
        }
        Ok(deleted)
    }

    fn collect_dir(
        &self,
        dir: &Path,
        live: &std::collections::HashSet<String>,
        cutoff: Option<SystemTime>,
    ) -> usize {
        let Ok(entries) = fs::read_dir(dir) else {
            return 0;
        };
        let mut deleted = 0usize;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if name.starts_with(TMP_PREFIX) || !is_hex_name(name) {
                continue;
            }
            if live.contains(&name.to_ascii_lowercase()) {
                continue;
            }
            let old_enough = match (entry.metadata().and_then(|m| m.modified()), cutoff) {
                (Ok(mtime), Some(cutoff)) => mtime <= cutoff,
                (Err(_), _) => false,
                (_, None) => false,
            };
            if !old_enough {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => deleted += 1,
                Err(err) => debug!("blob gc failed to remove {name}: {err}"),
            }
        }
        deleted
    }
}

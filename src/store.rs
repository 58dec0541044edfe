//! Persistent signature store backing incremental-skip decisions.
//!
//! A signature captures a file's producing state. Two modes satisfy the same
//! contract (equal signature ⇒ the artifact is unchanged, skip is safe):
//! metadata mode hashes the modification time and length, content mode hashes
//! the file bytes. Signatures are never derived from the path itself.

use std::collections::BTreeMap;
use std::fs;
use std::time::UNIX_EPOCH;

use camino::{Utf8Path, Utf8PathBuf};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

use crate::error::StoreError;
use crate::hash::Hash32;

/// Path → signature hex string. `BTreeMap` keeps the persisted JSON stable.
pub type SignatureMap = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignatureMode {
    /// Hash of modification time and length. Cheap to compute.
    #[default]
    Metadata,
    /// Hash of the file contents.
    Content,
}

/// On-disk mapping from path to signature, loaded at run start and rewritten
/// at every quiescent checkpoint and at run end.
#[derive(Debug, Clone)]
pub struct SignatureStore {
    path: Utf8PathBuf,
    mode: SignatureMode,
}

impl SignatureStore {
    pub fn new(path: impl Into<Utf8PathBuf>, mode: SignatureMode) -> Self {
        Self {
            path: path.into(),
            mode,
        }
    }

    /// Previous run's signatures. A missing or corrupt store file reads as
    /// empty; staleness only costs a rebuild.
    pub fn load(&self) -> SignatureMap {
        match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => SignatureMap::new(),
        }
    }

    /// Persists the map, write-new-then-rename so a crash mid-write leaves
    /// the previous version intact.
    pub fn save(&self, map: &SignatureMap) -> Result<(), StoreError> {
        let tmp = Utf8PathBuf::from(format!("{}.tmp", self.path));
        let bytes = serde_json::to_vec_pretty(map)?;

        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;

        Ok(())
    }

    /// Signatures of the given paths as they are on disk right now. Paths
    /// whose artifact does not currently exist are silently omitted.
    pub fn snapshot<S>(&self, paths: &[S]) -> SignatureMap
    where
        S: AsRef<str> + Sync,
    {
        paths
            .par_iter()
            .filter_map(|path| {
                let path = path.as_ref();
                signature(Utf8Path::new(path), self.mode).map(|sig| (path.to_string(), sig))
            })
            .collect()
    }
}

fn signature(path: &Utf8Path, mode: SignatureMode) -> Option<String> {
    match mode {
        SignatureMode::Metadata => {
            let meta = fs::metadata(path).ok()?;
            let mtime = meta.modified().ok()?;
            let since = mtime.duration_since(UNIX_EPOCH).unwrap_or_default();

            let mut buf = [0u8; 24];
            buf[..8].copy_from_slice(&since.as_secs().to_le_bytes());
            buf[8..16].copy_from_slice(&u64::from(since.subsec_nanos()).to_le_bytes());
            buf[16..].copy_from_slice(&meta.len().to_le_bytes());

            Some(Hash32::hash(buf).to_hex())
        }
        SignatureMode::Content => Some(Hash32::hash_file(path).ok()?.to_hex()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf8(path: &std::path::Path) -> String {
        path.to_str().unwrap().to_string()
    }

    #[test]
    fn snapshot_omits_missing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("present");
        fs::write(&present, "x").unwrap();

        let store = SignatureStore::new("unused", SignatureMode::Metadata);
        let map = store.snapshot(&[utf8(&present), utf8(&dir.path().join("absent"))]);

        assert_eq!(map.len(), 1);
        assert!(map.contains_key(&utf8(&present)));
    }

    #[test]
    fn signatures_are_stable_until_the_file_changes() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, "one").unwrap();

        let store = SignatureStore::new("unused", SignatureMode::Metadata);
        let a = store.snapshot(&[utf8(&file)]);
        let b = store.snapshot(&[utf8(&file)]);
        assert_eq!(a, b);

        fs::write(&file, "longer content").unwrap();
        let c = store.snapshot(&[utf8(&file)]);
        assert_ne!(a, c);
    }

    #[test]
    fn content_mode_tracks_bytes_not_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, "same").unwrap();
        fs::write(&b, "same").unwrap();

        let store = SignatureStore::new("unused", SignatureMode::Content);
        let map = store.snapshot(&[utf8(&a), utf8(&b)]);
        assert_eq!(map[&utf8(&a)], map[&utf8(&b)]);
    }

    #[test]
    fn load_is_lenient_save_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = utf8(&dir.path().join("sigs.json"));
        let store = SignatureStore::new(path.clone(), SignatureMode::Metadata);

        // missing file
        assert!(store.load().is_empty());

        // corrupt file
        fs::write(&path, "{ not json").unwrap();
        assert!(store.load().is_empty());

        let mut map = SignatureMap::new();
        map.insert("a".to_string(), "sig-a".to_string());
        store.save(&map).unwrap();
        assert_eq!(store.load(), map);
    }
}

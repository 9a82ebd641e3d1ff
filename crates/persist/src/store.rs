//! File-backed snapshot library.
//!
//! Layout inside the library directory:
//! ```text
//! library.meta.json              - metadata and schema version
//! snapshots/
//!   <environment>.snapshot.cbor.zst - CBOR+zstd compressed snapshots
//! integrity/
//!   manifest.json                - per-file SHA-256, in insertion order
//! session.json                   - current environment, history, rotation cursor
//! ```

use crate::session::SessionState;
use crate::snapshot::{Snapshot, SnapshotSource};
use crate::StoreError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use worldswap_common::EnvironmentId;

/// Current schema version of the on-disk layout.
const LIBRARY_SCHEMA_VERSION: u32 = 1;

const META_FILE: &str = "library.meta.json";
const SESSION_FILE: &str = "session.json";

/// Metadata stored in library.meta.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryMeta {
    pub schema_version: u32,
    pub snapshot_count: u32,
}

/// A single entry in the integrity manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub environment: EnvironmentId,
    pub filename: String,
    pub sha256: String,
}

/// Integrity manifest. Entry order is the library's environment order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrityManifest {
    pub entries: Vec<ManifestEntry>,
}

/// File-backed snapshot library with schema versioning and integrity checking.
pub struct SnapshotLibrary {
    root: PathBuf,
    meta: LibraryMeta,
    manifest: IntegrityManifest,
}

impl SnapshotLibrary {
    /// Open or create a library at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = path.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join("snapshots"))?;
        std::fs::create_dir_all(root.join("integrity"))?;

        let meta_path = root.join(META_FILE);
        let manifest_path = root.join("integrity").join("manifest.json");

        let (meta, manifest) = if meta_path.exists() {
            let meta: LibraryMeta = serde_json::from_reader(std::fs::File::open(&meta_path)?)?;
            if meta.schema_version != LIBRARY_SCHEMA_VERSION {
                return Err(StoreError::SchemaMismatch {
                    file_version: meta.schema_version,
                    expected_version: LIBRARY_SCHEMA_VERSION,
                });
            }
            let manifest: IntegrityManifest = if manifest_path.exists() {
                serde_json::from_reader(std::fs::File::open(&manifest_path)?)?
            } else {
                IntegrityManifest::default()
            };
            (meta, manifest)
        } else {
            let meta = LibraryMeta {
                schema_version: LIBRARY_SCHEMA_VERSION,
                snapshot_count: 0,
            };
            let manifest = IntegrityManifest::default();
            serde_json::to_writer_pretty(std::fs::File::create(&meta_path)?, &meta)?;
            serde_json::to_writer_pretty(std::fs::File::create(&manifest_path)?, &manifest)?;
            (meta, manifest)
        };

        tracing::debug!(root = %root.display(), snapshots = meta.snapshot_count, "opened snapshot library");
        Ok(Self {
            root,
            meta,
            manifest,
        })
    }

    /// Write a snapshot under `id`, replacing any previous one.
    pub fn save(&mut self, id: &EnvironmentId, snapshot: &Snapshot) -> Result<(), StoreError> {
        let filename = snapshot_filename(id)?;
        let path = self.root.join("snapshots").join(&filename);

        let cbor_bytes = cbor_serialize(snapshot)?;
        let compressed = zstd_compress(&cbor_bytes)?;
        let hash = sha256_hex(&compressed);

        std::fs::write(&path, &compressed)?;

        match self
            .manifest
            .entries
            .iter_mut()
            .find(|e| &e.environment == id)
        {
            Some(entry) => entry.sha256 = hash,
            None => {
                self.manifest.entries.push(ManifestEntry {
                    environment: id.clone(),
                    filename,
                    sha256: hash,
                });
                self.meta.snapshot_count += 1;
            }
        }

        self.save_meta()?;
        self.save_manifest()?;
        tracing::debug!(environment = %id, bytes = compressed.len(), "saved snapshot");
        Ok(())
    }

    /// Load and verify the snapshot stored under `id`.
    pub fn load(&self, id: &EnvironmentId) -> Result<Snapshot, StoreError> {
        let entry = self
            .manifest
            .entries
            .iter()
            .find(|e| &e.environment == id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        let compressed = std::fs::read(self.root.join("snapshots").join(&entry.filename))?;

        let actual = sha256_hex(&compressed);
        if actual != entry.sha256 {
            return Err(StoreError::IntegrityMismatch {
                expected: entry.sha256.clone(),
                actual,
            });
        }

        let cbor_bytes = zstd_decompress(&compressed)?;
        let snapshot: Snapshot = cbor_deserialize(&cbor_bytes)?;
        if !snapshot.verify() {
            return Err(StoreError::IntegrityMismatch {
                expected: "valid snapshot hash".into(),
                actual: "snapshot hash mismatch".into(),
            });
        }
        Ok(snapshot)
    }

    /// Verify every file hash recorded in the manifest.
    pub fn verify_integrity(&self) -> Result<(), StoreError> {
        for entry in &self.manifest.entries {
            let data = std::fs::read(self.root.join("snapshots").join(&entry.filename))?;
            let actual_hash = sha256_hex(&data);
            if actual_hash != entry.sha256 {
                return Err(StoreError::IntegrityMismatch {
                    expected: entry.sha256.clone(),
                    actual: actual_hash,
                });
            }
        }
        Ok(())
    }

    /// Persist process-lifetime swap state next to the snapshots.
    pub fn save_session(&self, state: &SessionState) -> Result<(), StoreError> {
        serde_json::to_writer_pretty(
            std::fs::File::create(self.root.join(SESSION_FILE))?,
            state,
        )?;
        Ok(())
    }

    /// Previously saved swap state, or the empty state when none was saved.
    pub fn load_session(&self) -> Result<SessionState, StoreError> {
        let path = self.root.join(SESSION_FILE);
        if !path.exists() {
            return Ok(SessionState::default());
        }
        Ok(serde_json::from_reader(std::fs::File::open(path)?)?)
    }

    /// Get the path to the library root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the metadata.
    pub fn meta(&self) -> &LibraryMeta {
        &self.meta
    }

    fn save_meta(&self) -> Result<(), StoreError> {
        let path = self.root.join(META_FILE);
        serde_json::to_writer_pretty(std::fs::File::create(path)?, &self.meta)?;
        Ok(())
    }

    fn save_manifest(&self) -> Result<(), StoreError> {
        let path = self.root.join("integrity").join("manifest.json");
        serde_json::to_writer_pretty(std::fs::File::create(path)?, &self.manifest)?;
        Ok(())
    }
}

impl SnapshotSource for SnapshotLibrary {
    fn contains(&self, id: &EnvironmentId) -> bool {
        self.manifest.entries.iter().any(|e| &e.environment == id)
    }

    fn ids(&self) -> Vec<EnvironmentId> {
        self.manifest
            .entries
            .iter()
            .map(|e| e.environment.clone())
            .collect()
    }

    fn decode(&self, id: &EnvironmentId) -> Result<Snapshot, StoreError> {
        self.load(id)
    }
}

/// Environment ids become file names, so anything path-like is refused.
fn snapshot_filename(id: &EnvironmentId) -> Result<String, StoreError> {
    let name = id.as_str();
    if id.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
        return Err(StoreError::InvalidId(id.clone()));
    }
    Ok(format!("{name}.snapshot.cbor.zst"))
}

fn cbor_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, StoreError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| StoreError::CborEncode(e.to_string()))?;
    Ok(buf)
}

fn cbor_deserialize<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, StoreError> {
    ciborium::from_reader(data).map_err(|e| StoreError::CborDecode(e.to_string()))
}

fn zstd_compress(data: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut encoder = zstd::Encoder::new(Vec::new(), 3)?;
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn zstd_decompress(data: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut decoder = zstd::Decoder::new(data)?;
    let mut buf = Vec::new();
    decoder.read_to_end(&mut buf)?;
    Ok(buf)
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use worldswap_common::{BlockId, BlockPos, Region};

    fn arena(fill: u32) -> Snapshot {
        let bounds = Region::new(BlockPos::ORIGIN, BlockPos::new(3, 1, 3));
        let blocks: BTreeMap<_, _> = bounds
            .iter()
            .filter(|p| p.y == 0)
            .map(|p| (p, BlockId(fill)))
            .collect();
        Snapshot::new(bounds, blocks)
    }

    #[test]
    fn library_open_creates_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let lib = SnapshotLibrary::open(tmp.path().join("library")).unwrap();
        assert_eq!(lib.meta().snapshot_count, 0);
        assert_eq!(lib.meta().schema_version, LIBRARY_SCHEMA_VERSION);
        assert!(lib.root().join("snapshots").is_dir());
        assert!(lib.root().join("integrity").is_dir());
    }

    #[test]
    fn save_and_load_after_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("library");
        let snap = arena(3);
        {
            let mut lib = SnapshotLibrary::open(&path).unwrap();
            lib.save(&"arena1".into(), &snap).unwrap();
        }

        let lib = SnapshotLibrary::open(&path).unwrap();
        assert_eq!(lib.meta().snapshot_count, 1);
        assert!(lib.contains(&"arena1".into()));
        let loaded = lib.decode(&"arena1".into()).unwrap();
        assert_eq!(loaded, snap);
    }

    #[test]
    fn resave_replaces_without_reordering() {
        let tmp = tempfile::tempdir().unwrap();
        let mut lib = SnapshotLibrary::open(tmp.path()).unwrap();
        lib.save(&"arena1".into(), &arena(1)).unwrap();
        lib.save(&"arena2".into(), &arena(2)).unwrap();
        lib.save(&"arena1".into(), &arena(9)).unwrap();

        assert_eq!(lib.meta().snapshot_count, 2);
        assert_eq!(
            lib.ids(),
            vec![EnvironmentId::from("arena1"), EnvironmentId::from("arena2")]
        );
        let reloaded = lib.load(&"arena1".into()).unwrap();
        assert_eq!(reloaded.block_at(BlockPos::ORIGIN), Some(BlockId(9)));
        lib.verify_integrity().unwrap();
    }

    #[test]
    fn unknown_environment_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let lib = SnapshotLibrary::open(tmp.path()).unwrap();
        assert!(matches!(
            lib.load(&"nowhere".into()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn path_like_ids_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let mut lib = SnapshotLibrary::open(tmp.path()).unwrap();
        for bad in ["../escape", "a/b", "", "x\\y"] {
            assert!(matches!(
                lib.save(&bad.into(), &arena(1)),
                Err(StoreError::InvalidId(_))
            ));
        }
    }

    #[test]
    fn integrity_fail_closed_on_corruption() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("library");
        let mut lib = SnapshotLibrary::open(&path).unwrap();
        lib.save(&"arena1".into(), &arena(1)).unwrap();

        // Corrupt the snapshot file
        let snap_path = path.join("snapshots").join("arena1.snapshot.cbor.zst");
        let mut data = std::fs::read(&snap_path).unwrap();
        if let Some(byte) = data.last_mut() {
            *byte ^= 0xff;
        }
        std::fs::write(&snap_path, &data).unwrap();

        let lib = SnapshotLibrary::open(&path).unwrap();
        assert!(lib.verify_integrity().is_err());
        assert!(matches!(
            lib.decode(&"arena1".into()),
            Err(StoreError::IntegrityMismatch { .. })
        ));
    }

    #[test]
    fn session_roundtrip_and_default() {
        let tmp = tempfile::tempdir().unwrap();
        let lib = SnapshotLibrary::open(tmp.path()).unwrap();
        assert_eq!(lib.load_session().unwrap(), SessionState::default());

        let state = SessionState {
            current: Some("arena2".into()),
            history: vec!["arena1".into()],
            rotation_cursor: 1,
        };
        lib.save_session(&state).unwrap();
        assert_eq!(lib.load_session().unwrap(), state);
    }

    #[test]
    fn schema_mismatch_fail_closed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("library");
        let _lib = SnapshotLibrary::open(&path).unwrap();

        // Tamper with the meta file to have a wrong version
        let meta_path = path.join(META_FILE);
        let mut meta: LibraryMeta =
            serde_json::from_reader(std::fs::File::open(&meta_path).unwrap()).unwrap();
        meta.schema_version = 999;
        serde_json::to_writer_pretty(std::fs::File::create(&meta_path).unwrap(), &meta).unwrap();

        match SnapshotLibrary::open(&path) {
            Err(StoreError::SchemaMismatch {
                file_version,
                expected_version,
            }) => {
                assert_eq!(file_version, 999);
                assert_eq!(expected_version, LIBRARY_SCHEMA_VERSION);
            }
            Err(e) => panic!("expected SchemaMismatch, got: {e}"),
            Ok(_) => panic!("expected error, got Ok"),
        }
    }
}

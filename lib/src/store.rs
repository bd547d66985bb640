//! Provides the content-addressed on-disk store
//!
//! Every value lives under `root/<owner>/<segments...>/<digest>`, where
//! the owner is the hex identity of the node that originated the data
//! and the segments fan the digest across a directory tree to bound
//! per-directory fanout. The same net key held for two different
//! originators therefore never collides.
use crate::crypto;
use crate::errors::StashError;
use crate::identity::{NodeId, SecretKey};
use crate::pathkey::PathTransform;
use log::debug;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

pub struct Store {
    root: PathBuf,
    transform: PathTransform,
}

impl Store {
    pub fn new<P: AsRef<Path>>(root: P, transform: PathTransform) -> Store {
        Store {
            root: root.as_ref().to_path_buf(),
            transform,
        }
    }

    /// Absolute path of the value for `key` as originated by `owner`
    fn object_path(&self, owner: &NodeId, key: &[u8]) -> PathBuf {
        self.root
            .join(owner.to_hex())
            .join(self.transform.path_key(key).full_path())
    }

    /// Create the file for `key`, including all parent directories.
    /// An existing file at the same path is truncated; under the hash
    /// layout that means the same content key, so the overwrite is a
    /// semantic no-op.
    fn create_for(&self, owner: &NodeId, key: &[u8]) -> Result<File, StashError> {
        let path = self.object_path(owner, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?)
    }

    /// Copy `src` in full into the computed path. Returns the number
    /// of bytes written.
    pub fn write<R>(&self, owner: &NodeId, key: &[u8], src: &mut R) -> Result<u64, StashError>
    where
        R: Read + ?Sized,
    {
        let mut file = self.create_for(owner, key)?;
        Ok(io::copy(src, &mut file)?)
    }

    /// Same layout as `write`, but pipe `src` through the decryption
    /// codec on the way down. Returns the number of plaintext bytes
    /// written.
    pub fn write_decrypt<R>(
        &self,
        enc_key: &SecretKey,
        owner: &NodeId,
        key: &[u8],
        src: &mut R,
    ) -> Result<u64, StashError>
    where
        R: Read + ?Sized,
    {
        let mut file = self.create_for(owner, key)?;
        crypto::decrypt_copy(enc_key, src, &mut file)
    }

    /// Open the value for reading. The caller owns the returned
    /// handle and is responsible for releasing it.
    pub fn read(&self, owner: &NodeId, key: &[u8]) -> Result<(u64, File), StashError> {
        let path = self.object_path(owner, key);
        let file = File::open(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                StashError::NotFound
            } else {
                e.into()
            }
        })?;
        let size = file.metadata()?.len();
        Ok((size, file))
    }

    /// Whether the computed path exists as a regular file. Any stat
    /// failure other than not-found is reported as absent.
    pub fn has(&self, owner: &NodeId, key: &[u8]) -> bool {
        let path = self.object_path(owner, key);
        match fs::metadata(&path) {
            Ok(meta) => meta.is_file(),
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    debug!("stat {:?} failed: {}", path, e);
                }
                false
            }
        }
    }

    /// Remove the entire first-segment subtree for `key`. Simpler
    /// than file-scoped deletion; the hash layout tends to give each
    /// value a unique first segment, though two keys sharing one is
    /// possible and accepted for this layout.
    pub fn delete(&self, owner: &NodeId, key: &[u8]) -> Result<(), StashError> {
        let subtree = self
            .root
            .join(owner.to_hex())
            .join(self.transform.path_key(key).root_segment());
        match fs::remove_dir_all(&subtree) {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the entire storage root
    pub fn clear(&self) -> Result<(), StashError> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NONCE_SIZE;
    use std::io::Read;
    use tempdir::TempDir;

    fn test_store(dir: &TempDir) -> Store {
        Store::new(dir.path().join("stash_data"), PathTransform::default())
    }

    fn read_back(store: &Store, owner: &NodeId, key: &[u8]) -> Vec<u8> {
        let (size, mut file) = store.read(owner, key).unwrap();
        let mut data = Vec::new();
        file.read_to_end(&mut data).unwrap();
        assert_eq!(size as usize, data.len());
        data
    }

    #[test]
    fn test_write_read_roundtrip() {
        let dir = TempDir::new("store_roundtrip").unwrap();
        let store = test_store(&dir);
        let owner = NodeId::generate();

        let written = store
            .write(&owner, b"momsbestpicture", &mut &b"some jpg bytes"[..])
            .unwrap();
        assert_eq!(written, 14);
        assert_eq!(read_back(&store, &owner, b"momsbestpicture"), b"some jpg bytes");
    }

    #[test]
    fn test_has_and_delete() {
        let dir = TempDir::new("store_delete").unwrap();
        let store = test_store(&dir);
        let owner = NodeId::generate();

        assert!(!store.has(&owner, b"alpha"));
        store.write(&owner, b"alpha", &mut &b"one two three"[..]).unwrap();
        assert!(store.has(&owner, b"alpha"));

        store.delete(&owner, b"alpha").unwrap();
        assert!(!store.has(&owner, b"alpha"));

        // deleting again is not an error
        store.delete(&owner, b"alpha").unwrap();
    }

    #[test]
    fn test_owners_are_disjoint() {
        let dir = TempDir::new("store_owners").unwrap();
        let store = test_store(&dir);
        let a = NodeId::generate();
        let b = NodeId::generate();

        store.write(&a, b"shared", &mut &b"from a"[..]).unwrap();
        store.write(&b, b"shared", &mut &b"from b"[..]).unwrap();

        assert_eq!(read_back(&store, &a, b"shared"), b"from a");
        assert_eq!(read_back(&store, &b, b"shared"), b"from b");

        store.delete(&a, b"shared").unwrap();
        assert!(!store.has(&a, b"shared"));
        assert!(store.has(&b, b"shared"));
    }

    #[test]
    fn test_overwrite_truncates() {
        let dir = TempDir::new("store_overwrite").unwrap();
        let store = test_store(&dir);
        let owner = NodeId::generate();

        store.write(&owner, b"key", &mut &b"a much longer first value"[..]).unwrap();
        store.write(&owner, b"key", &mut &b"short"[..]).unwrap();
        assert_eq!(read_back(&store, &owner, b"key"), b"short");
    }

    #[test]
    fn test_empty_value() {
        let dir = TempDir::new("store_empty").unwrap();
        let store = test_store(&dir);
        let owner = NodeId::generate();

        assert_eq!(store.write(&owner, b"empty", &mut &b""[..]).unwrap(), 0);
        assert!(store.has(&owner, b"empty"));
        assert_eq!(read_back(&store, &owner, b"empty"), b"");
    }

    #[test]
    fn test_read_missing_is_not_found() {
        let dir = TempDir::new("store_missing").unwrap();
        let store = test_store(&dir);
        match store.read(&NodeId::generate(), b"nothere") {
            Err(StashError::NotFound) => {}
            other => panic!("expected NotFound, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_write_decrypt_pairs_with_encrypt_copy() {
        let dir = TempDir::new("store_decrypt").unwrap();
        let store = test_store(&dir);
        let owner = NodeId::generate();
        let key = SecretKey::generate();

        let plain = b"my big data file here!";
        let mut wire = Vec::new();
        crypto::encrypt_copy(&key, &mut &plain[..], &mut wire).unwrap();
        assert_eq!(wire.len(), plain.len() + NONCE_SIZE);

        let written = store
            .write_decrypt(&key, &owner, b"picture_0.png", &mut &wire[..])
            .unwrap();
        assert_eq!(written as usize, plain.len());
        assert_eq!(read_back(&store, &owner, b"picture_0.png"), plain);
    }

    #[test]
    fn test_clear_removes_root() {
        let dir = TempDir::new("store_clear").unwrap();
        let store = test_store(&dir);
        let owner = NodeId::generate();

        store.write(&owner, b"k1", &mut &b"v1"[..]).unwrap();
        store.write(&owner, b"k2", &mut &b"v2"[..]).unwrap();
        store.clear().unwrap();
        assert!(!store.has(&owner, b"k1"));
        assert!(!store.has(&owner, b"k2"));
    }
}

// tunerstore_common is the main tunerstore library implementing the protocol shared logic.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use crate::crypto::{self, KEY_SIZE};
use crate::StoreError;

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};

/// The directory all blobs live under unless configured otherwise.
pub const DEFAULT_ROOT: &str = "GGNetwork";

/// The number of hex characters per nested directory of a content address.
const PATH_BLOCK_SIZE: usize = 5;

/// A `PathKey` is the on-disk location of a blob derived from its logical key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PathKey {
    /// The nested directory part, e.g. `bdbdc/c7520/…` for a content address.
    pub path_name: String,
    /// The file name inside [`PathKey::path_name`], the full digest for a content address.
    pub file_name: String,
}

/// A `PathTransform` derives the on-disk location of a blob from its logical key.
pub trait PathTransform {
    /// Maps a logical key to a [`PathKey`].
    fn transform(&self, key: &str) -> PathKey;
}

/// Content addressing: the SHA-1 digest of the key, hex-encoded,
/// split into directories of [`PATH_BLOCK_SIZE`] characters.
/// A trailing segment shorter than the block size is discarded;
/// the 40-character SHA-1 digest yields exactly 8 full segments.
pub struct CasPathTransform;

impl PathTransform for CasPathTransform {
    fn transform(&self, key: &str) -> PathKey {
        let digest = Sha1::digest(key.as_bytes());
        let hash = hex::encode(digest);

        let segments = hash.len() / PATH_BLOCK_SIZE;
        let path_name = (0..segments)
            .map(|i| &hash[i * PATH_BLOCK_SIZE..(i + 1) * PATH_BLOCK_SIZE])
            .collect::<Vec<_>>()
            .join("/");

        PathKey {
            path_name,
            file_name: hash,
        }
    }
}

/// The identity transform: the key is both directory and file name. Useful for tests.
pub struct IdentityPathTransform;

impl PathTransform for IdentityPathTransform {
    fn transform(&self, key: &str) -> PathKey {
        PathKey {
            path_name: key.to_string(),
            file_name: key.to_string(),
        }
    }
}

/// Configuration of a [`Store`].
pub struct StoreOpts {
    /// The directory all blobs live under.
    pub root: String,
    /// Derives on-disk locations from logical keys.
    pub path_transform: Box<dyn PathTransform + Send + Sync>,
}

impl Default for StoreOpts {
    fn default() -> Self {
        Self {
            root: DEFAULT_ROOT.to_string(),
            path_transform: Box::new(IdentityPathTransform),
        }
    }
}

/// A `Store` is a streaming blob store on the local filesystem,
/// namespaced by a node id so one process can host several logical stores.
/// It keeps no in-process state; concurrent writes to the same key
/// race at filesystem granularity with the last writer winning.
pub struct Store {
    root: String,
    path_transform: Box<dyn PathTransform + Send + Sync>,
}

impl Store {
    /// Constructs a new `Store` from its configuration.
    pub fn new(opts: StoreOpts) -> Self {
        Self {
            root: opts.root,
            path_transform: opts.path_transform,
        }
    }

    fn blob_paths(&self, id: &str, key: &str) -> (PathBuf, PathBuf) {
        let path_key = self.path_transform.transform(key);

        let dir = Path::new(&self.root).join(id).join(&path_key.path_name);
        let file = dir.join(&path_key.file_name);

        (dir, file)
    }

    /// Reports whether `key` exists in the `id` namespace.
    pub fn has(&self, id: &str, key: &str) -> bool {
        if key.is_empty() {
            return false;
        }

        let (_, file) = self.blob_paths(id, key);
        file.is_file()
    }

    /// Writes `r` to the blob for `key` in the `id` namespace,
    /// creating directories as needed and truncating any previous content.
    ///
    /// Returns the number of bytes written.
    pub fn write<R: Read>(&self, id: &str, key: &str, r: &mut R) -> Result<u64, StoreError> {
        if key.is_empty() {
            return Err(StoreError::EmptyKey);
        }

        let (dir, file) = self.blob_paths(id, key);
        fs::create_dir_all(dir)?;

        let mut f = File::create(file)?;
        Ok(io::copy(r, &mut f)?)
    }

    /// Same as [`Store::write`], except the bytes written to disk
    /// are the streaming decryption of `r` (an `IV || ciphertext` sequence).
    ///
    /// Returns the number of plaintext bytes written.
    pub fn write_decrypt<R: Read>(
        &self,
        enc_key: &[u8; KEY_SIZE],
        id: &str,
        key: &str,
        r: &mut R,
    ) -> Result<u64, StoreError> {
        if key.is_empty() {
            return Err(StoreError::EmptyKey);
        }

        let (dir, file) = self.blob_paths(id, key);
        fs::create_dir_all(dir)?;

        let mut f = File::create(file)?;
        let n = crypto::copy_decrypt(enc_key, r, &mut f)?;

        Ok(n - crypto::IV_SIZE as u64)
    }

    /// Opens the blob for `key` in the `id` namespace.
    ///
    /// Returns its size in bytes and an open reader the caller owns.
    pub fn read(&self, id: &str, key: &str) -> Result<(u64, File), StoreError> {
        if key.is_empty() {
            return Err(StoreError::EmptyKey);
        }

        let (_, file) = self.blob_paths(id, key);
        let f = match File::open(file) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let size = f.metadata()?.len();
        Ok((size, f))
    }

    /// Removes the blob for `key` from the `id` namespace
    /// and prunes hash directories that just became empty.
    /// Other keys are never affected, even when they share address prefixes.
    pub fn delete(&self, id: &str, key: &str) -> Result<(), StoreError> {
        if key.is_empty() {
            return Err(StoreError::EmptyKey);
        }

        let (dir, file) = self.blob_paths(id, key);
        fs::remove_file(file)?;

        let node_dir = Path::new(&self.root).join(id);
        let mut dir = dir.as_path();
        while dir != node_dir && fs::remove_dir(dir).is_ok() {
            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }

        Ok(())
    }

    /// Removes the entire store root and every namespace under it.
    pub fn clear(&self) -> Result<(), StoreError> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{copy_encrypt, new_encryption_key, IV_SIZE};

    fn cas_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(StoreOpts {
            root: dir.path().join(DEFAULT_ROOT).to_string_lossy().into_owned(),
            path_transform: Box::new(CasPathTransform),
        });

        (dir, store)
    }

    #[test]
    fn cas_path_transform_is_deterministic() {
        let path_key = CasPathTransform.transform("MyLooks");

        assert_eq!(
            path_key.path_name,
            "bdbdc/c7520/e3730/94b7a/93d34/a7ddc/ce322/1e025"
        );
        assert_eq!(path_key.file_name, "bdbdcc7520e373094b7a93d34a7ddcce3221e025");
        assert_eq!(path_key, CasPathTransform.transform("MyLooks"));
    }

    #[test]
    fn identity_path_transform_keeps_the_key() {
        let path_key = IdentityPathTransform.transform("myPicture");

        assert_eq!(path_key.path_name, "myPicture");
        assert_eq!(path_key.file_name, "myPicture");
    }

    #[test]
    fn write_read_delete() {
        let (_dir, store) = cas_store();

        let data = b"Some jpg bytes";
        let n = store
            .write("node-1", "Dis_Nuts_0", &mut data.as_slice())
            .unwrap();
        assert_eq!(n, data.len() as u64);
        assert!(store.has("node-1", "Dis_Nuts_0"));

        let (size, mut f) = store.read("node-1", "Dis_Nuts_0").unwrap();
        assert_eq!(size, data.len() as u64);

        let mut contents = Vec::new();
        f.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, data);

        store.delete("node-1", "Dis_Nuts_0").unwrap();
        assert!(!store.has("node-1", "Dis_Nuts_0"));
    }

    #[test]
    fn namespaces_are_independent() {
        let (_dir, store) = cas_store();

        store
            .write("node-1", "shared_key", &mut b"from node-1".as_slice())
            .unwrap();
        store
            .write("node-2", "shared_key", &mut b"from node-2".as_slice())
            .unwrap();

        store.delete("node-1", "shared_key").unwrap();

        assert!(!store.has("node-1", "shared_key"));
        assert!(store.has("node-2", "shared_key"));
    }

    #[test]
    fn delete_keeps_sibling_keys() {
        let (_dir, store) = cas_store();

        store
            .write("node-1", "first", &mut b"first contents".as_slice())
            .unwrap();
        store
            .write("node-1", "second", &mut b"second contents".as_slice())
            .unwrap();

        store.delete("node-1", "first").unwrap();

        assert!(!store.has("node-1", "first"));
        assert!(store.has("node-1", "second"));
    }

    #[test]
    fn write_decrypt_restores_plaintext() {
        let (_dir, store) = cas_store();
        let key = new_encryption_key();

        let data = b"private payload";
        let mut ciphertext = Vec::new();
        copy_encrypt(&key, &mut data.as_slice(), &mut ciphertext).unwrap();

        let n = store
            .write_decrypt(&key, "node-1", "secret", &mut ciphertext.as_slice())
            .unwrap();
        assert_eq!(n, data.len() as u64);
        assert_eq!(ciphertext.len() as u64, n + IV_SIZE as u64);

        let (size, mut f) = store.read("node-1", "secret").unwrap();
        assert_eq!(size, data.len() as u64);

        let mut contents = Vec::new();
        f.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, data);
    }

    #[test]
    fn read_missing_key_is_not_found() {
        let (_dir, store) = cas_store();

        let err = store.read("node-1", "no_such_key").unwrap_err();
        assert!(matches!(err, StoreError::NotFound(key) if key == "no_such_key"));
    }

    #[test]
    fn empty_keys_are_rejected() {
        let (_dir, store) = cas_store();

        assert!(!store.has("node-1", ""));
        assert!(matches!(
            store.write("node-1", "", &mut b"data".as_slice()),
            Err(StoreError::EmptyKey)
        ));
    }

    #[test]
    fn clear_removes_the_root() {
        let (_dir, store) = cas_store();

        store
            .write("node-1", "some_key", &mut b"bytes".as_slice())
            .unwrap();
        store.clear().unwrap();

        assert!(!store.has("node-1", "some_key"));
        store.clear().unwrap();
    }
}

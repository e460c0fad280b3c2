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

use crate::CryptoError;

use std::io::{self, Read, Write};

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes256;
use ctr::Ctr128BE;
use rand::Rng;

/// AES-256 in counter mode with a big-endian full-block counter.
/// Every payload is laid out as `IV || ciphertext`, on the wire and on disk.
type Aes256Ctr = Ctr128BE<Aes256>;

/// The size of an encryption key in bytes.
pub const KEY_SIZE: usize = 32;
/// The size of the random IV prefixed to every ciphertext in bytes.
pub const IV_SIZE: usize = 16;

/// The size of data chunks to encrypt or decrypt at a time in bytes (32 KiB).
const CHUNKSIZE: usize = 32 * 1024;

/// Generates a new random 32-byte encryption key
/// using the thread-local generator of the `rand` crate.
pub fn new_encryption_key() -> [u8; KEY_SIZE] {
    let mut key = [0; KEY_SIZE];
    rand::thread_rng().fill(&mut key[..]);

    key
}

/// Encrypts `src` to `dst` under a freshly generated IV
/// that is written to `dst` ahead of the ciphertext.
///
/// Returns the total number of bytes written including the 16-byte IV.
pub fn copy_encrypt<R: Read, W: Write>(
    key: &[u8; KEY_SIZE],
    src: &mut R,
    dst: &mut W,
) -> Result<u64, CryptoError> {
    let mut iv = [0; IV_SIZE];
    rand::thread_rng().fill(&mut iv[..]);

    dst.write_all(&iv)?;

    let mut cipher = Aes256Ctr::new(key.into(), (&iv).into());
    let mut buf = [0; CHUNKSIZE];
    let mut written = IV_SIZE as u64;

    loop {
        let n = match src.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };

        cipher.apply_keystream(&mut buf[..n]);
        dst.write_all(&buf[..n])?;
        written += n as u64;
    }

    Ok(written)
}

/// Decrypts `src` to `dst` using the 16-byte IV the stream starts with.
///
/// Returns the total number of bytes processed
/// including the 16 consumed IV bytes, mirroring [`copy_encrypt`].
/// This is why announced stream sizes are always the plaintext size plus 16.
pub fn copy_decrypt<R: Read, W: Write>(
    key: &[u8; KEY_SIZE],
    src: &mut R,
    dst: &mut W,
) -> Result<u64, CryptoError> {
    let mut iv = [0; IV_SIZE];
    src.read_exact(&mut iv).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => CryptoError::ShortIvRead,
        _ => CryptoError::IoError(e),
    })?;

    let mut cipher = Aes256Ctr::new(key.into(), (&iv).into());
    let mut buf = [0; CHUNKSIZE];
    let mut written = IV_SIZE as u64;

    loop {
        let n = match src.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };

        cipher.apply_keystream(&mut buf[..n]);
        dst.write_all(&buf[..n])?;
        written += n as u64;
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_encrypt_decrypt_round_trip() {
        let payload = b"foo not barz";
        let key = new_encryption_key();

        let mut ciphertext = Vec::new();
        let nw = copy_encrypt(&key, &mut payload.as_slice(), &mut ciphertext).unwrap();

        assert_eq!(nw, (IV_SIZE + payload.len()) as u64);
        assert_eq!(ciphertext.len(), IV_SIZE + payload.len());
        assert_ne!(&ciphertext[IV_SIZE..], payload);

        let mut plaintext = Vec::new();
        let nr = copy_decrypt(&key, &mut ciphertext.as_slice(), &mut plaintext).unwrap();

        assert_eq!(nr, (IV_SIZE + payload.len()) as u64);
        assert_eq!(plaintext, payload);
    }

    #[test]
    fn copy_encrypt_fresh_iv_per_stream() {
        let payload = b"identical input";
        let key = new_encryption_key();

        let mut first = Vec::new();
        let mut second = Vec::new();
        copy_encrypt(&key, &mut payload.as_slice(), &mut first).unwrap();
        copy_encrypt(&key, &mut payload.as_slice(), &mut second).unwrap();

        assert_ne!(first, second);
    }

    #[test]
    fn copy_decrypt_rejects_short_iv() {
        let key = new_encryption_key();
        let short = [0; IV_SIZE - 1];

        let mut out = Vec::new();
        let err = copy_decrypt(&key, &mut short.as_slice(), &mut out).unwrap_err();

        assert!(matches!(err, CryptoError::ShortIvRead));
    }

    #[test]
    fn copy_encrypt_empty_stream_is_just_the_iv() {
        let key = new_encryption_key();

        let mut src: &[u8] = &[];
        let mut ciphertext = Vec::new();
        let nw = copy_encrypt(&key, &mut src, &mut ciphertext).unwrap();

        assert_eq!(nw, IV_SIZE as u64);
        assert_eq!(ciphertext.len(), IV_SIZE);
    }
}

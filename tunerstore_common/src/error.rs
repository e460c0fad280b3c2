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

use std::io;

use thiserror::Error;

/// A `CryptoError` indicates a failure encrypting or decrypting a byte stream.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The source ended before a full 16-byte IV could be read.
    #[error("Stream ended before a full IV could be read")]
    ShortIvRead,

    /// A `std::io::Error` I/O error occured.
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

/// A `StoreError` indicates a failure of a local blob store operation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The logical key is empty and cannot be addressed on disk.
    #[error("Empty keys cannot be stored")]
    EmptyKey,
    /// The requested key does not exist in the store.
    #[error("Key \"{0}\" does not exist locally")]
    NotFound(String),

    /// A `std::io::Error` I/O error occured.
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    /// The encryption or decryption of a blob failed.
    #[error("Blob encryption or decryption failure: {0}")]
    Crypto(#[from] CryptoError),
}

/// A `LocalNodeError` indicates an error condition on the current node.
#[derive(Debug, Error)]
pub enum LocalNodeError {
    /// A configuration file already exists on this node.
    #[error("Local node is already initialized")]
    ConfigExists,
    /// No configuration file exists on this node.
    #[error("Local node is not initialized")]
    ConfigUninit,
    /// The permissions on the configuration file are insecure.
    #[error("Insecure config permissions (limit access to root user!)")]
    InsecurePerms,
    /// The configured encryption key is not exactly 32 bytes long.
    #[error("Encryption key is {0} bytes long, expected 32")]
    BadKeyLength(usize),

    /// A failure of the local blob store.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A `std::io::Error` I/O error occured.
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    /// A `toml::ser::Error` TOML serialization error occured.
    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    /// A `toml::de::Error` TOML deserialization error occured.
    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
}

/// A `NetworkError` indicates an error condition on a network connection.
/// It may be a low-level connection issue or a high-level protocol error.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// None of the resolved addresses could be dialed.
    #[error("No (reachable) network addresses")]
    NoAddrs,
    /// The connection handshake was rejected.
    #[error("Connection handshake failed")]
    HandshakeFailed,
    /// The peer registration callback rejected the connection.
    #[error("New peer rejected by registration callback")]
    OnPeerRejected,
    /// A control frame did not start with a known discriminator.
    #[error("Malformed control frame (unknown discriminator {0:#04x})")]
    DecodeError(u8),
    /// A message referenced a sender that is not in the peer registry.
    #[error("Peer \"{0}\" is not registered")]
    PeerNotRegistered(String),
    /// The peer did not announce a byte stream within the deadline.
    #[error("Peer \"{0}\" did not announce a stream in time")]
    StreamTimeout(String),
    /// The requested key is absent both locally and on all connected peers.
    #[error("Key \"{0}\" not found on this node or any connected peer")]
    NotFound(String),

    /// A failure of the local blob store.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    /// The encryption or decryption of a payload stream failed.
    #[error("Payload encryption or decryption failure: {0}")]
    Crypto(#[from] CryptoError),

    /// A `std::io::Error` I/O error occured.
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    /// A bincode (de)serialization error occured.
    #[error("Bincode (de)serialization error: {0}")]
    Bincode(#[from] Box<bincode::ErrorKind>),
}

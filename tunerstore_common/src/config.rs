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

use crate::crypto::KEY_SIZE;
use crate::LocalNodeError;

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

use serde::{Deserialize, Serialize};

/// A `NodeConfig` contains the identity, storage location
/// and encryption secret of a node as well as the peers it joins at startup.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// The network address `tunerstored` binds to. The default is `[::]:20558` (dual stack).
    pub bind_addr: Option<SocketAddr>,
    /// The directory all blobs are stored under.
    pub storage_root: String,
    /// The 32-byte key encrypting every payload this node publishes.
    /// Replicas on other nodes can only be decrypted using this key.
    ///
    /// **DO NOT reuse this key across nodes as this undermines
    /// the end-to-end aspect of the encryption.**
    ///
    /// **Remember this key at all costs. Losing it makes it impossible
    /// to recover any of the replicas.**
    pub enc_key: Vec<u8>,
    /// The remote nodes to connect to at startup.
    pub bootstrap_nodes: Vec<String>,
}

impl NodeConfig {
    pub const PATH: &'static str = "/etc/tunerstore.conf";

    /// Loads the configuration file of the current machine.
    pub fn load() -> Result<Self, LocalNodeError> {
        let mut f = match File::open(Self::PATH) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(LocalNodeError::ConfigUninit)
            }
            Err(e) => return Err(e.into()),
        };

        if f.metadata()?.permissions().mode() & 0o7077 > 0 {
            return Err(LocalNodeError::InsecurePerms);
        }

        let mut s = String::new();
        f.read_to_string(&mut s)?;

        Ok(toml::from_str(&s)?)
    }

    /// Saves the configuration to the configuration file on the current machine.
    pub fn save(&self) -> Result<(), LocalNodeError> {
        let s = toml::to_string_pretty(self)?;

        let mut f = OpenOptions::new()
            .create(true)
            .read(false)
            .write(true)
            .append(false)
            .truncate(true)
            .mode(0o0600)
            .open(Self::PATH)?;

        write!(f, "{}", s)?;
        Ok(())
    }

    /// Returns the encryption key as a fixed-size array,
    /// verifying the configured length.
    pub fn encryption_key(&self) -> Result<[u8; KEY_SIZE], LocalNodeError> {
        self.enc_key
            .clone()
            .try_into()
            .map_err(|_| LocalNodeError::BadKeyLength(self.enc_key.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::new_encryption_key;

    #[test]
    fn encryption_key_requires_32_bytes() {
        let mut node_config = NodeConfig {
            bind_addr: None,
            storage_root: "GGNetwork".to_string(),
            enc_key: new_encryption_key().to_vec(),
            bootstrap_nodes: Vec::new(),
        };

        assert!(node_config.encryption_key().is_ok());

        node_config.enc_key.pop();
        assert!(matches!(
            node_config.encryption_key(),
            Err(LocalNodeError::BadKeyLength(31))
        ));
    }

    #[test]
    fn config_round_trips_through_toml() {
        let node_config = NodeConfig {
            bind_addr: Some("[::]:20558".parse().unwrap()),
            storage_root: "GGNetwork".to_string(),
            enc_key: new_encryption_key().to_vec(),
            bootstrap_nodes: vec!["replica.example.org:20558".to_string()],
        };

        let s = toml::to_string_pretty(&node_config).unwrap();
        let parsed: NodeConfig = toml::from_str(&s).unwrap();

        assert_eq!(parsed, node_config);
    }
}

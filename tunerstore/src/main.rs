// tunerstore is a tool for storing and retrieving files on a peer-to-peer network.
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

mod error;
use error::*;

use tunerstore_common::config::NodeConfig;
use tunerstore_common::conn::DEFAULT_PORT;
use tunerstore_common::crypto;
use tunerstore_common::server::{FileServer, FileServerOpts};
use tunerstore_common::store::{CasPathTransform, Store, StoreOpts, DEFAULT_ROOT};
use tunerstore_common::LocalNodeError;

use std::fs::File;
use std::io;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{process, thread};

use clap::{Parser, Subcommand};

/// How long to wait for the bootstrap connections before operating degraded.
const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Perform basic initialization of the local node.
    Init {
        /// The network address `tunerstored` binds to. The default is `[::]:20558` (dual stack).
        bind_addr: Option<SocketAddr>,
        /// The directory all blobs are stored under.
        #[arg(long)]
        storage_root: Option<String>,
        /// The remote nodes to connect to at startup.
        #[arg(long)]
        bootstrap: Vec<String>,
    },
    /// Store a file on the network under a logical key.
    Put {
        /// The file to store.
        file: PathBuf,
        /// The logical key. Defaults to the file name.
        #[arg(long)]
        key: Option<String>,
    },
    /// Retrieve a file by logical key, fetching it from peers if locally absent.
    Get {
        /// The logical key to retrieve.
        key: String,
        /// Where to write the file. Defaults to standard output.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Remove a file from the local store. Replicas on other nodes are unaffected.
    Rm {
        /// The logical key to remove.
        key: String,
    },
}

fn logic() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            bind_addr,
            storage_root,
            bootstrap,
        } => {
            if Path::new(NodeConfig::PATH).exists() {
                return Err(LocalNodeError::ConfigExists.into());
            }

            let node_config = NodeConfig {
                bind_addr,
                storage_root: storage_root.unwrap_or_else(|| DEFAULT_ROOT.to_string()),
                enc_key: crypto::new_encryption_key().to_vec(),
                bootstrap_nodes: bootstrap,
            };

            node_config.save()?;
            println!("Initialized node configuration at {}", NodeConfig::PATH);
        }
        Commands::Put { file, key } => {
            let key = match key {
                Some(key) => key,
                None => file
                    .file_name()
                    .ok_or(Error::NoFileName)?
                    .to_string_lossy()
                    .into_owned(),
            };

            let server = transient_node()?;

            let mut f = File::open(&file)?;
            let n = server.store(&key, &mut f)?;
            server.stop();

            println!("Stored {} bytes under \"{}\"", n, key);
        }
        Commands::Get { key, output } => {
            let server = transient_node()?;

            let (size, mut r) = server.get(&key)?;
            match output {
                Some(path) => {
                    let mut f = File::create(path)?;
                    io::copy(&mut r, &mut f)?;
                }
                None => {
                    let stdout = io::stdout();
                    io::copy(&mut r, &mut stdout.lock())?;
                }
            }
            server.stop();

            eprintln!("[info] Retrieved {} bytes", size);
        }
        Commands::Rm { key } => {
            let node_config = NodeConfig::load()?;

            let store = Store::new(StoreOpts {
                root: node_config.storage_root.clone(),
                path_transform: Box::new(CasPathTransform),
            });
            store.delete(&node_id(&node_config), &key)?;

            println!("Removed \"{}\"", key);
        }
    }

    Ok(())
}

fn main() {
    match logic() {
        Ok(_) => {}
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn node_id(node_config: &NodeConfig) -> String {
    node_config
        .bind_addr
        .unwrap_or(SocketAddr::new(
            IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            DEFAULT_PORT,
        ))
        .to_string()
}

/// Starts a transient node acting under the configured identity,
/// bound to an ephemeral port, and waits for the bootstrap connections.
fn transient_node() -> Result<Arc<FileServer>> {
    let node_config = NodeConfig::load()?;

    let server = Arc::new(FileServer::new(FileServerOpts {
        id: node_id(&node_config),
        enc_key: node_config.encryption_key()?,
        storage_root: node_config.storage_root.clone(),
        path_transform: Box::new(CasPathTransform),
        listen_addr: "[::]:0".to_string(),
        bootstrap_nodes: node_config.bootstrap_nodes.clone(),
    }));

    let runner = Arc::clone(&server);
    thread::spawn(move || {
        if let Err(e) = runner.start() {
            eprintln!("[warn] Node error: {}", e);
        }
    });

    let expected = node_config
        .bootstrap_nodes
        .iter()
        .filter(|addr| !addr.is_empty())
        .count();

    let deadline = Instant::now() + BOOTSTRAP_TIMEOUT;
    while server.peer_count() < expected && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(50));
    }

    if server.peer_count() < expected {
        eprintln!(
            "[warn] Only {} of {} bootstrap nodes connected",
            server.peer_count(),
            expected
        );
    }

    Ok(server)
}

// tunerstored is a tunerstore node daemon replicating files with its peers.
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
use tunerstore_common::server::{FileServer, FileServerOpts};
use tunerstore_common::store::CasPathTransform;

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::process;
use std::sync::Arc;

use clap::Parser;
use fork::Fork;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
/// Background process replicating files with the configured peers.
struct Args {
    /// Stay attached to the terminal instead of daemonizing.
    #[arg(short, long)]
    debug: bool,
}

fn main() {
    let args = Args::parse();

    if !args.debug {
        match fork::daemon(false, false) {
            Ok(Fork::Parent(_)) => process::exit(0),
            Ok(Fork::Child) => {}
            Err(e) => {
                eprintln!("Daemonization error: {}", e);
                process::exit(1);
            }
        }
    }

    match serve() {
        Ok(_) => {}
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn serve() -> Result<()> {
    let node_config = NodeConfig::load()?;

    let bind_addr = node_config.bind_addr.unwrap_or(SocketAddr::new(
        IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        DEFAULT_PORT,
    ));

    let server = Arc::new(FileServer::new(FileServerOpts {
        id: bind_addr.to_string(),
        enc_key: node_config.encryption_key()?,
        storage_root: node_config.storage_root.clone(),
        path_transform: Box::new(CasPathTransform),
        listen_addr: bind_addr.to_string(),
        bootstrap_nodes: node_config.bootstrap_nodes,
    }));

    let server2 = Arc::clone(&server);
    ctrlc::set_handler(move || {
        eprintln!("[info] Caught SIGINT, SIGTERM or SIGHUP, exiting");
        server2.stop();
    })?;

    server.start()?;
    Ok(())
}

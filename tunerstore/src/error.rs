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

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("File name could not be derived from the path")]
    NoFileName,

    #[error("An error occured on the local node: {0}")]
    LocalNode(#[from] tunerstore_common::LocalNodeError),
    #[error("A network error occured: {0}")]
    Network(#[from] tunerstore_common::NetworkError),
    #[error("Store error: {0}")]
    Store(#[from] tunerstore_common::StoreError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

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

use serde::{Deserialize, Serialize};

/// A single decoded frame as delivered to the transport consumer.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Rpc {
    /// The remote address of the connection the frame arrived on.
    pub from: String,
    /// The raw control message bytes. Empty for stream frames.
    pub payload: Vec<u8>,
    /// Whether this frame announces a raw byte stream on the same connection.
    /// The stream's length travels in the preceding control message,
    /// not in the wire format.
    pub stream: bool,
    /// Whether this frame acknowledges readiness to receive a byte stream.
    /// Ready frames are consumed by the transport and never reach the consumer.
    pub ready: bool,
}

/// A control message exchanged between nodes inside a message frame.
/// The bincode enum tag doubles as the wire type tag.
///
/// Messages aren't bound to a particular receiver role.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// Announce a replicated file. Followed by a stream of `size` payload bytes.
    StoreFile(StoreFile),
    /// Ask the receiving peer to serve a previously replicated file back.
    GetFile(GetFile),
}

/// Announce a replicated file. Followed by a stream of `size` payload bytes.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StoreFile {
    /// The logical key of the file.
    pub key: String,
    /// The length of the stream that follows: the plaintext size plus the 16-byte IV.
    pub size: u64,
}

/// Ask the receiving peer to serve a previously replicated file back.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct GetFile {
    /// The logical key of the file.
    pub key: String,
}

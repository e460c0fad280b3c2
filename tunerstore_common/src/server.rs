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

use crate::conn::{
    TcpPeer, TcpTransport, TcpTransportOpts, IDLE_TIMEOUT, INCOMING_STREAM, READ_TIMEOUT,
    RESPONSE_TIMEOUT,
};
use crate::crypto::{copy_encrypt, IV_SIZE, KEY_SIZE};
use crate::message::{GetFile, Message, Rpc, StoreFile};
use crate::store::{PathTransform, Store, StoreOpts};
use crate::NetworkError;

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex};
use std::thread;

/// Configuration of a [`FileServer`].
pub struct FileServerOpts {
    /// The identity of this node, namespacing its blobs locally and on its peers.
    /// Defaults to the listen address if empty.
    pub id: String,
    /// The 32-byte key encrypting every payload this node publishes.
    pub enc_key: [u8; KEY_SIZE],
    /// The directory all blobs are stored under.
    pub storage_root: String,
    /// Derives on-disk locations from logical keys.
    pub path_transform: Box<dyn PathTransform + Send + Sync>,
    /// The address to listen on.
    pub listen_addr: String,
    /// Known nodes to dial at startup. Empty entries are skipped.
    pub bootstrap_nodes: Vec<String>,
}

/// A `FileServer` glues the blob store to the TCP transport:
/// it keeps the peer registry, replicates local writes to every peer
/// as encrypted streams and recovers locally missing keys from the network.
pub struct FileServer {
    id: String,
    enc_key: [u8; KEY_SIZE],
    storage: Store,
    transport: Arc<TcpTransport>,
    peers: Arc<Mutex<HashMap<String, Arc<TcpPeer>>>>,
    bootstrap_nodes: Vec<String>,
    quit: AtomicBool,
}

impl FileServer {
    /// Constructs a new `FileServer`, wiring a [`TcpTransport`]
    /// to the peer registry. Nothing is bound or dialed yet.
    pub fn new(opts: FileServerOpts) -> Self {
        let peers = Arc::new(Mutex::new(HashMap::new()));

        let mut transport_opts = TcpTransportOpts::new(opts.listen_addr.clone());

        let registry = Arc::clone(&peers);
        transport_opts.on_peer = Some(Box::new(move |peer: &Arc<TcpPeer>| {
            registry
                .lock()
                .unwrap()
                .insert(peer.addr().to_string(), Arc::clone(peer));

            Ok(())
        }));

        let registry = Arc::clone(&peers);
        transport_opts.on_peer_closed = Some(Box::new(move |peer: &TcpPeer| {
            registry.lock().unwrap().remove(&peer.addr().to_string());
        }));

        let id = if opts.id.is_empty() {
            opts.listen_addr.clone()
        } else {
            opts.id
        };

        Self {
            id,
            enc_key: opts.enc_key,
            storage: Store::new(StoreOpts {
                root: opts.storage_root,
                path_transform: opts.path_transform,
            }),
            transport: TcpTransport::new(transport_opts),
            peers,
            bootstrap_nodes: opts.bootstrap_nodes,
            quit: AtomicBool::new(false),
        }
    }

    /// Returns the identity of this node.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the actually bound listen address, if listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }

    /// Returns the number of currently registered peers.
    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    /// Binds the transport, dials the bootstrap nodes and runs the main loop
    /// until [`FileServer::stop`] is called. Blocks the calling thread.
    pub fn start(&self) -> Result<(), NetworkError> {
        let bound = self.transport.listen_and_accept()?;
        eprintln!("[info] <{}> Listening", bound);

        self.bootstrap();
        self.run();

        Ok(())
    }

    /// Signals the main loop to shut down, closing the transport.
    pub fn stop(&self) {
        self.quit.store(true, Ordering::SeqCst);
        self.transport.close();
    }

    fn bootstrap(&self) {
        for addr in &self.bootstrap_nodes {
            if addr.is_empty() {
                continue;
            }

            let addr = addr.clone();
            let transport = Arc::clone(&self.transport);
            thread::spawn(move || {
                eprintln!("[info] Attempting to connect with remote {}", addr);
                if let Err(e) = transport.dial(&addr) {
                    eprintln!("[warn] Dial error: {}", e);
                }
            });
        }
    }

    fn run(&self) {
        let rx = match self.transport.take_consumer() {
            Some(rx) => rx,
            None => return,
        };

        loop {
            if self.quit.load(Ordering::SeqCst) {
                break;
            }

            match rx.recv_timeout(READ_TIMEOUT) {
                Ok(rpc) => {
                    if let Err(e) = self.handle_rpc(&rpc) {
                        eprintln!("[warn] <{}> Cannot handle message: {}", rpc.from, e);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        eprintln!("[info] File server stopped due to user quit action");
        self.transport.close();
    }

    fn handle_rpc(&self, rpc: &Rpc) -> Result<(), NetworkError> {
        let msg: Message = bincode::deserialize(&rpc.payload)?;

        match msg {
            Message::StoreFile(store_file) => self.handle_store_file(&rpc.from, store_file),
            Message::GetFile(get_file) => self.handle_get_file(&rpc.from, get_file),
        }
    }

    /// Stores an incoming replica under the publishing peer's namespace.
    /// The bytes are an opaque `IV || ciphertext` sequence only the origin can decrypt.
    fn handle_store_file(&self, from: &str, msg: StoreFile) -> Result<(), NetworkError> {
        let peer = self.peer(from)?;

        peer.send_ready()?;
        peer.await_stream(IDLE_TIMEOUT)?;

        let mut body = peer.reader().take(msg.size);
        let result = self.storage.write(from, &msg.key, &mut body);
        peer.close_stream();

        match result {
            Ok(n) if n == msg.size => {
                eprintln!(
                    "[info] <{}> Stored {} replica bytes of \"{}\"",
                    from, n, msg.key
                );
                Ok(())
            }
            Ok(n) => {
                // Partial stream; resynchronization is impossible mid-body.
                peer.close();
                Err(NetworkError::IoError(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("short replica stream: {} of {} bytes", n, msg.size),
                )))
            }
            Err(e) => {
                peer.close();
                Err(e.into())
            }
        }
    }

    /// Serves a file back to the requesting peer from its own replica namespace.
    /// A node's own plaintext blobs are never served, so everything leaving
    /// this function is an `IV || ciphertext` sequence.
    fn handle_get_file(&self, from: &str, msg: GetFile) -> Result<(), NetworkError> {
        if !self.storage.has(from, &msg.key) {
            return Err(NetworkError::NotFound(msg.key));
        }

        let (size, mut file) = self.storage.read(from, &msg.key)?;
        let peer = self.peer(from)?;

        peer.send_stream_header()?;

        let mut w = peer.writer();
        w.write_all(&size.to_le_bytes())?;
        let n = io::copy(&mut file, &mut w)?;

        eprintln!("[info] <{}> Served {} bytes of \"{}\"", from, n, msg.key);
        Ok(())
    }

    /// Writes `r` under this node's namespace and replicates it to every
    /// connected peer as a `StoreFile` announcement followed by one
    /// encrypted stream fanned out over all acknowledged connections.
    ///
    /// Returns the number of plaintext bytes stored locally.
    pub fn store<R: Read>(&self, key: &str, r: &mut R) -> Result<u64, NetworkError> {
        let mut buf = Vec::new();
        let mut tee = TeeReader::new(r, &mut buf);

        let size = self.storage.write(&self.id, key, &mut tee)?;

        let peers = self.peer_snapshot();
        if peers.is_empty() {
            return Ok(size);
        }

        let msg = Message::StoreFile(StoreFile {
            key: key.to_string(),
            size: size + IV_SIZE as u64,
        });
        let payload = bincode::serialize(&msg)?;

        for peer in &peers {
            peer.send_message(&payload)?;
        }

        // Fan out only to peers that confirmed the announcement;
        // a stalled peer is skipped instead of corrupting its frame stream.
        let mut ready = Vec::new();
        for peer in peers {
            match peer.await_ready(RESPONSE_TIMEOUT) {
                Ok(()) => ready.push(peer),
                Err(e) => eprintln!("[warn] <{}> Not ready for stream: {}", peer.addr(), e),
            }
        }

        if ready.is_empty() {
            return Ok(size);
        }

        let mut fanout = MultiWriter::new(ready.iter().map(|peer| peer.writer()).collect());
        fanout.write_all(&[INCOMING_STREAM])?;

        let mut plain = buf.as_slice();
        let n = copy_encrypt(&self.enc_key, &mut plain, &mut fanout)?;

        eprintln!(
            "[info] Replicated {} bytes of \"{}\" to {} peers",
            n,
            key,
            ready.len()
        );

        Ok(size)
    }

    /// Serves `key` from the local store,
    /// fetching it from the network first if it is locally absent.
    ///
    /// Returns the blob size and an open reader the caller owns.
    pub fn get(&self, key: &str) -> Result<(u64, File), NetworkError> {
        if self.storage.has(&self.id, key) {
            return Ok(self.storage.read(&self.id, key)?);
        }

        eprintln!(
            "[info] \"{}\" not found locally, fetching from the network",
            key
        );

        let peers = self.peer_snapshot();
        let payload = bincode::serialize(&Message::GetFile(GetFile {
            key: key.to_string(),
        }))?;

        for peer in &peers {
            peer.send_message(&payload)?;
        }

        for peer in &peers {
            if peer.await_stream(RESPONSE_TIMEOUT).is_err() {
                eprintln!("[info] <{}> No response", peer.addr());
                continue;
            }

            let result = self.recv_file(peer, key);
            peer.close_stream();

            match result {
                Ok(n) => {
                    eprintln!(
                        "[info] <{}> Received {} bytes of \"{}\"",
                        peer.addr(),
                        n,
                        key
                    );
                }
                Err(e) => {
                    eprintln!("[warn] <{}> Fetch failed: {}", peer.addr(), e);
                    peer.close();
                }
            }
        }

        if !self.storage.has(&self.id, key) {
            return Err(NetworkError::NotFound(key.to_string()));
        }

        Ok(self.storage.read(&self.id, key)?)
    }

    fn recv_file(&self, peer: &Arc<TcpPeer>, key: &str) -> Result<u64, NetworkError> {
        let mut size_buf = [0; 8];
        peer.reader().read_exact(&mut size_buf)?;
        let size = u64::from_le_bytes(size_buf);

        let mut body = peer.reader().take(size);
        let n = self
            .storage
            .write_decrypt(&self.enc_key, &self.id, key, &mut body)?;

        if n + IV_SIZE as u64 != size {
            return Err(NetworkError::IoError(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("short fetch stream: {} of {} bytes", n + IV_SIZE as u64, size),
            )));
        }

        Ok(n)
    }

    /// Reports whether `key` exists under this node's namespace.
    pub fn has(&self, key: &str) -> bool {
        self.storage.has(&self.id, key)
    }

    /// Removes `key` from this node's namespace. Replicas on peers are unaffected.
    pub fn delete(&self, key: &str) -> Result<(), NetworkError> {
        self.storage.delete(&self.id, key)?;
        Ok(())
    }

    fn peer(&self, from: &str) -> Result<Arc<TcpPeer>, NetworkError> {
        self.peers
            .lock()
            .unwrap()
            .get(from)
            .cloned()
            .ok_or_else(|| NetworkError::PeerNotRegistered(from.to_string()))
    }

    fn peer_snapshot(&self) -> Vec<Arc<TcpPeer>> {
        self.peers.lock().unwrap().values().cloned().collect()
    }
}

/// Mirrors every byte read from the inner reader into a growable buffer.
struct TeeReader<'a, R: Read> {
    inner: &'a mut R,
    copy: &'a mut Vec<u8>,
}

impl<'a, R: Read> TeeReader<'a, R> {
    fn new(inner: &'a mut R, copy: &'a mut Vec<u8>) -> Self {
        Self { inner, copy }
    }
}

impl<R: Read> Read for TeeReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.copy.extend_from_slice(&buf[..n]);

        Ok(n)
    }
}

/// Writes every buffer to all underlying writers in order,
/// failing on the first error.
struct MultiWriter<W: Write> {
    writers: Vec<W>,
}

impl<W: Write> MultiWriter<W> {
    fn new(writers: Vec<W>) -> Self {
        Self { writers }
    }
}

impl<W: Write> Write for MultiWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for w in &mut self.writers {
            w.write_all(buf)?;
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        for w in &mut self.writers {
            w.flush()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::new_encryption_key;
    use crate::store::CasPathTransform;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::time::{Duration, Instant};

    const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

    fn spawn_server(id: &str, root: &Path, bootstrap: Vec<String>) -> Arc<FileServer> {
        let server = Arc::new(FileServer::new(FileServerOpts {
            id: id.to_string(),
            enc_key: new_encryption_key(),
            storage_root: root.to_string_lossy().into_owned(),
            path_transform: Box::new(CasPathTransform),
            listen_addr: "127.0.0.1:0".to_string(),
            bootstrap_nodes: bootstrap,
        }));

        let runner = Arc::clone(&server);
        thread::spawn(move || runner.start().unwrap());

        assert!(wait_for(|| server.local_addr().is_some()));
        server
    }

    fn wait_for<F: Fn() -> bool>(cond: F) -> bool {
        let deadline = Instant::now() + SETTLE_TIMEOUT;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }

        cond()
    }

    fn find_blob(dir: &Path) -> Option<PathBuf> {
        for entry in fs::read_dir(dir).ok()? {
            let path = entry.ok()?.path();
            if path.is_file() {
                return Some(path);
            }
            if path.is_dir() {
                if let Some(found) = find_blob(&path) {
                    return Some(found);
                }
            }
        }

        None
    }

    #[test]
    fn store_and_get_without_peers() {
        let dir = tempfile::tempdir().unwrap();
        let server = spawn_server("solo", dir.path(), Vec::new());

        let data = b"standalone bytes";
        let n = server.store("lonely.txt", &mut data.as_slice()).unwrap();
        assert_eq!(n, data.len() as u64);

        let (size, mut f) = server.get("lonely.txt").unwrap();
        assert_eq!(size, data.len() as u64);

        let mut contents = Vec::new();
        f.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, data);

        server.stop();
    }

    #[test]
    fn get_of_unknown_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let server = spawn_server("solo", dir.path(), Vec::new());

        let err = server.get("no_such_key").unwrap_err();
        assert!(matches!(err, NetworkError::NotFound(key) if key == "no_such_key"));

        server.stop();
    }

    #[test]
    fn replicates_and_recovers_across_three_nodes() {
        let dir1 = tempfile::tempdir().unwrap();
        let dir2 = tempfile::tempdir().unwrap();
        let dir3 = tempfile::tempdir().unwrap();

        let s1 = spawn_server("node-1", dir1.path(), Vec::new());
        let addr1 = s1.local_addr().unwrap().to_string();

        let s2 = spawn_server("node-2", dir2.path(), vec![addr1.clone()]);
        let addr2 = s2.local_addr().unwrap().to_string();

        let s3 = spawn_server("node-3", dir3.path(), vec![addr1, addr2]);

        assert!(wait_for(|| s3.peer_count() == 2));
        assert!(wait_for(|| s1.peer_count() == 2));
        assert!(wait_for(|| s2.peer_count() == 2));

        let data = b"a thick data file";
        let n = s3.store("Picture_7.jpg", &mut data.as_slice()).unwrap();
        assert_eq!(n, data.len() as u64);

        // Both peers must end up with one ciphertext replica: IV plus payload.
        assert!(wait_for(|| find_blob(dir1.path()).is_some()));
        assert!(wait_for(|| find_blob(dir2.path()).is_some()));

        for dir in [dir1.path(), dir2.path()] {
            let replica = fs::read(find_blob(dir).unwrap()).unwrap();
            assert_eq!(replica.len(), data.len() + IV_SIZE);
            assert_ne!(&replica[IV_SIZE..], data);
        }

        s3.delete("Picture_7.jpg").unwrap();
        assert!(!s3.has("Picture_7.jpg"));

        let (size, mut f) = s3.get("Picture_7.jpg").unwrap();
        assert_eq!(size, data.len() as u64);

        let mut contents = Vec::new();
        f.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, data);

        s1.stop();
        s2.stop();
        s3.stop();
    }

    #[test]
    fn fetch_from_peers_without_the_key_times_out() {
        let dir1 = tempfile::tempdir().unwrap();
        let dir2 = tempfile::tempdir().unwrap();

        let s1 = spawn_server("node-1", dir1.path(), Vec::new());
        let addr1 = s1.local_addr().unwrap().to_string();
        let s2 = spawn_server("node-2", dir2.path(), vec![addr1]);

        assert!(wait_for(|| s2.peer_count() == 1 && s1.peer_count() == 1));

        let err = s2.get("never_stored").unwrap_err();
        assert!(matches!(err, NetworkError::NotFound(key) if key == "never_stored"));

        s1.stop();
        s2.stop();
    }
}

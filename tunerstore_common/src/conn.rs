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

use crate::message::Rpc;
use crate::NetworkError;

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Default TCP server port. Not officially reserved.
/// 558 is the sum of the ASCII codes for `tuner` and an offset to the 20000 port range.
pub const DEFAULT_PORT: u16 = 20558;

/// TCP connect timeout. Connection attempt is aborted if remote doesn't respond.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// TCP read timeout. Used as the shutdown poll tick of the accept loop,
/// the per-connection read loops and the file server's main loop.
pub const READ_TIMEOUT: Duration = Duration::from_millis(200);
/// How long a consumer waits for a peer to announce a byte stream before giving up.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_millis(500);
/// Idle deadline for raw stream reads. A peer that stalls a transfer
/// longer than this fails it instead of hanging the consumer forever.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Frame discriminator announcing a raw byte stream.
pub const INCOMING_STREAM: u8 = 0x01;
/// Frame discriminator preceding a control message payload.
pub const INCOMING_MESSAGE: u8 = 0x02;
/// Frame discriminator acknowledging readiness to receive a byte stream.
/// Sent by a node that has fully consumed a stream announcement message,
/// so the following raw bytes can never blur into the message read.
pub const INCOMING_READY: u8 = 0x03;

/// Bounded capacity of the consumer channel.
/// A full channel blocks the connection read loops rather than dropping frames.
const CONSUME_QUEUE: usize = 1024;
/// Default maximum control message payload accepted in a single frame.
const MAX_PAYLOAD: usize = 1024;

/// A `Decoder` turns bytes from a connection into a single [`Rpc`] frame.
pub trait Decoder {
    /// Reads one frame from `r` into `rpc`.
    fn decode(&self, r: &mut dyn Read, rpc: &mut Rpc) -> Result<(), NetworkError>;
}

/// The default wire codec: one discriminator byte, then for control messages
/// a single bounded read of the payload. Stream frames carry no payload;
/// their length travels in the preceding control message.
pub struct BinaryDecoder {
    /// Control payloads above this size are truncated at the wire read.
    pub max_payload: usize,
}

impl Default for BinaryDecoder {
    fn default() -> Self {
        Self {
            max_payload: MAX_PAYLOAD,
        }
    }
}

impl Decoder for BinaryDecoder {
    fn decode(&self, r: &mut dyn Read, rpc: &mut Rpc) -> Result<(), NetworkError> {
        let mut disc = [0; 1];
        r.read_exact(&mut disc)?;

        match disc[0] {
            INCOMING_STREAM => {
                rpc.stream = true;
                rpc.ready = false;
                rpc.payload.clear();

                Ok(())
            }
            INCOMING_READY => {
                rpc.stream = false;
                rpc.ready = true;
                rpc.payload.clear();

                Ok(())
            }
            INCOMING_MESSAGE => {
                let mut buf = vec![0; self.max_payload];
                let n = read_retry(r, &mut buf)?;
                buf.truncate(n);

                rpc.stream = false;
                rpc.ready = false;
                rpc.payload = buf;

                Ok(())
            }
            other => Err(NetworkError::DecodeError(other)),
        }
    }
}

/// Reads from `r` once, retrying the short shutdown-poll read timeout
/// until [`IDLE_TIMEOUT`] expires. The sockets behind `r` carry that
/// short timeout for cancellation; it must not surface mid-frame.
fn read_retry(r: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let deadline = Instant::now() + IDLE_TIMEOUT;

    loop {
        match r.read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                if Instant::now() >= deadline {
                    return Err(io::Error::from(io::ErrorKind::TimedOut));
                }
            }
            Err(e) => return Err(e),
        }
    }
}

/// A connection handshake run before a peer is registered.
pub trait Handshake {
    /// Validates a fresh connection. An error drops it.
    fn handshake(&self, peer: &TcpPeer) -> Result<(), NetworkError>;
}

/// The default handshake: accepts every connection.
pub struct NoHandshake;

impl Handshake for NoHandshake {
    fn handshake(&self, _peer: &TcpPeer) -> Result<(), NetworkError> {
        Ok(())
    }
}

/// A wait primitive coordinating the handoff of a connection between its
/// frame-decoding read loop and a consumer draining raw stream bytes.
/// The read loop announces a stream and parks; the consumer waits for the
/// announcement, drains the bytes and releases the loop.
#[derive(Default)]
struct StreamGate {
    streams: Mutex<usize>,
    cond: Condvar,
}

impl StreamGate {
    /// Announces a stream. Called by the read loop when a stream frame arrives.
    fn open(&self) {
        *self.streams.lock().unwrap() += 1;
        self.cond.notify_all();
    }

    /// Releases the read loop. Called by the consumer once the raw bytes are drained.
    fn close(&self) {
        let mut streams = self.streams.lock().unwrap();
        *streams = streams.saturating_sub(1);
        self.cond.notify_all();
    }

    /// Parks the read loop until the consumer is done or the transport closes.
    fn wait_drained(&self, closed: &AtomicBool) {
        let mut streams = self.streams.lock().unwrap();
        while *streams > 0 && !closed.load(Ordering::SeqCst) {
            let (guard, _) = self.cond.wait_timeout(streams, READ_TIMEOUT).unwrap();
            streams = guard;
        }
    }

    /// Blocks until a stream is announced. Reports whether one arrived within `timeout`.
    fn wait_open(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        let mut streams = self.streams.lock().unwrap();
        while *streams == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            let (guard, _) = self.cond.wait_timeout(streams, deadline - now).unwrap();
            streams = guard;
        }

        true
    }
}

/// A `TcpPeer` represents the remote end of an established TCP connection.
pub struct TcpPeer {
    stream: TcpStream,
    addr: SocketAddr,
    outbound: bool,
    gate: StreamGate,
    ready: StreamGate,
}

impl TcpPeer {
    fn new(stream: TcpStream, outbound: bool) -> io::Result<Self> {
        let addr = stream.peer_addr()?;

        Ok(Self {
            stream,
            addr,
            outbound,
            gate: StreamGate::default(),
            ready: StreamGate::default(),
        })
    }

    /// Returns the remote address of the connection.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Reports whether the connection was locally dialed (it is locally accepted otherwise).
    pub fn outbound(&self) -> bool {
        self.outbound
    }

    /// Writes a single control message frame: the message discriminator
    /// followed by the payload, assembled up front so it leaves in one write.
    pub fn send_message(&self, payload: &[u8]) -> Result<(), NetworkError> {
        let mut frame = Vec::with_capacity(1 + payload.len());
        frame.push(INCOMING_MESSAGE);
        frame.extend_from_slice(payload);

        (&self.stream).write_all(&frame)?;
        Ok(())
    }

    /// Writes the stream discriminator announcing that raw payload bytes follow.
    pub fn send_stream_header(&self) -> Result<(), NetworkError> {
        (&self.stream).write_all(&[INCOMING_STREAM])?;
        Ok(())
    }

    /// Acknowledges a stream announcement message, telling the peer
    /// that the raw bytes may follow.
    pub fn send_ready(&self) -> Result<(), NetworkError> {
        (&self.stream).write_all(&[INCOMING_READY])?;
        Ok(())
    }

    /// Blocks until the peer acknowledges a stream announcement,
    /// consuming one acknowledgment.
    pub fn await_ready(&self, timeout: Duration) -> Result<(), NetworkError> {
        if self.ready.wait_open(timeout) {
            self.ready.close();
            Ok(())
        } else {
            Err(NetworkError::StreamTimeout(self.addr.to_string()))
        }
    }

    /// Returns a writer for raw stream bytes.
    pub fn writer(&self) -> &TcpStream {
        &self.stream
    }

    /// Returns a reader for raw stream bytes. It retries the short
    /// shutdown-poll read timeout up to [`IDLE_TIMEOUT`] per read.
    ///
    /// Only safe to use between [`TcpPeer::await_stream`]
    /// and [`TcpPeer::close_stream`] while the read loop is parked.
    pub fn reader(&self) -> PeerReader<'_> {
        PeerReader {
            stream: &self.stream,
        }
    }

    /// Blocks until the read loop has decoded a stream announcement and parked,
    /// making the raw bytes that follow safe to read through [`TcpPeer::reader`].
    pub fn await_stream(&self, timeout: Duration) -> Result<(), NetworkError> {
        if self.gate.wait_open(timeout) {
            Ok(())
        } else {
            Err(NetworkError::StreamTimeout(self.addr.to_string()))
        }
    }

    /// Signals that the raw byte stream is fully drained, resuming the read loop.
    pub fn close_stream(&self) {
        self.gate.close();
    }

    /// Shuts the connection down in both directions.
    pub fn close(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Raw stream reader of a [`TcpPeer`]. See [`TcpPeer::reader`].
pub struct PeerReader<'a> {
    stream: &'a TcpStream,
}

impl Read for PeerReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut stream = self.stream;
        read_retry(&mut stream, buf)
    }
}

/// Callback invoked with each new peer, post-handshake and before its read loop.
/// An error drops the connection.
pub type OnPeer = Box<dyn Fn(&Arc<TcpPeer>) -> Result<(), NetworkError> + Send + Sync>;
/// Callback invoked when a registered peer's connection handler exits.
pub type OnPeerClosed = Box<dyn Fn(&TcpPeer) + Send + Sync>;

/// Configuration of a [`TcpTransport`].
pub struct TcpTransportOpts {
    /// The address to listen on.
    pub listen_addr: String,
    /// The connection handshake. The default accepts everything.
    pub handshake: Box<dyn Handshake + Send + Sync>,
    /// The wire codec.
    pub decoder: Box<dyn Decoder + Send + Sync>,
    /// Peer registration callback.
    pub on_peer: Option<OnPeer>,
    /// Peer deregistration callback.
    pub on_peer_closed: Option<OnPeerClosed>,
}

impl TcpTransportOpts {
    /// Returns the default configuration for the given listen address.
    pub fn new(listen_addr: String) -> Self {
        Self {
            listen_addr,
            handshake: Box::new(NoHandshake),
            decoder: Box::new(BinaryDecoder::default()),
            on_peer: None,
            on_peer_closed: None,
        }
    }
}

/// A `TcpTransport` accepts and dials connections and decodes their frames
/// onto a single bounded consumer channel. Stream frames never reach the
/// channel; they park the connection's read loop until the consumer
/// has drained the raw bytes that follow them.
pub struct TcpTransport {
    opts: TcpTransportOpts,
    bound: Mutex<Option<SocketAddr>>,
    rpc_tx: SyncSender<Rpc>,
    rpc_rx: Mutex<Option<Receiver<Rpc>>>,
    closed: AtomicBool,
}

impl TcpTransport {
    /// Constructs a new `TcpTransport` from its configuration.
    pub fn new(opts: TcpTransportOpts) -> Arc<Self> {
        let (rpc_tx, rpc_rx) = mpsc::sync_channel(CONSUME_QUEUE);

        Arc::new(Self {
            opts,
            bound: Mutex::new(None),
            rpc_tx,
            rpc_rx: Mutex::new(Some(rpc_rx)),
            closed: AtomicBool::new(false),
        })
    }

    /// Returns the configured listen address.
    pub fn addr(&self) -> &str {
        &self.opts.listen_addr
    }

    /// Returns the actually bound listen address, if listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.lock().unwrap()
    }

    /// Takes the consumer end of the frame channel. It can only be taken once.
    pub fn take_consumer(&self) -> Option<Receiver<Rpc>> {
        self.rpc_rx.lock().unwrap().take()
    }

    /// Binds the listen address and accepts connections on a background thread.
    /// Returns the bound address.
    pub fn listen_and_accept(self: &Arc<Self>) -> Result<SocketAddr, NetworkError> {
        let listener = TcpListener::bind(&self.opts.listen_addr)?;
        listener.set_nonblocking(true)?;

        let bound = listener.local_addr()?;
        *self.bound.lock().unwrap() = Some(bound);

        let transport = Arc::clone(self);
        thread::spawn(move || transport.accept_loop(listener));

        Ok(bound)
    }

    fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let transport = Arc::clone(&self);
                    thread::spawn(move || transport.handle_conn(stream, false));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if self.closed.load(Ordering::SeqCst) {
                        break;
                    } else {
                        thread::sleep(READ_TIMEOUT);
                    }
                }
                Err(e) => {
                    eprintln!("[warn] TCP accept error: {}", e);
                }
            }
        }
    }

    /// Establishes an outbound connection to `addr` on a background thread,
    /// iterating over the resolved addresses until one succeeds.
    pub fn dial(self: &Arc<Self>, addr: &str) -> Result<(), NetworkError> {
        let addrs: Vec<SocketAddr> = addr.to_socket_addrs()?.collect();
        if addrs.is_empty() {
            return Err(NetworkError::NoAddrs);
        }

        let mut stream = None;
        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => last_err = Some(e),
            }
        }

        let stream = match stream {
            Some(stream) => stream,
            None => {
                return Err(last_err
                    .map(NetworkError::from)
                    .unwrap_or(NetworkError::NoAddrs))
            }
        };

        let transport = Arc::clone(self);
        thread::spawn(move || transport.handle_conn(stream, true));

        Ok(())
    }

    fn handle_conn(&self, stream: TcpStream, outbound: bool) {
        if let Err(e) = stream.set_read_timeout(Some(READ_TIMEOUT)) {
            eprintln!("[warn] Cannot configure connection: {}", e);
            return;
        }

        let peer = match TcpPeer::new(stream, outbound) {
            Ok(peer) => Arc::new(peer),
            Err(e) => {
                eprintln!("[warn] Cannot identify connection: {}", e);
                return;
            }
        };

        let direction = if outbound { "outbound" } else { "inbound" };
        eprintln!("[info] <{}> New {} connection", peer.addr(), direction);

        if let Err(e) = self.opts.handshake.handshake(&peer) {
            eprintln!("[warn] <{}> Handshake failed: {}", peer.addr(), e);
            peer.close();
            return;
        }

        if let Some(on_peer) = &self.opts.on_peer {
            if let Err(e) = on_peer(&peer) {
                eprintln!("[warn] <{}> Peer rejected: {}", peer.addr(), e);
                peer.close();
                return;
            }
        }

        self.read_loop(&peer);

        if let Some(on_peer_closed) = &self.opts.on_peer_closed {
            on_peer_closed(&peer);
        }

        peer.close();
        eprintln!("[info] <{}> Disconnected", peer.addr());
    }

    fn read_loop(&self, peer: &Arc<TcpPeer>) {
        let mut rpc = Rpc::default();

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return;
            }

            let mut stream: &TcpStream = &peer.stream;
            match self.opts.decoder.decode(&mut stream, &mut rpc) {
                Ok(()) => {}
                // The shutdown poll tick. A TimedOut is not one: it means a
                // frame stalled mid-payload and the boundary is lost.
                Err(NetworkError::IoError(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                    continue;
                }
                Err(NetworkError::DecodeError(disc)) => {
                    eprintln!(
                        "[warn] <{}> Dropping malformed frame ({:#04x})",
                        peer.addr(),
                        disc
                    );
                    continue;
                }
                Err(e) => {
                    if !is_clean_eof(&e) {
                        eprintln!("[warn] <{}> Connection error: {}", peer.addr(), e);
                    }
                    return;
                }
            }

            if rpc.ready {
                peer.ready.open();
                continue;
            }

            if rpc.stream {
                peer.gate.open();
                peer.gate.wait_drained(&self.closed);
                continue;
            }

            let mut out = std::mem::take(&mut rpc);
            out.from = peer.addr().to_string();
            if self.rpc_tx.send(out).is_err() {
                return;
            }
        }
    }

    /// Closes the transport. The accept loop and every connection loop
    /// observe the flag within one poll tick and exit; in-flight
    /// connections are dropped.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn is_clean_eof(e: &NetworkError) -> bool {
    matches!(e, NetworkError::IoError(io_e)
        if io_e.kind() == io::ErrorKind::UnexpectedEof
            || io_e.kind() == io::ErrorKind::ConnectionReset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::mpsc::channel;
    use std::time::Duration;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn decode_message_frame() {
        let mut rpc = Rpc::default();
        let bytes = [INCOMING_MESSAGE, 0x05, b'h', b'e', b'l', b'l', b'o'];

        BinaryDecoder::default()
            .decode(&mut Cursor::new(&bytes[..]), &mut rpc)
            .unwrap();

        assert!(!rpc.stream);
        assert_eq!(rpc.payload, [0x05, b'h', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn decode_stream_frame() {
        let mut rpc = Rpc::default();
        let bytes = [INCOMING_STREAM];

        BinaryDecoder::default()
            .decode(&mut Cursor::new(&bytes[..]), &mut rpc)
            .unwrap();

        assert!(rpc.stream);
        assert!(rpc.payload.is_empty());
    }

    #[test]
    fn decode_rejects_unknown_discriminator() {
        let mut rpc = Rpc::default();
        let bytes = [0x00, 0xff];

        let err = BinaryDecoder::default()
            .decode(&mut Cursor::new(&bytes[..]), &mut rpc)
            .unwrap_err();

        assert!(matches!(err, NetworkError::DecodeError(0x00)));
    }

    #[test]
    fn decode_truncates_at_max_payload() {
        let mut rpc = Rpc::default();
        let bytes = [INCOMING_MESSAGE, b'a', b'b', b'c', b'd', b'e', b'f'];

        BinaryDecoder { max_payload: 4 }
            .decode(&mut Cursor::new(&bytes[..]), &mut rpc)
            .unwrap();

        assert_eq!(rpc.payload, b"abcd");
    }

    #[test]
    fn transport_delivers_messages() {
        let listening = TcpTransport::new(TcpTransportOpts::new("127.0.0.1:0".to_string()));
        let bound = listening.listen_and_accept().unwrap();
        let rx = listening.take_consumer().unwrap();

        let (peer_tx, peer_rx) = channel();
        let mut dialing_opts = TcpTransportOpts::new("127.0.0.1:0".to_string());
        dialing_opts.on_peer = Some(Box::new(move |peer| {
            peer_tx.send(Arc::clone(peer)).unwrap();
            Ok(())
        }));
        let dialing = TcpTransport::new(dialing_opts);

        dialing.dial(&bound.to_string()).unwrap();
        let peer = peer_rx.recv_timeout(TEST_TIMEOUT).unwrap();
        assert!(peer.outbound());

        peer.send_message(b"hello").unwrap();

        let rpc = rx.recv_timeout(TEST_TIMEOUT).unwrap();
        assert!(!rpc.stream);
        assert_eq!(rpc.payload, b"hello");
        assert_eq!(rpc.from, peer.writer().local_addr().unwrap().to_string());

        listening.close();
        dialing.close();
    }

    #[test]
    fn stream_handoff_parks_and_resumes_the_read_loop() {
        let (accepted_tx, accepted_rx) = channel();
        let mut listening_opts = TcpTransportOpts::new("127.0.0.1:0".to_string());
        listening_opts.on_peer = Some(Box::new(move |peer| {
            accepted_tx.send(Arc::clone(peer)).unwrap();
            Ok(())
        }));
        let listening = TcpTransport::new(listening_opts);
        let bound = listening.listen_and_accept().unwrap();
        let rx = listening.take_consumer().unwrap();

        let (peer_tx, peer_rx) = channel();
        let mut dialing_opts = TcpTransportOpts::new("127.0.0.1:0".to_string());
        dialing_opts.on_peer = Some(Box::new(move |peer| {
            peer_tx.send(Arc::clone(peer)).unwrap();
            Ok(())
        }));
        let dialing = TcpTransport::new(dialing_opts);

        dialing.dial(&bound.to_string()).unwrap();
        let remote = peer_rx.recv_timeout(TEST_TIMEOUT).unwrap();
        let accepted = accepted_rx.recv_timeout(TEST_TIMEOUT).unwrap();
        assert!(!accepted.outbound());

        remote.send_message(b"announce").unwrap();

        let rpc = rx.recv_timeout(TEST_TIMEOUT).unwrap();
        assert_eq!(rpc.payload, b"announce");

        accepted.send_ready().unwrap();
        remote.await_ready(TEST_TIMEOUT).unwrap();

        remote.send_stream_header().unwrap();
        {
            let mut w = remote.writer();
            w.write_all(b"world").unwrap();
        }

        accepted.await_stream(TEST_TIMEOUT).unwrap();
        let mut body = [0; 5];
        accepted.reader().read_exact(&mut body).unwrap();
        assert_eq!(&body, b"world");
        accepted.close_stream();

        remote.send_message(b"after").unwrap();
        let rpc = rx.recv_timeout(TEST_TIMEOUT).unwrap();
        assert_eq!(rpc.payload, b"after");

        listening.close();
        dialing.close();
    }
}

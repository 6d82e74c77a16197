//! Audio frame transport over TCP.
//!
//! Frames travel length-prefixed so a partial read can never silently
//! corrupt sample data:
//!
//! ```text
//! +------------+-------------+------------+----------------------+
//! | magic u16  | length u32  | seq u64    | samples f32 LE * n   |
//! | big-endian | big-endian  | big-endian | (length bytes)       |
//! +------------+-------------+------------+----------------------+
//! ```
//!
//! `length` counts the payload bytes after the sequence field. Samples are
//! mono f32, so a loopback round trip is bit-exact. A forward sequence jump
//! means frames were dropped upstream and is reported to the caller as a
//! gap; a non-increasing sequence, bad magic, or oversized length is
//! `Corrupt`. EOF, including one that truncates a frame at stream end, is a
//! clean `Eof`; reset-class socket errors are `ConnectionLost`.

use crate::device::CancelToken;
use crate::diag;
use crate::error::TransportError;
use crate::frame::AudioFrame;
use byteorder::{BigEndian, ByteOrder, LittleEndian, WriteBytesExt};
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Wire magic prefixed to every frame.
pub const WIRE_MAGIC: u16 = 0xA5E0;

/// Sanity cap on one frame's payload.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

const HEADER_BYTES: usize = 2 + 4 + 8;

/// Outcome of one `receive()` call.
#[derive(Debug)]
pub enum Received {
    Frame {
        frame: AudioFrame,
        /// Frames missing before this one (dropped upstream).
        missing: u64,
    },
    /// Clean end of stream.
    Eof,
}

/// RAII bump of the open-connection counter.
#[derive(Debug)]
struct ConnectionGuard(());

impl ConnectionGuard {
    fn acquire() -> Self {
        diag::connection_opened();
        Self(())
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        diag::connection_closed();
    }
}

/// Cloned socket handle that unblocks a peer stuck in a blocking call.
pub struct LinkShutdown {
    stream: TcpStream,
}

impl LinkShutdown {
    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
    (host, port)
        .to_socket_addrs()
        .map_err(|err| TransportError::Connect(format!("{host}:{port}: {err}")))?
        .next()
        .ok_or_else(|| TransportError::Connect(format!("{host}:{port}: no address")))
}

fn is_reset(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
    )
}

/// Sending half: connects to the callee and streams frames in order.
#[derive(Debug)]
pub struct FrameSender {
    stream: TcpStream,
    _guard: ConnectionGuard,
}

impl FrameSender {
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self, TransportError> {
        let addr = resolve(host, port)?;
        let stream = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|err| TransportError::Connect(format!("{addr}: {err}")))?;
        let _ = stream.set_nodelay(true);
        tracing::info!("transport connected to {addr}");
        Ok(Self {
            stream,
            _guard: ConnectionGuard::acquire(),
        })
    }

    pub fn send(&mut self, frame: &AudioFrame) -> Result<(), TransportError> {
        let payload_len = frame.samples.len() * 4;
        if payload_len > MAX_FRAME_BYTES {
            return Err(TransportError::Send(format!(
                "frame payload {payload_len} exceeds {MAX_FRAME_BYTES} bytes"
            )));
        }
        let mut buf = Vec::with_capacity(HEADER_BYTES + payload_len);
        // Writing into a Vec cannot fail; the map_err keeps the types honest.
        let io = |err: std::io::Error| TransportError::Send(err.to_string());
        buf.write_u16::<BigEndian>(WIRE_MAGIC).map_err(io)?;
        buf.write_u32::<BigEndian>(payload_len as u32).map_err(io)?;
        buf.write_u64::<BigEndian>(frame.seq).map_err(io)?;
        for sample in &frame.samples {
            buf.write_f32::<LittleEndian>(*sample).map_err(io)?;
        }
        self.stream.write_all(&buf).map_err(|err| {
            if is_reset(err.kind()) {
                TransportError::ConnectionLost(err.to_string())
            } else {
                TransportError::Send(err.to_string())
            }
        })
    }

    /// Handle for `stop()` to unblock a send in flight from another thread.
    pub fn shutdown_handle(&self) -> Result<LinkShutdown, TransportError> {
        let stream = self
            .stream
            .try_clone()
            .map_err(|err| TransportError::Send(err.to_string()))?;
        Ok(LinkShutdown { stream })
    }

    /// Clean disconnect: the peer observes `Eof`.
    pub fn disconnect(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Listening half of the callee: accepts one connection at a time.
pub struct FrameListener {
    listener: TcpListener,
    cancel: CancelToken,
    poll: Duration,
    sample_rate: u32,
    _guard: ConnectionGuard,
}

impl FrameListener {
    /// Bind a non-blocking listener; `accept()` polls it cancellably.
    pub fn bind(
        host: &str,
        port: u16,
        sample_rate: u32,
        poll: Duration,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind((host, port))
            .map_err(|err| TransportError::Listen(format!("{host}:{port}: {err}")))?;
        listener
            .set_nonblocking(true)
            .map_err(|err| TransportError::Listen(err.to_string()))?;
        Ok(Self {
            listener,
            cancel: CancelToken::new(),
            poll,
            sample_rate,
            _guard: ConnectionGuard::acquire(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.listener
            .local_addr()
            .map_err(|err| TransportError::Listen(err.to_string()))
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Block until a caller connects or the token is cancelled.
    pub fn accept(&self) -> Result<FrameReceiver, TransportError> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    tracing::info!("transport accepted connection from {peer}");
                    return FrameReceiver::new(stream, self.sample_rate, self.poll);
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    std::thread::sleep(self.poll.min(Duration::from_millis(50)));
                }
                Err(err) => return Err(TransportError::Listen(err.to_string())),
            }
        }
    }
}

enum ReadOutcome {
    Complete,
    Eof,
}

/// Receiving half: reassembles frames and tracks sequence continuity.
pub struct FrameReceiver {
    stream: TcpStream,
    sample_rate: u32,
    last_seq: Option<u64>,
    cancel: CancelToken,
    _guard: ConnectionGuard,
}

impl FrameReceiver {
    fn new(stream: TcpStream, sample_rate: u32, poll: Duration) -> Result<Self, TransportError> {
        stream
            .set_nonblocking(false)
            .map_err(|err| TransportError::ConnectionLost(err.to_string()))?;
        stream
            .set_read_timeout(Some(poll))
            .map_err(|err| TransportError::ConnectionLost(err.to_string()))?;
        Ok(Self {
            stream,
            sample_rate,
            last_seq: None,
            cancel: CancelToken::new(),
            _guard: ConnectionGuard::acquire(),
        })
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn shutdown_handle(&self) -> Result<LinkShutdown, TransportError> {
        let stream = self
            .stream
            .try_clone()
            .map_err(|err| TransportError::ConnectionLost(err.to_string()))?;
        Ok(LinkShutdown { stream })
    }

    /// Block until the next complete frame, EOF, cancellation, or error.
    pub fn receive(&mut self) -> Result<Received, TransportError> {
        let mut header = [0u8; HEADER_BYTES];
        match self.read_fully(&mut header)? {
            ReadOutcome::Eof => return Ok(Received::Eof),
            ReadOutcome::Complete => {}
        }

        let magic = BigEndian::read_u16(&header[0..2]);
        if magic != WIRE_MAGIC {
            return Err(TransportError::Corrupt(format!(
                "bad magic 0x{magic:04X}"
            )));
        }
        let payload_len = BigEndian::read_u32(&header[2..6]) as usize;
        if payload_len == 0 || payload_len > MAX_FRAME_BYTES || payload_len % 4 != 0 {
            return Err(TransportError::Corrupt(format!(
                "implausible payload length {payload_len}"
            )));
        }
        let seq = BigEndian::read_u64(&header[6..14]);
        let missing = match self.last_seq {
            Some(last) if seq <= last => {
                return Err(TransportError::Corrupt(format!(
                    "sequence went backwards: {seq} after {last}"
                )));
            }
            Some(last) => seq - last - 1,
            // Frames dropped before the first delivery also count as a gap.
            None => seq,
        };

        let mut payload = vec![0u8; payload_len];
        match self.read_fully(&mut payload)? {
            // Truncated at stream end: the stream is over, not corrupt.
            ReadOutcome::Eof => return Ok(Received::Eof),
            ReadOutcome::Complete => {}
        }
        self.last_seq = Some(seq);

        let mut samples = Vec::with_capacity(payload_len / 4);
        for chunk in payload.chunks_exact(4) {
            samples.push(LittleEndian::read_f32(chunk));
        }
        Ok(Received::Frame {
            frame: AudioFrame::new(seq, self.sample_rate, samples),
            missing,
        })
    }

    fn read_fully(&mut self, buf: &mut [u8]) -> Result<ReadOutcome, TransportError> {
        let mut filled = 0usize;
        while filled < buf.len() {
            if self.cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => return Ok(ReadOutcome::Eof),
                Ok(n) => filled += n,
                Err(err)
                    if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                {
                    continue;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    return Err(TransportError::ConnectionLost(err.to_string()));
                }
            }
        }
        Ok(ReadOutcome::Complete)
    }
}

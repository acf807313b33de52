// Part of ethercat-motion. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Command/status transport.
//!
//! Records cross the process boundary as opaque byte frames: a `u32` LE
//! length prefix followed by a bincode payload.  The worker side never
//! blocks: its command pipe is O_NONBLOCK and drained incrementally, and
//! status frames are dropped (latest-wins) when the pipe is full.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::os::unix::io::RawFd;

use byteorder::{ByteOrder, LittleEndian as LE, WriteBytesExt};
use crossbeam_channel::{Receiver, Sender};
use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::command::Command;
use crate::status::NetworkStatus;
use crate::{Error, Result};

/// Frames larger than this indicate a desynchronised stream.
pub const MAX_FRAME: usize = 1 << 20;

/// Engine-side command feed; implementations must never block.
pub trait CommandSource {
    fn try_next(&mut self) -> Option<Command>;
    /// The producing side is gone; the worker should shut down.
    fn closed(&self) -> bool {
        false
    }
}

/// Engine-side status outlet; implementations must never block.
pub trait StatusSink {
    fn publish(&mut self, status: &NetworkStatus);
}

/// In-process endpoints (tests, single-process embedding).
pub struct ChannelCommands(pub Receiver<Command>);

impl CommandSource for ChannelCommands {
    fn try_next(&mut self) -> Option<Command> {
        self.0.try_recv().ok()
    }
}

pub struct ChannelStatus(pub Sender<NetworkStatus>);

impl StatusSink for ChannelStatus {
    fn publish(&mut self, status: &NetworkStatus) {
        // Bounded channel; a full queue drops the snapshot.
        let _ = self.0.try_send(status.clone());
    }
}

/// Latest-wins insert: on a full queue, drop the oldest entry.
pub fn offer_latest(tx: &Sender<NetworkStatus>, rx: &Receiver<NetworkStatus>, st: NetworkStatus) {
    if let Err(crossbeam_channel::TrySendError::Full(st)) = tx.try_send(st) {
        let _ = rx.try_recv();
        let _ = tx.try_send(st);
    }
}

pub fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let payload = bincode::serialize(value)?;
    if payload.len() > MAX_FRAME {
        return Err(Error::Codec(format!("frame too large: {}", payload.len())));
    }
    let mut out = Vec::with_capacity(4 + payload.len());
    out.write_u32::<LE>(payload.len() as u32)?;
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Incremental frame parser over any reader.
pub struct FrameReader<R: Read> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
        }
    }

    fn take_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = LE::read_u32(&self.buf[..4]) as usize;
        if len > MAX_FRAME {
            return Err(Error::Codec(format!("oversized frame: {}", len)));
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        let value = bincode::deserialize(&self.buf[4..4 + len])?;
        self.buf.drain(..4 + len);
        Ok(Some(value))
    }

    /// Blocking read of exactly one frame.
    pub fn read_frame<T: DeserializeOwned>(&mut self) -> Result<T> {
        loop {
            if let Some(v) = self.take_frame()? {
                return Ok(v);
            }
            let mut chunk = [0u8; 4096];
            match self.inner.read(&mut chunk) {
                Ok(0) => return Err(Error::WorkerGone("stream closed".into())),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Non-blocking poll: pulls whatever the pipe has and returns a frame
    /// once one is complete.  `Ok(None)` means "nothing yet".
    pub fn poll_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        loop {
            if let Some(v) = self.take_frame()? {
                return Ok(Some(v));
            }
            let mut chunk = [0u8; 4096];
            match self.inner.read(&mut chunk) {
                Ok(0) => return Err(Error::WorkerGone("stream closed".into())),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Blocking frame writer (application side).
pub struct FrameWriter<W: Write> {
    inner: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn write_frame<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let frame = encode_frame(value)?;
        self.inner.write_all(&frame)?;
        self.inner.flush()?;
        Ok(())
    }
}

/// Worker-side command feed over the (non-blocking) command pipe.
pub struct PipeCommands<R: Read> {
    reader: FrameReader<R>,
    queue: VecDeque<Command>,
    closed: bool,
}

impl<R: Read> PipeCommands<R> {
    pub fn new(reader: FrameReader<R>) -> Self {
        Self {
            reader,
            queue: VecDeque::new(),
            closed: false,
        }
    }
}

impl<R: Read> CommandSource for PipeCommands<R> {
    fn try_next(&mut self) -> Option<Command> {
        if self.queue.is_empty() && !self.closed {
            loop {
                match self.reader.poll_frame::<Command>() {
                    Ok(Some(cmd)) => self.queue.push_back(cmd),
                    Ok(None) => break,
                    Err(e) => {
                        warn!("command pipe closed: {}", e);
                        self.closed = true;
                        break;
                    }
                }
            }
        }
        self.queue.pop_front()
    }

    fn closed(&self) -> bool {
        self.closed
    }
}

/// Worker-side status outlet over the (non-blocking) status pipe.
///
/// A frame is written atomically from the reader's point of view: once a
/// frame is partially on the pipe it is always completed before another
/// starts.  A complete frame that never started going out is replaced by a
/// newer snapshot (latest-wins).
pub struct PipeStatus<W: Write> {
    inner: W,
    pending: Vec<u8>,
    sent: usize,
}

impl<W: Write> PipeStatus<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            pending: Vec::new(),
            sent: 0,
        }
    }

    fn flush_pending(&mut self) {
        while self.sent < self.pending.len() {
            match self.inner.write(&self.pending[self.sent..]) {
                Ok(0) => break,
                Ok(n) => self.sent += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!("status pipe error: {}", e);
                    break;
                }
            }
        }
        if self.sent == self.pending.len() {
            self.pending.clear();
            self.sent = 0;
        }
    }
}

impl<W: Write> StatusSink for PipeStatus<W> {
    fn publish(&mut self, status: &NetworkStatus) {
        let frame = match encode_frame(status) {
            Ok(f) => f,
            Err(e) => {
                warn!("status encode failed: {}", e);
                return;
            }
        };
        self.flush_pending();
        if self.pending.is_empty() || self.sent == 0 {
            self.pending = frame;
            self.sent = 0;
            self.flush_pending();
        }
        // Otherwise a frame is mid-flight; this snapshot is dropped.
    }
}

/// Put a file descriptor into non-blocking mode.
pub fn set_nonblocking(fd: RawFd) -> Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(io::Error::from)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use std::io::Cursor;

    /// Reader yielding predefined chunks, then WouldBlock forever.
    struct Chunked {
        chunks: VecDeque<Vec<u8>>,
    }

    impl Read for Chunked {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.chunks.pop_front() {
                Some(c) => {
                    buf[..c.len()].copy_from_slice(&c);
                    Ok(c.len())
                }
                None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
            }
        }
    }

    #[test]
    fn frame_roundtrip() {
        let cmd = Command::SetVelocity {
            drive: 3,
            velocity: 1250.5,
        };
        let frame = encode_frame(&cmd).unwrap();
        let mut reader = FrameReader::new(Cursor::new(frame));
        let back: Command = reader.read_frame().unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn poll_handles_split_frames() {
        let cmd = Command::SetPosition {
            drive: 1,
            position: 42.0,
        };
        let frame = encode_frame(&cmd).unwrap();
        let (a, b) = frame.split_at(3);
        let mut reader = FrameReader::new(Chunked {
            chunks: VecDeque::from(vec![a.to_vec(), b.to_vec()]),
        });
        // First poll may or may not complete depending on chunk boundaries;
        // after both chunks are in, the frame must parse.
        let mut got = None;
        for _ in 0..3 {
            if let Some(v) = reader.poll_frame::<Command>().unwrap() {
                got = Some(v);
                break;
            }
        }
        assert_eq!(got, Some(cmd));
    }

    #[test]
    fn pipe_commands_preserve_order() {
        let a = Command::ClearFault { drive: 0 };
        let b = Command::StartHoming { drive: 0 };
        let mut bytes = encode_frame(&a).unwrap();
        bytes.extend(encode_frame(&b).unwrap());
        let mut src = PipeCommands::new(FrameReader::new(Chunked {
            chunks: VecDeque::from(vec![bytes]),
        }));
        assert_eq!(src.try_next(), Some(a));
        assert_eq!(src.try_next(), Some(b));
        assert_eq!(src.try_next(), None);
    }
}

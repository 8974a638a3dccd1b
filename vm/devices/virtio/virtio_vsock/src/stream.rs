// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Host-side byte streams that carry connection data.
//!
//! A connection owns one end of a stream pair; the host service that
//! accepted or initiated the connection owns the other. Both ends are
//! non-blocking. Readiness is reported through [`StreamSignals`] and one-shot
//! waits.

use bitfield_struct::bitfield;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use std::collections::VecDeque;
use std::fmt::Debug;
use std::io;
use std::net::Shutdown;
use std::sync::Arc;

/// Readiness state of one end of a stream.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct StreamSignals {
    /// Data is queued for this end to read.
    pub readable: bool,
    /// The peer has room for this end to write.
    pub writable: bool,
    /// The other end has been dropped.
    pub peer_closed: bool,
    /// Nothing beyond what is already queued will arrive at this end.
    pub read_disabled: bool,
    /// This end can no longer write.
    pub write_disabled: bool,
    #[bits(3)]
    _reserved: u8,
}

impl StreamSignals {
    pub fn intersects(&self, other: Self) -> bool {
        self.into_bits() & other.into_bits() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.into_bits() == 0
    }
}

/// Which of an end's two independent waits to arm.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum WaitSlot {
    Receive,
    Transmit,
}

impl WaitSlot {
    fn index(self) -> usize {
        match self {
            WaitSlot::Receive => 0,
            WaitSlot::Transmit => 1,
        }
    }
}

/// Callback run once when an armed wait is satisfied.
pub type Waiter = Box<dyn FnOnce(StreamSignals) + Send>;

/// Receive buffer state reported to the guest as flow control credit.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StreamCredit {
    /// Total buffer the peer end has for data this end writes.
    pub buf_alloc: u32,
    /// The part of `buf_alloc` that is free right now.
    pub available: u32,
}

/// The capability a connection needs from its host-side stream.
pub trait VsockStream: Send {
    /// Reads queued data. Returns `Ok(0)` at end of stream and
    /// [`io::ErrorKind::WouldBlock`] when nothing is queued yet.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    /// Writes data for the peer. May accept less than `buf` if the stream
    /// allows partial writes.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
    fn shutdown(&mut self, how: Shutdown) -> io::Result<()>;
    /// Queries how much the peer can currently accept from this end.
    fn credit(&self) -> io::Result<StreamCredit>;
    fn signals(&self) -> StreamSignals;
    /// Arms `slot` to run `waiter` once any of `trigger` is asserted,
    /// replacing a previous wait in the same slot. Runs `waiter` before
    /// returning if a signal is already asserted.
    fn wait(&mut self, slot: WaitSlot, trigger: StreamSignals, waiter: Waiter);
    fn cancel_wait(&mut self, slot: WaitSlot);
}

#[derive(Debug, Copy, Clone)]
enum Mode {
    Bytes { capacity: usize },
    Messages { max_messages: usize, max_size: usize },
}

/// Data flowing toward one end.
#[derive(Default)]
struct Direction {
    chunks: VecDeque<Vec<u8>>,
    bytes: usize,
    /// The receiving end shut down reading.
    reader_shutdown: bool,
    /// The sending end shut down writing.
    writer_shutdown: bool,
}

impl Direction {
    fn closed(&self) -> bool {
        self.reader_shutdown || self.writer_shutdown
    }
}

struct Shared {
    mode: Mode,
    /// `incoming[i]` is the data end `i` reads.
    incoming: [Direction; 2],
    closed: [bool; 2],
    waits: [[Option<(StreamSignals, Waiter)>; 2]; 2],
}

impl Shared {
    fn has_room(&self, dir: &Direction) -> bool {
        match self.mode {
            Mode::Bytes { capacity } => dir.bytes < capacity,
            Mode::Messages { max_messages, .. } => dir.chunks.len() < max_messages,
        }
    }

    fn signals(&self, end: usize) -> StreamSignals {
        let peer = 1 - end;
        let incoming = &self.incoming[end];
        let outgoing = &self.incoming[peer];
        StreamSignals::new()
            .with_readable(!incoming.chunks.is_empty())
            .with_writable(!self.closed[peer] && !outgoing.closed() && self.has_room(outgoing))
            .with_peer_closed(self.closed[peer])
            .with_read_disabled(incoming.closed())
            .with_write_disabled(outgoing.closed())
    }

    /// Takes every armed wait that is now satisfied.
    fn fired(&mut self) -> Vec<(Waiter, StreamSignals)> {
        let mut fired = Vec::new();
        for end in 0..2 {
            if self.closed[end] {
                continue;
            }
            let signals = self.signals(end);
            for slot in &mut self.waits[end] {
                if slot
                    .as_ref()
                    .is_some_and(|(trigger, _)| signals.intersects(*trigger))
                {
                    if let Some((_, waiter)) = slot.take() {
                        fired.push((waiter, signals));
                    }
                }
            }
        }
        fired
    }
}

/// Runs satisfied waits after the lock is released, so waiters may touch
/// the stream.
fn wake(mut shared: MutexGuard<'_, Shared>) {
    let fired = shared.fired();
    drop(shared);
    for (waiter, signals) in fired {
        waiter(signals);
    }
}

struct Endpoint {
    shared: Arc<Mutex<Shared>>,
    end: usize,
}

impl Endpoint {
    fn pair(mode: Mode) -> (Self, Self) {
        let shared = Arc::new(Mutex::new(Shared {
            mode,
            incoming: Default::default(),
            closed: [false; 2],
            waits: Default::default(),
        }));
        (
            Self {
                shared: shared.clone(),
                end: 0,
            },
            Self { shared, end: 1 },
        )
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut shared = self.shared.lock();
        let peer_closed = shared.closed[1 - self.end];
        let incoming = &mut shared.incoming[self.end];
        if incoming.chunks.is_empty() {
            return if incoming.closed() || peer_closed {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }
        let mut n = 0;
        while n < buf.len() {
            let Some(chunk) = incoming.chunks.front_mut() else {
                break;
            };
            let take = chunk.len().min(buf.len() - n);
            buf[n..n + take].copy_from_slice(&chunk[..take]);
            chunk.drain(..take);
            if chunk.is_empty() {
                incoming.chunks.pop_front();
            }
            n += take;
        }
        incoming.bytes -= n;
        wake(shared);
        Ok(n)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut shared = self.shared.lock();
        let peer = 1 - self.end;
        if shared.closed[peer] || shared.incoming[peer].closed() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        if buf.is_empty() {
            return Ok(0);
        }
        let n = match shared.mode {
            Mode::Bytes { capacity } => {
                let n = buf.len().min(capacity - shared.incoming[peer].bytes);
                if n == 0 {
                    return Err(io::ErrorKind::WouldBlock.into());
                }
                n
            }
            Mode::Messages {
                max_messages,
                max_size,
            } => {
                if buf.len() > max_size {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("message of {} bytes exceeds {max_size}", buf.len()),
                    ));
                }
                if shared.incoming[peer].chunks.len() >= max_messages {
                    return Err(io::ErrorKind::WouldBlock.into());
                }
                buf.len()
            }
        };
        let outgoing = &mut shared.incoming[peer];
        outgoing.chunks.push_back(buf[..n].to_vec());
        outgoing.bytes += n;
        wake(shared);
        Ok(n)
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        let mut shared = self.shared.lock();
        let peer = 1 - self.end;
        if matches!(how, Shutdown::Read | Shutdown::Both) {
            let incoming = &mut shared.incoming[self.end];
            incoming.reader_shutdown = true;
            incoming.chunks.clear();
            incoming.bytes = 0;
        }
        if matches!(how, Shutdown::Write | Shutdown::Both) {
            shared.incoming[peer].writer_shutdown = true;
        }
        wake(shared);
        Ok(())
    }

    fn credit(&self) -> io::Result<StreamCredit> {
        let shared = self.shared.lock();
        let outgoing = &shared.incoming[1 - self.end];
        let credit = match shared.mode {
            Mode::Bytes { capacity } => StreamCredit {
                buf_alloc: capacity as u32,
                available: (capacity - outgoing.bytes) as u32,
            },
            // A channel only ever accepts whole messages, so its space is
            // either one message or nothing.
            Mode::Messages { max_size, .. } => StreamCredit {
                buf_alloc: max_size as u32,
                available: if shared.has_room(outgoing) {
                    max_size as u32
                } else {
                    0
                },
            },
        };
        Ok(credit)
    }

    fn signals(&self) -> StreamSignals {
        self.shared.lock().signals(self.end)
    }

    fn wait(&self, slot: WaitSlot, trigger: StreamSignals, waiter: Waiter) {
        let mut shared = self.shared.lock();
        let signals = shared.signals(self.end);
        if signals.intersects(trigger) {
            shared.waits[self.end][slot.index()] = None;
            drop(shared);
            waiter(signals);
        } else {
            shared.waits[self.end][slot.index()] = Some((trigger, waiter));
        }
    }

    fn cancel_wait(&self, slot: WaitSlot) {
        let waiter = self.shared.lock().waits[self.end][slot.index()].take();
        drop(waiter);
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        let mut shared = self.shared.lock();
        shared.closed[self.end] = true;
        shared.waits[self.end] = Default::default();
        let incoming = &mut shared.incoming[self.end];
        incoming.chunks.clear();
        incoming.bytes = 0;
        wake(shared);
    }
}

impl Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("end", &self.end)
            .field("signals", &self.signals())
            .finish()
    }
}

macro_rules! forward_stream {
    ($ty:ty) => {
        impl VsockStream for $ty {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                self.0.read(buf)
            }
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.0.write(buf)
            }
            fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
                self.0.shutdown(how)
            }
            fn credit(&self) -> io::Result<StreamCredit> {
                self.0.credit()
            }
            fn signals(&self) -> StreamSignals {
                self.0.signals()
            }
            fn wait(&mut self, slot: WaitSlot, trigger: StreamSignals, waiter: Waiter) {
                self.0.wait(slot, trigger, waiter)
            }
            fn cancel_wait(&mut self, slot: WaitSlot) {
                self.0.cancel_wait(slot)
            }
        }
    };
}

/// A duplex byte stream with a fixed buffer in each direction. Writes are
/// partial when the buffer is nearly full.
#[derive(Debug)]
pub struct BufferedStream(Endpoint);

impl BufferedStream {
    pub fn pair(capacity: usize) -> (Self, Self) {
        let (a, b) = Endpoint::pair(Mode::Bytes { capacity });
        (Self(a), Self(b))
    }
}

forward_stream!(BufferedStream);

/// A duplex channel of bounded messages. Writes are all or nothing; reads
/// may take a message in pieces.
#[derive(Debug)]
pub struct MessageChannel(Endpoint);

impl MessageChannel {
    pub fn pair(max_messages: usize, max_message_size: usize) -> (Self, Self) {
        let (a, b) = Endpoint::pair(Mode::Messages {
            max_messages,
            max_size: max_message_size,
        });
        (Self(a), Self(b))
    }
}

forward_stream!(MessageChannel);

/// The stream types a connection can carry.
#[derive(Debug)]
pub enum Stream {
    Buffered(BufferedStream),
    Channel(MessageChannel),
}

impl From<BufferedStream> for Stream {
    fn from(value: BufferedStream) -> Self {
        Self::Buffered(value)
    }
}

impl From<MessageChannel> for Stream {
    fn from(value: MessageChannel) -> Self {
        Self::Channel(value)
    }
}

macro_rules! dispatch {
    ($self:ident, $s:ident => $e:expr) => {
        match $self {
            Stream::Buffered($s) => $e,
            Stream::Channel($s) => $e,
        }
    };
}

impl VsockStream for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        dispatch!(self, s => s.read(buf))
    }
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        dispatch!(self, s => s.write(buf))
    }
    fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
        dispatch!(self, s => s.shutdown(how))
    }
    fn credit(&self) -> io::Result<StreamCredit> {
        dispatch!(self, s => s.credit())
    }
    fn signals(&self) -> StreamSignals {
        dispatch!(self, s => s.signals())
    }
    fn wait(&mut self, slot: WaitSlot, trigger: StreamSignals, waiter: Waiter) {
        dispatch!(self, s => s.wait(slot, trigger, waiter))
    }
    fn cancel_wait(&mut self, slot: WaitSlot) {
        dispatch!(self, s => s.cancel_wait(slot))
    }
}

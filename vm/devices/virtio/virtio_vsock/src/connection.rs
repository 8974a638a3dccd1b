// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-connection protocol state and flow control.

use crate::spec::ShutdownFlags;
use crate::spec::VsockHeader;
use crate::spec::VsockOp;
use crate::spec::VSOCK_TYPE_STREAM;
use crate::stream::Stream;
use crate::stream::StreamSignals;
use crate::stream::VsockStream;
use crate::stream::WaitSlot;
use crate::AcceptError;
use crate::VsockEvent;
use futures::channel::mpsc;
use futures::channel::oneshot;
use std::io;
use thiserror::Error;

/// Largest payload carried by a single RW packet.
pub const MAX_PACKET_PAYLOAD: usize = 64 * 1024;

/// Identifies a connection. The local side is the host, the remote side is
/// the guest.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey {
    pub local_cid: u64,
    pub local_port: u32,
    pub remote_cid: u64,
    pub remote_port: u32,
}

impl ConnectionKey {
    /// The connection a guest-sent packet belongs to.
    pub fn from_guest(header: &VsockHeader) -> Self {
        Self {
            local_cid: header.dst_cid.get(),
            local_port: header.dst_port.get(),
            remote_cid: header.src_cid.get(),
            remote_port: header.src_port.get(),
        }
    }

    /// A header for a packet on this connection addressed to the guest.
    pub fn header(&self, op: VsockOp) -> VsockHeader {
        VsockHeader {
            src_cid: self.local_cid.into(),
            dst_cid: self.remote_cid.into(),
            src_port: self.local_port.into(),
            dst_port: self.remote_port.into(),
            len: 0.into(),
            socket_type: VSOCK_TYPE_STREAM.into(),
            op: op.0.into(),
            flags: 0.into(),
            buf_alloc: 0.into(),
            fwd_cnt: 0.into(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// A host-initiated connection whose REQUEST has not been sent.
    Request,
    /// Host-initiated: waiting for the guest's RESPONSE. Guest-initiated:
    /// the RESPONSE has not been sent.
    Response,
    ReadWrite,
    CreditRequest,
    CreditUpdate,
    Shutdown,
    Reset,
}

/// Inputs to the connection state machine.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StateEvent {
    /// A packet for the connection was written to the RX queue.
    Transmitted,
    /// A packet with this op arrived on the TX queue.
    Received(VsockOp),
    /// Data is waiting but the guest has no buffer space left.
    CreditExhausted,
    /// The host stream has room again after reporting none.
    BufferAvailable,
    /// The host side stopped sending or receiving.
    LocalShutdown,
    /// A local I/O error or guest protocol violation.
    Failed,
}

impl ConnectionState {
    /// Applies `event`. `closed` holds the directions shut down so far, from
    /// the guest's point of view.
    ///
    /// Anything not in the transition table resets the connection; the
    /// inputs come from the guest, so this is logged rather than asserted.
    pub fn next(self, event: StateEvent, closed: ShutdownFlags) -> Self {
        use ConnectionState::*;
        use StateEvent::*;

        let next = match (self, event) {
            (Reset, _) => Some(Reset),
            (_, Failed | Received(VsockOp::RST)) => Some(Reset),

            (Request, Transmitted) => Some(Response),
            (Response, Transmitted | Received(VsockOp::RESPONSE)) => Some(ReadWrite),
            (ReadWrite | CreditRequest | CreditUpdate, Transmitted) => Some(ReadWrite),
            (Shutdown, Transmitted) => Some(if closed.is_both() { Reset } else { ReadWrite }),

            (
                ReadWrite | CreditRequest | CreditUpdate | Shutdown,
                Received(VsockOp::SHUTDOWN),
            ) => Some(if closed.is_both() { Reset } else { self }),
            (ReadWrite | CreditRequest | CreditUpdate | Shutdown, Received(VsockOp::RW)) => {
                Some(self)
            }
            (ReadWrite | CreditRequest, Received(VsockOp::CREDIT_UPDATE)) => Some(ReadWrite),
            (CreditUpdate | Shutdown, Received(VsockOp::CREDIT_UPDATE)) => Some(self),
            (ReadWrite | CreditRequest | CreditUpdate, Received(VsockOp::CREDIT_REQUEST)) => {
                Some(CreditUpdate)
            }
            (Shutdown, Received(VsockOp::CREDIT_REQUEST)) => Some(Shutdown),

            (ReadWrite, CreditExhausted) => Some(CreditRequest),
            (ReadWrite, BufferAvailable) => Some(CreditUpdate),
            (CreditRequest | CreditUpdate | Shutdown, BufferAvailable) => Some(self),
            (ReadWrite, LocalShutdown) => Some(Shutdown),
            _ => None,
        };

        next.unwrap_or_else(|| {
            tracelimit::warn_ratelimited!(
                state = ?self,
                event = ?event,
                "invalid vsock state transition, resetting connection"
            );
            Reset
        })
    }

    /// Data may flow in this state.
    fn is_open(self) -> bool {
        matches!(
            self,
            Self::ReadWrite | Self::CreditRequest | Self::CreditUpdate | Self::Shutdown
        )
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Origin {
    Guest,
    Host,
}

#[derive(Debug, Error)]
pub enum CreditError {
    /// The stream has no room. Not a failure; wait for it to become
    /// writable.
    #[error("no receive buffer space available")]
    NoSpace,
    #[error("failed to query stream buffer space")]
    Io(#[from] io::Error),
}

/// Completes a host-initiated connect once the guest answers. Dropping it
/// unanswered reports a refusal.
#[derive(Debug)]
pub struct PendingAccept(Option<oneshot::Sender<Result<(), AcceptError>>>);

impl PendingAccept {
    pub fn new(sender: oneshot::Sender<Result<(), AcceptError>>) -> Self {
        Self(Some(sender))
    }

    fn complete(mut self, result: Result<(), AcceptError>) {
        if let Some(sender) = self.0.take() {
            let _ = sender.send(result);
        }
    }
}

impl Drop for PendingAccept {
    fn drop(&mut self) {
        if let Some(sender) = self.0.take() {
            let _ = sender.send(Err(AcceptError::Refused));
        }
    }
}

/// What the Mux should put on the RX queue for a connection.
#[derive(Debug)]
pub enum Transmit {
    Packet(VsockHeader, Vec<u8>),
    Idle,
    /// Data is ready but the offered buffer only fits a header.
    NeedsBuffer,
}

/// What to do with a connection after a guest packet.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Disposition {
    Keep,
    /// The guest reset the connection; remove it without a reply.
    Erase,
}

/// A point-in-time view of a connection, for diagnostics.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub origin: Origin,
    pub rx_count: u32,
    pub tx_count: u32,
    pub peer_buf_alloc: u32,
    pub peer_fwd_cnt: u32,
    pub peer_free: u32,
    pub guest_shutdown: ShutdownFlags,
    pub host_shutdown: ShutdownFlags,
}

/// Swaps the direction a set of shutdown flags describes, converting
/// between the guest's and the host's point of view.
fn mirrored(flags: ShutdownFlags) -> ShutdownFlags {
    ShutdownFlags::new()
        .with_recv(flags.send())
        .with_send(flags.recv())
}

pub struct Connection {
    key: ConnectionKey,
    state: ConnectionState,
    origin: Origin,
    /// Flags the guest has sent.
    guest_shutdown: ShutdownFlags,
    /// Flags reported to the guest.
    host_shutdown: ShutdownFlags,
    /// Bytes received from the guest and written to the stream.
    rx_count: u32,
    /// Bytes read from the stream and sent to the guest.
    tx_count: u32,
    peer_buf_alloc: u32,
    peer_fwd_cnt: u32,
    /// A CREDIT_REQUEST is outstanding.
    credit_requested: bool,
    /// The stream was full when last checked; waiting for it to drain.
    awaiting_buffer: bool,
    stream: Stream,
    pending_accept: Option<PendingAccept>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl Connection {
    /// A connection the host is opening to a guest listener.
    pub fn new_host(key: ConnectionKey, stream: Stream, accept: PendingAccept) -> Self {
        Self::new(key, Origin::Host, ConnectionState::Request, stream, Some(accept))
    }

    /// A connection the guest opened and a host service accepted.
    pub fn new_guest(
        key: ConnectionKey,
        stream: Stream,
        peer_buf_alloc: u32,
        peer_fwd_cnt: u32,
    ) -> Self {
        let mut this = Self::new(key, Origin::Guest, ConnectionState::Response, stream, None);
        this.peer_buf_alloc = peer_buf_alloc;
        this.peer_fwd_cnt = peer_fwd_cnt;
        this
    }

    fn new(
        key: ConnectionKey,
        origin: Origin,
        state: ConnectionState,
        stream: Stream,
        pending_accept: Option<PendingAccept>,
    ) -> Self {
        Self {
            key,
            state,
            origin,
            guest_shutdown: ShutdownFlags::new(),
            host_shutdown: ShutdownFlags::new(),
            rx_count: 0,
            tx_count: 0,
            peer_buf_alloc: 0,
            peer_fwd_cnt: 0,
            credit_requested: false,
            awaiting_buffer: false,
            stream,
            pending_accept,
        }
    }

    pub fn key(&self) -> ConnectionKey {
        self.key
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            state: self.state,
            origin: self.origin,
            rx_count: self.rx_count,
            tx_count: self.tx_count,
            peer_buf_alloc: self.peer_buf_alloc,
            peer_fwd_cnt: self.peer_fwd_cnt,
            peer_free: self.peer_free(),
            guest_shutdown: self.guest_shutdown,
            host_shutdown: self.host_shutdown,
        }
    }

    /// Closed directions from the guest's point of view: `recv` once nothing
    /// more will flow to the guest, `send` once nothing more will flow from
    /// it.
    fn closed(&self) -> ShutdownFlags {
        self.guest_shutdown.union(mirrored(self.host_shutdown))
    }

    fn apply(&mut self, event: StateEvent) -> ConnectionState {
        let next = self.state.next(event, self.closed());
        if next != self.state {
            tracing::trace!(key = ?self.key, from = ?self.state, to = ?next, ?event, "vsock state change");
        }
        self.state = next;
        next
    }

    /// Resets the connection after a local error or protocol violation.
    pub fn fail(&mut self, err: &(dyn std::error::Error + 'static)) {
        tracelimit::warn_ratelimited!(
            key = ?self.key,
            error = err,
            "resetting vsock connection"
        );
        self.apply(StateEvent::Failed);
    }

    /// Bytes the guest can accept before it must report more credit.
    pub fn peer_free(&self) -> u32 {
        let in_flight = self.tx_count.wrapping_sub(self.peer_fwd_cnt);
        self.peer_buf_alloc.saturating_sub(in_flight)
    }

    /// Records the credit the guest advertised in `header`.
    pub fn read_credit(&mut self, header: &VsockHeader) {
        self.peer_buf_alloc = header.buf_alloc.get();
        self.peer_fwd_cnt = header.fwd_cnt.get();
        if self.peer_free() > 0 {
            self.credit_requested = false;
        }
    }

    /// Fills in `header`'s credit from the stream's current free space, so
    /// the guest's view of free space matches the stream's.
    ///
    /// The header is filled in even when [`CreditError::NoSpace`] is
    /// returned.
    pub fn write_credit(&mut self, header: &mut VsockHeader) -> Result<(), CreditError> {
        let credit = self.stream.credit()?;
        let used = credit.buf_alloc.saturating_sub(credit.available);
        header.buf_alloc = credit.buf_alloc.into();
        header.fwd_cnt = self.rx_count.wrapping_sub(used).into();
        if credit.available == 0 {
            self.awaiting_buffer = true;
            return Err(CreditError::NoSpace);
        }
        Ok(())
    }

    /// Builds a header for `op` with credit filled in. Running out of space
    /// is fine here; the guest just sees zero credit.
    fn packet(&mut self, op: VsockOp) -> Result<VsockHeader, io::Error> {
        let mut header = self.key.header(op);
        match self.write_credit(&mut header) {
            Ok(()) | Err(CreditError::NoSpace) => Ok(header),
            Err(CreditError::Io(err)) => Err(err),
        }
    }

    fn reset_packet(&self) -> Transmit {
        Transmit::Packet(self.key.header(VsockOp::RST), Vec::new())
    }

    /// Host-side conditions to report in a SHUTDOWN, from the host's point of
    /// view, excluding directions that are already closed.
    fn pending_shutdown(&self, signals: StreamSignals) -> ShutdownFlags {
        let gone = signals.peer_closed();
        let conditions = ShutdownFlags::new()
            .with_recv(signals.write_disabled() || gone)
            .with_send((signals.read_disabled() || gone) && !signals.readable());
        conditions.difference(mirrored(self.closed()))
    }

    /// Produces the next packet to send to the guest, if any.
    ///
    /// `max_payload` bounds the data in an RW packet. Errors reset the
    /// connection and produce an RST; once an RST has been sent the caller
    /// removes the connection.
    pub fn transmit(&mut self, max_payload: usize) -> Transmit {
        match self.transmit_inner(max_payload) {
            Ok(transmit) => transmit,
            Err(err) => {
                self.fail(&err);
                self.reset_packet()
            }
        }
    }

    fn transmit_inner(&mut self, max_payload: usize) -> Result<Transmit, io::Error> {
        let header = match self.state {
            ConnectionState::Reset => return Ok(self.reset_packet()),
            ConnectionState::Request => self.packet(VsockOp::REQUEST)?,
            ConnectionState::Response => {
                if self.origin == Origin::Host {
                    // Waiting on the guest.
                    return Ok(Transmit::Idle);
                }
                self.packet(VsockOp::RESPONSE)?
            }
            ConnectionState::CreditUpdate => {
                let mut header = self.key.header(VsockOp::CREDIT_UPDATE);
                match self.write_credit(&mut header) {
                    Ok(()) => header,
                    Err(CreditError::NoSpace) => return Ok(Transmit::Idle),
                    Err(CreditError::Io(err)) => return Err(err),
                }
            }
            ConnectionState::ReadWrite
            | ConnectionState::CreditRequest
            | ConnectionState::Shutdown => return self.transmit_data(max_payload),
        };
        self.apply(StateEvent::Transmitted);
        Ok(Transmit::Packet(header, Vec::new()))
    }

    fn transmit_data(&mut self, max_payload: usize) -> Result<Transmit, io::Error> {
        let signals = self.stream.signals();
        let shutdown = self.pending_shutdown(signals);
        if !shutdown.is_empty() {
            self.host_shutdown = self.host_shutdown.union(shutdown);
            self.apply(StateEvent::LocalShutdown);
            let mut header = self.packet(VsockOp::SHUTDOWN)?;
            header.flags = u32::from(shutdown).into();
            self.apply(StateEvent::Transmitted);
            return Ok(Transmit::Packet(header, Vec::new()));
        }

        if self.closed().recv() || !signals.readable() {
            return Ok(Transmit::Idle);
        }

        let peer_free = self.peer_free();
        if peer_free == 0 {
            if self.credit_requested {
                return Ok(Transmit::Idle);
            }
            self.apply(StateEvent::CreditExhausted);
            self.credit_requested = true;
            let header = self.packet(VsockOp::CREDIT_REQUEST)?;
            self.apply(StateEvent::Transmitted);
            return Ok(Transmit::Packet(header, Vec::new()));
        }

        if max_payload == 0 {
            return Ok(Transmit::NeedsBuffer);
        }
        let len = max_payload
            .min(peer_free as usize)
            .min(MAX_PACKET_PAYLOAD);
        let mut payload = vec![0; len];
        let n = match self.stream.read(&mut payload) {
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => 0,
            Err(err) => return Err(err),
        };
        if n == 0 {
            return Ok(Transmit::Idle);
        }
        payload.truncate(n);
        self.tx_count = self.tx_count.wrapping_add(n as u32);
        let mut header = self.packet(VsockOp::RW)?;
        header.len = (n as u32).into();
        self.apply(StateEvent::Transmitted);
        Ok(Transmit::Packet(header, payload))
    }

    /// Applies a packet the guest sent. `payload` is the packet's data, already
    /// checked against the header's length.
    pub fn receive(&mut self, header: &VsockHeader, payload: &[u8]) -> Disposition {
        let op = header.op();
        if op == VsockOp::RST {
            self.apply(StateEvent::Received(op));
            return Disposition::Erase;
        }

        self.read_credit(header);
        if op == VsockOp::RESPONSE && self.origin == Origin::Guest {
            // Only the host answers a guest's REQUEST.
            tracelimit::warn_ratelimited!(key = ?self.key, "unexpected RESPONSE from guest");
            self.apply(StateEvent::Failed);
            return Disposition::Keep;
        }
        if op == VsockOp::RW && self.guest_shutdown.send() && self.state.is_open() {
            tracelimit::warn_ratelimited!(key = ?self.key, "guest sent data after shutting down");
            self.apply(StateEvent::Failed);
            return Disposition::Keep;
        }

        let newly_shut = if op == VsockOp::SHUTDOWN {
            let flags = header.shutdown_flags();
            let newly = flags.difference(self.guest_shutdown);
            self.guest_shutdown = self.guest_shutdown.union(flags);
            newly
        } else {
            ShutdownFlags::new()
        };

        if self.apply(StateEvent::Received(op)) == ConnectionState::Reset {
            return Disposition::Keep;
        }

        if let Err(err) = self.receive_effects(op, newly_shut, payload) {
            self.fail(&err);
        }
        Disposition::Keep
    }

    fn receive_effects(
        &mut self,
        op: VsockOp,
        newly_shut: ShutdownFlags,
        payload: &[u8],
    ) -> io::Result<()> {
        match op {
            VsockOp::RESPONSE => {
                if let Some(accept) = self.pending_accept.take() {
                    accept.complete(Ok(()));
                }
            }
            VsockOp::RW if !payload.is_empty() => {
                let n = self.stream.write(payload)?;
                if n != payload.len() {
                    // The guest sent more than the credit it was given.
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("stream accepted {n} of {} bytes", payload.len()),
                    ));
                }
                self.rx_count = self.rx_count.wrapping_add(n as u32);
                if self.stream.credit()?.available == 0 {
                    self.awaiting_buffer = true;
                }
            }
            VsockOp::SHUTDOWN => {
                if newly_shut.recv() {
                    self.stream.shutdown(std::net::Shutdown::Read)?;
                }
                if newly_shut.send() {
                    self.stream.shutdown(std::net::Shutdown::Write)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// The stream drained after being full.
    pub fn buffer_available(&mut self) {
        if !self.awaiting_buffer {
            return;
        }
        self.awaiting_buffer = false;
        if self.state.is_open() && !self.closed().send() {
            self.apply(StateEvent::BufferAvailable);
        }
    }

    /// Returns `true` if [`Connection::transmit`] would produce a packet.
    pub fn wants_transmit(&self) -> bool {
        match self.state {
            ConnectionState::Reset | ConnectionState::Request => true,
            ConnectionState::Response => self.origin == Origin::Guest,
            ConnectionState::CreditUpdate => self
                .stream
                .credit()
                .map_or(true, |credit| credit.available != 0),
            ConnectionState::ReadWrite
            | ConnectionState::CreditRequest
            | ConnectionState::Shutdown => {
                let signals = self.stream.signals();
                if !self.pending_shutdown(signals).is_empty() {
                    return true;
                }
                !self.closed().recv()
                    && signals.readable()
                    && (self.peer_free() > 0 || !self.credit_requested)
            }
        }
    }

    /// Stream conditions that would give [`Connection::transmit`] something
    /// to do.
    fn receive_trigger(&self) -> StreamSignals {
        // A blocked credit update only waits for buffer space.
        if !self.state.is_open() || self.state == ConnectionState::CreditUpdate {
            return StreamSignals::new();
        }
        let closed = self.closed();
        let mut trigger = StreamSignals::new();
        if !closed.send() {
            trigger.set_write_disabled(true);
            trigger.set_peer_closed(true);
        }
        if !closed.recv() {
            if self.peer_free() > 0 {
                trigger.set_readable(true);
                trigger.set_read_disabled(true);
                trigger.set_peer_closed(true);
            } else if !self.stream.signals().readable() {
                // Queued data has to drain before a SHUTDOWN can be sent,
                // and that needs credit from the guest first.
                trigger.set_read_disabled(true);
                trigger.set_peer_closed(true);
            }
        }
        trigger
    }

    /// Arms the stream waits that feed this connection's events.
    pub(crate) fn arm_waits(&mut self, events: &mpsc::UnboundedSender<VsockEvent>) {
        let key = self.key;
        let waiter = |slot: WaitSlot| -> crate::stream::Waiter {
            let events = events.clone();
            Box::new(move |_: StreamSignals| {
                let _ = events.unbounded_send(VsockEvent::StreamSignaled { key, slot });
            })
        };

        let trigger = self.receive_trigger();
        if trigger.is_empty() {
            self.stream.cancel_wait(WaitSlot::Receive);
        } else {
            self.stream
                .wait(WaitSlot::Receive, trigger, waiter(WaitSlot::Receive));
        }

        if self.awaiting_buffer && self.state.is_open() && !self.closed().send() {
            self.stream.wait(
                WaitSlot::Transmit,
                StreamSignals::new()
                    .with_writable(true)
                    .with_peer_closed(true),
                waiter(WaitSlot::Transmit),
            );
        } else {
            self.stream.cancel_wait(WaitSlot::Transmit);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.stream.cancel_wait(WaitSlot::Receive);
        self.stream.cancel_wait(WaitSlot::Transmit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::BufferedStream;
    use crate::stream::MessageChannel;
    use proptest::prelude::*;
    use test_with_tracing::test;

    const ALL_STATES: [ConnectionState; 7] = [
        ConnectionState::Request,
        ConnectionState::Response,
        ConnectionState::ReadWrite,
        ConnectionState::CreditRequest,
        ConnectionState::CreditUpdate,
        ConnectionState::Shutdown,
        ConnectionState::Reset,
    ];

    fn all_events() -> Vec<StateEvent> {
        let mut events = vec![
            StateEvent::Transmitted,
            StateEvent::CreditExhausted,
            StateEvent::BufferAvailable,
            StateEvent::LocalShutdown,
            StateEvent::Failed,
        ];
        events.extend((0..=9).map(|op| StateEvent::Received(VsockOp(op))));
        events
    }

    /// The legal transitions, written out independently of the
    /// implementation.
    fn legal(
        from: ConnectionState,
        event: StateEvent,
        closed: ShutdownFlags,
    ) -> Option<ConnectionState> {
        use ConnectionState::*;
        use StateEvent::*;
        let open = [ReadWrite, CreditRequest, CreditUpdate, Shutdown];
        let both = closed.is_both();
        Some(match (from, event) {
            (Reset, _) => Reset,
            (_, Failed) => Reset,
            (_, Received(VsockOp::RST)) => Reset,
            (Request, Transmitted) => Response,
            (Response, Transmitted) => ReadWrite,
            (Response, Received(VsockOp::RESPONSE)) => ReadWrite,
            (Shutdown, Transmitted) if both => Reset,
            (Shutdown, Transmitted) => ReadWrite,
            (s, Transmitted) if open.contains(&s) => ReadWrite,
            (s, Received(VsockOp::SHUTDOWN)) if open.contains(&s) => {
                if both {
                    Reset
                } else {
                    s
                }
            }
            (s, Received(VsockOp::RW)) if open.contains(&s) => s,
            (ReadWrite | CreditRequest, Received(VsockOp::CREDIT_UPDATE)) => ReadWrite,
            (CreditUpdate | Shutdown, Received(VsockOp::CREDIT_UPDATE)) => from,
            (Shutdown, Received(VsockOp::CREDIT_REQUEST)) => Shutdown,
            (s, Received(VsockOp::CREDIT_REQUEST)) if open.contains(&s) => CreditUpdate,
            (ReadWrite, CreditExhausted) => CreditRequest,
            (ReadWrite, BufferAvailable) => CreditUpdate,
            (CreditRequest | CreditUpdate | Shutdown, BufferAvailable) => from,
            (ReadWrite, LocalShutdown) => Shutdown,
            _ => return None,
        })
    }

    #[test]
    fn illegal_transitions_reset() {
        let closed_variants = [
            ShutdownFlags::new(),
            ShutdownFlags::new().with_recv(true),
            ShutdownFlags::new().with_send(true),
            ShutdownFlags::both(),
        ];
        let mut illegal = 0;
        for from in ALL_STATES {
            for event in all_events() {
                for closed in closed_variants {
                    let to = from.next(event, closed);
                    match legal(from, event, closed) {
                        Some(expected) => assert_eq!(to, expected, "{from:?} {event:?} {closed:?}"),
                        None => {
                            illegal += 1;
                            assert_eq!(to, ConnectionState::Reset, "{from:?} {event:?}");
                        }
                    }
                }
            }
        }
        assert!(illegal > 0);
    }

    #[test]
    fn credit_reporting_matches_stream() {
        let (a, mut b) = BufferedStream::pair(100);
        let (accept, _rx) = oneshot::channel();
        let key = ConnectionKey {
            local_cid: 2,
            local_port: 1000,
            remote_cid: 3,
            remote_port: 80,
        };
        let mut conn = Connection::new_host(key, a.into(), PendingAccept::new(accept));
        conn.state = ConnectionState::ReadWrite;

        let mut header = key.header(VsockOp::CREDIT_UPDATE);
        conn.write_credit(&mut header).unwrap();
        assert_eq!(header.buf_alloc.get(), 100);
        assert_eq!(header.fwd_cnt.get(), 0);

        // The guest sends 60 bytes; the host reads 25 of them.
        let data = [7u8; 60];
        let mut rw = key.header(VsockOp::RW);
        rw.len = 60.into();
        assert_eq!(conn.receive(&rw, &data), Disposition::Keep);
        let mut buf = [0; 25];
        assert_eq!(b.read(&mut buf).unwrap(), 25);
        conn.write_credit(&mut header).unwrap();
        // Guest view: 100 - (60 - fwd_cnt) == 65 free, as in the stream.
        let guest_free = header.buf_alloc.get() - (60 - header.fwd_cnt.get());
        assert_eq!(guest_free, 65);

        // Fill the rest: write_credit reports backpressure.
        let mut rw = key.header(VsockOp::RW);
        rw.len = 65.into();
        conn.receive(&rw, &[1; 65]);
        assert!(matches!(
            conn.write_credit(&mut header),
            Err(CreditError::NoSpace)
        ));
        assert_eq!(header.fwd_cnt.get(), 25);
    }

    #[test]
    fn channel_credit_is_one_message() {
        let (a, _b) = MessageChannel::pair(1, 512);
        let key = ConnectionKey {
            local_cid: 2,
            local_port: 1,
            remote_cid: 3,
            remote_port: 2,
        };
        let mut conn = Connection::new_guest(key, a.into(), 0, 0);
        let mut header = key.header(VsockOp::RESPONSE);
        conn.write_credit(&mut header).unwrap();
        assert_eq!(header.buf_alloc.get(), 512);
        assert_eq!(header.fwd_cnt.get(), 0);
    }

    #[test]
    fn peer_free_saturates() {
        let (a, _b) = BufferedStream::pair(16);
        let key = ConnectionKey {
            local_cid: 2,
            local_port: 1,
            remote_cid: 3,
            remote_port: 2,
        };
        let mut conn = Connection::new_guest(key, a.into(), 100, 0);
        conn.tx_count = 80;
        assert_eq!(conn.peer_free(), 20);
        // The guest shrank its buffer below what is in flight.
        let mut header = key.header(VsockOp::CREDIT_UPDATE);
        header.buf_alloc = 50.into();
        conn.read_credit(&header);
        assert_eq!(conn.peer_free(), 0);
        // Counters wrap.
        conn.tx_count = 5;
        header.buf_alloc = 64.into();
        header.fwd_cnt = u32::MAX.into();
        conn.read_credit(&header);
        assert_eq!(conn.peer_free(), 58);
    }

    #[test]
    fn header_only_buffer_carries_no_data() {
        let (a, mut host) = BufferedStream::pair(64);
        let key = ConnectionKey {
            local_cid: 2,
            local_port: 1,
            remote_cid: 3,
            remote_port: 2,
        };
        let mut conn = Connection::new_guest(key, a.into(), 4096, 0);
        conn.state = ConnectionState::ReadWrite;
        host.write(b"payload").unwrap();
        assert!(matches!(conn.transmit(0), Transmit::NeedsBuffer));
        assert_eq!(conn.snapshot().tx_count, 0);
        assert!(conn.wants_transmit());

        // A shutdown still fits.
        host.shutdown(std::net::Shutdown::Read).unwrap();
        let Transmit::Packet(header, payload) = conn.transmit(0) else {
            panic!("expected a packet");
        };
        assert_eq!(header.op(), VsockOp::SHUTDOWN);
        assert!(payload.is_empty());

        let Transmit::Packet(header, payload) = conn.transmit(16) else {
            panic!("expected a packet");
        };
        assert_eq!(header.op(), VsockOp::RW);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn dropped_accept_is_refused() {
        let (a, _b) = BufferedStream::pair(16);
        let (sender, mut receiver) = oneshot::channel();
        let key = ConnectionKey {
            local_cid: 2,
            local_port: 1,
            remote_cid: 3,
            remote_port: 2,
        };
        let conn = Connection::new_host(key, a.into(), PendingAccept::new(sender));
        drop(conn);
        assert!(matches!(
            receiver.try_recv(),
            Ok(Some(Err(AcceptError::Refused)))
        ));
    }

    proptest! {
        #[test]
        fn sends_never_exceed_credit(
            writes in prop::collection::vec(1usize..300, 1..20),
            buf_alloc in 1u32..512,
            grants in prop::collection::vec(0u32..200, 1..20),
        ) {
            let (a, mut host) = BufferedStream::pair(4096);
            let key = ConnectionKey { local_cid: 2, local_port: 1, remote_cid: 3, remote_port: 2 };
            let mut conn = Connection::new_guest(key, a.into(), buf_alloc, 0);
            conn.state = ConnectionState::ReadWrite;
            let mut fwd_cnt = 0u32;
            let mut grants = grants.into_iter().cycle();
            let mut sent_since_update = 0u32;
            let mut free_at_update = conn.peer_free();
            for len in writes {
                let _ = host.write(&vec![0xa5; len]);
                for _ in 0..4 {
                    match conn.transmit(1024) {
                        Transmit::Packet(header, payload) => {
                            if header.op() == VsockOp::RW {
                                sent_since_update += payload.len() as u32;
                                prop_assert!(sent_since_update <= free_at_update);
                            }
                        }
                        Transmit::Idle | Transmit::NeedsBuffer => break,
                    }
                }
                // The guest consumes some data and reports credit.
                let in_flight = conn.tx_count.wrapping_sub(fwd_cnt);
                fwd_cnt = fwd_cnt.wrapping_add(grants.next().unwrap_or(0).min(in_flight));
                let mut update = key.header(VsockOp::CREDIT_UPDATE);
                update.buf_alloc = buf_alloc.into();
                update.fwd_cnt = fwd_cnt.into();
                conn.receive(&update, &[]);
                prop_assert_eq!(conn.state(), ConnectionState::ReadWrite);
                sent_since_update = 0;
                free_at_update = conn.peer_free();
            }
        }
    }
}

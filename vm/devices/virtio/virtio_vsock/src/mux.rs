// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Moves packets from connections into guest RX buffers.

use crate::connection::Transmit;
use crate::connection::MAX_PACKET_PAYLOAD;
use crate::spec::VsockHeader;
use crate::spec::VsockOp;
use crate::spec::VSOCK_HEADER_SIZE;
use crate::table::ConnectionTable;
use virtio::DescriptorChain;
use virtio::VirtioQueue;
use virtio::VirtioWriteError;
use zerocopy::IntoBytes;

/// The RX queue, plus a chain taken for a connection that turned out to have
/// nothing to send.
pub(crate) struct RxQueue {
    queue: VirtioQueue,
    spare: Option<DescriptorChain>,
}

impl RxQueue {
    pub fn new(queue: VirtioQueue) -> Self {
        Self { queue, spare: None }
    }

    fn next_chain(&mut self) -> Option<DescriptorChain> {
        if let Some(chain) = self.spare.take() {
            return Some(chain);
        }
        match self.queue.next_chain() {
            Ok(chain) => chain,
            Err(err) => {
                tracelimit::error_ratelimited!(
                    error = &err as &dyn std::error::Error,
                    "failed to read vsock rx queue"
                );
                None
            }
        }
    }

    /// Takes the next chain with room for at least a header. Chains that are
    /// too small are returned unused.
    fn next_usable_chain(&mut self) -> Option<(DescriptorChain, usize)> {
        loop {
            let mut chain = self.next_chain()?;
            match chain.get_payload_length(true) {
                Ok(len) if len >= VSOCK_HEADER_SIZE as u64 => {
                    let max_payload = (len - VSOCK_HEADER_SIZE as u64)
                        .min(MAX_PACKET_PAYLOAD as u64) as usize;
                    return Some((chain, max_payload));
                }
                Ok(len) => {
                    tracelimit::warn_ratelimited!(len, "vsock rx buffer too small for a header");
                }
                Err(err) => {
                    tracelimit::warn_ratelimited!(
                        error = &err as &dyn std::error::Error,
                        "invalid vsock rx descriptor chain"
                    );
                }
            }
            chain.complete(0);
        }
    }
}

impl Drop for RxQueue {
    fn drop(&mut self) {
        if let Some(chain) = self.spare.take() {
            chain.complete(0);
        }
    }
}

fn write_packet(
    chain: &mut DescriptorChain,
    header: &VsockHeader,
    payload: &[u8],
) -> Result<u32, VirtioWriteError> {
    chain.write_at_offset(0, header.as_bytes())?;
    chain.write_at_offset(VSOCK_HEADER_SIZE as u64, payload)?;
    Ok((VSOCK_HEADER_SIZE + payload.len()) as u32)
}

/// Fills guest RX buffers: control packets first, then one packet per
/// scheduled connection.
///
/// Returns `true` if connections are still scheduled and the ring may have
/// room for them, in which case the caller should run another pass after
/// handling other work.
pub(crate) fn mux(table: &mut ConnectionTable, rx: &mut RxQueue) -> bool {
    while let Some(header) = table.front_control().copied() {
        let Some((mut chain, _)) = rx.next_usable_chain() else {
            return false;
        };
        let len = match write_packet(&mut chain, &header, &[]) {
            Ok(len) => len,
            Err(err) => {
                tracelimit::warn_ratelimited!(
                    error = &err as &dyn std::error::Error,
                    "failed to write vsock control packet"
                );
                0
            }
        };
        chain.complete(len);
        table.pop_control();
    }

    let mut ring_empty = false;
    for key in table.take_readable() {
        if ring_empty {
            table.mark_readable(key);
            continue;
        }
        if table.get(&key).is_none() {
            continue;
        }
        let Some((mut chain, max_payload)) = rx.next_usable_chain() else {
            ring_empty = true;
            table.mark_readable(key);
            continue;
        };
        let Some(connection) = table.get_mut(&key) else {
            continue;
        };

        let (header, payload) = match connection.transmit(max_payload) {
            Transmit::Packet(header, payload) => (header, payload),
            Transmit::Idle => {
                rx.spare = Some(chain);
                table.arm_waits(key);
                continue;
            }
            Transmit::NeedsBuffer => {
                // Hand the chain back so the next pass sees a different one.
                chain.complete(0);
                table.mark_readable(key);
                continue;
            }
        };

        match write_packet(&mut chain, &header, &payload) {
            Ok(len) => {
                tracing::trace!(?key, op = ?header.op(), len, "vsock packet to guest");
                chain.complete(len);
            }
            Err(err) => {
                chain.complete(0);
                connection.fail(&err);
                table.mark_readable(key);
                continue;
            }
        }

        if header.op() == VsockOp::RST {
            table.erase(&key);
        } else {
            table.rearm(key);
        }
    }

    table.has_readable() && !ring_empty
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Connection;
    use crate::connection::ConnectionKey;
    use crate::stream::BufferedStream;
    use crate::stream::VsockStream;
    use crate::VsockEvent;
    use futures::channel::mpsc;
    use guestmem::GuestMemory;
    use test_with_tracing::test;
    use virtio::spec::VIRTIO_F_RING_EVENT_IDX;
    use virtio::test_helpers::TestQueue;
    use vmcore::interrupt::Interrupt;
    use zerocopy::FromBytes;

    const QUEUE_SIZE: u16 = 8;
    const BUFFER_SIZE: u32 = 0x100;

    struct Setup {
        guest: TestQueue,
        rx: RxQueue,
        table: ConnectionTable,
        _events: mpsc::UnboundedReceiver<VsockEvent>,
    }

    fn key(port: u32) -> ConnectionKey {
        ConnectionKey {
            local_cid: 2,
            local_port: port,
            remote_cid: 3,
            remote_port: 5000,
        }
    }

    /// Sets up an RX queue with two established connections, on host ports
    /// 80 and 81, and returns their host ends.
    fn setup() -> (Setup, BufferedStream, BufferedStream) {
        let features = VIRTIO_F_RING_EVENT_IDX as u64;
        let mem = GuestMemory::allocate(TestQueue::memory_size(QUEUE_SIZE, BUFFER_SIZE) as usize);
        let mut guest = TestQueue::new(&mem, 0, QUEUE_SIZE, BUFFER_SIZE, features);
        let queue = VirtioQueue::new(features, guest.params(), mem, Interrupt::null()).unwrap();
        let (events, receiver) = mpsc::unbounded();
        let mut table = ConnectionTable::new(16, events);
        let mut rx = RxQueue::new(queue);

        let (a, host_a) = BufferedStream::pair(1024);
        let (b, host_b) = BufferedStream::pair(1024);
        table.insert(Connection::new_guest(key(80), a.into(), 4096, 0));
        table.insert(Connection::new_guest(key(81), b.into(), 4096, 0));
        guest.add_writeable(1);
        guest.add_writeable(1);
        assert!(!mux(&mut table, &mut rx));
        for _ in 0..2 {
            let (_, data) = guest.next_used_data().unwrap();
            let (header, _) = VsockHeader::read_from_prefix(&data).unwrap();
            assert_eq!(header.op(), VsockOp::RESPONSE);
        }
        assert!(!table.has_readable());

        let setup = Setup {
            guest,
            rx,
            table,
            _events: receiver,
        };
        (setup, host_a, host_b)
    }

    fn next_packet(guest: &mut TestQueue) -> (u16, VsockHeader, Vec<u8>) {
        let (head, data) = guest.next_used_data().unwrap();
        let (header, payload) = VsockHeader::read_from_prefix(&data).unwrap();
        (head, header, payload.to_vec())
    }

    #[test]
    fn idle_connection_chain_goes_to_next() {
        let (mut s, _host_a, mut host_b) = setup();

        // Port 80 is visited first but has nothing to send.
        host_b.write(b"data").unwrap();
        s.table.mark_readable(key(80));
        s.table.mark_readable(key(81));
        let head = s.guest.add_writeable(1);
        assert!(!mux(&mut s.table, &mut s.rx));

        let (used_head, header, payload) = next_packet(&mut s.guest);
        assert_eq!(used_head, head);
        assert_eq!(header.op(), VsockOp::RW);
        assert_eq!(header.src_port.get(), 81);
        assert_eq!(payload, b"data");
        assert!(s.guest.next_used().is_none());
        assert!(s.rx.spare.is_none());
    }

    #[test]
    fn spare_chain_carries_to_later_pass() {
        let (mut s, _host_a, mut host_b) = setup();

        s.table.mark_readable(key(80));
        let head = s.guest.add_writeable(1);
        assert!(!mux(&mut s.table, &mut s.rx));
        assert!(s.guest.next_used().is_none());
        assert!(s.rx.spare.is_some());

        host_b.write(b"later").unwrap();
        s.table.mark_readable(key(81));
        assert!(!mux(&mut s.table, &mut s.rx));
        let (used_head, header, payload) = next_packet(&mut s.guest);
        assert_eq!(used_head, head);
        assert_eq!(header.src_port.get(), 81);
        assert_eq!(payload, b"later");
    }

    #[test]
    fn spare_chain_returned_on_drop() {
        let (mut s, _host_a, _host_b) = setup();

        s.table.mark_readable(key(80));
        let head = s.guest.add_writeable(1);
        assert!(!mux(&mut s.table, &mut s.rx));
        assert!(s.guest.next_used().is_none());

        drop(s.rx);
        assert_eq!(s.guest.next_used(), Some((head, 0)));
    }

    #[test]
    fn header_only_chain_is_not_kept_for_data() {
        let (mut s, _host_a, mut host_b) = setup();

        host_b.write(b"payload").unwrap();
        s.table.mark_readable(key(81));
        let small = s.guest.add_writeable_lengths(&[VSOCK_HEADER_SIZE as u32]);
        // The small chain is handed back and another pass is requested.
        assert!(mux(&mut s.table, &mut s.rx));
        assert_eq!(s.guest.next_used(), Some((small, 0)));
        assert!(s.rx.spare.is_none());
        assert!(s.table.is_readable(&key(81)));

        // The ring is empty now, so the follow-up pass stops.
        assert!(!mux(&mut s.table, &mut s.rx));
        assert!(s.table.is_readable(&key(81)));

        let head = s.guest.add_writeable(1);
        assert!(!mux(&mut s.table, &mut s.rx));
        let (used_head, header, payload) = next_packet(&mut s.guest);
        assert_eq!(used_head, head);
        assert_eq!(header.op(), VsockOp::RW);
        assert_eq!(payload, b"payload");
    }
}

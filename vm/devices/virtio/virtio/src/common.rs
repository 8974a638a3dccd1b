// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::queue::Descriptor;
use crate::queue::DescriptorReader;
use crate::queue::QueueCore;
use crate::queue::QueueError;
use crate::queue::QueueParams;
use guestmem::GuestMemoryError;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use vmcore::interrupt::Interrupt;

/// Publishes completed chains to the used ring and interrupts the guest.
///
/// Shared between a [`VirtioQueue`] and every chain it hands out, so chains
/// can be completed after the queue has moved on.
#[derive(Debug)]
struct VirtioQueueUsedHandler {
    core: QueueCore,
    last_used_index: u16,
    outstanding_desc_count: u16,
    notify_guest: Interrupt,
}

impl VirtioQueueUsedHandler {
    fn complete_descriptor(&mut self, descriptor_index: u16, bytes_written: u32) {
        match self.core.complete_descriptor(
            &mut self.last_used_index,
            descriptor_index,
            bytes_written,
        ) {
            Ok(true) => {
                self.notify_guest.deliver();
            }
            Ok(false) => {}
            Err(err) => {
                tracelimit::error_ratelimited!(
                    error = &err as &dyn std::error::Error,
                    "failed to complete descriptor"
                );
            }
        }
        self.outstanding_desc_count -= 1;
    }
}

#[derive(Debug, Error)]
pub enum VirtioWriteError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Memory(#[from] GuestMemoryError),
    #[error("{0:#x} bytes not written")]
    NotAllWritten(usize),
}

/// A descriptor chain taken from a [`VirtioQueue`].
///
/// Descriptors are read lazily, one link at a time. The chain must be handed
/// back with [`DescriptorChain::complete`] exactly once; until then the guest
/// considers the buffers in flight.
///
/// Dropping a chain without completing it is a bug in the device. Debug
/// builds panic. Release builds log the leak and return the chain with zero
/// bytes so the guest does not lose the descriptors.
#[derive(Debug)]
pub struct DescriptorChain {
    reader: DescriptorReader,
    descriptors: Vec<Descriptor>,
    used_handler: Arc<Mutex<VirtioQueueUsedHandler>>,
    head_index: u16,
    completed: bool,
}

impl DescriptorChain {
    fn new(
        core: QueueCore,
        used_handler: &Arc<Mutex<VirtioQueueUsedHandler>>,
        head_index: u16,
    ) -> Self {
        used_handler.lock().outstanding_desc_count += 1;
        Self {
            reader: DescriptorReader::new(core, head_index),
            descriptors: Vec::new(),
            used_handler: used_handler.clone(),
            head_index,
            completed: false,
        }
    }

    /// The head descriptor index, as reported back in the used ring.
    pub fn head_index(&self) -> u16 {
        self.head_index
    }

    /// Returns `true` if the walk has not reached the end of the chain.
    pub fn has_more(&self) -> bool {
        self.reader.has_more()
    }

    /// Reads the next descriptor in the chain.
    ///
    /// A malformed link ends the walk with an error; the chain must still be
    /// completed.
    pub fn next_descriptor(&mut self) -> Result<Option<Descriptor>, QueueError> {
        let descriptor = self.reader.next().transpose()?;
        if let Some(descriptor) = descriptor {
            self.descriptors.push(descriptor);
        }
        Ok(descriptor)
    }

    /// Walks the remainder of the chain and returns every descriptor in it.
    pub fn descriptors(&mut self) -> Result<&[Descriptor], QueueError> {
        while self.next_descriptor()?.is_some() {}
        Ok(&self.descriptors)
    }

    /// The total size of all readable or all writeable buffers.
    pub fn get_payload_length(&mut self, writeable: bool) -> Result<u64, QueueError> {
        Ok(self
            .descriptors()?
            .iter()
            .filter(|x| x.writeable == writeable)
            .fold(0, |acc, x| acc + x.length as u64))
    }

    /// Reads the readable buffers, starting `offset` bytes in, into `target`.
    /// Returns the number of bytes read, which is short if the buffers end
    /// first.
    pub fn read_at_offset(
        &mut self,
        offset: u64,
        target: &mut [u8],
    ) -> Result<usize, VirtioWriteError> {
        self.descriptors()?;
        let mem = self.reader.core().mem();
        let mut skip_bytes = offset;
        let mut remaining = target;
        let mut read_bytes = 0;
        for payload in self.descriptors.iter().filter(|x| !x.writeable) {
            if remaining.is_empty() {
                break;
            }
            let payload_length = payload.length as u64;
            if skip_bytes >= payload_length {
                skip_bytes -= payload_length;
                continue;
            }
            let size = std::cmp::min((payload_length - skip_bytes) as usize, remaining.len());
            let (current, next) = remaining.split_at_mut(size);
            mem.read_at(payload.address + skip_bytes, current)?;
            read_bytes += size;
            remaining = next;
            skip_bytes = 0;
        }
        Ok(read_bytes)
    }

    /// Writes `source` into the writeable buffers, starting `offset` bytes
    /// in. Fails if the buffers are too small to hold all of it.
    pub fn write_at_offset(&mut self, offset: u64, source: &[u8]) -> Result<(), VirtioWriteError> {
        self.descriptors()?;
        let mem = self.reader.core().mem();
        let mut skip_bytes = offset;
        let mut remaining = source;
        for payload in self.descriptors.iter().filter(|x| x.writeable) {
            if remaining.is_empty() {
                break;
            }
            let payload_length = payload.length as u64;
            if skip_bytes >= payload_length {
                skip_bytes -= payload_length;
                continue;
            }
            let size = std::cmp::min((payload_length - skip_bytes) as usize, remaining.len());
            let (current, next) = remaining.split_at(size);
            mem.write_at(payload.address + skip_bytes, current)?;
            remaining = next;
            skip_bytes = 0;
        }

        if !remaining.is_empty() {
            return Err(VirtioWriteError::NotAllWritten(remaining.len()));
        }
        Ok(())
    }

    /// Returns the chain to the guest, reporting `bytes_written` bytes
    /// written into its writeable buffers.
    pub fn complete(mut self, bytes_written: u32) {
        self.complete_inner(bytes_written);
    }

    fn complete_inner(&mut self, bytes_written: u32) {
        assert!(!self.completed);
        self.used_handler
            .lock()
            .complete_descriptor(self.head_index, bytes_written);
        self.completed = true;
    }
}

impl Drop for DescriptorChain {
    fn drop(&mut self) {
        if !self.completed {
            tracing::error!(
                head_index = self.head_index,
                "descriptor chain dropped without being completed"
            );
            self.complete_inner(0);
            if cfg!(debug_assertions) && !std::thread::panicking() {
                panic!("descriptor chain {} leaked", self.head_index);
            }
        }
    }
}

/// A split virtqueue serviced by a device.
#[derive(Debug)]
pub struct VirtioQueue {
    core: QueueCore,
    last_avail_index: u16,
    used_handler: Arc<Mutex<VirtioQueueUsedHandler>>,
}

impl VirtioQueue {
    /// Binds a queue to guest memory.
    ///
    /// The ring structures must lie within `mem`; descriptor buffers are
    /// checked as they are read.
    pub fn new(
        features: u64,
        params: QueueParams,
        mem: guestmem::GuestMemory,
        notify: Interrupt,
    ) -> Result<Self, QueueError> {
        let core = QueueCore::new(features, mem, params)?;
        let used_handler = Arc::new(Mutex::new(VirtioQueueUsedHandler {
            core: core.clone(),
            last_used_index: 0,
            outstanding_desc_count: 0,
            notify_guest: notify,
        }));
        Ok(Self {
            core,
            last_avail_index: 0,
            used_handler,
        })
    }

    pub fn size(&self) -> u16 {
        self.core.size()
    }

    /// Takes the next chain the guest has made available.
    ///
    /// `Ok(None)` means the ring is empty and guest notifications have been
    /// re-enabled; the caller should wait for the next kick.
    pub fn next_chain(&mut self) -> Result<Option<DescriptorChain>, QueueError> {
        let Some(head_index) = self.core.descriptor_index(self.last_avail_index)? else {
            return Ok(None);
        };
        self.last_avail_index = self.last_avail_index.wrapping_add(1);
        Ok(Some(DescriptorChain::new(
            self.core.clone(),
            &self.used_handler,
            head_index,
        )))
    }

    /// Reads and validates one entry of the descriptor table.
    pub fn read_descriptor(&self, index: u16) -> Result<Descriptor, QueueError> {
        self.core.read_descriptor(index)
    }

    /// Returns `chain` to the guest. Same as [`DescriptorChain::complete`].
    pub fn return_chain(&self, chain: DescriptorChain, bytes_written: u32) {
        chain.complete(bytes_written);
    }

    /// The free-running index of the next available ring entry to consume.
    pub fn last_avail_index(&self) -> u16 {
        self.last_avail_index
    }

    /// The free-running index of the next used ring entry to publish.
    pub fn last_used_index(&self) -> u16 {
        self.used_handler.lock().last_used_index
    }

    /// The number of chains handed out and not yet completed.
    pub fn outstanding(&self) -> u16 {
        self.used_handler.lock().outstanding_desc_count
    }
}

impl Drop for VirtioQueue {
    fn drop(&mut self) {
        let outstanding = self.outstanding();
        if outstanding != 0 {
            tracing::error!(outstanding, "virtio queue dropped with outstanding work pending");
            debug_assert!(
                std::thread::panicking(),
                "virtio queue dropped with {outstanding} outstanding chains"
            );
        }
    }
}

#[derive(Copy, Clone, Debug, Default)]
pub struct DeviceTraits {
    pub device_id: u16,
    pub device_features: u64,
    pub max_queues: u16,
    pub device_register_length: u32,
}

/// A virtio device, as seen by a transport.
pub trait VirtioDevice: Send {
    fn traits(&self) -> DeviceTraits;
    /// Reads the device-specific configuration space.
    fn read_registers_u32(&self, offset: u16) -> u32;
    fn write_registers_u32(&mut self, offset: u16, val: u32);
    /// Starts the device with the queues the driver configured.
    fn enable(&mut self, resources: Resources);
    /// The guest wrote the notify register for `queue_index`.
    fn queue_notify(&self, queue_index: u16);
    /// Stops the device. Must be idempotent.
    fn disable(&mut self);
}

pub struct QueueResources {
    pub params: QueueParams,
    pub notify: Interrupt,
}

pub struct Resources {
    pub features: u64,
    pub queues: Vec<QueueResources>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::queue::DescriptorFlags;
    use crate::spec::*;
    use crate::test_helpers::TestQueue;
    use guestmem::GuestMemory;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use test_with_tracing::test;

    struct Harness {
        guest: TestQueue,
        queue: VirtioQueue,
        interrupts: Arc<AtomicUsize>,
    }

    impl Harness {
        fn new(size: u16, features: u64) -> Self {
            let mem = GuestMemory::allocate(TestQueue::memory_size(size, 0x100) as usize + 0x2000);
            let guest = TestQueue::new(&mem, 0, size, 0x100, features);
            let interrupts = Arc::new(AtomicUsize::new(0));
            let queue = VirtioQueue::new(
                features,
                guest.params(),
                mem,
                Interrupt::from_fn({
                    let interrupts = interrupts.clone();
                    move || {
                        interrupts.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
            .unwrap();
            Self {
                guest,
                queue,
                interrupts,
            }
        }

        fn interrupts(&self) -> usize {
            self.interrupts.load(Ordering::SeqCst)
        }
    }

    fn event_idx() -> u64 {
        VIRTIO_F_RING_EVENT_IDX as u64 | VIRTIO_F_RING_INDIRECT_DESC as u64
    }

    #[test]
    fn verify_queue_simple() {
        let mut h = Harness::new(2, event_idx());
        assert!(h.queue.next_chain().unwrap().is_none());

        let head = h.guest.add_writeable(1);
        let mut chain = h.queue.next_chain().unwrap().unwrap();
        assert_eq!(chain.head_index(), head);
        let descriptors = chain.descriptors().unwrap().to_vec();
        assert_eq!(
            descriptors,
            [Descriptor {
                address: h.guest.buffer_address(head),
                length: 0x100,
                next_index: 0,
                has_next: false,
                writeable: true,
            }]
        );
        assert_eq!(h.queue.outstanding(), 1);
        h.queue.return_chain(chain, 123);

        assert_eq!(h.interrupts(), 1);
        assert_eq!(h.queue.outstanding(), 0);
        assert_eq!(h.guest.next_used(), Some((head, 123)));
        assert_eq!(h.guest.next_used(), None);
        assert!(h.queue.next_chain().unwrap().is_none());
    }

    #[test]
    fn verify_queue_linked() {
        let mut h = Harness::new(8, event_idx());
        let head = h
            .guest
            .add_readable(&[b"hello ".as_slice(), b"virtio ", b"world"]);
        let mut chain = h.queue.next_chain().unwrap().unwrap();
        assert!(chain.has_more());
        let mut count = 0;
        while let Some(descriptor) = chain.next_descriptor().unwrap() {
            assert!(!descriptor.writeable);
            count += 1;
        }
        assert_eq!(count, 3);
        assert!(!chain.has_more());
        assert_eq!(chain.get_payload_length(false).unwrap(), 18);
        assert_eq!(chain.get_payload_length(true).unwrap(), 0);

        let mut data = [0; 32];
        assert_eq!(chain.read_at_offset(0, &mut data).unwrap(), 18);
        assert_eq!(&data[..18], b"hello virtio world");
        let mut tail = [0; 8];
        assert_eq!(chain.read_at_offset(10, &mut tail).unwrap(), 8);
        assert_eq!(&tail, b"io world");
        chain.complete(0);
        assert_eq!(h.guest.next_used(), Some((head, 0)));
    }

    #[test]
    fn verify_write_spans_descriptors() {
        let mut h = Harness::new(8, event_idx());
        let head = h.guest.add_writeable(3);
        let mut chain = h.queue.next_chain().unwrap().unwrap();
        assert_eq!(chain.get_payload_length(true).unwrap(), 0x300);
        let data: Vec<u8> = (0..0x180).map(|x| x as u8).collect();
        chain.write_at_offset(0x20, &data).unwrap();
        assert!(matches!(
            chain.write_at_offset(0x2ff, &[1, 2]),
            Err(VirtioWriteError::NotAllWritten(1))
        ));
        chain.complete(0x1a0);
        let (used_head, written) = h.guest.next_used_data().unwrap();
        assert_eq!(used_head, head);
        assert_eq!(written.len(), 0x1a0);
        assert_eq!(&written[0x20..], &data[..]);
    }

    #[test]
    fn verify_queue_indirect() {
        let mut h = Harness::new(4, event_idx());
        let head = h.guest.add_indirect(&[(0x1000, 0x10, false), (0x1010, 0x20, true)]);
        let mut chain = h.queue.next_chain().unwrap().unwrap();
        let descriptors = chain.descriptors().unwrap();
        assert_eq!(descriptors.len(), 2);
        assert_eq!(descriptors[0].address, 0x1000);
        assert!(!descriptors[0].writeable);
        assert_eq!(descriptors[1].length, 0x20);
        assert!(descriptors[1].writeable);
        chain.complete(0);
        assert_eq!(h.guest.next_used(), Some((head, 0)));
    }

    #[test]
    fn verify_indirect_not_negotiated() {
        let mut h = Harness::new(4, VIRTIO_F_RING_EVENT_IDX as u64);
        h.guest.add_indirect(&[(0x1000, 0x10, false)]);
        let mut chain = h.queue.next_chain().unwrap().unwrap();
        assert!(matches!(
            chain.next_descriptor(),
            Err(QueueError::IndirectNotNegotiated)
        ));
        assert!(!chain.has_more());
        chain.complete(0);
    }

    #[test]
    fn verify_out_of_range_descriptor() {
        let mut h = Harness::new(4, event_idx());
        let head = h.guest.add_writeable(1);
        h.guest
            .set_descriptor(head, 0xffff_ffff_0000, 0x100, DescriptorFlags::new(), 0);
        assert!(matches!(
            h.queue.read_descriptor(head),
            Err(QueueError::OutOfRange { .. })
        ));
        assert!(matches!(
            h.queue.read_descriptor(4),
            Err(QueueError::InvalidIndex { index: 4, size: 4 })
        ));

        // The bad chain is still consumed and returned; the queue keeps going.
        let mut chain = h.queue.next_chain().unwrap().unwrap();
        assert!(chain.descriptors().is_err());
        chain.complete(0);
        assert_eq!(h.guest.next_used(), Some((head, 0)));

        let head = h.guest.add_writeable(1);
        let mut chain = h.queue.next_chain().unwrap().unwrap();
        assert_eq!(chain.descriptors().unwrap().len(), 1);
        chain.complete(1);
        assert_eq!(h.guest.next_used(), Some((head, 1)));
    }

    #[test]
    fn verify_chain_cycle() {
        let mut h = Harness::new(4, event_idx());
        let head = h.guest.add_writeable(2);
        let second = h.guest.descriptor(head).next.get();
        let flags = DescriptorFlags::new().with_next(true).with_write(true);
        h.guest
            .set_descriptor(second, h.guest.buffer_address(second), 0x100, flags, head);
        let mut chain = h.queue.next_chain().unwrap().unwrap();
        assert!(matches!(chain.descriptors(), Err(QueueError::TooLong)));
        chain.complete(0);
    }

    #[test]
    fn verify_invalid_size() {
        let mem = GuestMemory::allocate(0x10000);
        for size in [0, 3, 0x8001] {
            let params = QueueParams {
                size,
                enable: true,
                desc_addr: 0,
                avail_addr: 0x1000,
                used_addr: 0x2000,
            };
            assert!(matches!(
                VirtioQueue::new(0, params, mem.clone(), Interrupt::null()),
                Err(QueueError::InvalidSize(_))
            ));
        }
        let params = QueueParams {
            size: 16,
            enable: true,
            desc_addr: 0,
            avail_addr: 0x1000,
            used_addr: 0xfff0,
        };
        assert!(matches!(
            VirtioQueue::new(0, params, mem, Interrupt::null()),
            Err(QueueError::Memory(_))
        ));
    }

    #[test]
    fn verify_queue_avail_rollover() {
        let mut h = Harness::new(2, event_idx());
        for i in 0..0x10010u32 {
            let head = h.guest.add_writeable(1);
            let chain = h.queue.next_chain().unwrap().unwrap();
            assert_eq!(chain.head_index(), head);
            chain.complete(i & 0xff);
            assert_eq!(h.guest.next_used(), Some((head, i & 0xff)));
            assert_eq!(h.queue.last_avail_index(), (i + 1) as u16);
            assert_eq!(h.queue.last_used_index(), (i + 1) as u16);
        }
        assert!(h.queue.next_chain().unwrap().is_none());
        assert_eq!(h.queue.last_avail_index(), 0x0010);
    }

    #[test]
    fn verify_event_idx_notification_suppression() {
        let mut h = Harness::new(8, event_idx());
        h.guest.add_writeable(1);
        h.guest.add_writeable(1);
        // While work is pending the guest is asked not to notify.
        let a = h.queue.next_chain().unwrap().unwrap();
        assert_eq!(h.guest.avail_event(), 1);
        let b = h.queue.next_chain().unwrap().unwrap();
        assert!(h.queue.next_chain().unwrap().is_none());
        // Empty ring: notify on the next publish.
        assert_eq!(h.guest.avail_event(), 2);

        // The guest wants an interrupt once two entries are used.
        h.guest.set_used_event(1);
        a.complete(0);
        assert_eq!(h.interrupts(), 0);
        b.complete(0);
        assert_eq!(h.interrupts(), 1);
    }

    #[test]
    fn verify_flags_notification_suppression() {
        let mut h = Harness::new(8, VIRTIO_F_VERSION_1 as u64);
        h.guest.add_writeable(1);
        let chain = h.queue.next_chain().unwrap().unwrap();
        assert!(h.guest.used_flags().no_notify());
        assert!(h.queue.next_chain().unwrap().is_none());
        assert!(!h.guest.used_flags().no_notify());

        h.guest.set_no_interrupt(true);
        chain.complete(0);
        assert_eq!(h.interrupts(), 0);

        h.guest.set_no_interrupt(false);
        h.guest.add_writeable(1);
        h.queue.next_chain().unwrap().unwrap().complete(0);
        assert_eq!(h.interrupts(), 1);
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "leaked"))]
    fn verify_leaked_chain_is_returned() {
        let mut h = Harness::new(2, event_idx());
        let head = h.guest.add_writeable(1);
        let chain = h.queue.next_chain().unwrap().unwrap();
        drop(chain);
        assert_eq!(h.queue.outstanding(), 0);
        assert_eq!(h.guest.next_used(), Some((head, 0)));
    }

    #[derive(Debug, Clone)]
    enum Step {
        Publish,
        Complete,
        SetUsedEvent(u16),
        SetNoInterrupt(bool),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            3 => Just(Step::Publish),
            3 => Just(Step::Complete),
            1 => any::<u16>().prop_map(Step::SetUsedEvent),
            1 => any::<bool>().prop_map(Step::SetNoInterrupt),
        ]
    }

    proptest! {
        #[test]
        fn interrupt_suppression(use_event_idx in any::<bool>(), steps in prop::collection::vec(step(), 1..200)) {
            let features = if use_event_idx { event_idx() } else { 0 };
            let mut h = Harness::new(16, features);
            let mut pending = std::collections::VecDeque::new();
            let mut returned = 0u16;
            for step in steps {
                match step {
                    Step::Publish => {
                        if pending.len() < 16 && h.guest.free_descriptors() > 0 {
                            h.guest.add_writeable(1);
                            let chain = h.queue.next_chain().unwrap().unwrap();
                            pending.push_back(chain);
                        }
                    }
                    Step::Complete => {
                        if let Some(chain) = pending.pop_front() {
                            let before = h.interrupts();
                            let used_event = h.guest.used_event();
                            let no_interrupt = h.guest.avail_flags().no_interrupt();
                            chain.complete(0);
                            returned = returned.wrapping_add(1);
                            let expected = if use_event_idx {
                                returned == used_event.wrapping_add(1)
                            } else {
                                !no_interrupt
                            };
                            prop_assert_eq!(h.interrupts() - before, expected as usize);
                            prop_assert!(h.guest.next_used().is_some());
                        }
                    }
                    Step::SetUsedEvent(event) => h.guest.set_used_event(event),
                    Step::SetNoInterrupt(value) => h.guest.set_no_interrupt(value),
                }
                prop_assert_eq!(h.queue.last_used_index(), returned);
                prop_assert_eq!(
                    h.queue.last_avail_index(),
                    returned.wrapping_add(pending.len() as u16)
                );
            }
            for chain in pending {
                chain.complete(0);
            }
        }
    }
}

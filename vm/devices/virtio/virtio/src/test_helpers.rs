// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A minimal guest-side driver for exercising queues in tests.

use crate::queue::QueueParams;
use crate::spec::queue::*;
use crate::spec::u16_le;
use guestmem::GuestMemory;
use std::collections::HashMap;
use std::sync::atomic;

fn align_page(x: u64) -> u64 {
    (x + 0xfff) & !0xfff
}

struct Layout {
    avail: u64,
    used: u64,
    buffers: u64,
}

impl Layout {
    fn new(size: u16) -> Self {
        let avail = DESCRIPTOR_SIZE * size as u64;
        let used = align_page(avail + avail_ring_size(size));
        let buffers = align_page(used + used_ring_size(size));
        Self {
            avail,
            used,
            buffers,
        }
    }
}

/// Plays the driver side of one split virtqueue: lays out the rings, hands
/// out descriptors with a fixed-size buffer each, and consumes used entries.
pub struct TestQueue {
    mem: GuestMemory,
    base: u64,
    size: u16,
    features: u64,
    layout: Layout,
    buffer_size: u32,
    free: Vec<bool>,
    chains: HashMap<u16, Vec<u16>>,
    avail_index: u16,
    last_used_index: u16,
}

impl TestQueue {
    /// The bytes of guest memory a queue of `size` entries needs.
    pub fn memory_size(size: u16, buffer_size: u32) -> u64 {
        Layout::new(size).buffers + size as u64 * buffer_size as u64
    }

    /// Lays out a zeroed queue at `base`.
    pub fn new(mem: &GuestMemory, base: u64, size: u16, buffer_size: u32, features: u64) -> Self {
        let layout = Layout::new(size);
        mem.fill_at(base, 0, Self::memory_size(size, buffer_size) as usize)
            .unwrap();
        Self {
            mem: mem.clone(),
            base,
            size,
            features,
            layout,
            buffer_size,
            free: vec![true; size as usize],
            chains: HashMap::new(),
            avail_index: 0,
            last_used_index: 0,
        }
    }

    pub fn params(&self) -> QueueParams {
        QueueParams {
            size: self.size,
            enable: true,
            desc_addr: self.base,
            avail_addr: self.base + self.layout.avail,
            used_addr: self.base + self.layout.used,
        }
    }

    pub fn features(&self) -> u64 {
        self.features
    }

    fn event_idx(&self) -> bool {
        crate::spec::has_feature(self.features, crate::spec::VIRTIO_F_RING_EVENT_IDX)
    }

    pub fn buffer_address(&self, index: u16) -> u64 {
        self.base + self.layout.buffers + index as u64 * self.buffer_size as u64
    }

    pub fn free_descriptors(&self) -> usize {
        self.free.iter().filter(|&&x| x).count()
    }

    fn reserve(&mut self) -> u16 {
        let index = self
            .free
            .iter()
            .position(|&x| x)
            .expect("no descriptors are available");
        self.free[index] = false;
        index as u16
    }

    fn descriptor_address(&self, index: u16) -> u64 {
        self.base + DESCRIPTOR_SIZE * index as u64
    }

    pub fn descriptor(&self, index: u16) -> Descriptor {
        self.mem.read_plain(self.descriptor_address(index)).unwrap()
    }

    pub fn set_descriptor(
        &self,
        index: u16,
        address: u64,
        length: u32,
        flags: DescriptorFlags,
        next: u16,
    ) {
        self.mem
            .write_plain(
                self.descriptor_address(index),
                &Descriptor::new(address, length, flags, next),
            )
            .unwrap();
    }

    fn link(&mut self, lengths: &[u32], write: bool) -> u16 {
        let indices: Vec<u16> = lengths.iter().map(|_| self.reserve()).collect();
        for (i, (&index, &length)) in indices.iter().zip(lengths).enumerate() {
            let next = indices.get(i + 1).copied();
            self.set_descriptor(
                index,
                self.buffer_address(index),
                length,
                DescriptorFlags::new()
                    .with_write(write)
                    .with_next(next.is_some()),
                next.unwrap_or(0),
            );
        }
        let head = indices[0];
        self.chains.insert(head, indices);
        self.publish(head);
        head
    }

    /// Publishes a chain of readable descriptors, one per buffer.
    pub fn add_readable(&mut self, buffers: &[&[u8]]) -> u16 {
        let lengths: Vec<u32> = buffers
            .iter()
            .map(|b| {
                assert!(b.len() <= self.buffer_size as usize);
                b.len() as u32
            })
            .collect();
        let head = self.link(&lengths, false);
        for (&index, buffer) in self.chains[&head].iter().zip(buffers) {
            self.mem.write_at(self.buffer_address(index), buffer).unwrap();
        }
        head
    }

    /// Publishes a chain of `count` writeable descriptors.
    pub fn add_writeable(&mut self, count: u16) -> u16 {
        self.link(&vec![self.buffer_size; count as usize], true)
    }

    /// Publishes a chain of writeable descriptors with the given lengths.
    pub fn add_writeable_lengths(&mut self, lengths: &[u32]) -> u16 {
        assert!(lengths.iter().all(|&len| len <= self.buffer_size));
        self.link(lengths, true)
    }

    /// Publishes one indirect descriptor whose table holds `buffers`, given
    /// as `(address, length, writeable)`.
    pub fn add_indirect(&mut self, buffers: &[(u64, u32, bool)]) -> u16 {
        let head = self.reserve();
        let table = self.buffer_address(head);
        assert!(buffers.len() as u64 * DESCRIPTOR_SIZE <= self.buffer_size as u64);
        for (i, &(address, length, write)) in buffers.iter().enumerate() {
            let has_next = i + 1 < buffers.len();
            let entry = Descriptor::new(
                address,
                length,
                DescriptorFlags::new()
                    .with_write(write)
                    .with_next(has_next),
                if has_next { i as u16 + 1 } else { 0 },
            );
            self.mem
                .write_plain(table + DESCRIPTOR_SIZE * i as u64, &entry)
                .unwrap();
        }
        self.set_descriptor(
            head,
            table,
            (buffers.len() as u64 * DESCRIPTOR_SIZE) as u32,
            DescriptorFlags::new().with_indirect(true),
            0,
        );
        self.chains.insert(head, vec![head]);
        self.publish(head);
        head
    }

    fn publish(&mut self, head: u16) {
        let avail = self.base + self.layout.avail;
        let slot = (self.avail_index % self.size) as u64;
        self.write_u16(avail + AVAIL_OFFSET_RING + AVAIL_ELEMENT_SIZE * slot, head);
        self.avail_index = self.avail_index.wrapping_add(1);
        atomic::fence(atomic::Ordering::Release);
        self.write_u16(avail + AVAIL_OFFSET_IDX, self.avail_index);
    }

    fn read_u16(&self, address: u64) -> u16 {
        self.mem.read_plain::<u16_le>(address).unwrap().get()
    }

    fn write_u16(&self, address: u64, value: u16) {
        self.mem.write_plain::<u16_le>(address, &value.into()).unwrap();
    }

    pub fn avail_flags(&self) -> AvailableFlags {
        self.read_u16(self.base + self.layout.avail + AVAIL_OFFSET_FLAGS)
            .into()
    }

    pub fn set_no_interrupt(&self, no_interrupt: bool) {
        self.write_u16(
            self.base + self.layout.avail + AVAIL_OFFSET_FLAGS,
            AvailableFlags::new().with_no_interrupt(no_interrupt).into(),
        );
    }

    pub fn used_event(&self) -> u16 {
        self.read_u16(self.base + self.layout.avail + avail_offset_used_event(self.size))
    }

    pub fn set_used_event(&self, index: u16) {
        self.write_u16(
            self.base + self.layout.avail + avail_offset_used_event(self.size),
            index,
        );
    }

    pub fn avail_event(&self) -> u16 {
        self.read_u16(self.base + self.layout.used + used_offset_avail_event(self.size))
    }

    pub fn used_flags(&self) -> UsedFlags {
        self.read_u16(self.base + self.layout.used + USED_OFFSET_FLAGS)
            .into()
    }

    pub fn used_index(&self) -> u16 {
        self.read_u16(self.base + self.layout.used + USED_OFFSET_IDX)
    }

    fn take_used(&mut self) -> Option<(u16, u32, Vec<u16>)> {
        let used = self.base + self.layout.used;
        let used_index = self.used_index();
        if used_index == self.last_used_index {
            return None;
        }
        atomic::fence(atomic::Ordering::Acquire);
        let slot = (self.last_used_index % self.size) as u64;
        let element: UsedElement = self
            .mem
            .read_plain(used + USED_OFFSET_RING + USED_ELEMENT_SIZE * slot)
            .unwrap();
        self.last_used_index = self.last_used_index.wrapping_add(1);
        if self.event_idx() {
            // Ask to be interrupted for the next completion.
            self.set_used_event(used_index);
        }
        let head = element.id.get() as u16;
        let indices = self.chains.remove(&head).expect("unknown head");
        for &index in &indices {
            assert!(!self.free[index as usize]);
            self.free[index as usize] = true;
        }
        Some((head, element.len.get(), indices))
    }

    /// Consumes the next used entry, returning `(head, len)`.
    pub fn next_used(&mut self) -> Option<(u16, u32)> {
        self.take_used().map(|(head, len, _)| (head, len))
    }

    /// Consumes the next used entry and returns the `len` bytes the device
    /// wrote into the chain's buffers.
    pub fn next_used_data(&mut self) -> Option<(u16, Vec<u8>)> {
        let (head, len, indices) = self.take_used()?;
        let mut data = Vec::with_capacity(len as usize);
        for index in indices {
            let descriptor = self.descriptor(index);
            let n = (len as usize - data.len()).min(descriptor.length.get() as usize);
            let mut chunk = vec![0; n];
            self.mem
                .read_at(descriptor.address.get(), &mut chunk)
                .unwrap();
            data.extend(chunk);
        }
        assert_eq!(data.len(), len as usize, "used length exceeds the chain");
        Some((head, data))
    }
}

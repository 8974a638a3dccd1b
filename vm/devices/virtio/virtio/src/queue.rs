// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Core split virtqueue implementation, without notification delivery or any
//! transport-specific details.
//!
//! Everything here reads structures the guest can rewrite at any time, so
//! nothing read from the rings is trusted: indices are range checked, buffer
//! addresses are checked against guest memory, and chain walks are bounded.

use crate::spec::queue as spec;
use crate::spec::u16_le;
use guestmem::GuestMemory;
use guestmem::GuestMemoryError;
use std::sync::atomic;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("error accessing queue memory")]
    Memory(#[source] GuestMemoryError),
    #[error("queue size {0} is not a power of two between 1 and 32768")]
    InvalidSize(u16),
    #[error("descriptor index {index} is outside a table of {size} entries")]
    InvalidIndex { index: u16, size: u16 },
    #[error("descriptor buffer {address:#x}+{length:#x} is outside guest memory")]
    OutOfRange {
        address: u64,
        length: u32,
        #[source]
        source: GuestMemoryError,
    },
    #[error("an indirect descriptor was used without negotiating indirect descriptors")]
    IndirectNotNegotiated,
    #[error("indirect descriptor table length {0:#x} is not a non-empty multiple of 16")]
    InvalidIndirectTable(u32),
    #[error("an indirect descriptor had the indirect flag set")]
    DoubleIndirect,
    #[error("a descriptor chain is too long or has a cycle")]
    TooLong,
}

#[derive(Debug, Copy, Clone, Default)]
pub struct QueueParams {
    pub size: u16,
    pub enable: bool,
    pub desc_addr: u64,
    pub avail_addr: u64,
    pub used_addr: u64,
}

/// A validated view of one descriptor.
///
/// `address..address + length` has been checked against guest memory.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub address: u64,
    pub length: u32,
    pub next_index: u16,
    pub has_next: bool,
    pub writeable: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct QueueCore {
    queue_size: u16,
    queue_desc: GuestMemory,
    queue_avail: GuestMemory,
    queue_used: GuestMemory,
    use_ring_event_index: bool,
    use_indirect: bool,
    mem: GuestMemory,
}

impl QueueCore {
    pub fn new(features: u64, mem: GuestMemory, params: QueueParams) -> Result<Self, QueueError> {
        if params.size == 0
            || !params.size.is_power_of_two()
            || params.size > spec::MAX_QUEUE_SIZE
        {
            return Err(QueueError::InvalidSize(params.size));
        }

        let queue_desc = mem
            .subrange(
                params.desc_addr,
                spec::DESCRIPTOR_SIZE * params.size as u64,
            )
            .map_err(QueueError::Memory)?;
        let queue_avail = mem
            .subrange(params.avail_addr, spec::avail_ring_size(params.size))
            .map_err(QueueError::Memory)?;
        let queue_used = mem
            .subrange(params.used_addr, spec::used_ring_size(params.size))
            .map_err(QueueError::Memory)?;

        Ok(Self {
            queue_size: params.size,
            queue_desc,
            queue_avail,
            queue_used,
            use_ring_event_index: crate::spec::has_feature(
                features,
                crate::spec::VIRTIO_F_RING_EVENT_IDX,
            ),
            use_indirect: crate::spec::has_feature(
                features,
                crate::spec::VIRTIO_F_RING_INDIRECT_DESC,
            ),
            mem,
        })
    }

    pub fn size(&self) -> u16 {
        self.queue_size
    }

    pub fn mem(&self) -> &GuestMemory {
        &self.mem
    }

    fn read_u16(ring: &GuestMemory, offset: u64) -> Result<u16, QueueError> {
        Ok(ring
            .read_plain::<u16_le>(offset)
            .map_err(QueueError::Memory)?
            .get())
    }

    fn write_u16(ring: &GuestMemory, offset: u64, value: u16) -> Result<(), QueueError> {
        ring.write_plain::<u16_le>(offset, &value.into())
            .map_err(QueueError::Memory)
    }

    fn set_used_flags(&self, flags: spec::UsedFlags) -> Result<(), QueueError> {
        Self::write_u16(&self.queue_used, spec::USED_OFFSET_FLAGS, flags.into())
    }

    fn get_available_index(&self) -> Result<u16, QueueError> {
        Self::read_u16(&self.queue_avail, spec::AVAIL_OFFSET_IDX)
    }

    fn set_available_event(&self, index: u16) -> Result<(), QueueError> {
        Self::write_u16(
            &self.queue_used,
            spec::used_offset_avail_event(self.queue_size),
            index,
        )
    }

    fn get_available_flags(&self) -> Result<spec::AvailableFlags, QueueError> {
        Self::read_u16(&self.queue_avail, spec::AVAIL_OFFSET_FLAGS).map(Into::into)
    }

    fn get_used_event(&self) -> Result<u16, QueueError> {
        Self::read_u16(
            &self.queue_avail,
            spec::avail_offset_used_event(self.queue_size),
        )
    }

    /// Returns whether the guest has published a chain at `last_avail_index`.
    ///
    /// While work is pending the guest is asked not to notify. Before
    /// reporting the ring empty, notifications are re-enabled and the index
    /// is read again, so a chain published concurrently is never missed.
    fn is_available(&self, last_avail_index: u16) -> Result<bool, QueueError> {
        let mut avail_index = self.get_available_index()?;
        if avail_index == last_avail_index {
            if self.use_ring_event_index {
                self.set_available_event(avail_index)?;
            } else {
                self.set_used_flags(spec::UsedFlags::new())?;
            }
            // The avail event or used flags must be visible to the guest
            // before the available index is checked again.
            atomic::fence(atomic::Ordering::SeqCst);
            avail_index = self.get_available_index()?;
            if avail_index == last_avail_index {
                return Ok(false);
            }
        }
        if self.use_ring_event_index {
            self.set_available_event(avail_index.wrapping_sub(1))?;
        } else {
            self.set_used_flags(spec::UsedFlags::new().with_no_notify(true))?;
        }
        // Order the available index read before the ring entry and
        // descriptor reads that follow.
        atomic::fence(atomic::Ordering::Acquire);
        Ok(true)
    }

    /// Returns the head descriptor index published at `last_avail_index`, if
    /// any. The head is not validated here.
    pub fn descriptor_index(&self, last_avail_index: u16) -> Result<Option<u16>, QueueError> {
        if !self.is_available(last_avail_index)? {
            return Ok(None);
        }
        let wrapped_index = (last_avail_index % self.queue_size) as u64;
        Self::read_u16(
            &self.queue_avail,
            spec::AVAIL_OFFSET_RING + spec::AVAIL_ELEMENT_SIZE * wrapped_index,
        )
        .map(Some)
    }

    fn read_raw(
        &self,
        table: &GuestMemory,
        table_size: u16,
        index: u16,
    ) -> Result<spec::Descriptor, QueueError> {
        if index >= table_size {
            return Err(QueueError::InvalidIndex {
                index,
                size: table_size,
            });
        }
        let descriptor: spec::Descriptor = table
            .read_plain(index as u64 * spec::DESCRIPTOR_SIZE)
            .map_err(QueueError::Memory)?;
        let (address, length) = (descriptor.address.get(), descriptor.length.get());
        self.mem
            .probe_range(address, length as u64)
            .map_err(|source| QueueError::OutOfRange {
                address,
                length,
                source,
            })?;
        Ok(descriptor)
    }

    /// Reads and validates entry `index` of the descriptor table.
    pub fn read_descriptor(&self, index: u16) -> Result<Descriptor, QueueError> {
        let raw = self.read_raw(&self.queue_desc, self.queue_size, index)?;
        Ok(view(&raw))
    }

    /// Publishes a used element for `descriptor_index` and returns whether
    /// the guest should be interrupted.
    pub fn complete_descriptor(
        &self,
        queue_last_used_index: &mut u16,
        descriptor_index: u16,
        bytes_written: u32,
    ) -> Result<bool, QueueError> {
        let wrapped_index = (*queue_last_used_index % self.queue_size) as u64;
        self.queue_used
            .write_plain(
                spec::USED_OFFSET_RING + spec::USED_ELEMENT_SIZE * wrapped_index,
                &spec::UsedElement {
                    id: (descriptor_index as u32).into(),
                    len: bytes_written.into(),
                },
            )
            .map_err(QueueError::Memory)?;
        let last_used_index = *queue_last_used_index;
        *queue_last_used_index = queue_last_used_index.wrapping_add(1);

        // The used element must be visible before the used index.
        atomic::fence(atomic::Ordering::Release);
        Self::write_u16(
            &self.queue_used,
            spec::USED_OFFSET_IDX,
            *queue_last_used_index,
        )?;

        // The used index must be visible before reading the field that
        // decides whether to signal.
        atomic::fence(atomic::Ordering::SeqCst);
        let send_signal = if self.use_ring_event_index {
            // Equivalent to the new used index being `used_event + 1`.
            last_used_index == self.get_used_event()?
        } else {
            !self.get_available_flags()?.no_interrupt()
        };
        Ok(send_signal)
    }
}

fn view(raw: &spec::Descriptor) -> Descriptor {
    let flags = raw.flags();
    Descriptor {
        address: raw.address.get(),
        length: raw.length.get(),
        next_index: raw.next.get(),
        has_next: flags.next(),
        writeable: flags.write(),
    }
}

/// Walks one descriptor chain, following an indirect table if the head
/// points at one.
#[derive(Debug)]
pub(crate) struct DescriptorReader {
    queue: QueueCore,
    indirect_queue: Option<(GuestMemory, u16)>,
    descriptor_index: Option<u16>,
    num_read: u32,
}

impl DescriptorReader {
    pub fn new(queue: QueueCore, head_index: u16) -> Self {
        Self {
            queue,
            indirect_queue: None,
            descriptor_index: Some(head_index),
            num_read: 0,
        }
    }

    pub fn has_more(&self) -> bool {
        self.descriptor_index.is_some()
    }

    pub fn core(&self) -> &QueueCore {
        &self.queue
    }

    fn next_descriptor(&mut self) -> Result<Option<Descriptor>, QueueError> {
        let Some(descriptor_index) = self.descriptor_index else {
            return Ok(None);
        };
        // Any failure ends the walk.
        self.descriptor_index = None;

        let descriptor = match &self.indirect_queue {
            Some((table, size)) => self.queue.read_raw(table, *size, descriptor_index)?,
            None => {
                self.queue
                    .read_raw(&self.queue.queue_desc, self.queue.queue_size, descriptor_index)?
            }
        };
        let descriptor = if !descriptor.flags().indirect() {
            descriptor
        } else {
            if self.indirect_queue.is_some() {
                return Err(QueueError::DoubleIndirect);
            }
            if !self.queue.use_indirect {
                return Err(QueueError::IndirectNotNegotiated);
            }
            let length = descriptor.length.get();
            if length == 0 || length as u64 % spec::DESCRIPTOR_SIZE != 0 {
                return Err(QueueError::InvalidIndirectTable(length));
            }
            let size = (length as u64 / spec::DESCRIPTOR_SIZE)
                .try_into()
                .map_err(|_| QueueError::InvalidIndirectTable(length))?;
            let table = self
                .queue
                .mem
                .subrange(descriptor.address.get(), length as u64)
                .map_err(QueueError::Memory)?;
            let (table, size) = self.indirect_queue.insert((table, size));
            let first = self.queue.read_raw(table, *size, 0)?;
            if first.flags().indirect() {
                return Err(QueueError::DoubleIndirect);
            }
            first
        };

        // A chain cannot legitimately visit more descriptors than its table
        // holds, so anything longer is a cycle.
        self.num_read += 1;
        let limit = match &self.indirect_queue {
            Some((_, size)) => *size as u32,
            None => self.queue.queue_size as u32,
        };
        if descriptor.flags().next() {
            if self.num_read >= limit {
                return Err(QueueError::TooLong);
            }
            self.descriptor_index = Some(descriptor.next.get());
        }

        Ok(Some(view(&descriptor)))
    }
}

impl Iterator for DescriptorReader {
    type Item = Result<Descriptor, QueueError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_descriptor().transpose()
    }
}

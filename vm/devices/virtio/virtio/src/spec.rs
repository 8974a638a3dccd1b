// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Constants and layouts defined by the virtio spec.

pub use packed_nums::*;

#[allow(non_camel_case_types)]
mod packed_nums {
    pub type u16_le = zerocopy::U16<zerocopy::LittleEndian>;
    pub type u32_le = zerocopy::U32<zerocopy::LittleEndian>;
    pub type u64_le = zerocopy::U64<zerocopy::LittleEndian>;
}

// Device features, first bank.
pub const VIRTIO_F_RING_INDIRECT_DESC: u32 = 0x10000000;
pub const VIRTIO_F_RING_EVENT_IDX: u32 = 0x20000000;
// Device features, second bank (bit 32 of the 64-bit feature word).
pub const VIRTIO_F_VERSION_1: u32 = 1;

/// Returns `true` if `bit` from the first feature bank is set in `features`.
pub fn has_feature(features: u64, bit: u32) -> bool {
    features & u64::from(bit) != 0
}

/// Split virtqueue layouts.
pub mod queue {
    use super::u16_le;
    use super::u32_le;
    use super::u64_le;
    use bitfield_struct::bitfield;
    use zerocopy::FromBytes;
    use zerocopy::Immutable;
    use zerocopy::IntoBytes;
    use zerocopy::KnownLayout;

    /// The largest queue size allowed for a split virtqueue.
    pub const MAX_QUEUE_SIZE: u16 = 32768;

    /// A descriptor table entry as laid out in guest memory.
    #[repr(C)]
    #[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct Descriptor {
        pub address: u64_le,
        pub length: u32_le,
        pub flags_raw: u16_le,
        pub next: u16_le,
    }

    impl Descriptor {
        pub fn new(address: u64, length: u32, flags: DescriptorFlags, next: u16) -> Self {
            Self {
                address: address.into(),
                length: length.into(),
                flags_raw: u16::from(flags).into(),
                next: next.into(),
            }
        }

        pub fn flags(&self) -> DescriptorFlags {
            self.flags_raw.get().into()
        }
    }

    pub const DESCRIPTOR_SIZE: u64 = size_of::<Descriptor>() as u64;

    #[bitfield(u16)]
    #[derive(PartialEq, Eq)]
    pub struct DescriptorFlags {
        pub next: bool,
        pub write: bool,
        pub indirect: bool,
        #[bits(13)]
        _reserved: u16,
    }

    // struct virtq_avail {
    //     le16 flags;
    //     le16 idx;
    //     le16 ring[queue_size];
    //     le16 used_event;
    // }
    pub const AVAIL_OFFSET_FLAGS: u64 = 0;
    pub const AVAIL_OFFSET_IDX: u64 = 2;
    pub const AVAIL_OFFSET_RING: u64 = 4;
    pub const AVAIL_ELEMENT_SIZE: u64 = size_of::<u16>() as u64;

    /// Offset of `used_event` within the available ring.
    pub fn avail_offset_used_event(queue_size: u16) -> u64 {
        AVAIL_OFFSET_RING + AVAIL_ELEMENT_SIZE * u64::from(queue_size)
    }

    /// Total size of the available ring, including `used_event`.
    pub fn avail_ring_size(queue_size: u16) -> u64 {
        avail_offset_used_event(queue_size) + size_of::<u16>() as u64
    }

    #[bitfield(u16)]
    pub struct AvailableFlags {
        pub no_interrupt: bool,
        #[bits(15)]
        _reserved: u16,
    }

    // struct virtq_used {
    //     le16 flags;
    //     le16 idx;
    //     struct virtq_used_elem ring[queue_size];
    //     le16 avail_event;
    // }
    pub const USED_OFFSET_FLAGS: u64 = 0;
    pub const USED_OFFSET_IDX: u64 = 2;
    pub const USED_OFFSET_RING: u64 = 4;
    pub const USED_ELEMENT_SIZE: u64 = size_of::<UsedElement>() as u64;

    /// Offset of `avail_event` within the used ring.
    pub fn used_offset_avail_event(queue_size: u16) -> u64 {
        USED_OFFSET_RING + USED_ELEMENT_SIZE * u64::from(queue_size)
    }

    /// Total size of the used ring, including `avail_event`.
    pub fn used_ring_size(queue_size: u16) -> u64 {
        used_offset_avail_event(queue_size) + size_of::<u16>() as u64
    }

    #[repr(C)]
    #[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct UsedElement {
        pub id: u32_le,
        pub len: u32_le,
    }

    #[bitfield(u16)]
    pub struct UsedFlags {
        pub no_notify: bool,
        #[bits(15)]
        _reserved: u16,
    }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! virtio-vsock device constants and wire format.

use bitfield_struct::bitfield;
use std::fmt::Debug;
use virtio::spec::u16_le;
use virtio::spec::u32_le;
use virtio::spec::u64_le;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub const VIRTIO_DEVICE_TYPE_VSOCK: u16 = 19;

pub const VSOCK_QUEUE_RX: u16 = 0;
pub const VSOCK_QUEUE_TX: u16 = 1;
pub const VSOCK_QUEUE_EVENT: u16 = 2;
pub const VSOCK_QUEUE_COUNT: u16 = 3;

/// Well-known context id of the host.
pub const VMADDR_CID_HOST: u64 = 2;

pub const VSOCK_TYPE_STREAM: u16 = 1;

/// A vsock packet operation.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct VsockOp(pub u16);

impl VsockOp {
    pub const INVALID: Self = Self(0);
    pub const REQUEST: Self = Self(1);
    pub const RESPONSE: Self = Self(2);
    pub const RST: Self = Self(3);
    pub const SHUTDOWN: Self = Self(4);
    pub const RW: Self = Self(5);
    pub const CREDIT_UPDATE: Self = Self(6);
    pub const CREDIT_REQUEST: Self = Self(7);
}

impl Debug for VsockOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match *self {
            Self::INVALID => "INVALID",
            Self::REQUEST => "REQUEST",
            Self::RESPONSE => "RESPONSE",
            Self::RST => "RST",
            Self::SHUTDOWN => "SHUTDOWN",
            Self::RW => "RW",
            Self::CREDIT_UPDATE => "CREDIT_UPDATE",
            Self::CREDIT_REQUEST => "CREDIT_REQUEST",
            Self(op) => return write!(f, "VsockOp({op})"),
        };
        f.pad(name)
    }
}

/// Flags carried by a SHUTDOWN packet, from the sender's point of view.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct ShutdownFlags {
    /// The sender will not receive any more data.
    pub recv: bool,
    /// The sender will not send any more data.
    pub send: bool,
    #[bits(30)]
    _reserved: u32,
}

impl ShutdownFlags {
    pub fn both() -> Self {
        Self::new().with_recv(true).with_send(true)
    }

    pub fn is_both(&self) -> bool {
        self.recv() && self.send()
    }

    pub fn is_empty(&self) -> bool {
        !self.recv() && !self.send()
    }

    pub fn union(self, other: Self) -> Self {
        Self::new()
            .with_recv(self.recv() || other.recv())
            .with_send(self.send() || other.send())
    }

    /// The flags in `self` that are not in `other`.
    pub fn difference(self, other: Self) -> Self {
        Self::new()
            .with_recv(self.recv() && !other.recv())
            .with_send(self.send() && !other.send())
    }
}

/// The header at the start of every packet on the RX and TX queues.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct VsockHeader {
    pub src_cid: u64_le,
    pub dst_cid: u64_le,
    pub src_port: u32_le,
    pub dst_port: u32_le,
    pub len: u32_le,
    pub socket_type: u16_le,
    pub op: u16_le,
    pub flags: u32_le,
    pub buf_alloc: u32_le,
    pub fwd_cnt: u32_le,
}

pub const VSOCK_HEADER_SIZE: usize = size_of::<VsockHeader>();
const _: () = assert!(VSOCK_HEADER_SIZE == 44);

impl VsockHeader {
    pub fn op(&self) -> VsockOp {
        VsockOp(self.op.get())
    }

    pub fn shutdown_flags(&self) -> ShutdownFlags {
        self.flags.get().into()
    }
}

/// Device configuration space.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct VsockConfigSpace {
    pub guest_cid: u64_le,
}

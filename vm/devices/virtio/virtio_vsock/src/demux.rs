// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Dispatches guest TX packets to connections.

use crate::connection::ConnectionKey;
use crate::connection::Disposition;
use crate::connection::MAX_PACKET_PAYLOAD;
use crate::spec::ShutdownFlags;
use crate::spec::VsockHeader;
use crate::spec::VsockOp;
use crate::spec::VMADDR_CID_HOST;
use crate::spec::VSOCK_HEADER_SIZE;
use crate::spec::VSOCK_TYPE_STREAM;
use crate::table::ConnectionTable;
use crate::table::PendingConnect;
use thiserror::Error;
use virtio::DescriptorChain;
use virtio::VirtioQueue;
use virtio::VirtioWriteError;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

#[derive(Debug, Error)]
enum PacketError {
    #[error("failed to read packet")]
    Read(#[source] VirtioWriteError),
    #[error("packet is too short for a header: {0} bytes")]
    ShortHeader(usize),
    #[error("payload length {len:#x} does not fit the buffer")]
    BadLength { len: u32 },
}

/// Drains the TX queue. Returns the guest connect requests that need a host
/// service; the caller hands them to the connector after releasing the
/// table.
pub(crate) fn demux(
    table: &mut ConnectionTable,
    tx: &mut VirtioQueue,
    guest_cid: u64,
) -> Vec<ConnectionKey> {
    let mut connects = Vec::new();
    loop {
        let mut chain = match tx.next_chain() {
            Ok(Some(chain)) => chain,
            Ok(None) => break,
            Err(err) => {
                tracelimit::error_ratelimited!(
                    error = &err as &dyn std::error::Error,
                    "failed to read vsock tx queue"
                );
                break;
            }
        };
        if let Err(err) = handle_packet(table, &mut chain, guest_cid, &mut connects) {
            tracelimit::warn_ratelimited!(
                error = &err as &dyn std::error::Error,
                "dropping vsock packet"
            );
        }
        chain.complete(0);
    }
    connects
}

fn handle_packet(
    table: &mut ConnectionTable,
    chain: &mut DescriptorChain,
    guest_cid: u64,
    connects: &mut Vec<ConnectionKey>,
) -> Result<(), PacketError> {
    let mut header = VsockHeader::new_zeroed();
    let n = chain
        .read_at_offset(0, header.as_mut_bytes())
        .map_err(PacketError::Read)?;
    if n != VSOCK_HEADER_SIZE {
        return Err(PacketError::ShortHeader(n));
    }

    let op = header.op();
    if header.src_cid.get() != guest_cid {
        tracelimit::warn_ratelimited!(
            src_cid = header.src_cid.get(),
            guest_cid,
            ?op,
            "vsock packet with spoofed source cid"
        );
        return Ok(());
    }

    let key = ConnectionKey::from_guest(&header);
    tracing::trace!(?key, ?op, len = header.len.get(), "vsock packet from guest");

    if op == VsockOp::REQUEST {
        if table.in_use(&key) {
            // Leave the existing connection alone and tell the guest to give
            // up on the duplicate.
            tracelimit::warn_ratelimited!(?key, "duplicate vsock connection request");
            let mut reply = key.header(VsockOp::SHUTDOWN);
            reply.flags = u32::from(ShutdownFlags::both()).into();
            table.push_control(reply);
        } else if header.dst_cid.get() != VMADDR_CID_HOST
            || header.socket_type.get() != VSOCK_TYPE_STREAM
        {
            table.push_control(key.header(VsockOp::RST));
        } else {
            table.add_pending_connect(
                key,
                PendingConnect {
                    buf_alloc: header.buf_alloc.get(),
                    fwd_cnt: header.fwd_cnt.get(),
                },
            );
            connects.push(key);
        }
        return Ok(());
    }

    let Some(connection) = table.get_mut(&key) else {
        if op == VsockOp::RST {
            // The guest gave up on a connect still in progress.
            table.take_pending_connect(&key);
        } else {
            table.push_control(key.header(VsockOp::RST));
        }
        return Ok(());
    };

    let mut payload = Vec::new();
    if op == VsockOp::RW {
        let len = header.len.get();
        if len as usize > MAX_PACKET_PAYLOAD {
            connection.fail(&PacketError::BadLength { len });
            table.rearm(key);
            return Ok(());
        }
        payload.resize(len as usize, 0);
        let read = chain
            .read_at_offset(VSOCK_HEADER_SIZE as u64, &mut payload)
            .map_err(PacketError::Read);
        match read {
            Ok(n) if n == payload.len() => {}
            Ok(_) => {
                connection.fail(&PacketError::BadLength { len });
                table.rearm(key);
                return Ok(());
            }
            Err(err) => {
                connection.fail(&err);
                table.rearm(key);
                return Ok(());
            }
        }
    }

    match connection.receive(&header, &payload) {
        Disposition::Erase => {
            table.erase(&key);
        }
        Disposition::Keep => table.rearm(key),
    }
    Ok(())
}

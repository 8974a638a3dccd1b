// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The set of live connections and the work queued for the RX queue.

use crate::connection::Connection;
use crate::connection::ConnectionKey;
use crate::spec::VsockHeader;
use crate::VsockEvent;
use futures::channel::mpsc;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::VecDeque;

/// A guest REQUEST waiting on a host service.
#[derive(Debug, Copy, Clone)]
pub(crate) struct PendingConnect {
    pub buf_alloc: u32,
    pub fwd_cnt: u32,
}

pub(crate) struct ConnectionTable {
    connections: HashMap<ConnectionKey, Connection>,
    /// Connections with a packet to send. Ordered so every pass visits keys
    /// in the same order.
    readable: BTreeSet<ConnectionKey>,
    pending_connects: HashMap<ConnectionKey, PendingConnect>,
    /// Packets not tied to a live connection, such as RST replies.
    control: VecDeque<VsockHeader>,
    max_control_packets: usize,
    events: mpsc::UnboundedSender<VsockEvent>,
}

impl ConnectionTable {
    pub fn new(max_control_packets: usize, events: mpsc::UnboundedSender<VsockEvent>) -> Self {
        Self {
            connections: HashMap::new(),
            readable: BTreeSet::new(),
            pending_connects: HashMap::new(),
            control: VecDeque::new(),
            max_control_packets,
            events,
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Returns `true` if `key` names a live connection or a connect in
    /// progress.
    pub fn in_use(&self, key: &ConnectionKey) -> bool {
        self.connections.contains_key(key) || self.pending_connects.contains_key(key)
    }

    /// Adds a connection and schedules its first packet.
    pub fn insert(&mut self, connection: Connection) {
        let key = connection.key();
        self.pending_connects.remove(&key);
        let old = self.connections.insert(key, connection);
        debug_assert!(old.is_none(), "duplicate connection {key:?}");
        self.readable.insert(key);
    }

    pub fn get(&self, key: &ConnectionKey) -> Option<&Connection> {
        self.connections.get(key)
    }

    pub fn get_mut(&mut self, key: &ConnectionKey) -> Option<&mut Connection> {
        self.connections.get_mut(key)
    }

    pub fn erase(&mut self, key: &ConnectionKey) -> Option<Connection> {
        self.readable.remove(key);
        let connection = self.connections.remove(key);
        if connection.is_some() {
            tracing::debug!(?key, "vsock connection closed");
        }
        connection
    }

    /// Schedules `key` for the next Mux pass. Does nothing for unknown keys.
    pub fn mark_readable(&mut self, key: ConnectionKey) -> bool {
        if self.connections.contains_key(&key) {
            self.readable.insert(key);
            true
        } else {
            false
        }
    }

    pub fn is_readable(&self, key: &ConnectionKey) -> bool {
        self.readable.contains(key)
    }

    pub fn has_readable(&self) -> bool {
        !self.readable.is_empty()
    }

    /// Takes the keys scheduled so far; the Mux visits each once.
    pub fn take_readable(&mut self) -> BTreeSet<ConnectionKey> {
        std::mem::take(&mut self.readable)
    }

    /// After processing `key`, either schedules it again or arms its stream
    /// waits so a later change schedules it.
    pub fn rearm(&mut self, key: ConnectionKey) {
        let Some(connection) = self.connections.get_mut(&key) else {
            return;
        };
        if connection.wants_transmit() {
            self.readable.insert(key);
        } else {
            connection.arm_waits(&self.events);
        }
    }

    /// Arms the waits of `key` without rescheduling it.
    pub fn arm_waits(&mut self, key: ConnectionKey) {
        if let Some(connection) = self.connections.get_mut(&key) {
            connection.arm_waits(&self.events);
        }
    }

    pub fn add_pending_connect(&mut self, key: ConnectionKey, pending: PendingConnect) {
        self.pending_connects.insert(key, pending);
    }

    pub fn take_pending_connect(&mut self, key: &ConnectionKey) -> Option<PendingConnect> {
        self.pending_connects.remove(key)
    }

    /// Queues a packet with no connection behind it. Drops it if too many
    /// are already waiting for RX buffers.
    pub fn push_control(&mut self, header: VsockHeader) {
        if self.control.len() >= self.max_control_packets {
            tracelimit::warn_ratelimited!(
                op = ?header.op(),
                "vsock control queue full, dropping packet"
            );
            return;
        }
        self.control.push_back(header);
    }

    pub fn front_control(&self) -> Option<&VsockHeader> {
        self.control.front()
    }

    pub fn pop_control(&mut self) -> Option<VsockHeader> {
        self.control.pop_front()
    }

    pub fn has_control(&self) -> bool {
        !self.control.is_empty()
    }
}

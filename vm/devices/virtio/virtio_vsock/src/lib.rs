// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A virtio socket device: stream connections between host services and the
//! guest, multiplexed over the RX and TX virtqueues.

#![expect(missing_docs)]
#![forbid(unsafe_code)]

mod connection;
mod demux;
mod mux;
pub mod spec;
pub mod stream;
mod table;

pub use connection::ConnectionKey;
pub use connection::ConnectionSnapshot;
pub use connection::ConnectionState;
pub use connection::Origin;

use connection::Connection;
use connection::PendingAccept;
use futures::channel::mpsc;
use futures::channel::oneshot;
use futures::FutureExt;
use futures::StreamExt;
use guestmem::GuestMemory;
use mux::RxQueue;
use parking_lot::Mutex;
use spec::VsockOp;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::thread::JoinHandle;
use stream::Stream;
use stream::WaitSlot;
use table::ConnectionTable;
use thiserror::Error;
use virtio::queue::QueueError;
use virtio::spec::VIRTIO_F_RING_EVENT_IDX;
use virtio::spec::VIRTIO_F_RING_INDIRECT_DESC;
use virtio::spec::VIRTIO_F_VERSION_1;
use virtio::DeviceTraits;
use virtio::QueueResources;
use virtio::Resources;
use virtio::VirtioDevice;
use virtio::VirtioQueue;

#[derive(Debug, Clone)]
pub struct VsockDeviceConfig {
    /// The context id assigned to the guest.
    pub guest_cid: u64,
    /// Packets not tied to a live connection that may wait for RX buffers
    /// before new ones are dropped.
    pub max_control_packets: usize,
}

impl Default for VsockDeviceConfig {
    fn default() -> Self {
        Self {
            guest_cid: 3,
            max_control_packets: 256,
        }
    }
}

#[derive(Debug, Error)]
pub enum VsockError {
    #[error("queue {0} was not provided")]
    MissingQueue(u16),
    #[error("failed to configure queue {index}")]
    Queue {
        index: u16,
        #[source]
        source: QueueError,
    },
    #[error("failed to start the worker thread")]
    Thread(#[source] std::io::Error),
}

#[derive(Debug, Error)]
pub enum AcceptError {
    #[error("address already in use")]
    InUse,
    #[error("the device is not running")]
    NotRunning,
    #[error("connection refused by the guest")]
    Refused,
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connection refused")]
    Refused,
    #[error("connection failed")]
    Failed(#[source] anyhow::Error),
}

/// Work for the device's event loop.
#[derive(Debug)]
pub(crate) enum VsockEvent {
    /// The guest posted TX buffers.
    TxKick,
    /// The guest posted RX buffers, or a Mux pass left work behind.
    RxKick,
    StreamSignaled {
        key: ConnectionKey,
        slot: WaitSlot,
    },
    ConnectComplete {
        key: ConnectionKey,
        result: Result<Stream, ConnectError>,
    },
    Stop,
}

/// A guest connecting to a host port.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub key: ConnectionKey,
}

impl ConnectRequest {
    pub fn guest_cid(&self) -> u64 {
        self.key.remote_cid
    }

    pub fn guest_port(&self) -> u32 {
        self.key.remote_port
    }

    pub fn host_port(&self) -> u32 {
        self.key.local_port
    }
}

/// Answers a [`ConnectRequest`]. Dropping it without answering refuses the
/// connection.
#[derive(Debug)]
pub struct ConnectResponder {
    key: ConnectionKey,
    events: Option<mpsc::UnboundedSender<VsockEvent>>,
}

impl ConnectResponder {
    fn send(&mut self, result: Result<Stream, ConnectError>) {
        if let Some(events) = self.events.take() {
            let _ = events.unbounded_send(VsockEvent::ConnectComplete {
                key: self.key,
                result,
            });
        }
    }

    /// Completes the connection with the device end of `stream`.
    pub fn accept(mut self, stream: impl Into<Stream>) {
        self.send(Ok(stream.into()));
    }

    pub fn refuse(mut self, err: ConnectError) {
        self.send(Err(err));
    }
}

impl Drop for ConnectResponder {
    fn drop(&mut self) {
        self.send(Err(ConnectError::Refused));
    }
}

/// Handles guest connect requests.
pub trait VsockConnector: Send + Sync {
    /// Called without device locks held. May answer inline or later from any
    /// thread.
    fn connect(&self, request: ConnectRequest, responder: ConnectResponder);
}

impl<F> VsockConnector for F
where
    F: Fn(ConnectRequest, ConnectResponder) + Send + Sync,
{
    fn connect(&self, request: ConnectRequest, responder: ConnectResponder) {
        self(request, responder)
    }
}

/// Resolves once the guest accepts or refuses a host-initiated connection.
#[must_use]
#[derive(Debug)]
pub struct Accepting(oneshot::Receiver<Result<(), AcceptError>>);

impl Future for Accepting {
    type Output = Result<(), AcceptError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0
            .poll_unpin(cx)
            .map(|r| r.unwrap_or(Err(AcceptError::Refused)))
    }
}

struct DeviceInner {
    guest_cid: u64,
    // Lock order: table, then rx or tx.
    table: Mutex<ConnectionTable>,
    rx: Mutex<RxQueue>,
    tx: Mutex<VirtioQueue>,
    connector: Arc<dyn VsockConnector>,
    events: mpsc::UnboundedSender<VsockEvent>,
}

/// The queue processing half of the device. Cheap to clone.
#[derive(Clone)]
pub struct VsockDevice {
    inner: Arc<DeviceInner>,
}

impl std::fmt::Debug for VsockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VsockDevice")
            .field("guest_cid", &self.inner.guest_cid)
            .field("connections", &self.inner.table.lock().len())
            .finish()
    }
}

impl VsockDevice {
    /// Creates the device over configured RX and TX queues. Nothing happens
    /// until the returned worker runs.
    pub fn new(
        config: &VsockDeviceConfig,
        rx: VirtioQueue,
        tx: VirtioQueue,
        connector: Arc<dyn VsockConnector>,
    ) -> (Self, VsockWorker) {
        let (events, receiver) = mpsc::unbounded();
        let inner = DeviceInner {
            guest_cid: config.guest_cid,
            table: Mutex::new(ConnectionTable::new(
                config.max_control_packets,
                events.clone(),
            )),
            rx: Mutex::new(RxQueue::new(rx)),
            tx: Mutex::new(tx),
            connector,
            events,
        };
        let device = Self {
            inner: Arc::new(inner),
        };
        let worker = VsockWorker {
            device: device.clone(),
            events: receiver,
        };
        (device, worker)
    }

    pub fn guest_cid(&self) -> u64 {
        self.inner.guest_cid
    }

    fn post(&self, event: VsockEvent) {
        let _ = self.inner.events.unbounded_send(event);
    }

    /// Handles a guest notification for `queue_index`.
    pub fn notify(&self, queue_index: u16) {
        match queue_index {
            spec::VSOCK_QUEUE_RX => self.post(VsockEvent::RxKick),
            spec::VSOCK_QUEUE_TX => self.post(VsockEvent::TxKick),
            _ => {}
        }
    }

    /// Asks the worker to exit.
    pub fn stop(&self) {
        self.post(VsockEvent::Stop);
    }

    /// Drains the TX queue, hands new connect requests to the connector, and
    /// sends any replies.
    pub fn process_tx(&self) {
        let connects = {
            let mut table = self.inner.table.lock();
            let mut tx = self.inner.tx.lock();
            demux::demux(&mut table, &mut tx, self.inner.guest_cid)
        };
        for key in connects {
            tracing::debug!(?key, "guest vsock connect request");
            let responder = ConnectResponder {
                key,
                events: Some(self.inner.events.clone()),
            };
            self.inner
                .connector
                .connect(ConnectRequest { key }, responder);
        }
        self.process_rx();
    }

    /// Runs one Mux pass.
    pub fn process_rx(&self) {
        let more = {
            let mut table = self.inner.table.lock();
            let mut rx = self.inner.rx.lock();
            mux::mux(&mut table, &mut rx)
        };
        if more {
            self.post(VsockEvent::RxKick);
        }
    }

    fn stream_signaled(&self, key: ConnectionKey, slot: WaitSlot) {
        let mut table = self.inner.table.lock();
        if slot == WaitSlot::Transmit {
            if let Some(connection) = table.get_mut(&key) {
                connection.buffer_available();
            }
        }
        table.rearm(key);
    }

    fn connect_complete(&self, key: ConnectionKey, result: Result<Stream, ConnectError>) {
        let mut table = self.inner.table.lock();
        let Some(pending) = table.take_pending_connect(&key) else {
            tracing::debug!(?key, "connect completed after the guest gave up");
            return;
        };
        match result {
            Ok(stream) => {
                tracing::debug!(?key, "vsock connection established");
                table.insert(Connection::new_guest(
                    key,
                    stream,
                    pending.buf_alloc,
                    pending.fwd_cnt,
                ));
            }
            Err(err) => {
                tracing::debug!(
                    ?key,
                    error = &err as &dyn std::error::Error,
                    "vsock connect failed"
                );
                table.push_control(key.header(VsockOp::RST));
            }
        }
    }

    /// Handles one event. Returns `false` when the worker should exit.
    fn handle_event(&self, event: VsockEvent) -> bool {
        match event {
            VsockEvent::TxKick => self.process_tx(),
            VsockEvent::RxKick => self.process_rx(),
            VsockEvent::StreamSignaled { key, slot } => {
                self.stream_signaled(key, slot);
                self.process_rx();
            }
            VsockEvent::ConnectComplete { key, result } => {
                self.connect_complete(key, result);
                self.process_rx();
            }
            VsockEvent::Stop => return false,
        }
        true
    }

    /// Opens a connection from the host endpoint `(src_cid, src_port)` to
    /// guest port `dst_port`, carrying data over `stream`.
    pub fn accept(
        &self,
        src_cid: u64,
        src_port: u32,
        dst_port: u32,
        stream: impl Into<Stream>,
    ) -> Result<Accepting, AcceptError> {
        if self.inner.events.is_closed() {
            return Err(AcceptError::NotRunning);
        }
        let key = ConnectionKey {
            local_cid: src_cid,
            local_port: src_port,
            remote_cid: self.inner.guest_cid,
            remote_port: dst_port,
        };
        let (sender, receiver) = oneshot::channel();
        {
            let mut table = self.inner.table.lock();
            if table.in_use(&key) {
                return Err(AcceptError::InUse);
            }
            table.insert(Connection::new_host(
                key,
                stream.into(),
                PendingAccept::new(sender),
            ));
        }
        self.post(VsockEvent::RxKick);
        Ok(Accepting(receiver))
    }

    pub fn connection(&self, key: &ConnectionKey) -> Option<ConnectionSnapshot> {
        self.inner.table.lock().get(key).map(|c| c.snapshot())
    }

    /// Returns `true` if `key` is scheduled for the next Mux pass.
    pub fn is_readable(&self, key: &ConnectionKey) -> bool {
        self.inner.table.lock().is_readable(key)
    }
}

/// Runs the device's event loop.
pub struct VsockWorker {
    device: VsockDevice,
    events: mpsc::UnboundedReceiver<VsockEvent>,
}

impl VsockWorker {
    pub async fn run(mut self) {
        while let Some(event) = self.events.next().await {
            if !self.device.handle_event(event) {
                break;
            }
        }
        tracing::debug!("vsock worker stopped");
    }

    /// Handles events until none are queued. Returns the number handled.
    pub fn run_pending(&mut self) -> usize {
        let mut count = 0;
        while let Ok(event) = self.events.try_recv() {
            count += 1;
            if !self.device.handle_event(event) {
                break;
            }
        }
        count
    }
}

struct Running {
    device: VsockDevice,
    thread: JoinHandle<()>,
}

/// The virtio transport face of the vsock device.
pub struct VirtioVsock {
    config: VsockDeviceConfig,
    mem: GuestMemory,
    connector: Arc<dyn VsockConnector>,
    running: Option<Running>,
}

impl VirtioVsock {
    pub fn new(
        config: VsockDeviceConfig,
        mem: GuestMemory,
        connector: Arc<dyn VsockConnector>,
    ) -> Self {
        Self {
            config,
            mem,
            connector,
            running: None,
        }
    }

    /// The running device, between `enable` and `disable`.
    pub fn device(&self) -> Option<&VsockDevice> {
        self.running.as_ref().map(|r| &r.device)
    }

    fn start(&self, resources: Resources) -> Result<Running, VsockError> {
        let mut queues = resources.queues.into_iter();
        let mut next_queue = |index: u16| -> Result<VirtioQueue, VsockError> {
            let QueueResources { params, notify } =
                queues.next().ok_or(VsockError::MissingQueue(index))?;
            VirtioQueue::new(resources.features, params, self.mem.clone(), notify)
                .map_err(|source| VsockError::Queue { index, source })
        };
        let rx = next_queue(spec::VSOCK_QUEUE_RX)?;
        let tx = next_queue(spec::VSOCK_QUEUE_TX)?;

        let (device, worker) = VsockDevice::new(&self.config, rx, tx, self.connector.clone());
        let thread = std::thread::Builder::new()
            .name("virtio-vsock".into())
            .spawn(move || futures::executor::block_on(worker.run()))
            .map_err(VsockError::Thread)?;

        // Pick up anything the guest posted before enabling.
        device.notify(spec::VSOCK_QUEUE_TX);
        device.notify(spec::VSOCK_QUEUE_RX);
        Ok(Running { device, thread })
    }
}

impl VirtioDevice for VirtioVsock {
    fn traits(&self) -> DeviceTraits {
        DeviceTraits {
            device_id: spec::VIRTIO_DEVICE_TYPE_VSOCK,
            device_features: VIRTIO_F_RING_EVENT_IDX as u64
                | VIRTIO_F_RING_INDIRECT_DESC as u64
                | (VIRTIO_F_VERSION_1 as u64) << 32,
            max_queues: spec::VSOCK_QUEUE_COUNT,
            device_register_length: size_of::<spec::VsockConfigSpace>() as u32,
        }
    }

    fn read_registers_u32(&self, offset: u16) -> u32 {
        match offset {
            0 => self.config.guest_cid as u32,
            4 => (self.config.guest_cid >> 32) as u32,
            _ => 0,
        }
    }

    fn write_registers_u32(&mut self, offset: u16, val: u32) {
        tracelimit::warn_ratelimited!(offset, val, "write to read-only vsock config space");
    }

    fn enable(&mut self, resources: Resources) {
        assert!(self.running.is_none());
        if !resources.queues.iter().take(2).all(|q| q.params.enable) {
            tracing::debug!("vsock queues not enabled");
            return;
        }
        match self.start(resources) {
            Ok(running) => self.running = Some(running),
            Err(err) => {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "failed to start vsock device"
                );
            }
        }
    }

    fn queue_notify(&self, queue_index: u16) {
        if let Some(device) = self.device() {
            device.notify(queue_index);
        }
    }

    fn disable(&mut self) {
        if let Some(running) = self.running.take() {
            running.device.stop();
            if running.thread.join().is_err() {
                tracing::error!("vsock worker panicked");
            }
        }
    }
}

impl Drop for VirtioVsock {
    fn drop(&mut self) {
        self.disable();
    }
}

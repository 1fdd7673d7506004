//! Packet mux between the two QUIC dialect stacks.
//!
//! One obfuscated socket feeds both dialect endpoints. A relay task reads
//! datagrams into a fixed pool of pre-allocated buffers, labels each by
//! dialect, and pushes it onto that dialect's queue; each endpoint sees a
//! `MuxPacketConn` that reads from its queue and writes through the shared
//! socket. Queues drop packets when full rather than applying backpressure,
//! matching datagram semantics.

use std::fmt;
use std::io::{self, IoSliceMut};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use quinn::udp::{RecvMeta, Transmit};
use quinn::AsyncUdpSocket;
use tokio::sync::{mpsc, watch};

use super::obfuscator::{Dialect, ObfuscatedUdpSocket};

/// All relay buffers are allocated up front: this many buffers of this
/// size. The buffer size covers the largest decoded QUIC packet.
pub const MUX_PACKET_QUEUE_SIZE: usize = 128;
pub const MUX_PACKET_BUFFER_SIZE: usize = 1452;

pub struct PooledPacket {
    pub data: Vec<u8>,
    pub len: usize,
    pub addr: SocketAddr,
}

/// Per-dialect packet queue endpoint handed to a quinn endpoint.
pub struct MuxPacketConn {
    local_addr: SocketAddr,
    socket: Arc<ObfuscatedUdpSocket>,
    packets: Mutex<mpsc::Receiver<PooledPacket>>,
    free: mpsc::Sender<Vec<u8>>,
}

impl MuxPacketConn {
    pub fn new(
        local_addr: SocketAddr,
        socket: Arc<ObfuscatedUdpSocket>,
        packets: mpsc::Receiver<PooledPacket>,
        free: mpsc::Sender<Vec<u8>>,
    ) -> Self {
        Self {
            local_addr,
            socket,
            packets: Mutex::new(packets),
            free,
        }
    }
}

impl fmt::Debug for MuxPacketConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxPacketConn")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl AsyncUdpSocket for MuxPacketConn {
    fn create_io_poller(self: Arc<Self>) -> Pin<Box<dyn quinn::UdpPoller>> {
        self.socket.clone().create_io_poller()
    }

    fn try_send(&self, transmit: &Transmit) -> io::Result<()> {
        // Writes go straight through the shared obfuscated socket.
        self.socket.try_send(transmit)
    }

    fn poll_recv(
        &self,
        cx: &mut Context,
        bufs: &mut [IoSliceMut<'_>],
        meta: &mut [RecvMeta],
    ) -> Poll<io::Result<usize>> {
        let mut packets = self.packets.lock();
        match packets.poll_recv(cx) {
            Poll::Ready(Some(packet)) => {
                let len = packet.len.min(bufs[0].len());
                bufs[0][0..len].copy_from_slice(&packet.data[0..len]);
                meta[0] = RecvMeta {
                    addr: packet.addr,
                    len,
                    stride: len,
                    ecn: None,
                    dst_ip: None,
                };
                // Return the buffer to the pool; if the pool is gone the
                // relay has shut down and the buffer just drops.
                let _ = self.free.try_send(packet.data);
                Poll::Ready(Ok(1))
            }
            Poll::Ready(None) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mux relay stopped",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local_addr)
    }

    fn max_transmit_segments(&self) -> usize {
        1
    }

    fn max_receive_segments(&self) -> usize {
        1
    }

    fn may_fragment(&self) -> bool {
        false
    }
}

pub struct MuxQueues {
    pub modern_conn: MuxPacketConn,
    pub legacy_conn: MuxPacketConn,
    free_tx: mpsc::Sender<Vec<u8>>,
    free_rx: mpsc::Receiver<Vec<u8>>,
    modern_tx: mpsc::Sender<PooledPacket>,
    legacy_tx: mpsc::Sender<PooledPacket>,
}

/// Build the buffer pool and both per-dialect queues.
pub fn new_mux_queues(local_addr: SocketAddr, socket: Arc<ObfuscatedUdpSocket>) -> MuxQueues {
    let (free_tx, free_rx) = mpsc::channel(MUX_PACKET_QUEUE_SIZE);
    for _ in 0..MUX_PACKET_QUEUE_SIZE {
        free_tx
            .try_send(vec![0u8; MUX_PACKET_BUFFER_SIZE])
            .expect("pool channel sized to pool");
    }

    let (modern_tx, modern_rx) = mpsc::channel(MUX_PACKET_QUEUE_SIZE);
    let (legacy_tx, legacy_rx) = mpsc::channel(MUX_PACKET_QUEUE_SIZE);

    MuxQueues {
        modern_conn: MuxPacketConn::new(local_addr, socket.clone(), modern_rx, free_tx.clone()),
        legacy_conn: MuxPacketConn::new(local_addr, socket, legacy_rx, free_tx.clone()),
        free_tx,
        free_rx,
        modern_tx,
        legacy_tx,
    }
}

impl MuxQueues {
    pub fn into_relay_parts(
        self,
    ) -> (
        MuxPacketConn,
        MuxPacketConn,
        RelayChannels,
    ) {
        (
            self.modern_conn,
            self.legacy_conn,
            RelayChannels {
                free_tx: self.free_tx,
                free_rx: self.free_rx,
                modern_tx: self.modern_tx,
                legacy_tx: self.legacy_tx,
            },
        )
    }
}

pub struct RelayChannels {
    pub free_tx: mpsc::Sender<Vec<u8>>,
    pub free_rx: mpsc::Receiver<Vec<u8>>,
    pub modern_tx: mpsc::Sender<PooledPacket>,
    pub legacy_tx: mpsc::Sender<PooledPacket>,
}

/// Pump datagrams from the obfuscated socket into the per-dialect queues
/// until the stop signal fires or the socket dies. Network errors are not
/// surfaced to the endpoints; quinn shuts an endpoint down on any receive
/// error, which a transient kernel error must not cause.
pub async fn relay_packets(
    socket: Arc<ObfuscatedUdpSocket>,
    mut channels: RelayChannels,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let mut buffer = tokio::select! {
            buffer = channels.free_rx.recv() => match buffer {
                Some(buffer) => buffer,
                None => return,
            },
            _ = stop.changed() => return,
        };
        buffer.resize(MUX_PACKET_BUFFER_SIZE, 0);

        let received = tokio::select! {
            received = std::future::poll_fn(|cx| socket.poll_recv_labeled(cx, &mut buffer)) => received,
            _ = stop.changed() => return,
        };

        let (len, addr, dialect) = match received {
            Ok(received) => received,
            Err(e) => {
                log::warn!("mux packet read failed: {}", e);
                let _ = channels.free_tx.try_send(buffer);
                if *stop.borrow() {
                    return;
                }
                continue;
            }
        };

        let packet = PooledPacket {
            data: buffer,
            len,
            addr,
        };
        let target = match dialect {
            Dialect::Modern => &channels.modern_tx,
            Dialect::Legacy => &channels.legacy_tx,
        };
        // Drop the packet when the target stack's queue is full.
        if let Err(e) = target.try_send(packet) {
            let data = match e {
                mpsc::error::TrySendError::Full(packet) => packet.data,
                mpsc::error::TrySendError::Closed(packet) => packet.data,
            };
            let _ = channels.free_tx.try_send(data);
        }
    }
}

//! Per-client session state

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::io::PooledBuffer;

/// Capacity of each session's upstream send queue. Overflow drops the
/// newest packet so ingress never stalls on a slow upstream.
pub(super) const SEND_CHANNEL_CAPACITY: usize = 1024;

/// A decrypted WireGuard packet queued for the upstream, carrying
/// ownership of its pooled buffer.
pub(super) struct QueuedPacket {
    pub buf: PooledBuffer,
    pub start: usize,
    pub len: usize,
}

/// One NAT table entry: the relay state for a single client flow.
pub(super) struct ServerNatEntry {
    /// Dedicated upstream socket for this client
    pub wg_socket: Arc<UdpSocket>,
    /// Most recent packet-info bytes from this client, attached to replies
    pub client_oob_cache: Mutex<Vec<u8>>,
    /// Upstream read deadline. Set at creation, refreshed on client
    /// handshakes, forced to now on shutdown.
    pub read_deadline: watch::Sender<Instant>,
    /// MTU minus the client family's IP header and the UDP header
    pub max_proxy_packet_size: usize,
}

/// A session's slot in the NAT table.
///
/// The slot owns the send queue's only `Sender`. The egress loop removes
/// the slot when its read deadline fires; dropping the slot closes the
/// queue, which is what tells the sender worker to drain and exit.
pub(super) struct SessionHandle {
    pub entry: Arc<ServerNatEntry>,
    pub send_queue: mpsc::Sender<QueuedPacket>,
}

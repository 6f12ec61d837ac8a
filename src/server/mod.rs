//! swgp server service
//!
//! The server side of the relay: clients send obfuscated swgp datagrams to
//! a single listener; the relay decrypts each one in place and forwards it
//! to the real WireGuard endpoint from a per-client upstream socket, so
//! the endpoint sees one source port per client. Replies are encrypted in
//! place and written back through the listener with the client's cached
//! packet info attached.
//!
//! # Session lifecycle
//!
//! A session is created lazily on the first packet from a new client
//! address and holds two tasks: the egress loop (upstream → client) and a
//! sender worker draining the bounded send queue (client → upstream).
//! Liveness follows WireGuard's own contract: only handshake initiation
//! and response messages from the client refresh the upstream read
//! deadline. When the deadline fires the egress loop removes the table
//! entry, which closes the send queue and unwinds the session.
//!
//! # Locking
//!
//! One mutex guards the NAT table. It is held across session creation and
//! the non-blocking queue enqueue, never across socket I/O.

mod session;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use base64::prelude::*;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::{StartError, SwgpError};
use crate::io::PacketBufferPool;
use crate::packet::{
    get_handler, is_handshake_message, Handler, WG_DATA_LENGTH_MASK, WG_DATA_OVERHEAD,
};
use crate::socket::{
    canonical_addr, is_ipv4_client, listen_udp, parse_flags_for_error, recv_msg, send_msg,
    update_oob_cache, UDP_OOB_BUFFER_SIZE,
};

use session::{QueuedPacket, ServerNatEntry, SessionHandle, SEND_CHANNEL_CAPACITY};

/// IPv4 header length without options
pub const IPV4_HEADER_LENGTH: usize = 20;

/// IPv6 header length
pub const IPV6_HEADER_LENGTH: usize = 40;

/// UDP header length
pub const UDP_HEADER_LENGTH: usize = 8;

/// WireGuard's `REJECT_AFTER_TIME`: a session with no handshake traffic
/// for this long is torn down.
pub const REJECT_AFTER_TIME: Duration = Duration::from_secs(180);

/// The largest proxy packet a client of the given (canonical) address
/// family can carry: MTU minus its IP header and the UDP header.
#[must_use]
pub fn max_proxy_packet_size(mtu: usize, client_addr: SocketAddr) -> usize {
    if is_ipv4_client(client_addr) {
        mtu - IPV4_HEADER_LENGTH - UDP_HEADER_LENGTH
    } else {
        mtu - IPV6_HEADER_LENGTH - UDP_HEADER_LENGTH
    }
}

/// WireGuard tunnel MTU that fits inside a proxy packet of the given size
/// after the handler and WireGuard data-packet overheads.
#[must_use]
pub const fn wg_tunnel_mtu(max_proxy_packet_size: usize, handler_overhead: usize) -> usize {
    (max_proxy_packet_size - handler_overhead - WG_DATA_OVERHEAD) & WG_DATA_LENGTH_MASK
}

/// A swgp server service.
///
/// Construct with [`Server::new`], then call [`Server::start`]. `stop` is
/// idempotent and waits for every relay task to drain.
pub struct Server {
    config: ServerConfig,
    state: Mutex<Option<RunningState>>,
}

struct RunningState {
    shared: Arc<ServerShared>,
    tracker: TaskTracker,
}

/// State shared by all of a server's relay tasks.
struct ServerShared {
    name: String,
    proxy_listen: SocketAddr,
    proxy_sock: UdpSocket,
    handler: Arc<dyn Handler>,
    front_overhead: usize,
    rear_overhead: usize,
    mtu: usize,
    /// Canonical endpoint address, for source filtering and logs
    wg_addr: SocketAddr,
    /// Family-correct endpoint address, the actual send target
    wg_send_addr: SocketAddr,
    wg_fwmark: u32,
    pool: Arc<PacketBufferPool>,
    table: Mutex<HashMap<SocketAddr, SessionHandle>>,
    shutdown: CancellationToken,
}

impl Server {
    /// Create a server service from its configuration.
    ///
    /// Call [`Server::start`] on the returned service to start it.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(None),
        }
    }

    /// The service name from the configuration.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The listener's bound address, once started.
    ///
    /// Useful when the configuration requested an ephemeral port.
    #[must_use]
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.state
            .lock()
            .as_ref()
            .and_then(|s| s.shared.proxy_sock.local_addr().ok())
    }

    /// Start the service: validate, bind the listener and spawn the
    /// ingress loop. Returns once the relay is accepting traffic.
    ///
    /// # Errors
    ///
    /// Returns `StartError` on invalid MTU, unknown proxy mode, invalid
    /// PSK, unresolvable endpoint or bind failure. The service does not
    /// begin.
    pub async fn start(&self) -> Result<(), StartError> {
        if self.state.lock().is_some() {
            return Ok(());
        }

        let config = &self.config;

        if config.mtu < 1280 {
            return Err(StartError::MtuTooSmall { mtu: config.mtu });
        }
        let mtu = config.mtu as usize;

        let psk = BASE64_STANDARD.decode(&config.proxy_psk)?;
        let handler = get_handler(&config.proxy_mode, &psk)?;
        let front_overhead = handler.front_overhead();
        let rear_overhead = handler.rear_overhead();
        let overhead = front_overhead + rear_overhead;

        // Client-facing buffers are sized for the worst case: an IPv4
        // client, whose IP header leaves the most room for payload.
        let packet_buf_size = mtu - IPV4_HEADER_LENGTH - UDP_HEADER_LENGTH;
        if packet_buf_size <= overhead {
            return Err(StartError::PacketBufferSize {
                size: packet_buf_size,
                overhead,
            });
        }

        let wg_send_addr = resolve_endpoint(&config.wg_endpoint).await?;
        let wg_addr = canonical_addr(wg_send_addr);

        let (proxy_sock, soft_err) = listen_udp(config.proxy_listen, true, config.proxy_fwmark)?;
        if let Some(serr) = soft_err {
            warn!(
                server = %config.name,
                listen = %config.proxy_listen,
                fwmark = config.proxy_fwmark,
                error = %serr,
                "An error occurred while setting socket options on the listener"
            );
        }
        let proxy_sock = UdpSocket::from_std(proxy_sock)?;

        let shared = Arc::new(ServerShared {
            name: config.name.clone(),
            proxy_listen: config.proxy_listen,
            proxy_sock,
            handler,
            front_overhead,
            rear_overhead,
            mtu,
            wg_addr,
            wg_send_addr,
            wg_fwmark: config.wg_fwmark,
            pool: Arc::new(PacketBufferPool::new(packet_buf_size)),
            table: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        });

        let tracker = TaskTracker::new();
        tracker.spawn(relay_proxy_to_wg(Arc::clone(&shared), tracker.clone()));

        *self.state.lock() = Some(RunningState { shared, tracker });

        info!(
            server = %config.name,
            listen = %config.proxy_listen,
            mode = %config.proxy_mode,
            wg_endpoint = %config.wg_endpoint,
            wg_tunnel_mtu = wg_tunnel_mtu(mtu - IPV6_HEADER_LENGTH - UDP_HEADER_LENGTH, overhead),
            "Started service"
        );
        Ok(())
    }

    /// Stop the service and wait for all relay tasks to drain.
    ///
    /// Idempotent: a second call observes no running state and returns
    /// immediately.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` is part of the service contract.
    pub async fn stop(&self) -> Result<(), SwgpError> {
        let Some(RunningState { shared, tracker }) = self.state.lock().take() else {
            return Ok(());
        };

        // Unblock the ingress loop, then every egress loop: cancellation
        // stops the listener read, and forcing each upstream read deadline
        // to now expires every session. Queue closure and upstream socket
        // closure cascade from there.
        shared.shutdown.cancel();

        let now = Instant::now();
        {
            let table = shared.table.lock();
            for handle in table.values() {
                handle.entry.read_deadline.send_replace(now);
            }
        }

        tracker.close();
        tracker.wait().await;

        info!(server = %shared.name, listen = %shared.proxy_listen, "Stopped service");
        Ok(())
    }

    /// Number of live sessions in the NAT table.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.state
            .lock()
            .as_ref()
            .map_or(0, |s| s.shared.table.lock().len())
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} swgp server service", self.config.name)
    }
}

/// Resolve the configured endpoint: a literal `ip:port`, or `host:port`
/// through the resolver.
async fn resolve_endpoint(endpoint: &str) -> Result<SocketAddr, StartError> {
    if let Ok(addr) = endpoint.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let mut addrs = tokio::net::lookup_host(endpoint)
        .await
        .map_err(|e| StartError::ResolveEndpoint {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;
    addrs.next().ok_or_else(|| StartError::ResolveEndpoint {
        endpoint: endpoint.to_string(),
        reason: "resolver returned no addresses".into(),
    })
}

/// Ingress loop: read swgp packets from the listener, decrypt, look up or
/// create the session, and hand the packet to the session's send queue.
async fn relay_proxy_to_wg(shared: Arc<ServerShared>, tracker: TaskTracker) {
    let mut oob_buf = [0u8; UDP_OOB_BUFFER_SIZE];

    loop {
        let mut packet_buf = shared.pool.acquire();

        let msg = tokio::select! {
            result = recv_msg(&shared.proxy_sock, &mut packet_buf, &mut oob_buf) => match result {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(
                        server = %shared.name,
                        listen = %shared.proxy_listen,
                        error = %e,
                        "Failed to read from proxy listener"
                    );
                    continue;
                }
            },
            () = shared.shutdown.cancelled() => break,
        };

        if let Err(e) = parse_flags_for_error(msg.flags) {
            warn!(
                server = %shared.name,
                listen = %shared.proxy_listen,
                client = %msg.src,
                error = %e,
                "Failed to read from proxy listener"
            );
            continue;
        }

        let wg_range = match shared.handler.decrypt_zero_copy(&mut packet_buf[..msg.len]) {
            Ok(range) => range,
            Err(e) => {
                warn!(
                    server = %shared.name,
                    listen = %shared.proxy_listen,
                    client = %msg.src,
                    error = %e,
                    "Failed to decrypt swgp packet"
                );
                continue;
            }
        };
        let message_type = packet_buf[wg_range.start];
        let client_key = canonical_addr(msg.src);

        let mut table = shared.table.lock();
        let handle = match table.entry(client_key) {
            Entry::Occupied(occupied) => {
                debug!(
                    server = %shared.name,
                    client = %msg.src,
                    "Found existing session in NAT table"
                );
                let handle = occupied.into_mut();
                // Only handshake traffic proves the peer is still there;
                // data packets do not extend the session.
                if is_handshake_message(message_type) {
                    handle
                        .entry
                        .read_deadline
                        .send_replace(Instant::now() + REJECT_AFTER_TIME);
                }
                handle
            }
            Entry::Vacant(vacant) => {
                match create_session(&shared, &tracker, msg.src, client_key) {
                    Ok(handle) => {
                        info!(
                            server = %shared.name,
                            listen = %shared.proxy_listen,
                            client = %msg.src,
                            wg_endpoint = %shared.wg_addr,
                            wg_tunnel_mtu = wg_tunnel_mtu(
                                handle.entry.max_proxy_packet_size,
                                shared.front_overhead + shared.rear_overhead,
                            ),
                            "New session"
                        );
                        vacant.insert(handle)
                    }
                    Err(e) => {
                        warn!(
                            server = %shared.name,
                            listen = %shared.proxy_listen,
                            client = %msg.src,
                            error = %e,
                            "Failed to create session"
                        );
                        continue;
                    }
                }
            }
        };

        if let Err(e) =
            update_oob_cache(&mut handle.entry.client_oob_cache.lock(), &oob_buf[..msg.oob_len])
        {
            warn!(
                server = %shared.name,
                listen = %shared.proxy_listen,
                client = %msg.src,
                error = %e,
                "Failed to process packet info from proxy listener"
            );
        }

        match handle.send_queue.try_send(QueuedPacket {
            buf: packet_buf,
            start: wg_range.start,
            len: wg_range.len(),
        }) {
            Ok(()) => {}
            Err(TrySendError::Full(_packet)) => {
                debug!(
                    server = %shared.name,
                    client = %msg.src,
                    wg_endpoint = %shared.wg_addr,
                    "WireGuard packet dropped due to full send channel"
                );
            }
            Err(TrySendError::Closed(_packet)) => {
                debug!(
                    server = %shared.name,
                    client = %msg.src,
                    "WireGuard packet dropped: send channel closed"
                );
            }
        }
    }
}

/// Create the NAT entry for a new client and spawn its two session tasks.
/// Called with the table lock held.
fn create_session(
    shared: &Arc<ServerShared>,
    tracker: &TaskTracker,
    client_addr: SocketAddr,
    client_key: SocketAddr,
) -> Result<SessionHandle, SwgpError> {
    let bind_addr = if shared.wg_send_addr.is_ipv4() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    };
    let (wg_socket, soft_err) = listen_udp(bind_addr, false, shared.wg_fwmark)?;
    if let Some(serr) = soft_err {
        warn!(
            server = %shared.name,
            client = %client_addr,
            fwmark = shared.wg_fwmark,
            error = %serr,
            "An error occurred while setting socket options on the upstream socket"
        );
    }
    let wg_socket = UdpSocket::from_std(wg_socket).map_err(SwgpError::Io)?;

    let (deadline_tx, deadline_rx) = watch::channel(Instant::now() + REJECT_AFTER_TIME);
    let (queue_tx, queue_rx) = mpsc::channel(SEND_CHANNEL_CAPACITY);

    let entry = Arc::new(ServerNatEntry {
        wg_socket: Arc::new(wg_socket),
        client_oob_cache: Mutex::new(Vec::new()),
        read_deadline: deadline_tx,
        max_proxy_packet_size: max_proxy_packet_size(shared.mtu, client_key),
    });

    tracker.spawn(relay_wg_to_proxy(
        Arc::clone(shared),
        client_addr,
        client_key,
        Arc::clone(&entry),
        deadline_rx,
    ));
    tracker.spawn(relay_queue_to_wg(
        Arc::clone(shared),
        client_addr,
        Arc::clone(&entry),
        queue_rx,
    ));

    Ok(SessionHandle {
        entry,
        send_queue: queue_tx,
    })
}

/// Egress loop: read WireGuard packets from the session's upstream socket,
/// encrypt in place and write them to the client through the listener.
///
/// Exits when the read deadline fires or the relay shuts down, then tears
/// the session down by removing its table slot.
async fn relay_wg_to_proxy(
    shared: Arc<ServerShared>,
    client_addr: SocketAddr,
    client_key: SocketAddr,
    entry: Arc<ServerNatEntry>,
    mut deadline_rx: watch::Receiver<Instant>,
) {
    let mut packet_buf = vec![0u8; entry.max_proxy_packet_size];
    let front_overhead = shared.front_overhead;
    let plaintext_end = entry.max_proxy_packet_size - shared.rear_overhead;

    loop {
        let deadline = *deadline_rx.borrow_and_update();

        let (n, raddr) = tokio::select! {
            result = entry.wg_socket.recv_from(&mut packet_buf[front_overhead..plaintext_end]) => {
                match result {
                    Ok(received) => received,
                    Err(e) => {
                        warn!(
                            server = %shared.name,
                            client = %client_addr,
                            wg_endpoint = %shared.wg_addr,
                            error = %e,
                            "Failed to read from upstream socket"
                        );
                        continue;
                    }
                }
            }
            () = tokio::time::sleep_until(deadline) => {
                // The deadline may have been refreshed while we slept.
                if *deadline_rx.borrow() <= Instant::now() {
                    break;
                }
                continue;
            }
            _ = deadline_rx.changed() => continue,
            () = shared.shutdown.cancelled() => break,
        };

        if canonical_addr(raddr) != shared.wg_addr {
            debug!(
                server = %shared.name,
                client = %client_addr,
                wg_endpoint = %shared.wg_addr,
                source = %raddr,
                "Ignoring packet from non-endpoint address"
            );
            continue;
        }

        let swgp_range = match shared
            .handler
            .encrypt_zero_copy(&mut packet_buf, front_overhead, n)
        {
            Ok(range) => range,
            Err(e) => {
                warn!(
                    server = %shared.name,
                    client = %client_addr,
                    wg_endpoint = %shared.wg_addr,
                    error = %e,
                    "Failed to encrypt WireGuard packet"
                );
                continue;
            }
        };

        let oob = entry.client_oob_cache.lock().clone();
        if let Err(e) = send_msg(&shared.proxy_sock, &packet_buf[swgp_range], &oob, client_addr).await
        {
            if shared.shutdown.is_cancelled() {
                break;
            }
            warn!(
                server = %shared.name,
                client = %client_addr,
                error = %e,
                "Failed to write swgp packet to proxy listener"
            );
        }
    }

    // Teardown: removing the slot drops the queue's only sender, closing
    // the queue for the sender worker.
    let removed = shared.table.lock().remove(&client_key);
    drop(removed);

    debug!(
        server = %shared.name,
        client = %client_addr,
        "Session ended"
    );
}

/// Sender worker: drain the session's send queue to the upstream socket,
/// returning each buffer to the pool after the write.
///
/// Exits when the queue is closed and drained; the upstream socket closes
/// with the last entry reference dropped here.
async fn relay_queue_to_wg(
    shared: Arc<ServerShared>,
    client_addr: SocketAddr,
    entry: Arc<ServerNatEntry>,
    mut queue_rx: mpsc::Receiver<QueuedPacket>,
) {
    while let Some(packet) = queue_rx.recv().await {
        let wg_packet = &packet.buf[packet.start..packet.start + packet.len];
        if let Err(e) = entry.wg_socket.send_to(wg_packet, shared.wg_send_addr).await {
            warn!(
                server = %shared.name,
                client = %client_addr,
                wg_endpoint = %shared.wg_addr,
                error = %e,
                "Failed to write WireGuard packet to upstream socket"
            );
        }
        // packet.buf returns to the pool here.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(mtu: u32, mode: &str) -> ServerConfig {
        ServerConfig {
            name: "test".into(),
            proxy_listen: "127.0.0.1:0".parse().unwrap(),
            proxy_mode: mode.into(),
            proxy_psk: BASE64_STANDARD.encode([0u8; 32]),
            proxy_fwmark: 0,
            wg_endpoint: "127.0.0.1:51820".into(),
            wg_fwmark: 0,
            mtu,
            disable_sendmmsg: false,
        }
    }

    #[test]
    fn test_max_proxy_packet_size_by_family() {
        let v4: SocketAddr = "10.0.0.1:51820".parse().unwrap();
        let mapped: SocketAddr = "[::ffff:10.0.0.1]:51820".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::1]:51820".parse().unwrap();

        assert_eq!(max_proxy_packet_size(1500, v4), 1500 - 20 - 8);
        assert_eq!(max_proxy_packet_size(1500, mapped), 1500 - 20 - 8);
        assert_eq!(max_proxy_packet_size(1500, v6), 1500 - 40 - 8);
    }

    #[test]
    fn test_wg_tunnel_mtu_rounds_down_to_16() {
        let mtu = wg_tunnel_mtu(1420 - 20 - 8, 0);
        assert_eq!(mtu % 16, 0);
        assert_eq!(mtu, (1392 - 32) & !0b1111);
    }

    #[test]
    fn test_display() {
        let server = Server::new(test_config(1500, "zero-overhead"));
        assert_eq!(server.to_string(), "test swgp server service");
    }

    #[tokio::test]
    async fn test_start_rejects_small_mtu() {
        let server = Server::new(test_config(1279, "zero-overhead"));
        assert!(matches!(
            server.start().await,
            Err(StartError::MtuTooSmall { mtu: 1279 })
        ));
    }

    #[tokio::test]
    async fn test_start_rejects_unknown_mode() {
        let server = Server::new(test_config(1500, "rot13"));
        assert!(matches!(server.start().await, Err(StartError::Handler(_))));
    }

    #[tokio::test]
    async fn test_start_rejects_bad_psk() {
        let mut config = test_config(1500, "zero-overhead");
        config.proxy_psk = "!!!not-base64!!!".into();
        let server = Server::new(config);
        assert!(matches!(
            server.start().await,
            Err(StartError::PskEncoding(_))
        ));

        let mut config = test_config(1500, "paranoid");
        config.proxy_psk = BASE64_STANDARD.encode([0u8; 16]);
        let server = Server::new(config);
        assert!(matches!(server.start().await, Err(StartError::Handler(_))));
    }

    #[tokio::test]
    async fn test_start_rejects_unresolvable_endpoint() {
        let mut config = test_config(1500, "zero-overhead");
        config.wg_endpoint = "no-such-host.invalid:51820".into();
        let server = Server::new(config);
        assert!(matches!(
            server.start().await,
            Err(StartError::ResolveEndpoint { .. })
        ));
    }

    #[tokio::test]
    async fn test_resolve_endpoint_literal() {
        let addr = resolve_endpoint("192.0.2.7:51820").await.unwrap();
        assert_eq!(addr, "192.0.2.7:51820".parse().unwrap());
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let server = Server::new(test_config(1500, "zero-overhead"));
        server.stop().await.unwrap();
        assert_eq!(server.session_count(), 0);
    }
}

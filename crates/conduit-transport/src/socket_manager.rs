//! The single event-driven worker that owns every live socket (§4.3).
//!
//! `SocketManager` runs its own `tokio` runtime inside one OS thread
//! (`conduit_core::worker::CancellableWorker`'s thread) and spawns a task per
//! live connection plus one task for the TCP accept loop and one for the UDP
//! responder. This is the single exception to the "no async scheduler"
//! concurrency model (§5, §9 "avoiding a global event loop"): socket I/O is
//! the one place genuine async multiplexing earns its keep, and nothing
//! outside this module ever awaits anything.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use conduit_core::config::{ContextConfig, PROTOCOL_VERSION};
use conduit_core::message::Message;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::runtime::Runtime;
use tracing::{info, warn};

use crate::error::TransportError;
use crate::tcp::{self, PeerConnection};
use crate::udp;

/// Invoked by the manager whenever a fully decoded application message (not
/// a handshake, which the manager consumes itself) arrives from a peer.
pub type InboundHandler = Arc<dyn Fn(Message) + Send + Sync>;
/// Invoked when a peer connection dies, so the router can fail pending
/// futures bound to it with `PeerLost` (§4.3).
pub type PeerLostHandler = Arc<dyn Fn(&str) + Send + Sync>;

pub struct SocketManager {
    runtime: Runtime,
    config: ContextConfig,
    local_context: String,
    local_tcp_addr: SocketAddr,
    peers: Arc<Mutex<HashMap<String, Arc<PeerConnection>>>>,
    on_inbound: InboundHandler,
    on_peer_lost: PeerLostHandler,
}

impl SocketManager {
    /// Binds the TCP listener and UDP discovery socket and starts the
    /// accept/responder loops. Blocking, bounded by socket setup time only.
    pub fn start(
        config: ContextConfig,
        local_context: String,
        on_inbound: InboundHandler,
        on_peer_lost: PeerLostHandler,
    ) -> Result<Self, TransportError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("conduit-socket-manager")
            .enable_all()
            .build()
            .expect("failed to build socket manager tokio runtime");

        let bind_addr: SocketAddr = format!("{}:{}", config.bind_host, config.bind_port)
            .parse()
            .map_err(|_| TransportError::HandshakeRejected("invalid bind address".into()))?;
        let listener = runtime.block_on(TcpListener::bind(bind_addr))?;
        let local_tcp_addr = listener.local_addr()?;

        let discovery_addr: SocketAddr = format!("{}:{}", config.bind_host, config.discovery_port)
            .parse()
            .map_err(|_| TransportError::HandshakeRejected("invalid discovery address".into()))?;
        let discovery_socket = runtime.block_on(UdpSocket::bind(discovery_addr))?;

        let peers = Arc::new(Mutex::new(HashMap::new()));

        {
            let peer_context = local_context.clone();
            let workgroup = config.workgroup.clone();
            runtime.spawn(udp::run_responder(discovery_socket, peer_context, workgroup, local_tcp_addr.port()));
        }

        {
            let local_context = local_context.clone();
            let workgroup = config.workgroup.clone();
            let max_frame_bytes = config.max_frame_bytes;
            let peers = peers.clone();
            let on_inbound = on_inbound.clone();
            let on_peer_lost = on_peer_lost.clone();
            runtime.spawn(async move {
                loop {
                    let (stream, remote_addr) = match listener.accept().await {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(error = %err, "accept failed");
                            continue;
                        }
                    };
                    let local_context = local_context.clone();
                    let workgroup = workgroup.clone();
                    let peers = peers.clone();
                    let on_inbound = on_inbound.clone();
                    let on_peer_lost = on_peer_lost.clone();
                    tokio::spawn(async move {
                        if let Err(err) = accept_connection(
                            stream,
                            remote_addr,
                            local_context,
                            workgroup,
                            max_frame_bytes,
                            peers,
                            on_inbound,
                            on_peer_lost,
                        )
                        .await
                        {
                            warn!(error = %err, %remote_addr, "inbound handshake failed");
                        }
                    });
                }
            });
        }

        info!(%local_tcp_addr, workgroup = %config.workgroup, "socket manager listening");
        Ok(Self { runtime, config, local_context, local_tcp_addr, peers, on_inbound, on_peer_lost })
    }

    pub fn local_tcp_addr(&self) -> SocketAddr {
        self.local_tcp_addr
    }

    /// Broadcasts a discovery request and waits up to `window` for replies
    /// (§4.2 `discover()`).
    pub fn discover(&self, window: Duration) -> Vec<(String, SocketAddr, u32)> {
        let bind_addr: SocketAddr = format!("{}:0", self.config.bind_host).parse().unwrap();
        let broadcast_target: SocketAddr = format!("255.255.255.255:{}", self.config.discovery_port)
            .parse()
            .unwrap();
        let workgroup = self.config.workgroup.clone();
        self.runtime
            .block_on(udp::discover(bind_addr, broadcast_target, &workgroup, window))
            .unwrap_or_else(|err| {
                warn!(error = %err, "discovery failed");
                Vec::new()
            })
    }

    /// Opens (or reuses) a connection to `name`, exchanging handshakes on
    /// both sides before returning (§4.2 `connect_peer`).
    pub fn connect_peer(&self, name: &str, endpoint: Option<SocketAddr>) -> Result<(), TransportError> {
        if self.peers.lock().get(name).is_some_and(|p| p.is_alive()) {
            return Ok(());
        }

        let endpoint = match endpoint {
            Some(addr) => addr,
            None => {
                let found = self.discover(self.config.discovery_window());
                found
                    .into_iter()
                    .find(|(context, _, _)| context == name)
                    .map(|(_, addr, _)| addr)
                    .ok_or_else(|| TransportError::DiscoveryEmpty(name.to_owned()))?
            }
        };

        let local_context = self.local_context.clone();
        let workgroup = self.config.workgroup.clone();
        let max_frame_bytes = self.config.max_frame_bytes;
        let timeout = self.config.handshake_timeout();
        let peers = self.peers.clone();
        let on_inbound = self.on_inbound.clone();
        let on_peer_lost = self.on_peer_lost.clone();
        let expected_name = name.to_owned();

        self.runtime.block_on(async move {
            let connect_fut = async {
                let stream = TcpStream::connect(endpoint).await?;
                tcp::configure_socket(&stream, None).ok();
                let (mut read_half, mut write_half) = tokio::io::split(stream);

                let hello = Message::Handshake {
                    source: conduit_core::address::Address::context_only(&local_context)
                        .expect("local context name already validated"),
                    destination: conduit_core::address::Address::context_only(&expected_name)
                        .map_err(|_| TransportError::HandshakeRejected("bad peer name".into()))?,
                    peer_context: local_context.clone(),
                    workgroup: workgroup.clone(),
                    protocol_version: PROTOCOL_VERSION,
                };
                tcp::write_frame(&mut write_half, &hello).await?;
                let reply = tcp::read_frame(&mut read_half, max_frame_bytes).await?;
                let (remote_context, remote_workgroup, remote_version) = match reply {
                    Message::Handshake { peer_context, workgroup, protocol_version, .. } => {
                        (peer_context, workgroup, protocol_version)
                    }
                    _ => return Err(TransportError::HandshakeRejected("expected handshake frame".into())),
                };
                if remote_workgroup != workgroup || remote_version != PROTOCOL_VERSION {
                    return Err(TransportError::HandshakeRejected("workgroup or protocol mismatch".into()));
                }
                if remote_context != expected_name {
                    return Err(TransportError::HandshakeRejected(format!(
                        "expected to reach `{expected_name}`, reached `{remote_context}`"
                    )));
                }

                let outbound = tcp::spawn_writer(write_half);
                let conn = Arc::new(PeerConnection::new(remote_context.clone(), endpoint, outbound));
                peers.lock().insert(remote_context.clone(), conn.clone());

                tokio::spawn(read_loop(read_half, conn, max_frame_bytes, peers.clone(), on_inbound, on_peer_lost));
                Ok::<(), TransportError>(())
            };
            match tokio::time::timeout(timeout, connect_fut).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::HandshakeTimeout),
            }
        })
    }

    /// Enqueues `message` on the connection already open to its
    /// destination context, if any.
    pub fn send_to_peer(&self, context: &str, message: Message) -> Result<(), TransportError> {
        let peer = {
            let peers = self.peers.lock();
            peers.get(context).cloned()
        };
        match peer {
            Some(conn) if conn.is_alive() => conn.enqueue(message),
            _ => Err(TransportError::PeerGone),
        }
    }

    pub fn disconnect_peer(&self, name: &str) {
        if let Some(conn) = self.peers.lock().remove(name) {
            conn.mark_dead();
        }
        (self.on_peer_lost)(name);
    }

    pub fn known_peers(&self) -> Vec<(String, SocketAddr)> {
        self.peers
            .lock()
            .values()
            .filter(|p| p.is_alive())
            .map(|p| (p.remote_context.clone(), p.remote_addr))
            .collect()
    }

    pub fn shutdown(self) {
        // Dropping the runtime aborts every spawned accept/read/write task;
        // peers learn about the local shutdown implicitly via socket close.
        drop(self.runtime);
    }
}

#[allow(clippy::too_many_arguments)]
async fn accept_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    local_context: String,
    workgroup: String,
    max_frame_bytes: u32,
    peers: Arc<Mutex<HashMap<String, Arc<PeerConnection>>>>,
    on_inbound: InboundHandler,
    on_peer_lost: PeerLostHandler,
) -> Result<(), TransportError> {
    tcp::configure_socket(&stream, None).ok();
    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let request = tcp::read_frame(&mut read_half, max_frame_bytes).await?;
    let (remote_context, remote_workgroup, remote_version) = match request {
        Message::Handshake { peer_context, workgroup, protocol_version, .. } => (peer_context, workgroup, protocol_version),
        _ => return Err(TransportError::HandshakeRejected("expected handshake frame".into())),
    };

    if remote_workgroup != workgroup || remote_version != PROTOCOL_VERSION {
        let rejection = conduit_core::message::Message::error_reply(
            conduit_core::address::Address::context_only(&local_context).unwrap(),
            conduit_core::address::Address::context_only(&remote_context).unwrap_or_else(|_| {
                conduit_core::address::Address::context_only("unknown").unwrap()
            }),
            0,
            "ProtocolMismatch",
            "workgroup or protocol version mismatch",
        );
        let _ = tcp::write_frame(&mut write_half, &rejection).await;
        let mut stream = read_half.unsplit(write_half);
        let _ = stream.shutdown().await;
        return Err(TransportError::HandshakeRejected("workgroup or protocol mismatch".into()));
    }

    let reply = Message::Handshake {
        source: conduit_core::address::Address::context_only(&local_context).unwrap(),
        destination: conduit_core::address::Address::context_only(&remote_context).unwrap(),
        peer_context: local_context.clone(),
        workgroup: workgroup.clone(),
        protocol_version: PROTOCOL_VERSION,
    };
    tcp::write_frame(&mut write_half, &reply).await?;

    let outbound = tcp::spawn_writer(write_half);
    let conn = Arc::new(PeerConnection::new(remote_context.clone(), remote_addr, outbound));
    peers.lock().insert(remote_context.clone(), conn.clone());
    info!(peer = %remote_context, %remote_addr, "peer connected (inbound)");

    read_loop(read_half, conn, max_frame_bytes, peers, on_inbound, on_peer_lost).await;
    Ok(())
}

async fn read_loop(
    mut reader: tokio::io::ReadHalf<TcpStream>,
    conn: Arc<PeerConnection>,
    max_frame_bytes: u32,
    peers: Arc<Mutex<HashMap<String, Arc<PeerConnection>>>>,
    on_inbound: InboundHandler,
    on_peer_lost: PeerLostHandler,
) {
    loop {
        match tcp::read_frame(&mut reader, max_frame_bytes).await {
            Ok(message) => {
                conn.touch();
                on_inbound(message);
            }
            Err(err) => {
                warn!(peer = %conn.remote_context, error = %err, "peer connection closed");
                conn.mark_dead();
                peers.lock().remove(&conn.remote_context);
                on_peer_lost(&conn.remote_context);
                break;
            }
        }
    }
}

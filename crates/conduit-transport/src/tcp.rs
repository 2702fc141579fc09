//! Framed TCP peer connections (§4.3, §6).
//!
//! A peer connection is a `u32` big-endian length prefix followed by a
//! canonically encoded [`Message`]. The first frame in either direction is
//! always the [`Message::Handshake`]; everything after it is application
//! traffic. Reading and writing are split across two tasks per connection
//! (mirroring the half-duplex split `tokio::io::split` gives a `TcpStream`)
//! so that a slow reader never starves outbound signal/reply delivery.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use conduit_core::codec;
use conduit_core::message::Message;
use parking_lot::Mutex;
use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Sets `SO_LINGER` so that half-closed connections are reclaimed promptly
/// instead of lingering in the kernel's default teardown window.
pub fn configure_socket(stream: &TcpStream, linger: Option<Duration>) -> std::io::Result<()> {
    SockRef::from(stream).set_linger(linger)
}

/// Reads one length-prefixed frame, enforcing `max_frame_bytes` (§4.3).
pub async fn read_frame(
    reader: &mut ReadHalf<TcpStream>,
    max_frame_bytes: u32,
) -> Result<Message, TransportError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(TransportError::Io)?;
    let len = u32::from_be_bytes(len_buf);
    if len > max_frame_bytes {
        return Err(TransportError::FrameTooLarge { actual: len, max: max_frame_bytes });
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await.map_err(TransportError::Io)?;
    Ok(codec::decode_message(&payload)?)
}

/// Writes one length-prefixed frame.
pub async fn write_frame(writer: &mut WriteHalf<TcpStream>, message: &Message) -> Result<(), TransportError> {
    let encoded = codec::encode_message(message);
    let framed = codec::encode_frame(&encoded);
    writer.write_all(&framed).await.map_err(TransportError::Io)?;
    Ok(())
}

/// A live peer connection: a remote context name learned from the
/// handshake, the socket's outbound queue, and liveness bookkeeping (§3,
/// "Peer connection record").
pub struct PeerConnection {
    pub remote_context: String,
    pub remote_addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Message>,
    alive: Arc<AtomicBool>,
    last_activity: Mutex<Instant>,
}

impl PeerConnection {
    pub(crate) fn new(remote_context: String, remote_addr: SocketAddr, outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            remote_context,
            remote_addr,
            outbound,
            alive: Arc::new(AtomicBool::new(true)),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    /// Enqueues `message` for this peer's writer task; non-blocking, per the
    /// router's "returns immediately" requirement for warm connections.
    pub fn enqueue(&self, message: Message) -> Result<(), TransportError> {
        self.outbound.send(message).map_err(|_| TransportError::PeerGone)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_dead(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }
}

/// Splits a connected stream into a writer task (draining an outbound
/// channel) and a reader loop the caller drives directly, returning the
/// sender half so the caller can build a [`PeerConnection`] around it.
pub fn spawn_writer(mut writer: WriteHalf<TcpStream>) -> mpsc::UnboundedSender<Message> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if write_frame(&mut writer, &message).await.is_err() {
                break;
            }
        }
    });
    tx
}

//! UDP workgroup discovery (§4.3, §6).
//!
//! The responder binds the well-known discovery port and answers any
//! `discover` datagram whose workgroup matches the local one with a `here`
//! datagram carrying this context's name and TCP endpoint. Datagrams for a
//! different workgroup are ignored silently, which is the whole of the
//! visibility scope this protocol offers (§9: "not a security boundary").

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use conduit_core::value::Value;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::TransportError;

pub struct DiscoveryRequest {
    pub workgroup: String,
}

pub struct DiscoveryResponse {
    pub workgroup: String,
    pub context: String,
    pub host: String,
    pub port: u16,
    pub protocol_version: u32,
}

fn encode_request(req: &DiscoveryRequest) -> bytes::BytesMut {
    let mut fields = BTreeMap::new();
    fields.insert("workgroup".to_owned(), Value::Str(req.workgroup.clone()));
    let mut buf = bytes::BytesMut::new();
    conduit_core::codec::encode_value(&Value::record("discover", fields), &mut buf);
    buf
}

fn encode_response(resp: &DiscoveryResponse) -> bytes::BytesMut {
    let mut fields = BTreeMap::new();
    fields.insert("workgroup".to_owned(), Value::Str(resp.workgroup.clone()));
    fields.insert("context".to_owned(), Value::Str(resp.context.clone()));
    fields.insert("host".to_owned(), Value::Str(resp.host.clone()));
    fields.insert("port".to_owned(), Value::Int(resp.port as i64));
    fields.insert("protocol_version".to_owned(), Value::Int(resp.protocol_version as i64));
    let mut buf = bytes::BytesMut::new();
    conduit_core::codec::encode_value(&Value::record("here", fields), &mut buf);
    buf
}

fn decode_datagram(bytes: &[u8]) -> Option<Value> {
    let mut cursor = bytes::Bytes::copy_from_slice(bytes);
    conduit_core::codec::decode_value(&mut cursor).ok()
}

/// Runs forever (until the owning task is aborted), answering discovery
/// requests for `local_workgroup`.
pub async fn run_responder(socket: UdpSocket, local_context: String, local_workgroup: String, tcp_port: u16) {
    let mut buf = vec![0u8; 4096];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(error = %err, "discovery socket read failed");
                continue;
            }
        };
        let Some(value) = decode_datagram(&buf[..len]) else {
            continue;
        };
        let Some((tag, fields)) = value.as_record() else { continue };
        if tag != "discover" {
            continue;
        }
        let Some(workgroup) = fields.get("workgroup").and_then(Value::as_str) else { continue };
        if workgroup != local_workgroup {
            debug!(%workgroup, "ignoring discovery request for a foreign workgroup");
            continue;
        }
        let response = DiscoveryResponse {
            workgroup: local_workgroup.clone(),
            context: local_context.clone(),
            host: local_host_for(&peer),
            port: tcp_port,
            protocol_version: conduit_core::config::PROTOCOL_VERSION,
        };
        let payload = encode_response(&response);
        if let Err(err) = socket.send_to(&payload, peer).await {
            warn!(error = %err, "failed to answer discovery request");
        }
    }
}

fn local_host_for(peer: &SocketAddr) -> String {
    // The responder reports the address family appropriate to the asker;
    // callers that need a specific advertised address should configure one
    // explicitly rather than rely on this best-effort default.
    match peer {
        SocketAddr::V4(_) => "127.0.0.1".to_owned(),
        SocketAddr::V6(_) => "::1".to_owned(),
    }
}

/// Broadcasts a single discovery request and collects `here` responses for
/// `window`, filtering to `workgroup` (§4.2 `discover()`).
pub async fn discover(
    bind_addr: SocketAddr,
    broadcast_target: SocketAddr,
    workgroup: &str,
    window: Duration,
) -> Result<Vec<(String, SocketAddr, u32)>, TransportError> {
    let socket = UdpSocket::bind(bind_addr).await?;
    socket.set_broadcast(true)?;
    let payload = encode_request(&DiscoveryRequest { workgroup: workgroup.to_owned() });
    socket.send_to(&payload, broadcast_target).await?;

    let deadline = Instant::now() + window;
    let mut found = Vec::new();
    let mut buf = vec![0u8; 4096];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let recv = tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await;
        let Ok(Ok((len, _peer))) = recv else { break };
        let Some(value) = decode_datagram(&buf[..len]) else { continue };
        let Some((tag, fields)) = value.as_record() else { continue };
        if tag != "here" {
            continue;
        }
        let Some(resp_workgroup) = fields.get("workgroup").and_then(Value::as_str) else { continue };
        if resp_workgroup != workgroup {
            continue;
        }
        let (Some(context), Some(host), Some(port), Some(version)) = (
            fields.get("context").and_then(Value::as_str),
            fields.get("host").and_then(Value::as_str),
            fields.get("port").and_then(Value::as_int),
            fields.get("protocol_version").and_then(Value::as_int),
        ) else {
            continue;
        };
        let Ok(addr): Result<SocketAddr, _> = format!("{host}:{port}").parse() else { continue };
        if found.iter().any(|(name, _, _): &(String, SocketAddr, u32)| name == context) {
            continue;
        }
        found.push((context.to_owned(), addr, version as u32));
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn discovery_request_and_response_round_trip_through_the_wire_encoding() {
        let request_bytes = encode_request(&DiscoveryRequest { workgroup: "lab".into() });
        let decoded = decode_datagram(&request_bytes).unwrap();
        let (tag, fields) = decoded.as_record().unwrap();
        assert_eq!(tag, "discover");
        assert_eq!(fields.get("workgroup").and_then(Value::as_str), Some("lab"));

        let response_bytes = encode_response(&DiscoveryResponse {
            workgroup: "lab".into(),
            context: "ctx-a".into(),
            host: "127.0.0.1".into(),
            port: 40001,
            protocol_version: 1,
        });
        let decoded = decode_datagram(&response_bytes).unwrap();
        let (tag, fields) = decoded.as_record().unwrap();
        assert_eq!(tag, "here");
        assert_eq!(fields.get("context").and_then(Value::as_str), Some("ctx-a"));
    }

    /// Exercises `run_responder`'s real filtering logic over loopback UDP,
    /// addressing each responder directly rather than relying on OS-level
    /// broadcast (which a sandboxed test environment may not support).
    #[tokio::test]
    async fn responder_only_answers_requests_for_its_own_workgroup() {
        let x_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let x_addr = x_socket.local_addr().unwrap();
        tokio::spawn(run_responder(x_socket, "ctx-x".into(), "X".into(), 40001));

        let y_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let y_addr = y_socket.local_addr().unwrap();
        tokio::spawn(run_responder(y_socket, "ctx-y".into(), "Y".into(), 40002));

        let asker = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let payload = encode_request(&DiscoveryRequest { workgroup: "X".into() });
        asker.send_to(&payload, x_addr).await.unwrap();
        asker.send_to(&payload, y_addr).await.unwrap();

        let mut buf = vec![0u8; 4096];
        let (len, from) = tokio::time::timeout(Duration::from_millis(500), asker.recv_from(&mut buf)).await.unwrap().unwrap();
        assert_eq!(from, x_addr);
        let decoded = decode_datagram(&buf[..len]).unwrap();
        let (tag, fields) = decoded.as_record().unwrap();
        assert_eq!(tag, "here");
        assert_eq!(fields.get("context").and_then(Value::as_str), Some("ctx-x"));

        // The Y-workgroup responder never answers an X-workgroup request.
        let second = tokio::time::timeout(Duration::from_millis(200), asker.recv_from(&mut buf)).await;
        assert!(second.is_err(), "the Y-workgroup responder must not answer an X-workgroup request");
    }
}

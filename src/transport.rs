//! Upstream transport (C2): one DNS exchange with one resolver endpoint,
//! under a caller-supplied timeout. TCP framing is a 2-byte big-endian
//! length prefix followed by the message, per RFC 1035 §4.2.2, with
//! `tokio::time::timeout` applied to the whole exchange.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use crate::config::ResolverEndpoint;
use crate::error::{ProxyError, Result};
use crate::wire::Message;

/// Sends `request` to `endpoint` over UDP and waits for a single validated
/// reply, up to `deadline`. A mismatched reply (wrong ID or question) is
/// treated the same as no reply: the caller falls through to the next
/// candidate.
pub async fn query_udp(
    endpoint: &ResolverEndpoint,
    request: &Message,
    deadline: Duration,
) -> Result<Message> {
    let addr = endpoint.socket_addr()?;
    let exchange = async {
        let socket = bind_ephemeral_udp(addr).await?;
        socket
            .send(&request.raw)
            .await
            .map_err(|e| network_error(addr, e))?;

        let mut buf = vec![0u8; 65535];
        let read = socket.recv(&mut buf).await.map_err(|e| network_error(addr, e))?;
        buf.truncate(read);
        let response = Message::parse(Bytes::from(buf))?;
        if !crate::wire::message::validate_response_matches(request, &response) {
            return Err(ProxyError::MismatchError { endpoint: addr });
        }
        if !response.is_success() {
            return Err(ProxyError::UpstreamFailure {
                endpoint: addr,
                rcode: response.rcode(),
            });
        }
        Ok(response)
    };

    timeout(deadline, exchange)
        .await
        .map_err(|_| ProxyError::Timeout {
            endpoint: addr,
            elapsed_ms: deadline.as_millis() as u64,
        })?
}

async fn bind_ephemeral_udp(peer: SocketAddr) -> Result<UdpSocket> {
    let bind_addr = if peer.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind_addr).await.map_err(|e| network_error(peer, e))?;
    socket.connect(peer).await.map_err(|e| network_error(peer, e))?;
    Ok(socket)
}

/// Sends `request` to `endpoint` over TCP, length-prefixed per RFC 1035
/// §4.2.2, with `deadline` applied to the whole exchange (connect + write +
/// read).
pub async fn query_tcp(
    endpoint: &ResolverEndpoint,
    request: &Message,
    deadline: Duration,
) -> Result<Message> {
    let addr = endpoint.socket_addr()?;
    let exchange = async {
        let mut stream = TcpStream::connect(addr).await.map_err(|e| network_error(addr, e))?;

        let len = u16::try_from(request.raw.len())
            .map_err(|_| ProxyError::parse("request too large for TCP framing"))?;
        stream.write_all(&len.to_be_bytes()).await.map_err(|e| network_error(addr, e))?;
        stream.write_all(&request.raw).await.map_err(|e| network_error(addr, e))?;
        stream.flush().await.map_err(|e| network_error(addr, e))?;

        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await.map_err(|e| network_error(addr, e))?;
        let response_len = u16::from_be_bytes(len_buf) as usize;

        let mut buf = vec![0u8; response_len];
        stream.read_exact(&mut buf).await.map_err(|e| network_error(addr, e))?;

        let response = Message::parse(Bytes::from(buf))?;
        if !crate::wire::message::validate_response_matches(request, &response) {
            return Err(ProxyError::MismatchError { endpoint: addr });
        }
        if !response.is_success() {
            return Err(ProxyError::UpstreamFailure {
                endpoint: addr,
                rcode: response.rcode(),
            });
        }
        Ok(response)
    };

    timeout(deadline, exchange)
        .await
        .map_err(|_| ProxyError::Timeout {
            endpoint: addr,
            elapsed_ms: deadline.as_millis() as u64,
        })?
}

/// Performs the UDP exchange first; if the response is truncated, retries
/// immediately over TCP to the same endpoint with a larger budget, per
/// RFC 7766. The TCP attempt's deadline is `udp_deadline * 2`, matching the
/// usual assumption that a stream round-trip costs more than a datagram one.
pub async fn query(
    endpoint: &ResolverEndpoint,
    request: &Message,
    udp_deadline: Duration,
) -> Result<Message> {
    let response = query_udp(endpoint, request, udp_deadline).await?;
    if !response.is_truncated() {
        return Ok(response);
    }

    match query_tcp(endpoint, request, udp_deadline * 2).await {
        Ok(tcp_response) => Ok(tcp_response),
        Err(_) => Ok(response),
    }
}

fn network_error(endpoint: SocketAddr, source: std::io::Error) -> ProxyError {
    ProxyError::NetworkError { endpoint, source }
}

//! Listeners (C7): the UDP and TCP front doors. Each binds, then
//! `tokio::select!`s against a shutdown broadcast receiver, bounding
//! concurrent in-flight queries with a semaphore and spawning one task per
//! datagram (UDP) or per connection (TCP) to run the fallback-proxy
//! pipeline.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{Semaphore, broadcast};
use tracing::{debug, info, warn};

use crate::core::Core;
use crate::pipeline;
use crate::wire::Message;
use crate::wire::enums::Opcode;

pub async fn run_udp_listener(
    core: Arc<Core>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let addr = format!("{}:{}", core.config.listen_address, core.config.dns_port);
    let socket = Arc::new(UdpSocket::bind(&addr).await?);
    info!("UDP listener bound on {addr}");

    let semaphore = Arc::new(Semaphore::new(core.config.max_workers));
    let mut buf = vec![0u8; core.config.buffer_size];

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("UDP listener shutting down");
                break;
            }
            result = socket.recv_from(&mut buf) => {
                let (n, client_addr) = result?;

                let permit = match Arc::clone(&semaphore).try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("max concurrent queries reached, dropping UDP query from {client_addr}");
                        continue;
                    }
                };

                let request = match Message::parse(Bytes::copy_from_slice(&buf[..n])) {
                    Ok(request) => request,
                    Err(e) => {
                        debug!("dropping malformed UDP query from {client_addr}: {e}");
                        drop(permit);
                        continue;
                    }
                };
                if !matches!(request.opcode(), Opcode::Query) {
                    debug!("dropping non-QUERY opcode from {client_addr}: {:?}", request.opcode());
                    drop(permit);
                    continue;
                }

                let core = Arc::clone(&core);
                let socket = Arc::clone(&socket);
                tokio::spawn(async move {
                    let _permit = permit;
                    let response = pipeline::resolve(&core, request, client_addr).await;
                    if let Err(e) = socket.send_to(&response, client_addr).await {
                        warn!("failed to send UDP response to {client_addr}: {e}");
                    }
                });
            }
        }
    }

    drain(&semaphore, core.config.max_workers, core.config.shutdown_drain_grace).await;
    Ok(())
}

pub async fn run_tcp_listener(
    core: Arc<Core>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let addr = format!("{}:{}", core.config.listen_address, core.config.dns_port);
    let listener = TcpListener::bind(&addr).await?;
    info!("TCP listener bound on {addr}");

    let semaphore = Arc::new(Semaphore::new(core.config.max_workers));

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("TCP listener shutting down");
                break;
            }
            result = listener.accept() => {
                let (stream, client_addr) = result?;

                let permit = match Arc::clone(&semaphore).try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("max concurrent queries reached, resetting TCP connection from {client_addr}");
                        // Dropping without a graceful close sends a RST rather
                        // than a clean FIN, signaling overload to the client.
                        let _ = stream.set_linger(Some(Duration::ZERO));
                        drop(stream);
                        continue;
                    }
                };

                let core = Arc::clone(&core);
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(e) = handle_tcp_connection(stream, client_addr, core).await {
                        debug!("TCP connection from {client_addr} ended: {e}");
                    }
                });
            }
        }
    }

    drain(&semaphore, core.config.max_workers, core.config.shutdown_drain_grace).await;
    Ok(())
}

async fn handle_tcp_connection(
    mut stream: TcpStream,
    client_addr: std::net::SocketAddr,
    core: Arc<Core>,
) -> std::io::Result<()> {
    loop {
        let mut len_buf = [0u8; 2];
        let read = tokio::time::timeout(core.config.tcp_idle_timeout, stream.read_exact(&mut len_buf)).await;
        match read {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Ok(Err(e)) => return Err(e),
            Err(_) => return Ok(()), // idle timeout; close quietly
        }

        let message_len = u16::from_be_bytes(len_buf) as usize;
        let mut message_buf = vec![0u8; message_len];
        stream.read_exact(&mut message_buf).await?;

        let request = match Message::parse(Bytes::from(message_buf)) {
            Ok(request) => request,
            Err(e) => {
                debug!("dropping malformed TCP query from {client_addr}: {e}");
                return Ok(());
            }
        };
        if !matches!(request.opcode(), Opcode::Query) {
            debug!("dropping non-QUERY opcode from {client_addr}: {:?}", request.opcode());
            return Ok(());
        }

        let response = pipeline::resolve(&core, request, client_addr).await;
        let len = response.len() as u16;
        stream.write_all(&len.to_be_bytes()).await?;
        stream.write_all(&response).await?;
        stream.flush().await?;
    }
}

/// Waits up to `grace` for every outstanding permit to return, polling every
/// second so a shutdown that is taking a while at least produces one log line
/// per tick rather than going silent.
async fn drain(semaphore: &Semaphore, total_permits: usize, grace: Duration) {
    let deadline = tokio::time::Instant::now() + grace;
    loop {
        if semaphore.available_permits() >= total_permits {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!("shutdown grace period elapsed with queries still in flight");
            return;
        }
        tokio::time::sleep(Duration::from_secs(1).min(deadline - tokio::time::Instant::now())).await;
    }
}

//! Sockets: control stream, UDP discovery probe and the file channel

use crate::error::{SeestarError, SeestarResult};
use crate::protocol;
use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

const RECEIVE_BUFFER_SIZE: usize = 4096;

/// Open the control connection
pub async fn open_stream(host: &str, port: u16, connect_timeout: Duration) -> SeestarResult<TcpStream> {
    match timeout(connect_timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!("Could not set TCP_NODELAY: {}", e);
            }
            Ok(stream)
        }
        Ok(Err(e)) => Err(SeestarError::connection_failed(host, port, e)),
        Err(_) => Err(SeestarError::ConnectionTimeout {
            host: host.to_string(),
            port,
            duration: connect_timeout,
        }),
    }
}

/// Send one discovery datagram and wait briefly for a reply.
///
/// Guest mode on the device needs this probe before the TCP session opens.
/// Nothing here is fatal; every failure is logged and swallowed.
pub async fn send_discovery(host: &str, port: u16, request: &Value, wait: Duration) {
    if let Err(e) = try_discovery(host, port, request, wait).await {
        tracing::warn!("UDP discovery failed (non-critical): {}", e);
    }
}

async fn try_discovery(host: &str, port: u16, request: &Value, wait: Duration) -> SeestarResult<()> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    socket.set_broadcast(true)?;

    let payload = serde_json::to_vec(request)?;
    tracing::info!("Sending UDP discovery to {}:{}", host, port);
    socket.send_to(&payload, (host, port)).await?;

    let mut buf = [0u8; 1024];
    match timeout(wait, socket.recv_from(&mut buf)).await {
        Ok(Ok((len, from))) => {
            tracing::info!(
                "Received UDP response from {}: {}",
                from,
                String::from_utf8_lossy(&buf[..len])
            );
        }
        Ok(Err(e)) => tracing::debug!("UDP discovery receive error: {}", e),
        Err(_) => tracing::debug!("No UDP response (this is normal)"),
    }
    Ok(())
}

/// Fetch a file over the file channel: send one request line, read until EOF
pub async fn download_file(
    host: &str,
    port: u16,
    remote_path: &str,
    connect_timeout: Duration,
) -> SeestarResult<Vec<u8>> {
    tracing::info!("Opening file transfer connection to {}:{}", host, port);
    let mut stream = open_stream(host, port, connect_timeout).await?;

    let transfer_error = |e: std::io::Error| SeestarError::FileTransfer {
        path: remote_path.to_string(),
        reason: e.to_string(),
    };

    let request = protocol::file_request(remote_path)?;
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(transfer_error)?;
    stream.flush().await.map_err(transfer_error)?;

    let mut data = Vec::new();
    let mut chunk = [0u8; RECEIVE_BUFFER_SIZE];
    loop {
        let n = stream.read(&mut chunk).await.map_err(transfer_error)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&chunk[..n]);
    }
    let _ = stream.shutdown().await;

    if data.is_empty() {
        return Err(SeestarError::FileNotFound(remote_path.to_string()));
    }

    tracing::info!("Downloaded {} bytes from {}", data.len(), remote_path);
    Ok(data)
}

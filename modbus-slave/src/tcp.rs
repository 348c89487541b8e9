//! Modbus TCP transport: one producer task per accepted connection.

use std::io;
use std::net::SocketAddr;

use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::frame::{TcpFrame, MBAP_HEADER_LEN, TCP_MAX_LEN};
use crate::server::{self, Event};

pub(crate) async fn accept_loop(
    listener: TcpListener,
    queue: mpsc::Sender<Event>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = server::shutdown_requested(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("{peer} connected");
                    connections.spawn(serve_connection(stream, peer, queue.clone(), shutdown.clone()));
                }
                Err(err) => warn!("failed to accept connection: {err}"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    while connections.join_next().await.is_some() {}
    if let Ok(addr) = listener.local_addr() {
        info!("stopped listening on {addr}");
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    queue: mpsc::Sender<Event>,
    mut shutdown: watch::Receiver<bool>,
) {
    let peer_name = peer.to_string();

    loop {
        let adu = tokio::select! {
            _ = server::shutdown_requested(&mut shutdown) => break,
            adu = read_adu(&mut stream) => adu,
        };
        let bytes = match adu {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!("{peer} disconnected");
                break;
            }
            Err(err) => {
                warn!("{peer}: {err}, closing connection");
                break;
            }
        };

        let frame = match TcpFrame::decode(&bytes) {
            Ok(frame) => frame,
            Err(err) => {
                debug!("{peer}: bad frame dropped: {err}");
                continue;
            }
        };

        let response = match server::submit(&queue, Box::new(frame), &peer_name).await {
            Ok(response) => response,
            Err(_) => break,
        };
        if let Some(response) = response {
            if let Err(err) = stream.write_all(&response).await {
                error!("{peer}: failed to send response: {err}");
                break;
            }
        }
    }
}

/// Read one MBAP frame. `Ok(None)` when the peer closed the connection between frames.
///
/// Frames declaring more than [`TCP_MAX_LEN`] bytes are skipped whole so that the
/// stream stays in step. A zero length leaves no way to find the next header.
pub(crate) async fn read_adu<R>(stream: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut header = [0u8; MBAP_HEADER_LEN];
        match stream.read_exact(&mut header).await {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err),
        }

        // length counts the unit id and the PDU
        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        if length == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "MBAP length 0 overlaps the unit id",
            ));
        }

        let body_len = length - 1;
        if 6 + length > TCP_MAX_LEN {
            debug!("MBAP length {length} exceeds {TCP_MAX_LEN} bytes, frame discarded");
            let mut body = (&mut *stream).take(body_len as u64);
            let skipped = tokio::io::copy(&mut body, &mut tokio::io::sink()).await?;
            if skipped < body_len as u64 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            continue;
        }

        let mut adu = vec![0u8; MBAP_HEADER_LEN + body_len];
        adu[..MBAP_HEADER_LEN].copy_from_slice(&header);
        stream.read_exact(&mut adu[MBAP_HEADER_LEN..]).await?;
        return Ok(Some(adu));
    }
}

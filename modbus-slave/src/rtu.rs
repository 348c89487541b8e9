//! Modbus RTU transport: one producer task per serial port.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};

use crate::frame::{RtuFrame, RTU_MAX_LEN};
use crate::reassembler::{Framing, Reassembler};
use crate::server::{self, Event};

/// Byte stream of a serial line with bounded reads.
#[async_trait]
pub trait SerialLink: Send {
    /// Read whatever arrives within the read timeout; `Ok(0)` means the line was silent.
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()>;
}

/// [`SerialLink`] over any async byte stream.
#[derive(Debug)]
pub struct TimedLink<T> {
    io: T,
    read_timeout: Duration,
}

impl<T> TimedLink<T> {
    pub fn new(io: T, read_timeout: Duration) -> Self {
        Self { io, read_timeout }
    }

    pub fn into_inner(self) -> T {
        self.io
    }
}

#[async_trait]
impl<T> SerialLink for TimedLink<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let deadline = Instant::now() + self.read_timeout;
        match time::timeout_at(deadline, self.io.read(buf)).await {
            Err(_elapsed) => Ok(0),
            Ok(Ok(n)) if n > 0 => Ok(n),
            // end of stream or a failing port: keep the silence pace instead of spinning
            Ok(result) => {
                time::sleep_until(deadline).await;
                result
            }
        }
    }

    async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.io.write_all(frame).await?;
        self.io.flush().await
    }
}

/// Reassemble, submit and answer requests on one port until shutdown.
///
/// Read errors count as silence and undecodable frames are dropped; neither stops
/// the loop.
pub(crate) async fn serve_port<L: SerialLink>(
    name: String,
    mut link: L,
    framing: Framing,
    queue: mpsc::Sender<Event>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut reassembler = Reassembler::new(framing);
    let mut buffer = [0u8; RTU_MAX_LEN];

    loop {
        let read = tokio::select! {
            _ = server::shutdown_requested(&mut shutdown) => break,
            read = link.read_chunk(&mut buffer) => read,
        };
        let n = read.unwrap_or_else(|err| {
            warn!("{name}: read failed: {err}");
            0
        });

        let Some(packet) = reassembler.push(&buffer[..n]) else {
            continue;
        };
        let frame = match RtuFrame::decode(&packet) {
            Ok(frame) => frame,
            Err(err) => {
                debug!("{name}: bad frame dropped: {err}");
                reassembler.reject();
                continue;
            }
        };

        match server::submit(&queue, Box::new(frame), &name).await {
            Ok(Some(response)) => {
                if let Err(err) = link.write_frame(&response).await {
                    error!("{name}: failed to send response: {err}");
                }
            }
            Ok(None) => {}
            Err(_) => break,
        }
    }
    debug!("{name}: stopped");
}

/// Open and configure a serial port.
#[cfg(feature = "serial")]
pub fn open(config: &crate::config::SerialConfig) -> crate::Result<tokio_serial::SerialStream> {
    use crate::config::Parity;
    use tokio_serial::{DataBits, StopBits};

    let data_bits = match config.data_bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    };
    let parity = match config.parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Odd => tokio_serial::Parity::Odd,
        Parity::Even => tokio_serial::Parity::Even,
    };
    let stop_bits = match config.stop_bits {
        2 => StopBits::Two,
        _ => StopBits::One,
    };

    let builder = tokio_serial::new(&config.path, config.baud_rate)
        .data_bits(data_bits)
        .parity(parity)
        .stop_bits(stop_bits);
    Ok(tokio_serial::SerialStream::open(&builder)?)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::config::ServerConfig;
    use crate::frame::Framer;
    use crate::server::Server;

    /// Replays scripted reads and records writes.
    struct ScriptedLink {
        reads: VecDeque<io::Result<Vec<u8>>>,
        written: mpsc::UnboundedSender<Vec<u8>>,
    }

    #[async_trait]
    impl SerialLink for ScriptedLink {
        async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                Some(Ok(bytes)) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                Some(Err(err)) => Err(err),
                None => {
                    time::sleep(Duration::from_millis(1)).await;
                    Ok(0)
                }
            }
        }

        async fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
            let _ = self.written.send(frame.to_vec());
            Ok(())
        }
    }

    fn read_holding(address: u8) -> Vec<u8> {
        RtuFrame::new(address, 3, vec![0x00, 0x00, 0x00, 0x01]).to_bytes()
    }

    #[tokio::test]
    async fn test_port_survives_errors_and_bad_frames() {
        let config = ServerConfig {
            tcp: None,
            ..Default::default()
        };
        let server = Server::new(&config).unwrap();
        let (queue, shutdown) = server.channels();

        let mut corrupt = read_holding(1);
        corrupt[4] ^= 0x01;
        let reads = vec![
            Ok(vec![]),
            Err(io::Error::new(io::ErrorKind::Other, "parity error")),
            Ok(corrupt),
            Ok(vec![]),
            Ok(read_holding(7)),
            Ok(vec![]),
            Ok(read_holding(1)[..5].to_vec()),
            Ok(read_holding(1)[5..].to_vec()),
            Ok(vec![]),
        ];
        let (written, mut responses) = mpsc::unbounded_channel();
        let link = ScriptedLink {
            reads: reads.into(),
            written,
        };
        let port = tokio::spawn(serve_port(
            "scripted".to_string(),
            link,
            Framing::Silence,
            queue,
            shutdown,
        ));

        let response = responses.recv().await.unwrap();
        assert_eq!(response, RtuFrame::new(1, 3, vec![0x02, 0x00, 0x00]).to_bytes());

        server.close().await;
        port.await.unwrap();
        assert!(responses.try_recv().is_err());
    }
}

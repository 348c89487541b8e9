//! Request routing and server lifecycle.
//!
//! Every transport task (one per TCP connection, one per serial port) produces
//! [`Request`]s into a single bounded queue. One router task drains it in arrival
//! order and is the only code that ever touches [`Memory`], so the tables need no
//! locking. Replies travel back to the producer that owns the connection.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use futures::future;
use log::{debug, error, info};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::{ConfigError, ServerConfig};
use crate::error::{Error, Result};
use crate::exception::Exception;
use crate::frame::Framer;
use crate::function::{Functions, Handler};
use crate::memory::{Memory, UnitIndex};
use crate::reassembler::Framing;
use crate::rtu::{self, TimedLink};
use crate::tcp;

type MemoryAccess = Box<dyn FnOnce(&mut Memory) + Send>;

/// A decoded frame together with the way back to the peer that sent it.
pub struct Request {
    frame: Box<dyn Framer>,
    peer: String,
    reply: oneshot::Sender<Option<Vec<u8>>>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("peer", &self.peer)
            .field("frame", &self.frame)
            .finish()
    }
}

impl Request {
    pub fn frame(&self) -> &dyn Framer {
        self.frame.as_ref()
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Hand the response bytes to the producer. `None` means the request stays unanswered.
    fn respond(self, response: Option<Vec<u8>>) {
        if self.reply.send(response).is_err() {
            debug!("{}: connection gone before reply", self.peer);
        }
    }
}

pub(crate) enum Event {
    Request(Request),
    Memory(MemoryAccess),
    Register(u8, Handler),
}

/// Resolves once the server asks its transports to stop, or is gone.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|&stop| stop).await;
}

/// Submit `frame` and wait for the router's verdict.
///
/// Returns the response bytes to write, `None` for a request that must not be
/// answered, or [`Error::Closed`] once the router is gone.
pub(crate) async fn submit(
    queue: &mpsc::Sender<Event>,
    frame: Box<dyn Framer>,
    peer: &str,
) -> Result<Option<Vec<u8>>> {
    let (reply, response) = oneshot::channel();
    let request = Request {
        frame,
        peer: peer.to_string(),
        reply,
    };
    queue
        .send(Event::Request(request))
        .await
        .map_err(|_| Error::Closed)?;
    response.await.map_err(|_| Error::Closed)
}

/// Execute one request. Frames for units outside the served range, and broadcast
/// frames, produce no response.
pub fn handle(
    memory: &mut Memory,
    functions: &Functions,
    request: &dyn Framer,
) -> Option<Box<dyn Framer>> {
    let slave_id = request.address();
    if slave_id == 0 {
        debug!("broadcast request for function {:#04x} ignored", request.function());
        return None;
    }
    let Some(unit) = memory.resolve(slave_id) else {
        debug!("request for unit {slave_id} not served here, dropped");
        return None;
    };
    Some(functions.dispatch(memory, unit, request))
}

async fn route(mut queue: mpsc::Receiver<Event>, mut memory: Memory, mut functions: Functions) {
    while let Some(event) = queue.recv().await {
        match event {
            Event::Request(request) => {
                let response = handle(&mut memory, &functions, request.frame());
                request.respond(response.map(|frame| frame.to_bytes()));
            }
            Event::Memory(access) => access(&mut memory),
            Event::Register(code, handler) => functions.insert(code, handler),
        }
    }
    debug!("request queue closed, router stopped");
}

/// A multi-unit Modbus slave.
///
/// Creating a server spawns its router; transports are added with
/// [`Server::listen_tcp`], [`Server::listen_rtu`] or [`Server::serve_serial`].
/// Must be used within a Tokio runtime.
pub struct Server {
    queue: mpsc::Sender<Event>,
    shutdown: watch::Sender<bool>,
    producers: Vec<JoinHandle<()>>,
    router: JoinHandle<()>,
}

impl Server {
    /// Allocate memory for the configured units with the default function handlers.
    pub fn new(config: &ServerConfig) -> Result<Self> {
        Self::with_functions(config, Functions::default())
    }

    pub fn with_functions(config: &ServerConfig, functions: Functions) -> Result<Self> {
        config.validate()?;

        let memory = Memory::new(
            config.lower_id,
            config.upper_id,
            config.offset_input_registers,
            config.offset_discrete_inputs,
        );
        let (queue, requests) = mpsc::channel(config.queue_capacity);
        let (shutdown, _) = watch::channel(false);
        let router = tokio::spawn(route(requests, memory, functions));

        Ok(Self {
            queue,
            shutdown,
            producers: Vec::new(),
            router,
        })
    }

    /// Create a server and start every transport named in `config`.
    pub async fn start(config: &ServerConfig) -> Result<Self> {
        let mut server = Self::new(config)?;
        if let Some(tcp) = &config.tcp {
            server.listen_tcp(tcp.address.as_str()).await?;
        }
        #[cfg(feature = "serial")]
        for serial in &config.serial {
            server.listen_rtu(serial)?;
        }
        #[cfg(not(feature = "serial"))]
        if !config.serial.is_empty() {
            log::warn!("built without serial support, {} port(s) ignored", config.serial.len());
        }
        Ok(server)
    }

    /// Accept Modbus TCP connections on `addr`. Returns the bound address.
    pub async fn listen_tcp(&mut self, addr: impl ToSocketAddrs) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("listening for Modbus TCP on {local_addr}");

        let producer = tokio::spawn(tcp::accept_loop(
            listener,
            self.queue.clone(),
            self.shutdown.subscribe(),
        ));
        self.producers.push(producer);
        Ok(local_addr)
    }

    /// Open the serial port described by `config` and serve RTU requests on it.
    #[cfg(feature = "serial")]
    pub fn listen_rtu(&mut self, config: &crate::config::SerialConfig) -> Result<()> {
        config.validate()?;
        let port = rtu::open(config)?;
        info!(
            "listening for Modbus RTU on {} at {} baud",
            config.path, config.baud_rate
        );
        self.serve_serial(
            config.path.clone(),
            port,
            config.framing,
            config.read_timeout(),
        )
    }

    /// Serve RTU requests arriving on an arbitrary byte stream, e.g. an already
    /// opened port or a pseudo terminal.
    ///
    /// An empty read of `read_timeout` marks line silence, so it must be nonzero.
    pub fn serve_serial<T>(
        &mut self,
        name: impl Into<String>,
        io: T,
        framing: Framing,
        read_timeout: Duration,
    ) -> Result<()>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let name = name.into();
        if read_timeout.is_zero() {
            return Err(ConfigError::Serial {
                path: name,
                reason: "read timeout must be positive".to_string(),
            }
            .into());
        }

        let producer = tokio::spawn(rtu::serve_port(
            name,
            TimedLink::new(io, read_timeout),
            framing,
            self.queue.clone(),
            self.shutdown.subscribe(),
        ));
        self.producers.push(producer);
        Ok(())
    }

    /// Run `access` on the memory of all units, in order with network requests.
    pub async fn with_memory<F, R>(&self, access: F) -> Result<R>
    where
        F: FnOnce(&mut Memory) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let access: MemoryAccess = Box::new(move |memory| {
            let _ = tx.send(access(memory));
        });
        self.queue
            .send(Event::Memory(access))
            .await
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)
    }

    /// Install or replace the handler for function `code`; applies to every
    /// request queued after this call.
    pub async fn register_handler<F>(&self, code: u8, handler: F) -> Result<()>
    where
        F: Fn(&mut Memory, UnitIndex, &dyn Framer) -> std::result::Result<Vec<u8>, Exception>
            + Send
            + Sync
            + 'static,
    {
        self.queue
            .send(Event::Register(code, Box::new(handler)))
            .await
            .map_err(|_| Error::Closed)
    }

    #[cfg(test)]
    pub(crate) fn channels(&self) -> (mpsc::Sender<Event>, watch::Receiver<bool>) {
        (self.queue.clone(), self.shutdown.subscribe())
    }

    /// Stop all transports and wait for them to finish. Ports and listeners are
    /// closed once their tasks end; the router drains what is left and stops.
    pub async fn close(self) {
        self.shutdown.send_replace(true);
        for result in future::join_all(self.producers).await {
            if let Err(err) = result {
                error!("transport task failed: {err}");
            }
        }
        drop(self.queue);
        let _ = self.router.await;
        info!("server closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{RtuFrame, TcpFrame};
    use crate::memory::WordTable;

    fn config(lower_id: u8, upper_id: u8) -> ServerConfig {
        ServerConfig {
            lower_id,
            upper_id,
            tcp: None,
            ..Default::default()
        }
    }

    #[test]
    fn test_handle_drops_unserved_units() {
        let mut memory = Memory::new(2, 3, 10000, 10000);
        let functions = Functions::default();
        for slave_id in [0, 1, 4, 0xFF] {
            let request = RtuFrame::new(slave_id, 3, vec![0x00, 0x00, 0x00, 0x01]);
            assert!(handle(&mut memory, &functions, &request).is_none());
        }
        let request = RtuFrame::new(3, 3, vec![0x00, 0x00, 0x00, 0x01]);
        assert!(handle(&mut memory, &functions, &request).is_some());
    }

    #[tokio::test]
    async fn test_submit_through_router() {
        let server = Server::new(&config(1, 1)).unwrap();

        let write = TcpFrame::new(1, 1, 6, vec![0x00, 0x05, 0x00, 0x2A]);
        let reply = submit(&server.queue, Box::new(write), "test").await.unwrap();
        assert_eq!(
            reply,
            Some(vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x06, 0x00, 0x05, 0x00, 0x2A])
        );

        let stray = TcpFrame::new(2, 9, 3, vec![0x00, 0x05, 0x00, 0x01]);
        let reply = submit(&server.queue, Box::new(stray), "test").await.unwrap();
        assert_eq!(reply, None);

        server.close().await;
    }

    #[tokio::test]
    async fn test_with_memory_is_ordered_with_requests() {
        let server = Server::new(&config(1, 2)).unwrap();

        server
            .with_memory(|memory| {
                let unit = memory.resolve(2).unwrap();
                memory.write_word(unit, WordTable::InputRegisters, 7, 0x1234)
            })
            .await
            .unwrap()
            .unwrap();

        let read = RtuFrame::new(2, 4, vec![0x00, 0x07, 0x00, 0x01]);
        let reply = submit(&server.queue, Box::new(read), "test")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, RtuFrame::new(2, 4, vec![0x02, 0x12, 0x34]).to_bytes());

        server.close().await;
    }

    #[tokio::test]
    async fn test_register_handler_at_runtime() {
        let server = Server::new(&config(1, 1)).unwrap();
        let request = || Box::new(RtuFrame::new(1, 0x08, vec![0x00, 0x00, 0xA5, 0x37]));

        let reply = submit(&server.queue, request(), "test").await.unwrap().unwrap();
        assert_eq!(reply[1], 0x88);

        server
            .register_handler(0x08, |_, _, request| Ok(request.payload().to_vec()))
            .await
            .unwrap();
        let reply = submit(&server.queue, request(), "test").await.unwrap().unwrap();
        assert_eq!(reply, request().to_bytes());

        server.close().await;
    }

    #[tokio::test]
    async fn test_serve_serial_rejects_zero_read_timeout() {
        let mut server = Server::new(&config(1, 1)).unwrap();
        let (_master, slave) = tokio::io::duplex(64);
        assert!(matches!(
            server.serve_serial("line", slave, Framing::Silence, Duration::ZERO),
            Err(Error::Config(ConfigError::Serial { .. }))
        ));
        server.close().await;
    }

    #[cfg(feature = "serial")]
    #[tokio::test]
    async fn test_listen_rtu_validates_before_opening() {
        let mut server = Server::new(&config(1, 1)).unwrap();
        for serial in [
            crate::config::SerialConfig {
                path: "/nonexistent/tty".to_string(),
                data_bits: 9,
                ..Default::default()
            },
            crate::config::SerialConfig {
                path: "/nonexistent/tty".to_string(),
                stop_bits: 3,
                ..Default::default()
            },
        ] {
            assert!(matches!(
                server.listen_rtu(&serial),
                Err(Error::Config(ConfigError::Serial { .. }))
            ));
        }
        server.close().await;
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        assert!(matches!(
            Server::new(&config(5, 1)),
            Err(Error::Config(_))
        ));
    }
}

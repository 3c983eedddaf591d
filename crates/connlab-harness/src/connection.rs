use crate::instrumentation::{EventLog, InstrumentedStream, Side, StreamHooks};
use std::net::SocketAddr;
use tokio::net::TcpStream;

/// Both ends of one loopback TCP connection.
///
/// The client end always exists; the server end is missing when the server
/// reset the socket right after accepting it. Dropping the connection closes
/// both sockets.
pub struct Connection {
    pub(crate) id: u64,
    pub(crate) client: InstrumentedStream<TcpStream>,
    pub(crate) server: Option<InstrumentedStream<TcpStream>>,
    pub(crate) client_addr: SocketAddr,
    pub(crate) exchanges: usize,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        client: TcpStream,
        server: Option<TcpStream>,
        client_addr: SocketAddr,
        log: &EventLog,
        debug_io: bool,
    ) -> Self {
        let client = InstrumentedStream::new(client, id, Side::Client, log.clone()).with_debug_io(debug_io);
        let server = server
            .map(|stream| InstrumentedStream::new(stream, id, Side::Server, log.clone()).with_debug_io(debug_io));
        Self {
            id,
            client,
            server,
            client_addr,
            exchanges: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn exchanges(&self) -> usize {
        self.exchanges
    }

    pub fn client_hooks(&self) -> &StreamHooks {
        self.client.hooks()
    }

    pub fn server_hooks(&self) -> Option<&StreamHooks> {
        self.server.as_ref().map(|server| server.hooks())
    }

    /// Clears hooks left behind by the previous owner.
    pub(crate) fn disarm(&self) {
        self.client.hooks().disarm();
        if let Some(server) = &self.server {
            server.hooks().disarm();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        tracing::debug!(
            "connection {} closed after {} exchanges",
            self.id,
            self.exchanges
        );
    }
}

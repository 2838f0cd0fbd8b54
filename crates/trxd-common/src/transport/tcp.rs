use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

use crate::error::{Result, TrxError};
use crate::message::Message;
use crate::transport::codec::Codec;
use crate::transport::socket::WireSocket;

/// Default timeout for client connect, read and write (5 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Client side of the fare-server wire protocol.
///
/// Used by the CLI and by integration tests to talk to a running server.
///
/// # Example
///
/// ```no_run
/// use trxd_common::transport::{Codec, TcpTransport};
/// use trxd_common::{Command, Message};
///
/// let transport = TcpTransport::new(Codec::legacy());
/// let mut socket = transport.connect("127.0.0.1:53501").unwrap();
/// let reply = transport
///     .send_request(&mut socket, &Message::new(Command::REQUEST, "01", "ping"))
///     .unwrap();
/// println!("{}", reply.command);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct TcpTransport {
    codec: Codec,
    /// `None` blocks without a deadline.
    timeout: Option<Duration>,
}

impl TcpTransport {
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            timeout: Some(DEFAULT_TIMEOUT),
        }
    }

    /// Sets the connect, read and write timeout. Zero disables it.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Connects to a remote endpoint.
    ///
    /// The address may resolve to several socket addresses; each is tried in
    /// turn until one accepts the connection.
    ///
    /// # Arguments
    ///
    /// * `addr` - The address to connect to (e.g., "127.0.0.1:53501")
    ///
    /// # Returns
    ///
    /// A [`WireSocket`] with read and write timeouts configured
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be resolved or every
    /// connection attempt fails.
    pub fn connect(&self, addr: &str) -> Result<WireSocket> {
        let socket_addrs = addr
            .to_socket_addrs()
            .map_err(|e| TrxError::Transport(format!("Invalid address '{}': {}", addr, e)))?;

        let mut last_err = None;
        for socket_addr in socket_addrs {
            let connected = match self.timeout {
                Some(timeout) => TcpStream::connect_timeout(&socket_addr, timeout),
                None => TcpStream::connect(socket_addr),
            };
            match connected {
                Ok(stream) => {
                    debug!(%socket_addr, "connected");
                    let mut socket = WireSocket::new(stream, self.codec);
                    socket.set_timeout_duration(self.timeout)?;
                    return Ok(socket);
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(TrxError::Transport(format!(
            "Failed to connect to {}: {}",
            addr,
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no addresses resolved".to_string())
        )))
    }

    /// Sends one request frame and waits for the answering frame.
    pub fn send_request(&self, socket: &mut WireSocket, request: &Message) -> Result<Message> {
        socket.write_message(request)?;
        socket.read_message()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Command;
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_connect_invalid_address() {
        let transport = TcpTransport::new(Codec::standard());
        let err = transport.connect("not an address").unwrap_err();
        assert!(matches!(err, TrxError::Transport(_)));
    }

    #[test]
    fn test_send_request_legacy() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut socket = WireSocket::new(stream, Codec::legacy());
            let request = socket.read_message().unwrap();
            assert_eq!(request.version, b"07");
            let reply = Message::new(Command::RESPONSE, "07", request.body().to_vec());
            socket.write_message(&reply).unwrap();
        });

        let transport = TcpTransport::new(Codec::legacy()).with_timeout(Duration::from_secs(2));
        let mut socket = transport.connect(&addr.to_string()).unwrap();
        let reply = transport
            .send_request(&mut socket, &Message::new(Command::REQUEST, "07", "quote"))
            .unwrap();
        assert_eq!(reply.command, Command::RESPONSE);
        assert_eq!(reply.body(), b"quote");
        handle.join().unwrap();
    }

    #[test]
    fn test_zero_timeout_connects_without_deadline() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || listener.accept().map(|_| ()));

        let transport = TcpTransport::new(Codec::standard()).with_timeout(Duration::ZERO);
        assert_eq!(transport.timeout(), None);
        let socket = transport.connect(&addr.to_string()).unwrap();
        assert_eq!(socket.timeout(), None);
        handle.join().unwrap().unwrap();
    }
}

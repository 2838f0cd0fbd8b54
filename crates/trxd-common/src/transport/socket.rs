use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use socket2::SockRef;

use crate::error::{Result, TrxError};
use crate::message::Message;
use crate::transport::codec::{map_io_error, Codec};

/// Socket options applied to listening and accepted sockets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOptions {
    /// `SO_LINGER` timeout; `None` leaves lingering off.
    pub linger: Option<Duration>,
    pub keep_alive: bool,
    pub receive_buffer_size: Option<usize>,
    pub send_buffer_size: Option<usize>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            linger: None,
            keep_alive: true,
            receive_buffer_size: None,
            send_buffer_size: None,
        }
    }
}

impl SocketOptions {
    /// Applies the options to any socket-like handle.
    pub fn apply(&self, sock: SockRef<'_>) -> std::io::Result<()> {
        sock.set_linger(self.linger)?;
        sock.set_keepalive(self.keep_alive)?;
        if let Some(size) = self.receive_buffer_size {
            sock.set_recv_buffer_size(size)?;
        }
        if let Some(size) = self.send_buffer_size {
            sock.set_send_buffer_size(size)?;
        }
        Ok(())
    }
}

/// Blocking stream socket speaking one frame format.
///
/// Every read and write blocks the calling thread, bounded by the optional
/// per-call timeout. A timeout surfaces as [`TrxError::Timeout`], distinct
/// from hard transport errors, and never leaves a partially decoded message
/// behind.
#[derive(Debug)]
pub struct WireSocket {
    stream: TcpStream,
    codec: Codec,
    timeout: Option<Duration>,
}

impl WireSocket {
    pub fn new(stream: TcpStream, codec: Codec) -> Self {
        Self {
            stream,
            codec,
            timeout: None,
        }
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }

    /// Sets the per-call timeout from seconds and microseconds.
    ///
    /// Zero for both disables the timeout.
    pub fn set_timeout(&mut self, secs: u64, micros: u32) -> Result<()> {
        let timeout = if secs == 0 && micros == 0 {
            None
        } else {
            Some(Duration::from_secs(secs) + Duration::from_micros(u64::from(micros)))
        };
        self.set_timeout_duration(timeout)
    }

    pub fn set_timeout_duration(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.stream
            .set_read_timeout(timeout)
            .map_err(|e| TrxError::Transport(format!("Failed to set read timeout: {}", e)))?;
        self.stream
            .set_write_timeout(timeout)
            .map_err(|e| TrxError::Transport(format!("Failed to set write timeout: {}", e)))?;
        self.timeout = timeout;
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Reads whatever is available, up to `buf.len()` bytes.
    ///
    /// Returns `Ok(0)` when the peer has closed the connection.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.stream
            .read(buf)
            .map_err(|e| self.stamp_timeout(map_io_error(e, "reading socket")))
    }

    /// Writes the whole buffer and returns its length.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.stream
            .write_all(buf)
            .map_err(|e| self.stamp_timeout(map_io_error(e, "writing socket")))?;
        Ok(buf.len())
    }

    /// Reads one complete frame.
    pub fn read_message(&mut self) -> Result<Message> {
        let codec = self.codec;
        codec
            .read_message(&mut self.stream)
            .map_err(|e| self.stamp_timeout(e))
    }

    /// Writes one complete frame and returns the number of bytes sent.
    pub fn write_message(&mut self, message: &Message) -> Result<usize> {
        let codec = self.codec;
        codec
            .write_message(&mut self.stream, message)
            .map_err(|e| self.stamp_timeout(e))
    }

    /// Stops further reads; pending writes still go out.
    pub fn shutdown_read(&self) -> Result<()> {
        self.stream
            .shutdown(std::net::Shutdown::Read)
            .map_err(|e| TrxError::Transport(format!("Failed to shut down socket: {}", e)))
    }

    pub fn into_inner(self) -> TcpStream {
        self.stream
    }

    fn stamp_timeout(&self, err: TrxError) -> TrxError {
        match err {
            TrxError::Timeout(_) => TrxError::Timeout(
                self.timeout.map(|t| t.as_millis() as u64).unwrap_or_default(),
            ),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Command;
    use std::net::TcpListener;
    use std::thread;

    fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_read_times_out_with_distinct_error() {
        let (_client, server) = socket_pair();
        let mut socket = WireSocket::new(server, Codec::standard());
        socket.set_timeout(0, 50_000).unwrap();

        let err = socket.read_message().unwrap_err();
        assert!(err.is_timeout(), "expected timeout, got {:?}", err);
        assert!(matches!(err, TrxError::Timeout(50)));
    }

    #[test]
    fn test_peer_close_detected() {
        let (client, server) = socket_pair();
        drop(client);
        let mut socket = WireSocket::new(server, Codec::standard());
        let err = socket.read_message().unwrap_err();
        assert!(matches!(err, TrxError::PeerClosed));
    }

    #[test]
    fn test_message_exchange() {
        let (client, server) = socket_pair();
        let handle = thread::spawn(move || {
            let mut socket = WireSocket::new(server, Codec::standard());
            let request = socket.read_message().unwrap();
            let reply = Message::new(Command::RESPONSE, "0010", request.body().to_vec());
            socket.write_message(&reply).unwrap();
        });

        let mut socket = WireSocket::new(client, Codec::standard());
        let sent = socket
            .write_message(&Message::new(Command::REQUEST, "0010", "ping"))
            .unwrap();
        assert_eq!(sent, 20 + 5);

        let reply = socket.read_message().unwrap();
        assert_eq!(reply.command, Command::RESPONSE);
        assert_eq!(reply.body(), b"ping");
        handle.join().unwrap();
    }

    #[test]
    fn test_zero_timeout_disables_deadline() {
        let (_client, server) = socket_pair();
        let mut socket = WireSocket::new(server, Codec::legacy());
        socket.set_timeout(0, 0).unwrap();
        assert_eq!(socket.timeout(), None);
        assert!(socket.codec().is_legacy());
    }

    #[test]
    fn test_socket_options_apply() {
        let (client, _server) = socket_pair();
        let options = SocketOptions {
            linger: Some(Duration::from_secs(1)),
            keep_alive: true,
            receive_buffer_size: Some(64 * 1024),
            send_buffer_size: Some(64 * 1024),
        };
        assert!(options.apply(SockRef::from(&client)).is_ok());
    }
}

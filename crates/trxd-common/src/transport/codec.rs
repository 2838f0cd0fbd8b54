use std::io::{Cursor, Read, Write};

use crate::error::{Result, TrxError};
use crate::message::{Command, Message};

/// Value of the leading length field in a standard frame.
pub const HEADER_SIZE: u32 = 16;

/// Size of the legacy header including the leading total-size field.
pub const LEGACY_HEADER_SIZE: usize = 12;

/// Largest payload accepted from the wire (100 MB).
pub const MAX_PAYLOAD_SIZE: usize = 100 * 1024 * 1024;

/// Frame codec, selected per socket by the caller.
///
/// Both formats share the same encode rule: the payload is followed by one
/// NUL terminator byte and the advertised payload length includes it.
///
/// # Example
///
/// ```
/// use trxd_common::transport::Codec;
/// use trxd_common::{Command, Message};
///
/// let codec = Codec::standard();
/// let msg = Message::new(Command::REQUEST, "0010", "<x/>");
///
/// let bytes = codec.encode(&msg);
/// let decoded = codec.decode(&bytes).unwrap();
/// assert_eq!(decoded.body(), b"<x/>");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    /// Header-size marker followed by payload size, command, version and revision.
    Standard(StandardCodec),
    /// Total-size prefix followed by command, 2-byte version and 2-byte revision.
    Legacy(LegacyCodec),
}

impl Codec {
    pub fn standard() -> Self {
        Codec::Standard(StandardCodec)
    }

    pub fn legacy() -> Self {
        Codec::Legacy(LegacyCodec)
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, Codec::Legacy(_))
    }

    /// Reads exactly one frame from `reader`.
    ///
    /// # Errors
    ///
    /// - `PeerClosed` if the peer closed before the first header byte
    /// - `Protocol` for an unknown header or a truncated frame
    /// - `Timeout` if the underlying reader timed out
    pub fn read_message<R: Read>(&self, reader: &mut R) -> Result<Message> {
        match self {
            Codec::Standard(_) => StandardCodec::read_message(reader),
            Codec::Legacy(_) => LegacyCodec::read_message(reader),
        }
    }

    /// Writes one frame and returns the number of bytes written.
    pub fn write_message<W: Write>(&self, writer: &mut W, message: &Message) -> Result<usize> {
        let frame = self.encode(message);
        writer
            .write_all(&frame)
            .map_err(|e| map_io_error(e, "writing frame"))?;
        writer
            .flush()
            .map_err(|e| map_io_error(e, "flushing frame"))?;
        Ok(frame.len())
    }

    pub fn encode(&self, message: &Message) -> Vec<u8> {
        match self {
            Codec::Standard(_) => StandardCodec::encode(message),
            Codec::Legacy(_) => LegacyCodec::encode(message),
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Message> {
        self.read_message(&mut Cursor::new(bytes))
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::standard()
    }
}

/// Standard frame: `[16][payload size][command][version][revision][payload]`,
/// all integers big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StandardCodec;

impl StandardCodec {
    pub fn read_message<R: Read>(reader: &mut R) -> Result<Message> {
        let mut size_buf = [0u8; 4];
        read_first(reader, &mut size_buf)?;

        let header_size = u32::from_be_bytes(size_buf);
        if header_size != HEADER_SIZE {
            return Err(TrxError::Protocol(format!(
                "unknown protocol: header size {} (expected {})",
                header_size, HEADER_SIZE
            )));
        }

        let mut header = [0u8; HEADER_SIZE as usize];
        read_rest(reader, &mut header, "reading header")?;

        let payload_size = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        check_payload_size(payload_size)?;

        let mut message = Message::empty();
        message.command = Command::from_bytes(&header[4..8]);
        message.version = header[8..12].to_vec();
        message.revision = header[12..16].to_vec();

        read_payload(reader, &mut message, payload_size)?;
        Ok(message)
    }

    pub fn encode(message: &Message) -> Vec<u8> {
        let payload_len = message.payload.len() + 1;
        let mut frame = Vec::with_capacity(4 + HEADER_SIZE as usize + payload_len);
        frame.extend_from_slice(&HEADER_SIZE.to_be_bytes());
        frame.extend_from_slice(&(payload_len as u32).to_be_bytes());
        frame.extend_from_slice(message.command.as_bytes());
        frame.extend_from_slice(&fit_field(&message.version, 4));
        frame.extend_from_slice(&fit_field(&message.revision, 4));
        frame.extend_from_slice(&message.payload);
        frame.push(0);
        frame
    }
}

/// Legacy frame: `[total size][command][version:2][revision:2][payload]`.
///
/// The decoder consumes the two revision bytes but fills the message's
/// revision with the version bytes. Existing clients depend on that, so it is
/// preserved as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LegacyCodec;

impl LegacyCodec {
    pub fn read_message<R: Read>(reader: &mut R) -> Result<Message> {
        let mut size_buf = [0u8; 4];
        read_first(reader, &mut size_buf)?;

        let total_size = u32::from_be_bytes(size_buf) as usize;
        if total_size < LEGACY_HEADER_SIZE {
            return Err(TrxError::Protocol(format!(
                "legacy frame size {} is smaller than its header",
                total_size
            )));
        }
        let payload_size = total_size - LEGACY_HEADER_SIZE;
        check_payload_size(payload_size)?;

        let mut header = [0u8; LEGACY_HEADER_SIZE - 4];
        read_rest(reader, &mut header, "reading legacy header")?;

        let mut message = Message::empty();
        message.command = Command::from_bytes(&header[0..4]);
        message.version = header[4..6].to_vec();
        message.revision = message.version.clone();

        read_payload(reader, &mut message, payload_size)?;
        Ok(message)
    }

    pub fn encode(message: &Message) -> Vec<u8> {
        let payload_len = message.payload.len() + 1;
        let total = LEGACY_HEADER_SIZE + payload_len;
        let mut frame = Vec::with_capacity(total);
        frame.extend_from_slice(&(total as u32).to_be_bytes());
        frame.extend_from_slice(message.command.as_bytes());
        frame.extend_from_slice(&fit_field(&message.version, 2));
        frame.extend_from_slice(&fit_field(&message.revision, 2));
        frame.extend_from_slice(&message.payload);
        frame.push(0);
        frame
    }
}

/// Fits a numeric ASCII field into `width` bytes: left-padded with `'0'`,
/// keeping the rightmost digits when too long.
fn fit_field(value: &[u8], width: usize) -> Vec<u8> {
    if value.len() >= width {
        value[value.len() - width..].to_vec()
    } else {
        let mut field = vec![b'0'; width - value.len()];
        field.extend_from_slice(value);
        field
    }
}

fn check_payload_size(size: usize) -> Result<()> {
    if size > MAX_PAYLOAD_SIZE {
        return Err(TrxError::Protocol(format!(
            "payload too large: {} bytes (max {} bytes)",
            size, MAX_PAYLOAD_SIZE
        )));
    }
    Ok(())
}

fn read_payload<R: Read>(reader: &mut R, message: &mut Message, size: usize) -> Result<()> {
    let mut buf = vec![0u8; size];
    read_rest(reader, &mut buf, "reading payload")?;
    message.append(&buf);
    Ok(())
}

/// Reads the first chunk of a frame. Zero bytes here means the peer closed.
fn read_first<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Err(TrxError::PeerClosed),
            Ok(0) => {
                return Err(TrxError::Protocol(format!(
                    "truncated frame: {} of {} length bytes",
                    filled,
                    buf.len()
                )))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(map_io_error(e, "reading frame length")),
        }
    }
    Ok(())
}

fn read_rest<R: Read>(reader: &mut R, buf: &mut [u8], context: &str) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            TrxError::Protocol(format!("truncated frame while {}", context))
        } else {
            map_io_error(e, context)
        }
    })
}

/// Maps IO errors onto the transport taxonomy.
///
/// Timeouts come back as `Timeout(0)`; the socket that owns the deadline
/// fills in the real value.
pub(crate) fn map_io_error(err: std::io::Error, context: &str) -> TrxError {
    match err.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => TrxError::Timeout(0),
        std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted
        | std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::NotConnected => {
            TrxError::Transport(format!("{}: connection lost", context))
        }
        _ => TrxError::Transport(format!("{}: {}", context, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_frame_round_trip() {
        let codec = Codec::standard();
        let msg = Message::new(Command::REQUEST, "0010", "<x/>");

        let encoded = codec.encode(&msg);
        let decoded = codec.decode(&encoded).unwrap();

        assert_eq!(decoded.command, Command::REQUEST);
        assert_eq!(decoded.version, b"0010");
        assert_eq!(decoded.payload.len(), 5);
        assert_eq!(decoded.payload.last(), Some(&0));
        assert_eq!(decoded.body(), b"<x/>");
    }

    #[test]
    fn test_standard_frame_layout() {
        let msg = Message::new(Command::REQUEST, "0010", "ab").with_revision("0002");
        let bytes = StandardCodec::encode(&msg);

        assert_eq!(&bytes[0..4], &16u32.to_be_bytes());
        assert_eq!(&bytes[4..8], &3u32.to_be_bytes());
        assert_eq!(&bytes[8..12], b"RQST");
        assert_eq!(&bytes[12..16], b"0010");
        assert_eq!(&bytes[16..20], b"0002");
        assert_eq!(&bytes[20..], b"ab\0");
    }

    #[test]
    fn test_standard_rejects_unknown_header_size() {
        let mut bytes = StandardCodec::encode(&Message::new(Command::REQUEST, "0010", "x"));
        bytes[3] = 20;
        let err = Codec::standard().decode(&bytes).unwrap_err();
        assert!(matches!(err, TrxError::Protocol(_)), "got {:?}", err);
    }

    #[test]
    fn test_legacy_decode_captured_message() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&20u32.to_be_bytes());
        bytes.extend_from_slice(b"ABCD");
        bytes.extend_from_slice(b"01");
        bytes.extend_from_slice(b"07");
        bytes.extend_from_slice(b"PAYLOAD\0");

        let decoded = Codec::legacy().decode(&bytes).unwrap();
        assert_eq!(decoded.command.to_string(), "ABCD");
        assert_eq!(decoded.payload.len(), 8);
        assert_eq!(decoded.version, b"01");
    }

    #[test]
    fn test_legacy_revision_mirrors_version() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&13u32.to_be_bytes());
        bytes.extend_from_slice(b"ABCD");
        bytes.extend_from_slice(b"01");
        bytes.extend_from_slice(b"99");
        bytes.push(0);

        let decoded = Codec::legacy().decode(&bytes).unwrap();
        assert_eq!(decoded.revision, b"01");
    }

    #[test]
    fn test_legacy_encode_total_size() {
        let msg = Message::new(Command::REQUEST, "01", "abcd");
        let bytes = LegacyCodec::encode(&msg);
        assert_eq!(&bytes[0..4], &17u32.to_be_bytes());
        assert_eq!(bytes.len(), 17);
        assert_eq!(&bytes[8..10], b"01");
        assert_eq!(&bytes[10..12], b"00");
    }

    #[test]
    fn test_legacy_rejects_short_total() {
        let bytes = 4u32.to_be_bytes();
        let err = Codec::legacy().decode(&bytes).unwrap_err();
        assert!(matches!(err, TrxError::Protocol(_)));
    }

    #[test]
    fn test_empty_input_is_peer_closed() {
        let err = Codec::standard().decode(&[]).unwrap_err();
        assert!(matches!(err, TrxError::PeerClosed));
    }

    #[test]
    fn test_truncated_payload_is_protocol_error() {
        let bytes = StandardCodec::encode(&Message::new(Command::REQUEST, "0010", "abcdef"));
        let err = Codec::standard().decode(&bytes[..bytes.len() - 2]).unwrap_err();
        assert!(matches!(err, TrxError::Protocol(_)));
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&16u32.to_be_bytes());
        bytes.extend_from_slice(&(MAX_PAYLOAD_SIZE as u32 + 1).to_be_bytes());
        bytes.extend_from_slice(&[b'0'; 12]);
        let err = Codec::standard().decode(&bytes).unwrap_err();
        assert!(matches!(err, TrxError::Protocol(_)));
    }

    #[test]
    fn test_fit_field() {
        assert_eq!(fit_field(b"10", 4), b"0010");
        assert_eq!(fit_field(b"0010", 2), b"10");
        assert_eq!(fit_field(b"", 2), b"00");
    }

    #[test]
    fn test_write_message_reports_bytes() {
        let mut out = Vec::new();
        let written = Codec::standard()
            .write_message(&mut out, &Message::new(Command::RESPONSE, "0010", "ok"))
            .unwrap();
        assert_eq!(written, out.len());
        assert_eq!(written, 20 + 3);
    }
}

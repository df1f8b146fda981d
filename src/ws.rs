//! RFC 6455 WebSocket support: upgrade handshake and frame codec.
//!
//! Frames are decoded into owned buffers rather than the zero-copy slices
//! the HTTP request path uses, since a WebSocket message's lifetime outlives
//! the fixed parsing buffer and may be reassembled from several TCP reads.

use crate::Request;
use base64::Engine;
use sha1::{Digest, Sha1};
use std::{
    error, fmt, io,
    sync::atomic::{AtomicBool, Ordering},
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

const GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Computes `Sec-WebSocket-Accept` from a client's `Sec-WebSocket-Key`.
pub(crate) fn accept_key(client_key: &[u8]) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(client_key);
    sha1.update(GUID);
    base64::engine::general_purpose::STANDARD.encode(sha1.finalize())
}

/// Validates the upgrade request headers per RFC 6455 §4.2.1 and returns the
/// computed `Sec-WebSocket-Accept` value for the `101` response.
///
/// Checks: `Upgrade: websocket`, `Connection` containing `upgrade`,
/// `Sec-WebSocket-Version: 13`, and a `Sec-WebSocket-Key` that decodes to
/// exactly 16 bytes.
pub(crate) fn verify_upgrade_request(request: &Request) -> Result<String, WsError> {
    let upgrade = request.header(b"upgrade").ok_or(WsError::MissingUpgrade)?;
    if !upgrade.eq_ignore_ascii_case(b"websocket") {
        return Err(WsError::MissingUpgrade);
    }

    let connection = request.header(b"connection").ok_or(WsError::MissingUpgrade)?;
    let has_upgrade_token = connection
        .split(|&b| b == b',')
        .map(|tok| trim_ascii(tok))
        .any(|tok| tok.eq_ignore_ascii_case(b"upgrade"));
    if !has_upgrade_token {
        return Err(WsError::MissingUpgrade);
    }

    if request.header(b"sec-websocket-version") != Some(&b"13"[..]) {
        return Err(WsError::UnsupportedVersion);
    }

    let key = request
        .header(b"sec-websocket-key")
        .ok_or(WsError::InvalidKey)?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(key)
        .map_err(|_| WsError::InvalidKey)?;
    if decoded.len() != 16 {
        return Err(WsError::InvalidKey);
    }

    Ok(accept_key(key))
}

#[inline]
fn trim_ascii(mut s: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = s {
        if first.is_ascii_whitespace() {
            s = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = s {
        if last.is_ascii_whitespace() {
            s = rest;
        } else {
            break;
        }
    }
    s
}

/// A WebSocket frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    #[inline]
    fn from_byte(byte: u8) -> Result<Self, WsError> {
        match byte {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            _ => Err(WsError::UnsupportedOpcode),
        }
    }

    #[inline]
    const fn as_byte(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    #[inline]
    const fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

/// Standard WebSocket close status codes (RFC 6455 §7.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CloseCode {
    Normal = 1000,
    GoingAway = 1001,
    ProtocolError = 1002,
    UnsupportedData = 1003,
    InvalidFramePayloadData = 1007,
    PolicyViolation = 1008,
    MessageTooBig = 1009,
    InternalError = 1011,
}

/// A decoded WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn text(data: impl Into<Vec<u8>>) -> Self {
        Self { fin: true, opcode: OpCode::Text, payload: data.into() }
    }

    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self { fin: true, opcode: OpCode::Binary, payload: data.into() }
    }

    pub fn ping(data: impl Into<Vec<u8>>) -> Self {
        Self { fin: true, opcode: OpCode::Ping, payload: data.into() }
    }

    pub fn pong(data: impl Into<Vec<u8>>) -> Self {
        Self { fin: true, opcode: OpCode::Pong, payload: data.into() }
    }

    pub fn close(code: CloseCode, reason: &str) -> Self {
        let mut payload = Vec::with_capacity(2 + reason.len());
        payload.extend_from_slice(&(code as u16).to_be_bytes());
        payload.extend_from_slice(reason.as_bytes());
        Self { fin: true, opcode: OpCode::Close, payload }
    }
}

/// Unmasks (or masks; the operation is its own inverse) `payload` in place
/// using the 4-byte RFC 6455 masking key.
#[inline]
pub(crate) fn apply_mask(payload: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

/// Reads and decodes one frame from `reader`.
///
/// `max_payload` bounds the payload length accepted from the wire; frames
/// declaring a larger length are rejected with [`WsError::FrameTooLarge`]
/// before any payload bytes are read. Per RFC 6455, client-to-server frames
/// must be masked (server-to-client frames reaching here would be a protocol
/// violation by the peer) and RSV bits must be unset (no extensions are
/// negotiated).
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_payload: usize,
) -> Result<Frame, WsError> {
    let mut head = [0u8; 2];
    reader.read_exact(&mut head).await?;

    let fin = head[0] & 0b1000_0000 != 0;
    let rsv = head[0] & 0b0111_0000;
    if rsv != 0 {
        return Err(WsError::ProtocolViolation);
    }
    let opcode = OpCode::from_byte(head[0] & 0b0000_1111)?;

    let masked = head[1] & 0b1000_0000 != 0;
    if !masked {
        return Err(WsError::ProtocolViolation);
    }

    let len_byte = head[1] & 0b0111_1111;
    let payload_len: u64 = match len_byte {
        126 => {
            let mut ext = [0u8; 2];
            reader.read_exact(&mut ext).await?;
            u16::from_be_bytes(ext) as u64
        }
        127 => {
            let mut ext = [0u8; 8];
            reader.read_exact(&mut ext).await?;
            u64::from_be_bytes(ext)
        }
        n => n as u64,
    };

    if opcode.is_control() && (payload_len > 125 || !fin) {
        return Err(WsError::ProtocolViolation);
    }
    if payload_len as usize > max_payload {
        return Err(WsError::FrameTooLarge);
    }

    let mut mask = [0u8; 4];
    reader.read_exact(&mut mask).await?;

    let mut payload = vec![0u8; payload_len as usize];
    reader.read_exact(&mut payload).await?;
    apply_mask(&mut payload, mask);

    Ok(Frame { fin, opcode, payload })
}

/// Encodes and writes `frame` to `writer` unmasked, as required for
/// server-to-client frames.
///
/// Callers are responsible for serializing calls to this function per
/// connection (see the write-mutex guidance in [`crate::server::connection`]);
/// this function issues a single buffered write per frame but does not
/// itself take any lock.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<(), WsError> {
    let mut header = Vec::with_capacity(10);

    let first = (if frame.fin { 0b1000_0000 } else { 0 }) | frame.opcode.as_byte();
    header.push(first);

    let len = frame.payload.len();
    if len <= 125 {
        header.push(len as u8);
    } else if len <= u16::MAX as usize {
        header.push(126);
        header.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        header.push(127);
        header.extend_from_slice(&(len as u64).to_be_bytes());
    }

    writer.write_all(&header).await?;
    writer.write_all(&frame.payload).await?;
    writer.flush().await?;
    Ok(())
}

/// A connection after a successful upgrade handshake, handed to a
/// [`WebSocketHandler`](crate::server::registry::WebSocketHandler) for the
/// remaining lifetime of the TCP connection.
///
/// Wraps the raw stream so a handler never deals with the upgrade response
/// or frame codec directly; [`recv`](WebSocket::recv) auto-replies to pings
/// with a pong and transparently stops the session once the server is
/// signaled to stop, surfacing it as [`WsError::Io`] so a handler's receive
/// loop exits the same way a peer-closed connection would.
pub struct WebSocket<'a> {
    stream: &'a mut TcpStream,
    max_payload: usize,
    stop: &'a AtomicBool,
}

impl<'a> WebSocket<'a> {
    pub(crate) fn new(stream: &'a mut TcpStream, max_payload: usize, stop: &'a AtomicBool) -> Self {
        Self { stream, max_payload, stop }
    }

    /// Reads the next application frame, transparently answering pings.
    pub async fn recv(&mut self) -> Result<Frame, WsError> {
        loop {
            if self.stop.load(Ordering::Relaxed) {
                return Err(WsError::Io(WsIoError(io::Error::new(
                    io::ErrorKind::Interrupted,
                    "server is stopping",
                ))));
            }

            let frame = read_frame(self.stream, self.max_payload).await?;
            if frame.opcode == OpCode::Ping {
                self.send(&Frame::pong(frame.payload)).await?;
                continue;
            }

            return Ok(frame);
        }
    }

    /// Sends a frame to the client.
    pub async fn send(&mut self, frame: &Frame) -> Result<(), WsError> {
        write_frame(self.stream, frame).await
    }

    /// Sends a close frame. Does not wait for the peer's close acknowledgment.
    pub async fn close(&mut self, code: CloseCode, reason: &str) -> Result<(), WsError> {
        self.send(&Frame::close(code, reason)).await
    }
}

/// Errors produced by the WebSocket upgrade and frame codec.
#[derive(Debug, PartialEq)]
pub enum WsError {
    /// The request did not carry a valid `Upgrade: websocket` handshake.
    MissingUpgrade,
    /// `Sec-WebSocket-Version` was missing or not `13`.
    UnsupportedVersion,
    /// `Sec-WebSocket-Key` was missing or did not decode to 16 bytes.
    InvalidKey,
    /// RSV bits set, an unmasked client frame, or a fragmented/oversized
    /// control frame.
    ProtocolViolation,
    /// Reserved opcode (0x3-0x7, 0xB-0xF).
    UnsupportedOpcode,
    /// Declared payload length exceeded the configured maximum.
    FrameTooLarge,
    Io(WsIoError),
}

#[derive(Debug)]
pub struct WsIoError(pub(crate) io::Error);

impl PartialEq for WsIoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for WsError {
    fn from(err: io::Error) -> Self {
        WsError::Io(WsIoError(err))
    }
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl error::Error for WsError {}

impl WsError {
    /// The close code a protocol error of this kind should be reported with,
    /// if the connection is still writable.
    pub const fn close_code(&self) -> CloseCode {
        match self {
            WsError::UnsupportedOpcode => CloseCode::ProtocolError,
            WsError::ProtocolViolation => CloseCode::ProtocolError,
            WsError::FrameTooLarge => CloseCode::MessageTooBig,
            _ => CloseCode::ProtocolError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc_example() {
        // RFC 6455 §1.3 worked example.
        assert_eq!(
            accept_key(b"dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn mask_is_its_own_inverse() {
        let mask = [0x12, 0x34, 0x56, 0x78];
        let mut data = b"hello world".to_vec();
        let original = data.clone();

        apply_mask(&mut data, mask);
        assert_ne!(data, original);

        apply_mask(&mut data, mask);
        assert_eq!(data, original);
    }

    #[tokio::test]
    async fn read_frame_rejects_unmasked_client_frame() {
        let wire = [0b1000_0001u8, 0b0000_0101, b'h', b'e', b'l', b'l', b'o'];
        let mut cursor = &wire[..];
        let err = read_frame(&mut cursor, 1024).await.unwrap_err();
        assert_eq!(err, WsError::ProtocolViolation);
    }

    #[tokio::test]
    async fn read_frame_round_trips_masked_text() {
        let mask = [0xAA, 0xBB, 0xCC, 0xDD];
        let mut payload = b"ping".to_vec();
        apply_mask(&mut payload, mask);

        let mut wire = vec![0b1000_0001u8, 0b1000_0100];
        wire.extend_from_slice(&mask);
        wire.extend_from_slice(&payload);

        let mut cursor = &wire[..];
        let frame = read_frame(&mut cursor, 1024).await.unwrap();

        assert!(frame.fin);
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(frame.payload, b"ping");
    }

    #[tokio::test]
    async fn read_frame_rejects_fragmented_control_frame() {
        let mut wire = vec![0b0000_1001u8, 0b1000_0000];
        wire.extend_from_slice(&[0, 0, 0, 0]);

        let mut cursor = &wire[..];
        let err = read_frame(&mut cursor, 1024).await.unwrap_err();
        assert_eq!(err, WsError::ProtocolViolation);
    }

    #[tokio::test]
    async fn read_frame_rejects_oversized_payload() {
        let mut wire = vec![0b1000_0010u8, 0b1111_1110, 0x00, 0x7D];
        wire.extend_from_slice(&[0, 0, 0, 0]);

        let mut cursor = &wire[..];
        let err = read_frame(&mut cursor, 10).await.unwrap_err();
        assert_eq!(err, WsError::FrameTooLarge);
    }

    #[tokio::test]
    async fn write_frame_is_unmasked() {
        let frame = Frame::text("hi");
        let mut out = Vec::new();
        write_frame(&mut out, &frame).await.unwrap();

        assert_eq!(out, vec![0b1000_0001, 0b0000_0010, b'h', b'i']);
    }
}

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::Limits;
use crate::duplex::frame::{Frame, OpCode};
use crate::duplex::message::{CloseCode, CloseFrame, Message};
use crate::error::{Error, Result};

/// Which end of the connection we are. Determines masking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Masks outgoing frames; expects unmasked frames.
    Client,
    /// Sends unmasked frames; expects masked frames.
    Server,
}

impl Role {
    #[inline]
    #[must_use]
    pub const fn must_mask(&self) -> bool {
        matches!(self, Role::Client)
    }
}

/// Lifecycle of a connection after the upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ConnectionState {
    /// Messages flow both ways.
    Open,
    /// We sent a close frame and wait for the peer's.
    Closing,
    /// Close handshake finished or the stream ended.
    Closed,
}

/// A message-oriented duplex connection over an upgraded stream.
///
/// ## Example
///
/// ```rust,ignore
/// let (mut conn, _response) = client.dial("wss://localhost:8443/ws", &HeaderMap::new()).await?;
///
/// conn.send(Message::text("hello")).await?;
/// while let Some(msg) = conn.recv().await? {
///     println!("received: {:?}", msg);
/// }
/// ```
#[derive(Debug)]
pub struct Connection<T> {
    io: T,
    role: Role,
    limits: Limits,
    state: ConnectionState,
    read_buf: BytesMut,
    write_buf: Vec<u8>,
    partial: Option<(OpCode, Vec<u8>)>,
    fragment_count: usize,
}

impl<T> Connection<T> {
    /// Wrap a stream on which the upgrade handshake has already completed.
    pub fn new(io: T, role: Role, limits: Limits) -> Self {
        Self::with_buffered(io, role, limits, Vec::new())
    }

    /// Like [`Connection::new`], seeding the read buffer with bytes that were
    /// received together with the handshake.
    pub fn with_buffered(io: T, role: Role, limits: Limits, buffered: Vec<u8>) -> Self {
        let mut read_buf = BytesMut::with_capacity(buffered.len().max(4096));
        read_buf.extend_from_slice(&buffered);
        Self {
            io,
            role,
            limits,
            state: ConnectionState::Open,
            read_buf,
            write_buf: Vec::new(),
            partial: None,
            fragment_count: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Access the underlying stream, e.g. to read TLS session details.
    pub fn get_ref(&self) -> &T {
        &self.io
    }

    /// Give up the connection and return the underlying stream.
    pub fn into_inner(self) -> T {
        self.io
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin> Connection<T> {
    /// Send a message as a single frame.
    ///
    /// ## Errors
    ///
    /// - `Error::ConnectionClosed` once a close frame has been sent or received
    /// - `Error::MessageTooLarge` if the payload exceeds the configured limit
    /// - `Error::ControlFrameTooLarge` for control payloads over 125 bytes
    pub async fn send(&mut self, message: Message) -> Result<()> {
        if self.state != ConnectionState::Open {
            return Err(Error::ConnectionClosed(None));
        }

        let frame = match message {
            Message::Text(text) => Frame::new(true, OpCode::Text, text.into_bytes()),
            Message::Binary(data) => Frame::new(true, OpCode::Binary, data),
            Message::Ping(data) => Frame::new(true, OpCode::Ping, data),
            Message::Pong(data) => Frame::pong(data),
            Message::Close(close) => {
                let (code, reason) = close
                    .map(|cf| (cf.code, cf.reason))
                    .unwrap_or_default();
                return self.close(code, &reason).await;
            }
        };

        self.limits.check_message_size(frame.payload().len())?;
        frame.validate()?;
        self.write_frame(&frame).await
    }

    /// Send a ping.
    pub async fn ping(&mut self, data: Vec<u8>) -> Result<()> {
        self.send(Message::Ping(data)).await
    }

    /// Start the close handshake.
    ///
    /// The peer's close reply is consumed by the next [`Connection::recv`].
    /// Calling `close` on a connection that is not open does nothing.
    pub async fn close(&mut self, code: CloseCode, reason: &str) -> Result<()> {
        if self.state != ConnectionState::Open {
            return Ok(());
        }
        if code.is_reserved() {
            return Err(Error::InvalidCloseCode(code.as_u16()));
        }

        self.state = ConnectionState::Closing;
        self.write_frame(&Frame::close(Some(code.as_u16()), reason)).await
    }

    /// Receive the next message.
    ///
    /// Pings are answered with a pong right away and are still returned to
    /// the caller. Fragmented messages are reassembled. A received close
    /// frame is answered and returned; after that, and when the stream ends,
    /// `Ok(None)` is returned.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        if self.state == ConnectionState::Closed {
            return Ok(None);
        }

        loop {
            let frame = match self.read_frame().await {
                Ok(frame) => frame,
                Err(Error::ConnectionClosed(_)) => {
                    self.state = ConnectionState::Closed;
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };

            match frame.opcode {
                OpCode::Ping => {
                    let payload = frame.into_payload();
                    if self.state == ConnectionState::Open {
                        self.write_frame(&Frame::pong(payload.clone())).await?;
                    }
                    return Ok(Some(Message::Ping(payload)));
                }
                OpCode::Pong => return Ok(Some(Message::Pong(frame.into_payload()))),
                OpCode::Close => {
                    let close = parse_close_payload(frame.payload());
                    if self.state == ConnectionState::Open {
                        let reply = match &close {
                            Some(cf) if !cf.code.is_reserved() => {
                                Frame::close(Some(cf.code.as_u16()), "")
                            }
                            _ => Frame::close(None, ""),
                        };
                        let _ = self.write_frame(&reply).await;
                    }
                    self.state = ConnectionState::Closed;
                    return Ok(Some(Message::Close(close)));
                }
                OpCode::Text | OpCode::Binary | OpCode::Continuation => {
                    if let Some(message) = self.assemble(frame)? {
                        return Ok(Some(message));
                    }
                }
            }
        }
    }

    async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let mask = if self.role.must_mask() {
            Some(random_mask()?)
        } else {
            None
        };

        self.write_buf.clear();
        frame.write(&mut self.write_buf, mask);
        self.io.write_all(&self.write_buf).await?;
        self.io.flush().await?;
        Ok(())
    }

    async fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if !self.read_buf.is_empty() {
                match Frame::parse(&self.read_buf, self.limits.max_frame_size) {
                    Ok((frame, consumed)) => {
                        self.read_buf.advance(consumed);
                        self.check_incoming(&frame)?;
                        return Ok(frame);
                    }
                    Err(Error::IncompleteFrame { .. }) => {}
                    Err(e) => return Err(e),
                }
            }

            self.read_buf.reserve(4096);
            let n = self.io.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed(None));
            }
        }
    }

    fn check_incoming(&self, frame: &Frame) -> Result<()> {
        match (self.role, frame.mask.is_some()) {
            (Role::Server, false) => return Err(Error::UnmaskedClientFrame),
            (Role::Client, true) => return Err(Error::MaskedServerFrame),
            _ => {}
        }
        frame.validate()
    }

    fn assemble(&mut self, frame: Frame) -> Result<Option<Message>> {
        let fin = frame.fin;

        if frame.opcode == OpCode::Continuation {
            let Some((_, buffer)) = self.partial.as_mut() else {
                return Err(Error::ProtocolViolation(
                    "Unexpected continuation frame".into(),
                ));
            };
            self.fragment_count += 1;
            self.limits.check_fragment_count(self.fragment_count)?;
            self.limits
                .check_message_size(buffer.len() + frame.payload().len())?;
            buffer.extend_from_slice(frame.payload());
        } else if self.partial.is_some() {
            return Err(Error::ProtocolViolation(
                "Expected continuation frame".into(),
            ));
        } else {
            self.limits.check_message_size(frame.payload().len())?;
            self.fragment_count = 1;
            self.partial = Some((frame.opcode, frame.into_payload()));
        }

        if !fin {
            return Ok(None);
        }

        self.fragment_count = 0;
        match self.partial.take() {
            Some((OpCode::Text, payload)) => String::from_utf8(payload)
                .map(|text| Some(Message::Text(text)))
                .map_err(|_| Error::InvalidUtf8),
            Some((_, payload)) => Ok(Some(Message::Binary(payload))),
            None => Ok(None),
        }
    }
}

fn random_mask() -> Result<[u8; 4]> {
    let mut mask = [0u8; 4];
    getrandom::getrandom(&mut mask).map_err(|e| Error::Io(e.to_string()))?;
    Ok(mask)
}

fn parse_close_payload(payload: &[u8]) -> Option<CloseFrame> {
    match payload {
        [] => None,
        [hi, lo, reason @ ..] => {
            let code = CloseCode::from_u16(u16::from_be_bytes([*hi, *lo]));
            match std::str::from_utf8(reason) {
                Ok(reason) => Some(CloseFrame::new(code, reason)),
                Err(_) => Some(CloseFrame::new(CloseCode::InvalidPayload, "")),
            }
        }
        [_] => Some(CloseFrame::new(CloseCode::ProtocolError, "Invalid close frame")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{DuplexStream, duplex};

    fn pair() -> (Connection<DuplexStream>, Connection<DuplexStream>) {
        let (a, b) = duplex(64 * 1024);
        (
            Connection::new(a, Role::Client, Limits::default()),
            Connection::new(b, Role::Server, Limits::default()),
        )
    }

    #[tokio::test]
    async fn test_text_and_binary_exchange() {
        let (mut client, mut server) = pair();

        client.send(Message::text("hello")).await.unwrap();
        assert_eq!(server.recv().await.unwrap(), Some(Message::text("hello")));

        server.send(Message::binary(vec![1, 2, 3])).await.unwrap();
        assert_eq!(
            client.recv().await.unwrap(),
            Some(Message::Binary(vec![1, 2, 3]))
        );
    }

    #[tokio::test]
    async fn test_client_frames_are_masked() {
        let (a, mut raw) = duplex(1024);
        let mut client = Connection::new(a, Role::Client, Limits::default());
        client.send(Message::text("hi")).await.unwrap();

        let mut buf = [0u8; 8];
        raw.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[0], 0x81);
        assert_eq!(buf[1], 0x80 | 2);
    }

    #[tokio::test]
    async fn test_server_rejects_unmasked_frame() {
        let (mut raw, b) = duplex(1024);
        let mut server = Connection::new(b, Role::Server, Limits::default());
        raw.write_all(&[0x81, 0x02, b'h', b'i']).await.unwrap();

        assert!(matches!(server.recv().await, Err(Error::UnmaskedClientFrame)));
    }

    #[tokio::test]
    async fn test_ping_is_answered() {
        let (mut client, mut server) = pair();

        client.ping(b"beat".to_vec()).await.unwrap();
        assert_eq!(server.recv().await.unwrap(), Some(Message::Ping(b"beat".to_vec())));

        server.send(Message::text("after")).await.unwrap();

        assert_eq!(client.recv().await.unwrap(), Some(Message::Pong(b"beat".to_vec())));
        assert_eq!(client.recv().await.unwrap(), Some(Message::text("after")));
        drop(client);
        assert_eq!(server.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fragmented_message_is_reassembled() {
        let (mut raw, b) = duplex(1024);
        let mut client = Connection::new(b, Role::Client, Limits::default());

        let mut buf = Vec::new();
        Frame::new(false, OpCode::Text, b"Hel".to_vec()).write(&mut buf, None);
        Frame::new(true, OpCode::Continuation, b"lo".to_vec()).write(&mut buf, None);
        raw.write_all(&buf).await.unwrap();

        assert_eq!(client.recv().await.unwrap(), Some(Message::text("Hello")));
    }

    #[tokio::test]
    async fn test_fragment_limit() {
        let (mut raw, b) = duplex(1024);
        let limits = Limits::new(1024, 1024, 2, 1024);
        let mut client = Connection::new(b, Role::Client, limits);

        let mut buf = Vec::new();
        Frame::new(false, OpCode::Binary, vec![1]).write(&mut buf, None);
        Frame::new(false, OpCode::Continuation, vec![2]).write(&mut buf, None);
        Frame::new(true, OpCode::Continuation, vec![3]).write(&mut buf, None);
        raw.write_all(&buf).await.unwrap();

        assert!(matches!(
            client.recv().await,
            Err(Error::TooManyFragments { count: 3, max: 2 })
        ));
    }

    #[tokio::test]
    async fn test_unexpected_continuation() {
        let (mut raw, b) = duplex(1024);
        let mut client = Connection::new(b, Role::Client, Limits::default());

        let mut buf = Vec::new();
        Frame::new(true, OpCode::Continuation, vec![1]).write(&mut buf, None);
        raw.write_all(&buf).await.unwrap();

        assert!(matches!(client.recv().await, Err(Error::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn test_close_handshake() {
        let (mut client, mut server) = pair();

        client.close(CloseCode::Normal, "done").await.unwrap();
        assert_eq!(client.state(), ConnectionState::Closing);
        assert!(client.send(Message::text("late")).await.is_err());

        let received = server.recv().await.unwrap();
        assert_eq!(
            received,
            Some(Message::Close(Some(CloseFrame::new(CloseCode::Normal, "done"))))
        );
        assert_eq!(server.state(), ConnectionState::Closed);

        let reply = client.recv().await.unwrap();
        assert!(matches!(reply, Some(Message::Close(Some(cf))) if cf.code == CloseCode::Normal));
        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(client.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_close_rejects_reserved_code() {
        let (mut client, _server) = pair();
        assert!(matches!(
            client.close(CloseCode::Other(1005), "").await,
            Err(Error::InvalidCloseCode(1005))
        ));
    }

    #[tokio::test]
    async fn test_buffered_bytes_are_read_first() {
        let (a, _b) = duplex(1024);
        let mut buffered = Vec::new();
        Frame::new(true, OpCode::Text, b"early".to_vec()).write(&mut buffered, None);

        let mut client = Connection::with_buffered(a, Role::Client, Limits::default(), buffered);
        assert_eq!(client.recv().await.unwrap(), Some(Message::text("early")));
    }

    #[test]
    fn test_parse_close_payload() {
        assert_eq!(parse_close_payload(&[]), None);
        assert_eq!(
            parse_close_payload(&[0x03, 0xe8]),
            Some(CloseFrame::new(CloseCode::Normal, ""))
        );
        assert_eq!(
            parse_close_payload(&[0x03]).map(|cf| cf.code),
            Some(CloseCode::ProtocolError)
        );
    }
}

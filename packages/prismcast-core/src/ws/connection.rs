//! Per-connection WebSocket state: message assembly, the close handshake,
//! and the outbound byte buffer the dispatch loop writes into.

use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

use super::frame::{Frame, FrameError, OpCode};

/// Cap on one assembled message; client control messages are small JSON.
pub const MAX_MESSAGE_BYTES: usize = 1 << 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WsError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("unexpected continuation frame")]
    StrayContinuation,

    #[error("new data frame while a fragmented message is in progress")]
    InterleavedMessage,

    #[error("message exceeds {MAX_MESSAGE_BYTES} bytes")]
    MessageTooLarge,
}

/// Connection lifecycle; `Connecting` covers the handshake window until the
/// 101 response has drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Connected,
    Closing,
}

/// A complete (possibly reassembled) data message.
#[derive(Debug, PartialEq, Eq)]
pub struct WsMessage {
    pub opcode: OpCode,
    pub payload: Bytes,
}

/// What the caller must do after processing incoming bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// Keep the connection going.
    None,
    /// A Close reply is queued; force-close once the buffer drains.
    AfterDrain,
    /// Tear down immediately.
    Now,
}

/// FIFO of serialized outbound frames with byte accounting.
#[derive(Default)]
pub struct SendBuffer {
    queue: VecDeque<Bytes>,
    total: usize,
}

impl SendBuffer {
    pub fn push(&mut self, bytes: Bytes) {
        self.total += bytes.len();
        self.queue.push_back(bytes);
    }

    /// Total bytes pending.
    pub fn bytes(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Drops everything pending (fast shedding).
    pub fn clear(&mut self) {
        self.queue.clear();
        self.total = 0;
    }

    /// The next contiguous chunk to write, if any.
    pub fn front(&self) -> Option<&Bytes> {
        self.queue.front()
    }

    /// Consumes `n` written bytes from the front.
    pub fn advance(&mut self, mut n: usize) {
        self.total -= n;
        while n > 0 {
            let front = self.queue.front_mut().expect("advance past end of buffer");
            if n < front.len() {
                front.advance(n);
                return;
            }
            n -= front.len();
            self.queue.pop_front();
        }
    }
}

/// Protocol state for one accepted socket.
pub struct WsConnection {
    id: u64,
    state: ConnState,
    /// Raw inbound bytes awaiting frame parsing.
    pub read_buf: BytesMut,
    send: SendBuffer,
    /// In-progress fragmented message: first opcode plus accumulated payload.
    fragment: Option<(OpCode, BytesMut)>,
}

impl WsConnection {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            state: ConnState::Connecting,
            read_buf: BytesMut::with_capacity(4 * 1024),
            send: SendBuffer::default(),
            fragment: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Handshake response has fully drained; data frames may now flow.
    pub fn mark_connected(&mut self) {
        self.state = ConnState::Connected;
    }

    // ── outbound ────────────────────────────────────────────────────────

    /// Serializes and appends a frame to the send buffer.
    pub fn queue_frame(&mut self, frame: &Frame) {
        self.send.push(frame.serialize());
    }

    /// Appends already-serialized bytes (handshake response).
    pub fn queue_raw(&mut self, bytes: Bytes) {
        self.send.push(bytes);
    }

    /// Initiates a graceful close: queue a Close frame and stop accepting
    /// new data messages.
    pub fn queue_close(&mut self) {
        if self.state != ConnState::Closing {
            self.queue_frame(&Frame::close());
            self.state = ConnState::Closing;
        }
    }

    pub fn buffer_bytes(&self) -> usize {
        self.send.bytes()
    }

    pub fn clear_buffer(&mut self) {
        self.send.clear();
    }

    pub fn send_buffer(&self) -> &SendBuffer {
        &self.send
    }

    pub fn send_buffer_mut(&mut self) -> &mut SendBuffer {
        &mut self.send
    }

    // ── inbound ─────────────────────────────────────────────────────────

    /// Parses every complete frame out of `read_buf`, runs the connection
    /// state machine, and returns assembled data messages plus the required
    /// close action. Errors are protocol violations.
    pub fn process_read(&mut self) -> Result<(Vec<WsMessage>, CloseAction), WsError> {
        let mut messages = Vec::new();

        while let Some(frame) = Frame::parse(&mut self.read_buf)? {
            match frame.opcode {
                OpCode::Ping => {
                    self.queue_frame(&Frame::pong(frame.payload));
                }
                OpCode::Pong => {}
                OpCode::Close => {
                    return match self.state {
                        // peer-initiated: reply then close after drain
                        ConnState::Connected | ConnState::Connecting => {
                            self.queue_frame(&Frame::close());
                            self.state = ConnState::Closing;
                            Ok((messages, CloseAction::AfterDrain))
                        }
                        // our Close already went out; handshake complete
                        ConnState::Closing => Ok((messages, CloseAction::Now)),
                    };
                }
                OpCode::Text | OpCode::Binary => {
                    if self.fragment.is_some() {
                        return Err(WsError::InterleavedMessage);
                    }
                    if frame.fin {
                        messages.push(WsMessage {
                            opcode: frame.opcode,
                            payload: frame.payload,
                        });
                    } else {
                        self.fragment =
                            Some((frame.opcode, BytesMut::from(&frame.payload[..])));
                    }
                }
                OpCode::Continuation => {
                    let Some((_, acc)) = self.fragment.as_mut() else {
                        return Err(WsError::StrayContinuation);
                    };
                    if acc.len() + frame.payload.len() > MAX_MESSAGE_BYTES {
                        return Err(WsError::MessageTooLarge);
                    }
                    acc.extend_from_slice(&frame.payload);
                    if frame.fin {
                        let (opcode, acc) =
                            self.fragment.take().expect("fragment in progress");
                        messages.push(WsMessage {
                            opcode,
                            payload: acc.freeze(),
                        });
                    }
                }
            }
        }

        Ok((messages, CloseAction::None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(conn: &mut WsConnection, frames: &[Frame]) -> (Vec<WsMessage>, CloseAction) {
        for f in frames {
            conn.read_buf.extend_from_slice(&f.serialize());
        }
        conn.process_read().unwrap()
    }

    fn connected() -> WsConnection {
        let mut conn = WsConnection::new(1);
        conn.mark_connected();
        conn
    }

    #[test]
    fn single_binary_frame_is_a_message() {
        let mut conn = connected();
        let (msgs, close) = feed(&mut conn, &[Frame::binary(&b"payload"[..])]);
        assert_eq!(close, CloseAction::None);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].payload, Bytes::from_static(b"payload"));
    }

    #[test]
    fn fragmented_message_is_reassembled() {
        let mut conn = connected();
        let frames = [
            Frame::new(false, OpCode::Binary, &b"ab"[..]),
            Frame::new(false, OpCode::Continuation, &b"cd"[..]),
            Frame::new(true, OpCode::Continuation, &b"ef"[..]),
        ];
        let (msgs, _) = feed(&mut conn, &frames);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].opcode, OpCode::Binary);
        assert_eq!(msgs[0].payload, Bytes::from_static(b"abcdef"));
    }

    #[test]
    fn control_frames_interleave_with_fragments() {
        // a Ping between fragments must not corrupt reassembly
        let mut conn = connected();
        let frames = [
            Frame::new(false, OpCode::Binary, &b"ab"[..]),
            Frame::new(true, OpCode::Ping, &b"hb"[..]),
            Frame::new(true, OpCode::Continuation, &b"cd"[..]),
        ];
        let (msgs, _) = feed(&mut conn, &frames);
        assert_eq!(msgs[0].payload, Bytes::from_static(b"abcd"));
        // and the pong went out
        assert!(conn.buffer_bytes() > 0);
    }

    #[test]
    fn ping_queues_matching_pong() {
        let mut conn = connected();
        feed(&mut conn, &[Frame::new(true, OpCode::Ping, &b"tok"[..])]);
        let queued = conn.send_buffer().front().unwrap().clone();
        let mut buf = BytesMut::from(&queued[..]);
        let pong = Frame::parse(&mut buf).unwrap().unwrap();
        assert_eq!(pong.opcode, OpCode::Pong);
        assert_eq!(pong.payload, Bytes::from_static(b"tok"));
    }

    #[test]
    fn peer_close_is_replied_and_drained() {
        let mut conn = connected();
        let (_, close) = feed(&mut conn, &[Frame::close()]);
        assert_eq!(close, CloseAction::AfterDrain);
        assert_eq!(conn.state(), ConnState::Closing);
        assert!(conn.buffer_bytes() > 0, "close reply queued");
    }

    #[test]
    fn close_reply_to_our_close_finishes_immediately() {
        let mut conn = connected();
        conn.queue_close();
        assert_eq!(conn.state(), ConnState::Closing);
        let (_, close) = feed(&mut conn, &[Frame::close()]);
        assert_eq!(close, CloseAction::Now);
    }

    #[test]
    fn stray_continuation_is_a_protocol_error() {
        let mut conn = connected();
        conn.read_buf
            .extend_from_slice(&Frame::new(true, OpCode::Continuation, &b"x"[..]).serialize());
        assert_eq!(conn.process_read(), Err(WsError::StrayContinuation));
    }

    #[test]
    fn send_buffer_accounts_partial_writes() {
        let mut buf = SendBuffer::default();
        buf.push(Bytes::from_static(b"aaaa"));
        buf.push(Bytes::from_static(b"bb"));
        assert_eq!(buf.bytes(), 6);

        buf.advance(3);
        assert_eq!(buf.bytes(), 3);
        assert_eq!(buf.front().unwrap().as_ref(), b"a");

        // crossing a chunk boundary
        buf.advance(2);
        assert_eq!(buf.front().unwrap().as_ref(), b"b");

        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.bytes(), 0);
    }

    #[test]
    fn queue_close_is_idempotent() {
        let mut conn = connected();
        conn.queue_close();
        let after_first = conn.buffer_bytes();
        conn.queue_close();
        assert_eq!(conn.buffer_bytes(), after_first);
    }
}

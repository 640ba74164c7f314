//! Frame types carried on the control socket.
//!
//! [`Envelope`] wraps every binary message with addressing and sequencing;
//! the body is one of three tagged unions: HTTP exchange frames, raw
//! WebSocket frames for promoted streams, and connection-level control
//! frames. Unknown tags are decode errors, never silent no-ops.

use std::time::{SystemTime, UNIX_EPOCH};

/// One HTTP header: name is text, value is opaque bytes.
pub type Header = (String, Vec<u8>);

/// The outer frame wrapping every binary control-socket message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Milliseconds since the Unix epoch at frame production time.
    pub timestamp_ms: u64,
    /// Identifies the agent attach this frame belongs to; rotated on every
    /// successful attach.
    pub connection_id: u64,
    /// Stream this frame addresses; 0 for control frames.
    pub stream_id: u32,
    /// Per-connection monotonic emission counter.
    pub msg_seq: u32,
    pub body: FrameBody,
}

impl Envelope {
    /// Builds an envelope stamped with the current wall-clock time.
    pub fn new(connection_id: u64, stream_id: u32, msg_seq: u32, body: FrameBody) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            timestamp_ms,
            connection_id,
            stream_id,
            msg_seq,
            body,
        }
    }
}

/// Body variants of an [`Envelope`].
#[derive(Debug, Clone, PartialEq)]
pub enum FrameBody {
    Http(HttpFrame),
    Ws(WsFrame),
    Control(ControlFrame),
}

/// Frames of one proxied HTTP exchange.
///
/// `RequestTrailers`, `ResponseTrailers`, and `ResponseInterim` are reserved:
/// the codec round-trips them but the session never emits them and drops
/// them on receipt.
#[derive(Debug, Clone, PartialEq)]
pub enum HttpFrame {
    RequestInit {
        method: String,
        /// Path plus query string.
        uri: String,
        version: u8,
        headers: Vec<Header>,
        has_body: bool,
    },
    RequestBodyChunk {
        /// In-direction chunk sequence, starting at 0.
        seq: u32,
        is_last: bool,
        data: Vec<u8>,
    },
    RequestTrailers {
        headers: Vec<Header>,
    },
    RequestEnd,
    RequestAbort {
        reason: AbortReason,
        detail: String,
    },
    ResponseInit {
        status: u16,
        has_body: bool,
        /// 0 means unknown (chunked).
        content_length: u64,
        headers: Vec<Header>,
    },
    ResponseInterim {
        status: u16,
        headers: Vec<Header>,
    },
    ResponseBodyChunk {
        seq: u32,
        is_last: bool,
        data: Vec<u8>,
    },
    ResponseTrailers {
        headers: Vec<Header>,
    },
    ResponseEnd,
    ResponseAbort {
        reason: AbortReason,
        detail: String,
    },
}

/// Why a stream direction was torn down early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AbortReason {
    Unknown = 0,
    Timeout = 1,
    PeerClosed = 2,
    ResetByPeer = 3,
    ConnectionLost = 4,
    Cancelled = 5,
    ProtocolError = 6,
    FlowControl = 7,
    Overload = 8,
}

impl AbortReason {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Unknown),
            1 => Some(Self::Timeout),
            2 => Some(Self::PeerClosed),
            3 => Some(Self::ResetByPeer),
            4 => Some(Self::ConnectionLost),
            5 => Some(Self::Cancelled),
            6 => Some(Self::ProtocolError),
            7 => Some(Self::FlowControl),
            8 => Some(Self::Overload),
            _ => None,
        }
    }
}

/// A relayed WebSocket frame for a promoted stream.
#[derive(Debug, Clone, PartialEq)]
pub struct WsFrame {
    pub opcode: WsOpcode,
    pub fin: bool,
    pub rsv1: bool,
    pub rsv2: bool,
    pub rsv3: bool,
    pub masked: bool,
    pub mask_key: u32,
    /// Carried only on close frames.
    pub close_code: Option<u16>,
    pub payload: Vec<u8>,
}

impl WsFrame {
    /// A complete unmasked data or control frame (`fin = true`).
    pub fn message(opcode: WsOpcode, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            fin: true,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            masked: false,
            mask_key: 0,
            close_code: None,
            payload,
        }
    }

    /// A close frame carrying the given status code.
    pub fn close(code: u16) -> Self {
        Self {
            close_code: Some(code),
            ..Self::message(WsOpcode::Close, Vec::new())
        }
    }
}

/// WebSocket opcodes, RFC 6455 values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WsOpcode {
    Continuation = 0,
    Text = 1,
    Binary = 2,
    Close = 8,
    Ping = 9,
    Pong = 10,
}

impl WsOpcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Continuation),
            1 => Some(Self::Text),
            2 => Some(Self::Binary),
            8 => Some(Self::Close),
            9 => Some(Self::Ping),
            10 => Some(Self::Pong),
            _ => None,
        }
    }
}

/// Connection-level frames that bypass streams (`stream_id = 0`).
#[derive(Debug, Clone, PartialEq)]
pub enum ControlFrame {
    Ping {
        data: Vec<u8>,
    },
    Pong {
        data: Vec<u8>,
    },
    /// Reserved for future flow control; accepted and ignored.
    FlowWindowUpdate {
        window_delta: u32,
    },
    Error {
        code: u32,
        message: String,
    },
    GoAway {
        /// Highest `msg_seq` the sender guarantees to have emitted.
        last_msg_seq: u32,
        reason: String,
    },
}

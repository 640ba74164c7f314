//! Packed binary layout of the control-socket envelope.
//!
//! # Wire format
//!
//! All integers are big-endian.
//!
//! ```text
//! ENVELOPE:
//!   [8 bytes: timestamp_ms]
//!   [8 bytes: connection_id]
//!   [4 bytes: stream_id]
//!   [4 bytes: msg_seq]
//!   [1 byte : body tag   1=HTTP  2=WS  3=CONTROL]
//!   [body ...]
//!
//! HTTP body:    [1 byte: variant tag 1..=11][variant fields]
//! WS body:      [1 byte: opcode][1 byte: flags][4 bytes: mask_key]
//!               [2 bytes: close_code][blob payload]
//! CONTROL body: [1 byte: variant tag 1..=5][variant fields]
//!
//! str     = [4 bytes: len][UTF-8 bytes]
//! blob    = [4 bytes: len][bytes]
//! headers = [2 bytes: count] ( [str name][blob value] )*
//! ```
//!
//! Decoding is strict: truncated input, unknown tags, invalid UTF-8, and
//! trailing bytes after the body are all errors. Encoding cannot fail.

use crate::envelope::{
    AbortReason, ControlFrame, Envelope, FrameBody, Header, HttpFrame, WsFrame, WsOpcode,
};

const BODY_HTTP: u8 = 1;
const BODY_WS: u8 = 2;
const BODY_CONTROL: u8 = 3;

const HTTP_REQUEST_INIT: u8 = 1;
const HTTP_REQUEST_BODY_CHUNK: u8 = 2;
const HTTP_REQUEST_TRAILERS: u8 = 3;
const HTTP_REQUEST_END: u8 = 4;
const HTTP_REQUEST_ABORT: u8 = 5;
const HTTP_RESPONSE_INIT: u8 = 6;
const HTTP_RESPONSE_INTERIM: u8 = 7;
const HTTP_RESPONSE_BODY_CHUNK: u8 = 8;
const HTTP_RESPONSE_TRAILERS: u8 = 9;
const HTTP_RESPONSE_END: u8 = 10;
const HTTP_RESPONSE_ABORT: u8 = 11;

const CONTROL_PING: u8 = 1;
const CONTROL_PONG: u8 = 2;
const CONTROL_FLOW_WINDOW_UPDATE: u8 = 3;
const CONTROL_ERROR: u8 = 4;
const CONTROL_GO_AWAY: u8 = 5;

const FLAG_FIN: u8 = 0x01;
const FLAG_RSV1: u8 = 0x02;
const FLAG_RSV2: u8 = 0x04;
const FLAG_RSV3: u8 = 0x08;
const FLAG_MASKED: u8 = 0x10;

/// Errors from decoding a binary frame.
///
/// Any of these is a protocol error: the session fails the agent socket.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("frame truncated")]
    Truncated,

    #[error("unknown envelope body tag {0}")]
    UnknownBodyTag(u8),

    #[error("unknown HTTP frame tag {0}")]
    UnknownHttpTag(u8),

    #[error("unknown control frame tag {0}")]
    UnknownControlTag(u8),

    #[error("unknown WebSocket opcode {0}")]
    UnknownOpcode(u8),

    #[error("unknown abort reason {0}")]
    UnknownAbortReason(u8),

    #[error("invalid UTF-8 in text field")]
    InvalidUtf8,

    #[error("{0} trailing bytes after frame body")]
    TrailingBytes(usize),
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encodes an envelope into its packed wire form.
pub fn encode(envelope: &Envelope) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32 + body_size_hint(&envelope.body));
    buf.extend_from_slice(&envelope.timestamp_ms.to_be_bytes());
    buf.extend_from_slice(&envelope.connection_id.to_be_bytes());
    buf.extend_from_slice(&envelope.stream_id.to_be_bytes());
    buf.extend_from_slice(&envelope.msg_seq.to_be_bytes());

    match &envelope.body {
        FrameBody::Http(http) => {
            buf.push(BODY_HTTP);
            encode_http(&mut buf, http);
        }
        FrameBody::Ws(ws) => {
            buf.push(BODY_WS);
            encode_ws(&mut buf, ws);
        }
        FrameBody::Control(control) => {
            buf.push(BODY_CONTROL);
            encode_control(&mut buf, control);
        }
    }
    buf
}

fn body_size_hint(body: &FrameBody) -> usize {
    match body {
        FrameBody::Http(HttpFrame::RequestBodyChunk { data, .. })
        | FrameBody::Http(HttpFrame::ResponseBodyChunk { data, .. }) => data.len() + 16,
        FrameBody::Ws(ws) => ws.payload.len() + 16,
        _ => 64,
    }
}

fn encode_http(buf: &mut Vec<u8>, frame: &HttpFrame) {
    match frame {
        HttpFrame::RequestInit {
            method,
            uri,
            version,
            headers,
            has_body,
        } => {
            buf.push(HTTP_REQUEST_INIT);
            put_str(buf, method);
            put_str(buf, uri);
            buf.push(*version);
            put_headers(buf, headers);
            buf.push(*has_body as u8);
        }
        HttpFrame::RequestBodyChunk { seq, is_last, data } => {
            buf.push(HTTP_REQUEST_BODY_CHUNK);
            buf.extend_from_slice(&seq.to_be_bytes());
            buf.push(*is_last as u8);
            put_blob(buf, data);
        }
        HttpFrame::RequestTrailers { headers } => {
            buf.push(HTTP_REQUEST_TRAILERS);
            put_headers(buf, headers);
        }
        HttpFrame::RequestEnd => buf.push(HTTP_REQUEST_END),
        HttpFrame::RequestAbort { reason, detail } => {
            buf.push(HTTP_REQUEST_ABORT);
            buf.push(*reason as u8);
            put_str(buf, detail);
        }
        HttpFrame::ResponseInit {
            status,
            has_body,
            content_length,
            headers,
        } => {
            buf.push(HTTP_RESPONSE_INIT);
            buf.extend_from_slice(&status.to_be_bytes());
            buf.push(*has_body as u8);
            buf.extend_from_slice(&content_length.to_be_bytes());
            put_headers(buf, headers);
        }
        HttpFrame::ResponseInterim { status, headers } => {
            buf.push(HTTP_RESPONSE_INTERIM);
            buf.extend_from_slice(&status.to_be_bytes());
            put_headers(buf, headers);
        }
        HttpFrame::ResponseBodyChunk { seq, is_last, data } => {
            buf.push(HTTP_RESPONSE_BODY_CHUNK);
            buf.extend_from_slice(&seq.to_be_bytes());
            buf.push(*is_last as u8);
            put_blob(buf, data);
        }
        HttpFrame::ResponseTrailers { headers } => {
            buf.push(HTTP_RESPONSE_TRAILERS);
            put_headers(buf, headers);
        }
        HttpFrame::ResponseEnd => buf.push(HTTP_RESPONSE_END),
        HttpFrame::ResponseAbort { reason, detail } => {
            buf.push(HTTP_RESPONSE_ABORT);
            buf.push(*reason as u8);
            put_str(buf, detail);
        }
    }
}

fn encode_ws(buf: &mut Vec<u8>, frame: &WsFrame) {
    buf.push(frame.opcode as u8);
    let mut flags = 0u8;
    if frame.fin {
        flags |= FLAG_FIN;
    }
    if frame.rsv1 {
        flags |= FLAG_RSV1;
    }
    if frame.rsv2 {
        flags |= FLAG_RSV2;
    }
    if frame.rsv3 {
        flags |= FLAG_RSV3;
    }
    if frame.masked {
        flags |= FLAG_MASKED;
    }
    buf.push(flags);
    buf.extend_from_slice(&frame.mask_key.to_be_bytes());
    buf.extend_from_slice(&frame.close_code.unwrap_or(0).to_be_bytes());
    put_blob(buf, &frame.payload);
}

fn encode_control(buf: &mut Vec<u8>, frame: &ControlFrame) {
    match frame {
        ControlFrame::Ping { data } => {
            buf.push(CONTROL_PING);
            put_blob(buf, data);
        }
        ControlFrame::Pong { data } => {
            buf.push(CONTROL_PONG);
            put_blob(buf, data);
        }
        ControlFrame::FlowWindowUpdate { window_delta } => {
            buf.push(CONTROL_FLOW_WINDOW_UPDATE);
            buf.extend_from_slice(&window_delta.to_be_bytes());
        }
        ControlFrame::Error { code, message } => {
            buf.push(CONTROL_ERROR);
            buf.extend_from_slice(&code.to_be_bytes());
            put_str(buf, message);
        }
        ControlFrame::GoAway {
            last_msg_seq,
            reason,
        } => {
            buf.push(CONTROL_GO_AWAY);
            buf.extend_from_slice(&last_msg_seq.to_be_bytes());
            put_str(buf, reason);
        }
    }
}

fn put_str(buf: &mut Vec<u8>, value: &str) {
    buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
    buf.extend_from_slice(value.as_bytes());
}

fn put_blob(buf: &mut Vec<u8>, value: &[u8]) {
    buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
    buf.extend_from_slice(value);
}

fn put_headers(buf: &mut Vec<u8>, headers: &[Header]) {
    buf.extend_from_slice(&(headers.len() as u16).to_be_bytes());
    for (name, value) in headers {
        put_str(buf, name);
        put_blob(buf, value);
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decodes a packed wire frame back into an [`Envelope`].
pub fn decode(data: &[u8]) -> Result<Envelope, DecodeError> {
    let mut r = Reader { data, pos: 0 };

    let timestamp_ms = r.u64()?;
    let connection_id = r.u64()?;
    let stream_id = r.u32()?;
    let msg_seq = r.u32()?;

    let body = match r.u8()? {
        BODY_HTTP => FrameBody::Http(decode_http(&mut r)?),
        BODY_WS => FrameBody::Ws(decode_ws(&mut r)?),
        BODY_CONTROL => FrameBody::Control(decode_control(&mut r)?),
        tag => return Err(DecodeError::UnknownBodyTag(tag)),
    };

    let leftover = r.data.len() - r.pos;
    if leftover != 0 {
        return Err(DecodeError::TrailingBytes(leftover));
    }

    Ok(Envelope {
        timestamp_ms,
        connection_id,
        stream_id,
        msg_seq,
        body,
    })
}

fn decode_http(r: &mut Reader<'_>) -> Result<HttpFrame, DecodeError> {
    let frame = match r.u8()? {
        HTTP_REQUEST_INIT => {
            let method = r.str()?;
            let uri = r.str()?;
            let version = r.u8()?;
            let headers = r.headers()?;
            let has_body = r.u8()? != 0;
            HttpFrame::RequestInit {
                method,
                uri,
                version,
                headers,
                has_body,
            }
        }
        HTTP_REQUEST_BODY_CHUNK => {
            let seq = r.u32()?;
            let is_last = r.u8()? != 0;
            let data = r.blob()?;
            HttpFrame::RequestBodyChunk { seq, is_last, data }
        }
        HTTP_REQUEST_TRAILERS => HttpFrame::RequestTrailers {
            headers: r.headers()?,
        },
        HTTP_REQUEST_END => HttpFrame::RequestEnd,
        HTTP_REQUEST_ABORT => {
            let reason = r.abort_reason()?;
            let detail = r.str()?;
            HttpFrame::RequestAbort { reason, detail }
        }
        HTTP_RESPONSE_INIT => {
            let status = r.u16()?;
            let has_body = r.u8()? != 0;
            let content_length = r.u64()?;
            let headers = r.headers()?;
            HttpFrame::ResponseInit {
                status,
                has_body,
                content_length,
                headers,
            }
        }
        HTTP_RESPONSE_INTERIM => {
            let status = r.u16()?;
            let headers = r.headers()?;
            HttpFrame::ResponseInterim { status, headers }
        }
        HTTP_RESPONSE_BODY_CHUNK => {
            let seq = r.u32()?;
            let is_last = r.u8()? != 0;
            let data = r.blob()?;
            HttpFrame::ResponseBodyChunk { seq, is_last, data }
        }
        HTTP_RESPONSE_TRAILERS => HttpFrame::ResponseTrailers {
            headers: r.headers()?,
        },
        HTTP_RESPONSE_END => HttpFrame::ResponseEnd,
        HTTP_RESPONSE_ABORT => {
            let reason = r.abort_reason()?;
            let detail = r.str()?;
            HttpFrame::ResponseAbort { reason, detail }
        }
        tag => return Err(DecodeError::UnknownHttpTag(tag)),
    };
    Ok(frame)
}

fn decode_ws(r: &mut Reader<'_>) -> Result<WsFrame, DecodeError> {
    let opcode_byte = r.u8()?;
    let opcode = WsOpcode::from_u8(opcode_byte).ok_or(DecodeError::UnknownOpcode(opcode_byte))?;
    let flags = r.u8()?;
    let mask_key = r.u32()?;
    let close_code_raw = r.u16()?;
    let payload = r.blob()?;

    let close_code = if opcode == WsOpcode::Close {
        Some(close_code_raw)
    } else {
        None
    };

    Ok(WsFrame {
        opcode,
        fin: flags & FLAG_FIN != 0,
        rsv1: flags & FLAG_RSV1 != 0,
        rsv2: flags & FLAG_RSV2 != 0,
        rsv3: flags & FLAG_RSV3 != 0,
        masked: flags & FLAG_MASKED != 0,
        mask_key,
        close_code,
        payload,
    })
}

fn decode_control(r: &mut Reader<'_>) -> Result<ControlFrame, DecodeError> {
    let frame = match r.u8()? {
        CONTROL_PING => ControlFrame::Ping { data: r.blob()? },
        CONTROL_PONG => ControlFrame::Pong { data: r.blob()? },
        CONTROL_FLOW_WINDOW_UPDATE => ControlFrame::FlowWindowUpdate {
            window_delta: r.u32()?,
        },
        CONTROL_ERROR => {
            let code = r.u32()?;
            let message = r.str()?;
            ControlFrame::Error { code, message }
        }
        CONTROL_GO_AWAY => {
            let last_msg_seq = r.u32()?;
            let reason = r.str()?;
            ControlFrame::GoAway {
                last_msg_seq,
                reason,
            }
        }
        tag => return Err(DecodeError::UnknownControlTag(tag)),
    };
    Ok(frame)
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.data.len() - self.pos < n {
            return Err(DecodeError::Truncated);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn blob(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn str(&mut self) -> Result<String, DecodeError> {
        let bytes = self.blob()?;
        String::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)
    }

    fn headers(&mut self) -> Result<Vec<Header>, DecodeError> {
        let count = self.u16()? as usize;
        let mut headers = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let name = self.str()?;
            let value = self.blob()?;
            headers.push((name, value));
        }
        Ok(headers)
    }

    fn abort_reason(&mut self) -> Result<AbortReason, DecodeError> {
        let byte = self.u8()?;
        AbortReason::from_u8(byte).ok_or(DecodeError::UnknownAbortReason(byte))
    }
}

//! Wire protocol for the DOtunnel control socket.
//!
//! Every message between an agent and its relay session is a binary
//! [`Envelope`] in the packed layout documented in [`wire`], except for the
//! one-shot JSON [`TunnelReady`] handshake sent right after attach.

mod constants;
mod envelope;
mod handshake;
pub mod wire;

pub use constants::{
    DEFAULT_MAX_CONCURRENT_STREAMS, DEFAULT_REQUEST_TIMEOUT, HTTP_VERSION_1, MAX_FRAME_SIZE,
};
pub use envelope::{AbortReason, ControlFrame, Envelope, FrameBody, Header, HttpFrame, WsFrame, WsOpcode};
pub use handshake::TunnelReady;
pub use wire::{decode, encode, DecodeError};

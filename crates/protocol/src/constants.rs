//! Protocol-wide constants and defaults.

use std::time::Duration;

/// Maximum size of a single control-socket message: 16 MiB.
///
/// Enforced as the WebSocket message/frame limit on both ends; a frame
/// larger than this fails the connection rather than the codec.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Default cap on `|HTTP| + |WS|` streams per session.
pub const DEFAULT_MAX_CONCURRENT_STREAMS: usize = 100;

/// Default deadline for an HTTP exchange and for a WebSocket upgrade.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP version marker carried in `requestInit` (HTTP/1.1).
pub const HTTP_VERSION_1: u8 = 1;

//! Per-session stream table: in-flight HTTP exchanges and open WebSockets.
//!
//! A stream lives in exactly one of the two maps. Slots hold the channels
//! and the deadline token for their stream; removing a slot is the single
//! point where the deadline is cancelled.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::http::{PublicResponse, ServeError, StreamAbort};
use crate::ws::{PublicWsEvent, UpgradeDecision};

/// Lifecycle of a pending HTTP exchange.
///
/// Terminal frames (`responseEnd`, `responseAbort`, deadline) free the slot
/// outright, so only the two live states are ever stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HttpStreamState {
    /// `requestInit` emitted, waiting for `responseInit`.
    AwaitingInit,
    /// Headers delivered to the public side; body chunks may be in flight.
    ResponseStreaming,
}

/// Slot for one in-flight HTTP exchange (or a not-yet-promoted upgrade).
pub(crate) struct HttpStreamEntry {
    pub state: HttpStreamState,
    /// Single-shot "headers available" signal to the waiting public task.
    pub respond: Option<oneshot::Sender<Result<PublicResponse, ServeError>>>,
    /// Producer half of the response-body pipe, once streaming.
    pub body_tx: Option<mpsc::Sender<Result<Bytes, StreamAbort>>>,
    /// Next expected `seq` on incoming response body chunks.
    pub next_chunk_seq: u32,
    /// Whether `requestEnd` or `requestAbort` has already been emitted.
    pub request_closed: bool,
    /// Set when this slot is a deferred WebSocket upgrade.
    pub pending_upgrade: Option<oneshot::Sender<UpgradeDecision>>,
    pub deadline: CancellationToken,
}

impl HttpStreamEntry {
    pub fn request(
        respond: oneshot::Sender<Result<PublicResponse, ServeError>>,
        deadline: CancellationToken,
    ) -> Self {
        Self {
            state: HttpStreamState::AwaitingInit,
            respond: Some(respond),
            body_tx: None,
            next_chunk_seq: 0,
            request_closed: false,
            pending_upgrade: None,
            deadline,
        }
    }

    pub fn upgrade(decision: oneshot::Sender<UpgradeDecision>, deadline: CancellationToken) -> Self {
        Self {
            state: HttpStreamState::AwaitingInit,
            respond: None,
            body_tx: None,
            next_chunk_seq: 0,
            // Upgrades emit only `requestInit`; there is no request body.
            request_closed: true,
            pending_upgrade: Some(decision),
            deadline,
        }
    }
}

/// Slot for one promoted WebSocket stream.
pub(crate) struct WsStreamEntry {
    /// Frames relayed from the agent toward the public socket.
    pub to_public: mpsc::UnboundedSender<PublicWsEvent>,
}

/// The two stream maps plus the id allocator.
pub(crate) struct StreamTable {
    pub http: HashMap<u32, HttpStreamEntry>,
    pub ws: HashMap<u32, WsStreamEntry>,
    next_stream_id: u32,
}

impl StreamTable {
    pub fn new() -> Self {
        Self {
            http: HashMap::new(),
            ws: HashMap::new(),
            next_stream_id: 1,
        }
    }

    /// Returns the next stream id. Ids are never recycled within one
    /// connection; the counter only resets with the connection id.
    pub fn alloc_stream_id(&mut self) -> u32 {
        let id = self.next_stream_id;
        self.next_stream_id += 1;
        id
    }

    /// Total in-flight streams, checked against the concurrency cap.
    pub fn len(&self) -> usize {
        self.http.len() + self.ws.len()
    }

    /// Restarts id allocation. Only valid once both maps are empty,
    /// i.e. after a reattach has failed every in-flight stream.
    pub fn reset_ids(&mut self) {
        debug_assert!(self.http.is_empty() && self.ws.is_empty());
        self.next_stream_id = 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_ids_start_at_one_and_increment() {
        let mut table = StreamTable::new();
        assert_eq!(table.alloc_stream_id(), 1);
        assert_eq!(table.alloc_stream_id(), 2);
        assert_eq!(table.alloc_stream_id(), 3);
    }

    #[test]
    fn ids_are_not_recycled_after_removal() {
        let mut table = StreamTable::new();
        let (tx, _rx) = oneshot::channel();
        let id = table.alloc_stream_id();
        table
            .http
            .insert(id, HttpStreamEntry::request(tx, CancellationToken::new()));
        table.http.remove(&id);
        assert_eq!(table.alloc_stream_id(), 2);
    }

    #[test]
    fn len_counts_both_maps() {
        let mut table = StreamTable::new();
        let (tx, _rx) = oneshot::channel();
        let id = table.alloc_stream_id();
        table
            .http
            .insert(id, HttpStreamEntry::request(tx, CancellationToken::new()));

        let (ws_tx, _ws_rx) = mpsc::unbounded_channel();
        let ws_id = table.alloc_stream_id();
        table.ws.insert(ws_id, WsStreamEntry { to_public: ws_tx });

        assert_eq!(table.len(), 2);
    }

    #[test]
    fn reset_restarts_allocation() {
        let mut table = StreamTable::new();
        table.alloc_stream_id();
        table.alloc_stream_id();
        table.reset_ids();
        assert_eq!(table.alloc_stream_id(), 1);
    }
}

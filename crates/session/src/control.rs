//! Control frames: ping/pong, peer errors, goAway, reserved flow control.
//!
//! The session never schedules pings itself (that is the agent's job) but
//! answers incoming ones promptly. An inbound goAway puts the session into
//! draining mode: existing streams keep flowing, new ones are refused.

use tracing::{debug, info, trace, warn};

use dotunnel_protocol::{ControlFrame, FrameBody};

use crate::session::TunnelSession;

impl TunnelSession {
    pub(crate) fn handle_control(&self, connection_id: u64, frame: ControlFrame) {
        match frame {
            ControlFrame::Ping { data } => {
                let mut state = self.state.lock();
                if state.connection_id != connection_id {
                    return;
                }
                state.send_frame(0, FrameBody::Control(ControlFrame::Pong { data }));
            }
            ControlFrame::Pong { .. } => {
                trace!(tunnel = %self.tunnel_id(), "control pong");
            }
            ControlFrame::Error { code, message } => {
                warn!(tunnel = %self.tunnel_id(), code, %message, "control error from agent");
            }
            ControlFrame::GoAway {
                last_msg_seq,
                reason,
            } => {
                info!(
                    tunnel = %self.tunnel_id(),
                    last_msg_seq,
                    %reason,
                    "agent announced goAway; draining"
                );
                let mut state = self.state.lock();
                if state.connection_id == connection_id {
                    state.draining = true;
                }
            }
            ControlFrame::FlowWindowUpdate { window_delta } => {
                debug!(window_delta, "ignoring flow window update (reserved)");
            }
        }
    }
}

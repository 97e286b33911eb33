//! Shared send path for the client and server command surfaces.
//!
//! Both `execute_command` entry points funnel through here after their
//! side-specific state checks: validate the channel, validate the
//! frame, enqueue. The returned boolean reflects preconditions only;
//! writes are fire-and-forget and their failures surface through the
//! channel's inbound event path.

use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::channel::{ChannelHandle, MAX_PING_CONTENT, Outbound};
use crate::codec::LENGTH_FIELD_LEN;
use crate::command::Command;

pub(crate) struct CommandDispatcher;

impl CommandDispatcher {
    /// Validates and enqueues one command onto a live channel.
    pub fn send(handle: &ChannelHandle, cmd: &Command, description: &str, ping: bool) -> bool {
        if !handle.is_open() {
            warn!("exe[{description}]: channel is closed");
            return false;
        }

        let encoded_len = LENGTH_FIELD_LEN + cmd.content_len();
        if ping && encoded_len > MAX_PING_CONTENT {
            warn!(
                "exe[{description}]: ping content {encoded_len} exceeds control frame cap {MAX_PING_CONTENT}"
            );
            return false;
        }

        let out = Outbound {
            cmd: cmd.clone(),
            ping,
        };
        match handle.try_enqueue(out) {
            Ok(()) => {
                debug!("exe[{description}] id={} len={encoded_len}", cmd.id());
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!("exe[{description}]: outbound queue full");
                false
            }
            Err(TrySendError::Closed(_)) => {
                warn!("exe[{description}]: channel writer gone");
                false
            }
        }
    }
}

//! Liveness heartbeat for long-running pipeline stages.
//!
//! While a turn's downstream stages are in flight, a low-frequency
//! `heartbeat` event keeps the transport layer from expiring the
//! connection. The task is tied to a guard: dropping the guard aborts it
//! the instant the stage completes, on every exit path.

use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::protocol::ServerEvent;

/// Guard for a running heartbeat task. Aborts the task on drop.
pub struct HeartbeatGuard {
    handle: JoinHandle<()>,
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Start emitting `heartbeat` events every `interval` until the returned
/// guard is dropped.
pub fn start_heartbeat(
    session_id: String,
    events: UnboundedSender<ServerEvent>,
    interval: Duration,
) -> HeartbeatGuard {
    let handle = tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            if events
                .send(ServerEvent::Heartbeat {
                    session_id: session_id.clone(),
                })
                .is_err()
            {
                // Receiver gone: the connection is closing.
                break;
            }
            debug!("heartbeat sent for session {}", session_id);
        }
    });
    HeartbeatGuard { handle }
}

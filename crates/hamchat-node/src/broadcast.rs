//! Operator broadcast -- fan a BROADCAST response out to every session.

use hamchat_protocol::Response;

use crate::registry::SessionRegistry;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Sessions whose outbox was full or already closed.
    pub failed: usize,
}

/// Queue `text` on every active session. Never blocks: a session that is
/// not draining its outbox misses the broadcast and is counted as failed.
pub fn broadcast(registry: &SessionRegistry, text: &str) -> BroadcastReport {
    let response = Response::broadcast(text);
    let mut report = BroadcastReport::default();

    registry.for_each_active(|s| match s.outbox.try_send(response.clone()) {
        Ok(()) => report.delivered += 1,
        Err(e) => {
            report.failed += 1;
            tracing::warn!(slot = s.slot, peer = %s.peer, "broadcast: dropped: {e}");
        }
    });

    tracing::info!(
        delivered = report.delivered,
        failed = report.failed,
        "broadcast: sent"
    );
    report
}

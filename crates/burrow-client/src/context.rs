use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use burrow_transport::TeardownGuard;
use tracing::debug;

/// Local state of one client tunnel: its id, where it goes, whether the
/// broker has said OK yet, and the one-shot teardown shared by both ends.
#[derive(Debug)]
pub struct ClientTunnelContext {
    pub tunnel_id: String,
    pub target_host: String,
    pub target_port: u16,
    pub(crate) guard: TeardownGuard,
    ready: AtomicBool,
    created_at: Instant,
}

impl ClientTunnelContext {
    pub fn new(tunnel_id: String, target_host: String, target_port: u16) -> Self {
        Self {
            tunnel_id,
            target_host,
            target_port,
            guard: TeardownGuard::new(),
            ready: AtomicBool::new(false),
            created_at: Instant::now(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub(crate) fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.guard.is_closed()
    }

    pub fn age_ms(&self) -> u64 {
        self.created_at.elapsed().as_millis() as u64
    }

    /// Close both sides; returns true for the call that did it
    pub fn close(&self, reason: &str) -> bool {
        let closed = self.guard.close_both(reason);
        if closed {
            debug!(tunnel_id = %self.tunnel_id, reason = %reason, "Closing client tunnel");
        }
        closed
    }
}

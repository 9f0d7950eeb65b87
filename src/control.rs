//! Cross-thread control surface for a running capture session.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Handle retained by the host to signal the packet loop from other threads.
///
/// The loop reads these flags at its own boundaries; a `stop()` takes effect
/// within the 500 ms select timeout plus the cost of the current
/// housekeeping step.
#[derive(Clone, Default)]
pub struct CaptureHandle {
    inner: Arc<ControlFlags>,
}

#[derive(Default)]
struct ControlFlags {
    running: AtomicBool,
    dump_vpn_stats: AtomicBool,
    dump_capture_stats: AtomicBool,
    // IPv4 bits of a staged upstream DNS server, 0 when nothing is staged.
    staged_dns_server: AtomicU32,
}

impl CaptureHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Asks the packet loop to exit at its next boundary.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::Release);
    }

    /// Forces both a capture-stats emission and a purge/stats cycle on the
    /// next housekeeping pass.
    pub fn request_stats_dump(&self) {
        if self.is_running() {
            self.inner.dump_vpn_stats.store(true, Ordering::Release);
            self.inner.dump_capture_stats.store(true, Ordering::Release);
        }
    }

    /// Stages a new upstream DNS server; consumed by the loop before the
    /// next new-connection policy evaluation. `0.0.0.0` is ignored.
    pub fn set_dns_server(&self, server: Ipv4Addr) {
        self.inner
            .staged_dns_server
            .store(u32::from(server), Ordering::Release);
    }

    pub(crate) fn mark_running(&self, running: bool) {
        self.inner.running.store(running, Ordering::Release);
    }

    pub(crate) fn take_dump_vpn_stats(&self) -> bool {
        self.inner.dump_vpn_stats.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn take_dump_capture_stats(&self) -> bool {
        self.inner.dump_capture_stats.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn take_staged_dns_server(&self) -> Option<Ipv4Addr> {
        match self.inner.staged_dns_server.swap(0, Ordering::AcqRel) {
            0 => None,
            bits => Some(Ipv4Addr::from(bits)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staged_dns_server_is_consumed_once() {
        let handle = CaptureHandle::new();
        assert_eq!(handle.take_staged_dns_server(), None);

        handle.set_dns_server(Ipv4Addr::new(9, 9, 9, 9));
        assert_eq!(
            handle.take_staged_dns_server(),
            Some(Ipv4Addr::new(9, 9, 9, 9))
        );
        assert_eq!(handle.take_staged_dns_server(), None);
    }

    #[test]
    fn stats_dump_request_requires_running_loop() {
        let handle = CaptureHandle::new();
        handle.request_stats_dump();
        assert!(!handle.take_dump_capture_stats());

        handle.mark_running(true);
        handle.request_stats_dump();
        assert!(handle.take_dump_capture_stats());
        assert!(handle.take_dump_vpn_stats());
        assert!(!handle.take_dump_capture_stats());
    }
}

//! Upward interface: callbacks into the controlling application.

use std::os::fd::RawFd;

/// Connection snapshot handed to the host on registry drains. Field order
/// matches the host-side descriptor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub src_ip: String,
    pub dst_ip: String,
    pub info: String,
    pub url: String,
    pub l7_proto: String,
    pub status: i32,
    pub ip_ver: u8,
    pub ip_proto: u8,
    pub src_port: u16,
    pub dst_port: u16,
    pub first_seen: i64,
    pub last_seen: i64,
    pub sent_bytes: u64,
    pub rcvd_bytes: u64,
    pub sent_pkts: u32,
    pub rcvd_pkts: u32,
    pub uid: i32,
    pub incr_id: i32,
}

/// Aggregate capture counters handed to the host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VpnStats {
    pub sent_bytes: u64,
    pub rcvd_bytes: u64,
    pub sent_pkts: u32,
    pub rcvd_pkts: u32,
    pub dropped_connections: u32,
    pub open_sockets: u32,
    pub max_fd: i32,
    pub active_conns: u32,
    pub total_conns: u32,
    pub dns_requests: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ServiceStatus {
    Started,
    Stopped,
}

impl ServiceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceStatus::Started => "started",
            ServiceStatus::Stopped => "stopped",
        }
    }
}

/// Callbacks into the controlling application. Implementations must not
/// panic; failures are theirs to absorb.
pub trait HostEvents {
    /// Human-readable label for a uid, or `None` if unknown to the host.
    fn application_by_uid(&mut self, uid: i32) -> Option<String>;

    /// Excludes a socket from tun routing. Returns false on failure.
    fn protect_socket(&mut self, fd: RawFd) -> bool;

    /// Receives a chunk of the in-memory PCAP stream.
    fn dump_pcap_data(&mut self, data: &[u8]);

    /// Atomic hand-off of one drain cycle's batches.
    fn connections_dump(&mut self, new_conns: &[ConnectionDescriptor], updates: &[ConnectionDescriptor]);

    fn stats_dump(&mut self, stats: &VpnStats);

    fn service_status(&mut self, status: ServiceStatus);
}

/// Resolves the display label for a uid, with the fixed sentinels for root
/// and the system DNS resolver daemon.
pub fn app_label(host: &mut dyn HostEvents, uid: i32) -> String {
    match uid {
        0 => "ROOT".to_string(),
        1051 => "netd".to_string(),
        _ => host.application_by_uid(uid).unwrap_or_else(|| "???".to_string()),
    }
}

//! Interface to the userspace TCP/IP stack that terminates tun traffic.
//!
//! The stack is an external collaborator: it owns the connection table and
//! the proxied OS sockets, and calls back into the engine through
//! [`StackEvents`] while it is being driven. Connections are referred to by
//! opaque [`ConnId`]s; the engine's per-connection state is attached as a
//! [`RecordId`] so neither side holds references into the other.

use crate::conn::RecordId;
use std::fmt;
use std::net::IpAddr;
use std::os::fd::RawFd;
use thiserror::Error;

/// Immutable identity of a flow.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FiveTuple {
    pub ip_ver: u8,
    pub ip_proto: u8,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}:{} -> {}:{}",
            transport_label(self.ip_proto),
            self.src_ip,
            self.src_port,
            self.dst_ip,
            self.dst_port
        )
    }
}

/// Transport-layer name used in logs and as the fallback protocol label.
pub fn transport_label(ip_proto: u8) -> String {
    match ip_proto {
        1 | 58 => "ICMP".to_string(),
        6 => "TCP".to_string(),
        17 => "UDP".to_string(),
        other => other.to_string(),
    }
}

#[derive(Clone, Copy, Default, Debug)]
pub struct TcpFlagSummary {
    pub syn: bool,
    pub ack: bool,
}

/// A tun packet parsed by the stack; borrows the read buffer.
#[derive(Clone, Copy, Debug)]
pub struct PacketView<'a> {
    pub tuple: FiveTuple,
    /// The full IP packet.
    pub raw: &'a [u8],
    /// Transport payload (empty for bare headers).
    pub l7: &'a [u8],
    /// Present only for TCP packets.
    pub tcp_flags: Option<TcpFlagSummary>,
}

impl PacketView<'_> {
    /// True for TCP packets that are not the opening SYN of a flow.
    pub fn is_established_tcp(&self) -> bool {
        match self.tcp_flags {
            Some(flags) if self.tuple.ip_proto == 6 => !flags.syn || flags.ack,
            _ => false,
        }
    }
}

/// Mirror of the stack's connection lifecycle. Every state ordered at or
/// after `Closed` is terminal.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum ConnStatus {
    New = 0,
    Connecting = 1,
    Connected = 2,
    Closed = 3,
    Error = 4,
    SocketError = 5,
    ClientError = 6,
    Reset = 7,
    Unreachable = 8,
}

impl ConnStatus {
    pub fn is_terminal(self) -> bool {
        self >= ConnStatus::Closed
    }

    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Opaque handle to a stack connection.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ConnId(pub u64);

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Direction {
    /// Egress: read from the tun, headed to the network.
    FromTun,
    /// Ingress: received from the network, headed back to the tun.
    FromNet,
}

/// Aggregate counters reported by the stack.
#[derive(Clone, Copy, Default, Debug)]
pub struct StackStats {
    pub open_sockets: u32,
    pub max_fd: RawFd,
    pub active_tcp: u32,
    pub active_udp: u32,
    pub active_icmp: u32,
    pub total_tcp: u32,
    pub total_udp: u32,
    pub total_icmp: u32,
}

impl StackStats {
    pub fn active_connections(&self) -> u32 {
        self.active_tcp + self.active_udp + self.active_icmp
    }

    pub fn total_connections(&self) -> u32 {
        self.total_tcp + self.total_udp + self.total_icmp
    }
}

/// Snapshot of a stack connection passed to callbacks by value, so the
/// engine never borrows the stack while it is executing.
#[derive(Clone, Copy, Debug)]
pub struct ConnView<'a> {
    pub id: ConnId,
    pub tuple: &'a FiveTuple,
    pub status: ConnStatus,
    /// Engine record attached to the connection, if any.
    pub record: Option<RecordId>,
}

/// Outcome of [`StackEvents::connection_opened`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OpenVerdict {
    /// Accept the connection; `record` becomes its userdata. With `dnat`
    /// set, the stack rewrites the destination to its configured DNAT
    /// target when forwarding.
    Accept { record: RecordId, dnat: bool },
    /// Discard the triggering packet and create nothing.
    Reject,
}

#[derive(Debug, Error)]
pub enum TunWriteError {
    #[error("no buffer space on tun")]
    Congested,
    #[error("tun closed")]
    Closed,
    #[error("tun write failed: errno {0}")]
    Io(i32),
    #[error("partial tun write ({written}/{length})")]
    Short { written: usize, length: usize },
}

#[derive(Debug, Error)]
pub enum StackError {
    #[error("malformed packet")]
    MalformedPacket,
    #[error("forwarding failed: {0}")]
    Forward(&'static str),
}

/// Callbacks the stack invokes synchronously while being driven.
pub trait StackEvents {
    /// Deliver a network-to-tun packet. An error tears the connection down
    /// stack-side; the engine decides separately whether the loop survives.
    fn packet_to_tun(&mut self, packet: &[u8], tuple: &FiveTuple) -> Result<(), TunWriteError>;

    /// Account one packet, in either direction, against its connection.
    fn account_packet(&mut self, packet: &[u8], direction: Direction, conn: ConnView<'_>);

    /// A new OS socket was opened; the host must protect it against the tun.
    fn socket_opened(&mut self, fd: RawFd);

    /// First packet of an unknown 5-tuple; `l7` is its transport payload.
    fn connection_opened(&mut self, conn: ConnView<'_>, l7: &[u8]) -> OpenVerdict;

    /// The stack is discarding a connection.
    fn connection_closed(&mut self, conn: ConnView<'_>);
}

/// The stack surface consumed by the packet loop.
pub trait TunStack {
    fn parse_packet<'a>(&self, buf: &'a [u8]) -> Result<PacketView<'a>, StackError>;

    /// Looks up the connection for `pkt`, creating it (and invoking
    /// [`StackEvents::connection_opened`]) when `create` is set.
    fn lookup(
        &mut self,
        pkt: &PacketView<'_>,
        create: bool,
        events: &mut dyn StackEvents,
    ) -> Option<ConnId>;

    fn forward(
        &mut self,
        pkt: &PacketView<'_>,
        conn: ConnId,
        events: &mut dyn StackEvents,
    ) -> Result<(), StackError>;

    fn destroy_conn(&mut self, conn: ConnId, events: &mut dyn StackEvents);

    fn conn_tuple(&self, conn: ConnId) -> Option<FiveTuple>;

    fn conn_record(&self, conn: ConnId) -> Option<RecordId>;

    /// Marks a connection for SOCKS5 proxying. One-shot, before any payload
    /// has been forwarded.
    fn conn_proxy(&mut self, conn: ConnId);

    /// Installs the global DNAT mapping applied to `dnat`-accepted flows.
    fn set_dnat(&mut self, addr: IpAddr, port: u16);

    fn set_socks5(&mut self, addr: IpAddr, port: u16);

    /// Adds the stack's pollable fds to the two sets; returns its max fd,
    /// or -1 when it has none.
    fn collect_fds(&self, read: &mut FdSet, write: &mut FdSet) -> RawFd;

    fn handle_fd(&mut self, read: &FdSet, write: &FdSet, events: &mut dyn StackEvents);

    fn stats(&self) -> StackStats;

    fn purge_expired(&mut self, now_sec: i64, events: &mut dyn StackEvents);

    /// Tears down every connection, invoking
    /// [`StackEvents::connection_closed`] for each.
    fn finalize(&mut self, events: &mut dyn StackEvents);
}

/// Thin wrapper over `libc::fd_set` for `select(2)`.
pub struct FdSet {
    raw: libc::fd_set,
}

impl FdSet {
    pub fn new() -> Self {
        // Safety: fd_set is plain data; FD_ZERO initializes it fully.
        let mut raw = unsafe { std::mem::zeroed::<libc::fd_set>() };
        unsafe { libc::FD_ZERO(&mut raw) };
        Self { raw }
    }

    pub fn insert(&mut self, fd: RawFd) {
        if (0..libc::FD_SETSIZE as RawFd).contains(&fd) {
            unsafe { libc::FD_SET(fd, &mut self.raw) };
        }
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        if !(0..libc::FD_SETSIZE as RawFd).contains(&fd) {
            return false;
        }
        unsafe { libc::FD_ISSET(fd, &self.raw) }
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut libc::fd_set {
        &mut self.raw
    }
}

impl Default for FdSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn tcp_packet(syn: bool, ack: bool) -> PacketView<'static> {
        PacketView {
            tuple: FiveTuple {
                ip_ver: 4,
                ip_proto: 6,
                src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
                dst_ip: IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
                src_port: 40000,
                dst_port: 443,
            },
            raw: &[],
            l7: &[],
            tcp_flags: Some(TcpFlagSummary { syn, ack }),
        }
    }

    #[test]
    fn fresh_syn_is_not_established() {
        assert!(!tcp_packet(true, false).is_established_tcp());
        assert!(tcp_packet(false, true).is_established_tcp());
        assert!(tcp_packet(true, true).is_established_tcp());
        assert!(tcp_packet(false, false).is_established_tcp());
    }

    #[test]
    fn terminal_statuses_order_after_closed() {
        assert!(!ConnStatus::Connected.is_terminal());
        assert!(ConnStatus::Closed.is_terminal());
        assert!(ConnStatus::Reset.is_terminal());
        assert!(ConnStatus::Unreachable.is_terminal());
    }

    #[test]
    fn fd_set_round_trip() {
        let mut set = FdSet::new();
        assert!(!set.contains(5));
        set.insert(5);
        assert!(set.contains(5));
        assert!(!set.contains(6));
        set.insert(-1);
        assert!(!set.contains(-1));
    }
}

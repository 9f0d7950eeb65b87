//! The packet loop: multiplexes the tun fd with the stack's sockets,
//! accounts every packet against its connection, and spreads periodic work
//! (stats, registry drains, PCAP flushes, purges) across ticks.

use crate::config::CaptureConfig;
use crate::conn::{ConnRecord, Records};
use crate::control::CaptureHandle;
use crate::dns::{DnsPolicy, DnsVerdict, DNS_PORT};
use crate::dpi::{self, DpiModule, DpiState};
use crate::host::{app_label, HostEvents, ServiceStatus, VpnStats};
use crate::logger::{self, BreadcrumbFlags};
use crate::lru::HostLru;
use crate::pcap::{CollectorSink, PcapBuffer};
use crate::registry::Registry;
use crate::stack::{
    ConnId, ConnView, Direction, FdSet, FiveTuple, OpenVerdict, PacketView, StackEvents,
    StackStats, TunStack, TunWriteError,
};
use crate::uid::{UidResolver, UID_UNKNOWN};
use anyhow::Context;
use std::io;
use std::net::IpAddr;
use std::os::fd::RawFd;
use std::time::{SystemTime, UNIX_EPOCH};

const CAPTURE_STATS_UPDATE_FREQUENCY_MS: u64 = 300;
const CONNECTION_DUMP_UPDATE_FREQUENCY_MS: u64 = 1000;
const MAX_PCAP_DUMP_DELAY_MS: u64 = 1000;
const PERIODIC_PURGE_TIMEOUT_MS: u64 = 5000;
const SELECT_TIMEOUT_MS: u64 = 500;
const TUN_READ_BUFFER_SIZE: usize = 32 * 1024;

/// Aggregate totals over registered connections.
#[derive(Clone, Copy, Default, Debug)]
struct CaptureStats {
    sent_pkts: u32,
    rcvd_pkts: u32,
    sent_bytes: u64,
    rcvd_bytes: u64,
    new_stats: bool,
    last_update_ms: u64,
}

/// Loop-side state reachable from the stack callbacks. Everything here is
/// owned by the loop thread; the only cross-thread state is the handle.
struct EngineCore {
    tunfd: RawFd,
    config: CaptureConfig,
    handle: CaptureHandle,
    host: Box<dyn HostEvents + Send>,
    dpi: Box<dyn DpiModule + Send>,
    uids: Box<dyn UidResolver + Send>,
    records: Records,
    registry: Registry,
    lru: HostLru,
    policy: DnsPolicy,
    stats: CaptureStats,
    dropped_connections: u32,
    dns_requests: u32,
    incr_id: i32,
    last_conn_blocked: bool,
    now_ms: u64,
    pcap_buffer: Option<PcapBuffer>,
    collector: Option<CollectorSink>,
}

/// One capture session over a tun fd.
pub struct Engine<S: TunStack> {
    stack: S,
    core: EngineCore,
    last_connections_dump_ms: u64,
    next_purge_ms: u64,
}

impl<S: TunStack> Engine<S> {
    pub fn new(
        stack: S,
        tunfd: RawFd,
        config: CaptureConfig,
        handle: CaptureHandle,
        host: Box<dyn HostEvents + Send>,
        dpi: Box<dyn DpiModule + Send>,
        uids: Box<dyn UidResolver + Send>,
    ) -> Self {
        let policy = DnsPolicy::new(config.vpn_dns, config.vpn_dns_v6);
        Self {
            stack,
            core: EngineCore {
                tunfd,
                config,
                handle,
                host,
                dpi,
                uids,
                records: Records::default(),
                registry: Registry::default(),
                lru: HostLru::default(),
                policy,
                stats: CaptureStats::default(),
                dropped_connections: 0,
                dns_requests: 0,
                incr_id: 0,
                last_conn_blocked: false,
                now_ms: 0,
                pcap_buffer: None,
                collector: None,
            },
            last_connections_dump_ms: 0,
            next_purge_ms: 0,
        }
    }

    pub fn handle(&self) -> CaptureHandle {
        self.core.handle.clone()
    }

    /// Runs the packet loop on the calling thread until
    /// [`CaptureHandle::stop`] or a fatal tun error.
    ///
    /// The host must have `SIGPIPE` ignored before starting a capture with
    /// a TCP collector; this crate installs no signal handlers.
    pub fn run(&mut self) -> anyhow::Result<()> {
        self.start()?;

        let mut buf = vec![0u8; TUN_READ_BUFFER_SIZE];
        self.core.now_ms = wall_clock_ms();
        self.last_connections_dump_ms = self.core.now_ms;
        self.next_purge_ms = self.core.now_ms + PERIODIC_PURGE_TIMEOUT_MS;

        while self.core.handle.is_running() {
            let mut read_set = FdSet::new();
            let mut write_set = FdSet::new();
            let mut max_fd = self.stack.collect_fds(&mut read_set, &mut write_set);
            read_set.insert(self.core.tunfd);
            max_fd = max_fd.max(self.core.tunfd);

            let mut timeout = libc::timeval {
                tv_sec: 0,
                tv_usec: (SELECT_TIMEOUT_MS * 1000) as libc::suseconds_t,
            };
            // Safety: both sets live for the duration of the call and the
            // timeout pointer is local.
            let rv = unsafe {
                libc::select(
                    max_fd + 1,
                    read_set.as_mut_ptr(),
                    write_set.as_mut_ptr(),
                    std::ptr::null_mut(),
                    &mut timeout,
                )
            };
            if rv < 0 {
                let error = io::Error::last_os_error();
                if error.raw_os_error() != Some(libc::EINTR) {
                    logger::error(format!("select failed: {error}"));
                }
            }
            if !self.core.handle.is_running() {
                break;
            }
            self.core.now_ms = wall_clock_ms();

            if rv > 0 && read_set.contains(self.core.tunfd) {
                // Safety: buf holds TUN_READ_BUFFER_SIZE writable bytes.
                let size = unsafe {
                    libc::read(self.core.tunfd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
                };
                if size > 0 {
                    self.process_tun_packet(&buf[..size as usize]);
                } else if size < 0 {
                    logger::error(format!(
                        "read(tunfd) returned error: {}",
                        io::Error::last_os_error()
                    ));
                }
            } else if rv > 0 {
                self.stack.handle_fd(&read_set, &write_set, &mut self.core);
            }

            self.housekeeping();
        }

        self.shutdown();
        Ok(())
    }

    fn start(&mut self) -> anyhow::Result<()> {
        set_blocking(self.core.tunfd).context("failed to switch tun fd to blocking mode")?;

        self.core.handle.mark_running(true);
        logger::debug(format!("starting packet loop [tunfd={}]", self.core.tunfd));
        self.core.host.service_status(ServiceStatus::Started);

        if let Some(collector_config) = self.core.config.collector {
            match CollectorSink::connect(&collector_config, self.core.host.as_mut()) {
                Ok(sink) => self.core.collector = Some(sink),
                Err(error) => {
                    logger::error(format!("connection to the PCAP collector failed: {error}"));
                    self.core.handle.stop();
                }
            }
        }
        if self.core.config.pcap_to_host {
            self.core.pcap_buffer = Some(PcapBuffer::new(wall_clock_ms()));
        }

        self.stack
            .set_dnat(IpAddr::V4(self.core.config.dns_server), DNS_PORT);
        if let Some(socks5) = self.core.config.socks5 {
            self.stack
                .set_socks5(IpAddr::V4(socks5.proxy_addr), socks5.proxy_port);
        }
        Ok(())
    }

    fn process_tun_packet(&mut self, buf: &[u8]) {
        let pkt = match self.stack.parse_packet(buf) {
            Ok(pkt) => pkt,
            Err(_) => {
                logger::debug("packet parse failed");
                return;
            }
        };
        self.core.last_conn_blocked = false;

        if pkt.tuple.ip_ver == 6 && !self.core.config.ipv6_enabled {
            logger::debug(format!("ignoring IPv6 packet: {}", pkt.tuple));
            return;
        }

        self.apply_staged_dns_server();

        // Established TCP without a connection means the stack already gave
        // up on the flow; creating it again would only confuse the peer.
        let established = pkt.is_established_tcp();
        let Some(conn) = self.stack.lookup(&pkt, !established, &mut self.core) else {
            if self.core.last_conn_blocked {
                // Policy block, not an error.
            } else if !established {
                self.core.dropped_connections += 1;
                logger::error(format!("connection lookup failed: {}", pkt.tuple));
            } else {
                logger::debug(format!("skipping established TCP: {}", pkt.tuple));
            }
            return;
        };

        if self.core.config.socks5.is_some() {
            self.check_socks5_redirect(&pkt, conn);
        }

        if self.stack.forward(&pkt, conn, &mut self.core).is_err() {
            logger::error(format!("forward failed: {}", pkt.tuple));
            self.core.dropped_connections += 1;
            self.stack.destroy_conn(conn, &mut self.core);
        }
    }

    /// Publishes a DNS server staged through the control surface, ahead of
    /// the next new-connection policy evaluation.
    fn apply_staged_dns_server(&mut self) {
        if let Some(server) = self.core.handle.take_staged_dns_server() {
            self.core.config.dns_server = server;
            self.stack.set_dnat(IpAddr::V4(server), DNS_PORT);
            logger::debug("using new DNS server");
        }
    }

    /// Marks a brand-new TCP flow for SOCKS5 proxying. One-shot: only
    /// before any packet has been accounted.
    fn check_socks5_redirect(&mut self, pkt: &PacketView<'_>, conn: ConnId) {
        if self.core.should_ignore(&pkt.tuple) || pkt.tuple.ip_proto != 6 {
            return;
        }
        let fresh = self
            .stack
            .conn_record(conn)
            .and_then(|id| self.core.records.get(id))
            .map(|record| record.total_pkts() == 0)
            .unwrap_or(false);
        if fresh {
            self.stack.conn_proxy(conn);
        }
    }

    /// Exactly one branch fires per iteration, bounding per-tick wall cost.
    fn housekeeping(&mut self) {
        let now = self.core.now_ms;
        let force_capture_stats = self.core.handle.take_dump_capture_stats();

        if (self.core.stats.new_stats
            && now - self.core.stats.last_update_ms >= CAPTURE_STATS_UPDATE_FREQUENCY_MS)
            || force_capture_stats
        {
            let stack_stats = self.stack.stats();
            self.core.emit_vpn_stats(&stack_stats);
        } else if now - self.last_connections_dump_ms >= CONNECTION_DUMP_UPDATE_FREQUENCY_MS {
            self.core.drain_registry(false);
            self.last_connections_dump_ms = now;
        } else if self.core.pcap_flush_due() {
            self.core.flush_pcap_buffer();
        } else {
            let force_purge = self.core.handle.take_dump_vpn_stats();
            if now >= self.next_purge_ms || force_purge {
                self.stack.purge_expired((now / 1000) as i64, &mut self.core);
                self.next_purge_ms = now + PERIODIC_PURGE_TIMEOUT_MS;
            }
        }
    }

    fn shutdown(&mut self) {
        logger::debug("stopped packet loop");

        // Tears down every connection, queueing final updates.
        self.stack.finalize(&mut self.core);
        self.core.drain_registry(true);

        self.core.collector = None;
        self.core.flush_pcap_buffer();
        self.core.pcap_buffer = None;

        logger::debug(format!("host cache size: {}", self.core.lru.len()));
        self.core.host.service_status(ServiceStatus::Stopped);
        self.core.handle.mark_running(false);
    }
}

impl EngineCore {
    /// Internal diagnostics toward the VPN DNS endpoint on non-53 ports
    /// are processed but withheld from the registry.
    fn should_ignore(&self, tuple: &FiveTuple) -> bool {
        tuple.ip_ver == 4
            && tuple.dst_ip == IpAddr::V4(self.config.vpn_dns)
            && tuple.dst_port != DNS_PORT
    }

    fn resolve_uid(&mut self, tuple: &FiveTuple) -> i32 {
        match self.uids.lookup(tuple) {
            Some(uid) if uid >= 0 => {
                let app = app_label(self.host.as_mut(), uid);
                logger::info(format!("{tuple} [{uid}/{app}]"));
                uid
            }
            _ => {
                logger::warn(format!("{tuple} => UID not found"));
                UID_UNKNOWN
            }
        }
    }

    fn emit_vpn_stats(&mut self, stack_stats: &StackStats) {
        let stats = VpnStats {
            sent_bytes: self.stats.sent_bytes,
            rcvd_bytes: self.stats.rcvd_bytes,
            sent_pkts: self.stats.sent_pkts,
            rcvd_pkts: self.stats.rcvd_pkts,
            dropped_connections: self.dropped_connections,
            open_sockets: stack_stats.open_sockets,
            max_fd: stack_stats.max_fd,
            active_conns: stack_stats.active_connections(),
            total_conns: stack_stats.total_connections(),
            dns_requests: self.dns_requests,
        };
        self.host.stats_dump(&stats);
        self.stats.new_stats = false;
        self.stats.last_update_ms = self.now_ms;
    }

    fn drain_registry(&mut self, free_all: bool) {
        self.registry.drain(
            &mut self.records,
            self.dpi.as_ref(),
            self.host.as_mut(),
            free_all,
        );
    }

    fn pcap_flush_due(&self) -> bool {
        self.pcap_buffer
            .as_ref()
            .map(|buffer| {
                buffer.has_records()
                    && self.now_ms - buffer.last_flush_ms() >= MAX_PCAP_DUMP_DELAY_MS
            })
            .unwrap_or(false)
    }

    fn flush_pcap_buffer(&mut self) {
        let Some(buffer) = &mut self.pcap_buffer else {
            return;
        };
        if !buffer.has_records() {
            return;
        }
        let chunk = buffer.take(self.now_ms);
        logger::breadcrumb(
            BreadcrumbFlags::PCAP,
            format!("exporting a {} B PCAP chunk", chunk.len()),
        );
        self.host.dump_pcap_data(&chunk);
    }

    fn sink_packet(&mut self, packet: &[u8]) {
        if let Some(buffer) = &mut self.pcap_buffer {
            if !buffer.fits(packet.len()) {
                let chunk = buffer.take(self.now_ms);
                logger::breadcrumb(
                    BreadcrumbFlags::PCAP,
                    format!("exporting a {} B PCAP chunk", chunk.len()),
                );
                self.host.dump_pcap_data(&chunk);
            }
            if buffer.fits(packet.len()) {
                buffer.append(self.now_ms, packet);
            } else {
                logger::error(format!(
                    "PCAP record larger than the dump buffer, dropping ({} B)",
                    packet.len()
                ));
            }
        }
        if let Some(collector) = &mut self.collector {
            collector.dump(self.now_ms, packet);
        }
    }
}

impl StackEvents for EngineCore {
    fn packet_to_tun(&mut self, packet: &[u8], tuple: &FiveTuple) -> Result<(), TunWriteError> {
        if !self.handle.is_running() {
            return Ok(());
        }
        // Safety: packet is a live slice for the duration of the call.
        let rv = unsafe {
            libc::write(
                self.tunfd,
                packet.as_ptr() as *const libc::c_void,
                packet.len(),
            )
        };
        if rv < 0 {
            let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return match errno {
                // The stack tears the affected connection down; the loop
                // itself survives.
                libc::ENOBUFS => {
                    logger::error(format!("got ENOBUFS writing {tuple}"));
                    Err(TunWriteError::Congested)
                }
                libc::EIO => {
                    logger::info("got tun I/O error (terminating?)");
                    self.handle.stop();
                    Err(TunWriteError::Closed)
                }
                other => {
                    logger::error(format!(
                        "tun write ({}) failed [{other}]",
                        packet.len()
                    ));
                    self.handle.stop();
                    Err(TunWriteError::Io(other))
                }
            };
        }
        let written = rv as usize;
        if written != packet.len() {
            logger::error(format!("partial tun write ({written} / {})", packet.len()));
            self.handle.stop();
            return Err(TunWriteError::Short {
                written,
                length: packet.len(),
            });
        }
        Ok(())
    }

    fn account_packet(&mut self, packet: &[u8], direction: Direction, conn: ConnView<'_>) {
        let Some(record_id) = conn.record else {
            logger::error("missing user data in connection");
            return;
        };
        let ignored = self.should_ignore(conn.tuple);
        let mut queue_update = false;
        {
            let Some(record) = self.records.get_mut(record_id) else {
                logger::error("missing user data in connection");
                return;
            };
            match direction {
                Direction::FromTun => {
                    record.sent_pkts += 1;
                    record.sent_bytes += packet.len() as u64;
                }
                Direction::FromNet => {
                    record.rcvd_pkts += 1;
                    record.rcvd_bytes += packet.len() as u64;
                }
            }
            record.last_seen = (self.now_ms / 1000) as i64;
            record.status = conn.status;

            // Classification also runs for ignored flows.
            if let DpiState::Active(_) = record.dpi {
                dpi::feed_packet(
                    self.dpi.as_mut(),
                    record,
                    packet,
                    direction == Direction::FromTun,
                    &mut self.lru,
                );
            }

            if ignored {
                return;
            }
            if !record.pending_notification {
                record.pending_notification = true;
                queue_update = true;
            }
        }
        if queue_update {
            self.registry.push_update(*conn.tuple, record_id);
        }

        match direction {
            Direction::FromTun => {
                self.stats.sent_pkts += 1;
                self.stats.sent_bytes += packet.len() as u64;
            }
            Direction::FromNet => {
                self.stats.rcvd_pkts += 1;
                self.stats.rcvd_bytes += packet.len() as u64;
            }
        }
        self.stats.new_stats = true;

        self.sink_packet(packet);
    }

    fn socket_opened(&mut self, fd: RawFd) {
        if !self.host.protect_socket(fd) {
            logger::error("socket protect failed");
        }
    }

    fn connection_opened(&mut self, conn: ConnView<'_>, l7: &[u8]) -> OpenVerdict {
        let tuple = conn.tuple;
        let mut dnat = false;
        match self.policy.evaluate(tuple, l7) {
            DnsVerdict::Deny => {
                self.last_conn_blocked = true;
                return OpenVerdict::Reject;
            }
            DnsVerdict::AllowQuery { dnat: rewrite } => {
                self.dns_requests += 1;
                dnat = rewrite;
            }
            DnsVerdict::Allow => {}
        }

        let handles = match self.dpi.alloc_flow() {
            Ok(handles) => handles,
            Err(error) => {
                logger::error(format!("dpi allocation failed for {tuple}: {error}"));
                return OpenVerdict::Reject;
            }
        };

        let mut record = ConnRecord::new((self.now_ms / 1000) as i64, DpiState::Active(handles));
        record.uid = self.resolve_uid(tuple);
        record.info = self.lru.find(tuple.dst_ip);
        if let Some(name) = &record.info {
            logger::breadcrumb(
                BreadcrumbFlags::DNS,
                format!("host cache HIT: {} -> {name}", tuple.dst_ip),
            );
        }

        let ignored = self.should_ignore(tuple);
        if !ignored {
            // Only registered connections consume sequence numbers; the
            // host-side register does not allow gaps.
            record.incr_id = self.incr_id;
            self.incr_id += 1;
            record.pending_notification = true;
        }
        let record_id = self.records.insert(record);
        if !ignored {
            self.registry.push_new(*tuple, record_id);
        }

        OpenVerdict::Accept {
            record: record_id,
            dnat,
        }
    }

    fn connection_closed(&mut self, conn: ConnView<'_>) {
        let Some(record_id) = conn.record else {
            logger::error("missing user data in connection");
            return;
        };
        let ignored = self.should_ignore(conn.tuple);
        let mut queue_update = false;
        {
            let Some(record) = self.records.get_mut(record_id) else {
                logger::error("missing user data in connection");
                return;
            };
            dpi::finalize_detection(self.dpi.as_mut(), record, &mut self.lru);
            record.status = conn.status;

            if !record.pending_notification && !ignored {
                record.pending_notification = true;
                queue_update = true;
            }
        }
        if queue_update {
            self.registry.push_update(*conn.tuple, record_id);
        }
    }
}

fn wall_clock_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

fn set_blocking(fd: RawFd) -> io::Result<()> {
    // Safety: plain fcntl on a caller-owned fd.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

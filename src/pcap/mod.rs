//! PCAP emission: the in-memory ring handed to the host in chunks, and the
//! optional UDP/TCP collector socket.

use crate::config::CollectorConfig;
use crate::host::HostEvents;
use crate::logger::{self, BreadcrumbFlags};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Write as _};
use std::net::{SocketAddr, SocketAddrV4, TcpStream, UdpSocket};
use std::os::fd::AsRawFd;

pub const PCAP_BUFFER_SIZE: usize = 512 * 1024;

pub(crate) const GLOBAL_HEADER_LEN: usize = 24;
pub(crate) const RECORD_HEADER_LEN: usize = 16;

const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
const PCAP_VERSION_MAJOR: u16 = 2;
const PCAP_VERSION_MINOR: u16 = 4;
const PCAP_SNAPLEN: u32 = 65_535;
// Raw IP packets straight off the tun.
const LINKTYPE_RAW: u32 = 101;

pub(crate) fn global_header() -> [u8; GLOBAL_HEADER_LEN] {
    let mut header = [0u8; GLOBAL_HEADER_LEN];
    header[0..4].copy_from_slice(&PCAP_MAGIC.to_le_bytes());
    header[4..6].copy_from_slice(&PCAP_VERSION_MAJOR.to_le_bytes());
    header[6..8].copy_from_slice(&PCAP_VERSION_MINOR.to_le_bytes());
    // thiszone and sigfigs stay zero.
    header[16..20].copy_from_slice(&PCAP_SNAPLEN.to_le_bytes());
    header[20..24].copy_from_slice(&LINKTYPE_RAW.to_le_bytes());
    header
}

pub(crate) fn record_header(now_ms: u64, incl_len: u32, orig_len: u32) -> [u8; RECORD_HEADER_LEN] {
    let ts_sec = (now_ms / 1000) as u32;
    let ts_usec = ((now_ms % 1000) * 1000) as u32;
    let mut header = [0u8; RECORD_HEADER_LEN];
    header[0..4].copy_from_slice(&ts_sec.to_le_bytes());
    header[4..8].copy_from_slice(&ts_usec.to_le_bytes());
    header[8..12].copy_from_slice(&incl_len.to_le_bytes());
    header[12..16].copy_from_slice(&orig_len.to_le_bytes());
    header
}

/// Fixed-size linear buffer of PCAP data. The global header occupies the
/// first bytes of the first chunk only.
pub(crate) struct PcapBuffer {
    buf: Vec<u8>,
    record_bytes: usize,
    last_flush_ms: u64,
}

impl PcapBuffer {
    pub fn new(now_ms: u64) -> Self {
        let mut buf = Vec::with_capacity(PCAP_BUFFER_SIZE);
        buf.extend_from_slice(&global_header());
        Self {
            buf,
            record_bytes: 0,
            last_flush_ms: now_ms,
        }
    }

    /// Whether one more record of `packet_len` payload bytes fits.
    pub fn fits(&self, packet_len: usize) -> bool {
        PCAP_BUFFER_SIZE - self.buf.len() > RECORD_HEADER_LEN + packet_len
    }

    /// Appends one record; the caller checks `fits` first.
    pub fn append(&mut self, now_ms: u64, packet: &[u8]) {
        let incl_len = packet.len().min(PCAP_SNAPLEN as usize);
        self.buf
            .extend_from_slice(&record_header(now_ms, incl_len as u32, packet.len() as u32));
        self.buf.extend_from_slice(&packet[..incl_len]);
        self.record_bytes += RECORD_HEADER_LEN + incl_len;
    }

    /// True when at least one record is buffered.
    pub fn has_records(&self) -> bool {
        self.record_bytes > 0
    }

    pub fn last_flush_ms(&self) -> u64 {
        self.last_flush_ms
    }

    /// Takes the buffered chunk and resets the cursor.
    pub fn take(&mut self, now_ms: u64) -> Vec<u8> {
        let chunk = std::mem::replace(&mut self.buf, Vec::with_capacity(PCAP_BUFFER_SIZE));
        self.record_bytes = 0;
        self.last_flush_ms = now_ms;
        chunk
    }
}

enum CollectorSocket {
    Udp(UdpSocket),
    Tcp(TcpStream),
}

/// Best-effort PCAP stream to an external collector. The socket is handed
/// to the host for protection before it touches the network, so its own
/// traffic never loops through the tun.
pub(crate) struct CollectorSink {
    socket: CollectorSocket,
    dest: SocketAddrV4,
    header_sent: bool,
}

impl CollectorSink {
    pub fn connect(config: &CollectorConfig, host: &mut dyn HostEvents) -> io::Result<Self> {
        let dest = SocketAddrV4::new(config.addr, config.port);
        let socket = if config.tcp {
            let raw = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
            protect(&raw, host);
            raw.connect(&SocketAddr::V4(dest).into())?;
            CollectorSocket::Tcp(raw.into())
        } else {
            let raw = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
            protect(&raw, host);
            raw.bind(&SocketAddr::V4(SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, 0)).into())?;
            CollectorSocket::Udp(raw.into())
        };
        Ok(Self {
            socket,
            dest,
            header_sent: false,
        })
    }

    /// Emits one record (preceded by the global header on first use).
    /// Send failures are logged and swallowed.
    pub fn dump(&mut self, now_ms: u64, packet: &[u8]) {
        if !self.header_sent {
            self.header_sent = true;
            self.send(&global_header());
        }
        let incl_len = packet.len().min(PCAP_SNAPLEN as usize);
        let mut record = Vec::with_capacity(RECORD_HEADER_LEN + incl_len);
        record.extend_from_slice(&record_header(now_ms, incl_len as u32, packet.len() as u32));
        record.extend_from_slice(&packet[..incl_len]);
        self.send(&record);
    }

    fn send(&mut self, bytes: &[u8]) {
        let result = match &mut self.socket {
            CollectorSocket::Udp(socket) => socket.send_to(bytes, self.dest).map(|_| ()),
            CollectorSocket::Tcp(stream) => stream.write_all(bytes),
        };
        if let Err(error) = result {
            logger::warn(format!("collector send failed: {error}"));
        } else {
            logger::breadcrumb(
                BreadcrumbFlags::PCAP,
                format!("collector sent {} B", bytes.len()),
            );
        }
    }
}

fn protect(socket: &Socket, host: &mut dyn HostEvents) {
    if !host.protect_socket(socket.as_raw_fd()) {
        logger::error("socket protect failed");
    }
}

#[cfg(test)]
mod tests;

use super::*;
use crate::host::{ConnectionDescriptor, ServiceStatus, VpnStats};
use std::net::Ipv4Addr;
use std::os::fd::RawFd;
use std::time::Duration;

#[test]
fn global_header_layout() {
    let header = global_header();
    assert_eq!(&header[0..4], &0xa1b2_c3d4u32.to_le_bytes());
    assert_eq!(u16::from_le_bytes([header[4], header[5]]), 2);
    assert_eq!(u16::from_le_bytes([header[6], header[7]]), 4);
    assert_eq!(
        u32::from_le_bytes([header[16], header[17], header[18], header[19]]),
        65_535
    );
    assert_eq!(
        u32::from_le_bytes([header[20], header[21], header[22], header[23]]),
        101
    );
}

#[test]
fn record_header_splits_timestamp() {
    let header = record_header(1_500_250, 60, 1500);
    assert_eq!(
        u32::from_le_bytes([header[0], header[1], header[2], header[3]]),
        1500
    );
    assert_eq!(
        u32::from_le_bytes([header[4], header[5], header[6], header[7]]),
        250_000
    );
    assert_eq!(
        u32::from_le_bytes([header[8], header[9], header[10], header[11]]),
        60
    );
    assert_eq!(
        u32::from_le_bytes([header[12], header[13], header[14], header[15]]),
        1500
    );
}

#[test]
fn buffer_fills_then_flushes_at_the_expected_record() {
    let packet = [0u8; 1500];
    let per_record = RECORD_HEADER_LEN + packet.len();
    let expected = (PCAP_BUFFER_SIZE - GLOBAL_HEADER_LEN - 1) / per_record;

    let mut buffer = PcapBuffer::new(0);
    let mut appended = 0;
    while buffer.fits(packet.len()) {
        buffer.append(0, &packet);
        appended += 1;
    }
    assert_eq!(appended, expected);

    let chunk = buffer.take(1000);
    assert_eq!(chunk.len(), GLOBAL_HEADER_LEN + expected * per_record);
    assert!(!buffer.has_records());
    assert_eq!(buffer.last_flush_ms(), 1000);

    // The cursor reset; the next chunk carries records only.
    assert!(buffer.fits(packet.len()));
    buffer.append(1000, &packet);
    assert_eq!(buffer.take(2000).len(), per_record);
}

#[test]
fn first_chunk_starts_with_the_global_header() {
    let mut buffer = PcapBuffer::new(0);
    buffer.append(5, &[1, 2, 3]);
    let chunk = buffer.take(5);
    assert_eq!(&chunk[..GLOBAL_HEADER_LEN], &global_header());
    assert_eq!(chunk.len(), GLOBAL_HEADER_LEN + RECORD_HEADER_LEN + 3);
}

struct ProtectingHost {
    protected: Vec<RawFd>,
}

impl HostEvents for ProtectingHost {
    fn application_by_uid(&mut self, _uid: i32) -> Option<String> {
        None
    }

    fn protect_socket(&mut self, fd: RawFd) -> bool {
        self.protected.push(fd);
        true
    }

    fn dump_pcap_data(&mut self, _data: &[u8]) {}

    fn connections_dump(
        &mut self,
        _new_conns: &[ConnectionDescriptor],
        _updates: &[ConnectionDescriptor],
    ) {
    }

    fn stats_dump(&mut self, _stats: &VpnStats) {}

    fn service_status(&mut self, _status: ServiceStatus) {}
}

#[test]
fn udp_collector_emits_header_then_records() {
    let receiver = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    receiver
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let port = receiver.local_addr().unwrap().port();

    let config = CollectorConfig {
        addr: Ipv4Addr::LOCALHOST,
        port,
        tcp: false,
    };
    let mut host = ProtectingHost { protected: vec![] };
    let mut sink = CollectorSink::connect(&config, &mut host).unwrap();
    assert_eq!(host.protected.len(), 1);

    sink.dump(1234, &[0xAB; 40]);
    sink.dump(1235, &[0xCD; 20]);

    let mut buf = [0u8; 2048];
    let first = receiver.recv(&mut buf).unwrap();
    assert_eq!(first, GLOBAL_HEADER_LEN);
    assert_eq!(&buf[..4], &0xa1b2_c3d4u32.to_le_bytes());

    let second = receiver.recv(&mut buf).unwrap();
    assert_eq!(second, RECORD_HEADER_LEN + 40);

    let third = receiver.recv(&mut buf).unwrap();
    assert_eq!(third, RECORD_HEADER_LEN + 20);
}

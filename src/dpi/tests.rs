use super::*;
use crate::conn::ConnRecord;
use std::net::{Ipv4Addr, Ipv6Addr};

#[derive(Default)]
struct MockDpi {
    detect: L7Proto,
    guess: L7Proto,
    extra_possible: bool,
    meta: FlowMetadata,
    processed: Vec<(EndpointId, EndpointId)>,
    gave_up: Vec<FlowId>,
    freed: Vec<FlowId>,
}

impl DpiModule for MockDpi {
    fn alloc_flow(&mut self) -> Result<DpiFlow, DpiError> {
        Ok(DpiFlow {
            flow: FlowId(1),
            src_id: EndpointId(10),
            dst_id: EndpointId(20),
        })
    }

    fn process_packet(
        &mut self,
        _flow: FlowId,
        _packet: &[u8],
        _ts: i64,
        src_id: EndpointId,
        dst_id: EndpointId,
    ) -> L7Proto {
        self.processed.push((src_id, dst_id));
        self.detect
    }

    fn giveup(&mut self, flow: FlowId) -> L7Proto {
        self.gave_up.push(flow);
        self.guess
    }

    fn extra_dissection_possible(&self, _flow: FlowId) -> bool {
        self.extra_possible
    }

    fn metadata(&self, _flow: FlowId) -> FlowMetadata {
        self.meta.clone()
    }

    fn free_flow(&mut self, flow: FlowId) {
        self.freed.push(flow);
    }

    fn proto_name(&self, proto: u16) -> String {
        match proto {
            proto::DNS => "DNS".to_string(),
            proto::HTTP => "HTTP".to_string(),
            proto::TLS => "TLS".to_string(),
            other => format!("proto-{other}"),
        }
    }

    fn is_master_proto(&self, proto: u16) -> bool {
        matches!(proto, proto::DNS | proto::HTTP | proto::TLS)
    }
}

fn active_record(pkts: u32) -> (ConnRecord, DpiFlow) {
    let mut module = MockDpi::default();
    let handles = module.alloc_flow().unwrap();
    let mut record = ConnRecord::new(1000, DpiState::Active(handles));
    record.sent_pkts = pkts;
    (record, handles)
}

#[test]
fn endpoint_ids_swap_on_ingress() {
    let mut module = MockDpi {
        extra_possible: true,
        ..Default::default()
    };
    let (mut record, _) = active_record(1);
    let mut lru = HostLru::default();

    feed_packet(&mut module, &mut record, &[0u8; 16], true, &mut lru);
    record.rcvd_pkts = 1;
    feed_packet(&mut module, &mut record, &[0u8; 16], false, &mut lru);

    assert_eq!(
        module.processed,
        vec![
            (EndpointId(10), EndpointId(20)),
            (EndpointId(20), EndpointId(10)),
        ]
    );
}

#[test]
fn budget_exhaustion_forces_giveup() {
    let mut module = MockDpi {
        extra_possible: true,
        guess: L7Proto { app: 42, master: 0 },
        ..Default::default()
    };
    let (mut record, handles) = active_record(MAX_DPI_PACKETS);
    let mut lru = HostLru::default();

    feed_packet(&mut module, &mut record, &[0u8; 16], true, &mut lru);

    assert_eq!(module.gave_up, vec![handles.flow]);
    assert_eq!(module.freed, vec![handles.flow]);
    assert_eq!(record.dpi, DpiState::Finished);
    // Master falls back to the guessed app protocol.
    assert_eq!(record.l7, L7Proto { app: 42, master: 42 });
}

#[test]
fn early_finalize_when_detection_settles() {
    let mut module = MockDpi {
        detect: L7Proto {
            app: proto::TLS,
            master: proto::TLS,
        },
        extra_possible: false,
        meta: FlowMetadata {
            sni: Some("site.example".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    let (mut record, _) = active_record(1);
    let mut lru = HostLru::default();

    feed_packet(&mut module, &mut record, &[0u8; 16], true, &mut lru);

    assert!(module.gave_up.is_empty());
    assert_eq!(record.dpi, DpiState::Finished);
    assert_eq!(record.info.as_deref(), Some("site.example"));
}

#[test]
fn finished_records_ignore_further_packets() {
    let mut module = MockDpi::default();
    let mut record = ConnRecord::new(1000, DpiState::Finished);
    record.sent_pkts = 1;
    let mut lru = HostLru::default();

    feed_packet(&mut module, &mut record, &[0u8; 16], true, &mut lru);
    assert!(module.processed.is_empty());
}

#[test]
fn dns_answer_feeds_host_cache() {
    let addr = IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34));
    let mut module = MockDpi {
        guess: L7Proto {
            app: proto::DNS,
            master: proto::DNS,
        },
        meta: FlowMetadata {
            host_server_name: Some("example.com".to_string()),
            dns_answer: Some(DnsAnswer {
                rsp_type: 0x0001,
                addr,
            }),
            ..Default::default()
        },
        ..Default::default()
    };
    let (mut record, _) = active_record(1);
    let mut lru = HostLru::default();

    finalize_detection(&mut module, &mut record, &mut lru);

    assert_eq!(record.info.as_deref(), Some("example.com"));
    assert_eq!(lru.find(addr).as_deref(), Some("example.com"));
}

#[test]
fn dotless_names_never_enter_the_cache() {
    let addr = IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34));
    let mut module = MockDpi {
        guess: L7Proto {
            app: proto::DNS,
            master: proto::DNS,
        },
        meta: FlowMetadata {
            host_server_name: Some("localhost".to_string()),
            dns_answer: Some(DnsAnswer {
                rsp_type: 0x0001,
                addr,
            }),
            ..Default::default()
        },
        ..Default::default()
    };
    let (mut record, _) = active_record(1);
    let mut lru = HostLru::default();

    finalize_detection(&mut module, &mut record, &mut lru);

    assert_eq!(record.info.as_deref(), Some("localhost"));
    assert!(lru.find(addr).is_none());
}

#[test]
fn only_global_unicast_aaaa_answers_are_cached() {
    let global = IpAddr::V6("2606:2800:220:1::1".parse::<Ipv6Addr>().unwrap());
    let link_local = IpAddr::V6("fe80::1".parse::<Ipv6Addr>().unwrap());

    for (addr, cached) in [(global, true), (link_local, false)] {
        let mut module = MockDpi {
            guess: L7Proto {
                app: proto::DNS,
                master: proto::DNS,
            },
            meta: FlowMetadata {
                host_server_name: Some("v6.example.com".to_string()),
                dns_answer: Some(DnsAnswer {
                    rsp_type: 0x001c,
                    addr,
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        let (mut record, _) = active_record(1);
        let mut lru = HostLru::default();

        finalize_detection(&mut module, &mut record, &mut lru);
        assert_eq!(lru.find(addr).is_some(), cached, "addr {addr}");
    }
}

#[test]
fn http_metadata_sets_host_and_url() {
    let mut module = MockDpi {
        guess: L7Proto {
            app: proto::HTTP,
            master: proto::HTTP,
        },
        meta: FlowMetadata {
            host_server_name: Some("www.example.com".to_string()),
            http_url: Some("www.example.com/index.html".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    let (mut record, _) = active_record(1);
    let mut lru = HostLru::default();

    finalize_detection(&mut module, &mut record, &mut lru);

    assert_eq!(record.info.as_deref(), Some("www.example.com"));
    assert_eq!(record.url.as_deref(), Some("www.example.com/index.html"));
}

#[test]
fn proto_label_falls_back_to_transport() {
    let module = MockDpi::default();
    assert_eq!(
        proto_label(&module, L7Proto { app: 0, master: 0 }, 6),
        "TCP"
    );
    assert_eq!(
        proto_label(
            &module,
            L7Proto {
                app: proto::DNS,
                master: proto::DNS,
            },
            17
        ),
        "DNS"
    );
    // Known to the module but not displayable as a carrier.
    assert_eq!(
        proto_label(&module, L7Proto { app: 99, master: 99 }, 17),
        "UDP"
    );
}

//! Drives the deep-packet-inspection library on behalf of connection
//! records: feeds packets until detection settles or the packet budget runs
//! out, then extracts protocol metadata and releases the library handles.

use crate::conn::ConnRecord;
use crate::logger::{self, BreadcrumbFlags};
use crate::lru::HostLru;
use crate::stack::transport_label;
use std::net::IpAddr;
use thiserror::Error;

/// Packets fed to the library per connection, across both directions.
pub const MAX_DPI_PACKETS: u32 = 12;

const MAX_META_LEN: usize = 256;

const DNS_TYPE_A: u16 = 0x0001;
const DNS_TYPE_AAAA: u16 = 0x001c;

/// Protocol ids fixed by the module contract.
pub mod proto {
    pub const UNKNOWN: u16 = 0;
    pub const DNS: u16 = 5;
    pub const HTTP: u16 = 7;
    pub const TLS: u16 = 91;
}

/// Classification result: application protocol and the carrier it runs over.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct L7Proto {
    pub app: u16,
    pub master: u16,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FlowId(pub u64);

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct EndpointId(pub u64);

/// Library handles backing one connection's detection.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DpiFlow {
    pub flow: FlowId,
    pub src_id: EndpointId,
    pub dst_id: EndpointId,
}

/// Detection lifecycle of a record. `Finished` records keep accumulating
/// counters but no longer hold library handles.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DpiState {
    Active(DpiFlow),
    Finished,
}

/// DNS answer parsed by the library from a response.
#[derive(Clone, Copy, Debug)]
pub struct DnsAnswer {
    pub rsp_type: u16,
    pub addr: IpAddr,
}

/// Protocol-specific fields available once dissection settles.
#[derive(Clone, Default, Debug)]
pub struct FlowMetadata {
    pub host_server_name: Option<String>,
    pub dns_answer: Option<DnsAnswer>,
    pub http_url: Option<String>,
    /// TLS client-requested server name.
    pub sni: Option<String>,
}

#[derive(Debug, Error)]
pub enum DpiError {
    #[error("dpi flow allocation failed")]
    AllocFailed,
}

/// The inspection library, treated as a black box.
pub trait DpiModule {
    /// Allocates a flow and its two per-direction endpoint ids.
    fn alloc_flow(&mut self) -> Result<DpiFlow, DpiError>;

    fn process_packet(
        &mut self,
        flow: FlowId,
        packet: &[u8],
        ts: i64,
        src_id: EndpointId,
        dst_id: EndpointId,
    ) -> L7Proto;

    /// Final "guess from what was seen" classification.
    fn giveup(&mut self, flow: FlowId) -> L7Proto;

    fn extra_dissection_possible(&self, flow: FlowId) -> bool;

    fn metadata(&self, flow: FlowId) -> FlowMetadata;

    /// Releases the flow and its endpoint ids.
    fn free_flow(&mut self, flow: FlowId);

    fn proto_name(&self, proto: u16) -> String;

    /// Whether `proto` is a carrier protocol worth displaying on its own.
    fn is_master_proto(&self, proto: u16) -> bool;
}

/// Feeds one accounted packet into detection. Counters on `record` must
/// already include this packet. The endpoint ids are swapped on ingress so
/// the library sees consistent per-direction state.
pub(crate) fn feed_packet(
    module: &mut dyn DpiModule,
    record: &mut ConnRecord,
    packet: &[u8],
    from_tun: bool,
    lru: &mut HostLru,
) {
    let DpiState::Active(handles) = record.dpi else {
        return;
    };
    let budget_spent = record.total_pkts() >= MAX_DPI_PACKETS;

    let (src_id, dst_id) = if from_tun {
        (handles.src_id, handles.dst_id)
    } else {
        (handles.dst_id, handles.src_id)
    };
    record.l7 = module.process_packet(handles.flow, packet, record.last_seen, src_id, dst_id);

    if budget_spent
        || (record.l7.app != proto::UNKNOWN && !module.extra_dissection_possible(handles.flow))
    {
        finalize_detection(module, record, lru);
    }
}

/// Completes detection: guesses if still unknown, extracts DNS/HTTP/TLS
/// metadata, then frees the library handles.
pub(crate) fn finalize_detection(
    module: &mut dyn DpiModule,
    record: &mut ConnRecord,
    lru: &mut HostLru,
) {
    let DpiState::Active(handles) = record.dpi else {
        return;
    };

    if record.l7.app == proto::UNKNOWN {
        record.l7 = module.giveup(handles.flow);
    }
    if record.l7.master == 0 {
        record.l7.master = record.l7.app;
    }

    logger::breadcrumb(
        BreadcrumbFlags::DPI,
        format!(
            "detection completed -> app={}, master={}",
            record.l7.app, record.l7.master
        ),
    );

    let meta = module.metadata(handles.flow);
    match record.l7.master {
        proto::DNS => {
            if let Some(name) = meta.host_server_name {
                let name = clip(name);
                // Names without a dot are not real domains; skip the cache.
                if name.contains('.') {
                    if let Some(answer) = meta.dns_answer {
                        if answer_is_cacheable(&answer) {
                            logger::breadcrumb(
                                BreadcrumbFlags::DNS,
                                format!("host cache ADD: {} -> {}", answer.addr, name),
                            );
                            lru.add(answer.addr, &name);
                        }
                    }
                }
                record.info = Some(name);
            }
        }
        proto::HTTP => {
            if let Some(name) = meta.host_server_name {
                record.info = Some(clip(name));
            }
            if let Some(url) = meta.http_url {
                record.url = Some(clip(url));
            }
        }
        proto::TLS => {
            if let Some(sni) = meta.sni {
                record.info = Some(clip(sni));
            }
        }
        _ => {}
    }

    module.free_flow(handles.flow);
    record.dpi = DpiState::Finished;
}

/// Display protocol for a record: the master protocol when the module knows
/// it as a displayable carrier, the transport name otherwise.
pub fn proto_label(module: &dyn DpiModule, l7: L7Proto, ip_proto: u8) -> String {
    if l7.master == proto::UNKNOWN || !module.is_master_proto(l7.master) {
        transport_label(ip_proto)
    } else {
        module.proto_name(l7.master)
    }
}

fn answer_is_cacheable(answer: &DnsAnswer) -> bool {
    match answer.addr {
        IpAddr::V4(v4) => answer.rsp_type == DNS_TYPE_A && !v4.is_unspecified(),
        // AAAA answers only when globally routable unicast.
        IpAddr::V6(v6) => answer.rsp_type == DNS_TYPE_AAAA && (v6.octets()[0] & 0xE0) == 0x20,
    }
}

fn clip(value: String) -> String {
    if value.len() <= MAX_META_LEN {
        return value;
    }
    let mut end = MAX_META_LEN;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}

#[cfg(test)]
mod tests;

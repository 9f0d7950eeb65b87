//! Pending-notification batches drained to the host on a timer.

use crate::conn::{ConnRecord, RecordId, Records};
use crate::dpi::{proto_label, DpiModule};
use crate::host::{ConnectionDescriptor, HostEvents};
use crate::logger::{self, BreadcrumbFlags};
use crate::stack::FiveTuple;
use smallvec::SmallVec;

pub(crate) struct PendingConn {
    pub tuple: FiveTuple,
    pub record: RecordId,
}

type Batch = SmallVec<[PendingConn; 8]>;

/// Two append-only batches; a record sits in at most one of them between
/// drains, guarded by its `pending_notification` bit.
#[derive(Default)]
pub(crate) struct Registry {
    new_conns: Batch,
    conns_updates: Batch,
}

impl Registry {
    pub fn push_new(&mut self, tuple: FiveTuple, record: RecordId) {
        self.new_conns.push(PendingConn { tuple, record });
    }

    pub fn push_update(&mut self, tuple: FiveTuple, record: RecordId) {
        self.conns_updates.push(PendingConn { tuple, record });
    }

    pub fn is_empty(&self) -> bool {
        self.new_conns.is_empty() && self.conns_updates.is_empty()
    }

    /// Hands both batches to the host as one call, clearing the dirty bit
    /// on every entry beforehand, then reaps closed records. With
    /// `free_all` every record in the arena is dropped afterwards,
    /// whatever its status.
    pub fn drain(
        &mut self,
        records: &mut Records,
        module: &dyn DpiModule,
        host: &mut dyn HostEvents,
        free_all: bool,
    ) {
        if self.is_empty() && !free_all {
            return;
        }

        let new_conns = std::mem::take(&mut self.new_conns);
        let conns_updates = std::mem::take(&mut self.conns_updates);

        logger::breadcrumb(
            BreadcrumbFlags::CONN,
            format!(
                "connections dump: new={}, updates={}",
                new_conns.len(),
                conns_updates.len()
            ),
        );

        let new_descriptors = build_batch(&new_conns, records, module);
        let update_descriptors = build_batch(&conns_updates, records, module);

        if !new_descriptors.is_empty() || !update_descriptors.is_empty() {
            host.connections_dump(&new_descriptors, &update_descriptors);
        }

        if free_all {
            records.clear();
            return;
        }
        for entry in new_conns.iter().chain(conns_updates.iter()) {
            let closed = records
                .get(entry.record)
                .map(|record| record.status.is_terminal())
                .unwrap_or(false);
            if closed {
                records.remove(entry.record);
            }
        }
    }
}

fn build_batch(
    batch: &Batch,
    records: &mut Records,
    module: &dyn DpiModule,
) -> Vec<ConnectionDescriptor> {
    let mut descriptors = Vec::with_capacity(batch.len());
    for entry in batch {
        let Some(record) = records.get_mut(entry.record) else {
            logger::error(format!("missing record for pending {}", entry.tuple));
            continue;
        };
        record.pending_notification = false;
        descriptors.push(build_descriptor(&entry.tuple, record, module));
    }
    descriptors
}

fn build_descriptor(
    tuple: &FiveTuple,
    record: &ConnRecord,
    module: &dyn DpiModule,
) -> ConnectionDescriptor {
    ConnectionDescriptor {
        src_ip: tuple.src_ip.to_string(),
        dst_ip: tuple.dst_ip.to_string(),
        info: record.info.clone().unwrap_or_default(),
        url: record.url.clone().unwrap_or_default(),
        l7_proto: proto_label(module, record.l7, tuple.ip_proto),
        status: record.status.code(),
        ip_ver: tuple.ip_ver,
        ip_proto: tuple.ip_proto,
        src_port: tuple.src_port,
        dst_port: tuple.dst_port,
        first_seen: record.first_seen,
        last_seen: record.last_seen,
        sent_bytes: record.sent_bytes,
        rcvd_bytes: record.rcvd_bytes,
        sent_pkts: record.sent_pkts,
        rcvd_pkts: record.rcvd_pkts,
        uid: record.uid,
        incr_id: record.incr_id,
    }
}

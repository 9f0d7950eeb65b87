//! Per-connection state attached to stack connections through the record
//! arena.

use crate::dpi::{DpiState, L7Proto};
use crate::stack::ConnStatus;
use crate::uid::UID_UNKNOWN;
use rustc_hash::FxHashMap;

/// Stable arena key held by the stack as connection userdata.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct RecordId(pub u64);

/// Engine-side state for one flow. Counters are monotonic; timestamps are
/// seconds since the epoch.
pub struct ConnRecord {
    pub sent_pkts: u32,
    pub rcvd_pkts: u32,
    pub sent_bytes: u64,
    pub rcvd_bytes: u64,
    pub first_seen: i64,
    pub last_seen: i64,
    pub status: ConnStatus,
    pub uid: i32,
    /// Gap-free sequence number, assigned only to registered connections.
    pub incr_id: i32,
    /// Set while the record sits in exactly one pending registry batch.
    pub pending_notification: bool,
    pub l7: L7Proto,
    pub dpi: DpiState,
    /// Learned hostname (DNS answer, HTTP host, or TLS SNI).
    pub info: Option<String>,
    /// HTTP request URL, when classified as HTTP.
    pub url: Option<String>,
}

impl ConnRecord {
    pub fn new(now_sec: i64, dpi: DpiState) -> Self {
        Self {
            sent_pkts: 0,
            rcvd_pkts: 0,
            sent_bytes: 0,
            rcvd_bytes: 0,
            first_seen: now_sec,
            last_seen: now_sec,
            status: ConnStatus::New,
            uid: UID_UNKNOWN,
            incr_id: 0,
            pending_notification: false,
            l7: L7Proto::default(),
            dpi,
            info: None,
            url: None,
        }
    }

    pub fn total_pkts(&self) -> u32 {
        self.sent_pkts + self.rcvd_pkts
    }
}

/// Arena of live records. The stack holds [`RecordId`]s, never references.
#[derive(Default)]
pub struct Records {
    map: FxHashMap<u64, ConnRecord>,
    next_id: u64,
}

impl Records {
    pub fn insert(&mut self, record: ConnRecord) -> RecordId {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.map.insert(id, record);
        RecordId(id)
    }

    pub fn get(&self, id: RecordId) -> Option<&ConnRecord> {
        self.map.get(&id.0)
    }

    pub fn get_mut(&mut self, id: RecordId) -> Option<&mut ConnRecord> {
        self.map.get_mut(&id.0)
    }

    pub fn remove(&mut self, id: RecordId) -> Option<ConnRecord> {
        self.map.remove(&id.0)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Drops every record. Used by the shutdown drain, which frees records
    /// regardless of status.
    pub fn clear(&mut self) {
        self.map.clear();
    }
}

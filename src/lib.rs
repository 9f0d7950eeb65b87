//! Userspace packet-capture core for tun-based traffic inspection.
//!
//! Raw IP packets read from a tun fd are terminated by an external
//! userspace TCP/IP stack, classified by deep packet inspection, associated
//! with the originating application, optionally rewritten (DNS DNAT) or
//! blocked (encrypted DNS), and recorded to PCAP sinks. This crate is the
//! orchestration core: the packet loop, the per-connection state machine,
//! the DNS policy, the host LRU, and the connection-accounting pipeline.
//! The stack, the DPI library, the UID resolver, and the host callbacks
//! are collaborators behind traits.

#![deny(unsafe_op_in_unsafe_fn)]

mod config;
mod conn;
mod control;
mod dns;
mod dpi;
mod engine;
mod host;
pub mod logger;
mod lru;
mod pcap;
mod registry;
mod stack;
mod uid;

pub use config::{CaptureConfig, CollectorConfig, Prefs, Socks5Config};
pub use conn::{ConnRecord, RecordId};
pub use control::CaptureHandle;
pub use dns::{DnsPolicy, DnsVerdict, DNS_PORT};
pub use dpi::{
    proto, proto_label, DnsAnswer, DpiError, DpiFlow, DpiModule, DpiState, EndpointId, FlowId,
    FlowMetadata, L7Proto, MAX_DPI_PACKETS,
};
pub use engine::Engine;
pub use host::{app_label, ConnectionDescriptor, HostEvents, ServiceStatus, VpnStats};
pub use lru::{HostLru, MAX_HOST_LRU_SIZE};
pub use pcap::PCAP_BUFFER_SIZE;
pub use stack::{
    transport_label, ConnId, ConnStatus, ConnView, Direction, FdSet, FiveTuple, OpenVerdict,
    PacketView, StackError, StackEvents, StackStats, TcpFlagSummary, TunStack, TunWriteError,
};
pub use uid::{UidResolver, UID_UNKNOWN};

//! DNS interception policy applied on the new-connection path.
//!
//! Internal DNS gets rewritten toward the configured upstream; non-UDP or
//! non-53 traffic to a known resolver is denied so that encrypted DNS falls
//! back to plain UDP/53, which the engine can inspect.

mod ptree;

use crate::logger::{self, BreadcrumbFlags};
use crate::stack::FiveTuple;
use ptree::IpPrefixTree;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub const DNS_PORT: u16 = 53;

const DNS_HEADER_LEN: usize = 12;
const DNS_FLAGS_RESPONSE: u16 = 0x8000;

const IPPROTO_UDP: u8 = 17;

/// Public resolvers whose traffic is always treated as DNS.
const KNOWN_DNS_SERVERS: [&str; 8] = [
    "8.8.8.8",
    "8.8.4.4",
    "1.1.1.1",
    "1.0.0.1",
    "2001:4860:4860::8888",
    "2001:4860:4860::8844",
    "2606:4700:4700::64",
    "2606:4700:4700::6400",
];

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DnsVerdict {
    /// Not resolver traffic, or a response; pass through untouched.
    Allow,
    /// A well-formed query; counts toward the DNS request total. With
    /// `dnat` set the flow must be rewritten to the configured upstream.
    AllowQuery { dnat: bool },
    /// Resolver traffic the engine cannot inspect; drop it.
    Deny,
}

pub struct DnsPolicy {
    vpn_dns: Ipv4Addr,
    vpn_dns_v6: Ipv6Addr,
    known_servers: IpPrefixTree,
}

impl DnsPolicy {
    pub fn new(vpn_dns: Ipv4Addr, vpn_dns_v6: Ipv6Addr) -> Self {
        let mut known_servers = IpPrefixTree::new();
        for server in KNOWN_DNS_SERVERS {
            match server.parse::<IpAddr>() {
                Ok(ip) => {
                    let prefix_len = if ip.is_ipv6() { 128 } else { 32 };
                    known_servers.insert(ip, prefix_len);
                }
                Err(_) => logger::error(format!("bad known DNS server literal: {server}")),
            }
        }
        Self {
            vpn_dns,
            vpn_dns_v6,
            known_servers,
        }
    }

    /// Decides the fate of a new connection's first packet. Pure: the same
    /// tuple and payload always produce the same verdict.
    pub fn evaluate(&self, tuple: &FiveTuple, l7: &[u8]) -> DnsVerdict {
        let is_internal = tuple.ip_ver == 4 && tuple.dst_ip == IpAddr::V4(self.vpn_dns);
        let mut is_dns_server = is_internal
            || (tuple.ip_ver == 6 && tuple.dst_ip == IpAddr::V6(self.vpn_dns_v6));

        if !is_dns_server && self.known_servers.matches(tuple.dst_ip) {
            is_dns_server = true;
            logger::breadcrumb(
                BreadcrumbFlags::DNS,
                format!("matched known DNS server: {}", tuple.dst_ip),
            );
        }

        if !is_dns_server {
            return DnsVerdict::Allow;
        }

        if tuple.ip_proto == IPPROTO_UDP
            && tuple.dst_port == DNS_PORT
            && l7.len() >= DNS_HEADER_LEN
        {
            let flags = u16::from_be_bytes([l7[2], l7[3]]);
            if flags & DNS_FLAGS_RESPONSE != 0 {
                return DnsVerdict::Allow;
            }
            logger::breadcrumb(
                BreadcrumbFlags::DNS,
                format!("detected DNS query[{}]", l7.len()),
            );
            return DnsVerdict::AllowQuery { dnat: is_internal };
        }

        logger::info("blocking packet directed to the DNS server");
        DnsVerdict::Deny
    }
}

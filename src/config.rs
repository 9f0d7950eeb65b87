use crate::logger;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Preference accessors exposed by the controlling application.
///
/// Keys follow the host naming (`getVpnDns`, `dumpPcapToUdp`, ...); a `None`
/// from an address accessor means the value was missing or unparseable.
pub trait Prefs {
    fn ipv4_pref(&self, key: &str) -> Option<Ipv4Addr>;
    fn ipv6_pref(&self, key: &str) -> Option<Ipv6Addr>;
    fn int_pref(&self, key: &str) -> i32;
}

#[derive(Clone, Copy, Debug)]
pub struct Socks5Config {
    pub proxy_addr: Ipv4Addr,
    pub proxy_port: u16,
}

#[derive(Clone, Copy, Debug)]
pub struct CollectorConfig {
    pub addr: Ipv4Addr,
    pub port: u16,
    /// Stream to the collector over TCP instead of unconnected UDP.
    pub tcp: bool,
}

/// Immutable settings for one capture session.
#[derive(Clone, Debug)]
pub struct CaptureConfig {
    pub vpn_ipv4: Ipv4Addr,
    /// Internal DNS endpoint exposed on the tun network.
    pub vpn_dns: Ipv4Addr,
    /// Upstream resolver that internal DNS traffic is DNATed to.
    pub dns_server: Ipv4Addr,
    pub ipv6_enabled: bool,
    pub vpn_dns_v6: Ipv6Addr,
    pub socks5: Option<Socks5Config>,
    /// Buffer accounted packets into the in-memory PCAP ring for the host.
    pub pcap_to_host: bool,
    pub collector: Option<CollectorConfig>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            vpn_ipv4: Ipv4Addr::UNSPECIFIED,
            vpn_dns: Ipv4Addr::UNSPECIFIED,
            dns_server: Ipv4Addr::UNSPECIFIED,
            ipv6_enabled: false,
            vpn_dns_v6: Ipv6Addr::UNSPECIFIED,
            socks5: None,
            pcap_to_host: false,
            collector: None,
        }
    }
}

impl CaptureConfig {
    /// Materializes a session config from the host preferences.
    pub fn load(prefs: &dyn Prefs) -> Self {
        let socks5 = (prefs.int_pref("getSocks5Enabled") != 0).then(|| Socks5Config {
            proxy_addr: ipv4_or_log(prefs, "getSocks5ProxyAddress"),
            proxy_port: prefs.int_pref("getSocks5ProxyPort") as u16,
        });
        let collector = (prefs.int_pref("dumpPcapToUdp") != 0).then(|| CollectorConfig {
            addr: ipv4_or_log(prefs, "getPcapCollectorAddress"),
            port: prefs.int_pref("getPcapCollectorPort") as u16,
            tcp: false,
        });

        Self {
            vpn_ipv4: ipv4_or_log(prefs, "getVpnIPv4"),
            vpn_dns: ipv4_or_log(prefs, "getVpnDns"),
            dns_server: ipv4_or_log(prefs, "getDnsServer"),
            ipv6_enabled: prefs.int_pref("getIPv6Enabled") != 0,
            vpn_dns_v6: ipv6_or_log(prefs, "getIpv6DnsServer"),
            socks5,
            pcap_to_host: prefs.int_pref("dumpPcapToJava") != 0,
            collector,
        }
    }
}

fn ipv4_or_log(prefs: &dyn Prefs, key: &str) -> Ipv4Addr {
    match prefs.ipv4_pref(key) {
        Some(addr) => {
            logger::debug(format!("{key}() = {addr}"));
            addr
        }
        None => {
            logger::error(format!("{key}() returned invalid IPv4 address"));
            Ipv4Addr::UNSPECIFIED
        }
    }
}

fn ipv6_or_log(prefs: &dyn Prefs, key: &str) -> Ipv6Addr {
    match prefs.ipv6_pref(key) {
        Some(addr) => {
            logger::debug(format!("{key}() = {addr}"));
            addr
        }
        None => {
            logger::error(format!("{key}() returned invalid IPv6 address"));
            Ipv6Addr::UNSPECIFIED
        }
    }
}

//! Minimal binary prefix tree over IP addresses, one root per family.

use std::net::IpAddr;

#[derive(Default)]
struct Node {
    children: [Option<Box<Node>>; 2],
    terminal: bool,
}

#[derive(Default)]
pub struct IpPrefixTree {
    v4: Node,
    v6: Node,
}

impl IpPrefixTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `addr/prefix_len`; the length is clamped to the family width.
    pub fn insert(&mut self, addr: IpAddr, prefix_len: u8) {
        let (root, octets, width) = match addr {
            IpAddr::V4(v4) => (&mut self.v4, v4.octets().to_vec(), 32),
            IpAddr::V6(v6) => (&mut self.v6, v6.octets().to_vec(), 128),
        };
        let depth = usize::from(prefix_len).min(width);

        let mut node = root;
        for index in 0..depth {
            let branch = bit(&octets, index);
            node = node.children[branch].get_or_insert_with(Box::default);
        }
        node.terminal = true;
    }

    /// True when any inserted prefix covers `addr`.
    pub fn matches(&self, addr: IpAddr) -> bool {
        let (root, octets) = match addr {
            IpAddr::V4(v4) => (&self.v4, v4.octets().to_vec()),
            IpAddr::V6(v6) => (&self.v6, v6.octets().to_vec()),
        };

        let mut node = root;
        if node.terminal {
            return true;
        }
        for index in 0..octets.len() * 8 {
            match &node.children[bit(&octets, index)] {
                Some(child) => {
                    if child.terminal {
                        return true;
                    }
                    node = child;
                }
                None => return false,
            }
        }
        false
    }
}

fn bit(octets: &[u8], index: usize) -> usize {
    usize::from((octets[index / 8] >> (7 - index % 8)) & 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn host_routes_match_exactly() {
        let mut tree = IpPrefixTree::new();
        tree.insert(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 32);

        assert!(tree.matches(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))));
        assert!(!tree.matches(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 9))));
        assert!(!tree.matches(IpAddr::V4(Ipv4Addr::new(8, 8, 4, 4))));
    }

    #[test]
    fn shorter_prefixes_cover_their_subnet() {
        let mut tree = IpPrefixTree::new();
        tree.insert(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 0)), 8);

        assert!(tree.matches(IpAddr::V4(Ipv4Addr::new(10, 215, 173, 1))));
        assert!(!tree.matches(IpAddr::V4(Ipv4Addr::new(11, 0, 0, 1))));
    }

    #[test]
    fn families_do_not_bleed() {
        let mut tree = IpPrefixTree::new();
        let v6: Ipv6Addr = "2001:4860:4860::8888".parse().unwrap();
        tree.insert(IpAddr::V6(v6), 128);

        assert!(tree.matches(IpAddr::V6(v6)));
        assert!(!tree.matches(IpAddr::V4(Ipv4Addr::new(32, 1, 72, 96))));
        assert!(!tree.matches(IpAddr::V6("2001:4860:4860::8844".parse().unwrap())));
    }
}

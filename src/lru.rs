//! Bounded IP-to-hostname cache carrying DNS-learned names onto later flows.

use lru::LruCache;
use std::net::IpAddr;
use std::num::NonZeroUsize;

pub const MAX_HOST_LRU_SIZE: usize = 128;
const MAX_HOST_NAME_LEN: usize = 255;

pub struct HostLru {
    cache: LruCache<IpAddr, String>,
}

impl HostLru {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(capacity),
        }
    }

    /// Inserts or overwrites, promoting to most-recent; evicts the
    /// least-recently used entry when full. Over-long names are truncated.
    pub fn add(&mut self, ip: IpAddr, name: &str) {
        self.cache.put(ip, truncate(name, MAX_HOST_NAME_LEN));
    }

    /// Returns a copy of the cached name; a hit promotes the entry.
    pub fn find(&mut self, ip: IpAddr) -> Option<String> {
        self.cache.get(&ip).cloned()
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

impl Default for HostLru {
    fn default() -> Self {
        Self::new(MAX_HOST_LRU_SIZE)
    }
}

fn truncate(name: &str, max_len: usize) -> String {
    if name.len() <= max_len {
        return name.to_string();
    }
    let mut end = max_len;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(93, 184, 216, last))
    }

    #[test]
    fn eviction_is_strict_lru() {
        let mut lru = HostLru::new(2);
        lru.add(ip(1), "one.example");
        lru.add(ip(2), "two.example");
        lru.add(ip(3), "three.example");

        assert_eq!(lru.len(), 2);
        assert_eq!(lru.find(ip(1)), None);
        assert_eq!(lru.find(ip(2)).as_deref(), Some("two.example"));
        assert_eq!(lru.find(ip(3)).as_deref(), Some("three.example"));
    }

    #[test]
    fn hit_promotes_entry() {
        let mut lru = HostLru::new(2);
        lru.add(ip(1), "one.example");
        lru.add(ip(2), "two.example");

        // Touch the older entry, then insert; the untouched one must go.
        assert!(lru.find(ip(1)).is_some());
        lru.add(ip(3), "three.example");

        assert!(lru.find(ip(1)).is_some());
        assert_eq!(lru.find(ip(2)), None);
    }

    #[test]
    fn overwrite_keeps_single_key() {
        let mut lru = HostLru::new(4);
        lru.add(ip(1), "old.example");
        lru.add(ip(1), "new.example");
        assert_eq!(lru.len(), 1);
        assert_eq!(lru.find(ip(1)).as_deref(), Some("new.example"));
    }

    #[test]
    fn long_names_are_truncated() {
        let mut lru = HostLru::new(4);
        let long = "a".repeat(400);
        lru.add(ip(1), &long);
        assert_eq!(lru.find(ip(1)).map(|n| n.len()), Some(255));
    }
}

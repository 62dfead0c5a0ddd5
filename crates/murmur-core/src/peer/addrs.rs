//! Per-peer address set.

use std::collections::HashSet;
use std::net::IpAddr;

use parking_lot::RwLock;

/// Every address a peer has been observed reachable through.
///
/// Entries are unique by string form and enumerate in insertion order.
/// Writers take the lock exclusively, readers share it.
#[derive(Debug, Default)]
pub struct AddressSet {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    ordered: Vec<IpAddr>,
    seen: HashSet<String>,
}

impl AddressSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `addr`. Returns true iff it was not already present.
    pub fn add(&self, addr: IpAddr) -> bool {
        let key = addr.to_string();
        let mut inner = self.inner.write();
        if !inner.seen.insert(key) {
            return false;
        }
        inner.ordered.push(addr);
        true
    }

    /// Snapshot of the current members, oldest first.
    pub fn list(&self) -> Vec<IpAddr> {
        self.inner.read().ordered.clone()
    }

    /// Merge every address of `other` into this set.
    /// Returns true if at least one address was new.
    pub fn merge_from(&self, other: &AddressSet) -> bool {
        let mut changed = false;
        for addr in other.list() {
            changed |= self.add(addr);
        }
        changed
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.inner.read().seen.contains(&addr.to_string())
    }

    pub fn len(&self) -> usize {
        self.inner.read().ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FromIterator<IpAddr> for AddressSet {
    fn from_iter<T: IntoIterator<Item = IpAddr>>(iter: T) -> Self {
        let set = AddressSet::new();
        for addr in iter {
            set.add(addr);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::sync::Arc;

    #[test]
    fn add_reports_new_once() {
        let set = AddressSet::new();
        let a = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        assert!(set.add(a));
        assert!(!set.add(a));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn list_preserves_insertion_order() {
        let set = AddressSet::new();
        let v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);
        let v4 = IpAddr::V4(Ipv4Addr::LOCALHOST);
        set.add(v6);
        set.add(v4);
        set.add(v6);
        assert_eq!(set.list(), vec![v6, v4]);
    }

    #[test]
    fn merge_from_reports_change_only_for_new_addresses() {
        let a: AddressSet = ["10.0.0.1", "10.0.0.2"]
            .iter()
            .map(|s| s.parse::<IpAddr>().unwrap())
            .collect();
        let subset: AddressSet = std::iter::once("10.0.0.2".parse().unwrap()).collect();
        assert!(!a.merge_from(&subset));

        let other: AddressSet = std::iter::once("10.0.0.3".parse().unwrap()).collect();
        assert!(a.merge_from(&other));
        assert_eq!(a.len(), 3);
    }

    #[test]
    fn concurrent_adds_report_new_exactly_once_per_address() {
        let set = Arc::new(AddressSet::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let set = set.clone();
            handles.push(std::thread::spawn(move || {
                let mut fresh = 0;
                for i in 0..50u8 {
                    if set.add(IpAddr::V4(Ipv4Addr::new(192, 168, 0, i))) {
                        fresh += 1;
                    }
                }
                fresh
            }));
        }
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 50);
        assert_eq!(set.len(), 50);
    }
}

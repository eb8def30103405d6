use std::net::IpAddr;

use ipnet::IpNet;
use tracing::warn;

#[derive(Debug, Clone)]
enum MatchEntry {
    // CIDR entries admit any address the network contains.
    Network(IpNet),
    // Literal entries admit on exact textual equality.
    Literal(String),
}

/// Allow-list of literal IP addresses and CIDR networks. An empty list
/// admits every candidate; entries that parse as neither an address nor a
/// network are dropped and never match.
#[derive(Debug, Clone, Default)]
pub struct AddressMatcher {
    entries: Vec<MatchEntry>,
}

impl AddressMatcher {
    pub fn new(entries: &[String]) -> Self {
        let entries = entries
            .iter()
            .map(|entry| entry.trim())
            .filter(|entry| !entry.is_empty())
            .filter_map(|entry| {
                if entry.contains('/') {
                    match entry.parse::<IpNet>() {
                        Ok(network) => Some(MatchEntry::Network(network)),
                        Err(error) => {
                            warn!(%entry, %error, "Ignoring unparsable network in allow-list.");
                            None
                        }
                    }
                } else {
                    match entry.parse::<IpAddr>() {
                        Ok(_) => Some(MatchEntry::Literal(entry.to_string())),
                        Err(error) => {
                            warn!(%entry, %error, "Ignoring unparsable address in allow-list.");
                            None
                        }
                    }
                }
            })
            .collect();
        AddressMatcher { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the candidate address is admitted. A candidate that does not
    /// parse as an IP address fails every entry.
    pub fn admits(&self, candidate: &str) -> bool {
        if self.entries.is_empty() {
            return true;
        }
        let Ok(address) = candidate.parse::<IpAddr>() else {
            return false;
        };
        self.entries.iter().any(|entry| match entry {
            MatchEntry::Network(network) => network.contains(&address),
            MatchEntry::Literal(literal) => literal == candidate,
        })
    }
}

#[cfg(test)]
mod address_matcher_tests {
    use super::AddressMatcher;

    fn matcher(entries: &[&str]) -> AddressMatcher {
        let entries: Vec<String> = entries.iter().map(|entry| entry.to_string()).collect();
        AddressMatcher::new(&entries)
    }

    #[test]
    fn empty_list_admits_anyone() {
        let matcher = matcher(&[]);
        assert!(matcher.is_empty());
        assert!(matcher.admits("127.0.0.1"));
        assert!(matcher.admits("203.0.113.10"));
        assert!(matcher.admits("1234:dead:beef::154"));
    }

    #[test]
    fn literal_entries_match_exactly() {
        let matcher = matcher(&["198.51.100.5"]);
        assert!(matcher.admits("198.51.100.5"));
        assert!(!matcher.admits("198.51.100.6"));
        assert!(!matcher.admits("203.0.113.10"));
    }

    #[test]
    fn network_entries_match_by_containment() {
        let matcher = matcher(&["10.0.0.0/8", "192.168.1.1"]);
        assert!(matcher.admits("10.0.0.1"));
        assert!(matcher.admits("10.255.255.254"));
        assert!(matcher.admits("192.168.1.1"));
        assert!(!matcher.admits("192.168.1.2"));
        assert!(!matcher.admits("11.0.0.1"));
    }

    #[test]
    fn unparsable_entries_never_match() {
        let matcher = matcher(&["not-an-ip", "300.1.2.3/8", "10.0.0.0/8"]);
        assert!(matcher.admits("10.0.0.1"));
        assert!(!matcher.admits("not-an-ip"));
    }

    #[test]
    fn unparsable_candidate_fails_all_entries() {
        let matcher = matcher(&["10.0.0.0/8", "198.51.100.5"]);
        assert!(!matcher.admits("service.internal"));
        assert!(!matcher.admits(""));
    }

    #[test]
    fn ipv6_networks_are_supported() {
        let matcher = matcher(&["2001:db8::/32"]);
        assert!(matcher.admits("2001:db8::1"));
        assert!(!matcher.admits("2001:db9::1"));
    }
}

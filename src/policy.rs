//! Server Policy (C7): ignore-list filter and preferred-server weights
//! applied to Advertise scoring during Selecting (`spec.md` §4.7, §9).

use std::net::Ipv6Addr;

use crate::identity::Duid;

/// The fields of an Advertise relevant to scoring.
#[derive(Debug, Clone)]
pub struct Advertised {
    pub server_addr: Ipv6Addr,
    pub server_duid: Duid,
    pub preference: u8,
}

/// A configured preferred server, matched by DUID or by address.
#[derive(Debug, Clone)]
pub enum ServerSelector {
    Duid(Duid),
    Addr(Ipv6Addr),
}

#[derive(Debug, Clone)]
pub struct PreferredServer {
    pub selector: ServerSelector,
    pub weight: u8,
}

/// RFC 3315 §17.1.3 preference scoring, plus host-configured overrides.
///
/// Open question (c) from `spec.md` §9: the ignore-list comparison uses
/// `Ipv6Addr` equality (bytewise, via `std::net::Ipv6Addr`'s `PartialEq`)
/// rather than stringified comparison, resolving the flagged weakness in
/// the source rather than preserving it.
#[derive(Debug, Clone, Default)]
pub struct ServerPolicy {
    pub ignore_servers: Vec<Ipv6Addr>,
    pub preferred: Vec<PreferredServer>,
}

impl ServerPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` rejects the candidate outright; `Some(weight)` is the score
    /// to compare against the current `BestOffer`. A weight of 255
    /// terminates the Selecting wait immediately (`is_immediate_selection`).
    pub fn score(&self, candidate: &Advertised) -> Option<i32> {
        if self.ignore_servers.contains(&candidate.server_addr) {
            return None;
        }
        let mut weight = candidate.preference as i32;
        for pref in &self.preferred {
            let matches = match &pref.selector {
                ServerSelector::Duid(duid) => *duid == candidate.server_duid,
                ServerSelector::Addr(addr) => *addr == candidate.server_addr,
            };
            if matches {
                weight = pref.weight as i32;
                break;
            }
        }
        Some(weight)
    }

    pub fn is_immediate_selection(weight: i32) -> bool {
        weight >= 255
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advertised(addr: &str, preference: u8) -> Advertised {
        Advertised {
            server_addr: addr.parse().unwrap(),
            server_duid: Duid::new(vec![0, 3, 0, 1, 1, 2, 3, 4, 5, 6]).unwrap(),
            preference,
        }
    }

    #[test]
    fn ignore_list_rejects_by_address() {
        let policy = ServerPolicy {
            ignore_servers: vec!["fe80::1".parse().unwrap()],
            preferred: vec![],
        };
        assert_eq!(policy.score(&advertised("fe80::1", 10)), None);
        assert_eq!(policy.score(&advertised("fe80::2", 10)), Some(10));
    }

    #[test]
    fn preferred_address_overrides_preference_option() {
        let policy = ServerPolicy {
            ignore_servers: vec![],
            preferred: vec![PreferredServer {
                selector: ServerSelector::Addr("fe80::2".parse().unwrap()),
                weight: 200,
            }],
        };
        assert_eq!(policy.score(&advertised("fe80::2", 5)), Some(200));
        assert_eq!(policy.score(&advertised("fe80::3", 5)), Some(5));
    }

    #[test]
    fn preferred_duid_overrides_preference_option() {
        let duid = Duid::new(vec![0, 3, 0, 1, 9, 9, 9, 9, 9, 9]).unwrap();
        let policy = ServerPolicy {
            ignore_servers: vec![],
            preferred: vec![PreferredServer {
                selector: ServerSelector::Duid(duid.clone()),
                weight: 255,
            }],
        };
        let candidate = Advertised {
            server_addr: "fe80::9".parse().unwrap(),
            server_duid: duid,
            preference: 0,
        };
        let weight = policy.score(&candidate).unwrap();
        assert_eq!(weight, 255);
        assert!(ServerPolicy::is_immediate_selection(weight));
    }

    #[test]
    fn weight_255_preference_option_is_immediate_without_override() {
        let policy = ServerPolicy::new();
        let weight = policy.score(&advertised("fe80::4", 255)).unwrap();
        assert!(ServerPolicy::is_immediate_selection(weight));
    }
}

//! Lease records and the Selecting-phase `BestOffer` accumulator
//! (`spec.md` §3 "Lease", "BestOffer").

use std::net::IpAddr;
use std::time::Instant;

use uuid::Uuid;

use crate::identity::Duid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IaType {
    NonTemporary,
    Temporary,
    PrefixDelegation,
}

/// One address (IA_NA/IA_TA) or prefix (IA_PD) handed out under an IA.
#[derive(Debug, Clone)]
pub struct IaAssignment {
    pub addr: IpAddr,
    pub prefix_len: u8,
    pub preferred_lifetime: u32,
    pub valid_lifetime: u32,
}

/// One IA_NA/IA_TA/IA_PD as granted by a server, carrying its own T1/T2.
#[derive(Debug, Clone)]
pub struct IaRecord {
    pub iaid: u32,
    pub ia_type: IaType,
    pub t1: u32,
    pub t2: u32,
    pub assignments: Vec<IaAssignment>,
}

impl IaRecord {
    /// Renew fires at `granted_at + t1`; a T1 of 0 means "server chooses",
    /// which this engine treats as half the shortest valid lifetime,
    /// matching common server practice (RFC 8415 §18.2.4).
    pub fn renew_at(&self, granted_at: Instant) -> Instant {
        let t1 = if self.t1 == 0 {
            self.shortest_valid_lifetime() / 2
        } else {
            self.t1
        };
        granted_at + std::time::Duration::from_secs(t1 as u64)
    }

    pub fn rebind_at(&self, granted_at: Instant) -> Instant {
        let t2 = if self.t2 == 0 {
            (self.shortest_valid_lifetime() * 4) / 5
        } else {
            self.t2
        };
        granted_at + std::time::Duration::from_secs(t2 as u64)
    }

    pub fn expires_at(&self, granted_at: Instant) -> Option<Instant> {
        self.shortest_valid_lifetime_checked()
            .map(|secs| granted_at + std::time::Duration::from_secs(secs as u64))
    }

    fn shortest_valid_lifetime(&self) -> u32 {
        self.shortest_valid_lifetime_checked().unwrap_or(0)
    }

    fn shortest_valid_lifetime_checked(&self) -> Option<u32> {
        self.assignments.iter().map(|a| a.valid_lifetime).min()
    }
}

/// An address-configuration record, opaque to the FSM beyond what it needs
/// to schedule Renew/Rebind and report expiry.
#[derive(Debug, Clone)]
pub struct Lease {
    pub uuid: Uuid,
    pub server_duid: Duid,
    pub ia_records: Vec<IaRecord>,
    pub granted_at: Instant,
}

impl Lease {
    /// True while at least one IA still has unexpired assignments.
    pub fn is_valid(&self, clock: &dyn crate::clock::Clock) -> bool {
        let now = clock.now();
        self.ia_records.iter().any(|ia| {
            ia.expires_at(self.granted_at)
                .is_none_or(|expiry| now < expiry)
        })
    }

    /// Earliest Renew deadline across all IAs (Bound -> Renewing trigger).
    pub fn earliest_renew(&self) -> Option<Instant> {
        self.ia_records
            .iter()
            .map(|ia| ia.renew_at(self.granted_at))
            .min()
    }

    /// Earliest Rebind deadline across all IAs (Renewing -> Rebinding
    /// trigger, also used to bound the Rebind exchange's MRD).
    pub fn earliest_rebind(&self) -> Option<Instant> {
        self.ia_records
            .iter()
            .map(|ia| ia.rebind_at(self.granted_at))
            .min()
    }

    /// Earliest full expiry across all IAs (Rebinding -> lease-drop trigger).
    pub fn earliest_expiry(&self) -> Option<Instant> {
        self.ia_records
            .iter()
            .filter_map(|ia| ia.expires_at(self.granted_at))
            .min()
    }
}

/// Highest-weighted Advertise seen so far during Selecting. `weight = -1`
/// represents "none yet" per `spec.md` §3.
#[derive(Debug, Clone)]
pub struct BestOffer {
    pub lease: Option<Lease>,
    pub weight: i32,
}

impl Default for BestOffer {
    fn default() -> Self {
        Self {
            lease: None,
            weight: -1,
        }
    }
}

impl BestOffer {
    pub fn none() -> Self {
        Self::default()
    }

    /// Replace the current best offer if `weight` is strictly greater.
    /// Ties keep the existing offer (earliest arrival wins, `spec.md` §4.7).
    pub fn consider(&mut self, weight: i32, lease: Lease) -> bool {
        if weight > self.weight {
            self.weight = weight;
            self.lease = Some(lease);
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_present(&self) -> bool {
        self.lease.is_some()
    }
}

//! Device (C4): per-interface state and the global Device registry
//! (`spec.md` §3 "Device", §4.4, §9 "Global linked list of active Devices").

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::Instant;

use crate::clock::{Clock, Timer};
use crate::config::{AcquireRequest, AttemptConfig, WBUF_SIZE};
use crate::error::{EngineError, ErrorKind};
use crate::identity::Duid;
use crate::lease::{BestOffer, Lease};
use crate::netinfo::{AddrFamily, NetInfo};
use crate::policy::ServerPolicy;
use crate::retrans::RetransState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmState {
    Init,
    WaitReady,
    Selecting,
    Requesting,
    ValidateOffer,
    Bound,
    Renewing,
    Rebinding,
    Confirming,
    Declining,
    InfoRequest,
    Releasing,
    Stopped,
}

impl FsmState {
    /// Invariant I2: retransmission is armed iff the FSM is in one of
    /// these states.
    pub fn is_retransmitting(self) -> bool {
        matches!(
            self,
            FsmState::Selecting
                | FsmState::Requesting
                | FsmState::Confirming
                | FsmState::Renewing
                | FsmState::Rebinding
                | FsmState::InfoRequest
                | FsmState::Releasing
        )
    }
}

/// Result of a link-local readiness query (`spec.md` §4.4 `find_lladdr`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LladdrStatus {
    Ready,
    Wait,
}

/// Per-interface state. One `Device` exists per ifindex (invariant I4,
/// enforced by `DeviceRegistry`).
pub struct Device {
    pub ifindex: u32,
    pub ifname: String,
    pub lladdr: Option<Ipv6Addr>,
    pub state: FsmState,
    pub fail_on_timeout: bool,
    pub config: Option<AttemptConfig>,
    pub request: Option<AcquireRequest>,
    pub lease: Option<Lease>,
    pub best_offer: BestOffer,
    pub server_policy: ServerPolicy,
    pub duid: Duid,
    pub iaid: u32,
    pub xid: Option<[u8; 3]>,
    pub server_addr: Option<Ipv6Addr>,
    pub retrans: RetransState,
    pub timer: Timer,
    pub mrd_timer: Timer,
    pub outbound: Vec<u8>,
    pub start_time: Instant,
}

impl Device {
    pub fn new(ifindex: u32, ifname: impl Into<String>, duid: Duid, iaid: u32, clock: &dyn Clock) -> Self {
        Self {
            ifindex,
            ifname: ifname.into(),
            lladdr: None,
            state: FsmState::Init,
            fail_on_timeout: false,
            config: None,
            request: None,
            lease: None,
            best_offer: BestOffer::none(),
            server_policy: ServerPolicy::default(),
            duid,
            iaid,
            xid: None,
            server_addr: None,
            retrans: RetransState::new(crate::retrans::MessageKind::Solicit.default_params()),
            timer: Timer::new(),
            mrd_timer: Timer::new(),
            outbound: Vec::with_capacity(WBUF_SIZE),
            start_time: clock.now(),
        }
    }

    /// Drops lease and best-offer, resets to `Init`, clears config/request
    /// and timers. Does not remove the Device from the registry. Callable
    /// any number of times (idempotent per `spec.md` §8).
    pub fn stop(&mut self) {
        self.lease = None;
        self.best_offer.reset();
        self.state = FsmState::Init;
        self.fail_on_timeout = false;
        self.config = None;
        self.request = None;
        self.xid = None;
        self.server_addr = None;
        self.retrans.disarm();
        self.timer.cancel();
        self.mrd_timer.cancel();
        self.outbound.clear();
    }

    pub fn set_config(&mut self, config: AttemptConfig) {
        self.config = Some(config);
    }

    pub fn set_request(&mut self, request: AcquireRequest) {
        self.request = Some(request);
    }

    pub fn set_lease(&mut self, lease: Lease) {
        self.lease = Some(lease);
    }

    /// Queries `NetInfo` for this interface's link-local readiness.
    /// `Ready` stores the address into `self.lladdr`.
    pub fn find_lladdr(&mut self, net: &dyn NetInfo) -> Result<LladdrStatus, EngineError> {
        let iface = net
            .by_index(self.ifindex)
            .ok_or_else(|| EngineError::new(ErrorKind::NoInterface, self.ifname.clone()))?;
        if !iface.link_up {
            return Err(EngineError::new(ErrorKind::LinkDown, self.ifname.clone()));
        }

        let mut tentative_only = false;
        for addr in &iface.addrs {
            if addr.family != AddrFamily::Inet6 || !is_link_local(&addr.local_addr) {
                continue;
            }
            if addr.flags.duplicate {
                return Err(EngineError::new(
                    ErrorKind::DuplicateLinklocal,
                    self.ifname.clone(),
                ));
            }
            if addr.flags.tentative {
                tentative_only = true;
                continue;
            }
            if let std::net::IpAddr::V6(v6) = addr.local_addr {
                self.lladdr = Some(v6);
                return Ok(LladdrStatus::Ready);
            }
        }

        if tentative_only {
            return Ok(LladdrStatus::Wait);
        }
        Err(EngineError::new(ErrorKind::NoLinklocal, self.ifname.clone()))
    }

    /// Time since `retrans.start`, in 1/100s, capped at `clamp` — the
    /// Elapsed-Time option value.
    pub fn uptime(&self, clock: &dyn Clock, clamp: u16) -> u16 {
        self.retrans.elapsed_hundredths(clock, clamp)
    }
}

fn is_link_local(addr: &std::net::IpAddr) -> bool {
    match addr {
        std::net::IpAddr::V6(v6) => {
            let segs = v6.segments();
            (segs[0] & 0xffc0) == 0xfe80
        }
        std::net::IpAddr::V4(_) => false,
    }
}

/// Global registry of active Devices, keyed by ifindex (invariant I4).
/// Each entry is reference-counted: the registry holds one strong `Arc`,
/// external holders (pending timers, in-flight event dispatch) clone it.
/// `put` drops the caller's handle and tears the Device down once the
/// registry is the sole remaining owner.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: HashMap<u32, Arc<RefCell<Device>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the existing Device for `ifindex`, or registers a new one.
    pub fn get_or_insert_with(
        &mut self,
        ifindex: u32,
        make: impl FnOnce() -> Device,
    ) -> Arc<RefCell<Device>> {
        self.devices
            .entry(ifindex)
            .or_insert_with(|| Arc::new(RefCell::new(make())))
            .clone()
    }

    /// `get` — returns a new strong handle, bumping the refcount.
    pub fn get(&self, ifindex: u32) -> Option<Arc<RefCell<Device>>> {
        self.devices.get(&ifindex).cloned()
    }

    /// `put` — release a handle. If the registry is left holding the only
    /// strong reference, the Device is torn down and unlinked.
    pub fn put(&mut self, ifindex: u32, handle: Arc<RefCell<Device>>) {
        drop(handle);
        if let Some(entry) = self.devices.get(&ifindex) {
            if Arc::strong_count(entry) == 1 {
                if let Some(removed) = self.devices.remove(&ifindex) {
                    removed.borrow_mut().stop();
                }
            }
        }
    }

    /// Snapshot of managed ifindices, for reactor iteration. Collected
    /// rather than borrowed so callers can freely borrow_mut individual
    /// devices while iterating.
    pub fn ifindices(&self) -> Vec<u32> {
        self.devices.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;
    use crate::netinfo::{AddrFlags, Iface, IfaceAddr, StaticNetInfo};

    fn duid() -> Duid {
        Duid::new(vec![0, 3, 0, 1, 1, 2, 3, 4, 5, 6]).unwrap()
    }

    #[test]
    fn find_lladdr_ready_for_non_tentative_link_local() {
        let clock = MonotonicClock;
        let mut device = Device::new(2, "eth0", duid(), 1, &clock);
        let mut net = StaticNetInfo::new();
        net.insert(Iface {
            name: "eth0".into(),
            ifindex: 2,
            hwaddr: Some(vec![0x52, 0x54, 0, 0x11, 0x22, 0x33]),
            arp_type: 1,
            vlan: None,
            link_up: true,
            network_up: true,
            addrs: vec![IfaceAddr {
                family: AddrFamily::Inet6,
                local_addr: "fe80::5054:ff:fe11:2233".parse().unwrap(),
                prefixlen: 64,
                scope: 253,
                flags: AddrFlags::default(),
            }],
        });
        let status = device.find_lladdr(&net).unwrap();
        assert_eq!(status, LladdrStatus::Ready);
        assert_eq!(device.lladdr, Some("fe80::5054:ff:fe11:2233".parse().unwrap()));
    }

    #[test]
    fn find_lladdr_waits_on_tentative_address() {
        let clock = MonotonicClock;
        let mut device = Device::new(2, "eth0", duid(), 1, &clock);
        let mut net = StaticNetInfo::new();
        net.insert(Iface {
            name: "eth0".into(),
            ifindex: 2,
            hwaddr: None,
            arp_type: 1,
            vlan: None,
            link_up: true,
            network_up: true,
            addrs: vec![IfaceAddr {
                family: AddrFamily::Inet6,
                local_addr: "fe80::1".parse().unwrap(),
                prefixlen: 64,
                scope: 253,
                flags: AddrFlags {
                    tentative: true,
                    ..Default::default()
                },
            }],
        });
        assert_eq!(device.find_lladdr(&net).unwrap(), LladdrStatus::Wait);
        assert_eq!(device.lladdr, None);
    }

    #[test]
    fn find_lladdr_errors_on_duplicate() {
        let clock = MonotonicClock;
        let mut device = Device::new(2, "eth0", duid(), 1, &clock);
        let mut net = StaticNetInfo::new();
        net.insert(Iface {
            name: "eth0".into(),
            ifindex: 2,
            hwaddr: None,
            arp_type: 1,
            vlan: None,
            link_up: true,
            network_up: true,
            addrs: vec![IfaceAddr {
                family: AddrFamily::Inet6,
                local_addr: "fe80::1".parse().unwrap(),
                prefixlen: 64,
                scope: 253,
                flags: AddrFlags {
                    duplicate: true,
                    ..Default::default()
                },
            }],
        });
        let err = device.find_lladdr(&net).unwrap_err();
        assert_eq!(err.kind, ErrorKind::DuplicateLinklocal);
    }

    #[test]
    fn stop_is_idempotent() {
        let clock = MonotonicClock;
        let mut device = Device::new(2, "eth0", duid(), 1, &clock);
        device.state = FsmState::Bound;
        device.stop();
        device.stop();
        assert_eq!(device.state, FsmState::Init);
        assert!(device.lease.is_none());
    }

    #[test]
    fn registry_enforces_one_device_per_ifindex() {
        let clock = MonotonicClock;
        let mut registry = DeviceRegistry::new();
        let a = registry.get_or_insert_with(2, || Device::new(2, "eth0", duid(), 1, &clock));
        let b = registry.get_or_insert_with(2, || Device::new(2, "eth0-dup", duid(), 1, &clock));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn put_tears_down_once_registry_is_sole_owner() {
        let clock = MonotonicClock;
        let mut registry = DeviceRegistry::new();
        let handle = registry.get_or_insert_with(2, || Device::new(2, "eth0", duid(), 1, &clock));
        registry.put(2, handle);
        assert!(registry.is_empty());
    }
}

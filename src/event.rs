//! Event intake (`spec.md` §4.6): link/address/device notifications from
//! the host process, dispatched into the FSM.

use std::net::IpAddr;

use rand::RngCore;

use crate::clock::Clock;
use crate::device::Device;
use crate::fsm::{self, Event, FsmOutcome};
use crate::netinfo::NetInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressEventKind {
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy)]
pub struct AddressEvent {
    pub kind: AddressEventKind,
    pub addr: IpAddr,
    pub tentative: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Up,
    Down,
}

/// `device_event(DEVICE_UP/DOWN)`. `DEVICE_DOWN` unconditionally stops the
/// device; `DEVICE_UP` updates `ifname` if the interface was renamed.
pub fn on_device_event(device: &mut Device, event: DeviceEvent, net: &dyn NetInfo) -> FsmOutcome {
    match event {
        DeviceEvent::Down => {
            device.stop();
            FsmOutcome::none()
        }
        DeviceEvent::Up => {
            if let Some(iface) = net.by_index(device.ifindex) {
                device.ifname = iface.name;
            }
            FsmOutcome::none()
        }
    }
}

/// `address_event(UPDATE/DELETE, addr)`.
pub fn on_address_event(
    device: &mut Device,
    event: AddressEvent,
    clock: &dyn Clock,
    rng: &mut dyn RngCore,
) -> FsmOutcome {
    match event.kind {
        AddressEventKind::Update => {
            if device.lladdr.is_none() && !event.tentative {
                if let IpAddr::V6(v6) = event.addr {
                    if is_link_local(v6) {
                        device.lladdr = Some(v6);
                    }
                }
            }
            fsm::poll(device, Event::AddressUpdate, clock, rng)
        }
        AddressEventKind::Delete => {
            let matches = match event.addr {
                IpAddr::V6(v6) => device.lladdr == Some(v6),
                IpAddr::V4(_) => false,
            };
            if matches {
                device.lladdr = None;
            }
            fsm::poll(device, Event::AddressDelete, clock, rng)
        }
    }
}

/// `link_event(LINK_UP/DOWN)`.
pub fn on_link_event(
    device: &mut Device,
    event: LinkEvent,
    clock: &dyn Clock,
    rng: &mut dyn RngCore,
) -> FsmOutcome {
    match event {
        LinkEvent::Up => fsm::poll(device, Event::LinkUp, clock, rng),
        LinkEvent::Down => fsm::poll(device, Event::LinkDown, clock, rng),
    }
}

fn is_link_local(addr: std::net::Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;
    use crate::identity::Duid;
    use crate::netinfo::StaticNetInfo;

    fn duid() -> Duid {
        Duid::new(vec![0, 3, 0, 1, 1, 2, 3, 4, 5, 6]).unwrap()
    }

    #[test]
    fn device_down_stops_device() {
        let clock = MonotonicClock;
        let mut device = Device::new(2, "eth0", duid(), 1, &clock);
        device.state = crate::device::FsmState::Bound;
        let net = StaticNetInfo::new();
        on_device_event(&mut device, DeviceEvent::Down, &net);
        assert_eq!(device.state, crate::device::FsmState::Init);
    }

    #[test]
    fn address_delete_clears_matching_lladdr() {
        let clock = MonotonicClock;
        let mut device = Device::new(2, "eth0", duid(), 1, &clock);
        let addr: std::net::Ipv6Addr = "fe80::1".parse().unwrap();
        device.lladdr = Some(addr);
        let mut rng = rand::rng();
        on_address_event(
            &mut device,
            AddressEvent {
                kind: AddressEventKind::Delete,
                addr: IpAddr::V6(addr),
                tentative: false,
            },
            &clock,
            &mut rng,
        );
        assert_eq!(device.lladdr, None);
    }
}

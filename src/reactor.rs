//! Reactor (C10): a single-threaded `poll(2)` event loop multiplexing the
//! shared DHCPv6 socket and a Linux `timerfd` across all managed Devices
//! (`spec.md` §5 "Concurrency & Resource Model").
//!
//! This replaces the teacher's thread-per-protocol tokio tasks
//! (`v6_worker`/`v4_worker`) with a genuine single-threaded reactor, per the
//! spec's no-locks, one-event-loop-per-process requirement — while keeping
//! the teacher's blocking-recv-loop shape (read -> parse -> handle -> send).

use std::os::fd::{AsFd, BorrowedFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use nix::poll::{PollFd, PollFlags, PollTimeout};
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use nix::sys::time::TimeSpec;
use tracing::{error, info, warn};

use crate::clock::{Clock, MonotonicClock};
use crate::codec::MessageCodec;
use crate::config::{EngineConfig, WBUF_SIZE};
use crate::device::{Device, DeviceRegistry, FsmState};
use crate::error::EngineError;
use crate::fsm::{self, Action, Event};
use crate::transport::Transport;

/// Outcome of one exchange surfaced to the host process.
pub enum EngineEvent {
    LeaseReady { ifindex: u32, lease: crate::lease::Lease },
    LeaseFailed { ifindex: u32, error: EngineError },
}

pub struct Reactor<T: Transport, C: MessageCodec> {
    transport: T,
    codec: C,
    clock: MonotonicClock,
    rng: rand::rngs::ThreadRng,
    registry: DeviceRegistry,
    timerfd: TimerFd,
    config: Arc<ArcSwap<EngineConfig>>,
}

impl<T: Transport, C: MessageCodec> Reactor<T, C> {
    /// `config` is shared with the SIGHUP reload handler: server policy
    /// changes take effect for a Device on its next `acquire()`.
    pub fn new(transport: T, codec: C, config: Arc<ArcSwap<EngineConfig>>) -> Result<Self, EngineError> {
        let timerfd = TimerFd::new(ClockId::CLOCK_MONOTONIC, TimerFlags::TFD_NONBLOCK)
            .map_err(|e| EngineError::new(crate::error::ErrorKind::SendFailed, format!("timerfd_create: {e}")))?;
        Ok(Self {
            transport,
            codec,
            clock: MonotonicClock,
            rng: rand::rng(),
            registry: DeviceRegistry::new(),
            timerfd,
            config,
        })
    }

    pub fn devices_mut(&mut self) -> &mut DeviceRegistry {
        &mut self.registry
    }

    /// One full iteration: re-arm the timer to the earliest deadline, block
    /// on `poll`, then drain whichever fd(s) became readable. FIFO within
    /// an iteration: the socket is drained before expired timers are
    /// dispatched, matching registration order (socket registered first).
    pub fn tick(&mut self, poll_timeout: Duration) -> Vec<EngineEvent> {
        self.rearm_timer();

        let transport_fd = self.transport.raw_fd();
        let transport_borrowed: BorrowedFd = unsafe { BorrowedFd::borrow_raw(transport_fd) };
        let timer_borrowed: BorrowedFd = self.timerfd.as_fd();

        let mut fds = [
            PollFd::new(transport_borrowed, PollFlags::POLLIN),
            PollFd::new(timer_borrowed, PollFlags::POLLIN),
        ];

        let timeout = PollTimeout::try_from(poll_timeout).unwrap_or(PollTimeout::MAX);
        match nix::poll::poll(&mut fds, timeout) {
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => return Vec::new(),
            Err(e) => {
                error!(error = %e, "poll() failed");
                return Vec::new();
            }
        }

        let mut out = Vec::new();
        if fds[0].revents().is_some_and(|r| r.contains(PollFlags::POLLIN)) {
            self.drain_socket(&mut out);
        }
        if fds[1].revents().is_some_and(|r| r.contains(PollFlags::POLLIN)) {
            let _ = self.timerfd.wait();
            self.drain_timers(&mut out);
        }
        out
    }

    fn drain_socket(&mut self, out: &mut Vec<EngineEvent>) {
        let mut buf = vec![0u8; WBUF_SIZE];
        loop {
            match self.transport.recv(&mut buf) {
                Ok(Some((len, addr, ifindex))) => {
                    let Some(handle) = self.registry.get(ifindex) else {
                        continue;
                    };
                    let inbound = match self.codec.decode(&buf[..len], addr) {
                        Ok(inbound) => inbound,
                        Err(e) => {
                            warn!(error = %e, "dropping unparseable DHCPv6 datagram");
                            continue;
                        }
                    };
                    let mut device = handle.borrow_mut();
                    let outcome = fsm::poll(&mut device, Event::Inbound(inbound), &self.clock, &mut self.rng);
                    self.apply_outcome(&mut device, ifindex, outcome, out);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "socket recv error, continuing");
                    break;
                }
            }
        }
    }

    fn drain_timers(&mut self, out: &mut Vec<EngineEvent>) {
        let now = self.clock.now();
        let ifindices: Vec<u32> = self.registry.ifindices();
        for ifindex in ifindices {
            let Some(handle) = self.registry.get(ifindex) else {
                continue;
            };
            let mut device = handle.borrow_mut();
            if device.timer.is_due(&self.clock) {
                let outcome = fsm::poll(&mut device, Event::Timer, &self.clock, &mut self.rng);
                self.apply_outcome(&mut device, ifindex, outcome, out);
            }
            if device.mrd_timer.deadline().is_some_and(|d| now >= d) {
                let outcome = fsm::poll(&mut device, Event::MrdTimer, &self.clock, &mut self.rng);
                self.apply_outcome(&mut device, ifindex, outcome, out);
            }
        }
    }

    fn apply_outcome(&mut self, device: &mut Device, ifindex: u32, outcome: fsm::FsmOutcome, out: &mut Vec<EngineEvent>) {
        for action in outcome.actions {
            match action {
                Action::Send(outbound) => {
                    let dest = device
                        .server_addr
                        .filter(|_| matches!(device.state, FsmState::Renewing | FsmState::Releasing | FsmState::Declining))
                        .unwrap_or(crate::transport::ALL_DHCP_SERVERS);
                    let bytes = self.codec.encode(&outbound);
                    if let Err(e) = self.transport.send(ifindex, dest, &bytes) {
                        warn!(error = %e, ifindex, "send failed");
                    }
                }
                Action::ArmTimer(_) | Action::ArmMrdTimer(_) => {
                    // Deadlines are already recorded on `device.timer`/`device.mrd_timer`
                    // by the FSM; `rearm_timer` picks up the new minimum next tick.
                }
                Action::CancelTimer => device.timer.cancel(),
                Action::CancelMrdTimer => device.mrd_timer.cancel(),
                Action::LeaseReady(lease) => {
                    out.push(EngineEvent::LeaseReady { ifindex, lease });
                }
                Action::LeaseFailed(error) => {
                    out.push(EngineEvent::LeaseFailed { ifindex, error });
                }
            }
        }
    }

    fn rearm_timer(&mut self) {
        let now = self.clock.now();
        let mut earliest: Option<Instant> = None;
        for ifindex in self.registry.ifindices() {
            if let Some(handle) = self.registry.get(ifindex) {
                let device = handle.borrow();
                for deadline in [device.timer.deadline(), device.mrd_timer.deadline()].into_iter().flatten() {
                    earliest = Some(earliest.map_or(deadline, |e| e.min(deadline)));
                }
            }
        }
        let Some(deadline) = earliest else {
            let _ = self.timerfd.unset();
            return;
        };
        let wait = deadline.saturating_duration_since(now).max(Duration::from_millis(1));
        let spec = TimeSpec::from_duration(wait);
        if let Err(e) = self
            .timerfd
            .set(Expiration::OneShot(spec), TimerSetTimeFlags::empty())
        {
            error!(error = %e, "failed to arm timerfd");
        }
    }

    /// Forward Acquire into a Device's FSM, creating it if this is the
    /// first acquisition on `ifindex`.
    pub fn acquire(&mut self, ifindex: u32, ifname: &str, duid: crate::identity::Duid, iaid: u32, request: crate::config::AcquireRequest) -> Vec<EngineEvent> {
        let clock = &self.clock;
        let handle = self
            .registry
            .get_or_insert_with(ifindex, || Device::new(ifindex, ifname, duid, iaid, clock));
        let mut device = handle.borrow_mut();
        device.server_policy = self.config.load().server_policy.clone();
        let outcome = fsm::poll(&mut device, Event::Acquire(request), &self.clock, &mut self.rng);
        let mut out = Vec::new();
        self.apply_outcome(&mut device, ifindex, outcome, &mut out);
        info!(ifindex, "acquisition started");
        out
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::net::Ipv6Addr;
    use std::os::fd::{AsRawFd, RawFd};
    use std::sync::Arc;

    use arc_swap::ArcSwap;
    use uuid::Uuid;

    use super::*;
    use crate::clock::MonotonicClock;
    use crate::codec::DhcprotoCodec;
    use crate::config::{AcquireRequest, IaRequest};
    use crate::lease::IaType;

    /// In-memory `Transport` double: records sent datagrams and never has
    /// anything to `recv` — this test only drives the Solicit initial-delay
    /// -> first-send transition, not a full exchange with a server. `/dev/null`
    /// stands in for the socket fd `poll` watches alongside the timerfd.
    struct RecordingTransport {
        sent: RefCell<Vec<(u32, Ipv6Addr, Vec<u8>)>>,
        dev_null: std::fs::File,
    }

    impl RecordingTransport {
        fn new() -> Self {
            Self {
                sent: RefCell::new(Vec::new()),
                dev_null: std::fs::File::open("/dev/null").expect("/dev/null"),
            }
        }
    }

    impl Transport for RecordingTransport {
        fn send(&self, ifindex: u32, dest: Ipv6Addr, buf: &[u8]) -> Result<usize, EngineError> {
            self.sent.borrow_mut().push((ifindex, dest, buf.to_vec()));
            Ok(buf.len())
        }

        fn recv(&self, _buf: &mut [u8]) -> Result<Option<(usize, Ipv6Addr, u32)>, EngineError> {
            Ok(None)
        }

        fn raw_fd(&self) -> RawFd {
            self.dev_null.as_raw_fd()
        }
    }

    fn duid() -> Duid {
        Duid::new(vec![0, 3, 0, 1, 1, 2, 3, 4, 5, 6]).unwrap()
    }

    fn acquire_request() -> AcquireRequest {
        AcquireRequest {
            uuid: Uuid::nil(),
            update_mask: 0,
            info_only: false,
            rapid_commit: false,
            preferred_lifetime: None,
            client_duid: None,
            ia_list: vec![IaRequest {
                iaid: 1,
                ia_type: IaType::NonTemporary,
                hinted_addr: None,
                hinted_prefix_len: None,
                t1_hint: None,
                t2_hint: None,
            }],
            hostname: None,
            user_class: vec![],
            vendor_class: None,
            vendor_opts: None,
        }
    }

    /// Exercises a full `tick()`, not just the FSM in isolation: the
    /// Solicit exchange's initial pre-send delay must actually arm
    /// `device.timer`, and the reactor's `timerfd`-driven `drain_timers`
    /// must pick that deadline up and dispatch `Event::Timer`, turning it
    /// into a real Solicit transmission (`spec.md` §8 Scenario 1).
    #[test]
    fn tick_drives_initial_delay_into_first_solicit_send() {
        let transport = RecordingTransport::new();
        let config = Arc::new(ArcSwap::from_pointee(crate::config::EngineConfig::default()));
        let mut reactor = Reactor::new(transport, DhcprotoCodec, config).unwrap();

        let local_clock = MonotonicClock;
        reactor
            .devices_mut()
            .get_or_insert_with(2, || Device::new(2, "eth0", duid(), 1, &local_clock))
            .borrow_mut()
            .lladdr = Some("fe80::1".parse().unwrap());
        reactor.acquire(2, "eth0", duid(), 1, acquire_request());

        {
            let handle = reactor.devices_mut().get(2).unwrap();
            let device = handle.borrow();
            assert_eq!(device.state, FsmState::Selecting);
            assert!(device.timer.deadline().is_some(), "initial delay must arm device.timer");
            assert!(reactor.transport.sent.borrow().is_empty());
        }

        // Solicit's initial delay is ~1s (+-10% jitter); give the real
        // poll/timerfd enough slack to fire within one tick.
        reactor.tick(Duration::from_secs(2));

        assert_eq!(reactor.transport.sent.borrow().len(), 1, "initial delay firing should send the first Solicit");
        let handle = reactor.devices_mut().get(2).unwrap();
        let device = handle.borrow();
        assert!(device.retrans.start.is_some(), "first_arm must stamp retrans.start for Elapsed-Time");
        assert!(device.timer.deadline().is_some(), "RT0 must be re-armed after the first send");
    }
}

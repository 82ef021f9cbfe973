//! The FSM (C5): `spec.md` §4.5 transition table, implemented as a free
//! function operating on `&mut Device` (matching the teacher's style of
//! free functions over borrowed state, see `v6::handlers::handle_*`).

use std::time::Duration;

use rand::RngCore;
use uuid::Uuid;

use crate::clock::Clock;
use crate::codec::{Inbound, IaOptionOut, MsgType, Outbound, StatusCode};
use crate::config::{AcquireRequest, AttemptConfig};
use crate::device::{Device, FsmState};
use crate::error::{EngineError, ErrorKind};
use crate::identity::Duid;
use crate::lease::{BestOffer, IaAssignment, IaRecord, Lease};
use crate::policy::{Advertised, ServerPolicy};

#[derive(Debug, Clone)]
pub enum Event {
    Acquire(AcquireRequest),
    Timer,
    MrdTimer,
    Inbound(Inbound),
    AddressUpdate,
    AddressDelete,
    LinkUp,
    LinkDown,
    Release,
}

#[derive(Debug, Clone)]
pub enum Action {
    Send(Outbound),
    ArmTimer(Duration),
    ArmMrdTimer(Duration),
    CancelTimer,
    CancelMrdTimer,
    LeaseReady(Lease),
    LeaseFailed(EngineError),
}

#[derive(Debug, Clone, Default)]
pub struct FsmOutcome {
    pub actions: Vec<Action>,
}

impl FsmOutcome {
    pub fn none() -> Self {
        Self::default()
    }

    fn push(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }
}

/// Entry point: apply one event to `device`, returning the side-effecting
/// actions the caller (reactor/transport) must carry out. Never panics on
/// an event the current state doesn't expect — unexpected events are
/// ignored, matching the teacher's defensive handler style.
pub fn poll(device: &mut Device, event: Event, clock: &dyn Clock, rng: &mut dyn RngCore) -> FsmOutcome {
    if let Event::Release = event {
        return release(device, clock, rng);
    }

    match device.state {
        FsmState::Init => init(device, event, clock, rng),
        FsmState::WaitReady => wait_ready(device, event, clock, rng),
        FsmState::Selecting => selecting(device, event, clock, rng),
        FsmState::Requesting => requesting(device, event, clock, rng),
        FsmState::ValidateOffer => FsmOutcome::none(),
        FsmState::Bound => bound(device, event, clock, rng),
        FsmState::Renewing => renewing(device, event, clock, rng),
        FsmState::Rebinding => rebinding(device, event, clock, rng),
        FsmState::Confirming => confirming(device, event, clock, rng),
        FsmState::Declining | FsmState::InfoRequest | FsmState::Releasing => {
            in_flight_exchange(device, event, clock, rng)
        }
        FsmState::Stopped => FsmOutcome::none(),
    }
}

fn random_xid(rng: &mut dyn RngCore) -> [u8; 3] {
    let mut xid = [0u8; 3];
    rng.fill_bytes(&mut xid);
    xid
}

fn default_ia_list(device: &Device) -> Vec<crate::config::IaRequest> {
    vec![crate::config::IaRequest {
        iaid: device.iaid,
        ia_type: crate::lease::IaType::NonTemporary,
        hinted_addr: None,
        hinted_prefix_len: None,
        t1_hint: None,
        t2_hint: None,
    }]
}

fn ia_out_list(config: &AttemptConfig, device: &Device) -> Vec<IaOptionOut> {
    let ia_list = if config.ia_list.is_empty() {
        default_ia_list(device)
    } else {
        config.ia_list.clone()
    };
    ia_list
        .into_iter()
        .map(|ia| IaOptionOut {
            iaid: ia.iaid,
            ia_type: ia.ia_type,
            hinted_addr: ia.hinted_addr,
            hinted_prefix_len: ia.hinted_prefix_len,
            t1_hint: ia.t1_hint,
            t2_hint: ia.t2_hint,
        })
        .collect()
}

fn base_outbound(device: &Device, msg_type: MsgType, xid: [u8; 3]) -> Outbound {
    let config = device.config.as_ref();
    Outbound {
        msg_type,
        xid,
        client_duid: config.map(|c| c.client_duid.clone()).unwrap_or_else(|| device.duid.clone()),
        server_duid: None,
        elapsed_hundredths: 0,
        rapid_commit: config.map(|c| c.rapid_commit).unwrap_or(false),
        ia: config.map(|c| ia_out_list(c, device)).unwrap_or_default(),
        oro: vec![23, 24, 39], // DNS servers, domain list, FQDN — always requested
        user_class: config.map(|c| c.user_class.clone()).unwrap_or_default(),
        vendor_class: config.map(|c| (c.vendor_class.enterprise, c.vendor_class.data.clone())),
        vendor_opts: config
            .and_then(|c| c.vendor_opts.as_ref())
            .map(|v| (v.enterprise, v.opts.clone())),
        hostname: config.and_then(|c| c.hostname.clone()),
        reconf_accept: false,
    }
}

/// RFC 3315 §17.1.2: Solicit/Confirm/Information-Request get a uniform
/// `[0, initial_delay_ms]` pre-send delay before the first retransmission
/// timer is armed.
fn start_exchange(
    device: &mut Device,
    kind: crate::retrans::MessageKind,
    msg_type: MsgType,
    clock: &dyn Clock,
    rng: &mut dyn RngCore,
) -> FsmOutcome {
    device.retrans = crate::retrans::RetransState::new(kind.default_params());
    device.xid = Some(random_xid(rng));
    device.best_offer = BestOffer::none();

    if let Some(delay_deadline) = device.retrans.arm_initial_delay(clock, rng) {
        return FsmOutcome::none().push(arm_timer_action(device, delay_deadline, clock));
    }
    arm_first_rt(device, msg_type, clock, rng, FsmOutcome::none())
}

fn arm_first_rt(
    device: &mut Device,
    msg_type: MsgType,
    clock: &dyn Clock,
    rng: &mut dyn RngCore,
    mut out: FsmOutcome,
) -> FsmOutcome {
    let strictly_positive = matches!(msg_type, MsgType::Solicit);
    let deadline = device.retrans.first_arm(clock, rng, strictly_positive);
    device.xid.get_or_insert_with(|| random_xid(rng));
    let xid = device.xid.unwrap();
    let elapsed = device.uptime(clock, 65535);
    let mut outbound = base_outbound(device, msg_type, xid);
    outbound.elapsed_hundredths = elapsed;
    out.actions.push(Action::Send(outbound));
    out.actions.push(arm_timer_action(device, deadline, clock));
    out
}

fn init(device: &mut Device, event: Event, clock: &dyn Clock, rng: &mut dyn RngCore) -> FsmOutcome {
    let Event::Acquire(request) = event else {
        return FsmOutcome::none();
    };
    let config = AttemptConfig::from_request(&request, &device.duid);
    let info_only = config.info_only;
    device.set_request(request);
    device.set_config(config);

    match device.find_lladdr_status() {
        LladdrReadiness::Ready => {
            device.state = if info_only {
                FsmState::InfoRequest
            } else {
                FsmState::Selecting
            };
            let msg_type = if info_only { MsgType::InformationRequest } else { MsgType::Solicit };
            let kind = if info_only {
                crate::retrans::MessageKind::InformationRequest
            } else {
                crate::retrans::MessageKind::Solicit
            };
            start_exchange(device, kind, msg_type, clock, rng)
        }
        LladdrReadiness::Wait => {
            device.state = FsmState::WaitReady;
            device.fail_on_timeout = true;
            device.timer.arm_after(clock, Duration::from_millis(crate::config::WAIT_READY_MSEC));
            FsmOutcome::none().push(Action::ArmTimer(
                deadline_duration(&device.timer, clock),
            ))
        }
    }
}

fn deadline_duration(timer: &crate::clock::Timer, clock: &dyn Clock) -> Duration {
    timer
        .deadline()
        .map(|d| d.saturating_duration_since(clock.now()))
        .unwrap_or_default()
}

/// Arms `device.timer` to `deadline` and returns the matching `ArmTimer`
/// action. The reactor's `rearm_timer`/`drain_timers` read
/// `device.timer.deadline()`/`is_due()` directly, so every `ArmTimer`
/// action must be paired with the arm that backs it.
fn arm_timer_action(device: &mut Device, deadline: std::time::Instant, clock: &dyn Clock) -> Action {
    device.timer.arm(deadline);
    Action::ArmTimer(deadline.saturating_duration_since(clock.now()))
}

/// Timer fired in a retransmitting state: distinguishes the initial
/// pre-send delay expiring (`retrans.count == 0`, no RT armed yet) from a
/// genuine retransmission timeout. Solicit/Information-Request carry a
/// uniform pre-send delay (`spec.md` §4.3/§17.1.2); when it fires, the
/// first real transmission must go through `first_arm` so `retrans.start`
/// is stamped (Elapsed-Time, §4.4/§6) and Selecting's strictly-positive
/// RAND rule (§8.2) applies, rather than being treated as a retransmit.
fn advance_or_first_send(
    device: &mut Device,
    msg_type: MsgType,
    clock: &dyn Clock,
    rng: &mut dyn RngCore,
) -> Option<std::time::Instant> {
    if device.retrans.count == 0 {
        let strictly_positive = matches!(msg_type, MsgType::Solicit);
        Some(device.retrans.first_arm(clock, rng, strictly_positive))
    } else {
        device.retrans.advance(clock, rng)
    }
}

enum LladdrReadiness {
    Ready,
    Wait,
}

impl Device {
    fn find_lladdr_status(&self) -> LladdrReadiness {
        if self.lladdr.is_some() {
            LladdrReadiness::Ready
        } else {
            LladdrReadiness::Wait
        }
    }
}

fn wait_ready(device: &mut Device, event: Event, clock: &dyn Clock, rng: &mut dyn RngCore) -> FsmOutcome {
    match event {
        Event::AddressUpdate => {
            if device.lladdr.is_none() {
                return FsmOutcome::none();
            }
            device.timer.cancel();
            let info_only = device.config.as_ref().is_some_and(|c| c.info_only);
            device.state = if info_only { FsmState::InfoRequest } else { FsmState::Selecting };
            let msg_type = if info_only { MsgType::InformationRequest } else { MsgType::Solicit };
            let kind = if info_only {
                crate::retrans::MessageKind::InformationRequest
            } else {
                crate::retrans::MessageKind::Solicit
            };
            let mut out = FsmOutcome::none().push(Action::CancelTimer);
            out.actions.extend(start_exchange(device, kind, msg_type, clock, rng).actions);
            out
        }
        Event::Timer => {
            if device.timer.is_due(clock) {
                device.fail_on_timeout = false;
                let err = EngineError::new(ErrorKind::NoLinklocal, device.ifname.clone());
                device.stop();
                FsmOutcome::none().push(Action::LeaseFailed(err))
            } else {
                FsmOutcome::none()
            }
        }
        _ => FsmOutcome::none(),
    }
}

fn selecting(device: &mut Device, event: Event, clock: &dyn Clock, rng: &mut dyn RngCore) -> FsmOutcome {
    match event {
        Event::Inbound(inbound) => handle_advertise_or_rapid_reply(device, inbound, clock, rng),
        Event::Timer => {
            if !device.timer.is_due(clock) {
                return FsmOutcome::none();
            }
            if device.best_offer.is_present() {
                device.state = FsmState::Requesting;
                let mut out = FsmOutcome::none().push(Action::CancelTimer);
                out.actions.extend(start_request(device, clock, rng).actions);
                out
            } else {
                match advance_or_first_send(device, MsgType::Solicit, clock, rng) {
                    Some(deadline) => {
                        let xid = device.xid.unwrap_or_else(|| random_xid(rng));
                        device.xid = Some(xid);
                        let elapsed = device.uptime(clock, 65535);
                        let mut outbound = base_outbound(device, MsgType::Solicit, xid);
                        outbound.elapsed_hundredths = elapsed;
                        FsmOutcome::none()
                            .push(Action::Send(outbound))
                            .push(arm_timer_action(device, deadline, clock))
                    }
                    None => {
                        let err = EngineError::new(ErrorKind::MRCExceeded, "Solicit".into());
                        device.stop();
                        FsmOutcome::none().push(Action::LeaseFailed(err))
                    }
                }
            }
        }
        _ => FsmOutcome::none(),
    }
}

fn handle_advertise_or_rapid_reply(
    device: &mut Device,
    inbound: Inbound,
    clock: &dyn Clock,
    rng: &mut dyn RngCore,
) -> FsmOutcome {
    if device.xid != Some(inbound.xid) {
        return FsmOutcome::none();
    }

    if inbound.msg_type == MsgType::Reply && inbound.rapid_commit && device.config.as_ref().is_some_and(|c| c.rapid_commit) {
        return install_lease(device, inbound, clock).unwrap_or_else(FsmOutcome::none);
    }

    if inbound.msg_type != MsgType::Advertise {
        return FsmOutcome::none();
    }

    let Some(server_duid) = inbound.server_duid.clone() else {
        return FsmOutcome::none();
    };
    let candidate = Advertised {
        server_addr: inbound.server_addr,
        server_duid: server_duid.clone(),
        preference: inbound.preference.unwrap_or(0),
    };
    let Some(weight) = device.server_policy.score(&candidate) else {
        return FsmOutcome::none();
    };

    if let Some(lease) = lease_from_inbound(device, &inbound, server_duid, clock) {
        let replaced = device.best_offer.consider(weight, lease);
        if replaced && ServerPolicy::is_immediate_selection(weight) {
            device.server_addr = Some(inbound.server_addr);
            device.state = FsmState::Requesting;
            let mut out = FsmOutcome::none().push(Action::CancelTimer);
            out.actions.extend(start_request(device, clock, rng).actions);
            return out;
        }
        if replaced {
            device.server_addr = Some(inbound.server_addr);
        }
    }
    FsmOutcome::none()
}

fn start_request(device: &mut Device, clock: &dyn Clock, rng: &mut dyn RngCore) -> FsmOutcome {
    device.retrans = crate::retrans::RetransState::new(crate::retrans::MessageKind::Request.default_params());
    device.xid = Some(random_xid(rng));
    let deadline = device.retrans.first_arm(clock, rng, false);
    let xid = device.xid.unwrap();
    let elapsed = device.uptime(clock, 65535);
    let mut outbound = base_outbound(device, MsgType::Request, xid);
    outbound.elapsed_hundredths = elapsed;
    if let Some(offer) = &device.best_offer.lease {
        outbound.server_duid = Some(offer.server_duid.clone());
    }
    let arm = arm_timer_action(device, deadline, clock);
    FsmOutcome::none().push(Action::Send(outbound)).push(arm)
}

fn lease_from_inbound(device: &Device, inbound: &Inbound, server_duid: Duid, clock: &dyn Clock) -> Option<Lease> {
    if inbound.ia.is_empty() {
        return None;
    }
    let ia_records = inbound
        .ia
        .iter()
        .map(|ia| IaRecord {
            iaid: ia.iaid,
            ia_type: ia.ia_type,
            t1: ia.t1,
            t2: ia.t2,
            assignments: ia
                .assignments
                .iter()
                .map(|a| IaAssignment {
                    addr: a.addr,
                    prefix_len: a.prefix_len,
                    preferred_lifetime: a.preferred_lifetime,
                    valid_lifetime: a.valid_lifetime,
                })
                .collect(),
        })
        .collect();
    Some(Lease {
        uuid: device.request.as_ref().map(|r| r.uuid).unwrap_or_else(Uuid::nil),
        server_duid,
        ia_records,
        granted_at: clock.now(),
    })
}

fn requesting(device: &mut Device, event: Event, clock: &dyn Clock, rng: &mut dyn RngCore) -> FsmOutcome {
    match event {
        Event::Inbound(inbound) => {
            if device.xid != Some(inbound.xid) || inbound.msg_type != MsgType::Reply {
                return FsmOutcome::none();
            }
            if let Some((status, _)) = &inbound.status {
                if *status != StatusCode::Success {
                    device.best_offer.reset();
                    device.state = FsmState::Selecting;
                    return resume_selecting(device, clock, rng);
                }
            }
            install_lease(device, inbound, clock).unwrap_or_else(FsmOutcome::none)
        }
        Event::Timer => {
            if !device.timer.is_due(clock) {
                return FsmOutcome::none();
            }
            match device.retrans.advance(clock, rng) {
                Some(deadline) => {
                    let xid = device.xid.unwrap();
                    let elapsed = device.uptime(clock, 65535);
                    let mut outbound = base_outbound(device, MsgType::Request, xid);
                    outbound.elapsed_hundredths = elapsed;
                    if let Some(offer) = &device.best_offer.lease {
                        outbound.server_duid = Some(offer.server_duid.clone());
                    }
                    let arm = arm_timer_action(device, deadline, clock);
                    FsmOutcome::none().push(Action::Send(outbound)).push(arm)
                }
                None => {
                    device.best_offer.reset();
                    device.state = FsmState::Selecting;
                    resume_selecting(device, clock, rng)
                }
            }
        }
        _ => FsmOutcome::none(),
    }
}

/// Requesting -> Selecting restart (MRC exceeded): resume soliciting rather
/// than re-running the full Init entry path.
fn resume_selecting(device: &mut Device, clock: &dyn Clock, rng: &mut dyn RngCore) -> FsmOutcome {
    start_exchange(device, crate::retrans::MessageKind::Solicit, MsgType::Solicit, clock, rng)
}

fn install_lease(device: &mut Device, inbound: Inbound, clock: &dyn Clock) -> Option<FsmOutcome> {
    let server_duid = inbound.server_duid.clone()?;
    let lease = lease_from_inbound(device, &inbound, server_duid, clock)?;
    device.retrans.disarm();
    device.timer.cancel();
    device.mrd_timer.cancel();
    device.best_offer.reset();
    device.state = FsmState::Bound;
    let renew_at = lease.earliest_renew();
    device.set_lease(lease.clone());
    let mut out = FsmOutcome::none()
        .push(Action::CancelTimer)
        .push(Action::LeaseReady(lease));
    if let Some(renew_at) = renew_at {
        out.actions.push(arm_timer_action(device, renew_at, clock));
    }
    Some(out)
}

fn bound(device: &mut Device, event: Event, clock: &dyn Clock, rng: &mut dyn RngCore) -> FsmOutcome {
    match event {
        Event::Timer => {
            if !device.timer.is_due(clock) {
                return FsmOutcome::none();
            }
            device.state = FsmState::Renewing;
            start_renew_rebind(device, MsgType::Renew, clock, rng)
        }
        Event::LinkUp => {
            device.state = FsmState::Confirming;
            start_confirm(device, clock, rng)
        }
        _ => FsmOutcome::none(),
    }
}

fn start_renew_rebind(device: &mut Device, msg_type: MsgType, clock: &dyn Clock, rng: &mut dyn RngCore) -> FsmOutcome {
    let kind = if msg_type == MsgType::Renew {
        crate::retrans::MessageKind::Renew
    } else {
        crate::retrans::MessageKind::Rebind
    };
    device.retrans = crate::retrans::RetransState::new(kind.default_params());
    if let Some(lease) = &device.lease {
        if let (Some(rebind_at), Some(expiry)) = (lease.earliest_rebind(), lease.earliest_expiry()) {
            let bound_ms = if msg_type == MsgType::Renew {
                rebind_at.saturating_duration_since(clock.now()).as_millis() as u64
            } else {
                expiry.saturating_duration_since(clock.now()).as_millis() as u64
            };
            device.retrans.set_mrd(bound_ms);
        }
    }
    device.xid = Some(random_xid(rng));
    let deadline = device.retrans.first_arm(clock, rng, false);
    let xid = device.xid.unwrap();
    let elapsed = device.uptime(clock, 65535);
    let mut outbound = base_outbound(device, msg_type, xid);
    outbound.elapsed_hundredths = elapsed;
    if msg_type == MsgType::Renew {
        if let Some(lease) = &device.lease {
            outbound.server_duid = Some(lease.server_duid.clone());
        }
    }
    let arm = arm_timer_action(device, deadline, clock);
    FsmOutcome::none().push(Action::Send(outbound)).push(arm)
}

fn start_confirm(device: &mut Device, clock: &dyn Clock, rng: &mut dyn RngCore) -> FsmOutcome {
    let mut out = start_exchange(device, crate::retrans::MessageKind::Confirm, MsgType::Confirm, clock, rng);
    let mrd_ms = device.retrans.duration_ms;
    if mrd_ms > 0 {
        device.mrd_timer.arm_after(clock, Duration::from_millis(mrd_ms));
        out.actions.push(Action::ArmMrdTimer(Duration::from_millis(mrd_ms)));
    }
    out
}

fn renewing(device: &mut Device, event: Event, clock: &dyn Clock, rng: &mut dyn RngCore) -> FsmOutcome {
    match event {
        Event::Inbound(inbound) => {
            if device.xid != Some(inbound.xid) || inbound.msg_type != MsgType::Reply {
                return FsmOutcome::none();
            }
            install_lease(device, inbound, clock).unwrap_or_else(FsmOutcome::none)
        }
        Event::Timer => {
            if !device.timer.is_due(clock) {
                return FsmOutcome::none();
            }
            let t2_due = device
                .lease
                .as_ref()
                .and_then(|l| l.earliest_rebind())
                .is_some_and(|t2| clock.now() >= t2);
            if t2_due {
                device.state = FsmState::Rebinding;
                return start_renew_rebind(device, MsgType::Rebind, clock, rng);
            }
            match device.retrans.advance(clock, rng) {
                Some(deadline) => {
                    let xid = device.xid.unwrap();
                    let elapsed = device.uptime(clock, 65535);
                    let mut outbound = base_outbound(device, MsgType::Renew, xid);
                    outbound.elapsed_hundredths = elapsed;
                    if let Some(lease) = &device.lease {
                        outbound.server_duid = Some(lease.server_duid.clone());
                    }
                    let arm = arm_timer_action(device, deadline, clock);
                    FsmOutcome::none().push(Action::Send(outbound)).push(arm)
                }
                None => {
                    device.state = FsmState::Rebinding;
                    start_renew_rebind(device, MsgType::Rebind, clock, rng)
                }
            }
        }
        _ => FsmOutcome::none(),
    }
}

fn rebinding(device: &mut Device, event: Event, clock: &dyn Clock, rng: &mut dyn RngCore) -> FsmOutcome {
    match event {
        Event::Inbound(inbound) => {
            if device.xid != Some(inbound.xid) || inbound.msg_type != MsgType::Reply {
                return FsmOutcome::none();
            }
            install_lease(device, inbound, clock).unwrap_or_else(FsmOutcome::none)
        }
        Event::Timer => {
            if !device.timer.is_due(clock) {
                return FsmOutcome::none();
            }
            let expired = device
                .lease
                .as_ref()
                .and_then(|l| l.earliest_expiry())
                .is_some_and(|exp| clock.now() >= exp);
            if expired {
                device.lease = None;
                device.state = FsmState::Selecting;
                return resume_selecting(device, clock, rng);
            }
            match device.retrans.advance(clock, rng) {
                Some(deadline) => {
                    let xid = device.xid.unwrap();
                    let elapsed = device.uptime(clock, 65535);
                    let mut outbound = base_outbound(device, MsgType::Rebind, xid);
                    outbound.elapsed_hundredths = elapsed;
                    let arm = arm_timer_action(device, deadline, clock);
                    FsmOutcome::none().push(Action::Send(outbound)).push(arm)
                }
                None => {
                    device.lease = None;
                    device.state = FsmState::Selecting;
                    resume_selecting(device, clock, rng)
                }
            }
        }
        _ => FsmOutcome::none(),
    }
}

fn confirming(device: &mut Device, event: Event, clock: &dyn Clock, rng: &mut dyn RngCore) -> FsmOutcome {
    match event {
        Event::Inbound(inbound) => {
            if device.xid != Some(inbound.xid) || inbound.msg_type != MsgType::Reply {
                return FsmOutcome::none();
            }
            match &inbound.status {
                Some((StatusCode::NotOnLink, _)) => {
                    device.lease = None;
                    device.state = FsmState::Selecting;
                    resume_selecting(device, clock, rng)
                }
                _ => {
                    device.retrans.disarm();
                    device.timer.cancel();
                    device.state = FsmState::Bound;
                    FsmOutcome::none().push(Action::CancelTimer)
                }
            }
        }
        Event::Timer => {
            if !device.timer.is_due(clock) {
                return FsmOutcome::none();
            }
            match device.retrans.advance(clock, rng) {
                Some(deadline) => {
                    let xid = device.xid.unwrap();
                    let elapsed = device.uptime(clock, 65535);
                    let mut outbound = base_outbound(device, MsgType::Confirm, xid);
                    outbound.elapsed_hundredths = elapsed;
                    let arm = arm_timer_action(device, deadline, clock);
                    FsmOutcome::none().push(Action::Send(outbound)).push(arm)
                }
                None => {
                    device.lease = None;
                    device.state = FsmState::Selecting;
                    resume_selecting(device, clock, rng)
                }
            }
        }
        Event::MrdTimer => {
            if device.mrd_timer.is_due(clock) {
                device.lease = None;
                device.state = FsmState::Selecting;
                return resume_selecting(device, clock, rng);
            }
            FsmOutcome::none()
        }
        _ => FsmOutcome::none(),
    }
}

/// Declining/InfoRequest/Releasing: generic in-flight exchange handling for
/// the states this crate doesn't yet drive a dedicated caller path for
/// (Decline is triggered externally; Information-Request and Release have
/// dedicated entry/exit points but share the common retransmit-or-finish
/// shape here).
fn in_flight_exchange(device: &mut Device, event: Event, clock: &dyn Clock, rng: &mut dyn RngCore) -> FsmOutcome {
    match event {
        Event::Inbound(inbound) => {
            if device.xid != Some(inbound.xid) || inbound.msg_type != MsgType::Reply {
                return FsmOutcome::none();
            }
            device.stop();
            FsmOutcome::none().push(Action::CancelTimer)
        }
        Event::Timer => {
            if !device.timer.is_due(clock) {
                return FsmOutcome::none();
            }
            let msg_type = match device.state {
                FsmState::Declining => MsgType::Decline,
                FsmState::InfoRequest => MsgType::InformationRequest,
                FsmState::Releasing => MsgType::Release,
                _ => unreachable!(),
            };
            match advance_or_first_send(device, msg_type, clock, rng) {
                Some(deadline) => {
                    device.xid.get_or_insert_with(|| random_xid(rng));
                    let xid = device.xid.unwrap();
                    let elapsed = device.uptime(clock, 65535);
                    let mut outbound = base_outbound(device, msg_type, xid);
                    outbound.elapsed_hundredths = elapsed;
                    let arm = arm_timer_action(device, deadline, clock);
                    FsmOutcome::none().push(Action::Send(outbound)).push(arm)
                }
                None => {
                    device.stop();
                    FsmOutcome::none()
                }
            }
        }
        _ => FsmOutcome::none(),
    }
}

/// External release (`*` -> Stopped): send one Release with no retry
/// guarantee (`spec.md` §4.5 footer), then stop unconditionally.
fn release(device: &mut Device, clock: &dyn Clock, rng: &mut dyn RngCore) -> FsmOutcome {
    let mut out = FsmOutcome::none();
    if let Some(lease) = device.lease.clone() {
        let xid = random_xid(rng);
        let elapsed = device.uptime(clock, 65535);
        let mut outbound = base_outbound(device, MsgType::Release, xid);
        outbound.server_duid = Some(lease.server_duid);
        outbound.elapsed_hundredths = elapsed;
        out.actions.push(Action::Send(outbound));
    }
    device.stop();
    out.actions.push(Action::CancelTimer);
    out.actions.push(Action::CancelMrdTimer);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;
    use crate::config::IaRequest;
    use crate::lease::IaType;

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

    /// Fixed-point `Clock` test double, advanceable by the test.
    struct FixedClock(std::cell::Cell<std::time::Instant>);
    impl Clock for FixedClock {
        fn now(&self) -> std::time::Instant {
            self.0.get()
        }
    }

    #[test]
    fn acquire_with_ready_lladdr_moves_to_selecting_and_arms_initial_delay() {
        // Solicit carries a uniform pre-send delay (`spec.md` §4.3), so
        // Acquire only arms a timer here; the Solicit itself is sent once
        // that delay fires (see `selecting_timer_after_initial_delay_sends_first_solicit`).
        let clock = MonotonicClock;
        let mut rng = rand::rng();
        let mut device = Device::new(2, "eth0", duid(), 1, &clock);
        device.lladdr = Some("fe80::1".parse().unwrap());
        let outcome = poll(&mut device, Event::Acquire(acquire_request()), &clock, &mut rng);
        assert_eq!(device.state, FsmState::Selecting);
        assert!(!outcome.actions.iter().any(|a| matches!(a, Action::Send(_))));
        assert!(outcome.actions.iter().any(|a| matches!(a, Action::ArmTimer(_))));
        assert!(device.timer.deadline().is_some());
    }

    #[test]
    fn selecting_timer_after_initial_delay_sends_first_solicit() {
        let clock = FixedClock(std::cell::Cell::new(std::time::Instant::now()));
        let mut rng = rand::rng();
        let mut device = Device::new(2, "eth0", duid(), 1, &clock);
        device.lladdr = Some("fe80::1".parse().unwrap());
        poll(&mut device, Event::Acquire(acquire_request()), &clock, &mut rng);
        assert!(device.retrans.start.is_none(), "initial delay must not stamp retrans.start yet");

        let deadline = device.timer.deadline().expect("initial delay armed");
        clock.0.set(deadline);
        let outcome = poll(&mut device, Event::Timer, &clock, &mut rng);

        assert!(outcome
            .actions
            .iter()
            .any(|a| matches!(a, Action::Send(o) if o.msg_type == MsgType::Solicit)));
        assert!(outcome.actions.iter().any(|a| matches!(a, Action::ArmTimer(_))));
        assert!(device.retrans.start.is_some(), "first_arm must stamp retrans.start for Elapsed-Time");
        assert!(device.timer.deadline().is_some(), "RT0 must be armed after the first send");
    }

    #[test]
    fn acquire_without_lladdr_waits() {
        let clock = MonotonicClock;
        let mut rng = rand::rng();
        let mut device = Device::new(2, "eth0", duid(), 1, &clock);
        poll(&mut device, Event::Acquire(acquire_request()), &clock, &mut rng);
        assert_eq!(device.state, FsmState::WaitReady);
        assert!(device.fail_on_timeout);
    }

    #[test]
    fn release_sends_one_message_and_stops() {
        let clock = MonotonicClock;
        let mut rng = rand::rng();
        let mut device = Device::new(2, "eth0", duid(), 1, &clock);
        device.state = FsmState::Bound;
        device.lease = Some(Lease {
            uuid: Uuid::nil(),
            server_duid: duid(),
            ia_records: vec![],
            granted_at: clock.now(),
        });
        let outcome = poll(&mut device, Event::Release, &clock, &mut rng);
        assert_eq!(device.state, FsmState::Init);
        assert_eq!(
            outcome
                .actions
                .iter()
                .filter(|a| matches!(a, Action::Send(_)))
                .count(),
            1
        );
    }
}

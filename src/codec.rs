//! Wire codec (C6): translates between the FSM's neutral message model and
//! DHCPv6 bytes on the wire (`spec.md` §4.6, §6 "Codec contract").
//!
//! The FSM and `Device` never touch `dhcproto` directly — they build and
//! consume [`Outbound`]/[`Inbound`], which `DhcprotoCodec` encodes/decodes.
//! This mirrors the teacher's extension-trait split between message
//! construction (`v6::handlers`) and the wire types (`dhcproto::v6`).

use std::net::Ipv6Addr;

use dhcproto::v6::{
    DhcpOption, DhcpOptions, IAAddr, IANA, IAPD, IAPrefix, IATA, Message, MessageType, OptionCode,
    Status, StatusCode as DhcprotoStatusCode,
};
use dhcproto::{Decodable, Decoder, Encodable};

use crate::error::{EngineError, ErrorKind};
use crate::identity::Duid;
use crate::lease::IaType;

/// Neutral message-type enum, decoupled from `dhcproto::v6::MessageType` so
/// the FSM can match on it without an extra crate dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Solicit,
    Advertise,
    Request,
    Confirm,
    Renew,
    Rebind,
    Reply,
    Release,
    Decline,
    Reconfigure,
    InformationRequest,
    RelayForw,
    RelayRepl,
}

impl From<MsgType> for MessageType {
    fn from(value: MsgType) -> Self {
        match value {
            MsgType::Solicit => MessageType::Solicit,
            MsgType::Advertise => MessageType::Advertise,
            MsgType::Request => MessageType::Request,
            MsgType::Confirm => MessageType::Confirm,
            MsgType::Renew => MessageType::Renew,
            MsgType::Rebind => MessageType::Rebind,
            MsgType::Reply => MessageType::Reply,
            MsgType::Release => MessageType::Release,
            MsgType::Decline => MessageType::Decline,
            MsgType::Reconfigure => MessageType::Reconfigure,
            MsgType::InformationRequest => MessageType::InformationRequest,
            MsgType::RelayForw => MessageType::RelayForw,
            MsgType::RelayRepl => MessageType::RelayRepl,
        }
    }
}

impl TryFrom<MessageType> for MsgType {
    type Error = EngineError;

    fn try_from(value: MessageType) -> Result<Self, Self::Error> {
        Ok(match value {
            MessageType::Solicit => MsgType::Solicit,
            MessageType::Advertise => MsgType::Advertise,
            MessageType::Request => MsgType::Request,
            MessageType::Confirm => MsgType::Confirm,
            MessageType::Renew => MsgType::Renew,
            MessageType::Rebind => MsgType::Rebind,
            MessageType::Reply => MsgType::Reply,
            MessageType::Release => MsgType::Release,
            MessageType::Decline => MsgType::Decline,
            MessageType::Reconfigure => MsgType::Reconfigure,
            MessageType::InformationRequest => MsgType::InformationRequest,
            MessageType::RelayForw => MsgType::RelayForw,
            MessageType::RelayRepl => MsgType::RelayRepl,
            other => {
                return Err(EngineError::new(
                    ErrorKind::ParseFailed,
                    format!("unexpected message type {other:?}"),
                ));
            }
        })
    }
}

/// An address or prefix requested in an outbound IA.
#[derive(Debug, Clone)]
pub struct IaOptionOut {
    pub iaid: u32,
    pub ia_type: IaType,
    pub hinted_addr: Option<Ipv6Addr>,
    pub hinted_prefix_len: Option<u8>,
    pub t1_hint: Option<u32>,
    pub t2_hint: Option<u32>,
}

/// Everything needed to build one outbound DHCPv6 message.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub msg_type: MsgType,
    pub xid: [u8; 3],
    pub client_duid: Duid,
    pub server_duid: Option<Duid>,
    pub elapsed_hundredths: u16,
    pub rapid_commit: bool,
    pub ia: Vec<IaOptionOut>,
    pub oro: Vec<u16>,
    pub user_class: Vec<Vec<u8>>,
    pub vendor_class: Option<(u32, Vec<Vec<u8>>)>,
    pub vendor_opts: Option<(u32, Vec<(u16, Vec<u8>)>)>,
    pub hostname: Option<String>,
    pub reconf_accept: bool,
}

/// One address or prefix granted in an inbound IA.
#[derive(Debug, Clone)]
pub struct IaAssignmentIn {
    pub addr: std::net::IpAddr,
    pub prefix_len: u8,
    pub preferred_lifetime: u32,
    pub valid_lifetime: u32,
}

/// Neutral status-code, decoupled from `dhcproto::v6::Status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Success,
    UnspecFail,
    NoAddrsAvail,
    NoBinding,
    NotOnLink,
    UseMulticast,
    NoPrefixAvail,
    Other(u16),
}

impl From<Status> for StatusCode {
    fn from(value: Status) -> Self {
        match value {
            Status::Success => StatusCode::Success,
            Status::UnspecFail => StatusCode::UnspecFail,
            Status::NoAddrsAvail => StatusCode::NoAddrsAvail,
            Status::NoBinding => StatusCode::NoBinding,
            Status::NotOnLink => StatusCode::NotOnLink,
            Status::UseMulticast => StatusCode::UseMulticast,
            Status::NoPrefixAvail => StatusCode::NoPrefixAvail,
            other => StatusCode::Other(u16::from(other)),
        }
    }
}

/// One decoded IA_NA/IA_TA/IA_PD, with its own status if the server rejected
/// it individually (RFC 8415 §18.3.9).
#[derive(Debug, Clone)]
pub struct IaRecordIn {
    pub iaid: u32,
    pub ia_type: IaType,
    pub t1: u32,
    pub t2: u32,
    pub assignments: Vec<IaAssignmentIn>,
    pub status: Option<(StatusCode, String)>,
}

/// A decoded inbound message, with only the fields the FSM needs.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub msg_type: MsgType,
    pub xid: [u8; 3],
    pub server_duid: Option<Duid>,
    pub client_duid: Option<Duid>,
    pub preference: Option<u8>,
    pub rapid_commit: bool,
    pub server_addr: Ipv6Addr,
    pub ia: Vec<IaRecordIn>,
    pub status: Option<(StatusCode, String)>,
}

pub trait MessageCodec {
    fn encode(&self, msg: &Outbound) -> Vec<u8>;
    fn decode(&self, bytes: &[u8], server_addr: Ipv6Addr) -> Result<Inbound, EngineError>;
}

/// Default `MessageCodec` built on `dhcproto::v6`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DhcprotoCodec;

fn ia_type_option_code(ia_type: IaType) -> OptionCode {
    match ia_type {
        IaType::NonTemporary => OptionCode::IANA,
        IaType::Temporary => OptionCode::IATA,
        IaType::PrefixDelegation => OptionCode::IAPD,
    }
}

fn build_ia_opts(hint: &IaOptionOut) -> DhcpOptions {
    let mut opts = DhcpOptions::new();
    match hint.ia_type {
        IaType::NonTemporary => {
            if let Some(addr) = hint.hinted_addr {
                opts.insert(DhcpOption::IAAddr(IAAddr {
                    addr,
                    preferred_life: 0,
                    valid_life: 0,
                    opts: DhcpOptions::new(),
                }));
            }
        }
        IaType::Temporary => {
            if let Some(addr) = hint.hinted_addr {
                opts.insert(DhcpOption::IAAddr(IAAddr {
                    addr,
                    preferred_life: 0,
                    valid_life: 0,
                    opts: DhcpOptions::new(),
                }));
            }
        }
        IaType::PrefixDelegation => {
            if let Some(prefix_len) = hint.hinted_prefix_len {
                opts.insert(DhcpOption::IAPrefix(IAPrefix {
                    prefix_len,
                    prefix_ip: hint.hinted_addr.unwrap_or(Ipv6Addr::UNSPECIFIED),
                    preferred_lifetime: 0,
                    valid_lifetime: 0,
                    opts: DhcpOptions::new(),
                }));
            }
        }
    }
    opts
}

impl MessageCodec for DhcprotoCodec {
    fn encode(&self, msg: &Outbound) -> Vec<u8> {
        let mut out = Message::new_with_id(msg.msg_type.into(), msg.xid);
        let opts = out.opts_mut();

        opts.insert(DhcpOption::ClientId(msg.client_duid.bytes.clone()));
        if let Some(server_duid) = &msg.server_duid {
            opts.insert(DhcpOption::ServerId(server_duid.bytes.clone()));
        }
        opts.insert(DhcpOption::ElapsedTime(msg.elapsed_hundredths));
        if msg.rapid_commit {
            opts.insert(DhcpOption::RapidCommit);
        }
        if msg.reconf_accept {
            opts.insert(DhcpOption::ReconfAccept);
        }

        for ia in &msg.ia {
            let ia_opts = build_ia_opts(ia);
            let opt = match ia.ia_type {
                IaType::NonTemporary => DhcpOption::IANA(IANA {
                    id: ia.iaid,
                    t1: ia.t1_hint.unwrap_or(0),
                    t2: ia.t2_hint.unwrap_or(0),
                    opts: ia_opts,
                }),
                IaType::Temporary => DhcpOption::IATA(IATA {
                    id: ia.iaid,
                    opts: ia_opts,
                }),
                IaType::PrefixDelegation => DhcpOption::IAPD(IAPD {
                    id: ia.iaid,
                    t1: ia.t1_hint.unwrap_or(0),
                    t2: ia.t2_hint.unwrap_or(0),
                    opts: ia_opts,
                }),
            };
            opts.insert(opt);
        }

        if !msg.oro.is_empty() {
            let codes = msg
                .oro
                .iter()
                .map(|code| OptionCode::from(*code))
                .collect();
            opts.insert(DhcpOption::ORO(dhcproto::v6::ORO { opts: codes }));
        }
        if !msg.user_class.is_empty() {
            opts.insert(DhcpOption::UserClass(dhcproto::v6::UserClass {
                data: msg.user_class.clone(),
            }));
        }
        if let Some((enterprise, data)) = &msg.vendor_class {
            opts.insert(DhcpOption::VendorClass(dhcproto::v6::VendorClass {
                num: *enterprise,
                data: data.clone(),
            }));
        }
        if let Some((enterprise, kv)) = &msg.vendor_opts {
            let mut vopts = DhcpOptions::new();
            for (code, data) in kv {
                vopts.insert(DhcpOption::Unknown(dhcproto::v6::UnknownOption::new(
                    OptionCode::from(*code),
                    data.clone(),
                )));
            }
            opts.insert(DhcpOption::VendorOpts(dhcproto::v6::VendorOpts {
                num: *enterprise,
                opts: vopts,
            }));
        }
        if let Some(hostname) = &msg.hostname {
            // RFC 4704 FQDN option (code 39): flags byte (0 = server decides
            // direction) followed by the raw domain-name label string. No
            // confirmed `dhcproto::v6::DhcpOption::Fqdn` variant was found
            // in the reference corpus, so this is encoded through the
            // generic `Unknown` escape hatch (see DESIGN.md).
            let mut data = vec![0u8];
            data.extend_from_slice(hostname.as_bytes());
            opts.insert(DhcpOption::Unknown(dhcproto::v6::UnknownOption::new(
                OptionCode::from(39u16),
                data,
            )));
        }

        let mut buf = Vec::with_capacity(crate::config::WBUF_SIZE);
        let mut encoder = dhcproto::v6::Encoder::new(&mut buf);
        // `Message::encode` only fails on a writer error; `Vec<u8>` never
        // fails to grow, so this is infallible in practice.
        out.encode(&mut encoder).expect("encoding to a Vec cannot fail");
        buf
    }

    fn decode(&self, bytes: &[u8], server_addr: Ipv6Addr) -> Result<Inbound, EngineError> {
        let msg = Message::decode(&mut Decoder::new(bytes))
            .map_err(|e| EngineError::new(ErrorKind::ParseFailed, e.to_string()))?;

        let msg_type = MsgType::try_from(msg.msg_type())?;
        let xid = msg.xid();

        let mut server_duid = None;
        let mut client_duid = None;
        let mut preference = None;
        let mut rapid_commit = false;
        let mut ia = Vec::new();
        let mut status = None;

        for opt in msg.opts().iter() {
            match opt {
                DhcpOption::ServerId(bytes) => {
                    server_duid = Duid::new(bytes.clone());
                }
                DhcpOption::ClientId(bytes) => {
                    client_duid = Duid::new(bytes.clone());
                }
                DhcpOption::Preference(p) => preference = Some(*p),
                DhcpOption::RapidCommit => rapid_commit = true,
                DhcpOption::StatusCode(sc) => {
                    status = Some(status_from(sc));
                }
                DhcpOption::IANA(iana) => ia.push(ia_record_from_iana(iana)),
                DhcpOption::IATA(iata) => ia.push(ia_record_from_iata(iata)),
                DhcpOption::IAPD(iapd) => ia.push(ia_record_from_iapd(iapd)),
                _ => {}
            }
        }

        Ok(Inbound {
            msg_type,
            xid,
            server_duid,
            client_duid,
            preference,
            rapid_commit,
            server_addr,
            ia,
            status,
        })
    }
}

fn status_from(sc: &DhcprotoStatusCode) -> (StatusCode, String) {
    (sc.status.into(), sc.msg.clone())
}

fn ia_record_from_iana(iana: &IANA) -> IaRecordIn {
    let mut status = None;
    let mut assignments = Vec::new();
    for opt in iana.opts.iter() {
        match opt {
            DhcpOption::IAAddr(addr) => assignments.push(IaAssignmentIn {
                addr: std::net::IpAddr::V6(addr.addr),
                prefix_len: 128,
                preferred_lifetime: addr.preferred_life,
                valid_lifetime: addr.valid_life,
            }),
            DhcpOption::StatusCode(sc) => status = Some(status_from(sc)),
            _ => {}
        }
    }
    IaRecordIn {
        iaid: iana.id,
        ia_type: IaType::NonTemporary,
        t1: iana.t1,
        t2: iana.t2,
        assignments,
        status,
    }
}

fn ia_record_from_iata(iata: &IATA) -> IaRecordIn {
    let mut status = None;
    let mut assignments = Vec::new();
    for opt in iata.opts.iter() {
        match opt {
            DhcpOption::IAAddr(addr) => assignments.push(IaAssignmentIn {
                addr: std::net::IpAddr::V6(addr.addr),
                prefix_len: 128,
                preferred_lifetime: addr.preferred_life,
                valid_lifetime: addr.valid_life,
            }),
            DhcpOption::StatusCode(sc) => status = Some(status_from(sc)),
            _ => {}
        }
    }
    IaRecordIn {
        iaid: iata.id,
        ia_type: IaType::Temporary,
        t1: 0,
        t2: 0,
        assignments,
        status,
    }
}

fn ia_record_from_iapd(iapd: &IAPD) -> IaRecordIn {
    let mut status = None;
    let mut assignments = Vec::new();
    for opt in iapd.opts.iter() {
        match opt {
            DhcpOption::IAPrefix(p) => assignments.push(IaAssignmentIn {
                addr: std::net::IpAddr::V6(p.prefix_ip),
                prefix_len: p.prefix_len,
                preferred_lifetime: p.preferred_lifetime,
                valid_lifetime: p.valid_lifetime,
            }),
            DhcpOption::StatusCode(sc) => status = Some(status_from(sc)),
            _ => {}
        }
    }
    IaRecordIn {
        iaid: iapd.id,
        ia_type: IaType::PrefixDelegation,
        t1: iapd.t1,
        t2: iapd.t2,
        assignments,
        status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_duid() -> Duid {
        Duid::new(vec![0, 3, 0, 1, 1, 2, 3, 4, 5, 6]).unwrap()
    }

    #[test]
    fn solicit_round_trips_client_id_and_elapsed_time() {
        let codec = DhcprotoCodec;
        let out = Outbound {
            msg_type: MsgType::Solicit,
            xid: [1, 2, 3],
            client_duid: client_duid(),
            server_duid: None,
            elapsed_hundredths: 0,
            rapid_commit: true,
            ia: vec![IaOptionOut {
                iaid: 42,
                ia_type: IaType::NonTemporary,
                hinted_addr: None,
                hinted_prefix_len: None,
                t1_hint: None,
                t2_hint: None,
            }],
            oro: vec![23, 24],
            user_class: vec![],
            vendor_class: None,
            vendor_opts: None,
            hostname: None,
            reconf_accept: false,
        };
        let bytes = codec.encode(&out);
        let server_addr: Ipv6Addr = "fe80::1".parse().unwrap();
        let decoded = codec.decode(&bytes, server_addr).unwrap();
        assert_eq!(decoded.msg_type, MsgType::Solicit);
        assert_eq!(decoded.xid, [1, 2, 3]);
        assert!(decoded.rapid_commit);
        assert_eq!(decoded.client_duid, Some(client_duid()));
        assert_eq!(decoded.ia.len(), 1);
        assert_eq!(decoded.ia[0].iaid, 42);
        assert_eq!(decoded.ia[0].ia_type, IaType::NonTemporary);
    }

    #[test]
    fn reply_decodes_granted_address_and_status() {
        let codec = DhcprotoCodec;
        let mut opts = DhcpOptions::new();
        opts.insert(DhcpOption::ServerId(vec![0, 3, 0, 1, 9, 9, 9, 9, 9, 9]));
        opts.insert(DhcpOption::ClientId(client_duid().bytes));
        let mut ia_opts = DhcpOptions::new();
        ia_opts.insert(DhcpOption::IAAddr(IAAddr {
            addr: "2001:db8::1".parse().unwrap(),
            preferred_life: 3600,
            valid_life: 7200,
            opts: DhcpOptions::new(),
        }));
        opts.insert(DhcpOption::IANA(IANA {
            id: 42,
            t1: 1800,
            t2: 2880,
            opts: ia_opts,
        }));
        let mut msg = Message::new_with_id(MessageType::Reply, [9, 9, 9]);
        *msg.opts_mut() = opts;
        let mut buf = Vec::new();
        let mut encoder = dhcproto::v6::Encoder::new(&mut buf);
        msg.encode(&mut encoder).unwrap();

        let server_addr: Ipv6Addr = "fe80::2".parse().unwrap();
        let decoded = codec.decode(&buf, server_addr).unwrap();
        assert_eq!(decoded.msg_type, MsgType::Reply);
        assert_eq!(decoded.ia.len(), 1);
        assert_eq!(decoded.ia[0].assignments[0].valid_lifetime, 7200);
    }
}

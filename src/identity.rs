//! DUID load/generate/persist and IAID derivation (`spec.md` §4.2).

use core::fmt;
use std::fs;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{de::Visitor, Deserialize, Serialize};

use crate::error::{EngineError, ErrorKind};
use crate::netinfo::Iface;

/// Maximum DUID length per RFC 8415 Section 11.1.
pub const MAX_DUID_LEN: usize = 130;

const ARPHRD_ETHER: u16 = 1;
const ARPHRD_IEEE802: u16 = 6;
const ARPHRD_INFINIBAND: u16 = 32;

/// DUID type codes, RFC 8415 §11 / RFC 6355.
const DUID_LLT: u16 = 1;
const DUID_EN: u16 = 2;
const DUID_LL: u16 = 3;
const DUID_UUID: u16 = 4;

/// Seconds between the Unix epoch and 2000-01-01T00:00:00Z, the DUID-LLT
/// epoch (RFC 8415 §11.2).
const DUID_EPOCH_OFFSET: u64 = 946_684_800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuidKind {
    Llt,
    En,
    Ll,
    Uuid,
    Unknown(u16),
}

impl DuidKind {
    fn from_type_code(code: u16) -> Self {
        match code {
            DUID_LLT => DuidKind::Llt,
            DUID_EN => DuidKind::En,
            DUID_LL => DuidKind::Ll,
            DUID_UUID => DuidKind::Uuid,
            other => DuidKind::Unknown(other),
        }
    }
}

/// A DHCP Unique Identifier, stored as the full on-wire body (type prefix
/// included), matching the format the host persists it in (`spec.md` §6).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Duid {
    pub bytes: Vec<u8>,
}

impl Duid {
    pub fn new(bytes: Vec<u8>) -> Option<Self> {
        if bytes.len() > MAX_DUID_LEN {
            return None;
        }
        Some(Duid { bytes })
    }

    pub fn kind(&self) -> Option<DuidKind> {
        if self.bytes.len() < 2 {
            return None;
        }
        let code = u16::from_be_bytes([self.bytes[0], self.bytes[1]]);
        Some(DuidKind::from_type_code(code))
    }

    fn duid_llt(hw_type: u16, hwaddr: &[u8]) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let duid_time = now.saturating_sub(DUID_EPOCH_OFFSET) as u32;
        let mut bytes = Vec::with_capacity(8 + hwaddr.len());
        bytes.extend_from_slice(&DUID_LLT.to_be_bytes());
        bytes.extend_from_slice(&hw_type.to_be_bytes());
        bytes.extend_from_slice(&duid_time.to_be_bytes());
        bytes.extend_from_slice(hwaddr);
        Duid { bytes }
    }

    fn duid_uuid(uuid: uuid::Uuid) -> Self {
        let mut bytes = Vec::with_capacity(18);
        bytes.extend_from_slice(&DUID_UUID.to_be_bytes());
        bytes.extend_from_slice(uuid.as_bytes());
        Duid { bytes }
    }

    pub fn to_colon_string(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Duid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, b) in self.bytes.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl Serialize for Duid {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Duid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct DuidVisitor;
        impl<'de> Visitor<'de> for DuidVisitor {
            type Value = Duid;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str(r#"colon or dash separated hex "00:11:22" or "00-11-22""#)
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Duid::try_from(v).map_err(serde::de::Error::custom)
            }
        }
        deserializer.deserialize_str(DuidVisitor)
    }
}

impl From<Vec<u8>> for Duid {
    fn from(value: Vec<u8>) -> Self {
        Duid { bytes: value }
    }
}

#[derive(Debug)]
pub struct DuidParseError;

impl fmt::Display for DuidParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid DUID format")
    }
}
impl std::error::Error for DuidParseError {}

impl TryFrom<&str> for Duid {
    type Error = DuidParseError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let trimmed = value.trim();
        let sep = match trimmed.as_bytes().get(2) {
            Some(b':') => ':',
            Some(b'-') => '-',
            _ => return Err(DuidParseError),
        };
        let bytes = trimmed
            .split(sep)
            .map(|hex| u8::from_str_radix(hex, 16))
            .collect::<Result<Vec<u8>, _>>()
            .map_err(|_| DuidParseError)?;
        if bytes.len() > MAX_DUID_LEN {
            return Err(DuidParseError);
        }
        Ok(Duid { bytes })
    }
}

/// Derive a DUID for `iface`, using hex-encoded hints from a request or a
/// process-wide configured default before falling back to generation and
/// persistence, per `spec.md` §4.2's precedence list.
pub fn acquire_duid(
    preferred_hex: Option<&str>,
    configured_default: Option<&Duid>,
    duid_file: &Path,
    iface: &Iface,
    other_ifaces: &[Iface],
) -> Result<Duid, EngineError> {
    if let Some(hex) = preferred_hex {
        if let Ok(duid) = Duid::try_from(hex) {
            if !duid.bytes.is_empty() {
                return Ok(duid);
            }
        }
    }
    if let Some(default_duid) = configured_default {
        if !default_duid.bytes.is_empty() {
            return Ok(default_duid.clone());
        }
    }
    if let Some(duid) = load_duid_file(duid_file) {
        return Ok(duid);
    }
    let generated = generate_duid(iface, other_ifaces)?;
    persist_duid_file(duid_file, &generated)?;
    Ok(generated)
}

fn load_duid_file(path: &Path) -> Option<Duid> {
    let bytes = fs::read(path).ok()?;
    if bytes.is_empty() {
        return None;
    }
    Duid::new(bytes)
}

fn persist_duid_file(path: &Path, duid: &Duid) -> Result<(), EngineError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &duid.bytes)
        .and_then(|_| fs::rename(&tmp, path))
        .map_err(|e| EngineError::new(ErrorKind::NoIdentity, format!("writing DUID file: {e}")))
}

fn generate_duid(iface: &Iface, other_ifaces: &[Iface]) -> Result<Duid, EngineError> {
    if let Some(hwaddr) = iface.hwaddr.as_ref().filter(|h| !h.is_empty()) {
        return Ok(Duid::duid_llt(iface.arp_type, hwaddr));
    }

    for preferred_type in [ARPHRD_ETHER, ARPHRD_IEEE802, ARPHRD_INFINIBAND] {
        if let Some(candidate) = other_ifaces
            .iter()
            .find(|i| i.arp_type == preferred_type && i.hwaddr.as_deref().is_some_and(|h| !h.is_empty()))
        {
            let hwaddr = candidate.hwaddr.as_ref().unwrap();
            return Ok(Duid::duid_llt(candidate.arp_type, hwaddr));
        }
    }

    Ok(Duid::duid_uuid(uuid::Uuid::new_v4()))
}

/// Derive the 32-bit IAID for an interface, per `spec.md` §4.2.
pub fn derive_iaid(
    hwaddr: Option<&[u8]>,
    ifname: &str,
    vlan: Option<u16>,
    ifindex: u32,
) -> Result<u32, EngineError> {
    if let Some(hw) = hwaddr {
        if hw.len() >= 4 {
            let tail = &hw[hw.len() - 4..];
            return Ok(u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]));
        }
    }

    if ifname.is_empty() && vlan.unwrap_or(0) == 0 && ifindex == 0 {
        return Err(EngineError::new(
            ErrorKind::NoIAID,
            "no hardware address, ifname, vlan, or ifindex available to derive an IAID",
        ));
    }

    let mut name_bytes = [0u8; 4];
    for (slot, b) in name_bytes.iter_mut().zip(ifname.as_bytes().iter().take(4)) {
        *slot = *b;
    }
    let name_word = u32::from_be_bytes(name_bytes);
    let vlan_word = u32::from(vlan.unwrap_or(0));
    Ok(name_word ^ vlan_word ^ ifindex)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(name: &str, hwaddr: Option<Vec<u8>>, arp_type: u16) -> Iface {
        Iface {
            name: name.to_string(),
            ifindex: 2,
            hwaddr,
            arp_type,
            vlan: None,
            link_up: true,
            network_up: true,
            addrs: vec![],
        }
    }

    #[test]
    fn iaid_uses_last_four_bytes_of_hwaddr_big_endian() {
        let hw = vec![0x52, 0x54, 0x00, 0x11, 0x22, 0x33];
        let iaid = derive_iaid(Some(&hw), "eth0", None, 2).unwrap();
        assert_eq!(iaid, 0x0011_2233);
    }

    #[test]
    fn iaid_exactly_four_bytes_uses_whole_address() {
        let hw = vec![0xde, 0xad, 0xbe, 0xef];
        let iaid = derive_iaid(Some(&hw), "eth0", None, 2).unwrap();
        assert_eq!(iaid, 0xdead_beef);
    }

    #[test]
    fn iaid_falls_back_to_xor_of_name_vlan_ifindex() {
        let no_hw = derive_iaid(None, "eth0", Some(100), 7).unwrap();
        let name_word = u32::from_be_bytes(*b"eth0");
        assert_eq!(no_hw, name_word ^ 100 ^ 7);
    }

    #[test]
    fn iaid_fails_with_nothing_to_derive_from() {
        assert!(derive_iaid(None, "", None, 0).is_err());
    }

    #[test]
    fn duid_round_trips_through_colon_string() {
        let duid = Duid::from(vec![0x00, 0x01, 0xaa, 0xbb]);
        let s = duid.to_colon_string();
        let parsed = Duid::try_from(s.as_str()).unwrap();
        assert_eq!(duid, parsed);
    }

    #[test]
    fn generate_prefers_own_hwaddr_for_duid_llt() {
        let me = iface("eth0", Some(vec![0x52, 0x54, 0x00, 0x11, 0x22, 0x33]), ARPHRD_ETHER);
        let duid = generate_duid(&me, &[]).unwrap();
        assert_eq!(duid.kind(), Some(DuidKind::Llt));
        assert_eq!(&duid.bytes[8..], &[0x52, 0x54, 0x00, 0x11, 0x22, 0x33]);
    }

    #[test]
    fn generate_falls_back_to_other_iface_then_uuid() {
        let me = iface("lo", None, 772);
        let other = iface("eth1", Some(vec![1, 2, 3, 4, 5, 6]), ARPHRD_ETHER);
        let duid = generate_duid(&me, &[other]).unwrap();
        assert_eq!(duid.kind(), Some(DuidKind::Llt));

        let duid_uuid = generate_duid(&me, &[]).unwrap();
        assert_eq!(duid_uuid.kind(), Some(DuidKind::Uuid));
    }

    #[test]
    fn acquire_prefers_request_hex_over_everything() {
        let dir = std::env::temp_dir().join(format!("dhcp6ce-test-{:?}", std::thread::current().id()));
        let path = dir.join("duid");
        let me = iface("eth0", Some(vec![1, 2, 3, 4, 5, 6]), ARPHRD_ETHER);
        let duid = acquire_duid(Some("00:01:aa:bb"), None, &path, &me, &[]).unwrap();
        assert_eq!(duid, Duid::from(vec![0x00, 0x01, 0xaa, 0xbb]));
    }
}

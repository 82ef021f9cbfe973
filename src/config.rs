use std::fmt;
use std::net::Ipv6Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use uuid::Uuid;

use crate::identity::Duid;
use crate::lease::IaType;
use crate::policy::{PreferredServer, ServerPolicy, ServerSelector};

/// Enterprise number used for the default Vendor-Class when the host
/// doesn't configure one (`spec.md` §6 "Defaults baked into the engine").
pub const DEFAULT_ENTERPRISE_NUMBER: u32 = 7075;

pub const WAIT_READY_MSEC: u64 = 2_000;

/// Sized to hold any DHCPv6 message (RFC 2460 §5: IPv6 minimum MTU 1280,
/// minus headers leaves comfortable room; rounded up for safety).
pub const WBUF_SIZE: usize = 1500;

#[derive(Debug, Clone)]
pub struct VendorClass {
    pub enterprise: u32,
    pub data: Vec<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct VendorOpts {
    pub enterprise: u32,
    pub opts: Vec<(u16, Vec<u8>)>,
}

/// One requested IA_NA/IA_TA/IA_PD, with optional hints.
#[derive(Debug, Clone)]
pub struct IaRequest {
    pub iaid: u32,
    pub ia_type: IaType,
    pub hinted_addr: Option<Ipv6Addr>,
    pub hinted_prefix_len: Option<u8>,
    pub t1_hint: Option<u32>,
    pub t2_hint: Option<u32>,
}

/// Raw inbound acquisition parameters, before DUID defaulting and hostname
/// sanitization (`spec.md` §3 "Request"). Persisted on the `Device` so
/// restart/reload can replay acquisition.
#[derive(Debug, Clone)]
pub struct AcquireRequest {
    pub uuid: Uuid,
    pub update_mask: u32,
    pub info_only: bool,
    pub rapid_commit: bool,
    pub preferred_lifetime: Option<u32>,
    pub client_duid: Option<Duid>,
    pub ia_list: Vec<IaRequest>,
    pub hostname: Option<String>,
    pub user_class: Vec<Vec<u8>>,
    pub vendor_class: Option<VendorClass>,
    pub vendor_opts: Option<VendorOpts>,
}

/// Resolved, immutable attempt configuration derived from an
/// `AcquireRequest` at lease-attempt start (`spec.md` §3 "Config").
/// Replaced atomically on re-Acquire.
#[derive(Debug, Clone)]
pub struct AttemptConfig {
    pub uuid: Uuid,
    pub update_mask: u32,
    pub info_only: bool,
    pub rapid_commit: bool,
    pub preferred_lifetime: Option<u32>,
    pub client_duid: Duid,
    pub ia_list: Vec<IaRequest>,
    pub hostname: Option<String>,
    pub user_class: Vec<Vec<u8>>,
    pub vendor_class: VendorClass,
    pub vendor_opts: Option<VendorOpts>,
}

impl AttemptConfig {
    /// Resolve a raw request into attempt config: default the DUID from
    /// `stable_duid` if the request didn't supply one, sanitize the
    /// hostname (RFC 1035), and fall back to the baked-in vendor class.
    pub fn from_request(request: &AcquireRequest, stable_duid: &Duid) -> Self {
        let hostname = request
            .hostname
            .as_deref()
            .and_then(sanitize_hostname)
            .map(str::to_owned);
        let vendor_class = request.vendor_class.clone().unwrap_or(VendorClass {
            enterprise: DEFAULT_ENTERPRISE_NUMBER,
            data: vec![default_vendor_version().into_bytes()],
        });
        Self {
            uuid: request.uuid,
            update_mask: request.update_mask,
            info_only: request.info_only,
            rapid_commit: request.rapid_commit,
            preferred_lifetime: request.preferred_lifetime,
            client_duid: request.client_duid.clone().unwrap_or_else(|| stable_duid.clone()),
            ia_list: request.ia_list.clone(),
            hostname,
            user_class: request.user_class.clone(),
            vendor_class,
            vendor_opts: request.vendor_opts.clone(),
        }
    }
}

fn default_vendor_version() -> String {
    format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

/// RFC 1035 §2.3.1 hostname validation: letters/digits/hyphen labels,
/// 1-63 bytes each, not starting/ending with a hyphen, 253 bytes total.
/// Invalid input is discarded silently by the caller (debug-logged), not
/// an error.
pub fn sanitize_hostname(raw: &str) -> Option<&str> {
    if raw.is_empty() || raw.len() > 253 {
        return None;
    }
    for label in raw.split('.') {
        if label.is_empty() || label.len() > 63 {
            return None;
        }
        let bytes = label.as_bytes();
        if bytes[0] == b'-' || bytes[bytes.len() - 1] == b'-' {
            return None;
        }
        if !bytes
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || *b == b'-')
        {
            return None;
        }
    }
    Some(raw)
}

/// Process-level configuration loaded from disk: DUID persistence path,
/// an optional DUID override, server policy, vendor defaults, and the
/// ambient process knobs (wait-ready timeout, log level). Mirrors the
/// teacher's `Config`/`load_from_files` split between a public struct and
/// a private `deserialize`-only shadow.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub duid_path: PathBuf,
    pub default_duid: Option<Duid>,
    pub server_policy: ServerPolicy,
    pub default_vendor_class: Option<VendorClass>,
    pub wait_ready_ms: u64,
    pub log_level: tracing::Level,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            duid_path: PathBuf::from("/var/lib/dhcp6-client-engine/duid"),
            default_duid: None,
            server_policy: ServerPolicy::default(),
            default_vendor_class: None,
            wait_ready_ms: WAIT_READY_MSEC,
            log_level: tracing::Level::INFO,
        }
    }
}

#[derive(Deserialize)]
struct RawPreferredServer {
    #[serde(default)]
    duid: Option<String>,
    #[serde(default)]
    addr: Option<Ipv6Addr>,
    weight: u8,
}

#[derive(Deserialize)]
struct RawVendorClass {
    enterprise: u32,
    #[serde(default)]
    strings: Vec<String>,
}

#[derive(Deserialize)]
struct RawEngineConfig {
    duid_path: PathBuf,
    #[serde(default)]
    default_duid: Option<String>,
    #[serde(default)]
    ignore_servers: Vec<Ipv6Addr>,
    #[serde(default)]
    preferred_servers: Vec<RawPreferredServer>,
    #[serde(default)]
    default_vendor_class: Option<RawVendorClass>,
    #[serde(default)]
    wait_ready_ms: Option<u64>,
    #[serde(default)]
    log_level: Option<String>,
}

#[derive(Debug)]
pub enum ConfigError {
    Parsing {
        err: serde_json::Error,
        path: PathBuf,
    },
    Io {
        err: std::io::Error,
        path: PathBuf,
    },
    InvalidDuid(String),
    LogLevel(String),
}

trait PathContext<T> {
    fn context<P: AsRef<Path>>(self, path: P) -> Result<T, ConfigError>;
}

impl<T> PathContext<T> for serde_json::Result<T> {
    fn context<P: AsRef<Path>>(self, path: P) -> Result<T, ConfigError> {
        self.map_err(|e| ConfigError::Parsing {
            err: e,
            path: path.as_ref().to_path_buf(),
        })
    }
}

impl<T> PathContext<T> for std::io::Result<T> {
    fn context<P: AsRef<Path>>(self, path: P) -> Result<T, ConfigError> {
        self.map_err(|e| ConfigError::Io {
            err: e,
            path: path.as_ref().to_path_buf(),
        })
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Parsing { err, path } => {
                write!(f, "parsing `{}`: {err}", path.to_string_lossy())
            }
            ConfigError::Io { err, path } => write!(f, "`{}`: {err}", path.to_string_lossy()),
            ConfigError::InvalidDuid(value) => write!(f, "invalid DUID `{value}`"),
            ConfigError::LogLevel(value) => write!(
                f,
                r#"unexpected log level {value}. Expected one of [trace, debug, info, warn, error]"#
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

impl EngineConfig {
    /// Load `engine.json` from `config_dir`.
    pub fn load_from_files<P: AsRef<Path>>(config_dir: P) -> Result<EngineConfig, ConfigError> {
        let path = config_dir.as_ref().join("engine.json");
        let raw: RawEngineConfig =
            serde_json::from_reader(std::fs::File::open(&path).context(&path)?).context(&path)?;

        let default_duid = raw
            .default_duid
            .map(|s| Duid::try_from(s.as_str()).map_err(|_| ConfigError::InvalidDuid(s)))
            .transpose()?;

        let mut preferred = Vec::with_capacity(raw.preferred_servers.len());
        for entry in raw.preferred_servers {
            let selector = match (entry.duid, entry.addr) {
                (Some(s), _) => {
                    let duid =
                        Duid::try_from(s.as_str()).map_err(|_| ConfigError::InvalidDuid(s))?;
                    ServerSelector::Duid(duid)
                }
                (None, Some(addr)) => ServerSelector::Addr(addr),
                (None, None) => continue,
            };
            preferred.push(PreferredServer {
                selector,
                weight: entry.weight,
            });
        }

        let default_vendor_class = raw.default_vendor_class.map(|v| VendorClass {
            enterprise: v.enterprise,
            data: v.strings.into_iter().map(String::into_bytes).collect(),
        });

        let log_level = match raw.log_level {
            Some(s) if !s.is_empty() => {
                tracing::Level::from_str(&s).map_err(|_| ConfigError::LogLevel(s))?
            }
            _ => tracing::Level::INFO,
        };

        Ok(EngineConfig {
            duid_path: raw.duid_path,
            default_duid,
            server_policy: ServerPolicy {
                ignore_servers: raw.ignore_servers,
                preferred,
            },
            default_vendor_class,
            wait_ready_ms: raw.wait_ready_ms.unwrap_or(WAIT_READY_MSEC),
            log_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_hostname_accepts_ordinary_names() {
        assert_eq!(sanitize_hostname("host-1.example"), Some("host-1.example"));
    }

    #[test]
    fn sanitize_hostname_rejects_leading_hyphen_label() {
        assert_eq!(sanitize_hostname("-bad.example"), None);
    }

    #[test]
    fn sanitize_hostname_rejects_empty_label() {
        assert_eq!(sanitize_hostname("double..dot"), None);
    }

    #[test]
    fn sanitize_hostname_rejects_underscore() {
        assert_eq!(sanitize_hostname("weird_name"), None);
    }

    #[test]
    fn attempt_config_defaults_vendor_class_when_missing() {
        let request = AcquireRequest {
            uuid: Uuid::nil(),
            update_mask: 0,
            info_only: false,
            rapid_commit: false,
            preferred_lifetime: None,
            client_duid: None,
            ia_list: vec![],
            hostname: None,
            user_class: vec![],
            vendor_class: None,
            vendor_opts: None,
        };
        let stable = Duid::new(vec![0, 3, 0, 1, 1, 2, 3, 4, 5, 6]).unwrap();
        let attempt = AttemptConfig::from_request(&request, &stable);
        assert_eq!(attempt.vendor_class.enterprise, DEFAULT_ENTERPRISE_NUMBER);
        assert_eq!(attempt.client_duid, stable);
    }
}

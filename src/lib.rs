//! DHCPv6 client engine: RFC 3315 / RFC 8415 state machine, retransmission
//! backoff, identity management, and event intake for a per-interface
//! DHCPv6 client, decoupled from any particular socket/netlink/IPC layer
//! via the traits in [`codec`], [`transport`], and [`netinfo`].

pub mod clock;
pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod event;
pub mod fsm;
pub mod identity;
pub mod lease;
pub mod logging;
pub mod netinfo;
pub mod policy;
pub mod retrans;
pub mod signal;

#[cfg(unix)]
pub mod reactor;
#[cfg(unix)]
pub mod transport;

pub use clock::{Clock, MonotonicClock};
pub use config::{AcquireRequest, EngineConfig};
pub use device::{Device, DeviceRegistry, FsmState};
pub use error::{EngineError, ErrorKind, Result};
pub use identity::Duid;
pub use lease::Lease;

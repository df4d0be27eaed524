//! Homa: a message-oriented, receiver-driven RPC transport.
//!
//! The engine is split the way the wire protocol itself is split: identity
//! and wire format (`id`, `protocol`), long-lived per-destination state
//! (`peer`), per-RPC state (`rpc`, `message`, `outgoing`), the two
//! independent scheduling problems a receiver solves (`grant` for incoming
//! bytes, `pacer` for the NIC queue), the packet-handling engine
//! (`incoming`), the syscall surface (`socket`), and the background threads
//! and wiring that turn all of it into a running service (`transport`,
//! `timer`). `config` holds every tunable the rest of the crate reads.

pub mod config;
pub mod error;
pub mod grant;
pub mod id;
pub mod incoming;
pub mod interest;
pub mod message;
pub mod outgoing;
pub mod pacer;
pub mod peer;
pub mod pool;
pub mod protocol;
pub mod rpc;
pub mod socket;
pub mod socktab;
pub mod timer;
pub mod transport;

pub use config::HomaConfig;
pub use error::{Error, ErrorKind, Result};
pub use socket::{RecvResult, Socket};
pub use transport::{IpSend, Transport};

//! RPC-level and syscall-level error kinds.
//!
//! Packet-level errors never reach the application directly (see
//! `incoming.rs`): they are absorbed into an [`Rpc`](crate::rpc::Rpc)'s
//! `error` field and surfaced the next time the application calls `recv` for
//! that id. Argument errors from the syscall surface (`sendmsg`, `bind`, ...)
//! are returned synchronously and never mutate RPC state.

use thiserror::Error;

/// Coarse class an [`Error`] maps to, for callers that want errno-style
/// dispatch without matching every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed arguments, non-Homa socket, oversize message, wrong family.
    Invalid,
    /// Would block and the caller asked for non-blocking behavior.
    WouldBlock,
    /// Buffer pool or allocation exhaustion.
    NoMemory,
    /// No default port available after a full sweep.
    AddrNotAvailable,
    /// Requested port already bound in this namespace.
    AddrInUse,
    /// Resend budget exhausted without a reply.
    TimedOut,
    /// ICMP host/address unreachable.
    HostUnreachable,
    /// ICMP port unreachable / peer has no such RPC.
    NotConnected,
    /// ICMP protocol unreachable.
    ProtoNotSupported,
    /// Socket has been shut down.
    Shutdown,
    /// A blocking call was interrupted before it could complete.
    Interrupted,
}

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("operation would block")]
    WouldBlock,

    #[error("out of memory: {0}")]
    NoMemory(String),

    #[error("no default port available in this namespace")]
    AddrNotAvailable,

    #[error("port {0} already in use in this namespace")]
    AddrInUse(u16),

    #[error("rpc {0:#x} timed out")]
    TimedOut(u64),

    #[error("host unreachable")]
    HostUnreachable,

    #[error("not connected: peer does not recognize this rpc")]
    NotConnected,

    #[error("protocol not supported by peer")]
    ProtoNotSupported,

    #[error("socket has been shut down")]
    Shutdown,

    #[error("interrupted")]
    Interrupted,

    #[error("unknown rpc id {0:#x}")]
    UnknownRpc(u64),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) | Error::InvalidConfig(_) | Error::UnknownRpc(_) => {
                ErrorKind::Invalid
            }
            Error::WouldBlock => ErrorKind::WouldBlock,
            Error::NoMemory(_) => ErrorKind::NoMemory,
            Error::AddrNotAvailable => ErrorKind::AddrNotAvailable,
            Error::AddrInUse(_) => ErrorKind::AddrInUse,
            Error::TimedOut(_) => ErrorKind::TimedOut,
            Error::HostUnreachable => ErrorKind::HostUnreachable,
            Error::NotConnected => ErrorKind::NotConnected,
            Error::ProtoNotSupported => ErrorKind::ProtoNotSupported,
            Error::Shutdown => ErrorKind::Shutdown,
            Error::Interrupted => ErrorKind::Interrupted,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

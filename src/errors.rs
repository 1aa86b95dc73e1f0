use thiserror::Error;

use crate::types::{InstanceId, Version};

#[derive(Error, Debug)]
pub enum DtmError {
    #[error("version {ver} conflicts with history high version {high}")]
    Ver { ver: Version, high: Version },

    #[error("protocol error: {0}")]
    Proto(&'static str),

    #[error("peer {0:?} declared dead")]
    PeerDead(InstanceId),

    #[error("transient failure talking to {0:?}")]
    Transient(InstanceId),

    #[error("internal invariant violated: {0}")]
    Internal(&'static str),

    #[error("decode error {0:?}")]
    Decode(#[from] DecodeError),
}

pub type Result<T> = ::std::result::Result<T, DtmError>;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("incorrect input length")]
    IncorrectLength,

    #[error("too short header")]
    TooShortHeader,

    #[error("unknown notice opcode {0}")]
    UnknownOpcode(u8),

    #[error("unknown update rule {0}")]
    UnknownRule(u8),
}

pub type DecResult<T> = ::std::result::Result<T, DecodeError>;

impl DtmError {
    /// Whether the error is confined to the offending call; everything but
    /// `Internal` is. `Transient` and `PeerDead` additionally poison only
    /// the operations that reference the failed peer.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, DtmError::Internal(_))
    }
}

#[cfg(test)]
impl PartialEq for DtmError {
    fn eq(&self, other: &Self) -> bool {
        use DtmError::*;
        match (self, other) {
            (Ver { ver: v1, high: h1 }, Ver { ver: v2, high: h2 }) => v1 == v2 && h1 == h2,
            (Proto(m1), Proto(m2)) => m1 == m2,
            (PeerDead(a), PeerDead(b)) => a == b,
            (Transient(a), Transient(b)) => a == b,
            (Internal(m1), Internal(m2)) => m1 == m2,
            (Decode(e1), Decode(e2)) => e1 == e2,

            (Ver { .. }, _) => false,
            (Proto(_), _) => false,
            (PeerDead(_), _) => false,
            (Transient(_), _) => false,
            (Internal(_), _) => false,
            (Decode(_), _) => false,
        }
    }
}

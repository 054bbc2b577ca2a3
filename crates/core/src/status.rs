//! Status codes returned by the host vmnet service (`vmnet_return_t`).

use crate::error::{Error, Result};
use std::fmt;

/// Result of a vmnet operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Failure,
    MemFailure,
    InvalidArgument,
    SetupIncomplete,
    InvalidAccess,
    PacketTooBig,
    BufferExhausted,
    TooManyPackets,
    SharingServiceBusy,
    NotAuthorized,
    Unknown(u32),
}

impl Status {
    pub fn is_success(self) -> bool {
        self == Status::Success
    }

    /// Map a status into a `Result`, naming the operation on failure.
    pub fn into_result(self, op: &'static str) -> Result<()> {
        match self {
            Status::Success => Ok(()),
            Status::BufferExhausted => Err(Error::TransientBufferExhausted),
            status => Err(Error::Interface { op, status }),
        }
    }
}

impl From<u32> for Status {
    fn from(raw: u32) -> Self {
        match raw {
            1000 => Status::Success,
            1001 => Status::Failure,
            1002 => Status::MemFailure,
            1003 => Status::InvalidArgument,
            1004 => Status::SetupIncomplete,
            1005 => Status::InvalidAccess,
            1006 => Status::PacketTooBig,
            1007 => Status::BufferExhausted,
            1008 => Status::TooManyPackets,
            1009 => Status::SharingServiceBusy,
            1010 => Status::NotAuthorized,
            other => Status::Unknown(other),
        }
    }
}

impl From<Status> for u32 {
    fn from(status: Status) -> Self {
        match status {
            Status::Success => 1000,
            Status::Failure => 1001,
            Status::MemFailure => 1002,
            Status::InvalidArgument => 1003,
            Status::SetupIncomplete => 1004,
            Status::InvalidAccess => 1005,
            Status::PacketTooBig => 1006,
            Status::BufferExhausted => 1007,
            Status::TooManyPackets => 1008,
            Status::SharingServiceBusy => 1009,
            Status::NotAuthorized => 1010,
            Status::Unknown(raw) => raw,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Success => f.write_str("successfully completed"),
            Status::Failure => f.write_str("general failure"),
            Status::MemFailure => f.write_str("memory allocation failure"),
            Status::InvalidArgument => f.write_str("invalid argument specified"),
            Status::SetupIncomplete => f.write_str("interface setup is not complete"),
            Status::InvalidAccess => f.write_str("permission denied"),
            Status::PacketTooBig => f.write_str("packet size larger than MTU"),
            Status::BufferExhausted => f.write_str("buffers exhausted in kernel"),
            Status::TooManyPackets => f.write_str("packet count exceeds limit"),
            Status::SharingServiceBusy => {
                f.write_str("conflicting sharing service is in use")
            }
            Status::NotAuthorized => f.write_str("missing authorization"),
            Status::Unknown(raw) => write!(f, "unknown status {raw}"),
        }
    }
}

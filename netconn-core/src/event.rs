//! Completion events delivered to the host queue, and the connection error taxonomy they carry.

use crate::table::ConnHandle;

/// Operational failure of a connection operation. Carried in events as a negative code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum ConnError {
    #[error("generic connection error")]
    Generic,
    #[error("too many open connections")]
    Max,
    #[error("name resolution failed")]
    Dns,
    #[error("internal error")]
    Internal,
    #[error("connection closed by peer")]
    Closed,
    #[error("connection is read-only")]
    ReadOnly,
    #[error("malformed url")]
    Url,
    #[error("transport unavailable on this platform")]
    Unavailable,
    #[error("operation canceled")]
    Canceled,
    #[error("protocol violation")]
    Protocol,
    #[error("network could not be started")]
    Network,
    #[error("no such header")]
    NoHeader,
}

impl ConnError {
    pub fn code(self) -> i32 {
        match self {
            ConnError::Generic => -2,
            ConnError::Max => -3,
            ConnError::Dns => -4,
            ConnError::Internal => -5,
            ConnError::Closed => -6,
            ConnError::ReadOnly => -7,
            ConnError::Url => -11,
            ConnError::Unavailable => -12,
            ConnError::Canceled => -13,
            ConnError::Protocol => -14,
            ConnError::Network => -15,
            ConnError::NoHeader => -16,
        }
    }

    pub fn from_code(code: i32) -> Option<ConnError> {
        let e = match code {
            -2 => ConnError::Generic,
            -3 => ConnError::Max,
            -4 => ConnError::Dns,
            -5 => ConnError::Internal,
            -6 => ConnError::Closed,
            -7 => ConnError::ReadOnly,
            -11 => ConnError::Url,
            -12 => ConnError::Unavailable,
            -13 => ConnError::Canceled,
            -14 => ConnError::Protocol,
            -15 => ConnError::Network,
            -16 => ConnError::NoHeader,
            _ => return None,
        };
        Some(e)
    }
}

/// Which pending-operation slot an event retires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnOpKind {
    Connect,
    Read,
    Write,
    Finish,
}

/// One finished operation. `result` is a byte count / status code (> 0) or a `ConnError` code (< 0).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnEvent {
    pub handle: ConnHandle,
    pub op: ConnOpKind,
    pub result: i32,
    /// Bytes received by a successful plain `read`. `None` for every other operation.
    pub data: Option<Vec<u8>>,
}

impl ConnEvent {
    pub(crate) fn success(handle: ConnHandle, op: ConnOpKind, result: u32) -> Self {
        Self {
            handle,
            op,
            result: i32::try_from(result).unwrap_or(i32::MAX),
            data: None,
        }
    }

    pub(crate) fn failure(handle: ConnHandle, op: ConnOpKind, err: ConnError) -> Self {
        Self {
            handle,
            op,
            result: err.code(),
            data: None,
        }
    }

    /// Decode `result`: the positive payload, or the error it encodes.
    pub fn outcome(&self) -> Result<u32, ConnError> {
        if self.result > 0 {
            Ok(self.result as u32)
        } else {
            Err(ConnError::from_code(self.result).unwrap_or(ConnError::Generic))
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.result == ConnError::Canceled.code()
    }
}

//! Operations, their sub-operation pipelines, and the primitive request/completion protocol
//! spoken with the host.

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, SocketAddr};

use crate::event::{ConnError, ConnOpKind};
use crate::resource::ResourceHandle;
use crate::table::ConnHandle;
use crate::url::BtAddr;

/// Identifies one caller-visible operation. Also tags every primitive request it issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub u64);

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "op{}", self.0)
    }
}

/// Where a socket connect goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Address produced by the preceding `Resolve`.
    FromResolve,
    Ip(IpAddr),
    Bluetooth(BtAddr),
}

/// One step of an operation's pipeline. Each issues at most one primitive request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubOp {
    StartNetworking,
    Resolve { hostname: String },
    SocketConnect { target: Target, port: u16 },
    Read { max_len: usize },
    Write { data: Vec<u8> },
    HttpReadHeaders,
}

impl SubOp {
    pub fn name(&self) -> &'static str {
        match self {
            SubOp::StartNetworking => "start_networking",
            SubOp::Resolve { .. } => "resolve",
            SubOp::SocketConnect { .. } => "socket_connect",
            SubOp::Read { .. } => "read",
            SubOp::Write { .. } => "write",
            SubOp::HttpReadHeaders => "http_read_headers",
        }
    }
}

/// Caller-visible operation kinds.
#[derive(Debug)]
pub enum OpKind {
    AddrConnect,
    NameConnect,
    Read,
    Write { len: usize },
    ReadToBuffer {
        resource: ResourceHandle,
        offset: usize,
        buffer: Vec<u8>,
    },
    WriteFromBuffer {
        resource: ResourceHandle,
        buffer: Vec<u8>,
        len: usize,
    },
    /// `connect` is set when the finish was started by `connect("http://..")`.
    HttpFinish { connect: bool },
}

impl OpKind {
    /// Event kind and pending bit this operation retires.
    pub fn event_kind(&self) -> ConnOpKind {
        match self {
            OpKind::AddrConnect | OpKind::NameConnect => ConnOpKind::Connect,
            OpKind::Read | OpKind::ReadToBuffer { .. } => ConnOpKind::Read,
            OpKind::Write { .. } | OpKind::WriteFromBuffer { .. } => ConnOpKind::Write,
            OpKind::HttpFinish { connect: true } => ConnOpKind::Connect,
            OpKind::HttpFinish { connect: false } => ConnOpKind::Finish,
        }
    }

    /// Checked-out buffer held by this operation, if any.
    pub fn take_buffer(&mut self) -> Option<(ResourceHandle, Vec<u8>)> {
        match self {
            OpKind::ReadToBuffer {
                resource, buffer, ..
            }
            | OpKind::WriteFromBuffer {
                resource, buffer, ..
            } => Some((*resource, std::mem::take(buffer))),
            _ => None,
        }
    }
}

/// A caller-visible request in progress.
#[derive(Debug)]
pub struct Operation {
    pub id: OpId,
    pub handle: ConnHandle,
    pub kind: OpKind,
    pub subs: VecDeque<SubOp>,
    /// A primitive request for the front sub-operation is outstanding.
    pub in_flight: bool,
    /// Waiting for networking to come up; no primitive outstanding.
    pub parked: bool,
    pub resolved: Option<IpAddr>,
    /// Bytes delivered by the last completed read.
    pub received: Vec<u8>,
}

impl Operation {
    pub fn new(id: OpId, handle: ConnHandle, kind: OpKind, subs: Vec<SubOp>) -> Self {
        Self {
            id,
            handle,
            kind,
            subs: subs.into(),
            in_flight: false,
            parked: false,
            resolved: None,
            received: Vec::new(),
        }
    }
}

/// Remote end of a socket connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Inet(SocketAddr),
    Bluetooth { addr: BtAddr, channel: u8 },
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Inet(addr) => write!(f, "{}", addr),
            Endpoint::Bluetooth { addr, channel } => {
                for b in addr.0 {
                    write!(f, "{:02x}", b)?;
                }
                write!(f, ":{}", channel)
            }
        }
    }
}

/// Primitive work the host must perform. Every request tagged with an `op` gets exactly one
/// `on_complete` call back, unless a `Cancel` for that op follows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoRequest {
    /// Bring the network interface up; answer with `on_network_started`.
    StartNetworking,
    Resolve { op: OpId, hostname: String },
    Connect { op: OpId, handle: ConnHandle, endpoint: Endpoint },
    Read { op: OpId, handle: ConnHandle, max_len: usize },
    Write { op: OpId, handle: ConnHandle, data: Vec<u8> },
    /// Abort the outstanding primitive of `op`; no completion is expected afterwards.
    Cancel { op: OpId },
    /// Drop the socket behind `handle`.
    Close { handle: ConnHandle },
}

/// Successful result of a primitive request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Resolved(IpAddr),
    Connected,
    Read(Vec<u8>),
    Written(usize),
}

/// Map a primitive failure to the connection error reported for the failing sub-operation.
pub fn translate_error(sub: &SubOp, err: &io::Error) -> ConnError {
    match sub {
        SubOp::StartNetworking => ConnError::Network,
        SubOp::Resolve { .. } => ConnError::Dns,
        SubOp::SocketConnect { .. }
        | SubOp::Read { .. }
        | SubOp::Write { .. }
        | SubOp::HttpReadHeaders => match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected => ConnError::Closed,
            io::ErrorKind::NotFound => ConnError::Dns,
            _ => ConnError::Generic,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translation_depends_on_failing_step() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        let missing = io::Error::from(io::ErrorKind::NotFound);
        let connect = SubOp::SocketConnect {
            target: Target::FromResolve,
            port: 80,
        };
        let resolve = SubOp::Resolve {
            hostname: "e.com".into(),
        };

        assert_eq!(translate_error(&SubOp::StartNetworking, &reset), ConnError::Network);
        assert_eq!(translate_error(&resolve, &refused), ConnError::Dns);
        assert_eq!(translate_error(&connect, &refused), ConnError::Generic);
        assert_eq!(translate_error(&connect, &reset), ConnError::Closed);
        assert_eq!(translate_error(&connect, &missing), ConnError::Dns);
        assert_eq!(
            translate_error(&SubOp::Read { max_len: 1 }, &io::Error::from(io::ErrorKind::UnexpectedEof)),
            ConnError::Closed
        );
        assert_eq!(
            translate_error(&SubOp::HttpReadHeaders, &io::Error::from(io::ErrorKind::BrokenPipe)),
            ConnError::Closed
        );
    }

    #[test]
    fn event_kinds() {
        assert_eq!(OpKind::NameConnect.event_kind(), ConnOpKind::Connect);
        assert_eq!(OpKind::Write { len: 3 }.event_kind(), ConnOpKind::Write);
        assert_eq!(OpKind::HttpFinish { connect: true }.event_kind(), ConnOpKind::Connect);
        assert_eq!(OpKind::HttpFinish { connect: false }.event_kind(), ConnOpKind::Finish);
        let mut k = OpKind::ReadToBuffer {
            resource: ResourceHandle(1),
            offset: 0,
            buffer: vec![1, 2],
        };
        assert_eq!(k.event_kind(), ConnOpKind::Read);
        assert_eq!(k.take_buffer(), Some((ResourceHandle(1), vec![1, 2])));
    }

    #[test]
    fn bluetooth_endpoint_display() {
        let ep = Endpoint::Bluetooth {
            addr: BtAddr([0, 0x11, 0x22, 0x33, 0x44, 0xaa]),
            channel: 3,
        };
        assert_eq!(ep.to_string(), "0011223344aa:3");
    }
}

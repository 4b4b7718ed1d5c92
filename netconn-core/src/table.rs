//! Open connections keyed by handle.

use std::collections::HashMap;

use crate::event::{ConnError, ConnOpKind};
use crate::http::HttpConnection;
use crate::op::{Endpoint, OpId};

/// Opaque connection handle. Allocated from 1 upwards and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnHandle(pub u32);

impl std::fmt::Display for ConnHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Bit set of operation kinds currently pending on a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingOps(u8);

impl PendingOps {
    pub const CONNECT: u8 = 1;
    pub const READ: u8 = 2;
    pub const WRITE: u8 = 4;
    pub const FINISH: u8 = 8;

    fn bit(kind: ConnOpKind) -> u8 {
        match kind {
            ConnOpKind::Connect => Self::CONNECT,
            ConnOpKind::Read => Self::READ,
            ConnOpKind::Write => Self::WRITE,
            ConnOpKind::Finish => Self::FINISH,
        }
    }

    pub fn contains(self, kind: ConnOpKind) -> bool {
        self.0 & Self::bit(kind) != 0
    }

    pub fn insert(&mut self, kind: ConnOpKind) {
        self.0 |= Self::bit(kind);
    }

    pub fn remove(&mut self, kind: ConnOpKind) {
        self.0 &= !Self::bit(kind);
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

#[derive(Debug)]
pub enum ConnKind {
    Socket,
    Http(Box<HttpConnection>),
}

#[derive(Debug)]
pub struct Connection {
    pub handle: ConnHandle,
    pub kind: ConnKind,
    pub pending: PendingOps,
    /// Operations bound to this connection that have not retired yet.
    pub live_ops: Vec<OpId>,
    pub remote: Option<Endpoint>,
}

impl Connection {
    pub fn http(&self) -> Option<&HttpConnection> {
        match &self.kind {
            ConnKind::Http(http) => Some(&**http),
            ConnKind::Socket => None,
        }
    }

    pub fn http_mut(&mut self) -> Option<&mut HttpConnection> {
        match &mut self.kind {
            ConnKind::Http(http) => Some(&mut **http),
            ConnKind::Socket => None,
        }
    }

    pub fn forget_op(&mut self, op: OpId) {
        self.live_ops.retain(|&id| id != op);
    }
}

pub struct ConnectionTable {
    conns: HashMap<ConnHandle, Connection>,
    next: u32,
    max: usize,
}

impl ConnectionTable {
    pub fn new(max: usize) -> Self {
        Self {
            conns: HashMap::new(),
            next: 0,
            max,
        }
    }

    /// `Err(Max)` once the ceiling is reached.
    pub fn check_room(&self) -> Result<(), ConnError> {
        if self.conns.len() >= self.max {
            return Err(ConnError::Max);
        }
        Ok(())
    }

    pub fn open(&mut self, kind: ConnKind) -> Result<ConnHandle, ConnError> {
        self.check_room()?;
        let next = self.next.checked_add(1).ok_or(ConnError::Max)?;
        self.next = next;
        let handle = ConnHandle(next);
        self.conns.insert(
            handle,
            Connection {
                handle,
                kind,
                pending: PendingOps::default(),
                live_ops: Vec::new(),
                remote: None,
            },
        );
        Ok(handle)
    }

    pub fn get(&self, handle: ConnHandle) -> Option<&Connection> {
        self.conns.get(&handle)
    }

    pub fn get_mut(&mut self, handle: ConnHandle) -> Option<&mut Connection> {
        self.conns.get_mut(&handle)
    }

    pub fn remove(&mut self, handle: ConnHandle) -> Option<Connection> {
        self.conns.remove(&handle)
    }

    pub fn handles(&self) -> Vec<ConnHandle> {
        let mut handles: Vec<_> = self.conns.keys().copied().collect();
        handles.sort();
        handles
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

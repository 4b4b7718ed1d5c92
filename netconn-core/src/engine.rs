//! Host-driven connection engine: callers request operations, the host executes the
//! primitive requests the engine queues and feeds their completions back.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;

use tracing::{debug, trace, warn};

use crate::config::EngineConfig;
use crate::event::{ConnError, ConnEvent, ConnOpKind};
use crate::http::{HeadStatus, HeaderMap, HttpConnection, HttpMethod, HttpState};
use crate::op::{
    translate_error, Completion, Endpoint, IoRequest, OpId, OpKind, Operation, SubOp, Target,
};
use crate::resource::{BufferTable, ResourceError, ResourceHandle, ResourceTable};
use crate::table::{ConnHandle, ConnKind, ConnectionTable, PendingOps};
use crate::url::{self, ConnectUrl};

/// Precondition violations, returned synchronously. Never queued as events.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("invalid connection handle {0}")]
    InvalidHandle(ConnHandle),
    #[error("a read is already pending")]
    AlreadyReading,
    #[error("a write is already pending")]
    AlreadyWriting,
    #[error("transfer size or range out of bounds")]
    DataOutOfBounds,
    #[error("not an http connection")]
    NotHttp,
    #[error("http request headers can only be set before the request is sent")]
    HttpNotSetup,
    #[error("http response not finished")]
    HttpNotFinished,
    #[error("http request already finished")]
    HttpAlreadyFinished,
    #[error(transparent)]
    Resource(#[from] ResourceError),
}

/// Readiness of the network interface, shared by all connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkingState {
    Idle,
    Starting,
    Started,
}

/// Outcome of starting or finishing the front sub-operation.
#[derive(Debug)]
enum Step {
    /// Issue the front sub-operation (or retire if none is left).
    Next,
    /// Front sub-operation finished; pop it and go on.
    Done,
    /// Waiting on a primitive completion.
    Issued,
    /// Waiting for networking.
    Parked,
    Failed(ConnError),
}

/// Main coordinator. Caller requests and host completions go in; primitive requests and
/// completion events come out.
pub struct ConnEngine<R: ResourceTable = BufferTable> {
    config: EngineConfig,
    conns: ConnectionTable,
    ops: HashMap<OpId, Operation>,
    next_op: u64,
    networking: NetworkingState,
    parked: VecDeque<OpId>,
    requests: VecDeque<IoRequest>,
    events: VecDeque<ConnEvent>,
    resources: R,
}

impl ConnEngine<BufferTable> {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_resources(config, BufferTable::new())
    }
}

impl<R: ResourceTable> ConnEngine<R> {
    pub fn with_resources(config: EngineConfig, resources: R) -> Self {
        Self {
            conns: ConnectionTable::new(config.max_connections),
            config,
            ops: HashMap::new(),
            next_op: 0,
            networking: NetworkingState::Idle,
            parked: VecDeque::new(),
            requests: VecDeque::new(),
            events: VecDeque::new(),
            resources,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn resources(&self) -> &R {
        &self.resources
    }

    pub fn resources_mut(&mut self) -> &mut R {
        &mut self.resources
    }

    pub fn networking_state(&self) -> NetworkingState {
        self.networking
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    pub fn is_open(&self, handle: ConnHandle) -> bool {
        self.conns.get(handle).is_some()
    }

    /// Peer address once the socket connect succeeded.
    pub fn remote_endpoint(&self, handle: ConnHandle) -> Option<Endpoint> {
        self.conns.get(handle)?.remote
    }

    pub fn pending_ops(&self, handle: ConnHandle) -> Option<PendingOps> {
        self.conns.get(handle).map(|c| c.pending)
    }

    /// Next primitive request for the host.
    pub fn poll_request(&mut self) -> Option<IoRequest> {
        self.requests.pop_front()
    }

    pub fn drain_requests(&mut self) -> Vec<IoRequest> {
        self.requests.drain(..).collect()
    }

    /// Next completion event.
    pub fn poll_event(&mut self) -> Option<ConnEvent> {
        self.events.pop_front()
    }

    pub fn drain_events(&mut self) -> Vec<ConnEvent> {
        self.events.drain(..).collect()
    }

    // --- connection table ---

    /// Open a connection and start connecting. The CONNECT event follows asynchronously.
    ///
    /// `socket://host:port`, `http://host[:port]/path` (GET, finished immediately; the
    /// event carries the status code) or `btspp://<addr>:<channel>`.
    pub fn connect(&mut self, url: &str) -> Result<ConnHandle, ConnError> {
        self.conns.check_room()?;
        if url::is_btspp(url) && !self.config.bluetooth_available {
            return Err(ConnError::Unavailable);
        }
        let (kind, op, subs) = match url::parse(url)? {
            ConnectUrl::Socket(s) => match s.loopback() {
                Some(ip) => (
                    ConnKind::Socket,
                    OpKind::AddrConnect,
                    vec![SubOp::SocketConnect {
                        target: Target::Ip(ip.into()),
                        port: s.port,
                    }],
                ),
                None => (
                    ConnKind::Socket,
                    OpKind::NameConnect,
                    vec![
                        SubOp::StartNetworking,
                        SubOp::Resolve { hostname: s.host },
                        SubOp::SocketConnect {
                            target: Target::FromResolve,
                            port: s.port,
                        },
                    ],
                ),
            },
            ConnectUrl::Http(u) => {
                let mut http = HttpConnection::new(u, HttpMethod::Get, self.config.max_header_bytes);
                let mut subs = request_prelude(&http);
                subs.push(SubOp::HttpReadHeaders);
                http.state = HttpState::Finishing;
                (
                    ConnKind::Http(Box::new(http)),
                    OpKind::HttpFinish { connect: true },
                    subs,
                )
            }
            ConnectUrl::Btspp { addr, channel } => (
                ConnKind::Socket,
                OpKind::AddrConnect,
                vec![SubOp::SocketConnect {
                    target: Target::Bluetooth(addr),
                    port: u16::from(channel),
                }],
            ),
        };
        let handle = self.conns.open(kind)?;
        debug!(handle = %handle, url, "connection opened");
        self.start_op(handle, op, subs);
        Ok(handle)
    }

    /// Open an HTTP connection in `Setup`. Nothing goes on the wire until a write or finish.
    pub fn http_create(&mut self, url: &str, method: HttpMethod) -> Result<ConnHandle, ConnError> {
        self.conns.check_room()?;
        let u = url::parse_http(url)?;
        let http = HttpConnection::new(u, method, self.config.max_header_bytes);
        let handle = self.conns.open(ConnKind::Http(Box::new(http)))?;
        debug!(handle = %handle, url, method = method.as_str(), "http connection created");
        Ok(handle)
    }

    /// Cancel every live operation on `handle` (canceled events are queued before this
    /// returns), forget the connection and ask the host to drop its socket.
    pub fn close(&mut self, handle: ConnHandle) -> Result<(), EngineError> {
        if !self.is_open(handle) {
            return Err(EngineError::InvalidHandle(handle));
        }
        self.close_open(handle);
        Ok(())
    }

    /// Close every connection.
    pub fn shutdown(&mut self) {
        for handle in self.conns.handles() {
            self.close_open(handle);
        }
    }

    fn close_open(&mut self, handle: ConnHandle) {
        let live = self
            .conns
            .get(handle)
            .map(|conn| conn.live_ops.clone())
            .unwrap_or_default();
        for id in live {
            self.cancel_op(id);
        }
        self.conns.remove(handle);
        self.requests.push_back(IoRequest::Close { handle });
        debug!(handle = %handle, "connection closed");
    }

    // --- transfers ---

    /// Read up to `size` bytes. The READ event carries the bytes in `data`.
    pub fn read(&mut self, handle: ConnHandle, size: usize) -> Result<(), EngineError> {
        if size == 0 {
            return Err(EngineError::DataOutOfBounds);
        }
        self.check_transfer(handle, ConnOpKind::Read)?;
        self.start_op(handle, OpKind::Read, vec![SubOp::Read { max_len: size }]);
        Ok(())
    }

    pub fn write(&mut self, handle: ConnHandle, data: &[u8]) -> Result<(), EngineError> {
        if data.is_empty() {
            return Err(EngineError::DataOutOfBounds);
        }
        self.check_transfer(handle, ConnOpKind::Write)?;
        let mut subs = self.write_prelude(handle);
        subs.push(SubOp::Write {
            data: data.to_vec(),
        });
        self.start_op(handle, OpKind::Write { len: data.len() }, subs);
        Ok(())
    }

    /// Read up to `size` bytes into `resource[offset..]`. The buffer stays checked out until
    /// the READ event.
    pub fn read_to_buffer(
        &mut self,
        handle: ConnHandle,
        resource: ResourceHandle,
        offset: usize,
        size: usize,
    ) -> Result<(), EngineError> {
        let end = transfer_end(offset, size)?;
        self.check_transfer(handle, ConnOpKind::Read)?;
        let buffer = self.checkout_range(resource, end)?;
        self.start_op(
            handle,
            OpKind::ReadToBuffer {
                resource,
                offset,
                buffer,
            },
            vec![SubOp::Read { max_len: size }],
        );
        Ok(())
    }

    /// Write `resource[offset..offset + size]`. The buffer stays checked out until the WRITE event.
    pub fn write_from_buffer(
        &mut self,
        handle: ConnHandle,
        resource: ResourceHandle,
        offset: usize,
        size: usize,
    ) -> Result<(), EngineError> {
        let end = transfer_end(offset, size)?;
        self.check_transfer(handle, ConnOpKind::Write)?;
        let buffer = self.checkout_range(resource, end)?;
        let mut subs = self.write_prelude(handle);
        subs.push(SubOp::Write {
            data: buffer[offset..end].to_vec(),
        });
        self.start_op(
            handle,
            OpKind::WriteFromBuffer {
                resource,
                buffer,
                len: size,
            },
            subs,
        );
        Ok(())
    }

    // --- http ---

    pub fn http_set_request_header(
        &mut self,
        handle: ConnHandle,
        key: &str,
        value: &str,
    ) -> Result<(), EngineError> {
        let http = self
            .conns
            .get_mut(handle)
            .ok_or(EngineError::InvalidHandle(handle))?
            .http_mut()
            .ok_or(EngineError::NotHttp)?;
        if http.state != HttpState::Setup {
            return Err(EngineError::HttpNotSetup);
        }
        http.request_headers.set(key, value);
        Ok(())
    }

    /// Finish the request and read the response head. The FINISH event carries the status code.
    pub fn http_finish(&mut self, handle: ConnHandle) -> Result<(), EngineError> {
        let http = self
            .conns
            .get_mut(handle)
            .ok_or(EngineError::InvalidHandle(handle))?
            .http_mut()
            .ok_or(EngineError::NotHttp)?;
        let mut subs = match http.state {
            HttpState::Setup => request_prelude(http),
            HttpState::Writing => vec![SubOp::StartNetworking],
            HttpState::Finishing | HttpState::Finished => {
                return Err(EngineError::HttpAlreadyFinished)
            }
        };
        subs.push(SubOp::HttpReadHeaders);
        http.state = HttpState::Finishing;
        self.start_op(handle, OpKind::HttpFinish { connect: false }, subs);
        Ok(())
    }

    /// Response header value, looked up case-insensitively.
    pub fn http_response_header(
        &self,
        handle: ConnHandle,
        key: &str,
    ) -> Result<Option<&str>, EngineError> {
        Ok(self.finished_http(handle)?.head.headers().get(key))
    }

    pub fn http_response_headers(&self, handle: ConnHandle) -> Result<&HeaderMap, EngineError> {
        Ok(self.finished_http(handle)?.head.headers())
    }

    /// Copy a response header value into `buf`, NUL-terminated if it fits. Returns the value
    /// length (even when it does not fit) or the NOHEADER code.
    pub fn http_get_response_header(
        &self,
        handle: ConnHandle,
        key: &str,
        buf: &mut [u8],
    ) -> Result<i32, EngineError> {
        let Some(value) = self.http_response_header(handle, key)? else {
            return Ok(ConnError::NoHeader.code());
        };
        let bytes = value.as_bytes();
        if bytes.len() < buf.len() {
            buf[..bytes.len()].copy_from_slice(bytes);
            buf[bytes.len()] = 0;
        }
        Ok(i32::try_from(bytes.len()).unwrap_or(i32::MAX))
    }

    pub fn http_status(&self, handle: ConnHandle) -> Result<u16, EngineError> {
        self.finished_http(handle)?
            .head
            .status()
            .ok_or(EngineError::HttpNotFinished)
    }

    // --- host completions ---

    /// Result of an `IoRequest::StartNetworking`.
    pub fn on_network_started(&mut self, result: io::Result<()>) {
        if self.networking != NetworkingState::Starting {
            warn!(state = ?self.networking, "unexpected networking notification ignored");
            return;
        }
        let parked: Vec<OpId> = self.parked.drain(..).collect();
        match result {
            Ok(()) => {
                self.networking = NetworkingState::Started;
                debug!(released = parked.len(), "networking started");
                for id in parked {
                    if let Some(op) = self.ops.get_mut(&id) {
                        op.parked = false;
                        self.advance(id, Step::Done);
                    }
                }
            }
            Err(e) => {
                self.networking = NetworkingState::Idle;
                warn!(error = %e, failed = parked.len(), "networking failed to start");
                for id in parked {
                    if let Some(op) = self.ops.get_mut(&id) {
                        op.parked = false;
                        self.retire(id, Err(ConnError::Network));
                    }
                }
            }
        }
    }

    /// Result of the primitive request tagged `id`.
    pub fn on_complete(&mut self, id: OpId, result: io::Result<Completion>) {
        let Some(op) = self.ops.get_mut(&id) else {
            warn!(op = %id, "completion for retired operation ignored");
            return;
        };
        if !op.in_flight {
            warn!(op = %id, "completion without outstanding request ignored");
            return;
        }
        op.in_flight = false;
        let step = match result {
            Ok(completion) => self.apply(id, completion),
            Err(e) => match op.subs.front() {
                Some(sub) => {
                    let err = translate_error(sub, &e);
                    debug!(op = %id, sub = sub.name(), error = %e, code = err.code(), "primitive failed");
                    Step::Failed(err)
                }
                None => Step::Failed(ConnError::Internal),
            },
        };
        self.advance(id, step);
    }

    // --- pipeline ---

    fn start_op(&mut self, handle: ConnHandle, kind: OpKind, subs: Vec<SubOp>) -> OpId {
        self.next_op += 1;
        let id = OpId(self.next_op);
        let event_kind = kind.event_kind();
        if let Some(conn) = self.conns.get_mut(handle) {
            conn.pending.insert(event_kind);
            conn.live_ops.push(id);
        }
        debug!(handle = %handle, op = %id, kind = ?event_kind, steps = subs.len(), "operation started");
        self.ops.insert(id, Operation::new(id, handle, kind, subs));
        self.advance(id, Step::Next);
        id
    }

    /// Run the pipeline until it waits on the host or retires.
    fn advance(&mut self, id: OpId, mut step: Step) {
        loop {
            step = match step {
                Step::Issued | Step::Parked => return,
                Step::Failed(err) => {
                    self.retire(id, Err(err));
                    return;
                }
                Step::Done => {
                    if let Some(op) = self.ops.get_mut(&id) {
                        op.subs.pop_front();
                    }
                    Step::Next
                }
                Step::Next => {
                    let finished = match self.ops.get(&id) {
                        Some(op) => op.subs.is_empty(),
                        None => return,
                    };
                    if finished {
                        self.retire(id, Ok(()));
                        return;
                    }
                    self.issue(id)
                }
            };
        }
    }

    /// Start the front sub-operation.
    fn issue(&mut self, id: OpId) -> Step {
        let Some(op) = self.ops.get_mut(&id) else {
            return Step::Failed(ConnError::Internal);
        };
        let handle = op.handle;
        let Some(sub) = op.subs.front_mut() else {
            return Step::Next;
        };
        let name = sub.name();
        let request = match sub {
            SubOp::StartNetworking => match self.networking {
                NetworkingState::Started => return Step::Done,
                NetworkingState::Starting => {
                    op.parked = true;
                    self.parked.push_back(id);
                    return Step::Parked;
                }
                NetworkingState::Idle => {
                    debug!("starting networking");
                    self.networking = NetworkingState::Starting;
                    op.parked = true;
                    self.parked.push_back(id);
                    self.requests.push_back(IoRequest::StartNetworking);
                    return Step::Parked;
                }
            },
            SubOp::Resolve { hostname } => IoRequest::Resolve {
                op: id,
                hostname: hostname.clone(),
            },
            SubOp::SocketConnect { target, port } => {
                match endpoint_for(*target, *port, op.resolved) {
                    Some(endpoint) => IoRequest::Connect {
                        op: id,
                        handle,
                        endpoint,
                    },
                    None => return Step::Failed(ConnError::Internal),
                }
            }
            SubOp::Read { max_len } => {
                let leftover = self
                    .conns
                    .get_mut(handle)
                    .and_then(|c| c.http_mut())
                    .filter(|http| http.head.leftover_len() > 0);
                if let Some(http) = leftover {
                    op.received = http.head.take_leftover(*max_len);
                    trace!(op = %id, len = op.received.len(), "read served from buffered body");
                    return Step::Done;
                }
                IoRequest::Read {
                    op: id,
                    handle,
                    max_len: *max_len,
                }
            }
            SubOp::Write { data } => {
                let http = self.conns.get(handle).and_then(|c| c.http());
                if http.is_some_and(|http| !http.writable()) {
                    return Step::Failed(ConnError::ReadOnly);
                }
                IoRequest::Write {
                    op: id,
                    handle,
                    data: std::mem::take(data),
                }
            }
            SubOp::HttpReadHeaders => {
                let capacity = self
                    .conns
                    .get(handle)
                    .and_then(|c| c.http())
                    .map(|http| http.head.remaining_capacity());
                match capacity {
                    Some(max_len) if max_len > 0 => IoRequest::Read {
                        op: id,
                        handle,
                        max_len,
                    },
                    _ => return Step::Failed(ConnError::Internal),
                }
            }
        };
        op.in_flight = true;
        trace!(op = %id, sub = name, "primitive requested");
        self.requests.push_back(request);
        Step::Issued
    }

    /// Apply a successful primitive completion to the front sub-operation.
    fn apply(&mut self, id: OpId, completion: Completion) -> Step {
        let Some(op) = self.ops.get_mut(&id) else {
            return Step::Failed(ConnError::Internal);
        };
        let conn = self.conns.get_mut(op.handle);
        match (op.subs.front(), completion) {
            (Some(SubOp::Resolve { .. }), Completion::Resolved(ip)) => {
                op.resolved = Some(ip);
                Step::Done
            }
            (Some(SubOp::SocketConnect { target, port }), Completion::Connected) => {
                if let Some(conn) = conn {
                    conn.remote = endpoint_for(*target, *port, op.resolved);
                    if let Some(http) = conn.http_mut() {
                        http.connected = true;
                    }
                }
                Step::Done
            }
            (Some(SubOp::Read { .. }), Completion::Read(data)) => {
                if data.is_empty() {
                    return Step::Failed(ConnError::Closed);
                }
                op.received = data;
                Step::Done
            }
            (Some(SubOp::Write { .. }), Completion::Written(_)) => Step::Done,
            (Some(SubOp::HttpReadHeaders), Completion::Read(data)) => {
                if data.is_empty() {
                    return Step::Failed(ConnError::Closed);
                }
                let Some(http) = conn.and_then(|c| c.http_mut()) else {
                    return Step::Failed(ConnError::Internal);
                };
                match http.head.feed(&data) {
                    Ok(HeadStatus::Complete) => {
                        http.state = HttpState::Finished;
                        Step::Done
                    }
                    // Same sub-operation again for the rest of the head.
                    Ok(HeadStatus::NeedMore) => Step::Next,
                    Err(err) => Step::Failed(err),
                }
            }
            (sub, _) => {
                warn!(op = %id, sub = sub.map(SubOp::name), "completion does not match outstanding request");
                Step::Failed(ConnError::Internal)
            }
        }
    }

    fn cancel_op(&mut self, id: OpId) {
        let Some(op) = self.ops.get(&id) else {
            return;
        };
        if op.in_flight {
            self.requests.push_back(IoRequest::Cancel { op: id });
        }
        self.retire(id, Err(ConnError::Canceled));
    }

    /// Remove the operation, then release its buffer, clear its pending bit and queue its event.
    fn retire(&mut self, id: OpId, outcome: Result<(), ConnError>) {
        let Some(mut op) = self.ops.remove(&id) else {
            return;
        };
        if op.parked {
            self.parked.retain(|&p| p != id);
        }
        let handle = op.handle;
        let kind = op.kind.event_kind();
        let mut data = None;
        let result = outcome.and_then(|()| match &mut op.kind {
            OpKind::AddrConnect | OpKind::NameConnect => Ok(1),
            OpKind::Read => {
                let n = op.received.len();
                data = Some(std::mem::take(&mut op.received));
                Ok(n)
            }
            OpKind::ReadToBuffer { offset, buffer, .. } => {
                let n = op.received.len();
                let range = offset.checked_add(n).map(|end| *offset..end);
                match range.and_then(|r| buffer.get_mut(r)) {
                    Some(dst) => {
                        dst.copy_from_slice(&op.received);
                        Ok(n)
                    }
                    None => Err(ConnError::Internal),
                }
            }
            OpKind::Write { len } | OpKind::WriteFromBuffer { len, .. } => Ok(*len),
            OpKind::HttpFinish { .. } => self
                .conns
                .get(handle)
                .and_then(|c| c.http())
                .and_then(|http| http.head.status())
                .map(usize::from)
                .ok_or(ConnError::Internal),
        });
        if let Some((resource, buffer)) = op.kind.take_buffer() {
            if let Err(e) = self.resources.release(resource, buffer) {
                warn!(op = %id, error = %e, "buffer release failed");
            }
        }
        if let Some(conn) = self.conns.get_mut(handle) {
            conn.pending.remove(kind);
            conn.forget_op(id);
        }
        let event = match result {
            Ok(n) => {
                let mut event =
                    ConnEvent::success(handle, kind, u32::try_from(n).unwrap_or(u32::MAX));
                event.data = data;
                event
            }
            Err(err) => ConnEvent::failure(handle, kind, err),
        };
        debug!(handle = %handle, op = %id, kind = ?kind, result = event.result, "operation retired");
        self.events.push_back(event);
    }

    // --- helpers ---

    fn check_transfer(&self, handle: ConnHandle, kind: ConnOpKind) -> Result<(), EngineError> {
        let conn = self
            .conns
            .get(handle)
            .ok_or(EngineError::InvalidHandle(handle))?;
        if conn.pending.contains(kind) {
            return Err(match kind {
                ConnOpKind::Read => EngineError::AlreadyReading,
                _ => EngineError::AlreadyWriting,
            });
        }
        if kind == ConnOpKind::Read {
            if let Some(http) = conn.http() {
                if http.state != HttpState::Finished {
                    return Err(EngineError::HttpNotFinished);
                }
            }
        }
        Ok(())
    }

    /// HTTP connections still in `Setup` send the request head before the first body write.
    fn write_prelude(&mut self, handle: ConnHandle) -> Vec<SubOp> {
        match self.conns.get_mut(handle).and_then(|c| c.http_mut()) {
            Some(http) if http.state == HttpState::Setup => {
                http.state = HttpState::Writing;
                request_prelude(http)
            }
            _ => Vec::new(),
        }
    }

    fn checkout_range(&mut self, resource: ResourceHandle, end: usize) -> Result<Vec<u8>, EngineError> {
        let buffer = self.resources.checkout(resource)?;
        if end > buffer.len() {
            self.resources.release(resource, buffer)?;
            return Err(EngineError::DataOutOfBounds);
        }
        Ok(buffer)
    }

    fn finished_http(&self, handle: ConnHandle) -> Result<&HttpConnection, EngineError> {
        let http = self
            .conns
            .get(handle)
            .ok_or(EngineError::InvalidHandle(handle))?
            .http()
            .ok_or(EngineError::NotHttp)?;
        if http.state != HttpState::Finished {
            return Err(EngineError::HttpNotFinished);
        }
        Ok(http)
    }
}

/// Networking, name resolution, connect and the formatted request head.
fn request_prelude(http: &HttpConnection) -> Vec<SubOp> {
    vec![
        SubOp::StartNetworking,
        SubOp::Resolve {
            hostname: http.url.host.clone(),
        },
        SubOp::SocketConnect {
            target: Target::FromResolve,
            port: http.url.port,
        },
        SubOp::Write {
            data: http.request_bytes(),
        },
    ]
}

fn transfer_end(offset: usize, size: usize) -> Result<usize, EngineError> {
    if size == 0 {
        return Err(EngineError::DataOutOfBounds);
    }
    offset.checked_add(size).ok_or(EngineError::DataOutOfBounds)
}

fn endpoint_for(target: Target, port: u16, resolved: Option<std::net::IpAddr>) -> Option<Endpoint> {
    match target {
        Target::Ip(ip) => Some(Endpoint::Inet(SocketAddr::new(ip, port))),
        Target::FromResolve => resolved.map(|ip| Endpoint::Inet(SocketAddr::new(ip, port))),
        Target::Bluetooth(addr) => Some(Endpoint::Bluetooth {
            addr,
            channel: u8::try_from(port).ok()?,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_MAX_HEADER_BYTES;
    use crate::url::BtAddr;
    use std::net::{IpAddr, Ipv4Addr};

    const REMOTE: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7));

    fn engine() -> ConnEngine {
        ConnEngine::new(EngineConfig::default())
    }

    fn single(e: &mut ConnEngine) -> IoRequest {
        let mut reqs = e.drain_requests();
        assert_eq!(reqs.len(), 1, "expected one request, got {:?}", reqs);
        reqs.remove(0)
    }

    fn op_of(req: &IoRequest) -> OpId {
        match req {
            IoRequest::Resolve { op, .. }
            | IoRequest::Connect { op, .. }
            | IoRequest::Read { op, .. }
            | IoRequest::Write { op, .. }
            | IoRequest::Cancel { op } => *op,
            other => panic!("request carries no op: {:?}", other),
        }
    }

    fn single_event(e: &mut ConnEngine) -> ConnEvent {
        let mut events = e.drain_events();
        assert_eq!(events.len(), 1, "expected one event, got {:?}", events);
        events.remove(0)
    }

    /// Connected plain socket with no pending operations.
    fn connected_socket(e: &mut ConnEngine) -> ConnHandle {
        let h = e.connect("socket://localhost:7000").unwrap();
        let op = op_of(&single(e));
        e.on_complete(op, Ok(Completion::Connected));
        assert_eq!(single_event(e).outcome(), Ok(1));
        h
    }

    /// Drive an HTTP finish started from `Setup` until the response-head read is issued.
    fn drive_to_head_read(e: &mut ConnEngine) -> OpId {
        if e.networking_state() != NetworkingState::Started {
            assert_eq!(single(e), IoRequest::StartNetworking);
            e.on_network_started(Ok(()));
        }
        let op = op_of(&single(e));
        e.on_complete(op, Ok(Completion::Resolved(REMOTE)));
        assert!(matches!(single(e), IoRequest::Connect { .. }));
        e.on_complete(op, Ok(Completion::Connected));
        let n = match single(e) {
            IoRequest::Write { data, .. } => data.len(),
            other => panic!("expected request write, got {:?}", other),
        };
        e.on_complete(op, Ok(Completion::Written(n)));
        assert!(matches!(single(e), IoRequest::Read { .. }));
        op
    }

    #[test]
    fn localhost_connect_skips_networking_and_resolve() {
        let mut e = engine();
        let h = e.connect("socket://localhost:5000").unwrap();
        let expected = Endpoint::Inet("127.0.0.1:5000".parse().unwrap());
        let req = single(&mut e);
        assert_eq!(
            req,
            IoRequest::Connect {
                op: op_of(&req),
                handle: h,
                endpoint: expected
            }
        );
        assert!(e.pending_ops(h).unwrap().contains(ConnOpKind::Connect));
        e.on_complete(op_of(&req), Ok(Completion::Connected));
        let ev = single_event(&mut e);
        assert_eq!((ev.handle, ev.op, ev.result), (h, ConnOpKind::Connect, 1));
        assert_eq!(e.remote_endpoint(h), Some(expected));
        assert!(e.pending_ops(h).unwrap().is_empty());
        assert_eq!(e.networking_state(), NetworkingState::Idle);
    }

    #[test]
    fn bogus_url_fails_synchronously() {
        let mut e = engine();
        assert_eq!(e.connect("socket://bogus!!url"), Err(ConnError::Url));
        assert_eq!(e.connect("gopher://e.com/"), Err(ConnError::Url));
        assert_eq!(e.http_create("socket://e.com:1", HttpMethod::Get), Err(ConnError::Url));
        assert_eq!(e.connection_count(), 0);
        assert!(e.poll_request().is_none());
        assert!(e.poll_event().is_none());
    }

    #[test]
    fn ceiling_is_checked_before_url() {
        let mut e = ConnEngine::new(EngineConfig {
            max_connections: 1,
            ..EngineConfig::default()
        });
        e.connect("socket://localhost:1").unwrap();
        assert_eq!(e.connect("socket://bogus!!url"), Err(ConnError::Max));
        assert_eq!(e.http_create("http://e.com/", HttpMethod::Get), Err(ConnError::Max));
        assert_eq!(e.connection_count(), 1);
    }

    #[test]
    fn name_connect_runs_steps_in_order() {
        let mut e = engine();
        let h = e.connect("socket://example.com:80").unwrap();
        assert_eq!(single(&mut e), IoRequest::StartNetworking);
        assert_eq!(e.networking_state(), NetworkingState::Starting);
        e.on_network_started(Ok(()));

        let req = single(&mut e);
        let op = op_of(&req);
        assert_eq!(
            req,
            IoRequest::Resolve {
                op,
                hostname: "example.com".into()
            }
        );
        e.on_complete(op, Ok(Completion::Resolved(REMOTE)));
        assert_eq!(
            single(&mut e),
            IoRequest::Connect {
                op,
                handle: h,
                endpoint: Endpoint::Inet(SocketAddr::new(REMOTE, 80))
            }
        );
        assert!(e.drain_events().is_empty());
        e.on_complete(op, Ok(Completion::Connected));
        assert_eq!(single_event(&mut e).outcome(), Ok(1));
    }

    #[test]
    fn networking_start_is_coalesced() {
        let mut e = engine();
        let a = e.connect("socket://a.example:1").unwrap();
        let b = e.connect("socket://b.example:2").unwrap();
        assert_eq!(e.drain_requests(), vec![IoRequest::StartNetworking]);
        e.on_network_started(Ok(()));
        let reqs = e.drain_requests();
        let hosts: Vec<_> = reqs
            .iter()
            .map(|r| match r {
                IoRequest::Resolve { hostname, .. } => hostname.as_str(),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(hosts, vec!["a.example", "b.example"]);

        // Started: later operations go straight to resolve.
        let c = e.connect("socket://c.example:3").unwrap();
        assert!(matches!(single(&mut e), IoRequest::Resolve { .. }));
        assert!(a != b && b != c);
    }

    #[test]
    fn networking_failure_fails_parked_ops_and_allows_retry() {
        let mut e = engine();
        let a = e.connect("socket://a.example:1").unwrap();
        let b = e.connect("socket://b.example:1").unwrap();
        e.drain_requests();
        e.on_network_started(Err(io::Error::new(io::ErrorKind::Other, "radio off")));
        let events = e.drain_events();
        assert_eq!(events.len(), 2);
        assert_eq!((events[0].handle, events[0].outcome()), (a, Err(ConnError::Network)));
        assert_eq!((events[1].handle, events[1].outcome()), (b, Err(ConnError::Network)));
        assert_eq!(e.networking_state(), NetworkingState::Idle);
        // Operational failure does not close the connection.
        assert!(e.is_open(a));

        e.connect("socket://c.example:1").unwrap();
        assert_eq!(single(&mut e), IoRequest::StartNetworking);
    }

    #[test]
    fn primitive_failures_are_translated() {
        let mut e = engine();
        e.connect("socket://example.com:80").unwrap();
        e.drain_requests();
        e.on_network_started(Ok(()));
        let op = op_of(&single(&mut e));
        e.on_complete(op, Err(io::Error::from(io::ErrorKind::ConnectionRefused)));
        assert_eq!(single_event(&mut e).outcome(), Err(ConnError::Dns));

        e.connect("socket://example.com:80").unwrap();
        let op = op_of(&single(&mut e));
        e.on_complete(op, Ok(Completion::Resolved(REMOTE)));
        e.drain_requests();
        e.on_complete(op, Err(io::Error::from(io::ErrorKind::ConnectionRefused)));
        assert_eq!(single_event(&mut e).outcome(), Err(ConnError::Generic));

        let h = connected_socket(&mut e);
        e.read(h, 16).unwrap();
        let op = op_of(&single(&mut e));
        e.on_complete(op, Err(io::Error::from(io::ErrorKind::ConnectionReset)));
        let ev = single_event(&mut e);
        assert_eq!((ev.op, ev.outcome()), (ConnOpKind::Read, Err(ConnError::Closed)));
        assert!(e.pending_ops(h).unwrap().is_empty());
    }

    #[test]
    fn read_delivers_bytes_and_zero_length_means_closed() {
        let mut e = engine();
        let h = connected_socket(&mut e);
        e.read(h, 16).unwrap();
        let req = single(&mut e);
        assert_eq!(
            req,
            IoRequest::Read {
                op: op_of(&req),
                handle: h,
                max_len: 16
            }
        );
        e.on_complete(op_of(&req), Ok(Completion::Read(b"abc".to_vec())));
        let ev = single_event(&mut e);
        assert_eq!(ev.result, 3);
        assert_eq!(ev.data, Some(b"abc".to_vec()));

        e.read(h, 16).unwrap();
        let op = op_of(&single(&mut e));
        e.on_complete(op, Ok(Completion::Read(Vec::new())));
        assert_eq!(single_event(&mut e).outcome(), Err(ConnError::Closed));
    }

    #[test]
    fn write_reports_callers_length() {
        let mut e = engine();
        let h = connected_socket(&mut e);
        e.write(h, b"hello").unwrap();
        let req = single(&mut e);
        assert_eq!(
            req,
            IoRequest::Write {
                op: op_of(&req),
                handle: h,
                data: b"hello".to_vec()
            }
        );
        e.on_complete(op_of(&req), Ok(Completion::Written(5)));
        let ev = single_event(&mut e);
        assert_eq!((ev.op, ev.result, ev.data), (ConnOpKind::Write, 5, None));
    }

    #[test]
    fn overlapping_transfers_are_rejected() {
        let mut e = engine();
        let h = connected_socket(&mut e);
        e.read(h, 4).unwrap();
        assert_eq!(e.read(h, 4), Err(EngineError::AlreadyReading));
        e.write(h, b"x").unwrap();
        assert_eq!(e.write(h, b"y"), Err(EngineError::AlreadyWriting));
        let r = e.resources_mut().insert(vec![0; 4]);
        assert_eq!(e.read_to_buffer(h, r, 0, 4), Err(EngineError::AlreadyReading));
        assert_eq!(e.write_from_buffer(h, r, 0, 4), Err(EngineError::AlreadyWriting));
        assert!(!e.resources().is_in_flight(r));
        let pending = e.pending_ops(h).unwrap();
        assert_eq!(pending.bits(), PendingOps::READ | PendingOps::WRITE);
        // Rejections queue nothing beyond the two accepted operations.
        assert_eq!(e.drain_requests().len(), 2);
        assert!(e.drain_events().is_empty());
    }

    #[test]
    fn precondition_errors() {
        let mut e = engine();
        let bad = ConnHandle(99);
        assert_eq!(e.read(bad, 1), Err(EngineError::InvalidHandle(bad)));
        assert_eq!(e.close(bad), Err(EngineError::InvalidHandle(bad)));
        let h = connected_socket(&mut e);
        assert_eq!(e.read(h, 0), Err(EngineError::DataOutOfBounds));
        assert_eq!(e.write(h, b""), Err(EngineError::DataOutOfBounds));
        assert_eq!(e.http_finish(h), Err(EngineError::NotHttp));
        assert_eq!(e.http_set_request_header(h, "a", "b"), Err(EngineError::NotHttp));
        assert_eq!(e.http_status(h), Err(EngineError::NotHttp));
        let missing = ResourceHandle(42);
        assert_eq!(
            e.read_to_buffer(h, missing, 0, 1),
            Err(EngineError::Resource(ResourceError::Unknown(missing)))
        );
        assert!(e.drain_requests().is_empty());
    }

    #[test]
    fn close_cancels_every_live_operation() {
        let mut e = engine();
        let h = connected_socket(&mut e);
        e.read(h, 8).unwrap();
        e.write(h, b"data").unwrap();
        let reqs = e.drain_requests();
        let (read_op, write_op) = (op_of(&reqs[0]), op_of(&reqs[1]));

        e.close(h).unwrap();
        let events = e.drain_events();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|ev| ev.handle == h && ev.is_canceled()));
        assert_eq!(events[0].op, ConnOpKind::Read);
        assert_eq!(events[1].op, ConnOpKind::Write);
        assert_eq!(
            e.drain_requests(),
            vec![
                IoRequest::Cancel { op: read_op },
                IoRequest::Cancel { op: write_op },
                IoRequest::Close { handle: h }
            ]
        );
        assert!(!e.is_open(h));
        assert_eq!(e.read(h, 1), Err(EngineError::InvalidHandle(h)));

        // Late completion for a canceled operation is dropped.
        e.on_complete(read_op, Ok(Completion::Read(b"late".to_vec())));
        assert!(e.poll_event().is_none());
    }

    #[test]
    fn close_while_parked_needs_no_cancel_request() {
        let mut e = engine();
        let h = e.connect("socket://example.com:80").unwrap();
        assert_eq!(single(&mut e), IoRequest::StartNetworking);
        e.close(h).unwrap();
        let ev = single_event(&mut e);
        assert_eq!((ev.op, ev.outcome()), (ConnOpKind::Connect, Err(ConnError::Canceled)));
        assert_eq!(single(&mut e), IoRequest::Close { handle: h });
        e.on_network_started(Ok(()));
        assert!(e.poll_request().is_none());
        assert!(e.poll_event().is_none());
    }

    #[test]
    fn bluetooth_requires_platform_support() {
        let mut e = engine();
        assert_eq!(e.connect("btspp://0011223344aa:3"), Err(ConnError::Unavailable));
        // Availability is decided before the address is looked at.
        assert_eq!(e.connect("BTSPP://not-an-address"), Err(ConnError::Unavailable));
        assert_eq!(e.connection_count(), 0);

        let mut e = ConnEngine::new(EngineConfig {
            bluetooth_available: true,
            ..EngineConfig::default()
        });
        assert_eq!(e.connect("btspp://not-an-address"), Err(ConnError::Url));
        let h = e.connect("btspp://0011223344aa:3").unwrap();
        let req = single(&mut e);
        assert_eq!(
            req,
            IoRequest::Connect {
                op: op_of(&req),
                handle: h,
                endpoint: Endpoint::Bluetooth {
                    addr: BtAddr([0x00, 0x11, 0x22, 0x33, 0x44, 0xaa]),
                    channel: 3
                }
            }
        );
    }

    #[test]
    fn read_to_buffer_fills_range_and_releases() {
        let mut e = engine();
        let h = connected_socket(&mut e);
        let r = e.resources_mut().insert(vec![0; 8]);
        e.read_to_buffer(h, r, 2, 4).unwrap();
        assert!(e.resources().is_in_flight(r));
        let req = single(&mut e);
        assert!(matches!(req, IoRequest::Read { max_len: 4, .. }));
        e.on_complete(op_of(&req), Ok(Completion::Read(vec![1, 2, 3])));
        let ev = single_event(&mut e);
        assert_eq!((ev.op, ev.result, ev.data), (ConnOpKind::Read, 3, None));
        assert!(!e.resources().is_in_flight(r));
        assert_eq!(e.resources().get(r), Some(&[0u8, 0, 1, 2, 3, 0, 0, 0][..]));
    }

    #[test]
    fn buffer_bounds_are_checked() {
        let mut e = engine();
        let h = connected_socket(&mut e);
        let r = e.resources_mut().insert(vec![0; 8]);
        assert_eq!(e.read_to_buffer(h, r, 6, 4), Err(EngineError::DataOutOfBounds));
        assert_eq!(e.read_to_buffer(h, r, 0, 0), Err(EngineError::DataOutOfBounds));
        assert_eq!(
            e.write_from_buffer(h, r, usize::MAX, 2),
            Err(EngineError::DataOutOfBounds)
        );
        assert!(!e.resources().is_in_flight(r));
        assert!(e.drain_requests().is_empty());
        e.read_to_buffer(h, r, 4, 4).unwrap();
    }

    #[test]
    fn buffer_is_exclusive_while_in_flight() {
        let mut e = engine();
        let a = connected_socket(&mut e);
        let b = connected_socket(&mut e);
        let r = e.resources_mut().insert(b"abcdef".to_vec());
        e.write_from_buffer(a, r, 1, 3).unwrap();
        assert_eq!(
            e.write_from_buffer(b, r, 0, 1),
            Err(EngineError::Resource(ResourceError::InFlight(r)))
        );
        let req = single(&mut e);
        assert!(matches!(&req, IoRequest::Write { data, .. } if data == b"bcd"));

        // Cancel through close releases the buffer exactly once.
        e.close(a).unwrap();
        assert!(single_event(&mut e).is_canceled());
        assert!(!e.resources().is_in_flight(r));
        assert_eq!(e.resources().get(r), Some(&b"abcdef"[..]));
        e.write_from_buffer(b, r, 0, 6).unwrap();
    }

    #[test]
    fn buffer_released_when_transfer_fails() {
        let mut e = engine();
        let a = connected_socket(&mut e);
        let b = connected_socket(&mut e);
        let r = e.resources_mut().insert(b"abcdefgh".to_vec());

        e.read_to_buffer(a, r, 0, 4).unwrap();
        let req = single(&mut e);
        e.on_complete(op_of(&req), Err(io::ErrorKind::ConnectionReset.into()));
        let ev = single_event(&mut e);
        assert_eq!((ev.op, ev.outcome()), (ConnOpKind::Read, Err(ConnError::Closed)));
        assert!(!e.resources().is_in_flight(r));
        assert_eq!(e.resources().get(r), Some(&b"abcdefgh"[..]));

        e.write_from_buffer(b, r, 0, 4).unwrap();
        assert!(e.resources().is_in_flight(r));
        let req = single(&mut e);
        e.on_complete(op_of(&req), Err(io::ErrorKind::ConnectionReset.into()));
        let ev = single_event(&mut e);
        assert_eq!((ev.op, ev.outcome()), (ConnOpKind::Write, Err(ConnError::Closed)));
        assert!(!e.resources().is_in_flight(r));
        assert_eq!(e.resources().get(r), Some(&b"abcdefgh"[..]));

        let buf = e.resources_mut().checkout(r).unwrap();
        assert_eq!(buf, b"abcdefgh");
        e.resources_mut().release(r, buf).unwrap();
    }

    #[test]
    fn http_finish_from_setup() {
        let mut e = engine();
        let h = e.http_create("http://e.com/x", HttpMethod::Get).unwrap();
        assert!(e.poll_request().is_none());
        e.http_set_request_header(h, "Accept", "*/*").unwrap();
        e.http_finish(h).unwrap();
        assert_eq!(e.http_finish(h), Err(EngineError::HttpAlreadyFinished));
        assert_eq!(e.http_set_request_header(h, "a", "b"), Err(EngineError::HttpNotSetup));
        assert_eq!(e.read(h, 1), Err(EngineError::HttpNotFinished));
        assert_eq!(e.http_response_header(h, "server"), Err(EngineError::HttpNotFinished));

        assert_eq!(single(&mut e), IoRequest::StartNetworking);
        e.on_network_started(Ok(()));
        let req = single(&mut e);
        let op = op_of(&req);
        assert_eq!(
            req,
            IoRequest::Resolve {
                op,
                hostname: "e.com".into()
            }
        );
        e.on_complete(op, Ok(Completion::Resolved(REMOTE)));
        assert_eq!(
            single(&mut e),
            IoRequest::Connect {
                op,
                handle: h,
                endpoint: Endpoint::Inet(SocketAddr::new(REMOTE, 80))
            }
        );
        e.on_complete(op, Ok(Completion::Connected));
        let request = b"GET /x HTTP/1.0\r\naccept: */*\r\nhost: e.com\r\n\r\n".to_vec();
        assert_eq!(
            single(&mut e),
            IoRequest::Write {
                op,
                handle: h,
                data: request.clone()
            }
        );
        e.on_complete(op, Ok(Completion::Written(request.len())));
        assert_eq!(
            single(&mut e),
            IoRequest::Read {
                op,
                handle: h,
                max_len: DEFAULT_MAX_HEADER_BYTES
            }
        );

        let first = b"HTTP/1.0 200 OK\r\nContent-".to_vec();
        e.on_complete(op, Ok(Completion::Read(first.clone())));
        assert_eq!(
            single(&mut e),
            IoRequest::Read {
                op,
                handle: h,
                max_len: DEFAULT_MAX_HEADER_BYTES - first.len()
            }
        );
        assert!(e.drain_events().is_empty());
        e.on_complete(op, Ok(Completion::Read(b"Length: 3\r\n\r\nhel".to_vec())));
        let ev = single_event(&mut e);
        assert_eq!((ev.op, ev.result), (ConnOpKind::Finish, 200));

        assert_eq!(e.http_status(h), Ok(200));
        assert_eq!(e.http_response_header(h, "CONTENT-LENGTH"), Ok(Some("3")));
        assert_eq!(e.http_response_header(h, "server"), Ok(None));
        assert!(e.pending_ops(h).unwrap().is_empty());

        // Buffered body bytes are served without primitive reads.
        e.read(h, 2).unwrap();
        let ev = single_event(&mut e);
        assert_eq!(ev.data, Some(b"he".to_vec()));
        e.read(h, 10).unwrap();
        assert_eq!(single_event(&mut e).data, Some(b"l".to_vec()));
        assert!(e.poll_request().is_none());
        e.read(h, 10).unwrap();
        assert!(matches!(single(&mut e), IoRequest::Read { max_len: 10, .. }));
    }

    #[test]
    fn http_body_write_then_finish() {
        let mut e = engine();
        let h = e.http_create("http://e.com:8080/up", HttpMethod::Post).unwrap();
        e.write(h, b"body").unwrap();
        assert_eq!(e.http_set_request_header(h, "a", "b"), Err(EngineError::HttpNotSetup));
        assert_eq!(single(&mut e), IoRequest::StartNetworking);
        e.on_network_started(Ok(()));
        let op = op_of(&single(&mut e));
        e.on_complete(op, Ok(Completion::Resolved(REMOTE)));
        match single(&mut e) {
            IoRequest::Connect { endpoint, .. } => {
                assert_eq!(endpoint, Endpoint::Inet(SocketAddr::new(REMOTE, 8080)))
            }
            other => panic!("unexpected {:?}", other),
        }
        e.on_complete(op, Ok(Completion::Connected));
        match single(&mut e) {
            IoRequest::Write { data, .. } => {
                assert!(data.starts_with(b"POST /up HTTP/1.0\r\n"));
                e.on_complete(op, Ok(Completion::Written(data.len())));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(single(&mut e), IoRequest::Write { data, .. } if data == b"body"));
        e.on_complete(op, Ok(Completion::Written(4)));
        let ev = single_event(&mut e);
        assert_eq!((ev.op, ev.result), (ConnOpKind::Write, 4));

        // Networking is up and the request head is sent: straight to the response read.
        e.http_finish(h).unwrap();
        let req = single(&mut e);
        assert!(matches!(req, IoRequest::Read { .. }));
        e.on_complete(op_of(&req), Ok(Completion::Read(b"HTTP/1.1 201 Created\r\n\r\n".to_vec())));
        assert_eq!(single_event(&mut e).outcome(), Ok(201));

        // The request is closed once the response arrived.
        e.write(h, b"more").unwrap();
        let ev = single_event(&mut e);
        assert_eq!((ev.op, ev.outcome()), (ConnOpKind::Write, Err(ConnError::ReadOnly)));
        assert!(e.poll_request().is_none());
    }

    #[test]
    fn http_connect_url_reports_status_as_connect() {
        let mut e = engine();
        let h = e.connect("http://e.com/index.html").unwrap();
        let op = drive_to_head_read(&mut e);
        e.on_complete(op, Ok(Completion::Read(b"HTTP/1.0 302 Found\r\nLocation: /\r\n\r\n".to_vec())));
        let ev = single_event(&mut e);
        assert_eq!((ev.handle, ev.op, ev.result), (h, ConnOpKind::Connect, 302));
        assert_eq!(e.http_response_header(h, "location"), Ok(Some("/")));
        assert_eq!(
            e.remote_endpoint(h),
            Some(Endpoint::Inet(SocketAddr::new(REMOTE, 80)))
        );
    }

    #[test]
    fn http_header_copy_into_caller_buffer() {
        let mut e = engine();
        let h = e.connect("http://e.com/").unwrap();
        let op = drive_to_head_read(&mut e);
        e.on_complete(op, Ok(Completion::Read(b"HTTP/1.0 200 OK\r\nServer: tiny\r\n\r\n".to_vec())));
        e.drain_events();

        let mut buf = [0xffu8; 8];
        assert_eq!(e.http_get_response_header(h, "server", &mut buf), Ok(4));
        assert_eq!(&buf[..5], b"tiny\0");
        let mut small = [0xffu8; 4];
        assert_eq!(e.http_get_response_header(h, "server", &mut small), Ok(4));
        assert_eq!(small, [0xff; 4]);
        assert_eq!(
            e.http_get_response_header(h, "x-missing", &mut buf),
            Ok(ConnError::NoHeader.code())
        );
    }

    #[test]
    fn http_protocol_error_and_full_head_buffer() {
        let mut e = engine();
        e.connect("http://e.com/").unwrap();
        let op = drive_to_head_read(&mut e);
        e.on_complete(op, Ok(Completion::Read(b"SSH-2.0-OpenSSH\r\n".to_vec())));
        assert_eq!(single_event(&mut e).outcome(), Err(ConnError::Protocol));

        let mut e = ConnEngine::new(EngineConfig {
            max_header_bytes: 16,
            ..EngineConfig::default()
        });
        let h = e.http_create("http://e.com/", HttpMethod::Head).unwrap();
        e.http_finish(h).unwrap();
        let op = drive_to_head_read(&mut e);
        e.on_complete(op, Ok(Completion::Read(vec![b'a'; 16])));
        let ev = single_event(&mut e);
        assert_eq!((ev.op, ev.outcome()), (ConnOpKind::Finish, Err(ConnError::Internal)));
        assert!(e.is_open(h));
    }

    #[test]
    fn http_peer_close_before_head_complete() {
        let mut e = engine();
        e.connect("http://e.com/").unwrap();
        let op = drive_to_head_read(&mut e);
        e.on_complete(op, Ok(Completion::Read(b"HTTP/1.0 200 OK\r\n".to_vec())));
        let op = op_of(&single(&mut e));
        e.on_complete(op, Ok(Completion::Read(Vec::new())));
        assert_eq!(single_event(&mut e).outcome(), Err(ConnError::Closed));
    }

    #[test]
    fn mismatched_completion_is_internal_error() {
        let mut e = engine();
        e.connect("socket://localhost:1").unwrap();
        let op = op_of(&single(&mut e));
        e.on_complete(op, Ok(Completion::Written(3)));
        assert_eq!(single_event(&mut e).outcome(), Err(ConnError::Internal));
        // Unknown op.
        e.on_complete(OpId(777), Ok(Completion::Connected));
        assert!(e.poll_event().is_none());
    }

    #[test]
    fn shutdown_closes_everything() {
        let mut e = engine();
        let a = connected_socket(&mut e);
        e.read(a, 4).unwrap();
        let b = e.connect("socket://example.com:1").unwrap();
        e.drain_requests();
        e.shutdown();
        assert_eq!(e.connection_count(), 0);
        let events = e.drain_events();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(ConnEvent::is_canceled));
        let closes: Vec<_> = e
            .drain_requests()
            .into_iter()
            .filter(|r| matches!(r, IoRequest::Close { .. }))
            .collect();
        assert_eq!(
            closes,
            vec![IoRequest::Close { handle: a }, IoRequest::Close { handle: b }]
        );
        assert_eq!(e.close(a), Err(EngineError::InvalidHandle(a)));
        e.shutdown();
        assert!(e.drain_requests().is_empty());
    }
}

//! Executes engine primitive requests on tokio sockets and feeds completions back.
//!
//! Each primitive runs as its own task and reports over an mpsc channel. Socket halves are
//! moved into the task for the duration of the call and handed back with the result.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};

use netconn_core::{
    Completion, ConnEngine, ConnEvent, ConnHandle, Endpoint, EngineConfig, IoRequest, OpId,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

/// Largest buffer a single read primitive allocates. Shorter reads are valid.
const MAX_READ_CHUNK: usize = 64 * 1024;

enum Finished {
    Resolve {
        op: OpId,
        result: io::Result<IpAddr>,
    },
    Connect {
        op: OpId,
        handle: ConnHandle,
        result: io::Result<TcpStream>,
    },
    Read {
        op: OpId,
        handle: ConnHandle,
        reader: OwnedReadHalf,
        result: io::Result<Vec<u8>>,
    },
    Write {
        op: OpId,
        handle: ConnHandle,
        writer: OwnedWriteHalf,
        result: io::Result<usize>,
    },
    /// The task ended without reporting.
    Lost { op: OpId },
}

impl Finished {
    fn op(&self) -> OpId {
        match self {
            Finished::Resolve { op, .. }
            | Finished::Connect { op, .. }
            | Finished::Read { op, .. }
            | Finished::Write { op, .. }
            | Finished::Lost { op } => *op,
        }
    }
}

#[derive(Default)]
struct Socket {
    reader: Option<OwnedReadHalf>,
    writer: Option<OwnedWriteHalf>,
}

pub struct Driver {
    engine: ConnEngine,
    tx: mpsc::UnboundedSender<Finished>,
    rx: mpsc::UnboundedReceiver<Finished>,
    sockets: HashMap<ConnHandle, Socket>,
    tasks: HashMap<OpId, AbortHandle>,
}

impl Driver {
    pub fn new(config: EngineConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            engine: ConnEngine::new(config),
            tx,
            rx,
            sockets: HashMap::new(),
            tasks: HashMap::new(),
        }
    }

    pub fn engine(&self) -> &ConnEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut ConnEngine {
        &mut self.engine
    }

    /// Wait for the next engine event. `None` when nothing is queued and no primitive is running.
    pub async fn next_event(&mut self) -> Option<ConnEvent> {
        loop {
            self.pump();
            if let Some(event) = self.engine.poll_event() {
                return Some(event);
            }
            if self.tasks.is_empty() {
                return None;
            }
            let finished = self.rx.recv().await?;
            self.finish(finished);
        }
    }

    /// Execute every queued request. Must run inside a tokio runtime.
    fn pump(&mut self) {
        while let Some(req) = self.engine.poll_request() {
            trace!(?req, "executing request");
            match req {
                IoRequest::StartNetworking => self.engine.on_network_started(Ok(())),
                IoRequest::Resolve { op, hostname } => {
                    let tx = self.tx.clone();
                    self.spawn(op, async move {
                        let result = resolve(&hostname).await;
                        let _ = tx.send(Finished::Resolve { op, result });
                    });
                }
                IoRequest::Connect {
                    op,
                    handle,
                    endpoint,
                } => {
                    let addr = match endpoint {
                        Endpoint::Inet(addr) => addr,
                        Endpoint::Bluetooth { .. } => {
                            let err = io::Error::new(io::ErrorKind::Unsupported, "rfcomm not supported");
                            self.engine.on_complete(op, Err(err));
                            continue;
                        }
                    };
                    let tx = self.tx.clone();
                    self.spawn(op, async move {
                        let result = TcpStream::connect(addr).await;
                        let _ = tx.send(Finished::Connect { op, handle, result });
                    });
                }
                IoRequest::Read { op, handle, max_len } => {
                    let Some(mut reader) = self.sockets.get_mut(&handle).and_then(|s| s.reader.take())
                    else {
                        self.engine
                            .on_complete(op, Err(io::ErrorKind::NotConnected.into()));
                        continue;
                    };
                    let tx = self.tx.clone();
                    self.spawn(op, async move {
                        let mut buf = vec![0u8; max_len.min(MAX_READ_CHUNK)];
                        let result = reader.read(&mut buf).await.map(|n| {
                            buf.truncate(n);
                            buf
                        });
                        let _ = tx.send(Finished::Read {
                            op,
                            handle,
                            reader,
                            result,
                        });
                    });
                }
                IoRequest::Write { op, handle, data } => {
                    let Some(mut writer) = self.sockets.get_mut(&handle).and_then(|s| s.writer.take())
                    else {
                        self.engine
                            .on_complete(op, Err(io::ErrorKind::NotConnected.into()));
                        continue;
                    };
                    let tx = self.tx.clone();
                    self.spawn(op, async move {
                        let result = writer.write_all(&data).await.map(|()| data.len());
                        let _ = tx.send(Finished::Write {
                            op,
                            handle,
                            writer,
                            result,
                        });
                    });
                }
                IoRequest::Cancel { op } => {
                    if let Some(task) = self.tasks.remove(&op) {
                        debug!(op = %op, "aborting primitive");
                        task.abort();
                    }
                }
                IoRequest::Close { handle } => {
                    if self.sockets.remove(&handle).is_some() {
                        debug!(handle = %handle, "socket dropped");
                    }
                }
            }
        }
    }

    /// Run `fut` for `op`. A watcher reports the op as lost if the task panics.
    fn spawn<F>(&mut self, op: OpId, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let task = tokio::spawn(fut);
        self.tasks.insert(op, task.abort_handle());
        let tx = self.tx.clone();
        tokio::spawn(async move {
            if let Err(e) = task.await {
                if e.is_panic() {
                    warn!(op = %op, "primitive task panicked");
                    let _ = tx.send(Finished::Lost { op });
                }
            }
        });
    }

    fn finish(&mut self, finished: Finished) {
        let op = finished.op();
        if self.tasks.remove(&op).is_none() {
            // Canceled after it reported. Dropping the message drops any socket it carries.
            debug!(op = %op, "stale completion dropped");
            return;
        }
        let result = match finished {
            Finished::Resolve { result, .. } => result.map(Completion::Resolved),
            Finished::Connect { handle, result, .. } => result.map(|stream| {
                let (reader, writer) = stream.into_split();
                self.sockets.insert(
                    handle,
                    Socket {
                        reader: Some(reader),
                        writer: Some(writer),
                    },
                );
                Completion::Connected
            }),
            Finished::Read {
                handle,
                reader,
                result,
                ..
            } => {
                if let Some(socket) = self.sockets.get_mut(&handle) {
                    socket.reader = Some(reader);
                }
                result.map(Completion::Read)
            }
            Finished::Write {
                handle,
                writer,
                result,
                ..
            } => {
                if let Some(socket) = self.sockets.get_mut(&handle) {
                    socket.writer = Some(writer);
                }
                result.map(Completion::Written)
            }
            Finished::Lost { .. } => Err(io::Error::other("primitive task panicked")),
        };
        self.engine.on_complete(op, result);
    }
}

/// First IPv4 address for `hostname`, else the first address of any family.
async fn resolve(hostname: &str) -> io::Result<IpAddr> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((hostname, 0)).await?.collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .map(|a| a.ip())
        .ok_or_else(|| {
            warn!(hostname, "name resolved to no addresses");
            io::Error::new(io::ErrorKind::NotFound, "no addresses")
        })
}

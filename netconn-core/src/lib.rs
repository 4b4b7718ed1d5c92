//! netconn connection engine.
//! Host-driven: no I/O; the host executes primitive requests and feeds completions back.

pub mod config;
pub mod engine;
pub mod event;
pub mod http;
pub mod op;
pub mod resource;
pub mod table;
pub mod url;

pub use config::EngineConfig;
pub use engine::{ConnEngine, EngineError, NetworkingState};
pub use event::{ConnError, ConnEvent, ConnOpKind};
pub use http::{HeaderMap, HttpMethod, HttpState, InvalidMethod};
pub use op::{Completion, Endpoint, IoRequest, OpId};
pub use resource::{BufferTable, ResourceError, ResourceHandle, ResourceTable};
pub use table::{ConnHandle, PendingOps};

pub mod backend;
pub mod error;
pub mod framing;
pub mod handlers;
pub mod hooks;
pub mod jsonrpc;
pub mod permission;

pub use backend::{AcpBackend, BackendConfig, ChangeTitleProbe};
pub use error::{BackendError, BackendResult};
pub use framing::LineDisposition;
pub use hooks::{DefaultTransport, PromptContext, TransportHooks};
pub use permission::{PermissionDecision, PermissionHandler};

//! Publish connection management
//!
//! - [`PublishConnection`]: the transport seam
//! - [`ConnectionSupervisor`]: connect / publish / monitor / reconnect
//! - [`ReconnectPolicy`]: linear backoff and health failure accounting
//! - [`TcpPublishConnection`]: framed TCP transport, with [`TcpSink`] as the receiving end

pub mod connection;
pub mod policy;
pub mod state;
pub mod supervisor;
pub mod tcp;
pub mod wire;

pub use connection::PublishConnection;
pub use policy::ReconnectPolicy;
pub use state::ConnectionState;
pub use supervisor::{ConnectionSupervisor, SupervisorCommand, SupervisorHandle};
pub use tcp::{Endpoint, SinkCounters, TcpPublishConnection, TcpSink, DEFAULT_PORT};

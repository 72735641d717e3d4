//! Hubwatch - notification hub subscriber.
//!
//! This crate connects to a remote notification hub over an authenticated
//! TCP/TLS connection, receives push notifications as length-delimited
//! frames, and re-exposes them as a single ordered, blockable stream for
//! a consumer such as the stdout printer or file logger in the binary.
//!
//! # Architecture
//!
//! - **NotifierServer** - owns the single connection's lifecycle
//!   (disconnected/connecting/connected), the ordered notification buffer,
//!   and the signal-driven termination semantics
//! - **HubApplication** - per-connection protocol state machine: sends the
//!   subscribe, classifies every inbound frame
//! - **Transport** - connection manager trait seam plus the tokio TCP/TLS
//!   implementation
//! - **Protocol** - typed messages and their JSON wire form
//! - **Output** - stdout/file drivers consuming the stream
//!
//! # Modules
//!
//! - [`notifier`] - server lifecycle and the notification stream
//! - [`application`] - protocol dispatch for one live connection
//! - [`transport`] - connection manager and trait seam
//! - [`protocol`] - message types and codec
//! - [`config`] - hub address parsing and certificate profiles
//! - [`output`] - output drivers

pub mod application;
pub mod config;
pub mod constants;
pub mod notifier;
pub mod output;
pub mod protocol;
pub mod transport;

// Re-export commonly used types
pub use application::HubApplication;
pub use config::{cert_wrapper, parse_hub, resolve_hub, HubEndpoint, TlsClient};
pub use notifier::{ConnectionState, NotificationStream, NotifierError, NotifierServer};
pub use output::OutputDriver;
pub use protocol::{Category, Message, Notification};
pub use transport::{ConnectionManager, TcpConnectionManager};

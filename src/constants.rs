//! Application-wide constants for hubwatch.
//!
//! Centralizes the well-known protocol values and default paths so they
//! are discoverable in one place rather than scattered through the code.

use std::time::Duration;

/// Well-known TCP port for the notification hub.
///
/// Used when the hub specification omits an explicit port.
pub const HUB_PORT: u16 = 4859;

/// Default certificate profile configuration file.
///
/// Tilde-expanded at load time. Only consulted when TLS is enabled and no
/// explicit `--cert-conf` path was given.
pub const DEFAULT_CERT_CONF: &str = "~/.hubwatch.cert";

/// Default profile section within the certificate configuration file.
///
/// A `[name]` suffix on the configuration path overrides this.
pub const DEFAULT_PROFILE: &str = "notifier";

/// How long a graceful shutdown waits for the transport to drain pending
/// writes before the connection is dropped anyway.
pub const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

//! Server configuration constants.

use std::time::Duration;

/// Default listen address (localhost only; the transport is unauthenticated).
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:50000";

/// Service name reported to OpenTelemetry.
pub const SERVICE_NAME: &str = "mirrorfs-server";

/// Pause after a failed `accept` before trying again, so a persistent error
/// such as descriptor exhaustion does not spin the loop.
pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

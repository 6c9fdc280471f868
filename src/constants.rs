//! Application-wide constants for keyper.
//!
//! Centralizes magic numbers and fixed names so they are discoverable in
//! one place rather than scattered across modules.

use std::time::Duration;

/// HTTP client request timeout for calls to the authentication backend.
///
/// 10 seconds is sufficient for the small login/logout/profile requests
/// while preventing indefinite hangs on network issues.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Name of the persisted slot holding the serialized session record.
///
/// There is exactly one slot per deployment; concurrent sessions under the
/// same key are not supported.
pub const SESSION_KEY: &str = "session_token";

/// Service name under which keyring entries are registered.
pub const KEYRING_SERVICE: &str = "keyper";

/// How long commands wait for pending background persistence writes to
/// settle before the process exits.
pub const WRITE_SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

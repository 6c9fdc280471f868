//! Keyper - persisted login sessions for the command line.
//!
//! Sign in once against an HTTP backend and keep the session token durably
//! stored between runs, in the OS keyring in production or a plain file in
//! test mode.
//!
//! # Architecture
//!
//! - **Slot store** - one named string slot, keyring or file backed
//! - **Session handle** - loading/value state machine with write-through
//!   persistence and last-write-wins ordering
//! - **Auth client** - login/logout/profile HTTP calls
//! - **Auth context** - single owner of the active session, built once at
//!   startup and passed by reference
//!
//! # Modules
//!
//! - [`store`] - durable slot storage and backend selection
//! - [`session`] - the session state machine
//! - [`auth`] - HTTP client for the authentication backend
//! - [`context`] - sign-in/sign-out policy over the pieces above
//! - [`config`] - configuration loading/saving
//! - [`env`] - runtime environment detection

pub mod auth;
pub mod commands;
pub mod config;
pub mod constants;
pub mod context;
pub mod env;
pub mod session;
pub mod store;

// Re-export commonly used types
pub use auth::{AuthClient, AuthError, Profile};
pub use config::Config;
pub use context::AuthContext;
pub use session::{Session, SessionHandle};
pub use store::{open_store, FileStore, KeyringStore, SlotStore, StoreError};

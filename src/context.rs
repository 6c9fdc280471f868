//! Authentication context: the single owner of the active session.
//!
//! [`AuthContext`] is constructed once at application start and passed by
//! reference to anything that needs the session. There is no ambient or
//! global lookup; "exactly one active session" holds because there is
//! exactly one context.
//!
//! Sign-in and sign-out layer the HTTP calls from [`crate::auth`] on top of
//! the persistence machinery in [`crate::session`]; this module owns the
//! policy decisions (best-effort server logout, non-fatal profile fetch).

use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context, Result};

use crate::auth::{AuthClient, Profile};
use crate::config::Config;
use crate::session::{Session, SessionHandle};
use crate::store::{self, SlotStore};

/// Owns the auth client, the slot store, and the session state machine.
pub struct AuthContext {
    client: AuthClient,
    store: Arc<dyn SlotStore>,
    session: SessionHandle,
}

impl std::fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthContext").finish_non_exhaustive()
    }
}

impl AuthContext {
    /// Builds the context and starts loading the persisted session.
    ///
    /// Fails fast with a descriptive error on invalid configuration; a
    /// context that constructed successfully never surfaces storage
    /// failures to its callers.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is unusable, the HTTP client
    /// cannot be built, or the store backend cannot be opened.
    pub fn new(config: &Config) -> Result<Self> {
        ensure!(
            !config.server_url.is_empty(),
            "server_url is empty; set it in config.json or KEYPER_SERVER_URL"
        );
        ensure!(
            !config.session_key.is_empty(),
            "session_key is empty; remove the override to use the default"
        );

        let client = AuthClient::new(config.server_url.clone())
            .context("creating authentication client")?;
        let store = store::open_store().context("opening session store")?;
        let session = SessionHandle::load(Arc::clone(&store), &config.session_key);

        Ok(Self {
            client,
            store,
            session,
        })
    }

    /// Builds a context over an explicit store and client.
    ///
    /// Lets tests (and embedders) supply their own backends; `new` is this
    /// with the environment-selected store.
    pub fn with_parts(client: AuthClient, store: Arc<dyn SlotStore>, session_key: &str) -> Self {
        let session = SessionHandle::load(Arc::clone(&store), session_key);
        Self {
            client,
            store,
            session,
        }
    }

    /// Signs in and persists the resulting session.
    ///
    /// The profile fetch after login mirrors the login screen's greeting:
    /// best-effort, logged on failure, never fatal once login succeeded.
    ///
    /// # Errors
    ///
    /// Returns an error when login itself fails; the session state is left
    /// untouched in that case.
    pub fn sign_in(&self, username: &str, password: &str) -> Result<Option<Profile>> {
        let session = self
            .client
            .login(username, password)
            .map_err(anyhow::Error::from)
            .with_context(|| format!("signing in as {username}"))?;

        let token = session.token.clone();
        self.session.set(Some(session));

        match self.client.get_profile(&token) {
            Ok(profile) => Ok(Some(profile)),
            Err(e) => {
                log::warn!("Profile fetch after sign-in failed: {}", e);
                Ok(None)
            }
        }
    }

    /// Signs out: best-effort server logout, then clears and deletes the
    /// persisted session.
    ///
    /// The local session is always cleared, even when the server cannot be
    /// reached; the failed logout is logged.
    pub fn sign_out(&self) {
        if let Some(session) = self.session.session() {
            if let Err(e) = self.client.logout(&session.token) {
                log::warn!("Server-side logout failed, clearing local session anyway: {}", e);
            }
        }
        self.session.set(None);
    }

    /// Fetches the profile for the current session.
    ///
    /// # Errors
    ///
    /// Returns an error when not signed in or when the backend rejects the
    /// stored token.
    pub fn profile(&self) -> Result<Profile> {
        let session = self.session.session().context("not signed in")?;
        self.client
            .get_profile(&session.token)
            .map_err(anyhow::Error::from)
            .context("fetching profile")
    }

    /// Current session snapshot, `None` when signed out or still loading.
    pub fn session(&self) -> Option<Session> {
        self.session.session()
    }

    /// `true` until the persisted session has been read once.
    pub fn is_loading(&self) -> bool {
        self.session.is_loading()
    }

    /// Waits for the initial session read; `false` on timeout.
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        self.session.wait_ready(timeout)
    }

    /// Waits for pending persistence writes; `false` on timeout.
    pub fn flush(&self, timeout: Duration) -> bool {
        self.session.flush(timeout)
    }

    /// Backend name of the underlying store, for status output.
    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }
}

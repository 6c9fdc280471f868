//! HTTP client for the authentication backend.
//!
//! Provides [`AuthClient`] with the three calls the session layer is built
//! around: `login`, `logout`, and `get_profile`. Errors are categorized so
//! the CLI can tell bad credentials from an unreachable server.

use std::fmt;

use anyhow::Result;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

use crate::constants;
use crate::session::Session;

/// Categorized authentication errors.
#[derive(Debug)]
pub enum AuthError {
    /// Server rejected the credentials or the session token (401/403).
    InvalidCredentials,
    /// Transport-level failure: server unreachable, timeout, TLS.
    Network(String),
    /// Server answered with an unexpected status.
    Server { status: u16, body: String },
    /// Response body did not parse as the expected JSON.
    Malformed(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCredentials => write!(f, "invalid credentials or expired session"),
            Self::Network(msg) => write!(f, "network error: {msg}"),
            Self::Server { status, body } => write!(f, "server error {status}: {body}"),
            Self::Malformed(msg) => write!(f, "malformed server response: {msg}"),
        }
    }
}

impl std::error::Error for AuthError {}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

/// Profile record returned by `GET /api/profile`.
#[derive(Debug, Clone, Deserialize)]
pub struct Profile {
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Client for the authentication backend.
///
/// Encapsulates HTTP client configuration and provides methods for all
/// login/logout/profile operations.
#[derive(Debug, Clone)]
pub struct AuthClient {
    client: Client,
    server_url: String,
}

impl AuthClient {
    /// Creates a new client for the given server.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(server_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(constants::HTTP_REQUEST_TIMEOUT)
            .build()?;

        Ok(Self { client, server_url })
    }

    /// Creates a client with a pre-configured HTTP client.
    ///
    /// Useful for testing or when custom client configuration is needed.
    pub fn with_client(client: Client, server_url: String) -> Self {
        Self { client, server_url }
    }

    /// Returns the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Exchanges credentials for a session record.
    ///
    /// # Errors
    ///
    /// `InvalidCredentials` on 401/403, `Network` when the server is
    /// unreachable, `Malformed` when the response body is not a session.
    pub fn login(&self, username: &str, password: &str) -> Result<Session, AuthError> {
        let url = format!("{}/api/login", self.server_url);

        let response = self
            .client
            .post(&url)
            .json(&LoginRequest { username, password })
            .send()
            .map_err(|e| AuthError::Network(e.to_string()))?;

        let status = response.status();
        match status.as_u16() {
            200..=299 => {
                let session: Session = response
                    .json()
                    .map_err(|e| AuthError::Malformed(e.to_string()))?;
                log::info!("Logged in as {}", username);
                Ok(session)
            }
            401 | 403 => Err(AuthError::InvalidCredentials),
            _ => Err(AuthError::Server {
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            }),
        }
    }

    /// Invalidates the session server-side.
    ///
    /// # Errors
    ///
    /// `Network` when the server is unreachable; `Server` on a non-success
    /// status. Callers decide whether that is fatal.
    pub fn logout(&self, token: &str) -> Result<(), AuthError> {
        let url = format!("{}/api/logout", self.server_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .send()
            .map_err(|e| AuthError::Network(e.to_string()))?;

        if response.status().is_success() {
            log::debug!("Server-side logout succeeded");
            Ok(())
        } else {
            Err(AuthError::Server {
                status: response.status().as_u16(),
                body: response.text().unwrap_or_default(),
            })
        }
    }

    /// Fetches the profile for a session token.
    ///
    /// # Errors
    ///
    /// `InvalidCredentials` when the token is expired or revoked, `Network`
    /// and `Malformed` as for [`login`](Self::login).
    pub fn get_profile(&self, token: &str) -> Result<Profile, AuthError> {
        let url = format!("{}/api/profile", self.server_url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .map_err(|e| AuthError::Network(e.to_string()))?;

        let status = response.status();
        match status.as_u16() {
            200..=299 => response
                .json()
                .map_err(|e| AuthError::Malformed(e.to_string())),
            401 | 403 => Err(AuthError::InvalidCredentials),
            _ => Err(AuthError::Server {
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            }),
        }
    }
}

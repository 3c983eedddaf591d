//! Authentication and certificate collaborators consumed by the handler chain.

use crate::http::{Credentials, HttpRequest, HttpResponse};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use std::sync::Mutex;

/// Where a connection stands in an authentication handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationState {
    /// Nothing has been asked of the client yet.
    None,
    /// The client was sent a challenge and must answer it.
    Challenge,
    Authenticated,
    /// Credentials were presented and are wrong.
    Rejected,
}

/// Decides whether a request is authenticated.
///
/// When `handle_authentication` returns a response, the server sends it
/// instead of delegating to the protected handler.
pub trait AuthenticationMiddleware: Send + Sync + fmt::Debug {
    fn handle_authentication(
        &self,
        connection_id: u64,
        request: &HttpRequest,
    ) -> (Option<HttpResponse>, AuthenticationState);

    /// Attaches whatever the client needs to answer a challenge.
    fn configure_request(&self, request: &mut HttpRequest);
}

/// Identity material for a server endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub subject: String,
    pub sha256: String,
}

pub trait CertificateProvider: Send + Sync + fmt::Debug {
    fn certificate(&self, descriptor: &str) -> Option<CertificateInfo>;
}

/// Hash a token using SHA-256
pub fn hash_token(token: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().into()
}

pub fn hex(bytes: &[u8]) -> String {
    use fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

impl Credentials {
    /// Value of the `Authorization` header answering a challenge.
    pub fn authorization(&self) -> String {
        TokenAuthentication::authorization_value(&self.scheme, &self.secret)
    }
}

/// Shared-secret scheme: the client answers a challenge with
/// `Authorization: <scheme> <sha256(secret) as hex>`.
///
/// With `same_connection` set the answer is only accepted on a connection
/// that was challenged first, the way connection-bound schemes behave.
pub struct TokenAuthentication {
    scheme: String,
    secret: String,
    same_connection: bool,
    challenged: Mutex<HashSet<u64>>,
}

impl TokenAuthentication {
    pub fn new(scheme: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            secret: secret.into(),
            same_connection: false,
            challenged: Mutex::new(HashSet::new()),
        }
    }

    pub fn connection_bound(mut self) -> Self {
        self.same_connection = true;
        self
    }

    pub fn authorization_value(scheme: &str, secret: &str) -> String {
        format!("{} {}", scheme, hex(&hash_token(secret)))
    }

    fn was_challenged(&self, connection_id: u64) -> bool {
        match self.challenged.lock() {
            Ok(challenged) => challenged.contains(&connection_id),
            Err(poisoned) => poisoned.into_inner().contains(&connection_id),
        }
    }

    fn remember_challenge(&self, connection_id: u64) {
        match self.challenged.lock() {
            Ok(mut challenged) => {
                challenged.insert(connection_id);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(connection_id);
            }
        }
    }

    fn challenge(&self, connection_id: u64) -> HttpResponse {
        self.remember_challenge(connection_id);
        HttpResponse::error(401, "authentication required")
            .with_header("WWW-Authenticate", self.scheme.clone())
    }
}

impl fmt::Debug for TokenAuthentication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenAuthentication")
            .field("scheme", &self.scheme)
            .field("same_connection", &self.same_connection)
            .finish_non_exhaustive()
    }
}

impl AuthenticationMiddleware for TokenAuthentication {
    fn handle_authentication(
        &self,
        connection_id: u64,
        request: &HttpRequest,
    ) -> (Option<HttpResponse>, AuthenticationState) {
        let Some(header) = request.headers.get("Authorization") else {
            return (
                Some(self.challenge(connection_id)),
                AuthenticationState::Challenge,
            );
        };
        if self.same_connection && !self.was_challenged(connection_id) {
            tracing::debug!(
                "connection {} answered a challenge it was never sent",
                connection_id
            );
            return (
                Some(self.challenge(connection_id)),
                AuthenticationState::Challenge,
            );
        }
        if header == Self::authorization_value(&self.scheme, &self.secret) {
            (None, AuthenticationState::Authenticated)
        } else {
            (
                Some(HttpResponse::error(401, "invalid credentials")),
                AuthenticationState::Rejected,
            )
        }
    }

    fn configure_request(&self, request: &mut HttpRequest) {
        request.credentials = Some(Credentials {
            scheme: self.scheme.clone(),
            secret: self.secret.clone(),
        });
    }
}

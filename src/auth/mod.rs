//! Authentication and authorization
//!
//! The broker only talks to the [`Authenticator`] capability: credential
//! checks at CONNECT, topic ACL checks on PUBLISH and SUBSCRIBE, and
//! pre-shared key lookup for transports that need one. [`AllowAll`] accepts
//! everything; [`StaticAuth`] is driven by the `[auth]` and `[acl]` config
//! sections.

mod static_auth;

pub use static_auth::StaticAuth;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;


/// Kind of topic access being checked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Subscribe
    Read,
    /// Publish
    Write,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Credentials or topic access refused
    Denied,
    /// No pre-shared key for the identity
    NotFound,
    /// Backend could not answer
    Backend(String),
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Denied => write!(f, "access denied"),
            Self::NotFound => write!(f, "key not found"),
            Self::Backend(e) => write!(f, "auth backend error: {}", e),
        }
    }
}

impl std::error::Error for AuthError {}

pub type AuthResult<T> = std::result::Result<T, AuthError>;

/// Authentication/authorization capability consumed by the broker
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Check CONNECT credentials. `username` is `None` for anonymous clients.
    async fn check_credentials(
        &self,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> AuthResult<()>;

    /// Check whether `client_id` may read or write `topic`.
    ///
    /// For reads, `topic` is the subscription filter.
    async fn check_acl(
        &self,
        client_id: &str,
        username: Option<&str>,
        topic: &str,
        access: Access,
    ) -> AuthResult<()>;

    /// Look up a pre-shared key by server hint and client identity
    async fn get_preshared_key(&self, hint: Option<&str>, identity: &str) -> AuthResult<Bytes>;
}

/// Accepts every client and every topic; has no keys
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl Authenticator for AllowAll {
    async fn check_credentials(
        &self,
        _username: Option<&str>,
        _password: Option<&[u8]>,
    ) -> AuthResult<()> {
        Ok(())
    }

    async fn check_acl(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _topic: &str,
        _access: Access,
    ) -> AuthResult<()> {
        Ok(())
    }

    async fn get_preshared_key(&self, _hint: Option<&str>, _identity: &str) -> AuthResult<Bytes> {
        Err(AuthError::NotFound)
    }
}

//! Config-backed authenticator
//!
//! Users come from `[[auth.users]]` with either a plaintext `password` or an
//! argon2 `password_hash`. Topic permissions come from `[acl]`: a user's
//! role patterns are tried first, then the default patterns. Patterns may
//! use `%c` (client id) and `%u` (username).

use std::collections::HashMap;

use argon2::{Argon2, PasswordHash, PasswordVerifier};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;

use super::{Access, AuthError, AuthResult, Authenticator};
use crate::config::{AclConfig, AuthConfig, ConfigError};

enum Credential {
    Plain(String),
    /// Argon2 PHC string
    Hashed(String),
}

struct UserEntry {
    credential: Credential,
    role: Option<String>,
}

#[derive(Default)]
struct Permissions {
    publish: Vec<String>,
    subscribe: Vec<String>,
}

impl Permissions {
    fn patterns(&self, access: Access) -> &[String] {
        match access {
            Access::Read => &self.subscribe,
            Access::Write => &self.publish,
        }
    }
}

struct PskEntry {
    hint: Option<String>,
    key: Bytes,
}

pub struct StaticAuth {
    auth_enabled: bool,
    allow_anonymous: bool,
    users: HashMap<String, UserEntry>,
    acl_enabled: bool,
    roles: HashMap<String, Permissions>,
    default: Permissions,
    psk: HashMap<String, PskEntry>,
}

impl StaticAuth {
    pub fn new(auth: &AuthConfig, acl: &AclConfig) -> Result<Self, ConfigError> {
        let mut users = HashMap::new();
        for user in &auth.users {
            let credential = match (&user.password, &user.password_hash) {
                (_, Some(hash)) => Credential::Hashed(hash.clone()),
                (Some(password), None) => Credential::Plain(password.clone()),
                (None, None) => {
                    return Err(ConfigError::Validation(format!(
                        "user '{}' has neither password nor password_hash",
                        user.username
                    )))
                }
            };
            users.insert(
                user.username.clone(),
                UserEntry {
                    credential,
                    role: user.role.clone(),
                },
            );
        }

        let roles = acl
            .roles
            .iter()
            .map(|role| {
                (
                    role.name.clone(),
                    Permissions {
                        publish: role.publish.clone(),
                        subscribe: role.subscribe.clone(),
                    },
                )
            })
            .collect();

        let mut psk = HashMap::new();
        for entry in &auth.psk {
            let key = STANDARD.decode(entry.key.as_bytes()).map_err(|e| {
                ConfigError::Validation(format!(
                    "psk for identity '{}' is not valid base64: {}",
                    entry.identity, e
                ))
            })?;
            psk.insert(
                entry.identity.clone(),
                PskEntry {
                    hint: entry.hint.clone(),
                    key: Bytes::from(key),
                },
            );
        }

        Ok(Self {
            auth_enabled: auth.enabled,
            allow_anonymous: auth.allow_anonymous,
            users,
            acl_enabled: acl.enabled,
            roles,
            default: Permissions {
                publish: acl.default.publish.clone(),
                subscribe: acl.default.subscribe.clone(),
            },
            psk,
        })
    }

    fn verify_password(credential: &Credential, password: &[u8]) -> bool {
        match credential {
            Credential::Plain(stored) => {
                std::str::from_utf8(password).is_ok_and(|pwd| pwd == stored)
            }
            Credential::Hashed(phc) => match PasswordHash::new(phc) {
                Ok(parsed) => Argon2::default()
                    .verify_password(password, &parsed)
                    .is_ok(),
                Err(e) => {
                    tracing::warn!("unparseable password hash: {}", e);
                    false
                }
            },
        }
    }

    fn role_of(&self, username: Option<&str>) -> Option<&Permissions> {
        let role = self.users.get(username?)?.role.as_deref()?;
        self.roles.get(role)
    }
}

#[async_trait]
impl Authenticator for StaticAuth {
    async fn check_credentials(
        &self,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> AuthResult<()> {
        if !self.auth_enabled {
            return Ok(());
        }

        let Some(username) = username else {
            return if self.allow_anonymous {
                Ok(())
            } else {
                Err(AuthError::Denied)
            };
        };

        let user = self.users.get(username).ok_or(AuthError::Denied)?;
        if Self::verify_password(&user.credential, password.unwrap_or(&[])) {
            Ok(())
        } else {
            Err(AuthError::Denied)
        }
    }

    async fn check_acl(
        &self,
        client_id: &str,
        username: Option<&str>,
        topic: &str,
        access: Access,
    ) -> AuthResult<()> {
        if !self.acl_enabled {
            return Ok(());
        }

        if let Some(role) = self.role_of(username) {
            if check_patterns(role.patterns(access), topic, client_id, username) {
                return Ok(());
            }
        }

        if check_patterns(self.default.patterns(access), topic, client_id, username) {
            return Ok(());
        }

        Err(AuthError::Denied)
    }

    async fn get_preshared_key(&self, hint: Option<&str>, identity: &str) -> AuthResult<Bytes> {
        let entry = self.psk.get(identity).ok_or(AuthError::NotFound)?;
        match (&entry.hint, hint) {
            (Some(expected), Some(given)) if expected != given => Err(AuthError::NotFound),
            _ => Ok(entry.key.clone()),
        }
    }
}

fn check_patterns(
    patterns: &[String],
    topic: &str,
    client_id: &str,
    username: Option<&str>,
) -> bool {
    patterns
        .iter()
        .any(|p| matches_pattern(p, topic, client_id, username))
}

/// Match a topic (or subscription filter) against an ACL pattern after
/// `%c`/`%u` substitution
pub(crate) fn matches_pattern(
    pattern: &str,
    topic: &str,
    client_id: &str,
    username: Option<&str>,
) -> bool {
    let pattern = pattern
        .replace("%c", client_id)
        .replace("%u", username.unwrap_or(""));

    pattern_match(&pattern, topic)
}

/// Level-by-level match. Wildcards in the pattern match any level of the
/// subject, including literal `+`/`#` levels of a subscription filter.
fn pattern_match(pattern: &str, subject: &str) -> bool {
    let mut pattern_levels = pattern.split('/');
    let mut subject_levels = subject.split('/');

    loop {
        match (pattern_levels.next(), subject_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(s)) if s != "#" => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

//! Credential resolution at the WebSocket handshake.
//!
//! Token verification lives in the HTTP tier; the hub only needs a way to
//! turn a bearer credential into an [`Identity`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Authenticated user behind a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub username: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
        }
    }
}

/// Resolves a bearer credential to an identity.
///
/// Called synchronously from inside the WebSocket handshake, so
/// implementations must not block on I/O.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, credential: &str) -> Option<Identity>;
}

/// Fixed token → identity table.
#[derive(Debug, Clone, Default)]
pub struct TokenTable {
    tokens: HashMap<String, Identity>,
}

impl TokenTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, token: impl Into<String>, identity: Identity) {
        self.tokens.insert(token.into(), identity);
    }

    pub fn with(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.insert(token, identity);
        self
    }

    /// Parse `token:user_id:username` entries separated by commas.
    /// Malformed entries are skipped.
    pub fn parse(entries: &str) -> Self {
        let mut table = Self::new();
        for entry in entries.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let mut parts = entry.splitn(3, ':');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(token), Some(user_id), Some(username))
                    if !token.is_empty() && !user_id.is_empty() =>
                {
                    table.insert(token, Identity::new(user_id, username));
                }
                _ => log::warn!("Ignoring malformed token entry '{entry}'"),
            }
        }
        table
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl IdentityResolver for TokenTable {
    fn resolve(&self, credential: &str) -> Option<Identity> {
        self.tokens.get(credential).cloned()
    }
}

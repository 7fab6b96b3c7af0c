//! Public-key lookup trait definition.
//!
//! The server never decides on its own whether a key is acceptable. Every key a
//! client offers is handed, in OpenSSH `authorized_keys` form, to a caller
//! supplied [`PublicKeyLookup`]; an `Ok` identity authenticates the
//! connection, an `Err` rejects that key.

use async_trait::async_trait;
use thiserror::Error;

use crate::ssh::types::Identity;

/// Rejection returned by a [`PublicKeyLookup`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct LookupError {
    message: String,
}

impl LookupError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Trait for public-key authentication policies.
///
/// Implementations must be thread-safe (`Send + Sync`): the server calls
/// `lookup` concurrently from every connection and does not serialize calls.
///
/// Any closure `Fn(&str) -> Result<Identity, E>` with a displayable error is a
/// lookup:
///
/// ```rust
/// use gitkit::ssh::{Identity, PublicKeyLookup};
///
/// fn assert_lookup(_: impl PublicKeyLookup) {}
///
/// assert_lookup(|key: &str| {
///     if key.starts_with("ssh-ed25519 ") {
///         Ok(Identity::new("12345"))
///     } else {
///         Err("only ed25519 keys are accepted")
///     }
/// });
/// ```
#[async_trait]
pub trait PublicKeyLookup: Send + Sync {
    /// Resolve an encoded public key (`"<algorithm> <base64>"`) to an identity.
    ///
    /// # Returns
    ///
    /// * `Ok(identity)` - The key is accepted and bound to `identity`
    /// * `Err(error)` - The key is rejected; the client may offer another one
    async fn lookup(&self, encoded_key: &str) -> Result<Identity, LookupError>;

    /// Name of this lookup, used in log lines.
    fn name(&self) -> &'static str {
        "custom"
    }
}

#[async_trait]
impl<F, E> PublicKeyLookup for F
where
    F: Fn(&str) -> Result<Identity, E> + Send + Sync,
    E: std::fmt::Display,
{
    async fn lookup(&self, encoded_key: &str) -> Result<Identity, LookupError> {
        (self)(encoded_key).map_err(|e| LookupError::new(e.to_string()))
    }

    fn name(&self) -> &'static str {
        "closure"
    }
}

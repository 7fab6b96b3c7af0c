//! Lookup chain for trying multiple key sources.

use async_trait::async_trait;
use tracing::debug;

use crate::ssh::types::Identity;

use super::traits::{LookupError, PublicKeyLookup};

/// Lookup chain that tries multiple lookups in order.
///
/// Lookups are tried in the order they were added. The first one that accepts
/// the key stops the chain and its identity is returned.
///
/// # Example
///
/// ```ignore
/// let chain = LookupChain::new()
///     .with(AuthorizedKeys::load("/etc/gitkit/authorized_keys")?)
///     .with(|key: &str| database.find_key(key));
/// ```
pub struct LookupChain {
    lookups: Vec<Box<dyn PublicKeyLookup>>,
}

impl LookupChain {
    /// Create a new empty lookup chain.
    pub fn new() -> Self {
        Self {
            lookups: Vec::new(),
        }
    }

    /// Append a lookup to the chain.
    pub fn with(mut self, lookup: impl PublicKeyLookup + 'static) -> Self {
        self.lookups.push(Box::new(lookup));
        self
    }

    /// Check if the chain has any lookups.
    pub fn is_empty(&self) -> bool {
        self.lookups.is_empty()
    }

    /// Get the number of lookups in the chain.
    pub fn len(&self) -> usize {
        self.lookups.len()
    }
}

impl Default for LookupChain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PublicKeyLookup for LookupChain {
    async fn lookup(&self, encoded_key: &str) -> Result<Identity, LookupError> {
        if self.lookups.is_empty() {
            return Err(LookupError::new("no public key lookups configured"));
        }

        let mut last_error = None;

        for lookup in &self.lookups {
            debug!("Trying public key lookup: {}", lookup.name());

            match lookup.lookup(encoded_key).await {
                Ok(identity) => {
                    debug!(
                        "Public key accepted by lookup {} as {}",
                        lookup.name(),
                        identity.id
                    );
                    return Ok(identity);
                }
                Err(e) => {
                    debug!("Public key rejected by lookup {}: {}", lookup.name(), e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| LookupError::new("all public key lookups failed")))
    }

    fn name(&self) -> &'static str {
        "chain"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reject(message: &'static str) -> impl PublicKeyLookup {
        move |_: &str| Err::<Identity, _>(message)
    }

    fn accept(id: &'static str) -> impl PublicKeyLookup {
        move |_: &str| Ok::<_, String>(Identity::new(id))
    }

    #[test]
    fn test_lookup_chain_empty() {
        let chain = LookupChain::new();
        assert!(chain.is_empty());
        assert_eq!(chain.len(), 0);
    }

    #[test]
    fn test_lookup_chain_len() {
        let chain = LookupChain::new().with(accept("a")).with(reject("no"));
        assert!(!chain.is_empty());
        assert_eq!(chain.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_chain_rejects() {
        let err = LookupChain::new().lookup("ssh-ed25519 AAAA").await.unwrap_err();
        assert_eq!(err.message(), "no public key lookups configured");
    }

    #[tokio::test]
    async fn test_first_accepting_lookup_wins() {
        let chain = LookupChain::new()
            .with(reject("unknown"))
            .with(accept("second"))
            .with(accept("third"));
        let identity = chain.lookup("ssh-ed25519 AAAA").await.unwrap();
        assert_eq!(identity.id, "second");
    }

    #[tokio::test]
    async fn test_last_error_is_reported() {
        let chain = LookupChain::new()
            .with(reject("first failure"))
            .with(reject("second failure"));
        let err = chain.lookup("ssh-ed25519 AAAA").await.unwrap_err();
        assert_eq!(err.message(), "second failure");
    }

    #[test]
    fn test_chain_name() {
        assert_eq!(LookupChain::new().name(), "chain");
    }
}

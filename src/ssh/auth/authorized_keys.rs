//! `authorized_keys` file lookup.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::ssh::error::{Error, Result};
use crate::ssh::types::Identity;

use super::openssh::{
    encode_public_key, fingerprint, normalize_encoded_key, parse_authorized_key_line,
};
use super::traits::{LookupError, PublicKeyLookup};

/// Lookup backed by an OpenSSH `authorized_keys` file.
///
/// Each accepted key maps to an [`Identity`] whose id is the line's comment,
/// or the key fingerprint when the line has no comment. The file is read once;
/// build a new value to pick up changes.
#[derive(Debug, Clone, Default)]
pub struct AuthorizedKeys {
    entries: HashMap<String, Identity>,
}

impl AuthorizedKeys {
    /// Read and parse an `authorized_keys` file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            warn!("Failed to read authorized keys from {}: {}", path.display(), e);
            Error::Io(e)
        })?;
        let keys = Self::parse(&contents);
        debug!(
            "Loaded {} authorized key(s) from {}",
            keys.len(),
            path.display()
        );
        Ok(keys)
    }

    /// Parse `authorized_keys` contents. Unparsable lines are skipped.
    pub fn parse(contents: &str) -> Self {
        let mut entries = HashMap::new();
        for (number, line) in contents.lines().enumerate() {
            let Some(key) = parse_authorized_key_line(line) else {
                if !line.trim().is_empty() && !line.trim_start().starts_with('#') {
                    warn!("Skipping unparsable authorized_keys line {}", number + 1);
                }
                continue;
            };

            let fp = fingerprint(&key);
            let id = if key.comment().is_empty() {
                fp.clone()
            } else {
                key.comment().to_string()
            };
            entries.insert(
                encode_public_key(&key),
                Identity::new(id).with_fingerprint(fp),
            );
        }
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl PublicKeyLookup for AuthorizedKeys {
    async fn lookup(&self, encoded_key: &str) -> Result<Identity, LookupError> {
        let normalized = normalize_encoded_key(encoded_key)
            .ok_or_else(|| LookupError::new("malformed public key"))?;
        self.entries
            .get(&normalized)
            .cloned()
            .ok_or_else(|| LookupError::new("public key is not authorized"))
    }

    fn name(&self) -> &'static str {
        "authorized_keys"
    }
}

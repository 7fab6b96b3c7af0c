//! Pluggable public-key authentication.
//!
//! The server delegates every authentication decision to a
//! [`PublicKeyLookup`]. This module provides the trait and a few ready-made
//! policies, so callers can back authentication with any identity store.
//!
//! # Available Lookups
//!
//! - Any `Fn(&str) -> Result<Identity, E>` closure
//! - [`AuthorizedKeys`]: OpenSSH `authorized_keys` file
//! - [`LookupChain`]: Tries several lookups in order
//!
//! # Example
//!
//! ```ignore
//! use gitkit::ssh::{AuthorizedKeys, Identity, LookupChain};
//!
//! let chain = LookupChain::new()
//!     .with(AuthorizedKeys::load("/etc/gitkit/authorized_keys")?)
//!     .with(|_: &str| Err::<Identity, _>("not in the fallback store"));
//! ```

mod authorized_keys;
mod chain;
mod openssh;
mod traits;

pub use authorized_keys::AuthorizedKeys;
pub use chain::LookupChain;
pub use openssh::{encode_public_key, fingerprint};
pub use traits::{LookupError, PublicKeyLookup};

//! Embeddable git-over-SSH server.
//!
//! Serves `git-upload-pack` and `git-receive-pack` for repositories under one
//! root directory, authenticating clients through a caller-supplied
//! [`PublicKeyLookup`](ssh::PublicKeyLookup). The git executable does the
//! pack protocol; this crate handles the transport, path safety and process
//! lifecycle.
//!
//! ```ignore
//! use gitkit::ssh::{Config, GitSshServer, Identity};
//!
//! let config = Config::new("./repos", "./keys", |_key: &str| {
//!     Ok::<_, String>(Identity::new("12345"))
//! });
//! let server = GitSshServer::new(config)?;
//! server.listen_and_serve("0.0.0.0:2222").await?;
//! ```

pub mod credential;
pub mod ssh;

pub use credential::{Credential, get_credential};

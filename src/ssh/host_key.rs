//! Host identity persistence.
//!
//! The server's long-term key lives in `<key_dir>/id_ed25519` in OpenSSH
//! format. It is generated once and reloaded on every start so clients that
//! pin the host key keep trusting the server across restarts.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::{Algorithm, LineEnding};
use russh::keys::PrivateKey;
use tracing::info;

use super::auth::fingerprint;
use super::error::{Error, Result};

/// File name of the persisted host key inside the key directory
pub const HOST_KEY_FILE: &str = "id_ed25519";

/// The server's host key, loaded once and owned by the server instance.
#[derive(Clone)]
pub struct HostKey {
    key: PrivateKey,
    path: PathBuf,
    fingerprint: String,
}

impl HostKey {
    /// Load the host key from `key_dir`, generating and persisting a new
    /// Ed25519 key when none exists yet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HostKey`] when the directory cannot be created, the
    /// new key cannot be written, or the stored key does not parse.
    pub fn load_or_create(key_dir: &Path) -> Result<Self> {
        let path = key_dir.join(HOST_KEY_FILE);

        if !path.exists() {
            fs::create_dir_all(key_dir).map_err(|e| host_key_error(&path, e))?;
            generate(&path)?;
            info!("Generated new host key at {}", path.display());
        }

        let key = russh::keys::load_secret_key(&path, None)
            .map_err(|e| host_key_error(&path, e))?;
        let fingerprint = fingerprint(key.public_key());
        info!("Loaded host key {} from {}", fingerprint, path.display());

        Ok(Self {
            key,
            path,
            fingerprint,
        })
    }

    pub fn private_key(&self) -> &PrivateKey {
        &self.key
    }

    /// SHA-256 fingerprint of the public half.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn generate(path: &Path) -> Result<()> {
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .map_err(|e| host_key_error(path, e))?;
    let pem = key
        .to_openssh(LineEnding::LF)
        .map_err(|e| host_key_error(path, e))?;

    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path).map_err(|e| host_key_error(path, e))?;
    file.write_all(pem.as_bytes())
        .and_then(|_| file.sync_all())
        .map_err(|e| host_key_error(path, e))
}

fn host_key_error(path: &Path, err: impl std::fmt::Display) -> Error {
    Error::HostKey {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}
